use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::config::ResolverConfig;

use super::batch::PlayerProbe;
use super::capture::{CapturePayload, ManifestMatcher, MatchKind, CAPTURE_SCRIPT, NETWORK_HOOK};
use super::error::{ResolverError, ResolverResult};

/// Chromium-backed player inspection. One short-lived browser per player
/// URL, torn down on every exit path.
pub struct BrowserProbe {
    config: Arc<ResolverConfig>,
    matcher: ManifestMatcher,
}

impl BrowserProbe {
    pub fn new(config: Arc<ResolverConfig>) -> Self {
        let matcher = ManifestMatcher::new(&config.matching);
        Self { config, matcher }
    }

    async fn launch(&self) -> ResolverResult<BrowserSession> {
        let browser_cfg = &self.config.browser;
        let profile_dir = TempDir::new()?;
        let [width, height] = browser_cfg.viewport;

        let mut builder = ChromiumConfig::builder()
            .user_data_dir(profile_dir.path())
            .viewport(ChromiumViewport {
                width,
                height,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: width >= height,
                has_touch: false,
            })
            .request_timeout(Duration::from_secs(browser_cfg.nav_timeout_seconds + 10));

        if let Some(executable) = &browser_cfg.executable_path {
            builder = builder.chrome_executable(executable);
        }
        if !browser_cfg.headless {
            builder = builder.with_head();
        }
        if !browser_cfg.sandbox {
            builder = builder.no_sandbox();
        }

        let mut args = vec![
            format!("--user-agent={}", browser_cfg.user_agent),
            format!("--window-size={width},{height}"),
        ];
        if browser_cfg.mute_audio {
            args.push("--mute-audio".into());
        }
        if !browser_cfg.autoplay_policy.is_empty() {
            args.push(format!(
                "--autoplay-policy={}",
                browser_cfg.autoplay_policy
            ));
        }
        builder = builder.args(args);

        let chromium_config = builder.build().map_err(ResolverError::Configuration)?;

        debug!(
            profile = %profile_dir.path().display(),
            width,
            height,
            headless = browser_cfg.headless,
            "launching chromium session"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| ResolverError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        Ok(BrowserSession {
            browser,
            handler_task: Some(handler_task),
            user_agent: browser_cfg.user_agent.clone(),
            profile_dir,
        })
    }

    async fn watch_player(
        &self,
        session: &BrowserSession,
        player_url: &str,
    ) -> ResolverResult<Option<String>> {
        let page = session.new_page().await?;

        let nav_timeout = Duration::from_secs(self.config.browser.nav_timeout_seconds);
        match timeout(nav_timeout, self.goto(&page, player_url)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(url = %player_url, error = %err, "navigation failed, polling captured requests anyway");
            }
            Err(_) => {
                warn!(url = %player_url, "navigation timed out, polling captured requests anyway");
            }
        }

        self.wait_for_video(&page).await;
        self.poll_for_media(&page).await
    }

    async fn goto(&self, page: &Page, url: &str) -> ResolverResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(ResolverError::Configuration)?;
        page.goto(params).await?;
        page.wait_for_navigation().await?;
        Ok(())
    }

    /// Best effort. The player may fire its manifest request without ever
    /// attaching a video element, so absence is not a failure.
    async fn wait_for_video(&self, page: &Page) {
        let selector = self.config.selectors.video_element.clone();
        let deadline =
            Instant::now() + Duration::from_secs(self.config.browser.video_wait_seconds);
        loop {
            if page.find_element(selector.clone()).await.is_ok() {
                return;
            }
            if Instant::now() >= deadline {
                debug!(selector = %selector, "no video element before deadline");
                return;
            }
            sleep(Duration::from_millis(250)).await;
        }
    }

    /// Re-reads the captured request bucket in small steps so the loop can
    /// exit the moment a manifest shows up instead of sitting out the whole
    /// window.
    async fn poll_for_media(&self, page: &Page) -> ResolverResult<Option<String>> {
        let matching = &self.config.matching;
        let deadline = Instant::now() + Duration::from_secs(matching.poll_window_seconds);
        loop {
            let payload: CapturePayload = page
                .evaluate(CAPTURE_SCRIPT)
                .await
                .map_err(|err| {
                    ResolverError::Network(format!("failed to read captured requests: {err}"))
                })?
                .into_value()
                .map_err(|err| {
                    ResolverError::Network(format!("failed to decode capture payload: {err}"))
                })?;

            if let Some(found) = self.matcher.select(payload.observed_urls()) {
                match found.kind {
                    MatchKind::Preferred => {
                        debug!(url = %found.url, "preferred manifest captured")
                    }
                    MatchKind::Generic => debug!(url = %found.url, "generic manifest captured"),
                }
                return Ok(Some(found.url));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(Duration::from_millis(matching.poll_step_millis)).await;
        }
    }
}

#[async_trait]
impl PlayerProbe for BrowserProbe {
    async fn observe(&self, player_url: &str) -> ResolverResult<Option<String>> {
        let session = self.launch().await?;
        let outcome = self.watch_player(&session, player_url).await;
        session.shutdown().await?;
        outcome
    }
}

struct BrowserSession {
    browser: Browser,
    handler_task: Option<JoinHandle<()>>,
    user_agent: String,
    profile_dir: TempDir,
}

impl BrowserSession {
    async fn new_page(&self) -> ResolverResult<Page> {
        let params = CreateTargetParams::new("about:blank");
        let page = self.browser.new_page(params).await?;

        let ua_params = SetUserAgentOverrideParams::builder()
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(ResolverError::Configuration)?;
        page.set_user_agent(ua_params).await?;

        page.evaluate_on_new_document(
            AddScriptToEvaluateOnNewDocumentParams::builder()
                .source(NETWORK_HOOK)
                .build()
                .map_err(ResolverError::Configuration)?,
        )
        .await?;

        Ok(page)
    }

    async fn shutdown(mut self) -> ResolverResult<()> {
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "failed to close browser gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        debug!(profile = %self.profile_dir.path().display(), "browser session closed");
        Ok(())
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!("browser session dropped without explicit shutdown");
            }
        }
    }
}
