use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::ResolverConfig;

use super::automation::BrowserProbe;
use super::capture::ManifestMatcher;
use super::error::{ResolverError, ResolverResult};

/// One player page inspection. Implemented by the Chromium-backed probe in
/// production and by stubs in tests.
#[async_trait]
pub trait PlayerProbe: Send + Sync {
    /// Returns the media URL the player page requested, or `None` when the
    /// poll window closed without a manifest showing up.
    async fn observe(&self, player_url: &str) -> ResolverResult<Option<String>>;
}

/// Player URL to media URL mapping covering every input, misses included.
#[derive(Debug, Clone, Default)]
pub struct MediaResolution {
    entries: HashMap<String, Option<String>>,
}

impl MediaResolution {
    pub fn media_url(&self, player_url: &str) -> Option<&str> {
        self.entries
            .get(player_url)
            .and_then(|entry| entry.as_deref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record(&mut self, player_url: String, media_url: Option<String>) {
        self.entries.insert(player_url, media_url);
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ResolverStats {
    pub total: usize,
    pub direct: usize,
    pub resolved: usize,
    pub missing: usize,
    pub duration_secs: u64,
    pub errors: Vec<String>,
}

pub struct UrlResolver {
    config: Arc<ResolverConfig>,
    probe: Arc<dyn PlayerProbe>,
    matcher: ManifestMatcher,
}

impl UrlResolver {
    pub fn new(config: Arc<ResolverConfig>) -> Self {
        let probe = Arc::new(BrowserProbe::new(Arc::clone(&config)));
        Self::with_probe(config, probe)
    }

    pub fn with_probe(config: Arc<ResolverConfig>, probe: Arc<dyn PlayerProbe>) -> Self {
        let matcher = ManifestMatcher::new(&config.matching);
        Self {
            config,
            probe,
            matcher,
        }
    }

    /// Resolves every distinct player URL once. Direct URLs map to
    /// themselves; the rest go through browser sessions capped by
    /// `max_sessions`. Misses never abort the batch.
    pub async fn resolve(&self, player_urls: Vec<String>) -> (MediaResolution, ResolverStats) {
        let start = Instant::now();
        let mut stats = ResolverStats {
            total: player_urls.len(),
            ..Default::default()
        };
        let mut resolution = MediaResolution::default();

        let mut indirect = Vec::new();
        for url in player_urls {
            if self.matcher.is_direct(&url) {
                debug!(player = %url, "direct media url, no browser needed");
                stats.direct += 1;
                stats.resolved += 1;
                resolution.record(url.clone(), Some(url));
            } else {
                indirect.push(url);
            }
        }

        let limiter = Arc::new(Semaphore::new(self.config.browser.max_sessions.max(1)));
        let mut handles = Vec::with_capacity(indirect.len());
        for url in indirect {
            let probe = Arc::clone(&self.probe);
            let limiter = Arc::clone(&limiter);
            let task_url = url.clone();
            let handle = tokio::spawn(async move {
                match limiter.acquire_owned().await {
                    Ok(_permit) => probe.observe(&task_url).await,
                    Err(err) => Err(ResolverError::Unexpected(err.to_string())),
                }
            });
            handles.push((url, handle));
        }

        for (url, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(err) => Err(ResolverError::from(err)),
            };
            match outcome {
                Ok(Some(media)) => {
                    debug!(player = %url, media = %media, "player resolved");
                    stats.resolved += 1;
                    resolution.record(url, Some(media));
                }
                Ok(None) => {
                    warn!(player = %url, "no media url observed within the poll window");
                    stats.missing += 1;
                    stats.errors.push(format!("{url}: no media url observed"));
                    resolution.record(url, None);
                }
                Err(err) => {
                    warn!(player = %url, error = %err, "player resolution failed");
                    stats.missing += 1;
                    stats.errors.push(format!("{url}: {err}"));
                    resolution.record(url, None);
                }
            }
        }

        stats.duration_secs = start.elapsed().as_secs();
        info!(
            total = stats.total,
            direct = stats.direct,
            resolved = stats.resolved,
            missing = stats.missing,
            duration = stats.duration_secs,
            "player url resolution finished"
        );
        (resolution, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrowserSection, MatchingSection, SelectorSection};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    fn resolver_config(max_sessions: usize) -> Arc<ResolverConfig> {
        Arc::new(ResolverConfig {
            browser: BrowserSection {
                executable_path: None,
                headless: true,
                sandbox: true,
                mute_audio: true,
                autoplay_policy: "no-user-gesture-required".into(),
                user_agent: "test-agent".into(),
                viewport: [1280, 720],
                max_sessions,
                nav_timeout_seconds: 20,
                video_wait_seconds: 4,
            },
            selectors: SelectorSection {
                video_element: "video".into(),
            },
            matching: MatchingSection {
                preferred_fragment: Some("ru.m3u8".into()),
                manifest_markers: vec![".m3u8".into()],
                direct_hosts: vec!["vkvideo.ru".into(), "vk.com".into()],
                poll_window_seconds: 5,
                poll_step_millis: 100,
            },
        })
    }

    struct StubProbe {
        responses: HashMap<String, Option<String>>,
        calls: AtomicUsize,
    }

    impl StubProbe {
        fn new(responses: Vec<(&str, Option<&str>)>) -> Self {
            Self {
                responses: responses
                    .into_iter()
                    .map(|(player, media)| {
                        (player.to_string(), media.map(str::to_string))
                    })
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PlayerProbe for StubProbe {
        async fn observe(&self, player_url: &str) -> ResolverResult<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.responses.get(player_url).cloned().flatten())
        }
    }

    #[tokio::test]
    async fn direct_urls_skip_the_probe() {
        let probe = Arc::new(StubProbe::new(vec![]));
        let resolver = UrlResolver::with_probe(
            resolver_config(8),
            Arc::clone(&probe) as Arc<dyn PlayerProbe>,
        );

        let (resolution, stats) = resolver
            .resolve(vec!["https://vkvideo.ru/video-1".into()])
            .await;

        assert_eq!(
            resolution.media_url("https://vkvideo.ru/video-1"),
            Some("https://vkvideo.ru/video-1")
        );
        assert_eq!(stats.direct, 1);
        assert_eq!(stats.resolved, 1);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn records_hits_and_misses() {
        let probe = Arc::new(StubProbe::new(vec![
            ("https://player.example/a", Some("https://cdn.example/a/ru.m3u8")),
            ("https://player.example/b", None),
        ]));
        let resolver = UrlResolver::with_probe(resolver_config(8), probe);

        let (resolution, stats) = resolver
            .resolve(vec![
                "https://player.example/a".into(),
                "https://player.example/b".into(),
            ])
            .await;

        assert_eq!(
            resolution.media_url("https://player.example/a"),
            Some("https://cdn.example/a/ru.m3u8")
        );
        assert_eq!(resolution.media_url("https://player.example/b"), None);
        assert_eq!(resolution.len(), 2);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.missing, 1);
        assert_eq!(stats.errors.len(), 1);
    }

    struct FailingProbe;

    #[async_trait]
    impl PlayerProbe for FailingProbe {
        async fn observe(&self, _player_url: &str) -> ResolverResult<Option<String>> {
            Err(ResolverError::Network("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn probe_errors_count_as_missing() {
        let resolver = UrlResolver::with_probe(resolver_config(8), Arc::new(FailingProbe));

        let (resolution, stats) = resolver
            .resolve(vec!["https://player.example/a".into()])
            .await;

        assert_eq!(resolution.media_url("https://player.example/a"), None);
        assert_eq!(resolution.len(), 1);
        assert_eq!(stats.missing, 1);
        assert!(stats.errors[0].contains("connection reset"));
    }

    struct CountingProbe {
        current: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl PlayerProbe for CountingProbe {
        async fn observe(&self, _player_url: &str) -> ResolverResult<Option<String>> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[tokio::test]
    async fn browser_sessions_stay_bounded() {
        let probe = Arc::new(CountingProbe {
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let resolver = UrlResolver::with_probe(
            resolver_config(2),
            Arc::clone(&probe) as Arc<dyn PlayerProbe>,
        );

        let urls = (0..6)
            .map(|index| format!("https://player.example/{index}"))
            .collect();
        let (resolution, stats) = resolver.resolve(urls).await;

        assert_eq!(resolution.len(), 6);
        assert_eq!(stats.missing, 6);
        assert!(probe.max_seen.load(Ordering::SeqCst) <= 2);
    }
}
