use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ORIGIN, RANGE, REFERER};
use reqwest::{Client, StatusCode};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::config::{DownloadSection, FetcherConfig};

use super::error::{AcquireError, AcquireResult};

/// Wait schedule for fragment retries: a linear ramp between the configured
/// bounds, plus optional random jitter on top.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_range: [u32; 2],
    pub jitter_seconds: u64,
}

impl RetryPolicy {
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        if self.attempts <= 1 {
            return Duration::from_secs(self.delay_range[0] as u64);
        }
        let min = self.delay_range[0] as f64;
        let max = self.delay_range[1] as f64;
        let ratio = (attempt as f64) / ((self.attempts - 1) as f64);
        let seconds = min + (max - min) * ratio;
        Duration::from_secs(seconds.round() as u64)
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let mut delay = self.compute_delay(attempt);
        if self.jitter_seconds > 0 {
            let jitter = rand::thread_rng().gen_range(0..=self.jitter_seconds);
            delay += Duration::from_secs(jitter);
        }
        delay
    }
}

impl TryFrom<&DownloadSection> for RetryPolicy {
    type Error = AcquireError;

    fn try_from(section: &DownloadSection) -> Result<Self, Self::Error> {
        if section.fragment_retries == 0 {
            return Err(AcquireError::Download(
                "fragment_retries must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            attempts: section.fragment_retries,
            delay_range: section.retry_delay_seconds,
            jitter_seconds: section.retry_jitter_seconds,
        })
    }
}

/// HTTP side of the acquisition engine. Knows two fetch strategies: playlist
/// URLs are assembled fragment by fragment, everything else is streamed in
/// one request with `Range` resume. `file://` URLs are served from the local
/// filesystem so the engine stays testable without a network.
#[derive(Clone)]
pub struct MediaFetcher {
    config: Arc<FetcherConfig>,
    manifest_markers: Vec<String>,
    client: Client,
    retry_policy: RetryPolicy,
    retry_sleep_cap: Duration,
}

impl MediaFetcher {
    pub fn new(config: Arc<FetcherConfig>, manifest_markers: Vec<String>) -> AcquireResult<Self> {
        let client = Client::builder()
            .user_agent(config.headers.user_agent.clone())
            .build()
            .map_err(|err| AcquireError::Network(err.to_string()))?;
        let retry_policy = RetryPolicy::try_from(&config.download)?;
        Ok(Self {
            config,
            manifest_markers,
            client,
            retry_policy,
            retry_sleep_cap: Duration::from_secs(60),
        })
    }

    pub fn with_retry_sleep_cap(mut self, cap: Duration) -> Self {
        self.retry_sleep_cap = cap;
        self
    }

    pub fn is_playlist(&self, url: &str) -> bool {
        self.manifest_markers.iter().any(|marker| url.contains(marker))
    }

    /// Fetches `media_url` into `part_path`. Playlist fragments are staged
    /// under `fragment_dir` before concatenation. A failed fetch leaves any
    /// previously written `part_path` bytes untouched.
    pub async fn fetch(
        &self,
        media_url: &str,
        part_path: &Path,
        fragment_dir: &Path,
        referer: Option<&str>,
    ) -> AcquireResult<()> {
        if self.is_playlist(media_url) {
            self.fetch_playlist(media_url, part_path, fragment_dir, referer)
                .await
        } else {
            self.fetch_direct(media_url, part_path, referer).await
        }
    }

    async fn fetch_playlist(
        &self,
        playlist_url: &str,
        part_path: &Path,
        fragment_dir: &Path,
        referer: Option<&str>,
    ) -> AcquireResult<()> {
        let contents = self.fetch_text(playlist_url, referer).await?;
        let mut playlist = HlsPlaylist::parse(&contents).map_err(AcquireError::InvalidPlaylist)?;
        let mut base_url = playlist_url.to_string();

        if playlist.segments.is_empty() {
            // Master playlist: the media segments live one level down.
            let variant = resolve_fragment_url(&base_url, &playlist.variants[0])?;
            debug!(variant = %variant, "following first variant stream");
            let contents = self.fetch_text(&variant, referer).await?;
            playlist = HlsPlaylist::parse(&contents).map_err(AcquireError::InvalidPlaylist)?;
            if playlist.segments.is_empty() {
                return Err(AcquireError::InvalidPlaylist(
                    "variant playlist has no media segments".to_string(),
                ));
            }
            base_url = variant;
        }

        fs::create_dir_all(fragment_dir)
            .await
            .map_err(|source| AcquireError::Io {
                source,
                path: fragment_dir.to_path_buf(),
            })?;

        let limiter = Arc::new(Semaphore::new(
            self.config.download.fragment_concurrency.max(1),
        ));
        let mut handles = Vec::with_capacity(playlist.segments.len());
        for (index, segment) in playlist.segments.iter().enumerate() {
            let resolved = resolve_fragment_url(&base_url, segment)?;
            let local_path = fragment_dir.join(fragment_file_name(index, segment));
            let fetcher = self.clone();
            let limiter = Arc::clone(&limiter);
            let referer = referer.map(str::to_string);
            handles.push(tokio::spawn(async move {
                let _permit = limiter
                    .acquire_owned()
                    .await
                    .map_err(|err| AcquireError::Download(err.to_string()))?;
                fetcher
                    .fetch_fragment_with_retry(&resolved, &local_path, referer.as_deref())
                    .await
            }));
        }

        let mut fetched = Vec::new();
        let mut skipped = 0usize;
        for (index, handle) in handles.into_iter().enumerate() {
            let outcome = handle
                .await
                .map_err(|err| AcquireError::Download(format!("fragment task failed: {err}")))?;
            match outcome {
                Ok(path) => fetched.push(path),
                Err(err) if self.config.download.skip_unavailable_fragments => {
                    warn!(fragment = index + 1, error = %err, "skipping unavailable fragment");
                    skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }
        if fetched.is_empty() {
            return Err(AcquireError::Download(format!(
                "all {skipped} fragments unavailable"
            )));
        }
        if skipped > 0 {
            warn!(
                skipped,
                fetched = fetched.len(),
                "assembled download with missing fragments"
            );
        }

        self.concatenate(&fetched, part_path).await?;
        if let Err(err) = fs::remove_dir_all(fragment_dir).await {
            warn!(path = %fragment_dir.display(), error = %err, "failed to clean fragment staging directory");
        }
        Ok(())
    }

    async fn fetch_fragment_with_retry(
        &self,
        url: &str,
        path: &Path,
        referer: Option<&str>,
    ) -> AcquireResult<PathBuf> {
        let attempts = self.retry_policy.attempts.max(1);
        for attempt in 0..attempts {
            match self.fetch_fragment(url, path, referer).await {
                Ok(()) => return Ok(path.to_path_buf()),
                Err(err) if attempt + 1 == attempts => return Err(err),
                Err(err) => {
                    let delay = self
                        .retry_policy
                        .delay_with_jitter(attempt)
                        .min(self.retry_sleep_cap);
                    debug!(attempt = attempt + 1, wait = ?delay, url = %url, error = %err, "retrying fragment");
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
        Err(AcquireError::Download(format!(
            "fragment {url} exhausted retries"
        )))
    }

    async fn fetch_fragment(
        &self,
        url: &str,
        path: &Path,
        referer: Option<&str>,
    ) -> AcquireResult<()> {
        if let Ok(parsed) = Url::parse(url) {
            if parsed.scheme() == "file" {
                let source = parsed
                    .to_file_path()
                    .map_err(|_| AcquireError::Download("invalid file url".to_string()))?;
                fs::copy(&source, path)
                    .await
                    .map_err(|source| AcquireError::Io {
                        source,
                        path: path.to_path_buf(),
                    })?;
                return Ok(());
            }
        }
        let response = self
            .client
            .get(url)
            .headers(self.request_headers(referer))
            .send()
            .await?
            .error_for_status()?;
        let mut stream = response.bytes_stream();
        let mut file = fs::File::create(path)
            .await
            .map_err(|source| AcquireError::Io {
                source,
                path: path.to_path_buf(),
            })?;
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            let data = chunk?;
            file.write_all(&data)
                .await
                .map_err(|source| AcquireError::Io {
                    source,
                    path: path.to_path_buf(),
                })?;
        }
        file.flush().await.map_err(|source| AcquireError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        Ok(())
    }

    async fn fetch_direct(
        &self,
        url: &str,
        part_path: &Path,
        referer: Option<&str>,
    ) -> AcquireResult<()> {
        if let Ok(parsed) = Url::parse(url) {
            if parsed.scheme() == "file" {
                let source = parsed
                    .to_file_path()
                    .map_err(|_| AcquireError::Download("invalid file url".to_string()))?;
                fs::copy(&source, part_path)
                    .await
                    .map_err(|source| AcquireError::Io {
                        source,
                        path: part_path.to_path_buf(),
                    })?;
                return Ok(());
            }
        }

        let resume_from = match fs::metadata(part_path).await {
            Ok(meta) if meta.len() > 0 => Some(meta.len()),
            _ => None,
        };

        let mut request = self.client.get(url).headers(self.request_headers(referer));
        if let Some(offset) = resume_from {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await?.error_for_status()?;

        let resumed = resume_from.is_some() && response.status() == StatusCode::PARTIAL_CONTENT;
        if let Some(offset) = resume_from {
            if resumed {
                debug!(offset, url = %url, "resuming interrupted download");
            } else {
                debug!(url = %url, "server ignored range request, restarting download");
            }
        }
        let mut file = if resumed {
            fs::OpenOptions::new().append(true).open(part_path).await
        } else {
            fs::File::create(part_path).await
        }
        .map_err(|source| AcquireError::Io {
            source,
            path: part_path.to_path_buf(),
        })?;

        let mut stream = response.bytes_stream();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            let data = chunk?;
            file.write_all(&data)
                .await
                .map_err(|source| AcquireError::Io {
                    source,
                    path: part_path.to_path_buf(),
                })?;
        }
        file.flush().await.map_err(|source| AcquireError::Io {
            source,
            path: part_path.to_path_buf(),
        })?;
        Ok(())
    }

    pub async fn fetch_text(&self, url: &str, referer: Option<&str>) -> AcquireResult<String> {
        if let Ok(parsed) = Url::parse(url) {
            if parsed.scheme() == "file" {
                let path = parsed
                    .to_file_path()
                    .map_err(|_| AcquireError::Download("invalid file url".to_string()))?;
                return fs::read_to_string(&path)
                    .await
                    .map_err(|source| AcquireError::Io { source, path });
            }
        }
        let response = self
            .client
            .get(url)
            .headers(self.request_headers(referer))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }

    /// Referer and origin only go out when the task carries a referer hint;
    /// the media host rejects mismatched pairs harder than absent ones.
    fn request_headers(&self, referer: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(referer) = referer {
            if let Ok(value) = HeaderValue::from_str(referer) {
                headers.insert(REFERER, value);
            }
            if let Some(origin) = &self.config.headers.origin {
                if let Ok(value) = HeaderValue::from_str(origin) {
                    headers.insert(ORIGIN, value);
                }
            }
        }
        headers
    }

    async fn concatenate(&self, fragments: &[PathBuf], part_path: &Path) -> AcquireResult<()> {
        let mut output = fs::File::create(part_path)
            .await
            .map_err(|source| AcquireError::Io {
                source,
                path: part_path.to_path_buf(),
            })?;
        for fragment in fragments {
            let mut input = fs::File::open(fragment)
                .await
                .map_err(|source| AcquireError::Io {
                    source,
                    path: fragment.clone(),
                })?;
            tokio::io::copy(&mut input, &mut output)
                .await
                .map_err(|source| AcquireError::Io {
                    source,
                    path: part_path.to_path_buf(),
                })?;
        }
        output.flush().await.map_err(|source| AcquireError::Io {
            source,
            path: part_path.to_path_buf(),
        })?;
        Ok(())
    }
}

fn fragment_file_name(index: usize, segment_uri: &str) -> String {
    let stem = segment_uri.split(['?', '#']).next().unwrap_or(segment_uri);
    let extension = stem
        .rsplit_once('.')
        .map(|(_, ext)| format!(".{ext}"))
        .unwrap_or_else(|| ".ts".to_string());
    format!("frag_{:05}{}", index + 1, extension)
}

fn resolve_fragment_url(base: &str, fragment: &str) -> AcquireResult<String> {
    if let Ok(parsed) = Url::parse(fragment) {
        if matches!(parsed.scheme(), "file" | "http" | "https") {
            return Ok(fragment.to_string());
        }
    }
    let base = Url::parse(base).map_err(|err| AcquireError::Download(err.to_string()))?;
    let joined = base
        .join(fragment)
        .map_err(|err| AcquireError::Download(err.to_string()))?;
    Ok(joined.to_string())
}

/// Minimal HLS reader: enough structure to walk from a manifest to its
/// media fragments. Segment URIs are the lines following `#EXTINF`, variant
/// URIs the lines following `#EXT-X-STREAM-INF`.
#[derive(Debug, Clone)]
pub struct HlsPlaylist {
    pub segments: Vec<String>,
    pub variants: Vec<String>,
}

impl HlsPlaylist {
    pub fn parse(contents: &str) -> Result<Self, String> {
        if !contents.trim_start().starts_with("#EXTM3U") {
            return Err("missing #EXTM3U header".to_string());
        }
        let mut segments = Vec::new();
        let mut variants = Vec::new();
        let mut pending_segment = false;
        let mut pending_variant = false;
        for line in contents.lines().map(str::trim) {
            if line.starts_with("#EXTINF:") {
                pending_segment = true;
            } else if line.starts_with("#EXT-X-STREAM-INF:") {
                pending_variant = true;
            } else if line.starts_with('#') || line.is_empty() {
                continue;
            } else if pending_segment {
                segments.push(line.to_string());
                pending_segment = false;
            } else if pending_variant {
                variants.push(line.to_string());
                pending_variant = false;
            }
        }
        if segments.is_empty() && variants.is_empty() {
            return Err("playlist has neither segments nor variant streams".to_string());
        }
        Ok(Self { segments, variants })
    }
}
