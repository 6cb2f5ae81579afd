mod download;
mod error;
mod transcode;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::FetcherConfig;

pub use download::{HlsPlaylist, MediaFetcher, RetryPolicy};
pub use error::{AcquireError, AcquireResult};
pub use transcode::{FfmpegTranscoder, TranscodeError, TranscodeResult, Transcoder};

pub const RAW_PREFIX: &str = "RAW_";
pub const ENC_PREFIX: &str = "ENC_";
pub const FRAG_PREFIX: &str = "FRAG_";
pub const PART_SUFFIX: &str = ".part";

/// How one task reached its final file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireOutcome {
    /// The target was already on disk with a plausible size.
    AlreadyPresent,
    /// An earlier task in this run produced the same media URL; its final
    /// file was copied instead of downloading again.
    CopiedFromCache,
    /// Downloaded (or recovered a raw artifact) and placed at the target.
    Published,
}

/// Per-run memory of which final file each media URL produced. Talks that
/// share a stream copy on disk instead of hitting the network twice.
#[derive(Debug, Default)]
struct DedupCache {
    by_media_url: HashMap<String, PathBuf>,
}

impl DedupCache {
    fn lookup(&self, media_url: &str) -> Option<&Path> {
        self.by_media_url.get(media_url).map(PathBuf::as_path)
    }

    fn record(&mut self, media_url: &str, final_path: &Path) {
        self.by_media_url
            .insert(media_url.to_string(), final_path.to_path_buf());
    }
}

/// Scratch-side names for one task, all derived from the final file name so
/// an interrupted run can find its own leftovers.
#[derive(Debug, Clone)]
struct ScratchPaths {
    raw: PathBuf,
    part: PathBuf,
    fragments: PathBuf,
    encoded: PathBuf,
}

impl ScratchPaths {
    fn for_target(scratch_dir: &Path, target: &Path) -> AcquireResult<Self> {
        let name = target
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                AcquireError::Download(format!(
                    "target {} has no usable file name",
                    target.display()
                ))
            })?;
        Ok(Self {
            raw: scratch_dir.join(format!("{RAW_PREFIX}{name}")),
            part: scratch_dir.join(format!("{RAW_PREFIX}{name}{PART_SUFFIX}")),
            fragments: scratch_dir.join(format!("{FRAG_PREFIX}{name}")),
            encoded: scratch_dir.join(format!("{ENC_PREFIX}{name}")),
        })
    }
}

/// Turns one resolved media URL into a published file, reusing whatever a
/// previous run left behind in the scratch directory. The checks run in a
/// fixed order: final file, dedup cache, raw artifact, then download. Every
/// scratch write uses a distinct prefix so a later run can tell a finished
/// raw artifact from a partial one.
pub struct AcquisitionEngine {
    config: Arc<FetcherConfig>,
    scratch_dir: PathBuf,
    fetcher: MediaFetcher,
    transcoder: Arc<dyn Transcoder>,
    dedup: DedupCache,
}

impl AcquisitionEngine {
    pub fn new(
        config: Arc<FetcherConfig>,
        scratch_dir: impl Into<PathBuf>,
        manifest_markers: Vec<String>,
    ) -> AcquireResult<Self> {
        let fetcher = MediaFetcher::new(Arc::clone(&config), manifest_markers)?;
        let transcoder = Arc::new(FfmpegTranscoder::new(config.transcode.clone()));
        Ok(Self {
            config,
            scratch_dir: scratch_dir.into(),
            fetcher,
            transcoder,
            dedup: DedupCache::default(),
        })
    }

    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = transcoder;
        self
    }

    /// Fails fast when transcoding is enabled but the external tool cannot
    /// run. Called once per run, before any download starts.
    pub async fn validate_transcoder(&self) -> TranscodeResult<()> {
        if self.config.transcode.enabled {
            self.transcoder.validate().await?;
        }
        Ok(())
    }

    pub async fn acquire(
        &mut self,
        media_url: &str,
        target_path: &Path,
        referer: Option<&str>,
    ) -> AcquireResult<AcquireOutcome> {
        if self.target_is_complete(target_path).await? {
            debug!(target = %target_path.display(), "final file already present, skipping");
            return Ok(AcquireOutcome::AlreadyPresent);
        }

        if let Some(cached) = self.cached_final(media_url).await {
            info!(
                source = %cached.display(),
                target = %target_path.display(),
                "media url already acquired in this run, copying final file"
            );
            self.place_by_copy(&cached, target_path).await?;
            return Ok(AcquireOutcome::CopiedFromCache);
        }

        let scratch = ScratchPaths::for_target(&self.scratch_dir, target_path)?;
        self.ensure_raw(media_url, &scratch, referer).await?;
        self.validate_raw(&scratch.raw).await?;

        let candidate = if self.config.transcode.enabled {
            self.transcode_raw(&scratch).await?
        } else {
            scratch.raw.clone()
        };

        self.place_by_rename(&candidate, target_path).await?;
        self.dedup.record(media_url, target_path);
        info!(target = %target_path.display(), "final file published");
        Ok(AcquireOutcome::Published)
    }

    /// A final file at or above the size floor is the only completion signal
    /// kept between runs. Undersized leftovers come from interrupted or
    /// blocked runs and are discarded so the task runs again.
    async fn target_is_complete(&self, target: &Path) -> AcquireResult<bool> {
        match fs::metadata(target).await {
            Ok(meta) if meta.len() >= self.config.limits.min_valid_bytes => Ok(true),
            Ok(meta) => {
                warn!(
                    target = %target.display(),
                    size = meta.len(),
                    "found undersized final file, discarding and re-acquiring"
                );
                fs::remove_file(target)
                    .await
                    .map_err(|source| AcquireError::Io {
                        source,
                        path: target.to_path_buf(),
                    })?;
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }

    async fn cached_final(&self, media_url: &str) -> Option<PathBuf> {
        let cached = self.dedup.lookup(media_url)?;
        if fs::metadata(cached).await.is_ok() {
            Some(cached.to_path_buf())
        } else {
            // The earlier final file went away; fall through to a fresh
            // download instead of copying nothing.
            None
        }
    }

    /// Makes sure a raw artifact exists for this task: reuse one from an
    /// earlier run, otherwise download into the `.part` staging name. A
    /// surviving `.part` is promoted to the raw path even when the fetch
    /// failed, so partial bytes carry over to the next attempt.
    async fn ensure_raw(
        &self,
        media_url: &str,
        scratch: &ScratchPaths,
        referer: Option<&str>,
    ) -> AcquireResult<()> {
        if fs::metadata(&scratch.raw).await.is_ok() {
            info!(raw = %scratch.raw.display(), "reusing raw artifact from a previous run");
            return Ok(());
        }

        fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|source| AcquireError::Io {
                source,
                path: self.scratch_dir.clone(),
            })?;

        let fetched = self
            .fetcher
            .fetch(media_url, &scratch.part, &scratch.fragments, referer)
            .await;
        if let Err(err) = &fetched {
            warn!(url = %media_url, error = %err, "download failed, checking for salvageable bytes");
        }

        if fs::metadata(&scratch.part).await.is_ok() {
            fs::rename(&scratch.part, &scratch.raw)
                .await
                .map_err(|source| AcquireError::Io {
                    source,
                    path: scratch.raw.clone(),
                })?;
        }

        match fs::metadata(&scratch.raw).await {
            Ok(_) => Ok(()),
            Err(_) => match fetched {
                Ok(()) => Err(AcquireError::Download(format!(
                    "fetch of {media_url} produced no output file"
                ))),
                Err(err) => Err(err),
            },
        }
    }

    /// An undersized raw file means the source served an error page or cut
    /// the stream. Keeping it would poison the raw-reuse check next run.
    async fn validate_raw(&self, raw: &Path) -> AcquireResult<()> {
        let meta = fs::metadata(raw).await.map_err(|source| AcquireError::Io {
            source,
            path: raw.to_path_buf(),
        })?;
        if meta.len() < self.config.limits.min_valid_bytes {
            warn!(
                raw = %raw.display(),
                size = meta.len(),
                min = self.config.limits.min_valid_bytes,
                "raw artifact below minimum size, discarding"
            );
            fs::remove_file(raw)
                .await
                .map_err(|source| AcquireError::Io {
                    source,
                    path: raw.to_path_buf(),
                })?;
            return Err(AcquireError::EmptyDownload {
                path: raw.to_path_buf(),
            });
        }
        Ok(())
    }

    /// On success the raw artifact is disposable and the encoded file takes
    /// its place as the publish candidate. On failure the raw stays for the
    /// next run and any half-written output is removed.
    async fn transcode_raw(&self, scratch: &ScratchPaths) -> AcquireResult<PathBuf> {
        match self
            .transcoder
            .transcode(&scratch.raw, &scratch.encoded)
            .await
        {
            Ok(()) => {
                if let Err(err) = fs::remove_file(&scratch.raw).await {
                    warn!(raw = %scratch.raw.display(), error = %err, "failed to remove raw artifact");
                }
                Ok(scratch.encoded.clone())
            }
            Err(err) => {
                if fs::metadata(&scratch.encoded).await.is_ok() {
                    if let Err(remove_err) = fs::remove_file(&scratch.encoded).await {
                        warn!(
                            path = %scratch.encoded.display(),
                            error = %remove_err,
                            "failed to remove partial transcode output"
                        );
                    }
                }
                Err(AcquireError::from(err))
            }
        }
    }

    /// Candidates reach the target through a rename so a reader never sees a
    /// partially written final file. When the rename crosses filesystems the
    /// candidate is copied to a staging sibling first.
    async fn place_by_rename(&self, candidate: &Path, target: &Path) -> AcquireResult<()> {
        self.ensure_target_parent(target).await?;
        match fs::rename(candidate, target).await {
            Ok(()) => Ok(()),
            Err(err)
                if err.kind() == std::io::ErrorKind::CrossesDevices
                    || err.raw_os_error() == Some(18) =>
            {
                debug!(target = %target.display(), "rename crossed filesystems, staging a copy");
                self.place_by_copy(candidate, target).await?;
                if let Err(err) = fs::remove_file(candidate).await {
                    warn!(path = %candidate.display(), error = %err, "failed to remove candidate after copy");
                }
                Ok(())
            }
            Err(source) => Err(AcquireError::Publish {
                source,
                path: target.to_path_buf(),
            }),
        }
    }

    async fn place_by_copy(&self, source: &Path, target: &Path) -> AcquireResult<()> {
        self.ensure_target_parent(target).await?;
        let staged = staging_sibling(target);
        fs::copy(source, &staged)
            .await
            .map_err(|source| AcquireError::Publish {
                source,
                path: staged.clone(),
            })?;
        fs::rename(&staged, target)
            .await
            .map_err(|source| AcquireError::Publish {
                source,
                path: target.to_path_buf(),
            })
    }

    async fn ensure_target_parent(&self, target: &Path) -> AcquireResult<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| AcquireError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        Ok(())
    }
}

fn staging_sibling(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DownloadSection, HeaderSection, LimitsSection, TranscodeSection};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    struct StubTranscoder {
        calls: AtomicUsize,
        fail: bool,
    }

    impl StubTranscoder {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transcoder for StubTranscoder {
        async fn validate(&self) -> TranscodeResult<()> {
            Ok(())
        }

        async fn transcode(&self, input: &Path, output: &Path) -> TranscodeResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                // Leave a half-written output behind, like a crashed encoder.
                std::fs::write(output, b"partial").unwrap();
                return Err(TranscodeError::Failed {
                    status: Some(1),
                    stderr: "stub failure".into(),
                });
            }
            let mut bytes = std::fs::read(input).unwrap();
            bytes.extend_from_slice(b" [encoded]");
            std::fs::write(output, bytes).unwrap();
            Ok(())
        }
    }

    fn fetcher_config(transcode_enabled: bool) -> Arc<FetcherConfig> {
        Arc::new(FetcherConfig {
            download: DownloadSection {
                fragment_concurrency: 4,
                fragment_retries: 2,
                retry_delay_seconds: [0, 0],
                retry_jitter_seconds: 0,
                skip_unavailable_fragments: true,
            },
            headers: HeaderSection {
                user_agent: "test-agent".into(),
                origin: None,
            },
            limits: LimitsSection {
                min_valid_bytes: 1024,
            },
            transcode: TranscodeSection {
                enabled: transcode_enabled,
                ffmpeg_binary: "ffmpeg".into(),
                scale: "-1:720".into(),
                crf: 28,
                preset: "veryfast".into(),
                audio_bitrate: "128k".into(),
            },
        })
    }

    struct Harness {
        _base: TempDir,
        scratch: PathBuf,
        output: PathBuf,
        source_dir: PathBuf,
    }

    impl Harness {
        fn new() -> Self {
            let base = tempdir().unwrap();
            let scratch = base.path().join("scratch");
            let output = base.path().join("output");
            let source_dir = base.path().join("sources");
            std::fs::create_dir_all(&output).unwrap();
            std::fs::create_dir_all(&source_dir).unwrap();
            Self {
                _base: base,
                scratch,
                output,
                source_dir,
            }
        }

        fn engine(&self, transcode_enabled: bool) -> AcquisitionEngine {
            AcquisitionEngine::new(
                fetcher_config(transcode_enabled),
                &self.scratch,
                vec![".m3u8".into()],
            )
            .unwrap()
        }

        fn source(&self, name: &str, bytes: &[u8]) -> String {
            let path = self.source_dir.join(name);
            std::fs::write(&path, bytes).unwrap();
            format!("file://{}", path.display())
        }

        fn target(&self, name: &str) -> PathBuf {
            self.output.join(name)
        }
    }

    #[tokio::test]
    async fn existing_final_file_short_circuits() {
        let harness = Harness::new();
        let target = harness.target("talk.mp4");
        std::fs::write(&target, vec![1u8; 2048]).unwrap();

        let mut engine = harness.engine(false);
        let outcome = engine
            .acquire("file:///nonexistent/source.mp4", &target, None)
            .await
            .unwrap();

        assert_eq!(outcome, AcquireOutcome::AlreadyPresent);
        assert!(!harness.scratch.exists());
    }

    #[tokio::test]
    async fn undersized_final_file_is_reacquired() {
        let harness = Harness::new();
        let target = harness.target("talk.mp4");
        std::fs::write(&target, b"stub").unwrap();
        let media = harness.source("talk.mp4", &vec![9u8; 2048]);

        let mut engine = harness.engine(false);
        let outcome = engine.acquire(&media, &target, None).await.unwrap();

        assert_eq!(outcome, AcquireOutcome::Published);
        assert_eq!(std::fs::read(&target).unwrap().len(), 2048);
    }

    #[tokio::test]
    async fn publishes_raw_when_transcoding_is_disabled() {
        let harness = Harness::new();
        let target = harness.target("talk.mp4");
        let media = harness.source("talk.mp4", &vec![5u8; 4096]);

        let mut engine = harness.engine(false);
        let outcome = engine.acquire(&media, &target, None).await.unwrap();

        assert_eq!(outcome, AcquireOutcome::Published);
        assert_eq!(std::fs::read(&target).unwrap().len(), 4096);
        // The raw artifact moved to the target, nothing stays in scratch.
        assert_eq!(std::fs::read_dir(&harness.scratch).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn transcodes_and_cleans_the_raw_artifact() {
        let harness = Harness::new();
        let target = harness.target("talk.mp4");
        let media = harness.source("talk.mp4", &vec![5u8; 2048]);
        let transcoder = StubTranscoder::new(false);

        let mut engine = harness.engine(true).with_transcoder(transcoder.clone());
        let outcome = engine.acquire(&media, &target, None).await.unwrap();

        assert_eq!(outcome, AcquireOutcome::Published);
        assert_eq!(transcoder.calls(), 1);
        let published = std::fs::read(&target).unwrap();
        assert!(published.ends_with(b" [encoded]"));
        assert_eq!(std::fs::read_dir(&harness.scratch).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn shared_media_url_is_copied_not_downloaded() {
        let harness = Harness::new();
        let first = harness.target("first.mp4");
        let second = harness.target("second.mp4");
        let media = harness.source("shared.mp4", &vec![3u8; 2048]);

        let mut engine = harness.engine(false);
        assert_eq!(
            engine.acquire(&media, &first, None).await.unwrap(),
            AcquireOutcome::Published
        );

        // Remove the source so a second download attempt would fail.
        std::fs::remove_file(harness.source_dir.join("shared.mp4")).unwrap();
        assert_eq!(
            engine.acquire(&media, &second, None).await.unwrap(),
            AcquireOutcome::CopiedFromCache
        );
        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn stale_cache_entry_falls_back_to_download() {
        let harness = Harness::new();
        let first = harness.target("first.mp4");
        let second = harness.target("second.mp4");
        let media = harness.source("shared.mp4", &vec![3u8; 2048]);

        let mut engine = harness.engine(false);
        engine.acquire(&media, &first, None).await.unwrap();
        std::fs::remove_file(&first).unwrap();

        let outcome = engine.acquire(&media, &second, None).await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Published);
        assert_eq!(std::fs::read(&second).unwrap().len(), 2048);
    }

    #[tokio::test]
    async fn reuses_raw_artifact_without_downloading() {
        let harness = Harness::new();
        let target = harness.target("talk.mp4");
        std::fs::create_dir_all(&harness.scratch).unwrap();
        std::fs::write(harness.scratch.join("RAW_talk.mp4"), vec![8u8; 2048]).unwrap();

        // The media URL does not exist, so any download attempt would fail.
        let mut engine = harness.engine(false);
        let outcome = engine
            .acquire("file:///nonexistent/source.mp4", &target, None)
            .await
            .unwrap();

        assert_eq!(outcome, AcquireOutcome::Published);
        assert_eq!(std::fs::read(&target).unwrap().len(), 2048);
    }

    #[tokio::test]
    async fn surviving_part_file_is_promoted() {
        let harness = Harness::new();
        let target = harness.target("talk.mp4");
        std::fs::create_dir_all(&harness.scratch).unwrap();
        std::fs::write(harness.scratch.join("RAW_talk.mp4.part"), vec![4u8; 2048]).unwrap();

        let mut engine = harness.engine(false);
        let outcome = engine
            .acquire("file:///nonexistent/source.mp4", &target, None)
            .await
            .unwrap();

        assert_eq!(outcome, AcquireOutcome::Published);
        assert_eq!(std::fs::read(&target).unwrap().len(), 2048);
        assert!(!harness.scratch.join("RAW_talk.mp4.part").exists());
    }

    #[tokio::test]
    async fn undersized_download_is_rejected_and_removed() {
        let harness = Harness::new();
        let target = harness.target("talk.mp4");
        let media = harness.source("tiny.mp4", b"way too small");

        let mut engine = harness.engine(false);
        let err = engine.acquire(&media, &target, None).await.unwrap_err();

        assert!(matches!(err, AcquireError::EmptyDownload { .. }));
        assert!(!target.exists());
        assert!(!harness.scratch.join("RAW_talk.mp4").exists());
    }

    #[tokio::test]
    async fn transcode_failure_keeps_the_raw_artifact() {
        let harness = Harness::new();
        let target = harness.target("talk.mp4");
        let media = harness.source("talk.mp4", &vec![5u8; 2048]);
        let transcoder = StubTranscoder::new(true);

        let mut engine = harness.engine(true).with_transcoder(transcoder.clone());
        let err = engine.acquire(&media, &target, None).await.unwrap_err();

        assert!(matches!(err, AcquireError::Transcode(_)));
        assert!(!target.exists());
        assert!(harness.scratch.join("RAW_talk.mp4").exists());
        assert!(!harness.scratch.join("ENC_talk.mp4").exists());
    }

    #[tokio::test]
    async fn download_failure_without_leftovers_reports_the_error() {
        let harness = Harness::new();
        let target = harness.target("talk.mp4");

        let mut engine = harness.engine(false);
        let result = engine
            .acquire("file:///nonexistent/source.mp4", &target, None)
            .await;

        assert!(result.is_err());
        assert!(!target.exists());
        assert!(!harness.scratch.join("RAW_talk.mp4").exists());
    }
}
