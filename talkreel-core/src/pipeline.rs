use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::acquire::{AcquireError, AcquisitionEngine, TranscodeError, Transcoder};
use crate::config::{ConfigBundle, FetcherConfig, ResolverConfig, TalkreelConfig};
use crate::plan::{load_schedule, DownloadTask, HallFilter, PlanError, TaskPlanner};
use crate::resolver::{MediaResolution, PlayerProbe, ResolverStats, UrlResolver};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("planning failed: {0}")]
    Plan(#[from] PlanError),
    #[error("transcoder unavailable: {0}")]
    Transcode(#[from] TranscodeError),
    #[error("acquisition setup failed: {0}")]
    Acquire(#[from] AcquireError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Tally for one run. Failed tasks are recorded and skipped, never fatal;
/// the run only aborts on conditions that doom every task the same way.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub planned: usize,
    pub resolved: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_secs: u64,
    pub errors: Vec<String>,
}

/// End-to-end orchestrator: plan the missing talks, resolve their player
/// pages to media URLs in one browser batch, then acquire them one by one.
/// Re-running after an interruption picks up exactly the talks that are
/// still missing, because finished targets never enter the plan.
pub struct Pipeline {
    talkreel: Arc<TalkreelConfig>,
    resolver: Arc<ResolverConfig>,
    fetcher: Arc<FetcherConfig>,
    probe: Option<Arc<dyn PlayerProbe>>,
    transcoder: Option<Arc<dyn Transcoder>>,
}

impl Pipeline {
    pub fn new(bundle: ConfigBundle) -> Self {
        Self {
            talkreel: Arc::new(bundle.talkreel),
            resolver: Arc::new(bundle.resolver),
            fetcher: Arc::new(bundle.fetcher),
            probe: None,
            transcoder: None,
        }
    }

    /// Replaces the browser-backed probe, mainly for tests.
    pub fn with_probe(mut self, probe: Arc<dyn PlayerProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Replaces the ffmpeg transcoder, mainly for tests.
    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    pub async fn run(&self, filter: &HallFilter) -> PipelineResult<RunStats> {
        let start = Instant::now();
        info!(filter = ?filter, "starting download run");

        let mut engine = self.build_engine()?;
        engine.validate_transcoder().await?;

        for dir in [
            &self.talkreel.paths.output_dir,
            &self.talkreel.paths.scratch_dir,
        ] {
            fs::create_dir_all(dir)
                .await
                .map_err(|source| PipelineError::Io {
                    source,
                    path: PathBuf::from(dir),
                })?;
        }

        let schedule = load_schedule(&self.talkreel.paths.schedule_file)?;
        let planner = TaskPlanner::new(Arc::clone(&self.talkreel));
        let tasks = planner.plan(&schedule, filter)?;

        let mut stats = RunStats {
            planned: tasks.len(),
            ..RunStats::default()
        };
        if tasks.is_empty() {
            info!("nothing to download, every selected talk is already on disk");
            return Ok(stats);
        }

        let (resolution, resolver_stats) = self.resolve_players(&tasks).await;
        stats.resolved = resolver_stats.resolved;

        for (index, task) in tasks.iter().enumerate() {
            let Some(media_url) = resolution.media_url(&task.player_url) else {
                warn!(
                    task = %task.display_name,
                    player = %task.player_url,
                    "no media url for task"
                );
                stats.failed += 1;
                stats
                    .errors
                    .push(format!("{}: no media url resolved", task.display_name));
                continue;
            };

            info!(
                index = index + 1,
                total = tasks.len(),
                task = %task.display_name,
                "processing task"
            );
            match engine
                .acquire(media_url, &task.target_path, Some(&task.player_url))
                .await
            {
                Ok(outcome) => {
                    debug!(task = %task.display_name, ?outcome, "task finished");
                    stats.succeeded += 1;
                }
                Err(err) => {
                    warn!(task = %task.display_name, error = %err, "task failed");
                    stats.failed += 1;
                    stats.errors.push(format!("{}: {err}", task.display_name));
                }
            }
        }

        stats.duration_secs = start.elapsed().as_secs();
        info!(
            planned = stats.planned,
            succeeded = stats.succeeded,
            failed = stats.failed,
            duration_secs = stats.duration_secs,
            "download run finished"
        );
        Ok(stats)
    }

    /// Fill-the-gaps mode: plans every hall and lets the existence check
    /// keep only the talks that are still missing.
    pub async fn retry(&self) -> PipelineResult<RunStats> {
        self.run(&HallFilter::All).await
    }

    /// Removes the scratch directory wholesale. Raw artifacts and partial
    /// downloads are gone after this; finished files are untouched.
    pub async fn clean_scratch(&self) -> PipelineResult<Option<PathBuf>> {
        let scratch = PathBuf::from(&self.talkreel.paths.scratch_dir);
        match fs::remove_dir_all(&scratch).await {
            Ok(()) => {
                info!(path = %scratch.display(), "scratch directory removed");
                Ok(Some(scratch))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PipelineError::Io {
                source,
                path: scratch,
            }),
        }
    }

    async fn resolve_players(&self, tasks: &[DownloadTask]) -> (MediaResolution, ResolverStats) {
        // Tasks may share a player page; resolve each page once.
        let mut seen = HashSet::new();
        let player_urls: Vec<String> = tasks
            .iter()
            .filter(|task| seen.insert(task.player_url.clone()))
            .map(|task| task.player_url.clone())
            .collect();

        let resolver = match &self.probe {
            Some(probe) => UrlResolver::with_probe(Arc::clone(&self.resolver), Arc::clone(probe)),
            None => UrlResolver::new(Arc::clone(&self.resolver)),
        };
        resolver.resolve(player_urls).await
    }

    fn build_engine(&self) -> PipelineResult<AcquisitionEngine> {
        let engine = AcquisitionEngine::new(
            Arc::clone(&self.fetcher),
            &self.talkreel.paths.scratch_dir,
            self.resolver.matching.manifest_markers.clone(),
        )?;
        Ok(match &self.transcoder {
            Some(transcoder) => engine.with_transcoder(Arc::clone(transcoder)),
            None => engine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BrowserSection, DownloadSection, HeaderSection, LimitsSection, MatchingSection,
        NamingSection, PathsSection, SelectorSection, TranscodeSection,
    };
    use std::path::Path;
    use tempfile::tempdir;

    fn bundle(root: &Path, transcode_enabled: bool) -> ConfigBundle {
        ConfigBundle {
            talkreel: TalkreelConfig {
                paths: PathsSection {
                    schedule_file: root.join("schedule.json").to_string_lossy().into_owned(),
                    output_dir: root.join("output").to_string_lossy().into_owned(),
                    scratch_dir: root.join("scratch").to_string_lossy().into_owned(),
                },
                naming: NamingSection {
                    filename_template: "{time} - {speaker} - {title}.mp4".into(),
                    max_filename_len: 120,
                    max_speaker_len: 40,
                    max_title_len: 60,
                },
            },
            resolver: ResolverConfig {
                browser: BrowserSection {
                    executable_path: None,
                    headless: true,
                    sandbox: true,
                    mute_audio: true,
                    autoplay_policy: "no-user-gesture-required".into(),
                    user_agent: "test-agent".into(),
                    viewport: [1280, 720],
                    max_sessions: 2,
                    nav_timeout_seconds: 20,
                    video_wait_seconds: 4,
                },
                selectors: SelectorSection {
                    video_element: "video".into(),
                },
                matching: MatchingSection {
                    preferred_fragment: Some("ru.m3u8".into()),
                    manifest_markers: vec![".m3u8".into()],
                    direct_hosts: vec!["vkvideo.ru".into()],
                    poll_window_seconds: 5,
                    poll_step_millis: 100,
                },
            },
            fetcher: FetcherConfig {
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
                    ffmpeg_binary: "definitely-not-a-real-ffmpeg-binary".into(),
                    scale: "-1:720".into(),
                    crf: 28,
                    preset: "veryfast".into(),
                    audio_bitrate: "128k".into(),
                },
            },
        }
    }

    #[tokio::test]
    async fn unreadable_schedule_is_fatal() {
        let base = tempdir().unwrap();
        let pipeline = Pipeline::new(bundle(base.path(), false));

        let err = pipeline.run(&HallFilter::All).await.unwrap_err();
        assert!(matches!(err, PipelineError::Plan(PlanError::Io { .. })));
    }

    #[tokio::test]
    async fn missing_transcoder_aborts_before_planning() {
        let base = tempdir().unwrap();
        // No schedule file either; the transcoder check must fire first.
        let pipeline = Pipeline::new(bundle(base.path(), true));

        let err = pipeline.run(&HallFilter::All).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Transcode(TranscodeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_plan_finishes_without_resolving() {
        let base = tempdir().unwrap();
        std::fs::write(base.path().join("schedule.json"), "[]").unwrap();
        let pipeline = Pipeline::new(bundle(base.path(), false));

        let stats = pipeline.run(&HallFilter::All).await.unwrap();
        assert_eq!(stats.planned, 0);
        assert_eq!(stats.succeeded, 0);
        assert_eq!(stats.failed, 0);
        assert!(stats.errors.is_empty());
    }

    #[tokio::test]
    async fn clean_scratch_removes_the_directory() {
        let base = tempdir().unwrap();
        let pipeline = Pipeline::new(bundle(base.path(), false));
        let scratch = base.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        std::fs::write(scratch.join("RAW_leftover.mp4"), b"bytes").unwrap();

        let removed = pipeline.clean_scratch().await.unwrap();
        assert_eq!(removed, Some(scratch.clone()));
        assert!(!scratch.exists());

        // Second invocation finds nothing to do.
        assert_eq!(pipeline.clean_scratch().await.unwrap(), None);
    }
}
