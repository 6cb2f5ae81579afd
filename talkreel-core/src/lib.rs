pub mod acquire;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod plan;
pub mod resolver;

pub use acquire::{
    AcquireError, AcquireOutcome, AcquireResult, AcquisitionEngine, FfmpegTranscoder, HlsPlaylist,
    MediaFetcher, RetryPolicy, TranscodeError, TranscodeResult, Transcoder,
};
pub use config::{
    load_fetcher_config, load_resolver_config, load_talkreel_config, ConfigBundle, FetcherConfig,
    ResolverConfig, TalkreelConfig,
};
pub use error::{ConfigError, Result};
pub use pipeline::{Pipeline, PipelineError, PipelineResult, RunStats};
pub use plan::{
    load_schedule, DownloadTask, Hall, HallFilter, PlanError, PlanResult, ScheduleDay, Speaker,
    TaskPlanner, Topic, VideoRef,
};
pub use resolver::{
    BrowserProbe, ManifestMatcher, MatchKind, MediaMatch, MediaResolution, PlayerProbe,
    ResolverError, ResolverResult, ResolverStats, UrlResolver,
};
