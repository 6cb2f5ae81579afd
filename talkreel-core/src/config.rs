use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct TalkreelConfig {
    pub paths: PathsSection,
    pub naming: NamingSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub schedule_file: String,
    pub output_dir: String,
    pub scratch_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamingSection {
    pub filename_template: String,
    pub max_filename_len: usize,
    pub max_speaker_len: usize,
    pub max_title_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    pub browser: BrowserSection,
    pub selectors: SelectorSection,
    pub matching: MatchingSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub mute_audio: bool,
    pub autoplay_policy: String,
    pub user_agent: String,
    pub viewport: [u32; 2],
    pub max_sessions: usize,
    pub nav_timeout_seconds: u64,
    pub video_wait_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorSection {
    pub video_element: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchingSection {
    pub preferred_fragment: Option<String>,
    pub manifest_markers: Vec<String>,
    pub direct_hosts: Vec<String>,
    pub poll_window_seconds: u64,
    pub poll_step_millis: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetcherConfig {
    pub download: DownloadSection,
    pub headers: HeaderSection,
    pub limits: LimitsSection,
    pub transcode: TranscodeSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSection {
    pub fragment_concurrency: usize,
    pub fragment_retries: u32,
    pub retry_delay_seconds: [u32; 2],
    pub retry_jitter_seconds: u64,
    pub skip_unavailable_fragments: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeaderSection {
    pub user_agent: String,
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    pub min_valid_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeSection {
    pub enabled: bool,
    pub ffmpeg_binary: String,
    pub scale: String,
    pub crf: u8,
    pub preset: String,
    pub audio_bitrate: String,
}

#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub talkreel: TalkreelConfig,
    pub resolver: ResolverConfig,
    pub fetcher: FetcherConfig,
}

impl ConfigBundle {
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let talkreel = load_talkreel_config(dir.join("talkreel.toml"))?;
        let resolver = load_resolver_config(dir.join("resolver.toml"))?;
        let fetcher = load_fetcher_config(dir.join("fetcher.toml"))?;
        Ok(Self {
            talkreel,
            resolver,
            fetcher,
        })
    }
}

pub fn load_talkreel_config<P: AsRef<Path>>(path: P) -> Result<TalkreelConfig> {
    load_toml(path)
}

pub fn load_resolver_config<P: AsRef<Path>>(path: P) -> Result<ResolverConfig> {
    load_toml(path)
}

pub fn load_fetcher_config<P: AsRef<Path>>(path: P) -> Result<FetcherConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
