use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::plan::error::{PlanError, PlanResult};

/// One day of the conference programme as exported by the schedule backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDay {
    pub concrete_date: Option<String>,
    #[serde(default)]
    pub halls: Vec<Hall>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hall {
    pub name: Option<String>,
    #[serde(default)]
    pub topics: Vec<Topic>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub is_break: Option<bool>,
    pub title: Option<String>,
    pub start_date: Option<String>,
    #[serde(default)]
    pub speakers: Vec<Speaker>,
    #[serde(default)]
    pub videos: Vec<VideoRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Speaker {
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRef {
    pub video_url: Option<String>,
}

pub fn load_schedule<P: AsRef<Path>>(path: P) -> PlanResult<Vec<ScheduleDay>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    serde_json::from_str(&content).map_err(|source| PlanError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

/// A single talk that still needs to be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub player_url: String,
    pub target_path: PathBuf,
    pub display_name: String,
}

/// Which halls a run should cover.
#[derive(Debug, Clone)]
pub enum HallFilter {
    All,
    Halls(Vec<String>),
}

impl HallFilter {
    pub fn matches(&self, hall_name: &str) -> bool {
        match self {
            HallFilter::All => true,
            HallFilter::Halls(wanted) => {
                let hall = hall_name.to_lowercase();
                wanted
                    .iter()
                    .any(|candidate| hall.contains(&candidate.to_lowercase()))
            }
        }
    }
}
