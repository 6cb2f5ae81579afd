use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime};
use regex::Regex;
use tracing::{debug, info};

use crate::config::TalkreelConfig;

use super::error::{PlanError, PlanResult};
use super::models::{DownloadTask, HallFilter, ScheduleDay, Topic};

const TIME_SENTINEL: &str = "00-00";
const ELLIPSIS: &str = "...";

/// Turns a parsed schedule into the list of talks whose final file is still
/// missing on disk.
#[derive(Debug, Clone)]
pub struct TaskPlanner {
    config: Arc<TalkreelConfig>,
    strip_pattern: Regex,
}

impl TaskPlanner {
    pub fn new(config: Arc<TalkreelConfig>) -> Self {
        let strip_pattern = Regex::new(r#"[?*<>|"]"#).expect("valid regex");
        Self {
            config,
            strip_pattern,
        }
    }

    pub fn plan(
        &self,
        schedule: &[ScheduleDay],
        filter: &HallFilter,
    ) -> PlanResult<Vec<DownloadTask>> {
        let output_root = PathBuf::from(&self.config.paths.output_dir);
        let mut tasks = Vec::new();
        let mut claimed: HashSet<PathBuf> = HashSet::new();
        let mut skipped_existing = 0usize;

        for day in schedule {
            let date_dir = self.clean_component(day.concrete_date.as_deref().unwrap_or_default());
            for hall in &day.halls {
                let hall_name = hall.name.as_deref().unwrap_or_default();
                if !filter.matches(hall_name) {
                    continue;
                }
                let hall_dir = self.clean_component(hall_name);
                for topic in &hall.topics {
                    if topic.is_break.unwrap_or(false) {
                        continue;
                    }
                    let Some(player_url) = topic
                        .videos
                        .first()
                        .and_then(|video| video.video_url.as_deref())
                        .filter(|url| !url.is_empty())
                    else {
                        continue;
                    };

                    let filename = self.build_filename(topic);
                    let target_path = output_root.join(&date_dir).join(&hall_dir).join(&filename);
                    if target_path.exists() {
                        debug!(
                            target_path = %target_path.display(),
                            "talk already downloaded, skipping"
                        );
                        skipped_existing += 1;
                        continue;
                    }
                    if !claimed.insert(target_path.clone()) {
                        return Err(PlanError::DuplicateTarget { path: target_path });
                    }
                    tasks.push(DownloadTask {
                        player_url: player_url.to_string(),
                        target_path,
                        display_name: filename,
                    });
                }
            }
        }

        info!(
            planned = tasks.len(),
            skipped_existing, "schedule planning complete"
        );
        Ok(tasks)
    }

    fn build_filename(&self, topic: &Topic) -> String {
        let naming = &self.config.naming;

        let time = topic
            .start_date
            .as_deref()
            .map(extract_start_time)
            .unwrap_or_else(|| TIME_SENTINEL.to_string());

        let joined_speakers = topic
            .speakers
            .iter()
            .filter_map(|speaker| speaker.full_name.as_deref())
            .filter(|name| !name.is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        let speaker = if joined_speakers.is_empty() {
            "Speaker".to_string()
        } else {
            self.clean_component(&joined_speakers)
        };
        let speaker = truncate_label(&speaker, naming.max_speaker_len);

        let title = self.clean_component(topic.title.as_deref().unwrap_or_default());
        let title = truncate_label(&title, naming.max_title_len);

        let filename = naming
            .filename_template
            .replace("{time}", &time)
            .replace("{speaker}", &speaker)
            .replace("{title}", &title);
        self.enforce_total_length(filename)
    }

    /// Strips filesystem-hostile characters and collapses whitespace runs.
    fn clean_component(&self, raw: &str) -> String {
        let replaced = raw.replace(':', " -").replace(['/', '\\'], "_");
        let stripped = self.strip_pattern.replace_all(&replaced, "");
        let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            "Unknown".to_string()
        } else {
            collapsed
        }
    }

    /// Caps the whole filename at `max_filename_len` characters, cutting the
    /// stem and keeping the extension intact.
    fn enforce_total_length(&self, filename: String) -> String {
        let max_len = self.config.naming.max_filename_len;
        if filename.chars().count() <= max_len {
            return filename;
        }
        let (stem, extension) = match filename.rsplit_once('.') {
            Some((stem, extension)) => (stem.to_string(), format!(".{extension}")),
            None => (filename, String::new()),
        };
        let keep = max_len.saturating_sub(extension.chars().count());
        let cut: String = stem.chars().take(keep).collect();
        format!("{}{}", cut.trim_end(), extension)
    }
}

fn extract_start_time(raw: &str) -> String {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.format("%H-%M").to_string();
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return parsed.format("%H-%M").to_string();
    }
    TIME_SENTINEL.to_string()
}

fn truncate_label(value: &str, max_len: usize) -> String {
    if value.chars().count() <= max_len {
        return value.to_string();
    }
    let cut: String = value.chars().take(max_len).collect();
    format!("{}{}", cut.trim_end(), ELLIPSIS)
}
