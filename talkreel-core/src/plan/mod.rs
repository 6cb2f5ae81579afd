pub mod error;
pub mod models;
pub mod planner;

pub use error::{PlanError, PlanResult};
pub use models::{
    load_schedule, DownloadTask, Hall, HallFilter, ScheduleDay, Speaker, Topic, VideoRef,
};
pub use planner::TaskPlanner;
