//! Scheduled profile capture and retention

mod schedule;
mod scheduler;

#[cfg(test)]
mod tests;

pub use schedule::{CronSchedule, ScheduleError};
pub use scheduler::{
    select_target, CaptureConfig, CaptureGroup, CaptureReport, CaptureScheduler,
    DEFAULT_SAMPLE_SECONDS,
};
