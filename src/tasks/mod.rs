//! Scheduled execution and background task supervision.
//!
//! [`CronScheduler`] is the cron trigger: it turns config lines into
//! [`TaskMessage`](crate::queue::TaskMessage)s on a timetable and runs them
//! through the same pipeline as queue messages. The [`manager`] helpers
//! supervise the long-running loops the binary starts.

pub mod manager;
pub mod scheduler;

pub use manager::spawn_cancellable_task;
pub use scheduler::{CronScheduler, ScheduledTask, load_config, parse_config, parse_task_line};
