//! # Scheduling
//!
//! Jobs are registrations of kind `job` carrying a cron expression. The
//! [`Scheduler`] keeps one timer per job name, following the cron of the
//! name's winning registration, and hands each firing to a [`JobRunner`].
//!
//! A job name runs at most once at a time. [`JobLocks`] holds a per-name lock
//! with a time-to-live that the running job keeps refreshing; a firing that
//! finds the lock held is skipped, unless the job restarts, in which case the
//! previous run is cancelled and the new one takes over.

pub mod cron;
pub mod lock;
pub mod scheduler;

pub use cron::{CronError, CronSchedule};
pub use lock::{Acquisition, JobLease, JobLocks};
pub use scheduler::{JobFiring, JobRunner, Scheduler, job_schedules};
