//! Work queues: per-root listing queues feeding a bounded worker pool, and
//! the single two-priority update queue every write goes through.

pub mod lazy;
pub mod update;

pub use lazy::{job, Job, LazyQueue};
pub use update::{update_job, QueuedWriter, UpdateJob, UpdatePriority, UpdateQueue};

use std::any::Any;

/// Text of a caught panic, for the log line of the failed job.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string payload"
    }
}
