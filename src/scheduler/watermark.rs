use crate::config::Watermarks;
use std::sync::atomic::{AtomicBool, Ordering};

/// Low/high hysteresis over a queue length. Once the length reaches `high`
/// nothing is admitted until it has dropped below `low`. Both marks are at
/// least 1, so a blocked gate always reopens on an empty queue.
#[derive(Debug)]
pub struct Watermark {
    low: usize,
    high: usize,
    blocked: AtomicBool,
}

impl Watermark {
    pub fn new(marks: Watermarks) -> Self {
        let high = marks.high.max(1);
        Self {
            low: marks.low.clamp(1, high),
            high,
            blocked: AtomicBool::new(false),
        }
    }

    pub fn admits(&self, len: usize) -> bool {
        if self.blocked.load(Ordering::SeqCst) {
            if len < self.low {
                self.blocked.store(false, Ordering::SeqCst);
                true
            } else {
                false
            }
        } else if len >= self.high {
            self.blocked.store(true, Ordering::SeqCst);
            false
        } else {
            true
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }
}
