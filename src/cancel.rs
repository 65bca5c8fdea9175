//! Cancellation tokens and the worker context passed through every
//! blocking or storage operation.

use crate::error::{Error, Result};
use crate::lock::Priority;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How often tight loops (byte comparison, hashing) poll their token.
pub const CANCEL_CHECK_INTERVAL: usize = 0x100;

#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Re-arm after a suspension. Clones share the reset.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// `Err(Error::Cancelled)` once the token fired, for use with `?`.
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Capability handed to code running on behalf of a caller. Background crawl
/// workers and foreground requests differ only in their context value.
#[derive(Clone, Debug)]
pub struct WorkerContext {
    token: CancellationToken,
    priority: Priority,
}

impl WorkerContext {
    pub fn foreground() -> Self {
        Self {
            token: CancellationToken::new(),
            priority: Priority::High,
        }
    }

    pub fn background(token: CancellationToken) -> Self {
        Self {
            token,
            priority: Priority::Low,
        }
    }

    pub fn is_background(&self) -> bool {
        self.priority == Priority::Low
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cooperative interruption point.
    #[inline]
    pub fn checkpoint(&self) -> Result<()> {
        self.token.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shared_between_clones() {
        let token = CancellationToken::new();
        let ctx = WorkerContext::background(token.clone());
        assert!(ctx.checkpoint().is_ok());
        token.cancel();
        assert!(matches!(ctx.checkpoint(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_foreground_is_high_priority() {
        let ctx = WorkerContext::foreground();
        assert!(!ctx.is_background());
        assert_eq!(ctx.priority(), Priority::High);
    }
}
