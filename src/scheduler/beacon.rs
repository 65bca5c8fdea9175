use crate::cancel::CancellationToken;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Host idle time source. Real detection is platform specific and lives
/// outside the crate.
pub trait IdleProbe: Send + Sync {
    fn idle_time(&self) -> Duration;
}

/// A host that is never busy.
pub struct AlwaysIdle;

impl IdleProbe for AlwaysIdle {
    fn idle_time(&self) -> Duration {
        Duration::MAX
    }
}

/// Idle state switched by hand.
#[derive(Default)]
pub struct ManualIdle {
    busy: AtomicBool,
}

impl ManualIdle {
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }
}

impl IdleProbe for ManualIdle {
    fn idle_time(&self) -> Duration {
        if self.busy.load(Ordering::SeqCst) {
            Duration::ZERO
        } else {
            Duration::MAX
        }
    }
}

/// Decides whether background work may run. Going busy cancels the shared
/// token so in-flight work unwinds at its next checkpoint; going idle again
/// re-arms it.
pub struct Beacon {
    probe: Arc<dyn IdleProbe>,
    threshold: Duration,
    token: CancellationToken,
    suspended: AtomicBool,
}

impl Beacon {
    pub fn new(probe: Arc<dyn IdleProbe>, threshold: Duration, token: CancellationToken) -> Self {
        Self {
            probe,
            threshold,
            token,
            suspended: AtomicBool::new(false),
        }
    }

    pub fn is_host_idle(&self) -> bool {
        self.threshold.is_zero() || self.probe.idle_time() >= self.threshold
    }

    /// `true` when background work may proceed.
    pub fn check(&self) -> bool {
        if self.is_host_idle() {
            if self.suspended.swap(false, Ordering::SeqCst) {
                self.token.reset();
                info!("Host idle again, resuming crawl");
            }
            true
        } else {
            if !self.suspended.swap(true, Ordering::SeqCst) {
                self.token.cancel();
                info!("Host busy, suspending crawl");
            }
            false
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_host_cancels_and_resume_rearms() {
        let probe = Arc::new(ManualIdle::default());
        let token = CancellationToken::new();
        let beacon = Beacon::new(probe.clone(), Duration::from_secs(1), token.clone());

        assert!(beacon.check());
        probe.set_busy(true);
        assert!(!beacon.check());
        assert!(token.is_cancelled());
        assert!(beacon.is_suspended());

        probe.set_busy(false);
        assert!(beacon.check());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_zero_threshold_is_always_idle() {
        let probe = Arc::new(ManualIdle::default());
        probe.set_busy(true);
        let beacon = Beacon::new(probe, Duration::ZERO, CancellationToken::new());
        assert!(beacon.check());
    }
}
