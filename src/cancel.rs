use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Cooperative cancellation signal shared between the orchestrator, stage
/// executors and deployment strategies.
///
/// Waiting is done on a condition variable so polling loops block on a
/// timer and wake up early when cancellation is requested.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        if let Ok(mut cancelled) = lock.lock() {
            *cancelled = true;
        }
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        lock.lock().map(|flag| *flag).unwrap_or(true)
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` when the full duration elapsed and `false` when the
    /// wait was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.is_cancelled();
        }
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + duration;
        let Ok(mut cancelled) = lock.lock() else {
            return false;
        };
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            match cvar.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => cancelled = guard,
                Err(_) => return false,
            }
        }
        false
    }
}
