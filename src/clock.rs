//! Clock & Timer Service (spec §4.1)
//!
//! All scheduler logic consults [`Clock`] rather than the OS clock directly,
//! so test builds can inject time (`set_time`/`advance`) instead of
//! sleeping in real time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;
use tokio::time::interval;
use tracing::instrument;

/// Seconds since the Unix epoch, injectable for tests.
#[derive(Clone)]
pub struct Clock {
    inner: Arc<ClockInner>,
}

struct ClockInner {
    /// `None` means "use the real OS clock". `Some(bits)` is an injected
    /// time, stored as the bit pattern of an `f64` so it fits an atomic.
    injected: AtomicU64,
    injected_active: std::sync::atomic::AtomicBool,
    notify: Notify,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClockInner {
                injected: AtomicU64::new(0),
                injected_active: std::sync::atomic::AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Seconds since the Unix epoch.
    pub fn now(&self) -> f64 {
        if self.inner.injected_active.load(Ordering::Acquire) {
            f64::from_bits(self.inner.injected.load(Ordering::Acquire))
        } else {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64()
        }
    }

    /// Switch this clock into injected-time mode at the given value.
    pub fn set_time(&self, seconds: f64) {
        self.inner.injected.store(seconds.to_bits(), Ordering::Release);
        self.inner.injected_active.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Advance injected time by `delta` seconds. Implies `set_time`'s mode.
    pub fn advance(&self, delta: f64) {
        let next = self.now() + delta;
        self.set_time(next);
    }

    /// Sleep for `duration`. Under injected time this returns once the
    /// clock has been advanced past `now() + duration`; under real time it
    /// simply delegates to `tokio::time::sleep`.
    pub async fn sleep(&self, duration: Duration) {
        if !self.inner.injected_active.load(Ordering::Acquire) {
            tokio::time::sleep(duration).await;
            return;
        }

        let deadline = self.now() + duration.as_secs_f64();
        while self.now() < deadline {
            self.inner.notify.notified().await;
        }
    }

    /// Sleep until the clock reaches `target` (seconds since epoch).
    pub async fn sleep_until(&self, target: f64) {
        let now = self.now();
        if target <= now {
            return;
        }
        self.sleep(Duration::from_secs_f64(target - now)).await;
    }
}

/// A cancellable, reschedulable timer firing on a shared worker pool.
///
/// `on_expire` callbacks must not block beyond a few ms; long work should be
/// handed off (e.g. via an mpsc command) rather than run inline.
pub struct Timer {
    cancel: Arc<Notify>,
    period: Arc<tokio::sync::Mutex<Duration>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Timer {
    /// Start a new repeating timer. `on_expire` is invoked on every tick.
    #[instrument(skip(on_expire))]
    pub fn start<F>(initial_period: Duration, mut on_expire: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let cancel = Arc::new(Notify::new());
        let period = Arc::new(tokio::sync::Mutex::new(initial_period));

        let cancel_task = cancel.clone();
        let period_task = period.clone();
        let handle = tokio::spawn(async move {
            loop {
                let current_period = *period_task.lock().await;
                let mut ticker = interval(current_period);
                ticker.tick().await; // first tick fires immediately; consume it.

                tokio::select! {
                    _ = ticker.tick() => {
                        on_expire();
                    }
                    _ = cancel_task.notified() => {
                        break;
                    }
                }
            }
        });

        Self { cancel, period, handle: Some(handle) }
    }

    /// Reschedule to a new period. Idempotent: calling with the same period
    /// repeatedly has no extra effect beyond resetting the current tick.
    pub async fn reschedule(&self, new_period: Duration) {
        *self.period.lock().await = new_period;
        self.cancel.notify_one();
    }

    /// Stop the timer; no further ticks will fire.
    pub fn stop(mut self) {
        self.cancel.notify_one();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
