//! Loop primitives for the engine controller.
//!
//! The controller's loops converge orchestrator state towards the status
//! store. This library holds the pieces of that which depend only on time:
//!
//! - **Clock**: where "now" comes from, swappable for a manual clock in tests.
//! - **Grace period**: how long an interrupted run's pod is left alone.
//! - **Launch throttle**: the minimum gap between two pod launches.
//! - **Retry budget**: how many times a conflicting pod creation is retried.
//!
//! # Invariants
//!
//! - A missing interrupt timestamp never delays cleanup
//! - A throttle never lets two launches through closer than its interval
//! - A retry budget never grants more attempts than its ceiling

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

// =============================================================================
// Clock
// =============================================================================

/// Source of wall-clock time and sleeps.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock that only moves when told to.
///
/// `sleep` returns immediately after advancing the clock by the requested
/// duration, and the requested durations are recorded for inspection.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(duration_millis(by), Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        self.millis.store(to.timestamp_millis(), Ordering::SeqCst);
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// =============================================================================
// Grace period
// =============================================================================

/// Time elapsed since `since`, clamped at zero for timestamps in the future.
pub fn elapsed_since(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// Returns true once an interrupt requested at `interrupted_at` has waited
/// out `grace`.
///
/// An unknown interrupt time counts as elapsed: cleanup is never held back
/// for lack of a timestamp.
pub fn grace_period_elapsed(
    interrupted_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    grace: Duration,
) -> bool {
    match interrupted_at {
        None => true,
        Some(at) => elapsed_since(at, now) >= grace,
    }
}

// =============================================================================
// Launch throttle
// =============================================================================

/// Enforces a minimum interval between launches.
#[derive(Debug, Clone)]
pub struct LaunchThrottle {
    interval: Duration,
    last_launch: Option<DateTime<Utc>>,
}

impl LaunchThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_launch: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Change the interval without forgetting the last launch.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// How long to wait before the next launch is allowed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.last_launch {
            None => Duration::ZERO,
            Some(last) => self.interval.saturating_sub(elapsed_since(last, now)),
        }
    }

    /// Wait on `clock` until a launch is allowed.
    pub async fn ready(&self, clock: &dyn Clock) {
        let wait = self.remaining(clock.now());
        if !wait.is_zero() {
            clock.sleep(wait).await;
        }
    }

    /// Record that a launch happened at `now`.
    pub fn record_launch(&mut self, now: DateTime<Utc>) {
        self.last_launch = Some(now);
    }
}

// =============================================================================
// Retry budget
// =============================================================================

/// A bounded number of attempts at one operation.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_attempts: u32,
    attempts: u32,
}

impl RetryBudget {
    /// A budget allowing one initial attempt plus `max_retries` retries.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            attempts: 0,
        }
    }

    /// Consume an attempt. Returns false when none are left.
    pub fn try_acquire(&mut self) -> bool {
        if self.attempts >= self.max_attempts {
            return false;
        }
        self.attempts += 1;
        true
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

// =============================================================================
// Defaults
// =============================================================================

/// Default interval between scheduler and cleanup passes.
pub const DEFAULT_RUN_POLL: Duration = Duration::from_secs(20);

/// Default minimum gap between two engine pod launches.
pub const DEFAULT_LAUNCH_INTERVAL: Duration = Duration::from_millis(1000);

/// Default number of retries for a conflicting pod creation.
pub const DEFAULT_MAX_POD_RETRIES: u32 = 5;

/// Wait between two attempts at a conflicting pod creation. A pod of the
/// same name may still be terminating.
pub const POD_CONFLICT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Default wait before an interrupted run's pod is deleted.
pub const DEFAULT_INTERRUPT_GRACE_PERIOD: Duration = Duration::from_secs(300);

/// Default interval between interrupt sweeps.
pub const DEFAULT_INTERRUPT_POLL: Duration = Duration::from_secs(5);

/// Default interval between settings reloads.
pub const DEFAULT_SETTINGS_REFRESH: Duration = Duration::from_secs(20);

/// Default timeout for a single orchestrator or store call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
