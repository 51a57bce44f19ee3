//! Session boundaries and the clock they are measured with

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::time::Duration;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Wall-clock source for hit timestamps and session timing
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Per-tracker session state.
///
/// Evaluation and commit are split so a hit that fails to queue does not
/// move `last_activity`.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    last_activity: Option<DateTime<Utc>>,
    timeout: Duration,
    pending_start: bool,
}

impl SessionTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_activity: None,
            timeout,
            pending_start: true,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_activity
    }

    /// Forces the next hit to open a new session
    pub fn start_new(&mut self) {
        self.pending_start = true;
    }

    /// Whether a hit captured at `now` opens a session
    pub fn begins_session(&self, now: DateTime<Utc>) -> bool {
        if self.pending_start {
            return true;
        }
        match self.last_activity {
            None => true,
            Some(last) => match (now - last).to_std() {
                Ok(idle) => idle > self.timeout,
                // Clock went backwards; treat as activity
                Err(_) => false,
            },
        }
    }

    /// Records a successfully queued hit
    pub fn record_activity(&mut self, now: DateTime<Utc>) {
        self.last_activity = Some(now);
        self.pending_start = false;
    }

    /// Evaluates and commits in one step
    pub fn stamp(&mut self, now: DateTime<Utc>) -> bool {
        let start = self.begins_session(now);
        self.record_activity(now);
        start
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}
