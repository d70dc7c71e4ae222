//! Transmission window alignment.
//!
//! Devices listen for downlinks only during a few reserved minutes of every
//! ten-minute block. Resends wait for the next reserved minute, plus a random
//! jitter so that devices sharing a window do not all receive at once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use rand::Rng;
use tracing::debug;

/// Reserved minutes used when a device advertises none, or garbage.
pub const DEFAULT_RESERVED_MINUTES: (u32, u32) = (6, 8);

/// Minute-of-ten markers at which a device listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedWindow {
    lo: u32,
    hi: u32,
}

impl Default for ReservedWindow {
    fn default() -> Self {
        Self {
            lo: DEFAULT_RESERVED_MINUTES.0,
            hi: DEFAULT_RESERVED_MINUTES.1,
        }
    }
}

impl ReservedWindow {
    /// Parse a comma separated list such as `"6,8"`.
    ///
    /// Any element that is not a minute in `0..=9` makes the whole list fall
    /// back to the default window.
    pub fn parse(reserved: &str) -> Self {
        let mut minutes = Vec::new();
        for part in reserved.split(',') {
            match part.trim().parse::<u32>() {
                Ok(m) if m < 10 => minutes.push(m),
                _ => return Self::default(),
            }
        }

        match (minutes.iter().min(), minutes.iter().max()) {
            (Some(&lo), Some(&hi)) => Self { lo, hi },
            _ => Self::default(),
        }
    }

    /// Earliest reserved minute.
    pub fn lo(&self) -> u32 {
        self.lo
    }

    /// Latest reserved minute.
    pub fn hi(&self) -> u32 {
        self.hi
    }

    /// Check if the minute-of-ten is reserved.
    pub fn contains(&self, minute_of_ten: u32) -> bool {
        minute_of_ten == self.lo || minute_of_ten == self.hi
    }
}

/// Time to wait from `now` until the next reserved minute, plus jitter.
///
/// Returns zero when `now` is already inside a reserved minute.
pub fn time_until_send_window(window: ReservedWindow, now: DateTime<Utc>, jitter_secs: u32) -> Duration {
    let m = now.minute() % 10;
    let s = now.second().min(59);

    if window.contains(m) {
        return Duration::ZERO;
    }

    let whole_minutes = if m < window.lo {
        window.lo - m - 1
    } else if m < window.hi {
        window.hi - m - 1
    } else {
        window.lo + (10 - m) - 1
    };

    let secs = (60 - s) + jitter_secs + whole_minutes * 60;
    Duration::from_secs(u64::from(secs))
}

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System UTC clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock stuck at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Computes send delays against a clock.
#[derive(Clone)]
pub struct WindowScheduler {
    clock: Arc<dyn Clock>,
}

impl Default for WindowScheduler {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for WindowScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowScheduler")
            .field("now", &self.clock.now())
            .finish()
    }
}

impl WindowScheduler {
    /// Create a scheduler with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Wait before sending to a device with the given reserved minutes.
    pub fn time_until_send_window(&self, reserved: &str) -> Duration {
        let window = ReservedWindow::parse(reserved);
        let jitter = rand::thread_rng().gen_range(0..60);
        let wait = time_until_send_window(window, self.clock.now(), jitter);
        debug!(
            lo = window.lo(),
            hi = window.hi(),
            wait_secs = wait.as_secs(),
            "Computed send window"
        );
        wait
    }
}
