//! Retry schedule for consistency checks.
//!
//! Control fields get a short fixed schedule and are left to the fleet sweep
//! after three checks. Every other field uses a configurable three-tier
//! schedule that widens with the retry count and ends after seven checks.

use std::time::Duration;

/// Delays before each control field check.
pub const CONTROL_DELAYS: [Duration; 3] = [
    Duration::from_secs(30),
    Duration::from_secs(120),
    Duration::from_secs(240),
];

/// Fallback delays for general fields.
pub const DEFAULT_GENERAL_DELAYS: [Duration; 3] = [
    Duration::from_secs(25),
    Duration::from_secs(540),
    Duration::from_secs(3420),
];

/// Retry count at which control field checks stop.
pub const CONTROL_RETRY_LIMIT: u32 = 3;

/// Retry count at which general field checks stop.
pub const GENERAL_RETRY_LIMIT: u32 = 7;

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextDelay {
    /// Check again after the delay.
    Delay(Duration),
    /// The chain ends here.
    Stop,
}

/// Maps (field, retry count) to the delay before the next check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    control_field: String,
    general: [Duration; 3],
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(twin_core::config::defaults::CONTROL_FIELD, DEFAULT_GENERAL_DELAYS)
    }
}

impl RetryPolicy {
    /// Create a policy with explicit general delays.
    pub fn new(control_field: impl Into<String>, general: [Duration; 3]) -> Self {
        Self {
            control_field: control_field.into(),
            general,
        }
    }

    /// Create a policy from a `_`-separated schedule in seconds.
    ///
    /// Returns the policy together with a message for every schedule element
    /// that had to fall back to its default.
    pub fn from_schedule(control_field: impl Into<String>, schedule: &str) -> (Self, Vec<String>) {
        let (general, problems) = parse_repeat_schedule(schedule);
        (Self::new(control_field, general), problems)
    }

    /// Name of the field with the control schedule.
    pub fn control_field(&self) -> &str {
        &self.control_field
    }

    /// Delays used for general fields.
    pub fn general_delays(&self) -> [Duration; 3] {
        self.general
    }

    /// Check if the field uses the control schedule.
    pub fn is_control(&self, field_name: &str) -> bool {
        field_name == self.control_field
    }

    /// Delay before the check that follows a command with `retry_count`.
    pub fn next_delay(&self, field_name: &str, retry_count: u32) -> NextDelay {
        if self.is_control(field_name) {
            return if retry_count < CONTROL_RETRY_LIMIT {
                NextDelay::Delay(CONTROL_DELAYS[retry_count as usize])
            } else {
                NextDelay::Stop
            };
        }

        match retry_count {
            0 => NextDelay::Delay(self.general[0]),
            1..=2 => NextDelay::Delay(self.general[1]),
            n if n < GENERAL_RETRY_LIMIT => NextDelay::Delay(self.general[2]),
            _ => NextDelay::Stop,
        }
    }
}

/// Parse a schedule such as `"25_540_3420"`.
///
/// Missing or unparsable elements fall back to [`DEFAULT_GENERAL_DELAYS`]
/// one by one.
pub fn parse_repeat_schedule(schedule: &str) -> ([Duration; 3], Vec<String>) {
    let mut delays = DEFAULT_GENERAL_DELAYS;
    let mut problems = Vec::new();
    let mut parts = schedule.split('_');

    for (i, delay) in delays.iter_mut().enumerate() {
        match parts.next().map(|p| p.trim().parse::<u64>()) {
            Some(Ok(secs)) => *delay = Duration::from_secs(secs),
            Some(Err(e)) => problems.push(format!(
                "repeat check schedule element {} of {:?}: {}",
                i, schedule, e
            )),
            None => problems.push(format!(
                "repeat check schedule {:?} has no element {}",
                schedule, i
            )),
        }
    }

    (delays, problems)
}
