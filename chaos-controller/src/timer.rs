//! Duration-based auto-recovery.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::ImplError;
use crate::resource::ChaosResource;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
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
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if let Ok(step) = chrono::Duration::from_std(by) {
            *now += step;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parse `"300ms"`, `"30s"`, `"2h45m"` and similar.
pub fn parse_duration(raw: &str) -> Result<Duration, ImplError> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| ImplError::Config(format!("invalid duration {raw:?}: {e}")))
}

/// Time left until `created + duration`, or `None` once it has passed.
pub fn remaining(
    created: DateTime<Utc>,
    duration: Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let elapsed = (now - created).to_std().unwrap_or(Duration::ZERO);
    duration.checked_sub(elapsed).filter(|left| !left.is_zero())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Deleting,
    DurationElapsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    /// Keep faults injected; `until` is the time left when a duration is set.
    Run { until: Option<Duration> },
    Stop(StopReason),
}

/// Deletion always stops. Otherwise run until the configured duration has
/// passed since creation.
pub fn desired_state(
    resource: &ChaosResource,
    now: DateTime<Utc>,
) -> Result<DesiredState, ImplError> {
    if resource.is_deleting() {
        return Ok(DesiredState::Stop(StopReason::Deleting));
    }
    let Some(raw) = resource.spec.duration.as_deref() else {
        return Ok(DesiredState::Run { until: None });
    };
    let duration = parse_duration(raw)?;
    let created = resource.metadata.creation_timestamp.unwrap_or(now);
    match remaining(created, duration, now) {
        Some(left) => Ok(DesiredState::Run { until: Some(left) }),
        None => Ok(DesiredState::Stop(StopReason::DurationElapsed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(
            parse_duration("2h45m").unwrap(),
            Duration::from_secs(2 * 3600 + 45 * 60)
        );
        assert!(matches!(parse_duration("soon"), Err(ImplError::Config(_))));
    }

    #[test]
    fn remaining_counts_down_to_none() {
        let d = Duration::from_secs(30);
        assert_eq!(remaining(t0(), d, t0()), Some(d));
        assert_eq!(
            remaining(t0(), d, t0() + chrono::Duration::seconds(10)),
            Some(Duration::from_secs(20))
        );
        assert_eq!(remaining(t0(), d, t0() + chrono::Duration::seconds(30)), None);
        assert_eq!(remaining(t0(), d, t0() + chrono::Duration::seconds(90)), None);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(t0());
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), t0() + chrono::Duration::seconds(5));
    }
}
