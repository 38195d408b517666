use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Local, Utc};
use serde::{Deserialize, Serialize};

pub use mockable::{Clock, DefaultClock};

use skillbridge_common::AppError;

pub type SharedClock = Arc<dyn Clock + Send + Sync>;

pub fn system_clock() -> SharedClock {
    Arc::new(DefaultClock)
}

/// Clock that only moves when told to. Used by tests and by replays of recorded ticks.
#[derive(Debug)]
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.lock_clock() = now;
    }

    pub fn advance(&self, delta: Duration) {
        *self.lock_clock() += delta;
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.advance(Duration::minutes(minutes));
    }

    fn lock_clock(&self) -> MutexGuard<'_, DateTime<Utc>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.lock_clock()
    }
}

/// Work selector carried by a scheduler webhook call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TickTask {
    #[default]
    All,
    Ready,
    AutoComplete,
    Reminders,
    Cleanup,
}

impl TickTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickTask::All => "all",
            TickTask::Ready => "ready",
            TickTask::AutoComplete => "auto_complete",
            TickTask::Reminders => "reminders",
            TickTask::Cleanup => "cleanup",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value.trim() {
            "" | "all" => Ok(TickTask::All),
            "ready" => Ok(TickTask::Ready),
            "auto_complete" => Ok(TickTask::AutoComplete),
            "reminders" => Ok(TickTask::Reminders),
            "cleanup" => Ok(TickTask::Cleanup),
            other => Err(AppError::Validation(format!("Unknown scheduler task '{}'", other))),
        }
    }

    /// The sweeps this task runs, in execution order.
    pub fn sweeps(&self) -> &'static [Sweep] {
        match self {
            TickTask::All => &[
                Sweep::MarkReady,
                Sweep::AutoActivate,
                Sweep::AutoComplete,
                Sweep::AutoMiss,
                Sweep::Reminders,
                Sweep::RescheduleExpiry,
                Sweep::Cleanup,
                Sweep::Progress,
            ],
            TickTask::Ready => &[Sweep::MarkReady, Sweep::AutoActivate],
            TickTask::AutoComplete => &[Sweep::AutoComplete, Sweep::AutoMiss, Sweep::Progress],
            TickTask::Reminders => &[Sweep::Reminders, Sweep::RescheduleExpiry],
            TickTask::Cleanup => &[Sweep::Cleanup],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Sweep {
    MarkReady,
    AutoActivate,
    AutoComplete,
    AutoMiss,
    Reminders,
    RescheduleExpiry,
    Cleanup,
    Progress,
}

impl Sweep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sweep::MarkReady => "mark_ready",
            Sweep::AutoActivate => "auto_activate",
            Sweep::AutoComplete => "auto_complete",
            Sweep::AutoMiss => "auto_miss",
            Sweep::Reminders => "reminders",
            Sweep::RescheduleExpiry => "reschedule_expiry",
            Sweep::Cleanup => "cleanup",
            Sweep::Progress => "progress",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let start = Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.utc(), start);

        clock.advance_minutes(61);
        assert_eq!(clock.utc(), start + Duration::minutes(61));
    }

    #[test]
    fn task_names_parse() {
        assert_eq!(TickTask::parse("auto_complete").unwrap(), TickTask::AutoComplete);
        assert_eq!(TickTask::parse("").unwrap(), TickTask::All);
        assert!(TickTask::parse("everything").is_err());
    }

    #[test]
    fn all_runs_every_sweep_once() {
        let sweeps = TickTask::All.sweeps();
        assert_eq!(sweeps.len(), 8);
        assert_eq!(sweeps.first(), Some(&Sweep::MarkReady));
        for task in [TickTask::Ready, TickTask::AutoComplete, TickTask::Reminders, TickTask::Cleanup] {
            assert!(task.sweeps().iter().all(|sweep| sweeps.contains(sweep)));
        }
    }
}
