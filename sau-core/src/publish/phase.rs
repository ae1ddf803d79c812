use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// States of a publishing run, in execution order, followed by the two
/// terminal failure states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    SessionCheck,
    NavigateEntry,
    ModeSelect,
    MediaInjection,
    ContentFill,
    ScheduleConfig,
    PublishConfirm,
    Verified,
    Done,
    TimedOut,
    Rejected,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::SessionCheck => "session_check",
            Phase::NavigateEntry => "navigate_entry",
            Phase::ModeSelect => "mode_select",
            Phase::MediaInjection => "media_injection",
            Phase::ContentFill => "content_fill",
            Phase::ScheduleConfig => "schedule_config",
            Phase::PublishConfirm => "publish_confirm",
            Phase::Verified => "verified",
            Phase::Done => "done",
            Phase::TimedOut => "timed_out",
            Phase::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one adapter operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseResult {
    Success,
    /// Not possible yet; the state machine re-polls within the phase budget.
    SoftFailure(String),
    /// Terminal rejection signalled by the platform.
    HardFailure(String),
    /// The operation consumed the phase budget on its own.
    TimedOut(String),
}

impl PhaseResult {
    pub fn soft(reason: impl Into<String>) -> Self {
        PhaseResult::SoftFailure(reason.into())
    }

    pub fn hard(reason: impl Into<String>) -> Self {
        PhaseResult::HardFailure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PhaseResult::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub attempts: u32,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl PhaseRecord {
    pub fn skipped(phase: Phase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Skipped,
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }
}

impl fmt::Display for PhaseRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            PhaseStatus::Skipped => write!(f, "{}(skipped)", self.phase),
            PhaseStatus::Completed => write!(
                f,
                "{}[{}x {}ms]",
                self.phase,
                self.attempts,
                self.elapsed.as_millis()
            ),
            PhaseStatus::Failed => write!(
                f,
                "{}(failed after {}x {}ms)",
                self.phase,
                self.attempts,
                self.elapsed.as_millis()
            ),
        }
    }
}

/// Compact one-line rendering of a trace, e.g. for the run ledger.
pub fn format_trace(trace: &[PhaseRecord]) -> String {
    trace
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_renders_in_order() {
        let trace = vec![
            PhaseRecord {
                phase: Phase::SessionCheck,
                status: PhaseStatus::Completed,
                attempts: 1,
                elapsed: Duration::from_millis(400),
            },
            PhaseRecord::skipped(Phase::ScheduleConfig),
        ];
        assert_eq!(
            format_trace(&trace),
            "session_check[1x 400ms] -> schedule_config(skipped)"
        );
        let json = serde_json::to_value(&trace[0]).unwrap();
        assert_eq!(json["elapsed"], 400);
        assert_eq!(json["phase"], "session_check");
    }
}
