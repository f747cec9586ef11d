use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal and non-terminal states of a single execution attempt.
///
/// Wire value (used by executor callees) and persisted storage code (used by
/// [`crate::storage`]) are distinct representations of the same state — see
/// [`ExecStatus::from_wire`] / [`ExecStatus::from_code`] for the mappings. The
/// storage layer is responsible for translating between `ExecStatus` and the
/// raw `i16` column; this type never touches SQL directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecStatus {
    Unknown,
    Running,
    Success,
    Failed,
    DeadlineExceeded,
    Cancelled,
}

impl ExecStatus {
    /// Parses the wire-level status string reported by an executor callee
    /// (`SUCCESS` / `RUNNING` / `FAILED`). Anything else is `Unknown`, never an error —
    /// callers decide what to do with an unrecognized status.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "SUCCESS" => ExecStatus::Success,
            "RUNNING" => ExecStatus::Running,
            "FAILED" => ExecStatus::Failed,
            _ => ExecStatus::Unknown,
        }
    }

    /// The persisted storage code for this status.
    pub fn code(self) -> i16 {
        match self {
            ExecStatus::Unknown => 0,
            ExecStatus::Running => 1,
            ExecStatus::Success => 2,
            ExecStatus::Failed => 3,
            ExecStatus::DeadlineExceeded => 4,
            ExecStatus::Cancelled => 5,
        }
    }

    pub fn from_code(code: i16) -> Self {
        match code {
            1 => ExecStatus::Running,
            2 => ExecStatus::Success,
            3 => ExecStatus::Failed,
            4 => ExecStatus::DeadlineExceeded,
            5 => ExecStatus::Cancelled,
            _ => ExecStatus::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecStatus::Success | ExecStatus::Failed | ExecStatus::DeadlineExceeded | ExecStatus::Cancelled
        )
    }
}

/// One attempt at running a task. `tid` is unique: a new attempt overwrites the
/// previous execution row for the same task rather than appending history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub tid: i64,
    pub status: ExecStatus,
    pub progress: i16,
    pub ctime: DateTime<Utc>,
    pub utime: DateTime<Utc>,
}

/// A progress/status report parsed from an executor callee's payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecResult {
    pub id: i64,
    pub status: String,
    pub progress: i16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_status_round_trips_through_storage_code() {
        for s in [
            ExecStatus::Running,
            ExecStatus::Success,
            ExecStatus::Failed,
            ExecStatus::DeadlineExceeded,
            ExecStatus::Cancelled,
        ] {
            assert_eq!(ExecStatus::from_code(s.code()), s);
        }
    }

    #[test]
    fn unrecognized_wire_value_is_unknown_not_an_error() {
        assert_eq!(ExecStatus::from_wire("bogus"), ExecStatus::Unknown);
    }

    #[test]
    fn terminal_statuses_are_exactly_the_four_named_in_the_state_machine() {
        assert!(ExecStatus::Success.is_terminal());
        assert!(ExecStatus::Failed.is_terminal());
        assert!(ExecStatus::DeadlineExceeded.is_terminal());
        assert!(ExecStatus::Cancelled.is_terminal());
        assert!(!ExecStatus::Running.is_terminal());
        assert!(!ExecStatus::Unknown.is_terminal());
    }
}
