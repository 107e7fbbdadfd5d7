use crate::ContextMap;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    PartialSuccess,
    Retry,
    Fail,
    Skipped,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Retry => "retry",
            Self::Fail => "fail",
            Self::Skipped => "skipped",
        }
    }

    /// Success and partial success both satisfy goal gates.
    pub fn is_success_like(self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "success" => Some(Self::Success),
            "partial_success" => Some(Self::PartialSuccess),
            "retry" => Some(Self::Retry),
            "fail" => Some(Self::Fail),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// The structured result of one handler invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    pub status: StageStatus,
    pub preferred_label: Option<String>,
    pub suggested_next_ids: Vec<String>,
    pub context_updates: ContextMap,
    pub notes: Option<String>,
    pub failure_reason: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: ContextMap::new(),
            notes: None,
            failure_reason: None,
        }
    }

    pub fn success_with_notes(notes: impl Into<String>) -> Self {
        Self {
            notes: Some(notes.into()),
            ..Self::success()
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Fail,
            failure_reason: Some(reason.into()),
            ..Self::success()
        }
    }

    pub fn retry(notes: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Retry,
            notes: Some(notes.into()),
            ..Self::success()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_status_round_trip_expected_same_variant() {
        for status in [
            StageStatus::Success,
            StageStatus::PartialSuccess,
            StageStatus::Retry,
            StageStatus::Fail,
            StageStatus::Skipped,
        ] {
            assert_eq!(StageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StageStatus::parse("bogus"), None);
    }

    #[test]
    fn stage_status_success_like_expected_success_and_partial_only() {
        assert!(StageStatus::Success.is_success_like());
        assert!(StageStatus::PartialSuccess.is_success_like());
        assert!(!StageStatus::Retry.is_success_like());
        assert!(!StageStatus::Fail.is_success_like());
        assert!(!StageStatus::Skipped.is_success_like());
    }

    #[test]
    fn outcome_fail_expected_failure_reason_set() {
        let outcome = Outcome::fail("boom");
        assert_eq!(outcome.status, StageStatus::Fail);
        assert_eq!(outcome.failure_reason.as_deref(), Some("boom"));
        assert!(outcome.notes.is_none());
    }
}
