//! Durable saga instance state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

impl SagaStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SagaStatus::NotStarted => "NotStarted",
            SagaStatus::InProgress => "InProgress",
            SagaStatus::Completed => "Completed",
            SagaStatus::Failed => "Failed",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Compensated => "Compensated",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SagaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotStarted" => Ok(SagaStatus::NotStarted),
            "InProgress" => Ok(SagaStatus::InProgress),
            "Completed" => Ok(SagaStatus::Completed),
            "Failed" => Ok(SagaStatus::Failed),
            "Compensating" => Ok(SagaStatus::Compensating),
            "Compensated" => Ok(SagaStatus::Compensated),
            other => Err(format!("unknown saga status '{other}'")),
        }
    }
}

/// One saga instance.
///
/// `id` is the row identity; `correlation_id` is the business key that
/// threads through every event of the workflow, and all lookups use it.
/// `version` is the optimistic-concurrency token: every persisted mutation
/// advances it, and a stale writer loses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaState {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub saga_type: String,
    pub status: SagaStatus,
    /// Index of the next step to execute; equals `completed_steps.len()`
    /// while the saga moves forward.
    pub current_step: usize,
    pub completed_steps: Vec<String>,
    pub compensated_steps: Vec<String>,
    /// Opaque payload owned by the saga author.
    pub state_data: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl SagaState {
    pub fn new(
        saga_type: impl Into<String>,
        correlation_id: Uuid,
        state_data: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            saga_type: saga_type.into(),
            status: SagaStatus::NotStarted,
            current_step: 0,
            completed_steps: Vec::new(),
            compensated_steps: Vec::new(),
            state_data,
            error: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Record an error, keeping earlier ones visible.
    pub fn push_error(&mut self, detail: impl AsRef<str>) {
        self.error = Some(match self.error.take() {
            Some(existing) => format!("{existing}; {}", detail.as_ref()),
            None => detail.as_ref().to_string(),
        });
    }

    /// The highest completed step not yet compensated, if any. Drives the
    /// reverse compensation walk, including resumption after a crash.
    pub fn next_compensation(&self) -> Option<&str> {
        self.completed_steps
            .iter()
            .rev()
            .map(String::as_str)
            .find(|name| !self.compensated_steps.iter().any(|done| done == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SagaStatus::NotStarted,
            SagaStatus::InProgress,
            SagaStatus::Completed,
            SagaStatus::Failed,
            SagaStatus::Compensating,
            SagaStatus::Compensated,
        ] {
            assert_eq!(status.to_string().parse::<SagaStatus>().unwrap(), status);
        }
        assert!("Running".parse::<SagaStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
        assert!(!SagaStatus::InProgress.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(!SagaStatus::NotStarted.is_terminal());
    }

    #[test]
    fn next_compensation_walks_in_reverse() {
        let mut state = SagaState::new("order", Uuid::new_v4(), json!({}));
        state.completed_steps = vec![
            "reserve-inventory".to_string(),
            "charge-payment".to_string(),
        ];

        assert_eq!(state.next_compensation(), Some("charge-payment"));

        state.compensated_steps.push("charge-payment".to_string());
        assert_eq!(state.next_compensation(), Some("reserve-inventory"));

        state.compensated_steps.push("reserve-inventory".to_string());
        assert_eq!(state.next_compensation(), None);
    }

    #[test]
    fn push_error_accumulates() {
        let mut state = SagaState::new("order", Uuid::new_v4(), json!({}));
        state.push_error("card_declined");
        state.push_error("compensation 'reserve-inventory' failed: timeout");
        let error = state.error.unwrap();
        assert!(error.starts_with("card_declined; "));
        assert!(error.contains("reserve-inventory"));
    }
}
