//! Core saga domain model.
//!
//! Defines the persisted shape of one saga instance ([`SagaRecord`]), its
//! lifecycle states ([`SagaStatus`]), the append-only audit trail
//! ([`SagaActivity`]), and the outcome of a compensation run
//! ([`CompensationResult`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier of a saga instance.
///
/// Assigned once at creation and immutable afterwards. Dispatch layers that
/// derive ids from message correlation data construct this directly from the
/// correlated string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SagaId(pub String);

impl SagaId {
    /// Create a new random saga id (uuid v4).
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SagaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SagaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SagaId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle state of a saga instance.
///
/// `Running` and `Compensating` are transient; every other state is terminal.
/// Once a saga reaches a terminal state no further step execution or
/// compensation may mutate its step index or data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Forward execution in progress.
    Running,
    /// All steps completed successfully.
    Completed,
    /// A step failed (or the saga was cancelled) and compensation is in
    /// progress, or compensation stalled partway and needs an operator.
    Compensating,
    /// Every completed step was rolled back successfully.
    Compensated,
    /// Explicitly cancelled and fully rolled back.
    Cancelled,
    /// Force-expired by the cleanup sweep or an expiry timeout.
    Expired,
}

impl SagaStatus {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Compensated | Self::Cancelled | Self::Expired
        )
    }

    /// Whether the saga still holds work or needs attention.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Compensating)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "compensating" => Ok(Self::Compensating),
            "compensated" => Ok(Self::Compensated),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown saga status: {}", other)),
        }
    }
}

/// One entry in a saga's append-only audit trail.
///
/// Entries are appended in transition order and never reordered or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaActivity {
    pub message: String,
    pub at: DateTime<Utc>,
}

impl SagaActivity {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// The persisted state of one saga instance. One record per saga.
///
/// The state store exclusively owns the durable representation; the
/// orchestrator holds at most a transient copy while executing one step and
/// re-persists before yielding control. `version` is the optimistic-locking
/// token: it is incremented by the store on every successful conditional
/// update, and a writer must present the version it last read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaRecord<D> {
    pub saga_id: SagaId,
    /// Name of the registered definition driving this instance. Definitions
    /// (steps, timeouts, retry policy) are configuration, not persisted state.
    pub definition: String,
    /// Business payload, opaque to the engine. Mutated only by step code.
    pub data: D,
    pub status: SagaStatus,
    /// Index of the next step to execute, or the last step acted upon while
    /// compensating.
    pub current_step: usize,
    /// Attempts made on the current forward step. The retry policy is
    /// stateless, so the counter lives here. Reset when the step advances.
    pub step_attempts: u32,
    pub activities: Vec<SagaActivity>,
    pub started_at: DateTime<Utc>,
    /// Updated on every persisted transition; staleness input for the
    /// cleanup sweep.
    pub last_updated_at: DateTime<Utc>,
    /// Set exactly once, when a terminal state is reached.
    pub completed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl<D> SagaRecord<D> {
    /// Create a fresh record in `Running` at step 0.
    pub fn new(saga_id: SagaId, definition: impl Into<String>, data: D) -> Self {
        let now = Utc::now();
        Self {
            saga_id,
            definition: definition.into(),
            data,
            status: SagaStatus::Running,
            current_step: 0,
            step_attempts: 0,
            activities: Vec::new(),
            started_at: now,
            last_updated_at: now,
            completed_at: None,
            version: 0,
        }
    }

    /// Append an audit entry and refresh `last_updated_at`.
    pub fn log_activity(&mut self, message: impl Into<String>) {
        let activity = SagaActivity::new(message);
        self.last_updated_at = activity.at;
        self.activities.push(activity);
    }

    /// Move to the next forward step, resetting the attempt counter.
    pub fn advance_step(&mut self) {
        self.current_step += 1;
        self.step_attempts = 0;
        self.last_updated_at = Utc::now();
    }

    /// Transition into a terminal or compensating state. `completed_at` is
    /// set on the first terminal transition only.
    pub fn transition(&mut self, status: SagaStatus) {
        let now = Utc::now();
        self.status = status;
        self.last_updated_at = now;
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Outcome of one compensation run.
///
/// Returned to the orchestrator's caller and to the failure hook; a summary
/// is also recorded as an activity. Not persisted long-term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationResult {
    /// Whether every completed step was rolled back.
    pub success: bool,
    /// How many steps were compensated before finishing or stalling.
    pub steps_compensated: usize,
    /// Error from the compensating action that exhausted its retries.
    pub error: Option<String>,
    pub duration: std::time::Duration,
}

impl CompensationResult {
    pub fn success(steps_compensated: usize, duration: std::time::Duration) -> Self {
        Self {
            success: true,
            steps_compensated,
            error: None,
            duration,
        }
    }

    pub fn failure(
        steps_compensated: usize,
        error: impl Into<String>,
        duration: std::time::Duration,
    ) -> Self {
        Self {
            success: false,
            steps_compensated,
            error: Some(error.into()),
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saga_id_unique_and_displayable() {
        let a = SagaId::new();
        let b = SagaId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.0);
        assert_eq!(SagaId::from("order-42").as_str(), "order-42");
    }

    #[test]
    fn test_status_terminality() {
        assert!(!SagaStatus::Running.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::Cancelled.is_terminal());
        assert!(SagaStatus::Expired.is_terminal());

        assert!(SagaStatus::Running.is_active());
        assert!(SagaStatus::Compensating.is_active());
        assert!(!SagaStatus::Expired.is_active());
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for status in [
            SagaStatus::Running,
            SagaStatus::Completed,
            SagaStatus::Compensating,
            SagaStatus::Compensated,
            SagaStatus::Cancelled,
            SagaStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<SagaStatus>().unwrap(), status);
        }
        assert!("limbo".parse::<SagaStatus>().is_err());
    }

    #[test]
    fn test_new_record_defaults() {
        let record = SagaRecord::new(SagaId::from("s-1"), "order-fulfilment", 7u32);
        assert_eq!(record.status, SagaStatus::Running);
        assert_eq!(record.current_step, 0);
        assert_eq!(record.step_attempts, 0);
        assert_eq!(record.version, 0);
        assert!(record.activities.is_empty());
        assert!(record.completed_at.is_none());
    }

    #[test]
    fn test_activities_append_in_order() {
        let mut record = SagaRecord::new(SagaId::from("s-2"), "d", ());
        record.log_activity("first");
        record.log_activity("second");
        record.log_activity("third");

        let messages: Vec<&str> = record
            .activities
            .iter()
            .map(|a| a.message.as_str())
            .collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert!(record.activities[0].at <= record.activities[2].at);
    }

    #[test]
    fn test_advance_step_resets_attempts() {
        let mut record = SagaRecord::new(SagaId::from("s-3"), "d", ());
        record.step_attempts = 4;
        record.advance_step();
        assert_eq!(record.current_step, 1);
        assert_eq!(record.step_attempts, 0);
    }

    #[test]
    fn test_completed_at_set_once() {
        let mut record = SagaRecord::new(SagaId::from("s-4"), "d", ());
        record.transition(SagaStatus::Compensating);
        assert!(record.completed_at.is_none());

        record.transition(SagaStatus::Compensated);
        let first = record.completed_at.expect("terminal sets completed_at");

        record.transition(SagaStatus::Expired);
        assert_eq!(record.completed_at, Some(first));
    }

    #[test]
    fn test_compensation_result_constructors() {
        let ok = CompensationResult::success(2, std::time::Duration::from_millis(10));
        assert!(ok.success);
        assert_eq!(ok.steps_compensated, 2);
        assert!(ok.error.is_none());

        let failed = CompensationResult::failure(1, "undo exploded", Default::default());
        assert!(!failed.success);
        assert_eq!(failed.steps_compensated, 1);
        assert_eq!(failed.error.as_deref(), Some("undo exploded"));
    }
}
