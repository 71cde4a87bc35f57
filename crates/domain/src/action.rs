//! Remediation actions — whitelisted commands with an approval lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Command output kept per action; anything longer is cut at persist time.
pub const MAX_OUTPUT_BYTES: usize = 10_000;

/// Stdout marker an agent sends when it has detached a long-running command.
/// The result is acknowledged but the action stays `executing` until the
/// final result arrives.
pub const BACKGROUND_START_SENTINEL: &str = "Started background execution";

/// Lifecycle states. Legal transitions form a DAG:
/// `pending → approved → executing → {completed|failed}` plus
/// `pending → cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Approved,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl ActionStatus {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        use ActionStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Cancelled)
                | (Approved, Executing)
                | (Executing, Completed)
                | (Executing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemediationAction {
    pub id: i64,
    pub server_id: String,
    pub action_type: String,
    pub command: String,
    pub service_name: Option<String>,
    pub status: ActionStatus,
    pub exit_code: Option<i64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Truncate command output to [`MAX_OUTPUT_BYTES`] on a char boundary.
pub fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_OUTPUT_BYTES {
        return output.to_string();
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    output[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_dag() {
        use ActionStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Approved.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Completed));
        assert!(Executing.can_transition_to(Failed));

        assert!(!Approved.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Executing));
        assert!(!Executing.can_transition_to(Approved));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn truncation_is_exact_at_limit() {
        let exactly = "a".repeat(MAX_OUTPUT_BYTES);
        assert_eq!(truncate_output(&exactly).len(), MAX_OUTPUT_BYTES);

        let over = "b".repeat(MAX_OUTPUT_BYTES + 500);
        assert_eq!(truncate_output(&over).len(), MAX_OUTPUT_BYTES);

        let under = "short";
        assert_eq!(truncate_output(under), "short");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 4-byte characters that straddle the cut point must not panic.
        let wide = "\u{1F600}".repeat(MAX_OUTPUT_BYTES / 4 + 10);
        let cut = truncate_output(&wide);
        assert!(cut.len() <= MAX_OUTPUT_BYTES);
    }
}
