//! Post records and their status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a post record.
///
/// ```text
///       create
/// pending ────► generating ──► validating ──► publishing ──► published
///   │               │ fail          │ fail         │ fail
///   └───────────────┴───────────────┴──────────────►  failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Pending,
    Generating,
    Validating,
    Publishing,
    Published,
    Failed,
}

impl PostStatus {
    /// Whether the machine allows moving from `self` to `to`.
    pub fn can_transition(self, to: PostStatus) -> bool {
        use PostStatus::*;
        matches!(
            (self, to),
            (Pending, Generating)
                | (Generating, Validating)
                | (Validating, Publishing)
                | (Publishing, Published)
                | (Pending, Failed)
                | (Generating, Failed)
                | (Validating, Failed)
                | (Publishing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PostStatus::Published | PostStatus::Failed)
    }
}

/// Why a post ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    QuotaExceeded,
    Configuration,
    Driver,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// An atomic status update. Field writes ride along with the status so the
/// repository can apply both in one conditional step.
#[derive(Debug, Clone)]
pub enum StatusTransition {
    ToGenerating,
    /// Generation produced text; record it while entering validation.
    ToValidating { text: String },
    ToPublishing,
    /// Publish succeeded. `external_id` is set in the same write.
    ToPublished {
        external_id: String,
        published_at: DateTime<Utc>,
    },
    ToFailed { failure: Failure },
}

impl StatusTransition {
    pub fn target(&self) -> PostStatus {
        match self {
            StatusTransition::ToGenerating => PostStatus::Generating,
            StatusTransition::ToValidating { .. } => PostStatus::Validating,
            StatusTransition::ToPublishing => PostStatus::Publishing,
            StatusTransition::ToPublished { .. } => PostStatus::Published,
            StatusTransition::ToFailed { .. } => PostStatus::Failed,
        }
    }
}

/// Durable record of one generation-and-publish attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub text: String,
    pub status: PostStatus,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub external_id: Option<String>,
    pub failure: Option<Failure>,
}

impl PostRecord {
    pub fn new_pending(tenant_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            text: String::new(),
            status: PostStatus::Pending,
            created_at,
            published_at: None,
            external_id: None,
            failure: None,
        }
    }

    /// Apply `transition` in place. The caller has already checked the edge.
    pub(crate) fn apply(&mut self, transition: &StatusTransition) {
        self.status = transition.target();
        match transition {
            StatusTransition::ToValidating { text } => {
                self.text = text.clone();
            }
            StatusTransition::ToPublished {
                external_id,
                published_at,
            } => {
                self.external_id = Some(external_id.clone());
                self.published_at = Some(*published_at);
            }
            StatusTransition::ToFailed { failure } => {
                self.failure = Some(failure.clone());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_edges_are_allowed() {
        use PostStatus::*;
        assert!(Pending.can_transition(Generating));
        assert!(Generating.can_transition(Validating));
        assert!(Validating.can_transition(Publishing));
        assert!(Publishing.can_transition(Published));
    }

    #[test]
    fn every_non_terminal_state_can_fail() {
        use PostStatus::*;
        for state in [Pending, Generating, Validating, Publishing] {
            assert!(state.can_transition(Failed), "{state:?} must be failable");
        }
    }

    #[test]
    fn terminal_states_reject_everything() {
        use PostStatus::*;
        for from in [Published, Failed] {
            for to in [Pending, Generating, Validating, Publishing, Published, Failed] {
                assert!(!from.can_transition(to), "{from:?} -> {to:?} must be rejected");
            }
        }
    }

    #[test]
    fn skipping_states_is_rejected() {
        use PostStatus::*;
        assert!(!Pending.can_transition(Validating));
        assert!(!Pending.can_transition(Published));
        assert!(!Generating.can_transition(Published));
    }

    #[test]
    fn published_write_sets_external_id_atomically() {
        let mut record = PostRecord::new_pending("t", Utc::now());
        record.status = PostStatus::Publishing;
        record.apply(&StatusTransition::ToPublished {
            external_id: "ext-1".into(),
            published_at: Utc::now(),
        });
        assert_eq!(record.status, PostStatus::Published);
        assert_eq!(record.external_id.as_deref(), Some("ext-1"));
        assert!(record.published_at.is_some());
    }
}
