//! Per-message lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a queue message inside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Claimed from the queue, nothing checked yet.
    Received,
    /// Blob fetched and payload schema-validated.
    Validated,
    /// Cleaned, gated, and merged into a conversation.
    Preprocessed,
    Embedded,
    Matched,
    /// Output record written to the output container.
    Published,
    /// Removed from the queue after a successful publish.
    Acknowledged,
    /// Dropped by preprocessing and acknowledged.
    Skipped,
    /// Left on the queue for redelivery.
    RetryableFailure,
    /// Dead-lettered and acknowledged.
    Poisoned,
}

impl MessageState {
    pub fn can_transition_to(&self, target: MessageState) -> bool {
        use MessageState::*;

        matches!(
            (self, target),
            // From Received
            (Received, Validated) | (Received, Poisoned) | (Received, RetryableFailure) |
            // From Validated
            (Validated, Preprocessed) | (Validated, Skipped) |
            // From Preprocessed
            (Preprocessed, Embedded) | (Preprocessed, RetryableFailure) |
            // From Embedded
            (Embedded, Matched) | (Embedded, Poisoned) | (Embedded, RetryableFailure) |
            // From Matched
            (Matched, Published) | (Matched, RetryableFailure) |
            // From Published
            (Published, Acknowledged) | (Published, RetryableFailure) |
            // Skip acknowledgement can still fail
            (Skipped, RetryableFailure) |
            // Escalation past the poison threshold
            (RetryableFailure, Poisoned)
        )
    }

    /// States a message may finish in.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Acknowledged | Self::Skipped | Self::RetryableFailure | Self::Poisoned
        )
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::Preprocessed => "preprocessed",
            Self::Embedded => "embedded",
            Self::Matched => "matched",
            Self::Published => "published",
            Self::Acknowledged => "acknowledged",
            Self::Skipped => "skipped",
            Self::RetryableFailure => "retryable_failure",
            Self::Poisoned => "poisoned",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: MessageState,
    pub to: MessageState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Transition history for one message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageLifecycle {
    pub message_id: String,
    pub state: MessageState,
    pub received_at: DateTime<Utc>,
    pub transitions: Vec<StateTransition>,
}

impl MessageLifecycle {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            state: MessageState::Received,
            received_at: Utc::now(),
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: MessageState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition message {} from {} to {}",
                self.message_id, self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        self.state = new_state;
        Ok(())
    }

    /// Sequence of states visited, starting with `Received`.
    pub fn path(&self) -> Vec<MessageState> {
        let mut path = vec![MessageState::Received];
        path.extend(self.transitions.iter().map(|t| t.to));
        path
    }

    /// Reason attached to the most recent transition, if any.
    pub fn last_reason(&self) -> Option<&str> {
        self.transitions.last().and_then(|t| t.reason.as_deref())
    }
}
