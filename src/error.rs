//! Error types shared by the node handles and the orchestrator.

use crate::{engine::CommandError, node::ProtocolStep, orchestrator::Phase};
use std::time::Duration;

/// Failure to obtain a working connection to an instance.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The instance could not be reached (down, timed out, or the transport broke).
    #[error("instance `{address}` is unreachable: {reason}")]
    Unreachable {
        /// Address of the instance.
        address: String,
        /// What went wrong.
        reason: String,
    },
    /// The instance answered but refused the session (credentials or configuration).
    #[error("instance `{address}` rejected the connection: {reason}")]
    Rejected {
        /// Address of the instance.
        address: String,
        /// What went wrong.
        reason: String,
    },
}

/// Errors raised while forming or verifying a replication group.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum GroupError {
    /// No usable connection.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A node is not in the state required before the next protocol step.
    #[error("precondition violated on `{node}`: {violation}")]
    Precondition {
        /// Address of the node.
        node: String,
        /// Description of the violated precondition.
        violation: String,
    },

    /// The group replication plugin is already installed on the node.
    #[error("group replication plugin is already installed on `{node}`")]
    AlreadyInstalled {
        /// Address of the node.
        node: String,
    },

    /// A bootstrap or join sub-step was rejected by the engine.
    #[error("{step} failed on `{node}`: {source}")]
    ProtocolStep {
        /// Address of the node.
        node: String,
        /// The sub-step that failed. Later steps were not executed.
        step: ProtocolStep,
        /// The engine's answer.
        source: CommandError,
    },

    /// The node refused a write because it is not accepting writes.
    #[error("write rejected by `{node}`: {message}")]
    WriteRejected {
        /// Address of the node.
        node: String,
        /// The engine's literal message.
        message: String,
    },

    /// A polled condition did not hold before the deadline.
    #[error("timed out after {waited:?} waiting for {condition}")]
    ConvergenceTimeout {
        /// The condition that never held, naming the node it concerns.
        condition: String,
        /// How long the condition was polled for.
        waited: Duration,
    },

    /// Any other statement rejected by the engine.
    #[error("`{statement}` failed on `{node}`: {source}")]
    Command {
        /// Address of the node.
        node: String,
        /// The statement that was sent.
        statement: String,
        /// The engine's answer.
        source: CommandError,
    },

    /// The observed state of a node differs from the expected one.
    #[error("unexpected state on `{node}`: {detail}")]
    Mismatch {
        /// Address of the node.
        node: String,
        /// What was expected and what was found.
        detail: String,
    },

    /// An orchestrator operation was called in the wrong phase.
    #[error("`{operation}` is not allowed in phase {phase:?}")]
    InvalidPhase {
        /// The requested operation.
        operation: &'static str,
        /// The phase the orchestrator was in.
        phase: Phase,
    },

    /// The given node index is not part of the topology.
    #[error("node index {0} is not part of the topology")]
    UnknownNode(usize),

    /// Invalid topology or settings.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl GroupError {
    /// Returns true for errors caused by residual state on a node.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition { .. } | Self::AlreadyInstalled { .. })
    }

    /// Returns true if the error is an expected write rejection by a read-only member.
    pub fn is_write_rejected(&self) -> bool {
        matches!(self, Self::WriteRejected { .. })
    }

    pub(crate) fn mismatch(node: &str, detail: impl Into<String>) -> Self {
        Self::Mismatch {
            node: node.to_owned(),
            detail: detail.into(),
        }
    }
}
