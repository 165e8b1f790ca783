//! Engine-level error types.

use thiserror::Error;

use crate::models::AutomationStatus;

/// Errors produced by the automation engine (validation, lifecycle, persistence).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// The graph has no nodes at all.
    #[error("automation graph has no nodes")]
    EmptyGraph,

    /// The trigger does not name an event kind.
    #[error("trigger event kind must not be empty")]
    EmptyEventKind,

    /// `root_node_id` does not name a node of the graph.
    #[error("root node '{0}' does not exist")]
    UnknownRoot(String),

    /// A node is stored under a key different from its own id.
    #[error("node stored under '{key}' declares id '{id}'")]
    NodeIdMismatch { key: String, id: String },

    /// An edge points at a node that doesn't exist.
    #[error("node '{node_id}' references unknown node '{target}'")]
    DanglingReference { node_id: String, target: String },

    /// An `ab_test` node has no variants or zero total weight.
    #[error("ab_test node '{0}' needs at least one variant with positive weight")]
    InvalidVariants(String),

    /// A delay node's wait does not fit the clock.
    #[error("delay on node '{0}' is out of range")]
    InvalidDelay(String),

    /// Topological sort detected a cycle.
    #[error("automation graph contains a cycle")]
    CycleDetected,

    // ------ Lifecycle errors ------

    #[error("cannot move automation from {from} to {to}")]
    InvalidTransition { from: AutomationStatus, to: AutomationStatus },

    /// The definition cannot be edited in its current status.
    #[error("automation is {0}; its definition cannot be changed")]
    Immutable(AutomationStatus),

    /// A paused update would strand active enrollments on removed nodes.
    #[error("active enrollments sit on nodes removed by this update: {0:?}")]
    StrandedEnrollments(Vec<String>),

    #[error("triggering event has no contact email")]
    MissingContact,

    #[error("automation or enrollment not found")]
    NotFound,

    // ------ Infrastructure errors ------

    /// Scheduler settings that cannot work together.
    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),

    /// A stored definition could not be (de)serialised.
    #[error("definition error: {0}")]
    Definition(#[from] serde_json::Error),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[source] db::DbError),
}

impl EngineError {
    /// Whether the error rejects an automation definition at save time.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyGraph
                | Self::EmptyEventKind
                | Self::UnknownRoot(_)
                | Self::NodeIdMismatch { .. }
                | Self::DanglingReference { .. }
                | Self::InvalidVariants(_)
                | Self::InvalidDelay(_)
                | Self::CycleDetected
        )
    }
}

impl From<db::DbError> for EngineError {
    fn from(err: db::DbError) -> Self {
        match err {
            db::DbError::NotFound => Self::NotFound,
            other => Self::Database(other),
        }
    }
}
