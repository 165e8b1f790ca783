//! Collaborator contracts: the external services a node's side effect is delegated to.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::NodeError;

/// Flat attribute map describing a contact (`country`, `tier`, custom fields…).
pub type ContactAttributes = serde_json::Map<String, Value>;

/// Context handed to every collaborator call.
///
/// Defined here (in the nodes crate) so the engine and the collaborator
/// implementations can share it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workspace_id: String,
    pub automation_id: Uuid,
    /// The `contact_automations` row being advanced.
    pub enrollment_id: Uuid,
    pub node_id: String,
    pub contact_email: String,
    /// Snapshot of the triggering event payload.
    pub data: Value,
}

/// Sends a rendered message. Rendering and delivery belong to the implementor.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, template_id: &str, ctx: &ExecutionContext) -> Result<(), NodeError>;
}

/// Mutates contact-list membership.
#[async_trait]
pub trait ListManager: Send + Sync {
    async fn add_contact(
        &self,
        list_id: &str,
        status: &str,
        ctx: &ExecutionContext,
    ) -> Result<(), NodeError>;

    async fn remove_contact(&self, list_id: &str, ctx: &ExecutionContext) -> Result<(), NodeError>;
}

/// Resolves the attribute snapshot used by `branch` and `filter` nodes.
#[async_trait]
pub trait ContactLookup: Send + Sync {
    /// `Ok(None)` when the contact no longer exists.
    async fn attributes(
        &self,
        workspace_id: &str,
        email: &str,
    ) -> Result<Option<ContactAttributes>, NodeError>;
}
