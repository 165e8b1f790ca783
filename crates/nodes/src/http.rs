//! HTTP-backed collaborators.
//!
//! Sending, list membership and contact lookup are owned by other services;
//! this adapter speaks JSON to them. Transport failures, `429` and `5xx` are
//! retryable, any other non-success status is fatal.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::json;
use tracing::debug;

use crate::{
    ContactAttributes, ContactLookup, ExecutionContext, ListManager, MessageSender, NodeError,
};

/// Endpoints of the external services.
#[derive(Debug, Clone)]
pub struct HttpEndpoints {
    /// `POST` target for message sends.
    pub send_url: String,
    /// `POST` target for list membership changes.
    pub lists_url: String,
    /// `GET` target for contact snapshots (`?workspace_id=…&email=…`).
    pub contacts_url: String,
}

#[derive(Debug, Clone)]
pub struct HttpCollaborators {
    client: Client,
    endpoints: HttpEndpoints,
}

impl HttpCollaborators {
    pub fn new(client: Client, endpoints: HttpEndpoints) -> Self {
        Self { client, endpoints }
    }

    async fn post(&self, url: &str, body: serde_json::Value) -> Result<(), NodeError> {
        let resp = self.client.post(url).json(&body).send().await.map_err(transport)?;
        check_status(resp).map(|_| ())
    }
}

fn transport(err: reqwest::Error) -> NodeError {
    NodeError::Retryable(format!("request failed: {err}"))
}

fn check_status(resp: Response) -> Result<Response, NodeError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(NodeError::Retryable(format!("{} answered {status}", resp.url())))
    } else {
        Err(NodeError::Fatal(format!("{} answered {status}", resp.url())))
    }
}

#[async_trait]
impl MessageSender for HttpCollaborators {
    async fn send(&self, template_id: &str, ctx: &ExecutionContext) -> Result<(), NodeError> {
        debug!("sending template '{}' to {}", template_id, ctx.contact_email);
        self.post(
            &self.endpoints.send_url,
            json!({
                "workspace_id": ctx.workspace_id,
                "automation_id": ctx.automation_id,
                "enrollment_id": ctx.enrollment_id,
                "node_id": ctx.node_id,
                "template_id": template_id,
                "contact_email": ctx.contact_email,
                "data": ctx.data,
            }),
        )
        .await
    }
}

#[async_trait]
impl ListManager for HttpCollaborators {
    async fn add_contact(
        &self,
        list_id: &str,
        status: &str,
        ctx: &ExecutionContext,
    ) -> Result<(), NodeError> {
        self.post(
            &self.endpoints.lists_url,
            json!({
                "action": "add",
                "workspace_id": ctx.workspace_id,
                "list_id": list_id,
                "contact_email": ctx.contact_email,
                "status": status,
            }),
        )
        .await
    }

    async fn remove_contact(&self, list_id: &str, ctx: &ExecutionContext) -> Result<(), NodeError> {
        self.post(
            &self.endpoints.lists_url,
            json!({
                "action": "remove",
                "workspace_id": ctx.workspace_id,
                "list_id": list_id,
                "contact_email": ctx.contact_email,
            }),
        )
        .await
    }
}

#[async_trait]
impl ContactLookup for HttpCollaborators {
    async fn attributes(
        &self,
        workspace_id: &str,
        email: &str,
    ) -> Result<Option<ContactAttributes>, NodeError> {
        let resp = self
            .client
            .get(&self.endpoints.contacts_url)
            .query(&[("workspace_id", workspace_id), ("email", email)])
            .send()
            .await
            .map_err(transport)?;
        read_contact(resp).await
    }
}

/// A contact snapshot; `404` means the directory does not know the contact.
async fn read_contact(resp: Response) -> Result<Option<ContactAttributes>, NodeError> {
    if resp.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }

    let attributes = check_status(resp)?
        .json::<ContactAttributes>()
        .await
        .map_err(|e| NodeError::Retryable(format!("malformed contact payload: {e}")))?;
    Ok(Some(attributes))
}
