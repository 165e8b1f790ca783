//! Test doubles for the collaborator traits.
//!
//! Every mock records the calls it receives and answers with a
//! programmer-specified behaviour.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    ContactAttributes, ContactLookup, ExecutionContext, ListManager, MessageSender, NodeError,
};

/// Behaviour injected into a mock at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    Succeed,
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail retryably for the first `n` calls, then succeed.
    FailTimes(usize, String),
    /// Sleep before succeeding.
    Hang(Duration),
}

impl MockBehaviour {
    async fn answer(&self, call_number: usize) -> Result<(), NodeError> {
        match self {
            Self::Succeed => Ok(()),
            Self::FailRetryable(msg) => Err(NodeError::Retryable(msg.clone())),
            Self::FailFatal(msg) => Err(NodeError::Fatal(msg.clone())),
            Self::FailTimes(n, msg) if call_number <= *n => Err(NodeError::Retryable(msg.clone())),
            Self::FailTimes(..) => Ok(()),
            Self::Hang(d) => {
                tokio::time::sleep(*d).await;
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MockSender
// ---------------------------------------------------------------------------

/// One recorded `send` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub template_id: String,
    pub contact_email: String,
    pub node_id: String,
}

pub struct MockSender {
    pub behaviour: MockBehaviour,
    /// All sends seen by this mock (in call order), including failed ones.
    pub calls: Arc<Mutex<Vec<SentMessage>>>,
}

impl MockSender {
    pub fn new(behaviour: MockBehaviour) -> Self {
        Self { behaviour, calls: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn succeeding() -> Self {
        Self::new(MockBehaviour::Succeed)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSender for MockSender {
    async fn send(&self, template_id: &str, ctx: &ExecutionContext) -> Result<(), NodeError> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(SentMessage {
                template_id: template_id.to_owned(),
                contact_email: ctx.contact_email.clone(),
                node_id: ctx.node_id.clone(),
            });
            calls.len()
        };
        self.behaviour.answer(call_number).await
    }
}

// ---------------------------------------------------------------------------
// MockLists
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListChange {
    Added { list_id: String, contact_email: String, status: String },
    Removed { list_id: String, contact_email: String },
}

pub struct MockLists {
    pub behaviour: MockBehaviour,
    pub calls: Arc<Mutex<Vec<ListChange>>>,
}

impl MockLists {
    pub fn new(behaviour: MockBehaviour) -> Self {
        Self { behaviour, calls: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn succeeding() -> Self {
        Self::new(MockBehaviour::Succeed)
    }

    pub fn changes(&self) -> Vec<ListChange> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, change: ListChange) -> usize {
        let mut calls = self.calls.lock().unwrap();
        calls.push(change);
        calls.len()
    }
}

#[async_trait]
impl ListManager for MockLists {
    async fn add_contact(
        &self,
        list_id: &str,
        status: &str,
        ctx: &ExecutionContext,
    ) -> Result<(), NodeError> {
        let n = self.record(ListChange::Added {
            list_id: list_id.to_owned(),
            contact_email: ctx.contact_email.clone(),
            status: status.to_owned(),
        });
        self.behaviour.answer(n).await
    }

    async fn remove_contact(&self, list_id: &str, ctx: &ExecutionContext) -> Result<(), NodeError> {
        let n = self.record(ListChange::Removed {
            list_id: list_id.to_owned(),
            contact_email: ctx.contact_email.clone(),
        });
        self.behaviour.answer(n).await
    }
}

// ---------------------------------------------------------------------------
// MockContacts
// ---------------------------------------------------------------------------

/// In-memory contact directory keyed by email.
#[derive(Default)]
pub struct MockContacts {
    contacts: Mutex<HashMap<String, ContactAttributes>>,
    lookups: Mutex<usize>,
}

impl MockContacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a contact. Non-object values are stored as empty.
    pub fn with_contact(self, email: &str, attributes: serde_json::Value) -> Self {
        self.upsert(email, attributes);
        self
    }

    pub fn upsert(&self, email: &str, attributes: serde_json::Value) {
        let attributes = attributes.as_object().cloned().unwrap_or_default();
        self.contacts.lock().unwrap().insert(email.to_owned(), attributes);
    }

    pub fn lookup_count(&self) -> usize {
        *self.lookups.lock().unwrap()
    }
}

#[async_trait]
impl ContactLookup for MockContacts {
    async fn attributes(
        &self,
        _workspace_id: &str,
        email: &str,
    ) -> Result<Option<ContactAttributes>, NodeError> {
        *self.lookups.lock().unwrap() += 1;
        Ok(self.contacts.lock().unwrap().get(email).cloned())
    }
}
