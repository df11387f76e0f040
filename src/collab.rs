//! Interfaces to the subsystems the engine consumes but does not own: the
//! completion service, the card board and the inter-agent transport.
//!
//! Implementations live elsewhere. This module carries the traits, the
//! metering decorator that routes completion usage through the supervisor's
//! cost governance, and an in-memory transport for tests.

use crate::supervisor::Supervisor;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipewright_common::Card;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: Role::System,
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: Role::User,
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
    /// Model that actually served the request
    pub model: String,
}

/// Request/response completion service. A caching decorator may wrap it
/// with the same signature.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Completion>;
}

/// Charges every completion to the supervisor's cost tracker.
///
/// Once a ceiling is exhausted the inner service is never called again. The
/// call that crosses a ceiling still returns an error after the fact: its
/// tokens were spent, but nothing further is issued.
pub struct MeteredCompletion {
    inner: Arc<dyn CompletionService>,
    supervisor: Arc<Supervisor>,
    provider: String,
    stage: String,
    purpose: String,
}

impl MeteredCompletion {
    pub fn new(
        inner: Arc<dyn CompletionService>,
        supervisor: Arc<Supervisor>,
        provider: &str,
        stage: &str,
    ) -> Self {
        Self {
            inner,
            supervisor,
            provider: provider.to_string(),
            stage: stage.to_string(),
            purpose: "completion".to_string(),
        }
    }

    pub fn with_purpose(mut self, purpose: &str) -> Self {
        self.purpose = purpose.to_string();
        self
    }
}

#[async_trait]
impl CompletionService for MeteredCompletion {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Completion> {
        self.supervisor.check_budget().map_err(|e| anyhow!(e))?;
        let completion = self
            .inner
            .complete(messages, model, temperature, max_tokens)
            .await?;
        self.supervisor
            .track_llm_call(
                &completion.model,
                &self.provider,
                completion.usage.input_tokens,
                completion.usage.output_tokens,
                &self.stage,
                &self.purpose,
            )
            .map_err(|e| anyhow!(e))?;
        Ok(completion)
    }
}

/// Durable card board.
#[async_trait]
pub trait BoardStore: Send + Sync {
    async fn get_card(&self, card_id: &str) -> Result<Option<Card>>;

    async fn move_card(&self, card_id: &str, column: &str) -> Result<()>;

    async fn update_stage_metadata(&self, card_id: &str, stage: &str, metadata: Value)
    -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_id: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(from: &str, to: &str, kind: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.to_string(),
            to: to.to_string(),
            card_id: None,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn for_card(mut self, card_id: &str) -> Self {
        self.card_id = Some(card_id.to_string());
        self
    }
}

/// Message passing and shared key/value state between agents.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send_message(&self, message: AgentMessage) -> Result<()>;

    /// Drain messages addressed to `recipient`, oldest first.
    async fn read_messages(&self, recipient: &str) -> Result<Vec<AgentMessage>>;

    async fn update_shared_state(&self, key: &str, value: Value) -> Result<()>;

    async fn get_shared_state(&self, key: &str) -> Result<Option<Value>>;
}

#[derive(Default)]
struct Mailboxes {
    inbox: HashMap<String, Vec<AgentMessage>>,
    shared: HashMap<String, Value>,
}

/// Process-local transport.
#[derive(Default)]
pub struct InMemoryTransport {
    inner: Mutex<Mailboxes>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, recipient: &str) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .inbox
            .get(recipient)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl AgentTransport for InMemoryTransport {
    async fn send_message(&self, message: AgentMessage) -> Result<()> {
        if message.to.is_empty() {
            warn!(from = %message.from, kind = %message.kind, "Dropping message without recipient");
            return Err(anyhow!("message {} has no recipient", message.id));
        }
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .inbox
            .entry(message.to.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn read_messages(&self, recipient: &str) -> Result<Vec<AgentMessage>> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .inbox
            .remove(recipient)
            .unwrap_or_default())
    }

    async fn update_shared_state(&self, key: &str, value: Value) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shared
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get_shared_state(&self, key: &str) -> Result<Option<Value>> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shared
            .get(key)
            .cloned())
    }
}
