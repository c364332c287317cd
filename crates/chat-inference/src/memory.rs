// chat-inference/src/memory.rs

//! Conversation messages and the storage-side history interface.
//!
//! Persistence itself belongs to the caller; the core only consumes history
//! through [`MemoryStore`].

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

pub trait MemoryStore: Send + Sync {
    fn history(&self, session_id: &str) -> Vec<Message>;
    fn append(&self, session_id: &str, message: Message) -> anyhow::Result<()>;
    fn clear(&self, session_id: &str);
}

#[derive(Clone)]
pub struct InMemoryMemoryStore {
    store: Arc<DashMap<String, Vec<Message>>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self {
            store: Arc::new(DashMap::new()),
        }
    }
}

impl MemoryStore for InMemoryMemoryStore {
    fn history(&self, session_id: &str) -> Vec<Message> {
        match self.store.get(session_id) {
            Some(history) => history.clone(),
            None => Vec::new(),
        }
    }

    fn append(&self, session_id: &str, message: Message) -> anyhow::Result<()> {
        let mut entry = self.store.entry(session_id.to_string()).or_default();
        entry.push(message);
        Ok(())
    }

    fn clear(&self, session_id: &str) {
        self.store.remove(session_id);
    }
}

/// Appends a message, retrying failed writes with linear backoff.
///
/// Gives up after `attempts` tries and returns the last error; the caller's
/// in-memory conversation is never touched.
pub async fn append_with_retry(
    store: &dyn MemoryStore,
    session_id: &str,
    message: Message,
    attempts: u32,
    backoff: Duration,
) -> anyhow::Result<()> {
    let attempts = attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match store.append(session_id, message.clone()) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    "Saving message for session {} failed (attempt {}/{}): {}",
                    session_id, attempt, attempts, e
                );
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(backoff * attempt).await;
                }
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("message was not saved"))
        .context(format!("giving up on session {} after {} attempts", session_id, attempts)))
}
