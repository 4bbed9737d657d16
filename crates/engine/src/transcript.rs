//! Transcript aggregation: coalesces streaming deltas into per-turn messages.
//!
//! Deltas land in a per-message buffer and are committed to the message's
//! streaming text once per frame tick, bounding update frequency under bursty
//! delta streams. Finalization drains the buffer so the committed text is the
//! exact concatenation of all deltas in arrival order.

use chrono::{DateTime, Utc};
use parla_core::translate::AlignmentPair;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, watch};
use tracing::debug;
use uuid::Uuid;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversation turn.
#[derive(Serialize, Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub lang: String,
    /// Committed text, set when the turn finalizes.
    pub text_final: String,
    /// Uncommitted streaming text.
    pub text_stream: String,
    pub translation: Option<String>,
    pub alignment_pairs: Vec<AlignmentPair>,
    pub done: bool,
    pub has_audio: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// The text a reader currently sees: final if committed, else streaming.
    pub fn display_text(&self) -> &str {
        if self.done {
            &self.text_final
        } else {
            &self.text_stream
        }
    }
}

#[derive(Default)]
struct Inner {
    messages: Vec<Message>,
    buffers: HashMap<Uuid, String>,
}

impl Inner {
    fn find_mut(&mut self, id: Uuid) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

/// Coalescing store for the session transcript.
pub struct TranscriptAggregator {
    inner: RwLock<Inner>,
    revision: watch::Sender<u64>,
}

impl TranscriptAggregator {
    pub fn new() -> Arc<Self> {
        let (revision, _) = watch::channel(0);
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            revision,
        })
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Observers are notified (with a monotonically increasing revision)
    /// whenever committed state changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Inserts a complete user message. Returns false when the id is already
    /// present (messages are never duplicated).
    pub async fn insert_user(
        &self,
        id: Uuid,
        lang: String,
        text: String,
        created_at: DateTime<Utc>,
    ) -> bool {
        let mut inner = self.inner.write().await;
        if inner.messages.iter().any(|m| m.id == id) {
            return false;
        }
        inner.messages.push(Message {
            id,
            role: Role::User,
            lang,
            text_final: text,
            text_stream: String::new(),
            translation: None,
            alignment_pairs: Vec::new(),
            done: true,
            has_audio: false,
            created_at,
        });
        drop(inner);
        self.bump();
        true
    }

    /// Inserts an empty assistant message that subsequent deltas stream into.
    pub async fn insert_assistant(&self, id: Uuid, lang: String, created_at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.write().await;
        if inner.messages.iter().any(|m| m.id == id) {
            return false;
        }
        inner.messages.push(Message {
            id,
            role: Role::Assistant,
            lang,
            text_final: String::new(),
            text_stream: String::new(),
            translation: None,
            alignment_pairs: Vec::new(),
            done: false,
            has_audio: false,
            created_at,
        });
        drop(inner);
        self.bump();
        true
    }

    /// Buffers a streaming delta. Nothing is committed until the next frame
    /// flush or finalization.
    pub async fn append_delta(&self, id: Uuid, delta: &str) {
        let mut inner = self.inner.write().await;
        inner.buffers.entry(id).or_default().push_str(delta);
    }

    /// Commits every buffered delta in one mutation. Called once per frame
    /// tick.
    pub async fn flush_frame(&self) {
        let mut inner = self.inner.write().await;
        if inner.buffers.is_empty() {
            return;
        }
        let buffers = std::mem::take(&mut inner.buffers);
        let mut committed = false;
        for (id, buffered) in buffers {
            match inner.find_mut(id) {
                Some(message) if !message.done => {
                    message.text_stream.push_str(&buffered);
                    committed = true;
                }
                _ => debug!(%id, "dropping buffered delta for unknown or done message"),
            }
        }
        drop(inner);
        if committed {
            self.bump();
        }
    }

    /// Finalizes a message: drains any remaining buffer into the stream and
    /// commits it as `text_final`. Idempotent. `fallback` is used only when
    /// no deltas were ever received.
    pub async fn finalize(&self, id: Uuid, fallback: Option<&str>) {
        let mut inner = self.inner.write().await;
        let remainder = inner.buffers.remove(&id).unwrap_or_default();
        let Some(message) = inner.find_mut(id) else {
            return;
        };
        if message.done {
            return;
        }
        message.text_stream.push_str(&remainder);
        message.text_final = std::mem::take(&mut message.text_stream);
        if message.text_final.is_empty() {
            if let Some(fallback) = fallback {
                message.text_final = fallback.to_string();
            }
        }
        message.done = true;
        drop(inner);
        self.bump();
    }

    pub async fn set_translation(
        &self,
        id: Uuid,
        translation: String,
        pairs: Vec<AlignmentPair>,
    ) {
        let mut inner = self.inner.write().await;
        if let Some(message) = inner.find_mut(id) {
            message.translation = Some(translation);
            message.alignment_pairs = pairs;
            drop(inner);
            self.bump();
        }
    }

    pub async fn mark_audio(&self, id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(message) = inner.find_mut(id) {
            message.has_audio = true;
            drop(inner);
            self.bump();
        }
    }

    pub async fn message(&self, id: Uuid) -> Option<Message> {
        self.inner
            .read()
            .await
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// Display-ordered snapshot: timestamp-sorted, insertion order breaking
    /// ties.
    pub async fn snapshot(&self) -> Vec<Message> {
        let inner = self.inner.read().await;
        let mut messages = inner.messages.clone();
        messages.sort_by_key(|m| m.created_at);
        messages
    }

    /// Drops in-flight delta buffers. Committed messages survive so a
    /// reconnect keeps the visible transcript.
    pub async fn clear_buffers(&self) {
        self.inner.write().await.buffers.clear();
    }

    pub async fn buffered_count(&self) -> usize {
        self.inner.read().await.buffers.len()
    }
}
