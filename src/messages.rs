//! Per-thread message logs with optimistic sends.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::gateway::{Gateway, GatewayError};
use crate::models::{Id, Message, MessageStatus, NewMessage};
use crate::threads::ThreadRegistry;

#[derive(Default)]
struct MessageLog {
    threads: HashMap<Id, Vec<Message>>, // ascending created_at
    index: HashMap<Id, Id>,             // message -> thread
    loaded: HashSet<Id>,
}

impl MessageLog {
    fn position(&self, message_id: Id) -> Option<(Id, usize)> {
        let thread_id = *self.index.get(&message_id)?;
        let pos = self.threads.get(&thread_id)?.iter().position(|m| m.id == message_id)?;
        Some((thread_id, pos))
    }

    fn get_mut(&mut self, message_id: Id) -> Option<&mut Message> {
        let (thread_id, pos) = self.position(message_id)?;
        self.threads.get_mut(&thread_id).map(|v| &mut v[pos])
    }

    /// False when the id was already present; the copy is refreshed instead.
    fn insert(&mut self, message: Message) -> bool {
        if let Some(existing) = self.get_mut(message.id) {
            refresh(existing, message);
            return false;
        }
        let log = self.threads.entry(message.thread_id).or_default();
        let at = log.partition_point(|m| m.created_at <= message.created_at);
        self.index.insert(message.id, message.thread_id);
        log.insert(at, message);
        true
    }

    fn remove(&mut self, message_id: Id) -> Option<Message> {
        let (thread_id, pos) = self.position(message_id)?;
        self.index.remove(&message_id);
        self.threads.get_mut(&thread_id).map(|v| v.remove(pos))
    }
}

// content follows the newer copy, status never regresses
fn refresh(existing: &mut Message, newer: Message) {
    existing.text = newer.text;
    existing.image_keys = newer.image_keys;
    existing.edited_at = newer.edited_at.or(existing.edited_at);
    existing.status = existing.status.max(newer.status);
}

pub struct MessageStore {
    gateway: Arc<dyn Gateway>,
    user_id: Id,
    page_limit: Option<usize>,
    log: Mutex<MessageLog>,
}

impl MessageStore {
    pub fn new(gateway: Arc<dyn Gateway>, user_id: Id, page_limit: Option<usize>) -> Self {
        Self { gateway, user_id, page_limit, log: Mutex::new(MessageLog::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, MessageLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Messages of a thread, oldest first. Fetched on first access.
    pub async fn list_messages(&self, thread_id: Id) -> ChatResult<Vec<Message>> {
        if self.is_loaded(thread_id) {
            return Ok(self.cached_messages(thread_id));
        }
        let fetched = self.gateway.list_messages(thread_id, self.page_limit).await?;
        debug!(thread = %thread_id, count = fetched.len(), "messages loaded");
        let mut log = self.lock();
        for m in fetched.into_iter().filter(|m| !m.is_empty()) {
            log.insert(m);
        }
        log.loaded.insert(thread_id);
        Ok(log.threads.get(&thread_id).cloned().unwrap_or_default())
    }

    pub fn cached_messages(&self, thread_id: Id) -> Vec<Message> {
        self.lock().threads.get(&thread_id).cloned().unwrap_or_default()
    }

    pub fn is_loaded(&self, thread_id: Id) -> bool {
        self.lock().loaded.contains(&thread_id)
    }

    /// Force a fetch on the next `list_messages`, for one thread or all.
    /// Cached entries stay; the fetch merges into them.
    pub fn mark_stale(&self, thread_id: Option<Id>) -> usize {
        let mut log = self.lock();
        match thread_id {
            Some(id) => usize::from(log.loaded.remove(&id)),
            None => {
                let n = log.loaded.len();
                log.loaded.clear();
                n
            }
        }
    }

    pub fn get(&self, message_id: Id) -> Option<Message> {
        let mut log = self.lock();
        log.get_mut(message_id).map(|m| m.clone())
    }

    /// Idempotent by id. Returns true only for a message not seen before.
    pub fn append_message(&self, message: Message) -> bool {
        self.lock().insert(message)
    }

    /// Validate and show the message locally before the backend confirms it.
    pub fn begin_send(
        &self,
        threads: &ThreadRegistry,
        thread_id: Id,
        text: Option<String>,
        image_keys: Vec<String>,
    ) -> ChatResult<PendingMessage> {
        let request = NewMessage { thread_id, text, image_keys };
        if request.is_empty() {
            return Err(ChatError::Validation("a message needs text or at least one image".into()));
        }
        if !threads.contains(thread_id) {
            return Err(ChatError::NotFound("thread"));
        }
        let now = Utc::now();
        let local = Message {
            id: Uuid::new_v4(),
            thread_id,
            sender_id: self.user_id,
            text: request.text.clone(),
            image_keys: request.image_keys.clone(),
            status: MessageStatus::Sent,
            created_at: now,
            edited_at: None,
        };
        let local_id = local.id;
        self.append_message(local);
        let previous_activity = threads.touch(thread_id, now).flatten();
        Ok(PendingMessage { local_id, optimistic_at: now, previous_activity, request })
    }

    pub async fn send_message(
        &self,
        threads: &ThreadRegistry,
        thread_id: Id,
        text: Option<String>,
        image_keys: Vec<String>,
    ) -> ChatResult<Message> {
        let pending = self.begin_send(threads, thread_id, text, image_keys)?;
        match self.gateway.send_message(pending.request().clone()).await {
            Ok(message) => Ok(pending.confirm(self, threads, message)),
            Err(e) => {
                warn!(thread = %thread_id, error = %e, "send failed, rolling back");
                pending.rollback(self, threads);
                Err(e.into())
            }
        }
    }

    /// Only text-only messages of our own can be edited.
    pub async fn edit_message(&self, message_id: Id, new_text: String) -> ChatResult<Message> {
        let current = self.get(message_id).ok_or(ChatError::NotFound("message"))?;
        if current.sender_id != self.user_id {
            return Err(ChatError::InvalidState("only the sender can edit a message".into()));
        }
        if current.has_images() {
            return Err(ChatError::InvalidState("messages with images cannot be edited".into()));
        }
        if new_text.trim().is_empty() {
            return Err(ChatError::Validation("edited text must not be empty".into()));
        }
        let updated = self.gateway.edit_message(message_id, new_text).await?;
        self.apply_update(updated.clone());
        Ok(self.get(message_id).unwrap_or(updated))
    }

    /// Gone on the server already counts as deleted.
    pub async fn delete_message(&self, message_id: Id) -> ChatResult<bool> {
        match self.gateway.delete_message(message_id).await {
            Ok(_) | Err(GatewayError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.remove(message_id).is_some())
    }

    /// Returns the surviving message, `None` when it went with its last image.
    pub async fn delete_message_image(&self, message_id: Id, image_key: &str) -> ChatResult<Option<Message>> {
        let remote = match self.gateway.delete_message_image(message_id, image_key).await {
            Ok(m) => m,
            Err(GatewayError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        match remote {
            Some(message) => {
                self.apply_update(message);
                Ok(self.get(message_id))
            }
            None => {
                self.remove(message_id);
                Ok(None)
            }
        }
    }

    /// Forward-only. A regression is ignored and reported as `false`.
    pub fn mark_status(&self, message_id: Id, status: MessageStatus) -> bool {
        let mut log = self.lock();
        match log.get_mut(message_id) {
            Some(m) if status > m.status => {
                m.status = status;
                true
            }
            _ => false,
        }
    }

    /// Replace content of a known message; drops it if nothing is left.
    pub fn apply_update(&self, message: Message) -> bool {
        let mut log = self.lock();
        let id = message.id;
        let Some(existing) = log.get_mut(id) else { return false };
        refresh(existing, message);
        if existing.is_empty() {
            log.remove(id);
        }
        true
    }

    /// Mark `author`'s messages up to `up_to` as read. Returns how many moved.
    pub fn mark_read_through(&self, thread_id: Id, author: Id, up_to: DateTime<Utc>) -> usize {
        let mut log = self.lock();
        let Some(messages) = log.threads.get_mut(&thread_id) else { return 0 };
        let mut moved = 0;
        for m in messages.iter_mut() {
            if m.sender_id == author && m.created_at <= up_to && m.status < MessageStatus::Read {
                m.status = MessageStatus::Read;
                moved += 1;
            }
        }
        moved
    }

    /// Incoming messages after `last_read_at`; `None` if the thread isn't cached.
    pub fn count_unread(&self, thread_id: Id, viewer: Id, last_read_at: Option<DateTime<Utc>>) -> Option<u32> {
        let log = self.lock();
        if !log.loaded.contains(&thread_id) {
            return None;
        }
        let count = log.threads.get(&thread_id).map(|v| {
            v.iter()
                .filter(|m| m.sender_id != viewer)
                .filter(|m| last_read_at.map_or(true, |r| m.created_at > r))
                .count()
        });
        Some(count.unwrap_or(0) as u32)
    }

    pub fn last_message_id(&self, thread_id: Id) -> Option<Id> {
        self.lock().threads.get(&thread_id).and_then(|v| v.last()).map(|m| m.id)
    }

    pub fn remove(&self, message_id: Id) -> Option<Message> {
        self.lock().remove(message_id)
    }

    pub fn remove_thread(&self, thread_id: Id) {
        let mut log = self.lock();
        if let Some(messages) = log.threads.remove(&thread_id) {
            for m in messages {
                log.index.remove(&m.id);
            }
        }
        log.loaded.remove(&thread_id);
    }
}

/// A locally shown message waiting for the backend.
#[must_use = "an optimistic message must be confirmed or rolled back"]
#[derive(Debug)]
pub struct PendingMessage {
    local_id: Id,
    optimistic_at: DateTime<Utc>,
    previous_activity: Option<DateTime<Utc>>,
    request: NewMessage,
}

impl PendingMessage {
    pub fn local_id(&self) -> Id {
        self.local_id
    }

    pub fn request(&self) -> &NewMessage {
        &self.request
    }

    /// Swap the local copy for the authoritative one.
    pub fn confirm(self, store: &MessageStore, threads: &ThreadRegistry, message: Message) -> Message {
        {
            let mut log = store.lock();
            log.remove(self.local_id);
            log.insert(message.clone());
        }
        let settled = self.previous_activity.map_or(message.created_at, |p| p.max(message.created_at));
        if !threads.replace_activity(message.thread_id, self.optimistic_at, Some(settled)) {
            threads.touch(message.thread_id, message.created_at);
        }
        message
    }

    /// Withdraw the local copy and restore thread activity.
    pub fn rollback(self, store: &MessageStore, threads: &ThreadRegistry) {
        store.remove(self.local_id);
        threads.replace_activity(self.request.thread_id, self.optimistic_at, self.previous_activity);
        metrics::counter!("chat_optimistic_rollbacks_total", 1);
    }
}
