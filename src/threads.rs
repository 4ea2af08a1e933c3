use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::block_list::BlockListFilter;
use crate::error::ChatResult;
use crate::gateway::{Gateway, GatewayError};
use crate::messages::MessageStore;
use crate::models::{Id, Thread};

#[derive(Default)]
struct Registry {
    threads: Vec<Thread>, // insertion order; front = most recently opened
    active: Option<Id>,
    // last activity covered by the server's unread_count
    synced: HashMap<Id, DateTime<Utc>>,
}

impl Registry {
    fn find(&mut self, id: Id) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|t| t.id == id)
    }
}

/// The viewer's conversation threads.
pub struct ThreadRegistry {
    gateway: Arc<dyn Gateway>,
    user_id: Id,
    inner: Mutex<Registry>,
}

impl ThreadRegistry {
    pub fn new(gateway: Arc<dyn Gateway>, user_id: Id) -> Self {
        Self { gateway, user_id, inner: Mutex::new(Registry::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Visible threads, latest activity first, threads without messages last.
    pub fn list_threads(&self, blocks: &BlockListFilter) -> Vec<Thread> {
        let blocked = blocks.snapshot();
        let mut v: Vec<Thread> = self.lock().threads.iter()
            .filter(|t| !blocked.contains(&t.counterpart(self.user_id)))
            .cloned()
            .collect();
        v.sort_by(by_activity); // stable: ties keep registry order
        v
    }

    pub fn get(&self, thread_id: Id) -> Option<Thread> {
        self.lock().threads.iter().find(|t| t.id == thread_id).cloned()
    }

    pub fn contains(&self, thread_id: Id) -> bool {
        self.lock().threads.iter().any(|t| t.id == thread_id)
    }

    /// Merge by id. Server fields win; activity timestamps never move back.
    pub fn upsert_thread(&self, thread: Thread) -> Thread {
        let mut r = self.lock();
        if let (false, Some(at)) = (thread.placeholder, thread.last_message_at) {
            let synced = r.synced.entry(thread.id).or_insert(at);
            *synced = (*synced).max(at);
        }
        match r.threads.iter().position(|t| t.id == thread.id) {
            Some(pos) => {
                let existing = &mut r.threads[pos];
                let merged = Thread {
                    last_message_at: latest(existing.last_message_at, thread.last_message_at),
                    last_read_at: latest(existing.last_read_at, thread.last_read_at),
                    placeholder: existing.placeholder && thread.placeholder,
                    ..thread
                };
                *existing = merged.clone();
                merged
            }
            None => {
                r.threads.push(thread.clone());
                thread
            }
        }
    }

    /// Full reload. Placeholders survive until the server knows them.
    pub async fn refresh(&self) -> ChatResult<Vec<Thread>> {
        let fetched = self.gateway.list_threads().await?;
        let ids: HashSet<Id> = fetched.iter().map(|t| t.id).collect();
        self.lock().threads.retain(|t| t.placeholder || ids.contains(&t.id));
        let count = fetched.len();
        for thread in fetched {
            self.upsert_thread(thread);
        }
        debug!(count, "thread list refreshed");
        Ok(self.lock().threads.clone())
    }

    /// The thread also moves to the front of the registry order, which
    /// `list_threads` keeps among threads with equal activity.
    pub async fn get_or_create_thread(&self, listing_id: Id, seller_id: Option<Id>) -> ChatResult<Id> {
        let thread = self.gateway.get_or_create_thread(listing_id, seller_id).await?;
        let id = thread.id;
        self.upsert_thread(thread);
        let mut r = self.lock();
        if let Some(pos) = r.threads.iter().position(|t| t.id == id) {
            let t = r.threads.remove(pos);
            r.threads.insert(0, t);
        }
        Ok(id)
    }

    /// Returns the previously active thread.
    pub fn set_active_thread(&self, thread_id: Option<Id>) -> Option<Id> {
        std::mem::replace(&mut self.lock().active, thread_id)
    }

    pub fn active_thread(&self) -> Option<Id> {
        self.lock().active
    }

    pub fn is_active(&self, thread_id: Id) -> bool {
        self.lock().active == Some(thread_id)
    }

    pub async fn delete_thread(&self, messages: &MessageStore, thread_id: Id) -> ChatResult<()> {
        match self.gateway.delete_thread(thread_id).await {
            Ok(_) | Err(GatewayError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        self.forget(thread_id);
        messages.remove_thread(thread_id);
        Ok(())
    }

    /// Local removal only. No-op for unknown ids.
    pub fn forget(&self, thread_id: Id) -> bool {
        let mut r = self.lock();
        if r.active == Some(thread_id) {
            r.active = None;
        }
        r.synced.remove(&thread_id);
        let before = r.threads.len();
        r.threads.retain(|t| t.id != thread_id);
        before != r.threads.len()
    }

    /// Insert a placeholder for an unknown thread. True when one was created.
    pub fn ensure_thread(&self, thread_id: Id, counterpart: Id) -> bool {
        let mut r = self.lock();
        if r.threads.iter().any(|t| t.id == thread_id) {
            return false;
        }
        r.threads.push(Thread::placeholder(thread_id, self.user_id, counterpart));
        true
    }

    /// Bump activity; returns the previous value, `None` for unknown threads.
    pub fn touch(&self, thread_id: Id, at: DateTime<Utc>) -> Option<Option<DateTime<Utc>>> {
        let mut r = self.lock();
        let t = r.find(thread_id)?;
        let previous = t.last_message_at;
        t.last_message_at = latest(previous, Some(at));
        Some(previous)
    }

    /// Set activity to `value` only if it still reads `expected`.
    pub fn replace_activity(&self, thread_id: Id, expected: DateTime<Utc>, value: Option<DateTime<Utc>>) -> bool {
        let mut r = self.lock();
        match r.find(thread_id) {
            Some(t) if t.last_message_at == Some(expected) => {
                t.last_message_at = value;
                true
            }
            _ => false,
        }
    }

    /// Count a counterpart message as unread. A message no later than the
    /// last server snapshot is already part of its count; returns false then.
    pub fn note_incoming(&self, thread_id: Id, at: DateTime<Utc>) -> bool {
        let mut r = self.lock();
        let counted = r.synced.get(&thread_id).map_or(true, |synced| at > *synced);
        let Some(t) = r.find(thread_id) else { return false };
        t.last_message_at = latest(t.last_message_at, Some(at));
        if counted {
            t.unread_count = t.unread_count.saturating_add(1);
        }
        counted
    }

    pub fn mark_read_local(&self, thread_id: Id, at: DateTime<Utc>) {
        if let Some(t) = self.lock().find(thread_id) {
            t.unread_count = 0;
            t.last_read_at = latest(t.last_read_at, Some(at));
        }
    }

    pub fn set_last_read(&self, thread_id: Id, at: DateTime<Utc>) {
        if let Some(t) = self.lock().find(thread_id) {
            t.last_read_at = latest(t.last_read_at, Some(at));
        }
    }

    pub fn set_unread(&self, thread_id: Id, count: u32) {
        if let Some(t) = self.lock().find(thread_id) {
            t.unread_count = count;
        }
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn by_activity(a: &Thread, b: &Thread) -> Ordering {
    match (a.last_message_at, b.last_message_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
