//! Applies change events from the user and thread feeds to session state.
//!
//! Both feeds forward into one unbounded channel drained by a single
//! dispatch task, so a session applies events strictly in arrival order.
//! Rules:
//!
//! * an insert sent by the viewer is an echo and is dropped;
//! * an insert from the counterpart is appended once by id, bumps the
//!   thread's unread count and, on the active thread, is marked read;
//! * an update replaces the content of a known message;
//! * a participant update from the counterpart cascades read receipts onto
//!   the viewer's messages; one from the viewer syncs the read position.
//!
//! Any event for an unknown thread synthesizes a placeholder and triggers a
//! thread refresh in the background. A feed gap triggers the same refresh
//! and marks the affected message logs stale; messages queued behind the gap
//! that the refreshed counts already include are not counted again.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::ChatResult;
use crate::feed::{ChangeEvent, ChangeFeed, FeedItem, FeedScope, FeedSubscription};
use crate::models::{Id, Message, Participant};
use crate::session::ChatCore;

#[derive(Debug)]
enum RouterInput {
    Event { scope: FeedScope, event: ChangeEvent },
    Gap { scope: FeedScope, missed: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Appended,
    Duplicate,
    EchoSuppressed,
    Updated,
    Ignored,
    ReceiptsCascaded(usize),
    ReadPositionSynced,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Appended => "appended",
            Outcome::Duplicate => "duplicate",
            Outcome::EchoSuppressed => "echo",
            Outcome::Updated => "updated",
            Outcome::Ignored => "ignored",
            Outcome::ReceiptsCascaded(_) => "receipts",
            Outcome::ReadPositionSynced => "read-sync",
        }
    }
}

pub struct ChangeEventRouter {
    user_id: Id,
    feed: Arc<dyn ChangeFeed>,
    tx: mpsc::UnboundedSender<RouterInput>,
    dispatcher: JoinHandle<()>,
    global: JoinHandle<()>,
    scoped: Mutex<Option<(Id, JoinHandle<()>)>>,
}

impl ChangeEventRouter {
    /// Spawn the dispatch task and subscribe the viewer's user feed.
    pub async fn start(core: Arc<ChatCore>, feed: Arc<dyn ChangeFeed>) -> ChatResult<Self> {
        let user_id = core.user_id;
        let subscription = feed.subscribe(FeedScope::User(user_id)).await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(async move {
            while let Some(input) = rx.recv().await {
                match input {
                    RouterInput::Event { scope, event } => {
                        let kind = event.kind();
                        let outcome = apply(&core, event).await;
                        trace!(?scope, kind, ?outcome, "change applied");
                    }
                    RouterInput::Gap { scope, missed } => {
                        let thread = match scope {
                            FeedScope::Thread(id) => Some(id),
                            FeedScope::User(_) => None,
                        };
                        let stale = core.messages.mark_stale(thread);
                        warn!(?scope, missed, stale, "feed gap, resyncing");
                        refresh_threads(&core).await;
                    }
                }
            }
        });
        let global = forward(subscription, tx.clone());
        Ok(Self { user_id, feed, tx, dispatcher, global, scoped: Mutex::new(None) })
    }

    fn scoped(&self) -> MutexGuard<'_, Option<(Id, JoinHandle<()>)>> {
        self.scoped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bound_thread(&self) -> Option<Id> {
        self.scoped().as_ref().map(|(t, _)| *t)
    }

    /// Subscribe the thread feed for `thread_id`, replacing any previous one.
    pub async fn bind_thread(&self, thread_id: Id) -> ChatResult<()> {
        if self.bound_thread() == Some(thread_id) {
            return Ok(());
        }
        // a failed subscribe leaves the current binding in place
        let subscription = self.feed.subscribe(FeedScope::Thread(thread_id)).await?;
        let handle = forward(subscription, self.tx.clone());
        if let Some((_, stale)) = self.scoped().replace((thread_id, handle)) {
            stale.abort();
        }
        debug!(user = %self.user_id, thread = %thread_id, "thread feed bound");
        Ok(())
    }

    pub fn unbind_thread(&self) -> Option<Id> {
        let (thread_id, handle) = self.scoped().take()?;
        handle.abort();
        Some(thread_id)
    }

    pub fn shutdown(&self) {
        self.unbind_thread();
        self.global.abort();
        self.dispatcher.abort();
    }
}

impl Drop for ChangeEventRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn forward(mut subscription: FeedSubscription, tx: mpsc::UnboundedSender<RouterInput>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let scope = subscription.scope();
        while let Some(item) = subscription.next().await {
            let input = match item {
                FeedItem::Event(event) => RouterInput::Event { scope, event },
                FeedItem::Gap { missed } => RouterInput::Gap { scope, missed },
            };
            if tx.send(input).is_err() {
                break;
            }
        }
    })
}

/// Apply one event to the session. Also the entry point for tests.
pub async fn apply(core: &Arc<ChatCore>, event: ChangeEvent) -> Outcome {
    let outcome = match event {
        ChangeEvent::MessageInserted { message } => on_insert(core, message).await,
        ChangeEvent::MessageUpdated { message } => on_update(core, message),
        ChangeEvent::ParticipantUpdated { participant } => on_participant(core, participant),
    };
    metrics::counter!("chat_events_total", 1, "outcome" => outcome.label());
    outcome
}

async fn on_insert(core: &Arc<ChatCore>, message: Message) -> Outcome {
    if message.sender_id == core.user_id {
        return Outcome::EchoSuppressed;
    }
    if message.is_empty() {
        return Outcome::Ignored;
    }
    let (thread_id, message_id, created_at) = (message.thread_id, message.id, message.created_at);
    repair(core, thread_id, Some(message.sender_id));
    if !core.messages.append_message(message) {
        return Outcome::Duplicate;
    }
    core.threads.note_incoming(thread_id, created_at);
    if core.threads.is_active(thread_id) {
        if let Err(e) = core.gateway.mark_thread_read(thread_id, Some(message_id)).await {
            debug!(thread = %thread_id, message = %message_id, error = %e, "auto mark-read failed");
        }
        core.threads.mark_read_local(thread_id, created_at);
    }
    core.recompute_unread();
    Outcome::Appended
}

fn on_update(core: &Arc<ChatCore>, message: Message) -> Outcome {
    let counterpart = (message.sender_id != core.user_id).then_some(message.sender_id);
    repair(core, message.thread_id, counterpart);
    if core.messages.apply_update(message) {
        Outcome::Updated
    } else {
        Outcome::Ignored
    }
}

fn on_participant(core: &Arc<ChatCore>, participant: Participant) -> Outcome {
    let Participant { thread_id, user_id, last_read_at } = participant;
    repair(core, thread_id, (user_id != core.user_id).then_some(user_id));
    let Some(read_at) = last_read_at else { return Outcome::Ignored };
    if !core.threads.contains(thread_id) {
        return Outcome::Ignored;
    }
    if user_id != core.user_id {
        let moved = core.messages.mark_read_through(thread_id, core.user_id, read_at);
        core.recompute_unread();
        return Outcome::ReceiptsCascaded(moved);
    }

    core.threads.set_last_read(thread_id, read_at);
    let Some(thread) = core.threads.get(thread_id) else { return Outcome::Ignored };
    let unread = core.messages.count_unread(thread_id, core.user_id, thread.last_read_at).or_else(|| {
        // log not cached: only a read position past the last activity is conclusive
        let caught_up = thread.last_message_at.map_or(true, |at| at <= read_at);
        caught_up.then_some(0)
    });
    if let Some(count) = unread {
        core.threads.set_unread(thread_id, count);
    }
    core.recompute_unread();
    Outcome::ReadPositionSynced
}

/// Events for a thread not in the registry leave a placeholder behind when
/// the counterpart is known, and always trigger a background refresh.
fn repair(core: &Arc<ChatCore>, thread_id: Id, counterpart: Option<Id>) -> bool {
    if core.threads.contains(thread_id) {
        return false;
    }
    if let Some(other) = counterpart {
        core.threads.ensure_thread(thread_id, other);
    }
    info!(thread = %thread_id, "event for unknown thread, fetching metadata");
    let core = core.clone();
    tokio::spawn(async move { refresh_threads(&core).await });
    true
}

async fn refresh_threads(core: &ChatCore) {
    match core.threads.refresh().await {
        Ok(_) => {
            core.recompute_unread();
        }
        Err(e) => debug!(error = %e, "thread refresh failed"),
    }
}
