//! Ephemeral typing presence, one bound thread per session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use crate::config::ChatConfig;
use crate::models::{Id, PresenceSignal};

/// Lightweight pub/sub carrying presence signals per thread.
pub trait PresenceChannel: Send + Sync {
    fn join(&self, thread_id: Id) -> broadcast::Receiver<PresenceSignal>;
    /// Returns how many listeners received the signal.
    fn announce(&self, signal: PresenceSignal) -> usize;
}

#[derive(Clone)]
pub struct PresenceHub {
    channels: Arc<DashMap<Id, broadcast::Sender<PresenceSignal>>>,
    capacity: usize,
}

impl PresenceHub {
    pub fn new(capacity: usize) -> Self {
        Self { channels: Arc::new(DashMap::new()), capacity: capacity.max(1) }
    }
}

impl Default for PresenceHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl PresenceChannel for PresenceHub {
    fn join(&self, thread_id: Id) -> broadcast::Receiver<PresenceSignal> {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        self.channels
            .entry(thread_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    fn announce(&self, signal: PresenceSignal) -> usize {
        match self.channels.get(&signal.thread_id) {
            Some(tx) => tx.send(signal).unwrap_or(0),
            None => 0,
        }
    }
}

/// A single cancelable, restartable delayed callback.
#[derive(Default)]
pub struct TypingTimer {
    armed: Option<(Id, JoinHandle<()>)>,
}

impl TypingTimer {
    /// Cancel any pending callback and schedule `on_fire` after `delay`.
    pub fn reset<F>(&mut self, thread_id: Id, delay: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        let deadline = Instant::now() + delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_fire();
        });
        self.armed = Some((thread_id, handle));
    }

    /// Returns the thread the timer was armed for, if it had not fired yet.
    pub fn cancel(&mut self) -> Option<Id> {
        let (thread_id, handle) = self.armed.take()?;
        let pending = !handle.is_finished();
        handle.abort();
        pending.then_some(thread_id)
    }

    pub fn armed_for(&self) -> Option<Id> {
        self.armed.as_ref().filter(|(_, h)| !h.is_finished()).map(|(t, _)| *t)
    }
}

impl Drop for TypingTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Default)]
struct Peers {
    thread: Option<Id>,
    expiry: HashMap<Id, Instant>,
}

#[derive(Default)]
struct Binding {
    listener: Option<(Id, JoinHandle<()>)>,
    stop_timer: TypingTimer,
}

pub struct PresenceTracker {
    user_id: Id,
    channel: Arc<dyn PresenceChannel>,
    debounce: Duration,
    display_timeout: Duration,
    peers: Arc<Mutex<Peers>>,
    binding: Mutex<Binding>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PresenceTracker {
    pub fn new(user_id: Id, channel: Arc<dyn PresenceChannel>, config: &ChatConfig) -> Self {
        Self {
            user_id,
            channel,
            debounce: config.typing_debounce,
            display_timeout: config.typing_display_timeout,
            peers: Arc::new(Mutex::new(Peers::default())),
            binding: Mutex::new(Binding::default()),
        }
    }

    fn signal(&self, thread_id: Id, typing: bool) -> PresenceSignal {
        let ttl = chrono::Duration::from_std(self.display_timeout).unwrap_or_else(|_| chrono::Duration::seconds(3));
        PresenceSignal { thread_id, user_id: self.user_id, typing, expires_at: Utc::now() + ttl }
    }

    pub fn bound_thread(&self) -> Option<Id> {
        lock(&self.binding).listener.as_ref().map(|(t, _)| *t)
    }

    /// Bind presence to `thread_id`, releasing any previously bound thread.
    pub fn subscribe(&self, thread_id: Id) {
        let mut b = lock(&self.binding);
        if b.listener.as_ref().map(|(t, _)| *t) == Some(thread_id) {
            return;
        }
        if let Some(previous) = b.listener.as_ref().map(|(t, _)| *t) {
            self.release(&mut b, previous);
        }
        let mut rx = self.channel.join(thread_id);
        {
            let mut p = lock(&self.peers);
            p.thread = Some(thread_id);
            p.expiry.clear();
        }
        let peers = self.peers.clone();
        let me = self.user_id;
        let ttl = self.display_timeout;
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(s) if s.user_id != me && s.thread_id == thread_id => {
                        let mut p = lock(&peers);
                        if s.typing {
                            p.expiry.insert(s.user_id, Instant::now() + ttl);
                        } else {
                            p.expiry.remove(&s.user_id);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
        b.listener = Some((thread_id, handle));
        trace!(thread = %thread_id, "presence bound");
    }

    pub fn unsubscribe(&self, thread_id: Id) {
        let mut b = lock(&self.binding);
        self.release(&mut b, thread_id);
    }

    fn release(&self, b: &mut Binding, thread_id: Id) {
        if b.stop_timer.armed_for() == Some(thread_id) {
            b.stop_timer.cancel();
            self.channel.announce(self.signal(thread_id, false));
        }
        if b.listener.as_ref().map(|(t, _)| *t) == Some(thread_id) {
            if let Some((_, handle)) = b.listener.take() {
                handle.abort();
            }
            let mut p = lock(&self.peers);
            p.thread = None;
            p.expiry.clear();
        }
    }

    /// Announce typing now and a stop once the debounce window passes
    /// without another call.
    pub fn broadcast_typing(&self, thread_id: Id) {
        let mut b = lock(&self.binding);
        if let Some(other) = b.stop_timer.armed_for().filter(|t| *t != thread_id) {
            b.stop_timer.cancel();
            self.channel.announce(self.signal(other, false));
        }
        self.channel.announce(self.signal(thread_id, true));
        let channel = self.channel.clone();
        let stop = self.signal(thread_id, false);
        b.stop_timer.reset(thread_id, self.debounce, move || {
            channel.announce(stop);
        });
    }

    /// The other participant currently typing in `thread_id`, if any.
    pub fn typing_peer(&self, thread_id: Id) -> Option<Id> {
        let mut p = lock(&self.peers);
        if p.thread != Some(thread_id) {
            return None;
        }
        let now = Instant::now();
        p.expiry.retain(|_, expires| *expires > now);
        p.expiry.keys().next().copied()
    }

    /// Cancel the listener and any pending stop timer.
    pub fn shutdown(&self) {
        let mut b = lock(&self.binding);
        b.stop_timer.cancel();
        if let Some((_, handle)) = b.listener.take() {
            handle.abort();
        }
        let mut p = lock(&self.peers);
        p.thread = None;
        p.expiry.clear();
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
