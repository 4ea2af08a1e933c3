use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::block_list::BlockListFilter;
use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult};
use crate::feed::ChangeFeed;
use crate::gateway::{Gateway, GatewayFactory};
use crate::messages::MessageStore;
use crate::models::{Id, Message, Thread, UploadTicket};
use crate::presence::{PresenceChannel, PresenceTracker};
use crate::router::ChangeEventRouter;
use crate::threads::ThreadRegistry;
use crate::unread::UnreadCounter;

/// State shared by the session and its event router.
pub struct ChatCore {
    pub user_id: Id,
    pub gateway: Arc<dyn Gateway>,
    pub threads: ThreadRegistry,
    pub messages: MessageStore,
    pub blocks: BlockListFilter,
    pub unread: UnreadCounter,
}

impl ChatCore {
    pub fn new(user_id: Id, gateway: Arc<dyn Gateway>, config: &ChatConfig) -> Self {
        Self {
            user_id,
            threads: ThreadRegistry::new(gateway.clone(), user_id),
            messages: MessageStore::new(gateway.clone(), user_id, config.message_page_limit),
            blocks: BlockListFilter::new(gateway.clone()),
            unread: UnreadCounter::new(gateway.clone()),
            gateway,
        }
    }

    pub fn recompute_unread(&self) -> u64 {
        self.unread.recompute(&self.threads, &self.blocks)
    }
}

/// One user's live chat state: thread list, message logs, feeds, presence.
pub struct ChatSession {
    core: Arc<ChatCore>,
    router: ChangeEventRouter,
    presence: PresenceTracker,
    // held across a whole active-thread switch
    switch: Mutex<()>,
}

impl ChatSession {
    pub async fn start(
        user_id: Id,
        gateway: Arc<dyn Gateway>,
        feed: Arc<dyn ChangeFeed>,
        presence: Arc<dyn PresenceChannel>,
        config: &ChatConfig,
    ) -> ChatResult<Self> {
        let core = Arc::new(ChatCore::new(user_id, gateway, config));
        // subscribe before loading so nothing slips between the two
        let router = ChangeEventRouter::start(core.clone(), feed).await?;
        core.blocks.load_blocked().await?;
        let threads = core.threads.refresh().await?;
        let unread = core.recompute_unread();
        info!(user = %user_id, threads = threads.len(), unread, "chat session started");
        Ok(Self {
            core,
            router,
            presence: PresenceTracker::new(user_id, presence, config),
            switch: Mutex::new(()),
        })
    }

    pub fn user_id(&self) -> Id {
        self.core.user_id
    }

    pub fn core(&self) -> &Arc<ChatCore> {
        &self.core
    }

    pub fn list_threads(&self) -> Vec<Thread> {
        self.core.threads.list_threads(&self.core.blocks)
    }

    /// Reload threads. On a transport failure the cached list is returned.
    pub async fn refresh_threads(&self) -> ChatResult<Vec<Thread>> {
        match self.core.threads.refresh().await {
            Ok(_) => {
                self.core.recompute_unread();
            }
            Err(ChatError::AuthExpired) => return Err(ChatError::AuthExpired),
            Err(e) => debug!(error = %e, "thread refresh failed, serving cache"),
        }
        Ok(self.list_threads())
    }

    pub async fn get_or_create_thread(&self, listing_id: Id, seller_id: Option<Id>) -> ChatResult<Id> {
        self.core.threads.get_or_create_thread(listing_id, seller_id).await
    }

    /// Switch the active thread, rebinding the thread feed and presence.
    /// Returns the previously active thread.
    pub async fn set_active_thread(&self, thread_id: Option<Id>) -> ChatResult<Option<Id>> {
        let _switching = self.switch.lock().await;
        self.switch_active(thread_id).await
    }

    // callers hold `switch`
    async fn switch_active(&self, thread_id: Option<Id>) -> ChatResult<Option<Id>> {
        if let Some(id) = thread_id {
            if !self.core.threads.contains(id) {
                return Err(ChatError::NotFound("thread"));
            }
        }
        let previous = self.core.threads.active_thread();
        if previous == thread_id {
            return Ok(previous);
        }
        match thread_id {
            Some(id) => self.router.bind_thread(id).await?,
            None => {
                self.router.unbind_thread();
            }
        }
        self.core.threads.set_active_thread(thread_id);
        if let Some(prev) = previous {
            self.presence.unsubscribe(prev);
        }
        if let Some(id) = thread_id {
            self.presence.subscribe(id);
        }
        Ok(previous)
    }

    pub fn active_thread(&self) -> Option<Id> {
        self.core.threads.active_thread()
    }

    pub async fn delete_thread(&self, thread_id: Id) -> ChatResult<()> {
        let _switching = self.switch.lock().await;
        if self.active_thread() == Some(thread_id) {
            self.switch_active(None).await?;
        }
        self.core.threads.delete_thread(&self.core.messages, thread_id).await?;
        self.core.recompute_unread();
        Ok(())
    }

    pub async fn list_messages(&self, thread_id: Id) -> ChatResult<Vec<Message>> {
        self.core.messages.list_messages(thread_id).await
    }

    pub async fn send_message(&self, thread_id: Id, text: Option<String>, image_keys: Vec<String>) -> ChatResult<Message> {
        self.core.messages.send_message(&self.core.threads, thread_id, text, image_keys).await
    }

    pub async fn edit_message(&self, message_id: Id, text: String) -> ChatResult<Message> {
        self.core.messages.edit_message(message_id, text).await
    }

    pub async fn delete_message(&self, message_id: Id) -> ChatResult<bool> {
        self.core.messages.delete_message(message_id).await
    }

    pub async fn delete_message_image(&self, message_id: Id, image_key: &str) -> ChatResult<Option<Message>> {
        self.core.messages.delete_message_image(message_id, image_key).await
    }

    /// Mark everything currently in the thread as read.
    pub async fn mark_thread_read(&self, thread_id: Id) -> ChatResult<()> {
        let thread = self.core.threads.get(thread_id).ok_or(ChatError::NotFound("thread"))?;
        let up_to = self.core.messages.last_message_id(thread_id);
        self.core.gateway.mark_thread_read(thread_id, up_to).await?;
        let read_at = up_to
            .and_then(|id| self.core.messages.get(id))
            .map(|m| m.created_at)
            .or(thread.last_message_at)
            .unwrap_or_else(Utc::now);
        self.core.threads.mark_read_local(thread_id, read_at);
        self.core.recompute_unread();
        Ok(())
    }

    /// The badge follows the optimistic change and again the outcome.
    pub async fn block_user(&self, user_id: Id) -> ChatResult<()> {
        self.set_blocked(user_id, true).await
    }

    pub async fn unblock_user(&self, user_id: Id) -> ChatResult<()> {
        self.set_blocked(user_id, false).await
    }

    async fn set_blocked(&self, user_id: Id, blocked: bool) -> ChatResult<()> {
        let changed = self.core.blocks.set_local(user_id, blocked);
        if changed {
            self.core.recompute_unread();
        }
        let result = self.core.blocks.persist(user_id, blocked, changed).await;
        self.core.recompute_unread();
        result
    }

    pub async fn reload_blocked(&self) -> ChatResult<Vec<Id>> {
        self.core.blocks.load_blocked().await?;
        self.core.recompute_unread();
        Ok(self.blocked_users())
    }

    pub fn blocked_users(&self) -> Vec<Id> {
        self.core.blocks.blocked_users()
    }

    pub fn is_blocked(&self, user_id: Id) -> bool {
        self.core.blocks.is_blocked(user_id)
    }

    pub fn broadcast_typing(&self, thread_id: Id) -> ChatResult<()> {
        if !self.core.threads.contains(thread_id) {
            return Err(ChatError::NotFound("thread"));
        }
        self.presence.broadcast_typing(thread_id);
        Ok(())
    }

    pub fn typing_peer(&self, thread_id: Id) -> Option<Id> {
        self.presence.typing_peer(thread_id)
    }

    pub fn unread_total(&self) -> u64 {
        self.core.unread.total()
    }

    pub fn watch_unread(&self) -> watch::Receiver<u64> {
        self.core.unread.watch()
    }

    pub async fn refresh_unread(&self) -> ChatResult<Option<u64>> {
        self.core.unread.refresh_from_server().await
    }

    pub async fn create_image_upload_url(&self) -> ChatResult<UploadTicket> {
        Ok(self.core.gateway.create_image_upload_url().await?)
    }

    /// Cancel feeds and presence timers. Also runs on drop.
    pub fn shutdown(&self) {
        self.router.shutdown();
        self.presence.shutdown();
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Live sessions keyed by user, created lazily on first use.
pub struct SessionManager {
    sessions: DashMap<Id, Arc<ChatSession>>,
    factory: Arc<dyn GatewayFactory>,
    feed: Arc<dyn ChangeFeed>,
    presence: Arc<dyn PresenceChannel>,
    config: ChatConfig,
}

impl SessionManager {
    pub fn new(
        factory: Arc<dyn GatewayFactory>,
        feed: Arc<dyn ChangeFeed>,
        presence: Arc<dyn PresenceChannel>,
        config: ChatConfig,
    ) -> Self {
        Self { sessions: DashMap::new(), factory, feed, presence, config }
    }

    pub async fn session(&self, user_id: Id, token: &str) -> ChatResult<Arc<ChatSession>> {
        if let Some(existing) = self.sessions.get(&user_id).map(|s| s.value().clone()) {
            return Ok(existing);
        }
        let gateway = self.factory.gateway_for(user_id, token);
        let started = ChatSession::start(user_id, gateway, self.feed.clone(), self.presence.clone(), &self.config).await?;
        // a concurrent request may have won; keep the first
        let session = self.sessions.entry(user_id).or_insert(Arc::new(started)).value().clone();
        metrics::gauge!("chat_sessions_active", self.sessions.len() as f64);
        Ok(session)
    }

    pub fn get(&self, user_id: Id) -> Option<Arc<ChatSession>> {
        self.sessions.get(&user_id).map(|s| s.value().clone())
    }

    pub fn end(&self, user_id: Id) -> bool {
        let Some((_, session)) = self.sessions.remove(&user_id) else { return false };
        session.shutdown();
        metrics::gauge!("chat_sessions_active", self.sessions.len() as f64);
        info!(user = %user_id, "chat session ended");
        true
    }

    /// Drop the session when its credentials are no longer accepted.
    pub fn end_if_expired(&self, user_id: Id, error: &ChatError) {
        if error.is_auth_expired() {
            self.end(user_id);
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}
