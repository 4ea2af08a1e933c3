use std::sync::Arc;

use async_trait::async_trait;

use crate::models::*;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("not found")] NotFound,
    #[error("rejected: {0}")] Rejected(String),
    #[error("transport: {0}")] Transport(String),
    #[error("auth expired")] AuthExpired,
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[async_trait]
pub trait ThreadGateway: Send + Sync {
    async fn get_or_create_thread(&self, listing_id: Id, seller_id: Option<Id>) -> GatewayResult<Thread>;
    async fn list_threads(&self) -> GatewayResult<Vec<Thread>>;
    async fn delete_thread(&self, thread_id: Id) -> GatewayResult<bool>;
    async fn mark_thread_read(&self, thread_id: Id, up_to: Option<Id>) -> GatewayResult<bool>;
    async fn unread_count(&self) -> GatewayResult<u64>;
}

#[async_trait]
pub trait MessageGateway: Send + Sync {
    async fn send_message(&self, new: NewMessage) -> GatewayResult<Message>;
    async fn edit_message(&self, message_id: Id, text: String) -> GatewayResult<Message>;
    async fn delete_message(&self, message_id: Id) -> GatewayResult<bool>;
    /// `None` means the message itself was removed (last image, no text).
    async fn delete_message_image(&self, message_id: Id, image_key: &str) -> GatewayResult<Option<Message>>;
    async fn list_messages(&self, thread_id: Id, limit: Option<usize>) -> GatewayResult<Vec<Message>>;
}

#[async_trait]
pub trait BlockGateway: Send + Sync {
    async fn block_user(&self, blocked_user_id: Id) -> GatewayResult<BlockRelation>;
    async fn unblock_user(&self, blocked_user_id: Id) -> GatewayResult<bool>;
    async fn list_blocked_users(&self) -> GatewayResult<Vec<BlockRelation>>;
}

#[async_trait]
pub trait AssetGateway: Send + Sync {
    async fn create_image_upload_url(&self) -> GatewayResult<UploadTicket>;
}

/// Request/response surface of the backend, acting on behalf of one user.
pub trait Gateway: ThreadGateway + MessageGateway + BlockGateway + AssetGateway {}

impl<T> Gateway for T where T: ThreadGateway + MessageGateway + BlockGateway + AssetGateway {}

/// Builds a per-user gateway from the caller's credentials.
pub trait GatewayFactory: Send + Sync {
    fn gateway_for(&self, user_id: Id, token: &str) -> Arc<dyn Gateway>;
}

#[cfg(feature = "inmem-backend")]
pub mod inmem {
    use super::*;
    use std::collections::{HashMap, HashSet};

    use chrono::{DateTime, Duration, Utc};
    use tokio::sync::RwLock;
    use uuid::Uuid;

    use crate::feed::{ChangeEvent, FeedHub};

    #[derive(Debug, Clone)]
    struct StoredThread {
        id: Id,
        listing_id: Id,
        buyer_id: Id,
        seller_id: Id,
        last_message_at: Option<DateTime<Utc>>,
    }

    /// A `mark_thread_read` call as observed by the backend.
    #[derive(Debug, Clone, PartialEq)]
    pub struct ReadCall {
        pub user_id: Id,
        pub thread_id: Id,
        pub up_to: Option<Id>,
    }

    #[derive(Default)]
    struct State {
        listings: HashMap<Id, Id>, // listing -> seller
        threads: HashMap<Id, StoredThread>,
        messages: HashMap<Id, Message>,
        last_read: HashMap<(Id, Id), DateTime<Utc>>, // (thread, user)
        blocks: HashMap<Id, HashMap<Id, BlockRelation>>, // blocker -> blocked
        read_calls: Vec<ReadCall>,
        offline: bool,
        expired: HashSet<Id>,
    }

    /// Shared in-memory backend. Every mutation publishes the matching change
    /// event on its [`FeedHub`], the way the real store's replication would.
    #[derive(Clone)]
    pub struct InMemBackend {
        state: Arc<RwLock<State>>,
        hub: FeedHub,
    }

    impl InMemBackend {
        pub fn new(hub: FeedHub) -> Self {
            Self { state: Arc::new(RwLock::new(State::default())), hub }
        }

        pub fn hub(&self) -> FeedHub {
            self.hub.clone()
        }

        pub fn gateway(&self, user_id: Id) -> InMemGateway {
            InMemGateway { backend: self.clone(), user_id }
        }

        pub async fn register_listing(&self, listing_id: Id, seller_id: Id) {
            self.state.write().await.listings.insert(listing_id, seller_id);
        }

        /// Every call fails with a transport error while offline.
        pub async fn set_offline(&self, offline: bool) {
            self.state.write().await.offline = offline;
        }

        /// Calls made as `user_id` fail with `AuthExpired` from now on.
        pub async fn expire_auth(&self, user_id: Id) {
            self.state.write().await.expired.insert(user_id);
        }

        pub async fn read_calls(&self, user_id: Id) -> Vec<ReadCall> {
            let s = self.state.read().await;
            s.read_calls.iter().filter(|c| c.user_id == user_id).cloned().collect()
        }

        pub async fn message(&self, message_id: Id) -> Option<Message> {
            self.state.read().await.messages.get(&message_id).cloned()
        }

        fn check(s: &State, user_id: Id) -> GatewayResult<()> {
            if s.offline { return Err(GatewayError::Transport("backend offline".into())); }
            if s.expired.contains(&user_id) { return Err(GatewayError::AuthExpired); }
            Ok(())
        }

        fn participant_thread(s: &State, thread_id: Id, user_id: Id) -> GatewayResult<StoredThread> {
            match s.threads.get(&thread_id) {
                Some(t) if t.buyer_id == user_id || t.seller_id == user_id => Ok(t.clone()),
                _ => Err(GatewayError::NotFound),
            }
        }

        fn view(s: &State, t: &StoredThread, viewer: Id) -> Thread {
            let last_read_at = s.last_read.get(&(t.id, viewer)).copied();
            let unread_count = s.messages.values()
                .filter(|m| m.thread_id == t.id && m.sender_id != viewer)
                .filter(|m| last_read_at.map(|r| m.created_at > r).unwrap_or(true))
                .count() as u32;
            Thread {
                id: t.id,
                listing_id: t.listing_id,
                buyer_id: t.buyer_id,
                seller_id: t.seller_id,
                last_message_at: t.last_message_at,
                unread_count,
                last_read_at,
                placeholder: false,
            }
        }

        fn publish(&self, event: ChangeEvent, thread: &StoredThread) {
            self.hub.publish(&event, &[thread.buyer_id, thread.seller_id]);
        }
    }

    #[derive(Clone)]
    pub struct InMemGateway {
        backend: InMemBackend,
        user_id: Id,
    }

    impl InMemGateway {
        pub fn user_id(&self) -> Id {
            self.user_id
        }
    }

    impl GatewayFactory for InMemBackend {
        fn gateway_for(&self, user_id: Id, _token: &str) -> Arc<dyn Gateway> {
            Arc::new(self.gateway(user_id))
        }
    }

    #[async_trait]
    impl ThreadGateway for InMemGateway {
        async fn get_or_create_thread(&self, listing_id: Id, seller_id: Option<Id>) -> GatewayResult<Thread> {
            let mut s = self.backend.state.write().await;
            InMemBackend::check(&s, self.user_id)?;
            let seller_id = match seller_id.or_else(|| s.listings.get(&listing_id).copied()) {
                Some(id) => id,
                None => return Err(GatewayError::NotFound),
            };
            if seller_id == self.user_id {
                return Err(GatewayError::Rejected("cannot message your own listing".into()));
            }
            let existing = s.threads.values()
                .find(|t| t.listing_id == listing_id && t.buyer_id == self.user_id && t.seller_id == seller_id)
                .cloned();
            let thread = match existing {
                Some(t) => t,
                None => {
                    let t = StoredThread {
                        id: Uuid::new_v4(),
                        listing_id,
                        buyer_id: self.user_id,
                        seller_id,
                        last_message_at: None,
                    };
                    s.threads.insert(t.id, t.clone());
                    t
                }
            };
            Ok(InMemBackend::view(&s, &thread, self.user_id))
        }

        async fn list_threads(&self) -> GatewayResult<Vec<Thread>> {
            let s = self.backend.state.read().await;
            InMemBackend::check(&s, self.user_id)?;
            let mut v: Vec<_> = s.threads.values()
                .filter(|t| t.buyer_id == self.user_id || t.seller_id == self.user_id)
                .map(|t| InMemBackend::view(&s, t, self.user_id))
                .collect();
            v.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at)); // latest first
            Ok(v)
        }

        async fn delete_thread(&self, thread_id: Id) -> GatewayResult<bool> {
            let mut s = self.backend.state.write().await;
            InMemBackend::check(&s, self.user_id)?;
            match InMemBackend::participant_thread(&s, thread_id, self.user_id) {
                Ok(_) => {
                    s.threads.remove(&thread_id);
                    s.messages.retain(|_, m| m.thread_id != thread_id);
                    s.last_read.retain(|(t, _), _| *t != thread_id);
                    Ok(true)
                }
                Err(GatewayError::NotFound) => Ok(false), // idempotent
                Err(e) => Err(e),
            }
        }

        async fn mark_thread_read(&self, thread_id: Id, up_to: Option<Id>) -> GatewayResult<bool> {
            let mut s = self.backend.state.write().await;
            InMemBackend::check(&s, self.user_id)?;
            let thread = InMemBackend::participant_thread(&s, thread_id, self.user_id)?;
            let read_at = up_to
                .and_then(|id| s.messages.get(&id))
                .map(|m| m.created_at)
                .unwrap_or_else(Utc::now);
            let previous = s.last_read.get(&(thread_id, self.user_id)).copied();
            let read_at = previous.map(|p| p.max(read_at)).unwrap_or(read_at);
            s.last_read.insert((thread_id, self.user_id), read_at);
            for m in s.messages.values_mut() {
                if m.thread_id == thread_id && m.sender_id != self.user_id && m.created_at <= read_at {
                    m.status = MessageStatus::Read;
                }
            }
            s.read_calls.push(ReadCall { user_id: self.user_id, thread_id, up_to });
            drop(s);
            let participant = Participant { thread_id, user_id: self.user_id, last_read_at: Some(read_at) };
            self.backend.publish(ChangeEvent::ParticipantUpdated { participant }, &thread);
            Ok(true)
        }

        async fn unread_count(&self) -> GatewayResult<u64> {
            let s = self.backend.state.read().await;
            InMemBackend::check(&s, self.user_id)?;
            let blocked = s.blocks.get(&self.user_id);
            let total = s.threads.values()
                .filter(|t| t.buyer_id == self.user_id || t.seller_id == self.user_id)
                .filter(|t| {
                    let other = if t.buyer_id == self.user_id { t.seller_id } else { t.buyer_id };
                    !blocked.map(|b| b.contains_key(&other)).unwrap_or(false)
                })
                .map(|t| InMemBackend::view(&s, t, self.user_id).unread_count as u64)
                .sum();
            Ok(total)
        }
    }

    #[async_trait]
    impl MessageGateway for InMemGateway {
        async fn send_message(&self, new: NewMessage) -> GatewayResult<Message> {
            if new.is_empty() {
                return Err(GatewayError::Rejected("message needs text or an image".into()));
            }
            let mut s = self.backend.state.write().await;
            InMemBackend::check(&s, self.user_id)?;
            let mut thread = InMemBackend::participant_thread(&s, new.thread_id, self.user_id)?;
            // keep created_at strictly increasing per thread
            let mut created_at = Utc::now();
            if let Some(last) = thread.last_message_at {
                if created_at <= last { created_at = last + Duration::microseconds(1); }
            }
            let message = Message {
                id: Uuid::new_v4(),
                thread_id: new.thread_id,
                sender_id: self.user_id,
                text: new.text,
                image_keys: new.image_keys,
                status: MessageStatus::Sent,
                created_at,
                edited_at: None,
            };
            s.messages.insert(message.id, message.clone());
            thread.last_message_at = Some(created_at);
            s.threads.insert(thread.id, thread.clone());
            drop(s);
            self.backend.publish(ChangeEvent::MessageInserted { message: message.clone() }, &thread);
            Ok(message)
        }

        async fn edit_message(&self, message_id: Id, text: String) -> GatewayResult<Message> {
            let mut s = self.backend.state.write().await;
            InMemBackend::check(&s, self.user_id)?;
            let message = s.messages.get_mut(&message_id).ok_or(GatewayError::NotFound)?;
            if message.sender_id != self.user_id {
                return Err(GatewayError::Rejected("only the sender can edit".into()));
            }
            if message.has_images() {
                return Err(GatewayError::Rejected("image messages cannot be edited".into()));
            }
            if text.trim().is_empty() {
                return Err(GatewayError::Rejected("message needs text".into()));
            }
            message.text = Some(text);
            message.edited_at = Some(Utc::now());
            let updated = message.clone();
            let thread = InMemBackend::participant_thread(&s, updated.thread_id, self.user_id)?;
            drop(s);
            self.backend.publish(ChangeEvent::MessageUpdated { message: updated.clone() }, &thread);
            Ok(updated)
        }

        async fn delete_message(&self, message_id: Id) -> GatewayResult<bool> {
            let mut s = self.backend.state.write().await;
            InMemBackend::check(&s, self.user_id)?;
            match s.messages.get(&message_id).map(|m| m.sender_id) {
                None => Ok(false),
                Some(sender) if sender != self.user_id => Err(GatewayError::Rejected("only the sender can delete".into())),
                Some(_) => {
                    s.messages.remove(&message_id);
                    Ok(true)
                }
            }
        }

        async fn delete_message_image(&self, message_id: Id, image_key: &str) -> GatewayResult<Option<Message>> {
            let mut s = self.backend.state.write().await;
            InMemBackend::check(&s, self.user_id)?;
            let Some(message) = s.messages.get_mut(&message_id) else { return Ok(None) };
            if message.sender_id != self.user_id {
                return Err(GatewayError::Rejected("only the sender can delete images".into()));
            }
            message.image_keys.retain(|k| k != image_key);
            if message.is_empty() {
                s.messages.remove(&message_id);
                return Ok(None);
            }
            let updated = message.clone();
            let thread = InMemBackend::participant_thread(&s, updated.thread_id, self.user_id)?;
            drop(s);
            self.backend.publish(ChangeEvent::MessageUpdated { message: updated.clone() }, &thread);
            Ok(Some(updated))
        }

        async fn list_messages(&self, thread_id: Id, limit: Option<usize>) -> GatewayResult<Vec<Message>> {
            let s = self.backend.state.read().await;
            InMemBackend::check(&s, self.user_id)?;
            InMemBackend::participant_thread(&s, thread_id, self.user_id)?;
            let mut v: Vec<_> = s.messages.values().filter(|m| m.thread_id == thread_id).cloned().collect();
            v.sort_by(|a, b| a.created_at.cmp(&b.created_at)); // ascending
            if let Some(limit) = limit {
                let skip = v.len().saturating_sub(limit);
                v.drain(..skip);
            }
            Ok(v)
        }
    }

    #[async_trait]
    impl BlockGateway for InMemGateway {
        async fn block_user(&self, blocked_user_id: Id) -> GatewayResult<BlockRelation> {
            let mut s = self.backend.state.write().await;
            InMemBackend::check(&s, self.user_id)?;
            let relation = s.blocks.entry(self.user_id).or_default()
                .entry(blocked_user_id)
                .or_insert_with(|| BlockRelation { blocked_user_id, blocked_at: Utc::now() })
                .clone();
            Ok(relation)
        }

        async fn unblock_user(&self, blocked_user_id: Id) -> GatewayResult<bool> {
            let mut s = self.backend.state.write().await;
            InMemBackend::check(&s, self.user_id)?;
            Ok(s.blocks.get_mut(&self.user_id).and_then(|b| b.remove(&blocked_user_id)).is_some())
        }

        async fn list_blocked_users(&self) -> GatewayResult<Vec<BlockRelation>> {
            let s = self.backend.state.read().await;
            InMemBackend::check(&s, self.user_id)?;
            Ok(s.blocks.get(&self.user_id).map(|b| b.values().cloned().collect()).unwrap_or_default())
        }
    }

    #[async_trait]
    impl AssetGateway for InMemGateway {
        async fn create_image_upload_url(&self) -> GatewayResult<UploadTicket> {
            let s = self.backend.state.read().await;
            InMemBackend::check(&s, self.user_id)?;
            let asset_key = format!("chat/{}/{}", self.user_id, Uuid::new_v4());
            Ok(UploadTicket { upload_url: format!("memory://uploads/{asset_key}"), asset_key })
        }
    }
}

// JSON-over-HTTP client for a remote backend
pub mod http {
    use super::*;
    use reqwest::StatusCode;
    use serde::de::DeserializeOwned;
    use serde::Deserialize;
    use serde_json::{json, Value};

    #[derive(Deserialize)]
    struct Ack {
        success: bool,
    }

    #[derive(Deserialize)]
    struct Count {
        count: u64,
    }

    #[derive(Deserialize)]
    struct MaybeMessage {
        message: Option<Message>,
    }

    /// Gateway speaking `POST {base}/rpc/{operation}` with a JSON body and
    /// the user's bearer token.
    #[derive(Clone)]
    pub struct HttpGateway {
        client: reqwest::Client,
        base_url: String,
        token: String,
    }

    impl HttpGateway {
        pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
            Self { client, base_url: base_url.into(), token: token.into() }
        }

        async fn call<T: DeserializeOwned>(&self, op: &str, args: Value) -> GatewayResult<T> {
            let url = format!("{}/rpc/{}", self.base_url.trim_end_matches('/'), op);
            let resp = self.client.post(&url)
                .bearer_auth(&self.token)
                .json(&args)
                .send()
                .await
                .map_err(|e| {
                    log::debug!("rpc {op} failed to send: {e}");
                    GatewayError::Transport(e.to_string())
                })?;
            match resp.status() {
                s if s.is_success() => resp.json::<T>().await
                    .map_err(|e| GatewayError::Transport(format!("undecodable {op} response: {e}"))),
                StatusCode::UNAUTHORIZED => Err(GatewayError::AuthExpired),
                StatusCode::NOT_FOUND => Err(GatewayError::NotFound),
                s if s.is_client_error() => {
                    let body = resp.text().await.unwrap_or_default();
                    Err(GatewayError::Rejected(if body.is_empty() { s.to_string() } else { body }))
                }
                s => {
                    log::warn!("rpc {op} returned {s}");
                    Err(GatewayError::Transport(format!("{op} returned {s}")))
                }
            }
        }
    }

    #[async_trait]
    impl ThreadGateway for HttpGateway {
        async fn get_or_create_thread(&self, listing_id: Id, seller_id: Option<Id>) -> GatewayResult<Thread> {
            self.call("getOrCreateThread", json!({ "listingId": listing_id, "sellerId": seller_id })).await
        }
        async fn list_threads(&self) -> GatewayResult<Vec<Thread>> {
            self.call("listThreads", json!({})).await
        }
        async fn delete_thread(&self, thread_id: Id) -> GatewayResult<bool> {
            let ack: Ack = self.call("deleteThread", json!({ "threadId": thread_id })).await?;
            Ok(ack.success)
        }
        async fn mark_thread_read(&self, thread_id: Id, up_to: Option<Id>) -> GatewayResult<bool> {
            let ack: Ack = self.call("markThreadRead", json!({ "threadId": thread_id, "messageId": up_to })).await?;
            Ok(ack.success)
        }
        async fn unread_count(&self) -> GatewayResult<u64> {
            let c: Count = self.call("unreadCount", json!({})).await?;
            Ok(c.count)
        }
    }

    #[async_trait]
    impl MessageGateway for HttpGateway {
        async fn send_message(&self, new: NewMessage) -> GatewayResult<Message> {
            self.call("sendMessage", json!({
                "threadId": new.thread_id,
                "text": new.text,
                "imageKeys": new.image_keys,
            })).await
        }
        async fn edit_message(&self, message_id: Id, text: String) -> GatewayResult<Message> {
            self.call("editMessage", json!({ "messageId": message_id, "text": text })).await
        }
        async fn delete_message(&self, message_id: Id) -> GatewayResult<bool> {
            let ack: Ack = self.call("deleteMessage", json!({ "messageId": message_id })).await?;
            Ok(ack.success)
        }
        async fn delete_message_image(&self, message_id: Id, image_key: &str) -> GatewayResult<Option<Message>> {
            let r: MaybeMessage = self.call("deleteMessageImage", json!({ "messageId": message_id, "imageKey": image_key })).await?;
            Ok(r.message)
        }
        async fn list_messages(&self, thread_id: Id, limit: Option<usize>) -> GatewayResult<Vec<Message>> {
            self.call("listMessages", json!({ "threadId": thread_id, "limit": limit })).await
        }
    }

    #[async_trait]
    impl BlockGateway for HttpGateway {
        async fn block_user(&self, blocked_user_id: Id) -> GatewayResult<BlockRelation> {
            self.call("blockUser", json!({ "blockedUserId": blocked_user_id })).await
        }
        async fn unblock_user(&self, blocked_user_id: Id) -> GatewayResult<bool> {
            let ack: Ack = self.call("unblockUser", json!({ "blockedUserId": blocked_user_id })).await?;
            Ok(ack.success)
        }
        async fn list_blocked_users(&self) -> GatewayResult<Vec<BlockRelation>> {
            self.call("listBlockedUsers", json!({})).await
        }
    }

    #[async_trait]
    impl AssetGateway for HttpGateway {
        async fn create_image_upload_url(&self) -> GatewayResult<UploadTicket> {
            self.call("createImageUploadUrl", json!({})).await
        }
    }

    /// One shared connection pool, one gateway per user token.
    #[derive(Clone)]
    pub struct HttpGatewayFactory {
        client: reqwest::Client,
        base_url: String,
    }

    impl HttpGatewayFactory {
        pub fn new(base_url: impl Into<String>) -> Self {
            Self { client: reqwest::Client::new(), base_url: base_url.into() }
        }
    }

    impl GatewayFactory for HttpGatewayFactory {
        fn gateway_for(&self, _user_id: Id, token: &str) -> Arc<dyn Gateway> {
            Arc::new(HttpGateway::new(self.client.clone(), self.base_url.clone(), token))
        }
    }
}
