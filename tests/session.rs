#![cfg(feature = "inmem-backend")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use listing_chat::{
    config::ChatConfig,
    error::ChatError,
    feed::{ChangeFeed, FeedHub, FeedScope, FeedSubscription},
    gateway::{http::HttpGateway, inmem::InMemBackend, GatewayError, GatewayResult, ThreadGateway},
    models::{Id, PresenceSignal},
    presence::{PresenceChannel, PresenceHub},
    session::ChatSession,
};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Thread feed that answers slowly for one thread and not at all for another.
struct UnevenFeed {
    hub: FeedHub,
    slow: Id,
    broken: Id,
}

#[async_trait]
impl ChangeFeed for UnevenFeed {
    async fn subscribe(&self, scope: FeedScope) -> GatewayResult<FeedSubscription> {
        if scope == FeedScope::Thread(self.broken) {
            return Err(GatewayError::Transport("feed unavailable".into()));
        }
        if scope == FeedScope::Thread(self.slow) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.hub.subscribe(scope).await
    }
}

struct Fixture {
    hub: FeedHub,
    presence: Arc<PresenceHub>,
    seller: Id,
    slow: Id,
    fast: Id,
    broken: Id,
    session: ChatSession,
}

async fn fixture() -> Fixture {
    let hub = FeedHub::default();
    let backend = InMemBackend::new(hub.clone());
    let (buyer, seller) = (Uuid::new_v4(), Uuid::new_v4());
    let mut threads = Vec::new();
    for _ in 0..3 {
        let listing = Uuid::new_v4();
        backend.register_listing(listing, seller).await;
        threads.push(backend.gateway(buyer).get_or_create_thread(listing, None).await.unwrap().id);
    }
    let (slow, fast, broken) = (threads[0], threads[1], threads[2]);
    let presence = Arc::new(PresenceHub::default());
    let feed = Arc::new(UnevenFeed { hub: hub.clone(), slow, broken });
    let session = ChatSession::start(buyer, Arc::new(backend.gateway(buyer)), feed, presence.clone(), &ChatConfig::default())
        .await
        .unwrap();
    Fixture { hub, presence, seller, slow, fast, broken, session }
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn shows_typing(f: &Fixture, thread_id: Id) {
    f.presence.announce(PresenceSignal { thread_id, user_id: f.seller, typing: true, expires_at: Utc::now() });
    eventually("typing indicator", || f.session.typing_peer(thread_id) == Some(f.seller)).await;
}

#[tokio::test]
async fn concurrent_switches_settle_on_one_thread() {
    let f = fixture().await;
    let s = &f.session;

    let (a, b) = tokio::join!(s.set_active_thread(Some(f.slow)), s.set_active_thread(Some(f.fast)));
    a.unwrap();
    b.unwrap();

    let active = s.active_thread().expect("an active thread");
    let idle = if active == f.slow { f.fast } else { f.slow };
    eventually("idle thread feed released", || f.hub.subscriber_count(FeedScope::Thread(idle)) == 0).await;
    assert_eq!(f.hub.subscriber_count(FeedScope::Thread(active)), 1);
    shows_typing(&f, active).await;
}

#[tokio::test]
async fn failed_feed_bind_keeps_the_current_thread() {
    let f = fixture().await;
    let s = &f.session;
    s.set_active_thread(Some(f.fast)).await.unwrap();

    let err = s.set_active_thread(Some(f.broken)).await.unwrap_err();
    assert!(matches!(err, ChatError::Transport(_)));
    assert_eq!(s.active_thread(), Some(f.fast));
    assert_eq!(f.hub.subscriber_count(FeedScope::Thread(f.fast)), 1);
    shows_typing(&f, f.fast).await;
}

#[tokio::test]
async fn badge_drops_before_the_block_is_confirmed() {
    let server = MockServer::start().await;
    let (me, pest) = (Uuid::new_v4(), Uuid::new_v4());
    Mock::given(method("POST"))
        .and(path("/rpc/listBlockedUsers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rpc/listThreads"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": Uuid::new_v4(),
            "listing_id": Uuid::new_v4(),
            "buyer_id": pest,
            "seller_id": me,
            "last_message_at": "2024-05-01T10:00:00Z",
            "unread_count": 2
        }])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rpc/blockUser"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "blocked_user_id": pest, "blocked_at": "2024-05-01T11:00:00Z" }))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let gateway = HttpGateway::new(reqwest::Client::new(), server.uri(), "user-token");
    let session = Arc::new(
        ChatSession::start(
            me,
            Arc::new(gateway),
            Arc::new(FeedHub::default()),
            Arc::new(PresenceHub::default()),
            &ChatConfig::default(),
        )
        .await
        .unwrap(),
    );
    assert_eq!(session.unread_total(), 2);

    let blocking = tokio::spawn({
        let session = session.clone();
        async move { session.block_user(pest).await }
    });
    eventually("thread hidden", || session.list_threads().is_empty()).await;
    assert_eq!(session.unread_total(), 0);
    assert!(!blocking.is_finished());

    blocking.await.unwrap().unwrap();
    assert_eq!(session.unread_total(), 0);
    assert!(session.is_blocked(pest));
}
