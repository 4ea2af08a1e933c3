#![cfg(feature = "inmem-backend")]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use listing_chat::{
    config::ChatConfig,
    feed::{ChangeEvent, FeedHub},
    gateway::{
        inmem::{InMemBackend, InMemGateway, ReadCall},
        MessageGateway, ThreadGateway,
    },
    models::{Id, Message, MessageStatus, NewMessage, Participant},
    presence::PresenceHub,
    router::{apply, Outcome},
    session::{ChatCore, ChatSession},
};
use uuid::Uuid;

struct Fixture {
    backend: InMemBackend,
    buyer: Id,
    seller: Id,
    seller_gw: InMemGateway,
    thread_id: Id,
    core: Arc<ChatCore>,
}

/// The buyer's session state with one thread opened on the seller's listing.
async fn fixture() -> Fixture {
    let backend = InMemBackend::new(FeedHub::default());
    let (buyer, seller, listing) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    backend.register_listing(listing, seller).await;
    let core = Arc::new(ChatCore::new(buyer, Arc::new(backend.gateway(buyer)), &ChatConfig::default()));
    let thread_id = core.threads.get_or_create_thread(listing, None).await.unwrap();
    Fixture { seller_gw: backend.gateway(seller), backend, buyer, seller, thread_id, core }
}

async fn from_seller(f: &Fixture, text: &str) -> Message {
    f.seller_gw
        .send_message(NewMessage { thread_id: f.thread_id, text: Some(text.into()), image_keys: vec![] })
        .await
        .unwrap()
}

fn inserted(message: &Message) -> ChangeEvent {
    ChangeEvent::MessageInserted { message: message.clone() }
}

fn unread_of(f: &Fixture) -> u32 {
    f.core.threads.get(f.thread_id).unwrap().unread_count
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn insert_on_inactive_thread_counts_as_unread() {
    let f = fixture().await;
    let m = from_seller(&f, "is it still for sale?").await;

    assert_eq!(apply(&f.core, inserted(&m)).await, Outcome::Appended);
    assert_eq!(unread_of(&f), 1);
    assert_eq!(f.core.unread.total(), 1);
    assert_eq!(f.core.threads.get(f.thread_id).unwrap().last_message_at, Some(m.created_at));
    assert!(f.backend.read_calls(f.buyer).await.is_empty());
}

#[tokio::test]
async fn duplicate_delivery_has_no_side_effects() {
    let f = fixture().await;
    let m = from_seller(&f, "hello").await;

    assert_eq!(apply(&f.core, inserted(&m)).await, Outcome::Appended);
    assert_eq!(apply(&f.core, inserted(&m)).await, Outcome::Duplicate);
    assert_eq!(f.core.messages.cached_messages(f.thread_id).len(), 1);
    assert_eq!(unread_of(&f), 1);
}

#[tokio::test]
async fn insert_on_active_thread_is_marked_read() {
    let f = fixture().await;
    f.core.threads.set_active_thread(Some(f.thread_id));
    let m = from_seller(&f, "hello").await;

    assert_eq!(apply(&f.core, inserted(&m)).await, Outcome::Appended);
    assert_eq!(unread_of(&f), 0);
    assert_eq!(f.core.unread.total(), 0);
    assert_eq!(
        f.backend.read_calls(f.buyer).await,
        vec![ReadCall { user_id: f.buyer, thread_id: f.thread_id, up_to: Some(m.id) }]
    );
}

#[tokio::test]
async fn own_insert_is_an_echo() {
    let f = fixture().await;
    let mine = f.core
        .messages
        .send_message(&f.core.threads, f.thread_id, Some("offer: 40".into()), vec![])
        .await
        .unwrap();

    assert_eq!(apply(&f.core, inserted(&mine)).await, Outcome::EchoSuppressed);
    assert_eq!(f.core.messages.cached_messages(f.thread_id).len(), 1);
    assert_eq!(unread_of(&f), 0);
}

#[tokio::test]
async fn update_replaces_known_message_only() {
    let f = fixture().await;
    let m = from_seller(&f, "price is 50").await;
    apply(&f.core, inserted(&m)).await;

    let edited = f.seller_gw.edit_message(m.id, "price is 45".into()).await.unwrap();
    assert_eq!(apply(&f.core, ChangeEvent::MessageUpdated { message: edited }).await, Outcome::Updated);
    assert_eq!(f.core.messages.get(m.id).unwrap().text.as_deref(), Some("price is 45"));
    assert_eq!(unread_of(&f), 1);

    let stranger = Message { id: Uuid::new_v4(), ..m.clone() };
    assert_eq!(apply(&f.core, ChangeEvent::MessageUpdated { message: stranger }).await, Outcome::Ignored);
}

#[tokio::test]
async fn update_that_empties_a_message_removes_it() {
    let f = fixture().await;
    let m = from_seller(&f, "soon gone").await;
    apply(&f.core, inserted(&m)).await;

    let emptied = Message { text: None, image_keys: vec![], ..m.clone() };
    assert_eq!(apply(&f.core, ChangeEvent::MessageUpdated { message: emptied }).await, Outcome::Updated);
    assert!(f.core.messages.get(m.id).is_none());
}

#[tokio::test]
async fn counterpart_read_cascades_receipts() {
    let f = fixture().await;
    let mine = f.core
        .messages
        .send_message(&f.core.threads, f.thread_id, Some("hi".into()), vec![])
        .await
        .unwrap();
    f.seller_gw.mark_thread_read(f.thread_id, Some(mine.id)).await.unwrap();

    let participant = Participant { thread_id: f.thread_id, user_id: f.seller, last_read_at: Some(mine.created_at) };
    let outcome = apply(&f.core, ChangeEvent::ParticipantUpdated { participant }).await;
    assert_eq!(outcome, Outcome::ReceiptsCascaded(1));
    assert_eq!(f.core.messages.get(mine.id).unwrap().status, MessageStatus::Read);
}

#[tokio::test]
async fn own_read_position_syncs_unread() {
    let f = fixture().await;
    let first = from_seller(&f, "one").await;
    let second = from_seller(&f, "two").await;
    for m in [&first, &second] {
        apply(&f.core, inserted(m)).await;
    }
    f.core.messages.list_messages(f.thread_id).await.unwrap();
    assert_eq!(unread_of(&f), 2);

    // read on another device up to the first message
    let participant = Participant { thread_id: f.thread_id, user_id: f.buyer, last_read_at: Some(first.created_at) };
    let outcome = apply(&f.core, ChangeEvent::ParticipantUpdated { participant }).await;
    assert_eq!(outcome, Outcome::ReadPositionSynced);
    assert_eq!(unread_of(&f), 1);
    assert_eq!(f.core.unread.total(), 1);

    let participant = Participant { thread_id: f.thread_id, user_id: f.buyer, last_read_at: Some(second.created_at) };
    apply(&f.core, ChangeEvent::ParticipantUpdated { participant }).await;
    assert_eq!(unread_of(&f), 0);
}

#[tokio::test]
async fn own_read_without_cached_log_zeroes_only_when_caught_up() {
    let f = fixture().await;
    let m = from_seller(&f, "hello").await;
    apply(&f.core, inserted(&m)).await;
    assert!(!f.core.messages.is_loaded(f.thread_id));

    let early = m.created_at - chrono::Duration::seconds(1);
    let participant = Participant { thread_id: f.thread_id, user_id: f.buyer, last_read_at: Some(early) };
    apply(&f.core, ChangeEvent::ParticipantUpdated { participant }).await;
    assert_eq!(unread_of(&f), 1);

    let participant = Participant { thread_id: f.thread_id, user_id: f.buyer, last_read_at: Some(Utc::now()) };
    apply(&f.core, ChangeEvent::ParticipantUpdated { participant }).await;
    assert_eq!(unread_of(&f), 0);
}

#[tokio::test]
async fn message_for_unknown_thread_is_repaired() {
    let backend = InMemBackend::new(FeedHub::default());
    let (buyer, seller, listing) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    backend.register_listing(listing, seller).await;
    // the seller's engine has never seen this thread
    let thread = backend.gateway(buyer).get_or_create_thread(listing, None).await.unwrap();
    let core = Arc::new(ChatCore::new(seller, Arc::new(backend.gateway(seller)), &ChatConfig::default()));

    let m = backend
        .gateway(buyer)
        .send_message(NewMessage { thread_id: thread.id, text: Some("hi".into()), image_keys: vec![] })
        .await
        .unwrap();
    assert_eq!(apply(&core, ChangeEvent::MessageInserted { message: m.clone() }).await, Outcome::Appended);

    let placeholder = core.threads.get(thread.id).unwrap();
    assert_eq!(placeholder.counterpart(seller), buyer);
    assert_eq!(core.unread.total(), 1);

    eventually("thread metadata", || core.threads.get(thread.id).map(|t| !t.placeholder).unwrap_or(false)).await;
    let repaired = core.threads.get(thread.id).unwrap();
    assert_eq!(repaired.listing_id, listing);
    assert_eq!(repaired.buyer_id, buyer);
    assert_eq!(repaired.unread_count, 1);
}

struct Stranger {
    buyer: Id,
    seller: Id,
    listing: Id,
    thread_id: Id,
    buyer_gw: InMemGateway,
    core: Arc<ChatCore>,
}

/// A thread the buyer opened with one message, unknown to the seller's engine.
async fn stranger_thread() -> (Stranger, Message) {
    let backend = InMemBackend::new(FeedHub::default());
    let (buyer, seller, listing) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    backend.register_listing(listing, seller).await;
    let buyer_gw = backend.gateway(buyer);
    let thread_id = buyer_gw.get_or_create_thread(listing, None).await.unwrap().id;
    let m = buyer_gw
        .send_message(NewMessage { thread_id, text: Some("hi".into()), image_keys: vec![] })
        .await
        .unwrap();
    let core = Arc::new(ChatCore::new(seller, Arc::new(backend.gateway(seller)), &ChatConfig::default()));
    (Stranger { buyer, seller, listing, thread_id, buyer_gw, core }, m)
}

async fn repaired(s: &Stranger) {
    eventually("thread metadata", || s.core.threads.get(s.thread_id).map(|t| !t.placeholder).unwrap_or(false)).await;
    let thread = s.core.threads.get(s.thread_id).unwrap();
    assert_eq!(thread.listing_id, s.listing);
    assert_eq!(thread.buyer_id, s.buyer);
    assert_eq!(s.core.unread.total(), 1);
}

#[tokio::test]
async fn edit_for_unknown_thread_is_repaired() {
    let (s, m) = stranger_thread().await;
    let edited = s.buyer_gw.edit_message(m.id, "hi there".into()).await.unwrap();

    assert_eq!(apply(&s.core, ChangeEvent::MessageUpdated { message: edited }).await, Outcome::Ignored);
    let placeholder = s.core.threads.get(s.thread_id).expect("placeholder entry");
    assert_eq!(placeholder.counterpart(s.seller), s.buyer);
    repaired(&s).await;
}

#[tokio::test]
async fn counterpart_read_for_unknown_thread_is_repaired() {
    let (s, m) = stranger_thread().await;
    let participant = Participant { thread_id: s.thread_id, user_id: s.buyer, last_read_at: Some(m.created_at) };

    let outcome = apply(&s.core, ChangeEvent::ParticipantUpdated { participant }).await;
    assert_eq!(outcome, Outcome::ReceiptsCascaded(0));
    assert!(s.core.threads.contains(s.thread_id));
    repaired(&s).await;
}

#[tokio::test]
async fn own_read_for_unknown_thread_fetches_the_thread() {
    let (s, m) = stranger_thread().await;
    // the seller read it on another device; no counterpart in the event
    let participant = Participant { thread_id: s.thread_id, user_id: s.seller, last_read_at: Some(m.created_at) };

    assert_eq!(apply(&s.core, ChangeEvent::ParticipantUpdated { participant }).await, Outcome::Ignored);
    eventually("thread fetched", || s.core.threads.contains(s.thread_id)).await;
    assert!(!s.core.threads.get(s.thread_id).unwrap().placeholder);
}

#[tokio::test]
async fn feed_gap_reloads_log_without_double_counting() {
    let hub = FeedHub::new(1);
    let backend = InMemBackend::new(hub.clone());
    let (buyer, seller, listing) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    backend.register_listing(listing, seller).await;
    let session = ChatSession::start(
        buyer,
        Arc::new(backend.gateway(buyer)),
        Arc::new(hub.clone()),
        Arc::new(PresenceHub::default()),
        &ChatConfig::default(),
    )
    .await
    .unwrap();
    let thread_id = session.get_or_create_thread(listing, None).await.unwrap();
    assert!(session.list_messages(thread_id).await.unwrap().is_empty());

    // nothing yields between the sends, so the one-slot feed overflows
    let seller_gw = backend.gateway(seller);
    let mut last = None;
    for text in ["one", "two", "three", "four"] {
        let m = seller_gw
            .send_message(NewMessage { thread_id, text: Some(text.into()), image_keys: vec![] })
            .await
            .unwrap();
        last = Some(m.id);
    }
    let last = last.unwrap();

    eventually("event after the gap", || session.core().messages.get(last).is_some()).await;
    assert_eq!(session.list_threads()[0].unread_count, 4);
    assert_eq!(session.unread_total(), 4);
    let texts: Vec<_> = session
        .list_messages(thread_id)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| m.text)
        .collect();
    assert_eq!(texts, ["one", "two", "three", "four"]);
}
