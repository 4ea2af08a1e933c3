#![cfg(feature = "inmem-backend")]

use actix_web::{test, web, App};
use listing_chat::{
    auth::create_jwt,
    gateway::inmem::InMemBackend,
    models::Id,
    routes::{config, AppState},
    ChatConfig, FeedHub, PresenceHub, SessionManager,
};
use serde_json::{json, Value};
use serial_test::serial;
use std::sync::Arc;
use uuid::Uuid;

fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
}

fn bearer(user: Id) -> (&'static str, String) {
    ("Authorization", format!("Bearer {}", create_jwt(user).unwrap()))
}

struct Market {
    backend: InMemBackend,
    state: AppState,
    listing: Id,
    buyer: Id,
    seller: Id,
}

async fn market() -> Market {
    setup_env();
    let hub = FeedHub::default();
    let backend = InMemBackend::new(hub.clone());
    let (buyer, seller, listing) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    backend.register_listing(listing, seller).await;
    let sessions = SessionManager::new(
        Arc::new(backend.clone()),
        Arc::new(hub.clone()),
        Arc::new(PresenceHub::default()),
        ChatConfig::default(),
    );
    let state = AppState {
        sessions: Arc::new(sessions),
        hub,
        change_secret: Some("s3cret".into()),
        metrics: None,
    };
    Market { backend, state, listing, buyer, seller }
}

#[actix_web::test]
#[serial]
async fn thread_and_message_flow() {
    let m = market().await;
    let app = test::init_service(App::new().app_data(web::Data::new(m.state.clone())).configure(config)).await;

    // open a thread on the seller's listing
    let req = test::TestRequest::post()
        .uri("/api/v1/threads")
        .insert_header(bearer(m.buyer))
        .set_json(json!({ "listing_id": m.listing }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let thread: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let thread_id = thread["id"].as_str().unwrap().to_string();
    assert_eq!(thread["seller_id"], json!(m.seller));

    // send
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/threads/{thread_id}/messages"))
        .insert_header(bearer(m.buyer))
        .set_json(json!({ "text": "Is it still available?" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let message: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let message_id = message["id"].as_str().unwrap().to_string();
    assert_eq!(message["status"], "sent");

    // neither text nor images
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/threads/{thread_id}/messages"))
        .insert_header(bearer(m.buyer))
        .set_json(json!({ "text": "   ", "image_keys": [] }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    // edit
    let req = test::TestRequest::patch()
        .uri(&format!("/api/v1/messages/{message_id}"))
        .insert_header(bearer(m.buyer))
        .set_json(json!({ "text": "Is it still for sale?" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    // list
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/threads/{thread_id}/messages"))
        .insert_header(bearer(m.buyer))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let messages: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let messages = messages.as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["text"], "Is it still for sale?");

    // the seller's badge
    let req = test::TestRequest::get().uri("/api/v1/unread").insert_header(bearer(m.seller)).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let unread: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(unread["total"], 1);

    // the seller opens and reads the thread
    let req = test::TestRequest::put()
        .uri("/api/v1/threads/active")
        .insert_header(bearer(m.seller))
        .set_json(json!({ "thread_id": thread_id }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let switched: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(switched["previous"], Value::Null);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/threads/{thread_id}/read"))
        .insert_header(bearer(m.seller))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 204);

    let req = test::TestRequest::get().uri("/api/v1/unread").insert_header(bearer(m.seller)).to_request();
    let unread: Value = serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    assert_eq!(unread["total"], 0);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/threads/{thread_id}/typing"))
        .insert_header(bearer(m.seller))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 202);

    // delete the thread, twice
    for _ in 0..2 {
        let req = test::TestRequest::delete()
            .uri(&format!("/api/v1/threads/{thread_id}"))
            .insert_header(bearer(m.buyer))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 204);
    }
}

#[actix_web::test]
#[serial]
async fn requests_need_a_valid_token() {
    let m = market().await;
    let app = test::init_service(App::new().app_data(web::Data::new(m.state.clone())).configure(config)).await;

    let req = test::TestRequest::get().uri("/api/v1/threads").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);

    let req = test::TestRequest::get()
        .uri("/api/v1/threads")
        .insert_header(("Authorization", "Bearer garbage"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);
}

#[actix_web::test]
#[serial]
async fn blocking_yourself_is_rejected() {
    let m = market().await;
    let app = test::init_service(App::new().app_data(web::Data::new(m.state.clone())).configure(config)).await;

    let req = test::TestRequest::put()
        .uri(&format!("/api/v1/blocks/{}", m.buyer))
        .insert_header(bearer(m.buyer))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let req = test::TestRequest::put()
        .uri(&format!("/api/v1/blocks/{}", m.seller))
        .insert_header(bearer(m.buyer))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 204);

    let req = test::TestRequest::get().uri("/api/v1/blocks").insert_header(bearer(m.buyer)).to_request();
    let blocked: Value = serde_json::from_slice(&test::read_body(test::call_service(&app, req).await).await).unwrap();
    assert_eq!(blocked, json!([m.seller]));
}

#[actix_web::test]
#[serial]
async fn change_webhook_checks_secret_and_payload() {
    let m = market().await;
    let app = test::init_service(App::new().app_data(web::Data::new(m.state.clone())).configure(config)).await;
    let envelope = |table: &str| {
        json!({
            "recipients": [m.buyer, m.seller],
            "change": {
                "table": table,
                "eventType": "INSERT",
                "new": {
                    "id": Uuid::new_v4(),
                    "thread_id": Uuid::new_v4(),
                    "sender_id": m.buyer,
                    "text": "hello",
                    "status": "sent",
                    "created_at": "2024-05-01T10:00:00Z"
                }
            }
        })
    };

    let req = test::TestRequest::post().uri("/api/v1/changes").set_json(envelope("messages")).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);

    let req = test::TestRequest::post()
        .uri("/api/v1/changes")
        .insert_header(("X-Change-Secret", "wrong"))
        .set_json(envelope("messages"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);

    let req = test::TestRequest::post()
        .uri("/api/v1/changes")
        .insert_header(("X-Change-Secret", "s3cret"))
        .set_json(envelope("messages"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 202);
    let accepted: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(accepted["kind"], "message-inserted");

    let req = test::TestRequest::post()
        .uri("/api/v1/changes")
        .insert_header(("X-Change-Secret", "s3cret"))
        .set_json(envelope("listings"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);
}

#[actix_web::test]
#[serial]
async fn expired_backend_credentials_end_the_session() {
    let m = market().await;
    let app = test::init_service(App::new().app_data(web::Data::new(m.state.clone())).configure(config)).await;

    let req = test::TestRequest::get().uri("/api/v1/threads").insert_header(bearer(m.buyer)).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);
    assert!(m.state.sessions.get(m.buyer).is_some());

    m.backend.expire_auth(m.buyer).await;
    let req = test::TestRequest::get()
        .uri("/api/v1/threads?refresh=true")
        .insert_header(bearer(m.buyer))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);
    assert!(m.state.sessions.get(m.buyer).is_none());
}

#[actix_web::test]
#[serial]
async fn metrics_are_absent_without_a_recorder() {
    let m = market().await;
    let app = test::init_service(App::new().app_data(web::Data::new(m.state.clone())).configure(config)).await;
    let req = test::TestRequest::get().uri("/metrics").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
}
