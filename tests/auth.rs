use actix_web::{dev::Payload, test, FromRequest};
use listing_chat::auth::{create_jwt, SessionUser};
use serial_test::serial;
use std::env;
use uuid::Uuid;

// Helper that guarantees a sufficiently long secret for tests.
fn set_secret() {
    env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
}

#[actix_web::test]
#[serial]
async fn jwt_roundtrip_keeps_user_and_token() {
    set_secret();
    let user = Uuid::new_v4();
    let token = create_jwt(user).expect("token");
    let req = test::TestRequest::default()
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_http_request();
    let mut pl = Payload::None;
    let session_user = SessionUser::from_request(&req, &mut pl).await.expect("extract");
    assert_eq!(session_user.user_id, user);
    assert_eq!(session_user.token, token);
}

#[actix_web::test]
#[serial]
async fn extractor_rejects_invalid_token() {
    set_secret();
    let req = test::TestRequest::default()
        .insert_header(("Authorization", "Bearer notatoken"))
        .to_http_request();
    let mut pl = Payload::None;
    assert!(SessionUser::from_request(&req, &mut pl).await.is_err());
}

#[actix_web::test]
#[serial]
async fn extractor_requires_a_bearer_header() {
    set_secret();
    let req = test::TestRequest::default().to_http_request();
    let mut pl = Payload::None;
    assert!(SessionUser::from_request(&req, &mut pl).await.is_err());
}

#[actix_web::test]
#[serial]
async fn token_from_another_secret_is_rejected() {
    set_secret();
    let token = create_jwt(Uuid::new_v4()).expect("token");
    env::set_var("JWT_SECRET", "a-different-secret-of-32-bytes-or-more");
    let req = test::TestRequest::default()
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_http_request();
    let mut pl = Payload::None;
    assert!(SessionUser::from_request(&req, &mut pl).await.is_err());
    set_secret();
}

#[::core::prelude::v1::test]
#[serial]
fn issuing_without_a_secret_fails() {
    env::remove_var("JWT_SECRET");
    assert!(create_jwt(Uuid::new_v4()).is_err());
    set_secret();
}
