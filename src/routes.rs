use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::SessionUser;
use crate::error::{ApiError, ChatError};
use crate::feed::{ChangeEvent, FeedHub, RawChange};
use crate::models::*;
use crate::session::{ChatSession, SessionManager};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(
                web::resource("/threads")
                    .route(web::get().to(list_threads))
                    .route(web::post().to(open_thread)),
            )
            // before /threads/{id} so "active" is not taken for an id
            .service(web::resource("/threads/active").route(web::put().to(set_active_thread)))
            .service(web::resource("/threads/{id}").route(web::delete().to(delete_thread)))
            .service(web::resource("/threads/{id}/read").route(web::post().to(mark_thread_read)))
            .service(
                web::resource("/threads/{id}/messages")
                    .route(web::get().to(list_messages))
                    .route(web::post().to(send_message)),
            )
            .service(
                web::resource("/threads/{id}/typing")
                    .route(web::get().to(typing_state))
                    .route(web::post().to(broadcast_typing)),
            )
            .service(
                web::resource("/messages/{id}")
                    .route(web::patch().to(edit_message))
                    .route(web::delete().to(delete_message)),
            )
            .service(web::resource("/messages/{id}/images/{key}").route(web::delete().to(delete_message_image)))
            .service(web::resource("/blocks").route(web::get().to(list_blocked)))
            .service(
                web::resource("/blocks/{user_id}")
                    .route(web::put().to(block_user))
                    .route(web::delete().to(unblock_user)),
            )
            .service(web::resource("/unread").route(web::get().to(unread_total)))
            .service(web::resource("/uploads").route(web::post().to(create_upload)))
            .service(web::resource("/session").route(web::delete().to(end_session)))
            .service(web::resource("/changes").route(web::post().to(ingest_change))),
    );
    cfg.route("/metrics", web::get().to(render_metrics));
}

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub hub: FeedHub,
    pub change_secret: Option<String>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ActiveThreadChanged {
    pub previous: Option<Id>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TypingState {
    pub thread_id: Id,
    pub typing_user: Option<Id>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ImageRemoved {
    /// `null` when removing the image deleted the whole message.
    pub message: Option<Message>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UnreadTotal {
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChangeEnvelope {
    /// Users whose feeds receive the change, usually buyer and seller.
    pub recipients: Vec<Id>,
    #[schema(value_type = Object)]
    pub change: RawChange,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChangeAccepted {
    pub kind: String,
    pub delivered: usize,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct RefreshQuery {
    /// Reload from the backend before answering.
    #[serde(default)]
    pub refresh: bool,
}

async fn open_session(data: &AppState, user: &SessionUser) -> Result<Arc<ChatSession>, ApiError> {
    data.sessions.session(user.user_id, &user.token).await.map_err(|e| fail(data, user, e))
}

// an expired credential ends the cached session
fn fail(data: &AppState, user: &SessionUser, e: ChatError) -> ApiError {
    data.sessions.end_if_expired(user.user_id, &e);
    e.into()
}

#[utoipa::path(
    get,
    path = "/api/v1/threads",
    params(RefreshQuery),
    responses(
        (status = 200, description = "Visible threads, latest activity first", body = [Thread]),
        (status = 401, description = "Missing or expired credentials")
    ),
    tag = "threads"
)]
pub async fn list_threads(
    user: SessionUser,
    data: web::Data<AppState>,
    query: web::Query<RefreshQuery>,
) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    let threads = if query.refresh {
        session.refresh_threads().await.map_err(|e| fail(&data, &user, e))?
    } else {
        session.list_threads()
    };
    Ok(HttpResponse::Ok().json(threads))
}

#[utoipa::path(
    post,
    path = "/api/v1/threads",
    request_body = NewThread,
    responses(
        (status = 201, description = "Thread for the listing, created if needed", body = Thread),
        (status = 400, description = "Own listing"),
        (status = 404, description = "Listing not found")
    ),
    tag = "threads"
)]
pub async fn open_thread(
    user: SessionUser,
    data: web::Data<AppState>,
    payload: web::Json<NewThread>,
) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    let NewThread { listing_id, seller_id } = payload.into_inner();
    let id = session.get_or_create_thread(listing_id, seller_id).await.map_err(|e| fail(&data, &user, e))?;
    let thread = session.core().threads.get(id).ok_or(ApiError::Internal)?;
    Ok(HttpResponse::Created().json(thread))
}

#[utoipa::path(
    delete,
    path = "/api/v1/threads/{id}",
    params(("id" = Id, Path, description = "Thread id")),
    responses((status = 204, description = "Thread deleted (or already gone)")),
    tag = "threads"
)]
pub async fn delete_thread(user: SessionUser, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    session.delete_thread(path.into_inner()).await.map_err(|e| fail(&data, &user, e))?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    put,
    path = "/api/v1/threads/active",
    request_body = ActiveThread,
    responses(
        (status = 200, description = "Active thread switched", body = ActiveThreadChanged),
        (status = 404, description = "Unknown thread")
    ),
    tag = "threads"
)]
pub async fn set_active_thread(
    user: SessionUser,
    data: web::Data<AppState>,
    payload: web::Json<ActiveThread>,
) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    let previous = session.set_active_thread(payload.thread_id).await.map_err(|e| fail(&data, &user, e))?;
    Ok(HttpResponse::Ok().json(ActiveThreadChanged { previous }))
}

#[utoipa::path(
    post,
    path = "/api/v1/threads/{id}/read",
    params(("id" = Id, Path, description = "Thread id")),
    responses(
        (status = 204, description = "Thread marked read"),
        (status = 404, description = "Unknown thread")
    ),
    tag = "threads"
)]
pub async fn mark_thread_read(user: SessionUser, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    session.mark_thread_read(path.into_inner()).await.map_err(|e| fail(&data, &user, e))?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    get,
    path = "/api/v1/threads/{id}/messages",
    params(("id" = Id, Path, description = "Thread id")),
    responses((status = 200, description = "Messages, oldest first", body = [Message])),
    tag = "messages"
)]
pub async fn list_messages(user: SessionUser, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    let messages = session.list_messages(path.into_inner()).await.map_err(|e| fail(&data, &user, e))?;
    Ok(HttpResponse::Ok().json(messages))
}

#[utoipa::path(
    post,
    path = "/api/v1/threads/{id}/messages",
    params(("id" = Id, Path, description = "Thread id")),
    request_body = SendMessage,
    responses(
        (status = 201, description = "Message sent", body = Message),
        (status = 400, description = "Neither text nor images"),
        (status = 502, description = "Backend unavailable, message withdrawn")
    ),
    tag = "messages"
)]
pub async fn send_message(
    user: SessionUser,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<SendMessage>,
) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    let SendMessage { text, image_keys } = payload.into_inner();
    let message = session
        .send_message(path.into_inner(), text, image_keys)
        .await
        .map_err(|e| fail(&data, &user, e))?;
    Ok(HttpResponse::Created().json(message))
}

#[utoipa::path(
    get,
    path = "/api/v1/threads/{id}/typing",
    params(("id" = Id, Path, description = "Thread id")),
    responses((status = 200, description = "Who is typing in the active thread", body = TypingState)),
    tag = "presence"
)]
pub async fn typing_state(user: SessionUser, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    let thread_id = path.into_inner();
    Ok(HttpResponse::Ok().json(TypingState { thread_id, typing_user: session.typing_peer(thread_id) }))
}

#[utoipa::path(
    post,
    path = "/api/v1/threads/{id}/typing",
    params(("id" = Id, Path, description = "Thread id")),
    responses((status = 202, description = "Typing announced")),
    tag = "presence"
)]
pub async fn broadcast_typing(user: SessionUser, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    session.broadcast_typing(path.into_inner()).map_err(|e| fail(&data, &user, e))?;
    Ok(HttpResponse::Accepted().finish())
}

#[utoipa::path(
    patch,
    path = "/api/v1/messages/{id}",
    params(("id" = Id, Path, description = "Message id")),
    request_body = EditMessage,
    responses(
        (status = 200, description = "Edited message", body = Message),
        (status = 404, description = "Unknown message"),
        (status = 409, description = "Image messages cannot be edited")
    ),
    tag = "messages"
)]
pub async fn edit_message(
    user: SessionUser,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<EditMessage>,
) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    let message = session
        .edit_message(path.into_inner(), payload.into_inner().text)
        .await
        .map_err(|e| fail(&data, &user, e))?;
    Ok(HttpResponse::Ok().json(message))
}

#[utoipa::path(
    delete,
    path = "/api/v1/messages/{id}",
    params(("id" = Id, Path, description = "Message id")),
    responses((status = 204, description = "Message deleted (or already gone)")),
    tag = "messages"
)]
pub async fn delete_message(user: SessionUser, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    session.delete_message(path.into_inner()).await.map_err(|e| fail(&data, &user, e))?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    delete,
    path = "/api/v1/messages/{id}/images/{key}",
    params(
        ("id" = Id, Path, description = "Message id"),
        ("key" = String, Path, description = "Asset key of the image")
    ),
    responses((status = 200, description = "Remaining message, if any", body = ImageRemoved)),
    tag = "messages"
)]
pub async fn delete_message_image(
    user: SessionUser,
    data: web::Data<AppState>,
    path: web::Path<(Id, String)>,
) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    let (message_id, key) = path.into_inner();
    let message = session.delete_message_image(message_id, &key).await.map_err(|e| fail(&data, &user, e))?;
    Ok(HttpResponse::Ok().json(ImageRemoved { message }))
}

#[utoipa::path(
    get,
    path = "/api/v1/blocks",
    params(RefreshQuery),
    responses((status = 200, description = "Blocked user ids", body = [uuid::Uuid])),
    tag = "blocks"
)]
pub async fn list_blocked(
    user: SessionUser,
    data: web::Data<AppState>,
    query: web::Query<RefreshQuery>,
) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    let blocked = if query.refresh {
        session.reload_blocked().await.map_err(|e| fail(&data, &user, e))?
    } else {
        session.blocked_users()
    };
    Ok(HttpResponse::Ok().json(blocked))
}

#[utoipa::path(
    put,
    path = "/api/v1/blocks/{user_id}",
    params(("user_id" = Id, Path, description = "User to block")),
    responses((status = 204, description = "User blocked")),
    tag = "blocks"
)]
pub async fn block_user(user: SessionUser, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let target = path.into_inner();
    if target == user.user_id {
        return Err(ApiError::BadRequest("cannot block yourself".into()));
    }
    let session = open_session(&data, &user).await?;
    session.block_user(target).await.map_err(|e| fail(&data, &user, e))?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    delete,
    path = "/api/v1/blocks/{user_id}",
    params(("user_id" = Id, Path, description = "User to unblock")),
    responses((status = 204, description = "User unblocked")),
    tag = "blocks"
)]
pub async fn unblock_user(user: SessionUser, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    session.unblock_user(path.into_inner()).await.map_err(|e| fail(&data, &user, e))?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    get,
    path = "/api/v1/unread",
    params(RefreshQuery),
    responses((status = 200, description = "Unread total over visible threads", body = UnreadTotal)),
    tag = "threads"
)]
pub async fn unread_total(
    user: SessionUser,
    data: web::Data<AppState>,
    query: web::Query<RefreshQuery>,
) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    let server = if query.refresh {
        session.refresh_unread().await.map_err(|e| fail(&data, &user, e))?
    } else {
        None
    };
    Ok(HttpResponse::Ok().json(UnreadTotal { total: session.unread_total(), server }))
}

#[utoipa::path(
    post,
    path = "/api/v1/uploads",
    responses((status = 201, description = "Pre-signed upload target", body = UploadTicket)),
    tag = "messages"
)]
pub async fn create_upload(user: SessionUser, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let session = open_session(&data, &user).await?;
    let ticket = session.create_image_upload_url().await.map_err(|e| fail(&data, &user, e))?;
    Ok(HttpResponse::Created().json(ticket))
}

#[utoipa::path(
    delete,
    path = "/api/v1/session",
    responses((status = 204, description = "Session torn down")),
    tag = "session"
)]
pub async fn end_session(user: SessionUser, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    data.sessions.end(user.user_id);
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    post,
    path = "/api/v1/changes",
    request_body = ChangeEnvelope,
    params(("X-Change-Secret" = String, Header, description = "Shared secret of the change source")),
    responses(
        (status = 202, description = "Change fanned out", body = ChangeAccepted),
        (status = 400, description = "Unsupported or malformed change"),
        (status = 403, description = "Missing or wrong secret")
    ),
    tag = "changes"
)]
pub async fn ingest_change(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<ChangeEnvelope>,
) -> Result<HttpResponse, ApiError> {
    let provided = req.headers().get("X-Change-Secret").and_then(|v| v.to_str().ok());
    match (data.change_secret.as_deref(), provided) {
        (Some(expected), Some(given)) if expected == given => {}
        _ => return Err(ApiError::Forbidden),
    }
    let ChangeEnvelope { recipients, change } = payload.into_inner();
    let event = ChangeEvent::try_from(change).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let delivered = data.hub.publish(&event, &recipients);
    log::debug!("change {} on thread {} delivered to {delivered} receivers", event.kind(), event.thread_id());
    Ok(HttpResponse::Accepted().json(ChangeAccepted { kind: event.kind().to_string(), delivered }))
}

pub async fn render_metrics(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let handle = data.metrics.as_ref().ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok().content_type("text/plain; version=0.0.4").body(handle.render()))
}
