use crate::models::{
    ActiveThread, BlockRelation, EditMessage, Message, MessageStatus, NewThread, SendMessage, Thread, UploadTicket,
};
use crate::routes::{ActiveThreadChanged, ChangeAccepted, ChangeEnvelope, ImageRemoved, TypingState, UnreadTotal};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::list_threads,
        crate::routes::open_thread,
        crate::routes::delete_thread,
        crate::routes::set_active_thread,
        crate::routes::mark_thread_read,
        crate::routes::list_messages,
        crate::routes::send_message,
        crate::routes::typing_state,
        crate::routes::broadcast_typing,
        crate::routes::edit_message,
        crate::routes::delete_message,
        crate::routes::delete_message_image,
        crate::routes::list_blocked,
        crate::routes::block_user,
        crate::routes::unblock_user,
        crate::routes::unread_total,
        crate::routes::create_upload,
        crate::routes::end_session,
        crate::routes::ingest_change,
    ),
    components(schemas(
        Thread, NewThread, ActiveThread, Message, MessageStatus, SendMessage, EditMessage,
        BlockRelation, UploadTicket,
        ActiveThreadChanged, TypingState, ImageRemoved, UnreadTotal, ChangeEnvelope, ChangeAccepted
    )),
    tags(
        (name = "threads", description = "Conversation threads"),
        (name = "messages", description = "Messages and images"),
        (name = "presence", description = "Typing indicators"),
        (name = "blocks", description = "Blocked users"),
        (name = "session", description = "Chat session lifecycle"),
        (name = "changes", description = "Change-feed ingestion"),
    )
)]
pub struct ApiDoc;
