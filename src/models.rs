use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

// Server-assigned UUIDs for threads, messages, users and listings
pub type Id = Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Thread {
    pub id: Id,
    pub listing_id: Id,
    pub buyer_id: Id,
    pub seller_id: Id,
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub last_read_at: Option<DateTime<Utc>>, // viewer's read position
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub placeholder: bool, // synthesized from an event, metadata still pending
}

impl Thread {
    /// Minimal entry for a thread we only know from a feed event.
    pub fn placeholder(id: Id, viewer: Id, counterpart: Id) -> Self {
        Self {
            id,
            listing_id: Uuid::nil(),
            buyer_id: counterpart,
            seller_id: viewer,
            last_message_at: None,
            unread_count: 0,
            last_read_at: None,
            placeholder: true,
        }
    }

    /// The other participant from `viewer`'s point of view.
    pub fn counterpart(&self, viewer: Id) -> Id {
        if self.buyer_id == viewer { self.seller_id } else { self.buyer_id }
    }

    pub fn has_participant(&self, user: Id) -> bool {
        self.buyer_id == user || self.seller_id == user
    }
}

/// Delivery status. Ordered: a message only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Message {
    pub id: Id,
    pub thread_id: Id,
    pub sender_id: Id,
    pub text: Option<String>,
    #[serde(default)]
    pub image_keys: Vec<String>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn has_text(&self) -> bool {
        has_text(self.text.as_deref())
    }

    pub fn has_images(&self) -> bool {
        !self.image_keys.is_empty()
    }

    /// A message with neither text nor images must not exist.
    pub fn is_empty(&self) -> bool {
        !self.has_text() && !self.has_images()
    }
}

pub(crate) fn has_text(text: Option<&str>) -> bool {
    text.map(|t| !t.trim().is_empty()).unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewMessage {
    pub thread_id: Id,
    pub text: Option<String>,
    #[serde(default)]
    pub image_keys: Vec<String>,
}

impl NewMessage {
    pub fn is_empty(&self) -> bool {
        !has_text(self.text.as_deref()) && self.image_keys.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Participant {
    pub thread_id: Id,
    pub user_id: Id,
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BlockRelation {
    pub blocked_user_id: Id,
    pub blocked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSignal {
    pub thread_id: Id,
    pub user_id: Id,
    pub typing: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UploadTicket {
    pub upload_url: String,
    pub asset_key: String,
}

// ---------------- HTTP request bodies ----------------

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewThread {
    pub listing_id: Id,
    pub seller_id: Option<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SendMessage {
    pub text: Option<String>,
    #[serde(default)]
    pub image_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EditMessage {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ActiveThread {
    pub thread_id: Option<Id>,
}
