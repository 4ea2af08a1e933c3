pub mod auth;
pub mod block_list;
pub mod config;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod messages;
pub mod models;
pub mod openapi;
pub mod presence;
pub mod router;
pub mod routes;
pub mod session;
pub mod threads;
pub mod unread;

// Re-export commonly used items for tests / external users
pub use config::{ChatConfig, ServiceConfig};
pub use error::{ApiError, ChatError, ChatResult};
pub use feed::{ChangeEvent, ChangeFeed, FeedHub};
pub use gateway::{Gateway, GatewayError, GatewayFactory};
pub use presence::{PresenceChannel, PresenceHub};
pub use routes::{config as routes_config, AppState};
pub use session::{ChatCore, ChatSession, SessionManager};
