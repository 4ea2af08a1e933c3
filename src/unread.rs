use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::block_list::BlockListFilter;
use crate::error::{ChatError, ChatResult};
use crate::gateway::{Gateway, GatewayError};
use crate::threads::ThreadRegistry;

/// Badge total across visible threads, observable through a watch channel.
pub struct UnreadCounter {
    gateway: Arc<dyn Gateway>,
    total: watch::Sender<u64>,
}

impl UnreadCounter {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        let (total, _) = watch::channel(0);
        Self { gateway, total }
    }

    /// Sum of unread counts over threads the block list leaves visible.
    pub fn recompute(&self, threads: &ThreadRegistry, blocks: &BlockListFilter) -> u64 {
        let total: u64 = threads.list_threads(blocks).iter().map(|t| u64::from(t.unread_count)).sum();
        self.total.send_if_modified(|current| {
            let changed = *current != total;
            *current = total;
            changed
        });
        metrics::gauge!("chat_unread_total", total as f64);
        total
    }

    pub fn total(&self) -> u64 {
        *self.total.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.total.subscribe()
    }

    /// Ask the backend for its figure. Only an expired session is an error;
    /// any other failure yields `None` and the local total stands.
    pub async fn refresh_from_server(&self) -> ChatResult<Option<u64>> {
        match self.gateway.unread_count().await {
            Ok(count) => {
                let local = self.total();
                if count != local {
                    debug!(server = count, local, "unread total differs from server");
                }
                Ok(Some(count))
            }
            Err(GatewayError::AuthExpired) => Err(ChatError::AuthExpired),
            Err(e) => {
                debug!(error = %e, "unread refresh failed");
                Ok(None)
            }
        }
    }
}
