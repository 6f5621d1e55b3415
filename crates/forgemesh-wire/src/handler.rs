//! Message handlers registered on a [`MeshNode`].
//!
//! Handlers run in registration order for every inbound message of their
//! type. Each call is isolated: an `Err` or a panic is logged and the next
//! handler still runs.

use crate::error::HandlerError;
use crate::message::MeshMessage;
use crate::node::MeshNode;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, warn};

/// Something that reacts to inbound messages of one type.
///
/// The node hands itself to the handler on every call, so handlers never
/// need to keep a reference back to the node they are registered on.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, node: &MeshNode, message: &MeshMessage) -> Result<(), HandlerError>;
}

/// Adapter turning a synchronous closure into a [`MessageHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&MeshNode, &MeshMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, node: &MeshNode, message: &MeshMessage) -> Result<(), HandlerError> {
        (self.0)(node, message)
    }
}

/// Run every handler against one message, containing failures per handler.
///
/// Returns the number of handlers that failed.
pub(crate) async fn run_handlers(
    node: &MeshNode,
    handlers: &[Arc<dyn MessageHandler>],
    message: &MeshMessage,
) -> usize {
    let mut failures = 0;
    for handler in handlers {
        match AssertUnwindSafe(handler.handle(node, message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures += 1;
                warn!(
                    message_type = %message.message_type(),
                    message_id = %message.id(),
                    error = %e,
                    "Handler failed"
                );
            }
            Err(panic) => {
                failures += 1;
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    message_type = %message.message_type(),
                    message_id = %message.id(),
                    reason = %reason,
                    "Handler panicked"
                );
            }
        }
    }
    failures
}
