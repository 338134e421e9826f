//! Chat-transport abstractions.
//!
//! The runtime never talks to a concrete messenger; it consumes a
//! [`Channel`] that can send and edit messages, and a [`PresenceSink`]
//! that receives activity updates.  Concrete transports (Discord, test
//! doubles) live outside the core.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("send failed: {0}")]
    Send(String),
    #[error("edit failed: {0}")]
    Edit(String),
    #[error("unknown message: {0}")]
    UnknownMessage(u64),
}

/// Opaque handle to a message the runtime sent on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle {
    pub id: u64,
}

/// Transport for agent output.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send a message, optionally as a reply to an earlier one.  Returns a
    /// handle usable for later edits and reply routing.
    async fn send(
        &self,
        content: &str,
        reference: Option<&MessageHandle>,
    ) -> Result<MessageHandle, ChannelError>;

    /// Edit a previously sent message in place.
    async fn edit(&self, handle: &MessageHandle, content: &str) -> Result<(), ChannelError>;
}

/// Kill-button affordance attached to a branch's status message.
///
/// The transport renders it however it likes; pressing it invokes the
/// wired callback with the branch id.
#[derive(Clone)]
pub struct KillBranchView {
    kill: Arc<dyn Fn(u64) -> BoxFuture<'static, ()> + Send + Sync>,
}

impl KillBranchView {
    pub fn new(kill: Arc<dyn Fn(u64) -> BoxFuture<'static, ()> + Send + Sync>) -> Self {
        Self { kill }
    }

    /// The user pressed the kill button for `branch_id`.
    pub async fn pressed(&self, branch_id: u64) {
        (self.kill)(branch_id).await;
    }
}

/// Aggregate activity shown as presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub num_tasks: usize,
    pub num_agents: usize,
}

/// Receives debounced presence updates.
#[async_trait]
pub trait PresenceSink: Send + Sync {
    async fn update(&self, activity: Activity);
}
