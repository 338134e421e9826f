//! Crate-wide error type.
//!
//! Each subsystem defines its own `thiserror` enum next to the code that
//! produces it; [`ChorusError`] aggregates them at the runtime boundary so
//! branch runners and administrative surfaces deal with a single sum type.

use thiserror::Error;

use crate::ai::provider::ProviderError;
use crate::channels::traits::ChannelError;
use crate::database::store::StoreError;
use crate::security::policy::PolicyError;
use crate::tools::traits::ToolError;

/// Top-level error for runtime operations.
#[derive(Debug, Error)]
pub enum ChorusError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("unknown branch #{0}")]
    UnknownBranch(u64),

    #[error("session {0:?} not found")]
    SessionNotFound(String),

    #[error("process error: {0}")]
    Process(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChorusError>;
