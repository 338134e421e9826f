//! Provider-agnostic LLM layer: neutral types, the provider trait, the
//! concrete Anthropic/OpenAI adapters, and context-window bookkeeping.

pub mod context;
pub mod provider;
pub mod providers;
pub mod types;

pub use provider::{LLMProvider, ProviderError};
pub use types::{ChatMessage, LLMResponse, Role, ToolCall, Usage};
