//! LLM adapter: prompt in, text (usually JSON) out, with a provider
//! fallback chain. Callers never see a panic or an unexpected error;
//! the chain returns `None` when every provider fails, and they fall
//! back to defaults.

pub mod chain;
pub mod claude_cli;
pub mod codex_cli;
pub mod fence;
pub mod openrouter;
pub mod provider;

pub use chain::ProviderChain;
pub use fence::strip_code_fence;
pub use provider::{CompletionProvider, CompletionRequest, LlmError};
