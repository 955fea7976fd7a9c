//! Fallback chain: try providers in order until one returns a non-empty
//! result. Failures degrade to `None`, never to an error the caller has
//! to handle; slug generation, commit messages and summaries all have
//! non-LLM fallbacks.

use dmux_core::settings::SlugProvider;
use tokio_util::sync::CancellationToken;

use crate::claude_cli::ClaudeCliProvider;
use crate::codex_cli::CodexCliProvider;
use crate::openrouter::OpenRouterProvider;
use crate::provider::{CompletionProvider, CompletionRequest};

pub struct ProviderChain {
    providers: Vec<Box<dyn CompletionProvider>>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Box<dyn CompletionProvider>>) -> Self {
        ProviderChain { providers }
    }

    /// Build the chain for a configured provider preference. `auto` means
    /// claude, then codex, then OpenRouter; an explicit choice pins that
    /// provider alone so failures stay visible instead of silently
    /// switching models.
    pub fn for_provider(preference: SlugProvider) -> Self {
        let providers: Vec<Box<dyn CompletionProvider>> = match preference {
            SlugProvider::Auto => vec![
                Box::new(ClaudeCliProvider),
                Box::new(CodexCliProvider),
                Box::new(OpenRouterProvider::from_env()),
            ],
            SlugProvider::Claude => vec![Box::new(ClaudeCliProvider)],
            SlugProvider::Codex => vec![Box::new(CodexCliProvider)],
            SlugProvider::Openrouter => vec![Box::new(OpenRouterProvider::from_env())],
        };
        ProviderChain::new(providers)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Run the chain. Returns the first non-empty completion, or `None`
    /// when every provider is unavailable, fails, times out, or the
    /// caller aborts.
    pub async fn complete(
        &self,
        req: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Option<String> {
        for provider in &self.providers {
            if cancel.is_cancelled() {
                return None;
            }
            if !provider.available() {
                continue;
            }
            match provider.complete(req, cancel).await {
                Ok(text) if !text.trim().is_empty() => {
                    tracing::debug!(provider = provider.name(), "completion succeeded");
                    return Some(text);
                }
                Ok(_) => {
                    tracing::warn!(provider = provider.name(), "empty completion, trying next");
                }
                Err(e) => {
                    tracing::warn!(provider = provider.name(), error = %e, "provider failed, trying next");
                }
            }
        }
        None
    }
}
