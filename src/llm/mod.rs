//! Classification backend integration.
//!
//! The pipeline talks to an [`LlmProvider`]; [`AnthropicProvider`] is the
//! production implementation over the Messages API.

pub mod anthropic;
pub mod provider;
pub mod retry;

pub use anthropic::AnthropicProvider;
pub use provider::*;
pub use retry::RetryPolicy;

use std::sync::Arc;

use crate::config::ScanConfig;

/// Create the classification backend from configuration.
pub fn create_provider(config: &ScanConfig) -> Arc<dyn LlmProvider> {
    tracing::info!("Using Anthropic (model: {})", config.model);
    Arc::new(AnthropicProvider::new(
        config.api_key.clone(),
        config.model.clone(),
    ))
}
