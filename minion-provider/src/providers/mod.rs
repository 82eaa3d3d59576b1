//! Provider implementations.

mod claude;
mod mock;

pub use claude::ClaudeProvider;
pub use mock::MockProvider;

use crate::Provider;
use std::sync::Arc;

/// Resolve a provider by name. `claude` is the default.
pub fn provider_for(name: &str) -> Option<Arc<dyn Provider>> {
    match name {
        "claude" | "" => Some(Arc::new(ClaudeProvider::default())),
        "mock" => Some(Arc::new(MockProvider::default())),
        _ => None,
    }
}
