//! Per-workflow provider handle with a lazily memoized client.

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::headless::client::{
    ClientRegistry,
    HeadlessClient,
    ProviderExtensions,
    ProviderKind,
};

#[derive(Debug, thiserror::Error)]
#[error("no client registered for provider: {0}")]
pub struct UnknownProvider(pub ProviderKind);

/// Provider type plus launch extensions. The client is resolved from the
/// registry once and shared by every subsequent call.
pub struct AgentProvider {
    kind: ProviderKind,
    extensions: ProviderExtensions,
    /// Forward-compat bag for extension keys the typed variants don't
    /// model yet.
    extra: serde_json::Map<String, serde_json::Value>,
    client: OnceCell<Arc<dyn HeadlessClient>>,
}

impl AgentProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            extensions: ProviderExtensions::for_kind(kind),
            extra: serde_json::Map::new(),
            client: OnceCell::new(),
        }
    }

    pub fn with_extensions(extensions: ProviderExtensions) -> Self {
        Self {
            kind: extensions.kind(),
            extensions,
            extra: serde_json::Map::new(),
            client: OnceCell::new(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn extensions(&self) -> &ProviderExtensions {
        &self.extensions
    }

    pub fn extra(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.extra
    }

    pub fn set_extra(&mut self, key: &str, value: serde_json::Value) {
        self.extra.insert(key.to_string(), value);
    }

    /// Memoized: repeated calls share one client instance.
    pub async fn client(
        &self,
        registry: &ClientRegistry,
    ) -> Result<Arc<dyn HeadlessClient>, UnknownProvider> {
        self.client
            .get_or_try_init(|| async {
                registry.get(self.kind).ok_or(UnknownProvider(self.kind))
            })
            .await
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_memoized_across_calls() {
        let registry = ClientRegistry::with_defaults();
        let provider = AgentProvider::new(ProviderKind::Claude);

        let first = provider.client(&registry).await.unwrap();
        let second = provider.client(&registry).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_unknown_provider_errors() {
        let registry = ClientRegistry::new();
        let provider = AgentProvider::new(ProviderKind::Gemini);
        assert!(provider.client(&registry).await.is_err());
    }
}
