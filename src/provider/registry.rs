//! Provider registration by resource type prefix.

use std::sync::Arc;
use tracing::debug;

use crate::error::ProviderError;

use super::interface::Provider;

/// Providers keyed by resource type prefix.
///
/// A prefix `aws` serves `aws_instance` and `aws_vpc`. When several
/// prefixes match, the longest wins.
#[derive(Default, Clone)]
pub struct ProviderSet {
    providers: Vec<(String, Arc<dyn Provider>)>,
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.providers.iter().map(|(prefix, _)| prefix))
            .finish()
    }
}

impl ProviderSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider for a prefix, replacing any previous one.
    pub fn register(&mut self, prefix: impl Into<String>, provider: Arc<dyn Provider>) {
        let prefix = prefix.into();
        debug!("Registering provider {} for prefix '{prefix}'", provider.name());
        self.providers.retain(|(p, _)| *p != prefix);
        self.providers.push((prefix, provider));
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, prefix: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.register(prefix, provider);
        self
    }

    /// Finds the provider serving a resource type.
    ///
    /// # Errors
    ///
    /// Returns `UnknownResourceType` if no prefix matches.
    pub fn resolve(&self, resource_type: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.providers
            .iter()
            .filter(|(prefix, _)| {
                resource_type == prefix
                    || resource_type
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('_'))
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, provider)| Arc::clone(provider))
            .ok_or_else(|| ProviderError::UnknownResourceType {
                resource_type: resource_type.to_string(),
            })
    }

    /// Registered prefixes.
    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|(p, _)| p.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::NullProvider;

    #[test]
    fn test_longest_prefix_wins() {
        let set = ProviderSet::new()
            .with("null", Arc::new(NullProvider::named("short")))
            .with("null_special", Arc::new(NullProvider::named("long")));

        assert_eq!(set.resolve("null_instance").expect("match").name(), "short");
        assert_eq!(set.resolve("null_special_disk").expect("match").name(), "long");
        assert_eq!(set.resolve("null").expect("match").name(), "short");
    }

    #[test]
    fn test_prefix_needs_separator() {
        let set = ProviderSet::new().with("null", Arc::new(NullProvider::new()));
        assert!(matches!(
            set.resolve("nullable_thing"),
            Err(ProviderError::UnknownResourceType { .. })
        ));
    }
}
