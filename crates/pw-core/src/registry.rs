//! Provider Registry
//!
//! Holds providers in registration order. That order is the deterministic tie-break
//! for equal-confidence matches, so the registry never reorders entries.

use std::sync::Arc;

use crate::error::RegistryError;
use crate::provider::{DefinedProvider, Provider, ProviderDefinition};

/// Ordered set of immutable providers.
///
/// Cheap to share: workers hold an `Arc<ProviderRegistry>` snapshot and never
/// mutate it.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.providers.iter().map(|p| p.id())).finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from definitions, failing on the first duplicate id.
    pub fn from_definitions<I>(definitions: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = ProviderDefinition>,
    {
        let mut registry = Self::new();
        for definition in definitions {
            registry.register(DefinedProvider::new(definition))?;
        }
        Ok(registry)
    }

    /// Register a provider. Fails if the id already exists.
    pub fn register<P: Provider + 'static>(&mut self, provider: P) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(provider))
    }

    pub fn register_arc(&mut self, provider: Arc<dyn Provider>) -> Result<(), RegistryError> {
        if self.contains(provider.id()) {
            return Err(RegistryError::DuplicateProvider(provider.id().to_string()));
        }
        log::debug!("Registered provider '{}'", provider.id());
        self.providers.push(provider);
        Ok(())
    }

    /// Remove a provider. Updating a provider is unregister-then-register.
    pub fn unregister(&mut self, id: &str) -> Result<Arc<dyn Provider>, RegistryError> {
        let idx = self
            .providers
            .iter()
            .position(|p| p.id() == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(self.providers.remove(idx))
    }

    pub fn lookup(&self, id: &str) -> Result<&Arc<dyn Provider>, RegistryError> {
        self.providers
            .iter()
            .find(|p| p.id() == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    #[inline]
    pub fn contains(&self, id: &str) -> bool {
        self.providers.iter().any(|p| p.id() == id)
    }

    /// Providers in registration order.
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ParameterSchema, PatternConfig};

    fn definition(id: &str) -> ProviderDefinition {
        ProviderDefinition {
            id: id.to_string(),
            name: id.to_uppercase(),
            category: "analytics".to_string(),
            patterns: PatternConfig::default(),
            schema: ParameterSchema::default(),
            rules: Vec::new(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ProviderRegistry::new();
        registry.register(DefinedProvider::new(definition("a"))).expect("first register");
        assert_eq!(registry.lookup("a").expect("present").name(), "A");
        assert_eq!(
            registry.lookup("missing").err(),
            Some(RegistryError::NotFound("missing".to_string()))
        );
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ProviderRegistry::new();
        registry.register(DefinedProvider::new(definition("a"))).expect("first register");
        assert_eq!(
            registry.register(DefinedProvider::new(definition("a"))),
            Err(RegistryError::DuplicateProvider("a".to_string()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registration_order_preserved() {
        let registry =
            ProviderRegistry::from_definitions(["c", "a", "b"].map(definition)).expect("unique ids");
        let ids: Vec<&str> = registry.all().map(|p| p.id()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_unregister_then_register() {
        let mut registry = ProviderRegistry::from_definitions(["a", "b"].map(definition)).expect("unique ids");
        registry.unregister("a").expect("present");
        assert!(registry.unregister("a").is_err());
        registry.register(DefinedProvider::new(definition("a"))).expect("re-register");
        let ids: Vec<&str> = registry.all().map(|p| p.id()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
