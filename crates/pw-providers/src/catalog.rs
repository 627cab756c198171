//! Builtin provider catalog
//!
//! Definitions for widely deployed tracking vendors, compiled from an embedded
//! JSON document. Order in the document is registration order.

use crate::compile::{build_registry, DefinitionError};
use crate::document::{parse_provider_docs, ProviderDoc};
use pw_core::ProviderRegistry;

const BUILTIN_PROVIDERS: &str = include_str!("../data/builtin.json");

/// Parsed builtin definitions, in registration order.
pub fn builtin_docs() -> Result<Vec<ProviderDoc>, DefinitionError> {
    Ok(parse_provider_docs(BUILTIN_PROVIDERS)?)
}

/// Registry holding every builtin provider.
pub fn builtin_registry() -> Result<ProviderRegistry, DefinitionError> {
    build_registry(builtin_docs()?)
}
