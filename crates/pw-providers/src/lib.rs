//! PixelWatch Provider Definitions
//!
//! This crate compiles provider definition documents (JSON) into the
//! `ProviderDefinition`s the core engine runs, and ships a builtin catalog of
//! common tracking vendors.

pub mod catalog;
pub mod compile;
pub mod document;

pub use catalog::{builtin_docs, builtin_registry};
pub use compile::{build_registry, compile_provider, DefinitionError};
pub use document::{parse_provider_docs, ProviderDoc};
