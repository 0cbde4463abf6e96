//! Configuration module for the converge engine.
//!
//! This module handles everything about the desired-state document:
//! - Parsing and deserializing `converge.yaml`
//! - Validation of declarations and settings
//! - Hashing attribute maps for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::AttributeHasher;
pub use parser::{find_document_file, DocumentParser, DEFAULT_DOCUMENT_FILES};
pub use spec::{
    ConnectionConfig, ConnectionMethod, DesiredDocument, EngineSettings, ForEach,
    LifecyclePolicy, ModuleDeclaration, OnFailure, ProvisionerConfig, ResourceDeclaration,
    ResourceKind, StateBackend, StateConfig,
};
pub use validator::{DocumentValidator, ValidationError, ValidationResult};
