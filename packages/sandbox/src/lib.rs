// ABOUTME: Sandbox lifecycle management for Corral
// ABOUTME: Hardened Docker execution contexts, streaming, and stale-context reconciliation

pub mod docker;
pub mod engine;
pub mod error;
pub mod manager;
pub mod types;
pub mod validate;

// Re-export commonly used types
pub use docker::DockerEngine;
pub use engine::{
    EngineContainer, EngineError, EngineErrorKind, EngineResult, ExecutionEngine, RawLineStream,
};
pub use error::{Result, SandboxError};
pub use manager::{SandboxManager, StreamInput};
pub use types::{
    CacheMount, ContainerSpec, ContainerState, ContextKind, ContextRef, EphemeralOutcome,
    ExecutionContextRecord, HardeningConfig, ReconcileFailure, ReconcileReport, ResourceLimits,
    SandboxConfig,
};
pub use validate::{SlugValidator, IDENTIFIER_PATTERN};
