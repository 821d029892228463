//! sqlrest-domain: Resource mapping and per-operation execution
//!
//! This crate contains the REST-over-SQL domain logic including:
//! - Operation descriptors, verbs and wire error codes
//! - Resource definitions built from configuration or code
//! - Href routing and access rules
//! - The phase pipeline and the Operation Executor
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                  sqlrest-domain                   │
//! ├──────────────────────────────────────────────────┤
//! │  operation/  - Descriptors, responses, errors     │
//! │  resource/   - Definitions, routing, access, hooks│
//! │  phase.rs    - The fixed phase list               │
//! │  executor.rs - Phase-by-phase operation executor  │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod executor;
pub mod operation;
pub mod phase;
pub mod resource;

// Re-export commonly used types at the crate root
pub use error::{DomainError, DomainResult};
pub use executor::{
    OperationContext, OperationEnv, OperationExecutor, PendingWrite, PhaseOutcome,
    ResourceExecutor, SharedTransaction,
};
pub use operation::{codes, OperationDescriptor, OperationError, OperationResponse, Verb};
pub use phase::{Phase, PHASE_COUNT};
pub use resource::{
    AccessPolicy, AccessRequest, AccessRule, HookContext, InternalRequester, NestedOutcome,
    ResourceDefinition, ResourceHooks, ResourceRegistry, ResourceSettings, Route, RulePolicy,
};
