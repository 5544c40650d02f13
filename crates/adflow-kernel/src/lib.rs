//! adflow kernel
//!
//! Execution core for creative workflow runs:
//! 1. **Step Registry**: the static step graph of a definition, validated up front
//! 2. **State Store**: versioned run snapshots with atomic read-modify-write
//! 3. **Execution Engine**: drives runs step by step with retries and branching
//! 4. **Approval Gate**: human-in-the-loop interruptions with deadlines
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use adflow_kernel::prelude::*;
//!
//! let registry = StepRegistry::new("campaign")
//!     .with_step(StepDefinition::task("draft", draft_unit).then("review"))?
//!     .with_step(StepDefinition::approval("review").on_approve("publish").on_reject("draft"))?
//!     .with_step(StepDefinition::task("publish", publish_unit).finish())?;
//!
//! let engine = WorkflowEngine::new(EngineConfig::default(), Arc::new(MemoryStore::new()));
//! engine.register_definition(registry)?;
//!
//! let run = engine.create_run(&"campaign".into(), json!({ "brand": "acme" })).await?;
//! let run = engine.start(run.id).await?; // interrupted at `review`
//! let run = engine.resume(run.id, ApprovalDecision::Approve, None).await?;
//! assert_eq!(run.status, RunStatus::Completed);
//! ```

pub mod approval;
pub mod config;
pub mod engine;
pub mod error;
/// Hash-chained transition history
pub mod logging;
pub mod registry;
/// Step retry policy and backoff
pub mod retry;
/// Legal run and step status transitions
pub mod state_machine;
pub mod store;
pub mod types;
pub mod unit;

pub use error::*;
pub use types::*;

/// Common imports for engine users
pub mod prelude {
    pub use crate::approval::{ApprovalDecision, ApprovalRecord, InterruptMode, PendingInterrupt};
    pub use crate::config::{ConfigError, EngineConfig, StoreConfig};
    pub use crate::engine::WorkflowEngine;
    pub use crate::error::{EngineError, StepError, StepErrorKind, StoreError, ValidationError};
    pub use crate::logging::{TransitionEvent, TransitionLog};
    pub use crate::registry::{Edge, EdgeTarget, Guard, StepDefinition, StepKind, StepRegistry};
    pub use crate::retry::RetryPolicy;
    pub use crate::store::{MemoryStore, RunFilter, SqliteStore, WorkflowStore};
    pub use crate::types::{
        DefinitionId, Failure, FailureReason, RunId, RunStatus, StepId, StepRecord, StepStatus,
        WorkflowRun,
    };
    pub use crate::unit::{unit_fn, StepContext, StepUnit};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running with strict debugging enabled
pub const fn strict_debug() -> bool {
    cfg!(feature = "strict-debug")
}
