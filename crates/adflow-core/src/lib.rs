//! adflow core - creative pipeline on the workflow kernel
//!
//! Wires the AI ad-creative pipeline onto [`adflow_kernel`]:
//! - Agent boundary ([`AgentClient`]) plus a deterministic simulator
//! - The built-in `creative-campaign` definition
//! - A dashboard facade ([`WorkflowService`]) with a JSON envelope
//!
//! # Example
//!
//! ```rust,ignore
//! use adflow_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = Arc::new(WorkflowEngine::from_config(EngineConfig::default())?);
//! let service = WorkflowService::with_builtin(engine, Arc::new(SimulatedAgentClient::new()))?;
//!
//! let run = service
//!     .create_run(&CREATIVE_CAMPAIGN.into(), serde_json::json!({ "product": "sneakers" }), vec![])
//!     .await?;
//! let run = service.start(run.id).await?;
//! assert_eq!(run.status, RunStatus::Interrupted);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod agent;
pub mod error;
pub mod pipeline;
pub mod service;

pub use agent::{AgentClient, AgentKind, AgentRequest, SimulatedAgentClient};
pub use error::{AgentError, ServiceError};
pub use pipeline::{creative_campaign, install_builtin, CREATIVE_CAMPAIGN};
pub use service::{DashboardRequest, DashboardResponse, WorkflowService};

/// Prelude module for common imports
pub mod prelude {
    //! Kernel prelude plus the core facade
    pub use crate::{
        AgentClient, AgentError, AgentKind, DashboardRequest, DashboardResponse,
        ServiceError, SimulatedAgentClient, WorkflowService, CREATIVE_CAMPAIGN,
    };
    pub use adflow_kernel::prelude::*;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
