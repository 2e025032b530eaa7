//! Sandboxed execution of short analytical Python programs.
//!
//! A [`SandboxManager`] takes an [`ExecutionRequest`] (source, named JSON
//! context values and a policy tier), screens the source with a static
//! validator, then runs it in a throwaway interpreter process whose imports,
//! builtins, database access and resource usage are bounded by the
//! [`Policy`]. Every outcome comes back as an [`ExecutionResult`].
//!
//! ```no_run
//! use analysis_sandbox::{create_default_sandbox, ExecutionRequest};
//! use serde_json::json;
//!
//! # async fn run() -> analysis_sandbox::Result<()> {
//! let sandbox = create_default_sandbox()?;
//! let request = ExecutionRequest::new("import math\nresult = math.sqrt(x)", "hardened")
//!     .with_binding("x", json!(16));
//! let outcome = sandbox.execute(request).await;
//! assert_eq!(outcome.result_value, Some(json!(4.0)));
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod cache;
pub mod config;
pub mod engine;
pub mod environment;
pub mod errors;
pub mod gate;
pub mod guard;
pub mod host;
pub mod manager;
pub mod native;
pub mod policy;
pub mod request;
pub mod safe_data;
pub mod sandbox_builder;
pub mod state;
pub mod validator;
pub mod workspace;

pub use analysis::{AnalysisError, AnalysisKind, NamedAnalysis};
pub use config::EngineConfig;
pub use engine::{BackendInfo, HostBackend};
pub use errors::{Result, SandboxError};
pub use manager::SandboxManager;
pub use native::PythonProcessBackend;
pub use policy::{Policy, PolicySet};
pub use request::{ExecutionRequest, ExecutionResult, FailureReason};
pub use safe_data::{SafeArray, SafeTable, Scalar};
pub use sandbox_builder::{create_default_sandbox, create_sandbox_with_config};
pub use validator::{CodeValidator, ValidationOutcome};
