//! # rbox-core
//!
//! Sandboxed execution engine for untrusted R scripts. Callers stage files
//! into a per-session workspace, submit R source, and get back either a
//! rendered image, captured text, or a classified failure.
//!
//! ## Components
//!
//! - [`workspace`]: per-session directory trees, staging and path containment
//! - [`script`]: the R harness wrapped around caller code
//! - [`executors`]: isolation backends, the environment pool and the run controller
//! - [`packages`]: on-demand R package installs with per-package single-flight
//! - [`extract`]: classification of harness output into an `ExecutionResult`
//! - [`engine`]: the facade tying them together
//!
//! ## Example
//!
//! ```rust,no_run
//! use rbox_core::{ConfigLoader, Engine, ExecutionResult, SessionId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(ConfigLoader::from_env()?).await?;
//!     let session = SessionId::new("demo");
//!     let request = engine.text_request(&session, "summary(c(1, 2, 3))", None)?;
//!     match engine.execute(&request).await {
//!         ExecutionResult::Success(artifact) => println!("{:?}", artifact),
//!         ExecutionResult::Failure(failure) => eprintln!("{}: {}", failure.kind, failure.message),
//!     }
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod errors;
pub mod executors;
pub mod extract;
pub mod packages;
pub mod script;
pub mod types;
pub mod workspace;

pub use config::{ConfigLoader, RboxConfig};
pub use engine::Engine;
pub use errors::{
    ConfigError, EnvironmentError, FailureKind, PackageError, RequestError, SandboxError,
    WorkspaceError,
};
pub use executors::{IsolationBackend, RunOutcome};
pub use packages::PackageDescriptor;
pub use types::{
    Artifact, ExecutionFailure, ExecutionRequest, ExecutionResult, ImageFormat, ImageParams,
    OutputKind, SessionId,
};
pub use workspace::{FileFilter, FileKind};
