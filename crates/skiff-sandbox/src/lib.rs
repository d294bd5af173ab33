pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod files;
pub mod http_backend;
pub mod lifecycle;
pub mod shell;

pub use backend::{ComputeBackend, ExecOutput, UnitInfo, UnitSpec};
pub use config::{HealthPollConfig, SandboxSettings};
pub use controller::{SandboxController, DEFAULT_LOG_TAIL, MAX_LOG_TAIL};
pub use error::{Result, SandboxError};
pub use http_backend::HttpComputeBackend;
pub use lifecycle::{
    agent_environment, CreateSandboxRequest, HttpLifecycleProvider, LifecycleProvider,
    ResumeSandboxRequest, SandboxLifecycle,
};
