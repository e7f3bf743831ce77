// src/lib.rs
//! hostpilot core: a multi-tenant control plane that turns natural-language
//! infrastructure requests into human-approved, step-gated shell command
//! plans executed over persistent SSH sessions.

pub mod audit;
pub mod config;
pub mod errors;
pub mod llm;
pub mod logging;
pub mod plan;
pub mod profiler;
pub mod session;
pub mod ssh;
pub mod vault;

pub use audit::{AuditSink, InMemoryAuditSink, JsonlAuditSink};
pub use config::AppConfig;
pub use errors::CoreError;
pub use llm::{PlanGenerator, PlanGeneratorPipeline};
pub use plan::{Plan, PlanOrchestrator, Step, StepOutcome};
pub use profiler::HostProfile;
pub use session::{Session, SessionRegistry, SessionStatus};
pub use vault::{CredentialMaterial, CredentialVault};
