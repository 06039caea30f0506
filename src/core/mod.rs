//! 核心编排层：错误与恢复、状态投影、会话监管、顶层编排器

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use error::{DialogError, RecoveryAction};
pub use orchestrator::{
    build_table, Disposition, OrchTrigger, Orchestrator, OrchestratorDeps, OrchestratorTable,
};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use state::{OrchestratorState, SessionSnapshot};
