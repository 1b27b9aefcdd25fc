pub mod agents;
pub mod config;
pub mod error;
pub mod ids;
pub mod log;
pub mod runtime;
pub mod store;

// Protocol
pub mod envelope;
pub mod validator;

// Plans and their runs
pub mod execution;
pub mod plan;
pub mod planning;

// Agent communication
pub mod dispatch;
pub mod hitl;
pub mod orchestrator;

pub use agents::{AgentConfig, AgentMode, AgentRegistry};
pub use config::Settings;
pub use dispatch::{DispatchContext, DispatchOutcome, DispatchService, QuestionRequest, TaskRequest};
pub use envelope::{FailureCode, MessageEnvelope};
pub use error::{Error, Result};
pub use execution::{ExecutionService, ExecutionStatus, PlanExecution, TaskRecord};
pub use hitl::{HitlService, QuestionOutcome, UserAnswer, UserQuestion};
pub use log::{LogLevel, Logger};
pub use orchestrator::{Orchestrator, PlanRequestOutcome};
pub use plan::{Plan, PlanStage, PlanStep};
pub use planning::{PlanSummary, PlanningService};
pub use store::Store;
