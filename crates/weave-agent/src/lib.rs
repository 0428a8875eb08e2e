pub mod agent;
pub mod cost;
pub mod orchestrator;
pub mod pricing;
pub mod recorder;
pub mod retry;
pub mod runtime;
pub mod workflow;

pub use agent::Agent;
pub use cost::{Confidence, CostEstimate, CostEstimator, EstimateSource, StepCostEstimate};
pub use orchestrator::{AgentTask, Orchestrator, WorkflowTask};
pub use pricing::{ModelPricing, PricingTable};
pub use recorder::ExecutionRecorder;
pub use retry::calculate_backoff;
pub use runtime::AgentRuntime;
pub use workflow::{StepCondition, WorkflowDefinition, WorkflowRun, WorkflowScheduler, WorkflowStep};
