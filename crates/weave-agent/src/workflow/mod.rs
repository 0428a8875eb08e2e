//! Workflow definitions and the round-based DAG scheduler.
//!
//! A workflow is a list of steps, each bound to an agent by name, linked by
//! `next` edges. The scheduler starts at the entry step and, each round,
//! runs every step whose predecessors have all executed. Steps guarded by
//! an unsatisfied [`StepCondition`] are skipped but still count as
//! executed, so their successors can proceed.

pub mod condition;
pub mod definition;
pub mod scheduler;

pub use condition::{ConditionCheck, StepCondition};
pub use definition::{WorkflowDefinition, WorkflowStep};
pub use scheduler::{WorkflowRun, WorkflowScheduler};
