pub mod condition;
pub mod plan;
pub mod result;
pub mod scheduler;

pub use condition::{CompareOp, LoopCondition};
pub use plan::{
    ExecutionPlan, HeuristicPlanner, OrchestrationPattern, PlannerClient, PlannerProposal,
    RequestContext,
};
pub use result::{IterationRecord, OrchestrationResult};
pub use scheduler::Scheduler;
