//! Case flagging, tiered queue routing and routing history.
//!
//! A run loads one [`RuleSet`], lets the [`FlaggingEngine`] compute flag sets for
//! the case and its products and destinations, hands the updated case to the
//! [`RoutingEngine`], and records the deltas through the [`HistoryRecorder`].
//! The [`Orchestrator`] ties the three together for a single case transition.

pub mod criteria;
pub mod domain;
pub mod flagging;
pub mod history;
pub mod locks;
pub mod orchestrator;
pub mod registry;
pub mod routing;

#[cfg(test)]
mod tests;

pub use criteria::{Criteria, CriteriaError, CriteriaScope, EvaluationWarning, Operator};
pub use domain::{
    ActivationStatus, AttributeValue, Attributes, CaseAssignment, CaseId, CaseSnapshot,
    CaseTypeId, CountryCode, Destination, Flag, FlagAttachments, FlagId, FlagLevel, FlaggingRule,
    GovUser, Product, Queue, QueueId, RoutingRule, RuleId, RuleSet, StatusId, TeamId, UserId,
    WorkflowSequence,
};
pub use flagging::{EntityFlags, FlagSubject, FlaggingEngine, FlaggingOutcome, Subject};
pub use history::{
    CaseChange, HistoryAction, HistoryEntity, HistoryRecorder, HistorySink, InMemoryHistorySink,
    OrchestratorType, RoutingHistoryRecord, SinkError,
};
pub use locks::{CaseGuard, CaseLock, GuardError, InMemoryCaseGuard, InMemoryCaseLocks};
pub use orchestrator::{
    ManualChange, Orchestrator, OrchestratorError, OrchestratorOutcome, Transition,
};
pub use registry::{
    CriteriaRegistry, FlaggingCriterion, FlaggingRegistry, RoutingCriterion, RoutingRegistry,
};
pub use routing::{RoutingEngine, RoutingOutcome, SameTierPolicy, TeamRouting};
