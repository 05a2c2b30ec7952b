use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::criteria::{CriteriaError, CriteriaScope};
use super::domain::{CaseSnapshot, FlagLevel, RuleId};
use super::flagging::Subject;

/// Code-defined flagging predicate.
pub type FlaggingCriterion = Arc<dyn Fn(&Subject<'_>) -> bool + Send + Sync>;

/// Code-defined routing predicate.
pub type RoutingCriterion = Arc<dyn Fn(&CaseSnapshot) -> bool + Send + Sync>;

/// Flagging functions keyed by level and rule id.
#[derive(Clone, Default)]
pub struct FlaggingRegistry {
    functions: HashMap<(FlagLevel, RuleId), FlaggingCriterion>,
}

impl FlaggingRegistry {
    /// Store `criterion` for `rule_id` at `level`, replacing any earlier registration.
    pub fn register<F>(
        &mut self,
        level: FlagLevel,
        rule_id: impl Into<String>,
        criterion: F,
    ) -> &mut Self
    where
        F: Fn(&Subject<'_>) -> bool + Send + Sync + 'static,
    {
        let rule_id = RuleId(rule_id.into());
        debug!(%level, %rule_id, "registered flagging criteria");
        self.functions.insert((level, rule_id), Arc::new(criterion));
        self
    }

    pub fn has(&self, level: FlagLevel, rule_id: &RuleId) -> bool {
        self.functions.contains_key(&(level, rule_id.clone()))
    }

    pub fn get(
        &self,
        level: FlagLevel,
        rule_id: &RuleId,
    ) -> Result<&FlaggingCriterion, CriteriaError> {
        self.functions
            .get(&(level, rule_id.clone()))
            .ok_or_else(|| CriteriaError::CriteriaNotImplemented {
                scope: CriteriaScope::Flagging(level),
                rule_id: rule_id.clone(),
            })
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Routing functions keyed by rule id only.
#[derive(Clone, Default)]
pub struct RoutingRegistry {
    functions: HashMap<RuleId, RoutingCriterion>,
}

impl RoutingRegistry {
    pub fn register<F>(&mut self, rule_id: impl Into<String>, criterion: F) -> &mut Self
    where
        F: Fn(&CaseSnapshot) -> bool + Send + Sync + 'static,
    {
        let rule_id = RuleId(rule_id.into());
        debug!(%rule_id, "registered routing criteria");
        self.functions.insert(rule_id, Arc::new(criterion));
        self
    }

    pub fn has(&self, rule_id: &RuleId) -> bool {
        self.functions.contains_key(rule_id)
    }

    pub fn get(&self, rule_id: &RuleId) -> Result<&RoutingCriterion, CriteriaError> {
        self.functions
            .get(rule_id)
            .ok_or_else(|| CriteriaError::CriteriaNotImplemented {
                scope: CriteriaScope::Routing,
                rule_id: rule_id.clone(),
            })
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Both criteria namespaces, populated at process start and read-only afterwards.
///
/// Share it behind an `Arc`; evaluation only ever takes `&self`.
#[derive(Clone, Default)]
pub struct CriteriaRegistry {
    flagging: FlaggingRegistry,
    routing: RoutingRegistry,
}

impl CriteriaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flagging(&self) -> &FlaggingRegistry {
        &self.flagging
    }

    pub fn flagging_mut(&mut self) -> &mut FlaggingRegistry {
        &mut self.flagging
    }

    pub fn routing(&self) -> &RoutingRegistry {
        &self.routing
    }

    pub fn routing_mut(&mut self) -> &mut RoutingRegistry {
        &mut self.routing
    }
}

impl fmt::Debug for CriteriaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flagging: Vec<String> = self
            .flagging
            .functions
            .keys()
            .map(|(level, rule_id)| format!("{level}/{rule_id}"))
            .collect();
        flagging.sort();
        let mut routing: Vec<&str> = self
            .routing
            .functions
            .keys()
            .map(|rule_id| rule_id.0.as_str())
            .collect();
        routing.sort();

        f.debug_struct("CriteriaRegistry")
            .field("flagging", &flagging)
            .field("routing", &routing)
            .finish()
    }
}
