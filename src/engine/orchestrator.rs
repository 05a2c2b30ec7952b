use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::info;

use super::criteria::EvaluationWarning;
use super::domain::{
    CaseId, CaseSnapshot, FlagAttachments, FlagId, QueueId, RuleSet, StatusId, UserId,
};
use super::flagging::{EntityFlags, FlagSubject, FlaggingEngine};
use super::history::{
    CaseChange, HistoryRecorder, HistorySink, OrchestratorType, RoutingHistoryRecord, SinkError,
};
use super::locks::{CaseGuard, CaseLock, GuardError};
use super::registry::CriteriaRegistry;
use super::routing::RoutingEngine;
use crate::config::EngineConfig;

/// Case lifecycle event that triggered a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Application submitted; routing may advance the status.
    Submission,
    /// Caseworker changed the status; routing keeps it.
    StatusChange,
    /// Rules or attributes changed on an open case.
    Reevaluation,
}

impl Transition {
    pub const fn keep_status(self) -> bool {
        !matches!(self, Transition::Submission)
    }

    pub const fn label(self) -> &'static str {
        match self {
            Transition::Submission => "submission",
            Transition::StatusChange => "status_change",
            Transition::Reevaluation => "reevaluation",
        }
    }
}

/// Caseworker edits applied by [`Orchestrator::apply_manual`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManualChange {
    pub add_flags: Vec<(FlagSubject, FlagId)>,
    pub remove_flags: Vec<(FlagSubject, FlagId)>,
    pub add_queues: Vec<QueueId>,
    pub remove_queues: Vec<QueueId>,
}

/// New case state plus the history appended for it.
#[derive(Debug, Clone)]
pub struct OrchestratorOutcome {
    /// State for the caller to persist; `version` is bumped when anything changed.
    pub snapshot: CaseSnapshot,
    pub records: Vec<RoutingHistoryRecord>,
    pub warnings: Vec<EvaluationWarning>,
    pub blocking_flags: BTreeSet<FlagId>,
    pub next_status: Option<StatusId>,
}

impl OrchestratorOutcome {
    pub fn is_unchanged(&self) -> bool {
        self.records.is_empty() && self.next_status.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(
        "case {case_id} was modified concurrently (expected version {expected}, found {found})"
    )]
    ConcurrentCaseMutation {
        case_id: CaseId,
        expected: u64,
        found: u64,
    },
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("invalid case snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Drives one case through flagging, routing and history for a single transition.
///
/// Callers must serialise runs per case, either themselves or through
/// [`Orchestrator::run_locked`]. The guard only detects violations.
pub struct Orchestrator<S, G> {
    flagging: FlaggingEngine,
    routing: RoutingEngine,
    recorder: HistoryRecorder,
    sink: Arc<S>,
    guard: Arc<G>,
}

impl<S, G> Orchestrator<S, G>
where
    S: HistorySink + 'static,
    G: CaseGuard + 'static,
{
    pub fn new(
        registry: Arc<CriteriaRegistry>,
        config: &EngineConfig,
        sink: Arc<S>,
        guard: Arc<G>,
    ) -> Self {
        Self {
            flagging: FlaggingEngine::new(Arc::clone(&registry)),
            routing: RoutingEngine::new(
                registry,
                config.same_tier_policy,
                config.max_status_advances,
            ),
            recorder: HistoryRecorder::from_config(config),
            sink,
            guard,
        }
    }

    /// Flag, route and record `snapshot`. Running again on the returned
    /// snapshot with unchanged attributes appends nothing.
    pub fn run(
        &self,
        snapshot: CaseSnapshot,
        rules: &RuleSet,
        transition: Transition,
    ) -> Result<OrchestratorOutcome, OrchestratorError> {
        validate(&snapshot)?;
        self.check_version(&snapshot)?;

        let flagging = self.flagging.evaluate(&snapshot, rules);
        let mut updated = snapshot.clone();
        flagging.apply_to(&mut updated);

        let routing = self
            .routing
            .evaluate(&updated, rules, transition.keep_status());
        routing.apply_to(&mut updated);

        let records = self.recorder.record(&CaseChange {
            case_id: &snapshot.case_id,
            case_status: &updated.status,
            orchestrator_type: OrchestratorType::RoutingEngine,
            acting_user: None,
            flags: flagging.entities().collect(),
            queues_before: &snapshot.queues,
            queues_after: &updated.queues,
            queue_rules: routing.queue_rules(),
            rule_identifier: None,
            case_flags: &updated.flags.attached,
        });

        if updated != snapshot {
            updated.version = next_version(&snapshot)?;
        }

        self.check_version(&snapshot)?;
        self.append(&records)?;

        let mut warnings = flagging.warnings;
        warnings.extend(routing.warnings.iter().cloned());

        info!(
            case_id = %snapshot.case_id,
            transition = transition.label(),
            status = %updated.status,
            queues = updated.queues.len(),
            records = records.len(),
            warnings = warnings.len(),
            "case transition evaluated"
        );

        Ok(OrchestratorOutcome {
            snapshot: updated,
            records,
            warnings,
            blocking_flags: flagging.blocking_flags,
            next_status: routing.next_status,
        })
    }

    /// [`Orchestrator::run`] under the host's per-case lock.
    pub fn run_locked<L: CaseLock>(
        &self,
        locks: &L,
        snapshot: CaseSnapshot,
        rules: &RuleSet,
        transition: Transition,
    ) -> Result<OrchestratorOutcome, OrchestratorError> {
        let case_id = snapshot.case_id.clone();
        locks.with_case_lock(&case_id, || self.run(snapshot, rules, transition))
    }

    /// Apply caseworker flag and queue edits, recorded as manual history.
    ///
    /// Added flags become manual so rules never remove them. Removed flags
    /// that a rule manages become suppressed so rules never re-add them.
    pub fn apply_manual(
        &self,
        snapshot: CaseSnapshot,
        rules: &RuleSet,
        change: &ManualChange,
        acting_user: &UserId,
    ) -> Result<OrchestratorOutcome, OrchestratorError> {
        validate(&snapshot)?;
        self.check_version(&snapshot)?;

        let mut updated = snapshot.clone();
        for (subject, flag) in &change.add_flags {
            let flags = attachments_mut(&mut updated, subject)?;
            flags.attached.insert(flag.clone());
            flags.manual.insert(flag.clone());
            flags.suppressed.remove(flag);
        }
        for (subject, flag) in &change.remove_flags {
            let rule_managed = rules
                .flagging_rules_for(subject.level())
                .any(|rule| &rule.flag == flag);
            let flags = attachments_mut(&mut updated, subject)?;
            flags.attached.remove(flag);
            flags.manual.remove(flag);
            if rule_managed {
                flags.suppressed.insert(flag.clone());
            }
        }
        for queue in &change.remove_queues {
            updated.queues.remove(queue);
            updated.assignments.retain(|assignment| &assignment.queue != queue);
        }
        updated.queues.extend(change.add_queues.iter().cloned());

        let entities = entity_deltas(&snapshot, &updated);
        let records = self.recorder.record(&CaseChange {
            case_id: &snapshot.case_id,
            case_status: &updated.status,
            orchestrator_type: OrchestratorType::Manual,
            acting_user: Some(acting_user),
            flags: entities.iter().collect(),
            queues_before: &snapshot.queues,
            queues_after: &updated.queues,
            queue_rules: BTreeMap::new(),
            rule_identifier: None,
            case_flags: &updated.flags.attached,
        });

        if updated != snapshot {
            updated.version = next_version(&snapshot)?;
        }

        self.check_version(&snapshot)?;
        self.append(&records)?;

        info!(
            case_id = %snapshot.case_id,
            user = %acting_user,
            records = records.len(),
            "manual case change recorded"
        );

        Ok(OrchestratorOutcome {
            blocking_flags: blocking_flags(&updated, rules),
            snapshot: updated,
            records,
            warnings: Vec::new(),
            next_status: None,
        })
    }

    fn check_version(&self, snapshot: &CaseSnapshot) -> Result<(), OrchestratorError> {
        match self.guard.current_version(&snapshot.case_id)? {
            Some(found) if found != snapshot.version => {
                Err(OrchestratorError::ConcurrentCaseMutation {
                    case_id: snapshot.case_id.clone(),
                    expected: snapshot.version,
                    found,
                })
            }
            _ => Ok(()),
        }
    }

    /// One batch per run so a sink failure leaves no partial history.
    fn append(&self, records: &[RoutingHistoryRecord]) -> Result<(), OrchestratorError> {
        if records.is_empty() {
            return Ok(());
        }
        self.sink.append_all(records)?;
        Ok(())
    }
}

/// Product and destination ids key flag history, so they must be unique.
fn validate(snapshot: &CaseSnapshot) -> Result<(), OrchestratorError> {
    if snapshot.case_id.0.trim().is_empty() {
        return Err(OrchestratorError::InvalidSnapshot(
            "case id is empty".to_string(),
        ));
    }

    let mut products = BTreeSet::new();
    if let Some(product) = snapshot
        .products
        .iter()
        .find(|product| !products.insert(product.id.as_str()))
    {
        return Err(OrchestratorError::InvalidSnapshot(format!(
            "duplicate product '{}' on case {}",
            product.id, snapshot.case_id
        )));
    }

    let mut destinations = BTreeSet::new();
    if let Some(destination) = snapshot
        .destinations
        .iter()
        .find(|destination| !destinations.insert(destination.id.as_str()))
    {
        return Err(OrchestratorError::InvalidSnapshot(format!(
            "duplicate destination '{}' on case {}",
            destination.id, snapshot.case_id
        )));
    }

    Ok(())
}

fn next_version(snapshot: &CaseSnapshot) -> Result<u64, OrchestratorError> {
    snapshot.version.checked_add(1).ok_or_else(|| {
        OrchestratorError::InvalidSnapshot(format!(
            "version of case {} cannot be incremented",
            snapshot.case_id
        ))
    })
}

fn attachments_mut<'a>(
    case: &'a mut CaseSnapshot,
    subject: &FlagSubject,
) -> Result<&'a mut FlagAttachments, OrchestratorError> {
    let case_id = case.case_id.clone();
    match subject {
        FlagSubject::Case => Ok(&mut case.flags),
        FlagSubject::Product(id) => case
            .products
            .iter_mut()
            .find(|product| &product.id == id)
            .map(|product| &mut product.flags)
            .ok_or_else(|| {
                OrchestratorError::InvalidSnapshot(format!("no product '{id}' on case {case_id}"))
            }),
        FlagSubject::Destination(id) => case
            .destinations
            .iter_mut()
            .find(|destination| &destination.id == id)
            .map(|destination| &mut destination.flags)
            .ok_or_else(|| {
                OrchestratorError::InvalidSnapshot(format!(
                    "no destination '{id}' on case {case_id}"
                ))
            }),
    }
}

fn entity_deltas(before: &CaseSnapshot, after: &CaseSnapshot) -> Vec<EntityFlags> {
    let delta = |subject: FlagSubject, before: &FlagAttachments, after: &FlagAttachments| {
        EntityFlags {
            subject,
            before: before.attached.clone(),
            after: after.attached.clone(),
            fired_by: BTreeMap::new(),
        }
    };

    let mut deltas = vec![delta(FlagSubject::Case, &before.flags, &after.flags)];
    for (old, new) in before.products.iter().zip(&after.products) {
        deltas.push(delta(
            FlagSubject::Product(old.id.clone()),
            &old.flags,
            &new.flags,
        ));
    }
    for (old, new) in before.destinations.iter().zip(&after.destinations) {
        deltas.push(delta(
            FlagSubject::Destination(old.id.clone()),
            &old.flags,
            &new.flags,
        ));
    }
    deltas
}

fn blocking_flags(case: &CaseSnapshot, rules: &RuleSet) -> BTreeSet<FlagId> {
    let entity_flags = std::iter::once(&case.flags)
        .chain(case.products.iter().map(|product| &product.flags))
        .chain(case.destinations.iter().map(|destination| &destination.flags));

    entity_flags
        .flat_map(|flags| flags.attached.iter())
        .filter(|flag| {
            rules
                .flags
                .get(*flag)
                .map(|flag| flag.blocks_finalising)
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}
