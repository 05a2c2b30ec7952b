use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{CaseId, FlagId, QueueId, RuleId, StatusId, UserId};
use super::flagging::{EntityFlags, FlagSubject};
use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Add,
    Remove,
}

/// Who caused a movement: a caseworker or the rule engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorType {
    Manual,
    RoutingEngine,
}

/// Entity a history record acted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEntity {
    Flag { id: FlagId, subject: FlagSubject },
    Queue { id: QueueId },
}

/// One add or remove of one flag or queue on a case. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHistoryRecord {
    pub id: u64,
    pub case_id: CaseId,
    pub entity: HistoryEntity,
    pub action: HistoryAction,
    pub orchestrator_type: OrchestratorType,
    pub orchestrator: UserId,
    /// Case status after the change.
    pub case_status: StatusId,
    /// Complete case-level flag set after the change.
    pub case_flags: BTreeSet<FlagId>,
    /// Complete queue set after the change.
    pub case_queues: BTreeSet<QueueId>,
    pub rule_identifier: Option<RuleId>,
    pub commit_marker: String,
    pub created_at: DateTime<Utc>,
}

/// Before/after state of one case transition handed to [`HistoryRecorder::record`].
#[derive(Debug, Clone)]
pub struct CaseChange<'a> {
    pub case_id: &'a CaseId,
    pub case_status: &'a StatusId,
    pub orchestrator_type: OrchestratorType,
    /// Acting caseworker; the configured system user when absent.
    pub acting_user: Option<&'a UserId>,
    pub flags: Vec<&'a EntityFlags>,
    pub queues_before: &'a BTreeSet<QueueId>,
    pub queues_after: &'a BTreeSet<QueueId>,
    /// Rule responsible for each added queue, when known.
    pub queue_rules: BTreeMap<QueueId, RuleId>,
    /// Attributed to changes with no more specific rule, removals included.
    pub rule_identifier: Option<RuleId>,
    pub case_flags: &'a BTreeSet<FlagId>,
}

/// Turns before/after sets into delta-only history records.
#[derive(Debug)]
pub struct HistoryRecorder {
    commit_marker: String,
    system_user: UserId,
    sequence: AtomicU64,
}

impl HistoryRecorder {
    pub fn new(commit_marker: impl Into<String>, system_user: UserId) -> Self {
        Self {
            commit_marker: commit_marker.into(),
            system_user,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.commit_marker.clone(), config.system_user.clone())
    }

    pub fn commit_marker(&self) -> &str {
        &self.commit_marker
    }

    /// One record per added or removed flag and queue; nothing for an empty delta.
    pub fn record(&self, change: &CaseChange<'_>) -> Vec<RoutingHistoryRecord> {
        let mut records = Vec::new();

        for entity in &change.flags {
            for flag in entity.added() {
                let rule = entity
                    .fired_by
                    .get(flag)
                    .cloned()
                    .or_else(|| change.rule_identifier.clone());
                records.push(self.build(
                    change,
                    HistoryEntity::Flag {
                        id: flag.clone(),
                        subject: entity.subject.clone(),
                    },
                    HistoryAction::Add,
                    rule,
                ));
            }
            for flag in entity.removed() {
                records.push(self.build(
                    change,
                    HistoryEntity::Flag {
                        id: flag.clone(),
                        subject: entity.subject.clone(),
                    },
                    HistoryAction::Remove,
                    change.rule_identifier.clone(),
                ));
            }
        }

        for queue in change.queues_after.difference(change.queues_before) {
            let rule = change
                .queue_rules
                .get(queue)
                .cloned()
                .or_else(|| change.rule_identifier.clone());
            records.push(self.build(
                change,
                HistoryEntity::Queue { id: queue.clone() },
                HistoryAction::Add,
                rule,
            ));
        }
        for queue in change.queues_before.difference(change.queues_after) {
            records.push(self.build(
                change,
                HistoryEntity::Queue { id: queue.clone() },
                HistoryAction::Remove,
                change.rule_identifier.clone(),
            ));
        }

        records
    }

    fn build(
        &self,
        change: &CaseChange<'_>,
        entity: HistoryEntity,
        action: HistoryAction,
        rule_identifier: Option<RuleId>,
    ) -> RoutingHistoryRecord {
        RoutingHistoryRecord {
            id: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            case_id: change.case_id.clone(),
            entity,
            action,
            orchestrator_type: change.orchestrator_type,
            orchestrator: change
                .acting_user
                .cloned()
                .unwrap_or_else(|| self.system_user.clone()),
            case_status: change.case_status.clone(),
            case_flags: change.case_flags.clone(),
            case_queues: change.queues_after.clone(),
            rule_identifier,
            commit_marker: self.commit_marker.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Append-only destination for history records; storage belongs to the host.
pub trait HistorySink: Send + Sync {
    /// Persist every record of one run, or none of them on error.
    fn append_all(&self, records: &[RoutingHistoryRecord]) -> Result<(), SinkError>;

    fn append(&self, record: RoutingHistoryRecord) -> Result<(), SinkError> {
        self.append_all(std::slice::from_ref(&record))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("history sink unavailable: {0}")]
    Unavailable(String),
    #[error("history record {0} rejected")]
    Rejected(u64),
}

/// Process-local sink, mostly useful for tests and single-process hosts.
#[derive(Debug, Default, Clone)]
pub struct InMemoryHistorySink {
    records: Arc<Mutex<Vec<RoutingHistoryRecord>>>,
}

impl InMemoryHistorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RoutingHistoryRecord> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistorySink for InMemoryHistorySink {
    fn append_all(&self, records: &[RoutingHistoryRecord]) -> Result<(), SinkError> {
        let mut guard = self
            .records
            .lock()
            .map_err(|_| SinkError::Unavailable("history sink mutex poisoned".to_string()))?;
        guard.extend_from_slice(records);
        Ok(())
    }
}
