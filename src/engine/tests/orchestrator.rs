use std::sync::{Arc, Mutex};

use super::common::*;
use crate::config::EngineConfig;
use crate::engine::{
    Criteria, CriteriaRegistry, FlagId, FlagLevel, FlagSubject, HistoryAction, HistoryEntity,
    HistorySink, InMemoryCaseGuard, InMemoryCaseLocks, ManualChange, Orchestrator,
    OrchestratorError, OrchestratorType, QueueId, RoutingHistoryRecord, RuleSet, SinkError,
    Transition, UserId,
};
use crate::error::AppError;

fn flagged_and_routed_rules() -> RuleSet {
    base_rules()
        .with_flagging_rule(flagging_rule("r1", FlagLevel::Case, "eu-licence", siel_criteria()))
        .with_flagging_rule(flagging_rule(
            "r-embargo",
            FlagLevel::Destination,
            "embargo-risk",
            Criteria::registered("r-embargo"),
        ))
        .with_routing_rule({
            let mut rule = routing_rule("eu", "licensing", 1, "licensing-eu", 1);
            rule.flags_to_include = flag_ids(&["eu-licence"]);
            rule
        })
}

fn registry() -> CriteriaRegistry {
    let mut registry = CriteriaRegistry::new();
    registry
        .flagging_mut()
        .register(FlagLevel::Destination, "r-embargo", |subject| {
            subject.attribute("country") == Some(crate::engine::AttributeValue::text("FR"))
        });
    registry
}

#[test]
fn siel_flag_is_recorded_once_and_rerun_is_silent() {
    let rules = base_rules().with_flagging_rule(flagging_rule(
        "r1",
        FlagLevel::Case,
        "eu-licence",
        siel_criteria(),
    ));
    let (orchestrator, sink, _) = orchestrator(CriteriaRegistry::new(), &EngineConfig::default());

    let first = orchestrator
        .run(french_case(), &rules, Transition::Reevaluation)
        .expect("first run");
    assert_eq!(first.records.len(), 1);
    assert_eq!(
        first.records[0].entity,
        HistoryEntity::Flag {
            id: FlagId::from("eu-licence"),
            subject: FlagSubject::Case,
        }
    );
    assert_eq!(first.records[0].action, HistoryAction::Add);
    assert_eq!(first.snapshot.version, 1);

    let second = orchestrator
        .run(first.snapshot.clone(), &rules, Transition::Reevaluation)
        .expect("second run");
    assert!(second.is_unchanged());
    assert_eq!(second.snapshot, first.snapshot);
    assert_eq!(sink.len(), 1);
}

#[test]
fn routing_uses_flags_computed_in_the_same_run() {
    let rules = flagged_and_routed_rules();
    let (orchestrator, sink, _) = orchestrator(registry(), &EngineConfig::default());

    let outcome = orchestrator
        .run(french_case(), &rules, Transition::Submission)
        .expect("run succeeds");

    assert_eq!(outcome.snapshot.queues, queue_ids(&["licensing-eu"]));
    assert_eq!(outcome.snapshot.flags.attached, flag_ids(&["eu-licence"]));
    assert_eq!(outcome.blocking_flags, flag_ids(&["embargo-risk"]));
    assert_eq!(outcome.next_status, None);

    let queue_record = outcome
        .records
        .iter()
        .find(|record| matches!(record.entity, HistoryEntity::Queue { .. }))
        .expect("queue movement recorded");
    assert_eq!(queue_record.rule_identifier.as_ref().map(|rule| rule.0.as_str()), Some("eu"));
    assert_eq!(queue_record.orchestrator_type, OrchestratorType::RoutingEngine);
    assert_eq!(queue_record.orchestrator, UserId::from("system"));
    assert_eq!(sink.records(), outcome.records);
}

#[test]
fn submission_advances_status_when_nothing_matches() {
    let mut rules = base_rules();
    rules.routing_rules.push({
        let mut rule = routing_rule("checks", "enforcement", 1, "enforcement-checks", 1);
        rule.status = Some(status("initial_checks"));
        rule
    });
    let (orchestrator, _, _) = orchestrator(CriteriaRegistry::new(), &EngineConfig::default());

    let submitted = orchestrator
        .run(french_case(), &rules, Transition::Submission)
        .expect("submission");
    assert_eq!(submitted.next_status, Some(status("initial_checks")));
    assert_eq!(submitted.snapshot.status, status("initial_checks"));
    assert_eq!(submitted.records[0].case_status, status("initial_checks"));

    let changed = orchestrator
        .run(french_case(), &rules, Transition::StatusChange)
        .expect("status change");
    assert_eq!(changed.next_status, None);
    assert!(changed.records.is_empty());
}

#[test]
fn stale_snapshot_is_rejected_without_history() {
    let rules = flagged_and_routed_rules();
    let (orchestrator, sink, guard) = orchestrator(registry(), &EngineConfig::default());
    let case = french_case();
    guard.set_version(&case.case_id, 3);

    let error = orchestrator
        .run(case, &rules, Transition::Submission)
        .expect_err("version mismatch");

    match &error {
        OrchestratorError::ConcurrentCaseMutation {
            case_id,
            expected,
            found,
        } => {
            assert_eq!(case_id.0, "case-1");
            assert_eq!(*expected, 0);
            assert_eq!(*found, 3);
        }
        other => panic!("expected concurrent mutation, got {other:?}"),
    }
    assert!(sink.is_empty());
    assert!(AppError::from(error).is_retryable());
}

#[test]
fn persisted_version_round_trip_keeps_runs_idempotent() {
    let rules = flagged_and_routed_rules();
    let (orchestrator, sink, guard) = orchestrator(registry(), &EngineConfig::default());
    let case = french_case();
    guard.set_version(&case.case_id, case.version);

    let first = orchestrator
        .run(case, &rules, Transition::Submission)
        .expect("first run");
    guard.set_version(&first.snapshot.case_id, first.snapshot.version);

    let second = orchestrator
        .run(first.snapshot.clone(), &rules, Transition::Reevaluation)
        .expect("second run");

    assert!(second.records.is_empty());
    assert_eq!(second.snapshot.version, first.snapshot.version);
    assert_eq!(sink.len(), first.records.len());
}

#[test]
fn duplicate_product_ids_are_invalid() {
    let (orchestrator, _, _) = orchestrator(CriteriaRegistry::new(), &EngineConfig::default());
    let mut case = french_case();
    let duplicate = case.products[0].clone();
    case.products.push(duplicate);

    let result = orchestrator.run(case, &base_rules(), Transition::Reevaluation);

    assert!(matches!(result, Err(OrchestratorError::InvalidSnapshot(_))));
}

#[test]
fn manual_removal_suppresses_rule_flags() {
    let rules = flagged_and_routed_rules();
    let (orchestrator, _, _) = orchestrator(registry(), &EngineConfig::default());
    let routed = orchestrator
        .run(french_case(), &rules, Transition::Submission)
        .expect("routed");
    let user = UserId::from("alex");

    let change = ManualChange {
        remove_flags: vec![(FlagSubject::Case, FlagId::from("eu-licence"))],
        add_flags: vec![(
            FlagSubject::Product("good-1".to_string()),
            FlagId::from("military-goods"),
        )],
        ..ManualChange::default()
    };
    let manual = orchestrator
        .apply_manual(routed.snapshot, &rules, &change, &user)
        .expect("manual change");

    assert_eq!(manual.records.len(), 2);
    assert!(manual
        .records
        .iter()
        .all(|record| record.orchestrator_type == OrchestratorType::Manual
            && record.orchestrator == user
            && record.rule_identifier.is_none()));
    assert!(manual.snapshot.flags.suppressed.contains(&FlagId::from("eu-licence")));
    assert!(manual.snapshot.products[0]
        .flags
        .manual
        .contains(&FlagId::from("military-goods")));

    let rerun = orchestrator
        .run(manual.snapshot.clone(), &rules, Transition::Reevaluation)
        .expect("rerun");
    assert!(!rerun.snapshot.flags.attached.contains(&FlagId::from("eu-licence")));
    assert!(rerun.snapshot.products[0]
        .flags
        .attached
        .contains(&FlagId::from("military-goods")));
    assert!(rerun
        .records
        .iter()
        .all(|record| !matches!(record.entity, HistoryEntity::Flag { .. })));
}

#[test]
fn manual_queue_edits_are_recorded() {
    let (orchestrator, _, _) = orchestrator(CriteriaRegistry::new(), &EngineConfig::default());
    let mut case = french_case();
    case.queues = queue_ids(&["licensing-eu"]);
    let change = ManualChange {
        add_queues: vec![QueueId::from("tau-review")],
        remove_queues: vec![QueueId::from("licensing-eu")],
        ..ManualChange::default()
    };

    let outcome = orchestrator
        .apply_manual(case, &base_rules(), &change, &UserId::from("alex"))
        .expect("manual change");

    assert_eq!(outcome.snapshot.queues, queue_ids(&["tau-review"]));
    let actions: Vec<HistoryAction> = outcome.records.iter().map(|record| record.action).collect();
    assert_eq!(actions, vec![HistoryAction::Add, HistoryAction::Remove]);
    assert_eq!(outcome.snapshot.version, 1);
}

#[test]
fn manual_change_on_unknown_destination_is_invalid() {
    let (orchestrator, _, _) = orchestrator(CriteriaRegistry::new(), &EngineConfig::default());
    let change = ManualChange {
        add_flags: vec![(
            FlagSubject::Destination("end-user-9".to_string()),
            FlagId::from("embargo-risk"),
        )],
        ..ManualChange::default()
    };

    let result = orchestrator.apply_manual(
        french_case(),
        &base_rules(),
        &change,
        &UserId::from("alex"),
    );

    assert!(matches!(result, Err(OrchestratorError::InvalidSnapshot(_))));
}

#[test]
fn run_locked_serialises_through_the_lock() {
    let rules = flagged_and_routed_rules();
    let (orchestrator, _, _) = orchestrator(registry(), &EngineConfig::default());
    let locks = InMemoryCaseLocks::new();

    let outcome = orchestrator
        .run_locked(&locks, french_case(), &rules, Transition::Submission)
        .expect("locked run");

    assert!(!outcome.records.is_empty());
    assert_eq!(locks.held(), 0);
}

/// Sink that stages a batch and commits it only if every record is accepted.
#[derive(Default)]
struct StagingSink {
    reject_at: Option<usize>,
    batches: Mutex<usize>,
    committed: Mutex<Vec<RoutingHistoryRecord>>,
}

impl StagingSink {
    fn rejecting_at(index: usize) -> Self {
        Self {
            reject_at: Some(index),
            ..Self::default()
        }
    }

    fn committed(&self) -> Vec<RoutingHistoryRecord> {
        self.committed.lock().expect("committed lock").clone()
    }

    fn batches(&self) -> usize {
        *self.batches.lock().expect("batch lock")
    }
}

impl HistorySink for StagingSink {
    fn append_all(&self, records: &[RoutingHistoryRecord]) -> Result<(), SinkError> {
        *self.batches.lock().expect("batch lock") += 1;
        let mut staged = Vec::new();
        for (index, record) in records.iter().enumerate() {
            if self.reject_at == Some(index) {
                return Err(SinkError::Rejected(record.id));
            }
            staged.push(record.clone());
        }
        self.committed.lock().expect("committed lock").extend(staged);
        Ok(())
    }
}

fn staging_orchestrator(sink: &Arc<StagingSink>) -> Orchestrator<StagingSink, InMemoryCaseGuard> {
    Orchestrator::new(
        Arc::new(registry()),
        &EngineConfig::default(),
        Arc::clone(sink),
        Arc::new(InMemoryCaseGuard::new()),
    )
}

#[test]
fn sink_failures_surface_as_errors() {
    let sink = Arc::new(StagingSink::rejecting_at(0));

    let result = staging_orchestrator(&sink).run(
        french_case(),
        &flagged_and_routed_rules(),
        Transition::Submission,
    );

    assert!(matches!(
        result,
        Err(OrchestratorError::Sink(SinkError::Rejected(1)))
    ));
    assert!(sink.committed().is_empty());
}

#[test]
fn run_history_is_appended_as_one_batch() {
    let sink = Arc::new(StagingSink::default());

    let outcome = staging_orchestrator(&sink)
        .run(french_case(), &flagged_and_routed_rules(), Transition::Submission)
        .expect("run succeeds");

    assert_eq!(outcome.records.len(), 3);
    assert_eq!(sink.batches(), 1);
    assert_eq!(sink.committed(), outcome.records);
}

#[test]
fn rejection_mid_batch_leaves_no_history() {
    let sink = Arc::new(StagingSink::rejecting_at(1));

    let result = staging_orchestrator(&sink).run(
        french_case(),
        &flagged_and_routed_rules(),
        Transition::Submission,
    );

    assert!(matches!(
        result,
        Err(OrchestratorError::Sink(SinkError::Rejected(2)))
    ));
    assert_eq!(sink.batches(), 1);
    assert!(sink.committed().is_empty());
}

#[test]
fn unchanged_runs_do_not_touch_the_sink() {
    let sink = Arc::new(StagingSink::default());

    let outcome = staging_orchestrator(&sink)
        .run(french_case(), &base_rules(), Transition::Reevaluation)
        .expect("run succeeds");

    assert!(outcome.is_unchanged());
    assert_eq!(sink.batches(), 0);
}

#[test]
fn exhausted_version_is_invalid_and_records_nothing() {
    let rules = flagged_and_routed_rules();
    let (orchestrator, sink, _) = orchestrator(registry(), &EngineConfig::default());
    let mut case = french_case();
    case.version = u64::MAX;

    let result = orchestrator.run(case, &rules, Transition::Submission);

    assert!(matches!(result, Err(OrchestratorError::InvalidSnapshot(_))));
    assert!(sink.is_empty());
}
