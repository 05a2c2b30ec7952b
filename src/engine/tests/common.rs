use std::collections::BTreeSet;
use std::num::NonZeroU16;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::config::EngineConfig;
use crate::engine::{
    ActivationStatus, AttributeValue, CaseSnapshot, CaseTypeId, CountryCode, Criteria,
    CriteriaRegistry, Destination, Flag, FlagId, FlagLevel, FlaggingRule, GovUser,
    InMemoryCaseGuard, InMemoryHistorySink, Operator, Orchestrator, Product, Queue, QueueId,
    RoutingRule, RuleId, RuleSet, StatusId, TeamId, UserId, WorkflowSequence,
};

pub(super) fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, 9, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) fn status(value: &str) -> StatusId {
    StatusId::from(value)
}

pub(super) fn flag_ids(ids: &[&str]) -> BTreeSet<FlagId> {
    ids.iter().map(|id| FlagId::from(*id)).collect()
}

pub(super) fn queue_ids(ids: &[&str]) -> BTreeSet<QueueId> {
    ids.iter().map(|id| QueueId::from(*id)).collect()
}

pub(super) fn workflow() -> WorkflowSequence {
    WorkflowSequence {
        draft: Some(status("draft")),
        sequence: vec![
            status("submitted"),
            status("initial_checks"),
            status("under_review"),
            status("under_final_review"),
            status("finalised"),
        ],
        terminal: [status("finalised"), status("withdrawn")].into_iter().collect(),
    }
}

pub(super) fn flag(id: &str, level: FlagLevel) -> Flag {
    Flag {
        id: FlagId::from(id),
        name: id.replace('-', " "),
        level,
        status: ActivationStatus::Active,
        blocks_finalising: false,
    }
}

pub(super) fn queue(id: &str, team: &str) -> Queue {
    Queue {
        id: QueueId::from(id),
        name: format!("{id} work queue"),
        team: TeamId::from(team),
    }
}

pub(super) fn flagging_rule(
    id: &str,
    level: FlagLevel,
    flag: &str,
    criteria: Criteria,
) -> FlaggingRule {
    FlaggingRule {
        id: RuleId::from(id),
        team: TeamId::from("admin"),
        level,
        flag: FlagId::from(flag),
        status: ActivationStatus::Active,
        criteria,
        created_at: at(1),
    }
}

pub(super) fn siel_criteria() -> Criteria {
    Criteria::declarative("case_type", Operator::Equals, AttributeValue::text("SIEL"))
}

pub(super) fn routing_rule(
    id: &str,
    team: &str,
    tier: u16,
    queue: &str,
    created_day: u32,
) -> RoutingRule {
    RoutingRule {
        id: RuleId::from(id),
        team: TeamId::from(team),
        queue: QueueId::from(queue),
        tier: NonZeroU16::new(tier).expect("tier is positive"),
        status: Some(status("submitted")),
        case_types: BTreeSet::new(),
        country: None,
        flags_to_include: BTreeSet::new(),
        flags_to_exclude: BTreeSet::new(),
        user: None,
        active: true,
        criteria: None,
        description: String::new(),
        created_at: at(created_day),
    }
}

pub(super) fn in_country(mut rule: RoutingRule, country: &str) -> RoutingRule {
    rule.country = Some(CountryCode::from(country));
    rule
}

pub(super) fn for_case_types(mut rule: RoutingRule, case_types: &[&str]) -> RoutingRule {
    rule.case_types = case_types.iter().map(|value| CaseTypeId::from(*value)).collect();
    rule
}

/// Reference data shared by most tests: licensing and enforcement teams,
/// case/product/destination flags, and two caseworkers.
pub(super) fn base_rules() -> RuleSet {
    let mut blocking = flag("embargo-risk", FlagLevel::Destination);
    blocking.blocks_finalising = true;

    RuleSet::default()
        .with_workflow(workflow())
        .with_flag(flag("eu-licence", FlagLevel::Case))
        .with_flag(flag("military-goods", FlagLevel::Product))
        .with_flag(blocking)
        .with_queue(queue("licensing-fr", "licensing"))
        .with_queue(queue("licensing-eu", "licensing"))
        .with_queue(queue("licensing-triage", "licensing"))
        .with_queue(queue("enforcement-checks", "enforcement"))
        .with_queue(queue("tau-review", "tau"))
        .with_user(GovUser {
            id: UserId::from("alex"),
            active: true,
        })
        .with_user(GovUser {
            id: UserId::from("sam"),
            active: false,
        })
}

/// SIEL case submitted with one product and a French consignee.
pub(super) fn french_case() -> CaseSnapshot {
    let mut case = CaseSnapshot::new("case-1", "SIEL", "submitted");
    case.products.push(Product {
        id: "good-1".to_string(),
        attributes: [(
            "control_list_entries".to_string(),
            AttributeValue::list(["ML1a", "ML2"]),
        )]
        .into_iter()
        .collect(),
        flags: Default::default(),
    });
    case.destinations.push(Destination {
        id: "consignee-1".to_string(),
        country: CountryCode::from("FR"),
        attributes: Default::default(),
        flags: Default::default(),
    });
    case
}

pub(super) fn orchestrator(
    registry: CriteriaRegistry,
    config: &EngineConfig,
) -> (
    Orchestrator<InMemoryHistorySink, InMemoryCaseGuard>,
    Arc<InMemoryHistorySink>,
    Arc<InMemoryCaseGuard>,
) {
    let sink = Arc::new(InMemoryHistorySink::new());
    let guard = Arc::new(InMemoryCaseGuard::new());
    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        config,
        Arc::clone(&sink),
        Arc::clone(&guard),
    );
    (orchestrator, sink, guard)
}
