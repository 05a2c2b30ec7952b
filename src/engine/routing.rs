use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU16;
use std::sync::Arc;

use tracing::{debug, warn};

use super::criteria::EvaluationWarning;
use super::domain::{
    CaseAssignment, CaseSnapshot, CountryCode, FlagId, QueueId, RoutingRule, RuleId, RuleSet,
    StatusId, TeamId,
};
use super::registry::CriteriaRegistry;

/// How matching rules at the winning tier of one team are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameTierPolicy {
    /// Only the most recently created matching rule contributes.
    #[default]
    MostRecent,
    /// Every matching rule at the tier contributes its queue.
    Union,
}

impl SameTierPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "most_recent" | "most-recent" => Some(Self::MostRecent),
            "union" => Some(Self::Union),
            _ => None,
        }
    }
}

/// Queues and assignments one team contributes for this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamRouting {
    pub team: TeamId,
    pub tier: NonZeroU16,
    /// Contributing rules, most recent first.
    pub rules: Vec<RuleId>,
    pub queues: BTreeMap<QueueId, RuleId>,
    pub assignments: BTreeSet<CaseAssignment>,
}

/// Result of routing a case.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingOutcome {
    pub before_queues: BTreeSet<QueueId>,
    pub queues: BTreeSet<QueueId>,
    pub before_assignments: BTreeSet<CaseAssignment>,
    pub assignments: BTreeSet<CaseAssignment>,
    pub teams: Vec<TeamRouting>,
    /// Status the case was advanced to because nothing matched earlier statuses.
    pub next_status: Option<StatusId>,
    pub warnings: Vec<EvaluationWarning>,
}

impl RoutingOutcome {
    /// Routing rule responsible for each newly contributed queue.
    pub fn queue_rules(&self) -> BTreeMap<QueueId, RuleId> {
        self.teams
            .iter()
            .flat_map(|team| team.queues.iter())
            .map(|(queue, rule)| (queue.clone(), rule.clone()))
            .collect()
    }

    pub fn is_unchanged(&self) -> bool {
        self.next_status.is_none()
            && self.before_queues == self.queues
            && self.before_assignments == self.assignments
    }

    pub fn apply_to(&self, case: &mut CaseSnapshot) {
        if let Some(status) = &self.next_status {
            case.status = status.clone();
        }
        case.queues = self.queues.clone();
        case.assignments = self.assignments.clone();
    }
}

/// Flags and countries routing predicates are checked against.
struct RoutingParameters {
    flags: BTreeSet<FlagId>,
    countries: BTreeSet<CountryCode>,
}

/// Tiered, team-scoped queue routing.
///
/// Teams are evaluated independently. Within a team the lowest tier with a
/// matching rule wins and higher tiers are never consulted. A team's
/// contribution replaces the queues it owns on the case; queues of teams with
/// no match this pass are left alone.
pub struct RoutingEngine {
    registry: Arc<CriteriaRegistry>,
    policy: SameTierPolicy,
    max_status_advances: u8,
}

impl RoutingEngine {
    pub fn new(
        registry: Arc<CriteriaRegistry>,
        policy: SameTierPolicy,
        max_status_advances: u8,
    ) -> Self {
        Self {
            registry,
            policy,
            max_status_advances,
        }
    }

    /// Route `case`, advancing its status through the workflow while no team
    /// matches unless `keep_status` is set.
    ///
    /// Each pass sees the case at the status being tried, so criteria reading
    /// `status` agree with the rule's status scope.
    pub fn evaluate(
        &self,
        case: &CaseSnapshot,
        rules: &RuleSet,
        keep_status: bool,
    ) -> RoutingOutcome {
        let parameters = RoutingParameters {
            flags: case.routing_flags(),
            countries: case.countries(),
        };
        let by_team = rules_by_team(rules);
        let mut warnings = Vec::new();
        let mut view = Cow::Borrowed(case);
        let mut advances = 0u8;

        let teams = loop {
            let teams = self.route_at_status(&view, &parameters, &by_team, rules, &mut warnings);
            if !teams.is_empty() || keep_status || advances >= self.max_status_advances {
                break teams;
            }
            match rules.workflow.next_after(&view.status) {
                Some(next) if !rules.workflow.is_terminal(next) => {
                    debug!(
                        case_id = %case.case_id,
                        from = %view.status,
                        to = %next,
                        "no routing rules matched, advancing status"
                    );
                    view.to_mut().status = next.clone();
                    advances += 1;
                }
                _ => break teams,
            }
        };
        let status = view.status.clone();

        let matched_teams: BTreeSet<&TeamId> = teams.iter().map(|team| &team.team).collect();
        let owned_by_matched = |queue: &QueueId| {
            rules
                .queue_owners(queue)
                .iter()
                .any(|team| matched_teams.contains(team))
        };

        let mut queues: BTreeSet<QueueId> = case
            .queues
            .iter()
            .filter(|queue| !owned_by_matched(queue))
            .cloned()
            .collect();
        let mut assignments: BTreeSet<CaseAssignment> = case
            .assignments
            .iter()
            .filter(|assignment| !owned_by_matched(&assignment.queue))
            .cloned()
            .collect();
        for team in &teams {
            queues.extend(team.queues.keys().cloned());
            assignments.extend(team.assignments.iter().cloned());
        }

        RoutingOutcome {
            before_queues: case.queues.clone(),
            queues,
            before_assignments: case.assignments.clone(),
            assignments,
            teams,
            next_status: (status != case.status).then_some(status),
            warnings,
        }
    }

    fn route_at_status(
        &self,
        case: &CaseSnapshot,
        parameters: &RoutingParameters,
        by_team: &BTreeMap<&TeamId, Vec<&RoutingRule>>,
        rules: &RuleSet,
        warnings: &mut Vec<EvaluationWarning>,
    ) -> Vec<TeamRouting> {
        let mut routed = Vec::new();

        for (team, team_rules) in by_team {
            let mut winning_tier: Option<NonZeroU16> = None;
            let mut matched: Vec<&RoutingRule> = Vec::new();

            for &rule in team_rules {
                if let Some(tier) = winning_tier {
                    if rule.tier != tier {
                        break;
                    }
                }
                if !in_scope(rule, case, parameters, rules) {
                    continue;
                }
                if self.criteria_hold(rule, case, warnings) {
                    winning_tier = Some(rule.tier);
                    matched.push(rule);
                }
            }

            let Some(tier) = winning_tier else {
                continue;
            };
            if self.policy == SameTierPolicy::MostRecent {
                matched.truncate(1);
            }

            let mut queues = BTreeMap::new();
            let mut assignments = BTreeSet::new();
            for rule in &matched {
                queues
                    .entry(rule.queue.clone())
                    .or_insert_with(|| rule.id.clone());
                if let Some(user) = &rule.user {
                    if rules.user_is_active(user) {
                        assignments.insert(CaseAssignment {
                            user: user.clone(),
                            queue: rule.queue.clone(),
                        });
                    }
                }
            }

            debug!(
                case_id = %case.case_id,
                %team,
                tier = tier.get(),
                queues = queues.len(),
                "team routed"
            );
            routed.push(TeamRouting {
                team: (*team).clone(),
                tier,
                rules: matched.iter().map(|rule| rule.id.clone()).collect(),
                queues,
                assignments,
            });
        }

        routed
    }

    fn criteria_hold(
        &self,
        rule: &RoutingRule,
        case: &CaseSnapshot,
        warnings: &mut Vec<EvaluationWarning>,
    ) -> bool {
        let Some(criteria) = &rule.criteria else {
            return true;
        };

        let result = criteria.evaluate(
            &rule.id,
            |field| case.attribute(field),
            |key| {
                self.registry
                    .routing()
                    .get(key)
                    .map(|criterion| criterion(case))
            },
        );

        match result {
            Ok(holds) => holds,
            Err(error) => {
                warn!(%error, case_id = %case.case_id, "routing rule skipped");
                warnings.push(EvaluationWarning {
                    entity: case.case_id.0.clone(),
                    error,
                });
                false
            }
        }
    }
}

/// Active rules grouped by team, ordered by tier then most recent first.
fn rules_by_team(rules: &RuleSet) -> BTreeMap<&TeamId, Vec<&RoutingRule>> {
    let mut by_team: BTreeMap<&TeamId, Vec<&RoutingRule>> = BTreeMap::new();
    for rule in rules.routing_rules.iter().filter(|rule| rule.active) {
        by_team.entry(&rule.team).or_default().push(rule);
    }
    for team_rules in by_team.values_mut() {
        team_rules.sort_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
    }
    by_team
}

/// Scoping predicates; deactivated flags referenced by the rule disable it.
fn in_scope(
    rule: &RoutingRule,
    case: &CaseSnapshot,
    parameters: &RoutingParameters,
    rules: &RuleSet,
) -> bool {
    let references_deactivated_flag = rule
        .flags_to_include
        .iter()
        .chain(rule.flags_to_exclude.iter())
        .any(|flag| {
            rules
                .flags
                .get(flag)
                .map(|flag| !flag.status.is_active())
                .unwrap_or(false)
        });
    if references_deactivated_flag {
        return false;
    }

    if rule.status.as_ref().is_some_and(|required| required != &case.status) {
        return false;
    }
    if !rule.case_types.is_empty() && !rule.case_types.contains(&case.case_type) {
        return false;
    }
    if rule
        .country
        .as_ref()
        .is_some_and(|country| !parameters.countries.contains(country))
    {
        return false;
    }
    rule.flags_to_include.is_subset(&parameters.flags)
        && rule.flags_to_exclude.is_disjoint(&parameters.flags)
}
