use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::criteria::{CriteriaError, EvaluationWarning};
use super::domain::{
    AttributeValue, CaseSnapshot, Destination, FlagAttachments, FlagId, FlagLevel, FlaggingRule,
    Product, RuleId, RuleSet,
};
use super::registry::CriteriaRegistry;

/// Entity handed to flagging criteria, with the owning case for context.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    Case(&'a CaseSnapshot),
    Product {
        case: &'a CaseSnapshot,
        product: &'a Product,
    },
    Destination {
        case: &'a CaseSnapshot,
        destination: &'a Destination,
    },
}

impl<'a> Subject<'a> {
    pub fn level(&self) -> FlagLevel {
        match self {
            Subject::Case(_) => FlagLevel::Case,
            Subject::Product { .. } => FlagLevel::Product,
            Subject::Destination { .. } => FlagLevel::Destination,
        }
    }

    pub fn case(&self) -> &'a CaseSnapshot {
        match *self {
            Subject::Case(case) => case,
            Subject::Product { case, .. } | Subject::Destination { case, .. } => case,
        }
    }

    pub fn entity_id(&self) -> &'a str {
        match *self {
            Subject::Case(case) => &case.case_id.0,
            Subject::Product { product, .. } => &product.id,
            Subject::Destination { destination, .. } => &destination.id,
        }
    }

    pub fn flags(&self) -> &'a FlagAttachments {
        match *self {
            Subject::Case(case) => &case.flags,
            Subject::Product { product, .. } => &product.flags,
            Subject::Destination { destination, .. } => &destination.flags,
        }
    }

    /// Attribute lookup for declarative criteria. Destinations expose `country`.
    pub fn attribute(&self, field: &str) -> Option<AttributeValue> {
        match *self {
            Subject::Case(case) => case.attribute(field),
            Subject::Product { product, .. } => product.attributes.get(field).cloned(),
            Subject::Destination { destination, .. } => {
                destination.attributes.get(field).cloned().or_else(|| {
                    (field == "country")
                        .then(|| AttributeValue::Text(destination.country.0.clone()))
                })
            }
        }
    }

    fn key(&self) -> FlagSubject {
        match *self {
            Subject::Case(_) => FlagSubject::Case,
            Subject::Product { product, .. } => FlagSubject::Product(product.id.clone()),
            Subject::Destination { destination, .. } => {
                FlagSubject::Destination(destination.id.clone())
            }
        }
    }
}

/// Owned reference to the entity a flag sits on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum FlagSubject {
    Case,
    Product(String),
    Destination(String),
}

impl FlagSubject {
    pub fn level(&self) -> FlagLevel {
        match self {
            FlagSubject::Case => FlagLevel::Case,
            FlagSubject::Product(_) => FlagLevel::Product,
            FlagSubject::Destination(_) => FlagLevel::Destination,
        }
    }
}

/// Before/after flag sets for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFlags {
    pub subject: FlagSubject,
    pub before: BTreeSet<FlagId>,
    pub after: BTreeSet<FlagId>,
    /// First rule that fired for each rule-contributed flag.
    pub fired_by: BTreeMap<FlagId, RuleId>,
}

impl EntityFlags {
    fn unchanged(subject: FlagSubject, flags: &FlagAttachments) -> Self {
        Self {
            subject,
            before: flags.attached.clone(),
            after: flags.attached.clone(),
            fired_by: BTreeMap::new(),
        }
    }

    pub fn added(&self) -> impl Iterator<Item = &FlagId> {
        self.after.difference(&self.before)
    }

    pub fn removed(&self) -> impl Iterator<Item = &FlagId> {
        self.before.difference(&self.after)
    }

    pub fn is_unchanged(&self) -> bool {
        self.before == self.after
    }
}

/// Flag sets computed for a case and every product and destination on it.
#[derive(Debug, Clone, PartialEq)]
pub struct FlaggingOutcome {
    pub case: EntityFlags,
    pub products: Vec<EntityFlags>,
    pub destinations: Vec<EntityFlags>,
    /// Present flags with `blocks_finalising` set, across all entities.
    pub blocking_flags: BTreeSet<FlagId>,
    /// False when the case was draft or terminal and rules were not applied.
    pub applied: bool,
    pub warnings: Vec<EvaluationWarning>,
}

impl FlaggingOutcome {
    pub fn entities(&self) -> impl Iterator<Item = &EntityFlags> {
        std::iter::once(&self.case)
            .chain(self.products.iter())
            .chain(self.destinations.iter())
    }

    pub fn is_unchanged(&self) -> bool {
        self.entities().all(EntityFlags::is_unchanged)
    }

    /// Write the computed flag sets onto `case`.
    pub fn apply_to(&self, case: &mut CaseSnapshot) {
        case.flags.attached = self.case.after.clone();
        for (product, flags) in case.products.iter_mut().zip(&self.products) {
            product.flags.attached = flags.after.clone();
        }
        for (destination, flags) in case.destinations.iter_mut().zip(&self.destinations) {
            destination.flags.attached = flags.after.clone();
        }
    }
}

/// Computes the flag set of every entity on a case from the active flagging rules.
///
/// Rule-managed flags (targets of any rule at the entity's level) are a pure
/// function of the entity's attributes plus caseworker overrides, so running
/// the engine twice over unchanged input yields no delta.
pub struct FlaggingEngine {
    registry: Arc<CriteriaRegistry>,
}

impl FlaggingEngine {
    pub fn new(registry: Arc<CriteriaRegistry>) -> Self {
        Self { registry }
    }

    pub fn evaluate(&self, case: &CaseSnapshot, rules: &RuleSet) -> FlaggingOutcome {
        if !rules.workflow.is_open(&case.status) {
            debug!(
                case_id = %case.case_id,
                status = %case.status,
                "case not open, flagging skipped"
            );
            return Self::unchanged(case, rules);
        }

        let mut warnings = unknown_flag_warnings(case, rules);
        let case_rules: Vec<&FlaggingRule> = rules.flagging_rules_for(FlagLevel::Case).collect();
        let product_rules: Vec<&FlaggingRule> =
            rules.flagging_rules_for(FlagLevel::Product).collect();
        let destination_rules: Vec<&FlaggingRule> =
            rules.flagging_rules_for(FlagLevel::Destination).collect();

        let case_flags =
            self.evaluate_subject(Subject::Case(case), &case_rules, rules, &mut warnings);
        let products = case
            .products
            .iter()
            .map(|product| {
                self.evaluate_subject(
                    Subject::Product { case, product },
                    &product_rules,
                    rules,
                    &mut warnings,
                )
            })
            .collect();
        let destinations = case
            .destinations
            .iter()
            .map(|destination| {
                self.evaluate_subject(
                    Subject::Destination { case, destination },
                    &destination_rules,
                    rules,
                    &mut warnings,
                )
            })
            .collect();

        let mut outcome = FlaggingOutcome {
            case: case_flags,
            products,
            destinations,
            blocking_flags: BTreeSet::new(),
            applied: true,
            warnings,
        };
        outcome.blocking_flags = blocking_flags(&outcome, rules);
        outcome
    }

    fn unchanged(case: &CaseSnapshot, rules: &RuleSet) -> FlaggingOutcome {
        let mut outcome = FlaggingOutcome {
            case: EntityFlags::unchanged(FlagSubject::Case, &case.flags),
            products: case
                .products
                .iter()
                .map(|product| {
                    EntityFlags::unchanged(FlagSubject::Product(product.id.clone()), &product.flags)
                })
                .collect(),
            destinations: case
                .destinations
                .iter()
                .map(|destination| {
                    EntityFlags::unchanged(
                        FlagSubject::Destination(destination.id.clone()),
                        &destination.flags,
                    )
                })
                .collect(),
            blocking_flags: BTreeSet::new(),
            applied: false,
            warnings: Vec::new(),
        };
        outcome.blocking_flags = blocking_flags(&outcome, rules);
        outcome
    }

    fn evaluate_subject(
        &self,
        subject: Subject<'_>,
        level_rules: &[&FlaggingRule],
        rules: &RuleSet,
        warnings: &mut Vec<EvaluationWarning>,
    ) -> EntityFlags {
        let level = subject.level();
        let managed: BTreeSet<&FlagId> = level_rules.iter().map(|rule| &rule.flag).collect();
        let mut fired_by: BTreeMap<FlagId, RuleId> = BTreeMap::new();

        for rule in level_rules {
            if !rule.status.is_active() || !rules.flag_is_active(&rule.flag) {
                continue;
            }
            let result = rule.criteria.evaluate(
                &rule.id,
                |field| subject.attribute(field),
                |key| {
                    self.registry
                        .flagging()
                        .get(level, key)
                        .map(|criterion| criterion(&subject))
                },
            );

            match result {
                Ok(true) => {
                    debug!(
                        rule_id = %rule.id,
                        flag = %rule.flag,
                        entity = subject.entity_id(),
                        "flagging rule fired"
                    );
                    fired_by
                        .entry(rule.flag.clone())
                        .or_insert_with(|| rule.id.clone());
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(%error, %level, entity = subject.entity_id(), "flagging rule skipped");
                    warnings.push(EvaluationWarning {
                        entity: subject.entity_id().to_string(),
                        error,
                    });
                }
            }
        }

        let current = subject.flags();
        fired_by.retain(|flag, _| !current.suppressed.contains(flag));

        let after: BTreeSet<FlagId> = current
            .attached
            .iter()
            .filter(|flag| !managed.contains(flag) || current.manual.contains(*flag))
            .chain(current.manual.iter())
            .chain(fired_by.keys())
            .cloned()
            .collect();

        EntityFlags {
            subject: subject.key(),
            before: current.attached.clone(),
            after,
            fired_by,
        }
    }
}

/// Active rules whose target flag the rule set does not define. They never
/// fire, so the flag they manage is cleared from every entity.
fn unknown_flag_warnings(case: &CaseSnapshot, rules: &RuleSet) -> Vec<EvaluationWarning> {
    rules
        .flagging_rules
        .iter()
        .filter(|rule| rule.status.is_active() && !rules.flags.contains_key(&rule.flag))
        .map(|rule| {
            warn!(rule_id = %rule.id, flag = %rule.flag, "flagging rule targets unknown flag");
            EvaluationWarning {
                entity: case.case_id.0.clone(),
                error: CriteriaError::UnknownFlag {
                    rule_id: rule.id.clone(),
                    flag: rule.flag.clone(),
                },
            }
        })
        .collect()
}

fn blocking_flags(outcome: &FlaggingOutcome, rules: &RuleSet) -> BTreeSet<FlagId> {
    outcome
        .entities()
        .flat_map(|entity| entity.after.iter())
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
