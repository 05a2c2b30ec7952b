use std::fmt;

use serde::{Deserialize, Serialize};

use super::domain::{AttributeValue, FlagId, FlagLevel, RuleId};

/// Predicate deciding whether a rule fires.
///
/// Declarative criteria are evaluated here against entity attributes;
/// registered criteria are resolved through the [`CriteriaRegistry`](super::CriteriaRegistry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Criteria {
    Declarative {
        field: String,
        operator: Operator,
        value: AttributeValue,
    },
    Registered {
        rule_id: RuleId,
    },
}

impl Criteria {
    pub fn declarative(
        field: impl Into<String>,
        operator: Operator,
        value: AttributeValue,
    ) -> Self {
        Criteria::Declarative {
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn registered(rule_id: impl Into<String>) -> Self {
        Criteria::Registered {
            rule_id: RuleId(rule_id.into()),
        }
    }

    /// Evaluate against an attribute lookup, delegating registered criteria to `registered`.
    pub(crate) fn evaluate<L, R>(
        &self,
        owner: &RuleId,
        lookup: L,
        registered: R,
    ) -> Result<bool, CriteriaError>
    where
        L: Fn(&str) -> Option<AttributeValue>,
        R: FnOnce(&RuleId) -> Result<bool, CriteriaError>,
    {
        match self {
            Criteria::Declarative {
                field,
                operator,
                value,
            } => match lookup(field) {
                Some(actual) => operator.apply(&actual, value).map_err(|reason| {
                    CriteriaError::InvalidDeclarativeCriteria {
                        rule_id: owner.clone(),
                        field: field.clone(),
                        operator: *operator,
                        reason,
                    }
                }),
                None => Ok(false),
            },
            Criteria::Registered { rule_id } => registered(rule_id),
        }
    }
}

/// Comparison applied by declarative criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    Contains,
    AnyOf,
    NoneOf,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
}

impl Operator {
    pub const fn label(self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::Contains => "contains",
            Operator::AnyOf => "any_of",
            Operator::NoneOf => "none_of",
            Operator::GreaterThan => "greater_than",
            Operator::GreaterOrEqual => "greater_or_equal",
            Operator::LessThan => "less_than",
            Operator::LessOrEqual => "less_or_equal",
        }
    }

    fn apply(self, actual: &AttributeValue, expected: &AttributeValue) -> Result<bool, String> {
        use AttributeValue::{Boolean, List, Number, Text};

        match self {
            Operator::Equals => match (actual, expected) {
                (Text(a), Text(b)) => Ok(a == b),
                (Number(a), Number(b)) => Ok(a == b),
                (Boolean(a), Boolean(b)) => Ok(a == b),
                _ => Err(mismatch(actual, expected)),
            },
            Operator::Contains => match (actual, expected) {
                (List(values), Text(needle)) => Ok(values.iter().any(|value| value == needle)),
                (Text(haystack), Text(needle)) => Ok(haystack.contains(needle.as_str())),
                _ => Err(mismatch(actual, expected)),
            },
            Operator::AnyOf => any_of(actual, expected),
            Operator::NoneOf => any_of(actual, expected).map(|matched| !matched),
            Operator::GreaterThan => numeric(actual, expected).map(|(a, b)| a > b),
            Operator::GreaterOrEqual => numeric(actual, expected).map(|(a, b)| a >= b),
            Operator::LessThan => numeric(actual, expected).map(|(a, b)| a < b),
            Operator::LessOrEqual => numeric(actual, expected).map(|(a, b)| a <= b),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Scalars must be one of the candidates; lists must overlap them.
fn any_of(actual: &AttributeValue, expected: &AttributeValue) -> Result<bool, String> {
    let AttributeValue::List(candidates) = expected else {
        return Err(format!("expected a list value, found {}", expected.kind()));
    };
    match actual {
        AttributeValue::Text(value) => Ok(candidates.contains(value)),
        AttributeValue::List(values) => Ok(values.iter().any(|value| candidates.contains(value))),
        other => Err(format!("cannot match a {} attribute against a list", other.kind())),
    }
}

fn numeric(actual: &AttributeValue, expected: &AttributeValue) -> Result<(f64, f64), String> {
    match (actual, expected) {
        (AttributeValue::Number(a), AttributeValue::Number(b)) => Ok((*a, *b)),
        _ => Err(format!(
            "numeric comparison needs numbers, found {} and {}",
            actual.kind(),
            expected.kind()
        )),
    }
}

fn mismatch(actual: &AttributeValue, expected: &AttributeValue) -> String {
    format!(
        "cannot compare {} attribute with {} value",
        actual.kind(),
        expected.kind()
    )
}

/// Namespace a criteria lookup happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CriteriaScope {
    Flagging(FlagLevel),
    Routing,
}

impl fmt::Display for CriteriaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CriteriaScope::Flagging(level) => write!(f, "{level} flagging"),
            CriteriaScope::Routing => f.write_str("routing"),
        }
    }
}

/// Per-rule evaluation failure. Never aborts a pass; the rule counts as not firing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CriteriaError {
    #[error("no criteria function registered for {scope} rule {rule_id}")]
    CriteriaNotImplemented { scope: CriteriaScope, rule_id: RuleId },
    #[error("rule {rule_id} cannot apply {operator} to field '{field}': {reason}")]
    InvalidDeclarativeCriteria {
        rule_id: RuleId,
        field: String,
        operator: Operator,
        reason: String,
    },
    #[error("rule {rule_id} targets flag {flag}, which is not defined")]
    UnknownFlag { rule_id: RuleId, flag: FlagId },
}

impl CriteriaError {
    pub fn rule_id(&self) -> &RuleId {
        match self {
            CriteriaError::CriteriaNotImplemented { rule_id, .. }
            | CriteriaError::InvalidDeclarativeCriteria { rule_id, .. }
            | CriteriaError::UnknownFlag { rule_id, .. } => rule_id,
        }
    }
}

/// A criteria failure tied to the entity being evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationWarning {
    /// Case id, product id or destination id.
    pub entity: String,
    pub error: CriteriaError,
}

impl fmt::Display for EvaluationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.entity)
    }
}
