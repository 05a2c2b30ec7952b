use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::num::NonZeroU16;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::criteria::Criteria;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier wrapper for cases.
    CaseId
);
string_id!(FlagId);
string_id!(QueueId);
string_id!(TeamId);
string_id!(UserId);
string_id!(
    /// Identifier of a flagging or routing rule; also the key for registered criteria.
    RuleId
);
string_id!(
    /// Case status reference, e.g. `submitted` or `under_final_review`.
    StatusId
);
string_id!(
    /// Case type reference, e.g. `SIEL` or `OIEL`.
    CaseTypeId
);
string_id!(CountryCode);

/// Entity kinds a flag can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagLevel {
    Case,
    Product,
    Destination,
}

impl FlagLevel {
    pub const fn label(self) -> &'static str {
        match self {
            FlagLevel::Case => "case",
            FlagLevel::Product => "product",
            FlagLevel::Destination => "destination",
        }
    }
}

impl fmt::Display for FlagLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Lifecycle state shared by flags and flagging rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    #[default]
    Active,
    Deactivated,
}

impl ActivationStatus {
    pub const fn is_active(self) -> bool {
        matches!(self, ActivationStatus::Active)
    }
}

/// Reference data describing a flag that rules and caseworkers can attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    pub id: FlagId,
    pub name: String,
    pub level: FlagLevel,
    #[serde(default)]
    pub status: ActivationStatus,
    /// Consulted by finalisation; the engine only reports presence.
    #[serde(default)]
    pub blocks_finalising: bool,
}

/// Work queue owned by a team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub id: QueueId,
    pub name: String,
    pub team: TeamId,
}

/// Caseworker that routing rules may assign cases to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovUser {
    pub id: UserId,
    pub active: bool,
}

/// Attribute value consulted by declarative criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Boolean(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl AttributeValue {
    pub fn text(value: impl Into<String>) -> Self {
        AttributeValue::Text(value.into())
    }

    pub fn list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AttributeValue::List(values.into_iter().map(Into::into).collect())
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            AttributeValue::Boolean(_) => "boolean",
            AttributeValue::Number(_) => "number",
            AttributeValue::Text(_) => "text",
            AttributeValue::List(_) => "list",
        }
    }
}

pub type Attributes = BTreeMap<String, AttributeValue>;

/// Flags attached to one entity, split by how they got there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagAttachments {
    /// Every flag currently on the entity.
    #[serde(default)]
    pub attached: BTreeSet<FlagId>,
    /// Flags a caseworker added; rules never remove these.
    #[serde(default)]
    pub manual: BTreeSet<FlagId>,
    /// Flags a caseworker removed; rules never re-add these.
    #[serde(default)]
    pub suppressed: BTreeSet<FlagId>,
}

impl FlagAttachments {
    pub fn with_attached<I>(flags: I) -> Self
    where
        I: IntoIterator<Item = FlagId>,
    {
        Self {
            attached: flags.into_iter().collect(),
            ..Self::default()
        }
    }
}

/// Product on an application, flagged at [`FlagLevel::Product`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub flags: FlagAttachments,
}

/// Party/destination on an application, flagged at [`FlagLevel::Destination`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub id: String,
    pub country: CountryCode,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub flags: FlagAttachments,
}

/// Queue plus caseworker pairing produced by routing rules that name a user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CaseAssignment {
    pub user: UserId,
    pub queue: QueueId,
}

/// Point-in-time view of a case supplied by the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseSnapshot {
    pub case_id: CaseId,
    /// Optimistic concurrency marker, bumped whenever a run changes the case.
    pub version: u64,
    pub status: StatusId,
    pub case_type: CaseTypeId,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub flags: FlagAttachments,
    #[serde(default)]
    pub organisation_flags: BTreeSet<FlagId>,
    #[serde(default)]
    pub queues: BTreeSet<QueueId>,
    #[serde(default)]
    pub assignments: BTreeSet<CaseAssignment>,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

impl CaseSnapshot {
    pub fn new(
        case_id: impl Into<String>,
        case_type: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            case_id: CaseId(case_id.into()),
            version: 0,
            status: StatusId(status.into()),
            case_type: CaseTypeId(case_type.into()),
            attributes: Attributes::new(),
            flags: FlagAttachments::default(),
            organisation_flags: BTreeSet::new(),
            queues: BTreeSet::new(),
            assignments: BTreeSet::new(),
            products: Vec::new(),
            destinations: Vec::new(),
        }
    }

    /// Case attribute lookup; `case_type` and `status` resolve to the typed fields
    /// unless the attribute map overrides them.
    pub fn attribute(&self, field: &str) -> Option<AttributeValue> {
        if let Some(value) = self.attributes.get(field) {
            return Some(value.clone());
        }
        match field {
            "case_type" => Some(AttributeValue::Text(self.case_type.0.clone())),
            "status" => Some(AttributeValue::Text(self.status.0.clone())),
            "countries" => Some(AttributeValue::List(
                self.countries().into_iter().map(|code| code.0).collect(),
            )),
            _ => None,
        }
    }

    pub fn countries(&self) -> BTreeSet<CountryCode> {
        self.destinations
            .iter()
            .map(|destination| destination.country.clone())
            .collect()
    }

    /// Every flag visible to routing: case, organisation, destination and product flags.
    pub fn routing_flags(&self) -> BTreeSet<FlagId> {
        let mut flags = self.flags.attached.clone();
        flags.extend(self.organisation_flags.iter().cloned());
        for destination in &self.destinations {
            flags.extend(destination.flags.attached.iter().cloned());
        }
        for product in &self.products {
            flags.extend(product.flags.attached.iter().cloned());
        }
        flags
    }
}

/// Flagging rule applying `flag` to entities of `level` whose criteria hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggingRule {
    pub id: RuleId,
    pub team: TeamId,
    pub level: FlagLevel,
    pub flag: FlagId,
    #[serde(default)]
    pub status: ActivationStatus,
    pub criteria: Criteria,
    pub created_at: DateTime<Utc>,
}

/// Tiered routing rule moving matching cases into `queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: RuleId,
    pub team: TeamId,
    pub queue: QueueId,
    /// Lower tiers are evaluated first and short-circuit higher ones per team.
    pub tier: NonZeroU16,
    #[serde(default)]
    pub status: Option<StatusId>,
    #[serde(default)]
    pub case_types: BTreeSet<CaseTypeId>,
    #[serde(default)]
    pub country: Option<CountryCode>,
    #[serde(default)]
    pub flags_to_include: BTreeSet<FlagId>,
    #[serde(default)]
    pub flags_to_exclude: BTreeSet<FlagId>,
    #[serde(default)]
    pub user: Option<UserId>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Extra predicate on top of the scoping fields; `None` always holds.
    #[serde(default)]
    pub criteria: Option<Criteria>,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

/// Ordered status sequence used when routing advances a case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSequence {
    /// System-only status for unsubmitted cases.
    #[serde(default)]
    pub draft: Option<StatusId>,
    #[serde(default)]
    pub sequence: Vec<StatusId>,
    #[serde(default)]
    pub terminal: BTreeSet<StatusId>,
}

impl WorkflowSequence {
    pub fn is_terminal(&self, status: &StatusId) -> bool {
        self.terminal.contains(status)
    }

    /// Open cases are neither draft nor terminal.
    pub fn is_open(&self, status: &StatusId) -> bool {
        self.draft.as_ref() != Some(status) && !self.is_terminal(status)
    }

    pub fn next_after(&self, status: &StatusId) -> Option<&StatusId> {
        let position = self.sequence.iter().position(|entry| entry == status)?;
        self.sequence.get(position + 1)
    }
}

/// Read-only reference data for one evaluation run.
///
/// Loaded once per orchestrator invocation so no evaluation observes a
/// half-updated rule table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub flags: BTreeMap<FlagId, Flag>,
    #[serde(default)]
    pub queues: BTreeMap<QueueId, Queue>,
    #[serde(default)]
    pub users: BTreeMap<UserId, GovUser>,
    #[serde(default)]
    pub flagging_rules: Vec<FlaggingRule>,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
    #[serde(default)]
    pub workflow: WorkflowSequence,
}

impl RuleSet {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.flags.insert(flag.id.clone(), flag);
        self
    }

    pub fn with_queue(mut self, queue: Queue) -> Self {
        self.queues.insert(queue.id.clone(), queue);
        self
    }

    pub fn with_user(mut self, user: GovUser) -> Self {
        self.users.insert(user.id.clone(), user);
        self
    }

    pub fn with_flagging_rule(mut self, rule: FlaggingRule) -> Self {
        self.flagging_rules.push(rule);
        self
    }

    pub fn with_routing_rule(mut self, rule: RoutingRule) -> Self {
        self.routing_rules.push(rule);
        self
    }

    pub fn with_workflow(mut self, workflow: WorkflowSequence) -> Self {
        self.workflow = workflow;
        self
    }

    pub fn flag_is_active(&self, id: &FlagId) -> bool {
        self.flags
            .get(id)
            .map(|flag| flag.status.is_active())
            .unwrap_or(false)
    }

    /// Teams owning a queue: the team on its `Queue` record plus every team
    /// with a routing rule targeting it.
    pub fn queue_owners(&self, id: &QueueId) -> BTreeSet<&TeamId> {
        self.queues
            .get(id)
            .map(|queue| &queue.team)
            .into_iter()
            .chain(
                self.routing_rules
                    .iter()
                    .filter(|rule| &rule.queue == id)
                    .map(|rule| &rule.team),
            )
            .collect()
    }

    pub fn user_is_active(&self, id: &UserId) -> bool {
        self.users.get(id).map(|user| user.active).unwrap_or(false)
    }

    pub fn flagging_rules_for(&self, level: FlagLevel) -> impl Iterator<Item = &FlaggingRule> {
        self.flagging_rules
            .iter()
            .filter(move |rule| rule.level == level)
    }
}
