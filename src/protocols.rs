//! # Protocols
//!
//! The protocols interface: installing protocol definitions and querying
//! installed configurations. A protocol definition declares record types,
//! the structural tree records may form, and the action rules governing who
//! may do what at each position in the tree.

pub mod configure;
pub mod query;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::configure::{Configure, ConfigureBuilder, ConfigureDescriptor, ConfigureReply};
pub use self::query::{Query, QueryBuilder, QueryDescriptor, QueryReply};
use crate::{Result, schema, unexpected, utils};

/// Maximum depth of the protocol structure tree.
const MAX_NESTING_DEPTH: usize = 10;

/// A protocol definition.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    /// The protocol URI.
    pub protocol: String,

    /// Whether the definition may be returned to unauthorized queriers.
    pub published: bool,

    /// The record types the protocol declares.
    pub types: BTreeMap<String, ProtocolType>,

    /// The structure tree: protocol paths to rule sets.
    pub structure: BTreeMap<String, RuleSet>,
}

/// A record type declaration.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolType {
    /// Schema records of this type must carry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Data formats records of this type may carry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_formats: Option<Vec<String>>,
}

/// The rules at one node of the structure tree.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RuleSet {
    /// The action rules for records at this path.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$actions")]
    pub actions: Option<Vec<ActionRule>>,

    /// Records at this path are role records.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$role")]
    pub role: Option<bool>,

    /// Size limits for record data at this path.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$size")]
    pub size: Option<SizeRange>,

    /// The tag schema for records at this path.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$tags")]
    pub tags: Option<Tags>,

    /// Child rule sets, keyed by type name.
    #[serde(flatten)]
    pub nested: BTreeMap<String, RuleSet>,
}

/// Record data size limits, in bytes.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeRange {
    /// Minimum size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<usize>,

    /// Maximum size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<usize>,
}

/// An action rule: who can do what, optionally relative to an ancestor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRule {
    /// The actor the rule applies to. Mutually exclusive with `role`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub who: Option<Actor>,

    /// The protocol path of a role record type (`$role: true`). Mutually
    /// exclusive with `who`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// The ancestor protocol path `who` is evaluated against. Required when
    /// `who` is `author` and for `recipient` rules on other records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub of: Option<String>,

    /// The actions the actor or role may perform.
    pub can: Vec<Action>,
}

/// Actor types for action rules.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Actor {
    /// Anyone.
    #[default]
    Anyone,

    /// The author of the `of` ancestor.
    Author,

    /// The recipient of the `of` ancestor (or of this record when `of` is
    /// unset).
    Recipient,
}

/// The actions an action rule can permit.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    /// Create a record.
    Create,

    /// Delete one's own record.
    Delete,

    /// Prune one's own record and its descendants.
    Prune,

    /// Query for records.
    Query,

    /// Subscribe to record events.
    Subscribe,

    /// Read a record.
    #[default]
    Read,

    /// Update one's own record.
    Update,

    /// Delete any record at the path.
    #[serde(rename = "co-delete")]
    CoDelete,

    /// Prune any record at the path.
    #[serde(rename = "co-prune")]
    CoPrune,

    /// Update any record at the path.
    #[serde(rename = "co-update")]
    CoUpdate,
}

/// The tag rules at one node of the structure tree.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tags {
    /// Tags every record at this path must carry.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$requiredTags")]
    pub required_tags: Option<Vec<String>>,

    /// Permit tags beyond those explicitly declared.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$allowUndefinedTags")]
    pub allow_undefined_tags: Option<bool>,

    /// Schema fragments for the declared tags.
    #[serde(flatten)]
    pub properties: BTreeMap<String, Value>,
}

impl Definition {
    /// Returns a new [`Definition`].
    #[must_use]
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            ..Self::default()
        }
    }

    /// Set whether the definition is published.
    #[must_use]
    pub const fn published(mut self, published: bool) -> Self {
        self.published = published;
        self
    }

    /// Add a record type.
    #[must_use]
    pub fn add_type(mut self, name: impl Into<String>, protocol_type: ProtocolType) -> Self {
        self.types.insert(name.into(), protocol_type);
        self
    }

    /// Add a top-level rule set.
    #[must_use]
    pub fn add_rule(mut self, name: impl Into<String>, rule_set: RuleSet) -> Self {
        self.structure.insert(name.into(), rule_set);
        self
    }

    /// Normalize the definition's URLs.
    pub(crate) fn normalize(&self) -> Result<Self> {
        let mut definition = self.clone();
        definition.protocol = utils::clean_url(&self.protocol)?;
        for protocol_type in definition.types.values_mut() {
            if let Some(schema) = &protocol_type.schema {
                protocol_type.schema = Some(utils::clean_url(schema)?);
            }
        }
        Ok(definition)
    }

    /// Validate the definition's structure: rule-set sanity, role paths,
    /// and tag schemas.
    pub(crate) fn verify_structure(&self) -> Result<()> {
        let types = self.types.keys().collect::<Vec<&String>>();

        let mut roles = Vec::new();
        for (name, rule_set) in &self.structure {
            collect_role_paths(name, rule_set, &mut roles)?;
        }

        for (name, rule_set) in &self.structure {
            if !types.contains(&name) {
                return Err(unexpected!("rule set {name} is not declared as a type"));
            }
            verify_rule_set(self, rule_set, name, &types, &roles)?;
        }

        Ok(())
    }
}

/// Find the rule set at the specified protocol path.
pub(crate) fn rule_set<'a>(
    protocol_path: &str, structure: &'a BTreeMap<String, RuleSet>,
) -> Option<&'a RuleSet> {
    let Some((head, rest)) = protocol_path.split_once('/') else {
        return structure.get(protocol_path);
    };
    rule_set(rest, &structure.get(head)?.nested)
}

// Validate one rule set, recursing into nested rule sets.
fn verify_rule_set(
    definition: &Definition, rule_set: &RuleSet, protocol_path: &str, types: &[&String],
    roles: &[String],
) -> Result<()> {
    if protocol_path.split('/').count() > MAX_NESTING_DEPTH {
        return Err(unexpected!("record nesting depth exceeds {MAX_NESTING_DEPTH} levels"));
    }

    if let Some(size) = &rule_set.size {
        if let (Some(min), Some(max)) = (size.min, size.max) {
            if min > max {
                return Err(unexpected!("invalid size range at '{protocol_path}'"));
            }
        }
    }

    if let Some(tags) = &rule_set.tags {
        schema::verify_schema(&definition.protocol, protocol_path, tags)?;
    }

    let empty = Vec::new();
    let actions = rule_set.actions.as_ref().unwrap_or(&empty);

    for (position, action) in actions.iter().enumerate() {
        if action.who.is_some() && action.role.is_some() {
            return Err(unexpected!(
                "action rule at '{protocol_path}' sets both `who` and `role`"
            ));
        }

        if let Some(role) = &action.role {
            // the role must name a role record type declared in this protocol
            if !roles.contains(role) {
                return Err(unexpected!("missing role {role} in action for {protocol_path}"));
            }
        }

        // when `who` is `anyone`, `of` cannot be set
        if action.who.as_ref().is_some_and(|w| w == &Actor::Anyone) && action.of.is_some() {
            return Err(unexpected!(
                "`of` must not be set when `who` is \"anyone\" for {protocol_path}"
            ));
        }

        // a recipient rule without `of` can only permit co-actions: there is
        // no recipient to evaluate until the record exists
        if action.who.as_ref().is_some_and(|w| w == &Actor::Recipient) && action.of.is_none() {
            let allowed = [Action::CoUpdate, Action::CoDelete, Action::CoPrune];
            if action.can.iter().any(|a| !allowed.contains(a)) {
                return Err(unexpected!(
                    "recipient action must contain only co-update, co-delete, and co-prune"
                ));
            }
        }

        // when `who` is "author", `of` must be set
        if action.who.as_ref().is_some_and(|w| w == &Actor::Author) && action.of.is_none() {
            return Err(unexpected!("`of` must be set when `who` is set to 'author'"));
        }

        // `update`/`delete` permit modifying one's own record, which
        // presupposes the ability to create it
        if action.can.contains(&Action::Update) && !action.can.contains(&Action::Create) {
            return Err(unexpected!("action rule contains 'update' but no 'create'"));
        }
        if action.can.contains(&Action::Delete) && !action.can.contains(&Action::Create) {
            return Err(unexpected!("action rule contains 'delete' but no 'create'"));
        }

        // no two rules may share an actor/ancestor pair or a role
        for other in &actions[position + 1..] {
            if action.who.is_some() {
                if action.who == other.who && action.of == other.of {
                    return Err(unexpected!(
                        "duplicate action rule for actor {:?} of {:?} at '{protocol_path}'",
                        action.who,
                        action.of
                    ));
                }
            } else if action.role == other.role {
                return Err(unexpected!(
                    "duplicate action rule for role {:?} at '{protocol_path}'",
                    action.role
                ));
            }
        }
    }

    for (name, nested) in &rule_set.nested {
        if !types.contains(&name) {
            return Err(unexpected!("rule set {name} is not declared as a type"));
        }
        verify_rule_set(definition, nested, &format!("{protocol_path}/{name}"), types, roles)?;
    }

    Ok(())
}

// Collect the protocol paths of role record types.
fn collect_role_paths(
    protocol_path: &str, rule_set: &RuleSet, roles: &mut Vec<String>,
) -> Result<()> {
    if protocol_path.split('/').count() > MAX_NESTING_DEPTH {
        return Err(unexpected!("record nesting depth exceeds {MAX_NESTING_DEPTH} levels"));
    }

    if rule_set.role.unwrap_or_default() {
        roles.push(protocol_path.to_string());
    }
    for (name, nested) in &rule_set.nested {
        collect_role_paths(&format!("{protocol_path}/{name}"), nested, roles)?;
    }

    Ok(())
}
