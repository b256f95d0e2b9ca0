//! # Store
//!
//! Shared storage types plus the building blocks used to assemble message,
//! data, event, and task stores from an ordered key-value engine.

pub mod data;
pub mod event_log;
pub mod index;
pub mod message;
pub mod partition;
pub mod task;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::grants::{Grant, Revoke};
use crate::protocols::Configure;
use crate::records::{Delete, RecordsFilter, Write};
use crate::store::index::FilterVal;
use crate::{Descriptor, Interface, Method, Result, unexpected};

/// A stored message together with the flattened indexes it is queryable by.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Entry {
    /// The message.
    #[serde(flatten)]
    pub message: EntryType,

    /// Queryable fields, flattened to scalar values.
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub indexes: HashMap<String, Value>,
}

/// The message types a web node stores.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum EntryType {
    Configure(Configure),
    Grant(Grant),
    Revoke(Revoke),
    Delete(Delete),
    Write(Write),
}

impl Entry {
    /// Compute the CID of the wrapped message.
    ///
    /// # Errors
    ///
    /// Returns an error when the message cannot be serialized.
    pub fn cid(&self) -> Result<String> {
        match &self.message {
            EntryType::Write(write) => crate::cid::from_value(write),
            EntryType::Delete(delete) => crate::cid::from_value(delete),
            EntryType::Configure(configure) => crate::cid::from_value(configure),
            EntryType::Grant(grant) => crate::cid::from_value(grant),
            EntryType::Revoke(revoke) => crate::cid::from_value(revoke),
        }
    }

    /// The base descriptor of the wrapped message.
    #[must_use]
    pub const fn descriptor(&self) -> &Descriptor {
        match &self.message {
            EntryType::Write(write) => &write.descriptor.base,
            EntryType::Delete(delete) => &delete.descriptor.base,
            EntryType::Configure(configure) => &configure.descriptor.base,
            EntryType::Grant(grant) => &grant.descriptor.base,
            EntryType::Revoke(revoke) => &revoke.descriptor.base,
        }
    }

    /// The wrapped `RecordsWrite`, if that is what this entry is.
    #[must_use]
    pub const fn as_write(&self) -> Option<&Write> {
        match &self.message {
            EntryType::Write(write) => Some(write),
            _ => None,
        }
    }

    /// The wrapped `RecordsDelete`, if that is what this entry is.
    #[must_use]
    pub const fn as_delete(&self) -> Option<&Delete> {
        match &self.message {
            EntryType::Delete(delete) => Some(delete),
            _ => None,
        }
    }

    /// The wrapped `ProtocolsConfigure`, if that is what this entry is.
    #[must_use]
    pub const fn as_configure(&self) -> Option<&Configure> {
        match &self.message {
            EntryType::Configure(configure) => Some(configure),
            _ => None,
        }
    }

    /// The wrapped `PermissionsGrant`, if that is what this entry is.
    #[must_use]
    pub const fn as_grant(&self) -> Option<&Grant> {
        match &self.message {
            EntryType::Grant(grant) => Some(grant),
            _ => None,
        }
    }

    /// Add (or overwrite) an index property.
    pub fn add_index(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.indexes.insert(key.into(), value.into());
    }
}

impl From<&Write> for Entry {
    fn from(write: &Write) -> Self {
        Self {
            message: EntryType::Write(write.clone()),
            indexes: write.build_indexes(),
        }
    }
}

impl From<&Delete> for Entry {
    fn from(delete: &Delete) -> Self {
        Self {
            message: EntryType::Delete(delete.clone()),
            indexes: delete.build_indexes(),
        }
    }
}

impl From<&Configure> for Entry {
    fn from(configure: &Configure) -> Self {
        Self {
            message: EntryType::Configure(configure.clone()),
            indexes: configure.build_indexes(),
        }
    }
}

impl From<&Grant> for Entry {
    fn from(grant: &Grant) -> Self {
        Self {
            message: EntryType::Grant(grant.clone()),
            indexes: grant.build_indexes(),
        }
    }
}

impl From<&Revoke> for Entry {
    fn from(revoke: &Revoke) -> Self {
        Self {
            message: EntryType::Revoke(revoke.clone()),
            indexes: revoke.build_indexes(),
        }
    }
}

/// Queries understood by the message store.
#[derive(Clone, Debug)]
pub enum Query {
    /// Query for records entries.
    Records(RecordsQuery),

    /// Query for protocol configurations.
    Protocols(ProtocolsQuery),

    /// Query for permission grants and revocations.
    Grants(GrantsQuery),
}

/// A query over records entries: a disjunction of filter conjunctions.
#[derive(Clone, Debug)]
pub struct RecordsQuery {
    /// Filters — a match against any one filter is a match.
    pub filters: Vec<RecordsFilter>,

    /// Restrict matches to the specified method. `None` matches both
    /// `RecordsWrite` and `RecordsDelete`.
    pub method: Option<Method>,

    /// Include entries archived by a subsequent write (superseded initial
    /// writes).
    pub include_archived: bool,

    /// Sort order.
    pub sort: Sort,

    /// Pagination settings.
    pub pagination: Option<Pagination>,
}

impl Default for RecordsQuery {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            method: Some(Method::Write),
            include_archived: false,
            sort: Sort::default(),
            pagination: None,
        }
    }
}

impl From<RecordsQuery> for Query {
    fn from(query: RecordsQuery) -> Self {
        Self::Records(query)
    }
}

/// Builder for [`RecordsQuery`].
#[derive(Clone, Debug, Default)]
pub struct RecordsQueryBuilder {
    query: RecordsQuery,
}

impl RecordsQueryBuilder {
    /// Returns a new [`RecordsQueryBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter to the disjunction.
    #[must_use]
    pub fn add_filter(mut self, filter: RecordsFilter) -> Self {
        self.query.filters.push(filter);
        self
    }

    /// Restrict (or un-restrict) the method matched.
    #[must_use]
    pub fn method(mut self, method: Option<Method>) -> Self {
        self.query.method = method;
        self
    }

    /// Include archived (superseded initial write) entries.
    #[must_use]
    pub const fn include_archived(mut self, include_archived: bool) -> Self {
        self.query.include_archived = include_archived;
        self
    }

    /// Set the sort order.
    #[must_use]
    pub const fn sort(mut self, sort: Sort) -> Self {
        self.query.sort = sort;
        self
    }

    /// Set pagination.
    #[must_use]
    pub fn pagination(mut self, pagination: Pagination) -> Self {
        self.query.pagination = Some(pagination);
        self
    }

    /// Build the query.
    #[must_use]
    pub fn build(self) -> Query {
        Query::Records(self.query)
    }
}

/// A query over stored protocol configurations.
#[derive(Clone, Debug, Default)]
pub struct ProtocolsQuery {
    /// Match the named protocol URI.
    pub protocol: Option<String>,

    /// Match only (un)published configurations.
    pub published: Option<bool>,
}

impl From<ProtocolsQuery> for Query {
    fn from(query: ProtocolsQuery) -> Self {
        Self::Protocols(query)
    }
}

/// A query over stored permission grants and revocations.
#[derive(Clone, Debug, Default)]
pub struct GrantsQuery {
    /// Restrict matches to the specified method (`Grant` or `Revoke`).
    pub method: Option<Method>,

    /// Match revocations of the specified grant.
    pub permission_grant_id: Option<String>,
}

impl From<GrantsQuery> for Query {
    fn from(query: GrantsQuery) -> Self {
        Self::Grants(query)
    }
}

impl GrantsQuery {
    pub(crate) fn to_index_filters(&self) -> Result<Vec<BTreeMap<String, FilterVal>>> {
        let mut conjunction = BTreeMap::new();
        conjunction
            .insert("interface".to_string(), FilterVal::equal(Interface::Permissions.to_string()));
        if let Some(method) = &self.method {
            conjunction.insert("method".to_string(), FilterVal::equal(method.to_string()));
        }
        if let Some(grant_id) = &self.permission_grant_id {
            conjunction
                .insert("permissionGrantId".to_string(), FilterVal::equal(grant_id.clone()));
        }
        Ok(vec![conjunction])
    }
}

/// A query over the event log.
#[derive(Clone, Debug, Default)]
pub struct EventsQuery {
    /// Filters — a match against any one filter is a match.
    pub filters: Vec<crate::events::EventsFilter>,

    /// Resume strictly after this cursor.
    pub cursor: Option<Cursor>,
}

/// Sort orderings for records queries.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Sort {
    #[serde(rename = "createdAscending")]
    CreatedAsc,
    #[serde(rename = "createdDescending")]
    CreatedDesc,
    #[serde(rename = "publishedAscending")]
    PublishedAsc,
    #[serde(rename = "publishedDescending")]
    PublishedDesc,
    #[serde(rename = "timestampAscending")]
    #[default]
    TimestampAsc,
    #[serde(rename = "timestampDescending")]
    TimestampDesc,
}

impl Sort {
    /// The index property the sort orders by.
    #[must_use]
    pub const fn index_property(&self) -> &'static str {
        match self {
            Self::CreatedAsc | Self::CreatedDesc => "dateCreated",
            Self::PublishedAsc | Self::PublishedDesc => "datePublished",
            Self::TimestampAsc | Self::TimestampDesc => "messageTimestamp",
        }
    }

    /// Whether the sort is ascending.
    #[must_use]
    pub const fn is_ascending(&self) -> bool {
        matches!(self, Self::CreatedAsc | Self::PublishedAsc | Self::TimestampAsc)
    }
}

/// Pagination settings for a query.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    /// Maximum entries to return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Resume strictly after this cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// An opaque pagination cursor: the sort value and message CID of the last
/// entry returned.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// CID of the last returned message.
    pub message_cid: String,

    /// Encoded sort value of the last returned message.
    pub value: String,
}

impl RecordsQuery {
    /// Lower the query to index filter conjunctions.
    pub(crate) fn to_index_filters(&self) -> Result<Vec<BTreeMap<String, FilterVal>>> {
        let mut conjunctions = Vec::new();

        let base_filters = if self.filters.is_empty() {
            vec![RecordsFilter::default()]
        } else {
            self.filters.clone()
        };

        for filter in &base_filters {
            let mut conjunction = filter.to_index_filter()?;
            conjunction
                .insert("interface".to_string(), FilterVal::equal(Interface::Records.to_string()));
            if let Some(method) = &self.method {
                conjunction.insert("method".to_string(), FilterVal::equal(method.to_string()));
            }
            if !self.include_archived {
                conjunction.insert("archived".to_string(), FilterVal::equal("false"));
            }
            conjunctions.push(conjunction);
        }

        Ok(conjunctions)
    }
}

impl ProtocolsQuery {
    pub(crate) fn to_index_filters(&self) -> Result<Vec<BTreeMap<String, FilterVal>>> {
        let mut conjunction = BTreeMap::new();
        conjunction
            .insert("interface".to_string(), FilterVal::equal(Interface::Protocols.to_string()));
        conjunction.insert("method".to_string(), FilterVal::equal(Method::Configure.to_string()));
        if let Some(protocol) = &self.protocol {
            conjunction.insert("protocol".to_string(), FilterVal::equal(protocol.clone()));
        }
        if let Some(published) = self.published {
            conjunction.insert("published".to_string(), FilterVal::equal(published.to_string()));
        }
        Ok(vec![conjunction])
    }
}

impl TryFrom<&Entry> for Write {
    type Error = crate::Error;

    fn try_from(entry: &Entry) -> Result<Self> {
        match &entry.message {
            EntryType::Write(write) => Ok(write.clone()),
            _ => Err(unexpected!("expected `RecordsWrite` message")),
        }
    }
}

impl TryFrom<Entry> for Write {
    type Error = crate::Error;

    fn try_from(entry: Entry) -> Result<Self> {
        match entry.message {
            EntryType::Write(write) => Ok(write),
            _ => Err(unexpected!("expected `RecordsWrite` message")),
        }
    }
}

impl TryFrom<&Entry> for Delete {
    type Error = crate::Error;

    fn try_from(entry: &Entry) -> Result<Self> {
        match &entry.message {
            EntryType::Delete(delete) => Ok(delete.clone()),
            _ => Err(unexpected!("expected `RecordsDelete` message")),
        }
    }
}

impl TryFrom<&Entry> for Configure {
    type Error = crate::Error;

    fn try_from(entry: &Entry) -> Result<Self> {
        match &entry.message {
            EntryType::Configure(configure) => Ok(configure.clone()),
            _ => Err(unexpected!("expected `ProtocolsConfigure` message")),
        }
    }
}
