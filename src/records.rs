//! # Records
//!
//! The records interface: write, read, query, subscribe, and delete
//! operations over content-addressed, versioned records.

pub mod delete;
pub(crate) mod protocol;
pub mod query;
pub mod read;
pub mod subscribe;
pub mod write;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::delete::{Delete, DeleteBuilder, DeleteDescriptor};
pub use self::query::{Query, QueryBuilder, QueryDescriptor, QueryReply, QueryReplyEntry};
pub use self::read::{Read, ReadBuilder, ReadDescriptor, ReadReply, ReadReplyEntry};
pub use self::subscribe::{Subscribe, SubscribeBuilder, SubscribeDescriptor, SubscribeReply};
pub use self::write::{
    Data, EncryptionProperty, Write, WriteBuilder, WriteDescriptor, WriteProtocol, entry_id,
};
pub use crate::store::data::DataStream;
use crate::store::index::{FilterVal, RangeFilter, encode_value};
use crate::store::{Entry, EntryType};
use crate::{DateRange, OneOrMany, Result, utils};

/// Filter over records entries. Every set field must match.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsFilter {
    /// Match a single record by id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,

    /// Records authored by any of the specified DIDs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<OneOrMany<String>>,

    /// Records attested by the specified DID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attester: Option<String>,

    /// Records addressed to any of the specified DIDs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<OneOrMany<String>>,

    /// Records in the specified context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// Records whose context starts with the specified prefix (a context and
    /// all of its descendants).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id_prefix: Option<String>,

    /// Records with the specified parent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Records bound to the specified protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Records at the specified protocol path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_path: Option<String>,

    /// Records with the specified schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Records with the specified data format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_format: Option<String>,

    /// Records referencing the specified data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_cid: Option<String>,

    /// Records whose data size falls within the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_size: Option<RangeFilter>,

    /// Records with the specified published state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,

    /// Records created within the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_created: Option<DateRange>,

    /// Records published within the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_published: Option<DateRange>,

    /// Records whose tags match the specified filters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, TagFilter>>,
}

/// Filter over a single tag value.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TagFilter {
    /// Match string tags starting with the prefix.
    StartsWith(String),

    /// Match tags within the range.
    Range(RangeFilter),

    /// Match tags equal to any of the values.
    AnyOf(Vec<Value>),

    /// Match tags equal to the value.
    Equal(Value),
}

impl Default for TagFilter {
    fn default() -> Self {
        Self::Equal(Value::Null)
    }
}

impl TagFilter {
    /// Check a tag value matches the filter.
    #[must_use]
    pub fn is_match(&self, tag: &Value) -> bool {
        match self {
            Self::StartsWith(prefix) => tag.as_str().is_some_and(|s| s.starts_with(prefix)),
            Self::Equal(value) => tag == value,
            Self::AnyOf(values) => values.contains(tag),
            Self::Range(range) => {
                // compare in the index's encoded space so numbers order
                // numerically
                let Ok(encoded) = encode_value(tag) else {
                    return false;
                };
                let in_bound = |bound: &Option<Value>, check: fn(&str, &str) -> bool| {
                    bound.as_ref().is_none_or(|b| {
                        encode_value(b).is_ok_and(|eb| check(encoded.as_str(), eb.as_str()))
                    })
                };
                in_bound(&range.gt, |v, b| v > b)
                    && in_bound(&range.gte, |v, b| v >= b)
                    && in_bound(&range.lt, |v, b| v < b)
                    && in_bound(&range.lte, |v, b| v <= b)
            }
        }
    }
}

impl From<TagFilter> for FilterVal {
    fn from(filter: TagFilter) -> Self {
        match filter {
            TagFilter::StartsWith(prefix) => Self::StartsWith(prefix),
            TagFilter::Range(range) => Self::Range(range),
            TagFilter::AnyOf(values) => Self::AnyOf(values),
            TagFilter::Equal(value) => Self::Equal(value),
        }
    }
}

impl RecordsFilter {
    /// Returns a new [`RecordsFilter`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize the filter's protocol and schema URLs.
    pub(crate) fn normalize(&self) -> Result<Self> {
        let mut filter = self.clone();
        if let Some(protocol) = &self.protocol {
            filter.protocol = Some(utils::clean_url(protocol)?);
        }
        if let Some(schema) = &self.schema {
            filter.schema = Some(utils::clean_url(schema)?);
        }
        Ok(filter)
    }

    /// Lower the filter to an index conjunction.
    pub(crate) fn to_index_filter(&self) -> Result<BTreeMap<String, FilterVal>> {
        let mut conjunction = BTreeMap::new();

        if let Some(record_id) = &self.record_id {
            conjunction.insert("recordId".to_string(), FilterVal::equal(record_id.clone()));
        }
        if let Some(author) = &self.author {
            let authors = author.to_vec().into_iter().map(Value::from).collect();
            conjunction.insert("author".to_string(), FilterVal::AnyOf(authors));
        }
        if let Some(attester) = &self.attester {
            conjunction.insert("attester".to_string(), FilterVal::equal(attester.clone()));
        }
        if let Some(recipient) = &self.recipient {
            let recipients = recipient.to_vec().into_iter().map(Value::from).collect();
            conjunction.insert("recipient".to_string(), FilterVal::AnyOf(recipients));
        }
        if let Some(context_id) = &self.context_id {
            conjunction.insert("contextId".to_string(), FilterVal::equal(context_id.clone()));
        }
        if let Some(prefix) = &self.context_id_prefix {
            conjunction.insert("contextId".to_string(), FilterVal::StartsWith(prefix.clone()));
        }
        if let Some(parent_id) = &self.parent_id {
            conjunction.insert("parentId".to_string(), FilterVal::equal(parent_id.clone()));
        }
        if let Some(protocol) = &self.protocol {
            conjunction.insert("protocol".to_string(), FilterVal::equal(protocol.clone()));
        }
        if let Some(protocol_path) = &self.protocol_path {
            conjunction
                .insert("protocolPath".to_string(), FilterVal::equal(protocol_path.clone()));
        }
        if let Some(schema) = &self.schema {
            conjunction.insert("schema".to_string(), FilterVal::equal(schema.clone()));
        }
        if let Some(data_format) = &self.data_format {
            conjunction.insert("dataFormat".to_string(), FilterVal::equal(data_format.clone()));
        }
        if let Some(data_cid) = &self.data_cid {
            conjunction.insert("dataCid".to_string(), FilterVal::equal(data_cid.clone()));
        }
        if let Some(data_size) = &self.data_size {
            conjunction.insert("dataSize".to_string(), FilterVal::Range(data_size.clone()));
        }
        if let Some(published) = self.published {
            conjunction.insert("published".to_string(), FilterVal::equal(published.to_string()));
        }
        if let Some(date_created) = &self.date_created {
            conjunction.insert("dateCreated".to_string(), FilterVal::Range(date_range(date_created)));
        }
        if let Some(date_published) = &self.date_published {
            conjunction
                .insert("datePublished".to_string(), FilterVal::Range(date_range(date_published)));
        }
        if let Some(tags) = &self.tags {
            for (name, filter) in tags {
                conjunction.insert(format!("tag.{name}"), filter.clone().into());
            }
        }

        Ok(conjunction)
    }

    /// Check a stored entry matches the filter (used for subscriptions,
    /// where events are matched in memory rather than via the index).
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn is_match(&self, entry: &Entry) -> bool {
        let write = match &entry.message {
            EntryType::Write(write) => write,
            EntryType::Delete(_) => {
                // a tombstone matches on record id only
                return self.record_id.as_ref().is_none_or(|record_id| {
                    entry.as_delete().is_some_and(|d| &d.descriptor.record_id == record_id)
                });
            }
            _ => return false,
        };
        let descriptor = &write.descriptor;

        if let Some(record_id) = &self.record_id {
            if record_id != &write.record_id {
                return false;
            }
        }
        if let Some(author) = &self.author {
            if !author.to_vec().contains(&write.authorization.author().unwrap_or_default()) {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient {
            if !recipient.to_vec().contains(descriptor.recipient.as_ref().unwrap_or(&String::new()))
            {
                return false;
            }
        }
        if let Some(context_id) = &self.context_id {
            if Some(context_id) != write.context_id.as_ref() {
                return false;
            }
        }
        if let Some(prefix) = &self.context_id_prefix {
            if !write.context_id.as_ref().is_some_and(|c| c.starts_with(prefix)) {
                return false;
            }
        }
        if let Some(parent_id) = &self.parent_id {
            if Some(parent_id) != descriptor.parent_id.as_ref() {
                return false;
            }
        }
        if let Some(protocol) = &self.protocol {
            if Some(protocol) != descriptor.protocol.as_ref() {
                return false;
            }
        }
        if let Some(protocol_path) = &self.protocol_path {
            if Some(protocol_path) != descriptor.protocol_path.as_ref() {
                return false;
            }
        }
        if let Some(schema) = &self.schema {
            if Some(schema) != descriptor.schema.as_ref() {
                return false;
            }
        }
        if let Some(data_format) = &self.data_format {
            if data_format != &descriptor.data_format {
                return false;
            }
        }
        if let Some(data_cid) = &self.data_cid {
            if data_cid != &descriptor.data_cid {
                return false;
            }
        }
        if let Some(published) = self.published {
            if published != descriptor.published.unwrap_or_default() {
                return false;
            }
        }
        if let Some(date_created) = &self.date_created {
            if !date_created.contains(&descriptor.date_created) {
                return false;
            }
        }
        if let Some(date_published) = &self.date_published {
            if !descriptor.date_published.as_ref().is_some_and(|d| date_published.contains(d)) {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            for (name, filter) in tags {
                let Some(record_tags) = &descriptor.tags else {
                    return false;
                };
                let value = record_tags.get(name).unwrap_or(&Value::Null);
                if !filter.is_match(value) {
                    return false;
                }
            }
        }

        true
    }
}

fn date_range(range: &DateRange) -> RangeFilter {
    use chrono::SecondsFormat::Micros;
    RangeFilter {
        gte: range.from.map(|from| Value::from(from.to_rfc3339_opts(Micros, true))),
        lte: range.to.map(|to| Value::from(to.to_rfc3339_opts(Micros, true))),
        ..RangeFilter::default()
    }
}

/// Builder-like methods for [`RecordsFilter`].
impl RecordsFilter {
    /// Add an author to the filter.
    #[must_use]
    pub fn add_author(mut self, author: impl Into<String>) -> Self {
        match &mut self.author {
            Some(OneOrMany::Many(existing)) => existing.push(author.into()),
            Some(OneOrMany::One(existing)) => {
                self.author = Some(OneOrMany::Many(vec![existing.clone(), author.into()]));
            }
            None => self.author = Some(OneOrMany::One(author.into())),
        }
        self
    }

    /// Add an attester to the filter.
    #[must_use]
    pub fn attester(mut self, attester: impl Into<String>) -> Self {
        self.attester = Some(attester.into());
        self
    }

    /// Add a recipient to the filter.
    #[must_use]
    pub fn add_recipient(mut self, recipient: impl Into<String>) -> Self {
        match &mut self.recipient {
            Some(OneOrMany::Many(existing)) => existing.push(recipient.into()),
            Some(OneOrMany::One(existing)) => {
                self.recipient = Some(OneOrMany::Many(vec![existing.clone(), recipient.into()]));
            }
            None => self.recipient = Some(OneOrMany::One(recipient.into())),
        }
        self
    }

    /// Add a protocol to the filter.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Add a protocol path to the filter.
    #[must_use]
    pub fn protocol_path(mut self, protocol_path: impl Into<String>) -> Self {
        self.protocol_path = Some(protocol_path.into());
        self
    }

    /// Add a schema to the filter.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Add a published flag to the filter.
    #[must_use]
    pub const fn published(mut self, published: bool) -> Self {
        self.published = Some(published);
        self
    }

    /// Add a context id to the filter.
    #[must_use]
    pub fn context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Add a context id prefix to the filter.
    #[must_use]
    pub fn context_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.context_id_prefix = Some(prefix.into());
        self
    }

    /// Add a record id to the filter.
    #[must_use]
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Add a parent id to the filter.
    #[must_use]
    pub fn parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Add a tag filter.
    #[must_use]
    pub fn add_tag(mut self, name: impl Into<String>, filter: TagFilter) -> Self {
        self.tags.get_or_insert_with(BTreeMap::new).insert(name.into(), filter);
        self
    }

    /// Add a data format to the filter.
    #[must_use]
    pub fn data_format(mut self, data_format: impl Into<String>) -> Self {
        self.data_format = Some(data_format.into());
        self
    }

    /// Add a data size range to the filter.
    #[must_use]
    pub fn data_size(mut self, data_size: RangeFilter) -> Self {
        self.data_size = Some(data_size);
        self
    }

    /// Add a data CID to the filter.
    #[must_use]
    pub fn data_cid(mut self, data_cid: impl Into<String>) -> Self {
        self.data_cid = Some(data_cid.into());
        self
    }

    /// Add a created-date range to the filter.
    #[must_use]
    pub const fn date_created(mut self, date_created: DateRange) -> Self {
        self.date_created = Some(date_created);
        self
    }

    /// Add a published-date range to the filter.
    #[must_use]
    pub const fn date_published(mut self, date_published: DateRange) -> Self {
        self.date_published = Some(date_published);
        self
    }
}
