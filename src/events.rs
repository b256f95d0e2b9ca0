//! # Events
//!
//! The events interface: queries over a tenant's append-only event log.

pub mod query;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use self::query::{Query, QueryBuilder, QueryDescriptor, QueryReply};
use crate::store::index::{FilterVal, RangeFilter};
use crate::store::{Entry, EntryType};
use crate::{DateRange, Interface, Method, Result};

/// Filter over event-log entries. Every set field must match.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsFilter {
    /// Match events for the specified interface.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<Interface>,

    /// Match events for the specified method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,

    /// Match events for the specified protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Match events timestamped within the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_timestamp: Option<DateRange>,
}

impl EventsFilter {
    /// Returns a new [`EventsFilter`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Match events for the specified interface.
    #[must_use]
    pub const fn interface(mut self, interface: Interface) -> Self {
        self.interface = Some(interface);
        self
    }

    /// Match events for the specified method.
    #[must_use]
    pub const fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Match events for the specified protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Match events timestamped within the range.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateRange) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// Lower the filter to an index conjunction.
    pub(crate) fn to_index_filter(&self) -> Result<BTreeMap<String, FilterVal>> {
        use chrono::SecondsFormat::Micros;

        let mut conjunction = BTreeMap::new();

        if let Some(interface) = &self.interface {
            conjunction.insert("interface".to_string(), FilterVal::equal(interface.to_string()));
        }
        if let Some(method) = &self.method {
            conjunction.insert("method".to_string(), FilterVal::equal(method.to_string()));
        }
        if let Some(protocol) = &self.protocol {
            conjunction.insert("protocol".to_string(), FilterVal::equal(protocol.clone()));
        }
        if let Some(range) = &self.message_timestamp {
            conjunction.insert(
                "messageTimestamp".to_string(),
                FilterVal::Range(RangeFilter {
                    gte: range.from.map(|f| f.to_rfc3339_opts(Micros, true).into()),
                    lte: range.to.map(|t| t.to_rfc3339_opts(Micros, true).into()),
                    ..RangeFilter::default()
                }),
            );
        }

        // an empty filter would lower to an empty conjunction, which matches
        // nothing — anchor it on the watermark every event carries
        if conjunction.is_empty() {
            conjunction.insert(
                "watermark".to_string(),
                FilterVal::Range(RangeFilter::default()),
            );
        }

        Ok(conjunction)
    }

    /// Check a stored entry matches the filter (used for subscriptions).
    #[must_use]
    pub fn is_match(&self, entry: &Entry) -> bool {
        let descriptor = entry.descriptor();

        if let Some(interface) = &self.interface {
            if interface != &descriptor.interface {
                return false;
            }
        }
        if let Some(method) = &self.method {
            if method != &descriptor.method {
                return false;
            }
        }
        if let Some(protocol) = &self.protocol {
            match &entry.message {
                EntryType::Write(write) => {
                    if Some(protocol) != write.descriptor.protocol.as_ref() {
                        return false;
                    }
                }
                EntryType::Configure(configure) => {
                    if protocol != &configure.descriptor.definition.protocol {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        if let Some(message_timestamp) = &self.message_timestamp {
            if !message_timestamp.contains(&descriptor.message_timestamp) {
                return false;
            }
        }

        true
    }
}
