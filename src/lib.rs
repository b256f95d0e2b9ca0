//! # Decentralized Web Node (DWN)
//!
//! A per-tenant, self-sovereign datastore. Signed messages describe
//! records, protocol configurations, and permission grants; queries, reads,
//! subscriptions, and deletes are gated by protocol-defined access control.
//! Records are content-addressed, versioned by timestamp, and organized
//! into protocol-defined hierarchies.
//!
//! Storage, DID resolution, and signing are supplied by the host through
//! the traits in [`provider`]; [`endpoint::handle`] processes one message
//! for one tenant.

pub mod authorization;
pub mod cid;
pub mod endpoint;
mod error;
pub mod event;
pub mod events;
pub mod grants;
pub mod jws;
pub mod protocols;
pub mod provider;
pub mod records;
pub mod schema;
pub mod store;
pub mod tasks;
pub mod utils;

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

pub use crate::error::Error;

/// Result type for DWN operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The message interfaces a web node exposes.
#[derive(Clone, Debug, Default, Display, Deserialize, Serialize, PartialEq, Eq)]
pub enum Interface {
    /// Records interface.
    #[default]
    Records,

    /// Protocols interface.
    Protocols,

    /// Permissions interface.
    Permissions,

    /// Events interface.
    Events,
}

/// The methods of the message interfaces.
#[derive(Clone, Debug, Default, Display, Deserialize, Serialize, PartialEq, Eq)]
pub enum Method {
    /// Write a record.
    #[default]
    Write,

    /// Read a record.
    Read,

    /// Query for matching messages.
    Query,

    /// Subscribe to matching events.
    Subscribe,

    /// Delete a record.
    Delete,

    /// Configure a protocol.
    Configure,

    /// Grant a permission.
    Grant,

    /// Revoke a permission grant.
    Revoke,
}

/// Fields common to every message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// The message interface.
    pub interface: Interface,

    /// The interface method.
    pub method: Method,

    /// Timestamp the message was created, also the record-version ordering
    /// key.
    #[serde(with = "crate::utils::rfc3339_micros")]
    pub message_timestamp: DateTime<Utc>,
}

/// One value or many.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A single value.
    One(T),

    /// Multiple values.
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    /// The contained value(s) as a `Vec`.
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value.clone()],
            Self::Many(values) => values.clone(),
        }
    }
}

impl<T: Default> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::One(T::default())
    }
}

/// An inclusive range of timestamps; either bound may be open.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    /// Inclusive lower bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "crate::utils::rfc3339_micros_opt", default)]
    pub from: Option<DateTime<Utc>>,

    /// Inclusive upper bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "crate::utils::rfc3339_micros_opt", default)]
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    /// Check the timestamp falls within the range.
    #[must_use]
    pub fn contains(&self, date: &DateTime<Utc>) -> bool {
        if let Some(from) = &self.from {
            if date < from {
                return false;
            }
        }
        if let Some(to) = &self.to {
            if date > to {
                return false;
            }
        }
        true
    }
}
