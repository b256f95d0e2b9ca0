//! # Event
//!
//! Event-log rows and real-time subscription plumbing.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::EventsFilter;
use crate::records::RecordsFilter;
use crate::store::{Entry, EntryType};

/// A row in the event log.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// The event's watermark — strictly increasing per tenant.
    pub watermark: String,

    /// CID of the message the event records.
    pub message_cid: String,

    /// The indexes the event is filterable by.
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub indexes: HashMap<String, Value>,
}

/// Filter applied to events delivered to a subscriber.
#[derive(Debug, Deserialize, Serialize)]
#[allow(missing_docs)]
pub enum SubscribeFilter {
    Events(Vec<EventsFilter>),
    Records(RecordsFilter),
}

impl Default for SubscribeFilter {
    fn default() -> Self {
        Self::Events(Vec::default())
    }
}

impl SubscribeFilter {
    /// Check the event matches the filter.
    #[must_use]
    pub fn is_match(&self, event: &Entry) -> bool {
        match self {
            Self::Events(filters) => {
                filters.is_empty() || filters.iter().any(|filter| filter.is_match(event))
            }
            Self::Records(filter) => {
                // records filters only ever match records events
                if let EntryType::Configure(_) = event.message {
                    return false;
                }
                filter.is_match(event)
            }
        }
    }
}

/// A live event subscription. Dropping (or [`Subscriber::close`]-ing) the
/// subscriber releases the upstream handler.
pub struct Subscriber {
    inner: Pin<Box<dyn Stream<Item = Entry> + Send>>,
}

impl Default for Subscriber {
    fn default() -> Self {
        Self {
            inner: Box::pin(futures::stream::empty()),
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").finish()
    }
}

impl Subscriber {
    /// Wrap a provider's subscription stream.
    #[must_use]
    pub fn new(stream: Pin<Box<dyn Stream<Item = Entry> + Send>>) -> Self {
        Self { inner: stream }
    }

    /// Close the subscription, releasing upstream resources.
    pub fn close(self) {
        drop(self);
    }
}

impl Stream for Subscriber {
    type Item = Entry;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
