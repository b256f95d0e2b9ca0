//! # Event log
//!
//! An append-only, per-tenant log of message events keyed by monotonic ULID
//! watermarks. Three keyspaces per tenant: `watermark -> cid` rows for
//! ordered replay, `cid -> watermark` rows for deletion, and a filterable
//! index sharing the engine (and encoding) of the message store's indexes.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{Value, json};
use ulid::{Generator, Ulid};

use crate::event::Event;
use crate::provider::KvStore;
use crate::store::partition::Partition;
use crate::store::{Cursor, EventsQuery, index};
use crate::{Result, unexpected};

const EVENT: &str = "event";
const EVENT_INDEX: &str = "event-index";
const WATERMARK: &str = "watermark";
const CID: &str = "cid";

/// Per-tenant monotonic watermark generation. Owned by the provider and
/// handed to [`append`] — created when the node opens, dropped when it
/// closes.
#[derive(Default)]
pub struct WatermarkFactory {
    generators: Mutex<HashMap<String, Generator>>,
}

impl WatermarkFactory {
    /// Returns a new [`WatermarkFactory`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next watermark for the owner — strictly greater than every
    /// watermark previously returned for the same owner.
    ///
    /// # Errors
    ///
    /// Returns an error in the (vanishingly unlikely) case the monotonic
    /// random extension overflows within one millisecond.
    pub fn next(&self, owner: &str) -> Result<String> {
        let mut generators =
            self.generators.lock().map_err(|_| unexpected!("watermark lock poisoned"))?;
        let generator = generators.entry(owner.to_string()).or_insert_with(Generator::new);
        let ulid: Ulid =
            generator.generate().map_err(|e| unexpected!("issue generating watermark: {e}"))?;
        Ok(ulid.to_string())
    }
}

fn watermark_partition(owner: &str) -> Result<Partition> {
    Partition::root(EVENT)?.child(owner)?.child(WATERMARK)
}

fn cid_partition(owner: &str) -> Result<Partition> {
    Partition::root(EVENT)?.child(owner)?.child(CID)
}

fn index_partition(owner: &str) -> Result<Partition> {
    Partition::root(EVENT_INDEX)?.child(owner)
}

/// Append an event, returning its watermark.
///
/// # Errors
///
/// Returns an error when the underlying store fails.
pub async fn append(
    owner: &str, message_cid: &str, indexes: &HashMap<String, Value>,
    watermarks: &WatermarkFactory, kv: &impl KvStore,
) -> Result<String> {
    let watermark = watermarks.next(owner)?;

    kv.put(&watermark_partition(owner)?, &watermark, message_cid.as_bytes()).await?;
    kv.put(&cid_partition(owner)?, message_cid, watermark.as_bytes()).await?;

    let mut indexes = indexes.clone();
    indexes.insert("watermark".to_string(), json!(watermark));
    index::insert(&index_partition(owner)?, message_cid, &watermark, &indexes, kv).await?;

    Ok(watermark)
}

/// All events strictly after the cursor, in watermark order.
///
/// # Errors
///
/// Returns an error when the underlying store fails.
pub async fn events(
    owner: &str, cursor: Option<Cursor>, kv: &impl KvStore,
) -> Result<(Vec<Event>, Option<Cursor>)> {
    // the least key strictly greater than the cursor's watermark
    let lower = cursor.map(|c| format!("{}\u{0}", c.value));

    let mut events = Vec::new();
    for (watermark, value) in
        kv.range(&watermark_partition(owner)?, lower.as_deref(), None, false).await?
    {
        let message_cid = String::from_utf8(value)
            .map_err(|_| unexpected!("event log row is not a valid CID"))?;
        events.push(Event {
            watermark,
            message_cid,
            indexes: HashMap::new(),
        });
    }

    let cursor = events.last().map(|event| Cursor {
        message_cid: event.message_cid.clone(),
        value: event.watermark.clone(),
    });

    Ok((events, cursor))
}

/// Events matching the query's filters, in watermark order, resuming
/// strictly after the query's cursor.
///
/// # Errors
///
/// Returns an error when a filter cannot be lowered to the index encoding or
/// the underlying store fails.
pub async fn query(
    owner: &str, query: &EventsQuery, kv: &impl KvStore,
) -> Result<(Vec<Event>, Option<Cursor>)> {
    let mut filters = Vec::new();
    if query.filters.is_empty() {
        // no filter constraints: anchor on the watermark every event has
        filters.push(crate::events::EventsFilter::default().to_index_filter()?);
    }
    for filter in &query.filters {
        filters.push(filter.to_index_filter()?);
    }

    let index_query = index::IndexQuery {
        filters,
        sort_field: "watermark".to_string(),
        ascending: true,
        cursor: query.cursor.clone(),
        limit: None,
    };
    let (items, _) = index::query(&index_partition(owner)?, &index_query, kv).await?;

    let events: Vec<Event> = items
        .into_iter()
        .map(|item| Event {
            watermark: item.watermark,
            message_cid: item.item_id,
            indexes: item.indexes,
        })
        .collect();

    let cursor = events.last().map(|event| Cursor {
        message_cid: event.message_cid.clone(),
        value: index::encode_value(&json!(event.watermark)).unwrap_or_default(),
    });

    Ok((events, cursor))
}

/// Delete the events for the specified message CIDs.
///
/// # Errors
///
/// Returns an error when the underlying store fails.
pub async fn delete(owner: &str, message_cids: &[String], kv: &impl KvStore) -> Result<()> {
    let cids = cid_partition(owner)?;
    let watermarks = watermark_partition(owner)?;
    let indexes = index_partition(owner)?;

    for message_cid in message_cids {
        let Some(value) = kv.get(&cids, message_cid).await? else {
            continue;
        };
        let watermark = String::from_utf8(value)
            .map_err(|_| unexpected!("event log row is not a valid watermark"))?;

        kv.delete(&watermarks, &watermark).await?;
        kv.delete(&cids, message_cid).await?;
        index::delete(&indexes, message_cid, kv).await?;
    }

    Ok(())
}
