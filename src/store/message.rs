//! # Message store
//!
//! Stores parsed messages keyed by message CID with per-tenant secondary
//! indexes over their flattened fields. Built over any ordered
//! [`KvStore`]; hosts wire these functions into their
//! [`crate::provider::MessageStore`] implementation.

use crate::provider::KvStore;
use crate::store::event_log::WatermarkFactory;
use crate::store::partition::Partition;
use crate::store::{Cursor, Entry, Query, index};
use crate::Result;

const MESSAGE: &str = "message";
const INDEX: &str = "index";

fn message_partition(owner: &str) -> Result<Partition> {
    Partition::root(MESSAGE)?.child(owner)
}

fn index_partition(owner: &str) -> Result<Partition> {
    Partition::root(INDEX)?.child(owner)
}

/// Store a message entry and (re)write its index rows.
///
/// The message row is written before the index rows so a query hit always
/// resolves to a stored message; a crash in between leaves the message
/// invisible, which a retry of the same operation repairs.
///
/// # Errors
///
/// Returns an error when the entry cannot be serialized or the underlying
/// store fails.
pub async fn put(
    owner: &str, entry: &Entry, watermarks: &WatermarkFactory, kv: &impl KvStore,
) -> Result<()> {
    let message_cid = entry.cid()?;

    let messages = message_partition(owner)?;
    kv.put(&messages, &message_cid, &serde_json::to_vec(entry)?).await?;

    let indexes = index_partition(owner)?;
    index::delete(&indexes, &message_cid, kv).await?;
    index::insert(&indexes, &message_cid, &watermarks.next(owner)?, &entry.indexes, kv).await
}

/// Query the store, returning matching entries in the query's sort order
/// with duplicates removed by message CID.
///
/// # Errors
///
/// Returns an error when a filter cannot be lowered to the index encoding or
/// the underlying store fails.
pub async fn query(
    owner: &str, query: &Query, kv: &impl KvStore,
) -> Result<(Vec<Entry>, Option<Cursor>)> {
    let index_query = match query {
        Query::Records(records) => {
            let pagination = records.pagination.clone().unwrap_or_default();
            index::IndexQuery {
                filters: records.to_index_filters()?,
                sort_field: records.sort.index_property().to_string(),
                ascending: records.sort.is_ascending(),
                cursor: pagination.cursor,
                limit: pagination.limit,
            }
        }
        Query::Protocols(protocols) => index::IndexQuery {
            filters: protocols.to_index_filters()?,
            sort_field: "messageTimestamp".to_string(),
            ascending: true,
            cursor: None,
            limit: None,
        },
        Query::Grants(grants) => index::IndexQuery {
            filters: grants.to_index_filters()?,
            sort_field: "messageTimestamp".to_string(),
            ascending: true,
            cursor: None,
            limit: None,
        },
    };

    let indexes = index_partition(owner)?;
    let (items, cursor) = index::query(&indexes, &index_query, kv).await?;

    let messages = message_partition(owner)?;
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        if let Some(bytes) = kv.get(&messages, &item.item_id).await? {
            entries.push(serde_json::from_slice(&bytes)?);
        }
    }

    Ok((entries, cursor))
}

/// Fetch a single message by CID.
///
/// # Errors
///
/// Returns an error when the underlying store fails.
pub async fn get(owner: &str, message_cid: &str, kv: &impl KvStore) -> Result<Option<Entry>> {
    let messages = message_partition(owner)?;
    let Some(bytes) = kv.get(&messages, message_cid).await? else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Delete a message and its index rows.
///
/// # Errors
///
/// Returns an error when the underlying store fails.
pub async fn delete(owner: &str, message_cid: &str, kv: &impl KvStore) -> Result<()> {
    let indexes = index_partition(owner)?;
    index::delete(&indexes, message_cid, kv).await?;

    let messages = message_partition(owner)?;
    kv.delete(&messages, message_cid).await.map_err(Into::into)
}
