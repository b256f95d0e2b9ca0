//! # Index engine
//!
//! A lexicographically ordered secondary index over heterogeneous typed
//! values. Entries are keyed
//! `<property>\x00<encodedValue>\x00<watermark>\x00<itemId>` so that a
//! single byte-ordered scan answers equality, range, and prefix filters. A
//! companion row per item stores the flattened indexes for exact deletion
//! and for sorting query results.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::{KvStore, WriteOp};
use crate::store::Cursor;
use crate::store::partition::{Partition, check_segment};
use crate::{Result, unexpected};

/// The largest integer losslessly representable, and the offset added to
/// negative values so they sort lexicographically before positives.
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

const PAD_WIDTH: usize = 16;

/// A filter over a single indexed property.
#[derive(Clone, Debug)]
pub enum FilterVal {
    /// Match the exact value.
    Equal(Value),

    /// Match any of the values.
    AnyOf(Vec<Value>),

    /// Match values within the range.
    Range(RangeFilter),

    /// Match string values starting with the prefix.
    StartsWith(String),
}

impl FilterVal {
    /// Equality filter over any scalar convertible to a JSON value.
    pub fn equal(value: impl Into<Value>) -> Self {
        Self::Equal(value.into())
    }
}

/// Range bounds. `gt`/`gte` and `lt`/`lte` are mutually exclusive per side.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RangeFilter {
    /// Strictly greater than.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gt: Option<Value>,

    /// Greater than or equal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gte: Option<Value>,

    /// Strictly less than.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lt: Option<Value>,

    /// Less than or equal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lte: Option<Value>,
}

/// A matched item: its id and the flattened indexes it was stored with.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct IndexedItem {
    /// The indexed item's id (a message CID).
    pub item_id: String,

    /// Watermark the item was indexed under.
    pub watermark: String,

    /// The item's flattened indexes.
    pub indexes: HashMap<String, Value>,
}

/// Parameters for an index query.
#[derive(Clone, Debug)]
pub(crate) struct IndexQuery {
    /// Disjunction of filter conjunctions.
    pub filters: Vec<BTreeMap<String, FilterVal>>,

    /// Index property to sort by.
    pub sort_field: String,

    /// Ascending or descending.
    pub ascending: bool,

    /// Resume strictly after this cursor.
    pub cursor: Option<Cursor>,

    /// Maximum items to return.
    pub limit: Option<usize>,
}

/// Encode a scalar value for byte-ordered comparison.
///
/// Strings are quoted literally (the `\x00` delimiter is rejected), numbers
/// are zero-padded decimals with negatives `!`-prefixed and offset so they
/// sort below positives, booleans are their literal names.
///
/// # Errors
///
/// Returns an error for nulls, objects, arrays, non-finite numbers, numbers
/// outside the safe-integer range, and strings containing `\x00`.
pub(crate) fn encode_value(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => {
            check_segment(s)?;
            Ok(format!("\"{s}\""))
        }
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => encode_number(n),
        _ => Err(unexpected!("unsupported index value: {value}")),
    }
}

fn encode_number(n: &serde_json::Number) -> Result<String> {
    if let Some(i) = n.as_i64() {
        if i.abs() > MAX_SAFE_INTEGER {
            return Err(unexpected!("number outside safe integer range: {i}"));
        }
        if i < 0 {
            return Ok(format!("!{value:0width$}", value = MAX_SAFE_INTEGER + i, width = PAD_WIDTH));
        }
        return Ok(format!("{i:0width$}", width = PAD_WIDTH));
    }

    let Some(f) = n.as_f64() else {
        return Err(unexpected!("unsupported number: {n}"));
    };
    if !f.is_finite() {
        return Err(unexpected!("number is not finite: {n}"));
    }

    // split into integral floor and fraction so the fraction digits extend
    // the padded integral encoding without disturbing its ordering
    let floor = f.floor();
    if floor.abs() > MAX_SAFE_INTEGER as f64 {
        return Err(unexpected!("number outside safe integer range: {n}"));
    }
    #[allow(clippy::cast_possible_truncation)]
    let floor_i = floor as i64;
    let fraction = f - floor;

    let mut encoded = if floor_i < 0 {
        format!("!{value:0width$}", value = MAX_SAFE_INTEGER + floor_i, width = PAD_WIDTH)
    } else {
        format!("{floor_i:0width$}", width = PAD_WIDTH)
    };
    if fraction > 0.0 {
        let digits = format!("{fraction}");
        encoded.push('.');
        encoded.push_str(digits.trim_start_matches("0."));
    }

    Ok(encoded)
}

fn companion_key(item_id: &str) -> String {
    format!("__{item_id}__indexes")
}

fn entry_key(property: &str, encoded: &str, watermark: &str, item_id: &str) -> String {
    format!("{property}\u{0}{encoded}\u{0}{watermark}\u{0}{item_id}")
}

// Expand an index value into the encoded forms it is findable under
// (array-valued properties emit one entry per element).
fn encoded_terms(value: &Value) -> Result<Vec<String>> {
    if let Value::Array(elements) = value {
        let mut terms = Vec::with_capacity(elements.len());
        for element in elements {
            terms.push(encode_value(element)?);
        }
        Ok(terms)
    } else {
        Ok(vec![encode_value(value)?])
    }
}

/// Insert index entries for an item.
pub(crate) async fn insert(
    partition: &Partition, item_id: &str, watermark: &str, indexes: &HashMap<String, Value>,
    kv: &impl KvStore,
) -> Result<()> {
    check_segment(item_id)?;
    check_segment(watermark)?;

    let mut ops = Vec::new();
    let row_value = format!("{item_id}~{watermark}").into_bytes();

    for (property, value) in indexes {
        check_segment(property)?;
        for encoded in encoded_terms(value)? {
            ops.push(WriteOp::Put {
                key: entry_key(property, &encoded, watermark, item_id),
                value: row_value.clone(),
            });
        }
    }

    let item = IndexedItem {
        item_id: item_id.to_string(),
        watermark: watermark.to_string(),
        indexes: indexes.clone(),
    };
    ops.push(WriteOp::Put {
        key: companion_key(item_id),
        value: serde_json::to_vec(&item)?,
    });

    kv.batch(partition, ops).await.map_err(Into::into)
}

/// Delete every index entry for an item, using its companion row to
/// reconstruct the exact keys.
pub(crate) async fn delete(
    partition: &Partition, item_id: &str, kv: &impl KvStore,
) -> Result<()> {
    let Some(bytes) = kv.get(partition, &companion_key(item_id)).await? else {
        return Ok(());
    };
    let item: IndexedItem = serde_json::from_slice(&bytes)?;

    let mut ops = Vec::new();
    for (property, value) in &item.indexes {
        for encoded in encoded_terms(value)? {
            ops.push(WriteOp::Delete {
                key: entry_key(property, &encoded, &item.watermark, item_id),
            });
        }
    }
    ops.push(WriteOp::Delete {
        key: companion_key(item_id),
    });

    kv.batch(partition, ops).await.map_err(Into::into)
}

/// Fetch an item's companion row.
pub(crate) async fn get_item(
    partition: &Partition, item_id: &str, kv: &impl KvStore,
) -> Result<Option<IndexedItem>> {
    let Some(bytes) = kv.get(partition, &companion_key(item_id)).await? else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Evaluate a query: union across filters, intersection across each
/// filter's properties, then sort, cursor, and limit.
pub(crate) async fn query(
    partition: &Partition, query: &IndexQuery, kv: &impl KvStore,
) -> Result<(Vec<IndexedItem>, Option<Cursor>)> {
    // union of matches across the filter disjunction
    let mut matched = HashSet::new();
    for conjunction in &query.filters {
        for item_id in match_conjunction(partition, conjunction, kv).await? {
            matched.insert(item_id);
        }
    }

    // pull companion rows and order by the sort property
    let mut items = Vec::with_capacity(matched.len());
    for item_id in matched {
        let Some(item) = get_item(partition, &item_id, kv).await? else {
            continue;
        };
        let sort_value = item
            .indexes
            .get(&query.sort_field)
            .map_or_else(String::new, |v| encode_value(v).unwrap_or_default());
        items.push((sort_value, item));
    }
    items.sort_by(|a, b| (&a.0, &a.1.item_id).cmp(&(&b.0, &b.1.item_id)));
    if !query.ascending {
        items.reverse();
    }

    // resume strictly after the cursor
    if let Some(cursor) = &query.cursor {
        let position = (&cursor.value, &cursor.message_cid);
        items.retain(|(sort_value, item)| {
            let candidate = (sort_value, &item.item_id);
            if query.ascending { candidate > position } else { candidate < position }
        });
    }

    let limit = query.limit.unwrap_or(usize::MAX);
    let mut cursor = None;
    if items.len() > limit {
        items.truncate(limit);
        if let Some((sort_value, item)) = items.last() {
            cursor = Some(Cursor {
                message_cid: item.item_id.clone(),
                value: sort_value.clone(),
            });
        }
    }

    Ok((items.into_iter().map(|(_, item)| item).collect(), cursor))
}

// Match one filter conjunction: a candidate is a hit once every property
// has matched at least one of its values.
async fn match_conjunction(
    partition: &Partition, conjunction: &BTreeMap<String, FilterVal>, kv: &impl KvStore,
) -> Result<HashSet<String>> {
    let properties: Vec<&String> = conjunction.keys().collect();
    if properties.is_empty() {
        return Ok(HashSet::new());
    }

    // candidate -> properties still awaiting a match
    let mut missing: HashMap<String, HashSet<&str>> = HashMap::new();
    let mut first = true;

    for (property, filter) in conjunction {
        let candidates = match_property(partition, property, filter, kv).await?;

        if first {
            for item_id in candidates {
                let mut awaiting: HashSet<&str> =
                    properties.iter().map(|p| p.as_str()).collect();
                awaiting.remove(property.as_str());
                missing.insert(item_id, awaiting);
            }
            first = false;
        } else {
            for item_id in candidates {
                if let Some(awaiting) = missing.get_mut(&item_id) {
                    awaiting.remove(property.as_str());
                }
            }
        }
    }

    Ok(missing
        .into_iter()
        .filter_map(|(item_id, awaiting)| awaiting.is_empty().then_some(item_id))
        .collect())
}

// Match a single property filter via byte-ordered scans.
async fn match_property(
    partition: &Partition, property: &str, filter: &FilterVal, kv: &impl KvStore,
) -> Result<HashSet<String>> {
    match filter {
        FilterVal::Equal(value) => {
            equality_scan(partition, property, &encode_value(value)?, kv).await
        }
        FilterVal::AnyOf(values) => {
            let mut matches = HashSet::new();
            for value in values {
                matches
                    .extend(equality_scan(partition, property, &encode_value(value)?, kv).await?);
            }
            Ok(matches)
        }
        FilterVal::StartsWith(prefix) => {
            check_segment(prefix)?;
            // a quoted-string encoding with the closing quote omitted is a
            // prefix of every encoded string starting with `prefix`
            let encoded_prefix = format!("\"{prefix}");
            let lower = format!("{property}\u{0}{encoded_prefix}");
            let upper = format!("{property}\u{1}");
            scan(partition, property, &lower, &upper, kv, |encoded| {
                encoded.starts_with(&encoded_prefix)
            })
            .await
        }
        FilterVal::Range(range) => range_scan(partition, property, range, kv).await,
    }
}

async fn equality_scan(
    partition: &Partition, property: &str, encoded: &str, kv: &impl KvStore,
) -> Result<HashSet<String>> {
    let lower = format!("{property}\u{0}{encoded}\u{0}");
    let upper = format!("{property}\u{0}{encoded}\u{1}");
    scan(partition, property, &lower, &upper, kv, |candidate| candidate == encoded).await
}

async fn range_scan(
    partition: &Partition, property: &str, range: &RangeFilter, kv: &impl KvStore,
) -> Result<HashSet<String>> {
    let gt = range.gt.as_ref().map(|v| encode_value(v)).transpose()?;
    let gte = range.gte.as_ref().map(|v| encode_value(v)).transpose()?;
    let lt = range.lt.as_ref().map(|v| encode_value(v)).transpose()?;
    let lte = range.lte.as_ref().map(|v| encode_value(v)).transpose()?;

    let lower = match (&gte, &gt) {
        (Some(bound), _) | (_, Some(bound)) => format!("{property}\u{0}{bound}"),
        _ => format!("{property}\u{0}"),
    };
    // `lt`/`lte` exclude exact-value entries here because their trailing
    // `<watermark>\x00<itemId>` segments sort above the bare bound; the
    // `lte` case is supplemented by an equality probe below
    let upper = match (&lte, &lt) {
        (Some(bound), _) | (_, Some(bound)) => format!("{property}\u{0}{bound}"),
        _ => format!("{property}\u{1}"),
    };

    let in_range = |encoded: &str| {
        if let Some(bound) = &gt {
            if encoded <= bound.as_str() {
                return false;
            }
        }
        if let Some(bound) = &gte {
            if encoded < bound.as_str() {
                return false;
            }
        }
        if let Some(bound) = &lt {
            if encoded >= bound.as_str() {
                return false;
            }
        }
        if let Some(bound) = &lte {
            if encoded > bound.as_str() {
                return false;
            }
        }
        true
    };

    let mut matches = scan(partition, property, &lower, &upper, kv, &in_range).await?;

    // exact-value entries for the `lte` bound sit above the naive upper
    // bound, so they need an explicit probe — still subject to the lower
    // bounds, or a degenerate range like `gt: X, lte: X` would match X
    if let Some(bound) = &lte {
        if in_range(bound.as_str()) {
            matches.extend(equality_scan(partition, property, bound, kv).await?);
        }
    }

    Ok(matches)
}

// Scan `[lower, upper)` within a property's subspace, keeping item ids whose
// extracted encoded value satisfies the predicate.
async fn scan(
    partition: &Partition, property: &str, lower: &str, upper: &str, kv: &impl KvStore,
    predicate: impl Fn(&str) -> bool,
) -> Result<HashSet<String>> {
    let mut matches = HashSet::new();

    for (key, _) in kv.range(partition, Some(lower), Some(upper), false).await? {
        let mut segments = key.split('\u{0}');
        let (Some(prop), Some(encoded), Some(_watermark), Some(item_id)) =
            (segments.next(), segments.next(), segments.next(), segments.next())
        else {
            continue;
        };
        if prop != property {
            break;
        }
        if predicate(encoded) {
            matches.insert(item_id.to_string());
        }
    }

    Ok(matches)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn string_encoding() {
        assert_eq!(encode_value(&json!("alice")).unwrap(), "\"alice\"");
        assert!(encode_value(&json!("bad\u{0}string")).is_err());
    }

    #[test]
    fn number_encoding_orders() {
        let neg_five = encode_value(&json!(-5)).unwrap();
        let zero = encode_value(&json!(0)).unwrap();
        let sixty_five = encode_value(&json!(65)).unwrap();
        let hundred = encode_value(&json!(100)).unwrap();

        assert!(neg_five.starts_with('!'));
        assert!(neg_five < zero);
        assert!(zero < sixty_five);
        assert!(sixty_five < hundred);
    }

    #[test]
    fn fractional_encoding_orders() {
        let a = encode_value(&json!(65)).unwrap();
        let b = encode_value(&json!(65.5)).unwrap();
        let c = encode_value(&json!(66)).unwrap();
        assert!(a < b && b < c);

        let d = encode_value(&json!(-5.5)).unwrap();
        let e = encode_value(&json!(-5)).unwrap();
        let f = encode_value(&json!(-6)).unwrap();
        assert!(f < d && d < e);
    }

    #[test]
    fn boolean_encoding() {
        assert_eq!(encode_value(&json!(true)).unwrap(), "true");
        assert_eq!(encode_value(&json!(false)).unwrap(), "false");
    }

    #[test]
    fn rejects_unsupported() {
        assert!(encode_value(&json!(null)).is_err());
        assert!(encode_value(&json!({"a": 1})).is_err());
    }
}
