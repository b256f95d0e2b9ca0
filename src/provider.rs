//! # Provider
//!
//! Traits implemented by the environment hosting a web node: storage over an
//! ordered key-value engine, event delivery, DID resolution, and signing.
//! Implementations are expected to assemble the message, data, event, and
//! task stores from the building blocks in [`crate::store`].

use std::collections::HashMap;

use anyhow::Result;
use serde_json::Value;

use crate::event::{Event, SubscribeFilter, Subscriber};
use crate::jws::PublicKeyJwk;
pub use crate::store::partition::{Partition, WriteOp};
use crate::store::{Cursor, Entry, EventsQuery, Query};
pub use crate::tasks::ResumableTask;

/// Everything a web node needs from its host environment.
pub trait Provider:
    MessageStore + DataStore + EventLog + EventStream + TaskStore + KeyStore + DidResolver
{
}

/// An ordered, byte-lexicographic key-value store with named partitions.
///
/// Keys within a partition are iterated in byte order. Partition names and
/// user-supplied key segments must not contain the `\x00` delimiter —
/// [`Partition`] enforces this at construction.
#[allow(async_fn_in_trait)]
pub trait KvStore: Send + Sync {
    /// Get the value stored at `key`, or `None`.
    async fn get(&self, partition: &Partition, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` at `key`.
    async fn put(&self, partition: &Partition, key: &str, value: &[u8]) -> Result<()>;

    /// Delete the entry at `key`. Deleting a missing key is a no-op.
    async fn delete(&self, partition: &Partition, key: &str) -> Result<()>;

    /// Apply a set of writes atomically within the partition.
    async fn batch(&self, partition: &Partition, ops: Vec<WriteOp>) -> Result<()>;

    /// Entries with keys in `[lower, upper)`, in byte order (reversed when
    /// `reverse` is set). An unset bound is unbounded on that side.
    async fn range(
        &self, partition: &Partition, lower: Option<&str>, upper: Option<&str>, reverse: bool,
    ) -> Result<Vec<(String, Vec<u8>)>>;

    /// Remove every entry in the partition.
    async fn clear(&self, partition: &Partition) -> Result<()>;
}

/// Message storage and retrieval.
#[allow(async_fn_in_trait)]
pub trait MessageStore: Send + Sync {
    /// Store a message entry together with its queryable indexes.
    async fn put(&self, owner: &str, entry: &Entry) -> Result<()>;

    /// Query the store, returning matches in the query's sort order.
    async fn query(&self, owner: &str, query: &Query) -> Result<(Vec<Entry>, Option<Cursor>)>;

    /// Fetch a single message by CID, or `None`.
    async fn get(&self, owner: &str, message_cid: &str) -> Result<Option<Entry>>;

    /// Delete the message and its index entries.
    async fn delete(&self, owner: &str, message_cid: &str) -> Result<()>;
}

/// Content-addressed blob storage, scoped to `(owner, record_id)`.
#[allow(async_fn_in_trait)]
pub trait DataStore: Send + Sync {
    /// Store the blob, returning the computed CID and byte count.
    async fn put(
        &self, owner: &str, record_id: &str, data_cid: &str, data: crate::store::data::DataStream,
    ) -> Result<(String, usize)>;

    /// Fetch the blob stored for `(record_id, data_cid)`, or `None`.
    async fn get(
        &self, owner: &str, record_id: &str, data_cid: &str,
    ) -> Result<Option<crate::store::data::DataStream>>;

    /// Delete the blob stored for `(record_id, data_cid)`.
    async fn delete(&self, owner: &str, record_id: &str, data_cid: &str) -> Result<()>;
}

/// Append-only, watermark-ordered event log.
#[allow(async_fn_in_trait)]
pub trait EventLog: Send + Sync {
    /// Append an event, returning its watermark. Watermarks are strictly
    /// increasing per owner.
    async fn append(
        &self, owner: &str, message_cid: &str, indexes: &HashMap<String, Value>,
    ) -> Result<String>;

    /// All events after the cursor, in watermark order.
    async fn events(
        &self, owner: &str, cursor: Option<Cursor>,
    ) -> Result<(Vec<Event>, Option<Cursor>)>;

    /// Events matching the query's filters, in watermark order.
    async fn query(
        &self, owner: &str, query: &EventsQuery,
    ) -> Result<(Vec<Event>, Option<Cursor>)>;

    /// Delete the events for the specified message CIDs.
    async fn delete(&self, owner: &str, message_cids: &[String]) -> Result<()>;
}

/// Real-time event delivery to subscribers.
#[allow(async_fn_in_trait)]
pub trait EventStream: Send + Sync {
    /// Subscribe to an owner's event stream. Only events emitted after the
    /// subscription starts are delivered.
    async fn subscribe(&self, owner: &str, filter: SubscribeFilter) -> Result<Subscriber>;

    /// Emit an event to an owner's subscribers.
    async fn emit(&self, owner: &str, event: &Entry) -> Result<()>;
}

/// Storage for resumable tasks.
#[allow(async_fn_in_trait)]
pub trait TaskStore: Send + Sync {
    /// Register an in-flight task. Once `timeout_secs` elapse without an
    /// [`TaskStore::extend`], the task becomes grabbable.
    async fn register(&self, owner: &str, task: &ResumableTask, timeout_secs: u64) -> Result<()>;

    /// Grab up to `count` timed-out tasks, extending each one's timeout so
    /// no other client grabs it concurrently.
    async fn grab(&self, owner: &str, count: u64) -> Result<Vec<ResumableTask>>;

    /// Read a task regardless of its in-flight status.
    async fn read(&self, owner: &str, task_id: &str) -> Result<Option<ResumableTask>>;

    /// Extend the task's timeout. No-op when the task no longer exists.
    async fn extend(&self, owner: &str, task_id: &str, timeout_secs: u64) -> Result<()>;

    /// Delete the task.
    async fn delete(&self, owner: &str, task_id: &str) -> Result<()>;
}

/// DID resolution.
#[allow(async_fn_in_trait)]
pub trait DidResolver: Send + Sync {
    /// Resolve a DID to its document.
    async fn resolve(&self, did: &str) -> Result<Document>;
}

/// A resolved DID document, reduced to the keys needed for verification.
#[derive(Clone, Debug, Default)]
pub struct Document {
    /// The document's DID.
    pub id: String,

    /// Public keys usable for signature verification.
    pub verification_method: Vec<VerificationMethod>,
}

/// A public key entry in a DID document.
#[derive(Clone, Debug, Default)]
pub struct VerificationMethod {
    /// Fully-qualified key id (`<did>#<fragment>`).
    pub id: String,

    /// The controlling DID.
    pub controller: String,

    /// The public key.
    pub public_key_jwk: PublicKeyJwk,
}

/// Digital signing.
#[allow(async_fn_in_trait)]
pub trait Signer: Send + Sync {
    /// Sign the message, returning the signature bytes.
    async fn try_sign(&self, msg: &[u8]) -> Result<Vec<u8>>;

    /// The fully-qualified verification method (`<did>#<fragment>`) of the
    /// signing key.
    fn verification_method(&self) -> String;
}

/// A keyring bundles the signing capability for one controller.
pub trait Keyring: Signer + Send + Sync {}

/// Access to keyrings by controller.
pub trait KeyStore: Send + Sync {
    /// The keyring for the specified controller.
    ///
    /// # Errors
    ///
    /// Returns an error when no keys exist for the controller.
    fn keyring(&self, controller: &str) -> Result<impl Keyring>;
}
