//! # Provider
//!
//! An in-memory provider: a `BTreeMap`-backed ordered key-value store with
//! the web node's message, data, event, and task stores assembled from
//! `dwn_core::store`, plus channel-based event delivery and the
//! deterministic key store.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Included};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use dwn_core::event::{SubscribeFilter, Subscriber};
use dwn_core::provider::{
    DataStore, DidResolver, Document, EventLog, EventStream, KeyStore, KvStore, MessageStore,
    Partition, Provider, ResumableTask, TaskStore, WriteOp,
};
use dwn_core::store::data::DataStream;
use dwn_core::store::event_log::WatermarkFactory;
use dwn_core::store::{Cursor, Entry, EventsQuery, Query, data, event_log, message, task};
use dwn_core::tasks::TIMEOUT_SECS;
use futures::channel::mpsc;
use serde_json::Value;

use crate::key_store;

/// An in-memory provider implementation.
#[derive(Clone)]
pub struct ProviderImpl {
    kv: Arc<KvStoreImpl>,
    watermarks: Arc<WatermarkFactory>,
    subscribers: Arc<Mutex<Vec<Subscription>>>,
}

struct Subscription {
    owner: String,
    filter: SubscribeFilter,
    sender: mpsc::UnboundedSender<Entry>,
}

impl ProviderImpl {
    /// Create an empty provider.
    ///
    /// # Errors
    ///
    /// Infallible for the in-memory implementation; the signature matches
    /// providers that open real stores.
    pub async fn new() -> Result<Self> {
        Ok(Self {
            kv: Arc::new(KvStoreImpl::default()),
            watermarks: Arc::new(WatermarkFactory::new()),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Reopen the provider: same stored state, fresh runtime state — what a
    /// process restart looks like to the stores.
    #[must_use]
    pub fn reopen(&self) -> Self {
        Self {
            kv: Arc::clone(&self.kv),
            watermarks: Arc::new(WatermarkFactory::new()),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Provider for ProviderImpl {}

/// A `BTreeMap`-backed ordered key-value store.
#[derive(Default)]
pub struct KvStoreImpl {
    entries: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl KvStore for KvStoreImpl {
    async fn get(&self, partition: &Partition, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().expect("lock poisoned");
        Ok(entries.get(&(partition.as_str().to_string(), key.to_string())).cloned())
    }

    async fn put(&self, partition: &Partition, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        entries.insert((partition.as_str().to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    async fn delete(&self, partition: &Partition, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        entries.remove(&(partition.as_str().to_string(), key.to_string()));
        Ok(())
    }

    async fn batch(&self, partition: &Partition, ops: Vec<WriteOp>) -> Result<()> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    entries.insert((partition.as_str().to_string(), key), value);
                }
                WriteOp::Delete { key } => {
                    entries.remove(&(partition.as_str().to_string(), key));
                }
            }
        }
        Ok(())
    }

    async fn range(
        &self, partition: &Partition, lower: Option<&str>, upper: Option<&str>, reverse: bool,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        // an inverted range is empty, not a panic
        if let (Some(lower), Some(upper)) = (lower, upper) {
            if lower >= upper {
                return Ok(Vec::new());
            }
        }

        let name = partition.as_str().to_string();
        let lower_bound = match lower {
            Some(lower) => Included((name.clone(), lower.to_string())),
            None => Included((name.clone(), String::new())),
        };
        let upper_bound = match upper {
            Some(upper) => Excluded((name.clone(), upper.to_string())),
            // the least key beyond every (name, _) pair
            None => Excluded((format!("{name}\u{0}"), String::new())),
        };

        let entries = self.entries.lock().expect("lock poisoned");
        let mut matches: Vec<(String, Vec<u8>)> = entries
            .range((lower_bound, upper_bound))
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect();
        if reverse {
            matches.reverse();
        }
        Ok(matches)
    }

    async fn clear(&self, partition: &Partition) -> Result<()> {
        let name = partition.as_str();
        let mut entries = self.entries.lock().expect("lock poisoned");
        entries.retain(|(p, _), _| p != name);
        Ok(())
    }
}

impl MessageStore for ProviderImpl {
    async fn put(&self, owner: &str, entry: &Entry) -> Result<()> {
        message::put(owner, entry, &self.watermarks, &*self.kv).await.map_err(Into::into)
    }

    async fn query(&self, owner: &str, query: &Query) -> Result<(Vec<Entry>, Option<Cursor>)> {
        message::query(owner, query, &*self.kv).await.map_err(Into::into)
    }

    async fn get(&self, owner: &str, message_cid: &str) -> Result<Option<Entry>> {
        message::get(owner, message_cid, &*self.kv).await.map_err(Into::into)
    }

    async fn delete(&self, owner: &str, message_cid: &str) -> Result<()> {
        message::delete(owner, message_cid, &*self.kv).await.map_err(Into::into)
    }
}

impl DataStore for ProviderImpl {
    async fn put(
        &self, owner: &str, record_id: &str, _data_cid: &str, data: DataStream,
    ) -> Result<(String, usize)> {
        data::put(owner, record_id, data, &*self.kv).await.map_err(Into::into)
    }

    async fn get(
        &self, owner: &str, record_id: &str, data_cid: &str,
    ) -> Result<Option<DataStream>> {
        data::get(owner, record_id, data_cid, &*self.kv).await.map_err(Into::into)
    }

    async fn delete(&self, owner: &str, record_id: &str, data_cid: &str) -> Result<()> {
        data::delete(owner, record_id, data_cid, &*self.kv).await.map_err(Into::into)
    }
}

impl EventLog for ProviderImpl {
    async fn append(
        &self, owner: &str, message_cid: &str, indexes: &HashMap<String, Value>,
    ) -> Result<String> {
        event_log::append(owner, message_cid, indexes, &self.watermarks, &*self.kv)
            .await
            .map_err(Into::into)
    }

    async fn events(
        &self, owner: &str, cursor: Option<Cursor>,
    ) -> Result<(Vec<dwn_core::event::Event>, Option<Cursor>)> {
        event_log::events(owner, cursor, &*self.kv).await.map_err(Into::into)
    }

    async fn query(
        &self, owner: &str, query: &EventsQuery,
    ) -> Result<(Vec<dwn_core::event::Event>, Option<Cursor>)> {
        event_log::query(owner, query, &*self.kv).await.map_err(Into::into)
    }

    async fn delete(&self, owner: &str, message_cids: &[String]) -> Result<()> {
        event_log::delete(owner, message_cids, &*self.kv).await.map_err(Into::into)
    }
}

impl EventStream for ProviderImpl {
    async fn subscribe(&self, owner: &str, filter: SubscribeFilter) -> Result<Subscriber> {
        let (sender, receiver) = mpsc::unbounded();
        let mut subscribers = self.subscribers.lock().expect("lock poisoned");
        subscribers.push(Subscription {
            owner: owner.to_string(),
            filter,
            sender,
        });
        Ok(Subscriber::new(Box::pin(receiver)))
    }

    async fn emit(&self, owner: &str, event: &Entry) -> Result<()> {
        let mut subscribers = self.subscribers.lock().expect("lock poisoned");
        // closed subscribers are dropped on the way past
        subscribers.retain(|subscription| {
            if subscription.owner != owner || !subscription.filter.is_match(event) {
                return !subscription.sender.is_closed();
            }
            subscription.sender.unbounded_send(event.clone()).is_ok()
        });
        Ok(())
    }
}

impl TaskStore for ProviderImpl {
    async fn register(&self, owner: &str, t: &ResumableTask, timeout_secs: u64) -> Result<()> {
        task::register(owner, t, timeout_secs, &*self.kv).await.map_err(Into::into)
    }

    async fn grab(&self, owner: &str, count: u64) -> Result<Vec<ResumableTask>> {
        task::grab(owner, count, TIMEOUT_SECS, &*self.kv).await.map_err(Into::into)
    }

    async fn read(&self, owner: &str, task_id: &str) -> Result<Option<ResumableTask>> {
        task::read(owner, task_id, &*self.kv).await.map_err(Into::into)
    }

    async fn extend(&self, owner: &str, task_id: &str, timeout_secs: u64) -> Result<()> {
        task::extend(owner, task_id, timeout_secs, &*self.kv).await.map_err(Into::into)
    }

    async fn delete(&self, owner: &str, task_id: &str) -> Result<()> {
        task::delete(owner, task_id, &*self.kv).await.map_err(Into::into)
    }
}

impl DidResolver for ProviderImpl {
    async fn resolve(&self, did: &str) -> Result<Document> {
        Ok(key_store::document(did))
    }
}

impl KeyStore for ProviderImpl {
    fn keyring(&self, controller: &str) -> Result<impl dwn_core::provider::Keyring> {
        Ok(key_store::keyring(controller))
    }
}
