//! # Data store
//!
//! Content-addressed blob storage. Blobs are scoped to
//! `(owner, record_id)` — the same bytes written under two records are two
//! blobs, which is what stops one record referencing data it does not own.

use std::io::{Cursor as IoCursor, Read};

use crate::provider::KvStore;
use crate::store::partition::{Partition, join_key};
use crate::{Result, cid};

/// Maximum size of data carried inline in a message (`encoded_data`).
/// Larger payloads go through the data store.
pub const MAX_ENCODED_SIZE: usize = 30000;

const DATA: &str = "data";

fn data_partition(owner: &str) -> Result<Partition> {
    Partition::root(DATA)?.child(owner)
}

/// An in-memory data stream.
#[derive(Clone, Debug, Default)]
pub struct DataStream {
    buffer: IoCursor<Vec<u8>>,
}

impl DataStream {
    /// The CID and size of the stream's content.
    #[must_use]
    pub fn compute_cid(&self) -> (String, usize) {
        let bytes = self.buffer.get_ref();
        (cid::from_bytes(bytes), bytes.len())
    }

    /// The stream's content.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer.into_inner()
    }

    /// The stream's content, borrowed.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.get_ref()
    }
}

impl From<Vec<u8>> for DataStream {
    fn from(data: Vec<u8>) -> Self {
        Self {
            buffer: IoCursor::new(data),
        }
    }
}

impl Read for DataStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.buffer.read(buf)
    }
}

/// Store a blob for `(owner, record_id)`, returning the computed CID and
/// byte count. Callers compare the result against the descriptor's claimed
/// `data_cid`/`data_size`.
///
/// # Errors
///
/// Returns an error when the underlying store fails.
pub async fn put(
    owner: &str, record_id: &str, data: DataStream, kv: &impl KvStore,
) -> Result<(String, usize)> {
    let (data_cid, data_size) = data.compute_cid();

    let partition = data_partition(owner)?;
    let key = join_key(&[record_id, &data_cid])?;
    kv.put(&partition, &key, data.as_bytes()).await?;

    Ok((data_cid, data_size))
}

/// Fetch the blob stored for `(owner, record_id, data_cid)`.
///
/// # Errors
///
/// Returns an error when the underlying store fails.
pub async fn get(
    owner: &str, record_id: &str, data_cid: &str, kv: &impl KvStore,
) -> Result<Option<DataStream>> {
    let partition = data_partition(owner)?;
    let key = join_key(&[record_id, data_cid])?;
    let Some(bytes) = kv.get(&partition, &key).await? else {
        return Ok(None);
    };
    Ok(Some(DataStream::from(bytes)))
}

/// Delete the blob stored for `(owner, record_id, data_cid)`.
///
/// # Errors
///
/// Returns an error when the underlying store fails.
pub async fn delete(
    owner: &str, record_id: &str, data_cid: &str, kv: &impl KvStore,
) -> Result<()> {
    let partition = data_partition(owner)?;
    let key = join_key(&[record_id, data_cid])?;
    kv.delete(&partition, &key).await.map_err(Into::into)
}
