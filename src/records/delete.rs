//! # Records Delete
//!
//! The records delete endpoint handles `RecordsDelete` messages — requests
//! to tombstone a record. The record is not erased: a tombstone entry is
//! written and the record's non-initial versions (and, when pruning, its
//! descendants) are removed, leaving the initial write and the tombstone.
//!
//! Deletion runs as a resumable task so a crash mid-prune is picked up and
//! completed when the node next opens.

use std::collections::HashMap;

use async_recursion::async_recursion;
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::grants::{DelegatedGrant, fetch_grant};
use crate::provider::{DataStore, EventLog, EventStream, MessageStore, Provider, Signer};
use crate::records::write::{existing_entries, initial_write};
use crate::records::{RecordsFilter, Write, protocol};
use crate::store::{Entry, RecordsQueryBuilder};
use crate::tasks::{self, Task, TaskType};
use crate::{Descriptor, Error, Interface, Method, Result, cid, forbidden, unexpected};

/// Handle — or process — a [`Delete`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when the delete loses the version ordering race against an existing
/// version.
pub async fn handle(
    owner: &str, delete: Delete, provider: &impl Provider,
) -> Result<Reply<DeleteReply>> {
    let accepted = Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: None,
    };

    let existing = existing_entries(owner, &delete.descriptor.record_id, provider).await?;

    // deleting an absent record succeeds without effect
    if existing.is_empty() {
        return Ok(accepted);
    }

    let mut latest = &existing[0];
    for entry in &existing {
        let current = (entry.descriptor().message_timestamp, entry.cid()?);
        if current > (latest.descriptor().message_timestamp, latest.cid()?) {
            latest = entry;
        }
    }

    if let Some(existing_delete) = latest.as_delete() {
        // resubmitting the stored tombstone changes nothing
        if existing_delete.cid()? == delete.cid()? {
            return Ok(accepted);
        }
        // the only delete of a delete is a prune upgrade
        if !delete.descriptor.prune {
            return Err(Error::NotFound("cannot delete a `RecordsDelete` record".to_string()));
        }
        if existing_delete.descriptor.prune {
            return Err(Error::NotFound(
                "attempting to prune an already pruned record".to_string(),
            ));
        }
    }

    let Some(initial) = initial_write(&existing)? else {
        return Err(unexpected!("initial write not found for record"));
    };
    delete.authorize(owner, &initial, provider).await?;

    // a delete racing a concurrent write must land strictly later
    if delete.descriptor.base.message_timestamp <= latest.descriptor().message_timestamp {
        return Err(Error::Conflict("newer record version exists".to_string()));
    }

    tasks::run(owner, TaskType::RecordsDelete(delete), provider).await?;

    Ok(accepted)
}

/// The [`Delete`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delete {
    /// Delete descriptor.
    pub descriptor: DeleteDescriptor,

    /// Message authorization.
    pub authorization: Authorization,
}

impl Message for Delete {
    type Reply = DeleteReply;

    fn cid(&self) -> Result<String> {
        cid::from_value(self)
    }

    fn descriptor(&self) -> &Descriptor {
        &self.descriptor.base
    }

    fn authorization(&self) -> Option<&Authorization> {
        Some(&self.authorization)
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

/// [`DeleteReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeleteReply;

/// The [`Delete`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The id of the record to delete.
    pub record_id: String,

    /// Whether descendant records are pruned as well.
    pub prune: bool,
}

impl Task for Delete {
    async fn run(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        delete(owner, self, provider).await
    }
}

impl Delete {
    /// Build flattened indexes for the delete message.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> HashMap<String, serde_json::Value> {
        use chrono::SecondsFormat::Micros;

        let mut indexes = HashMap::new();
        indexes.insert("interface".to_string(), Interface::Records.to_string().into());
        indexes.insert("method".to_string(), Method::Delete.to_string().into());
        indexes.insert("recordId".to_string(), self.descriptor.record_id.clone().into());
        indexes.insert(
            "messageTimestamp".to_string(),
            self.descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true).into(),
        );
        indexes
            .insert("author".to_string(), self.authorization.author().unwrap_or_default().into());
        indexes.insert("archived".to_string(), "false".into());
        indexes
    }

    // Authorize the delete against the record's initial write.
    async fn authorize(
        &self, owner: &str, write: &Write, provider: &impl Provider,
    ) -> Result<()> {
        let authzn = &self.authorization;
        let author = authzn.author()?;

        // a delegate must present a grant covering this delete
        if let Some(delegated_grant) = &authzn.author_delegated_grant {
            let grant = delegated_grant.grant();
            grant.verify_delegation(&author, &authzn.signer()?)?;

            let scope = &grant.descriptor.scope;
            if scope.interface != Interface::Records || scope.method != Method::Delete {
                return Err(forbidden!("delegated grant scope does not permit Records/Delete"));
            }
            grant.permit_delete(write.descriptor.protocol.as_deref())?;
            grant
                .verify_active(owner, &self.descriptor.base.message_timestamp, provider)
                .await?;
        }

        if author == owner {
            return Ok(());
        }

        if write.descriptor.protocol.is_some() {
            return protocol::permit_delete(owner, self, write, provider).await;
        }

        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = fetch_grant(owner, grant_id, provider).await?;
            grant.verify(owner, &authzn.signer()?, &self.descriptor.base, provider).await?;
            return grant.permit_delete(write.descriptor.protocol.as_deref());
        }

        Err(forbidden!("delete request failed authorization"))
    }
}

// Execute the delete: store the tombstone, prune descendants when asked,
// and remove superseded versions. Idempotent — a resumed task re-runs from
// the start.
async fn delete(owner: &str, delete: &Delete, provider: &impl Provider) -> Result<()> {
    let existing = existing_entries(owner, &delete.descriptor.record_id, provider).await?;
    if existing.is_empty() {
        return Ok(());
    }

    let Some(initial) = initial_write(&existing)? else {
        return Err(unexpected!("initial write not found for record"));
    };

    // the tombstone stays findable under the record's filterable fields,
    // but tag index entries do not survive it
    let mut indexes = initial.build_indexes();
    indexes.retain(|name, _| !name.starts_with("tag."));
    indexes.extend(delete.build_indexes());
    let entry = Entry {
        message: crate::store::EntryType::Delete(delete.clone()),
        indexes,
    };

    let message_cid = entry.cid()?;
    MessageStore::put(provider, owner, &entry).await?;
    EventLog::append(provider, owner, &message_cid, &entry.indexes).await?;
    EventStream::emit(provider, owner, &entry).await?;

    if delete.descriptor.prune {
        delete_children(owner, &delete.descriptor.record_id, provider).await?;
    }

    // remove everything but the initial write and the tombstone
    for superseded in &existing {
        let superseded_cid = superseded.cid()?;
        if superseded_cid == message_cid {
            continue;
        }
        let Some(write) = superseded.as_write() else {
            // an earlier (non-prune) tombstone is superseded outright
            MessageStore::delete(provider, owner, &superseded_cid).await?;
            EventLog::delete(provider, owner, &[superseded_cid]).await?;
            continue;
        };

        DataStore::delete(provider, owner, &write.record_id, &write.descriptor.data_cid).await?;

        if write.is_initial()? {
            let mut archived = Entry::from(write);
            archived.add_index("archived", "true");
            MessageStore::put(provider, owner, &archived).await?;
        } else {
            MessageStore::delete(provider, owner, &superseded_cid).await?;
            EventLog::delete(provider, owner, &[superseded_cid]).await?;
        }
    }

    Ok(())
}

// Purge a record's descendant records: their messages, events, and data.
#[async_recursion(?Send)]
async fn delete_children(owner: &str, record_id: &str, provider: &impl Provider) -> Result<()> {
    let query = RecordsQueryBuilder::new()
        .method(None)
        .include_archived(true)
        .add_filter(RecordsFilter::new().parent_id(record_id))
        .build();
    let (children, _) = MessageStore::query(provider, owner, &query).await?;

    // a record can have many children; purge each child record whole
    let mut by_record: HashMap<String, Vec<Entry>> = HashMap::new();
    for entry in children {
        let child_id = match &entry.message {
            crate::store::EntryType::Write(write) => write.record_id.clone(),
            crate::store::EntryType::Delete(child_delete) => {
                child_delete.descriptor.record_id.clone()
            }
            _ => return Err(unexpected!("unexpected message type below record")),
        };
        by_record.entry(child_id).or_default().push(entry);
    }

    for (child_id, entries) in by_record {
        delete_children(owner, &child_id, provider).await?;
        purge(owner, &child_id, &entries, provider).await?;
    }

    Ok(())
}

// Hard-delete a record's entries and data.
async fn purge(
    owner: &str, record_id: &str, entries: &[Entry], provider: &impl Provider,
) -> Result<()> {
    for entry in entries {
        if let Some(write) = entry.as_write() {
            DataStore::delete(provider, owner, record_id, &write.descriptor.data_cid).await?;
        }
        let entry_cid = entry.cid()?;
        MessageStore::delete(provider, owner, &entry_cid).await?;
        EventLog::delete(provider, owner, &[entry_cid]).await?;
    }
    Ok(())
}

/// Builder for [`Delete`] messages.
#[derive(Clone, Debug, Default)]
pub struct DeleteBuilder {
    record_id: Option<String>,
    prune: bool,
    message_timestamp: Option<DateTime<Utc>>,
    protocol_role: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
    permission_grant_id: Option<String>,
}

impl DeleteBuilder {
    /// Returns a new [`DeleteBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Specify the record to delete.
    #[must_use]
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Prune descendant records as well.
    #[must_use]
    pub const fn prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    /// Override the message timestamp.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// Specify a protocol role to invoke.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// The delegated grant invoked to sign on behalf of the logical author.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// Specify a permission grant to invoke.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Sign and build the delete message.
    ///
    /// # Errors
    ///
    /// Returns an error when no record id is set or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Delete> {
        let record_id = self.record_id.ok_or_else(|| unexpected!("record id not set"))?;

        let descriptor = DeleteDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Delete,
                message_timestamp: self.message_timestamp.unwrap_or_else(Utc::now),
            },
            record_id,
            prune: self.prune,
        };

        let mut builder =
            AuthorizationBuilder::new().descriptor_cid(cid::from_value(&descriptor)?);
        if let Some(protocol_role) = self.protocol_role {
            builder = builder.protocol_role(protocol_role);
        }
        if let Some(delegated_grant) = self.delegated_grant {
            builder = builder.delegated_grant(delegated_grant);
        }
        if let Some(permission_grant_id) = self.permission_grant_id {
            builder = builder.permission_grant_id(permission_grant_id);
        }
        let authorization = builder.build(signer).await?;

        Ok(Delete {
            descriptor,
            authorization,
        })
    }
}
