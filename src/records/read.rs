//! # Records Read
//!
//! The records read endpoint handles `RecordsRead` messages — requests for
//! a single record's current version and data. A tombstoned record reads as
//! not found.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::grants::fetch_grant;
use crate::provider::{DataStore, MessageStore, Provider, Signer};
use crate::records::write::initial_entry;
use crate::records::{DataStream, Delete, RecordsFilter, Write, protocol};
use crate::store::{RecordsQuery, Sort};
use crate::{Descriptor, Error, Interface, Method, Result, cid, forbidden, unexpected};

/// Handle — or process — a [`Read`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails, no
/// record matches, or the record has been deleted (404).
pub async fn handle(owner: &str, read: Read, provider: &impl Provider) -> Result<Reply<ReadReply>> {
    let filter = read.descriptor.filter.normalize()?;

    // the record's current entry: latest write or tombstone
    let store_query = RecordsQuery {
        filters: vec![filter],
        method: None,
        include_archived: false,
        sort: Sort::TimestampAsc,
        pagination: None,
    };
    let (entries, _) = MessageStore::query(provider, owner, &store_query.into()).await?;
    if entries.is_empty() {
        return Err(Error::NotFound("no matching record found".to_string()));
    }
    if entries.len() > 1 {
        return Err(unexpected!("multiple records match the read filter"));
    }

    if let Ok(delete) = Delete::try_from(&entries[0]) {
        // authorize against the record's anchor before disclosing deletion
        let Some(initial) = initial_entry(owner, &delete.descriptor.record_id, provider).await?
        else {
            return Err(unexpected!("initial write for deleted record not found"));
        };
        read.authorize(owner, &initial, provider).await?;
        return Err(Error::NotFound("record is deleted".to_string()));
    }

    let mut write = Write::try_from(&entries[0])?;
    read.authorize(owner, &write, provider).await?;

    let data = if let Some(encoded) = &write.encoded_data {
        Some(DataStream::from(Base64UrlUnpadded::decode_vec(encoded)?))
    } else {
        DataStore::get(provider, owner, &write.record_id, &write.descriptor.data_cid).await?
    };
    write.encoded_data = None;

    // attach the initial write when the current version is not it
    let initial_write = if write.is_initial()? {
        None
    } else {
        let mut initial = initial_entry(owner, &write.record_id, provider)
            .await?
            .ok_or_else(|| unexpected!("initial write not found"))?;
        initial.encoded_data = None;
        Some(initial)
    };

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(ReadReply {
            entry: ReadReplyEntry {
                records_write: Some(write),
                records_delete: None,
                initial_write,
                data,
            },
        }),
    })
}

/// The [`Read`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Read {
    /// Read descriptor.
    pub descriptor: ReadDescriptor,

    /// Message authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

impl Message for Read {
    type Reply = ReadReply;

    fn cid(&self) -> Result<String> {
        cid::from_value(self)
    }

    fn descriptor(&self) -> &Descriptor {
        &self.descriptor.base
    }

    fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

impl Read {
    // Verify the fetched record may be returned to the requestor.
    async fn authorize(&self, owner: &str, write: &Write, provider: &impl Provider) -> Result<()> {
        // published records read without authorization
        if write.descriptor.published.unwrap_or_default() {
            return Ok(());
        }

        let Some(authzn) = &self.authorization else {
            return Err(forbidden!("read of unpublished record requires authorization"));
        };
        let author = authzn.author()?;

        if author == owner {
            return Ok(());
        }
        // record authors and recipients always read their own records
        if write.authorization.author()? == author
            || write.descriptor.recipient.as_deref() == Some(&author)
        {
            return Ok(());
        }

        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = fetch_grant(owner, grant_id, provider).await?;
            grant.verify(owner, &authzn.signer()?, &self.descriptor.base, provider).await?;
            return grant.permit_read(write.descriptor.protocol.as_deref());
        }

        if write.descriptor.protocol.is_some() {
            let protocol_role = authzn.payload()?.protocol_role;
            return protocol::permit_read(owner, &author, protocol_role.as_deref(), write, provider)
                .await;
        }

        Err(forbidden!("read request failed authorization"))
    }
}

/// [`ReadReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReply {
    /// The read reply entry.
    pub entry: ReadReplyEntry,
}

/// The record returned by a read.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReplyEntry {
    /// The record's current version, when the record exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_write: Option<Write>,

    /// The record's tombstone, when the record is deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_delete: Option<Delete>,

    /// The record's initial write, when the current version is a
    /// subsequent write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_write: Option<Write>,

    /// The record's data.
    #[serde(skip)]
    pub data: Option<DataStream>,
}

/// The [`Read`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The filter identifying the record to read.
    pub filter: RecordsFilter,
}

/// Builder for [`Read`] messages.
#[derive(Clone, Debug, Default)]
pub struct ReadBuilder {
    filter: Option<RecordsFilter>,
    protocol_role: Option<String>,
    permission_grant_id: Option<String>,
}

impl ReadBuilder {
    /// Returns a new [`ReadBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Specify the filter identifying the record to read.
    #[must_use]
    pub fn filter(mut self, filter: RecordsFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Specify a protocol role to invoke.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// Specify a permission grant to invoke.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Build the read without signing (published records only).
    #[must_use]
    pub fn build_anonymous(self) -> Read {
        Read {
            descriptor: self.descriptor(),
            authorization: None,
        }
    }

    /// Sign and build the read.
    ///
    /// # Errors
    ///
    /// Returns an error when signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Read> {
        let protocol_role = self.protocol_role.clone();
        let permission_grant_id = self.permission_grant_id.clone();
        let descriptor = self.descriptor();

        let mut builder =
            AuthorizationBuilder::new().descriptor_cid(cid::from_value(&descriptor)?);
        if let Some(protocol_role) = protocol_role {
            builder = builder.protocol_role(protocol_role);
        }
        if let Some(permission_grant_id) = permission_grant_id {
            builder = builder.permission_grant_id(permission_grant_id);
        }
        let authorization = builder.build(signer).await?;

        Ok(Read {
            descriptor,
            authorization: Some(authorization),
        })
    }

    fn descriptor(self) -> ReadDescriptor {
        ReadDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Read,
                message_timestamp: Utc::now(),
            },
            filter: self.filter.unwrap_or_default(),
        }
    }
}
