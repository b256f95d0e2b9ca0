//! # Records Write
//!
//! The records write endpoint handles `RecordsWrite` messages. A record is
//! the set of writes sharing a `record_id`: exactly one initial write whose
//! immutable fields anchor all updates, plus at most one current subsequent
//! write. Versions are totally ordered by `(messageTimestamp, messageCid)`;
//! the larger pair wins and the loser is rejected with a conflict.

use std::collections::HashMap;

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, SecondsFormat::Micros, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::grants::{DelegatedGrant, fetch_grant};
use crate::jws::Jws;
use crate::provider::{
    DataStore, EventLog, EventStream, MessageStore, Provider, Signer,
};
use crate::records::{DataStream, RecordsFilter, protocol};
use crate::store::data::MAX_ENCODED_SIZE;
use crate::store::partition::check_segment;
use crate::store::{Entry, EntryType, RecordsQueryBuilder};
use crate::{
    Descriptor, Error, Interface, Method, Result, bad_request, cid, forbidden, unexpected, utils,
};

/// Handle — or process — a [`Write`] message.
///
/// # Errors
///
/// The endpoint will return an error when the message fails integrity
/// checks (400), authorization (401), or loses the version ordering race
/// against an existing version (409).
pub async fn handle(
    owner: &str, mut write: Write, provider: &impl Provider,
) -> Result<Reply<WriteReply>> {
    write.validate()?;

    // the record's full version history, superseded initial write included
    let existing = existing_entries(owner, &write.record_id, provider).await?;
    let initial = initial_write(&existing)?;

    if let Some(initial) = &initial {
        write.verify_immutable(initial)?;

        // a subsequent write's author must be the initial write's author
        if write.authorization.author()? != initial.authorization.author()? {
            return Err(forbidden!(
                "AuthorMismatch: subsequent write author does not match initial write author"
            ));
        }
    } else if !write.is_initial()? {
        return Err(unexpected!("initial write not found for record"));
    } else if write.descriptor.date_created != write.descriptor.base.message_timestamp {
        return Err(unexpected!(
            "`dateCreated` and `messageTimestamp` must match for an initial write"
        ));
    }

    write.authorize(owner, provider).await?;

    // protocol-bound records must conform to the configured protocol
    if write.descriptor.protocol.is_some() {
        protocol::verify_integrity(owner, &write, provider).await?;
    }

    // version ordering: the incoming pair must beat every existing version
    let incoming = (write.descriptor.base.message_timestamp, write.cid()?);
    let mut latest: Option<(&Entry, (DateTime<Utc>, String))> = None;
    for entry in &existing {
        let current = (entry.descriptor().message_timestamp, entry.cid()?);
        if current >= incoming {
            return Err(Error::Conflict("a more recent update exists".to_string()));
        }
        if latest.as_ref().is_none_or(|(_, pair)| *pair < current) {
            latest = Some((entry, current));
        }
    }
    let latest = latest.map(|(entry, _)| entry);

    // a tombstoned record accepts no further writes
    if latest.is_some_and(|entry| entry.descriptor().method == Method::Delete) {
        return Err(Error::Conflict("record has been deleted".to_string()));
    }

    write.process_data(owner, latest, provider).await?;

    let entry = Entry::from(&write);
    let message_cid = entry.cid()?;
    MessageStore::put(provider, owner, &entry).await?;
    EventLog::append(provider, owner, &message_cid, &entry.indexes).await?;
    EventStream::emit(provider, owner, &entry).await?;

    // supersede prior versions: non-initial writes are removed outright,
    // the initial write is retained in archived form
    for superseded in &existing {
        let superseded_cid = superseded.cid()?;
        let Some(superseded_write) = superseded.as_write() else {
            continue;
        };

        if superseded_write.descriptor.data_cid != write.descriptor.data_cid {
            DataStore::delete(
                provider,
                owner,
                &write.record_id,
                &superseded_write.descriptor.data_cid,
            )
            .await?;
        }

        if superseded_write.is_initial()? {
            let mut archived = Entry::from(superseded_write);
            archived.add_index("archived", "true");
            MessageStore::put(provider, owner, &archived).await?;
        } else {
            MessageStore::delete(provider, owner, &superseded_cid).await?;
            EventLog::delete(provider, owner, &[superseded_cid]).await?;
        }
    }

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: None,
    })
}

/// The [`Write`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Write {
    /// The record id, stable across all of the record's versions.
    pub record_id: String,

    /// The record's position in its protocol hierarchy, when protocol-bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// Write descriptor.
    pub descriptor: WriteDescriptor,

    /// Message authorization.
    pub authorization: Authorization,

    /// Additional signature(s) over the descriptor CID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<Jws>,

    /// Encryption metadata for the record's data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionProperty>,

    /// Record data small enough to carry inline, base64url-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_data: Option<String>,

    /// The data stream accompanying the message. Not part of the signed
    /// message.
    #[serde(skip)]
    pub data_stream: Option<DataStream>,
}

/// The [`Write`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WriteDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The DID the record is addressed to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,

    /// The protocol the record is bound to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// The record's protocol path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_path: Option<String>,

    /// The record's schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// The record id of the record's parent, when protocol-bound below the
    /// root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// The record's tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Map<String, Value>>,

    /// CID of the record's data.
    pub data_cid: String,

    /// Size of the record's data in bytes.
    pub data_size: usize,

    /// Timestamp of the record's initial write.
    #[serde(with = "crate::utils::rfc3339_micros")]
    pub date_created: DateTime<Utc>,

    /// Whether the record is published (readable without authorization).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,

    /// Timestamp the record was published.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "crate::utils::rfc3339_micros_opt", default)]
    pub date_published: Option<DateTime<Utc>>,

    /// The MIME type of the record's data.
    pub data_format: String,
}

/// Encryption metadata for a record's data. Key derivation itself is
/// outside the node; the metadata travels with the record.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionProperty {
    /// The encryption algorithm.
    pub algorithm: String,

    /// The initialization vector, base64url-encoded.
    pub initialization_vector: String,

    /// References to the wrapped content-encryption keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_encryption: Option<Vec<Value>>,
}

impl Message for Write {
    type Reply = WriteReply;

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

/// [`WriteReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct WriteReply;

/// Compute a write's deterministic entry id: the CID of its descriptor
/// extended with the logical author.
///
/// # Errors
///
/// Returns an error when the descriptor cannot be serialized.
pub fn entry_id(descriptor: &WriteDescriptor, author: &str) -> Result<String> {
    #[derive(Serialize)]
    struct EntryId<'a> {
        #[serde(flatten)]
        descriptor: &'a WriteDescriptor,
        author: &'a str,
    }
    cid::from_value(&EntryId { descriptor, author })
}

impl Write {
    /// Whether this message is the record's initial write.
    ///
    /// # Errors
    ///
    /// Returns an error when the entry id cannot be computed.
    pub fn is_initial(&self) -> Result<bool> {
        let author = self.authorization.author()?;
        Ok(self.record_id == entry_id(&self.descriptor, &author)?)
    }

    /// Build flattened indexes for the write message.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> HashMap<String, Value> {
        let descriptor = &self.descriptor;
        let mut indexes = HashMap::new();

        indexes.insert("interface".to_string(), Interface::Records.to_string().into());
        indexes.insert("method".to_string(), Method::Write.to_string().into());
        indexes.insert("recordId".to_string(), self.record_id.clone().into());
        indexes.insert(
            "messageTimestamp".to_string(),
            descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true).into(),
        );
        indexes.insert(
            "dateCreated".to_string(),
            descriptor.date_created.to_rfc3339_opts(Micros, true).into(),
        );
        indexes.insert("dataCid".to_string(), descriptor.data_cid.clone().into());
        indexes.insert("dataSize".to_string(), descriptor.data_size.into());
        indexes.insert("dataFormat".to_string(), descriptor.data_format.clone().into());
        indexes
            .insert("author".to_string(), self.authorization.author().unwrap_or_default().into());
        indexes.insert(
            "published".to_string(),
            descriptor.published.unwrap_or_default().to_string().into(),
        );
        indexes.insert("archived".to_string(), "false".into());

        if let Some(recipient) = &descriptor.recipient {
            indexes.insert("recipient".to_string(), recipient.clone().into());
        }
        if let Some(context_id) = &self.context_id {
            indexes.insert("contextId".to_string(), context_id.clone().into());
        }
        if let Some(protocol) = &descriptor.protocol {
            indexes.insert("protocol".to_string(), protocol.clone().into());
        }
        if let Some(protocol_path) = &descriptor.protocol_path {
            indexes.insert("protocolPath".to_string(), protocol_path.clone().into());
        }
        if let Some(schema) = &descriptor.schema {
            indexes.insert("schema".to_string(), schema.clone().into());
        }
        if let Some(parent_id) = &descriptor.parent_id {
            indexes.insert("parentId".to_string(), parent_id.clone().into());
        }
        if let Some(date_published) = &descriptor.date_published {
            indexes.insert(
                "datePublished".to_string(),
                date_published.to_rfc3339_opts(Micros, true).into(),
            );
        }
        if let Some(attestation) = &self.attestation {
            indexes.insert("attester".to_string(), attestation.did().unwrap_or_default().into());
        }
        if let Some(tags) = &descriptor.tags {
            for (name, value) in tags {
                indexes.insert(format!("tag.{name}"), value.clone());
            }
        }

        indexes
    }

    // Structural integrity checks that need no store access.
    fn validate(&self) -> Result<()> {
        if self.record_id.is_empty() {
            return Err(unexpected!("record id is missing"));
        }

        // URLs must arrive normalized so equal URLs compare equal
        if let Some(protocol) = &self.descriptor.protocol {
            if protocol != &utils::clean_url(protocol)? {
                return Err(bad_request!(
                    "UrlProtocolNotNormalized: protocol {protocol} is not normalized"
                ));
            }
        }
        if let Some(schema) = &self.descriptor.schema {
            if schema != &utils::clean_url(schema)? {
                return Err(bad_request!(
                    "UrlProtocolNotNormalized: schema {schema} is not normalized"
                ));
            }
        }

        // the signature payload must reference this exact descriptor
        let payload = self.authorization.payload()?;
        if payload.descriptor_cid != cid::from_value(&self.descriptor)? {
            return Err(unexpected!("descriptor CID does not match signature payload"));
        }
        if payload.record_id.as_ref() != Some(&self.record_id) {
            return Err(unexpected!("record id does not match signature payload"));
        }
        if payload.context_id != self.context_id {
            return Err(unexpected!("context id does not match signature payload"));
        }

        // tag names and string values must stay clear of the reserved
        // delimiter used by the index encoding
        if let Some(tags) = &self.descriptor.tags {
            for (name, value) in tags {
                check_segment(name)?;
                let values = match value {
                    Value::Array(elements) => elements.iter().collect::<Vec<&Value>>(),
                    other => vec![other],
                };
                for element in values {
                    if let Some(s) = element.as_str() {
                        check_segment(s)?;
                    }
                }
            }
        }

        Ok(())
    }

    // Immutable fields must not change across versions.
    fn verify_immutable(&self, initial: &Self) -> Result<()> {
        let descriptor = &self.descriptor;
        let anchor = &initial.descriptor;

        if descriptor.date_created != anchor.date_created
            || descriptor.schema != anchor.schema
            || descriptor.protocol != anchor.protocol
            || descriptor.protocol_path != anchor.protocol_path
            || descriptor.parent_id != anchor.parent_id
            || descriptor.data_format != anchor.data_format
            || descriptor.recipient != anchor.recipient
            || self.context_id != initial.context_id
        {
            return Err(unexpected!("immutable properties do not match initial write"));
        }

        Ok(())
    }

    // Authorize the write for the message's signer.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let authzn = &self.authorization;
        let author = authzn.author()?;

        // an owner signature imports a record authored elsewhere
        if let Some(signed_owner) = authzn.owner()? {
            if signed_owner != owner {
                return Err(forbidden!("owner signature is not the tenant's"));
            }
            return Ok(());
        }

        // a delegate must present a grant covering this write
        if let Some(delegated_grant) = &authzn.author_delegated_grant {
            let grant = delegated_grant.grant();
            grant.verify_delegation(&author, &authzn.signer()?)?;

            let scope = &grant.descriptor.scope;
            if scope.interface != Interface::Records || scope.method != Method::Write {
                return Err(forbidden!("delegated grant scope does not permit Records/Write"));
            }
            grant.permit_write(self.descriptor.protocol.as_deref())?;
            grant
                .verify_active(owner, &self.descriptor.base.message_timestamp, provider)
                .await?;
        }

        if author == owner {
            return Ok(());
        }

        if self.descriptor.protocol.is_some() {
            // structural and action rules decide
            return protocol::permit_write(owner, self, provider).await;
        }

        // a non-protocol write by a non-owner requires a permission grant
        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = fetch_grant(owner, grant_id, provider).await?;
            grant.verify(owner, &authzn.signer()?, &self.descriptor.base, provider).await?;
            return grant.permit_write(self.descriptor.protocol.as_deref());
        }

        Err(forbidden!("write request failed authorization"))
    }

    // Attach, verify, or locate the record data.
    async fn process_data(
        &mut self, owner: &str, latest: Option<&Entry>, provider: &impl Provider,
    ) -> Result<()> {
        if let Some(encoded) = &self.encoded_data {
            // inline data: the descriptor must describe these exact bytes
            let bytes = Base64UrlUnpadded::decode_vec(encoded)?;
            let stream = DataStream::from(bytes);
            let (data_cid, data_size) = stream.compute_cid();
            if data_cid != self.descriptor.data_cid {
                return Err(unexpected!("actual data CID does not match message `data_cid`"));
            }
            if data_size != self.descriptor.data_size {
                return Err(unexpected!("actual data size does not match message `data_size`"));
            }
            return Ok(());
        }

        if let Some(stream) = self.data_stream.take() {
            if stream.as_bytes().len() <= MAX_ENCODED_SIZE {
                // small enough to travel inline with the message
                let (data_cid, data_size) = stream.compute_cid();
                if data_cid != self.descriptor.data_cid {
                    return Err(unexpected!("actual data CID does not match message `data_cid`"));
                }
                if data_size != self.descriptor.data_size {
                    return Err(unexpected!(
                        "actual data size does not match message `data_size`"
                    ));
                }
                self.encoded_data = Some(Base64UrlUnpadded::encode_string(stream.as_bytes()));
                return Ok(());
            }

            let (data_cid, data_size) =
                DataStore::put(provider, owner, &self.record_id, &self.descriptor.data_cid, stream)
                    .await?;
            if data_cid != self.descriptor.data_cid {
                DataStore::delete(provider, owner, &self.record_id, &data_cid).await?;
                return Err(unexpected!("actual data CID does not match message `data_cid`"));
            }
            if data_size != self.descriptor.data_size {
                DataStore::delete(provider, owner, &self.record_id, &data_cid).await?;
                return Err(unexpected!("actual data size does not match message `data_size`"));
            }
            return Ok(());
        }

        // no data supplied: the referenced data must already belong to this
        // record — referencing another record's (or tenant's) blob is how
        // data exfiltration would otherwise happen
        let Some(latest_write) = latest.and_then(Entry::as_write) else {
            return Err(unexpected!(
                "RecordsWriteMissingDataStream: data stream not provided and no existing data \
                 found for record"
            ));
        };
        if latest_write.descriptor.data_cid != self.descriptor.data_cid {
            return Err(unexpected!(
                "RecordsWriteMissingDataStream: data stream not provided and `data_cid` is not \
                 associated with this record"
            ));
        }
        if latest_write.descriptor.data_size != self.descriptor.data_size {
            return Err(unexpected!("data size does not match existing data"));
        }

        if let Some(encoded) = &latest_write.encoded_data {
            self.encoded_data = Some(encoded.clone());
            return Ok(());
        }

        let stored =
            DataStore::get(provider, owner, &self.record_id, &self.descriptor.data_cid).await?;
        if stored.is_none() {
            return Err(unexpected!(
                "RecordsWriteMissingData: data not found for existing record reference"
            ));
        }

        Ok(())
    }
}

/// Fetch every stored version of a record, archived initial write included,
/// ordered oldest to newest.
pub(crate) async fn existing_entries(
    owner: &str, record_id: &str, store: &impl MessageStore,
) -> Result<Vec<Entry>> {
    let query = RecordsQueryBuilder::new()
        .method(None)
        .include_archived(true)
        .add_filter(RecordsFilter::new().record_id(record_id))
        .build();
    let (entries, _) = store.query(owner, &query).await?;
    Ok(entries)
}

/// Find the initial write among a record's stored versions.
pub(crate) fn initial_write(entries: &[Entry]) -> Result<Option<Write>> {
    for entry in entries {
        if let EntryType::Write(write) = &entry.message {
            if write.is_initial()? {
                return Ok(Some(write.clone()));
            }
        }
    }
    Ok(None)
}

/// Fetch a record's initial write.
pub(crate) async fn initial_entry(
    owner: &str, record_id: &str, store: &impl MessageStore,
) -> Result<Option<Write>> {
    let entries = existing_entries(owner, record_id, store).await?;
    initial_write(&entries)
}

/// Data for a write: a stream to attach, or a reference to data the record
/// already carries.
#[derive(Clone, Debug)]
pub enum Data {
    /// Attach the stream's bytes as the record data.
    Stream(DataStream),

    /// Reference data already stored for the record.
    Cid {
        /// CID of the existing data.
        data_cid: String,

        /// Size of the existing data in bytes.
        data_size: usize,
    },
}

impl From<Vec<u8>> for Data {
    fn from(data: Vec<u8>) -> Self {
        Self::Stream(DataStream::from(data))
    }
}

impl Default for Data {
    fn default() -> Self {
        Self::Stream(DataStream::default())
    }
}

/// The protocol binding of a new record.
#[derive(Clone, Debug, Default)]
pub struct WriteProtocol {
    /// The protocol URI.
    pub protocol: String,

    /// The record's protocol path.
    pub protocol_path: String,
}

/// Builder for [`Write`] messages.
#[derive(Clone, Debug, Default)]
pub struct WriteBuilder {
    existing: Option<Write>,
    recipient: Option<String>,
    protocol: Option<WriteProtocol>,
    parent_context_id: Option<String>,
    schema: Option<String>,
    tags: Option<Map<String, Value>>,
    data: Option<Data>,
    data_format: Option<String>,
    published: Option<bool>,
    date_published: Option<DateTime<Utc>>,
    message_timestamp: Option<DateTime<Utc>>,
    delegated_grant: Option<DelegatedGrant>,
    permission_grant_id: Option<String>,
    protocol_role: Option<String>,
}

impl WriteBuilder {
    /// Returns a new [`WriteBuilder`] for a record's initial write.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a [`WriteBuilder`] producing a subsequent version of an
    /// existing record. Immutable fields are carried over.
    #[must_use]
    pub fn from(existing: Write) -> Self {
        Self {
            existing: Some(existing),
            ..Self::default()
        }
    }

    /// Specify the DID the record is addressed to.
    #[must_use]
    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Bind the record to a protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: WriteProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Place the record below a parent: the parent's context id.
    #[must_use]
    pub fn parent_context_id(mut self, parent_context_id: impl Into<String>) -> Self {
        self.parent_context_id = Some(parent_context_id.into());
        self
    }

    /// Specify the record's schema.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Add a tag to the record.
    #[must_use]
    pub fn add_tag(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.get_or_insert_with(Map::new).insert(name.into(), value.into());
        self
    }

    /// Specify the record data.
    #[must_use]
    pub fn data(mut self, data: Data) -> Self {
        self.data = Some(data);
        self
    }

    /// Specify the data's MIME type. Defaults to `application/json`.
    #[must_use]
    pub fn data_format(mut self, data_format: impl Into<String>) -> Self {
        self.data_format = Some(data_format.into());
        self
    }

    /// Publish (or unpublish) the record.
    #[must_use]
    pub const fn published(mut self, published: bool) -> Self {
        self.published = Some(published);
        self
    }

    /// Override the publication timestamp.
    #[must_use]
    pub const fn date_published(mut self, date_published: DateTime<Utc>) -> Self {
        self.date_published = Some(date_published);
        self
    }

    /// Override the message timestamp.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = Some(message_timestamp);
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

    /// Specify a protocol role to invoke.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// Sign and build the write message.
    ///
    /// # Errors
    ///
    /// Returns an error when builder state is inconsistent or signing
    /// fails.
    #[allow(clippy::too_many_lines)]
    pub async fn build(self, signer: &impl Signer) -> Result<Write> {
        let message_timestamp = self.message_timestamp.unwrap_or_else(Utc::now);

        // the logical author anchors the record's entry id
        let author = if let Some(delegated_grant) = &self.delegated_grant {
            delegated_grant.grant().descriptor.granted_by.clone()
        } else {
            let method = signer.verification_method();
            let Some((did, _)) = method.split_once('#') else {
                return Err(unexpected!("signer verification method is not a DID url"));
            };
            did.to_string()
        };

        // resolve data to (cid, size) plus its transport form
        let (data_cid, data_size, encoded_data, data_stream) =
            match self.data.or_else(|| self.existing.is_none().then(Data::default)) {
                Some(Data::Stream(stream)) => {
                    let (data_cid, data_size) = stream.compute_cid();
                    if data_size <= MAX_ENCODED_SIZE {
                        let encoded = Base64UrlUnpadded::encode_string(stream.as_bytes());
                        (data_cid, data_size, Some(encoded), None)
                    } else {
                        (data_cid, data_size, None, Some(stream))
                    }
                }
                Some(Data::Cid { data_cid, data_size }) => (data_cid, data_size, None, None),
                None => {
                    // updating without new data: reference the current data
                    let existing =
                        self.existing.as_ref().ok_or_else(|| unexpected!("data not set"))?;
                    (
                        existing.descriptor.data_cid.clone(),
                        existing.descriptor.data_size,
                        existing.encoded_data.clone(),
                        None,
                    )
                }
            };

        let descriptor = if let Some(existing) = &self.existing {
            // subsequent write: immutable fields come from the initial write
            let anchor = &existing.descriptor;
            WriteDescriptor {
                base: Descriptor {
                    interface: Interface::Records,
                    method: Method::Write,
                    message_timestamp,
                },
                recipient: anchor.recipient.clone(),
                protocol: anchor.protocol.clone(),
                protocol_path: anchor.protocol_path.clone(),
                schema: anchor.schema.clone(),
                parent_id: anchor.parent_id.clone(),
                tags: self.tags.or_else(|| anchor.tags.clone()),
                data_cid,
                data_size,
                date_created: anchor.date_created,
                published: self.published.or(anchor.published),
                date_published: self.date_published.or(anchor.date_published).or_else(|| {
                    self.published.unwrap_or_default().then_some(message_timestamp)
                }),
                data_format: self.data_format.unwrap_or_else(|| anchor.data_format.clone()),
            }
        } else {
            let (protocol, protocol_path) = match &self.protocol {
                Some(write_protocol) => (
                    Some(utils::clean_url(&write_protocol.protocol)?),
                    Some(write_protocol.protocol_path.clone()),
                ),
                None => (None, None),
            };
            let parent_id = self
                .parent_context_id
                .as_ref()
                .and_then(|context| context.rsplit('/').next().map(ToString::to_string));

            WriteDescriptor {
                base: Descriptor {
                    interface: Interface::Records,
                    method: Method::Write,
                    message_timestamp,
                },
                recipient: self.recipient,
                protocol,
                protocol_path,
                schema: self.schema.map(|s| utils::clean_url(&s)).transpose()?,
                parent_id,
                tags: self.tags,
                data_cid,
                data_size,
                date_created: message_timestamp,
                published: self.published,
                date_published: self.date_published.or_else(|| {
                    self.published.unwrap_or_default().then_some(message_timestamp)
                }),
                data_format: self.data_format.unwrap_or_else(|| "application/json".to_string()),
            }
        };

        // record id and context id are deterministic from the initial write
        let (record_id, context_id) = if let Some(existing) = &self.existing {
            (existing.record_id.clone(), existing.context_id.clone())
        } else {
            let record_id = entry_id(&descriptor, &author)?;
            let context_id = if descriptor.protocol.is_some() {
                match &self.parent_context_id {
                    Some(parent_context) => Some(format!("{parent_context}/{record_id}")),
                    None => Some(record_id.clone()),
                }
            } else {
                None
            };
            (record_id, context_id)
        };

        let mut builder = AuthorizationBuilder::new()
            .descriptor_cid(cid::from_value(&descriptor)?)
            .record_id(record_id.clone());
        if let Some(context_id) = &context_id {
            builder = builder.context_id(context_id.clone());
        }
        if let Some(delegated_grant) = self.delegated_grant {
            builder = builder.delegated_grant(delegated_grant);
        }
        if let Some(permission_grant_id) = self.permission_grant_id {
            builder = builder.permission_grant_id(permission_grant_id);
        }
        if let Some(protocol_role) = self.protocol_role {
            builder = builder.protocol_role(protocol_role);
        }
        let authorization = builder.build(signer).await?;

        Ok(Write {
            record_id,
            context_id,
            descriptor,
            authorization,
            attestation: None,
            encryption: None,
            encoded_data,
            data_stream,
        })
    }
}
