//! # Protocols Configure
//!
//! The configure endpoint handles `ProtocolsConfigure` messages — requests
//! to install (or replace) a protocol definition on a tenant's node. The
//! newest configuration for a protocol wins; older ones are removed.

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::grants::{DelegatedGrant, fetch_grant};
use crate::protocols::Definition;
use crate::provider::{EventLog, EventStream, MessageStore, Provider, Signer};
use crate::store::{Entry, ProtocolsQuery};
use crate::{
    Descriptor, Error, Interface, Method, Result, bad_request, cid, forbidden, unexpected, utils,
};

/// Handle — or process — a [`Configure`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails, the
/// definition is invalid, or a newer configuration already exists.
pub async fn handle(
    owner: &str, configure: Configure, provider: &impl Provider,
) -> Result<Reply<ConfigureReply>> {
    configure.validate()?;
    configure.authorize(owner, provider).await?;

    let definition = &configure.descriptor.definition;

    // the incoming message must be the newest configuration for the protocol
    let query = ProtocolsQuery {
        protocol: Some(definition.protocol.clone()),
        published: None,
    };
    let (existing, _) = MessageStore::query(provider, owner, &query.into()).await?;

    let incoming = (configure.descriptor.base.message_timestamp, configure.cid()?);
    for entry in &existing {
        let current = (entry.descriptor().message_timestamp, entry.cid()?);
        if current >= incoming {
            return Err(Error::Conflict("a newer protocol configuration exists".to_string()));
        }
    }

    let entry = Entry::from(&configure);
    MessageStore::put(provider, owner, &entry).await?;
    EventLog::append(provider, owner, &entry.cid()?, &entry.indexes).await?;
    EventStream::emit(provider, owner, &entry).await?;

    // superseded configurations are no longer queryable
    let mut deleted_cids = Vec::new();
    for entry in &existing {
        let entry_cid = entry.cid()?;
        MessageStore::delete(provider, owner, &entry_cid).await?;
        deleted_cids.push(entry_cid);
    }
    EventLog::delete(provider, owner, &deleted_cids).await?;

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: Some(ConfigureReply { message: configure }),
    })
}

/// The [`Configure`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Configure {
    /// Configure descriptor.
    pub descriptor: ConfigureDescriptor,

    /// Message authorization.
    pub authorization: Authorization,
}

impl Message for Configure {
    type Reply = ConfigureReply;

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

/// [`ConfigureReply`] is returned by the handler in the [`Reply`] `body`
/// field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureReply {
    /// The installed configuration.
    pub message: Configure,
}

/// The [`Configure`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The protocol definition.
    pub definition: Definition,
}

impl Configure {
    /// Build flattened indexes for the configure message.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> std::collections::HashMap<String, serde_json::Value> {
        use chrono::SecondsFormat::Micros;

        let mut indexes = std::collections::HashMap::new();
        indexes.insert("interface".to_string(), Interface::Protocols.to_string().into());
        indexes.insert("method".to_string(), Method::Configure.to_string().into());
        indexes.insert(
            "messageTimestamp".to_string(),
            self.descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true).into(),
        );
        indexes
            .insert("protocol".to_string(), self.descriptor.definition.protocol.clone().into());
        indexes
            .insert("published".to_string(), self.descriptor.definition.published.to_string().into());
        indexes
            .insert("author".to_string(), self.authorization.author().unwrap_or_default().into());
        indexes
    }

    fn validate(&self) -> Result<()> {
        let definition = &self.descriptor.definition;
        if definition.protocol != utils::clean_url(&definition.protocol)? {
            return Err(bad_request!(
                "UrlProtocolNotNormalized: protocol {} is not normalized",
                definition.protocol
            ));
        }
        definition.verify_structure()
    }

    /// Check the message has sufficient privileges.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let authzn = &self.authorization;
        let author = authzn.author()?;

        // a delegate must present a grant covering the configure
        if let Some(delegated_grant) = &authzn.author_delegated_grant {
            let grant = delegated_grant.grant();
            grant.verify_delegation(&author, &authzn.signer()?)?;
            grant.verify(owner, &authzn.signer()?, &self.descriptor.base, provider).await?;
        }

        if author == owner {
            return Ok(());
        }

        let Some(grant_id) = &authzn.payload()?.permission_grant_id else {
            return Err(forbidden!("author has no grant to configure protocols"));
        };
        let grant = fetch_grant(owner, grant_id, provider).await?;
        grant.verify(owner, &authzn.signer()?, &self.descriptor.base, provider).await?;

        // a protocol-scoped grant only covers its own protocol
        if let Some(protocol) = &grant.descriptor.scope.protocol {
            if protocol != &self.descriptor.definition.protocol {
                return Err(forbidden!("grant protocol scope does not match configure protocol"));
            }
        }

        Ok(())
    }
}

/// Builder for [`Configure`] messages.
#[derive(Clone, Debug, Default)]
pub struct ConfigureBuilder {
    definition: Option<Definition>,
    delegated_grant: Option<DelegatedGrant>,
    permission_grant_id: Option<String>,
    message_timestamp: Option<DateTime<Utc>>,
}

impl ConfigureBuilder {
    /// Returns a new [`ConfigureBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Specify the protocol definition to install.
    #[must_use]
    pub fn definition(mut self, definition: Definition) -> Self {
        self.definition = Some(definition);
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

    /// Sign and build the configure message.
    ///
    /// # Errors
    ///
    /// Returns an error when the definition is unset or invalid, or signing
    /// fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Configure> {
        let definition =
            self.definition.ok_or_else(|| unexpected!("definition not set"))?.normalize()?;
        definition.verify_structure()?;

        let descriptor = ConfigureDescriptor {
            base: Descriptor {
                interface: Interface::Protocols,
                method: Method::Configure,
                message_timestamp: self.message_timestamp.unwrap_or_else(Utc::now),
            },
            definition,
        };

        let mut builder =
            AuthorizationBuilder::new().descriptor_cid(cid::from_value(&descriptor)?);
        if let Some(grant_id) = self.permission_grant_id {
            builder = builder.permission_grant_id(grant_id);
        }
        if let Some(delegated_grant) = self.delegated_grant {
            builder = builder.delegated_grant(delegated_grant);
        }
        let authorization = builder.build(signer).await?;

        Ok(Configure {
            descriptor,
            authorization,
        })
    }
}
