//! # Protocols Query
//!
//! The protocols query endpoint handles `ProtocolsQuery` messages —
//! requests to list a tenant's installed protocol configurations.
//! Unauthorized queriers see only published definitions.

use chrono::Utc;
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::protocols::Configure;
use crate::provider::{MessageStore, Provider, Signer};
use crate::store::ProtocolsQuery;
use crate::{Descriptor, Interface, Method, Result, cid, utils};

/// Handle — or process — a [`Query`] message.
///
/// # Errors
///
/// The endpoint will return an error when an issue occurs querying the
/// message store.
pub async fn handle(
    owner: &str, query: Query, provider: &impl Provider,
) -> Result<Reply<QueryReply>> {
    // the tenant sees everything, everyone else only published definitions
    let is_owner = match &query.authorization {
        Some(authzn) => authzn.author()? == owner,
        None => false,
    };

    let store_query = ProtocolsQuery {
        protocol: query.descriptor.filter.as_ref().map(|f| f.protocol.clone()),
        published: if is_owner { None } else { Some(true) },
    };
    let (entries, _) = MessageStore::query(provider, owner, &store_query.into()).await?;

    let mut configures = Vec::with_capacity(entries.len());
    for entry in &entries {
        configures.push(Configure::try_from(entry)?);
    }

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(QueryReply {
            entries: Some(configures),
        }),
    })
}

/// The [`Query`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// Query descriptor.
    pub descriptor: QueryDescriptor,

    /// Message authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

impl Message for Query {
    type Reply = QueryReply;

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

/// [`QueryReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct QueryReply {
    /// Matching protocol configurations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<Configure>>,
}

/// The [`Query`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// Filter, when querying for a single protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<ProtocolsFilter>,
}

/// Filter over protocol configurations.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolsFilter {
    /// The protocol URI to match.
    pub protocol: String,
}

/// Builder for [`Query`] messages.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    filter: Option<ProtocolsFilter>,
}

impl QueryBuilder {
    /// Returns a new [`QueryBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a single protocol.
    #[must_use]
    pub fn filter(mut self, protocol: impl Into<String>) -> Self {
        self.filter = Some(ProtocolsFilter {
            protocol: protocol.into(),
        });
        self
    }

    /// Build the query without signing (matches published definitions
    /// only).
    ///
    /// # Errors
    ///
    /// Returns an error when the filter's protocol URL cannot be
    /// normalized.
    pub fn build_anonymous(self) -> Result<Query> {
        Ok(Query {
            descriptor: self.descriptor()?,
            authorization: None,
        })
    }

    /// Sign and build the query.
    ///
    /// # Errors
    ///
    /// Returns an error when signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Query> {
        let descriptor = self.descriptor()?;
        let authorization = AuthorizationBuilder::new()
            .descriptor_cid(cid::from_value(&descriptor)?)
            .build(signer)
            .await?;

        Ok(Query {
            descriptor,
            authorization: Some(authorization),
        })
    }

    fn descriptor(self) -> Result<QueryDescriptor> {
        let filter = match self.filter {
            Some(filter) => Some(ProtocolsFilter {
                protocol: utils::clean_url(&filter.protocol)?,
            }),
            None => None,
        };

        Ok(QueryDescriptor {
            base: Descriptor {
                interface: Interface::Protocols,
                method: Method::Query,
                message_timestamp: Utc::now(),
            },
            filter,
        })
    }
}
