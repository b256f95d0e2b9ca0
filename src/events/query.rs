//! # Events Query
//!
//! The events query endpoint handles `EventsQuery` messages — requests to
//! replay a tenant's event log, optionally filtered, from a watermark
//! cursor onward. Replies carry message CIDs; callers fetch any messages
//! they are missing.

use chrono::Utc;
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::events::EventsFilter;
use crate::grants::fetch_grant;
use crate::provider::{EventLog, Provider, Signer};
use crate::store::{Cursor, EventsQuery};
use crate::{Descriptor, Interface, Method, Result, cid, forbidden};

/// Handle — or process — a [`Query`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs querying the event log.
pub async fn handle(
    owner: &str, query: Query, provider: &impl Provider,
) -> Result<Reply<QueryReply>> {
    query.authorize(owner, provider).await?;

    let log_query = EventsQuery {
        filters: query.descriptor.filters.clone(),
        cursor: query.descriptor.cursor.clone(),
    };
    let (events, cursor) = EventLog::query(provider, owner, &log_query).await?;

    let entries: Vec<String> = events.into_iter().map(|event| event.message_cid).collect();
    let entries = if entries.is_empty() { None } else { Some(entries) };

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(QueryReply { entries, cursor }),
    })
}

/// The [`Query`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// Query descriptor.
    pub descriptor: QueryDescriptor,

    /// Message authorization.
    pub authorization: Authorization,
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
        Some(&self.authorization)
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

impl Query {
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let authzn = &self.authorization;
        let author = authzn.author()?;

        if author == owner {
            return Ok(());
        }

        let Some(grant_id) = &authzn.payload()?.permission_grant_id else {
            return Err(forbidden!("author has no grant to query events"));
        };
        let grant = fetch_grant(owner, grant_id, provider).await?;
        grant.verify(owner, &authzn.signer()?, &self.descriptor.base, provider).await?;

        // a protocol-scoped grant constrains every filter to its protocol
        if let Some(protocol) = grant.descriptor.scope.protocol.as_deref() {
            for filter in &self.descriptor.filters {
                if filter.protocol.as_deref() != Some(protocol) {
                    return Err(forbidden!("filter and grant protocols do not match"));
                }
            }
        }

        Ok(())
    }
}

/// [`QueryReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct QueryReply {
    /// CIDs of the matching events' messages, in watermark order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<String>>,

    /// Watermark cursor for resuming the replay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// The [`Query`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// Filters — a match against any one filter is a match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<EventsFilter>,

    /// Resume strictly after this cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// Builder for [`Query`] messages.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    filters: Vec<EventsFilter>,
    cursor: Option<Cursor>,
}

impl QueryBuilder {
    /// Returns a new [`QueryBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter to the disjunction.
    #[must_use]
    pub fn add_filter(mut self, filter: EventsFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Resume strictly after this cursor.
    #[must_use]
    pub fn cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Sign and build the query.
    ///
    /// # Errors
    ///
    /// Returns an error when signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Query> {
        let descriptor = QueryDescriptor {
            base: Descriptor {
                interface: Interface::Events,
                method: Method::Query,
                message_timestamp: Utc::now(),
            },
            filters: self.filters,
            cursor: self.cursor,
        };

        let authorization = AuthorizationBuilder::new()
            .descriptor_cid(cid::from_value(&descriptor)?)
            .build(signer)
            .await?;

        Ok(Query {
            descriptor,
            authorization,
        })
    }
}
