//! # Records Query
//!
//! The records query endpoint handles `RecordsQuery` messages — requests to
//! query the message store for matching current record versions. Callers
//! other than the tenant see published records plus records they authored,
//! received, or can reach through an invoked protocol role.

use chrono::Utc;
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::grants::fetch_grant;
use crate::protocols::Action;
use crate::provider::{MessageStore, Provider, Signer};
use crate::records::write::initial_entry;
use crate::records::{RecordsFilter, Write, protocol};
use crate::store::{Cursor, Pagination, RecordsQuery, Sort};
use crate::{Descriptor, Interface, Method, Result, cid};

/// Handle — or process — a [`Query`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs querying the message store.
pub async fn handle(
    owner: &str, query: Query, provider: &impl Provider,
) -> Result<Reply<QueryReply>> {
    let filter = query.descriptor.filter.normalize()?;
    let filters = query.authorize(owner, &filter, provider).await?;

    let store_query = RecordsQuery {
        filters,
        method: Some(Method::Write),
        include_archived: false,
        sort: query.descriptor.date_sort.clone().unwrap_or_default(),
        pagination: query.descriptor.pagination.clone(),
    };
    let (entries, cursor) = MessageStore::query(provider, owner, &store_query.into()).await?;

    if entries.is_empty() {
        return Ok(Reply {
            status: Status {
                code: StatusCode::OK.as_u16(),
                detail: None,
            },
            body: None,
        });
    }

    let mut reply_entries = Vec::with_capacity(entries.len());
    for entry in entries {
        let write = Write::try_from(entry)?;

        // attach the initial write when the current version is not it
        let initial_write = if write.is_initial()? {
            None
        } else {
            let mut initial = initial_entry(owner, &write.record_id, provider)
                .await?
                .ok_or_else(|| crate::unexpected!("initial write not found"))?;
            initial.encoded_data = None;
            Some(initial)
        };

        reply_entries.push(QueryReplyEntry {
            write,
            initial_write,
        });
    }

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(QueryReply {
            entries: Some(reply_entries),
            cursor,
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

impl Query {
    // Authorize the query and derive the filter disjunction it may run.
    async fn authorize(
        &self, owner: &str, filter: &RecordsFilter, provider: &impl Provider,
    ) -> Result<Vec<RecordsFilter>> {
        // anonymous queries see published records only
        let Some(authzn) = &self.authorization else {
            return Ok(vec![filter.clone().published(true)]);
        };

        let author = authzn.author()?;
        if author == owner {
            return Ok(vec![filter.clone()]);
        }

        // an invoked role opens the filtered protocol path
        if let Some(protocol_role) = authzn.payload()?.protocol_role {
            protocol::permit_query(owner, &author, &protocol_role, &Action::Query, filter, provider)
                .await?;
            return Ok(vec![filter.clone()]);
        }

        // a permission grant opens its protocol scope
        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = fetch_grant(owner, grant_id, provider).await?;
            grant.verify(owner, &authzn.signer()?, &self.descriptor.base, provider).await?;
            grant.permit_query_subscribe(filter.protocol.as_deref())?;
            return Ok(vec![filter.clone()]);
        }

        // otherwise: published, authored, or received records
        Ok(vec![
            filter.clone().published(true),
            filter.clone().add_author(author.clone()),
            filter.clone().add_recipient(author),
        ])
    }
}

/// [`QueryReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReply {
    /// Entries matching the query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<QueryReplyEntry>>,

    /// Pagination cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// One record in a query reply.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReplyEntry {
    /// The record's current version.
    #[serde(flatten)]
    pub write: Write,

    /// The record's initial write, when the current version is a
    /// subsequent write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_write: Option<Write>,
}

/// The [`Query`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The filter to match records against.
    pub filter: RecordsFilter,

    /// Sort order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_sort: Option<Sort>,

    /// Pagination settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

/// Builder for [`Query`] messages.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    filter: Option<RecordsFilter>,
    date_sort: Option<Sort>,
    pagination: Option<Pagination>,
    protocol_role: Option<String>,
    permission_grant_id: Option<String>,
}

impl QueryBuilder {
    /// Returns a new [`QueryBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Specify the filter to match records against.
    #[must_use]
    pub fn filter(mut self, filter: RecordsFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Specify the sort order.
    #[must_use]
    pub const fn date_sort(mut self, date_sort: Sort) -> Self {
        self.date_sort = Some(date_sort);
        self
    }

    /// Specify pagination.
    #[must_use]
    pub fn pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
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

    /// Build the query without signing (matches published records only).
    #[must_use]
    pub fn build_anonymous(self) -> Query {
        Query {
            descriptor: self.descriptor(),
            authorization: None,
        }
    }

    /// Sign and build the query.
    ///
    /// # Errors
    ///
    /// Returns an error when signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Query> {
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

        Ok(Query {
            descriptor,
            authorization: Some(authorization),
        })
    }

    fn descriptor(self) -> QueryDescriptor {
        QueryDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Query,
                message_timestamp: Utc::now(),
            },
            filter: self.filter.unwrap_or_default(),
            date_sort: self.date_sort,
            pagination: self.pagination,
        }
    }
}
