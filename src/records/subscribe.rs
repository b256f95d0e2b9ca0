//! # Records Subscribe
//!
//! The records subscribe endpoint handles `RecordsSubscribe` messages —
//! requests for real-time delivery of matching record events. Delivery
//! starts at subscription time; earlier events are not replayed.

use chrono::Utc;
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::event::{SubscribeFilter, Subscriber};
use crate::grants::fetch_grant;
use crate::protocols::Action;
use crate::provider::{EventStream, Provider, Signer};
use crate::records::{RecordsFilter, protocol};
use crate::{Descriptor, Interface, Method, Result, cid};

/// Handle — or process — a [`Subscribe`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when the subscription cannot be established.
pub async fn handle(
    owner: &str, subscribe: Subscribe, provider: &impl Provider,
) -> Result<Reply<SubscribeReply>> {
    let filter = subscribe.descriptor.filter.normalize()?;
    let filter = subscribe.authorize(owner, filter, provider).await?;

    let subscription =
        EventStream::subscribe(provider, owner, SubscribeFilter::Records(filter)).await?;

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(SubscribeReply {
            subscription,
        }),
    })
}

/// The [`Subscribe`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribe {
    /// Subscribe descriptor.
    pub descriptor: SubscribeDescriptor,

    /// Message authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

impl Message for Subscribe {
    type Reply = SubscribeReply;

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

impl Subscribe {
    // Authorize the subscription, restricting the filter where the caller's
    // access is partial.
    async fn authorize(
        &self, owner: &str, filter: RecordsFilter, provider: &impl Provider,
    ) -> Result<RecordsFilter> {
        let Some(authzn) = &self.authorization else {
            return Ok(filter.published(true));
        };

        let author = authzn.author()?;
        if author == owner {
            return Ok(filter);
        }

        if let Some(protocol_role) = authzn.payload()?.protocol_role {
            protocol::permit_query(
                owner,
                &author,
                &protocol_role,
                &Action::Subscribe,
                &filter,
                provider,
            )
            .await?;
            return Ok(filter);
        }

        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = fetch_grant(owner, grant_id, provider).await?;
            grant.verify(owner, &authzn.signer()?, &self.descriptor.base, provider).await?;
            grant.permit_query_subscribe(filter.protocol.as_deref())?;
            return Ok(filter);
        }

        Ok(filter.published(true))
    }
}

/// [`SubscribeReply`] is returned by the handler in the [`Reply`] `body`
/// field.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SubscribeReply {
    /// The live subscription.
    #[serde(skip)]
    pub subscription: Subscriber,
}

/// The [`Subscribe`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The filter events must match to be delivered.
    pub filter: RecordsFilter,
}

/// Builder for [`Subscribe`] messages.
#[derive(Clone, Debug, Default)]
pub struct SubscribeBuilder {
    filter: Option<RecordsFilter>,
    protocol_role: Option<String>,
}

impl SubscribeBuilder {
    /// Returns a new [`SubscribeBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Specify the filter events must match.
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

    /// Sign and build the subscribe message.
    ///
    /// # Errors
    ///
    /// Returns an error when signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Subscribe> {
        let descriptor = SubscribeDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Subscribe,
                message_timestamp: Utc::now(),
            },
            filter: self.filter.unwrap_or_default(),
        };

        let mut builder =
            AuthorizationBuilder::new().descriptor_cid(cid::from_value(&descriptor)?);
        if let Some(protocol_role) = self.protocol_role {
            builder = builder.protocol_role(protocol_role);
        }
        let authorization = builder.build(signer).await?;

        Ok(Subscribe {
            descriptor,
            authorization: Some(authorization),
        })
    }
}
