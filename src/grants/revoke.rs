//! # Permissions Revoke
//!
//! The revoke endpoint handles `PermissionsRevoke` messages. A revocation
//! ends a grant's validity from the revocation's timestamp onward; messages
//! that invoked the grant earlier remain authorized.

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::grants::fetch_grant;
use crate::provider::{EventLog, MessageStore, Provider, Signer};
use crate::store::Entry;
use crate::{Descriptor, Error, Interface, Method, Result, cid, forbidden, unexpected};

/// Handle — or process — a [`Revoke`] message.
///
/// # Errors
///
/// The endpoint will return an error when the referenced grant does not
/// exist, authorization fails, or the revocation cannot be stored.
pub async fn handle(
    owner: &str, revoke: Revoke, provider: &impl Provider,
) -> Result<Reply<RevokeReply>> {
    let grant_id = &revoke.descriptor.permission_grant_id;
    let Ok(grant) = fetch_grant(owner, grant_id, provider).await else {
        return Err(Error::NotFound(format!("no grant found with id {grant_id}")));
    };

    // only the tenant or the grantor may revoke
    let author = revoke.authorization.author()?;
    if author != owner && author != grant.descriptor.granted_by {
        return Err(forbidden!("revocation author is neither tenant nor grantor"));
    }

    let entry = Entry::from(&revoke);
    MessageStore::put(provider, owner, &entry).await?;
    EventLog::append(provider, owner, &entry.cid()?, &entry.indexes).await?;

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: None,
    })
}

/// The [`Revoke`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Revoke {
    /// Revoke descriptor.
    pub descriptor: RevokeDescriptor,

    /// Message authorization.
    pub authorization: Authorization,
}

impl Message for Revoke {
    type Reply = RevokeReply;

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

/// [`RevokeReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RevokeReply;

/// The [`Revoke`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// Id (message CID) of the grant being revoked.
    pub permission_grant_id: String,
}

impl Revoke {
    /// Build flattened indexes for the revoke message.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> std::collections::HashMap<String, serde_json::Value> {
        use chrono::SecondsFormat::Micros;

        let mut indexes = std::collections::HashMap::new();
        indexes.insert("interface".to_string(), Interface::Permissions.to_string().into());
        indexes.insert("method".to_string(), Method::Revoke.to_string().into());
        indexes.insert(
            "messageTimestamp".to_string(),
            self.descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true).into(),
        );
        indexes.insert(
            "permissionGrantId".to_string(),
            self.descriptor.permission_grant_id.clone().into(),
        );
        indexes
            .insert("author".to_string(), self.authorization.author().unwrap_or_default().into());
        indexes
    }
}

/// Builder for [`Revoke`] messages.
#[derive(Clone, Debug, Default)]
pub struct RevokeBuilder {
    permission_grant_id: Option<String>,
    message_timestamp: Option<DateTime<Utc>>,
}

impl RevokeBuilder {
    /// Returns a new [`RevokeBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Specify the grant to revoke.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Override the message timestamp.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// Sign and build the revocation.
    ///
    /// # Errors
    ///
    /// Returns an error when no grant id is set or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Revoke> {
        let permission_grant_id =
            self.permission_grant_id.ok_or_else(|| unexpected!("grant id not set"))?;

        let descriptor = RevokeDescriptor {
            base: Descriptor {
                interface: Interface::Permissions,
                method: Method::Revoke,
                message_timestamp: self.message_timestamp.unwrap_or_else(Utc::now),
            },
            permission_grant_id,
        };

        let authorization = AuthorizationBuilder::new()
            .descriptor_cid(cid::from_value(&descriptor)?)
            .build(signer)
            .await?;

        Ok(Revoke {
            descriptor,
            authorization,
        })
    }
}
