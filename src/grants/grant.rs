//! # Permissions Grant
//!
//! The grant endpoint handles `PermissionsGrant` messages — signed
//! assertions permitting a grantee to invoke scoped operations on the
//! grantor's behalf. A grant's id is its message CID.

use chrono::{DateTime, Duration, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::grants::{Scope, is_revoked};
use crate::provider::{EventLog, MessageStore, Provider, Signer};
use crate::store::Entry;
use crate::{Descriptor, Interface, Method, Result, bad_request, cid, forbidden, unexpected, utils};

/// Handle — or process — a [`Grant`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs storing the grant.
pub async fn handle(
    owner: &str, grant: Grant, provider: &impl Provider,
) -> Result<Reply<GrantReply>> {
    grant.validate()?;
    grant.authorize(owner)?;

    let entry = Entry::from(&grant);
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

/// The [`Grant`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    /// Grant descriptor.
    pub descriptor: GrantDescriptor,

    /// Message authorization.
    pub authorization: Authorization,
}

impl Message for Grant {
    type Reply = GrantReply;

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

/// [`GrantReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GrantReply;

/// The [`Grant`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The DID granting the permission.
    pub granted_by: String,

    /// The DID the permission is granted to.
    pub granted_to: String,

    /// The tenant DID the permission applies to.
    pub granted_for: String,

    /// Timestamp the grant expires.
    #[serde(with = "crate::utils::rfc3339_micros")]
    pub date_expires: DateTime<Utc>,

    /// Whether the grantee may act *as* the grantor (delegation) rather
    /// than merely invoke the operation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delegated: bool,

    /// Optional description of the grant's purpose.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// The operations the grant permits.
    pub scope: Scope,
}

impl Grant {
    /// The grant's id — its message CID.
    ///
    /// # Errors
    ///
    /// Returns an error when the message cannot be serialized.
    pub fn id(&self) -> Result<String> {
        cid::from_value(self)
    }

    /// Build flattened indexes for the grant message.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> std::collections::HashMap<String, serde_json::Value> {
        use chrono::SecondsFormat::Micros;

        let mut indexes = std::collections::HashMap::new();
        indexes.insert("interface".to_string(), Interface::Permissions.to_string().into());
        indexes.insert("method".to_string(), Method::Grant.to_string().into());
        indexes.insert(
            "messageTimestamp".to_string(),
            self.descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true).into(),
        );
        indexes.insert("grantedBy".to_string(), self.descriptor.granted_by.clone().into());
        indexes.insert("grantedTo".to_string(), self.descriptor.granted_to.clone().into());
        indexes.insert("grantedFor".to_string(), self.descriptor.granted_for.clone().into());
        indexes
            .insert("author".to_string(), self.authorization.author().unwrap_or_default().into());
        indexes
    }

    fn validate(&self) -> Result<()> {
        if let Some(protocol) = &self.descriptor.scope.protocol {
            let normalized = utils::clean_url(protocol)?;
            if protocol != &normalized {
                return Err(bad_request!(
                    "UrlProtocolNotNormalized: scope protocol {protocol} is not normalized"
                ));
            }
        }
        Ok(())
    }

    fn authorize(&self, owner: &str) -> Result<()> {
        let author = self.authorization.author()?;
        if author != owner {
            return Err(forbidden!("grants may only be created by the tenant"));
        }
        if self.descriptor.granted_by != author {
            return Err(forbidden!("grant signer is not the grantor"));
        }
        Ok(())
    }

    /// Verify the grant permits the grantee to invoke the described
    /// operation on the owner's node at the message's timestamp.
    ///
    /// # Errors
    ///
    /// Returns a 401 when the grant names a different grantee or tenant,
    /// does not cover the operation, is expired, or has been revoked.
    pub async fn verify(
        &self, owner: &str, grantee: &str, descriptor: &Descriptor, store: &impl MessageStore,
    ) -> Result<()> {
        if self.descriptor.granted_to != grantee {
            return Err(forbidden!(
                "GrantAuthorizationNotGrantedToAuthor: grant is not granted to {grantee}"
            ));
        }
        if self.descriptor.granted_for != owner {
            return Err(forbidden!(
                "GrantAuthorizationNotGrantedForTenant: grant is not granted for {owner}"
            ));
        }
        if self.descriptor.scope.interface != descriptor.interface
            || self.descriptor.scope.method != descriptor.method
        {
            return Err(forbidden!(
                "grant scope does not permit {}/{}",
                descriptor.interface,
                descriptor.method
            ));
        }

        self.verify_active(owner, &descriptor.message_timestamp, store).await
    }

    /// Verify the grant is neither expired nor revoked at the specified
    /// timestamp.
    ///
    /// # Errors
    ///
    /// Returns a 401 `GrantAuthorizationGrantExpired` /
    /// `GrantAuthorizationGrantRevoked` error.
    pub async fn verify_active(
        &self, owner: &str, at: &DateTime<Utc>, store: &impl MessageStore,
    ) -> Result<()> {
        if at >= &self.descriptor.date_expires {
            return Err(forbidden!("GrantAuthorizationGrantExpired: grant has expired"));
        }
        if is_revoked(owner, &self.id()?, at, store).await? {
            return Err(forbidden!("GrantAuthorizationGrantRevoked: grant has been revoked"));
        }
        Ok(())
    }

    /// Verify the grant supports delegation and names the expected grantor
    /// and delegate.
    ///
    /// # Errors
    ///
    /// Returns a 401 when the grant is not delegated, is not signed by the
    /// logical author, or is granted to someone other than the signer.
    pub fn verify_delegation(&self, author: &str, signer: &str) -> Result<()> {
        if !self.descriptor.delegated {
            return Err(forbidden!(
                "RecordsAuthorDelegatedGrantNotADelegatedGrant: grant does not permit delegation"
            ));
        }
        if self.descriptor.granted_by != author || self.authorization.signer()? != author {
            return Err(forbidden!("delegated grant is not signed by the logical author"));
        }
        if self.descriptor.granted_to != signer {
            return Err(forbidden!(
                "RecordsAuthorDelegatedGrantGrantedToAndOwnerSignatureMismatch: grant is not \
                 granted to message signer {signer}"
            ));
        }
        Ok(())
    }

    /// Verify the grant's protocol scope covers a record write.
    ///
    /// # Errors
    ///
    /// Returns a 401 `RecordsGrantAuthorizationScopeProtocolMismatch` when
    /// the scope protocol differs from the record's.
    pub fn permit_write(&self, protocol: Option<&str>) -> Result<()> {
        let Some(scope_protocol) = self.descriptor.scope.protocol.as_deref() else {
            return Ok(());
        };
        if Some(scope_protocol) != protocol {
            return Err(forbidden!(
                "RecordsGrantAuthorizationScopeProtocolMismatch: grant protocol scope does not \
                 match record protocol"
            ));
        }
        Ok(())
    }

    /// Verify the grant's protocol scope covers a record read.
    ///
    /// # Errors
    ///
    /// Returns a 401 `RecordsGrantAuthorizationScopeProtocolMismatch` when
    /// the scope protocol differs from the record's.
    pub fn permit_read(&self, protocol: Option<&str>) -> Result<()> {
        self.permit_write(protocol)
    }

    /// Verify the grant's protocol scope covers a query or subscribe.
    ///
    /// # Errors
    ///
    /// Returns a 401 when the scope protocol differs from the filter's.
    pub fn permit_query_subscribe(&self, protocol: Option<&str>) -> Result<()> {
        let Some(scope_protocol) = self.descriptor.scope.protocol.as_deref() else {
            return Ok(());
        };
        if Some(scope_protocol) != protocol {
            return Err(forbidden!(
                "RecordsGrantAuthorizationQueryOrSubscribeProtocolScopeMismatch: grant protocol \
                 scope does not match filter protocol"
            ));
        }
        Ok(())
    }

    /// Verify the grant's protocol scope covers a record delete.
    ///
    /// # Errors
    ///
    /// Returns a 401 when the scope protocol differs from the record's.
    pub fn permit_delete(&self, protocol: Option<&str>) -> Result<()> {
        let Some(scope_protocol) = self.descriptor.scope.protocol.as_deref() else {
            return Ok(());
        };
        if Some(scope_protocol) != protocol {
            return Err(forbidden!(
                "RecordsGrantAuthorizationDeleteProtocolScopeMismatch: grant protocol scope does \
                 not match record protocol"
            ));
        }
        Ok(())
    }
}

/// Builder for [`Grant`] messages.
#[derive(Clone, Debug, Default)]
pub struct GrantBuilder {
    granted_to: Option<String>,
    granted_for: Option<String>,
    date_expires: Option<DateTime<Utc>>,
    delegated: bool,
    description: Option<String>,
    scope: Option<Scope>,
    message_timestamp: DateTime<Utc>,
}

impl GrantBuilder {
    /// Returns a new [`GrantBuilder`].
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            message_timestamp: now,
            date_expires: Some(now + Duration::hours(24)),
            ..Self::default()
        }
    }

    /// Specify the DID the permission is granted to.
    #[must_use]
    pub fn granted_to(mut self, granted_to: impl Into<String>) -> Self {
        self.granted_to = Some(granted_to.into());
        self
    }

    /// Specify the tenant DID the permission applies to. Defaults to the
    /// grantor.
    #[must_use]
    pub fn granted_for(mut self, granted_for: impl Into<String>) -> Self {
        self.granted_for = Some(granted_for.into());
        self
    }

    /// Specify when the grant expires.
    #[must_use]
    pub const fn date_expires(mut self, date_expires: DateTime<Utc>) -> Self {
        self.date_expires = Some(date_expires);
        self
    }

    /// Permit the grantee to act as the grantor.
    #[must_use]
    pub const fn delegated(mut self, delegated: bool) -> Self {
        self.delegated = delegated;
        self
    }

    /// Describe the grant's purpose.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Specify the operations the grant permits.
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Sign and build the grant. The grantor is the signer.
    ///
    /// # Errors
    ///
    /// Returns an error when required fields are unset or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Grant> {
        let granted_to = self.granted_to.ok_or_else(|| unexpected!("grantee not set"))?;
        let mut scope = self.scope.ok_or_else(|| unexpected!("scope not set"))?;
        let date_expires = self.date_expires.ok_or_else(|| unexpected!("expiry not set"))?;

        if let Some(protocol) = &scope.protocol {
            scope.protocol = Some(utils::clean_url(protocol)?);
        }

        // the signing key's controller is the grantor
        let Some((granted_by, _)) = signer.verification_method().split_once('#').map(|(d, f)| {
            (d.to_string(), f.to_string())
        }) else {
            return Err(unexpected!("signer verification method is not a DID url"));
        };

        let descriptor = GrantDescriptor {
            base: Descriptor {
                interface: Interface::Permissions,
                method: Method::Grant,
                message_timestamp: self.message_timestamp,
            },
            granted_by: granted_by.clone(),
            granted_for: self.granted_for.unwrap_or(granted_by),
            granted_to,
            date_expires,
            delegated: self.delegated,
            description: self.description,
            scope,
        };

        let authorization = AuthorizationBuilder::new()
            .descriptor_cid(cid::from_value(&descriptor)?)
            .build(signer)
            .await?;

        Ok(Grant {
            descriptor,
            authorization,
        })
    }
}
