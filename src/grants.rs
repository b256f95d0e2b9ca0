//! # Grants
//!
//! The permissions interface: signed grants permitting another DID to
//! invoke scoped operations, revocations, and the delegated-grant chain
//! that lets a delegate act as the grantor.

pub mod grant;
pub mod revoke;

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

pub use self::grant::{Grant, GrantBuilder, GrantDescriptor, GrantReply};
pub use self::revoke::{Revoke, RevokeBuilder, RevokeDescriptor, RevokeReply};
use crate::provider::MessageStore;
use crate::store::{EntryType, GrantsQuery};
use crate::{Interface, Method, Result, forbidden, unexpected};

/// The scope of a permission grant: the operations it permits.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    /// The interface the grant applies to.
    pub interface: Interface,

    /// The method the grant applies to.
    pub method: Method,

    /// The protocol the grant is restricted to, when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// A grant presented inline by a delegate signing on the grantor's behalf.
///
/// Carrying the full grant (rather than a reference) lets the node verify
/// the chain without a round-trip to the grantor's node; the CID is cached
/// because it is checked against the signature payload on every
/// verification.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct DelegatedGrant {
    grant: Grant,

    #[serde(skip)]
    cid: OnceLock<String>,
}

impl DelegatedGrant {
    /// Wrap a grant for inline presentation.
    #[must_use]
    pub fn new(grant: Grant) -> Self {
        Self {
            grant,
            cid: OnceLock::new(),
        }
    }

    /// The wrapped grant.
    #[must_use]
    pub const fn grant(&self) -> &Grant {
        &self.grant
    }

    /// The grant's CID (its id).
    ///
    /// # Errors
    ///
    /// Returns an error when the grant cannot be serialized.
    pub fn cid(&self) -> Result<String> {
        if let Some(cid) = self.cid.get() {
            return Ok(cid.clone());
        }
        let cid = crate::cid::from_value(&self.grant)?;
        Ok(self.cid.get_or_init(|| cid).clone())
    }
}

impl From<Grant> for DelegatedGrant {
    fn from(grant: Grant) -> Self {
        Self::new(grant)
    }
}

/// Fetch the stored grant with the specified id (its message CID).
///
/// # Errors
///
/// Returns a 401 when no grant is stored under the id.
pub(crate) async fn fetch_grant(
    owner: &str, grant_id: &str, store: &impl MessageStore,
) -> Result<Grant> {
    let Some(entry) = store.get(owner, grant_id).await? else {
        return Err(forbidden!("no grant found with id {grant_id}"));
    };
    match entry.message {
        EntryType::Grant(grant) => Ok(grant),
        _ => Err(forbidden!("message {grant_id} is not a grant")),
    }
}

/// Check whether a revocation for the grant exists at or before the
/// specified timestamp.
pub(crate) async fn is_revoked(
    owner: &str, grant_id: &str, at: &chrono::DateTime<chrono::Utc>, store: &impl MessageStore,
) -> Result<bool> {
    let query = GrantsQuery {
        method: Some(Method::Revoke),
        permission_grant_id: Some(grant_id.to_string()),
    };
    let (entries, _) = store.query(owner, &query.into()).await?;

    for entry in entries {
        let EntryType::Revoke(revoke) = &entry.message else {
            return Err(unexpected!("expected `PermissionsRevoke` message"));
        };
        if &revoke.descriptor.base.message_timestamp <= at {
            return Ok(true);
        }
    }

    Ok(false)
}
