//! # Authorization
//!
//! The authorization block carried by signed messages: the author's (or
//! their delegate's) signature over the descriptor CID, optionally an owner
//! signature for imported records, and the delegated grant invoked when a
//! delegate signs on the author's behalf.

use serde::{Deserialize, Serialize};

use crate::grants::DelegatedGrant;
use crate::jws::Jws;
use crate::provider::{DidResolver, Signer};
use crate::{Result, bad_request, unexpected};

/// Message authorization.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    /// The signature of the message signer — the author, or a delegate
    /// invoking `author_delegated_grant`.
    pub signature: Jws,

    /// The grant authorizing the signer to act as the logical author.
    /// Boxed: the grant is itself a signed message carrying an
    /// authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_delegated_grant: Option<Box<DelegatedGrant>>,

    /// Signature of the tenant importing a record authored elsewhere.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_signature: Option<Jws>,
}

/// The payload signed by [`Authorization::signature`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JwsPayload {
    /// CID of the message descriptor.
    pub descriptor_cid: String,

    /// The record id, for `RecordsWrite` messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,

    /// The context id, for protocol-bound `RecordsWrite` messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// CID of the message attestation, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_cid: Option<String>,

    /// Id of the permission grant the signer is invoking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_grant_id: Option<String>,

    /// CID of the delegated grant the signer is invoking. Must be present
    /// exactly when the authorization carries `author_delegated_grant`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegated_grant_id: Option<String>,

    /// The protocol role the signer is invoking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_role: Option<String>,
}

impl Authorization {
    /// The DID of the message signer.
    ///
    /// # Errors
    ///
    /// Returns an error when the signature has no resolvable `kid`.
    pub fn signer(&self) -> Result<String> {
        self.signature.did()
    }

    /// The logical author: the grantor of the delegated grant when one is
    /// invoked, the signer otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error when the signer cannot be determined.
    pub fn author(&self) -> Result<String> {
        if let Some(delegated_grant) = &self.author_delegated_grant {
            return Ok(delegated_grant.grant().descriptor.granted_by.clone());
        }
        self.signer()
    }

    /// The DID of the owner signature's signer, when present.
    ///
    /// # Errors
    ///
    /// Returns an error when the owner signature has no resolvable `kid`.
    pub fn owner(&self) -> Result<Option<String>> {
        let Some(owner_signature) = &self.owner_signature else {
            return Ok(None);
        };
        Ok(Some(owner_signature.did()?))
    }

    /// The signed payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload cannot be deserialized.
    pub fn payload(&self) -> Result<JwsPayload> {
        self.signature.payload()
    }

    /// Verify every signature and the delegated-grant reference integrity.
    ///
    /// # Errors
    ///
    /// Returns a 401 when a signature fails verification, and a 400 when the
    /// delegated grant and its payload reference do not agree.
    pub async fn verify(&self, resolver: &impl DidResolver) -> Result<()> {
        self.signature.verify(resolver).await?;

        if let Some(owner_signature) = &self.owner_signature {
            owner_signature.verify(resolver).await?;
        }

        // the grant and its payload reference must exist together and agree
        let payload = self.payload()?;
        match (&self.author_delegated_grant, &payload.delegated_grant_id) {
            (None, None) => {}
            (Some(delegated_grant), Some(delegated_grant_id)) => {
                delegated_grant.grant().authorization.signature.verify(resolver).await?;
                if &delegated_grant.cid()? != delegated_grant_id {
                    return Err(bad_request!(
                        "RecordsAuthorDelegatedGrantCidMismatch: delegated grant CID does not \
                         match signature payload"
                    ));
                }
            }
            _ => {
                return Err(bad_request!(
                    "RecordsAuthorDelegatedGrantAndIdExistenceMismatch: delegated grant and \
                     `delegatedGrantId` must both be set or both be unset"
                ));
            }
        }

        Ok(())
    }
}

/// Builder for message authorizations.
#[derive(Debug, Default)]
pub struct AuthorizationBuilder {
    descriptor_cid: Option<String>,
    record_id: Option<String>,
    context_id: Option<String>,
    attestation_cid: Option<String>,
    permission_grant_id: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
    protocol_role: Option<String>,
}

impl AuthorizationBuilder {
    /// Returns a new [`AuthorizationBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the CID of the descriptor being signed.
    #[must_use]
    pub fn descriptor_cid(mut self, descriptor_cid: impl Into<String>) -> Self {
        self.descriptor_cid = Some(descriptor_cid.into());
        self
    }

    /// Set the record id signed into the payload.
    #[must_use]
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Set the context id signed into the payload.
    #[must_use]
    pub fn context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Set the attestation CID signed into the payload.
    #[must_use]
    pub fn attestation_cid(mut self, attestation_cid: impl Into<String>) -> Self {
        self.attestation_cid = Some(attestation_cid.into());
        self
    }

    /// Set the permission grant invoked by the signer.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Set the delegated grant invoked by the signer.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// Set the protocol role invoked by the signer.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// Sign the payload and build the authorization.
    ///
    /// # Errors
    ///
    /// Returns an error when no descriptor CID has been set or signing
    /// fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Authorization> {
        let descriptor_cid =
            self.descriptor_cid.ok_or_else(|| unexpected!("descriptor CID not set"))?;

        let delegated_grant_id =
            self.delegated_grant.as_ref().map(|grant| grant.cid()).transpose()?;

        let payload = JwsPayload {
            descriptor_cid,
            record_id: self.record_id,
            context_id: self.context_id,
            attestation_cid: self.attestation_cid,
            permission_grant_id: self.permission_grant_id,
            delegated_grant_id,
            protocol_role: self.protocol_role,
        };

        Ok(Authorization {
            signature: Jws::create(&payload, signer).await?,
            author_delegated_grant: self.delegated_grant.map(Box::new),
            owner_signature: None,
        })
    }
}
