//! # JSON Web Signature
//!
//! A minimal general-JWS envelope. Message authorizations, attestations, and
//! owner signatures are all JWS objects whose payload carries CID references
//! to the signed descriptor. Verification resolves the signing key through
//! the [`DidResolver`] supplied by the provider.

use base64ct::{Base64UrlUnpadded, Encoding};
use ed25519_dalek::{Signature as EdSignature, Verifier, VerifyingKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::provider::{DidResolver, Signer};
use crate::{Error, Result, unexpected};

/// The JWS signing algorithm used throughout.
pub const EDDSA: &str = "EdDSA";

/// A general-format JWS: one base64url payload, one or more signatures.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Jws {
    /// Base64url-encoded JSON payload.
    pub payload: String,

    /// One or more signatures over the payload.
    pub signatures: Vec<Signature>,
}

/// A single JWS signature with its protected header.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Signature {
    /// Base64url-encoded protected header.
    pub protected: String,

    /// Base64url-encoded signature bytes.
    pub signature: String,
}

/// The protected header of a signature.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Protected {
    /// Signing algorithm. Always `EdDSA`.
    pub alg: String,

    /// The fully-qualified verification method (`<did>#<fragment>`) of the
    /// signing key.
    pub kid: String,
}

/// An Ed25519 public key in JWK form, as published in a DID document.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PublicKeyJwk {
    /// Key type. Always `OKP` for Ed25519 keys.
    pub kty: String,

    /// Curve name.
    pub crv: String,

    /// Base64url-encoded public key bytes.
    pub x: String,
}

impl Jws {
    /// Create a JWS over the serialized payload using the provided signer.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload cannot be serialized or the signer
    /// fails to produce a signature.
    pub async fn create<T: Serialize + Send + Sync>(
        payload: &T, signer: &impl Signer,
    ) -> Result<Self> {
        let bytes = serde_json::to_vec(payload)?;
        let payload = Base64UrlUnpadded::encode_string(&bytes);

        let protected = Protected {
            alg: EDDSA.to_string(),
            kid: signer.verification_method(),
        };
        let protected = Base64UrlUnpadded::encode_string(&serde_json::to_vec(&protected)?);

        let sig_bytes = signer
            .try_sign(format!("{protected}.{payload}").as_bytes())
            .await
            .map_err(|e| unexpected!("issue signing message: {e}"))?;

        Ok(Self {
            payload,
            signatures: vec![Signature {
                protected,
                signature: Base64UrlUnpadded::encode_string(&sig_bytes),
            }],
        })
    }

    /// Verify every signature against the keys published in the signer's DID
    /// document.
    ///
    /// # Errors
    ///
    /// Returns a 401 `GeneralJwsVerifierInvalidSignature` error when any
    /// signature fails verification or its key cannot be resolved.
    pub async fn verify(&self, resolver: &impl DidResolver) -> Result<()> {
        for signature in &self.signatures {
            let header = signature.protected_header()?;
            let Some((did, _)) = header.kid.split_once('#') else {
                return Err(invalid("kid is not a DID url"));
            };

            let document = resolver
                .resolve(did)
                .await
                .map_err(|e| invalid(&format!("unable to resolve {did}: {e}")))?;
            let Some(method) =
                document.verification_method.iter().find(|vm| vm.id == header.kid)
            else {
                return Err(invalid(&format!("no key found for {}", header.kid)));
            };

            let key_bytes = Base64UrlUnpadded::decode_vec(&method.public_key_jwk.x)
                .map_err(|e| invalid(&format!("invalid public key: {e}")))?;
            let key_bytes: [u8; 32] =
                key_bytes.try_into().map_err(|_| invalid("invalid public key length"))?;
            let verifying_key = VerifyingKey::from_bytes(&key_bytes)
                .map_err(|e| invalid(&format!("invalid public key: {e}")))?;

            let sig_bytes = Base64UrlUnpadded::decode_vec(&signature.signature)
                .map_err(|e| invalid(&format!("invalid signature encoding: {e}")))?;
            let sig_bytes: [u8; 64] =
                sig_bytes.try_into().map_err(|_| invalid("invalid signature length"))?;
            let ed_signature = EdSignature::from_bytes(&sig_bytes);

            let signing_input = format!("{}.{}", signature.protected, self.payload);
            verifying_key
                .verify(signing_input.as_bytes(), &ed_signature)
                .map_err(|_| invalid("signature verification failed"))?;
        }

        Ok(())
    }

    /// Deserialize the JWS payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload is not valid base64url JSON.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = Base64UrlUnpadded::decode_vec(&self.payload)
            .map_err(|e| unexpected!("issue decoding payload: {e}"))?;
        serde_json::from_slice(&bytes).map_err(|e| unexpected!("issue deserializing payload: {e}"))
    }

    /// The DID of the first signer.
    ///
    /// # Errors
    ///
    /// Returns an error when the JWS has no signatures or the `kid` is not a
    /// DID url.
    pub fn did(&self) -> Result<String> {
        let Some(signature) = self.signatures.first() else {
            return Err(unexpected!("no signatures found"));
        };
        let header = signature.protected_header()?;
        let Some((did, _)) = header.kid.split_once('#') else {
            return Err(unexpected!("kid is not a DID url"));
        };
        Ok(did.to_string())
    }
}

impl Signature {
    fn protected_header(&self) -> Result<Protected> {
        let bytes = Base64UrlUnpadded::decode_vec(&self.protected)
            .map_err(|e| unexpected!("issue decoding protected header: {e}"))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| unexpected!("issue deserializing protected header: {e}"))
    }
}

fn invalid(detail: &str) -> Error {
    Error::Unauthorized(format!("GeneralJwsVerifierInvalidSignature: {detail}"))
}
