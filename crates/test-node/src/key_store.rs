//! # Key store
//!
//! Deterministic Ed25519 keys for the well-known test identities. Each
//! DID's signing key is derived from a hash of the DID itself, so documents
//! and signatures are reproducible across test runs.

use anyhow::Result;
use base64ct::{Base64UrlUnpadded, Encoding};
use dwn_core::jws::PublicKeyJwk;
use dwn_core::provider::{Document, Keyring, Signer, VerificationMethod};
use ed25519_dalek::{Signer as _, SigningKey};
use sha2::{Digest, Sha256};

/// Alice's DID.
pub const ALICE_DID: &str = "did:node:alice";

/// Bob's DID.
pub const BOB_DID: &str = "did:node:bob";

/// Carol's DID.
pub const CAROL_DID: &str = "did:node:carol";

/// A device/application DID.
pub const APP_DID: &str = "did:node:app";

/// The signing keyring for the specified DID.
#[must_use]
pub fn keyring(did: &str) -> KeyringImpl {
    KeyringImpl {
        signing_key: signing_key(did),
        verification_method: format!("{did}#key-0"),
    }
}

/// The DID document for the specified DID.
#[must_use]
pub fn document(did: &str) -> Document {
    let verifying_key = signing_key(did).verifying_key();

    Document {
        id: did.to_string(),
        verification_method: vec![VerificationMethod {
            id: format!("{did}#key-0"),
            controller: did.to_string(),
            public_key_jwk: PublicKeyJwk {
                kty: "OKP".to_string(),
                crv: "Ed25519".to_string(),
                x: Base64UrlUnpadded::encode_string(verifying_key.as_bytes()),
            },
        }],
    }
}

fn signing_key(did: &str) -> SigningKey {
    let digest: [u8; 32] = Sha256::digest(did.as_bytes()).into();
    SigningKey::from_bytes(&digest)
}

/// A deterministic Ed25519 keyring.
#[derive(Clone, Debug)]
pub struct KeyringImpl {
    signing_key: SigningKey,
    verification_method: String,
}

impl Signer for KeyringImpl {
    async fn try_sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        Ok(self.signing_key.sign(msg).to_bytes().to_vec())
    }

    fn verification_method(&self) -> String {
        self.verification_method.clone()
    }
}

impl Keyring for KeyringImpl {}
