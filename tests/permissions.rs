//! Permissions

use dwn_core::endpoint;
use dwn_core::grants::{GrantBuilder, RevokeBuilder, Scope};
use dwn_core::provider::KeyStore;
use dwn_core::records::{Data, WriteBuilder};
use dwn_core::{Error, Interface, Method};
use http::StatusCode;
use test_node::key_store::{ALICE_DID, BOB_DID};
use test_node::provider::ProviderImpl;

// A stored grant lets the grantee write; revoking it ends that from the
// revocation's timestamp onward.
#[tokio::test]
async fn grant_then_revoke() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(BOB_DID).expect("should get Bob's keyring");

    // --------------------------------------------------
    // Alice grants Bob Records/Write on her node.
    // --------------------------------------------------
    let grant = GrantBuilder::new()
        .granted_to(BOB_DID)
        .scope(Scope {
            interface: Interface::Records,
            method: Method::Write,
            protocol: None,
        })
        .build(&alice_keyring)
        .await
        .expect("should create grant");
    let grant_id = grant.id().expect("should compute grant id");

    let reply = endpoint::handle(ALICE_DID, grant, &provider).await.expect("should store grant");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Bob writes by invoking the grant.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .permission_grant_id(&grant_id)
        .data(Data::from(b"bob's record on alice's node".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice revokes the grant.
    // --------------------------------------------------
    let revoke = RevokeBuilder::new()
        .permission_grant_id(&grant_id)
        .build(&alice_keyring)
        .await
        .expect("should create revoke");
    let reply = endpoint::handle(ALICE_DID, revoke, &provider).await.expect("should revoke");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Bob's next write is rejected as revoked.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .permission_grant_id(&grant_id)
        .data(Data::from(b"too late".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
    assert!(e.contains("GrantAuthorizationGrantRevoked"));
}

// Without a grant (or any other claim), a non-owner write is rejected.
#[tokio::test]
async fn write_without_grant() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let bob_keyring = provider.keyring(BOB_DID).expect("should get Bob's keyring");

    let write = WriteBuilder::new()
        .data(Data::from(b"uninvited".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(_)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
}

// Revoking a grant that does not exist is a 404.
#[tokio::test]
async fn revoke_missing_grant() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    let revoke = RevokeBuilder::new()
        .permission_grant_id("bafkreigrr4tmbm7fj22jkk4bsxxzv2vcwnxwxyyrnrbepa6zadgbhw3krm")
        .build(&alice_keyring)
        .await
        .expect("should create revoke");
    let Err(Error::NotFound(_)) = endpoint::handle(ALICE_DID, revoke, &provider).await else {
        panic!("should be NotFound");
    };
}

// Only the tenant may file grants on their node.
#[tokio::test]
async fn grant_by_non_owner() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let bob_keyring = provider.keyring(BOB_DID).expect("should get Bob's keyring");

    let grant = GrantBuilder::new()
        .granted_to(BOB_DID)
        .scope(Scope {
            interface: Interface::Records,
            method: Method::Write,
            protocol: None,
        })
        .build(&bob_keyring)
        .await
        .expect("should create grant");

    let Err(Error::Forbidden(_)) = endpoint::handle(ALICE_DID, grant, &provider).await else {
        panic!("should be Forbidden");
    };
}
