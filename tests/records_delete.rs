//! Records Delete

use dwn_core::endpoint;
use dwn_core::provider::KeyStore;
use dwn_core::records::{Data, DeleteBuilder, ReadBuilder, RecordsFilter, WriteBuilder};
use dwn_core::Error;
use http::StatusCode;
use test_node::key_store::{ALICE_DID, BOB_DID};
use test_node::provider::ProviderImpl;

// Should tombstone a record: reads afterwards return 404, and resubmitting
// the same tombstone yields the same final state.
#[tokio::test]
async fn delete_then_read() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Write then delete a record.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .data(Data::from(b"doomed record".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let delete = DeleteBuilder::new()
        .record_id(&write.record_id)
        .build(&alice_keyring)
        .await
        .expect("should create delete");
    let reply =
        endpoint::handle(ALICE_DID, delete.clone(), &provider).await.expect("should delete");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // The record reads as not found.
    // --------------------------------------------------
    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let Err(Error::NotFound(_)) = endpoint::handle(ALICE_DID, read, &provider).await else {
        panic!("should be NotFound");
    };

    // --------------------------------------------------
    // Resubmitting the same delete is accepted and changes nothing.
    // --------------------------------------------------
    let reply = endpoint::handle(ALICE_DID, delete, &provider).await.expect("should delete");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let Err(Error::NotFound(_)) = endpoint::handle(ALICE_DID, read, &provider).await else {
        panic!("should be NotFound");
    };
}

// Deleting a record that does not exist is a no-op success.
#[tokio::test]
async fn delete_absent_record() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    let delete = DeleteBuilder::new()
        .record_id("bafkreigrr4tmbm7fj22jkk4bsxxzv2vcwnxwxyyrnrbepa6zadgbhw3krm")
        .build(&alice_keyring)
        .await
        .expect("should create delete");
    let reply = endpoint::handle(ALICE_DID, delete, &provider).await.expect("should delete");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);
}

// A delete that does not land strictly after the latest write is rejected.
#[tokio::test]
async fn delete_pre_dated() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    let write = WriteBuilder::new()
        .data(Data::from(b"persistent record".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, write.clone(), &provider).await.expect("should write");

    // a delete timestamped at the write itself ties, and ties lose
    let delete = DeleteBuilder::new()
        .record_id(&write.record_id)
        .message_timestamp(write.descriptor.base.message_timestamp)
        .build(&alice_keyring)
        .await
        .expect("should create delete");
    let Err(Error::Conflict(_)) = endpoint::handle(ALICE_DID, delete, &provider).await else {
        panic!("should be Conflict");
    };
}

// A non-owner without any claim on the record cannot delete it.
#[tokio::test]
async fn delete_unauthorized() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(BOB_DID).expect("should get Bob's keyring");

    let write = WriteBuilder::new()
        .data(Data::from(b"alice's record".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, write.clone(), &provider).await.expect("should write");

    let delete = DeleteBuilder::new()
        .record_id(&write.record_id)
        .build(&bob_keyring)
        .await
        .expect("should create delete");
    let Err(Error::Forbidden(_)) = endpoint::handle(ALICE_DID, delete, &provider).await else {
        panic!("should be Forbidden");
    };
}
