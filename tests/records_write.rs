//! Records Write

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Duration;
use dwn_core::endpoint::{self, Message};
use dwn_core::provider::KeyStore;
use dwn_core::records::{Data, DeleteBuilder, QueryBuilder, RecordsFilter, WriteBuilder};
use dwn_core::Error;
use http::StatusCode;
use test_node::key_store::ALICE_DID;
use test_node::provider::ProviderImpl;

// Should be able to update an existing record when the update has a later
// `message_timestamp`.
#[tokio::test]
async fn update_older() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Write a record.
    // --------------------------------------------------
    let data = b"a new write record";

    let initial = WriteBuilder::new()
        .data(Data::from(data.to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Verify the record was created.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&initial.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.encoded_data, Some(Base64UrlUnpadded::encode_string(data)));

    // --------------------------------------------------
    // Update the existing record.
    // --------------------------------------------------
    let data = b"updated write record";

    let update = WriteBuilder::from(initial.clone())
        .data(Data::from(data.to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, update.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Verify the updated record overwrote the original.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&update.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.encoded_data, Some(Base64UrlUnpadded::encode_string(data)));

    // --------------------------------------------------
    // Attempt to overwrite the latest record with an older version.
    // --------------------------------------------------
    let Err(Error::Conflict(e)) = endpoint::handle(ALICE_DID, initial, &provider).await else {
        panic!("should be Conflict");
    };
    assert_eq!(e, "a more recent update exists");

    // --------------------------------------------------
    // Verify the latest update remains unchanged.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(update.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.encoded_data, Some(Base64UrlUnpadded::encode_string(data)));
}

// Should accept an update with an identical `message_timestamp` only when
// its message CID is larger than the stored version's; the loser receives a
// conflict, and resubmitting the loser leaves state unchanged.
#[tokio::test]
async fn update_smaller_cid() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Write a record.
    // --------------------------------------------------
    let initial = WriteBuilder::new()
        .data(Data::from(b"a new write record".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Create 2 updates with the same `message_timestamp`.
    // --------------------------------------------------
    let message_timestamp = initial.descriptor.base.message_timestamp + Duration::seconds(1);

    let write_1 = WriteBuilder::from(initial.clone())
        .data(Data::from(b"message 1".to_vec()))
        .message_timestamp(message_timestamp)
        .build(&alice_keyring)
        .await
        .expect("should create write");

    let write_2 = WriteBuilder::from(initial.clone())
        .data(Data::from(b"message 2".to_vec()))
        .message_timestamp(message_timestamp)
        .build(&alice_keyring)
        .await
        .expect("should create write");

    // order the writes by message CID
    let mut sorted = vec![write_1.clone(), write_2.clone()];
    sorted.sort_by(|a, b| a.cid().unwrap().cmp(&b.cid().unwrap()));

    // --------------------------------------------------
    // Apply the smaller-CID update, then the larger-CID update.
    // --------------------------------------------------
    let reply =
        endpoint::handle(ALICE_DID, sorted[0].clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let reply =
        endpoint::handle(ALICE_DID, sorted[1].clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // The smaller-CID update now loses the ordering race.
    // --------------------------------------------------
    let Err(Error::Conflict(_)) = endpoint::handle(ALICE_DID, sorted[0].clone(), &provider).await
    else {
        panic!("should be Conflict");
    };

    // resubmitting the loser changes nothing
    let Err(Error::Conflict(_)) = endpoint::handle(ALICE_DID, sorted[0].clone(), &provider).await
    else {
        panic!("should be Conflict");
    };

    // --------------------------------------------------
    // Verify the larger-CID update is the surviving version.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&initial.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.descriptor.data_cid, sorted[1].descriptor.data_cid);
}

// Should reject an update that modifies an immutable property.
#[tokio::test]
async fn immutable_properties() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    let initial = WriteBuilder::new()
        .schema("record-schema")
        .data(Data::from(b"immutable check".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // hand-roll an update with a different schema
    let mut update = WriteBuilder::from(initial)
        .data(Data::from(b"changed".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    update.descriptor.schema = Some("http://another-schema".to_string());

    // re-sign so the descriptor CID matches again
    let payload = dwn_core::authorization::JwsPayload {
        descriptor_cid: dwn_core::cid::from_value(&update.descriptor).expect("should compute cid"),
        record_id: Some(update.record_id.clone()),
        ..Default::default()
    };
    update.authorization.signature =
        dwn_core::jws::Jws::create(&payload, &alice_keyring).await.expect("should sign");

    let Err(Error::Unexpected(e)) = endpoint::handle(ALICE_DID, update, &provider).await else {
        panic!("should be BadRequest");
    };
    assert!(e.contains("immutable properties"));
}

// Should reject a write referencing data it does not supply and which is
// not already associated with the record.
#[tokio::test]
async fn missing_data_stream() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    let write = WriteBuilder::new()
        .data(Data::Cid {
            data_cid: "bafkreigrr4tmbm7fj22jkk4bsxxzv2vcwnxwxyyrnrbepa6zadgbhw3krm".to_string(),
            data_size: 8,
        })
        .build(&alice_keyring)
        .await
        .expect("should create write");

    let Err(Error::Unexpected(e)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be BadRequest");
    };
    assert!(e.contains("RecordsWriteMissingDataStream"));
}

// Should reject any write to a tombstoned record with a conflict.
#[tokio::test]
async fn write_after_delete() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    let initial = WriteBuilder::new()
        .data(Data::from(b"short-lived record".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let delete = DeleteBuilder::new()
        .record_id(&initial.record_id)
        .build(&alice_keyring)
        .await
        .expect("should create delete");
    let reply = endpoint::handle(ALICE_DID, delete, &provider).await.expect("should delete");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let update = WriteBuilder::from(initial)
        .data(Data::from(b"too late".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let Err(Error::Conflict(_)) = endpoint::handle(ALICE_DID, update, &provider).await else {
        panic!("should be Conflict");
    };
}
