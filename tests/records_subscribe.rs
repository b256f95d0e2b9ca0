//! Records Subscribe

use dwn_core::endpoint;
use dwn_core::provider::KeyStore;
use dwn_core::records::{Data, RecordsFilter, SubscribeBuilder, WriteBuilder};
use futures::StreamExt;
use http::StatusCode;
use test_node::key_store::ALICE_DID;
use test_node::provider::ProviderImpl;

// Events for matching records are delivered to the subscriber; closing the
// subscription releases the handler.
#[tokio::test]
async fn subscribe_to_writes() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Subscribe to records with a specific schema.
    // --------------------------------------------------
    let subscribe = SubscribeBuilder::new()
        .filter(RecordsFilter::new().schema("http://updates"))
        .build(&alice_keyring)
        .await
        .expect("should create subscribe");
    let reply = endpoint::handle(ALICE_DID, subscribe, &provider).await.expect("should subscribe");
    assert_eq!(reply.status.code, StatusCode::OK);
    let mut subscription = reply.body.expect("should have body").subscription;

    // --------------------------------------------------
    // A matching write is delivered; a non-matching one is not.
    // --------------------------------------------------
    let matching = WriteBuilder::new()
        .schema("http://updates")
        .data(Data::from(b"news".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, matching.clone(), &provider).await.expect("should write");

    let other = WriteBuilder::new()
        .schema("http://other")
        .data(Data::from(b"noise".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, other, &provider).await.expect("should write");

    let event = subscription.next().await.expect("should deliver event");
    let write = event.as_write().expect("event should be a write");
    assert_eq!(write.record_id, matching.record_id);

    // nothing else is pending: the non-matching write was filtered out
    let pending = futures::poll!(subscription.next());
    assert!(pending.is_pending(), "no further events should be pending");

    // --------------------------------------------------
    // Close the subscription; later writes go nowhere.
    // --------------------------------------------------
    subscription.close();

    let after_close = WriteBuilder::new()
        .schema("http://updates")
        .data(Data::from(b"unheard".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, after_close, &provider).await.expect("should write");
}
