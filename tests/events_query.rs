//! Events Query

use dwn_core::endpoint;
use dwn_core::events::{EventsFilter, QueryBuilder};
use dwn_core::provider::{EventLog, KeyStore};
use dwn_core::records::{Data, WriteBuilder, WriteProtocol};
use dwn_core::protocols::{
    Action, ActionRule, Actor, ConfigureBuilder, Definition, ProtocolType, RuleSet,
};
use dwn_core::{Error, Interface, Method};
use http::StatusCode;
use test_node::key_store::{ALICE_DID, BOB_DID};
use test_node::provider::ProviderImpl;

// Watermarks are strictly increasing per tenant, and a cursor resumes the
// replay strictly after itself.
#[tokio::test]
async fn watermark_ordering() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Write five records, producing five events.
    // --------------------------------------------------
    let mut cids = Vec::new();
    for i in 0..5 {
        let write = WriteBuilder::new()
            .data(Data::from(format!("event {i}").into_bytes()))
            .build(&alice_keyring)
            .await
            .expect("should create write");
        cids.push(dwn_core::endpoint::Message::cid(&write).expect("should compute cid"));
        endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");
    }

    // --------------------------------------------------
    // Replay the log: all five, in order, watermarks increasing.
    // --------------------------------------------------
    let (events, cursor) =
        EventLog::events(&provider, ALICE_DID, None).await.expect("should read events");
    assert_eq!(events.len(), 5);
    for pair in events.windows(2) {
        assert!(pair[0].watermark < pair[1].watermark, "watermarks must increase");
    }
    assert_eq!(
        events.iter().map(|e| e.message_cid.clone()).collect::<Vec<_>>(),
        cids
    );

    // --------------------------------------------------
    // Resume from the returned cursor: nothing new.
    // --------------------------------------------------
    let (more, _) =
        EventLog::events(&provider, ALICE_DID, cursor).await.expect("should read events");
    assert!(more.is_empty());

    // --------------------------------------------------
    // A second tenant's log is empty.
    // --------------------------------------------------
    let (events, _) =
        EventLog::events(&provider, BOB_DID, None).await.expect("should read events");
    assert!(events.is_empty());
}

// The events interface returns matching message CIDs to the tenant, and
// filters evaluate against the event indexes.
#[tokio::test]
async fn filtered_query() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    let definition = Definition::new("http://example.com/journal")
        .published(true)
        .add_type("entry", ProtocolType::default())
        .add_rule(
            "entry",
            RuleSet {
                actions: Some(vec![ActionRule {
                    who: Some(Actor::Anyone),
                    can: vec![Action::Create],
                    ..ActionRule::default()
                }]),
                ..RuleSet::default()
            },
        );
    let configure = ConfigureBuilder::new()
        .definition(definition)
        .build(&alice_keyring)
        .await
        .expect("should create configure");
    endpoint::handle(ALICE_DID, configure, &provider).await.expect("should configure");

    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "http://example.com/journal".to_string(),
            protocol_path: "entry".to_string(),
        })
        .data(Data::from(b"{}".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");

    // a plain record outside the protocol
    let write = WriteBuilder::new()
        .data(Data::from(b"unrelated".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");

    // --------------------------------------------------
    // All events.
    // --------------------------------------------------
    let query = QueryBuilder::new().build(&alice_keyring).await.expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 3);

    // --------------------------------------------------
    // Only events for the journal protocol.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .add_filter(EventsFilter::new().protocol("http://example.com/journal"))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 2); // the configure plus the protocol-bound write

    // --------------------------------------------------
    // Only configure events.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .add_filter(
            EventsFilter::new().interface(Interface::Protocols).method(Method::Configure),
        )
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
}

// A caller without a grant cannot replay another tenant's log.
#[tokio::test]
async fn query_unauthorized() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let bob_keyring = provider.keyring(BOB_DID).expect("should get Bob's keyring");

    let query = QueryBuilder::new().build(&bob_keyring).await.expect("should create query");
    let Err(Error::Forbidden(_)) = endpoint::handle(ALICE_DID, query, &provider).await else {
        panic!("should be Forbidden");
    };
}
