//! Author-delegated grants

use chrono::{Duration, Utc};
use dwn_core::endpoint;
use dwn_core::grants::{DelegatedGrant, GrantBuilder, Scope};
use dwn_core::protocols::{
    Action, ActionRule, Actor, ConfigureBuilder, Definition, ProtocolType, RuleSet,
};
use dwn_core::provider::KeyStore;
use dwn_core::records::{Data, QueryBuilder, RecordsFilter, WriteBuilder, WriteProtocol};
use dwn_core::{Error, Interface, Method};
use http::StatusCode;
use test_node::key_store::{ALICE_DID, APP_DID, BOB_DID, CAROL_DID};
use test_node::provider::ProviderImpl;

const CHAT: &str = "http://example.com/chat";

fn chat_definition() -> Definition {
    Definition::new(CHAT)
        .published(true)
        .add_type("message", ProtocolType::default())
        .add_rule(
            "message",
            RuleSet {
                actions: Some(vec![ActionRule {
                    who: Some(Actor::Anyone),
                    can: vec![Action::Create],
                    ..ActionRule::default()
                }]),
                ..RuleSet::default()
            },
        )
}

async fn configure_chat(provider: &ProviderImpl) {
    let bob_keyring = provider.keyring(BOB_DID).expect("should get Bob's keyring");
    let configure = ConfigureBuilder::new()
        .definition(chat_definition())
        .build(&bob_keyring)
        .await
        .expect("should create configure");
    endpoint::handle(BOB_DID, configure, provider).await.expect("should configure");
}

// A device holding Alice's delegated grant writes to Bob's node as Alice;
// the record's author reads back as Alice.
#[tokio::test]
async fn delegated_write() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");
    let app_keyring = provider.keyring(APP_DID).expect("should get the app keyring");
    let bob_keyring = provider.keyring(BOB_DID).expect("should get Bob's keyring");

    configure_chat(&provider).await;

    // --------------------------------------------------
    // Alice delegates Records/Write on the chat protocol to her device.
    // --------------------------------------------------
    let grant = GrantBuilder::new()
        .granted_to(APP_DID)
        .delegated(true)
        .scope(Scope {
            interface: Interface::Records,
            method: Method::Write,
            protocol: Some(CHAT.to_string()),
        })
        .build(&alice_keyring)
        .await
        .expect("should create grant");

    // --------------------------------------------------
    // The device writes a chat message to Bob's node on Alice's behalf.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: CHAT.to_string(),
            protocol_path: "message".to_string(),
        })
        .delegated_grant(DelegatedGrant::new(grant.clone()))
        .data(Data::from(b"{\"text\": \"hi Bob\"}".to_vec()))
        .build(&app_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(BOB_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Bob reads the record; its author is Alice, not the device.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&bob_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(BOB_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].write.authorization.author().expect("should resolve author"),
        ALICE_DID
    );

    // --------------------------------------------------
    // Carol invoking the same grant is rejected.
    // --------------------------------------------------
    let carol_keyring = provider.keyring(CAROL_DID).expect("should get Carol's keyring");
    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: CHAT.to_string(),
            protocol_path: "message".to_string(),
        })
        .delegated_grant(DelegatedGrant::new(grant))
        .data(Data::from(b"{\"text\": \"hi, it's Carol\"}".to_vec()))
        .build(&carol_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(BOB_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
    assert!(e.contains("GrantedToAndOwnerSignatureMismatch"));
}

// A grant without `delegated: true` cannot be invoked as a delegation.
#[tokio::test]
async fn not_a_delegated_grant() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");
    let app_keyring = provider.keyring(APP_DID).expect("should get the app keyring");

    configure_chat(&provider).await;

    let grant = GrantBuilder::new()
        .granted_to(APP_DID)
        .scope(Scope {
            interface: Interface::Records,
            method: Method::Write,
            protocol: Some(CHAT.to_string()),
        })
        .build(&alice_keyring)
        .await
        .expect("should create grant");

    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: CHAT.to_string(),
            protocol_path: "message".to_string(),
        })
        .delegated_grant(DelegatedGrant::new(grant))
        .data(Data::from(b"{}".to_vec()))
        .build(&app_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(BOB_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
    assert!(e.contains("NotADelegatedGrant"));
}

// A delegated grant scoped to another protocol does not cover the write.
#[tokio::test]
async fn scope_protocol_mismatch() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");
    let app_keyring = provider.keyring(APP_DID).expect("should get the app keyring");

    configure_chat(&provider).await;

    let grant = GrantBuilder::new()
        .granted_to(APP_DID)
        .delegated(true)
        .scope(Scope {
            interface: Interface::Records,
            method: Method::Write,
            protocol: Some("http://example.com/other".to_string()),
        })
        .build(&alice_keyring)
        .await
        .expect("should create grant");

    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: CHAT.to_string(),
            protocol_path: "message".to_string(),
        })
        .delegated_grant(DelegatedGrant::new(grant))
        .data(Data::from(b"{}".to_vec()))
        .build(&app_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(BOB_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
    assert!(e.contains("RecordsGrantAuthorizationScopeProtocolMismatch"));
}

// An expired delegated grant is rejected.
#[tokio::test]
async fn expired_grant() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");
    let app_keyring = provider.keyring(APP_DID).expect("should get the app keyring");

    configure_chat(&provider).await;

    let grant = GrantBuilder::new()
        .granted_to(APP_DID)
        .delegated(true)
        .date_expires(Utc::now() - Duration::hours(1))
        .scope(Scope {
            interface: Interface::Records,
            method: Method::Write,
            protocol: Some(CHAT.to_string()),
        })
        .build(&alice_keyring)
        .await
        .expect("should create grant");

    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: CHAT.to_string(),
            protocol_path: "message".to_string(),
        })
        .delegated_grant(DelegatedGrant::new(grant))
        .data(Data::from(b"{}".to_vec()))
        .build(&app_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(BOB_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
    assert!(e.contains("GrantAuthorizationGrantExpired"));
}
