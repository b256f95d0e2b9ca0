//! Protocols

use dwn_core::endpoint;
use dwn_core::protocols::{
    Action, ActionRule, Actor, ConfigureBuilder, Definition, ProtocolType,
    QueryBuilder as ProtocolsQueryBuilder, RuleSet, Tags,
};
use dwn_core::provider::KeyStore;
use dwn_core::records::{Data, QueryBuilder, RecordsFilter, WriteBuilder, WriteProtocol};
use dwn_core::Error;
use http::StatusCode;
use serde_json::json;
use test_node::key_store::{ALICE_DID, BOB_DID, CAROL_DID};
use test_node::provider::ProviderImpl;

const SOCIAL: &str = "http://example.com/social";
const POST_SCHEMA: &str = "http://example.com/schemas/post";

fn social_definition() -> Definition {
    Definition::new(SOCIAL)
        .published(true)
        .add_type(
            "post",
            ProtocolType {
                schema: Some(POST_SCHEMA.to_string()),
                data_formats: Some(vec!["application/json".to_string()]),
            },
        )
        .add_rule(
            "post",
            RuleSet {
                actions: Some(vec![ActionRule {
                    who: Some(Actor::Anyone),
                    can: vec![Action::Create, Action::Update],
                    ..ActionRule::default()
                }]),
                ..RuleSet::default()
            },
        )
}

fn friends_definition() -> Definition {
    Definition::new("http://example.com/friends")
        .published(true)
        .add_type("friend", ProtocolType::default())
        .add_type(
            "post",
            ProtocolType {
                schema: Some(POST_SCHEMA.to_string()),
                data_formats: None,
            },
        )
        .add_rule(
            "friend",
            RuleSet {
                role: Some(true),
                ..RuleSet::default()
            },
        )
        .add_rule(
            "post",
            RuleSet {
                actions: Some(vec![ActionRule {
                    role: Some("friend".to_string()),
                    can: vec![Action::Create, Action::Read, Action::Query, Action::Subscribe],
                    ..ActionRule::default()
                }]),
                ..RuleSet::default()
            },
        )
}

// Should install a protocol and return it from queries, respecting the
// published flag for non-owners.
#[tokio::test]
async fn configure_and_query() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    let configure = ConfigureBuilder::new()
        .definition(social_definition())
        .build(&alice_keyring)
        .await
        .expect("should create configure");
    let reply = endpoint::handle(ALICE_DID, configure, &provider).await.expect("should configure");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // an unpublished protocol is invisible to anonymous queriers
    let unpublished = ConfigureBuilder::new()
        .definition(Definition::new("http://example.com/private").published(false))
        .build(&alice_keyring)
        .await
        .expect("should create configure");
    endpoint::handle(ALICE_DID, unpublished, &provider).await.expect("should configure");

    let query = ProtocolsQueryBuilder::new().build_anonymous().expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].descriptor.definition.protocol, SOCIAL);

    // the tenant sees both
    let query = ProtocolsQueryBuilder::new().build(&alice_keyring).await.expect("should query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 2);
}

// An action rule permitting `update` without `create` is malformed.
#[tokio::test]
async fn configure_rejects_update_without_create() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    let definition = Definition::new("http://example.com/bad")
        .add_type("item", ProtocolType::default())
        .add_rule(
            "item",
            RuleSet {
                actions: Some(vec![ActionRule {
                    who: Some(Actor::Anyone),
                    can: vec![Action::Update],
                    ..ActionRule::default()
                }]),
                ..RuleSet::default()
            },
        );

    let result = ConfigureBuilder::new().definition(definition).build(&alice_keyring).await;
    assert!(result.is_err(), "update without create must be rejected");
}

// A tag schema outside the accepted subset is rejected at configure time.
#[tokio::test]
async fn configure_rejects_object_tags() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    let definition = Definition::new("http://example.com/bad-tags")
        .add_type("item", ProtocolType::default())
        .add_rule(
            "item",
            RuleSet {
                tags: Some(Tags {
                    properties: [("meta".to_string(), json!({"type": "object"}))].into(),
                    ..Tags::default()
                }),
                ..RuleSet::default()
            },
        );

    let result = ConfigureBuilder::new().definition(definition).build(&alice_keyring).await;
    assert!(result.is_err(), "object-typed tags must be rejected");
}

// An `anyone can create` rule admits writes from any signer; structural
// mismatches are still rejected.
#[tokio::test]
async fn protocol_write_rules() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(BOB_DID).expect("should get Bob's keyring");

    let configure = ConfigureBuilder::new()
        .definition(social_definition())
        .build(&alice_keyring)
        .await
        .expect("should create configure");
    endpoint::handle(ALICE_DID, configure, &provider).await.expect("should configure");

    // --------------------------------------------------
    // Bob creates a post on Alice's node.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: SOCIAL.to_string(),
            protocol_path: "post".to_string(),
        })
        .schema(POST_SCHEMA)
        .data(Data::from(b"{\"text\": \"hello\"}".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // A write with the wrong schema for the type is rejected.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: SOCIAL.to_string(),
            protocol_path: "post".to_string(),
        })
        .schema("http://example.com/schemas/other")
        .data(Data::from(b"{}".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
    assert!(e.starts_with("ProtocolAuthorizationInvalidSchema"));

    // --------------------------------------------------
    // A write at an undeclared path is rejected.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: SOCIAL.to_string(),
            protocol_path: "comment".to_string(),
        })
        .data(Data::from(b"{}".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
    assert!(e.starts_with("ProtocolAuthorizationMissingRuleSet"));

    // --------------------------------------------------
    // A write with a disallowed data format is rejected.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: SOCIAL.to_string(),
            protocol_path: "post".to_string(),
        })
        .schema(POST_SCHEMA)
        .data_format("image/png")
        .data(Data::from(b"bytes".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
    assert!(e.starts_with("ProtocolAuthorizationIncorrectDataFormat"));

    // --------------------------------------------------
    // A write to an unconfigured protocol is rejected.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "http://example.com/unknown".to_string(),
            protocol_path: "post".to_string(),
        })
        .data(Data::from(b"{}".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let Err(Error::NotFound(e)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be NotFound");
    };
    assert!(e.starts_with("ProtocolAuthorizationProtocolNotFound"));
}

// Without a matching action rule, only the tenant may write.
#[tokio::test]
async fn protocol_write_no_rule() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(BOB_DID).expect("should get Bob's keyring");

    let configure = ConfigureBuilder::new()
        .definition(friends_definition())
        .build(&alice_keyring)
        .await
        .expect("should create configure");
    endpoint::handle(ALICE_DID, configure, &provider).await.expect("should configure");

    // the friend rule set defines no actions: Alice may write role records,
    // Bob may not
    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "http://example.com/friends".to_string(),
            protocol_path: "friend".to_string(),
        })
        .recipient(BOB_DID)
        .data(Data::from(b"{}".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "http://example.com/friends".to_string(),
            protocol_path: "friend".to_string(),
        })
        .recipient(CAROL_DID)
        .data(Data::from(b"{}".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
    assert!(e.starts_with("ProtocolAuthorizationActionNotAllowed"));
}

// A role holder may invoke the role for the actions it grants; everyone
// else is rejected.
#[tokio::test]
async fn protocol_role_invocation() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(BOB_DID).expect("should get Bob's keyring");
    let carol_keyring = provider.keyring(CAROL_DID).expect("should get Carol's keyring");

    let configure = ConfigureBuilder::new()
        .definition(friends_definition())
        .build(&alice_keyring)
        .await
        .expect("should create configure");
    endpoint::handle(ALICE_DID, configure, &provider).await.expect("should configure");

    // --------------------------------------------------
    // Alice makes Bob a friend.
    // --------------------------------------------------
    let role_record = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "http://example.com/friends".to_string(),
            protocol_path: "friend".to_string(),
        })
        .recipient(BOB_DID)
        .data(Data::from(b"{}".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, role_record, &provider).await.expect("should write");

    // --------------------------------------------------
    // Bob writes a post invoking the friend role.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "http://example.com/friends".to_string(),
            protocol_path: "post".to_string(),
        })
        .schema(POST_SCHEMA)
        .protocol_role("friend")
        .data(Data::from(b"{\"text\": \"from a friend\"}".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Bob queries posts through the role.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(
            RecordsFilter::new()
                .protocol("http://example.com/friends")
                .protocol_path("post"),
        )
        .protocol_role("friend")
        .build(&bob_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 1);

    // --------------------------------------------------
    // Carol holds no friend record; her invocation fails.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "http://example.com/friends".to_string(),
            protocol_path: "post".to_string(),
        })
        .schema(POST_SCHEMA)
        .protocol_role("friend")
        .data(Data::from(b"{}".to_vec()))
        .build(&carol_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(_)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
}

// Record tags are validated against the rule set's tag schema.
#[tokio::test]
async fn protocol_tag_schema() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    let definition = Definition::new("http://example.com/tagged")
        .published(true)
        .add_type("item", ProtocolType::default())
        .add_rule(
            "item",
            RuleSet {
                actions: Some(vec![ActionRule {
                    who: Some(Actor::Anyone),
                    can: vec![Action::Create],
                    ..ActionRule::default()
                }]),
                tags: Some(Tags {
                    required_tags: Some(vec!["status".to_string()]),
                    allow_undefined_tags: Some(false),
                    properties: [(
                        "status".to_string(),
                        json!({"type": "string", "enum": ["draft", "final"]}),
                    )]
                    .into(),
                }),
                ..RuleSet::default()
            },
        );

    let configure = ConfigureBuilder::new()
        .definition(definition)
        .build(&alice_keyring)
        .await
        .expect("should create configure");
    endpoint::handle(ALICE_DID, configure, &provider).await.expect("should configure");

    // a conforming tag set is accepted
    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "http://example.com/tagged".to_string(),
            protocol_path: "item".to_string(),
        })
        .add_tag("status", "draft")
        .data(Data::from(b"{}".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // a value outside the enum is rejected
    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "http://example.com/tagged".to_string(),
            protocol_path: "item".to_string(),
        })
        .add_tag("status", "bogus")
        .data(Data::from(b"{}".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
    assert!(e.starts_with("ProtocolAuthorizationTagsInvalidSchema"));

    // a missing required tag is rejected
    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "http://example.com/tagged".to_string(),
            protocol_path: "item".to_string(),
        })
        .data(Data::from(b"{}".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
    assert!(e.starts_with("ProtocolAuthorizationTagsInvalidSchema"));
}
