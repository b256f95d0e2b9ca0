//! Records Query

use std::collections::BTreeSet;

use dwn_core::endpoint;
use dwn_core::provider::KeyStore;
use dwn_core::records::{
    Data, QueryBuilder, QueryReplyEntry, RecordsFilter, TagFilter, WriteBuilder,
};
use dwn_core::store::index::RangeFilter;
use http::StatusCode;
use serde_json::json;
use test_node::key_store::{ALICE_DID, BOB_DID};
use test_node::provider::ProviderImpl;

fn tag_values(entries: &[QueryReplyEntry], tag: &str) -> BTreeSet<String> {
    entries
        .iter()
        .filter_map(|entry| {
            entry.write.descriptor.tags.as_ref().and_then(|tags| tags.get(tag)).cloned()
        })
        .map(|value| value.as_str().map_or_else(|| value.to_string(), ToString::to_string))
        .collect()
}

// Should evaluate string tag ranges against the lexicographic encoding.
#[tokio::test]
async fn tag_range_string() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Write four records tagged with first names.
    // --------------------------------------------------
    for name in ["alice", "bob", "carol", "daniel"] {
        let write = WriteBuilder::new()
            .schema("post")
            .add_tag("firstName", name)
            .data(Data::from(format!("{name}'s post").into_bytes()))
            .build(&alice_keyring)
            .await
            .expect("should create write");
        let reply = endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");
        assert_eq!(reply.status.code, StatusCode::ACCEPTED);
    }

    // --------------------------------------------------
    // gte "a", lt "c" => { alice, bob }
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("post").add_tag(
            "firstName",
            TagFilter::Range(RangeFilter {
                gte: Some(json!("a")),
                lt: Some(json!("c")),
                ..RangeFilter::default()
            }),
        ))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(tag_values(&entries, "firstName"), BTreeSet::from(["alice".into(), "bob".into()]));

    // --------------------------------------------------
    // gt "bob", lte "daniel" => { carol, daniel }
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("post").add_tag(
            "firstName",
            TagFilter::Range(RangeFilter {
                gt: Some(json!("bob")),
                lte: Some(json!("daniel")),
                ..RangeFilter::default()
            }),
        ))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(
        tag_values(&entries, "firstName"),
        BTreeSet::from(["carol".into(), "daniel".into()])
    );

    // --------------------------------------------------
    // gte "carol" => { carol, daniel }
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("post").add_tag(
            "firstName",
            TagFilter::Range(RangeFilter {
                gte: Some(json!("carol")),
                ..RangeFilter::default()
            }),
        ))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(
        tag_values(&entries, "firstName"),
        BTreeSet::from(["carol".into(), "daniel".into()])
    );

    // --------------------------------------------------
    // A degenerate range (gt "bob", lte "bob") matches nothing: the `lte`
    // probe must not readmit the value the lower bound excludes.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("post").add_tag(
            "firstName",
            TagFilter::Range(RangeFilter {
                gt: Some(json!("bob")),
                lte: Some(json!("bob")),
                ..RangeFilter::default()
            }),
        ))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    assert!(reply.body.is_none(), "degenerate range should match no records");
}

// Should evaluate numeric tag ranges, with negatives sorting below
// positives.
#[tokio::test]
async fn tag_range_numeric() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    for score in [-5i64, 0, 65, 75, 80, 100] {
        let write = WriteBuilder::new()
            .schema("score")
            .add_tag("score", score)
            .data(Data::from(format!("score {score}").into_bytes()))
            .build(&alice_keyring)
            .await
            .expect("should create write");
        let reply = endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");
        assert_eq!(reply.status.code, StatusCode::ACCEPTED);
    }

    // gte 75 => { 75, 80, 100 }
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("score").add_tag(
            "score",
            TagFilter::Range(RangeFilter {
                gte: Some(json!(75)),
                ..RangeFilter::default()
            }),
        ))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(tag_values(&entries, "score"), BTreeSet::from(["75".into(), "80".into(), "100".into()]));

    // gte 75, lt 100 => { 75, 80 }
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("score").add_tag(
            "score",
            TagFilter::Range(RangeFilter {
                gte: Some(json!(75)),
                lt: Some(json!(100)),
                ..RangeFilter::default()
            }),
        ))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(tag_values(&entries, "score"), BTreeSet::from(["75".into(), "80".into()]));

    // lte 0 => { -5, 0 }
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("score").add_tag(
            "score",
            TagFilter::Range(RangeFilter {
                lte: Some(json!(0)),
                ..RangeFilter::default()
            }),
        ))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(tag_values(&entries, "score"), BTreeSet::from(["-5".into(), "0".into()]));
}

// Should treat `startsWith` as a bounded prefix scan, unlike a plain `gte`.
#[tokio::test]
async fn tag_starts_with() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");

    for tag in ["string-foo", "string-bar", "zaz-string"] {
        let write = WriteBuilder::new()
            .schema("tagged")
            .add_tag("stringTag", tag)
            .data(Data::from(tag.as_bytes().to_vec()))
            .build(&alice_keyring)
            .await
            .expect("should create write");
        let reply = endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");
        assert_eq!(reply.status.code, StatusCode::ACCEPTED);
    }

    // startsWith "string-" matches the two prefixed tags only
    let query = QueryBuilder::new()
        .filter(
            RecordsFilter::new()
                .schema("tagged")
                .add_tag("stringTag", TagFilter::StartsWith("string-".to_string())),
        )
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(
        tag_values(&entries, "stringTag"),
        BTreeSet::from(["string-bar".into(), "string-foo".into()])
    );

    // gte "string-" matches everything sorting at or above the prefix
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("tagged").add_tag(
            "stringTag",
            TagFilter::Range(RangeFilter {
                gte: Some(json!("string-")),
                ..RangeFilter::default()
            }),
        ))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(
        tag_values(&entries, "stringTag"),
        BTreeSet::from(["string-bar".into(), "string-foo".into(), "zaz-string".into()])
    );
}

// Should return only published records to anonymous and non-owner callers.
#[tokio::test]
async fn published_visibility() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(BOB_DID).expect("should get Bob's keyring");

    let published = WriteBuilder::new()
        .schema("note")
        .published(true)
        .data(Data::from(b"published note".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, published.clone(), &provider).await.expect("should write");

    let private = WriteBuilder::new()
        .schema("note")
        .data(Data::from(b"private note".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, private, &provider).await.expect("should write");

    // the tenant sees both
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("note"))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 2);

    // an anonymous caller sees the published record only
    let query = QueryBuilder::new().filter(RecordsFilter::new().schema("note")).build_anonymous();
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.record_id, published.record_id);

    // so does Bob, with no other claim to the records
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("note"))
        .build(&bob_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.record_id, published.record_id);
}

// Data written under one tenant must never be observable under another,
// even when the data (and so its CID) is identical.
#[tokio::test]
async fn tenant_isolation() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(BOB_DID).expect("should get Bob's keyring");

    let data = b"identical bytes on both tenants";

    let alice_write = WriteBuilder::new()
        .schema("shared")
        .data(Data::from(data.to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, alice_write, &provider).await.expect("should write");

    let bob_write = WriteBuilder::new()
        .schema("shared")
        .data(Data::from(data.to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    endpoint::handle(BOB_DID, bob_write.clone(), &provider).await.expect("should write");

    // Bob's tenant holds only Bob's record
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("shared"))
        .build(&bob_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(BOB_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.record_id, bob_write.record_id);
}
