mod common;

use std::sync::Arc;

use common::{Proto, answer, spawn_upstream};
use muninn::codec::Message;
use muninn::{QueryOptions, RecordType, ResolveError, Resolver};

#[tokio::test]
async fn query_follows_cname_chains() {
    let upstream = spawn_upstream(Arc::new(|query: &Message, _proto: Proto| {
        let qname = query.questions[0].name();
        match qname.as_str() {
            "a.example" => Some(answer(query, RecordType::CNAME, 300, "b.example")),
            "b.example" => Some(answer(query, RecordType::A, 60, "10.0.0.2")),
            _ => None,
        }
    }))
    .await;
    let resolver = Resolver::new().await.unwrap();

    let answers = resolver
        .query(
            "a.example",
            RecordType::A,
            QueryOptions {
                server: Some(upstream.udp_endpoint()),
                recurse: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(answers[0].data, "10.0.0.2");
    assert_eq!(answers[0].record_type, RecordType::A);
    // Exactly two round trips: the alias, then its target.
    assert_eq!(upstream.udp_queries(), 2);
}

#[tokio::test]
async fn query_without_recursion_returns_the_alias() {
    let upstream = spawn_upstream(Arc::new(|query: &Message, _proto: Proto| {
        Some(answer(query, RecordType::CNAME, 300, "b.example"))
    }))
    .await;
    let resolver = Resolver::new().await.unwrap();

    let answers = resolver
        .query(
            "a.example",
            RecordType::A,
            QueryOptions {
                server: Some(upstream.udp_endpoint()),
                recurse: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].record_type, RecordType::CNAME);
    assert_eq!(answers[0].data, "b.example");
    assert_eq!(upstream.udp_queries(), 1);
}

#[tokio::test]
async fn cname_queries_never_recurse() {
    let upstream = spawn_upstream(Arc::new(|query: &Message, _proto: Proto| {
        Some(answer(query, RecordType::CNAME, 300, "b.example"))
    }))
    .await;
    let resolver = Resolver::new().await.unwrap();

    let answers = resolver
        .query(
            "a.example",
            RecordType::CNAME,
            QueryOptions {
                server: Some(upstream.udp_endpoint()),
                recurse: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].data, "b.example");
    assert_eq!(upstream.udp_queries(), 1);
}

#[tokio::test]
async fn overlong_alias_chains_fail() {
    // Every hop answers with another alias; the chain never terminates.
    let upstream = spawn_upstream(Arc::new(|query: &Message, _proto: Proto| {
        Some(answer(query, RecordType::CNAME, 300, "loop.example"))
    }))
    .await;
    let resolver = Resolver::new().await.unwrap();

    let err = resolver
        .query(
            "start.example",
            RecordType::A,
            QueryOptions {
                server: Some(upstream.udp_endpoint()),
                recurse: true,
                cache: false,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(
        matches!(err, ResolveError::Resolution(ref msg) if msg == "CNAME or DNAME chain too long")
    );
    // The original lookup plus 30 follows.
    assert_eq!(upstream.udp_queries(), 31);
}

#[tokio::test]
async fn query_follows_dname_redirections() {
    let upstream = spawn_upstream(Arc::new(|query: &Message, _proto: Proto| {
        let qname = query.questions[0].name();
        match qname.as_str() {
            "old.example" => Some(answer(query, RecordType::DNAME, 300, "new.example")),
            "new.example" => Some(answer(query, RecordType::AAAA, 60, "2001:db8::2")),
            _ => None,
        }
    }))
    .await;
    let resolver = Resolver::new().await.unwrap();

    let answers = resolver
        .query(
            "old.example",
            RecordType::AAAA,
            QueryOptions {
                server: Some(upstream.udp_endpoint()),
                recurse: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(answers[0].data, "2001:db8::2");
    assert_eq!(answers[0].record_type, RecordType::AAAA);
}
