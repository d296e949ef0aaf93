mod common;

use std::sync::Arc;

use common::{Proto, answer, spawn_upstream};
use muninn::codec::Message;
use muninn::{QueryOptions, RecordType, ResolveOptions, Resolver};

#[tokio::test]
async fn concurrent_identical_resolves_share_one_exchange() {
    let upstream = spawn_upstream(Arc::new(|query: &Message, _proto: Proto| {
        Some(answer(query, RecordType::A, 60, "1.2.3.4"))
    }))
    .await;
    let resolver = Resolver::new().await.unwrap();
    let options = ResolveOptions {
        types: vec![RecordType::A],
        server: Some(upstream.udp_endpoint()),
        cache: false,
        ..Default::default()
    };

    let (first, second, third) = tokio::join!(
        resolver.resolve("host.example", options.clone()),
        resolver.resolve("host.example", options.clone()),
        resolver.resolve("HOST.example", options.clone()),
    );

    let first = first.unwrap();
    assert_eq!(first[0].data, "1.2.3.4");
    assert_eq!(second.unwrap(), first);
    // Case differences coalesce too.
    assert_eq!(third.unwrap(), first);
    assert_eq!(upstream.udp_queries(), 1);
}

#[tokio::test]
async fn distinct_names_do_not_coalesce() {
    let upstream = spawn_upstream(Arc::new(|query: &Message, _proto: Proto| {
        Some(answer(query, RecordType::A, 60, "1.2.3.4"))
    }))
    .await;
    let resolver = Resolver::new().await.unwrap();
    let options = ResolveOptions {
        types: vec![RecordType::A],
        server: Some(upstream.udp_endpoint()),
        cache: false,
        ..Default::default()
    };

    let (a, b) = tokio::join!(
        resolver.resolve("one.example", options.clone()),
        resolver.resolve("two.example", options.clone()),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(upstream.udp_queries(), 2);
}

#[tokio::test]
async fn concurrent_identical_queries_share_one_exchange() {
    let upstream = spawn_upstream(Arc::new(|query: &Message, _proto: Proto| {
        Some(answer(query, RecordType::A, 60, "9.9.9.9"))
    }))
    .await;
    let resolver = Resolver::new().await.unwrap();
    let options = QueryOptions {
        server: Some(upstream.udp_endpoint()),
        cache: false,
        ..Default::default()
    };

    let (first, second) = tokio::join!(
        resolver.query("host.example", RecordType::A, options.clone()),
        resolver.query("host.example", RecordType::A, options.clone()),
    );
    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(upstream.udp_queries(), 1);
}

#[tokio::test]
async fn sequential_lookups_after_settlement_query_again() {
    let upstream = spawn_upstream(Arc::new(|query: &Message, _proto: Proto| {
        Some(answer(query, RecordType::A, 60, "1.2.3.4"))
    }))
    .await;
    let resolver = Resolver::new().await.unwrap();
    let options = ResolveOptions {
        types: vec![RecordType::A],
        server: Some(upstream.udp_endpoint()),
        cache: false,
        ..Default::default()
    };

    resolver.resolve("host.example", options.clone()).await.unwrap();
    resolver.resolve("host.example", options).await.unwrap();
    // With caching off and no overlap, each lookup pays its own exchange.
    assert_eq!(upstream.udp_queries(), 2);
}
