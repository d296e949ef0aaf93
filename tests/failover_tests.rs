mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Proto, answer, spawn_upstream};
use muninn::codec::Message;
use muninn::{QueryOptions, RecordType, ResolveOptions, Resolver, ResolverConfig, SystemConfig, SystemConfigLoader};

/// Hands the resolver a fixed nameserver list, standing in for the
/// platform's resolv.conf discovery.
struct StaticConfig(Vec<String>);

#[async_trait::async_trait]
impl SystemConfigLoader for StaticConfig {
    async fn load(&self) -> muninn::Result<SystemConfig> {
        Ok(SystemConfig {
            nameservers: self.0.clone(),
            timeout: Duration::from_millis(250),
            attempts: 2,
        })
    }
}

#[tokio::test]
async fn walk_moves_past_dead_servers() {
    let dead = spawn_upstream(Arc::new(|_query: &Message, _proto: Proto| None)).await;
    let live = spawn_upstream(Arc::new(|query: &Message, _proto: Proto| {
        Some(answer(query, RecordType::A, 60, "5.6.7.8"))
    }))
    .await;

    let config = ResolverConfig {
        system_config_loader: Arc::new(StaticConfig(vec![
            dead.addr.to_string(),
            live.addr.to_string(),
        ])),
        ..Default::default()
    };
    let resolver = Resolver::with_config(config).await.unwrap();

    let answers = resolver
        .resolve(
            "host.example",
            ResolveOptions {
                types: vec![RecordType::A],
                hosts: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(answers[0].data, "5.6.7.8");
    // The dead server was tried first and timed out.
    assert_eq!(dead.udp_queries(), 1);
    assert_eq!(live.udp_queries(), 1);
}

#[tokio::test]
async fn query_rewrites_to_tcp_after_a_udp_timeout() {
    // Silent over UDP, answering over TCP: the low-level path retries the
    // whole query with the endpoint forced to TCP.
    let upstream = spawn_upstream(Arc::new(|query: &Message, proto: Proto| match proto {
        Proto::Udp => None,
        Proto::Tcp => Some(answer(query, RecordType::A, 60, "10.1.1.1")),
    }))
    .await;
    let resolver = Resolver::new().await.unwrap();

    let answers = resolver
        .query(
            "host.example",
            RecordType::A,
            QueryOptions {
                server: Some(upstream.udp_endpoint()),
                timeout: Some(Duration::from_millis(200)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(answers[0].data, "10.1.1.1");
    assert_eq!(upstream.udp_queries(), 1);
    assert_eq!(upstream.tcp_queries(), 1);
}

#[tokio::test]
async fn tcp_only_servers_skip_udp_entirely() {
    let upstream = spawn_upstream(Arc::new(|query: &Message, proto: Proto| match proto {
        Proto::Udp => None,
        Proto::Tcp => Some(answer(query, RecordType::A, 60, "10.2.2.2")),
    }))
    .await;
    let resolver = Resolver::new().await.unwrap();

    let answers = resolver
        .resolve(
            "host.example",
            ResolveOptions {
                types: vec![RecordType::A],
                server: Some(upstream.tcp_endpoint()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(answers[0].data, "10.2.2.2");
    assert_eq!(upstream.udp_queries(), 0);
    assert_eq!(upstream.tcp_queries(), 1);
}

#[tokio::test]
async fn established_tcp_connections_are_reused() {
    let upstream = spawn_upstream(Arc::new(|query: &Message, proto: Proto| match proto {
        Proto::Udp => None,
        Proto::Tcp => Some(answer(query, RecordType::A, 60, "10.3.3.3")),
    }))
    .await;
    let resolver = Resolver::new().await.unwrap();
    let options = ResolveOptions {
        types: vec![RecordType::A],
        server: Some(upstream.tcp_endpoint()),
        cache: false,
        ..Default::default()
    };

    resolver.resolve("one.example", options.clone()).await.unwrap();
    resolver.resolve("two.example", options).await.unwrap();
    assert_eq!(upstream.tcp_queries(), 2);
}
