//! Request dispatch: queue behavior, response interpretation, keyspace and
//! schema-change handling, and multi-host failover.

mod common;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use cassium::cluster::control_connection::SchemaAgreementObserver;
use cassium::errors::ExecutionError;
use cassium::policies::timestamp_generator::MonotonicTimestampGenerator;
use cassium::{Request, Response, Session, SessionConfig};
use common::{HandshakeBehavior, MockNode, MOCK_PREPARED_ID};
use futures::future::join_all;

fn config_for(node: &MockNode) -> SessionConfig {
    let mut config = SessionConfig::new();
    config.add_contact_point(node.contact_point());
    config
}

#[tokio::test]
async fn queries_resolve_with_the_server_response() {
    common::setup_tracing();
    let node = MockNode::start(HandshakeBehavior::Ready).await;
    let session = Session::new();

    let mut config = config_for(&node);
    config.timestamp_generator = Some(Arc::new(MonotonicTimestampGenerator::new()));
    session.connect(config, None).await.unwrap();

    let response = session
        .execute(Request::query("SELECT pk FROM ks.table"))
        .await
        .unwrap();
    assert!(matches!(response, Response::Void));

    session.close().await.unwrap();
}

#[tokio::test]
async fn use_statements_surface_the_keyspace_change() {
    common::setup_tracing();
    let node = MockNode::start(HandshakeBehavior::Ready).await;
    let session = Session::new();
    session.connect(config_for(&node), None).await.unwrap();

    let response = session.execute(Request::query("USE metrics")).await.unwrap();
    match response {
        Response::SetKeyspace(keyspace) => assert_eq!(keyspace, "metrics"),
        other => panic!("unexpected response: {other:?}"),
    }

    session.close().await.unwrap();
}

#[tokio::test]
async fn prepare_returns_and_records_the_prepared_id() {
    common::setup_tracing();
    let node = MockNode::start(HandshakeBehavior::Ready).await;
    let session = Session::new();
    session.connect(config_for(&node), None).await.unwrap();

    let response = session
        .prepare("SELECT pk FROM ks.table WHERE pk = ?")
        .await
        .unwrap();
    match response {
        Response::Prepared { id, .. } => assert_eq!(&id[..], MOCK_PREPARED_ID),
        other => panic!("unexpected response: {other:?}"),
    }

    let recorded = session.prepared_ids();
    assert!(recorded.iter().any(|id| &id[..] == MOCK_PREPARED_ID));

    session.close().await.unwrap();
}

#[tokio::test]
async fn schema_changes_complete_after_agreement() {
    common::setup_tracing();
    let node = MockNode::start(HandshakeBehavior::Ready).await;
    let session = Session::new();
    session.connect(config_for(&node), None).await.unwrap();

    let response = session
        .execute(Request::query("CREATE TABLE ks.t (pk int PRIMARY KEY)"))
        .await
        .unwrap();
    assert!(matches!(response, Response::SchemaChange { .. }));

    session.close().await.unwrap();
}

#[tokio::test]
async fn schema_agreement_wait_is_bounded() {
    common::setup_tracing();

    #[derive(Debug)]
    struct NeverAgrees;

    #[async_trait::async_trait]
    impl SchemaAgreementObserver for NeverAgrees {
        async fn is_agreed(&self) -> bool {
            false
        }
    }

    let node = MockNode::start(HandshakeBehavior::Ready).await;
    let session = Session::new();
    let mut config = config_for(&node);
    config.schema_agreement = Arc::new(NeverAgrees);
    config.max_schema_wait_time = Duration::from_millis(100);
    config.schema_agreement_interval = Duration::from_millis(20);
    session.connect(config, None).await.unwrap();

    let started = std::time::Instant::now();
    let response = session
        .execute(Request::query("DROP TABLE ks.t"))
        .await
        .unwrap();
    assert!(matches!(response, Response::SchemaChange { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));

    session.close().await.unwrap();
}

#[tokio::test]
async fn database_errors_fail_the_request() {
    common::setup_tracing();
    let node = MockNode::start(HandshakeBehavior::Ready).await;
    let session = Session::new();
    session.connect(config_for(&node), None).await.unwrap();

    let result = session
        .execute(Request::query("syntax-error SELECT"))
        .await;
    match result {
        Err(ExecutionError::Db { code, message }) => {
            assert_eq!(code, 0x2000);
            assert_eq!(message, "mock syntax error");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    session.close().await.unwrap();
}

#[tokio::test]
async fn overflowing_the_queue_fails_the_excess_requests() {
    common::setup_tracing();
    let node = MockNode::start(HandshakeBehavior::Ready).await;
    let session = Session::new();
    let mut config = config_for(&node);
    config.request_queue_capacity = 2;
    session.connect(config, None).await.unwrap();

    // On the test's current-thread runtime no processor can drain between
    // these enqueues, so exactly the queue capacity is accepted.
    let futures: Vec<_> = (0..5)
        .map(|_| session.execute(Request::query("SELECT 1")))
        .collect();
    let results = join_all(futures).await;

    let (accepted, rejected): (Vec<_>, Vec<_>) = results.into_iter().partition(Result::is_ok);
    assert_eq!(accepted.len(), 2);
    assert_eq!(rejected.len(), 3);
    assert!(rejected
        .iter()
        .all(|r| matches!(r, Err(ExecutionError::RequestQueueFull))));

    session.close().await.unwrap();
}

#[tokio::test]
async fn requests_spread_across_processors_and_connections() {
    common::setup_tracing();
    let node = MockNode::start(HandshakeBehavior::Ready).await;
    let session = Session::new();
    let mut config = config_for(&node);
    config.num_io_workers = 2;
    config.connections_per_host = NonZeroUsize::new(2).unwrap();
    session.connect(config, None).await.unwrap();

    // Two processors with two connections each towards the single host.
    assert!(session.get_metrics().get_total_connections() >= 4);

    let futures: Vec<_> = (0..20)
        .map(|_| session.execute(Request::query("SELECT pk FROM ks.table")))
        .collect();
    for result in join_all(futures).await {
        assert!(matches!(result.unwrap(), Response::Void));
    }

    let snapshot = session.get_metrics().get_snapshot().unwrap();
    assert!(snapshot.max > 0);

    session.close().await.unwrap();
}

#[tokio::test]
async fn losing_one_host_does_not_fail_dispatch() {
    common::setup_tracing();
    let node_a = MockNode::start(HandshakeBehavior::Ready).await;
    let node_b = MockNode::start(HandshakeBehavior::Ready).await;

    let session = Session::new();
    let mut config = SessionConfig::new();
    config.add_contact_point(node_a.contact_point());
    config.add_contact_point(node_b.contact_point());
    session.connect(config, None).await.unwrap();

    // Kill one node; its connections drop and its pools drain.
    drop(node_b);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Query plans still include the dead host; dispatch skips it because
    // its pool has no usable connection.
    for _ in 0..10 {
        let response = session
            .execute(Request::query("SELECT pk FROM ks.table"))
            .await
            .unwrap();
        assert!(matches!(response, Response::Void));
    }

    session.close().await.unwrap();
}
