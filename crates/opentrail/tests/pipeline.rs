//! End-to-end pipeline tests: TCP ingestion through parsing, batched
//! storage, HTTP query, and real-time fan-out, wired the way `main` wires
//! the production process.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tower::ServiceExt;

use opentrail::config::Config;
use opentrail::metrics::{ConnectionStats, ServiceStats, StorageStats};
use opentrail::model::SearchQuery;
use opentrail::parser::{PipelineParser, TemplateParser};
use opentrail::server::http::build_router;
use opentrail::server::tcp::{TcpServer, TcpServerConfig};
use opentrail::service::{LogService, ServiceConfig};
use opentrail::state::AppState;
use opentrail::storage::{Storage, StorageConfig};

struct Stack {
    state: AppState,
    tcp_addr: std::net::SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    _dir: TempDir,
}

async fn start_stack() -> Stack {
    let dir = TempDir::new().unwrap();
    let mut storage_config = StorageConfig::new(dir.path().join("logs.db"));
    storage_config.reset_on_startup = true;
    storage_config.batch_size = 1;
    let storage = Arc::new(Storage::open(storage_config, StorageStats::new()).unwrap());

    let config = Config::default();
    let parser = Arc::new(PipelineParser::new(
        TemplateParser::new(&config.log_format).unwrap(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = LogService::start(
        ServiceConfig {
            batch_size: 1,
            batch_timeout: Duration::from_millis(20),
            ..ServiceConfig::default()
        },
        parser,
        storage.clone(),
        ServiceStats::new(),
        shutdown_rx,
    );

    let connection_stats = ConnectionStats::new();
    let tcp_server = TcpServer::bind(
        TcpServerConfig::new(0, config.max_connections),
        service.clone(),
        connection_stats.clone(),
    )
    .await
    .unwrap();
    let tcp_addr = tcp_server.local_addr().unwrap();
    tokio::spawn(tcp_server.run(shutdown_tx.subscribe()));

    let state = AppState::new(config, service, storage, connection_stats, shutdown_tx.clone());
    Stack {
        state,
        tcp_addr,
        shutdown_tx,
        _dir: dir,
    }
}

async fn send_lines(addr: std::net::SocketAddr, lines: &[&str]) {
    let mut client = TcpStream::connect(addr).await.unwrap();
    for line in lines {
        client.write_all(line.as_bytes()).await.unwrap();
        client.write_all(b"\n").await.unwrap();
    }
    client.shutdown().await.unwrap();
}

async fn wait_for_stored(state: &AppState, count: usize) {
    for _ in 0..120 {
        let found = state
            .storage
            .search(&SearchQuery {
                limit: count + 10,
                ..SearchQuery::default()
            })
            .unwrap();
        if found.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} stored entries", count);
}

async fn query(state: &AppState, uri: &str) -> serde_json::Value {
    let response = build_router(state.clone())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn template_line_over_tcp_is_queryable_by_tracking_id() {
    let stack = start_stack().await;

    send_lines(
        stack.tcp_addr,
        &["2024-01-01T10:00:00Z|INFO|u1|User logged in"],
    )
    .await;
    wait_for_stored(&stack.state, 1).await;

    let body = query(&stack.state, "/api/logs?tracking_id=u1").await;
    assert_eq!(body["success"], true);
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["message"], "User logged in");
    assert_eq!(data[0]["msg_id"], "u1");

    stack.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn rfc5424_line_over_tcp_keeps_its_header_fields() {
    let stack = start_stack().await;

    send_lines(
        stack.tcp_addr,
        &["<165>1 2023-10-15T14:30:45.123Z web01 nginx 1234 access - User login successful"],
    )
    .await;
    wait_for_stored(&stack.state, 1).await;

    let body = query(&stack.state, "/api/logs?hostname=web01&app_name=nginx").await;
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["facility"], 20);
    assert_eq!(data[0]["severity"], 5);
    assert_eq!(data[0]["proc_id"], "1234");
    assert_eq!(data[0]["msg_id"], "access");
    assert_eq!(data[0]["message"], "User login successful");

    stack.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn two_subscribers_each_see_an_ingested_entry_once() {
    let stack = start_stack().await;

    let mut first = stack.state.service.subscribe();
    let mut second = stack.state.service.subscribe();

    send_lines(stack.tcp_addr, &["2024-01-01T10:00:00Z|WARN|s1|fan out"]).await;

    for sub in [&mut first, &mut second] {
        let entry = tokio::time::timeout(Duration::from_secs(2), sub.receiver.recv())
            .await
            .expect("subscriber timed out")
            .expect("subscriber channel closed");
        assert_eq!(entry.message, "fan out");
        assert_eq!(entry.severity, 4);
    }
    for sub in [&mut first, &mut second] {
        assert!(
            tokio::time::timeout(Duration::from_millis(100), sub.receiver.recv())
                .await
                .is_err(),
            "entry delivered more than once"
        );
    }

    stack.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn mixed_formats_interleave_through_one_connection() {
    let stack = start_stack().await;

    send_lines(
        stack.tcp_addr,
        &[
            "2024-01-01T10:00:00Z|ERROR|m1|template error",
            "<13>1 2024-01-01T10:00:01Z host1 app1 7 m2 - syslog notice",
            "free-form line with no shape",
        ],
    )
    .await;
    wait_for_stored(&stack.state, 3).await;

    let body = query(&stack.state, "/api/logs?level=error").await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let body = query(&stack.state, "/api/logs?hostname=host1").await;
    assert_eq!(body["data"][0]["message"], "syslog notice");

    // The shapeless line survives as an UNKNOWN-level entry with the raw text.
    let body = query(&stack.state, "/api/logs?text=shape").await;
    assert_eq!(body["data"][0]["message"], "free-form line with no shape");

    stack.shutdown_tx.send(true).unwrap();
}
