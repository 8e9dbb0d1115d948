//! Connection-level tests over in-memory byte streams.
//!
//! Each client talks to `ProtocolServer::serve_connection` through a
//! `tokio::io::duplex` pair wrapped in the length-framed transport, so these
//! cover what happens to in-flight calls when a session or the whole server
//! goes away.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use dcc_bridge::bridge::{self, CallResult, HostEnd, Outcome};
use dcc_bridge::config::Config;
use dcc_bridge::host::HostLoop;
use dcc_bridge::registry::ToolRegistry;
use dcc_bridge::rpc::transport::{self, FrameSink, FrameSource, FramedReader, FramedWriter};
use dcc_bridge::rpc::ProtocolServer;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Harness
// =============================================================================

struct Client {
    source: FramedReader<ReadHalf<DuplexStream>>,
    sink: FramedWriter<WriteHalf<DuplexStream>>,
}

impl Client {
    async fn send(&mut self, request: Value) {
        self.sink.send_frame(&request.to_string()).await.unwrap();
    }

    async fn recv(&mut self) -> Option<Value> {
        tokio::time::timeout(WAIT, self.source.next_frame())
            .await
            .unwrap()
            .unwrap()
            .map(|frame| serde_json::from_str(&frame).unwrap())
    }

    async fn initialize(&mut self) {
        self.send(json!({"id": 0, "method": "initialize"})).await;
        let reply = self.recv().await.unwrap();
        assert_eq!(reply["result"]["status"], "ok");
    }
}

fn connect(server: &Arc<ProtocolServer>) -> (Client, JoinHandle<()>) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(server_io);
    let (source, sink) = transport::framed(read, write, 1 << 20);
    let server = Arc::clone(server);
    let task = tokio::spawn(async move { server.serve_connection(source, sink).await });

    let (read, write) = tokio::io::split(client_io);
    let (source, sink) = transport::framed(read, write, 1 << 20);
    (Client { source, sink }, task)
}

fn registry() -> Arc<ToolRegistry> {
    let registry = Arc::new(ToolRegistry::new());
    registry.register("test.echo", "", json!({}), |_, params| Ok(params));
    registry.register("test.slow", "", json!({}), |_, params| {
        std::thread::sleep(Duration::from_millis(100));
        Ok(params)
    });
    registry
}

/// A server whose host end is handed back to the test to drive by hand.
fn detached() -> (Arc<ProtocolServer>, HostEnd) {
    let (server_end, host_end) = bridge::channel();
    let server = ProtocolServer::start(registry(), server_end, &Config::default());
    (server, host_end)
}

fn with_host() -> (Arc<ProtocolServer>, HostLoop) {
    let mut config = Config::default();
    config.scheduler.tick_interval_ms = 1;
    let registry = registry();
    let (server_end, host_end) = bridge::channel();
    let host_loop = HostLoop::spawn(
        || None,
        Arc::clone(&registry),
        host_end,
        config.scheduler.clone(),
        Duration::ZERO,
    )
    .unwrap();
    (ProtocolServer::start(registry, server_end, &config), host_loop)
}

fn call(id: i64, tool: &str, params: Value) -> Value {
    json!({"id": id, "method": "callTool", "params": {"name": tool, "params": params}})
}

async fn until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

// =============================================================================
// Session close
// =============================================================================

#[tokio::test]
async fn test_closed_session_cancels_call_and_discards_late_result() {
    let (server, mut host) = detached();
    let (mut client, task) = connect(&server);
    client.initialize().await;
    client.send(call(1, "test.echo", json!({"v": 1}))).await;
    until(|| server.bridge().table().len() == 1).await;

    drop(client);
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();

    let table = server.bridge().table();
    assert_eq!(table.stats().cancelled.load(Ordering::Relaxed), 1);
    assert!(table.is_empty());

    // The descriptor is still queued for the host and runs as usual.
    let descriptor = host.requests.try_next().unwrap().unwrap();
    assert_eq!(descriptor.tool_name, "test.echo");
    host.responses
        .publish(&CallResult {
            correlation_id: descriptor.correlation_id,
            outcome: Outcome::Result(json!({"v": 1})),
        })
        .unwrap();

    until(|| table.stats().unknown.load(Ordering::Relaxed) == 1).await;
    assert_eq!(table.len(), 0);
    assert_eq!(table.stats().completed.load(Ordering::Relaxed), 0);
}

// =============================================================================
// Server shutdown
// =============================================================================

#[tokio::test]
async fn test_shutdown_answers_in_flight_calls_before_closing() {
    let (server, host_loop) = with_host();
    let (mut client, task) = connect(&server);
    client.initialize().await;
    for id in 1..=3 {
        client.send(call(id, "test.slow", json!({"n": id}))).await;
    }
    until(|| server.bridge().table().stats().registered.load(Ordering::Relaxed) == 3).await;

    tokio::time::timeout(WAIT, server.shutdown(Duration::from_secs(2)))
        .await
        .unwrap();

    let mut answered = Vec::new();
    for _ in 0..3 {
        let reply = client.recv().await.unwrap();
        assert!(reply.get("error").is_none(), "unexpected error: {reply}");
        answered.push(reply["result"]["n"].as_i64().unwrap());
    }
    answered.sort_unstable();
    assert_eq!(answered, vec![1, 2, 3]);
    assert!(client.recv().await.is_none());
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert!(server.bridge().table().is_empty());

    // A client arriving after shutdown is closed without being served.
    let (mut late, late_task) = connect(&server);
    assert!(late.recv().await.is_none());
    tokio::time::timeout(WAIT, late_task).await.unwrap().unwrap();

    host_loop.shutdown();
}

#[tokio::test]
async fn test_shutdown_abandons_calls_past_the_grace_period() {
    let (server, mut host) = detached();
    let (mut client, task) = connect(&server);
    client.initialize().await;
    client.send(call(7, "test.echo", json!({}))).await;
    until(|| server.bridge().table().len() == 1).await;

    tokio::time::timeout(WAIT, server.shutdown(Duration::from_millis(20)))
        .await
        .unwrap();

    let reply = client.recv().await.unwrap();
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["error"]["code"], -32000);
    assert_eq!(reply["error"]["message"], "server shutting down");
    assert_eq!(reply["error"]["data"]["kind"], "shutting_down");
    assert!(client.recv().await.is_none());
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();

    let table = server.bridge().table();
    assert!(table.is_empty());
    assert_eq!(table.stats().cancelled.load(Ordering::Relaxed), 1);

    // The host never ran it; the descriptor is still queued.
    let descriptor = host.requests.try_next().unwrap().unwrap();
    assert_eq!(descriptor.params, Map::new());
}

#[tokio::test]
async fn test_shutdown_with_no_sessions_returns_at_once() {
    let (server, _host) = detached();
    tokio::time::timeout(Duration::from_millis(500), server.shutdown(Duration::from_secs(60)))
        .await
        .unwrap();
}
