//! End-to-end tests over real sockets.
//!
//! A server bound to an ephemeral port is driven by a WebSocket client and by
//! a length-framed TCP client.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use dcc_bridge::bridge;
use dcc_bridge::config::{Config, SceneConfig};
use dcc_bridge::host::scene::SceneHost;
use dcc_bridge::host::tools::register_scene_tools;
use dcc_bridge::host::{HostLoop, HostOperations};
use dcc_bridge::registry::ToolRegistry;
use dcc_bridge::rpc::transport::{self, FrameSink, FrameSource};
use dcc_bridge::rpc::ProtocolServer;

const WAIT: Duration = Duration::from_secs(5);

fn start(config: &Config) -> (Arc<ProtocolServer>, HostLoop) {
    let registry = Arc::new(ToolRegistry::new());
    register_scene_tools(&registry);
    let (server_end, host_end) = bridge::channel();
    let host_loop = HostLoop::spawn(
        || {
            SceneHost::new(&SceneConfig::default())
                .ok()
                .map(|s| Box::new(s) as Box<dyn HostOperations>)
        },
        Arc::clone(&registry),
        host_end,
        config.scheduler.clone(),
        Duration::from_millis(200),
    )
    .unwrap();
    (ProtocolServer::start(registry, server_end, config), host_loop)
}

fn config() -> Config {
    let mut config = Config::default();
    config.scheduler.tick_interval_ms = 1;
    config
}

async fn ephemeral() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

// =============================================================================
// WebSocket
// =============================================================================

#[tokio::test]
async fn test_websocket_session_round_trip() {
    let (server, host_loop) = start(&config());
    let (listener, addr) = ephemeral().await;
    tokio::spawn(Arc::clone(&server).serve_websocket(listener));

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();

    for request in [
        json!({"id": 1, "method": "initialize"}),
        json!({"id": 2, "method": "callTool", "params": {"name": "object.create", "params": {"type": "SPHERE", "name": "Ball"}}}),
        json!({"id": 3, "method": "callTool", "params": {"name": "object.get_info", "params": {"name": "Ball"}}}),
    ] {
        ws.send(Message::text(request.to_string())).await.unwrap();
        let reply = tokio::time::timeout(WAIT, ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let reply: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert_eq!(reply["id"], request["id"]);
        assert!(reply.get("error").is_none(), "unexpected error: {reply}");
        if request["id"] == 3 {
            assert_eq!(reply["result"]["type"], "SPHERE");
        }
    }

    ws.send(Message::text(r#"{"id": 4, "method": "shutdown"}"#.to_string()))
        .await
        .unwrap();
    let reply = tokio::time::timeout(WAIT, ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply["result"]["status"], "ok");

    // The server closes after the shutdown reply.
    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    host_loop.shutdown();
}

#[tokio::test]
async fn test_websocket_binary_message_closes_connection() {
    let (server, host_loop) = start(&config());
    let (listener, addr) = ephemeral().await;
    tokio::spawn(Arc::clone(&server).serve_websocket(listener));

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();

    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    host_loop.shutdown();
}

// =============================================================================
// Length-framed TCP
// =============================================================================

#[tokio::test]
async fn test_framed_session_round_trip() {
    let (server, host_loop) = start(&config());
    let (listener, addr) = ephemeral().await;
    tokio::spawn(Arc::clone(&server).serve_framed(listener));

    let stream = TcpStream::connect(&addr).await.unwrap();
    let (read, write) = stream.into_split();
    let (mut source, mut sink) = transport::framed(read, write, 1 << 20);

    sink.send_frame(r#"{"id": 1, "method": "initialize"}"#)
        .await
        .unwrap();
    let reply = tokio::time::timeout(WAIT, source.next_frame())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply["result"]["status"], "ok");

    // Two calls sent back to back; answers are matched by id.
    sink.send_frame(r#"{"id": "a", "method": "callTool", "params": {"name": "test.echo", "params": {"v": 1}}}"#)
        .await
        .unwrap();
    sink.send_frame(r#"{"id": "b", "method": "callTool", "params": {"name": "test.echo", "params": {"v": 2}}}"#)
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let reply = tokio::time::timeout(WAIT, source.next_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        seen.push((reply["id"].clone(), reply["result"]["v"].clone()));
    }
    seen.sort_by_key(|(id, _)| id.as_str().map(str::to_owned));
    assert_eq!(seen, vec![(json!("a"), json!(1)), (json!("b"), json!(2))]);

    sink.close().await.unwrap();
    host_loop.shutdown();
}

#[tokio::test]
async fn test_oversized_frame_drops_the_connection() {
    let mut config = config();
    config.server.max_frame_bytes = 64;
    let (server, host_loop) = start(&config);
    let (listener, addr) = ephemeral().await;
    tokio::spawn(Arc::clone(&server).serve_framed(listener));

    let stream = TcpStream::connect(&addr).await.unwrap();
    let (read, write) = stream.into_split();
    let (mut source, mut sink) = transport::framed(read, write, 1 << 20);

    let big = format!(r#"{{"id": 1, "method": "ping", "pad": "{}"}}"#, "x".repeat(200));
    sink.send_frame(&big).await.unwrap();

    let next = tokio::time::timeout(WAIT, source.next_frame()).await.unwrap();
    assert!(matches!(next, Ok(None) | Err(_)));

    host_loop.shutdown();
}

#[tokio::test]
async fn test_connection_limit_refuses_extra_clients() {
    let mut config = config();
    config.server.max_connections = 1;
    let (server, host_loop) = start(&config);
    let (listener, addr) = ephemeral().await;
    tokio::spawn(Arc::clone(&server).serve_framed(listener));

    let first = TcpStream::connect(&addr).await.unwrap();
    let (read, write) = first.into_split();
    let (mut source, mut sink) = transport::framed(read, write, 1 << 20);
    sink.send_frame(r#"{"id": 1, "method": "ping"}"#).await.unwrap();
    let reply = tokio::time::timeout(WAIT, source.next_frame())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply["result"]["connections"], 1);

    let second = TcpStream::connect(&addr).await.unwrap();
    let (read, _write) = second.into_split();
    let (mut refused, _) = transport::framed(read, tokio::io::sink(), 1 << 20);
    let next = tokio::time::timeout(WAIT, refused.next_frame()).await.unwrap();
    assert!(matches!(next, Ok(None) | Err(_)));
    assert_eq!(server.stats().connections(), 1);

    host_loop.shutdown();
}
