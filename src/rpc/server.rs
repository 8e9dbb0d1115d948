//! Protocol server: sessions, method dispatch and listeners.
//!
//! Each connection gets a [`Session`]. Frames are parsed and dispatched on the
//! event loop; `callTool` is the only method that leaves it, by submitting a
//! call descriptor over the bridge and answering once the host has run it.
//! Responses for different calls on one connection may therefore arrive out
//! of request order; clients match them by `id`.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::protocol::{
    parse_request, ErrorCode, ErrorObject, Method, Request, RequestId, Response, SERVER_NAME,
    SERVER_VERSION,
};
use super::session::{Admission, Session};
use super::transport::{self, FrameSink, FrameSource};
use crate::bridge::{run_response_pump, BridgeClient, CallError, ServerEnd};
use crate::config::{Config, ServerConfig, TransportKind};
use crate::error::BridgeError;
use crate::registry::ToolRegistry;

/// Server-wide counters reported by `ping`.
#[derive(Debug)]
pub struct ServerStats {
    started: Instant,
    connections: AtomicUsize,
    requests: AtomicU64,
}

impl ServerStats {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            connections: AtomicUsize::new(0),
            requests: AtomicU64::new(0),
        }
    }

    /// Currently connected clients.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Envelopes received since start.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Time since the server started.
    #[must_use]
    pub fn uptime(&self) -> std::time::Duration {
        self.started.elapsed()
    }
}

/// A slot in the connection limit, released on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    stats: Arc<ServerStats>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// How to answer one request.
pub enum Dispatch {
    /// Send this response.
    Reply(Response),
    /// Send this response, then close the connection.
    ReplyAndClose(Response),
    /// Send the response this future produces once the host has run the call.
    Pending(BoxFuture<'static, Response>),
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reply(r) => f.debug_tuple("Reply").field(r).finish(),
            Self::ReplyAndClose(r) => f.debug_tuple("ReplyAndClose").field(r).finish(),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

enum Outgoing {
    Frame(String),
    Close,
}

/// Counts a live session until dropped.
struct SessionSlot(watch::Sender<usize>);

impl SessionSlot {
    fn new(sessions: &watch::Sender<usize>) -> Self {
        sessions.send_modify(|n| *n += 1);
        Self(sessions.clone())
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

// How long closing sessions get to flush once pending calls are abandoned.
const FLUSH_WINDOW: Duration = Duration::from_millis(500);

/// The protocol server.
#[derive(Debug)]
pub struct ProtocolServer {
    registry: Arc<ToolRegistry>,
    bridge: BridgeClient,
    stats: Arc<ServerStats>,
    bridge_alive: watch::Receiver<bool>,
    closing: watch::Sender<bool>,
    sessions: watch::Sender<usize>,
    max_pending: usize,
    max_connections: usize,
    max_frame: usize,
    shutdown_grace: Duration,
}

impl ProtocolServer {
    /// Creates the server and starts its response pump.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(registry: Arc<ToolRegistry>, bridge: ServerEnd, config: &Config) -> Arc<Self> {
        let client = BridgeClient::new(bridge.requests, config.bridge.call_timeout());
        let (alive_tx, alive_rx) = watch::channel(true);
        tokio::spawn(run_response_pump(
            bridge.responses,
            Arc::clone(client.table()),
            alive_tx,
        ));
        Arc::new(Self {
            registry,
            bridge: client,
            stats: Arc::new(ServerStats::new()),
            bridge_alive: alive_rx,
            closing: watch::Sender::new(false),
            sessions: watch::Sender::new(0),
            max_pending: config.bridge.max_pending_per_session,
            max_connections: config.server.max_connections,
            max_frame: config.server.max_frame_bytes,
            shutdown_grace: config.bridge.shutdown_grace(),
        })
    }

    /// Server counters.
    #[must_use]
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// The bridge client used for `callTool`.
    #[must_use]
    pub const fn bridge(&self) -> &BridgeClient {
        &self.bridge
    }

    /// Claims a connection slot, or `None` at the connection limit.
    #[must_use]
    pub fn admit(&self) -> Option<ConnectionGuard> {
        self.stats
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_connections).then_some(n + 1)
            })
            .ok()
            .map(|_| ConnectionGuard {
                stats: Arc::clone(&self.stats),
            })
    }

    /// Parses and dispatches one raw envelope.
    pub fn handle_frame(&self, session: &Arc<Session>, frame: &str) -> Dispatch {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        match parse_request(frame) {
            Ok(request) => self.dispatch(session, request),
            Err(response) => Dispatch::Reply(response),
        }
    }

    /// Dispatches one parsed request.
    pub fn dispatch(&self, session: &Arc<Session>, request: Request) -> Dispatch {
        let Request { id, method, params } = request;
        debug!(session = %session.id(), %id, method = %method, "request");

        let Some(method) = Method::parse(&method) else {
            return Dispatch::Reply(Response::method_not_found(id, &method));
        };

        match method {
            Method::Ping => Dispatch::Reply(Response::success(id, self.ping())),
            Method::Initialize => {
                if session.initialize() {
                    info!(session = %session.id(), "session initialized");
                    Dispatch::Reply(Response::success(
                        id,
                        json!({
                            "name": SERVER_NAME,
                            "version": SERVER_VERSION,
                            "status": "ok",
                        }),
                    ))
                } else {
                    Dispatch::Reply(Response::invalid_request(
                        Some(id),
                        "session already initialized",
                    ))
                }
            }
            Method::Shutdown => {
                if session.begin_shutdown() {
                    info!(session = %session.id(), "session shutting down");
                    Dispatch::ReplyAndClose(Response::success(id, json!({ "status": "ok" })))
                } else {
                    Dispatch::Reply(Response::invalid_request(
                        Some(id),
                        "session is already shutting down",
                    ))
                }
            }
            Method::ListTools => {
                if !session.is_initialized() {
                    return Dispatch::Reply(not_initialized(id));
                }
                Dispatch::Reply(Response::success(
                    id,
                    json!({ "tools": self.registry.list() }),
                ))
            }
            Method::CallTool => self.call_tool(session, id, params),
        }
    }

    fn ping(&self) -> Value {
        json!({
            "pong": true,
            "uptimeMs": u64::try_from(self.stats.uptime().as_millis()).unwrap_or(u64::MAX),
            "connections": self.stats.connections(),
            "requests": self.stats.requests(),
            "pendingCalls": self.bridge.table().len(),
        })
    }

    /// Parameters that do not match the tool's schema get `-32602` before
    /// anything crosses the bridge.
    fn call_tool(&self, session: &Arc<Session>, id: RequestId, params: Value) -> Dispatch {
        if !session.is_initialized() {
            return Dispatch::Reply(not_initialized(id));
        }

        let (name, args) = match call_params(params) {
            Ok(parsed) => parsed,
            Err(message) => return Dispatch::Reply(Response::invalid_params(id, message)),
        };

        let Some(tool) = self.registry.lookup(&name) else {
            return Dispatch::Reply(Response::error(
                Some(id),
                ErrorObject::with_message(ErrorCode::ToolNotFound, format!("tool not found: {name}")),
            ));
        };
        if let Err(message) = tool.validate_params(&args) {
            return Dispatch::Reply(Response::invalid_params(id, message));
        }

        match session.reserve_call(&id, self.max_pending) {
            Ok(()) => {}
            Err(Admission::DuplicateId) => {
                return Dispatch::Reply(Response::invalid_request(Some(id), "duplicate request id"));
            }
            Err(Admission::Busy) => {
                warn!(session = %session.id(), ceiling = self.max_pending, "session at pending-call ceiling");
                return Dispatch::Reply(Response::error(
                    Some(id),
                    ErrorObject::with_message(ErrorCode::ServerError, "server busy"),
                ));
            }
            Err(Admission::NotOpen) => return Dispatch::Reply(not_initialized(id)),
        }

        let pending = match self.bridge.submit(&name, args) {
            Ok(pending) => pending,
            Err(e) => {
                session.release_call(&id);
                return Dispatch::Reply(Response::error(Some(id), CallError::from(e).into()));
            }
        };
        session.attach(&id, pending.id());

        let session = Arc::clone(session);
        Dispatch::Pending(Box::pin(async move {
            let outcome = pending.wait().await;
            session.release_call(&id);
            match outcome {
                Ok(value) => Response::success(id, value),
                Err(e) => Response::error(Some(id), e.into()),
            }
        }))
    }

    /// Serves one connection until the peer closes it, `shutdown` is
    /// processed, the transport fails, the host bridge is lost or the server
    /// starts shutting down.
    ///
    /// On server shutdown no further frames are read, but responses for calls
    /// already in flight are still written before the connection closes.
    pub async fn serve_connection<Src, Snk>(self: &Arc<Self>, mut source: Src, mut sink: Snk)
    where
        Src: FrameSource,
        Snk: FrameSink + 'static,
    {
        let _slot = SessionSlot::new(&self.sessions);
        let session = Arc::new(Session::new());
        info!(session = %session.id(), "session opened");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match message {
                    Outgoing::Frame(frame) => {
                        if let Err(e) = sink.send_frame(&frame).await {
                            warn!(error = %e, "failed to send response");
                            break;
                        }
                    }
                    Outgoing::Close => break,
                }
            }
            if let Err(e) = sink.close().await {
                debug!(error = %e, "error while closing transport");
            }
        });

        let mut alive = self.bridge_alive.clone();
        let mut closing = self.closing.subscribe();
        let mut replies = JoinSet::new();
        let mut bridge_lost = !*alive.borrow_and_update();
        let mut draining = *closing.borrow_and_update();

        if bridge_lost {
            warn!(session = %session.id(), "host bridge is down, refusing session");
        } else if draining {
            info!(session = %session.id(), "server is shutting down, refusing session");
        }

        while !bridge_lost && !draining {
            tokio::select! {
                frame = source.next_frame() => match frame {
                    Ok(Some(text)) => match self.handle_frame(&session, &text) {
                        Dispatch::Reply(response) => send(&out_tx, &response),
                        Dispatch::ReplyAndClose(response) => {
                            send(&out_tx, &response);
                            break;
                        }
                        Dispatch::Pending(reply) => {
                            let out = out_tx.clone();
                            replies.spawn(async move {
                                let response = reply.await;
                                send(&out, &response);
                            });
                        }
                    },
                    Ok(None) => {
                        debug!(session = %session.id(), "peer closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(session = %session.id(), error = %e, "transport error, closing connection");
                        break;
                    }
                },
                Some(_) = replies.join_next(), if !replies.is_empty() => {}
                changed = alive.changed() => {
                    bridge_lost = changed.is_err() || !*alive.borrow();
                    if bridge_lost {
                        warn!(session = %session.id(), "host bridge lost, closing session");
                    }
                }
                Ok(()) = closing.changed() => {
                    draining = *closing.borrow();
                    if draining {
                        info!(session = %session.id(), pending = replies.len(), "server shutting down, draining session");
                    }
                }
            }
        }

        if bridge_lost || draining {
            // Every pending call ends in a result, a timeout or a shutdown
            // error; flush those responses before closing.
            while replies.join_next().await.is_some() {}
        } else {
            replies.abort_all();
        }

        let _ = out_tx.send(Outgoing::Close);
        let owned = session.close();
        let cancelled = owned
            .into_iter()
            .filter(|cid| self.bridge.table().cancel(*cid))
            .count();
        let _ = writer.await;
        info!(session = %session.id(), cancelled, "session closed");
    }

    /// Accepts WebSocket clients until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting fails.
    pub async fn serve_websocket(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let Some(guard) = self.refuse_over_limit(peer) else {
                continue;
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let _guard = guard;
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => {
                        let (source, sink) = transport::websocket(ws, server.max_frame);
                        server.serve_connection(source, sink).await;
                    }
                    Err(e) => warn!(%peer, error = %e, "websocket handshake failed"),
                }
            });
        }
    }

    /// Accepts length-framed TCP clients until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting fails.
    pub async fn serve_framed(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let Some(guard) = self.refuse_over_limit(peer) else {
                continue;
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let _guard = guard;
                let (read, write) = stream.into_split();
                let (source, sink) = transport::framed(read, write, server.max_frame);
                server.serve_connection(source, sink).await;
            });
        }
    }

    /// Serves a single length-framed session over stdin/stdout.
    ///
    /// The session runs as its own task, so dropping this future leaves it
    /// to finish under [`ProtocolServer::shutdown`].
    pub async fn serve_stdio(self: Arc<Self>) {
        let Some(guard) = self.admit() else {
            return;
        };
        let server = Arc::clone(&self);
        let session = tokio::spawn(async move {
            let _guard = guard;
            let (source, sink) =
                transport::framed(tokio::io::stdin(), tokio::io::stdout(), server.max_frame);
            server.serve_connection(source, sink).await;
        });
        if let Err(e) = session.await {
            warn!(error = %e, "stdio session task failed");
        }
    }

    /// Stops reading new requests and waits for open sessions to flush.
    ///
    /// Sessions answer their in-flight calls and close. Calls still pending
    /// after `grace` fail with `-32000` (`shutting_down`), and the sessions
    /// get a short window to write those errors. Listeners are not touched;
    /// stop accepting before calling this.
    pub async fn shutdown(&self, grace: Duration) {
        self.closing.send_replace(true);
        let mut sessions = self.sessions.subscribe();
        let open = *sessions.borrow_and_update();
        info!(sessions = open, pending = self.bridge.table().len(), "draining sessions");

        let drained = tokio::time::timeout(grace, sessions.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|r| r.is_ok());
        if drained {
            info!("all sessions drained");
            return;
        }

        let failed = self.bridge.table().fail_all(&BridgeError::ShuttingDown);
        warn!(failed, "shutdown grace period exhausted, abandoning pending calls");
        let flushed = tokio::time::timeout(FLUSH_WINDOW, sessions.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|r| r.is_ok());
        if !flushed {
            warn!(sessions = *sessions.borrow(), "sessions still open at shutdown");
        }
    }

    fn refuse_over_limit(&self, peer: SocketAddr) -> Option<ConnectionGuard> {
        let guard = self.admit();
        if guard.is_none() {
            warn!(%peer, limit = self.max_connections, "connection limit reached, refusing client");
        } else {
            debug!(%peer, "client connected");
        }
        guard
    }

    /// Runs the configured transport until `shutdown` resolves or the
    /// transport ends, then stops accepting and drains open sessions for the
    /// configured shutdown grace.
    ///
    /// # Errors
    ///
    /// Returns an error if binding or accepting fails.
    pub async fn run<F>(self: Arc<Self>, config: &ServerConfig, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let result = Arc::clone(&self).listen(config, shutdown).await;
        self.shutdown(self.shutdown_grace).await;
        result
    }

    async fn listen<F>(self: Arc<Self>, config: &ServerConfig, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        match config.transport {
            TransportKind::Websocket | TransportKind::Framed => {
                let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
                info!(
                    addr = %listener.local_addr()?,
                    transport = ?config.transport,
                    "listening"
                );
                let serve = if config.transport == TransportKind::Websocket {
                    Box::pin(self.serve_websocket(listener)) as BoxFuture<'static, io::Result<()>>
                } else {
                    Box::pin(self.serve_framed(listener))
                };
                tokio::select! {
                    result = serve => result,
                    () = shutdown => Ok(()),
                }
            }
            TransportKind::Stdio => {
                info!("serving on stdin/stdout");
                tokio::select! {
                    () = self.serve_stdio() => Ok(()),
                    () = shutdown => Ok(()),
                }
            }
        }
    }
}

fn send(out: &mpsc::UnboundedSender<Outgoing>, response: &Response) {
    match serde_json::to_string(response) {
        Ok(frame) => {
            let _ = out.send(Outgoing::Frame(frame));
        }
        Err(e) => warn!(error = %e, "failed to serialise response"),
    }
}

fn not_initialized(id: RequestId) -> Response {
    Response::invalid_request(Some(id), "session not initialized")
}

/// Removes `canonical` or its deprecated `alias` from `params`.
///
/// The alias is honoured only when the canonical key is absent; supplying
/// both is an error whatever their order.
fn take_aliased(
    params: &mut Map<String, Value>,
    canonical: &str,
    alias: &str,
) -> Result<Option<Value>, String> {
    match (params.remove(canonical), params.remove(alias)) {
        (Some(_), Some(_)) => Err(format!(
            "'{canonical}' and its deprecated alias '{alias}' are mutually exclusive"
        )),
        (Some(value), None) => Ok(Some(value)),
        (None, Some(value)) => {
            debug!(alias, canonical, "deprecated parameter alias used");
            Ok(Some(value))
        }
        (None, None) => Ok(None),
    }
}

/// Extracts the tool name and arguments from `callTool` params.
fn call_params(params: Value) -> Result<(String, Map<String, Value>), String> {
    let Value::Object(mut params) = params else {
        return Err("callTool params must be an object".to_string());
    };
    let name = match take_aliased(&mut params, "name", "tool")? {
        Some(Value::String(name)) if !name.is_empty() => name,
        Some(_) => return Err("tool name must be a non-empty string".to_string()),
        None => return Err("missing tool name".to_string()),
    };
    let args = match take_aliased(&mut params, "params", "arguments")? {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(args)) => args,
        Some(_) => return Err("tool params must be an object".to_string()),
    };
    Ok((name, args))
}

/// Resolves when the process is asked to stop.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "cannot install signal handlers");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

/// Resolves when the process is asked to stop.
#[cfg(not(unix))]
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(e) => {
            warn!(error = %e, "cannot install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_keys() {
        let (name, args) =
            call_params(json!({"name": "test.echo", "params": {"a": 1}})).unwrap();
        assert_eq!(name, "test.echo");
        assert_eq!(args["a"], 1);
    }

    #[test]
    fn deprecated_aliases_alone_are_accepted() {
        let (name, args) =
            call_params(json!({"tool": "test.echo", "arguments": {"b": 2}})).unwrap();
        assert_eq!(name, "test.echo");
        assert_eq!(args["b"], 2);
    }

    #[test]
    fn alias_with_canonical_is_rejected_in_either_order() {
        let a = serde_json::from_str::<Value>(r#"{"name": "x", "tool": "y"}"#).unwrap();
        let b = serde_json::from_str::<Value>(r#"{"tool": "y", "name": "x"}"#).unwrap();
        assert!(call_params(a).unwrap_err().contains("mutually exclusive"));
        assert!(call_params(b).unwrap_err().contains("mutually exclusive"));

        let c = json!({"name": "x", "params": {}, "arguments": {}});
        assert!(call_params(c).is_err());
    }

    #[test]
    fn missing_or_bad_name() {
        assert!(call_params(json!({})).unwrap_err().contains("missing"));
        assert!(call_params(json!({"name": 5})).is_err());
        assert!(call_params(json!({"name": ""})).is_err());
        assert!(call_params(json!([1])).is_err());
    }

    #[test]
    fn null_params_mean_no_arguments() {
        let (_, args) = call_params(json!({"name": "x", "params": null})).unwrap();
        assert!(args.is_empty());
        assert!(call_params(json!({"name": "x", "params": [1]})).is_err());
    }
}
