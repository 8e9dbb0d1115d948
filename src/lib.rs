//! dcc-bridge: JSON-RPC control bridge for single-threaded 3D content-creation hosts
//!
//! Content-creation applications only allow their scene to be touched from
//! one thread. This crate lets remote clients drive such a host anyway:
//!
//! - **Protocol server** (`rpc`): accepts WebSocket or length-framed clients on
//!   an async event loop and answers `initialize`, `listTools`, `callTool`,
//!   `ping` and `shutdown`.
//! - **Bridge** (`bridge`): serialised call descriptors go to the host thread
//!   over one channel and results come back over another, matched by
//!   correlation id.
//! - **Scheduler** (`scheduler`): drains queued calls on the host thread at
//!   each tick and runs them through the tool registry.
//! - **Host** (`host`): the host operations and the tools built on them,
//!   together with an in-memory scene for running without an application.
//!
//! # Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types
//! - [`registry`]: Tool registry and parameter validation

pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
pub mod registry;
pub mod rpc;
pub mod scheduler;
