//! Client-facing JSON-RPC surface.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       Protocol server                         │
//! │                                                               │
//! │   ┌─────────────┐    ┌─────────────┐    ┌─────────────────┐   │
//! │   │  Transport  │───▶│   Session   │───▶│  Bridge client  │───┼──▶ host
//! │   │ (ws/framed) │    │ (lifecycle) │    │  (correlation)  │◀──┼─── thread
//! │   └─────────────┘    └─────────────┘    └─────────────────┘   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The envelope is JSON with `id`, `method` and `params`. Supported methods
//! are `initialize`, `shutdown`, `listTools`, `callTool` and `ping`.

pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use protocol::{ErrorCode, ErrorObject, Method, Request, RequestId, Response};
pub use server::{shutdown_signal, Dispatch, ProtocolServer};
pub use session::{Session, SessionState};
pub use transport::{FrameSink, FrameSource};
