//! Transport Bridge between the protocol event loop and the host thread.
//!
//! ```text
//!  protocol event loop                         host thread
//! ┌────────────────────┐   request channel   ┌────────────────────┐
//! │   BridgeClient     │ ──────────────────▶ │    Scheduler       │
//! │ (submit + await)   │                     │ (tick: drain, run) │
//! │                    │ ◀────────────────── │                    │
//! │   response pump    │   response channel  │                    │
//! └────────────────────┘                     └────────────────────┘
//! ```
//!
//! Both channels are ordered and unbounded and carry JSON-encoded bytes, so
//! the same contract holds whether the far side is another thread or another
//! process. A [`CallDescriptor`] is moved into [`RequestSender::submit`]; once
//! submitted nothing on the protocol side can touch it again.
//!
//! Results are never raised across the bridge: every descriptor produces a
//! [`CallResult`] whose [`Outcome`] is either a value or a [`CallError`].

mod client;
pub mod correlation;

pub use client::{run_response_pump, BridgeClient, PendingHandle};
pub use correlation::{CorrelationStats, CorrelationTable, PendingCall};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::{BridgeError, ToolError};
use crate::rpc::protocol::ErrorCode;

/// Identifier linking a submitted call to its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tool invocation travelling to the host thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallDescriptor {
    /// Id the result must be tagged with.
    pub correlation_id: CorrelationId,
    /// Registered tool name.
    pub tool_name: String,
    /// Tool parameters.
    pub params: Map<String, Value>,
}

/// A failed call, as carried back over the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    /// Protocol error code.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Machine-readable error kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl CallError {
    /// Creates an error with the given code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            kind: None,
        }
    }

    /// Attaches an error kind.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

impl From<ToolError> for CallError {
    fn from(err: ToolError) -> Self {
        let code = match err {
            ToolError::InvalidParams(_) => ErrorCode::InvalidParams,
            ToolError::Execution(_) => ErrorCode::ToolExecution,
            ToolError::Host(_) | ToolError::HostUnavailable => ErrorCode::HostOperation,
        };
        Self::new(code, err.to_string()).with_kind(err.kind())
    }
}

impl From<BridgeError> for CallError {
    fn from(err: BridgeError) -> Self {
        let (code, kind) = match err {
            BridgeError::Encode(_) => (ErrorCode::InvalidParams, "encode"),
            BridgeError::Decode(_) | BridgeError::Malformed { .. } => {
                (ErrorCode::InternalError, "decode")
            }
            BridgeError::DuplicateCorrelationId(_) => {
                (ErrorCode::InvalidRequest, "duplicate_correlation_id")
            }
            BridgeError::Closed => (ErrorCode::ServerError, "bridge_closed"),
            BridgeError::Timeout(_) => (ErrorCode::ServerError, "timeout"),
            BridgeError::Cancelled => (ErrorCode::ServerError, "cancelled"),
            BridgeError::DeadlockAvoided(_) => (ErrorCode::ServerError, "deadlock_avoided"),
            BridgeError::ShuttingDown => (ErrorCode::ServerError, "shutting_down"),
        };
        Self::new(code, err.to_string()).with_kind(kind)
    }
}

/// Result of one call: a value or an error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The handler's output.
    Result(Value),
    /// Why the call failed.
    Error(CallError),
}

impl Outcome {
    /// Converts into a standard `Result`.
    ///
    /// # Errors
    ///
    /// Returns the carried [`CallError`] for failed calls.
    pub fn into_result(self) -> Result<Value, CallError> {
        match self {
            Self::Result(v) => Ok(v),
            Self::Error(e) => Err(e),
        }
    }
}

/// A response-shaped value travelling back from the host thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResult {
    /// The originating descriptor's correlation id.
    pub correlation_id: CorrelationId,
    /// What happened.
    #[serde(flatten)]
    pub outcome: Outcome,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, BridgeError> {
    serde_json::to_vec(value).map_err(|e| BridgeError::Encode(e.to_string()))
}

fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, BridgeError> {
    serde_json::from_slice(bytes).map_err(|e| BridgeError::Decode(e.to_string()))
}

/// Protocol-side producer of the request channel.
#[derive(Debug, Clone)]
pub struct RequestSender(mpsc::UnboundedSender<Vec<u8>>);

impl RequestSender {
    /// Encodes and enqueues a descriptor, taking ownership of it.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Encode`] if the descriptor cannot be serialised (nothing
    /// is queued), [`BridgeError::Closed`] if the host side is gone.
    pub fn submit(&self, descriptor: CallDescriptor) -> Result<(), BridgeError> {
        let bytes = encode(&descriptor)?;
        self.0.send(bytes).map_err(|_| BridgeError::Closed)
    }

    /// Enqueues raw bytes as they would arrive from an out-of-process peer.
    #[cfg(test)]
    pub(crate) fn submit_raw(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        self.0.send(bytes.to_vec()).map_err(|_| BridgeError::Closed)
    }

    /// Returns `true` once the host side has dropped its receiver.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Host-side consumer of the request channel.
#[derive(Debug)]
pub struct RequestReceiver(mpsc::UnboundedReceiver<Vec<u8>>);

impl RequestReceiver {
    /// Pops the next descriptor without blocking.
    ///
    /// Returns `Ok(None)` when the channel is currently empty.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Closed`] once every sender is gone and the queue is
    /// empty. A message that could not be decoded has still been removed
    /// from the queue: [`BridgeError::Malformed`] if its correlation id could
    /// be recovered, so the caller can answer it, [`BridgeError::Decode`]
    /// otherwise.
    pub fn try_next(&mut self) -> Result<Option<CallDescriptor>, BridgeError> {
        match self.0.try_recv() {
            Ok(bytes) => match decode(&bytes) {
                Ok(descriptor) => Ok(Some(descriptor)),
                Err(BridgeError::Decode(reason)) => Err(match correlation_of(&bytes) {
                    Some(id) => BridgeError::Malformed {
                        correlation_id: id.get(),
                        reason,
                    },
                    None => BridgeError::Decode(reason),
                }),
                Err(e) => Err(e),
            },
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(BridgeError::Closed),
        }
    }
}

fn correlation_of(bytes: &[u8]) -> Option<CorrelationId> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct IdOnly {
        correlation_id: CorrelationId,
    }
    serde_json::from_slice::<IdOnly>(bytes)
        .ok()
        .map(|m| m.correlation_id)
}

/// Host-side producer of the response channel.
#[derive(Debug)]
pub struct ResponseSender(mpsc::UnboundedSender<Vec<u8>>);

impl ResponseSender {
    /// Encodes and publishes a result.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Closed`] if the protocol side is gone.
    pub fn publish(&self, result: &CallResult) -> Result<(), BridgeError> {
        let bytes = encode(result)?;
        self.0.send(bytes).map_err(|_| BridgeError::Closed)
    }
}

/// Protocol-side consumer of the response channel.
#[derive(Debug)]
pub struct ResponseReceiver(mpsc::UnboundedReceiver<Vec<u8>>);

impl ResponseReceiver {
    /// Waits for the next result. `None` once the host side is gone.
    pub async fn recv(&mut self) -> Option<Result<CallResult, BridgeError>> {
        let bytes = self.0.recv().await?;
        Some(decode(&bytes))
    }

    /// Takes the next result if one is already queued.
    pub fn try_recv(&mut self) -> Option<Result<CallResult, BridgeError>> {
        let bytes = self.0.try_recv().ok()?;
        Some(decode(&bytes))
    }
}

/// The protocol server's half of the bridge.
#[derive(Debug)]
pub struct ServerEnd {
    /// Where descriptors go.
    pub requests: RequestSender,
    /// Where results come from.
    pub responses: ResponseReceiver,
}

/// The host thread's half of the bridge.
#[derive(Debug)]
pub struct HostEnd {
    /// Where descriptors come from.
    pub requests: RequestReceiver,
    /// Where results go.
    pub responses: ResponseSender,
}

/// Creates a connected channel pair.
#[must_use]
pub fn channel() -> (ServerEnd, HostEnd) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (resp_tx, resp_rx) = mpsc::unbounded_channel();
    (
        ServerEnd {
            requests: RequestSender(req_tx),
            responses: ResponseReceiver(resp_rx),
        },
        HostEnd {
            requests: RequestReceiver(req_rx),
            responses: ResponseSender(resp_tx),
        },
    )
}
