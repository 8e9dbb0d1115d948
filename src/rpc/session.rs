//! Per-connection protocol state.

use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;

use super::protocol::RequestId;
use crate::bridge::CorrelationId;

/// Session lifecycle.
///
/// ```text
/// CREATED ──initialize──▶ INITIALIZED ──shutdown──▶ SHUTTING_DOWN ──▶ CLOSED
/// ```
///
/// Only method calls move the state forward; a dropped connection jumps
/// straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, waiting for `initialize`.
    Created,
    /// Ready for `listTools` and `callTool`.
    Initialized,
    /// `shutdown` received; the response is being flushed.
    ShuttingDown,
    /// Transport closed.
    Closed,
}

/// Why a `callTool` could not be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request id is already in flight on this session.
    DuplicateId,
    /// The session's outstanding-call ceiling is reached.
    Busy,
    /// The session is not accepting calls.
    NotOpen,
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    in_flight: HashMap<RequestId, Option<CorrelationId>>,
}

/// One client connection's view of the protocol.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    inner: Mutex<Inner>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A new session in the `Created` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            inner: Mutex::new(Inner {
                state: SessionState::Created,
                in_flight: HashMap::new(),
            }),
        }
    }

    /// Session identifier, used in logs.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// `Created` → `Initialized`. Returns `false` from any other state.
    pub fn initialize(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Created {
            return false;
        }
        inner.state = SessionState::Initialized;
        true
    }

    /// Moves to `ShuttingDown`. Returns `false` if already shutting down or
    /// closed.
    pub fn begin_shutdown(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Created | SessionState::Initialized => {
                inner.state = SessionState::ShuttingDown;
                true
            }
            SessionState::ShuttingDown | SessionState::Closed => false,
        }
    }

    /// Whether the session is `Initialized`.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state() == SessionState::Initialized
    }

    /// Reserves `id` for a new call, subject to the `ceiling` on outstanding
    /// calls.
    ///
    /// # Errors
    ///
    /// Why the call cannot be admitted. Nothing is reserved on error.
    pub fn reserve_call(&self, id: &RequestId, ceiling: usize) -> Result<(), Admission> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Initialized {
            return Err(Admission::NotOpen);
        }
        if inner.in_flight.contains_key(id) {
            return Err(Admission::DuplicateId);
        }
        if inner.in_flight.len() >= ceiling {
            return Err(Admission::Busy);
        }
        inner.in_flight.insert(id.clone(), None);
        Ok(())
    }

    /// Records the correlation id a reserved call was submitted under.
    pub fn attach(&self, id: &RequestId, correlation_id: CorrelationId) {
        if let Some(slot) = self.inner.lock().in_flight.get_mut(id) {
            *slot = Some(correlation_id);
        }
    }

    /// Releases a reservation once its response has been produced.
    pub fn release_call(&self, id: &RequestId) {
        self.inner.lock().in_flight.remove(id);
    }

    /// Number of calls in flight.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Moves to `Closed` and hands back the correlation ids still owned, so
    /// the caller can cancel them.
    pub fn close(&self) -> Vec<CorrelationId> {
        let mut inner = self.inner.lock();
        inner.state = SessionState::Closed;
        inner.in_flight.drain().filter_map(|(_, c)| c).collect()
    }
}
