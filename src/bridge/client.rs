//! Protocol-side handle for submitting calls and awaiting their results.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    CallDescriptor, CallError, CorrelationId, CorrelationTable, Outcome, RequestSender,
    ResponseReceiver,
};
use crate::error::BridgeError;

/// Submits tool calls to the host thread.
///
/// Cheap to clone; clones share the correlation table.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    requests: RequestSender,
    table: Arc<CorrelationTable>,
    timeout: Duration,
    runtime: Option<Handle>,
}

impl BridgeClient {
    /// Creates a client. If called inside a tokio runtime, that runtime is
    /// remembered for [`BridgeClient::call_blocking`].
    #[must_use]
    pub fn new(requests: RequestSender, timeout: Duration) -> Self {
        Self {
            requests,
            table: Arc::new(CorrelationTable::new()),
            timeout,
            runtime: Handle::try_current().ok(),
        }
    }

    /// The shared correlation table.
    #[must_use]
    pub const fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    /// The per-call deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers a waiter and sends the call to the host.
    ///
    /// The returned handle must be awaited to learn the outcome. The deadline
    /// is fixed here, so time spent before the first poll of
    /// [`PendingHandle::wait`] counts against it.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Closed`] if the host is gone, [`BridgeError::Encode`] if
    /// the parameters cannot be serialised.
    pub fn submit(&self, tool: &str, params: Map<String, Value>) -> Result<PendingHandle, BridgeError> {
        let (id, rx) = self.table.register_next(tool);
        let descriptor = CallDescriptor {
            correlation_id: id,
            tool_name: tool.to_string(),
            params,
        };
        if let Err(e) = self.requests.submit(descriptor) {
            self.table.discard(id);
            return Err(e);
        }
        debug!(correlation_id = %id, tool, "submitted call");
        Ok(PendingHandle {
            id,
            rx,
            table: Arc::clone(&self.table),
            timeout: self.timeout,
            deadline: Instant::now() + self.timeout,
        })
    }

    /// Submits a call and waits for its outcome.
    ///
    /// # Errors
    ///
    /// The handler's error, or a bridge failure (closed, timed out,
    /// cancelled) converted to a [`CallError`].
    pub async fn call(&self, tool: &str, params: Map<String, Value>) -> Result<Value, CallError> {
        self.submit(tool, params)?.wait().await
    }

    /// Blocking form of [`BridgeClient::call`] for plain threads outside the
    /// async runtime.
    ///
    /// # Errors
    ///
    /// Besides the errors of [`BridgeClient::call`], fails immediately with
    /// [`BridgeError::DeadlockAvoided`] when invoked on the host thread (its
    /// own call could never be serviced) or on a runtime worker thread.
    pub fn call_blocking(&self, tool: &str, params: Map<String, Value>) -> Result<Value, CallError> {
        if crate::scheduler::is_host_thread() {
            return Err(BridgeError::DeadlockAvoided("blocking call issued from the host thread").into());
        }
        if Handle::try_current().is_ok() {
            return Err(BridgeError::DeadlockAvoided("blocking call issued from inside the async runtime").into());
        }
        let Some(runtime) = &self.runtime else {
            return Err(BridgeError::DeadlockAvoided("no runtime available to drive the call").into());
        };
        let pending = self.submit(tool, params)?;
        runtime.block_on(pending.wait())
    }
}

/// A submitted call awaiting its result.
#[derive(Debug)]
pub struct PendingHandle {
    id: CorrelationId,
    rx: oneshot::Receiver<Outcome>,
    table: Arc<CorrelationTable>,
    timeout: Duration,
    deadline: Instant,
}

impl PendingHandle {
    /// The call's correlation id.
    #[must_use]
    pub const fn id(&self) -> CorrelationId {
        self.id
    }

    /// Waits for the outcome or the deadline, whichever comes first.
    ///
    /// # Errors
    ///
    /// The handler's error, [`BridgeError::Timeout`] if the deadline passed,
    /// or [`BridgeError::Closed`] / [`BridgeError::Cancelled`].
    pub async fn wait(mut self) -> Result<Value, CallError> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome.into_result(),
            Ok(Err(_)) => Err(BridgeError::Closed.into()),
            Err(_) => {
                if self.table.retire(self.id) {
                    return Err(BridgeError::Timeout(self.timeout.as_millis()).into());
                }
                // Claimed by a result or a cancellation at the deadline; it is
                // already on its way.
                match self.rx.await {
                    Ok(outcome) => outcome.into_result(),
                    Err(_) => Err(BridgeError::Closed.into()),
                }
            }
        }
    }
}

/// Routes results from the host to their waiters until the host side closes.
///
/// On exit every call still pending fails with [`BridgeError::Closed`] and
/// `alive` is set to `false`.
pub async fn run_response_pump(
    mut responses: ResponseReceiver,
    table: Arc<CorrelationTable>,
    alive: watch::Sender<bool>,
) {
    while let Some(message) = responses.recv().await {
        match message {
            Ok(result) => {
                table.resolve(result);
            }
            Err(e) => warn!(error = %e, "dropping undecodable bridge result"),
        }
    }
    let failed = table.fail_all(&BridgeError::Closed);
    info!(failed, "host bridge closed");
    let _ = alive.send(false);
}
