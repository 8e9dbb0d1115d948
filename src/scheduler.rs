//! Execution affinity scheduler.
//!
//! The [`Scheduler`] lives on the host thread and is driven by the host's own
//! periodic tick. Each [`Scheduler::tick`] drains a bounded batch of call
//! descriptors from the bridge, runs each handler to completion, and publishes
//! one result per descriptor. It never spawns threads and never lets a handler
//! failure (error or panic) escape into the tick callback.
//!
//! The scheduler is `!Send`: once built on a thread it stays there, and that
//! thread is marked as the host thread for [`is_host_thread`].

use std::any::Any;
use std::cell::Cell;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::{CallDescriptor, CallError, CallResult, CorrelationId, HostEnd, Outcome};
use crate::config::SchedulerConfig;
use crate::error::{BridgeError, ToolError};
use crate::host::HostOperations;
use crate::registry::{ToolOutput, ToolParams, ToolRegistry};
use crate::rpc::protocol::ErrorCode;

thread_local! {
    // Live schedulers on this thread.
    static HOST_THREAD: Cell<usize> = const { Cell::new(0) };
}

/// Whether the current thread owns a [`Scheduler`].
#[must_use]
pub fn is_host_thread() -> bool {
    HOST_THREAD.with(Cell::get) > 0
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Descriptors taken off the request channel.
    pub executed: usize,
    /// How many of those produced an error result.
    pub failed: usize,
    /// The protocol side of the bridge is gone.
    pub disconnected: bool,
}

/// What the shutdown drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Descriptors executed during the grace period.
    pub executed: usize,
    /// Descriptors dropped unexecuted once the grace period ran out.
    pub abandoned: usize,
}

/// Runs tool handlers on the host thread.
pub struct Scheduler {
    host: Option<Box<dyn HostOperations>>,
    registry: Arc<ToolRegistry>,
    bridge: HostEnd,
    max_calls_per_tick: usize,
    max_nested_depth: usize,
    _affinity: PhantomData<*const ()>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("has_host", &self.host.is_some())
            .field("max_calls_per_tick", &self.max_calls_per_tick)
            .field("max_nested_depth", &self.max_nested_depth)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Builds a scheduler on the current thread, which becomes the host thread.
    ///
    /// Without [`Scheduler::with_host`], host-touching tools fail with a
    /// "host unavailable" error.
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>, bridge: HostEnd, config: &SchedulerConfig) -> Self {
        HOST_THREAD.with(|count| count.set(count.get() + 1));
        Self {
            host: None,
            registry,
            bridge,
            max_calls_per_tick: config.max_calls_per_tick.max(1),
            max_nested_depth: config.max_nested_depth,
            _affinity: PhantomData,
        }
    }

    /// Attaches the host implementation.
    #[must_use]
    pub fn with_host(mut self, host: Box<dyn HostOperations>) -> Self {
        self.host = Some(host);
        self
    }

    /// Processes up to `max_calls_per_tick` queued descriptors, oldest first.
    ///
    /// A descriptor that cannot be decoded still counts as executed and
    /// failed. If its correlation id is readable an `-32603` error result is
    /// published for it; otherwise nothing can be addressed and its waiter,
    /// if any, is left to the call timeout.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        while report.executed < self.max_calls_per_tick {
            match self.bridge.requests.try_next() {
                Ok(Some(descriptor)) => {
                    report.executed += 1;
                    if !self.execute(descriptor) {
                        report.failed += 1;
                    }
                }
                Ok(None) => break,
                Err(BridgeError::Closed) => {
                    report.disconnected = true;
                    break;
                }
                Err(e) => {
                    report.executed += 1;
                    report.failed += 1;
                    self.reject(e);
                }
            }
        }
        if report.executed > 0 {
            trace!(executed = report.executed, failed = report.failed, "tick");
        }
        report
    }

    /// Keeps executing queued descriptors until the queue is empty or `grace`
    /// runs out, then drops whatever is left.
    pub fn drain(&mut self, grace: Duration) -> DrainReport {
        let deadline = Instant::now() + grace;
        let mut report = DrainReport::default();

        while Instant::now() < deadline {
            match self.bridge.requests.try_next() {
                Ok(Some(descriptor)) => {
                    self.execute(descriptor);
                    report.executed += 1;
                }
                Ok(None) | Err(BridgeError::Closed) => return report,
                Err(e) => self.reject(e),
            }
        }

        loop {
            match self.bridge.requests.try_next() {
                Ok(Some(descriptor)) => {
                    report.abandoned += 1;
                    warn!(
                        correlation_id = %descriptor.correlation_id,
                        tool = %descriptor.tool_name,
                        "abandoning queued call at shutdown"
                    );
                }
                Ok(None) | Err(BridgeError::Closed) => break,
                Err(_) => report.abandoned += 1,
            }
        }
        if report.abandoned > 0 {
            info!(abandoned = report.abandoned, "shutdown grace period exhausted");
        }
        report
    }

    /// Answers a descriptor that failed to decode, when it can be addressed.
    fn reject(&self, err: BridgeError) {
        let BridgeError::Malformed { correlation_id, .. } = &err else {
            warn!(error = %err, "dropping undecodable call descriptor");
            return;
        };
        let correlation_id = CorrelationId::new(*correlation_id);
        warn!(%correlation_id, error = %err, "rejecting malformed call descriptor");
        let result = CallResult {
            correlation_id,
            outcome: Outcome::Error(err.into()),
        };
        if let Err(e) = self.bridge.responses.publish(&result) {
            warn!(%correlation_id, error = %e, "could not publish result");
        }
    }

    /// Runs one descriptor and publishes its result. Returns `false` if the
    /// result was an error.
    fn execute(&mut self, descriptor: CallDescriptor) -> bool {
        let CallDescriptor {
            correlation_id,
            tool_name,
            params,
        } = descriptor;
        let started = Instant::now();

        let outcome = match self.registry.lookup(&tool_name) {
            None => Outcome::Error(CallError::new(
                ErrorCode::ToolNotFound,
                format!("tool not found: {tool_name}"),
            )),
            Some(tool) => {
                let mut ctx = ToolContext {
                    host: self.host.as_deref_mut(),
                    registry: &self.registry,
                    depth: 0,
                    max_depth: self.max_nested_depth,
                    correlation_id,
                };
                match panic::catch_unwind(AssertUnwindSafe(|| tool.invoke(&mut ctx, params))) {
                    Ok(Ok(output)) => Outcome::Result(Value::Object(output)),
                    Ok(Err(e)) => Outcome::Error(e.into()),
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!(correlation_id = %correlation_id, tool = %tool_name, panic = %message, "tool handler panicked");
                        Outcome::Error(
                            CallError::new(
                                ErrorCode::ToolExecution,
                                format!("tool handler panicked: {message}"),
                            )
                            .with_kind("panic"),
                        )
                    }
                }
            }
        };

        let ok = matches!(outcome, Outcome::Result(_));
        debug!(
            correlation_id = %correlation_id,
            tool = %tool_name,
            ok,
            elapsed_ms = started.elapsed().as_millis(),
            "executed call"
        );

        let result = CallResult {
            correlation_id,
            outcome,
        };
        if let Err(e) = self.bridge.responses.publish(&result) {
            warn!(correlation_id = %correlation_id, error = %e, "could not publish result");
        }
        ok
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        HOST_THREAD.with(|count| count.set(count.get().saturating_sub(1)));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// What a running handler can reach: the host and other tools.
///
/// Only the scheduler constructs one, so holding a context proves the code is
/// running on the host thread.
pub struct ToolContext<'a> {
    host: Option<&'a mut (dyn HostOperations + 'static)>,
    registry: &'a ToolRegistry,
    depth: usize,
    max_depth: usize,
    correlation_id: CorrelationId,
}

impl std::fmt::Debug for ToolContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("correlation_id", &self.correlation_id)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl ToolContext<'_> {
    /// The host application.
    ///
    /// # Errors
    ///
    /// [`ToolError::HostUnavailable`] if the scheduler has no host attached.
    pub fn host(&mut self) -> Result<&mut (dyn HostOperations + 'static), ToolError> {
        self.host.as_deref_mut().ok_or(ToolError::HostUnavailable)
    }

    /// Correlation id of the call being executed.
    #[must_use]
    pub const fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Nesting depth; 0 for the call taken off the bridge.
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Runs another tool inline, on this thread, without touching the bridge.
    ///
    /// # Errors
    ///
    /// The nested tool's error, [`ToolError::InvalidParams`] if `params` do
    /// not match its schema, or [`ToolError::Execution`] if the tool is
    /// unknown or the nesting limit is reached.
    pub fn call_tool(&mut self, name: &str, params: ToolParams) -> Result<ToolOutput, ToolError> {
        if self.depth >= self.max_depth {
            return Err(ToolError::Execution(format!(
                "nested tool call depth limit ({}) reached",
                self.max_depth
            )));
        }
        let tool = self
            .registry
            .lookup(name)
            .ok_or_else(|| ToolError::Execution(format!("tool not found: {name}")))?;
        tool.validate_params(&params).map_err(ToolError::InvalidParams)?;

        let mut nested = ToolContext {
            host: self.host.as_deref_mut(),
            registry: self.registry,
            depth: self.depth + 1,
            max_depth: self.max_depth,
            correlation_id: self.correlation_id,
        };
        trace!(tool = name, depth = nested.depth, "nested tool call");
        tool.invoke(&mut nested, params)
    }
}
