//! Correlation table: which submitted calls are still waiting for a result.
//!
//! An entry is removed exactly once, by whichever happens first: the result
//! arriving ([`CorrelationTable::resolve`]), the waiter giving up
//! ([`CorrelationTable::retire`]), or the owning session closing
//! ([`CorrelationTable::cancel`]). Removal is the claim; whoever removes the
//! entry decides the call's fate, so a timed-out call can never also deliver
//! a late success.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{CallError, CallResult, CorrelationId, Outcome};
use crate::error::BridgeError;

/// A call waiting for its result.
#[derive(Debug)]
pub struct PendingCall {
    created_at: Instant,
    tool: String,
    slot: oneshot::Sender<Outcome>,
}

/// Running counters for a [`CorrelationTable`].
#[derive(Debug, Default)]
pub struct CorrelationStats {
    /// Calls registered.
    pub registered: AtomicU64,
    /// Results delivered to a waiter.
    pub completed: AtomicU64,
    /// Calls retired by their deadline.
    pub timed_out: AtomicU64,
    /// Calls cancelled or failed before a result arrived.
    pub cancelled: AtomicU64,
    /// Results that arrived for no pending call.
    pub unknown: AtomicU64,
}

/// Maps correlation ids to waiting callers.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: DashMap<CorrelationId, PendingCall>,
    next_id: AtomicU64,
    stats: CorrelationStats,
}

impl CorrelationTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter under an explicit id.
    ///
    /// # Errors
    ///
    /// [`BridgeError::DuplicateCorrelationId`] if `id` is still pending.
    pub fn register(
        &self,
        id: CorrelationId,
        tool: &str,
    ) -> Result<oneshot::Receiver<Outcome>, BridgeError> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(BridgeError::DuplicateCorrelationId(id.get())),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingCall {
                    created_at: Instant::now(),
                    tool: tool.to_string(),
                    slot: tx,
                });
                self.stats.registered.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %id, tool, "registered pending call");
                Ok(rx)
            }
        }
    }

    /// Allocates a fresh id and registers a waiter under it.
    ///
    /// Ids are sequential; one still owned by a live call (possible only after
    /// the counter wraps) is skipped.
    pub fn register_next(&self, tool: &str) -> (CorrelationId, oneshot::Receiver<Outcome>) {
        loop {
            let id = CorrelationId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
            if let Ok(rx) = self.register(id, tool) {
                return (id, rx);
            }
        }
    }

    /// Delivers a result to its waiter.
    ///
    /// Returns `false` when nothing was waiting: the call already timed out or
    /// was cancelled, or the id was never issued. Such results are dropped.
    pub fn resolve(&self, result: CallResult) -> bool {
        let CallResult {
            correlation_id,
            outcome,
        } = result;

        let Some((_, pending)) = self.pending.remove(&correlation_id) else {
            self.stats.unknown.fetch_add(1, Ordering::Relaxed);
            warn!(
                correlation_id = %correlation_id,
                "result for unknown or expired correlation id"
            );
            return false;
        };

        let elapsed = pending.created_at.elapsed();
        if pending.slot.send(outcome).is_ok() {
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
            debug!(
                correlation_id = %correlation_id,
                tool = pending.tool,
                elapsed_ms = elapsed.as_millis(),
                "completed pending call"
            );
            true
        } else {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(
                correlation_id = %correlation_id,
                tool = pending.tool,
                "waiter dropped before result arrived"
            );
            false
        }
    }

    /// Claims an entry on behalf of a waiter whose deadline passed.
    ///
    /// Returns `false` if a result (or cancellation) claimed it first.
    pub fn retire(&self, id: CorrelationId) -> bool {
        let Some((_, pending)) = self.pending.remove(&id) else {
            return false;
        };
        self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
        warn!(
            correlation_id = %id,
            tool = pending.tool,
            elapsed_ms = pending.created_at.elapsed().as_millis(),
            "pending call timed out"
        );
        true
    }

    /// Removes an entry without notifying anyone. Used when submission itself
    /// failed and the waiter never existed from the caller's point of view.
    pub(crate) fn discard(&self, id: CorrelationId) {
        self.pending.remove(&id);
    }

    /// Cancels a pending call, waking its waiter with a cancellation error.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        self.fail(id, &BridgeError::Cancelled)
    }

    /// Fails every pending call with `err`. Returns how many were failed.
    pub fn fail_all(&self, err: &BridgeError) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter(|id| self.fail(*id, err)).count()
    }

    fn fail(&self, id: CorrelationId, err: &BridgeError) -> bool {
        let Some((_, pending)) = self.pending.remove(&id) else {
            return false;
        };
        self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
        debug!(correlation_id = %id, tool = pending.tool, error = %err, "failing pending call");
        let _ = pending
            .slot
            .send(Outcome::Error(CallError::from(err.clone())));
        true
    }

    /// Whether `id` is still waiting.
    #[must_use]
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of calls waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Counters.
    #[must_use]
    pub const fn stats(&self) -> &CorrelationStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok(id: CorrelationId, value: serde_json::Value) -> CallResult {
        CallResult {
            correlation_id: id,
            outcome: Outcome::Result(value),
        }
    }

    #[test]
    fn duplicate_live_id_is_rejected() {
        let table = CorrelationTable::new();
        let id = CorrelationId::new(1);
        let _rx = table.register(id, "test.echo").unwrap();
        assert_eq!(
            table.register(id, "test.echo").unwrap_err(),
            BridgeError::DuplicateCorrelationId(1)
        );
    }

    #[test]
    fn id_is_reusable_after_resolution() {
        let table = CorrelationTable::new();
        let id = CorrelationId::new(1);
        let _rx = table.register(id, "a").unwrap();
        assert!(table.resolve(ok(id, json!(1))));
        assert!(table.register(id, "a").is_ok());
    }

    #[test]
    fn allocator_skips_live_ids() {
        let table = CorrelationTable::new();
        let _held = table.register(CorrelationId::new(0), "a").unwrap();
        let (id, _rx) = table.register_next("b");
        assert_eq!(id, CorrelationId::new(1));
    }

    #[tokio::test]
    async fn resolve_wakes_the_waiter() {
        let table = CorrelationTable::new();
        let (id, rx) = table.register_next("test.echo");
        assert!(table.resolve(ok(id, json!({"x": 1}))));
        assert_eq!(rx.await.unwrap(), Outcome::Result(json!({"x": 1})));
        assert!(table.is_empty());
    }

    #[test]
    fn result_after_retire_is_dropped() {
        let table = CorrelationTable::new();
        let (id, _rx) = table.register_next("slow");
        assert!(table.retire(id));
        assert!(!table.resolve(ok(id, json!(null))));
        assert_eq!(table.stats().unknown.load(Ordering::Relaxed), 1);
        assert_eq!(table.stats().timed_out.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn retire_loses_to_an_earlier_result() {
        let table = CorrelationTable::new();
        let (id, _rx) = table.register_next("fast");
        assert!(table.resolve(ok(id, json!(true))));
        assert!(!table.retire(id));
    }

    #[tokio::test]
    async fn cancel_reports_cancellation() {
        let table = CorrelationTable::new();
        let (id, rx) = table.register_next("test.echo");
        assert!(table.cancel(id));
        let Outcome::Error(err) = rx.await.unwrap() else {
            panic!("expected an error outcome");
        };
        assert_eq!(err.code, -32000);
        assert_eq!(err.kind.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn fail_all_drains_the_table() {
        let table = CorrelationTable::new();
        let receivers: Vec<_> = (0..3).map(|_| table.register_next("x").1).collect();
        assert_eq!(table.fail_all(&BridgeError::Closed), 3);
        assert!(table.is_empty());
        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Outcome::Error(_)));
        }
    }
}
