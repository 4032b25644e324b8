//! Correlation of outstanding calls with their responses.
//!
//! Every outgoing request gets a fresh id and a pending entry holding the
//! caller's completion channel. Responses are routed by id alone, so any
//! number of calls may be in flight and complete in any order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::envelope::{Envelope, RequestId};
use crate::error::{Error, Result};

struct PendingCall {
    tool: String,
    issued_at: Instant,
    tx: oneshot::Sender<Result<Value>>,
}

/// Outcome of routing an incoming response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to the waiting caller.
    Delivered,
    /// No caller waiting: unknown id, or the call already timed out or was cancelled.
    Orphaned,
    /// Not a response or error envelope.
    Ignored,
}

/// Pending-call table for one session.
#[derive(Default)]
pub struct Dispatcher {
    pending: Mutex<HashMap<RequestId, PendingCall>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Removes its pending entry when dropped.
///
/// Held by the caller for the duration of a call, so timeouts and dropped
/// futures clean up after themselves.
pub struct PendingGuard {
    dispatcher: Arc<Dispatcher>,
    id: RequestId,
}

impl PendingGuard {
    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.dispatcher.pending.lock().remove(&self.id);
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next request id for this session.
    pub fn next_id(&self) -> RequestId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        RequestId::new(format!("c-{n}"))
    }

    /// Record a call as in flight.
    ///
    /// Fails with [`Error::ConnectionClosed`] once the table has been closed.
    pub fn register(
        self: &Arc<Self>,
        id: RequestId,
        tool: &str,
    ) -> Result<(PendingGuard, oneshot::Receiver<Result<Value>>)> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::ConnectionClosed);
            }
            pending.insert(
                id.clone(),
                PendingCall {
                    tool: tool.to_string(),
                    issued_at: Instant::now(),
                    tx,
                },
            );
        }
        let guard = PendingGuard {
            dispatcher: Arc::clone(self),
            id,
        };
        Ok((guard, rx))
    }

    /// Route a response or error envelope to its caller.
    pub fn resolve(&self, envelope: Envelope) -> Resolution {
        let (id, outcome) = match envelope {
            Envelope::Response { id, result } => (id, Ok(result)),
            Envelope::Error { id, error } => (id, Err(Error::Remote(error))),
            _ => return Resolution::Ignored,
        };

        let Some(call) = self.pending.lock().remove(&id) else {
            tracing::debug!(%id, "discarding response with no pending call");
            return Resolution::Orphaned;
        };

        tracing::trace!(
            %id,
            tool = %call.tool,
            elapsed_ms = call.issued_at.elapsed().as_millis() as u64,
            "call completed"
        );
        match call.tx.send(outcome) {
            Ok(()) => Resolution::Delivered,
            Err(_) => Resolution::Orphaned,
        }
    }

    /// Drop a pending call without completing it. Returns whether it existed.
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.pending.lock().remove(id).is_some()
    }

    /// Fail every pending call with [`Error::ConnectionClosed`] and refuse new ones.
    ///
    /// Returns the number of calls that were failed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            self.closed.store(true, Ordering::Release);
            pending.drain().collect()
        };
        let count = drained.len();
        for (_, call) in drained {
            let _ = call.tx.send(Err(Error::ConnectionClosed));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of calls awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::envelope::ErrorKind;

    #[test]
    fn ids_are_unique_and_sequential() {
        let d = Dispatcher::new();
        assert_eq!(d.next_id().as_str(), "c-1");
        assert_eq!(d.next_id().as_str(), "c-2");
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callers() {
        let d = Arc::new(Dispatcher::new());
        let (_g1, rx1) = d.register(d.next_id(), "add").unwrap();
        let (_g2, rx2) = d.register(d.next_id(), "add").unwrap();
        assert_eq!(d.in_flight(), 2);

        assert_eq!(
            d.resolve(Envelope::response("c-2", json!({"result": 2}))),
            Resolution::Delivered
        );
        assert_eq!(
            d.resolve(Envelope::response("c-1", json!({"result": 1}))),
            Resolution::Delivered
        );

        assert_eq!(rx1.await.unwrap().unwrap(), json!({"result": 1}));
        assert_eq!(rx2.await.unwrap().unwrap(), json!({"result": 2}));
        assert_eq!(d.in_flight(), 0);
    }

    #[tokio::test]
    async fn error_envelope_becomes_remote_error() {
        let d = Arc::new(Dispatcher::new());
        let (_g, rx) = d.register(d.next_id(), "ghost").unwrap();
        d.resolve(Envelope::error("c-1", ErrorKind::UnknownTool, "unknown tool: ghost"));
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.remote_kind(), Some(ErrorKind::UnknownTool));
    }

    #[test]
    fn late_response_after_guard_drop_is_orphaned() {
        let d = Arc::new(Dispatcher::new());
        let (guard, rx) = d.register(d.next_id(), "slow").unwrap();
        drop(rx);
        drop(guard);
        assert_eq!(d.in_flight(), 0);
        assert_eq!(
            d.resolve(Envelope::response("c-1", Value::Null)),
            Resolution::Orphaned
        );
    }

    #[tokio::test]
    async fn close_all_fails_pending_and_refuses_new_calls() {
        let d = Arc::new(Dispatcher::new());
        let (_g1, rx1) = d.register(d.next_id(), "a").unwrap();
        let (_g2, rx2) = d.register(d.next_id(), "b").unwrap();

        assert_eq!(d.close_all(), 2);
        assert!(matches!(rx1.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(matches!(
            d.register(d.next_id(), "c"),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn notifications_are_ignored() {
        let d = Dispatcher::new();
        let note = crate::envelope::Notification::new("tools/progress", Value::Null);
        assert_eq!(d.resolve(note.into()), Resolution::Ignored);
    }
}
