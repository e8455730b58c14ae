//! Pending call tracker
//!
//! Correlates responses read by an instance's reader task with the callers
//! waiting on them.

use dashmap::DashMap;
use hopwire_proto::Reply;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Tracks calls awaiting a reply
#[derive(Clone, Default)]
pub struct PendingCalls {
    /// Maps request_id -> oneshot sender for the reply
    calls: Arc<DashMap<u64, oneshot::Sender<Reply>>>,
    next_id: Arc<AtomicU64>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a request id unique for this tracker
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a new pending call
    /// Returns a receiver that will receive the reply
    pub fn register(&self, request_id: u64) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(request_id, tx);
        rx
    }

    /// Deliver a reply
    /// Returns true if the reply was delivered, false if the call wasn't found
    pub fn respond(&self, request_id: u64, reply: Reply) -> bool {
        if let Some((_, tx)) = self.calls.remove(&request_id) {
            if tx.send(reply).is_err() {
                debug!("Caller for request {} went away before the reply", request_id);
                return false;
            }
            return true;
        }
        warn!("No pending call found for request {}", request_id);
        false
    }

    /// Cancel a pending call (e.g., on timeout or write failure)
    pub fn cancel(&self, request_id: u64) {
        if self.calls.remove(&request_id).is_some() {
            debug!("Cancelled pending call {}", request_id);
        }
    }

    /// Drop every pending call; waiting receivers observe a closed channel
    pub fn fail_all(&self) -> usize {
        let count = self.calls.len();
        self.calls.clear();
        if count > 0 {
            debug!("Failed {} pending calls", count);
        }
        count
    }

    /// Get count of pending calls
    pub fn count(&self) -> usize {
        self.calls.len()
    }
}
