use std::cell::RefCell;
use std::collections::HashMap;

use log::debug;
use tokio::sync::oneshot;

use super::TransportMessage;
use crate::utils::now_ms;

/// A request waiting for its correlated response.
#[derive(Debug)]
pub struct PendingTransportRequest {
    pub request_id: String,
    pub origin_expected: String,
    pub created_at_ms: u64,
    sender: oneshot::Sender<TransportMessage>,
}

/// In-flight requests of one endpoint, keyed by `requestId`.
#[derive(Default, Debug)]
pub struct PendingRequests {
    entries: RefCell<HashMap<String, PendingTransportRequest>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        request_id: &str,
        origin_expected: &str,
    ) -> oneshot::Receiver<TransportMessage> {
        let (sender, receiver) = oneshot::channel();
        self.entries.borrow_mut().insert(
            request_id.to_string(),
            PendingTransportRequest {
                request_id: request_id.to_string(),
                origin_expected: origin_expected.to_string(),
                created_at_ms: now_ms(),
                sender,
            },
        );
        receiver
    }

    /// Hand a response to its waiter. Returns false, leaving state untouched,
    /// when no live entry matches both the id and the origin.
    pub fn resolve(&self, response: TransportMessage, origin: &str) -> bool {
        let mut entries = self.entries.borrow_mut();
        let matches = entries
            .get(&response.request_id)
            .map(|entry| entry.origin_expected == origin)
            .unwrap_or(false);
        if !matches {
            return false;
        }
        let Some(entry) = entries.remove(&response.request_id) else {
            return false;
        };
        drop(entries);
        debug!(
            "Resolved request {} after {}ms",
            entry.request_id,
            now_ms().saturating_sub(entry.created_at_ms)
        );
        // A dropped receiver means the caller stopped waiting
        entry.sender.send(response).is_ok()
    }

    pub fn remove(&self, request_id: &str) -> bool {
        self.entries.borrow_mut().remove(request_id).is_some()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.borrow().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

/// Removes the pending entry when the waiting future completes or is dropped.
pub struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    request_id: String,
}

impl<'a> PendingGuard<'a> {
    pub fn new(pending: &'a PendingRequests, request_id: &str) -> Self {
        Self {
            pending,
            request_id: request_id.to_string(),
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.pending.remove(&self.request_id) {
            debug!("Dropped pending request {}", self.request_id);
        }
    }
}
