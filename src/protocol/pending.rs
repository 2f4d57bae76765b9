//! Correlation table for promise-style requests
//!
//! Entries are inserted on send and removed exactly once: by the matching
//! reply, by timeout eviction, or by clearing the table. Whoever removes the
//! entry owns the resolution, so a late reply after eviction finds nothing
//! and is dropped.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rmpv::Value;
use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};
use tracing::{debug, warn};

use crate::types::{RelayError, Result};

use super::wire::SubType;

/// Outcome delivered to a waiter: payload, or the peer's error message
pub type Reply = std::result::Result<Value, String>;

struct PendingEntry {
    sender: oneshot::Sender<Reply>,
    sub_type: SubType,
    created: Instant,
}

/// In-flight requests keyed by correlation id
#[derive(Default)]
pub struct PendingRequests {
    entries: DashMap<String, PendingEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. An id that is already pending is refused.
    pub fn register(&self, id: &str, sub_type: SubType) -> Result<oneshot::Receiver<Reply>> {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(_) => {
                warn!(%id, %sub_type, "Correlation id already pending, refusing request");
                Err(RelayError::Protocol(format!(
                    "correlation id {id} is already pending"
                )))
            }
            Entry::Vacant(slot) => {
                let (sender, receiver) = oneshot::channel();
                slot.insert(PendingEntry {
                    sender,
                    sub_type,
                    created: Instant::now(),
                });
                Ok(receiver)
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Deliver a reply. Returns false if nothing was waiting for `id`.
    pub fn resolve(&self, id: &str, reply: Reply) -> bool {
        match self.entries.remove(id) {
            Some((_, entry)) => {
                debug!(
                    %id,
                    sub_type = %entry.sub_type,
                    elapsed = ?entry.created.elapsed(),
                    ok = reply.is_ok(),
                    "Resolved pending request"
                );
                // The waiter may be gone already, that is fine
                let _ = entry.sender.send(reply);
                true
            }
            None => false,
        }
    }

    /// Drop a waiter without answering it
    pub fn evict(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Drop the entry under `id` only if its waiter has hung up.
    ///
    /// A resolved id may be registered again by a later request, which must
    /// survive the earlier waiter going away.
    pub fn evict_abandoned(&self, id: &str) -> bool {
        self.entries
            .remove_if(id, |_, entry| entry.sender.is_closed())
            .is_some()
    }

    /// Drop every waiter; they observe [`RelayError::Stopped`]
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Future of a correlated reply.
///
/// The request is already on the wire when this exists. Dropping it before
/// completion evicts the entry.
pub struct PendingReply {
    id: String,
    receiver: oneshot::Receiver<Reply>,
    deadline: Option<Pin<Box<Sleep>>>,
    table: Arc<PendingRequests>,
    finished: bool,
}

impl PendingReply {
    pub(crate) fn new(
        id: String,
        receiver: oneshot::Receiver<Reply>,
        timeout: Option<Duration>,
        table: Arc<PendingRequests>,
    ) -> Self {
        Self {
            id,
            receiver,
            deadline: timeout.map(|t| Box::pin(tokio::time::sleep(t))),
            table,
            finished: false,
        }
    }

    /// Correlation id of the request
    pub fn id(&self) -> &str {
        &self.id
    }

    fn abandon(&mut self) {
        self.finished = true;
        self.receiver.close();
        self.table.evict_abandoned(&self.id);
    }
}

impl Future for PendingReply {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Poll::Ready(outcome) = Pin::new(&mut this.receiver).poll(cx) {
            this.finished = true;
            return Poll::Ready(match outcome {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(message)) => Err(RelayError::Rejected(message)),
                Err(_) => Err(RelayError::Stopped),
            });
        }

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                this.abandon();
                warn!(id = %this.id, "Request timed out");
                return Poll::Ready(Err(RelayError::Timeout(this.id.clone())));
            }
        }

        Poll::Pending
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.finished {
            self.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_id_refused() {
        let table = PendingRequests::new();
        let _rx = table.register("abc", SubType::Contact).unwrap();
        assert!(table.register("abc", SubType::Group).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_resolve_once() {
        let table = PendingRequests::new();
        let mut rx = table.register("abc", SubType::Contact).unwrap();

        assert!(table.resolve("abc", Ok(Value::from(1))));
        assert!(!table.resolve("abc", Ok(Value::from(2))));
        assert_eq!(rx.try_recv().unwrap(), Ok(Value::from(1)));
    }

    #[tokio::test]
    async fn test_reply_future_maps_outcomes() {
        let table = Arc::new(PendingRequests::new());

        let rx = table.register("ok", SubType::Avatar).unwrap();
        let reply = PendingReply::new("ok".into(), rx, None, table.clone());
        table.resolve("ok", Ok(Value::from("png")));
        assert_eq!(reply.await.unwrap(), Value::from("png"));

        let rx = table.register("no", SubType::Group).unwrap();
        let reply = PendingReply::new("no".into(), rx, None, table.clone());
        table.resolve("no", Err("notAllowed".into()));
        assert!(matches!(reply.await, Err(RelayError::Rejected(m)) if m == "notAllowed"));

        let rx = table.register("gone", SubType::Group).unwrap();
        let reply = PendingReply::new("gone".into(), rx, None, table.clone());
        table.clear();
        assert!(matches!(reply.await, Err(RelayError::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_evicts_and_late_reply_is_ignored() {
        let table = Arc::new(PendingRequests::new());
        let rx = table.register("slow", SubType::Blob).unwrap();
        let reply = PendingReply::new(
            "slow".into(),
            rx,
            Some(Duration::from_secs(5)),
            table.clone(),
        );

        assert!(matches!(reply.await, Err(RelayError::Timeout(_))));
        assert!(table.is_empty());
        assert!(!table.resolve("slow", Ok(Value::Nil)));
    }

    #[test]
    fn test_dropping_reply_evicts() {
        let table = Arc::new(PendingRequests::new());
        let rx = table.register("x", SubType::Read).unwrap();
        let reply = PendingReply::new("x".into(), rx, None, table.clone());
        drop(reply);
        assert!(table.is_empty());
    }

    #[test]
    fn test_dropping_resolved_reply_spares_reused_id() {
        let table = Arc::new(PendingRequests::new());
        let rx = table.register("x", SubType::Avatar).unwrap();
        let first = PendingReply::new("x".into(), rx, None, table.clone());
        assert!(table.resolve("x", Ok(Value::from(1))));

        let mut second = table.register("x", SubType::Avatar).unwrap();
        drop(first);

        assert!(table.contains("x"));
        assert!(table.resolve("x", Ok(Value::from(2))));
        assert_eq!(second.try_recv().unwrap(), Ok(Value::from(2)));
    }
}
