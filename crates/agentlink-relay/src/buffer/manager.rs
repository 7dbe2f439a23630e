//! Bounded in-memory offline queues.
//!
//! When an agent is offline, `chat.request` frames toward it are held in a
//! per-agent queue and delivered in insertion order on reconnect. Queues
//! live in process memory only: they start empty on boot and message
//! bodies never touch the store. `chat.response` frames are never queued.

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::protocol::Frame;

/// Deliveries attempted per entry before it is discarded.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// A queued `chat.request` awaiting its agent.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub request_id: String,
    pub frame: Frame,
    pub enqueued_at: i64,
    pub attempts: u32,
}

impl QueuedRequest {
    fn expired(&self, now: i64, ttl_secs: i64) -> bool {
        now - self.enqueued_at >= ttl_secs
    }
}

/// Outcome of an enqueue.
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueue {
    /// Entry accepted; the oldest entry's request id when one was
    /// displaced to stay within the bound.
    Queued { displaced: Option<String> },
    /// Queuing is disabled (zero bound).
    Rejected,
}

/// Manages the offline queues for every absent agent.
pub struct OfflineQueue {
    queues: Mutex<HashMap<String, VecDeque<QueuedRequest>>>,
    max_entries: usize,
    ttl_secs: i64,
}

impl OfflineQueue {
    pub fn new(max_entries: usize, ttl_secs: i64) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            max_entries,
            ttl_secs,
        }
    }

    /// Queue a request for an offline agent. When the queue is at its
    /// bound, the oldest entry is dropped so the newest is preserved.
    pub async fn enqueue(
        &self,
        agent_id: &str,
        request_id: &str,
        frame: Frame,
        now: i64,
    ) -> Enqueue {
        if self.max_entries == 0 {
            return Enqueue::Rejected;
        }

        let mut queues = self.queues.lock().await;
        let queue = queues.entry(agent_id.to_string()).or_default();

        queue.retain(|entry| !entry.expired(now, self.ttl_secs));

        let mut displaced = None;
        while queue.len() >= self.max_entries {
            if let Some(evicted) = queue.pop_front() {
                displaced = Some(evicted.request_id);
            }
        }

        queue.push_back(QueuedRequest {
            request_id: request_id.to_string(),
            frame,
            enqueued_at: now,
            attempts: 0,
        });

        debug!(
            agent_id = %agent_id,
            request_id = %request_id,
            depth = queue.len(),
            "Request queued for offline agent"
        );

        Enqueue::Queued { displaced }
    }

    /// Take every live entry for an agent, in insertion order, removing
    /// the queue. Expired entries are discarded on the way out.
    pub async fn drain(&self, agent_id: &str, now: i64) -> Vec<QueuedRequest> {
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.remove(agent_id) else {
            return Vec::new();
        };

        let (live, expired): (Vec<_>, Vec<_>) = queue
            .into_iter()
            .partition(|entry| !entry.expired(now, self.ttl_secs));

        if !expired.is_empty() {
            info!(
                agent_id = %agent_id,
                expired = expired.len(),
                "Dropped expired queued requests on drain"
            );
        }

        live
    }

    /// Put undelivered entries back at the head of the queue, preserving
    /// order. Each entry's attempt counter has been charged by the caller;
    /// entries out of attempts are discarded.
    pub async fn requeue_front(&self, agent_id: &str, entries: Vec<QueuedRequest>) {
        let kept: Vec<_> = entries
            .into_iter()
            .filter(|entry| entry.attempts < MAX_DELIVERY_ATTEMPTS)
            .collect();

        if kept.is_empty() {
            return;
        }

        let mut queues = self.queues.lock().await;
        let queue = queues.entry(agent_id.to_string()).or_default();
        for entry in kept.into_iter().rev() {
            queue.push_front(entry);
        }
    }

    /// Drop expired entries everywhere and remove empty queues. Returns
    /// the number of entries discarded.
    pub async fn sweep(&self, now: i64) -> usize {
        let mut queues = self.queues.lock().await;
        let mut dropped = 0;

        queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|entry| !entry.expired(now, self.ttl_secs));
            dropped += before - queue.len();
            !queue.is_empty()
        });

        if dropped > 0 {
            info!(dropped, "Swept expired offline-queue entries");
        }
        dropped
    }

    /// Queue depth for an agent.
    pub async fn depth(&self, agent_id: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(agent_id)
            .map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> Frame {
        Frame::ChatRequest {
            request_id: id.to_string(),
            agent_id: "a1".to_string(),
            session_id: "s1".to_string(),
            text: "hello".to_string(),
            ts: None,
        }
    }

    #[tokio::test]
    async fn drains_in_insertion_order() {
        let queue = OfflineQueue::new(10, 60);

        for id in ["r1", "r2", "r3"] {
            queue.enqueue("a1", id, request(id), 100).await;
        }

        let drained = queue.drain("a1", 110).await;
        let ids: Vec<_> = drained.iter().map(|e| e.request_id.as_str()).collect();
        assert_eq!(ids, ["r1", "r2", "r3"]);

        // Queue is removed after drain.
        assert_eq!(queue.depth("a1").await, 0);
    }

    #[tokio::test]
    async fn bound_displaces_oldest() {
        let queue = OfflineQueue::new(10, 60);

        for i in 1..=12 {
            let id = format!("r{i}");
            let outcome = queue.enqueue("a1", &id, request(&id), 100).await;
            if i <= 10 {
                assert_eq!(outcome, Enqueue::Queued { displaced: None });
            }
        }

        assert_eq!(queue.depth("a1").await, 10);
        let drained = queue.drain("a1", 110).await;
        let ids: Vec<_> = drained.iter().map(|e| e.request_id.as_str()).collect();
        let expected: Vec<String> = (3..=12).map(|i| format!("r{i}")).collect();
        assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn displacement_reports_evicted_id() {
        let queue = OfflineQueue::new(2, 60);

        queue.enqueue("a1", "r1", request("r1"), 100).await;
        queue.enqueue("a1", "r2", request("r2"), 100).await;
        let outcome = queue.enqueue("a1", "r3", request("r3"), 100).await;

        assert_eq!(
            outcome,
            Enqueue::Queued {
                displaced: Some("r1".to_string())
            }
        );
    }

    #[tokio::test]
    async fn expired_entries_are_not_delivered() {
        let queue = OfflineQueue::new(10, 60);

        queue.enqueue("a1", "r1", request("r1"), 0).await;
        queue.enqueue("a1", "r2", request("r2"), 30).await;

        // At t=70 the first entry is past its 60 s TTL, the second is not.
        let drained = queue.drain("a1", 70).await;
        let ids: Vec<_> = drained.iter().map(|e| e.request_id.as_str()).collect();
        assert_eq!(ids, ["r2"]);
    }

    #[tokio::test]
    async fn zero_bound_rejects() {
        let queue = OfflineQueue::new(0, 60);
        let outcome = queue.enqueue("a1", "r1", request("r1"), 0).await;
        assert_eq!(outcome, Enqueue::Rejected);
    }

    #[tokio::test]
    async fn requeue_preserves_order_and_drops_spent_entries() {
        let queue = OfflineQueue::new(10, 60);

        queue.enqueue("a1", "r3", request("r3"), 100).await;

        let entries = vec![
            QueuedRequest {
                request_id: "r1".into(),
                frame: request("r1"),
                enqueued_at: 100,
                attempts: 1,
            },
            QueuedRequest {
                request_id: "r2".into(),
                frame: request("r2"),
                enqueued_at: 100,
                attempts: MAX_DELIVERY_ATTEMPTS,
            },
        ];
        queue.requeue_front("a1", entries).await;

        let drained = queue.drain("a1", 110).await;
        let ids: Vec<_> = drained.iter().map(|e| e.request_id.as_str()).collect();
        // r2 exhausted its attempts; r1 precedes the entry already queued.
        assert_eq!(ids, ["r1", "r3"]);
    }

    #[tokio::test]
    async fn sweep_drops_expired_and_empty_queues() {
        let queue = OfflineQueue::new(10, 60);

        queue.enqueue("a1", "r1", request("r1"), 0).await;
        queue.enqueue("a2", "r2", request("r2"), 50).await;

        let dropped = queue.sweep(65).await;
        assert_eq!(dropped, 1);
        assert_eq!(queue.depth("a1").await, 0);
        assert_eq!(queue.depth("a2").await, 1);
    }
}
