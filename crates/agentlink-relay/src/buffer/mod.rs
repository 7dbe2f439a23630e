//! Per-agent offline queuing for `chat.request` frames.

mod manager;

pub use manager::{Enqueue, OfflineQueue, QueuedRequest, MAX_DELIVERY_ATTEMPTS};
