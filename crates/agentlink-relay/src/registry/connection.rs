//! Connection handles and the registry that owns them.
//!
//! The registry is the only owner of live handles; reader tasks hold an
//! `Arc` to their own handle and unregister it on exit. Writes to a peer
//! always go through the handle's bounded writer channel, never into the
//! socket directly, which keeps per-destination frame order FIFO.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use agentlink_core::unix_timestamp;

use crate::protocol::Frame;

/// What a writer task pulls off its channel: a frame to serialize, or an
/// instruction to close the socket.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    Close { code: u16, reason: &'static str },
}

/// Writer channel plus activity tracking, shared by both handle kinds.
struct Link {
    tx: mpsc::Sender<Outbound>,
    last_activity: AtomicI64,
}

impl Link {
    fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            tx,
            last_activity: AtomicI64::new(unix_timestamp()),
        }
    }

    async fn send(&self, frame: Frame) -> bool {
        self.tx.send(Outbound::Frame(frame)).await.is_ok()
    }

    async fn close(&self, code: u16, reason: &'static str) {
        let _ = self.tx.send(Outbound::Close { code, reason }).await;
    }

    fn touch(&self) {
        self.last_activity.store(unix_timestamp(), Ordering::Relaxed);
    }

    fn idle_secs(&self, now: i64) -> i64 {
        now - self.last_activity.load(Ordering::Relaxed)
    }
}

/// A live agent connection.
pub struct AgentHandle {
    pub agent_id: String,
    pub tenant_id: Option<String>,
    pub conn_id: u64,
    link: Link,
}

impl AgentHandle {
    /// Queue a frame for the agent's writer task.
    pub async fn send(&self, frame: Frame) -> bool {
        self.link.send(frame).await
    }

    /// Ask the writer task to close the socket.
    pub async fn close(&self, code: u16, reason: &'static str) {
        self.link.close(code, reason).await;
    }

    /// Record activity on this connection.
    pub fn touch(&self) {
        self.link.touch();
    }

    pub fn idle_secs(&self, now: i64) -> i64 {
        self.link.idle_secs(now)
    }
}

/// A live client connection, tagged by its bound agent and device.
pub struct ClientHandle {
    pub agent_id: String,
    pub device_id: String,
    pub conn_id: u64,
    link: Link,
}

impl ClientHandle {
    pub async fn send(&self, frame: Frame) -> bool {
        self.link.send(frame).await
    }

    pub async fn close(&self, code: u16, reason: &'static str) {
        self.link.close(code, reason).await;
    }

    pub fn touch(&self) {
        self.link.touch();
    }

    pub fn idle_secs(&self, now: i64) -> i64 {
        self.link.idle_secs(now)
    }
}

struct Inner {
    agents: HashMap<String, Arc<AgentHandle>>,
    clients: HashMap<(String, String), Arc<ClientHandle>>,
}

/// Thread-safe registry of live connections.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<Inner>>,
    next_conn_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                agents: HashMap::new(),
                clients: HashMap::new(),
            })),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Install an agent handle, atomically evicting any existing handle
    /// for the same agent id. Returns the new handle and the evicted one.
    pub async fn register_agent(
        &self,
        agent_id: String,
        tenant_id: Option<String>,
        tx: mpsc::Sender<Outbound>,
    ) -> (Arc<AgentHandle>, Option<Arc<AgentHandle>>) {
        let handle = Arc::new(AgentHandle {
            agent_id: agent_id.clone(),
            tenant_id,
            conn_id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            link: Link::new(tx),
        });

        let evicted = {
            let mut inner = self.inner.write().await;
            inner.agents.insert(agent_id.clone(), Arc::clone(&handle))
        };

        info!(agent_id = %agent_id, evicted = evicted.is_some(), "Agent connection registered");
        (handle, evicted)
    }

    /// Remove an agent handle, but only if it is still the live one for
    /// the id. A reader whose handle was evicted by a takeover must not
    /// tear down its successor.
    pub async fn unregister_agent(&self, agent_id: &str, conn_id: u64) -> bool {
        let mut inner = self.inner.write().await;
        match inner.agents.get(agent_id) {
            Some(handle) if handle.conn_id == conn_id => {
                inner.agents.remove(agent_id);
                info!(agent_id = %agent_id, "Agent connection unregistered");
                true
            }
            Some(_) => false,
            None => {
                warn!(agent_id = %agent_id, "Tried to unregister unknown agent connection");
                false
            }
        }
    }

    /// Get the live agent handle for an id.
    pub async fn get_agent(&self, agent_id: &str) -> Option<Arc<AgentHandle>> {
        self.inner.read().await.agents.get(agent_id).cloned()
    }

    /// Whether an agent is currently connected.
    pub async fn agent_online(&self, agent_id: &str) -> bool {
        self.inner.read().await.agents.contains_key(agent_id)
    }

    /// Install a client handle under `(agent_id, device_id)`, evicting any
    /// previous connection for the same device.
    pub async fn register_client(
        &self,
        agent_id: String,
        device_id: String,
        tx: mpsc::Sender<Outbound>,
    ) -> (Arc<ClientHandle>, Option<Arc<ClientHandle>>) {
        let handle = Arc::new(ClientHandle {
            agent_id: agent_id.clone(),
            device_id: device_id.clone(),
            conn_id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            link: Link::new(tx),
        });

        let evicted = {
            let mut inner = self.inner.write().await;
            inner
                .clients
                .insert((agent_id.clone(), device_id.clone()), Arc::clone(&handle))
        };

        info!(agent_id = %agent_id, device_id = %device_id, "Client connection registered");
        (handle, evicted)
    }

    /// Remove a client handle if it is still the live one for its key.
    pub async fn unregister_client(&self, agent_id: &str, device_id: &str, conn_id: u64) -> bool {
        let key = (agent_id.to_string(), device_id.to_string());
        let mut inner = self.inner.write().await;
        match inner.clients.get(&key) {
            Some(handle) if handle.conn_id == conn_id => {
                inner.clients.remove(&key);
                info!(agent_id = %agent_id, device_id = %device_id, "Client connection unregistered");
                true
            }
            _ => false,
        }
    }

    /// All live clients bound to an agent.
    pub async fn clients_for_agent(&self, agent_id: &str) -> Vec<Arc<ClientHandle>> {
        self.inner
            .read()
            .await
            .clients
            .values()
            .filter(|c| c.agent_id == agent_id)
            .cloned()
            .collect()
    }

    /// Snapshot of every live agent handle.
    pub async fn all_agents(&self) -> Vec<Arc<AgentHandle>> {
        self.inner.read().await.agents.values().cloned().collect()
    }

    /// Snapshot of every live client handle.
    pub async fn all_clients(&self) -> Vec<Arc<ClientHandle>> {
        self.inner.read().await.clients.values().cloned().collect()
    }

    pub async fn agent_count(&self) -> usize {
        self.inner.read().await.agents.len()
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
        mpsc::channel(16)
    }

    #[tokio::test]
    async fn register_and_get_agent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();

        let (handle, evicted) = registry.register_agent("a1".into(), None, tx).await;
        assert!(evicted.is_none());
        assert_eq!(handle.agent_id, "a1");

        assert!(registry.agent_online("a1").await);
        assert!(!registry.agent_online("a2").await);
        assert_eq!(registry.agent_count().await, 1);
    }

    #[tokio::test]
    async fn reregistration_evicts_previous_handle() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let (first, _) = registry.register_agent("a1".into(), None, tx1).await;
        let (second, evicted) = registry.register_agent("a1".into(), None, tx2).await;

        let evicted = evicted.expect("previous handle evicted");
        assert_eq!(evicted.conn_id, first.conn_id);
        assert_ne!(first.conn_id, second.conn_id);

        // At most one live handle per agent id.
        assert_eq!(registry.agent_count().await, 1);
        let live = registry.get_agent("a1").await.unwrap();
        assert_eq!(live.conn_id, second.conn_id);
    }

    #[tokio::test]
    async fn stale_unregister_leaves_successor_alone() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let (first, _) = registry.register_agent("a1".into(), None, tx1).await;
        let (_second, _) = registry.register_agent("a1".into(), None, tx2).await;

        // The evicted connection's reader finishing must not remove the
        // successor installed by the takeover.
        assert!(!registry.unregister_agent("a1", first.conn_id).await);
        assert!(registry.agent_online("a1").await);
    }

    #[tokio::test]
    async fn unregister_current_agent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();

        let (handle, _) = registry.register_agent("a1".into(), None, tx).await;
        assert!(registry.unregister_agent("a1", handle.conn_id).await);
        assert!(!registry.agent_online("a1").await);
    }

    #[tokio::test]
    async fn clients_are_keyed_by_agent_and_device() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let (tx3, _rx3) = channel();

        registry.register_client("a1".into(), "d1".into(), tx1).await;
        registry.register_client("a1".into(), "d2".into(), tx2).await;
        registry.register_client("a2".into(), "d3".into(), tx3).await;

        let bound = registry.clients_for_agent("a1").await;
        assert_eq!(bound.len(), 2);
        assert!(bound.iter().all(|c| c.agent_id == "a1"));
        assert_eq!(registry.client_count().await, 3);
    }

    #[tokio::test]
    async fn duplicate_device_connection_is_evicted() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let (first, _) = registry.register_client("a1".into(), "d1".into(), tx1).await;
        let (_second, evicted) = registry.register_client("a1".into(), "d1".into(), tx2).await;

        assert_eq!(evicted.unwrap().conn_id, first.conn_id);
        assert_eq!(registry.clients_for_agent("a1").await.len(), 1);
    }

    #[tokio::test]
    async fn send_delivers_through_writer_channel() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = channel();

        let (handle, _) = registry.register_agent("a1".into(), None, tx).await;
        assert!(handle.send(Frame::ping()).await);

        match rx.recv().await.unwrap() {
            Outbound::Frame(Frame::Ping { .. }) => {}
            other => panic!("unexpected outbound: {other:?}"),
        }

        handle.close(4409, "CONFLICT").await;
        match rx.recv().await.unwrap() {
            Outbound::Close { code, reason } => {
                assert_eq!(code, 4409);
                assert_eq!(reason, "CONFLICT");
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_tracking_moves_with_touch() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();

        let (handle, _) = registry.register_agent("a1".into(), None, tx).await;
        let now = unix_timestamp();
        assert!(handle.idle_secs(now) <= 1);
        assert!(handle.idle_secs(now + 400) >= 399);

        handle.touch();
        assert!(handle.idle_secs(unix_timestamp()) <= 1);
    }
}
