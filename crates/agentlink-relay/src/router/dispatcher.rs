//! The relay router: admission, chat routing, presence, and connection
//! health.
//!
//! The router never touches sockets. Every delivery goes onto the
//! destination handle's writer channel, so frames from one source reach a
//! destination in the order they were sent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use agentlink_core::unix_timestamp;

use crate::buffer::{Enqueue, OfflineQueue, QueuedRequest};
use crate::config::RelayConfig;
use crate::protocol::{ErrorCode, Frame, CLOSE_CONFLICT, CLOSE_IDLE};
use crate::registry::{AgentHandle, ClientHandle, ConnectionRegistry, Outbound};
use crate::storage::RelayDatabase;

/// Routes frames between agent and client connections.
pub struct Router {
    registry: ConnectionRegistry,
    queue: Arc<OfflineQueue>,
    db: RelayDatabase,
    config: Arc<RelayConfig>,
}

impl Router {
    pub fn new(
        registry: ConnectionRegistry,
        queue: Arc<OfflineQueue>,
        db: RelayDatabase,
        config: Arc<RelayConfig>,
    ) -> Self {
        Self {
            registry,
            queue,
            db,
            config,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Admit a verified agent connection.
    ///
    /// Evicts any previous handle for the id (closed with `CONFLICT`),
    /// announces presence to bound clients, and drains the offline queue.
    /// A takeover emits no extra presence: clients already saw the agent
    /// online and it never stopped being so.
    pub async fn admit_agent(
        &self,
        agent_id: &str,
        tenant_id: Option<String>,
        tx: mpsc::Sender<Outbound>,
    ) -> Arc<AgentHandle> {
        let (handle, evicted) = self
            .registry
            .register_agent(agent_id.to_string(), tenant_id, tx)
            .await;

        match evicted {
            Some(old) => {
                info!(agent_id = %agent_id, "Agent takeover, evicting previous connection");
                old.close(CLOSE_CONFLICT, "CONFLICT").await;
            }
            None => self.broadcast_presence(agent_id, true).await,
        }

        self.drain_offline(&handle).await;

        if let Err(e) = self.db.touch_agent_last_seen(agent_id).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to touch agent last-seen");
        }

        handle
    }

    /// Tear down an agent connection. Only the live handle's owner changes
    /// state; a reader whose handle was evicted is a no-op here.
    pub async fn remove_agent(&self, agent_id: &str, conn_id: u64) {
        if self.registry.unregister_agent(agent_id, conn_id).await {
            self.broadcast_presence(agent_id, false).await;
            if let Err(e) = self.db.touch_agent_last_seen(agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "Failed to touch agent last-seen");
            }
        }
    }

    /// Admit a verified client connection and send it a presence snapshot
    /// for its bound agent.
    pub async fn admit_client(
        &self,
        agent_id: &str,
        device_id: &str,
        tx: mpsc::Sender<Outbound>,
    ) -> Arc<ClientHandle> {
        let (handle, evicted) = self
            .registry
            .register_client(agent_id.to_string(), device_id.to_string(), tx)
            .await;

        if let Some(old) = evicted {
            old.close(CLOSE_CONFLICT, "CONFLICT").await;
        }

        let online = self.registry.agent_online(agent_id).await;
        handle.send(Frame::presence(agent_id, online)).await;

        if let Err(e) = self.db.touch_device_last_seen(device_id).await {
            warn!(device_id = %device_id, error = %e, "Failed to touch device last-seen");
        }

        handle
    }

    /// Tear down a client connection.
    pub async fn remove_client(&self, agent_id: &str, device_id: &str, conn_id: u64) {
        if self
            .registry
            .unregister_client(agent_id, device_id, conn_id)
            .await
        {
            if let Err(e) = self.db.touch_device_last_seen(device_id).await {
                warn!(device_id = %device_id, error = %e, "Failed to touch device last-seen");
            }
        }
    }

    /// Route a `chat.request` from a client toward its agent.
    pub async fn handle_chat_request(&self, client: &ClientHandle, frame: Frame) {
        let Frame::ChatRequest {
            request_id,
            agent_id,
            session_id,
            text,
            ..
        } = frame
        else {
            return;
        };

        if agent_id != client.agent_id {
            client
                .send(Frame::request_error(
                    request_id,
                    ErrorCode::Unauthorized,
                    "agent_id does not match this device's pairing",
                ))
                .await;
            return;
        }

        if text.len() > self.config.msg_max_bytes {
            client
                .send(Frame::request_error(
                    request_id,
                    ErrorCode::MessageTooLarge,
                    format!("text exceeds {} bytes", self.config.msg_max_bytes),
                ))
                .await;
            return;
        }

        // Forward verbatim apart from the server timestamp.
        let outbound = Frame::ChatRequest {
            request_id: request_id.clone(),
            agent_id: agent_id.clone(),
            session_id,
            text,
            ts: Frame::now_ts(),
        };

        if let Some(agent) = self.registry.get_agent(&agent_id).await {
            if agent.send(outbound.clone()).await {
                client.send(Frame::message_sent(request_id)).await;
                return;
            }
            // The agent's writer is gone; fall through to the queue.
            debug!(agent_id = %agent_id, "Agent writer closed mid-route, queuing");
        }

        match self
            .queue
            .enqueue(&agent_id, &request_id, outbound, unix_timestamp())
            .await
        {
            Enqueue::Queued { displaced } => {
                if let Some(old) = displaced {
                    debug!(agent_id = %agent_id, displaced = %old, "Offline queue displaced oldest entry");
                }
                client.send(Frame::message_sent(request_id)).await;
            }
            Enqueue::Rejected => {
                client
                    .send(Frame::request_error(
                        request_id,
                        ErrorCode::AgentOffline,
                        "agent is offline",
                    ))
                    .await;
            }
        }
    }

    /// Fan a `chat.response` from an agent out to every live client bound
    /// to it. The relay does not track request ownership; all of the
    /// agent's devices observe the session. Responses are never queued.
    pub async fn handle_chat_response(&self, agent: &AgentHandle, frame: Frame) {
        let Frame::ChatResponse {
            request_id,
            session_id,
            reply,
            text,
            message,
            ts,
            ..
        } = frame
        else {
            return;
        };

        let body = crate::protocol::response_body(
            reply.as_deref(),
            text.as_deref(),
            message.as_deref(),
        )
        .map(str::to_string);

        let outbound = Frame::ChatResponse {
            request_id,
            agent_id: Some(agent.agent_id.clone()),
            session_id,
            reply: body,
            text: None,
            message: None,
            ts: ts.or_else(Frame::now_ts),
        };

        for client in self.registry.clients_for_agent(&agent.agent_id).await {
            client.send(outbound.clone()).await;
        }
    }

    /// Re-send the presence snapshot to a client on request.
    pub async fn handle_presence_request(&self, client: &ClientHandle) {
        let online = self.registry.agent_online(&client.agent_id).await;
        client.send(Frame::presence(&client.agent_id, online)).await;
    }

    /// Emit a presence event to every client bound to an agent.
    pub async fn broadcast_presence(&self, agent_id: &str, online: bool) {
        let clients = self.registry.clients_for_agent(agent_id).await;
        if clients.is_empty() {
            return;
        }

        debug!(agent_id = %agent_id, online, fanout = clients.len(), "Broadcasting presence");
        let frame = Frame::presence(agent_id, online);
        for client in clients {
            client.send(frame.clone()).await;
        }
    }

    /// Deliver queued requests to a newly admitted agent in insertion
    /// order. An entry that fails to send is charged one attempt and put
    /// back, along with everything behind it, for the next admission.
    async fn drain_offline(&self, agent: &Arc<AgentHandle>) {
        let now = unix_timestamp();
        let entries = self.queue.drain(&agent.agent_id, now).await;
        if entries.is_empty() {
            return;
        }

        let total = entries.len();
        let mut delivered = 0usize;
        let mut iter = entries.into_iter();

        while let Some(mut entry) = iter.next() {
            if agent.send(entry.frame.clone()).await {
                delivered += 1;
                continue;
            }

            entry.attempts += 1;
            let mut leftover: Vec<QueuedRequest> = vec![entry];
            leftover.extend(iter);
            self.queue.requeue_front(&agent.agent_id, leftover).await;

            warn!(
                agent_id = %agent.agent_id,
                delivered,
                total,
                "Agent went away mid-drain, requeued remainder"
            );
            return;
        }

        info!(agent_id = %agent.agent_id, delivered, "Offline queue drained");
    }

    /// One maintenance pass: reap idle handles, ping the rest, and sweep
    /// expired queue entries.
    pub async fn maintenance_tick(&self, now: i64) {
        for agent in self.registry.all_agents().await {
            if agent.idle_secs(now) > self.config.idle_timeout_secs {
                info!(agent_id = %agent.agent_id, "Closing idle agent connection");
                agent.close(CLOSE_IDLE, "IDLE_TIMEOUT").await;
                self.remove_agent(&agent.agent_id, agent.conn_id).await;
            } else {
                agent.send(Frame::ping()).await;
            }
        }

        for client in self.registry.all_clients().await {
            if client.idle_secs(now) > self.config.idle_timeout_secs {
                info!(
                    agent_id = %client.agent_id,
                    device_id = %client.device_id,
                    "Closing idle client connection"
                );
                client.close(CLOSE_IDLE, "IDLE_TIMEOUT").await;
                self.remove_client(&client.agent_id, &client.device_id, client.conn_id)
                    .await;
            } else {
                client.send(Frame::ping()).await;
            }
        }

        self.queue.sweep(now).await;
    }

    /// Spawn the periodic maintenance loop.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        let interval = Duration::from_secs(router.config.ping_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                router.maintenance_tick(unix_timestamp()).await;
            }
        })
    }
}
