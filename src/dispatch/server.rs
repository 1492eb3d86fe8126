//! Bridge server: routes inbound MAVLink traffic to per-channel sessions

use crate::config::BridgeConfig;
use crate::mavlink::telemetry::heartbeat_reply;
use crate::mavlink::{MavNode, MessageRouter, NodeEvent, NodeEventReceiver, NodeHandle};
use crate::session::{SendMessage, SessionManager, SimSession, StepRequest};
use crate::transport::TcpEndpoint;
use anyhow::{Context, Result};
use mavlink::ardupilotmega::{MavMessage, HEARTBEAT_DATA};
use mavlink::{MavHeader, Message};
use sitl_bridge_shared::state_machine::ModeTransition;
use sitl_bridge_shared::{ChannelId, StepPacer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Accepts autopilot connections and dispatches their messages
pub struct BridgeServer {
    router: Arc<dyn MessageRouter>,
    sessions: SessionManager,
    pacer: StepPacer,
    node: Option<NodeHandle>,
    cancel: CancellationToken,
}

impl BridgeServer {
    /// Create a server that writes through `router`
    pub fn new(router: Arc<dyn MessageRouter>, pacer: StepPacer) -> Self {
        Self {
            router,
            sessions: SessionManager::new(),
            pacer,
            node: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Bind the listening endpoint and start accepting connections.
    ///
    /// A bind failure is fatal: the bridge has nothing to do without it.
    pub async fn connect(config: &BridgeConfig) -> Result<(Self, NodeEventReceiver)> {
        let endpoint = TcpEndpoint::bind(&config.listen)
            .await
            .context("start MAVLink endpoint")?;
        let (node, events) = MavNode::start(endpoint, config.node_config())?;

        info!("Server started at {}", node.local_addr());

        let mut server = Self::new(Arc::new(node.clone()), config.pacer());
        server.node = Some(node);
        Ok((server, events))
    }

    /// Consume inbound events until the stream ends or the server is closed
    pub async fn listen(&self, mut events: NodeEventReceiver) {
        loop {
            let event = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event).await;
        }

        debug!("Dispatcher loop stopped");
    }

    /// Route a single node event
    pub async fn handle_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::ChannelOpened { channel, peer } => {
                debug!(channel = %channel, peer = %peer, "Awaiting first message");
            }
            NodeEvent::Frame {
                channel,
                header,
                message,
            } => {
                self.handle_frame(channel, &header, message).await;
            }
            NodeEvent::ChannelClosed { channel, reason } => {
                if self.sessions.remove(channel).await {
                    info!(channel = %channel, reason = %reason, "Unregistered connection");
                }
            }
        }
    }

    async fn handle_frame(&self, channel: ChannelId, header: &MavHeader, message: MavMessage) {
        let Some(session) = self.session_for(channel, header).await else {
            debug!(channel = %channel, "Server closed, frame dropped");
            return;
        };

        match message {
            MavMessage::HEARTBEAT(heartbeat) => {
                self.exchange_heartbeat(&session, &heartbeat, header);
            }
            MavMessage::HIL_ACTUATOR_CONTROLS(controls) => {
                if let ModeTransition::Changed { .. } = session.enter_lock_step() {
                    info!(
                        channel = %channel,
                        system_id = header.system_id,
                        component_id = header.component_id,
                        "Actuator controls received. Switching to lock-step mode"
                    );
                }
                session.request_step(StepRequest::on_controls(controls)).await;
            }
            other => {
                debug!(
                    channel = %channel,
                    system_id = header.system_id,
                    component_id = header.component_id,
                    message_id = other.message_id(),
                    "Message received"
                );
            }
        }
    }

    /// Find the channel's session, registering a new one on first contact.
    /// `None` once the server is closed.
    async fn session_for(&self, channel: ChannelId, header: &MavHeader) -> Option<Arc<SimSession>> {
        let router = self.router.clone();
        let pacer = self.pacer;

        let (session, created) = self
            .sessions
            .get_or_register(channel, move || {
                let send: SendMessage = Arc::new(move |message| {
                    if let Err(e) = router.send_to(channel, message) {
                        debug!(channel = %channel, "Dropping outbound message: {}", e);
                    }
                });
                SimSession::new(channel, pacer, send)
            })
            .await?;

        if created {
            info!(
                channel = %channel,
                system_id = header.system_id,
                component_id = header.component_id,
                "Registered new connection"
            );
        }
        Some(session)
    }

    fn exchange_heartbeat(&self, session: &SimSession, heartbeat: &HEARTBEAT_DATA, header: &MavHeader) {
        if session.set_autopilot(heartbeat.autopilot) {
            info!(
                channel = %session.channel(),
                system_id = header.system_id,
                component_id = header.component_id,
                autopilot = ?heartbeat.autopilot,
                "Update session settings"
            );
        }

        session.send(heartbeat_reply());

        debug!(
            channel = %session.channel(),
            system_id = header.system_id,
            component_id = header.component_id,
            "Heartbeats exchanged"
        );
    }

    /// Stop the endpoint, the dispatcher loop and every session.
    /// Safe to call more than once.
    pub async fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!(sessions = self.sessions.count().await, "Closing bridge server");
        }
        self.cancel.cancel();
        if let Some(node) = &self.node {
            node.close();
        }
        self.sessions.close_all().await;
    }
}
