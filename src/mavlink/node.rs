//! MAVLink Protocol Node
//!
//! Accepts simulator connections on an endpoint and turns each one into a
//! channel: a reader task decoding MAVLink v2 frames into [`NodeEvent`]s and
//! a writer task encoding outbound messages for that channel only.

use crate::transport::{EndpointListener, TransportStream};
use mavlink::ardupilotmega::MavMessage;
use mavlink::async_peek_reader::AsyncPeekReader;
use mavlink::error::MessageReadError;
use mavlink::MavHeader;
use sitl_bridge_shared::{BridgeError, ChannelId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Inbound events produced by the node
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A peer connected and was assigned a channel
    ChannelOpened { channel: ChannelId, peer: SocketAddr },
    /// A decoded frame arrived on a channel
    Frame {
        channel: ChannelId,
        header: MavHeader,
        message: MavMessage,
    },
    /// The channel is gone (peer hung up, read error or node closed)
    ChannelClosed { channel: ChannelId, reason: String },
}

/// Pause before accepting again after a failed accept
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Receiver for node events
pub type NodeEventReceiver = mpsc::Receiver<NodeEvent>;

/// Typed outbound send operation, scoped by channel
pub trait MessageRouter: Send + Sync {
    fn send_to(&self, channel: ChannelId, message: MavMessage) -> Result<(), BridgeError>;
}

/// Configuration for outbound framing
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// System ID stamped on outbound frames
    pub system_id: u8,
    /// Component ID stamped on outbound frames
    pub component_id: u8,
    /// Capacity of the inbound event queue
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            system_id: 255,
            component_id: 1,
            event_capacity: 100,
        }
    }
}

type ChannelTable = Arc<RwLock<HashMap<ChannelId, mpsc::UnboundedSender<MavMessage>>>>;

/// Cloneable handle to a running node
#[derive(Clone)]
pub struct NodeHandle {
    channels: ChannelTable,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl NodeHandle {
    /// Address the node's endpoint is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Channels with a live writer
    pub fn channels(&self) -> Vec<ChannelId> {
        let table = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<ChannelId> = table.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Stop accepting and tear down every channel. Safe to call repeatedly.
    pub fn close(&self) {
        if !self.is_closed() {
            info!(
                channels = self.channels().len(),
                "Closing MAVLink node on {}", self.local_addr
            );
        }
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl MessageRouter for NodeHandle {
    fn send_to(&self, channel: ChannelId, message: MavMessage) -> Result<(), BridgeError> {
        let table = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        let writer = table
            .get(&channel)
            .ok_or(BridgeError::UnknownChannel(channel))?;
        writer
            .send(message)
            .map_err(|_| BridgeError::ChannelClosed(channel))
    }
}

/// MAVLink node serving one listening endpoint
pub struct MavNode;

impl MavNode {
    /// Start accepting connections on `listener`.
    ///
    /// Returns a handle for outbound traffic and the inbound event stream.
    /// The accept loop runs until [`NodeHandle::close`] is called.
    pub fn start<L: EndpointListener>(
        listener: L,
        config: NodeConfig,
    ) -> anyhow::Result<(NodeHandle, NodeEventReceiver)> {
        let local_addr = listener.local_addr()?;
        let (event_tx, event_rx) = mpsc::channel::<NodeEvent>(config.event_capacity);

        let handle = NodeHandle {
            channels: Arc::new(RwLock::new(HashMap::new())),
            local_addr,
            cancel: CancellationToken::new(),
        };

        info!(
            "MAVLink node listening on {} ({})",
            local_addr,
            listener.name()
        );

        let accept_handle = handle.clone();
        tokio::spawn(async move {
            accept_loop(listener, config, accept_handle, event_tx).await;
        });

        Ok((handle, event_rx))
    }
}

/// Accept peers until the node is cancelled
async fn accept_loop<L: EndpointListener>(
    listener: L,
    config: NodeConfig,
    handle: NodeHandle,
    event_tx: mpsc::Sender<NodeEvent>,
) {
    let next_channel = AtomicU64::new(1);

    loop {
        let accepted = tokio::select! {
            _ = handle.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let channel = ChannelId(next_channel.fetch_add(1, Ordering::SeqCst));
                open_channel(channel, peer, stream, &config, &handle, &event_tx).await;
            }
            Err(e) => {
                error!("Accept failed on {}: {}", handle.local_addr, e);
                tokio::select! {
                    _ = handle.cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                }
            }
        }
    }

    debug!("Accept loop on {} stopped", handle.local_addr);
}

async fn open_channel<S: TransportStream>(
    channel: ChannelId,
    peer: SocketAddr,
    stream: S,
    config: &NodeConfig,
    handle: &NodeHandle,
    event_tx: &mpsc::Sender<NodeEvent>,
) {
    let (reader, writer) = tokio::io::split(stream);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<MavMessage>();

    handle
        .channels
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(channel, outbound_tx);

    info!(channel = %channel, peer = %peer, "Channel opened");
    let _ = event_tx
        .send(NodeEvent::ChannelOpened { channel, peer })
        .await;

    let channel_cancel = handle.cancel.child_token();

    let header = MavHeader {
        system_id: config.system_id,
        component_id: config.component_id,
        sequence: 0,
    };
    let writer_cancel = channel_cancel.clone();
    tokio::spawn(async move {
        write_loop(channel, writer, header, outbound_rx, writer_cancel).await;
    });

    let channels = handle.channels.clone();
    let event_tx = event_tx.clone();
    tokio::spawn(async move {
        let reason = read_loop(channel, reader, &event_tx, &channel_cancel).await;

        // Drop the writer's sender and stop it
        channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel);
        channel_cancel.cancel();

        info!(channel = %channel, reason = %reason, "Channel closed");
        let _ = event_tx
            .send(NodeEvent::ChannelClosed { channel, reason })
            .await;
    });
}

/// Decode frames until the peer goes away. Returns the close reason.
async fn read_loop<R: AsyncRead + Unpin>(
    channel: ChannelId,
    reader: R,
    event_tx: &mpsc::Sender<NodeEvent>,
    cancel: &CancellationToken,
) -> String {
    let mut reader = AsyncPeekReader::new(reader);

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return "node closed".to_string(),
            result = mavlink::read_v2_msg_async::<MavMessage, _>(&mut reader) => result,
        };

        match result {
            Ok((header, message)) => {
                let event = NodeEvent::Frame {
                    channel,
                    header,
                    message,
                };
                if event_tx.send(event).await.is_err() {
                    return "event consumer gone".to_string();
                }
            }
            Err(MessageReadError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return "peer disconnected".to_string();
            }
            Err(MessageReadError::Io(e)) => {
                warn!(channel = %channel, "Read error: {}", e);
                return format!("read error: {}", e);
            }
            Err(e) => {
                debug!(channel = %channel, "Dropping undecodable frame: {}", e);
            }
        }
    }
}

/// Encode outbound messages for one channel
async fn write_loop<W: AsyncWrite + Unpin>(
    channel: ChannelId,
    mut writer: W,
    mut header: MavHeader,
    mut outbound_rx: mpsc::UnboundedReceiver<MavMessage>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = outbound_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if let Err(e) = mavlink::write_v2_msg_async(&mut writer, header, &message).await {
            warn!(channel = %channel, "Write error: {}", e);
            cancel.cancel();
            break;
        }
        header.sequence = header.sequence.wrapping_add(1);
    }

    let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpEndpoint;
    use mavlink::ardupilotmega::{
        MavAutopilot, MavModeFlag, MavState, MavType, HEARTBEAT_DATA,
    };
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    fn heartbeat() -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_PX4,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_STANDBY,
            mavlink_version: 3,
        })
    }

    async fn next_event(events: &mut NodeEventReceiver) -> NodeEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for node event")
            .expect("node event stream ended")
    }

    #[tokio::test]
    async fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.system_id, 255);
        assert_eq!(config.component_id, 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_channel() {
        let endpoint = TcpEndpoint::bind("127.0.0.1:0").await.unwrap();
        let (handle, _events) = MavNode::start(endpoint, NodeConfig::default()).unwrap();

        let err = handle.send_to(ChannelId(42), heartbeat()).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownChannel(ChannelId(42))));
        handle.close();
        handle.close();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_loopback_frame_round_trip() {
        let endpoint = TcpEndpoint::bind("127.0.0.1:0").await.unwrap();
        let (handle, mut events) = MavNode::start(endpoint, NodeConfig::default()).unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        let channel = match next_event(&mut events).await {
            NodeEvent::ChannelOpened { channel, .. } => channel,
            other => panic!("unexpected event: {:?}", other),
        };

        let client_header = MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: 0,
        };
        mavlink::write_v2_msg_async(&mut client, client_header, &heartbeat())
            .await
            .unwrap();

        match next_event(&mut events).await {
            NodeEvent::Frame {
                channel: from,
                header,
                message,
            } => {
                assert_eq!(from, channel);
                assert_eq!(header.system_id, 1);
                assert!(matches!(message, MavMessage::HEARTBEAT(_)));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        handle.send_to(channel, heartbeat()).unwrap();

        let mut reader = AsyncPeekReader::new(&mut client);
        let (header, message) = timeout(
            Duration::from_secs(5),
            mavlink::read_v2_msg_async::<MavMessage, _>(&mut reader),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(header.system_id, 255);
        assert!(matches!(message, MavMessage::HEARTBEAT(_)));

        handle.close();
    }

    #[tokio::test]
    async fn test_peer_hangup_closes_channel() {
        let endpoint = TcpEndpoint::bind("127.0.0.1:0").await.unwrap();
        let (handle, mut events) = MavNode::start(endpoint, NodeConfig::default()).unwrap();

        let client = TcpStream::connect(handle.local_addr()).await.unwrap();
        let channel = match next_event(&mut events).await {
            NodeEvent::ChannelOpened { channel, .. } => channel,
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(handle.channels(), vec![channel]);

        drop(client);

        match next_event(&mut events).await {
            NodeEvent::ChannelClosed { channel: closed, .. } => assert_eq!(closed, channel),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(handle.channels().is_empty());
        assert!(matches!(
            handle.send_to(channel, heartbeat()),
            Err(BridgeError::UnknownChannel(_))
        ));
    }

    struct FailingListener {
        attempts: Arc<AtomicU64>,
    }

    #[async_trait::async_trait]
    impl EndpointListener for FailingListener {
        type Stream = crate::transport::tcp::TcpTransportStream;

        async fn accept(&self) -> anyhow::Result<(Self::Stream, SocketAddr)> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::from_raw_os_error(24).into())
        }

        fn local_addr(&self) -> anyhow::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_accept_backs_off() {
        let attempts = Arc::new(AtomicU64::new(0));
        let listener = FailingListener {
            attempts: attempts.clone(),
        };
        let (handle, _events) = MavNode::start(listener, NodeConfig::default()).unwrap();

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let seen = attempts.load(Ordering::SeqCst);
        assert!((5..=12).contains(&seen), "accept attempts: {}", seen);

        handle.close();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), seen);
    }
}
