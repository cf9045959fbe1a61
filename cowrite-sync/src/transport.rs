//! Publish/subscribe transport abstraction.
//!
//! The replication core never opens sockets itself. A session is handed a
//! transport handle at construction and talks to it through [`Transport`]:
//!
//! ```text
//! SyncSession ── broadcast(kind, frame) ──► channel ──► other members
//!      ▲                                                     │
//!      └──── on_message() (mpsc) ◄───────────────────────────┘
//!      └──── on_connection_state_change() (watch)
//! ```
//!
//! [`MemoryHub`] is an in-process channel with the same shape, used by the
//! tests and by applications that run several replicas in one process.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::protocol::{MessageKind, PeerInfo};

/// Connectivity of the underlying channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Channel failed; treated like `Disconnected` by the session.
    Error,
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    ConnectionFailed(String),
    NotConnected,
    SendFailed(String),
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
            TransportError::NotConnected => write!(f, "Not connected"),
            TransportError::SendFailed(e) => write!(f, "Send failed: {e}"),
            TransportError::Closed => write!(f, "Transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A pub/sub channel scoped to one session id.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Join the channel for `session_id` as `identity`.
    async fn connect(&self, session_id: &str, identity: &PeerInfo) -> Result<(), TransportError>;

    /// Publish an encoded frame to every other member of the channel.
    async fn broadcast(&self, kind: MessageKind, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Register for incoming frames. Dropping the receiver unregisters.
    fn on_message(&self) -> mpsc::UnboundedReceiver<Vec<u8>>;

    /// Observe connectivity changes.
    fn on_connection_state_change(&self) -> watch::Receiver<ConnectionState>;

    /// Leave the channel and drop every registered receiver.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

// ───────────────────────────────────────────────────────────────────
// In-memory channel
// ───────────────────────────────────────────────────────────────────

struct Link {
    session_id: Option<String>,
    peer_id: Option<Uuid>,
    joined: bool,
    online: bool,
    reachable: bool,
    inboxes: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    sent: HashMap<MessageKind, usize>,
}

struct Endpoint {
    id: u64,
    link: Mutex<Link>,
    status: watch::Sender<ConnectionState>,
}

impl Endpoint {
    fn deliver(&self, frame: &[u8]) -> usize {
        let mut link = self.link.lock();
        link.inboxes.retain(|tx| tx.send(frame.to_vec()).is_ok());
        link.inboxes.len()
    }
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    endpoints: Vec<Arc<Endpoint>>,
}

/// In-process pub/sub channel shared by several [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new transport handle attached to this hub.
    pub fn transport(&self) -> MemoryTransport {
        let mut state = self.state.lock();
        state.next_id += 1;
        let (status, _) = watch::channel(ConnectionState::Disconnected);
        let endpoint = Arc::new(Endpoint {
            id: state.next_id,
            link: Mutex::new(Link {
                session_id: None,
                peer_id: None,
                joined: false,
                online: true,
                reachable: true,
                inboxes: Vec::new(),
                sent: HashMap::new(),
            }),
            status,
        });
        state.endpoints.push(endpoint.clone());
        MemoryTransport {
            hub: self.clone(),
            endpoint,
        }
    }

    /// Deliver a raw frame to every live member of `session_id`.
    ///
    /// Bypasses the envelope entirely; useful for injecting garbage.
    pub fn publish_raw(&self, session_id: &str, frame: &[u8]) -> usize {
        self.fan_out(None, session_id, frame)
    }

    /// Transports currently attached to this hub.
    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    fn fan_out(&self, from: Option<u64>, session_id: &str, frame: &[u8]) -> usize {
        let endpoints: Vec<Arc<Endpoint>> = self.state.lock().endpoints.clone();
        let mut delivered = 0;
        for endpoint in endpoints {
            if Some(endpoint.id) == from {
                continue;
            }
            let listening = {
                let link = endpoint.link.lock();
                link.joined && link.online && link.session_id.as_deref() == Some(session_id)
            };
            if listening && endpoint.deliver(frame) > 0 {
                delivered += 1;
            }
        }
        delivered
    }
}

/// One member's handle on a [`MemoryHub`].
pub struct MemoryTransport {
    hub: MemoryHub,
    endpoint: Arc<Endpoint>,
}

impl MemoryTransport {
    /// Simulate losing or regaining connectivity.
    ///
    /// While offline nothing is delivered in either direction and
    /// broadcasts fail with `NotConnected`.
    pub fn set_online(&self, online: bool) {
        let joined = {
            let mut link = self.endpoint.link.lock();
            link.online = online;
            link.joined
        };
        if joined {
            let state = if online {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };
            self.endpoint.status.send_replace(state);
        }
    }

    /// Make subsequent `connect` calls fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.endpoint.link.lock().reachable = reachable;
    }

    /// Report a channel error to observers without changing membership.
    pub fn fail(&self) {
        self.endpoint.link.lock().online = false;
        self.endpoint.status.send_replace(ConnectionState::Error);
    }

    /// Frames of `kind` successfully published so far.
    pub fn sent(&self, kind: MessageKind) -> usize {
        self.endpoint.link.lock().sent.get(&kind).copied().unwrap_or(0)
    }

    pub fn is_joined(&self) -> bool {
        self.endpoint.link.lock().joined
    }

    /// Identity passed to the last successful `connect`.
    pub fn peer_id(&self) -> Option<Uuid> {
        self.endpoint.link.lock().peer_id
    }

    /// Number of live message receivers.
    pub fn listener_count(&self) -> usize {
        let mut link = self.endpoint.link.lock();
        link.inboxes.retain(|tx| !tx.is_closed());
        link.inboxes.len()
    }

    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let id = self.endpoint.id;
        self.hub.state.lock().endpoints.retain(|endpoint| endpoint.id != id);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, session_id: &str, identity: &PeerInfo) -> Result<(), TransportError> {
        self.endpoint.status.send_replace(ConnectionState::Connecting);
        {
            let mut link = self.endpoint.link.lock();
            if !link.reachable {
                drop(link);
                self.endpoint.status.send_replace(ConnectionState::Error);
                return Err(TransportError::ConnectionFailed(format!(
                    "channel for session {session_id} unreachable"
                )));
            }
            link.session_id = Some(session_id.to_string());
            link.peer_id = Some(identity.peer_id);
            link.joined = true;
            link.online = true;
        }
        self.endpoint.status.send_replace(ConnectionState::Connected);
        Ok(())
    }

    async fn broadcast(&self, kind: MessageKind, frame: Vec<u8>) -> Result<(), TransportError> {
        let session_id = {
            let mut link = self.endpoint.link.lock();
            if !(link.joined && link.online) {
                return Err(TransportError::NotConnected);
            }
            *link.sent.entry(kind).or_insert(0) += 1;
            link.session_id.clone().ok_or(TransportError::NotConnected)?
        };
        self.hub.fan_out(Some(self.endpoint.id), &session_id, &frame);
        Ok(())
    }

    fn on_message(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoint.link.lock().inboxes.push(tx);
        rx
    }

    fn on_connection_state_change(&self) -> watch::Receiver<ConnectionState> {
        self.endpoint.status.subscribe()
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        {
            let mut link = self.endpoint.link.lock();
            link.joined = false;
            link.inboxes.clear();
        }
        self.endpoint.status.send_replace(ConnectionState::Disconnected);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn joined(hub: &MemoryHub, session: &str) -> MemoryTransport {
        let t = hub.transport();
        t.connect(session, &PeerInfo::new("peer")).await.unwrap();
        t
    }

    #[tokio::test]
    async fn test_broadcast_reaches_other_members_only() {
        let hub = MemoryHub::new();
        let a = joined(&hub, "s1").await;
        let b = joined(&hub, "s1").await;
        let mut a_rx = a.on_message();
        let mut b_rx = b.on_message();

        a.broadcast(MessageKind::DocUpdate, vec![1, 2, 3]).await.unwrap();

        assert_eq!(b_rx.recv().await.unwrap(), vec![1, 2, 3]);
        assert!(a_rx.try_recv().is_err());
        assert_eq!(a.sent(MessageKind::DocUpdate), 1);
        assert_eq!(a.sent(MessageKind::AwarenessUpdate), 0);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let hub = MemoryHub::new();
        let a = joined(&hub, "s1").await;
        let other = joined(&hub, "s2").await;
        let mut rx = other.on_message();

        a.broadcast(MessageKind::DocUpdate, vec![9]).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_blocks_both_directions() {
        let hub = MemoryHub::new();
        let a = joined(&hub, "s1").await;
        let b = joined(&hub, "s1").await;
        let mut b_rx = b.on_message();
        let status = a.on_connection_state_change();

        a.set_online(false);
        assert_eq!(*status.borrow(), ConnectionState::Disconnected);
        assert_eq!(
            a.broadcast(MessageKind::DocUpdate, vec![1]).await,
            Err(TransportError::NotConnected)
        );

        b.set_online(false);
        a.set_online(true);
        a.broadcast(MessageKind::DocUpdate, vec![2]).await.unwrap();
        assert!(b_rx.try_recv().is_err());
        assert_eq!(*status.borrow(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_unreachable_connect_fails() {
        let hub = MemoryHub::new();
        let t = hub.transport();
        let status = t.on_connection_state_change();
        t.set_reachable(false);

        let err = t.connect("s1", &PeerInfo::new("p")).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
        assert_eq!(*status.borrow(), ConnectionState::Error);
        assert!(!t.is_joined());
    }

    #[tokio::test]
    async fn test_disconnect_drops_listeners() {
        let hub = MemoryHub::new();
        let t = joined(&hub, "s1").await;
        let _rx1 = t.on_message();
        let _rx2 = t.on_message();
        assert_eq!(t.listener_count(), 2);

        t.disconnect().await.unwrap();
        assert_eq!(t.listener_count(), 0);
        assert!(!t.is_joined());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let hub = MemoryHub::new();
        let t = joined(&hub, "s1").await;
        let rx = t.on_message();
        assert_eq!(t.listener_count(), 1);
        drop(rx);
        assert_eq!(t.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_raw() {
        let hub = MemoryHub::new();
        let t = joined(&hub, "s1").await;
        let mut rx = t.on_message();

        assert_eq!(hub.publish_raw("s1", &[0xde, 0xad]), 1);
        assert_eq!(rx.recv().await.unwrap(), vec![0xde, 0xad]);
        assert_eq!(hub.publish_raw("nope", &[1]), 0);
    }

    #[tokio::test]
    async fn test_dropped_transport_leaves_hub() {
        let hub = MemoryHub::new();
        let a = joined(&hub, "s1").await;
        let mut a_rx = a.on_message();
        for _ in 0..10 {
            let short_lived = joined(&hub, "s1").await;
            drop(short_lived);
        }
        assert_eq!(hub.endpoint_count(), 1);

        assert_eq!(hub.publish_raw("s1", &[1]), 1);
        assert_eq!(a_rx.recv().await.unwrap(), vec![1]);

        drop(a);
        assert_eq!(hub.endpoint_count(), 0);
    }
}
