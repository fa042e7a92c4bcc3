//! Transport seam between the manager and the socket layer.
//!
//! The manager only ever calls `connect`/`disconnect`; everything the socket
//! observes comes back as a [`TransportEvent`] fed into
//! [`ConnectionManager::handle_event`](crate::manager::ConnectionManager::handle_event).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

/// Capability the manager drives. Implementations must not block.
pub trait Transport {
    /// Start a connection attempt against the current endpoint.
    fn connect(&mut self);

    /// Close the current connection (or abort a pending attempt).
    ///
    /// The manager records the close itself, so no `Disconnect` event may be
    /// reported for the connection closed here.
    fn disconnect(&mut self);

    /// Point subsequent `connect` calls at another endpoint.
    fn switch_endpoint(&mut self, endpoint: &str);

    /// Whether the transport could be loaded at all.
    fn is_available(&self) -> bool {
        true
    }
}

/// Low-level and application-level events reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Socket open (handshake with the server still pending)
    Connect,
    /// Socket closed
    Disconnect,
    /// Socket error
    Error,
    /// Socket could not be opened
    ConnectFailed,
    /// Server accepted the join
    JoinProjectResponse {
        protocol_version: u32,
        public_id: String,
    },
    /// Server refused the session
    ConnectionRejected { message: String },
    /// Server asks clients to move to a fresh instance
    ReconnectGracefully,
    /// Server mandated disconnect after a grace period
    ForceDisconnect {
        delay_secs: u64,
        reason: Option<String>,
    },
}

impl TransportEvent {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
            Self::ConnectFailed => "connect_failed",
            Self::JoinProjectResponse { .. } => "joinProjectResponse",
            Self::ConnectionRejected { .. } => "connectionRejected",
            Self::ReconnectGracefully => "reconnectGracefully",
            Self::ForceDisconnect { .. } => "forceDisconnect",
        }
    }
}

/// Sending half of a transport event channel.
///
/// Every socket a transport opens gets a generation number. Events are
/// tagged with it, and the receiving [`EventStream`] drops events from
/// generations that have since been superseded, so a socket that was
/// replaced or closed on purpose can never feed stale events back.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    generation: Arc<AtomicU64>,
}

impl EventSink {
    /// Retire the current socket and return the generation for the next one.
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Report `event` on behalf of socket `generation`.
    pub fn emit(&self, generation: u64, event: TransportEvent) -> Result<(), TransportError> {
        self.tx
            .send((generation, event))
            .map_err(|_| TransportError::ChannelClosed)
    }
}

/// Receiving half of a transport event channel.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    generation: Arc<AtomicU64>,
}

impl EventStream {
    /// Next event from the current socket. `None` once every sink is gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        loop {
            let (generation, event) = self.rx.recv().await?;
            if generation == self.generation.load(Ordering::SeqCst) {
                return Some(event);
            }
            log::trace!("dropping stale {} from socket generation {generation}", event.name());
        }
    }

    /// Non-blocking variant of [`EventStream::recv`].
    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        while let Ok((generation, event)) = self.rx.try_recv() {
            if generation == self.generation.load(Ordering::SeqCst) {
                return Some(event);
            }
        }
        None
    }
}

/// Create a connected sink/stream pair.
pub fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let generation = Arc::new(AtomicU64::new(0));
    (
        EventSink {
            tx,
            generation: generation.clone(),
        },
        EventStream { rx, generation },
    )
}

/// Failures inside a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Connect timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Event channel closed")]
    ChannelClosed,
}
