//! # logos-connection — Connection manager for the Logos real-time socket
//!
//! Keeps one bidirectional collaboration socket alive: connects, retries with
//! jitter, drops idle sessions, cycles the socket when the server asks, and
//! stops for good on a forced disconnect. Observers follow along through
//! state change notifications.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  Command   ┌──────────────────┐  connect/disconnect  ┌─────────────┐
//! │ ConnectionHandle │ ─────────► │ ConnectionDriver │ ───────────────────► │ WsTransport │
//! │ (UI, any task)   │            │ (select! loop)   │ ◄─────────────────── │ (socket     │
//! └──────────────────┘            └────────┬─────────┘   TransportEvent     │  task)      │
//!                                          │                                └─────────────┘
//!                                          ▼
//!                                 ┌──────────────────┐  StateChange  ┌─────────────┐
//!                                 │ConnectionManager │ ────────────► │  observers  │
//!                                 │ (sans-IO policy) │               └─────────────┘
//!                                 └────────┬─────────┘
//!                                          │
//!                                 ┌────────┴─────────┐
//!                                 │ TimerTable+Clock │
//!                                 └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`state`] — Ready states, error taxonomy, state snapshots
//! - [`config`] — Policy delays and endpoints
//! - [`clock`] — Injectable time source
//! - [`timers`] — One deadline per timer kind
//! - [`transport`] — Transport trait and generation-tagged event channel
//! - [`protocol`] — JSON lifecycle frames
//! - [`manager`] — The state machine
//! - [`ws`] — tokio-tungstenite transport
//! - [`driver`] — Async loop that runs a manager

pub mod state;
pub mod config;
pub mod clock;
pub mod timers;
pub mod transport;
pub mod protocol;
pub mod manager;
pub mod ws;
pub mod driver;

// Re-exports for convenience
pub use state::{
    ConnectionError, ConnectionState, EffectiveState, ForcedDisconnect, ReadyState,
    ReadyStateKind, StateChange,
};
pub use config::ConnectionConfig;
pub use clock::{Clock, ManualClock, SystemClock};
pub use timers::{TimerKind, TimerTable};
pub use transport::{event_channel, EventSink, EventStream, Transport, TransportError, TransportEvent};
pub use protocol::{ProtocolError, ServerMessage};
pub use manager::{ConnectionManager, ConnectionStats};
pub use ws::WsTransport;
pub use driver::{connect_ws, Command, ConnectionDriver, ConnectionHandle, DriverError};
