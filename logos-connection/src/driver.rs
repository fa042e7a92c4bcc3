//! Async driver: runs a [`ConnectionManager`] on a tokio task.
//!
//! One task owns the manager and multiplexes its three inputs, so the
//! state machine stays single-threaded:
//!
//! ```text
//!   EventStream ───────┐
//!   ConnectionHandle ──┼──► select! ──► ConnectionManager
//!   sleep_until(next) ─┘
//! ```

use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::clock::{Clock, SystemClock};
use crate::config::ConnectionConfig;
use crate::manager::ConnectionManager;
use crate::state::{ConnectionError, StateChange};
use crate::transport::{event_channel, EventStream, Transport};
use crate::ws::WsTransport;

/// Requests forwarded from a [`ConnectionHandle`] to the driver task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Close(ConnectionError),
    TryReconnectNow,
    UserActivity,
    Online,
    BeforeUnload,
    Shutdown,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Connection driver stopped")]
    Stopped,
}

/// Cheap, cloneable access to a running driver.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    pub fn send(&self, command: Command) -> Result<(), DriverError> {
        self.tx.send(command).map_err(|_| DriverError::Stopped)
    }

    pub fn close(&self, reason: ConnectionError) -> Result<(), DriverError> {
        self.send(Command::Close(reason))
    }

    pub fn try_reconnect_now(&self) -> Result<(), DriverError> {
        self.send(Command::TryReconnectNow)
    }

    pub fn register_user_activity(&self) -> Result<(), DriverError> {
        self.send(Command::UserActivity)
    }

    pub fn online(&self) -> Result<(), DriverError> {
        self.send(Command::Online)
    }

    pub fn before_unload(&self) -> Result<(), DriverError> {
        self.send(Command::BeforeUnload)
    }

    /// Stop the driver; the manager is torn down on the way out.
    pub fn shutdown(&self) -> Result<(), DriverError> {
        self.send(Command::Shutdown)
    }
}

/// Owns a manager and the event stream of its transport.
pub struct ConnectionDriver<T: Transport, C: Clock = SystemClock> {
    manager: ConnectionManager<T, C>,
    events: EventStream,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl<T: Transport, C: Clock> ConnectionDriver<T, C> {
    pub fn new(manager: ConnectionManager<T, C>, events: EventStream) -> (Self, ConnectionHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        (
            Self {
                manager,
                events,
                commands,
            },
            ConnectionHandle { tx },
        )
    }

    pub fn manager(&self) -> &ConnectionManager<T, C> {
        &self.manager
    }

    /// Take the state change receiver (can only be called once).
    pub fn take_state_rx(&mut self) -> Option<mpsc::UnboundedReceiver<StateChange>> {
        self.manager.take_state_rx()
    }

    /// Run until shutdown. Returns the torn-down manager.
    pub async fn run(mut self) -> ConnectionManager<T, C> {
        loop {
            let deadline = self.manager.next_deadline();
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.manager.handle_event(event),
                    None => {
                        log::warn!("Transport event stream closed");
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.apply(command),
                },
                _ = sleep_until(deadline) => {
                    self.manager.handle_timeouts();
                }
            }
        }
        self.manager.teardown();
        self.manager
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Close(reason) => self.manager.close(reason),
            Command::TryReconnectNow => self.manager.try_reconnect_now(),
            Command::UserActivity => self.manager.register_user_activity(),
            Command::Online => self.manager.on_online(),
            Command::BeforeUnload => self.manager.on_before_unload(),
            Command::Shutdown => {}
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// Build a WebSocket-backed driver for `config`. Must run inside a tokio runtime.
pub fn connect_ws(config: ConnectionConfig) -> (ConnectionDriver<WsTransport>, ConnectionHandle) {
    let (sink, events) = event_channel();
    let url = config.connect_url(&config.endpoint);
    let transport = WsTransport::new(url, config.connect_timeout, sink);
    let manager = ConnectionManager::new(transport, SystemClock, config);
    ConnectionDriver::new(manager, events)
}
