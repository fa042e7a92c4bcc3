//! WebSocket transport on tokio-tungstenite.
//!
//! Each `connect()` spawns one socket task; `disconnect()` aborts it and
//! retires its generation so nothing it already queued reaches the manager.
//!
//! ```text
//!  ConnectionManager ──connect()──► WsTransport ──spawn──► socket task
//!         ▲                                                   │
//!         │                 EventStream ◄── EventSink ◄────────┘
//!         └───────────── driver loop ◄──────┘   (generation-tagged)
//! ```
//!
//! `connect()` must be called from within a tokio runtime.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::ServerMessage;
use crate::transport::{EventSink, Transport, TransportError, TransportEvent};

/// Transport backed by a real WebSocket.
pub struct WsTransport {
    url: String,
    connect_timeout: Duration,
    sink: EventSink,
    task: Option<JoinHandle<()>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, connect_timeout: Duration, sink: EventSink) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            sink,
            task: None,
        }
    }

    /// Endpoint the next `connect()` will use.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether a socket task is running.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Transport for WsTransport {
    fn connect(&mut self) {
        self.abort_task();
        let generation = self.sink.next_generation();
        let url = self.url.clone();
        let connect_timeout = self.connect_timeout;
        let sink = self.sink.clone();

        self.task = Some(tokio::spawn(async move {
            if let Err(e) = run_socket(&url, connect_timeout, generation, &sink).await {
                log::warn!("Socket {generation} to {url} ended: {e}");
            }
        }));
    }

    fn disconnect(&mut self) {
        self.abort_task();
        self.sink.next_generation();
    }

    fn switch_endpoint(&mut self, endpoint: &str) {
        self.url = endpoint.to_string();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.abort_task();
    }
}

/// Drive one socket from handshake to close, reporting through `sink`.
async fn run_socket(
    url: &str,
    connect_timeout: Duration,
    generation: u64,
    sink: &EventSink,
) -> Result<(), TransportError> {
    log::info!("Connecting socket {generation} to {url}");

    let mut ws_stream = match tokio::time::timeout(
        connect_timeout,
        tokio_tungstenite::connect_async(url),
    )
    .await
    {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            sink.emit(generation, TransportEvent::ConnectFailed)?;
            return Err(e.into());
        }
        Err(_) => {
            sink.emit(generation, TransportEvent::ConnectFailed)?;
            return Err(TransportError::Timeout(connect_timeout));
        }
    };

    sink.emit(generation, TransportEvent::Connect)?;

    while let Some(msg) = ws_stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                Ok(Some(server_msg)) => sink.emit(generation, server_msg.into())?,
                Ok(None) => {}
                Err(e) => log::debug!("Ignoring frame on socket {generation}: {e}"),
            },
            Ok(Message::Close(frame)) => {
                log::info!("Socket {generation} closed by server: {frame:?}");
                break;
            }
            Err(e) => {
                sink.emit(generation, TransportEvent::Error)?;
                sink.emit(generation, TransportEvent::Disconnect)?;
                return Err(e.into());
            }
            _ => {}
        }
    }

    sink.emit(generation, TransportEvent::Disconnect)?;
    Ok(())
}
