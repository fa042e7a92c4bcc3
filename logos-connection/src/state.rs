//! Connection state record and change notifications.
//!
//! The record is a snapshot: the manager owns the only mutable copy and
//! hands a clone to observers on every transition.
//!
//! ```text
//!            ┌──────────── ReadyState ─────────────┐
//!            │                                     │
//!   Closed { reconnect_at, error }   Connecting { reconnect_at, error }   Open
//!            │                                     │                        │
//!            └───────── + force_disconnected, inactive_disconnect ──────────┘
//! ```
//!
//! `Open` has no room for a countdown or an error, so a connected session
//! can never advertise a pending reconnect.

use std::fmt;
use std::time::{Duration, Instant};

/// Classification of the most recent connection problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionError {
    /// The transport could not be loaded at all
    IoNotLoaded,
    /// The connect-error retry ladder was exhausted
    UnableToConnect,
    /// The server refused the join for an unclassified reason
    UnableToJoin,
    /// The server rate-limited the join
    RateLimited,
    /// Missing or expired session
    NotLoggedIn,
    /// The project no longer exists
    ProjectDeleted,
    /// The server protocol moved on; this client is stale
    ProtocolChanged,
    /// Planned maintenance or an explicit close
    Maintenance,
}

impl ConnectionError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IoNotLoaded => "io-not-loaded",
            Self::UnableToConnect => "unable-to-connect",
            Self::UnableToJoin => "unable-to-join",
            Self::RateLimited => "rate-limited",
            Self::NotLoggedIn => "not-logged-in",
            Self::ProjectDeleted => "project-deleted",
            Self::ProtocolChanged => "protocol-changed",
            Self::Maintenance => "maintenance",
        }
    }

    /// Errors the manager never recovers from on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NotLoggedIn | Self::ProjectDeleted | Self::ProtocolChanged | Self::Maintenance
        )
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport readiness, with the data only a non-open link can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting {
        reconnect_at: Option<Instant>,
        error: Option<ConnectionError>,
    },
    Open,
    Closed {
        reconnect_at: Option<Instant>,
        error: Option<ConnectionError>,
    },
}

impl ReadyState {
    pub const CLOSED: ReadyState = ReadyState::Closed {
        reconnect_at: None,
        error: None,
    };

    pub fn kind(&self) -> ReadyStateKind {
        match self {
            ReadyState::Connecting { .. } => ReadyStateKind::Connecting,
            ReadyState::Open => ReadyStateKind::Open,
            ReadyState::Closed { .. } => ReadyStateKind::Closed,
        }
    }

    pub fn reconnect_at(&self) -> Option<Instant> {
        match self {
            ReadyState::Connecting { reconnect_at, .. } | ReadyState::Closed { reconnect_at, .. } => {
                *reconnect_at
            }
            ReadyState::Open => None,
        }
    }

    pub fn error(&self) -> Option<ConnectionError> {
        match self {
            ReadyState::Connecting { error, .. } | ReadyState::Closed { error, .. } => *error,
            ReadyState::Open => None,
        }
    }

    /// Same readiness with a different countdown. No-op on `Open`.
    pub(crate) fn with_reconnect_at(self, at: Option<Instant>) -> Self {
        match self {
            ReadyState::Connecting { error, .. } => ReadyState::Connecting { reconnect_at: at, error },
            ReadyState::Closed { error, .. } => ReadyState::Closed { reconnect_at: at, error },
            ReadyState::Open => ReadyState::Open,
        }
    }

    /// Same readiness with a different error. No-op on `Open`.
    pub(crate) fn with_error(self, error: Option<ConnectionError>) -> Self {
        match self {
            ReadyState::Connecting { reconnect_at, .. } => ReadyState::Connecting { reconnect_at, error },
            ReadyState::Closed { reconnect_at, .. } => ReadyState::Closed { reconnect_at, error },
            ReadyState::Open => ReadyState::Open,
        }
    }

    /// Close the link, keeping any countdown and error already recorded.
    pub(crate) fn closed(self) -> Self {
        ReadyState::Closed {
            reconnect_at: self.reconnect_at(),
            error: self.error(),
        }
    }
}

/// Plain readiness without payload, handy for comparisons and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyStateKind {
    Connecting,
    Open,
    Closed,
}

/// Terminal disconnect details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForcedDisconnect {
    pub reason: ConnectionError,
    /// Grace period before the transport is actually closed
    pub delay: Duration,
}

/// The five states observers care about, derived from the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveState {
    /// Closed, nothing scheduled
    Idle,
    /// Closed, waiting for a countdown
    CountdownScheduled,
    Connecting,
    Connected,
    /// Terminal until the page is reloaded
    ForceDisconnected,
}

/// Connection state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub ready_state: ReadyState,
    pub force_disconnected: Option<ForcedDisconnect>,
    /// Dropped because the user went away, not because the network failed
    pub inactive_disconnect: bool,
    /// Start of the most recent connection attempt
    pub last_connection_attempt: Option<Instant>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            ready_state: ReadyState::CLOSED,
            force_disconnected: None,
            inactive_disconnect: false,
            last_connection_attempt: None,
        }
    }
}

impl ConnectionState {
    pub fn ready_state_kind(&self) -> ReadyStateKind {
        self.ready_state.kind()
    }

    pub fn is_open(&self) -> bool {
        self.ready_state == ReadyState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.ready_state_kind() == ReadyStateKind::Closed
    }

    pub fn is_force_disconnected(&self) -> bool {
        self.force_disconnected.is_some()
    }

    /// Grace delay of the forced disconnect, zero when not forced.
    pub fn forced_disconnect_delay(&self) -> Duration {
        self.force_disconnected.map_or(Duration::ZERO, |f| f.delay)
    }

    /// The error to surface: a forced reason wins over a pending one.
    pub fn error(&self) -> Option<ConnectionError> {
        self.force_disconnected
            .map(|f| f.reason)
            .or_else(|| self.ready_state.error())
    }

    pub fn reconnect_at(&self) -> Option<Instant> {
        self.ready_state.reconnect_at()
    }

    /// Remaining countdown relative to `now`, for "reconnecting in Ns" banners.
    pub fn reconnect_in(&self, now: Instant) -> Option<Duration> {
        self.reconnect_at().map(|at| at.saturating_duration_since(now))
    }

    pub fn effective(&self) -> EffectiveState {
        if self.is_force_disconnected() {
            return EffectiveState::ForceDisconnected;
        }
        match self.ready_state {
            ReadyState::Open => EffectiveState::Connected,
            ReadyState::Connecting { .. } => EffectiveState::Connecting,
            ReadyState::Closed { reconnect_at: Some(_), .. } => EffectiveState::CountdownScheduled,
            ReadyState::Closed { reconnect_at: None, .. } => EffectiveState::Idle,
        }
    }
}

/// One transition, carrying both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub state: ConnectionState,
    pub previous_state: ConnectionState,
}
