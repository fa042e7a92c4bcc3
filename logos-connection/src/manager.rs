//! Connection manager: lifecycle policy for the collaboration socket.
//!
//! Owns exactly one transport and decides when it connects, when it retries,
//! and when it gives up. All inputs arrive through `&mut self` calls from a
//! single task (transport events, fired timers, user activity), so the state
//! needs no locking.
//!
//! ## State machine
//!
//! ```text
//!                 new() / try_reconnect()
//!   ┌──────────┐ ─────────────────────────► ┌────────────┐  joinProjectResponse  ┌───────────┐
//!   │   Idle   │                            │ Connecting │ ────────────────────► │ Connected │
//!   └──────────┘ ◄── user away 24h ───────  └────────────┘                       └───────────┘
//!        ▲                                     │    ▲  error / connect_failed          │
//!        │                                     │    └── retry n·(1+r)·1s, n ≤ 5         │
//!        │                                     ▼                                       │
//!   ┌──────────────────────┐  countdown fires  │                        disconnect     │
//!   │  CountdownScheduled  │ ─────────────────►┘ ◄─────────────────────────────────────┘
//!   └──────────────────────┘
//!
//!   any state ── close() / forceDisconnect / terminal rejection ──► ForceDisconnected
//! ```
//!
//! Timers are deadlines in a [`TimerTable`]: the manager never sleeps, it
//! only records when it wants to be called back. A driver calls
//! [`ConnectionManager::handle_timeouts`] once [`ConnectionManager::next_deadline`]
//! has passed.

use std::ops::Range;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::clock::{Clock, SystemClock};
use crate::config::ConnectionConfig;
use crate::state::{ConnectionError, ConnectionState, ForcedDisconnect, ReadyState, StateChange};
use crate::timers::{TimerKind, TimerTable};
use crate::transport::{Transport, TransportEvent};

/// Countdown range (seconds) while the user is around.
const ACTIVE_COUNTDOWN_SECS: Range<u64> = 3..10;
/// Countdown range (seconds) once the user has gone quiet.
const INACTIVE_COUNTDOWN_SECS: Range<u64> = 60..180;
/// Longest delay a timer accepts; longer ones (e.g. from the server) are capped.
const MAX_TIMER_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Counters for monitoring connection health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub connect_attempts: u64,
    pub connect_errors: u64,
    pub countdowns_scheduled: u64,
    pub idle_disconnects: u64,
    pub state_changes: u64,
}

/// The connection manager.
pub struct ConnectionManager<T: Transport, C: Clock = SystemClock> {
    config: ConnectionConfig,
    transport: T,
    clock: C,
    rng: StdRng,
    timers: TimerTable,

    state: ConnectionState,

    /// Connect errors seen in the current attempt (None once joined or closed)
    connection_attempt: Option<u32>,
    /// End of the window for a pending graceful reconnect
    gracefully_reconnect_until: Option<Instant>,
    last_user_activity: Instant,
    /// Protocol version of the last successful join
    protocol_version: Option<u32>,
    /// Opaque per-socket id handed out by the server
    public_id: Option<String>,

    user_is_leaving: bool,
    /// One-shot: the first error after `try_reconnect` also starts a countdown
    reconnect_listener_armed: bool,
    online_listener: bool,
    using_fallback: bool,
    torn_down: bool,

    state_tx: mpsc::UnboundedSender<StateChange>,
    state_rx: Option<mpsc::UnboundedReceiver<StateChange>>,
    stats: ConnectionStats,
}

impl<T: Transport, C: Clock> ConnectionManager<T, C> {
    /// Create the manager and start the first connection attempt.
    pub fn new(transport: T, clock: C, config: ConnectionConfig) -> Self {
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let now = clock.now();

        let mut manager = Self {
            transport,
            clock,
            rng,
            timers: TimerTable::new(),
            state: ConnectionState::default(),
            connection_attempt: None,
            gracefully_reconnect_until: None,
            last_user_activity: now,
            protocol_version: None,
            public_id: None,
            user_is_leaving: false,
            reconnect_listener_armed: false,
            online_listener: true,
            using_fallback: false,
            torn_down: false,
            state_tx,
            state_rx: Some(state_rx),
            stats: ConnectionStats::default(),
            config,
        };

        let idle_check_at = manager.after(manager.config.idle_check_interval);
        manager.timers.arm(TimerKind::IdleCheck, idle_check_at);

        if !manager.transport.is_available() && !manager.switch_to_fallback_if_possible() {
            log::error!(
                "Real-time transport not loaded. Check that the real-time service is running and accessible."
            );
            manager.update(|s| s.ready_state = s.ready_state.with_error(Some(ConnectionError::IoNotLoaded)));
            return manager;
        }

        manager.try_reconnect();
        manager
    }

    // ─── Public calls ────────────────────────────────────────────────

    /// Permanently end the session with `reason`.
    pub fn close(&mut self, reason: ConnectionError) {
        self.on_force_disconnect(Duration::ZERO, reason);
    }

    /// Reconnect as soon as the short user-initiated backoff allows.
    pub fn try_reconnect_now(&mut self) {
        if self.torn_down {
            return;
        }
        self.try_reconnect_with_backoff(self.config.user_activity_reconnect_now_delay);
    }

    /// Called on keystrokes, clicks and cursor moves.
    pub fn register_user_activity(&mut self) {
        if self.torn_down {
            return;
        }
        self.last_user_activity = self.clock.now();
        self.user_is_leaving = false;
        self.ensure_is_connected();
    }

    /// The network came back online.
    pub fn on_online(&mut self) {
        if !self.online_listener {
            return;
        }
        if !self.state.inactive_disconnect {
            self.ensure_is_connected();
        }
    }

    /// The user is navigating away; no more reconnects should be scheduled.
    pub fn on_before_unload(&mut self) {
        self.user_is_leaving = true;
    }

    /// Release every timer and listener acquired in `new`.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.timers.clear();
        self.online_listener = false;
        self.reconnect_listener_armed = false;
        self.gracefully_reconnect_until = None;
        self.user_is_leaving = true;
        if !self.state.is_closed() {
            self.disconnect();
        }
        self.torn_down = true;
        log::debug!("[ConnectionManager] torn down");
    }

    /// Feed one transport event into the state machine.
    pub fn handle_event(&mut self, event: TransportEvent) {
        if self.torn_down {
            log::debug!("[ConnectionManager] ignoring {} after teardown", event.name());
            return;
        }
        log::trace!("[ConnectionManager] event {}", event.name());

        match event {
            TransportEvent::Connect => self.on_connect(),
            TransportEvent::Disconnect => self.on_disconnect(),
            TransportEvent::Error => {
                self.on_connect_error();
                self.on_reconnect_listener_failure();
            }
            TransportEvent::ConnectFailed => self.on_connect_error(),
            TransportEvent::JoinProjectResponse {
                protocol_version,
                public_id,
            } => self.on_join_project_response(protocol_version, public_id),
            TransportEvent::ConnectionRejected { message } => self.on_connection_rejected(&message),
            TransportEvent::ReconnectGracefully => self.on_reconnect_gracefully(),
            TransportEvent::ForceDisconnect { delay_secs, reason } => {
                if let Some(reason) = reason {
                    log::info!("[ConnectionManager] server requested disconnect: {reason}");
                }
                self.on_force_disconnect(Duration::from_secs(delay_secs), ConnectionError::Maintenance);
            }
        }
    }

    /// Fire every timer whose deadline has passed. Returns how many fired.
    ///
    /// Each kind fires at most once per call; a timer re-armed for `now`
    /// while firing waits for the next call.
    pub fn handle_timeouts(&mut self) -> usize {
        let now = self.clock.now();
        let mut fired = Vec::with_capacity(TimerKind::ALL.len());
        while let Some(kind) = self.timers.pop_expired_except(now, &fired) {
            fired.push(kind);
            self.on_timer(kind);
        }
        fired.len()
    }

    /// When the manager next wants `handle_timeouts` to run.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Take the state change receiver (can only be called once).
    pub fn take_state_rx(&mut self) -> Option<mpsc::UnboundedReceiver<StateChange>> {
        self.state_rx.take()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn timers(&self) -> &TimerTable {
        &self.timers
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn protocol_version(&self) -> Option<u32> {
        self.protocol_version
    }

    pub fn public_id(&self) -> Option<&str> {
        self.public_id.as_deref()
    }

    /// Connect errors seen during the attempt in flight.
    pub fn connection_attempt(&self) -> Option<u32> {
        self.connection_attempt
    }

    pub fn is_using_fallback(&self) -> bool {
        self.using_fallback
    }

    pub fn is_online_listener_registered(&self) -> bool {
        self.online_listener
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    // ─── Transport events ────────────────────────────────────────────

    fn on_connect(&mut self) {
        // Socket is open; the join handshake decides whether we are connected.
        self.reconnect_listener_armed = false;
    }

    fn on_reconnect_listener_failure(&mut self) {
        if !self.reconnect_listener_armed {
            return;
        }
        self.reconnect_listener_armed = false;
        self.start_auto_reconnect_countdown(Duration::ZERO);
    }

    fn on_connect_error(&mut self) {
        // Errors on an established session are reported through `Disconnect`.
        let Some(attempt) = self.connection_attempt else {
            return;
        };
        self.stats.connect_errors += 1;
        self.connection_attempt = Some(attempt + 1);

        if attempt < self.config.max_retry_connect {
            let retry = attempt + 1;
            let jitter = 1.0 + self.rng.gen::<f64>();
            let delay = self
                .config
                .connection_error_reconnect_delay
                .mul_f64(retry as f64 * jitter);
            log::info!("[ConnectionManager] connect error, retry {retry} in {delay:?}");
            let at = self.after(delay);
            self.timers.arm(TimerKind::ConnectRetry, at);
        } else if self.switch_to_fallback_if_possible() {
            self.try_reconnect();
        } else {
            log::warn!(
                "[ConnectionManager] giving up after {} connect errors",
                self.config.max_retry_connect + 1
            );
            self.timers.cancel(TimerKind::ConnectRetry);
            self.disconnect();
            self.update(|s| s.ready_state = s.ready_state.with_error(Some(ConnectionError::UnableToConnect)));
        }
    }

    fn on_disconnect(&mut self) {
        self.connection_attempt = None;
        self.update(|s| s.ready_state = s.ready_state.closed());

        if self.disconnect_if_idle_since(self.config.disconnect_after) {
            return;
        }
        match self.state.ready_state.error() {
            Some(ConnectionError::RateLimited) => {
                self.try_reconnect_with_backoff(self.config.rate_limited_delay)
            }
            // The retry ladder is exhausted; wait for activity or the network.
            Some(ConnectionError::UnableToConnect) => {}
            _ => self.start_auto_reconnect_countdown(Duration::ZERO),
        }
    }

    fn on_join_project_response(&mut self, protocol_version: u32, public_id: String) {
        if self.state.is_force_disconnected() {
            log::warn!("[ConnectionManager] join response after forced disconnect, ignoring");
            return;
        }
        if let Some(previous) = self.protocol_version {
            if previous != protocol_version {
                log::warn!(
                    "[ConnectionManager] protocol changed from {previous} to {protocol_version}"
                );
                self.on_force_disconnect(Duration::ZERO, ConnectionError::ProtocolChanged);
                return;
            }
        }

        self.protocol_version = Some(protocol_version);
        self.public_id = Some(public_id);
        self.connection_attempt = None;
        self.timers.cancel(TimerKind::ReconnectCountdown);
        self.timers.cancel(TimerKind::ConnectRetry);
        self.update(|s| s.ready_state = ReadyState::Open);
        log::info!("[ConnectionManager] joined project (protocol {protocol_version})");
    }

    fn on_connection_rejected(&mut self, message: &str) {
        log::info!("[ConnectionManager] connection rejected: {message}");
        match message {
            // pending real-time shutdown
            "retry" => self.start_auto_reconnect_countdown(Duration::ZERO),
            "rate-limit hit when joining project" => self.update(|s| {
                s.ready_state = s.ready_state.with_error(Some(ConnectionError::RateLimited))
            }),
            "not authorized" | "invalid session" => {
                self.on_force_disconnect(Duration::ZERO, ConnectionError::NotLoggedIn)
            }
            "project not found" => {
                self.on_force_disconnect(Duration::ZERO, ConnectionError::ProjectDeleted)
            }
            _ => self.update(|s| {
                s.ready_state = s.ready_state.with_error(Some(ConnectionError::UnableToJoin))
            }),
        }
    }

    fn on_reconnect_gracefully(&mut self) {
        // Idle users are dropped a little ahead of the hard limit.
        if self.disconnect_if_idle_since(self.config.graceful_idle_threshold()) {
            return;
        }
        if self.gracefully_reconnect_until.is_some() {
            return;
        }
        self.gracefully_reconnect_until = Some(self.after(self.config.graceful_window));
        self.try_reconnect_gracefully();
    }

    fn on_force_disconnect(&mut self, delay: Duration, reason: ConnectionError) {
        let delay = delay.min(MAX_TIMER_DELAY);
        self.timers.cancel(TimerKind::IdleCheck);
        self.timers.cancel(TimerKind::ReconnectCountdown);
        self.timers.cancel(TimerKind::ConnectRetry);
        self.timers.cancel(TimerKind::GracefulRetry);
        self.gracefully_reconnect_until = None;
        self.online_listener = false;

        let at = self.after(delay);
        self.timers.arm(TimerKind::ForcedDisconnect, at);

        log::info!("[ConnectionManager] forced disconnect ({reason}) in {delay:?}");
        self.update(|s| {
            s.ready_state = s.ready_state.with_reconnect_at(None);
            s.force_disconnected = Some(ForcedDisconnect { reason, delay });
        });
    }

    // ─── Timers ──────────────────────────────────────────────────────

    fn on_timer(&mut self, kind: TimerKind) {
        log::trace!("[ConnectionManager] timer {kind:?} fired");
        match kind {
            TimerKind::IdleCheck => {
                let next = self.after(self.config.idle_check_interval);
                self.timers.arm(TimerKind::IdleCheck, next);
                self.disconnect_if_idle_since(self.config.disconnect_after);
            }
            TimerKind::ReconnectCountdown => {
                if self.is_reconnecting_soon(Duration::ZERO) {
                    self.try_reconnect();
                }
            }
            TimerKind::ConnectRetry => {
                if self.can_reconnect() {
                    self.stats.connect_attempts += 1;
                    self.transport.connect();
                }
            }
            TimerKind::GracefulRetry => self.try_reconnect_gracefully(),
            TimerKind::ForcedDisconnect => self.disconnect(),
        }
    }

    // ─── Policy ──────────────────────────────────────────────────────

    /// Deadline `delay` from now, capped at [`MAX_TIMER_DELAY`].
    fn after(&self, delay: Duration) -> Instant {
        self.clock.now() + delay.min(MAX_TIMER_DELAY)
    }

    fn can_reconnect(&self) -> bool {
        !self.state.is_open() && !self.state.is_force_disconnected()
    }

    fn is_reconnecting_soon(&self, within: Duration) -> bool {
        match self.state.reconnect_at() {
            Some(at) => at <= self.after(within),
            None => false,
        }
    }

    fn has_reconnected_recently(&self, within: Duration) -> bool {
        match self.state.last_connection_attempt {
            Some(at) => self.clock.now().saturating_duration_since(at) < within,
            None => false,
        }
    }

    fn is_user_inactive_since(&self, since: Duration) -> bool {
        self.clock.now().saturating_duration_since(self.last_user_activity) > since
    }

    fn disconnect_if_idle_since(&mut self, threshold: Duration) -> bool {
        if !self.is_user_inactive_since(threshold) {
            return false;
        }
        let previously_closed = self.state.is_closed();
        self.timers.cancel(TimerKind::ReconnectCountdown);
        self.stats.idle_disconnects += 1;
        log::info!("[ConnectionManager] user inactive for more than {threshold:?}, disconnecting");
        self.update(|s| {
            s.ready_state = s.ready_state.closed().with_reconnect_at(None);
            s.inactive_disconnect = true;
        });
        if !previously_closed {
            self.transport.disconnect();
        }
        true
    }

    fn disconnect(&mut self) {
        self.update(|s| s.ready_state = s.ready_state.closed());
        self.transport.disconnect();
    }

    fn ensure_is_connected(&mut self) {
        if self.state.is_open() {
            return;
        }
        let backoff = if self.state.ready_state.error() == Some(ConnectionError::RateLimited) {
            self.config.rate_limited_delay
        } else {
            self.config.user_activity_reconnect_delay
        };
        self.try_reconnect_with_backoff(backoff);
    }

    fn start_auto_reconnect_countdown(&mut self, backoff: Duration) {
        if self.user_is_leaving || !self.can_reconnect() {
            return;
        }
        let range = if self.is_user_inactive_since(self.config.inactive_reconnect_threshold) {
            INACTIVE_COUNTDOWN_SECS
        } else {
            ACTIVE_COUNTDOWN_SECS
        };
        let countdown = Duration::from_secs(self.rng.gen_range(range));
        let delay = backoff + countdown;
        if self.is_reconnecting_soon(delay) {
            return;
        }

        let at = self.after(delay);
        self.stats.countdowns_scheduled += 1;
        log::info!("[ConnectionManager] reconnecting in {delay:?}");
        self.update(|s| s.ready_state = s.ready_state.with_reconnect_at(Some(at)));
        self.timers.arm(TimerKind::ReconnectCountdown, at);
    }

    fn try_reconnect(&mut self) {
        self.gracefully_reconnect_until = None;
        self.timers.cancel(TimerKind::GracefulRetry);
        self.timers.cancel(TimerKind::ReconnectCountdown);
        self.update(|s| s.ready_state = s.ready_state.with_reconnect_at(None));
        if !self.can_reconnect() {
            return;
        }

        let now = self.clock.now();
        self.connection_attempt = Some(0);
        self.update(|s| {
            s.ready_state = ReadyState::Connecting {
                reconnect_at: None,
                error: None,
            };
            s.inactive_disconnect = false;
            s.last_connection_attempt = Some(now);
        });

        self.reconnect_listener_armed = true;
        self.stats.connect_attempts += 1;
        self.transport.connect();
    }

    fn try_reconnect_gracefully(&mut self) {
        let Some(until) = self.gracefully_reconnect_until else {
            return;
        };
        if self.state.is_closed() {
            return;
        }
        if until < self.clock.now()
            || self.is_user_inactive_since(self.config.graceful_retry_interval)
        {
            log::info!("[ConnectionManager] cycling connection for graceful reconnect");
            self.disconnect();
            self.try_reconnect();
        } else {
            let next = self.after(self.config.graceful_retry_interval);
            self.timers.arm(TimerKind::GracefulRetry, next);
        }
    }

    fn try_reconnect_with_backoff(&mut self, backoff: Duration) {
        if self.has_reconnected_recently(backoff) {
            self.start_auto_reconnect_countdown(backoff);
        } else {
            self.try_reconnect();
        }
    }

    fn switch_to_fallback_if_possible(&mut self) -> bool {
        if self.using_fallback {
            return false;
        }
        let Some(fallback) = self.config.fallback_endpoint.clone() else {
            return false;
        };
        log::warn!("[ConnectionManager] switching to fallback endpoint {fallback}");
        self.using_fallback = true;
        let url = self.config.connect_url(&fallback);
        self.transport.switch_endpoint(&url);
        true
    }

    /// Apply `f` to a copy of the state and publish the result.
    fn update(&mut self, f: impl FnOnce(&mut ConnectionState)) {
        let mut next = self.state;
        f(&mut next);
        self.change_state(next);
    }

    fn change_state(&mut self, state: ConnectionState) {
        let previous_state = std::mem::replace(&mut self.state, state);
        self.stats.state_changes += 1;
        log::debug!("[ConnectionManager] changed state {previous_state:?} -> {state:?}");
        let _ = self.state_tx.send(StateChange {
            state,
            previous_state,
        });
    }
}
