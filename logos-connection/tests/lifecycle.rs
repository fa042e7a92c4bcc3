//! Lifecycle tests for the connection manager.
//!
//! A recording transport and a manual clock stand in for the socket and for
//! wall time, so hours of policy run in microseconds.

use std::time::Duration;

use logos_connection::{
    Clock, ConnectionConfig, ConnectionError, ConnectionManager, EffectiveState, ManualClock,
    ReadyStateKind, ServerMessage, TimerKind, Transport, TransportEvent,
};

#[derive(Debug)]
struct FakeTransport {
    connects: usize,
    disconnects: usize,
    endpoints: Vec<String>,
}

impl Transport for FakeTransport {
    fn connect(&mut self) {
        self.connects += 1;
    }
    fn disconnect(&mut self) {
        self.disconnects += 1;
    }
    fn switch_endpoint(&mut self, endpoint: &str) {
        self.endpoints.push(endpoint.to_string());
    }
}

type Manager = ConnectionManager<FakeTransport, ManualClock>;

fn start(config: ConnectionConfig) -> (Manager, ManualClock) {
    let clock = ManualClock::new();
    let transport = FakeTransport {
        connects: 0,
        disconnects: 0,
        endpoints: Vec::new(),
    };
    let config = ConnectionConfig {
        rng_seed: Some(42),
        ..config
    };
    (ConnectionManager::new(transport, clock.clone(), config), clock)
}

fn start_default() -> (Manager, ManualClock) {
    start(ConnectionConfig::default())
}

fn join(manager: &mut Manager, protocol_version: u32) {
    manager.handle_event(TransportEvent::Connect);
    manager.handle_event(TransportEvent::JoinProjectResponse {
        protocol_version,
        public_id: "P.test".into(),
    });
}

/// Jump to the deadline of `kind` and fire whatever is due.
fn fire(manager: &mut Manager, clock: &ManualClock, kind: TimerKind) {
    let at = manager
        .timers()
        .deadline(kind)
        .unwrap_or_else(|| panic!("{kind:?} not armed"));
    clock.advance_to(at);
    manager.handle_timeouts();
}

/// Fail the handshake and return the retry delay that was scheduled.
fn fail_once(manager: &mut Manager, clock: &ManualClock) -> Option<Duration> {
    manager.handle_event(TransportEvent::ConnectFailed);
    manager
        .timers()
        .deadline(TimerKind::ConnectRetry)
        .map(|at| at - clock.now())
}

// ─── Retry ladder ───────────────────────────────────────────────────

#[test]
fn test_retry_delays_grow_until_ceiling() {
    let (mut manager, clock) = start_default();
    let mut previous_min = Duration::ZERO;

    for retry in 1..=5u32 {
        let delay = fail_once(&mut manager, &clock).expect("retry scheduled");
        let min = Duration::from_secs(retry as u64);
        assert!(delay >= min, "retry {retry}: {delay:?} below {min:?}");
        assert!(delay < min * 2, "retry {retry}: {delay:?} above jitter range");
        assert!(min > previous_min);
        previous_min = min;

        fire(&mut manager, &clock, TimerKind::ConnectRetry);
        assert_eq!(manager.transport().connects, retry as usize + 1);
    }

    // Sixth error: ladder exhausted, no fallback configured.
    assert_eq!(fail_once(&mut manager, &clock), None);
    assert_eq!(manager.state().error(), Some(ConnectionError::UnableToConnect));
    assert_eq!(manager.state().ready_state_kind(), ReadyStateKind::Closed);
    assert!(!manager.state().is_force_disconnected());
    assert_eq!(manager.transport().disconnects, 1);
    assert_eq!(manager.state().effective(), EffectiveState::Idle);
}

#[test]
fn test_three_failures_then_join() {
    let (mut manager, clock) = start_default();

    for retry in 1..=3u64 {
        let delay = fail_once(&mut manager, &clock).expect("retry scheduled");
        assert!(delay >= Duration::from_secs(retry) && delay < Duration::from_secs(2 * retry));
        fire(&mut manager, &clock, TimerKind::ConnectRetry);
    }
    assert_eq!(manager.transport().connects, 4);
    assert_eq!(manager.connection_attempt(), Some(3));

    join(&mut manager, 1);
    assert!(manager.state().is_open());
    assert_eq!(manager.connection_attempt(), None);
    assert!(!manager.timers().is_armed(TimerKind::ConnectRetry));
}

#[test]
fn test_fallback_endpoint_after_ceiling() {
    let config = ConnectionConfig {
        fallback_endpoint: Some("ws://fallback.local/socket.io".into()),
        project_id: Some("p42".into()),
        ..ConnectionConfig::default()
    };
    let (mut manager, clock) = start(config);

    for _ in 0..5 {
        fail_once(&mut manager, &clock);
        fire(&mut manager, &clock, TimerKind::ConnectRetry);
    }
    manager.handle_event(TransportEvent::ConnectFailed);

    assert!(manager.is_using_fallback());
    assert_eq!(
        manager.transport().endpoints,
        vec!["ws://fallback.local/socket.io?projectId=p42".to_string()]
    );
    assert_eq!(manager.transport().connects, 7);
    assert_eq!(manager.connection_attempt(), Some(0));
    assert_eq!(manager.state().ready_state_kind(), ReadyStateKind::Connecting);

    // The fallback gets its own ladder, then the session gives up.
    for _ in 0..5 {
        fail_once(&mut manager, &clock);
        fire(&mut manager, &clock, TimerKind::ConnectRetry);
    }
    manager.handle_event(TransportEvent::ConnectFailed);
    assert_eq!(manager.state().error(), Some(ConnectionError::UnableToConnect));
    assert_eq!(manager.transport().endpoints.len(), 1);
}

#[test]
fn test_unable_to_connect_recovers_on_activity() {
    let (mut manager, clock) = start_default();
    for _ in 0..5 {
        fail_once(&mut manager, &clock);
        fire(&mut manager, &clock, TimerKind::ConnectRetry);
    }
    manager.handle_event(TransportEvent::ConnectFailed);
    assert_eq!(manager.state().error(), Some(ConnectionError::UnableToConnect));

    // Nothing reconnects by itself.
    manager.handle_event(TransportEvent::Disconnect);
    assert_eq!(manager.state().reconnect_at(), None);
    let connects = manager.transport().connects;

    manager.register_user_activity();
    assert_eq!(manager.transport().connects, connects + 1);
    assert_eq!(manager.state().ready_state_kind(), ReadyStateKind::Connecting);
    assert_eq!(manager.state().error(), None);
}

// ─── Join ───────────────────────────────────────────────────────────

#[test]
fn test_join_clears_error_and_countdown() {
    let (mut manager, _) = start_default();
    manager.handle_event(TransportEvent::ConnectionRejected {
        message: "retry".into(),
    });
    assert!(manager.state().reconnect_at().is_some());

    join(&mut manager, 3);
    let state = manager.state();
    assert!(state.is_open());
    assert_eq!(state.error(), None);
    assert_eq!(state.reconnect_at(), None);
    assert_eq!(state.effective(), EffectiveState::Connected);
    assert!(!manager.timers().is_armed(TimerKind::ReconnectCountdown));
}

#[test]
fn test_protocol_change_forces_disconnect() {
    let (mut manager, clock) = start_default();
    join(&mut manager, 1);

    manager.handle_event(TransportEvent::Disconnect);
    assert_eq!(manager.state().effective(), EffectiveState::CountdownScheduled);
    fire(&mut manager, &clock, TimerKind::ReconnectCountdown);
    assert_eq!(manager.transport().connects, 2);

    join(&mut manager, 2);
    assert!(manager.state().is_force_disconnected());
    assert_eq!(manager.state().error(), Some(ConnectionError::ProtocolChanged));
    assert_eq!(manager.state().forced_disconnect_delay(), Duration::ZERO);

    manager.handle_timeouts();
    assert!(manager.state().is_closed());
    assert_eq!(manager.transport().disconnects, 1);
    assert_eq!(manager.protocol_version(), Some(1));
}

// ─── User activity ──────────────────────────────────────────────────

#[test]
fn test_activity_right_after_attempt_uses_short_countdown() {
    let (mut manager, clock) = start_default();
    join(&mut manager, 1);
    manager.on_before_unload();
    manager.handle_event(TransportEvent::Disconnect);
    assert_eq!(manager.state().effective(), EffectiveState::Idle);

    clock.advance(Duration::from_secs(2));
    manager.register_user_activity();

    let wait = manager
        .state()
        .reconnect_in(clock.now())
        .expect("countdown scheduled");
    // 5s backoff + 3..10s countdown, never the 60..180s inactive range.
    assert!(wait >= Duration::from_secs(8) && wait < Duration::from_secs(15), "{wait:?}");
    assert_eq!(manager.transport().connects, 1);

    fire(&mut manager, &clock, TimerKind::ReconnectCountdown);
    assert_eq!(manager.transport().connects, 2);
}

#[test]
fn test_activity_reconnects_immediately_when_attempt_is_old() {
    let (mut manager, clock) = start_default();
    join(&mut manager, 1);
    manager.on_before_unload();
    manager.handle_event(TransportEvent::Disconnect);

    clock.advance(Duration::from_secs(30));
    manager.register_user_activity();
    assert_eq!(manager.transport().connects, 2);
    assert_eq!(manager.state().ready_state_kind(), ReadyStateKind::Connecting);
    assert_eq!(manager.state().last_connection_attempt, Some(clock.now()));
}

#[test]
fn test_inactive_user_gets_long_countdown() {
    let (mut manager, clock) = start_default();
    join(&mut manager, 1);
    clock.advance(Duration::from_secs(5 * 60));

    manager.handle_event(TransportEvent::Disconnect);
    let wait = manager.state().reconnect_in(clock.now()).expect("countdown");
    assert!(wait >= Duration::from_secs(60) && wait < Duration::from_secs(180), "{wait:?}");
}

#[test]
fn test_try_reconnect_now_uses_one_second_backoff() {
    let (mut manager, clock) = start_default();

    // Still inside the 1s window of the first attempt.
    manager.try_reconnect_now();
    let wait = manager.state().reconnect_in(clock.now()).expect("countdown");
    assert!(wait >= Duration::from_secs(4) && wait < Duration::from_secs(11), "{wait:?}");

    clock.advance(Duration::from_secs(2));
    manager.try_reconnect_now();
    assert_eq!(manager.transport().connects, 2);
    assert_eq!(manager.state().reconnect_at(), None);
}

// ─── Rate limiting ──────────────────────────────────────────────────

#[test]
fn test_rate_limited_reconnect_waits_fifteen_seconds_plus_jitter() {
    let (mut manager, clock) = start_default();
    manager.handle_event(TransportEvent::ConnectionRejected {
        message: "rate-limit hit when joining project".into(),
    });
    assert_eq!(manager.state().error(), Some(ConnectionError::RateLimited));
    assert!(!manager.state().is_force_disconnected());

    manager.handle_event(TransportEvent::Disconnect);
    let wait = manager.state().reconnect_in(clock.now()).expect("countdown");
    assert!(wait >= Duration::from_secs(18) && wait < Duration::from_secs(25), "{wait:?}");

    fire(&mut manager, &clock, TimerKind::ReconnectCountdown);
    assert_eq!(manager.transport().connects, 2);
    assert_eq!(manager.state().error(), None);
}

#[test]
fn test_activity_while_rate_limited_keeps_long_backoff() {
    let (mut manager, clock) = start_default();
    manager.handle_event(TransportEvent::ConnectionRejected {
        message: "rate-limit hit when joining project".into(),
    });
    clock.advance(Duration::from_secs(10));
    manager.register_user_activity();

    let wait = manager.state().reconnect_in(clock.now()).expect("countdown");
    assert!(wait >= Duration::from_secs(18), "{wait:?}");
    assert_eq!(manager.transport().connects, 1);
}

// ─── Forced disconnect ──────────────────────────────────────────────

#[test]
fn test_close_is_terminal_even_after_activity() {
    let (mut manager, clock) = start_default();
    join(&mut manager, 1);

    manager.close(ConnectionError::Maintenance);
    assert_eq!(manager.state().effective(), EffectiveState::ForceDisconnected);
    assert_eq!(manager.state().error(), Some(ConnectionError::Maintenance));
    assert!(!manager.is_online_listener_registered());

    manager.handle_timeouts();
    assert!(manager.state().is_closed());
    assert_eq!(manager.transport().disconnects, 1);
    assert!(manager.timers().is_empty());

    manager.register_user_activity();
    clock.advance(Duration::from_secs(60));
    manager.register_user_activity();
    manager.on_online();
    manager.try_reconnect_now();
    manager.handle_event(TransportEvent::Disconnect);
    clock.advance(Duration::from_secs(3600));
    manager.handle_timeouts();

    assert_eq!(manager.transport().connects, 1);
    assert_eq!(manager.state().reconnect_at(), None);
    assert!(manager.state().is_force_disconnected());
}

#[test]
fn test_close_cancels_pending_retry() {
    let (mut manager, clock) = start_default();
    fail_once(&mut manager, &clock);
    assert!(manager.timers().is_armed(TimerKind::ConnectRetry));

    manager.close(ConnectionError::Maintenance);
    assert!(!manager.timers().is_armed(TimerKind::ConnectRetry));
    clock.advance(Duration::from_secs(30));
    manager.handle_timeouts();
    assert_eq!(manager.transport().connects, 1);
}

#[test]
fn test_server_force_disconnect_honours_delay() {
    let (mut manager, clock) = start_default();
    join(&mut manager, 1);

    manager.handle_event(TransportEvent::ForceDisconnect {
        delay_secs: 10,
        reason: Some("deploy".into()),
    });
    assert_eq!(manager.state().error(), Some(ConnectionError::Maintenance));
    assert_eq!(manager.state().forced_disconnect_delay(), Duration::from_secs(10));

    clock.advance(Duration::from_secs(9));
    assert_eq!(manager.handle_timeouts(), 0);
    assert_eq!(manager.transport().disconnects, 0);

    clock.advance(Duration::from_secs(1));
    assert_eq!(manager.handle_timeouts(), 1);
    assert_eq!(manager.transport().disconnects, 1);
    assert!(manager.state().is_closed());
}

#[test]
fn test_force_disconnect_frame_with_maximal_delay() {
    let (mut manager, clock) = start_default();
    join(&mut manager, 1);

    let frame = r#"{"event":"forceDisconnect","data":{"delaySeconds":18446744073709551615}}"#;
    let event: TransportEvent = ServerMessage::decode(frame)
        .unwrap()
        .expect("lifecycle frame")
        .into();
    manager.handle_event(event);

    assert!(manager.state().is_force_disconnected());
    assert_eq!(manager.state().error(), Some(ConnectionError::Maintenance));
    let grace = manager.state().forced_disconnect_delay();
    assert!(grace >= Duration::from_secs(24 * 3600), "{grace:?}");

    clock.advance(Duration::from_secs(24 * 3600));
    assert_eq!(manager.handle_timeouts(), 0);
    assert!(!manager.state().is_closed());

    clock.advance(grace);
    assert_eq!(manager.handle_timeouts(), 1);
    assert!(manager.state().is_closed());
    assert_eq!(manager.transport().disconnects, 1);
}

#[test]
fn test_terminal_rejections() {
    let cases = [
        ("not authorized", ConnectionError::NotLoggedIn),
        ("invalid session", ConnectionError::NotLoggedIn),
        ("project not found", ConnectionError::ProjectDeleted),
    ];
    for (message, expected) in cases {
        let (mut manager, _) = start_default();
        manager.handle_event(TransportEvent::ConnectionRejected {
            message: message.into(),
        });
        assert!(manager.state().is_force_disconnected(), "{message}");
        assert_eq!(manager.state().error(), Some(expected));
        assert!(expected.is_terminal());

        manager.handle_timeouts();
        assert!(manager.state().is_closed());
        assert_eq!(manager.transport().disconnects, 1);

        // A late join from the rejected socket changes nothing.
        join(&mut manager, 1);
        assert!(!manager.state().is_open());
    }
}

// ─── Idle detection ─────────────────────────────────────────────────

#[test]
fn test_idle_check_disconnects_after_a_day() {
    let (mut manager, clock) = start_default();
    join(&mut manager, 1);

    for _ in 0..24 {
        clock.advance(Duration::from_secs(3600));
        manager.handle_timeouts();
    }
    assert!(manager.state().is_open(), "exactly 24h is not past the limit");

    clock.advance(Duration::from_secs(3600));
    manager.handle_timeouts();

    let state = manager.state();
    assert!(state.inactive_disconnect);
    assert!(state.is_closed());
    assert!(!state.is_force_disconnected());
    assert_eq!(state.reconnect_at(), None);
    assert_eq!(manager.transport().disconnects, 1);
    assert!(manager.timers().is_armed(TimerKind::IdleCheck));
    assert_eq!(manager.stats().idle_disconnects, 1);
}

#[test]
fn test_disconnect_of_idle_session_does_not_reconnect() {
    let (mut manager, clock) = start_default();
    join(&mut manager, 1);
    clock.advance(Duration::from_secs(25 * 3600));

    manager.handle_event(TransportEvent::Disconnect);
    assert!(manager.state().inactive_disconnect);
    assert_eq!(manager.state().reconnect_at(), None);
    assert_eq!(manager.transport().disconnects, 0);

    manager.on_online();
    assert_eq!(manager.transport().connects, 1);

    manager.register_user_activity();
    assert_eq!(manager.transport().connects, 2);
    assert!(!manager.state().inactive_disconnect);
}

// ─── Graceful reconnect ─────────────────────────────────────────────

#[test]
fn test_graceful_reconnect_waits_for_quiet_user() {
    let (mut manager, clock) = start_default();
    join(&mut manager, 1);

    manager.handle_event(TransportEvent::ReconnectGracefully);
    assert!(manager.timers().is_armed(TimerKind::GracefulRetry));
    assert!(manager.state().is_open());

    clock.advance(Duration::from_secs(5));
    manager.register_user_activity();
    manager.handle_timeouts();
    assert!(manager.state().is_open());

    // Quiet for exactly 5s is not yet quiet enough.
    fire(&mut manager, &clock, TimerKind::GracefulRetry);
    assert!(manager.state().is_open());

    fire(&mut manager, &clock, TimerKind::GracefulRetry);
    assert_eq!(manager.transport().disconnects, 1);
    assert_eq!(manager.transport().connects, 2);
    assert_eq!(manager.state().ready_state_kind(), ReadyStateKind::Connecting);
    assert!(!manager.timers().is_armed(TimerKind::GracefulRetry));
}

#[test]
fn test_graceful_reconnect_forced_when_window_ends() {
    let (mut manager, clock) = start_default();
    join(&mut manager, 1);
    manager.handle_event(TransportEvent::ReconnectGracefully);

    let mut polls = 0;
    while manager.state().is_open() {
        let at = manager
            .timers()
            .deadline(TimerKind::GracefulRetry)
            .expect("graceful retry armed");
        clock.advance_to(at);
        manager.register_user_activity();
        manager.handle_timeouts();
        polls += 1;
        assert!(polls <= 10, "window never closed");
    }
    assert_eq!(clock.elapsed(), Duration::from_secs(50));
    assert_eq!(manager.transport().connects, 2);
}

#[test]
fn test_second_graceful_request_is_ignored() {
    let (mut manager, clock) = start_default();
    join(&mut manager, 1);
    manager.handle_event(TransportEvent::ReconnectGracefully);
    let first = manager.timers().deadline(TimerKind::GracefulRetry);

    clock.advance(Duration::from_secs(2));
    manager.handle_event(TransportEvent::ReconnectGracefully);
    assert_eq!(manager.timers().deadline(TimerKind::GracefulRetry), first);
}

#[test]
fn test_graceful_request_from_idle_user_disconnects() {
    let (mut manager, clock) = start_default();
    join(&mut manager, 1);
    clock.advance(Duration::from_secs(19 * 3600));

    manager.handle_event(TransportEvent::ReconnectGracefully);
    assert!(manager.state().inactive_disconnect);
    assert!(manager.state().is_closed());
    assert_eq!(manager.transport().disconnects, 1);
    assert_eq!(manager.transport().connects, 1);
    assert!(!manager.timers().is_armed(TimerKind::GracefulRetry));
}

// ─── Notifications ──────────────────────────────────────────────────

#[test]
fn test_notifications_chain_through_reconnect() {
    let (mut manager, clock) = start_default();
    let mut rx = manager.take_state_rx().expect("receiver");
    join(&mut manager, 1);
    manager.handle_event(TransportEvent::Disconnect);
    fire(&mut manager, &clock, TimerKind::ReconnectCountdown);
    join(&mut manager, 1);

    let mut effective = Vec::new();
    let mut last = None;
    while let Ok(change) = rx.try_recv() {
        if let Some(prev) = last {
            assert_eq!(change.previous_state, prev);
        }
        last = Some(change.state);
        effective.push(change.state.effective());
    }
    effective.dedup();
    assert_eq!(
        effective,
        vec![
            EffectiveState::Idle,
            EffectiveState::Connecting,
            EffectiveState::Connected,
            EffectiveState::Idle,
            EffectiveState::CountdownScheduled,
            EffectiveState::Idle,
            EffectiveState::Connecting,
            EffectiveState::Connected,
        ]
    );
}
