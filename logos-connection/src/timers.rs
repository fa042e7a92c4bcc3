//! Deadline table with one slot per timer category.
//!
//! Arming a category replaces whatever deadline it held, so there is never
//! more than one pending timer of a kind. The manager fires expired slots
//! from `handle_timeouts`; a driver only needs `next_deadline` to know how
//! long to sleep.

use std::time::Instant;

/// Timer categories owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Hourly inactivity poll
    IdleCheck,
    /// Visible "reconnecting in Ns" countdown
    ReconnectCountdown,
    /// Jittered retry after a transport connect error
    ConnectRetry,
    /// Re-poll while waiting for a quiet moment to cycle the socket
    GracefulRetry,
    /// Grace period before a forced disconnect closes the transport
    ForcedDisconnect,
}

impl TimerKind {
    pub const ALL: [TimerKind; 5] = [
        TimerKind::IdleCheck,
        TimerKind::ReconnectCountdown,
        TimerKind::ConnectRetry,
        TimerKind::GracefulRetry,
        TimerKind::ForcedDisconnect,
    ];

    fn slot(self) -> usize {
        match self {
            TimerKind::IdleCheck => 0,
            TimerKind::ReconnectCountdown => 1,
            TimerKind::ConnectRetry => 2,
            TimerKind::GracefulRetry => 3,
            TimerKind::ForcedDisconnect => 4,
        }
    }
}

/// Pending deadlines, indexed by [`TimerKind`].
#[derive(Debug, Clone, Default)]
pub struct TimerTable {
    slots: [Option<Instant>; 5],
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel-and-replace the deadline of `kind`.
    pub fn arm(&mut self, kind: TimerKind, at: Instant) {
        self.slots[kind.slot()] = Some(at);
    }

    /// Cancel `kind`. Returns whether it was pending.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.slots[kind.slot()].take().is_some()
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.slots[kind.slot()]
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadline(kind).is_some()
    }

    /// Earliest pending deadline across all categories.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().flatten().min().copied()
    }

    /// Disarm and return the earliest expired timer, if any.
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerKind> {
        self.pop_expired_except(now, &[])
    }

    /// Like [`TimerTable::pop_expired`], leaving the kinds in `skip` armed.
    pub fn pop_expired_except(&mut self, now: Instant, skip: &[TimerKind]) -> Option<TimerKind> {
        let kind = TimerKind::ALL
            .into_iter()
            .filter(|k| !skip.contains(k))
            .filter_map(|k| self.deadline(k).filter(|at| *at <= now).map(|at| (at, k)))
            .min_by_key(|(at, _)| *at)
            .map(|(_, k)| k)?;
        self.cancel(kind);
        Some(kind)
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.slots = [None; 5];
    }
}
