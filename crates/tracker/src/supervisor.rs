//! Connection state machine for a single job's progress channel.
//!
//! [`Supervisor`] owns [`ConnectionState`] and the [`ReconnectBudget`].
//! It does no I/O: the session driver reports what happened (a channel
//! opened, a channel dropped, a reconnect timer fired) and the
//! supervisor answers with what to do next. Every channel attempt gets
//! a fresh [`ChannelId`]; reports about any other id are stale and
//! ignored, which is what keeps a job at one live channel and one
//! pending reconnect timer.
//!
//! ```text
//! Closed -> Connecting -> Open -> Reconnecting -> Connecting -> Open ...
//!                                     \-> (budget spent) Polling -> Done
//! Open -> Done (terminal event or cancellation)
//! any state but Done -> (reattach) Connecting, budget reset
//! ```

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::reconnect::{ReconnectBudget, ReconnectConfig};

/// Lifecycle of the real-time subscription to one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
    Polling,
    Done,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Polling => "polling",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Identifies one channel attempt within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

/// What the driver must do after a channel dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum DropAction {
    /// The report was about a stale channel, or tracking is already
    /// past the real-time phase.
    Ignore,
    /// Arm the (single) reconnect timer.
    ScheduleReconnect {
        /// 0-based reconnect attempt number.
        attempt: u32,
        delay: Duration,
    },
    /// The budget is spent: start the polling fallback. Returned at most
    /// once per attachment (a reattach refills the budget).
    StartPolling,
}

/// Pure connection state machine.
#[derive(Debug)]
pub struct Supervisor {
    state: ConnectionState,
    budget: ReconnectBudget,
    backoff: ReconnectConfig,
    /// The channel attempt currently connecting or open.
    current: Option<ChannelId>,
    next_id: u64,
}

impl Supervisor {
    pub fn new(backoff: ReconnectConfig) -> Self {
        Self {
            state: ConnectionState::Closed,
            budget: ReconnectBudget::new(backoff.max_attempts),
            backoff,
            current: None,
            next_id: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn budget(&self) -> &ReconnectBudget {
        &self.budget
    }

    /// The channel attempt the supervisor currently considers live.
    pub fn current_channel(&self) -> Option<ChannelId> {
        self.current
    }

    pub fn is_current(&self, id: ChannelId) -> bool {
        self.current == Some(id)
    }

    /// `Closed -> Connecting`. Returns the id of the channel to open, or
    /// `None` if tracking already started.
    pub fn start(&mut self) -> Option<ChannelId> {
        if self.state != ConnectionState::Closed {
            return None;
        }
        Some(self.begin_connecting())
    }

    /// The channel opened and the job id was delivered:
    /// `Connecting -> Open`, budget reset. Returns `false` (and changes
    /// nothing) for a stale channel.
    pub fn on_open(&mut self, id: ChannelId) -> bool {
        if self.state != ConnectionState::Connecting || !self.is_current(id) {
            return false;
        }
        self.state = ConnectionState::Open;
        self.budget.reset();
        true
    }

    /// The channel failed to open or closed unexpectedly.
    pub fn on_drop(&mut self, id: ChannelId) -> DropAction {
        let live = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        );
        if !live || !self.is_current(id) {
            return DropAction::Ignore;
        }

        self.current = None;
        match self.budget.consume() {
            Some(attempt) => {
                self.state = ConnectionState::Reconnecting;
                DropAction::ScheduleReconnect {
                    attempt,
                    delay: self.backoff.delay_for_attempt(attempt),
                }
            }
            None => {
                self.state = ConnectionState::Polling;
                DropAction::StartPolling
            }
        }
    }

    /// The reconnect timer fired: `Reconnecting -> Connecting`. Returns
    /// the id of the channel to open.
    pub fn on_reconnect_due(&mut self) -> Option<ChannelId> {
        if self.state != ConnectionState::Reconnecting {
            return None;
        }
        Some(self.begin_connecting())
    }

    /// The backend asked for the job to be re-subscribed. Abandons the
    /// current channel attempt (its later reports become stale), refills
    /// the budget and moves to `Connecting`, including out of `Polling`.
    /// Returns the id of the channel to open, or `None` once `Done`.
    pub fn reattach(&mut self) -> Option<ChannelId> {
        if self.state == ConnectionState::Done {
            return None;
        }
        self.budget.reset();
        Some(self.begin_connecting())
    }

    /// Enter `Done` from any state. Returns the channel that was live,
    /// if any, so the driver can close it. Idempotent.
    pub fn finish(&mut self) -> Option<ChannelId> {
        self.state = ConnectionState::Done;
        self.current.take()
    }

    fn begin_connecting(&mut self) -> ChannelId {
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        self.current = Some(id);
        self.state = ConnectionState::Connecting;
        id
    }
}
