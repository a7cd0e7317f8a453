use std::time::Duration;

use tokio::time::Instant;

use crate::{
    error::SyncError,
    event::SyncEvent,
    retry::{BackoffPolicy, ReconnectDecision},
    types::{InvalidationReason, SessionPhase},
};

/// Inputs driving the realtime session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    /// Start (or restart) the connection loop.
    Connect,
    /// Server hello with the heartbeat interval.
    Hello { heartbeat_interval_ms: u64 },
    /// Identify accepted; new session established.
    Ready { session_id: String },
    /// Resume accepted; previous session continues.
    Resumed,
    /// Transport error, peer close or missed heartbeat ack.
    ConnectionLost,
    /// Server rejected the session (non-authentication reason).
    InvalidSession,
    /// Server rejected the token, or no token is available.
    AuthenticationFailed,
    /// Supervisor stopped; the session id is kept for a later resume.
    Stop,
    /// Explicit logout; everything is reset.
    Logout,
}

/// What to do when the app comes back from the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeAction {
    /// Gap was short: heartbeat immediately and carry on.
    Heartbeat,
    /// Gap exceeded the resumable window: reconnect and resume.
    Resume,
}

/// Realtime session state owned by the connection supervisor.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    phase: SessionPhase,
    session_id: Option<String>,
    last_sequence: Option<u64>,
    heartbeat_interval: Option<Duration>,
    last_ack: Option<Instant>,
    suspended_at: Option<Instant>,
    reconnect_attempts: u32,
    exhaustion_reported: bool,
    backoff: BackoffPolicy,
}

impl SessionStateMachine {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            phase: SessionPhase::Disconnected,
            session_id: None,
            last_sequence: None,
            heartbeat_interval: None,
            last_ack: None,
            suspended_at: None,
            reconnect_attempts: 0,
            exhaustion_reported: false,
            backoff,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Session id used for resume.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn max_reconnect_attempts(&self) -> u32 {
        self.backoff.max_attempts()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_at.is_some()
    }

    pub fn apply(&mut self, input: &SessionInput) -> Result<Vec<SyncEvent>, SyncError> {
        use SessionPhase::*;

        match input {
            SessionInput::Connect => match self.phase {
                Disconnected => {
                    self.reconnect_attempts = 0;
                    self.exhaustion_reported = false;
                    let next = if self.session_id.is_some() {
                        Resuming
                    } else {
                        Connecting
                    };
                    Ok(self.transition(next))
                }
                Invalidated => Ok(self.transition(Connecting)),
                Connecting | Resuming => Ok(Vec::new()),
                Identifying | Connected => {
                    Err(SyncError::invalid_transition(self.phase, "connect"))
                }
            },
            SessionInput::Hello {
                heartbeat_interval_ms,
            } => {
                self.require_any(&[Connecting, Resuming], "hello")?;
                self.heartbeat_interval = Some(Duration::from_millis(*heartbeat_interval_ms));
                if self.phase == Connecting {
                    Ok(self.transition(Identifying))
                } else {
                    Ok(Vec::new())
                }
            }
            SessionInput::Ready { session_id } => {
                self.require_any(&[Identifying], "ready")?;
                self.session_id = Some(session_id.clone());
                self.reconnect_attempts = 0;
                Ok(self.transition(Connected))
            }
            SessionInput::Resumed => {
                self.require_any(&[Resuming], "resumed")?;
                self.reconnect_attempts = 0;
                Ok(self.transition(Connected))
            }
            SessionInput::ConnectionLost => {
                self.require_any(
                    &[Connecting, Identifying, Connected, Resuming],
                    "connection_lost",
                )?;
                self.last_ack = None;
                let next = if self.session_id.is_some() {
                    Resuming
                } else {
                    Connecting
                };
                Ok(self.transition(next))
            }
            SessionInput::InvalidSession => {
                self.require_any(
                    &[Connecting, Identifying, Connected, Resuming],
                    "invalid_session",
                )?;
                self.session_id = None;
                self.last_sequence = None;
                self.last_ack = None;
                Ok(self.transition(Invalidated))
            }
            SessionInput::AuthenticationFailed => {
                self.reset_session();
                let mut events = self.transition(Disconnected);
                events.push(SyncEvent::SessionInvalidated {
                    reason: InvalidationReason::AuthenticationFailed,
                });
                Ok(events)
            }
            SessionInput::Stop => {
                self.last_ack = None;
                self.suspended_at = None;
                Ok(self.transition(Disconnected))
            }
            SessionInput::Logout => {
                self.reset_session();
                self.reconnect_attempts = 0;
                Ok(self.transition(Disconnected))
            }
        }
    }

    /// Count a reconnect attempt and ask the backoff policy whether to go on.
    ///
    /// Exhaustion moves the session to `Disconnected` and reports
    /// `ReconnectionExhausted` exactly once until the next `Connect`.
    pub fn schedule_reconnect(&mut self) -> Result<(ReconnectDecision, Vec<SyncEvent>), SyncError> {
        use SessionPhase::*;

        self.require_any(&[Connecting, Resuming, Invalidated], "schedule_reconnect")?;
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);

        let decision = self.backoff.decide(self.reconnect_attempts);
        let mut events = Vec::new();
        match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                if self.phase == Invalidated {
                    events.extend(self.transition(Connecting));
                }
                events.push(SyncEvent::Reconnecting {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            ReconnectDecision::Exhausted => {
                self.reset_session();
                events.extend(self.transition(Disconnected));
                if !self.exhaustion_reported {
                    self.exhaustion_reported = true;
                    events.push(SyncEvent::SessionInvalidated {
                        reason: InvalidationReason::ReconnectionExhausted,
                    });
                }
            }
        }
        Ok((decision, events))
    }

    pub fn record_sequence(&mut self, sequence: u64) {
        self.last_sequence = Some(
            self.last_sequence
                .map_or(sequence, |last| last.max(sequence)),
        );
    }

    pub fn record_heartbeat_ack(&mut self, at: Instant) {
        self.last_ack = Some(at);
    }

    /// App went to the background. The session id is kept.
    pub fn suspend(&mut self, at: Instant) {
        if self.suspended_at.is_none() {
            self.suspended_at = Some(at);
        }
    }

    /// App came back. Returns `None` when the session was not suspended.
    pub fn wake(&mut self, at: Instant, resumable_window: Duration) -> Option<WakeAction> {
        let since = self.suspended_at.take()?;
        if at.saturating_duration_since(since) > resumable_window {
            Some(WakeAction::Resume)
        } else {
            Some(WakeAction::Heartbeat)
        }
    }

    fn reset_session(&mut self) {
        self.session_id = None;
        self.last_sequence = None;
        self.heartbeat_interval = None;
        self.last_ack = None;
        self.suspended_at = None;
    }

    fn require_any(&self, expected: &[SessionPhase], action: &str) -> Result<(), SyncError> {
        if expected.contains(&self.phase) {
            Ok(())
        } else {
            Err(SyncError::invalid_transition(self.phase, action))
        }
    }

    fn transition(&mut self, next: SessionPhase) -> Vec<SyncEvent> {
        if self.phase == next {
            return Vec::new();
        }
        self.phase = next;
        vec![SyncEvent::PhaseChanged { phase: next }]
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
