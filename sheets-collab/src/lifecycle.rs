//! Connection lifecycle as a pure state machine.
//!
//! ```text
//!            open()              channel opened
//!   ┌──────────────────► Connecting ───────────────► Connected
//!   │                        │                           │
//!   │  reconnect timer       │ abnormal close            │ abnormal close
//!   │                        ▼                           ▼
//!   └──────────────── Disconnected ◄─────────────────────┘
//!                            │
//!                            │ max consecutive abnormal closes
//!                            ▼
//!                          Error   (no timer; open() retries manually)
//! ```
//!
//! [`Lifecycle`] owns no I/O and no timers. Each event method returns the
//! [`Action`]s the driver must perform, in order. This keeps every transition
//! testable without a runtime.

use std::time::Duration;

use crate::config::ReconnectPolicy;
use crate::transport::CloseCode;

/// Observable connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start establishing a new channel.
    Connect,
    /// Drop an in-flight connect attempt.
    AbortConnect,
    ScheduleReconnect(Duration),
    CancelReconnect,
    StartHeartbeat,
    StopHeartbeat,
    SendHeartbeat,
    /// Ask the authority for a full presence snapshot.
    RequestSync,
    CloseChannel { code: CloseCode, reason: String },
    /// Forget all remote presence.
    ResetPresence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelPhase {
    Idle,
    Opening,
    Open,
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    policy: ReconnectPolicy,
    status: ConnectionStatus,
    /// Consecutive abnormal closes since the last successful open
    failures: u32,
    channel: ChannelPhase,
    reconnect_pending: bool,
    heartbeat_running: bool,
    /// The current channel reported an error before closing
    errored: bool,
    exhausted: bool,
    shut_down: bool,
}

impl Lifecycle {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            status: ConnectionStatus::Connecting,
            failures: 0,
            channel: ChannelPhase::Idle,
            reconnect_pending: false,
            heartbeat_running: false,
            errored: false,
            exhausted: false,
            shut_down: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Open the channel. No-op while connected or while a connect is in flight.
    ///
    /// Also the manual retry after exhaustion: the failure count starts over.
    pub fn open(&mut self) -> Vec<Action> {
        if self.channel != ChannelPhase::Idle {
            return Vec::new();
        }
        let mut actions = Vec::new();
        self.shut_down = false;
        if self.exhausted {
            self.exhausted = false;
            self.failures = 0;
        }
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(Action::CancelReconnect);
        }
        self.begin_connect(&mut actions);
        actions
    }

    pub fn channel_opened(&mut self) -> Vec<Action> {
        if self.channel != ChannelPhase::Opening {
            return Vec::new();
        }
        self.channel = ChannelPhase::Open;
        self.errored = false;
        self.status = ConnectionStatus::Connected;
        self.failures = 0;
        self.heartbeat_running = true;
        vec![Action::StartHeartbeat, Action::RequestSync]
    }

    /// The channel reported an error. It stays open; the close that follows
    /// counts as abnormal whatever its code.
    pub fn channel_error(&mut self) -> Vec<Action> {
        if self.channel != ChannelPhase::Idle {
            self.errored = true;
            if !self.shut_down {
                self.status = ConnectionStatus::Error;
            }
        }
        Vec::new()
    }

    pub fn channel_closed(&mut self, code: CloseCode) -> Vec<Action> {
        if self.channel == ChannelPhase::Idle {
            // Already accounted for (local close) or nothing was open.
            return Vec::new();
        }
        let was_open = self.channel == ChannelPhase::Open;
        let errored = std::mem::take(&mut self.errored);
        self.channel = ChannelPhase::Idle;

        let mut actions = Vec::new();
        if self.heartbeat_running {
            self.heartbeat_running = false;
            actions.push(Action::StopHeartbeat);
        }
        if was_open {
            actions.push(Action::ResetPresence);
        }

        if self.shut_down || (code.is_normal() && !errored) {
            self.status = ConnectionStatus::Disconnected;
            return actions;
        }
        if self.exhausted {
            self.status = ConnectionStatus::Error;
            return actions;
        }

        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            self.exhausted = true;
            self.status = ConnectionStatus::Error;
            return actions;
        }

        self.status = ConnectionStatus::Disconnected;
        self.reconnect_pending = true;
        actions.push(Action::ScheduleReconnect(
            self.policy.delay_for_attempt(self.failures - 1),
        ));
        actions
    }

    pub fn reconnect_due(&mut self) -> Vec<Action> {
        if !self.reconnect_pending {
            return Vec::new();
        }
        self.reconnect_pending = false;
        if self.shut_down || self.exhausted || self.channel != ChannelPhase::Idle {
            return Vec::new();
        }
        let mut actions = Vec::new();
        self.begin_connect(&mut actions);
        actions
    }

    pub fn heartbeat_due(&mut self) -> Vec<Action> {
        if self.heartbeat_running
            && self.channel == ChannelPhase::Open
            && self.status == ConnectionStatus::Connected
        {
            vec![Action::SendHeartbeat]
        } else {
            Vec::new()
        }
    }

    /// User-initiated teardown. Suppresses reconnection until the next `open()`.
    ///
    /// Also ends an exhausted state: the next `open()` starts from zero.
    pub fn close(&mut self, reason: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        self.shut_down = true;
        self.exhausted = false;
        self.failures = 0;
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(Action::CancelReconnect);
        }
        if self.heartbeat_running {
            self.heartbeat_running = false;
            actions.push(Action::StopHeartbeat);
        }
        match self.channel {
            ChannelPhase::Open => {
                actions.push(Action::CloseChannel {
                    code: CloseCode::NORMAL,
                    reason: reason.to_owned(),
                });
                actions.push(Action::ResetPresence);
            }
            ChannelPhase::Opening => actions.push(Action::AbortConnect),
            ChannelPhase::Idle => {}
        }
        self.channel = ChannelPhase::Idle;
        self.errored = false;
        self.status = ConnectionStatus::Disconnected;
        actions
    }

    fn begin_connect(&mut self, actions: &mut Vec<Action>) {
        self.channel = ChannelPhase::Opening;
        self.errored = false;
        self.status = ConnectionStatus::Connecting;
        actions.push(Action::Connect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle() -> Lifecycle {
        Lifecycle::new(ReconnectPolicy::default())
    }

    fn abnormal_close(lc: &mut Lifecycle) -> Vec<Action> {
        lc.channel_error();
        lc.channel_closed(CloseCode::ABNORMAL)
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_initial_status_is_connecting() {
        assert_eq!(lifecycle().status(), ConnectionStatus::Connecting);
    }

    #[test]
    fn test_open_then_opened() {
        let mut lc = lifecycle();
        assert_eq!(lc.open(), vec![Action::Connect]);
        assert_eq!(lc.status(), ConnectionStatus::Connecting);
        assert_eq!(lc.channel_opened(), vec![Action::StartHeartbeat, Action::RequestSync]);
        assert_eq!(lc.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_open_is_idempotent() {
        let mut lc = lifecycle();
        lc.open();
        assert!(lc.open().is_empty(), "connect already in flight");
        lc.channel_opened();
        assert!(lc.open().is_empty(), "already connected");
        assert_eq!(lc.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_backoff_doubles_then_exhausts() {
        let mut lc = lifecycle();
        lc.open();

        let mut delays = Vec::new();
        for _ in 0..4 {
            let actions = abnormal_close(&mut lc);
            match actions.as_slice() {
                [Action::ScheduleReconnect(d)] => delays.push(*d),
                other => panic!("unexpected actions {other:?}"),
            }
            assert_eq!(lc.status(), ConnectionStatus::Disconnected);
            assert_eq!(lc.reconnect_due(), vec![Action::Connect]);
        }
        assert_eq!(delays, vec![secs(1), secs(2), secs(4), secs(8)]);

        assert!(abnormal_close(&mut lc).is_empty());
        assert_eq!(lc.status(), ConnectionStatus::Error);
        assert!(lc.is_exhausted());

        // A further close while exhausted schedules nothing.
        assert!(lc.channel_closed(CloseCode::ABNORMAL).is_empty());
        assert!(lc.reconnect_due().is_empty());
        assert_eq!(lc.status(), ConnectionStatus::Error);
    }

    #[test]
    fn test_successful_open_resets_counter() {
        let mut lc = lifecycle();
        lc.open();
        for _ in 0..3 {
            abnormal_close(&mut lc);
            lc.reconnect_due();
        }
        assert_eq!(lc.failures(), 3);

        lc.channel_opened();
        assert_eq!(lc.failures(), 0);

        let actions = lc.channel_closed(CloseCode::ABNORMAL);
        assert_eq!(
            actions,
            vec![
                Action::StopHeartbeat,
                Action::ResetPresence,
                Action::ScheduleReconnect(secs(1)),
            ]
        );
    }

    #[test]
    fn test_normal_close_from_authority_does_not_reconnect() {
        let mut lc = lifecycle();
        lc.open();
        lc.channel_opened();
        let actions = lc.channel_closed(CloseCode::NORMAL);
        assert_eq!(actions, vec![Action::StopHeartbeat, Action::ResetPresence]);
        assert_eq!(lc.status(), ConnectionStatus::Disconnected);
        assert!(!lc.reconnect_pending());
    }

    #[test]
    fn test_normal_close_after_error_reconnects() {
        let mut lc = lifecycle();
        lc.open();
        lc.channel_opened();
        lc.channel_error();
        assert_eq!(
            lc.channel_closed(CloseCode::NORMAL),
            vec![
                Action::StopHeartbeat,
                Action::ResetPresence,
                Action::ScheduleReconnect(secs(1)),
            ]
        );
        assert_eq!(lc.failures(), 1);

        // The error belonged to the old channel.
        assert_eq!(lc.reconnect_due(), vec![Action::Connect]);
        lc.channel_opened();
        assert_eq!(lc.channel_closed(CloseCode::NORMAL), vec![Action::StopHeartbeat, Action::ResetPresence]);
        assert!(!lc.reconnect_pending());
    }

    #[test]
    fn test_channel_error_sets_error_without_closing() {
        let mut lc = lifecycle();
        lc.open();
        lc.channel_opened();
        assert!(lc.channel_error().is_empty());
        assert_eq!(lc.status(), ConnectionStatus::Error);
        assert!(lc.heartbeat_due().is_empty());
    }

    #[test]
    fn test_close_mid_backoff_cancels_timer() {
        let mut lc = lifecycle();
        lc.open();
        abnormal_close(&mut lc);
        assert!(lc.reconnect_pending());

        assert_eq!(lc.close("user initiated"), vec![Action::CancelReconnect]);
        assert_eq!(lc.status(), ConnectionStatus::Disconnected);
        assert!(lc.reconnect_due().is_empty());
    }

    #[test]
    fn test_close_while_connected() {
        let mut lc = lifecycle();
        lc.open();
        lc.channel_opened();
        assert_eq!(
            lc.close("user initiated"),
            vec![
                Action::StopHeartbeat,
                Action::CloseChannel {
                    code: CloseCode::NORMAL,
                    reason: "user initiated".into(),
                },
                Action::ResetPresence,
            ]
        );
        assert!(lc.heartbeat_due().is_empty());
        assert!(lc.close("again").is_empty());
    }

    #[test]
    fn test_close_while_connecting_aborts() {
        let mut lc = lifecycle();
        lc.open();
        assert_eq!(lc.close("bye"), vec![Action::AbortConnect]);
        assert!(lc.channel_opened().is_empty());
        assert_eq!(lc.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_open_after_exhaustion_starts_over() {
        let mut lc = lifecycle();
        lc.open();
        for _ in 0..5 {
            abnormal_close(&mut lc);
            lc.reconnect_due();
        }
        assert_eq!(lc.status(), ConnectionStatus::Error);

        assert_eq!(lc.open(), vec![Action::Connect]);
        assert_eq!(lc.failures(), 0);
        assert_eq!(abnormal_close(&mut lc), vec![Action::ScheduleReconnect(secs(1))]);
    }

    #[test]
    fn test_close_after_exhaustion_clears_it() {
        let mut lc = lifecycle();
        lc.open();
        for _ in 0..5 {
            abnormal_close(&mut lc);
            lc.reconnect_due();
        }
        assert!(lc.is_exhausted());

        assert!(lc.close("user initiated").is_empty());
        assert!(!lc.is_exhausted());
        assert_eq!(lc.failures(), 0);
        assert_eq!(lc.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_open_during_backoff_connects_now() {
        let mut lc = lifecycle();
        lc.open();
        abnormal_close(&mut lc);
        assert_eq!(lc.open(), vec![Action::CancelReconnect, Action::Connect]);
        assert_eq!(lc.failures(), 1);
    }

    #[test]
    fn test_heartbeat_only_while_connected() {
        let mut lc = lifecycle();
        assert!(lc.heartbeat_due().is_empty());
        lc.open();
        assert!(lc.heartbeat_due().is_empty());
        lc.channel_opened();
        assert_eq!(lc.heartbeat_due(), vec![Action::SendHeartbeat]);
    }
}
