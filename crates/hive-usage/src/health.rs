//! Health State Machine
//!
//! Tracks whether the pipeline may accept new reports. `collect` is refused
//! in every state but `Ready`, which pushes back on callers while the broker
//! is unreachable instead of buffering without bound.
//!
//! ## State Transitions
//!
//! ```text
//!             connect / start
//! ┌─────────┐ ──────────────> ┌───────┐
//! │ Waiting │                 │ Ready │ <─────────────────┐
//! └─────────┘                 └───┬───┘                   │
//!                                 │ disconnect            │ reconnect
//!                                 │ send failure          │ fallback drained
//!                                 ▼                       │
//!                           ┌───────────┐                 │
//!                           │ Unhealthy │ ────────────────┘
//!                           └───────────┘
//!
//!      any state ── stop() ──> Stopped   (terminal)
//! ```
//!
//! Transitions are computed by the pure [`HealthStatus::next`] table. The
//! current value lives in a `tokio::sync::watch` channel so readers never
//! block and can await changes.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Pipeline readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Constructed, `start()` not finished yet
    Waiting,
    /// Accepting reports
    Ready,
    /// Broker unreachable or the last send failed
    Unhealthy,
    /// `stop()` was called
    Stopped,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    /// Broker connection established
    Connected,
    /// `start()` completed
    Started,
    /// Broker connection lost
    Disconnected,
    /// A send failed after retries
    SendFailed,
    /// Fallback queue emptied by a successful resend
    FallbackDrained,
    /// `stop()` invoked
    Stop,
}

impl HealthStatus {
    /// Transition table. Unlisted pairs keep the current state.
    pub fn next(self, event: HealthEvent) -> HealthStatus {
        use HealthEvent::*;
        use HealthStatus::*;

        match (self, event) {
            (Stopped, _) => Stopped,
            (_, Stop) => Stopped,

            (Waiting, Connected) | (Waiting, Started) => Ready,
            (Unhealthy, Connected) | (Unhealthy, FallbackDrained) => Ready,
            (Ready, Disconnected) | (Ready, SendFailed) => Unhealthy,

            (state, _) => state,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Waiting => "waiting",
            HealthStatus::Ready => "ready",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared handle to the pipeline status.
///
/// Writes are serialized through the watch channel, so an event is always
/// applied against the latest state.
#[derive(Clone)]
pub struct HealthState {
    tx: Arc<watch::Sender<HealthStatus>>,
}

impl HealthState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(HealthStatus::Waiting);
        Self { tx: Arc::new(tx) }
    }

    pub fn status(&self) -> HealthStatus {
        *self.tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == HealthStatus::Ready
    }

    /// Apply `event` and return the resulting status. Re-entering the current
    /// state is a no-op.
    pub fn apply(&self, event: HealthEvent) -> HealthStatus {
        let mut current = HealthStatus::Waiting;
        self.tx.send_if_modified(|status| {
            let next = status.next(event);
            current = next;
            if next == *status {
                return false;
            }
            info!(from = %status, to = %next, event = ?event, "Changing status");
            *status = next;
            true
        });
        current
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.tx.subscribe()
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use HealthEvent::*;
    use HealthStatus::*;

    const ALL_EVENTS: [HealthEvent; 6] =
        [Connected, Started, Disconnected, SendFailed, FallbackDrained, Stop];

    #[test]
    fn test_transition_table() {
        assert_eq!(Waiting.next(Connected), Ready);
        assert_eq!(Waiting.next(Started), Ready);
        assert_eq!(Ready.next(Disconnected), Unhealthy);
        assert_eq!(Ready.next(SendFailed), Unhealthy);
        assert_eq!(Unhealthy.next(Connected), Ready);
        assert_eq!(Unhealthy.next(FallbackDrained), Ready);
    }

    #[test]
    fn test_unlisted_events_keep_state() {
        assert_eq!(Waiting.next(Disconnected), Waiting);
        assert_eq!(Waiting.next(SendFailed), Waiting);
        assert_eq!(Ready.next(Connected), Ready);
        assert_eq!(Ready.next(FallbackDrained), Ready);
        assert_eq!(Unhealthy.next(Disconnected), Unhealthy);
        assert_eq!(Unhealthy.next(Started), Unhealthy);
    }

    #[test]
    fn test_stop_from_any_state() {
        for state in [Waiting, Ready, Unhealthy, Stopped] {
            assert_eq!(state.next(Stop), Stopped);
        }
    }

    #[test]
    fn test_nothing_leaves_stopped() {
        for event in ALL_EVENTS {
            assert_eq!(Stopped.next(event), Stopped);
        }
    }

    #[test]
    fn test_health_state_apply() {
        let health = HealthState::new();
        assert_eq!(health.status(), Waiting);
        assert!(!health.is_ready());

        assert_eq!(health.apply(Connected), Ready);
        assert!(health.is_ready());
        assert_eq!(health.apply(SendFailed), Unhealthy);
        assert_eq!(health.apply(FallbackDrained), Ready);
        assert_eq!(health.apply(Stop), Stopped);
        assert_eq!(health.apply(Connected), Stopped);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes_only() {
        let health = HealthState::new();
        let mut rx = health.subscribe();

        health.apply(Connected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Ready);

        // Same-state event does not notify
        health.apply(Started);
        assert!(!rx.has_changed().unwrap());

        health.apply(Disconnected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Unhealthy);
    }

    #[test]
    fn test_display() {
        assert_eq!(Ready.to_string(), "ready");
        assert_eq!(serde_json::to_string(&Unhealthy).unwrap(), "\"unhealthy\"");
    }
}
