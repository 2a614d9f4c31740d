//! Bounded, drop-oldest event streams exposed to external collaborators.
//!
//! Continuous monitoring cares about the freshest samples, not a complete
//! history, so every stream is a [`tokio::sync::broadcast`] channel with a
//! small fixed capacity: a publisher never blocks, and a subscriber that
//! falls behind loses the oldest events rather than building an unbounded
//! backlog (the lagged receiver resumes at the oldest retained event). The
//! two last-write-wins observables (connection state, handle state) use
//! [`tokio::sync::watch`] instead.

use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::types::{
    CommandResponse, ConnectionState, DeloadEvent, HandleActivityState, HeuristicStatistics,
    ReconnectionRequest, RepNotification, WorkoutMetric,
};

/// Capacity of the metric stream
pub const METRIC_CHANNEL_CAPACITY: usize = 32;
/// Capacity of the rep, heuristic and command-response streams
pub const EVENT_CHANNEL_CAPACITY: usize = 16;
/// Capacity of the deload/safety and reconnection streams
pub const SAFETY_CHANNEL_CAPACITY: usize = 8;
/// Minimum spacing between deload/safety emissions
pub const DELOAD_DEBOUNCE: Duration = Duration::from_secs(2);

/// Central event bus for one connection
pub struct EventBus {
    metrics: broadcast::Sender<WorkoutMetric>,
    reps: broadcast::Sender<RepNotification>,
    heuristics: broadcast::Sender<HeuristicStatistics>,
    deloads: broadcast::Sender<DeloadEvent>,
    reconnects: broadcast::Sender<ReconnectionRequest>,
    responses: broadcast::Sender<CommandResponse>,
    connection_state: watch::Sender<ConnectionState>,
    handle_state: watch::Sender<HandleActivityState>,
    deload_debounce: Duration,
    last_deload: Mutex<Option<Instant>>,
}

impl EventBus {
    /// Create a bus with the default capacities and debounce interval
    #[must_use]
    pub fn new() -> Self {
        Self::with_deload_debounce(DELOAD_DEBOUNCE)
    }

    /// Create a bus with a custom deload debounce interval
    #[must_use]
    pub fn with_deload_debounce(deload_debounce: Duration) -> Self {
        Self {
            metrics: broadcast::channel(METRIC_CHANNEL_CAPACITY).0,
            reps: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            heuristics: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            deloads: broadcast::channel(SAFETY_CHANNEL_CAPACITY).0,
            reconnects: broadcast::channel(SAFETY_CHANNEL_CAPACITY).0,
            responses: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            connection_state: watch::channel(ConnectionState::Disconnected).0,
            handle_state: watch::channel(HandleActivityState::WaitingForRest).0,
            deload_debounce,
            last_deload: Mutex::new(None),
        }
    }

    /// Subscribe to the metric stream
    #[must_use]
    pub fn metrics(&self) -> broadcast::Receiver<WorkoutMetric> {
        self.metrics.subscribe()
    }

    /// Subscribe to rep-count updates
    #[must_use]
    pub fn rep_events(&self) -> broadcast::Receiver<RepNotification> {
        self.reps.subscribe()
    }

    /// Subscribe to phase-statistics updates
    #[must_use]
    pub fn heuristic_events(&self) -> broadcast::Receiver<HeuristicStatistics> {
        self.heuristics.subscribe()
    }

    /// Subscribe to deload/safety events
    #[must_use]
    pub fn deload_events(&self) -> broadcast::Receiver<DeloadEvent> {
        self.deloads.subscribe()
    }

    /// Subscribe to reconnection requests
    #[must_use]
    pub fn reconnection_requests(&self) -> broadcast::Receiver<ReconnectionRequest> {
        self.reconnects.subscribe()
    }

    /// Subscribe to command-response opcodes
    #[must_use]
    pub fn command_responses(&self) -> broadcast::Receiver<CommandResponse> {
        self.responses.subscribe()
    }

    /// Observe the connection state (last-write-wins)
    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state.subscribe()
    }

    /// Observe the handle activity state (last-write-wins)
    #[must_use]
    pub fn handle_state(&self) -> watch::Receiver<HandleActivityState> {
        self.handle_state.subscribe()
    }

    /// Publish a processed workout metric
    pub fn publish_metric(&self, metric: WorkoutMetric) {
        // send only fails with zero subscribers, which is fine
        let _ = self.metrics.send(metric);
    }

    /// Publish a rep-count update
    pub fn publish_rep(&self, rep: RepNotification) {
        let _ = self.reps.send(rep);
    }

    /// Publish phase statistics
    pub fn publish_heuristics(&self, stats: HeuristicStatistics) {
        let _ = self.heuristics.send(stats);
    }

    /// Publish a command response observed on the fan-in channel
    pub fn publish_response(&self, response: CommandResponse) {
        let _ = self.responses.send(response);
    }

    /// Publish a reconnection request
    pub fn publish_reconnect(&self, request: ReconnectionRequest) {
        warn!(
            device = %request.device_name,
            reason = %request.reason,
            "reconnection requested"
        );
        let _ = self.reconnects.send(request);
    }

    /// Publish a deload/safety event, debounced
    ///
    /// Returns `false` when the event was suppressed because the previous
    /// one was emitted less than the debounce interval ago. A machine stuck
    /// in a sustained fault condition would otherwise flood consumers at the
    /// diagnostic poll rate.
    pub fn publish_deload(&self, channel: usize, fault_code: i16, message: String) -> bool {
        let now = Instant::now();
        {
            let mut last = self
                .last_deload
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(at) = *last {
                if now.duration_since(at) < self.deload_debounce {
                    debug!(fault_code, "deload event debounced");
                    return false;
                }
            }
            *last = Some(now);
        }

        warn!(channel, fault_code, %message, "deload event");
        let _ = self.deloads.send(DeloadEvent {
            channel,
            fault_code,
            message,
            timestamp: SystemTime::now(),
        });
        true
    }

    /// Replace the current connection state
    pub fn set_connection_state(&self, state: ConnectionState) {
        debug!(%state, "connection state");
        self.connection_state.send_replace(state);
    }

    /// Replace the current handle activity state
    pub fn set_handle_state(&self, state: HandleActivityState) {
        self.handle_state.send_replace(state);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn metric(tick: u32) -> WorkoutMetric {
        WorkoutMetric {
            timestamp: SystemTime::now(),
            load_a: 0.0,
            load_b: 0.0,
            position_a: 0.0,
            position_b: 0.0,
            velocity_a: 0.0,
            velocity_b: 0.0,
            tick_counter: tick,
            status_flags: 0,
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_never_blocks() {
        let bus = EventBus::new();
        let mut rx = bus.metrics();

        // publish far more than the channel holds; publisher never blocks
        for tick in 0..200u32 {
            bus.publish_metric(metric(tick));
        }

        // the lagging receiver is told how much it missed, then resumes at
        // the oldest retained event
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                assert_eq!(missed, 200 - METRIC_CHANNEL_CAPACITY as u64);
            }
            other => panic!("expected lag, got {other:?}"),
        }

        let first = rx.recv().await.unwrap();
        assert_eq!(first.tick_counter, 200 - METRIC_CHANNEL_CAPACITY as u32);

        // drain: exactly the most recent N events are observable
        let mut last = first.tick_counter;
        while let Ok(m) = rx.try_recv() {
            last = m.tick_counter;
        }
        assert_eq!(last, 199);
    }

    #[tokio::test]
    async fn test_deload_debounce() {
        let bus = EventBus::with_deload_debounce(Duration::from_millis(50));
        let mut rx = bus.deload_events();

        assert!(bus.publish_deload(0, -1, "fault".to_string()));
        assert!(!bus.publish_deload(0, -1, "fault again".to_string()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(bus.publish_deload(0, -1, "fault later".to_string()));

        assert_eq!(rx.recv().await.unwrap().message, "fault");
        assert_eq!(rx.recv().await.unwrap().message, "fault later");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        bus.publish_metric(metric(1));
        bus.publish_rep(crate::codec::decode_rep_frame(&[0u8; 6], false).unwrap());
        assert!(bus.publish_deload(1, 2, "x".to_string()));
    }

    #[tokio::test]
    async fn test_watch_observables_replace() {
        let bus = EventBus::new();
        let state_rx = bus.connection_state();
        assert_eq!(*state_rx.borrow(), ConnectionState::Disconnected);

        bus.set_connection_state(ConnectionState::Scanning);
        bus.set_connection_state(ConnectionState::Connecting);
        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);

        bus.set_handle_state(HandleActivityState::Released);
        assert_eq!(*bus.handle_state().borrow(), HandleActivityState::Released);
    }
}
