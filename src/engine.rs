//! Polling and notification engine.
//!
//! Three independently cancellable loops run for the lifetime of one
//! connection: the monitor poll loop (sequential read-then-decode, natural
//! backpressure from the radio round-trip), the diagnostic keep-alive loop,
//! and the heartbeat loop. Notification subscriptions are set up
//! independently; failing to subscribe to one channel never aborts the
//! others or the connection. The monitor-restart path is the single shared
//! hot spot and is serialized behind a mutex so handle-detection enablement
//! and workout start can never race two monitor loops into existence.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, SystemTime};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval, sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    codec,
    error::{Result, TrainerError},
    events::EventBus,
    handle::HandleDetector,
    link::{CharacteristicId, TrainerLink},
    signal::SignalProcessor,
    types::{CommandResponse, HandleConfig, PollStats, SignalConfig, TimeoutConfig, WriteMode},
};

/// Runs every continuous loop and subscription for one connection
pub struct PollingEngine {
    link: Arc<dyn TrainerLink>,
    bus: Arc<EventBus>,
    timeouts: TimeoutConfig,
    signal: Arc<Mutex<SignalProcessor>>,
    detector: Arc<Mutex<HandleDetector>>,
    detection_enabled: Arc<AtomicBool>,
    // guards the monitor loop restart path; never hold across reads
    monitor_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    diagnostic_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    subscription_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PollingEngine {
    /// Create an engine bound to one link and one event bus
    #[must_use]
    pub fn new(
        link: Arc<dyn TrainerLink>,
        bus: Arc<EventBus>,
        timeouts: TimeoutConfig,
        signal_config: SignalConfig,
        handle_config: HandleConfig,
    ) -> Self {
        Self {
            link,
            bus,
            timeouts,
            signal: Arc::new(Mutex::new(SignalProcessor::new(signal_config))),
            detector: Arc::new(Mutex::new(HandleDetector::new(handle_config))),
            detection_enabled: Arc::new(AtomicBool::new(false)),
            monitor_task: Arc::new(Mutex::new(None)),
            diagnostic_task: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
            subscription_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start every loop and subscription after a successful connect
    pub async fn start_all(&self) {
        self.subscribe_notifications().await;
        self.start_diagnostic_polling().await;
        self.start_heartbeat().await;
        self.restart_monitor_polling().await;
    }

    /// (Re)start the monitor poll loop, cancelling any previous instance
    ///
    /// The mutex makes restarts mutually exclusive: whichever caller wins
    /// aborts the old loop before the next one observes the slot.
    pub async fn restart_monitor_polling(&self) {
        let mut slot = self.monitor_task.lock().await;
        if let Some(task) = slot.take() {
            task.abort();
        }

        let link = Arc::clone(&self.link);
        let bus = Arc::clone(&self.bus);
        let signal = Arc::clone(&self.signal);
        let detector = Arc::clone(&self.detector);
        let detection_enabled = Arc::clone(&self.detection_enabled);
        let read_timeout = Duration::from_millis(self.timeouts.read_timeout_ms);
        let retry_delay = Duration::from_millis(self.timeouts.read_retry_delay_ms);

        *slot = Some(tokio::spawn(async move {
            info!("monitor poll loop started");
            loop {
                let read = timeout(read_timeout, link.read(CharacteristicId::Monitor)).await;
                let bytes = match read {
                    Ok(Ok(bytes)) => bytes,
                    Ok(Err(e)) => {
                        debug!("monitor read failed: {e}");
                        sleep(retry_delay).await;
                        continue;
                    }
                    Err(_) => {
                        // timed out; the loop itself keeps going
                        debug!("monitor read timed out");
                        continue;
                    }
                };

                let metric = match codec::decode_monitor_frame(&bytes) {
                    Ok(metric) => metric,
                    Err(e) => {
                        debug!("monitor frame dropped: {e}");
                        continue;
                    }
                };

                let processed = signal.lock().await.process(metric);
                if let Some(metric) = processed {
                    if detection_enabled.load(Ordering::Acquire) {
                        if let Some(state) = detector.lock().await.analyze(&metric) {
                            bus.set_handle_state(state);
                        }
                    }
                    bus.publish_metric(metric);
                }
            }
        }));
    }

    /// Start the fixed-interval diagnostic keep-alive loop
    pub async fn start_diagnostic_polling(&self) {
        let mut slot = self.diagnostic_task.lock().await;
        if let Some(task) = slot.take() {
            task.abort();
        }

        let link = Arc::clone(&self.link);
        let bus = Arc::clone(&self.bus);
        let poll_interval = Duration::from_millis(self.timeouts.diagnostic_interval_ms);
        let read_timeout = Duration::from_millis(self.timeouts.read_timeout_ms);

        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            loop {
                ticker.tick().await;
                let read = timeout(read_timeout, link.read(CharacteristicId::Diagnostics)).await;
                let bytes = match read {
                    Ok(Ok(bytes)) => bytes,
                    Ok(Err(e)) => {
                        debug!("diagnostic read failed: {e}");
                        continue;
                    }
                    Err(_) => continue,
                };

                match codec::decode_diagnostic_frame(&bytes) {
                    Ok(report) => {
                        if let Some((channel, code)) = report.active_fault() {
                            bus.publish_deload(
                                channel,
                                code,
                                format!("machine fault code {code} on subsystem {channel}"),
                            );
                        }
                    }
                    Err(e) => debug!("diagnostic frame skipped: {e}"),
                }
            }
        }));
    }

    /// Start the heartbeat loop: read first, no-op write as fallback
    pub async fn start_heartbeat(&self) {
        let mut slot = self.heartbeat_task.lock().await;
        if let Some(task) = slot.take() {
            task.abort();
        }

        let link = Arc::clone(&self.link);
        let beat_interval = Duration::from_millis(self.timeouts.heartbeat_interval_ms);
        let read_timeout = Duration::from_millis(self.timeouts.heartbeat_read_timeout_ms);

        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval(beat_interval);
            loop {
                ticker.tick().await;

                let read = timeout(read_timeout, link.read(CharacteristicId::Monitor)).await;
                if matches!(read, Ok(Ok(_))) {
                    continue;
                }

                // the read path is gone; keep the link warm with a no-op,
                // acknowledged write first, unacknowledged second
                let noop = codec::command_noop();
                let with_ack = link
                    .write(CharacteristicId::Command, &noop, WriteMode::WithResponse)
                    .await;
                if with_ack.is_err() {
                    let without_ack = link
                        .write(CharacteristicId::Command, &noop, WriteMode::WithoutResponse)
                        .await;
                    if let Err(e) = without_ack {
                        warn!("heartbeat could not reach the device: {e}");
                    }
                }
            }
        }));
    }

    /// Subscribe to all notification channels
    ///
    /// Each subscription is independent: a failure is logged and the rest
    /// proceed.
    pub async fn subscribe_notifications(&self) {
        let mut tasks = self.subscription_tasks.lock().await;

        match self.link.subscribe(CharacteristicId::Reps).await {
            Ok(mut rx) => {
                let bus = Arc::clone(&self.bus);
                tasks.push(tokio::spawn(async move {
                    while let Some(bytes) = rx.recv().await {
                        match codec::decode_rep_frame(&bytes, false) {
                            Ok(rep) => bus.publish_rep(rep),
                            Err(e) => debug!("rep frame dropped: {e}"),
                        }
                    }
                }));
            }
            Err(e) => warn!("rep subscription unavailable: {e}"),
        }

        match self.link.subscribe(CharacteristicId::ModeChange).await {
            Ok(mut rx) => {
                let bus = Arc::clone(&self.bus);
                tasks.push(tokio::spawn(async move {
                    while let Some(bytes) = rx.recv().await {
                        let Some((&opcode, payload)) = bytes.split_first() else {
                            continue;
                        };
                        // rep events also arrive on this fan-in channel,
                        // opcode-prefixed
                        if opcode == codec::OPCODE_REP_EVENT {
                            match codec::decode_rep_frame(&bytes, true) {
                                Ok(rep) => bus.publish_rep(rep),
                                Err(e) => debug!("fan-in rep frame dropped: {e}"),
                            }
                            continue;
                        }
                        bus.publish_response(CommandResponse {
                            opcode,
                            payload: payload.to_vec(),
                            timestamp: SystemTime::now(),
                        });
                    }
                }));
            }
            Err(e) => warn!("mode-change subscription unavailable: {e}"),
        }

        match self.link.subscribe(CharacteristicId::FirmwareRevision).await {
            Ok(mut rx) => {
                let bus = Arc::clone(&self.bus);
                tasks.push(tokio::spawn(async move {
                    while let Some(bytes) = rx.recv().await {
                        let version = String::from_utf8_lossy(&bytes).into_owned();
                        info!(%version, "firmware version notification");
                        bus.publish_response(CommandResponse {
                            opcode: codec::OPCODE_FIRMWARE_VERSION,
                            payload: bytes,
                            timestamp: SystemTime::now(),
                        });
                    }
                }));
            }
            Err(e) => warn!("firmware subscription unavailable: {e}"),
        }

        match self.link.subscribe(CharacteristicId::Heuristics).await {
            Ok(mut rx) => {
                let bus = Arc::clone(&self.bus);
                tasks.push(tokio::spawn(async move {
                    while let Some(bytes) = rx.recv().await {
                        match codec::decode_heuristic_frame(&bytes) {
                            Ok(stats) => bus.publish_heuristics(stats),
                            Err(e) => debug!("heuristic frame skipped: {e}"),
                        }
                    }
                }));
            }
            Err(e) => warn!("heuristic subscription unavailable: {e}"),
        }
    }

    /// Send a command frame, acknowledged mode first, unacknowledged second
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::NotConnected`] when no link is up, or
    /// [`TrainerError::CommandFailed`] when both write modes fail. Neither
    /// outcome tears down the connection.
    pub async fn send_command(&self, bytes: &[u8]) -> Result<()> {
        if !self.link.is_connected().await {
            return Err(TrainerError::NotConnected);
        }

        match self
            .link
            .write(CharacteristicId::Command, bytes, WriteMode::WithResponse)
            .await
        {
            Ok(()) => Ok(()),
            Err(first) => {
                debug!("acknowledged write failed, retrying without ack: {first}");
                self.link
                    .write(CharacteristicId::Command, bytes, WriteMode::WithoutResponse)
                    .await
                    .map_err(|second| {
                        TrainerError::CommandFailed(format!(
                            "with ack: {first}; without ack: {second}"
                        ))
                    })
            }
        }
    }

    /// Send a command and wait for a response frame with the given opcode
    ///
    /// # Errors
    ///
    /// Propagates [`Self::send_command`] failures and returns
    /// [`TrainerError::NoResponse`] when nothing matching arrives within
    /// the configured response timeout.
    pub async fn send_command_await_response(
        &self,
        bytes: &[u8],
        opcode: u8,
    ) -> Result<CommandResponse> {
        let mut responses = self.bus.command_responses();
        self.send_command(bytes).await?;

        let wait = Duration::from_millis(self.timeouts.response_timeout_ms);
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(TrainerError::NoResponse { opcode });
            }
            match timeout(remaining, responses.recv()).await {
                Ok(Ok(response)) if response.opcode == opcode => return Ok(response),
                Ok(Ok(_)) | Ok(Err(_)) => continue,
                Err(_) => return Err(TrainerError::NoResponse { opcode }),
            }
        }
    }

    /// Arm handle-grab detection and restart the monitor loop
    pub async fn enable_handle_detection(&self) {
        self.detector.lock().await.reset();
        self.detection_enabled.store(true, Ordering::Release);
        self.bus
            .set_handle_state(crate::types::HandleActivityState::WaitingForRest);
        self.restart_monitor_polling().await;
    }

    /// Start polling for an already-running workout, bypassing grab detection
    pub async fn start_active_workout_polling(&self) {
        self.detector.lock().await.bypass();
        self.detection_enabled.store(true, Ordering::Release);
        self.bus
            .set_handle_state(crate::types::HandleActivityState::Grabbed);
        self.restart_monitor_polling().await;
    }

    /// Reset the handle detector to its armed state
    pub async fn reset_handle_state(&self) {
        self.detector.lock().await.reset();
        self.bus
            .set_handle_state(crate::types::HandleActivityState::WaitingForRest);
    }

    /// Forget per-connection signal-processing state
    pub async fn reset_signal_state(&self) {
        self.signal.lock().await.reset();
    }

    /// Inter-sample gap statistics from the signal processor
    pub async fn poll_stats(&self) -> PollStats {
        self.signal.lock().await.poll_stats()
    }

    /// Cancel all loops and subscriptions; idempotent, does not disconnect
    pub async fn stop_all_polling(&self) {
        if let Some(task) = self.monitor_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.diagnostic_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.heartbeat_task.lock().await.take() {
            task.abort();
        }
        for task in self.subscription_tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("all polling stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testing::FakeLink;
    use crate::types::HandleActivityState;

    fn fixture() -> (Arc<FakeLink>, Arc<EventBus>, PollingEngine) {
        let link = Arc::new(FakeLink::new());
        let bus = Arc::new(EventBus::new());
        let engine = PollingEngine::new(
            link.clone(),
            Arc::clone(&bus),
            TimeoutConfig::default(),
            SignalConfig::default(),
            HandleConfig::default(),
        );
        (link, bus, engine)
    }

    fn monitor_frame() -> Vec<u8> {
        vec![
            0x10, 0x00, 0x00, 0x00, // tick = 16
            0x64, 0x00, // posA = 10.0 mm
            0xE8, 0x03, // loadA = 10.0 kg
            0x00, 0x00, // posB = 0
            0xB8, 0x0B, // loadB = 30.0 kg
            0x00, 0x00, 0x00, 0x00,
        ]
    }

    #[tokio::test]
    async fn test_send_command_requires_connection() {
        let (_link, _bus, engine) = fixture();
        let err = engine.send_command(&codec::command_start_workout()).await.unwrap_err();
        assert!(matches!(err, TrainerError::NotConnected));
    }

    #[tokio::test]
    async fn test_send_command_falls_back_to_unacknowledged() {
        let (link, _bus, engine) = fixture();
        link.connected.store(true, Ordering::SeqCst);
        link.fail_acknowledged_writes.store(true, Ordering::SeqCst);

        engine.send_command(&codec::command_start_workout()).await.unwrap();

        let writes = link.writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].2, WriteMode::WithResponse);
        assert_eq!(writes[1].2, WriteMode::WithoutResponse);
        assert_eq!(writes[0].1, writes[1].1);
    }

    #[tokio::test]
    async fn test_send_command_failure_does_not_disconnect() {
        let (link, _bus, engine) = fixture();
        link.connected.store(true, Ordering::SeqCst);
        link.fail_all_writes.store(true, Ordering::SeqCst);

        let err = engine.send_command(&codec::command_stop_workout()).await.unwrap_err();
        assert!(matches!(err, TrainerError::CommandFailed(_)));
        assert!(link.is_connected().await);
    }

    #[tokio::test]
    async fn test_monitor_loop_decodes_and_publishes() {
        let (link, bus, engine) = fixture();
        link.script_read(CharacteristicId::Monitor, Ok(monitor_frame()));

        let mut metrics = bus.metrics();
        engine.restart_monitor_polling().await;

        let metric = metrics.recv().await.unwrap();
        assert_eq!(metric.tick_counter, 16);
        assert!((metric.position_a - 10.0).abs() < f32::EPSILON);
        assert!((metric.load_b - 30.0).abs() < f32::EPSILON);

        engine.stop_all_polling().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_loop_survives_read_errors() {
        let (link, bus, engine) = fixture();
        link.script_read(
            CharacteristicId::Monitor,
            Err(TrainerError::Protocol("radio glitch".to_string())),
        );
        link.script_read(CharacteristicId::Monitor, Ok(monitor_frame()));

        let mut metrics = bus.metrics();
        engine.restart_monitor_polling().await;

        // the failed read costs one retry delay, then the loop recovers
        let metric = metrics.recv().await.unwrap();
        assert_eq!(metric.tick_counter, 16);

        engine.stop_all_polling().await;
    }

    #[tokio::test]
    async fn test_rep_and_fanin_notifications() {
        let (link, bus, engine) = fixture();
        let mut reps = bus.rep_events();
        let mut responses = bus.command_responses();

        engine.subscribe_notifications().await;

        // dedicated rep characteristic: no opcode prefix
        link.notify(
            CharacteristicId::Reps,
            codec::encode_rep_frame_official(4, 3, 500.0, 10.0, 3, 5, 3, 5),
        )
        .await;
        let rep = reps.recv().await.unwrap();
        assert_eq!(rep.top_counter, 4);
        assert_eq!(rep.complete_counter, 3);

        // fan-in channel: rep events arrive opcode-prefixed
        let mut prefixed = vec![codec::OPCODE_REP_EVENT];
        prefixed.extend(codec::encode_rep_frame_official(5, 4, 500.0, 10.0, 4, 5, 4, 5));
        link.notify(CharacteristicId::ModeChange, prefixed).await;
        let rep = reps.recv().await.unwrap();
        assert_eq!(rep.top_counter, 5);

        // any other opcode surfaces as a command response
        link.notify(CharacteristicId::ModeChange, vec![0x10, 0xAA, 0xBB]).await;
        let response = responses.recv().await.unwrap();
        assert_eq!(response.opcode, 0x10);
        assert_eq!(response.payload, vec![0xAA, 0xBB]);

        engine.stop_all_polling().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_response_matches_opcode() {
        let (link, _bus, engine) = fixture();
        link.connected.store(true, Ordering::SeqCst);
        engine.subscribe_notifications().await;

        let link_clone = Arc::clone(&link);
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            // an unrelated response first, then the awaited one
            link_clone.notify(CharacteristicId::ModeChange, vec![0x11]).await;
            link_clone.notify(CharacteristicId::ModeChange, vec![0x42, 0x01]).await;
        });

        let response = engine
            .send_command_await_response(&codec::encode_command(0x42, &[]), 0x42)
            .await
            .unwrap();
        assert_eq!(response.opcode, 0x42);
        assert_eq!(response.payload, vec![0x01]);

        engine.stop_all_polling().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_response_times_out() {
        let (link, _bus, engine) = fixture();
        link.connected.store(true, Ordering::SeqCst);
        engine.subscribe_notifications().await;

        let err = engine
            .send_command_await_response(&codec::encode_command(0x42, &[]), 0x42)
            .await
            .unwrap_err();
        assert!(matches!(err, TrainerError::NoResponse { opcode: 0x42 }));

        engine.stop_all_polling().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_falls_back_to_noop_write() {
        let (link, _bus, engine) = fixture();
        link.connected.store(true, Ordering::SeqCst);
        link.fail_acknowledged_writes.store(true, Ordering::SeqCst);

        // no monitor reads scripted: every heartbeat read times out
        engine.start_heartbeat().await;
        sleep(Duration::from_secs(3)).await;
        engine.stop_all_polling().await;

        let writes = link.writes.lock().unwrap();
        let noop = codec::command_noop();
        assert!(writes
            .iter()
            .any(|(id, bytes, mode)| *id == CharacteristicId::Command
                && *bytes == noop
                && *mode == WriteMode::WithoutResponse));
    }

    #[tokio::test]
    async fn test_detection_modes_set_handle_state() {
        let (_link, bus, engine) = fixture();

        engine.enable_handle_detection().await;
        assert_eq!(*bus.handle_state().borrow(), HandleActivityState::WaitingForRest);

        engine.start_active_workout_polling().await;
        assert_eq!(*bus.handle_state().borrow(), HandleActivityState::Grabbed);

        engine.reset_handle_state().await;
        assert_eq!(*bus.handle_state().borrow(), HandleActivityState::WaitingForRest);

        engine.stop_all_polling().await;
    }

    #[tokio::test]
    async fn test_stop_all_polling_is_idempotent() {
        let (_link, _bus, engine) = fixture();
        engine.start_all().await;
        engine.stop_all_polling().await;
        engine.stop_all_polling().await;
    }
}
