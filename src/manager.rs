//! Connection lifecycle management.
//!
//! The [`ConnectionManager`] is the single entry point an application needs:
//! it owns the link, the event bus and the polling engine, drives the
//! scan/connect/disconnect lifecycle, and distinguishes an explicit
//! disconnect from an unexpected link loss. On an unexpected loss it stops
//! all polling and publishes exactly one [`ReconnectionRequest`]; the policy
//! of whether and when to reconnect stays with the application.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, SystemTime};
use tokio::{
    sync::{broadcast, watch, Mutex, Notify},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    codec,
    engine::PollingEngine,
    error::{Result, TrainerError},
    events::EventBus,
    link::{CharacteristicId, LinkEvent, TrainerLink},
    types::{
        CommandResponse, ConnectionParams, ConnectionState, DeloadEvent, HandleActivityState,
        HandleConfig, HeuristicStatistics, PollStats, ReconnectionRequest, RepNotification,
        ScannedDevice, SignalConfig, TimeoutConfig, WorkoutMetric,
    },
    TARGET_MTU,
};

struct ActiveDevice {
    name: String,
    address: String,
}

/// Owns one link to one machine and everything that runs over it
pub struct ConnectionManager {
    link: Arc<dyn TrainerLink>,
    bus: Arc<EventBus>,
    engine: Arc<PollingEngine>,
    params: ConnectionParams,
    timeouts: TimeoutConfig,
    active: Mutex<Option<ActiveDevice>>,
    explicit_disconnect: Arc<AtomicBool>,
    reconnect_signaled: Arc<AtomicBool>,
    cancel_requested: Arc<AtomicBool>,
    cancel: Arc<Notify>,
    link_watch: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager over the given link with default configuration
    #[must_use]
    pub fn new(link: Arc<dyn TrainerLink>) -> Self {
        Self::with_config(
            link,
            ConnectionParams::default(),
            TimeoutConfig::default(),
            SignalConfig::default(),
            HandleConfig::default(),
        )
    }

    /// Create a manager with explicit tuning for every subsystem
    #[must_use]
    pub fn with_config(
        link: Arc<dyn TrainerLink>,
        params: ConnectionParams,
        timeouts: TimeoutConfig,
        signal_config: SignalConfig,
        handle_config: HandleConfig,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let engine = Arc::new(PollingEngine::new(
            Arc::clone(&link),
            Arc::clone(&bus),
            timeouts.clone(),
            signal_config,
            handle_config,
        ));

        Self {
            link,
            bus,
            engine,
            params,
            timeouts,
            active: Mutex::new(None),
            explicit_disconnect: Arc::new(AtomicBool::new(false)),
            reconnect_signaled: Arc::new(AtomicBool::new(false)),
            cancel_requested: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(Notify::new()),
            link_watch: Mutex::new(None),
        }
    }

    /// Scan for trainers and return candidates, best signal first
    ///
    /// Named devices matching the configured prefix rank above unnamed
    /// advertisers, which on some platforms are rotating addresses from
    /// devices that also advertise under a name.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Ble`] when the platform scan cannot start.
    pub async fn start_scanning(&self) -> Result<Vec<ScannedDevice>> {
        self.bus.set_connection_state(ConnectionState::Scanning);

        self.link.start_scan().await?;
        sleep(Duration::from_millis(self.params.scan_timeout_ms)).await;
        let discovered = self.link.discovered().await?;
        if let Err(e) = self.link.stop_scan().await {
            debug!("stop scan failed: {e}");
        }

        let mut devices: Vec<ScannedDevice> = Vec::new();
        for device in discovered {
            let matches = match &device.name {
                Some(name) => name.starts_with(&self.params.device_name_prefix),
                None => true,
            };
            if matches && !devices.iter().any(|d| d.address == device.address) {
                devices.push(device);
            }
        }

        let any_named = devices.iter().any(|d| d.name.is_some());
        if any_named {
            devices.retain(|d| d.name.is_some());
        }
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));

        info!(count = devices.len(), "scan finished");
        Ok(devices)
    }

    /// Connect to a scanned device, with bounded retries
    ///
    /// Runs up to the configured number of attempts, each under its own
    /// timeout, with a fixed backoff between them. On success the post-connect
    /// sequence runs (priority, MTU, firmware read, all best-effort), the
    /// polling engine starts and the state becomes `Connected`. On exhaustion
    /// the link is torn down and the state returns to `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::ConnectionCancelled`] when
    /// [`Self::cancel_connection`] was called mid-attempt, or
    /// [`TrainerError::ConnectionFailed`] after all attempts fail.
    pub async fn connect(&self, device: &ScannedDevice) -> Result<()> {
        self.explicit_disconnect.store(false, Ordering::Release);
        self.reconnect_signaled.store(false, Ordering::Release);
        self.cancel_requested.store(false, Ordering::Release);
        self.bus.set_connection_state(ConnectionState::Connecting);

        let attempt_timeout = Duration::from_millis(self.timeouts.connect_timeout_ms);
        let backoff = Duration::from_millis(self.params.connect_backoff_ms);
        let mut last_error = String::new();

        for attempt in 1..=self.params.connect_attempts {
            if self.cancel_requested.load(Ordering::Acquire) {
                return self.fail_connect_cancelled().await;
            }

            debug!(attempt, address = %device.address, "connect attempt");
            let outcome = tokio::select! {
                result = timeout(attempt_timeout, self.link.connect(&device.address)) => result,
                () = self.cancel.notified() => {
                    return self.fail_connect_cancelled().await;
                }
            };

            match outcome {
                Ok(Ok(())) => {
                    return self.finish_connect(device).await;
                }
                Ok(Err(e)) => {
                    warn!(attempt, "connect attempt failed: {e}");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(attempt, "connect attempt timed out");
                    last_error =
                        format!("timed out after {}ms", self.timeouts.connect_timeout_ms);
                }
            }

            if attempt < self.params.connect_attempts {
                sleep(backoff).await;
            }
        }

        // leave no half-open link behind
        if let Err(e) = self.link.disconnect().await {
            debug!("cleanup disconnect failed: {e}");
        }
        self.bus.set_connection_state(ConnectionState::Disconnected);
        Err(TrainerError::ConnectionFailed(last_error))
    }

    async fn fail_connect_cancelled(&self) -> Result<()> {
        if let Err(e) = self.link.disconnect().await {
            debug!("cleanup disconnect failed: {e}");
        }
        self.bus.set_connection_state(ConnectionState::Disconnected);
        Err(TrainerError::ConnectionCancelled)
    }

    async fn finish_connect(&self, device: &ScannedDevice) -> Result<()> {
        // best-effort link tuning; failure is not a connect failure
        if let Err(e) = self.link.request_high_priority().await {
            debug!("priority elevation failed: {e}");
        }
        match self.link.request_mtu(TARGET_MTU).await {
            Ok(mtu) => debug!(mtu, "MTU negotiated"),
            Err(e) => debug!("MTU negotiation failed: {e}"),
        }

        let hardware_model = self.read_firmware_revision().await;

        let name = device
            .name
            .clone()
            .unwrap_or_else(|| device.address.clone());

        *self.active.lock().await = Some(ActiveDevice {
            name: name.clone(),
            address: device.address.clone(),
        });

        self.bus.set_connection_state(ConnectionState::Connected {
            name: name.clone(),
            address: device.address.clone(),
            hardware_model,
        });

        self.spawn_link_watch().await;
        self.engine.reset_signal_state().await;
        self.engine.start_all().await;

        info!(%name, address = %device.address, "connected");
        Ok(())
    }

    /// Best-effort firmware revision read over the standard DIS string
    async fn read_firmware_revision(&self) -> Option<String> {
        let wait = Duration::from_millis(self.timeouts.firmware_read_timeout_ms);
        match timeout(wait, self.link.read(CharacteristicId::DeviceInfoFirmware)).await {
            Ok(Ok(bytes)) => {
                let version = String::from_utf8_lossy(&bytes).trim().to_string();
                if version.is_empty() {
                    None
                } else {
                    info!(%version, "firmware revision");
                    Some(version)
                }
            }
            Ok(Err(e)) => {
                debug!("firmware revision unavailable: {e}");
                None
            }
            Err(_) => {
                debug!("firmware revision read timed out");
                None
            }
        }
    }

    /// Watch the platform link events and react to an unexpected loss
    async fn spawn_link_watch(&self) {
        let mut slot = self.link_watch.lock().await;
        if let Some(task) = slot.take() {
            task.abort();
        }

        let mut events = match self.link.link_events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("link event stream unavailable: {e}");
                return;
            }
        };

        let bus = Arc::clone(&self.bus);
        let engine = Arc::clone(&self.engine);
        let explicit = Arc::clone(&self.explicit_disconnect);
        let signaled = Arc::clone(&self.reconnect_signaled);
        let (name, address) = {
            let active = self.active.lock().await;
            active
                .as_ref()
                .map(|d| (d.name.clone(), d.address.clone()))
                .unwrap_or_default()
        };

        *slot = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event != LinkEvent::Disconnected {
                    continue;
                }
                engine.stop_all_polling().await;
                bus.set_connection_state(ConnectionState::Disconnected);

                if explicit.load(Ordering::Acquire) {
                    debug!("explicit disconnect confirmed by platform");
                    break;
                }
                // exactly one request per loss, even if the platform
                // reports the drop more than once
                if signaled.swap(true, Ordering::AcqRel) {
                    break;
                }
                bus.publish_reconnect(ReconnectionRequest {
                    device_name: name.clone(),
                    device_address: address.clone(),
                    reason: "link lost unexpectedly".to_string(),
                    timestamp: SystemTime::now(),
                });
                break;
            }
        }));
    }

    /// Abort an in-flight [`Self::connect`] call
    pub fn cancel_connection(&self) {
        self.cancel_requested.store(true, Ordering::Release);
        self.cancel.notify_waiters();
    }

    /// Disconnect deliberately
    ///
    /// Stops all polling, tears the link down and transitions to
    /// `Disconnected`. A failing link teardown is logged but never blocks
    /// the state transition, and no reconnection request is published.
    pub async fn disconnect(&self) {
        self.explicit_disconnect.store(true, Ordering::Release);
        self.engine.stop_all_polling().await;

        if let Some(task) = self.link_watch.lock().await.take() {
            task.abort();
        }
        if let Err(e) = self.link.disconnect().await {
            warn!("link teardown failed: {e}");
        }

        *self.active.lock().await = None;
        self.bus.set_connection_state(ConnectionState::Disconnected);
        info!("disconnected");
    }

    /// Send a raw command frame to the machine
    ///
    /// # Errors
    ///
    /// See [`PollingEngine::send_command`].
    pub async fn send_workout_command(&self, bytes: &[u8]) -> Result<()> {
        self.engine.send_command(bytes).await
    }

    /// Tell the machine to start a workout
    ///
    /// # Errors
    ///
    /// See [`PollingEngine::send_command`].
    pub async fn start_workout(&self) -> Result<()> {
        self.send_workout_command(&codec::command_start_workout()).await?;
        self.engine.start_active_workout_polling().await;
        Ok(())
    }

    /// Tell the machine to stop the current workout
    ///
    /// # Errors
    ///
    /// See [`PollingEngine::send_command`].
    pub async fn stop_workout(&self) -> Result<()> {
        self.send_workout_command(&codec::command_stop_workout()).await
    }

    /// Send a command and wait for its response opcode
    ///
    /// # Errors
    ///
    /// See [`PollingEngine::send_command_await_response`].
    pub async fn send_command_await_response(
        &self,
        bytes: &[u8],
        opcode: u8,
    ) -> Result<CommandResponse> {
        self.engine.send_command_await_response(bytes, opcode).await
    }

    /// Arm handle-grab detection for auto-start
    pub async fn enable_handle_detection(&self) {
        self.engine.enable_handle_detection().await;
    }

    /// Re-arm the handle detector for a new set
    pub async fn reset_handle_state(&self) {
        self.engine.reset_handle_state().await;
    }

    /// Inter-sample gap statistics for the current connection
    pub async fn poll_stats(&self) -> PollStats {
        self.engine.poll_stats().await
    }

    /// Subscribe to processed workout metrics
    #[must_use]
    pub fn metrics(&self) -> broadcast::Receiver<WorkoutMetric> {
        self.bus.metrics()
    }

    /// Subscribe to rep-count updates
    #[must_use]
    pub fn rep_events(&self) -> broadcast::Receiver<RepNotification> {
        self.bus.rep_events()
    }

    /// Subscribe to per-phase statistics
    #[must_use]
    pub fn heuristic_events(&self) -> broadcast::Receiver<HeuristicStatistics> {
        self.bus.heuristic_events()
    }

    /// Subscribe to deload/safety events
    #[must_use]
    pub fn deload_events(&self) -> broadcast::Receiver<DeloadEvent> {
        self.bus.deload_events()
    }

    /// Subscribe to reconnection requests
    #[must_use]
    pub fn reconnection_requests(&self) -> broadcast::Receiver<ReconnectionRequest> {
        self.bus.reconnection_requests()
    }

    /// Observe the connection state
    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.bus.connection_state()
    }

    /// Observe the handle activity state
    #[must_use]
    pub fn handle_state(&self) -> watch::Receiver<HandleActivityState> {
        self.bus.handle_state()
    }
}
