use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};

/// Connection lifecycle state, last-write-wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link and no activity
    Disconnected,
    /// Platform discovery is running
    Scanning,
    /// A connect attempt is in flight
    Connecting,
    /// Link established and polling can start
    Connected {
        /// Advertised device name
        name: String,
        /// Opaque platform address/identifier
        address: String,
        /// Hardware model string read after connecting, when available
        hardware_model: Option<String>,
    },
    /// A non-recoverable failure was surfaced to the caller
    Error {
        /// Human-readable description
        message: String,
        /// Underlying cause, when one exists
        cause: Option<String>,
    },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { name, .. } => write!(f, "Connected to {name}"),
            Self::Error { message, .. } => write!(f, "Error: {message}"),
        }
    }
}

/// One advertisement seen during scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedDevice {
    /// Advertised local name, absent for rotating/anonymous advertisers
    pub name: Option<String>,
    /// Opaque platform identifier used to connect
    pub address: String,
    /// Signal strength at the last advertisement
    pub rssi: i16,
}

/// One position/load sample for both cable channels
///
/// Created per successful monitor poll. Velocities are filled in by the
/// [`crate::SignalProcessor`], not by the codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutMetric {
    /// Sample timestamp
    pub timestamp: SystemTime,
    /// Channel A load in kilograms
    pub load_a: f32,
    /// Channel B load in kilograms
    pub load_b: f32,
    /// Channel A cable position in millimeters, signed
    pub position_a: f32,
    /// Channel B cable position in millimeters, signed
    pub position_b: f32,
    /// Channel A smoothed velocity in mm/s, signed
    pub velocity_a: f32,
    /// Channel B smoothed velocity in mm/s, signed
    pub velocity_b: f32,
    /// Firmware tick counter
    pub tick_counter: u32,
    /// Raw machine status flags
    pub status_flags: u16,
}

/// One rep-count update from the machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepNotification {
    /// Count of reps reaching the top of the range
    pub top_counter: i32,
    /// Count of completed reps
    pub complete_counter: i32,
    /// Reps counted inside the configured range of motion (0 on legacy firmware)
    pub reps_rom_count: u16,
    /// Reps counted in the current set (0 on legacy firmware)
    pub reps_set_count: u16,
    /// Top of the detected range of motion in millimeters
    pub range_top: f32,
    /// Bottom of the detected range of motion in millimeters
    pub range_bottom: f32,
    /// Raw frame bytes as received
    pub raw_bytes: Vec<u8>,
    /// Arrival timestamp
    pub timestamp: SystemTime,
    /// True when the 6-byte legacy layout was decoded
    pub is_legacy_format: bool,
}

/// Handle activity detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleActivityState {
    /// Armed but waiting for the cables to return to rest first
    WaitingForRest,
    /// Cables at rest, nobody holding the handles
    Released,
    /// A handle is extended but no confirmed movement yet
    Moving,
    /// A handle is extended and moving: the user has grabbed on
    Grabbed,
}

impl fmt::Display for HandleActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitingForRest => write!(f, "WaitingForRest"),
            Self::Released => write!(f, "Released"),
            Self::Moving => write!(f, "Moving"),
            Self::Grabbed => write!(f, "Grabbed"),
        }
    }
}

/// Force/velocity/power summary for one rep phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct PhaseStats {
    /// Mean force in kilograms
    pub kg_avg: f32,
    /// Peak force in kilograms
    pub kg_max: f32,
    /// Mean velocity in mm/s
    pub vel_avg: f32,
    /// Peak velocity in mm/s
    pub vel_max: f32,
    /// Mean power in watts
    pub watt_avg: f32,
    /// Peak power in watts
    pub watt_max: f32,
}

/// Per-phase statistics delivered at roughly 4 Hz
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeuristicStatistics {
    /// Lifting (muscle-shortening) phase
    pub concentric: PhaseStats,
    /// Lowering (muscle-lengthening) phase
    pub eccentric: PhaseStats,
    /// Arrival timestamp
    pub timestamp: SystemTime,
}

/// Decoded diagnostic frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    /// Four per-subsystem fault codes; zero means no fault
    pub fault_codes: [i16; 4],
    /// Raw temperature sensor bytes
    pub temperatures: [u8; 8],
    /// Arrival timestamp
    pub timestamp: SystemTime,
}

impl DiagnosticReport {
    /// First non-zero fault code, if the machine is reporting one
    #[must_use]
    pub fn active_fault(&self) -> Option<(usize, i16)> {
        self.fault_codes
            .iter()
            .enumerate()
            .find(|(_, code)| **code != 0)
            .map(|(idx, code)| (idx, *code))
    }
}

/// Safety event published when the machine reports a deload/fault condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeloadEvent {
    /// Index of the faulting subsystem
    pub channel: usize,
    /// Raw fault code
    pub fault_code: i16,
    /// Human-readable description
    pub message: String,
    /// Emission timestamp
    pub timestamp: SystemTime,
}

/// Signal to the application that a lost connection should be retried
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectionRequest {
    /// Name of the device that was lost
    pub device_name: String,
    /// Address of the device that was lost
    pub device_address: String,
    /// Why reconnection is being requested
    pub reason: String,
    /// Emission timestamp
    pub timestamp: SystemTime,
}

/// Response frame observed on the command-response channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Opcode byte identifying the response
    pub opcode: u8,
    /// Payload following the opcode
    pub payload: Vec<u8>,
    /// Arrival timestamp
    pub timestamp: SystemTime,
}

/// BLE write mode for the command characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Write with acknowledgment
    WithResponse,
    /// Write without acknowledgment
    WithoutResponse,
}

/// Inter-sample gap statistics, tracked for diagnostic visibility only
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct PollStats {
    /// Shortest observed gap in milliseconds
    pub min_gap_ms: f64,
    /// Longest observed gap in milliseconds
    pub max_gap_ms: f64,
    /// Mean gap in milliseconds
    pub mean_gap_ms: f64,
    /// Number of gaps observed
    pub samples: u64,
}

/// Scan and connect parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// How long to scan before collecting results, in milliseconds
    pub scan_timeout_ms: u64,
    /// Number of connect attempts before giving up
    pub connect_attempts: u32,
    /// Fixed delay between connect attempts, in milliseconds
    pub connect_backoff_ms: u64,
    /// Advertised-name prefix used by the default scan predicate
    pub device_name_prefix: String,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_attempts: 3,
            connect_backoff_ms: 100,
            device_name_prefix: "TRAINER".to_string(),
        }
    }
}

/// Timeouts for every I/O path in the core
///
/// All timeouts resolve to a typed "no response" outcome, never an unhandled
/// fault.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Single connect attempt timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Monitor/diagnostic characteristic read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Delay before retrying after a failed monitor read, in milliseconds
    pub read_retry_delay_ms: u64,
    /// Diagnostic keep-alive poll interval in milliseconds
    pub diagnostic_interval_ms: u64,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Heartbeat read timeout in milliseconds, shorter than the poll timeout
    pub heartbeat_read_timeout_ms: u64,
    /// Best-effort firmware-version read timeout in milliseconds
    pub firmware_read_timeout_ms: u64,
    /// Default wait for a specific command-response opcode in milliseconds
    pub response_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            read_timeout_ms: 1_500,
            read_retry_delay_ms: 50,
            diagnostic_interval_ms: 500,
            heartbeat_interval_ms: 2_000,
            heartbeat_read_timeout_ms: 750,
            firmware_read_timeout_ms: 2_000,
            response_timeout_ms: 5_000,
        }
    }
}

/// Signal-processing thresholds
#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// Lowest plausible cable position in millimeters
    pub min_position: f32,
    /// Highest plausible cable position in millimeters
    pub max_position: f32,
    /// Largest plausible position change between consecutive samples, in mm
    pub position_jump_threshold: f32,
    /// Magnitude above which a position is treated as radio corruption and
    /// replaced with the last good value before validation runs
    pub spike_threshold: f32,
    /// EMA smoothing factor for velocity, `smoothed = α·raw + (1−α)·prev`
    pub ema_alpha: f32,
    /// Whether the jump filter is applied at all
    pub strict_jump_validation: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_position: -1000.0,
            max_position: 1000.0,
            position_jump_threshold: 20.0,
            spike_threshold: 1000.0,
            ema_alpha: 0.3,
            strict_jump_validation: true,
        }
    }
}

/// Handle activity detector thresholds
///
/// Firmware revisions disagree on the exact rest band (2.5–5 mm in the
/// field); the value is configuration, not behavior.
#[derive(Debug, Clone)]
pub struct HandleConfig {
    /// Position below which a channel counts as at rest, in millimeters
    pub rest_threshold: f32,
    /// Position above which a channel counts as extended/grabbed, in mm
    pub grab_threshold: f32,
    /// Velocity magnitude above which a channel counts as moving, in mm/s
    pub velocity_threshold: f32,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            rest_threshold: 3.0,
            grab_threshold: 8.0,
            velocity_threshold: 50.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_config_defaults() {
        let config = TimeoutConfig::default();

        assert_eq!(config.connect_timeout_ms, 15_000);
        assert_eq!(config.read_timeout_ms, 1_500);
        assert_eq!(config.read_retry_delay_ms, 50);
        assert_eq!(config.diagnostic_interval_ms, 500);
        assert_eq!(config.heartbeat_interval_ms, 2_000);
        assert_eq!(config.response_timeout_ms, 5_000);
    }

    #[test]
    fn test_connection_params_default() {
        let params = ConnectionParams::default();
        assert_eq!(params.connect_attempts, 3);
        assert_eq!(params.connect_backoff_ms, 100);
        assert_eq!(params.scan_timeout_ms, 10_000);
    }

    #[test]
    fn test_signal_config_default() {
        let config = SignalConfig::default();
        assert!((config.ema_alpha - 0.3).abs() < f32::EPSILON);
        assert!(config.strict_jump_validation);
        assert!(config.min_position < config.max_position);
    }

    #[test]
    fn test_handle_state_display() {
        assert_eq!(HandleActivityState::WaitingForRest.to_string(), "WaitingForRest");
        assert_eq!(HandleActivityState::Grabbed.to_string(), "Grabbed");
    }

    #[test]
    fn test_active_fault() {
        let report = DiagnosticReport {
            fault_codes: [0, 0, -3, 0],
            temperatures: [0; 8],
            timestamp: SystemTime::now(),
        };
        assert_eq!(report.active_fault(), Some((2, -3)));

        let clean = DiagnosticReport {
            fault_codes: [0; 4],
            temperatures: [0; 8],
            timestamp: SystemTime::now(),
        };
        assert_eq!(clean.active_fault(), None);
    }

    #[test]
    fn test_connection_state_display() {
        let state = ConnectionState::Connected {
            name: "TRAINER-01".to_string(),
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            hardware_model: None,
        };
        assert_eq!(state.to_string(), "Connected to TRAINER-01");
    }
}
