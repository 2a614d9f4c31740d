use thiserror::Error;

use crate::link::CharacteristicId;

/// Errors that can occur when working with a trainer machine
#[derive(Error, Debug)]
pub enum TrainerError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Trainer device not found during scanning
    #[error("Trainer device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Connection attempt was cancelled by the caller
    #[error("Connection attempt cancelled")]
    ConnectionCancelled,

    /// Device disconnected / no active connection
    #[error("Device not connected")]
    NotConnected,

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// A frame was too short to decode
    #[error("Insufficient data: need at least {needed} bytes, got {got}")]
    InsufficientData {
        /// Minimum number of bytes the decoder requires
        needed: usize,
        /// Number of bytes actually received
        got: usize,
    },

    /// A required GATT characteristic was not present on the device
    #[error("Characteristic not available: {0:?}")]
    CharacteristicMissing(CharacteristicId),

    /// Command could not be delivered in either write mode
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// No response carrying the expected opcode arrived in time
    #[error("No response for opcode {opcode:#04X}")]
    NoResponse {
        /// Opcode that was awaited
        opcode: u8,
    },

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for trainer operations
pub type Result<T> = std::result::Result<T, TrainerError>;

impl TrainerError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::ConnectionFailed(_) | Self::NotConnected | Self::DeviceNotFound
        )
    }

    /// Check if this error is transient and worth retrying
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::NoResponse { .. } | Self::CommandFailed(_)
        )
    }

    /// Check if this error means a frame should simply be dropped
    ///
    /// Malformed frames are expected under noisy radio conditions and never
    /// tear down the connection.
    #[must_use]
    pub const fn is_malformed_frame(&self) -> bool {
        matches!(self, Self::InsufficientData { .. })
    }
}
