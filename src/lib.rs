#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Liftwire 🏋️
//!
//! A Rust library for communicating with BLE cable resistance-training
//! machines.
//!
//! The machine exposes a Nordic-UART-style custom GATT service carrying a
//! command characteristic, a poll-only monitor characteristic streaming
//! position/load samples for both cable channels, and a set of notify
//! characteristics for rep counts, mode changes, firmware info and phase
//! statistics. This crate implements the full device-communication core on
//! top of that service:
//!
//! - **Connection lifecycle**: scan, filter, connect with retries, explicit
//!   vs. unexpected disconnect discrimination and reconnection signaling
//! - **Polling loops**: monitor sampling, diagnostic keep-alive and heartbeat
//!   loops, each independently cancellable
//! - **Packet codec**: bit-exact decoders for the monitor, rep (legacy and
//!   official layouts), diagnostic and phase-statistics wire formats
//! - **Signal processing**: spike/jump filtering and EMA-smoothed velocity
//!   estimation over the raw position stream
//! - **Handle detection**: a 4-state grab/release state machine used to
//!   auto-detect when a user takes hold of the handles
//! - **Event bus**: bounded, drop-oldest event streams that never block the
//!   radio loops on a slow consumer
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: This library talks to physical exercise equipment under
//! load. Always ensure deload/safety events are handled, users know how to
//! release tension safely, and proper error handling is implemented in your
//! application.
//!
//! ## Quick Start
//!
//! ```no_run
//! use liftwire::{BtleLink, ConnectionManager};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let link = Arc::new(BtleLink::new().await?);
//!     let manager = ConnectionManager::new(link);
//!
//!     let devices = manager.start_scanning().await?;
//!     let device = devices.first().ok_or("no trainer found")?;
//!     manager.connect(device).await?;
//!
//!     let mut metrics = manager.metrics();
//!     while let Ok(sample) = metrics.recv().await {
//!         println!(
//!             "pos {:.1}/{:.1} mm  load {:.1}/{:.1} kg",
//!             sample.position_a, sample.position_b, sample.load_a, sample.load_b,
//!         );
//!     }
//!
//!     Ok(())
//! }
//! ```

/// Binary packet decoders and command encoders
pub mod codec;
/// Polling and notification engine
pub mod engine;
/// Error types and handling
pub mod error;
/// Event bus with bounded drop-oldest streams
pub mod events;
/// Handle activity (grab/release) state machine
pub mod handle;
/// Hardware link abstraction and btleplug implementation
pub mod link;
/// Connection lifecycle manager
pub mod manager;
/// Velocity/position signal processing
pub mod signal;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use engine::PollingEngine;
pub use error::{Result, TrainerError};
pub use events::EventBus;
pub use handle::HandleDetector;
pub use link::{BtleLink, CharacteristicId, LinkEvent, TrainerLink};
pub use manager::ConnectionManager;
pub use signal::SignalProcessor;
pub use types::{
    CommandResponse, ConnectionParams, ConnectionState, DeloadEvent, DiagnosticReport,
    HandleActivityState, HandleConfig, HeuristicStatistics, PhaseStats, PollStats,
    RepNotification, ReconnectionRequest, ScannedDevice, SignalConfig, TimeoutConfig,
    WorkoutMetric, WriteMode,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Primary trainer GATT service UUID (`5E400001-C5A3-F393-E0A9-E50E24DCCA9E`)
///
/// Nordic-UART-style custom service containing every vendor characteristic
/// below. The value must match the machine firmware exactly; it is also used
/// as the scan filter during discovery.
pub const TRAINER_SERVICE_UUID: Uuid = Uuid::from_u128(0x5E40_0001_C5A3_F393_E0A9_E50E_24DC_CA9E);

/// Command characteristic (`5E400002-…`), write with or without response
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x5E40_0002_C5A3_F393_E0A9_E50E_24DC_CA9E);

/// Monitor characteristic (`5E400003-…`), poll-only position/load samples
///
/// This characteristic is not notifiable; the engine reads it in a tight
/// sequential loop and the radio round-trip provides natural backpressure.
pub const MONITOR_CHAR_UUID: Uuid = Uuid::from_u128(0x5E40_0003_C5A3_F393_E0A9_E50E_24DC_CA9E);

/// Rep-count characteristic (`5E400004-…`), notify
pub const REPS_CHAR_UUID: Uuid = Uuid::from_u128(0x5E40_0004_C5A3_F393_E0A9_E50E_24DC_CA9E);

/// Diagnostics characteristic (`5E400005-…`), polled for fault codes
pub const DIAGNOSTICS_CHAR_UUID: Uuid = Uuid::from_u128(0x5E40_0005_C5A3_F393_E0A9_E50E_24DC_CA9E);

/// Phase-statistics characteristic (`5E400006-…`), ~4 Hz heuristic summaries
pub const HEURISTICS_CHAR_UUID: Uuid = Uuid::from_u128(0x5E40_0006_C5A3_F393_E0A9_E50E_24DC_CA9E);

/// Firmware-version characteristic (`5E400007-…`), notify
pub const FIRMWARE_CHAR_UUID: Uuid = Uuid::from_u128(0x5E40_0007_C5A3_F393_E0A9_E50E_24DC_CA9E);

/// Mode-change / command-response characteristic (`5E400008-…`), notify
///
/// A fan-in channel: every frame begins with an opcode byte. Rep events can
/// arrive here opcode-prefixed as well as on the dedicated rep characteristic.
pub const MODE_CHANGE_CHAR_UUID: Uuid = Uuid::from_u128(0x5E40_0008_C5A3_F393_E0A9_E50E_24DC_CA9E);

/// Standard Device-Information-Service firmware revision string (`0x2A26`)
pub const DIS_FIRMWARE_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_2A26_0000_1000_8000_0080_5F9B_34FB);

/// MTU the manager requests after connecting, sized for the largest command
/// frame plus the 3-byte ATT header
pub const TARGET_MTU: u16 = 247;
