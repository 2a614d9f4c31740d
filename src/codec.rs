//! Binary packet codec for the trainer wire formats.
//!
//! Every decoder here is a pure, total function over its byte-length
//! precondition: short input yields [`TrainerError::InsufficientData`],
//! nothing panics on malformed content, and unknown trailing bytes are
//! ignored. Range validation of the decoded numbers is the signal
//! processor's job, not the codec's.
//!
//! Monitor frame layout (little-endian, poll characteristic):
//!
//! ```text
//! ┌─────────┬──────────┬───────┬────────┬───────┬────────┬──────────┬────────┐
//! │ tickLow │ tickHigh │ posA  │ loadA  │ posB  │ loadB  │ reserved │ status │
//! │ u16 @0  │ u16 @2   │ i16 @4│ u16 @6 │ i16 @8│ u16 @10│ 4B @12   │ u16 @16│
//! └─────────┴──────────┴───────┴────────┴───────┴────────┴──────────┴────────┘
//! ```
//!
//! Positions are 0.1 mm units (/10.0 to mm), loads are centi-kilograms
//! (/100.0 to kg). The status word is only present on frames of 18+ bytes.

use bytes::{Buf, BufMut, BytesMut};
use std::time::SystemTime;

use crate::{
    error::{Result, TrainerError},
    types::{DiagnosticReport, HeuristicStatistics, PhaseStats, RepNotification, WorkoutMetric},
};

/// Minimum monitor frame length
pub const MONITOR_FRAME_MIN: usize = 16;
/// Monitor frame length including the status word
pub const MONITOR_FRAME_WITH_STATUS: usize = 18;
/// Minimum legacy rep frame length (without opcode prefix)
pub const REP_FRAME_LEGACY_MIN: usize = 6;
/// Minimum official rep frame length (without opcode prefix)
pub const REP_FRAME_OFFICIAL_MIN: usize = 24;
/// Minimum diagnostic frame length
pub const DIAGNOSTIC_FRAME_MIN: usize = 20;
/// Minimum heuristic/phase-statistics frame length
pub const HEURISTIC_FRAME_MIN: usize = 48;

/// No-op opcode used by the heartbeat fallback write
pub const OPCODE_NOOP: u8 = 0x00;
/// Start-workout command opcode
pub const OPCODE_START_WORKOUT: u8 = 0x01;
/// Stop-workout command opcode
pub const OPCODE_STOP_WORKOUT: u8 = 0x02;
/// Opcode prefixing rep frames on the fan-in notification channel
pub const OPCODE_REP_EVENT: u8 = 0x52;
/// Opcode prefixing firmware-version strings on the fan-in channel
pub const OPCODE_FIRMWARE_VERSION: u8 = 0x56;

/// Fixed size of the heartbeat no-op command frame
pub const NOOP_FRAME_LEN: usize = 4;

fn ensure_len(bytes: &[u8], needed: usize) -> Result<()> {
    if bytes.len() < needed {
        return Err(TrainerError::InsufficientData {
            needed,
            got: bytes.len(),
        });
    }
    Ok(())
}

/// Decode a little-endian monitor frame into a [`WorkoutMetric`]
///
/// Requires at least [`MONITOR_FRAME_MIN`] bytes; the status word is decoded
/// only when at least [`MONITOR_FRAME_WITH_STATUS`] bytes are present.
/// Velocity fields are zero; the signal processor derives them.
///
/// # Errors
///
/// Returns [`TrainerError::InsufficientData`] for short frames.
pub fn decode_monitor_frame(bytes: &[u8]) -> Result<WorkoutMetric> {
    ensure_len(bytes, MONITOR_FRAME_MIN)?;

    let mut buf = bytes;
    let tick_low = buf.get_u16_le();
    let tick_high = buf.get_u16_le();
    let tick_counter = (u32::from(tick_high) << 16) | u32::from(tick_low);

    let position_a = f32::from(buf.get_i16_le()) / 10.0;
    let load_a = f32::from(buf.get_u16_le()) / 100.0;
    let position_b = f32::from(buf.get_i16_le()) / 10.0;
    let load_b = f32::from(buf.get_u16_le()) / 100.0;

    let status_flags = if bytes.len() >= MONITOR_FRAME_WITH_STATUS {
        u16::from_le_bytes([bytes[16], bytes[17]])
    } else {
        0
    };

    Ok(WorkoutMetric {
        timestamp: SystemTime::now(),
        load_a,
        load_b,
        position_a,
        position_b,
        velocity_a: 0.0,
        velocity_b: 0.0,
        tick_counter,
        status_flags,
    })
}

/// Decode a rep-count frame in either the legacy or the official layout
///
/// The two wire variants are distinguished purely by length: 24+ payload
/// bytes select the official layout (i32 counters, f32 range, u16 set/rom
/// counts), 6+ bytes select the legacy layout (u16 counters only). Frames
/// from the fan-in notification channel carry a one-byte opcode prefix that
/// shifts every offset by one; pass `has_opcode_prefix = true` for those.
///
/// # Errors
///
/// Returns [`TrainerError::InsufficientData`] below the legacy minimum.
pub fn decode_rep_frame(bytes: &[u8], has_opcode_prefix: bool) -> Result<RepNotification> {
    let offset = usize::from(has_opcode_prefix);

    if bytes.len() >= REP_FRAME_OFFICIAL_MIN + offset {
        let mut buf = &bytes[offset..];
        let top_counter = buf.get_i32_le();
        let complete_counter = buf.get_i32_le();
        let range_top = buf.get_f32_le();
        let range_bottom = buf.get_f32_le();
        let reps_rom_count = buf.get_u16_le();
        let _reps_rom_total = buf.get_u16_le();
        let reps_set_count = buf.get_u16_le();
        let _reps_set_total = buf.get_u16_le();

        return Ok(RepNotification {
            top_counter,
            complete_counter,
            reps_rom_count,
            reps_set_count,
            range_top,
            range_bottom,
            raw_bytes: bytes.to_vec(),
            timestamp: SystemTime::now(),
            is_legacy_format: false,
        });
    }

    ensure_len(bytes, REP_FRAME_LEGACY_MIN + offset)?;

    let top_counter = i32::from(u16::from_le_bytes([bytes[offset], bytes[offset + 1]]));
    let complete_counter = i32::from(u16::from_le_bytes([bytes[offset + 4], bytes[offset + 5]]));

    Ok(RepNotification {
        top_counter,
        complete_counter,
        reps_rom_count: 0,
        reps_set_count: 0,
        range_top: 0.0,
        range_bottom: 0.0,
        raw_bytes: bytes.to_vec(),
        timestamp: SystemTime::now(),
        is_legacy_format: true,
    })
}

/// Decode a diagnostic frame: four fault codes and the raw temperature block
///
/// # Errors
///
/// Returns [`TrainerError::InsufficientData`] for frames under 20 bytes.
pub fn decode_diagnostic_frame(bytes: &[u8]) -> Result<DiagnosticReport> {
    ensure_len(bytes, DIAGNOSTIC_FRAME_MIN)?;

    let mut fault_codes = [0i16; 4];
    let mut buf = &bytes[4..12];
    for code in &mut fault_codes {
        *code = buf.get_i16_le();
    }

    let mut temperatures = [0u8; 8];
    temperatures.copy_from_slice(&bytes[12..20]);

    Ok(DiagnosticReport {
        fault_codes,
        temperatures,
        timestamp: SystemTime::now(),
    })
}

fn decode_phase_block(buf: &mut &[u8]) -> PhaseStats {
    PhaseStats {
        kg_avg: buf.get_f32_le(),
        kg_max: buf.get_f32_le(),
        vel_avg: buf.get_f32_le(),
        vel_max: buf.get_f32_le(),
        watt_avg: buf.get_f32_le(),
        watt_max: buf.get_f32_le(),
    }
}

/// Decode a heuristic/phase-statistics frame
///
/// Two 24-byte blocks of six little-endian f32 each: concentric then
/// eccentric phase.
///
/// # Errors
///
/// Returns [`TrainerError::InsufficientData`] for frames under 48 bytes.
pub fn decode_heuristic_frame(bytes: &[u8]) -> Result<HeuristicStatistics> {
    ensure_len(bytes, HEURISTIC_FRAME_MIN)?;

    let mut buf = bytes;
    let concentric = decode_phase_block(&mut buf);
    let eccentric = decode_phase_block(&mut buf);

    Ok(HeuristicStatistics {
        concentric,
        eccentric,
        timestamp: SystemTime::now(),
    })
}

/// Decode the big-endian notification variant of the monitor frame
///
/// Layout (all big-endian): u32 tick, i16 posA, u16 velA, i16 posB, u16
/// velB, u16 loadA, u16 loadB. Velocities are unsigned-biased
/// (`raw − 32768`) rather than smoothed; positions are 0.1 mm units.
///
/// # Errors
///
/// Returns [`TrainerError::InsufficientData`] for frames under 16 bytes.
pub fn decode_metrics_packet_be(bytes: &[u8]) -> Result<WorkoutMetric> {
    ensure_len(bytes, MONITOR_FRAME_MIN)?;

    let mut buf = bytes;
    let tick_counter = buf.get_u32();
    let position_a = f32::from(buf.get_i16()) / 10.0;
    let velocity_a = (i32::from(buf.get_u16()) - 32768) as f32;
    let position_b = f32::from(buf.get_i16()) / 10.0;
    let velocity_b = (i32::from(buf.get_u16()) - 32768) as f32;
    let load_a = f32::from(buf.get_u16()) / 100.0;
    let load_b = f32::from(buf.get_u16()) / 100.0;

    Ok(WorkoutMetric {
        timestamp: SystemTime::now(),
        load_a,
        load_b,
        position_a,
        position_b,
        velocity_a,
        velocity_b,
        tick_counter,
        status_flags: 0,
    })
}

/// Encode a command frame: opcode byte followed by the payload
#[must_use]
pub fn encode_command(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(opcode);
    buf.extend_from_slice(payload);
    buf.to_vec()
}

/// Build the start-workout command frame
#[must_use]
pub fn command_start_workout() -> Vec<u8> {
    encode_command(OPCODE_START_WORKOUT, &[])
}

/// Build the stop-workout command frame
#[must_use]
pub fn command_stop_workout() -> Vec<u8> {
    encode_command(OPCODE_STOP_WORKOUT, &[])
}

/// Build the fixed-size no-op frame written by the heartbeat fallback
#[must_use]
pub fn command_noop() -> Vec<u8> {
    vec![OPCODE_NOOP; NOOP_FRAME_LEN]
}

/// Encode a synthetic 24-byte official rep frame
///
/// Mirrors [`decode_rep_frame`]'s official layout exactly; mainly useful for
/// tests and simulators.
#[must_use]
pub fn encode_rep_frame_official(
    top_counter: i32,
    complete_counter: i32,
    range_top: f32,
    range_bottom: f32,
    reps_rom_count: u16,
    reps_rom_total: u16,
    reps_set_count: u16,
    reps_set_total: u16,
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(REP_FRAME_OFFICIAL_MIN);
    buf.put_i32_le(top_counter);
    buf.put_i32_le(complete_counter);
    buf.put_f32_le(range_top);
    buf.put_f32_le(range_bottom);
    buf.put_u16_le(reps_rom_count);
    buf.put_u16_le(reps_rom_total);
    buf.put_u16_le(reps_set_count);
    buf.put_u16_le(reps_set_total);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_frame_decoding() {
        // tick=16, posA=10.0mm, loadA=10.0kg, posB=0.0mm, loadB=30.0kg
        let frame = [
            0x10, 0x00, 0x00, 0x00, // tick
            0x64, 0x00, // posA = 100 -> 10.0 mm
            0xE8, 0x03, // loadA = 1000 -> 10.0 kg
            0x00, 0x00, // posB = 0
            0xB8, 0x0B, // loadB = 3000 -> 30.0 kg
            0x00, 0x00, 0x00, 0x00, // reserved
        ];

        let metric = decode_monitor_frame(&frame).unwrap();
        assert_eq!(metric.tick_counter, 16);
        assert!((metric.position_a - 10.0).abs() < f32::EPSILON);
        assert!((metric.load_a - 10.0).abs() < f32::EPSILON);
        assert!(metric.position_b.abs() < f32::EPSILON);
        assert!((metric.load_b - 30.0).abs() < f32::EPSILON);
        assert_eq!(metric.status_flags, 0);
    }

    #[test]
    fn test_monitor_frame_status_word() {
        let mut frame = vec![0u8; 18];
        frame[16] = 0x2C;
        frame[17] = 0x01;

        let metric = decode_monitor_frame(&frame).unwrap();
        assert_eq!(metric.status_flags, 0x012C);
    }

    #[test]
    fn test_monitor_frame_negative_position() {
        let mut frame = vec![0u8; 16];
        frame[4..6].copy_from_slice(&(-250i16).to_le_bytes());

        let metric = decode_monitor_frame(&frame).unwrap();
        assert!((metric.position_a + 25.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_monitor_frame_tick_counter_combines_halves() {
        let mut frame = vec![0u8; 16];
        frame[0..2].copy_from_slice(&0xBEEF_u16.to_le_bytes());
        frame[2..4].copy_from_slice(&0xDEAD_u16.to_le_bytes());

        let metric = decode_monitor_frame(&frame).unwrap();
        assert_eq!(metric.tick_counter, 0xDEAD_BEEF);
    }

    #[test]
    fn test_short_frames_fail_without_panicking() {
        for len in 0..MONITOR_FRAME_MIN {
            let err = decode_monitor_frame(&vec![0u8; len]).unwrap_err();
            assert!(err.is_malformed_frame());
        }
        for len in 0..REP_FRAME_LEGACY_MIN {
            assert!(decode_rep_frame(&vec![0u8; len], false).is_err());
        }
        for len in 0..DIAGNOSTIC_FRAME_MIN {
            assert!(decode_diagnostic_frame(&vec![0u8; len]).is_err());
        }
        for len in 0..HEURISTIC_FRAME_MIN {
            assert!(decode_heuristic_frame(&vec![0u8; len]).is_err());
        }
        for len in 0..MONITOR_FRAME_MIN {
            assert!(decode_metrics_packet_be(&vec![0u8; len]).is_err());
        }
    }

    #[test]
    fn test_rep_frame_official_round_trip() {
        let frame = encode_rep_frame_official(42, 40, 512.5, 13.25, 12, 15, 8, 10);
        assert_eq!(frame.len(), REP_FRAME_OFFICIAL_MIN);

        let rep = decode_rep_frame(&frame, false).unwrap();
        assert_eq!(rep.top_counter, 42);
        assert_eq!(rep.complete_counter, 40);
        assert!((rep.range_top - 512.5).abs() < f32::EPSILON);
        assert!((rep.range_bottom - 13.25).abs() < f32::EPSILON);
        assert_eq!(rep.reps_rom_count, 12);
        assert_eq!(rep.reps_set_count, 8);
        assert!(!rep.is_legacy_format);
    }

    #[test]
    fn test_rep_frame_official_with_opcode_prefix() {
        let mut frame = vec![OPCODE_REP_EVENT];
        frame.extend(encode_rep_frame_official(7, 6, 100.0, 2.0, 3, 5, 3, 5));

        let rep = decode_rep_frame(&frame, true).unwrap();
        assert_eq!(rep.top_counter, 7);
        assert_eq!(rep.complete_counter, 6);
        assert!(!rep.is_legacy_format);
    }

    #[test]
    fn test_rep_frame_legacy() {
        // topCounter at 0, completeCounter at 4
        let frame = [0x05, 0x00, 0xFF, 0xFF, 0x03, 0x00];
        let rep = decode_rep_frame(&frame, false).unwrap();

        assert_eq!(rep.top_counter, 5);
        assert_eq!(rep.complete_counter, 3);
        assert_eq!(rep.reps_rom_count, 0);
        assert_eq!(rep.reps_set_count, 0);
        assert!(rep.is_legacy_format);
    }

    #[test]
    fn test_rep_frame_legacy_with_opcode_prefix() {
        let frame = [OPCODE_REP_EVENT, 0x05, 0x00, 0xFF, 0xFF, 0x03, 0x00];
        let rep = decode_rep_frame(&frame, true).unwrap();

        assert_eq!(rep.top_counter, 5);
        assert_eq!(rep.complete_counter, 3);
        assert!(rep.is_legacy_format);

        // 6 bytes plus prefix is not enough for the prefixed legacy layout
        assert!(decode_rep_frame(&frame[..6], true).is_err());
    }

    #[test]
    fn test_diagnostic_frame() {
        let mut frame = vec![0u8; 20];
        frame[4..6].copy_from_slice(&(-7i16).to_le_bytes());
        frame[10..12].copy_from_slice(&9i16.to_le_bytes());
        frame[12..20].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let report = decode_diagnostic_frame(&frame).unwrap();
        assert_eq!(report.fault_codes, [-7, 0, 0, 9]);
        assert_eq!(report.temperatures, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(report.active_fault(), Some((0, -7)));
    }

    #[test]
    fn test_heuristic_frame() {
        let mut frame = Vec::with_capacity(HEURISTIC_FRAME_MIN);
        for value in [10.0f32, 20.0, 300.0, 450.0, 80.0, 120.0] {
            frame.extend_from_slice(&value.to_le_bytes());
        }
        for value in [8.0f32, 18.0, 250.0, 400.0, 60.0, 95.0] {
            frame.extend_from_slice(&value.to_le_bytes());
        }

        let stats = decode_heuristic_frame(&frame).unwrap();
        assert!((stats.concentric.kg_avg - 10.0).abs() < f32::EPSILON);
        assert!((stats.concentric.watt_max - 120.0).abs() < f32::EPSILON);
        assert!((stats.eccentric.kg_max - 18.0).abs() < f32::EPSILON);
        assert!((stats.eccentric.vel_avg - 250.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_metrics_packet_be() {
        let mut frame = Vec::with_capacity(16);
        frame.extend_from_slice(&99u32.to_be_bytes());
        frame.extend_from_slice(&150i16.to_be_bytes()); // posA = 15.0 mm
        frame.extend_from_slice(&(32768u16 + 200).to_be_bytes()); // velA = +200
        frame.extend_from_slice(&(-40i16).to_be_bytes()); // posB = -4.0 mm
        frame.extend_from_slice(&(32768u16 - 50).to_be_bytes()); // velB = -50
        frame.extend_from_slice(&1500u16.to_be_bytes()); // loadA = 15.0 kg
        frame.extend_from_slice(&250u16.to_be_bytes()); // loadB = 2.5 kg

        let metric = decode_metrics_packet_be(&frame).unwrap();
        assert_eq!(metric.tick_counter, 99);
        assert!((metric.position_a - 15.0).abs() < f32::EPSILON);
        assert!((metric.velocity_a - 200.0).abs() < f32::EPSILON);
        assert!((metric.position_b + 4.0).abs() < f32::EPSILON);
        assert!((metric.velocity_b + 50.0).abs() < f32::EPSILON);
        assert!((metric.load_a - 15.0).abs() < f32::EPSILON);
        assert!((metric.load_b - 2.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_command_frames() {
        assert_eq!(command_noop(), vec![0x00, 0x00, 0x00, 0x00]);
        assert_eq!(command_start_workout(), vec![OPCODE_START_WORKOUT]);
        assert_eq!(command_stop_workout(), vec![OPCODE_STOP_WORKOUT]);
        assert_eq!(encode_command(0x7F, &[1, 2, 3]), vec![0x7F, 1, 2, 3]);
    }
}
