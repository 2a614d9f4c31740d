//! Handle activity (grab/release) state machine.
//!
//! Auto-start/stop detection watches processed monitor samples and decides
//! whether a user is holding the handles. The machine arms in
//! [`HandleActivityState::WaitingForRest`] and refuses to report a grab
//! until both cables have returned below the rest threshold once, so a
//! machine armed while cable tension is already present cannot false-start.
//! Single-handle exercises are supported: one channel being simultaneously
//! extended and moving is enough to reach `Grabbed`, and release from
//! `Grabbed` requires *both* channels at rest so a single-handle rep cannot
//! release mid-movement.

use tracing::debug;

use crate::types::{HandleActivityState, HandleConfig, WorkoutMetric};

/// 4-state grab/release detector with hysteresis
#[derive(Debug)]
pub struct HandleDetector {
    config: HandleConfig,
    state: HandleActivityState,
}

impl HandleDetector {
    /// Create a detector in the `WaitingForRest` state
    #[must_use]
    pub const fn new(config: HandleConfig) -> Self {
        Self {
            config,
            state: HandleActivityState::WaitingForRest,
        }
    }

    /// Current detector state
    #[must_use]
    pub const fn state(&self) -> HandleActivityState {
        self.state
    }

    /// Re-arm the detector for a new set
    pub fn reset(&mut self) {
        debug!("handle detector reset to WaitingForRest");
        self.state = HandleActivityState::WaitingForRest;
    }

    /// Skip grab detection for an already-running workout
    pub fn bypass(&mut self) {
        debug!("handle detector bypassed to Grabbed");
        self.state = HandleActivityState::Grabbed;
    }

    /// Feed one accepted sample through the transition table
    ///
    /// Returns the new state when a transition occurred, `None` otherwise.
    /// Transitions are a strict function of the current state and this
    /// sample; nothing else mutates the state.
    pub fn analyze(&mut self, sample: &WorkoutMetric) -> Option<HandleActivityState> {
        let rest = self.config.rest_threshold;
        let at_rest =
            sample.position_a < rest && sample.position_b < rest;

        let grabbed_a = sample.position_a > self.config.grab_threshold;
        let grabbed_b = sample.position_b > self.config.grab_threshold;
        let moving_a = sample.velocity_a.abs() > self.config.velocity_threshold;
        let moving_b = sample.velocity_b.abs() > self.config.velocity_threshold;

        let next = match self.state {
            HandleActivityState::WaitingForRest => {
                if at_rest {
                    HandleActivityState::Released
                } else {
                    HandleActivityState::WaitingForRest
                }
            }
            HandleActivityState::Released | HandleActivityState::Moving => {
                if (grabbed_a && moving_a) || (grabbed_b && moving_b) {
                    HandleActivityState::Grabbed
                } else if grabbed_a || grabbed_b {
                    HandleActivityState::Moving
                } else {
                    HandleActivityState::Released
                }
            }
            HandleActivityState::Grabbed => {
                if at_rest {
                    HandleActivityState::Released
                } else {
                    HandleActivityState::Grabbed
                }
            }
        };

        if next == self.state {
            return None;
        }

        debug!(from = %self.state, to = %next, "handle state transition");
        self.state = next;
        Some(next)
    }
}

impl Default for HandleDetector {
    fn default() -> Self {
        Self::new(HandleConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn sample(pos_a: f32, vel_a: f32, pos_b: f32, vel_b: f32) -> WorkoutMetric {
        WorkoutMetric {
            timestamp: SystemTime::now(),
            load_a: 0.0,
            load_b: 0.0,
            position_a: pos_a,
            position_b: pos_b,
            velocity_a: vel_a,
            velocity_b: vel_b,
            tick_counter: 0,
            status_flags: 0,
        }
    }

    #[test]
    fn test_full_grab_release_cycle() {
        let mut detector = HandleDetector::default();
        assert_eq!(detector.state(), HandleActivityState::WaitingForRest);

        // both channels at rest -> Released
        let next = detector.analyze(&sample(1.0, 0.0, 0.5, 0.0));
        assert_eq!(next, Some(HandleActivityState::Released));

        // one channel extended and moving -> Grabbed (single-handle exercise)
        let next = detector.analyze(&sample(50.0, 120.0, 0.5, 0.0));
        assert_eq!(next, Some(HandleActivityState::Grabbed));

        // both channels back at rest -> Released
        let next = detector.analyze(&sample(1.0, 0.0, 0.5, 0.0));
        assert_eq!(next, Some(HandleActivityState::Released));
    }

    #[test]
    fn test_extended_without_velocity_is_moving_not_grabbed() {
        let mut detector = HandleDetector::default();
        detector.analyze(&sample(0.0, 0.0, 0.0, 0.0));
        assert_eq!(detector.state(), HandleActivityState::Released);

        let next = detector.analyze(&sample(20.0, 10.0, 0.0, 0.0));
        assert_eq!(next, Some(HandleActivityState::Moving));

        // velocity confirmed -> Grabbed
        let next = detector.analyze(&sample(25.0, 80.0, 0.0, 0.0));
        assert_eq!(next, Some(HandleActivityState::Grabbed));
    }

    #[test]
    fn test_waiting_for_rest_gates_initial_tension() {
        let mut detector = HandleDetector::default();

        // cable already extended at arm time: stays waiting, never Grabbed
        assert_eq!(detector.analyze(&sample(100.0, 200.0, 0.0, 0.0)), None);
        assert_eq!(detector.state(), HandleActivityState::WaitingForRest);

        assert_eq!(
            detector.analyze(&sample(1.0, 0.0, 1.0, 0.0)),
            Some(HandleActivityState::Released)
        );
    }

    #[test]
    fn test_grabbed_does_not_release_on_one_channel() {
        let mut detector = HandleDetector::default();
        detector.analyze(&sample(0.0, 0.0, 0.0, 0.0));
        detector.analyze(&sample(50.0, 120.0, 0.0, 0.0));
        assert_eq!(detector.state(), HandleActivityState::Grabbed);

        // channel A back at rest but channel B still extended: stay Grabbed
        assert_eq!(detector.analyze(&sample(1.0, 0.0, 40.0, 0.0)), None);
        assert_eq!(detector.state(), HandleActivityState::Grabbed);
    }

    #[test]
    fn test_moving_falls_back_to_released() {
        let mut detector = HandleDetector::default();
        detector.analyze(&sample(0.0, 0.0, 0.0, 0.0));
        detector.analyze(&sample(20.0, 0.0, 0.0, 0.0));
        assert_eq!(detector.state(), HandleActivityState::Moving);

        let next = detector.analyze(&sample(2.0, 0.0, 0.0, 0.0));
        assert_eq!(next, Some(HandleActivityState::Released));
    }

    #[test]
    fn test_bypass_and_reset() {
        let mut detector = HandleDetector::default();
        detector.bypass();
        assert_eq!(detector.state(), HandleActivityState::Grabbed);

        detector.reset();
        assert_eq!(detector.state(), HandleActivityState::WaitingForRest);
    }
}
