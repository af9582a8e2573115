/// Calibration state and the operator calibration operations.
///
/// Homing and handcranking are multi-tick jobs: the operation itself only
/// takes the lock and drives the first pin level, after which the control
/// loop advances the job with the measured tick delta. The lock keeps at
/// most one of them touching the actuator at a time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::SyringeNumber;
use crate::gpio::{Bit, GpioBoard, PinError, PinMappings, PinName};
use crate::processing::plan_actuator_move;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Actuator position is unknown, home the actuator first")]
    PositionUnknown,

    #[error("Another calibration operation is in progress")]
    LockHeld,

    #[error("Jog distance must be a finite number of mm, got {0}")]
    BadDistance(f64),

    #[error(transparent)]
    Pin(#[from] PinError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationState {
    pub current_syringe: Option<SyringeNumber>,
    pub actuator_position_mm: Option<f64>,
    pub plunger_positions_mm: BTreeMap<SyringeNumber, f64>,
}

impl CalibrationState {
    /// Names of the values still missing, for operator messages.
    pub fn missing(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.current_syringe.is_none() {
            missing.push("current syringe".to_string());
        }
        if self.actuator_position_mm.is_none() {
            missing.push("actuator position".to_string());
        }
        for syringe in SyringeNumber::ALL {
            if !self.plunger_positions_mm.contains_key(&syringe) {
                missing.push(format!("plunger position {}", syringe));
            }
        }
        missing
    }
}

/// Physical limits of the linear actuator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorLimits {
    pub max_extension_mm: f64,
    pub travel_mm_per_ms: f64,
    pub safety_margin: f64,
}

impl ActuatorLimits {
    /// Furthest the actuator may ever extend.
    pub fn envelope_mm(&self) -> f64 {
        self.max_extension_mm * (1.0 - self.safety_margin)
    }

    /// Open-loop retract time guaranteed to reach the hard stop from
    /// anywhere.
    pub fn homing_duration_ms(&self) -> f64 {
        self.max_extension_mm / self.travel_mm_per_ms * (1.0 + self.safety_margin)
    }

    /// Relative travel that retracts past the hard stop from `position_mm`.
    pub fn go_home_mm(&self, position_mm: f64) -> f64 {
        -(position_mm + self.max_extension_mm * self.safety_margin)
    }
}

/// Held/free flag. Acquiring never blocks.
#[derive(Debug, Default, Clone)]
pub struct CalibrationLock {
    held: bool,
}

impl CalibrationLock {
    pub fn try_acquire(&mut self) -> bool {
        if self.held {
            false
        } else {
            self.held = true;
            true
        }
    }

    pub fn release(&mut self) {
        self.held = false;
    }

    pub fn is_held(&self) -> bool {
        self.held
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationJob {
    Homing { elapsed_ms: f64, duration_ms: f64 },
    Handcrank { required_mm: f64, traveled_mm: f64 },
}

#[derive(Debug)]
pub struct Calibrator {
    pub lock: CalibrationLock,
    pub job: Option<CalibrationJob>,
    limits: ActuatorLimits,
}

impl Calibrator {
    pub fn new(limits: ActuatorLimits) -> Self {
        Self {
            lock: CalibrationLock::default(),
            job: None,
            limits,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.job.is_some()
    }

    /// Start a full timed retraction. Returns false without doing anything
    /// if another calibration operation holds the lock.
    pub fn home_actuator(
        &mut self,
        calibration: &mut CalibrationState,
        board: &mut GpioBoard,
        pins: &mut PinMappings,
    ) -> Result<bool, PinError> {
        if !self.lock.try_acquire() {
            log::info!(target: "calibration", "Homing ignored, calibration lock is held");
            return Ok(false);
        }
        calibration.actuator_position_mm = None;
        if let Err(e) = drive_actuator(board, pins, -1.0) {
            self.lock.release();
            return Err(e);
        }
        let duration_ms = self.limits.homing_duration_ms();
        log::info!(target: "calibration", "Homing actuator for {:.0} ms", duration_ms);
        self.job = Some(CalibrationJob::Homing {
            elapsed_ms: 0.0,
            duration_ms,
        });
        Ok(true)
    }

    /// Start a relative jog. Returns false if the lock is held.
    pub fn handcrank(
        &mut self,
        relative_mm: f64,
        calibration: &CalibrationState,
        board: &mut GpioBoard,
        pins: &mut PinMappings,
    ) -> Result<bool, CalibrationError> {
        if !relative_mm.is_finite() {
            return Err(CalibrationError::BadDistance(relative_mm));
        }
        if self.lock.is_held() {
            log::info!(target: "calibration", "Handcrank ignored, calibration lock is held");
            return Ok(false);
        }
        if calibration.actuator_position_mm.is_none() {
            return Err(CalibrationError::PositionUnknown);
        }
        self.lock.try_acquire();
        if let Err(e) = drive_actuator(board, pins, relative_mm) {
            self.lock.release();
            return Err(e.into());
        }
        self.job = Some(CalibrationJob::Handcrank {
            required_mm: relative_mm,
            traveled_mm: 0.0,
        });
        Ok(true)
    }

    /// Advance the active job by one tick. Returns true when a job finished
    /// on this tick.
    pub fn advance(
        &mut self,
        delta_ms: f64,
        calibration: &mut CalibrationState,
        board: &mut GpioBoard,
        pins: &mut PinMappings,
    ) -> Result<bool, PinError> {
        let finished = match self.job.as_mut() {
            None => return Ok(false),
            Some(CalibrationJob::Homing {
                elapsed_ms,
                duration_ms,
            }) => {
                *elapsed_ms += delta_ms;
                if *elapsed_ms >= *duration_ms {
                    drive_actuator(board, pins, 0.0)?;
                    calibration.actuator_position_mm = Some(0.0);
                    log::info!(target: "calibration", "Actuator homed");
                    true
                } else {
                    drive_actuator(board, pins, -1.0)?;
                    false
                }
            }
            Some(CalibrationJob::Handcrank {
                required_mm,
                traveled_mm,
            }) => {
                // Position cannot be lost while we hold the lock
                let position = calibration.actuator_position_mm.unwrap_or(0.0);
                let planned = plan_actuator_move(
                    position,
                    *traveled_mm,
                    *required_mm,
                    delta_ms,
                    &self.limits,
                );
                let (step, finished) = match planned {
                    Ok(planned) => (planned.step_mm, planned.finished),
                    // Jogging stops short of the envelope instead of faulting
                    Err(_) => (0.0, true),
                };
                *traveled_mm += step;
                calibration.actuator_position_mm = Some((position + step).max(0.0));
                if finished {
                    drive_actuator(board, pins, 0.0)?;
                    log::info!(
                        target: "calibration",
                        "Handcrank done at {:.3} mm",
                        (position + step).max(0.0)
                    );
                } else {
                    drive_actuator(board, pins, step)?;
                }
                finished
            }
        };
        if finished {
            self.job = None;
            self.lock.release();
        }
        Ok(finished)
    }
}

/// Set the extend/retract pair for motion in the direction of `sign`.
/// Zero releases both.
pub fn drive_actuator(board: &mut GpioBoard, pins: &mut PinMappings, sign: f64) -> Result<(), PinError> {
    let (extend, retract) = if sign > 0.0 {
        (Bit::High, Bit::Low)
    } else if sign < 0.0 {
        (Bit::Low, Bit::High)
    } else {
        (Bit::Low, Bit::Low)
    };
    // Release first so the two are never on together
    if extend == Bit::Low {
        board.write_pin(pins, PinName::ActuatorExtend, extend)?;
        board.write_pin(pins, PinName::ActuatorRetract, retract)?;
    } else {
        board.write_pin(pins, PinName::ActuatorRetract, retract)?;
        board.write_pin(pins, PinName::ActuatorExtend, extend)?;
    }
    Ok(())
}

/// Store the current actuator position as `syringe`'s plunger offset. That
/// syringe is the one under the actuator, so it also becomes current.
pub fn record_plunger_position(
    calibration: &mut CalibrationState,
    lock: &CalibrationLock,
    syringe: SyringeNumber,
) -> Result<f64, CalibrationError> {
    if lock.is_held() {
        return Err(CalibrationError::LockHeld);
    }
    let position = calibration
        .actuator_position_mm
        .ok_or(CalibrationError::PositionUnknown)?;
    calibration.plunger_positions_mm.insert(syringe, position);
    calibration.current_syringe = Some(syringe);
    Ok(position)
}

pub fn set_current_syringe(calibration: &mut CalibrationState, syringe: SyringeNumber) {
    calibration.current_syringe = Some(syringe);
}

pub fn calibration_is_complete(calibration: &CalibrationState, lock: &CalibrationLock) -> bool {
    calibration.current_syringe.is_some()
        && calibration.actuator_position_mm.is_some()
        && SyringeNumber::ALL
            .iter()
            .all(|syringe| calibration.plunger_positions_mm.contains_key(syringe))
        && !lock.is_held()
}

pub fn processing_is_allowed_to_start(
    calibration: &CalibrationState,
    lock: &CalibrationLock,
    modal_open: bool,
) -> bool {
    calibration_is_complete(calibration, lock) && !modal_open && !lock.is_held()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ActuatorLimits {
        ActuatorLimits {
            max_extension_mm: 100.0,
            travel_mm_per_ms: 0.01,
            safety_margin: 0.1,
        }
    }

    fn board_and_pins() -> (GpioBoard, PinMappings) {
        let mut board = GpioBoard::disabled();
        let mut pins = PinMappings::all_outputs();
        board.setup_pins(&mut pins).unwrap();
        (board, pins)
    }

    fn complete_calibration() -> CalibrationState {
        let mut calibration = CalibrationState {
            current_syringe: Some(SyringeNumber::ALL[0]),
            actuator_position_mm: Some(0.0),
            ..Default::default()
        };
        for syringe in SyringeNumber::ALL {
            calibration.plunger_positions_mm.insert(syringe, 40.0);
        }
        calibration
    }

    #[test]
    fn test_completeness_requires_every_value() {
        let lock = CalibrationLock::default();
        let mut calibration = complete_calibration();
        assert!(calibration_is_complete(&calibration, &lock));

        calibration.actuator_position_mm = None;
        assert!(!calibration_is_complete(&calibration, &lock));

        let mut calibration = complete_calibration();
        calibration.current_syringe = None;
        assert!(!calibration_is_complete(&calibration, &lock));

        let mut calibration = complete_calibration();
        calibration.plunger_positions_mm.remove(&SyringeNumber::ALL[3]);
        assert!(!calibration_is_complete(&calibration, &lock));
        assert_eq!(calibration.missing(), vec!["plunger position 4".to_string()]);

        let calibration = complete_calibration();
        let mut lock = CalibrationLock::default();
        lock.try_acquire();
        assert!(!calibration_is_complete(&calibration, &lock));
    }

    #[test]
    fn test_processing_gate_respects_modal() {
        let lock = CalibrationLock::default();
        let calibration = complete_calibration();
        assert!(processing_is_allowed_to_start(&calibration, &lock, false));
        assert!(!processing_is_allowed_to_start(&calibration, &lock, true));
    }

    #[test]
    fn test_homing_is_timed_and_exclusive() {
        let (mut board, mut pins) = board_and_pins();
        let mut calibration = complete_calibration();
        calibration.actuator_position_mm = Some(30.0);
        let mut calibrator = Calibrator::new(limits());

        assert!(calibrator.home_actuator(&mut calibration, &mut board, &mut pins).unwrap());
        assert_eq!(calibration.actuator_position_mm, None);
        assert_eq!(pins.get(PinName::ActuatorRetract).value, Some(Bit::High));
        // Second request while homing is a silent no-op
        assert!(!calibrator.home_actuator(&mut calibration, &mut board, &mut pins).unwrap());

        // 100 / 0.01 * 1.1 = 11000 ms
        let mut ticks = 0;
        while !calibrator.advance(100.0, &mut calibration, &mut board, &mut pins).unwrap() {
            ticks += 1;
            assert!(calibrator.lock.is_held());
        }
        assert!((109..=110).contains(&ticks), "homed after {} ticks", ticks);
        assert_eq!(calibration.actuator_position_mm, Some(0.0));
        assert_eq!(pins.get(PinName::ActuatorRetract).value, Some(Bit::Low));
        assert!(!calibrator.lock.is_held());
    }

    #[test]
    fn test_handcrank_requires_known_position() {
        let (mut board, mut pins) = board_and_pins();
        let mut calibration = complete_calibration();
        calibration.actuator_position_mm = None;
        let mut calibrator = Calibrator::new(limits());
        assert_eq!(
            calibrator.handcrank(5.0, &calibration, &mut board, &mut pins),
            Err(CalibrationError::PositionUnknown)
        );
        assert!(!calibrator.lock.is_held());
    }

    #[test]
    fn test_handcrank_stops_at_envelope() {
        let (mut board, mut pins) = board_and_pins();
        let mut calibration = complete_calibration();
        calibration.actuator_position_mm = Some(85.0);
        let mut calibrator = Calibrator::new(limits());
        assert!(calibrator.handcrank(20.0, &calibration, &mut board, &mut pins).unwrap());
        for _ in 0..1000 {
            if calibrator.advance(50.0, &mut calibration, &mut board, &mut pins).unwrap() {
                break;
            }
        }
        let position = calibration.actuator_position_mm.unwrap();
        assert!(position <= limits().envelope_mm() + 1e-9);
        assert!((position - 90.0).abs() < 1e-9);
        assert!(!calibrator.is_busy());
        assert_eq!(pins.get(PinName::ActuatorExtend).value, Some(Bit::Low));
    }

    #[test]
    fn test_handcrank_does_not_count_undriven_remainder() {
        let (mut board, mut pins) = board_and_pins();
        let mut calibration = complete_calibration();
        calibration.actuator_position_mm = Some(85.2);
        let mut calibrator = Calibrator::new(limits());
        assert!(calibrator.handcrank(20.0, &calibration, &mut board, &mut pins).unwrap());
        while !calibrator.advance(50.0, &mut calibration, &mut board, &mut pins).unwrap() {}
        // 0.5 mm quanta: 89.7 is the last position actually driven to
        let position = calibration.actuator_position_mm.unwrap();
        assert!((position - 89.7).abs() < 1e-9, "stopped at {}", position);
        assert!(!calibrator.lock.is_held());
    }

    #[test]
    fn test_handcrank_refuses_non_finite_distance() {
        let (mut board, mut pins) = board_and_pins();
        let calibration = complete_calibration();
        let mut calibrator = Calibrator::new(limits());
        for mm in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                calibrator.handcrank(mm, &calibration, &mut board, &mut pins),
                Err(CalibrationError::BadDistance(_))
            ));
        }
        assert!(!calibrator.lock.is_held());
        assert!(!calibrator.is_busy());
        // Homing is still available afterwards
        let mut calibration = calibration;
        assert!(calibrator.home_actuator(&mut calibration, &mut board, &mut pins).unwrap());
    }

    #[test]
    fn test_handcrank_clamps_at_zero() {
        let (mut board, mut pins) = board_and_pins();
        let mut calibration = complete_calibration();
        calibration.actuator_position_mm = Some(2.0);
        let mut calibrator = Calibrator::new(limits());
        calibrator.handcrank(-10.0, &calibration, &mut board, &mut pins).unwrap();
        while !calibrator.advance(40.0, &mut calibration, &mut board, &mut pins).unwrap() {}
        assert_eq!(calibration.actuator_position_mm, Some(0.0));
    }

    #[test]
    fn test_record_plunger_position() {
        let mut calibration = CalibrationState::default();
        let mut lock = CalibrationLock::default();
        let syringe = SyringeNumber::new(3).unwrap();
        assert_eq!(
            record_plunger_position(&mut calibration, &lock, syringe),
            Err(CalibrationError::PositionUnknown)
        );

        calibration.actuator_position_mm = Some(42.5);
        lock.try_acquire();
        assert_eq!(
            record_plunger_position(&mut calibration, &lock, syringe),
            Err(CalibrationError::LockHeld)
        );
        lock.release();

        assert_eq!(record_plunger_position(&mut calibration, &lock, syringe), Ok(42.5));
        assert_eq!(calibration.plunger_positions_mm.get(&syringe), Some(&42.5));
        assert_eq!(calibration.current_syringe, Some(syringe));
    }
}
