/// Per-tick command state machine.
///
/// Each call advances the queue head by one quantum of motion, sized by the
/// measured tick delta so real-world speed stays constant under scheduling
/// jitter. A command finishes when it has reached its target or when the
/// next quantum would leave it farther from the target than it is now.

use thiserror::Error;

use crate::calibration::{drive_actuator, ActuatorLimits, CalibrationState};
use crate::command::{
    ActuatorTravel, CommandPhase, CommandSpecifics, EnqueuedCommand, Progress, Switch,
    SyringeTarget,
};
use crate::config_loader::RotatorSettings;
use crate::gpio::{Bit, GpioBoard, PinError, PinMappings, PinName};
use crate::util::{signum, would_move_away_from_target, UnixMillis};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessingError {
    #[error(
        "Actuator would pass its safe limit: at {position_mm:.3} mm a step of {step_mm:.3} mm exceeds {envelope_mm:.3} mm"
    )]
    SafetyLimit {
        position_mm: f64,
        step_mm: f64,
        envelope_mm: f64,
    },

    #[error("Cannot run command, {0} is not calibrated")]
    NotCalibrated(&'static str),

    #[error("Actuator travel of {0} mm is not a finite distance")]
    NonFiniteTravel(f64),

    #[error(transparent)]
    Pin(#[from] PinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Idle,
    InProgress,
    Finished,
}

/// Everything a tick may touch besides the command itself.
pub struct MotionContext<'a> {
    pub board: &'a mut GpioBoard,
    pub pins: &'a mut PinMappings,
    pub calibration: &'a mut CalibrationState,
    pub rotator: &'a RotatorSettings,
    pub actuator: &'a ActuatorLimits,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorMove {
    pub step_mm: f64,
    pub finished: bool,
}

/// Size the next actuator quantum. A finished move has a zero step.
///
/// A step that would carry the actuator past the envelope is shortened to
/// the exact remainder when the target itself is inside the envelope, and
/// refused otherwise.
pub fn plan_actuator_move(
    position_mm: f64,
    traveled_mm: f64,
    required_mm: f64,
    delta_ms: f64,
    limits: &ActuatorLimits,
) -> Result<ActuatorMove, ProcessingError> {
    let done = ActuatorMove {
        step_mm: 0.0,
        finished: true,
    };
    if traveled_mm == required_mm {
        return Ok(done);
    }
    // A non-finite target or quantum would never converge
    if !required_mm.is_finite() || !traveled_mm.is_finite() {
        return Ok(done);
    }
    let step_mm = signum(required_mm) * limits.travel_mm_per_ms * delta_ms;
    if !step_mm.is_finite() || would_move_away_from_target(traveled_mm, step_mm, required_mm) {
        return Ok(done);
    }

    let envelope_mm = limits.envelope_mm();
    if step_mm > 0.0 && position_mm + step_mm > envelope_mm {
        let remainder_mm = required_mm - traveled_mm;
        if position_mm + remainder_mm <= envelope_mm {
            return Ok(ActuatorMove {
                step_mm: remainder_mm,
                finished: false,
            });
        }
        return Err(ProcessingError::SafetyLimit {
            position_mm,
            step_mm,
            envelope_mm,
        });
    }
    Ok(ActuatorMove {
        step_mm,
        finished: false,
    })
}

/// Number of half-step boundaries crossed moving from `traveled` by `step`.
pub fn half_steps_crossed(traveled_degrees: f64, step_degrees: f64, degrees_per_step: f64) -> u64 {
    let half = degrees_per_step / 2.0;
    let before = (traveled_degrees.abs() / half).floor();
    let after = ((traveled_degrees + step_degrees).abs() / half).floor();
    (after - before).abs() as u64
}

/// Half-steps still due when a rotation of `required` degrees stops at
/// `traveled`. Each boundary crossed so far has already been toggled.
pub fn half_steps_owed(traveled_degrees: f64, required_degrees: f64, degrees_per_step: f64) -> u64 {
    let half = degrees_per_step / 2.0;
    let total = (required_degrees.abs() / half).round() as u64;
    let emitted = (traveled_degrees.abs() / half).floor() as u64;
    total.saturating_sub(emitted)
}

fn pulse_rotator(ctx: &mut MotionContext<'_>, required: f64, toggles: u64) -> Result<(), PinError> {
    ctx.board.write_pin(
        ctx.pins,
        PinName::RotatorDirection,
        Bit::from_bool(required > 0.0),
    )?;
    for _ in 0..toggles {
        let level = ctx
            .pins
            .get(PinName::RotatorStep)
            .value
            .unwrap_or(Bit::Low)
            .flip();
        ctx.board.write_pin(ctx.pins, PinName::RotatorStep, level)?;
    }
    Ok(())
}

/// Compute the progress record for a command on its first tick.
pub fn start_progress(
    specifics: &CommandSpecifics,
    calibration: &CalibrationState,
    limits: &ActuatorLimits,
) -> Result<Progress, ProcessingError> {
    match specifics {
        CommandSpecifics::Rotate { target_syringe } => {
            let current = calibration
                .current_syringe
                .ok_or(ProcessingError::NotCalibrated("current syringe"))?;
            let relative = target_syringe.get() as f64 - current.get() as f64;
            Ok(Progress::Rotation {
                relative_degrees_required: relative * 90.0,
                relative_degrees_traveled: 0.0,
            })
        }
        CommandSpecifics::Actuate {
            relative_mm_required,
            scale,
        } => {
            let position = calibration
                .actuator_position_mm
                .ok_or(ProcessingError::NotCalibrated("actuator position"))?;
            let required = match relative_mm_required {
                ActuatorTravel::Millimeters(mm) => mm * scale,
                ActuatorTravel::GoHome => limits.go_home_mm(position),
                ActuatorTravel::PlungerFlange => {
                    let current = calibration
                        .current_syringe
                        .ok_or(ProcessingError::NotCalibrated("current syringe"))?;
                    let flange = calibration
                        .plunger_positions_mm
                        .get(&current)
                        .ok_or(ProcessingError::NotCalibrated("plunger position"))?;
                    flange - position
                }
            };
            if !required.is_finite() {
                return Err(ProcessingError::NonFiniteTravel(required));
            }
            Ok(Progress::Extension {
                scaled_mm_required: required,
                scaled_mm_traveled: 0.0,
            })
        }
        CommandSpecifics::TurnHeatingPad { .. } | CommandSpecifics::TurnUvLight { .. } => {
            Ok(Progress::Instant)
        }
    }
}

/// Advance `command` by one tick of `delta_ms`.
///
/// On `Finished` the caller moves the command to history. On error the
/// command has not traveled on this tick.
pub fn advance_command(
    command: &mut EnqueuedCommand,
    delta_ms: f64,
    now: UnixMillis,
    ctx: &mut MotionContext<'_>,
) -> Result<StepOutcome, ProcessingError> {
    if let CommandPhase::Enqueued = command.phase {
        let progress = start_progress(&command.specifics, ctx.calibration, ctx.actuator)?;
        log::info!(target: "processing", "Starting #{}: {}", command.ordinal, command.specifics);
        command.phase = CommandPhase::Started {
            started_at: now,
            progress,
        };
    }

    let progress = match &mut command.phase {
        CommandPhase::Started { progress, .. } => progress,
        CommandPhase::Enqueued => return Ok(StepOutcome::Idle),
    };

    match (&command.specifics, progress) {
        (
            CommandSpecifics::Rotate { target_syringe },
            Progress::Rotation {
                relative_degrees_required,
                relative_degrees_traveled,
            },
        ) => {
            let required = *relative_degrees_required;
            let traveled = *relative_degrees_traveled;
            let degrees_per_step = ctx.rotator.degrees_per_step();
            let step = signum(required) * ctx.rotator.degrees_per_ms * delta_ms;
            if traveled == required || would_move_away_from_target(traveled, step, required) {
                // The last partial quantum is never driven, so make up the
                // half-steps it would have covered
                let remaining = half_steps_owed(traveled, required, degrees_per_step);
                if remaining > 0 {
                    pulse_rotator(ctx, required, remaining)?;
                }
                ctx.calibration.current_syringe = Some(*target_syringe);
                return Ok(StepOutcome::Finished);
            }
            let toggles = half_steps_crossed(traveled, step, degrees_per_step);
            if toggles > 0 {
                pulse_rotator(ctx, required, toggles)?;
            } else {
                ctx.board.write_pin(
                    ctx.pins,
                    PinName::RotatorDirection,
                    Bit::from_bool(required > 0.0),
                )?;
            }
            *relative_degrees_traveled = traveled + step;
            Ok(StepOutcome::InProgress)
        }
        (
            CommandSpecifics::Actuate { .. },
            Progress::Extension {
                scaled_mm_required,
                scaled_mm_traveled,
            },
        ) => {
            let position = ctx
                .calibration
                .actuator_position_mm
                .ok_or(ProcessingError::NotCalibrated("actuator position"))?;
            let planned = plan_actuator_move(
                position,
                *scaled_mm_traveled,
                *scaled_mm_required,
                delta_ms,
                ctx.actuator,
            )?;
            if planned.finished {
                drive_actuator(ctx.board, ctx.pins, 0.0)?;
                return Ok(StepOutcome::Finished);
            }
            drive_actuator(ctx.board, ctx.pins, planned.step_mm)?;
            *scaled_mm_traveled += planned.step_mm;
            // Retraction stops at the hard stop
            ctx.calibration.actuator_position_mm = Some((position + planned.step_mm).max(0.0));
            Ok(StepOutcome::InProgress)
        }
        (CommandSpecifics::TurnHeatingPad { target, on_or_off }, _) => {
            let syringe = resolve_target(*target, ctx.calibration)?;
            let level = Bit::from_bool(*on_or_off == Switch::On);
            ctx.board.write_pin(ctx.pins, PinName::heating_pad(syringe), level)?;
            Ok(StepOutcome::Finished)
        }
        (CommandSpecifics::TurnUvLight { target, on_or_off }, _) => {
            let syringe = resolve_target(*target, ctx.calibration)?;
            let level = Bit::from_bool(*on_or_off == Switch::On);
            ctx.board.write_pin(ctx.pins, PinName::uv_light(syringe), level)?;
            Ok(StepOutcome::Finished)
        }
        (specifics, progress) => {
            // Only reachable from a hand-edited save file
            log::warn!(
                target: "processing",
                "Progress {:?} does not match {}, finishing as is",
                progress,
                specifics
            );
            Ok(StepOutcome::Finished)
        }
    }
}

fn resolve_target(
    target: SyringeTarget,
    calibration: &CalibrationState,
) -> Result<crate::command::SyringeNumber, ProcessingError> {
    match target {
        SyringeTarget::Syringe(syringe) => Ok(syringe),
        SyringeTarget::CurrentOne => calibration
            .current_syringe
            .ok_or(ProcessingError::NotCalibrated("current syringe")),
    }
}
