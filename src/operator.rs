/// Line-oriented operator console.
///
/// Each line is one command, e.g. `rotate 2`, `actuate -3.5`, `heat current on`.
/// The console only enqueues, cancels and reads; motion is always left to the
/// control loop.

use std::io::{BufRead, Write};
use std::str::FromStr;

use anyhow::{anyhow, Result};

use crate::command::{
    ActuatorTravel, CommandSpecifics, Submitter, Switch, SyringeNumber, SyringeTarget,
};
use crate::gpio::PinName;
use crate::service::ServiceHandle;
use crate::state::StateSnapshot;
use crate::util::{friendly_timestamp, stringify_mm};

pub const HELP: &str = "\
Commands:
  rotate <1-4>                    enqueue a rotation to a syringe
  actuate <mm>|home|flange        enqueue an actuator move
  heat <1-4|current> <on|off>     enqueue a heating pad toggle
  uv <1-4|current> <on|off>       enqueue a UV light toggle
  cancel                          remove the last queued command
  start | stop                    enable or disable processing
  home                            home the actuator
  crank <mm>                      jog the actuator
  plunger <1-4>                   record the plunger position of a syringe
  syringe <1-4>                   set the syringe under the actuator
  calibrate <open|close>          hold processing while calibrating
  pin <name> <number> <in|out>    map a logical pin
  clear-history                   forget finished commands
  scale <factor>                  set the UI scale
  status | queue | history | alerts
  help | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Enqueue(CommandSpecifics),
    Cancel,
    SetProcessing(bool),
    Home,
    Crank(f64),
    Plunger(SyringeNumber),
    Syringe(SyringeNumber),
    Calibrate(bool),
    Pin {
        name: PinName,
        number: u8,
        direction: String,
    },
    ClearHistory,
    Scale(f64),
    Status,
    Queue,
    History,
    Alerts,
    Help,
    Quit,
}

fn arg<'a>(words: &[&'a str], index: usize, usage: &str) -> Result<&'a str> {
    words
        .get(index)
        .copied()
        .ok_or_else(|| anyhow!("usage: {}", usage))
}

fn number<T: FromStr>(text: &str, usage: &str) -> Result<T> {
    text.parse()
        .map_err(|_| anyhow!("'{}' is not a number (usage: {})", text, usage))
}

fn finite(text: &str, usage: &str) -> Result<f64> {
    let value: f64 = number(text, usage)?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(anyhow!("'{}' is not a finite number (usage: {})", text, usage))
    }
}

fn syringe(text: &str, usage: &str) -> Result<SyringeNumber> {
    Ok(SyringeNumber::new(number(text, usage)?)?)
}

fn target(text: &str, usage: &str) -> Result<SyringeTarget> {
    if text.eq_ignore_ascii_case("current") {
        Ok(SyringeTarget::CurrentOne)
    } else {
        Ok(SyringeTarget::Syringe(syringe(text, usage)?))
    }
}

fn switch(text: &str, usage: &str) -> Result<Switch> {
    match text.to_ascii_lowercase().as_str() {
        "on" => Ok(Switch::On),
        "off" => Ok(Switch::Off),
        _ => Err(anyhow!("usage: {}", usage)),
    }
}

/// Parse one console line. Blank lines give None.
pub fn parse_command(line: &str) -> Result<Option<OperatorCommand>> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some(verb) = words.first() else {
        return Ok(None);
    };
    let command = match verb.to_ascii_lowercase().as_str() {
        "rotate" => {
            let usage = "rotate <1-4>";
            OperatorCommand::Enqueue(CommandSpecifics::Rotate {
                target_syringe: syringe(arg(&words, 1, usage)?, usage)?,
            })
        }
        "actuate" => {
            let usage = "actuate <mm>|home|flange";
            let travel = match arg(&words, 1, usage)? {
                "home" => ActuatorTravel::GoHome,
                "flange" => ActuatorTravel::PlungerFlange,
                mm => ActuatorTravel::Millimeters(finite(mm, usage)?),
            };
            OperatorCommand::Enqueue(CommandSpecifics::Actuate {
                relative_mm_required: travel,
                scale: 1.0,
            })
        }
        "heat" => {
            let usage = "heat <1-4|current> <on|off>";
            OperatorCommand::Enqueue(CommandSpecifics::TurnHeatingPad {
                target: target(arg(&words, 1, usage)?, usage)?,
                on_or_off: switch(arg(&words, 2, usage)?, usage)?,
            })
        }
        "uv" => {
            let usage = "uv <1-4|current> <on|off>";
            OperatorCommand::Enqueue(CommandSpecifics::TurnUvLight {
                target: target(arg(&words, 1, usage)?, usage)?,
                on_or_off: switch(arg(&words, 2, usage)?, usage)?,
            })
        }
        "cancel" => OperatorCommand::Cancel,
        "start" => OperatorCommand::SetProcessing(true),
        "stop" => OperatorCommand::SetProcessing(false),
        "home" => OperatorCommand::Home,
        "crank" => {
            let usage = "crank <mm>";
            OperatorCommand::Crank(finite(arg(&words, 1, usage)?, usage)?)
        }
        "plunger" => {
            let usage = "plunger <1-4>";
            OperatorCommand::Plunger(syringe(arg(&words, 1, usage)?, usage)?)
        }
        "syringe" => {
            let usage = "syringe <1-4>";
            OperatorCommand::Syringe(syringe(arg(&words, 1, usage)?, usage)?)
        }
        "calibrate" => {
            let usage = "calibrate <open|close>";
            match arg(&words, 1, usage)? {
                "open" => OperatorCommand::Calibrate(true),
                "close" => OperatorCommand::Calibrate(false),
                _ => return Err(anyhow!("usage: {}", usage)),
            }
        }
        "pin" => {
            let usage = "pin <name> <number> <in|out>";
            OperatorCommand::Pin {
                name: arg(&words, 1, usage)?.parse()?,
                number: number(arg(&words, 2, usage)?, usage)?,
                direction: arg(&words, 3, usage)?.to_string(),
            }
        }
        "clear-history" => OperatorCommand::ClearHistory,
        "scale" => {
            let usage = "scale <factor>";
            OperatorCommand::Scale(finite(arg(&words, 1, usage)?, usage)?)
        }
        "status" => OperatorCommand::Status,
        "queue" => OperatorCommand::Queue,
        "history" => OperatorCommand::History,
        "alerts" => OperatorCommand::Alerts,
        "help" | "?" => OperatorCommand::Help,
        "quit" | "exit" => OperatorCommand::Quit,
        other => return Err(anyhow!("Unknown command '{}', try 'help'", other)),
    };
    Ok(Some(command))
}

pub fn format_status(snapshot: &StateSnapshot) -> String {
    let calibration = &snapshot.state.calibration;
    let position = calibration
        .actuator_position_mm
        .map(|mm| format!("{} mm", stringify_mm(mm)))
        .unwrap_or_else(|| "unknown".to_string());
    let current = calibration
        .current_syringe
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let plungers: Vec<String> = SyringeNumber::ALL
        .iter()
        .map(|s| match calibration.plunger_positions_mm.get(s) {
            Some(mm) => format!("{}: {}", s, stringify_mm(*mm)),
            None => format!("{}: ?", s),
        })
        .collect();
    let mut lines = vec![
        format!(
            "Processing: {}{}",
            if snapshot.processing_enabled { "running" } else { "stopped" },
            if snapshot.modal_open { " (calibration window open)" } else { "" }
        ),
        format!(
            "Calibration: {}{}",
            if snapshot.calibration_complete { "complete" } else { "incomplete" },
            match &snapshot.calibration_job {
                Some(job) => format!(", busy: {:?}", job),
                None => String::new(),
            }
        ),
        format!("Current syringe: {}, actuator: {}", current, position),
        format!("Plungers: {}", plungers.join(", ")),
        format!(
            "Queue: {} pending, {} in history",
            snapshot.state.commands.queue.len(),
            snapshot.state.commands.history.len()
        ),
    ];
    if let Some(pending) = snapshot.state.request_handling.pending {
        lines.push(format!(
            "Bridge: waiting on request {} (caboose #{})",
            pending.timestamp, pending.caboose_ordinal
        ));
    }
    if let Some(alert) = snapshot.alerts.last() {
        lines.push(format!("Last alert: {}", alert.friendly()));
    }
    lines.push(format!("As of {}", friendly_timestamp(snapshot.taken_at, true)));
    lines.join("\n")
}

fn format_queue(snapshot: &StateSnapshot) -> String {
    if snapshot.state.commands.queue.is_empty() {
        return "Queue is empty".to_string();
    }
    snapshot
        .state
        .commands
        .queue
        .iter()
        .map(|command| {
            let progress = match &command.phase {
                crate::command::CommandPhase::Enqueued => "waiting".to_string(),
                crate::command::CommandPhase::Started { progress, .. } => progress.to_string(),
            };
            format!(
                "#{} {} ({:?}, {})",
                command.ordinal, command.specifics, command.enqueued_by, progress
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_history(snapshot: &StateSnapshot) -> String {
    if snapshot.state.commands.history.is_empty() {
        return "History is empty".to_string();
    }
    snapshot
        .state
        .commands
        .history
        .iter()
        .rev()
        .map(|finished| finished.friendly())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run one command against the service and describe the result.
pub fn execute(command: OperatorCommand, handle: &ServiceHandle) -> Result<String> {
    let snapshot = || {
        handle
            .snapshot()
            .ok_or_else(|| anyhow!("No state published yet"))
    };
    let text = match command {
        OperatorCommand::Enqueue(specifics) => {
            let description = specifics.to_string();
            let ordinal = handle.enqueue(Submitter::Operator, specifics)?;
            format!("Enqueued #{}: {}", ordinal, description)
        }
        OperatorCommand::Cancel => {
            let cancelled = handle.cancel_last()?;
            format!("Cancelled #{}: {}", cancelled.ordinal, cancelled.specifics)
        }
        OperatorCommand::SetProcessing(enabled) => {
            let running = handle.set_processing(enabled)?;
            match (enabled, running) {
                (true, false) => "Processing could not start, see 'alerts'".to_string(),
                (_, true) => "Processing running".to_string(),
                (_, false) => "Processing stopped".to_string(),
            }
        }
        OperatorCommand::Home => {
            if handle.home_actuator()? {
                "Homing actuator".to_string()
            } else {
                "A calibration operation is already running".to_string()
            }
        }
        OperatorCommand::Crank(mm) => {
            if handle.handcrank(mm)? {
                format!("Cranking {} mm", stringify_mm(mm))
            } else {
                "A calibration operation is already running".to_string()
            }
        }
        OperatorCommand::Plunger(syringe) => {
            let mm = handle.record_plunger_position(syringe)?;
            format!("Plunger {} recorded at {} mm", syringe, stringify_mm(mm))
        }
        OperatorCommand::Syringe(syringe) => {
            handle.set_current_syringe(syringe)?;
            format!("Syringe {} is under the actuator", syringe)
        }
        OperatorCommand::Calibrate(open) => {
            handle.set_calibration_modal(open)?;
            if open {
                "Calibration window open".to_string()
            } else {
                "Calibration window closed".to_string()
            }
        }
        OperatorCommand::Pin {
            name,
            number,
            direction,
        } => {
            handle.configure_pin(name, number, &direction)?;
            format!("{} mapped to pin {} ({})", name, number, direction)
        }
        OperatorCommand::ClearHistory => {
            handle.clear_history()?;
            "History cleared".to_string()
        }
        OperatorCommand::Scale(scale) => {
            handle.set_ui_scale(scale)?;
            format!("UI scale set to {}", scale)
        }
        OperatorCommand::Status => format_status(&snapshot()?),
        OperatorCommand::Queue => format_queue(&snapshot()?),
        OperatorCommand::History => format_history(&snapshot()?),
        OperatorCommand::Alerts => {
            let snapshot = snapshot()?;
            if snapshot.alerts.is_empty() {
                "No alerts".to_string()
            } else {
                snapshot
                    .alerts
                    .iter()
                    .map(|alert| alert.friendly())
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        OperatorCommand::Help => HELP.to_string(),
        OperatorCommand::Quit => {
            handle.shutdown();
            "Shutting down".to_string()
        }
    };
    Ok(text)
}

/// Read commands until quit, end of input, or service shutdown. End of
/// input shuts the service down.
pub fn run_console(handle: &ServiceHandle, input: impl BufRead, mut output: impl Write) -> Result<()> {
    writeln!(output, "Type 'help' for commands")?;
    for line in input.lines() {
        if handle.is_shutdown() {
            return Ok(());
        }
        let line = line?;
        let reply = match parse_command(&line) {
            Ok(None) => continue,
            Ok(Some(command)) => match execute(command, handle) {
                Ok(text) => text,
                Err(e) => format!("Error: {}", e),
            },
            Err(e) => format!("Error: {}", e),
        };
        writeln!(output, "{}", reply)?;
        output.flush()?;
        if handle.is_shutdown() {
            return Ok(());
        }
    }
    handle.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enqueue_commands() {
        assert_eq!(
            parse_command("rotate 3").unwrap(),
            Some(OperatorCommand::Enqueue(CommandSpecifics::Rotate {
                target_syringe: SyringeNumber::ALL[2]
            }))
        );
        assert_eq!(
            parse_command("  actuate -2.5 ").unwrap(),
            Some(OperatorCommand::Enqueue(CommandSpecifics::Actuate {
                relative_mm_required: ActuatorTravel::Millimeters(-2.5),
                scale: 1.0
            }))
        );
        assert_eq!(
            parse_command("heat current ON").unwrap(),
            Some(OperatorCommand::Enqueue(CommandSpecifics::TurnHeatingPad {
                target: SyringeTarget::CurrentOne,
                on_or_off: Switch::On
            }))
        );
        assert_eq!(parse_command("").unwrap(), None);
    }

    #[test]
    fn test_parse_calibration_and_pins() {
        assert_eq!(parse_command("crank 1.5").unwrap(), Some(OperatorCommand::Crank(1.5)));
        assert_eq!(
            parse_command("pin uv_light_2 12 out").unwrap(),
            Some(OperatorCommand::Pin {
                name: PinName::UvLight2,
                number: 12,
                direction: "out".to_string()
            })
        );
        assert_eq!(parse_command("calibrate open").unwrap(), Some(OperatorCommand::Calibrate(true)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command("rotate").is_err());
        assert!(parse_command("rotate 7").is_err());
        assert!(parse_command("uv 1 dim").is_err());
        assert!(parse_command("pin laser 12 out").is_err());
        assert!(parse_command("dance").is_err());
        for line in ["actuate nan", "actuate inf", "actuate -infinity", "crank NaN", "scale inf"] {
            assert!(parse_command(line).is_err(), "accepted '{}'", line);
        }
    }
}
