/// Translation of firmware macro invocations into rig commands.
///
/// The firmware calls `bioprint_request` with the G-code name followed by
/// its parameters, e.g. `G1 E1.5` or `M140 S60`. Only the handful of codes
/// the rig understands are accepted.

use thiserror::Error;

use crate::command::{ActuatorTravel, CommandSpecifics, Switch, SyringeNumber, SyringeTarget};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GcodeError {
    #[error("No G-code given")]
    Empty,

    #[error("Unsupported G-code {0}")]
    Unsupported(String),

    #[error("{code} needs parameter {parameter}")]
    MissingParameter { code: String, parameter: char },

    #[error("Bad value for {parameter} in {code}: {value}")]
    BadValue {
        code: String,
        parameter: char,
        value: String,
    },
}

/// Find `letter` among `params` (e.g. "E1.5") and parse its value.
fn parameter(code: &str, params: &[String], letter: char) -> Result<Option<f64>, GcodeError> {
    for param in params {
        let mut chars = param.trim().chars();
        if chars.next().map(|c| c.to_ascii_uppercase()) != Some(letter) {
            continue;
        }
        let value = chars.as_str();
        return value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| GcodeError::BadValue {
                code: code.to_string(),
                parameter: letter,
                value: value.to_string(),
            });
    }
    Ok(None)
}

fn uv_light(on_or_off: Switch) -> CommandSpecifics {
    CommandSpecifics::TurnUvLight {
        target: SyringeTarget::CurrentOne,
        on_or_off,
    }
}

/// Translate one invocation. `args[0]` is the code, the rest its parameters.
pub fn translate(args: &[String], extrude_scale: f64) -> Result<Vec<CommandSpecifics>, GcodeError> {
    let (code, params) = args.split_first().ok_or(GcodeError::Empty)?;
    let code = code.trim().to_ascii_uppercase();

    match code.as_str() {
        "M140" => {
            let temperature = parameter(&code, params, 'S')?.ok_or(GcodeError::MissingParameter {
                code: code.clone(),
                parameter: 'S',
            })?;
            let on_or_off = Switch::from_bool(temperature > 0.0);
            let mut commands: Vec<_> = SyringeNumber::ALL
                .iter()
                .map(|syringe| CommandSpecifics::TurnHeatingPad {
                    target: SyringeTarget::Syringe(*syringe),
                    on_or_off,
                })
                .collect();
            commands.push(uv_light(on_or_off));
            Ok(commands)
        }
        "G1" => match parameter(&code, params, 'E')? {
            Some(mm) => Ok(vec![CommandSpecifics::Actuate {
                relative_mm_required: ActuatorTravel::Millimeters(mm),
                scale: extrude_scale,
            }]),
            None => Ok(Vec::new()),
        },
        tool if tool.starts_with('T') => {
            let index: u8 = tool[1..]
                .parse()
                .map_err(|_| GcodeError::Unsupported(code.clone()))?;
            let syringe = index
                .checked_add(1)
                .and_then(|n| SyringeNumber::new(n).ok())
                .ok_or_else(|| GcodeError::Unsupported(code.clone()))?;
            Ok(vec![
                CommandSpecifics::Actuate {
                    relative_mm_required: ActuatorTravel::GoHome,
                    scale: 1.0,
                },
                uv_light(Switch::Off),
                CommandSpecifics::Rotate {
                    target_syringe: syringe,
                },
                uv_light(Switch::On),
                CommandSpecifics::Actuate {
                    relative_mm_required: ActuatorTravel::PlungerFlange,
                    scale: 1.0,
                },
            ])
        }
        _ => Err(GcodeError::Unsupported(code)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_heat_on_and_off() {
        let on = translate(&args("M140 S60"), 1.0).unwrap();
        assert_eq!(on.len(), 5);
        assert_eq!(
            on[0],
            CommandSpecifics::TurnHeatingPad {
                target: SyringeTarget::Syringe(SyringeNumber::ALL[0]),
                on_or_off: Switch::On
            }
        );
        assert_eq!(on[4], uv_light(Switch::On));

        let off = translate(&args("M140 S0"), 1.0).unwrap();
        assert!(off.iter().all(|c| match c {
            CommandSpecifics::TurnHeatingPad { on_or_off, .. }
            | CommandSpecifics::TurnUvLight { on_or_off, .. } => *on_or_off == Switch::Off,
            _ => false,
        }));
    }

    #[test]
    fn test_tool_change_sequence() {
        let commands = translate(&args("T2"), 1.0).unwrap();
        assert_eq!(commands.len(), 5);
        assert_eq!(
            commands[2],
            CommandSpecifics::Rotate {
                target_syringe: SyringeNumber::ALL[2]
            }
        );
        assert_eq!(
            commands[4],
            CommandSpecifics::Actuate {
                relative_mm_required: ActuatorTravel::PlungerFlange,
                scale: 1.0
            }
        );
        assert_eq!(translate(&args("T4"), 1.0), Err(GcodeError::Unsupported("T4".to_string())));
    }

    #[test]
    fn test_extrude_uses_scale() {
        let commands = translate(&args("G1 X10 E1.5 F300"), 0.5).unwrap();
        assert_eq!(
            commands,
            vec![CommandSpecifics::Actuate {
                relative_mm_required: ActuatorTravel::Millimeters(1.5),
                scale: 0.5
            }]
        );
        assert_eq!(translate(&args("G1 X10"), 0.5).unwrap(), Vec::new());
    }

    #[test]
    fn test_errors() {
        assert_eq!(translate(&[], 1.0), Err(GcodeError::Empty));
        assert!(matches!(translate(&args("G28"), 1.0), Err(GcodeError::Unsupported(_))));
        assert!(matches!(
            translate(&args("M140"), 1.0),
            Err(GcodeError::MissingParameter { parameter: 'S', .. })
        ));
        assert!(matches!(
            translate(&args("G1 Eabc"), 1.0),
            Err(GcodeError::BadValue { parameter: 'E', .. })
        ));
    }
}
