/// Command vocabulary and the persistent queue/history.
///
/// A command is a verb with its parameters (`CommandSpecifics`) plus a
/// lifecycle phase. Progress only exists once the control loop has started
/// the command.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::{friendly_timestamp, stringify_mm, UnixMillis};

pub type Ordinal = u64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("The queue is empty")]
    Empty,

    #[error("Stop processing before cancelling commands")]
    ProcessingActive,

    #[error("Syringe number must be 1 to 4, got {0}")]
    InvalidSyringe(u8),

    #[error("Actuator travel must be a finite distance, got {mm} mm at scale {scale}")]
    NonFiniteTravel { mm: f64, scale: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SyringeNumber(u8);

impl SyringeNumber {
    pub const ALL: [SyringeNumber; 4] = [
        SyringeNumber(1),
        SyringeNumber(2),
        SyringeNumber(3),
        SyringeNumber(4),
    ];

    pub fn new(number: u8) -> Result<Self, QueueError> {
        if (1..=4).contains(&number) {
            Ok(SyringeNumber(number))
        } else {
            Err(QueueError::InvalidSyringe(number))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for SyringeNumber {
    type Error = QueueError;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        SyringeNumber::new(number)
    }
}

impl From<SyringeNumber> for u8 {
    fn from(syringe: SyringeNumber) -> u8 {
        syringe.0
    }
}

impl fmt::Display for SyringeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Submitter {
    Operator,
    Klipper,
}

const CURRENT_ONE: &str = "Current one";
const GO_HOME: &str = "Go home";
const PLUNGER_FLANGE: &str = "Plunger flange";

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Which syringe a toggle applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NumberOrText", into = "NumberOrText")]
pub enum SyringeTarget {
    Syringe(SyringeNumber),
    CurrentOne,
}

impl TryFrom<NumberOrText> for SyringeTarget {
    type Error = String;

    fn try_from(raw: NumberOrText) -> Result<Self, Self::Error> {
        match raw {
            NumberOrText::Integer(n) if (1..=4).contains(&n) => {
                Ok(SyringeTarget::Syringe(SyringeNumber(n as u8)))
            }
            NumberOrText::Integer(n) => Err(format!("syringe target must be 1 to 4, got {}", n)),
            NumberOrText::Float(n) => Err(format!("syringe target must be 1 to 4, got {}", n)),
            NumberOrText::Text(text) if text == CURRENT_ONE => Ok(SyringeTarget::CurrentOne),
            NumberOrText::Text(text) => Err(format!("unknown syringe target '{}'", text)),
        }
    }
}

impl From<SyringeTarget> for NumberOrText {
    fn from(target: SyringeTarget) -> Self {
        match target {
            SyringeTarget::Syringe(syringe) => NumberOrText::Integer(syringe.get() as i64),
            SyringeTarget::CurrentOne => NumberOrText::Text(CURRENT_ONE.to_string()),
        }
    }
}

impl fmt::Display for SyringeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyringeTarget::Syringe(syringe) => write!(f, "syringe {}", syringe),
            SyringeTarget::CurrentOne => f.write_str("current syringe"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    pub fn from_bool(on: bool) -> Switch {
        if on {
            Switch::On
        } else {
            Switch::Off
        }
    }
}

/// How far an Actuate should travel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "NumberOrText", into = "NumberOrText")]
pub enum ActuatorTravel {
    Millimeters(f64),
    GoHome,
    PlungerFlange,
}

impl TryFrom<NumberOrText> for ActuatorTravel {
    type Error = String;

    fn try_from(raw: NumberOrText) -> Result<Self, Self::Error> {
        match raw {
            NumberOrText::Integer(mm) => Ok(ActuatorTravel::Millimeters(mm as f64)),
            NumberOrText::Float(mm) if mm.is_finite() => Ok(ActuatorTravel::Millimeters(mm)),
            NumberOrText::Float(mm) => Err(format!("travel must be finite, got {}", mm)),
            NumberOrText::Text(text) if text == GO_HOME => Ok(ActuatorTravel::GoHome),
            NumberOrText::Text(text) if text == PLUNGER_FLANGE => Ok(ActuatorTravel::PlungerFlange),
            NumberOrText::Text(text) => Err(format!("unknown actuator travel '{}'", text)),
        }
    }
}

impl From<ActuatorTravel> for NumberOrText {
    fn from(travel: ActuatorTravel) -> Self {
        match travel {
            ActuatorTravel::Millimeters(mm) => NumberOrText::Float(mm),
            ActuatorTravel::GoHome => NumberOrText::Text(GO_HOME.to_string()),
            ActuatorTravel::PlungerFlange => NumberOrText::Text(PLUNGER_FLANGE.to_string()),
        }
    }
}

fn unit_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb")]
pub enum CommandSpecifics {
    Rotate {
        target_syringe: SyringeNumber,
    },
    Actuate {
        relative_mm_required: ActuatorTravel,
        #[serde(default = "unit_scale")]
        scale: f64,
    },
    TurnHeatingPad {
        target: SyringeTarget,
        on_or_off: Switch,
    },
    TurnUvLight {
        target: SyringeTarget,
        on_or_off: Switch,
    },
}

impl CommandSpecifics {
    /// Refuse parameters that cannot be persisted or driven. JSON has no
    /// NaN or infinity, so such a command would poison the save file.
    pub fn validate(&self) -> Result<(), QueueError> {
        if let CommandSpecifics::Actuate {
            relative_mm_required,
            scale,
        } = self
        {
            let mm = match relative_mm_required {
                ActuatorTravel::Millimeters(mm) => *mm,
                ActuatorTravel::GoHome | ActuatorTravel::PlungerFlange => 0.0,
            };
            if !mm.is_finite() || !scale.is_finite() || !(mm * scale).is_finite() {
                return Err(QueueError::NonFiniteTravel { mm, scale: *scale });
            }
        }
        Ok(())
    }
}

impl fmt::Display for CommandSpecifics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSpecifics::Rotate { target_syringe } => {
                write!(f, "Rotate to syringe {}", target_syringe)
            }
            CommandSpecifics::Actuate {
                relative_mm_required,
                scale,
            } => {
                match relative_mm_required {
                    ActuatorTravel::Millimeters(mm) => write!(f, "Actuate {} mm", stringify_mm(*mm))?,
                    ActuatorTravel::GoHome => f.write_str("Actuate home")?,
                    ActuatorTravel::PlungerFlange => f.write_str("Actuate to plunger flange")?,
                }
                if *scale != 1.0 {
                    write!(f, " (scale {})", scale)?;
                }
                Ok(())
            }
            CommandSpecifics::TurnHeatingPad { target, on_or_off } => {
                write!(f, "Turn heating pad {:?} for {}", on_or_off, target)
            }
            CommandSpecifics::TurnUvLight { target, on_or_off } => {
                write!(f, "Turn UV light {:?} for {}", on_or_off, target)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Progress {
    /// Single-tick toggles
    Instant,
    Rotation {
        relative_degrees_required: f64,
        relative_degrees_traveled: f64,
    },
    Extension {
        scaled_mm_required: f64,
        scaled_mm_traveled: f64,
    },
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::Instant => f.write_str("done"),
            Progress::Rotation {
                relative_degrees_required,
                relative_degrees_traveled,
            } => write!(
                f,
                "{:.1} of {:.1} degrees",
                relative_degrees_traveled, relative_degrees_required
            ),
            Progress::Extension {
                scaled_mm_required,
                scaled_mm_traveled,
            } => write!(
                f,
                "{} of {} mm",
                stringify_mm(*scaled_mm_traveled),
                stringify_mm(*scaled_mm_required)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum CommandPhase {
    Enqueued,
    Started {
        started_at: UnixMillis,
        progress: Progress,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueuedCommand {
    pub ordinal: Ordinal,
    pub enqueued_at: UnixMillis,
    pub enqueued_by: Submitter,
    pub specifics: CommandSpecifics,
    pub phase: CommandPhase,
}

impl EnqueuedCommand {
    pub fn is_started(&self) -> bool {
        matches!(self.phase, CommandPhase::Started { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Completed,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedCommand {
    pub ordinal: Ordinal,
    pub enqueued_at: UnixMillis,
    pub enqueued_by: Submitter,
    pub started_at: UnixMillis,
    pub finished_at: UnixMillis,
    pub specifics: CommandSpecifics,
    pub progress: Progress,
    pub outcome: Outcome,
}

impl FinishedCommand {
    fn from_enqueued(command: EnqueuedCommand, now: UnixMillis, outcome: Outcome) -> Self {
        let (started_at, progress) = match command.phase {
            CommandPhase::Started {
                started_at,
                progress,
            } => (started_at, progress),
            CommandPhase::Enqueued => (now, Progress::Instant),
        };
        Self {
            ordinal: command.ordinal,
            enqueued_at: command.enqueued_at,
            enqueued_by: command.enqueued_by,
            started_at,
            finished_at: now,
            specifics: command.specifics,
            progress,
            outcome,
        }
    }

    /// One-line summary for the console history view
    pub fn friendly(&self) -> String {
        let outcome = match self.outcome {
            Outcome::Completed => "",
            Outcome::Interrupted => " [interrupted]",
        };
        format!(
            "#{} {} ({:?}), finished {}{}",
            self.ordinal,
            self.specifics,
            self.enqueued_by,
            friendly_timestamp(self.finished_at, false),
            outcome
        )
    }
}

/// Pending commands, bounded history, and the ordinal counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandQueue {
    pub queue: VecDeque<EnqueuedCommand>,
    pub history: VecDeque<FinishedCommand>,
    pub next_ordinal: Ordinal,
}

impl CommandQueue {
    pub fn enqueue(&mut self, by: Submitter, specifics: CommandSpecifics, now: UnixMillis) -> Ordinal {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.queue.push_back(EnqueuedCommand {
            ordinal,
            enqueued_at: now,
            enqueued_by: by,
            specifics,
            phase: CommandPhase::Enqueued,
        });
        ordinal
    }

    /// Remove the most recently enqueued command.
    pub fn cancel_last(&mut self) -> Result<EnqueuedCommand, QueueError> {
        self.queue.pop_back().ok_or(QueueError::Empty)
    }

    pub fn head(&self) -> Option<&EnqueuedCommand> {
        self.queue.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut EnqueuedCommand> {
        self.queue.front_mut()
    }

    /// Move the head into history, evicting the oldest entries beyond
    /// `history_limit`.
    pub fn finish_head(
        &mut self,
        now: UnixMillis,
        outcome: Outcome,
        history_limit: usize,
    ) -> Option<&FinishedCommand> {
        let command = self.queue.pop_front()?;
        self.push_history(FinishedCommand::from_enqueued(command, now, outcome), history_limit);
        self.history.back()
    }

    fn push_history(&mut self, finished: FinishedCommand, history_limit: usize) {
        self.history.push_back(finished);
        while self.history.len() > history_limit {
            self.history.pop_front();
        }
    }

    pub fn has_finished(&self, ordinal: Ordinal) -> bool {
        self.history.iter().any(|finished| finished.ordinal == ordinal)
    }

    /// An ordinal is settled once it was issued and is no longer queued.
    /// Survives history eviction and cancellation.
    pub fn is_settled(&self, ordinal: Ordinal) -> bool {
        ordinal < self.next_ordinal && !self.queue.iter().any(|queued| queued.ordinal == ordinal)
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Move every command left mid-motion by a previous run into history as
    /// interrupted. Returns their ordinals.
    pub fn discard_interrupted(&mut self, now: UnixMillis, history_limit: usize) -> Vec<Ordinal> {
        let (started, pending): (VecDeque<_>, VecDeque<_>) =
            self.queue.drain(..).partition(|command| command.is_started());
        self.queue = pending;
        let mut discarded = Vec::with_capacity(started.len());
        for command in started {
            discarded.push(command.ordinal);
            self.push_history(
                FinishedCommand::from_enqueued(command, now, Outcome::Interrupted),
                history_limit,
            );
        }
        discarded
    }

    /// Keep the counter ahead of every ordinal we know about, whatever the
    /// save file said.
    pub fn repair_next_ordinal(&mut self) {
        let highest = self
            .queue
            .iter()
            .map(|command| command.ordinal)
            .chain(self.history.iter().map(|finished| finished.ordinal))
            .max();
        if let Some(highest) = highest {
            if self.next_ordinal <= highest {
                self.next_ordinal = highest + 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotate(n: u8) -> CommandSpecifics {
        CommandSpecifics::Rotate {
            target_syringe: SyringeNumber::new(n).unwrap(),
        }
    }

    #[test]
    fn test_ordinals_strictly_increase() {
        let mut commands = CommandQueue::default();
        let mut last = None;
        for i in 0..20 {
            let ordinal = commands.enqueue(Submitter::Operator, rotate(1 + i % 4), 1000 + i as i64);
            if let Some(previous) = last {
                assert!(ordinal > previous);
            }
            last = Some(ordinal);
            if i % 3 == 0 {
                commands.cancel_last().unwrap();
            }
        }
        // Cancelled ordinals are never reused
        let ordinal = commands.enqueue(Submitter::Klipper, rotate(2), 5000);
        assert_eq!(ordinal, 20);
    }

    #[test]
    fn test_validate_rejects_non_finite_travel() {
        let actuate = |mm: f64, scale: f64| CommandSpecifics::Actuate {
            relative_mm_required: ActuatorTravel::Millimeters(mm),
            scale,
        };
        assert_eq!(actuate(2.5, 1.0).validate(), Ok(()));
        assert!(matches!(
            actuate(f64::NAN, 1.0).validate(),
            Err(QueueError::NonFiniteTravel { .. })
        ));
        assert!(actuate(f64::INFINITY, 1.0).validate().is_err());
        assert!(actuate(1.0, f64::NAN).validate().is_err());
        assert!(actuate(1e308, 1e308).validate().is_err());
        let home = CommandSpecifics::Actuate {
            relative_mm_required: ActuatorTravel::GoHome,
            scale: 1.0,
        };
        assert_eq!(home.validate(), Ok(()));
        assert_eq!(rotate(3).validate(), Ok(()));
    }

    #[test]
    fn test_cancel_last_on_empty_queue() {
        let mut commands = CommandQueue::default();
        assert_eq!(commands.cancel_last(), Err(QueueError::Empty));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut commands = CommandQueue::default();
        for _ in 0..5 {
            commands.enqueue(Submitter::Operator, rotate(1), 0);
            commands.finish_head(10, Outcome::Completed, 3);
        }
        let ordinals: Vec<_> = commands.history.iter().map(|f| f.ordinal).collect();
        assert_eq!(ordinals, vec![2, 3, 4]);
        assert!(!commands.has_finished(0));
        // Evicted but still settled
        assert!(commands.is_settled(0));
        assert!(!commands.is_settled(5));
    }

    #[test]
    fn test_discard_interrupted() {
        let mut commands = CommandQueue::default();
        commands.enqueue(Submitter::Operator, rotate(2), 0);
        commands.enqueue(Submitter::Operator, rotate(3), 0);
        if let Some(head) = commands.head_mut() {
            head.phase = CommandPhase::Started {
                started_at: 5,
                progress: Progress::Rotation {
                    relative_degrees_required: 90.0,
                    relative_degrees_traveled: 40.0,
                },
            };
        }
        let discarded = commands.discard_interrupted(50, 100);
        assert_eq!(discarded, vec![0]);
        assert_eq!(commands.queue.len(), 1);
        assert_eq!(commands.history[0].outcome, Outcome::Interrupted);
        assert_eq!(commands.history[0].started_at, 5);
        assert_eq!(commands.history[0].finished_at, 50);
    }

    #[test]
    fn test_specifics_wire_format() {
        let json = r#"[
            {"verb": "Rotate", "target_syringe": 2},
            {"verb": "Actuate", "relative_mm_required": 5},
            {"verb": "Actuate", "relative_mm_required": "Go home", "scale": 1},
            {"verb": "TurnHeatingPad", "target": 3, "on_or_off": "On"},
            {"verb": "TurnUvLight", "target": "Current one", "on_or_off": "Off"}
        ]"#;
        let specifics: Vec<CommandSpecifics> = serde_json::from_str(json).unwrap();
        assert_eq!(specifics[0], rotate(2));
        assert_eq!(
            specifics[1],
            CommandSpecifics::Actuate {
                relative_mm_required: ActuatorTravel::Millimeters(5.0),
                scale: 1.0
            }
        );
        assert_eq!(
            specifics[2],
            CommandSpecifics::Actuate {
                relative_mm_required: ActuatorTravel::GoHome,
                scale: 1.0
            }
        );
        assert_eq!(
            specifics[4],
            CommandSpecifics::TurnUvLight {
                target: SyringeTarget::CurrentOne,
                on_or_off: Switch::Off
            }
        );

        let text = serde_json::to_string(&specifics[4]).unwrap();
        assert!(text.contains("\"Current one\""));
    }

    #[test]
    fn test_rejects_bad_syringe_numbers() {
        assert!(serde_json::from_str::<CommandSpecifics>(r#"{"verb": "Rotate", "target_syringe": 5}"#).is_err());
        assert!(serde_json::from_str::<CommandSpecifics>(
            r#"{"verb": "TurnUvLight", "target": "Next one", "on_or_off": "On"}"#
        )
        .is_err());
        assert_eq!(SyringeNumber::new(0), Err(QueueError::InvalidSyringe(0)));
    }

    #[test]
    fn test_repair_next_ordinal() {
        let mut commands = CommandQueue::default();
        commands.enqueue(Submitter::Operator, rotate(1), 0);
        commands.enqueue(Submitter::Operator, rotate(1), 0);
        commands.next_ordinal = 0;
        commands.repair_next_ordinal();
        assert_eq!(commands.next_ordinal, 2);
    }
}
