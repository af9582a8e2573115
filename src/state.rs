/// Persistent rig state and the runtime-only context around it.
///
/// `PersistentState` is everything that survives a restart and is written
/// to `state.json`. Loading is a per-key partial merge: each top-level key
/// that parses is taken, anything missing or invalid keeps its default, and
/// the `LoadReport` says which was which.

use std::collections::VecDeque;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_json::Value;

use crate::calibration::{CalibrationJob, CalibrationState};
use crate::command::CommandQueue;
use crate::gpio::PinMappings;
use crate::process_guard::ProcessInfo;
use crate::request_handling::BridgeLedger;
use crate::util::{friendly_timestamp, UnixMillis};

pub const ALERT_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    pub ui_scale: f64,
    pub pins: PinMappings,
    pub calibration: CalibrationState,
    pub commands: CommandQueue,
    pub request_handling: BridgeLedger,
    pub process_info: Option<ProcessInfo>,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            ui_scale: 1.0,
            pins: PinMappings::default(),
            calibration: CalibrationState::default(),
            commands: CommandQueue::default(),
            request_handling: BridgeLedger::default(),
            process_info: None,
        }
    }
}

/// What happened to each top-level key on load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub file_found: bool,
    pub recovered: Vec<&'static str>,
    pub defaulted: Vec<&'static str>,
    pub invalid: Vec<(&'static str, String)>,
    pub ignored: Vec<String>,
}

impl LoadReport {
    pub fn log(&self, path: &Path) {
        if !self.file_found {
            log::info!(target: "state", "No save file at {}, starting fresh", path.display());
            return;
        }
        log::info!(
            target: "state",
            "Loaded {}: recovered [{}], defaulted [{}]",
            path.display(),
            self.recovered.join(", "),
            self.defaulted.join(", ")
        );
        for (key, error) in &self.invalid {
            log::warn!(target: "state", "Save file key '{}' is invalid, using default: {}", key, error);
        }
        for key in &self.ignored {
            log::warn!(target: "state", "Ignoring unknown save file key '{}'", key);
        }
    }
}

/// Take each known key from `object` if it parses.
macro_rules! merge_keys {
    ($object:expr, $state:expr, $report:expr, [$($key:ident),* $(,)?]) => {
        $(
            match $object.remove(stringify!($key)) {
                Some(raw) => match serde_json::from_value(raw) {
                    Ok(value) => {
                        $state.$key = value;
                        $report.recovered.push(stringify!($key));
                    }
                    Err(e) => $report.invalid.push((stringify!($key), e.to_string())),
                },
                None => $report.defaulted.push(stringify!($key)),
            }
        )*
    };
}

/// Load state from `path`. Never fails: problems fall back to defaults and
/// are listed in the report.
pub fn load_state_from_disk(path: &Path) -> (PersistentState, LoadReport) {
    let mut state = PersistentState::default();
    let mut report = LoadReport::default();

    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            if e.kind() != ErrorKind::NotFound {
                log::warn!(target: "state", "Could not read {}: {}", path.display(), e);
                report.file_found = true;
                report.invalid.push(("<file>", e.to_string()));
            }
            return (state, report);
        }
    };
    report.file_found = true;

    let mut object = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(object)) => object,
        Ok(_) => {
            report.invalid.push(("<root>", "not a JSON object".to_string()));
            return (state, report);
        }
        Err(e) => {
            report.invalid.push(("<root>", e.to_string()));
            return (state, report);
        }
    };

    merge_keys!(
        object,
        state,
        report,
        [ui_scale, pins, calibration, commands, request_handling, process_info]
    );

    if !(state.ui_scale.is_finite() && state.ui_scale > 0.0) {
        report
            .invalid
            .push(("ui_scale", format!("must be positive, got {}", state.ui_scale)));
        report.recovered.retain(|key| *key != "ui_scale");
        state.ui_scale = 1.0;
    }
    state.commands.repair_next_ordinal();

    report.ignored = object.keys().cloned().collect();
    (state, report)
}

/// Write `state` as tab-indented JSON via a temporary file and rename, so a
/// crash mid-write never leaves a truncated save file.
pub fn save_state_to_disk(path: &Path, state: &PersistentState) -> Result<()> {
    let mut buffer = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    state.serialize(&mut serializer)?;
    buffer.push(b'\n');
    write_atomically(path, &buffer)
}

pub fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let folder = path
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent folder", path.display()))?;
    fs::create_dir_all(folder)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = folder.join(tmp_name);
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Safety,
    Precondition,
    Configuration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub at: UnixMillis,
    pub kind: AlertKind,
    pub message: String,
}

impl Alert {
    pub fn friendly(&self) -> String {
        format!(
            "[{}] {:?}: {}",
            friendly_timestamp(self.at, false),
            self.kind,
            self.message
        )
    }
}

/// Control loop timing, logged at shutdown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopStats {
    pub ticks: u64,
    pub max_delta_ms: f64,
    pub overruns: u64,
}

impl LoopStats {
    pub fn record(&mut self, delta_ms: f64, interval_ms: f64) {
        self.ticks += 1;
        if delta_ms > self.max_delta_ms {
            self.max_delta_ms = delta_ms;
        }
        // Half an interval late counts as an overrun
        if delta_ms > interval_ms * 1.5 {
            self.overruns += 1;
        }
    }
}

/// Runtime-only state. Never serialized.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    pub processing_enabled: bool,
    pub modal_open: bool,
    pub alerts: VecDeque<Alert>,
    pub stats: LoopStats,
}

impl RuntimeContext {
    pub fn alert(&mut self, kind: AlertKind, message: impl Into<String>, now: UnixMillis) {
        let message = message.into();
        log::warn!(target: "alert", "{:?}: {}", kind, message);
        self.alerts.push_back(Alert {
            at: now,
            kind,
            message,
        });
        while self.alerts.len() > ALERT_LIMIT {
            self.alerts.pop_front();
        }
    }
}

/// Read-only copy of everything callers may look at.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub taken_at: UnixMillis,
    pub state: PersistentState,
    pub processing_enabled: bool,
    pub modal_open: bool,
    pub calibration_lock_held: bool,
    pub calibration_job: Option<CalibrationJob>,
    pub calibration_complete: bool,
    pub alerts: Vec<Alert>,
    pub stats: LoopStats,
}

pub type SnapshotSlot = Arc<Mutex<Option<StateSnapshot>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandSpecifics, Submitter, SyringeNumber};
    use crate::gpio::{Bit, PinName};
    use tempfile::tempdir;

    fn populated_state() -> PersistentState {
        let mut state = PersistentState {
            ui_scale: 1.25,
            pins: PinMappings::all_outputs(),
            ..Default::default()
        };
        state.calibration.current_syringe = Some(SyringeNumber::ALL[1]);
        state.calibration.actuator_position_mm = Some(12.5);
        state
            .calibration
            .plunger_positions_mm
            .insert(SyringeNumber::ALL[0], 33.0);
        for n in 1..=3u8 {
            state.commands.enqueue(
                Submitter::Operator,
                CommandSpecifics::Rotate {
                    target_syringe: SyringeNumber::new(n).unwrap(),
                },
                1_000 + n as i64,
            );
        }
        state
            .commands
            .finish_head(2_000, crate::command::Outcome::Completed, 100);
        state.request_handling.watermark = 77;
        state
    }

    #[test]
    fn test_state_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = populated_state();
        save_state_to_disk(&path, &state).unwrap();

        let (loaded, report) = load_state_from_disk(&path);
        assert_eq!(loaded, state);
        assert!(report.invalid.is_empty());
        assert!(report.defaulted.is_empty());
        assert_eq!(report.recovered.len(), 6);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n\t\"ui_scale\""));
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let (state, report) = load_state_from_disk(&dir.path().join("nope.json"));
        assert_eq!(state, PersistentState::default());
        assert!(!report.file_found);
    }

    #[test]
    fn test_partial_merge_keeps_good_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let text = r#"{
            "ui_scale": "huge",
            "calibration": {"current_syringe": 3, "actuator_position_mm": 4.0,
                            "plunger_positions_mm": {"1": 20.5}},
            "pins": {"uv_light_1": {"number": 11, "io_type": "Output", "value": 0}},
            "favourite_colour": "green"
        }"#;
        std::fs::write(&path, text).unwrap();

        let (state, report) = load_state_from_disk(&path);
        assert_eq!(state.ui_scale, 1.0);
        assert_eq!(state.calibration.current_syringe, Some(SyringeNumber::ALL[2]));
        assert_eq!(
            state.calibration.plunger_positions_mm.get(&SyringeNumber::ALL[0]),
            Some(&20.5)
        );
        assert_eq!(state.pins.get(PinName::UvLight1).number, Some(11));
        assert_eq!(state.pins.get(PinName::UvLight1).value, Some(Bit::Low));
        assert_eq!(report.recovered, vec!["pins", "calibration"]);
        assert_eq!(report.invalid.len(), 1);
        assert_eq!(report.invalid[0].0, "ui_scale");
        assert_eq!(
            report.defaulted,
            vec!["commands", "request_handling", "process_info"]
        );
        assert_eq!(report.ignored, vec!["favourite_colour".to_string()]);
    }

    #[test]
    fn test_garbage_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let (state, report) = load_state_from_disk(&path);
        assert_eq!(state, PersistentState::default());
        assert!(report.file_found);
        assert_eq!(report.invalid[0].0, "<root>");
    }

    #[test]
    fn test_alerts_are_bounded() {
        let mut runtime = RuntimeContext::default();
        for i in 0..(ALERT_LIMIT + 5) {
            runtime.alert(AlertKind::Safety, format!("alert {}", i), i as i64);
        }
        assert_eq!(runtime.alerts.len(), ALERT_LIMIT);
        assert_eq!(runtime.alerts.front().map(|a| a.at), Some(5));
    }

    #[test]
    fn test_loop_stats() {
        let mut stats = LoopStats::default();
        stats.record(8.0, 8.0);
        stats.record(20.0, 8.0);
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.max_delta_ms, 20.0);
        assert_eq!(stats.overruns, 1);
    }
}
