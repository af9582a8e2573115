/// GPIO pin abstraction for the rig.
///
/// Logical pin names map to physical header pins (board numbering) with an
/// I/O direction. The mapping itself is persisted with the rest of the
/// state; `GpioBoard` only drives the lines.
///
/// Supports libgpiod (gpiocdev) behind the `gpiod` feature. Without the
/// feature, or with GPIO disabled for the host, a simulated driver is used:
/// writes are no-ops and reads return 0.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::SyringeNumber;
use crate::config_loader::GpioSettings;

#[cfg(feature = "gpiod")]
use gpiocdev::line::Value;
#[cfg(feature = "gpiod")]
use gpiocdev::request::Request;

/// Header pins usable as GPIO on a Raspberry Pi 40-pin header.
pub const VALID_PIN_NUMBERS: [u8; 26] = [
    3, 5, 7, 8, 10, 11, 12, 13, 15, 16, 18, 19, 21, 22, 23, 24, 26, 29, 31, 32, 33, 35, 36, 37,
    38, 40,
];

/// Board pin -> BCM line offset on the main gpiochip.
const BOARD_TO_BCM: [(u8, u32); 26] = [
    (3, 2), (5, 3), (7, 4), (8, 14), (10, 15), (11, 17), (12, 18), (13, 27), (15, 22),
    (16, 23), (18, 24), (19, 10), (21, 9), (22, 25), (23, 11), (24, 8), (26, 7), (29, 5),
    (31, 6), (32, 12), (33, 13), (35, 19), (36, 16), (37, 26), (38, 20), (40, 21),
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PinError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown pin {0}")]
    UnknownPin(String),

    #[error("Pin {0} is not configured")]
    NotConfigured(PinName),

    #[error("Tried to write to non-output pin {0}")]
    NotOutput(PinName),

    #[error("GPIO hardware error on pin {number}: {message}")]
    Hardware { number: u8, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Bit {
    Low,
    High,
}

impl Bit {
    pub fn flip(self) -> Bit {
        match self {
            Bit::Low => Bit::High,
            Bit::High => Bit::Low,
        }
    }

    pub fn from_bool(value: bool) -> Bit {
        if value {
            Bit::High
        } else {
            Bit::Low
        }
    }
}

impl From<Bit> for u8 {
    fn from(bit: Bit) -> u8 {
        match bit {
            Bit::Low => 0,
            Bit::High => 1,
        }
    }
}

impl TryFrom<u8> for Bit {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Bit::Low),
            1 => Ok(Bit::High),
            other => Err(format!("bit must be 0 or 1, got {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoType {
    Input,
    Output,
}

impl FromStr for IoType {
    type Err = PinError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "input" | "in" => Ok(IoType::Input),
            "output" | "out" => Ok(IoType::Output),
            other => Err(PinError::Config(format!("Unknown pin type {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinName {
    RotatorDirection,
    RotatorStep,
    ActuatorRetract,
    ActuatorExtend,
    HeatingPad1,
    HeatingPad2,
    HeatingPad3,
    HeatingPad4,
    UvLight1,
    UvLight2,
    UvLight3,
    UvLight4,
}

impl PinName {
    pub const ALL: [PinName; 12] = [
        PinName::RotatorDirection,
        PinName::RotatorStep,
        PinName::ActuatorRetract,
        PinName::ActuatorExtend,
        PinName::HeatingPad1,
        PinName::HeatingPad2,
        PinName::HeatingPad3,
        PinName::HeatingPad4,
        PinName::UvLight1,
        PinName::UvLight2,
        PinName::UvLight3,
        PinName::UvLight4,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PinName::RotatorDirection => "rotator_direction",
            PinName::RotatorStep => "rotator_step",
            PinName::ActuatorRetract => "actuator_retract",
            PinName::ActuatorExtend => "actuator_extend",
            PinName::HeatingPad1 => "heating_pad_1",
            PinName::HeatingPad2 => "heating_pad_2",
            PinName::HeatingPad3 => "heating_pad_3",
            PinName::HeatingPad4 => "heating_pad_4",
            PinName::UvLight1 => "uv_light_1",
            PinName::UvLight2 => "uv_light_2",
            PinName::UvLight3 => "uv_light_3",
            PinName::UvLight4 => "uv_light_4",
        }
    }

    pub fn heating_pad(syringe: SyringeNumber) -> PinName {
        match syringe.get() {
            1 => PinName::HeatingPad1,
            2 => PinName::HeatingPad2,
            3 => PinName::HeatingPad3,
            _ => PinName::HeatingPad4,
        }
    }

    pub fn uv_light(syringe: SyringeNumber) -> PinName {
        match syringe.get() {
            1 => PinName::UvLight1,
            2 => PinName::UvLight2,
            3 => PinName::UvLight3,
            _ => PinName::UvLight4,
        }
    }
}

impl fmt::Display for PinName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PinName {
    type Err = PinError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        PinName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s.trim())
            .ok_or_else(|| PinError::UnknownPin(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    pub number: Option<u8>,
    pub io_type: Option<IoType>,
    pub value: Option<Bit>,
}

impl Pin {
    fn is_mapped(&self) -> bool {
        self.number.is_some() && self.io_type.is_some()
    }
}

/// Every logical pin, always fully populated. Persisted as a map keyed by
/// pin name; unknown names in a save file are dropped and missing ones are
/// filled in unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Pin>", into = "BTreeMap<String, Pin>")]
pub struct PinMappings(BTreeMap<PinName, Pin>);

impl Default for PinMappings {
    fn default() -> Self {
        Self(PinName::ALL.iter().map(|name| (*name, Pin::default())).collect())
    }
}

impl From<BTreeMap<String, Pin>> for PinMappings {
    fn from(raw: BTreeMap<String, Pin>) -> Self {
        let mut mappings = PinMappings::default();
        for (name, pin) in raw {
            match name.parse::<PinName>() {
                Ok(name) => {
                    mappings.0.insert(name, pin);
                }
                Err(_) => {
                    log::warn!(target: "gpio", "Ignoring unknown pin '{}' in saved mappings", name);
                }
            }
        }
        mappings
    }
}

impl From<PinMappings> for BTreeMap<String, Pin> {
    fn from(mappings: PinMappings) -> Self {
        mappings
            .0
            .into_iter()
            .map(|(name, pin)| (name.as_str().to_string(), pin))
            .collect()
    }
}

impl PinMappings {
    pub fn get(&self, name: PinName) -> &Pin {
        // Always populated by construction
        &self.0[&name]
    }

    fn get_mut(&mut self, name: PinName) -> &mut Pin {
        self.0.entry(name).or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PinName, &Pin)> {
        self.0.iter().map(|(name, pin)| (*name, pin))
    }

    /// Convenience for tests and bench setups: map every pin to an output
    /// in declaration order.
    pub fn all_outputs() -> Self {
        let mut mappings = PinMappings::default();
        for (name, number) in PinName::ALL.iter().zip(VALID_PIN_NUMBERS.iter()) {
            let pin = mappings.get_mut(*name);
            pin.number = Some(*number);
            pin.io_type = Some(IoType::Output);
            pin.value = Some(Bit::Low);
        }
        mappings
    }
}

/// Line-level driver. Pin numbers are header (board) numbers.
pub trait PinDriver: Send {
    fn setup(&mut self, number: u8, io_type: IoType) -> std::result::Result<(), PinError>;
    fn input(&mut self, number: u8) -> std::result::Result<Bit, PinError>;
    fn output(&mut self, number: u8, value: Bit) -> std::result::Result<(), PinError>;
}

/// Stand-in for development off-device: writes are no-ops, reads return 0.
#[derive(Debug, Default)]
pub struct SimulatedDriver;

impl PinDriver for SimulatedDriver {
    fn setup(&mut self, _number: u8, _io_type: IoType) -> std::result::Result<(), PinError> {
        Ok(())
    }

    fn input(&mut self, _number: u8) -> std::result::Result<Bit, PinError> {
        Ok(Bit::Low)
    }

    fn output(&mut self, _number: u8, _value: Bit) -> std::result::Result<(), PinError> {
        Ok(())
    }
}

/// libgpiod character-device driver: one line request per pin.
#[cfg(feature = "gpiod")]
pub struct GpiodDriver {
    chip_path: String,
    line_requests: std::collections::HashMap<u8, Request>,
}

#[cfg(feature = "gpiod")]
impl GpiodDriver {
    pub fn new(chip_path: &str) -> Result<Self> {
        if !std::path::Path::new(chip_path).exists() {
            return Err(anyhow!("No usable gpiochip device found at {}", chip_path));
        }
        Ok(Self {
            chip_path: chip_path.to_string(),
            line_requests: std::collections::HashMap::new(),
        })
    }

    fn offset(number: u8) -> std::result::Result<u32, PinError> {
        bcm_offset(number).ok_or_else(|| PinError::Config(format!("Unknown pin number {}", number)))
    }

    fn hardware(number: u8, e: gpiocdev::Error) -> PinError {
        PinError::Hardware {
            number,
            message: e.to_string(),
        }
    }
}

#[cfg(feature = "gpiod")]
impl PinDriver for GpiodDriver {
    fn setup(&mut self, number: u8, io_type: IoType) -> std::result::Result<(), PinError> {
        let offset = Self::offset(number)?;
        // Release any previous request for this line before re-requesting it
        self.line_requests.remove(&number);
        let mut builder = Request::builder();
        builder
            .on_chip(&self.chip_path)
            .with_consumer("bioprintdriver")
            .with_line(offset);
        match io_type {
            IoType::Input => {
                builder.as_input();
            }
            IoType::Output => {
                builder.as_output(Value::Inactive);
            }
        }
        let request = builder.request().map_err(|e| Self::hardware(number, e))?;
        self.line_requests.insert(number, request);
        Ok(())
    }

    fn input(&mut self, number: u8) -> std::result::Result<Bit, PinError> {
        let offset = Self::offset(number)?;
        let request = self.line_requests.get(&number).ok_or_else(|| PinError::Hardware {
            number,
            message: "line not requested".to_string(),
        })?;
        let value = request.value(offset).map_err(|e| Self::hardware(number, e))?;
        Ok(Bit::from_bool(value == Value::Active))
    }

    fn output(&mut self, number: u8, value: Bit) -> std::result::Result<(), PinError> {
        let offset = Self::offset(number)?;
        let request = self.line_requests.get(&number).ok_or_else(|| PinError::Hardware {
            number,
            message: "line not requested".to_string(),
        })?;
        let level = match value {
            Bit::Low => Value::Inactive,
            Bit::High => Value::Active,
        };
        request
            .set_value(offset, level)
            .map_err(|e| Self::hardware(number, e))?;
        Ok(())
    }
}

pub fn bcm_offset(number: u8) -> Option<u32> {
    BOARD_TO_BCM
        .iter()
        .find(|(board, _)| *board == number)
        .map(|(_, bcm)| *bcm)
}

pub fn is_valid_pin_number(number: u8) -> bool {
    VALID_PIN_NUMBERS.contains(&number)
}

/// GPIO board controller
pub struct GpioBoard {
    pub exist: bool,
    driver: Box<dyn PinDriver>,
}

impl fmt::Debug for GpioBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpioBoard").field("exist", &self.exist).finish()
    }
}

impl GpioBoard {
    /// Create a GPIO board from host settings.
    pub fn new(settings: &GpioSettings) -> Result<Self> {
        if !settings.enabled {
            return Ok(Self::disabled());
        }

        // Only libgpiod is supported in Rust
        if settings.library != "gpiod" {
            return Err(anyhow!(
                "GPIO_LIBRARY '{}' is not supported. Only 'gpiod' is supported.",
                settings.library
            ));
        }

        Self::init_gpiod(&settings.chip)
    }

    /// Create a disabled GPIO board instance backed by the simulated driver
    pub fn disabled() -> Self {
        Self::with_driver(Box::new(SimulatedDriver), false)
    }

    pub fn with_driver(driver: Box<dyn PinDriver>, exist: bool) -> Self {
        Self { exist, driver }
    }

    #[cfg(feature = "gpiod")]
    fn init_gpiod(chip: &str) -> Result<Self> {
        let driver = GpiodDriver::new(chip)?;
        log::info!(target: "gpio", "Using gpiochip {}", chip);
        Ok(Self::with_driver(Box::new(driver), true))
    }

    #[cfg(not(feature = "gpiod"))]
    fn init_gpiod(_chip: &str) -> Result<Self> {
        Err(anyhow!("GPIO support not compiled in. Enable 'gpiod' feature."))
    }

    /// Apply every complete mapping to the hardware. Can be rerun
    /// idempotently: all physical outputs are zeroed first in case any were
    /// unmapped or left on externally.
    pub fn setup_pins(&mut self, pins: &mut PinMappings) -> std::result::Result<(), PinError> {
        self.zero_out_pins(pins)?;

        for name in PinName::ALL {
            let pin = *pins.get(name);
            if !pin.is_mapped() {
                continue;
            }
            let (Some(number), Some(io_type)) = (pin.number, pin.io_type) else {
                continue;
            };
            if !is_valid_pin_number(number) {
                return Err(PinError::Config(format!(
                    "Unknown pin number {} for {}",
                    number, name
                )));
            }
            self.driver.setup(number, io_type)?;
            if io_type == IoType::Output {
                pins.get_mut(name).value = Some(Bit::Low);
            }
        }
        Ok(())
    }

    /// Map `name` to a physical pin and direction, then re-run setup for the
    /// whole mapping set.
    pub fn configure(
        &mut self,
        pins: &mut PinMappings,
        name: PinName,
        number: u8,
        direction: &str,
    ) -> std::result::Result<(), PinError> {
        if !is_valid_pin_number(number) {
            return Err(PinError::Config(format!(
                "Unknown pin number {} for {}",
                number, name
            )));
        }
        let io_type: IoType = direction.parse()?;
        if let Some((other, _)) = pins
            .iter()
            .find(|(other, pin)| *other != name && pin.number == Some(number))
        {
            return Err(PinError::Config(format!(
                "Pin number {} is already mapped to {}",
                number, other
            )));
        }

        let pin = pins.get_mut(name);
        pin.number = Some(number);
        pin.io_type = Some(io_type);
        pin.value = None;
        log::info!(target: "gpio", "Mapped {} to pin {} as {:?}", name, number, io_type);
        self.setup_pins(pins)
    }

    pub fn read_pin(&mut self, pins: &PinMappings, name: PinName) -> std::result::Result<Bit, PinError> {
        let pin = pins.get(name);
        let number = pin.number.ok_or(PinError::NotConfigured(name))?;
        match pin.io_type {
            Some(IoType::Input) => self.driver.input(number),
            Some(IoType::Output) => pin.value.ok_or(PinError::NotConfigured(name)),
            None => Err(PinError::NotConfigured(name)),
        }
    }

    pub fn write_pin(
        &mut self,
        pins: &mut PinMappings,
        name: PinName,
        value: Bit,
    ) -> std::result::Result<(), PinError> {
        let pin = pins.get(name);
        if pin.io_type != Some(IoType::Output) {
            return Err(PinError::NotOutput(name));
        }
        let number = pin.number.ok_or(PinError::NotConfigured(name))?;
        self.driver.output(number, value)?;
        pins.get_mut(name).value = Some(value);
        Ok(())
    }

    /// Drive every physical GPIO pin low and zero all shadow values.
    pub fn zero_out_pins(&mut self, pins: &mut PinMappings) -> std::result::Result<(), PinError> {
        for number in VALID_PIN_NUMBERS {
            self.driver.setup(number, IoType::Output)?;
            self.driver.output(number, Bit::Low)?;
        }
        for name in PinName::ALL {
            pins.get_mut(name).value = Some(Bit::Low);
        }
        Ok(())
    }
}

/// Driver that records line levels and every write in memory, for tests
/// that need to observe what reached the "hardware".
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct RecordingDriver {
    levels: std::sync::Arc<std::sync::Mutex<std::collections::HashMap<u8, Bit>>>,
    writes: std::sync::Arc<std::sync::Mutex<Vec<(u8, Bit)>>>,
}

#[cfg(test)]
impl PinDriver for RecordingDriver {
    fn setup(&mut self, _number: u8, _io_type: IoType) -> std::result::Result<(), PinError> {
        Ok(())
    }

    fn input(&mut self, number: u8) -> std::result::Result<Bit, PinError> {
        Ok(self.level(number))
    }

    fn output(&mut self, number: u8, value: Bit) -> std::result::Result<(), PinError> {
        self.levels.lock().unwrap().insert(number, value);
        self.writes.lock().unwrap().push((number, value));
        Ok(())
    }
}

#[cfg(test)]
impl RecordingDriver {
    pub fn level(&self, number: u8) -> Bit {
        self.levels
            .lock()
            .unwrap()
            .get(&number)
            .copied()
            .unwrap_or(Bit::Low)
    }

    /// Number of writes to `number` since the last `clear_writes`.
    pub fn writes_to(&self, number: u8) -> usize {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(line, _)| *line == number)
            .count()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpio_disabled() {
        let gpio = GpioBoard::disabled();
        assert!(!gpio.exist);
    }

    #[test]
    fn test_configure_rejects_unknown_number_and_direction() {
        let mut board = GpioBoard::disabled();
        let mut pins = PinMappings::default();
        assert!(matches!(
            board.configure(&mut pins, PinName::RotatorStep, 1, "Output"),
            Err(PinError::Config(_))
        ));
        assert!(matches!(
            board.configure(&mut pins, PinName::RotatorStep, 8, "Sideways"),
            Err(PinError::Config(_))
        ));
        assert_eq!(pins.get(PinName::RotatorStep).number, None);
    }

    #[test]
    fn test_configure_is_idempotent() {
        let mut board = GpioBoard::disabled();
        let mut pins = PinMappings::default();
        board.configure(&mut pins, PinName::RotatorStep, 8, "Output").unwrap();
        board.write_pin(&mut pins, PinName::RotatorStep, Bit::High).unwrap();
        board.configure(&mut pins, PinName::RotatorStep, 8, "Output").unwrap();
        let pin = pins.get(PinName::RotatorStep);
        assert_eq!(pin.number, Some(8));
        assert_eq!(pin.io_type, Some(IoType::Output));
        // Re-running setup zeroes outputs
        assert_eq!(pin.value, Some(Bit::Low));
    }

    #[test]
    fn test_configure_rejects_duplicate_number() {
        let mut board = GpioBoard::disabled();
        let mut pins = PinMappings::default();
        board.configure(&mut pins, PinName::RotatorStep, 8, "Output").unwrap();
        assert!(matches!(
            board.configure(&mut pins, PinName::RotatorDirection, 8, "Output"),
            Err(PinError::Config(_))
        ));
    }

    #[test]
    fn test_read_and_write_errors() {
        let mut board = GpioBoard::disabled();
        let mut pins = PinMappings::default();
        assert_eq!(
            board.read_pin(&pins, PinName::UvLight1),
            Err(PinError::NotConfigured(PinName::UvLight1))
        );
        assert_eq!(
            board.write_pin(&mut pins, PinName::UvLight1, Bit::High),
            Err(PinError::NotOutput(PinName::UvLight1))
        );
        board.configure(&mut pins, PinName::UvLight1, 11, "Input").unwrap();
        assert_eq!(
            board.write_pin(&mut pins, PinName::UvLight1, Bit::High),
            Err(PinError::NotOutput(PinName::UvLight1))
        );
        // Simulated input reads 0
        assert_eq!(board.read_pin(&pins, PinName::UvLight1), Ok(Bit::Low));
        assert!(matches!("uv_light_9".parse::<PinName>(), Err(PinError::UnknownPin(_))));
    }

    #[test]
    fn test_write_updates_shadow_and_hardware() {
        let driver = RecordingDriver::default();
        let mut board = GpioBoard::with_driver(Box::new(driver.clone()), true);
        let mut pins = PinMappings::all_outputs();
        board.setup_pins(&mut pins).unwrap();
        board.write_pin(&mut pins, PinName::HeatingPad2, Bit::High).unwrap();
        let number = pins.get(PinName::HeatingPad2).number.unwrap();
        assert_eq!(driver.level(number), Bit::High);
        assert_eq!(board.read_pin(&pins, PinName::HeatingPad2), Ok(Bit::High));

        board.zero_out_pins(&mut pins).unwrap();
        assert_eq!(driver.level(number), Bit::Low);
        assert_eq!(pins.get(PinName::HeatingPad2).value, Some(Bit::Low));
    }

    #[test]
    fn test_mappings_tolerate_unknown_and_missing_names() {
        let json = r#"{"rotator_step": {"number": 8, "io_type": "Output", "value": 1},
                       "laser": {"number": 10, "io_type": "Output", "value": 0}}"#;
        let pins: PinMappings = serde_json::from_str(json).unwrap();
        assert_eq!(pins.get(PinName::RotatorStep).number, Some(8));
        assert_eq!(pins.get(PinName::RotatorStep).value, Some(Bit::High));
        assert_eq!(pins.get(PinName::UvLight4), &Pin::default());
        assert_eq!(pins.iter().count(), PinName::ALL.len());
    }

    #[test]
    fn test_every_valid_pin_has_a_bcm_line() {
        for number in VALID_PIN_NUMBERS {
            assert!(bcm_offset(number).is_some(), "pin {} has no BCM line", number);
        }
    }
}
