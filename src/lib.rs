/// Bioprint Driver Library
///
/// Command processing engine for the bioprinting rig: persistent queue,
/// fixed-tick control loop, calibration and the firmware request bridge.

pub mod calibration;
pub mod command;
pub mod config_loader;
pub mod gcode;
pub mod gpio;
pub mod operator;
pub mod process_guard;
pub mod processing;
pub mod request_handling;
pub mod service;
pub mod state;
pub mod util;
