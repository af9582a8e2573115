/// Rig configuration loader.
///
/// Single source of truth: bioprint_driver.yaml. Values from the `common`
/// block are overridden by the block for the current hostname, which may sit
/// under any of the known OS sections.

use anyhow::{anyhow, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::calibration::ActuatorLimits;

const OS_SECTIONS: [&str; 3] = ["RaspberryPi", "Ubuntu", "macOS"];

/// Raw per-host block. Every key is optional so a host block only needs
/// the keys it overrides.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct HostSettings {
    pub gpio_enabled: Option<bool>,
    pub gpio_library: Option<String>,
    pub gpio_chip: Option<String>,
    pub loop_interval_ms: Option<u64>,
    pub save_interval_ms: Option<u64>,
    pub snapshot_interval_ms: Option<u64>,
    pub history_limit: Option<usize>,
    pub rotator_steps_per_90_degrees: Option<u32>,
    pub rotator_degrees_per_ms: Option<f64>,
    pub actuator_max_extension_mm: Option<f64>,
    pub actuator_travel_mm_per_ms: Option<f64>,
    pub safety_margin: Option<f64>,
    pub request_poll_interval_ms: Option<u64>,
    pub klipper_extrude_scale: Option<f64>,
    pub save_folder: Option<PathBuf>,
}

impl HostSettings {
    /// Keys set in `other` win.
    fn overlay(self, other: HostSettings) -> HostSettings {
        HostSettings {
            gpio_enabled: other.gpio_enabled.or(self.gpio_enabled),
            gpio_library: other.gpio_library.or(self.gpio_library),
            gpio_chip: other.gpio_chip.or(self.gpio_chip),
            loop_interval_ms: other.loop_interval_ms.or(self.loop_interval_ms),
            save_interval_ms: other.save_interval_ms.or(self.save_interval_ms),
            snapshot_interval_ms: other.snapshot_interval_ms.or(self.snapshot_interval_ms),
            history_limit: other.history_limit.or(self.history_limit),
            rotator_steps_per_90_degrees: other
                .rotator_steps_per_90_degrees
                .or(self.rotator_steps_per_90_degrees),
            rotator_degrees_per_ms: other.rotator_degrees_per_ms.or(self.rotator_degrees_per_ms),
            actuator_max_extension_mm: other
                .actuator_max_extension_mm
                .or(self.actuator_max_extension_mm),
            actuator_travel_mm_per_ms: other
                .actuator_travel_mm_per_ms
                .or(self.actuator_travel_mm_per_ms),
            safety_margin: other.safety_margin.or(self.safety_margin),
            request_poll_interval_ms: other
                .request_poll_interval_ms
                .or(self.request_poll_interval_ms),
            klipper_extrude_scale: other.klipper_extrude_scale.or(self.klipper_extrude_scale),
            save_folder: other.save_folder.or(self.save_folder),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GpioSettings {
    pub enabled: bool,
    pub library: String,
    pub chip: String,
}

/// Timing and retention knobs for the control loop.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub loop_interval_ms: u64,
    pub save_interval_ms: u64,
    pub snapshot_interval_ms: u64,
    pub history_limit: usize,
}

#[derive(Debug, Clone)]
pub struct RotatorSettings {
    pub steps_per_90_degrees: u32,
    pub degrees_per_ms: f64,
}

impl RotatorSettings {
    pub fn degrees_per_step(&self) -> f64 {
        90.0 / self.steps_per_90_degrees as f64
    }
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub poll_interval_ms: u64,
    pub extrude_scale: f64,
}

/// Fully resolved settings for one host.
#[derive(Debug, Clone)]
pub struct RigSettings {
    pub hostname: String,
    pub gpio: GpioSettings,
    pub service: ServiceSettings,
    pub rotator: RotatorSettings,
    pub actuator: ActuatorLimits,
    pub bridge: BridgeSettings,
    pub save_folder: PathBuf,
}

impl RigSettings {
    /// Resolve raw settings, filling anything unset with the rig defaults.
    /// Save folder falls back to the user data directory.
    pub fn resolve(hostname: &str, raw: HostSettings) -> Result<Self> {
        let save_folder = match env::var("BIOPRINT_SAVE_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => match raw.save_folder {
                Some(folder) => folder,
                None => default_save_folder()?,
            },
        };

        let settings = Self {
            hostname: hostname.to_string(),
            gpio: GpioSettings {
                enabled: raw.gpio_enabled.unwrap_or(false),
                library: raw.gpio_library.unwrap_or_else(|| "gpiod".to_string()),
                chip: raw.gpio_chip.unwrap_or_else(|| "/dev/gpiochip0".to_string()),
            },
            service: ServiceSettings {
                loop_interval_ms: raw.loop_interval_ms.unwrap_or(8),
                save_interval_ms: raw.save_interval_ms.unwrap_or(2000),
                snapshot_interval_ms: raw.snapshot_interval_ms.unwrap_or(100),
                history_limit: raw.history_limit.unwrap_or(100),
            },
            rotator: RotatorSettings {
                steps_per_90_degrees: raw.rotator_steps_per_90_degrees.unwrap_or(235),
                // One half-step per default tick
                degrees_per_ms: raw
                    .rotator_degrees_per_ms
                    .unwrap_or(90.0 / 235.0 / 2.0 / 8.0),
            },
            actuator: ActuatorLimits {
                max_extension_mm: raw.actuator_max_extension_mm.unwrap_or(150.0),
                travel_mm_per_ms: raw.actuator_travel_mm_per_ms.unwrap_or(0.006),
                safety_margin: raw.safety_margin.unwrap_or(0.05),
            },
            bridge: BridgeSettings {
                poll_interval_ms: raw.request_poll_interval_ms.unwrap_or(100),
                extrude_scale: raw.klipper_extrude_scale.unwrap_or(1.0),
            },
            save_folder,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Fail fast on values that would make motion math meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.service.loop_interval_ms == 0 {
            return Err(anyhow!("LOOP_INTERVAL_MS must be positive"));
        }
        if self.service.history_limit == 0 {
            return Err(anyhow!("HISTORY_LIMIT must be positive"));
        }
        if self.rotator.steps_per_90_degrees == 0 {
            return Err(anyhow!("ROTATOR_STEPS_PER_90_DEGREES must be positive"));
        }
        if !(self.rotator.degrees_per_ms > 0.0) {
            return Err(anyhow!(
                "ROTATOR_DEGREES_PER_MS must be positive, got {}",
                self.rotator.degrees_per_ms
            ));
        }
        if !(self.actuator.max_extension_mm > 0.0) {
            return Err(anyhow!(
                "ACTUATOR_MAX_EXTENSION_MM must be positive, got {}",
                self.actuator.max_extension_mm
            ));
        }
        if !(self.actuator.travel_mm_per_ms > 0.0) {
            return Err(anyhow!(
                "ACTUATOR_TRAVEL_MM_PER_MS must be positive, got {}",
                self.actuator.travel_mm_per_ms
            ));
        }
        if !(0.0..1.0).contains(&self.actuator.safety_margin) {
            return Err(anyhow!(
                "SAFETY_MARGIN must be within [0, 1), got {}",
                self.actuator.safety_margin
            ));
        }
        if !(self.bridge.extrude_scale > 0.0) {
            return Err(anyhow!(
                "KLIPPER_EXTRUDE_SCALE must be positive, got {}",
                self.bridge.extrude_scale
            ));
        }
        Ok(())
    }

    pub fn save_file(&self) -> PathBuf {
        self.save_folder.join("state.json")
    }
}

/// Default YAML location: next to Cargo.toml.
pub fn default_config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("bioprint_driver.yaml")
}

/// Load settings for `hostname` from `yaml_path`.
/// Fails loudly if the YAML is missing or malformed.
pub fn load_rig_settings(yaml_path: &Path, hostname: &str) -> Result<RigSettings> {
    // Ensure .env is loaded once here so all env-based config is centralized
    let _ = dotenv();

    let file = File::open(yaml_path)
        .map_err(|e| anyhow!("Missing required bioprint_driver.yaml at {:?}: {}", yaml_path, e))?;
    let yaml: serde_yaml::Value = serde_yaml::from_reader(file)?;
    let raw = host_settings_from_yaml(&yaml, hostname)?;
    let settings = RigSettings::resolve(hostname, raw)?;

    log::info!(target: "config_loader", "Rig settings for '{}': gpio={} loop={}ms save_folder={:?}",
               hostname, settings.gpio.enabled, settings.service.loop_interval_ms, settings.save_folder);
    Ok(settings)
}

/// Merge the `common` block with the first host block matching `hostname`.
pub fn host_settings_from_yaml(yaml: &serde_yaml::Value, hostname: &str) -> Result<HostSettings> {
    let common = match yaml.get("common") {
        Some(block) => serde_yaml::from_value::<HostSettings>(block.clone())
            .map_err(|e| anyhow!("Invalid `common` block in bioprint_driver.yaml: {}", e))?,
        None => HostSettings::default(),
    };

    // Search across known OS sections to find a host block matching hostname
    let mut host_block: Option<&serde_yaml::Value> = None;
    for os_key in OS_SECTIONS.iter() {
        if let Some(os_map) = yaml.get(*os_key).and_then(|v| v.as_mapping()) {
            for (k, v) in os_map.iter() {
                if k.as_str() == Some(hostname) {
                    host_block = Some(v);
                    break;
                }
            }
        }
        if host_block.is_some() {
            break;
        }
    }

    match host_block {
        Some(block) => {
            let host = serde_yaml::from_value::<HostSettings>(block.clone()).map_err(|e| {
                anyhow!("Invalid host block for '{}' in bioprint_driver.yaml: {}", hostname, e)
            })?;
            Ok(common.overlay(host))
        }
        None => {
            log::warn!(target: "config_loader", "No host entry for '{}' in bioprint_driver.yaml, using `common` only", hostname);
            Ok(common)
        }
    }
}

/// User data directory for the save file, created if missing.
pub fn default_save_folder() -> Result<PathBuf> {
    let base = if let Some(dir) = non_empty_env("XDG_DATA_HOME") {
        PathBuf::from(dir).join("bioprintdriver")
    } else if let Some(dir) = non_empty_env("HOME") {
        PathBuf::from(dir).join(".bioprintdriver")
    } else if let Some(dir) = non_empty_env("APPDATA") {
        PathBuf::from(dir).join("bioprintdriver")
    } else {
        return Err(anyhow!(
            "User directory not found as any of these env vars: XDG_DATA_HOME, HOME, APPDATA"
        ));
    };
    Ok(base)
}

/// Create the save folder if needed.
pub fn ensure_save_folder(folder: &Path) -> Result<()> {
    std::fs::create_dir_all(folder)
        .map_err(|e| anyhow!("Could not create save folder {:?}: {}", folder, e))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}
