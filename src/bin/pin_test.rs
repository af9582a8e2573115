/// Bench check for the rig's output pins
///
/// Loads the saved pin mappings and pulses each mapped output high for
/// `--hold-ms`, one at a time, so the wiring can be checked by eye.
/// Do not run while bioprint_service is running.
///
/// Run with: cargo run --bin pin_test --features gpiod

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use gethostname::gethostname;

use bioprintdriver::config_loader::{default_config_path, load_rig_settings};
use bioprintdriver::gpio::{Bit, GpioBoard, IoType, PinName};
use bioprintdriver::state::load_state_from_disk;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Rig settings file (defaults to bioprint_driver.yaml next to Cargo.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// How long each output stays high
    #[arg(long, default_value_t = 1000)]
    hold_ms: u64,
    /// Only pulse this pin (e.g. uv_light_2)
    #[arg(long)]
    pin: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    let hostname = gethostname().to_string_lossy().to_string();
    let config_path = args.config.unwrap_or_else(default_config_path);
    let settings = load_rig_settings(&config_path, &hostname)?;

    let save_file = settings.save_file();
    let (mut state, report) = load_state_from_disk(&save_file);
    report.log(&save_file);

    let only: Option<PinName> = args.pin.as_deref().map(str::parse).transpose()?;
    let outputs: Vec<PinName> = state
        .pins
        .iter()
        .filter(|(name, pin)| {
            pin.number.is_some()
                && pin.io_type == Some(IoType::Output)
                && only.map_or(true, |o| o == *name)
        })
        .map(|(name, _)| name)
        .collect();
    if outputs.is_empty() {
        return Err(anyhow!("No mapped output pins to test"));
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok();

    let mut board = GpioBoard::new(&settings.gpio)?;
    if !board.exist {
        log::warn!(target: "pin_test", "GPIO disabled for {}, pulses are simulated", hostname);
    }
    board.setup_pins(&mut state.pins)?;

    let hold = Duration::from_millis(args.hold_ms);
    for name in outputs {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let number = state.pins.get(name).number.unwrap_or_default();
        println!("{} (pin {}) high", name, number);
        board.write_pin(&mut state.pins, name, Bit::High)?;
        thread::sleep(hold);
        board.write_pin(&mut state.pins, name, Bit::Low)?;
    }

    board.zero_out_pins(&mut state.pins)?;
    println!("Done");
    Ok(())
}
