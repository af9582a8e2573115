/// Bioprint rig service
///
/// Runs the control loop, the firmware request bridge and the operator
/// console until Ctrl-C, `quit`, or end of input.
///
/// Run with: cargo run --bin bioprint_service --release

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Result};
use clap::Parser;
use gethostname::gethostname;

use bioprintdriver::config_loader::{default_config_path, ensure_save_folder, load_rig_settings};
use bioprintdriver::gpio::GpioBoard;
use bioprintdriver::operator::run_console;
use bioprintdriver::process_guard::{check_single_instance, parent_of, ProcessInfo};
use bioprintdriver::request_handling::RequestBridge;
use bioprintdriver::service::Service;
use bioprintdriver::state::load_state_from_disk;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Rig settings file (defaults to bioprint_driver.yaml next to Cargo.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the save folder from the settings file
    #[arg(long)]
    save_folder: Option<PathBuf>,
    /// Do not watch for firmware requests
    #[arg(long, default_value_t = false)]
    no_bridge: bool,
    /// Do not read operator commands from stdin
    #[arg(long, default_value_t = false)]
    no_console: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    let hostname = gethostname().to_string_lossy().to_string();
    let config_path = args.config.unwrap_or_else(default_config_path);
    let mut settings = load_rig_settings(&config_path, &hostname)?;
    if let Some(folder) = args.save_folder {
        settings.save_folder = folder;
    }
    ensure_save_folder(&settings.save_folder)?;

    let save_file = settings.save_file();
    let (mut state, report) = load_state_from_disk(&save_file);
    report.log(&save_file);

    let me = ProcessInfo::current();
    check_single_instance(state.process_info.as_ref(), &me, parent_of)?;
    state.process_info = Some(me);

    let board = GpioBoard::new(&settings.gpio)?;
    let poll_interval_ms = settings.bridge.poll_interval_ms;
    let save_folder = settings.save_folder.clone();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = shutdown.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })
        .ok();
    }

    let (mut service, handle) = Service::new(settings, state, board, shutdown.clone());
    service.startup()?;
    let service_thread = thread::spawn(move || service.run());

    let bridge_thread = if args.no_bridge {
        None
    } else {
        let bridge = RequestBridge::new(handle.clone(), &save_folder, poll_interval_ms);
        Some(thread::spawn(move || bridge.run()))
    };

    // Detached: a blocking stdin read must not hold up shutdown
    if !args.no_console {
        let console_handle = handle.clone();
        thread::spawn(move || {
            let stdin = io::stdin();
            if let Err(e) = run_console(&console_handle, stdin.lock(), io::stdout()) {
                log::error!(target: "operator", "Console failed: {}", e);
                console_handle.shutdown();
            }
        });
    }

    let result = service_thread
        .join()
        .map_err(|_| anyhow!("Control loop thread panicked"))?;
    handle.shutdown();
    if let Some(bridge_thread) = bridge_thread {
        bridge_thread
            .join()
            .map_err(|_| anyhow!("Request bridge thread panicked"))??;
    }
    result
}
