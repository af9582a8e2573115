/// Firmware-side request client
///
/// Invoked by printer firmware macros as `bioprint_request <G-code> [params...]`.
/// Translates the code into rig commands, drops them in the request file
/// and blocks until the service reports the batch complete.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use gethostname::gethostname;

use bioprintdriver::config_loader::{default_config_path, load_rig_settings};
use bioprintdriver::gcode::translate;
use bioprintdriver::request_handling::{
    append_request_log, wait_for_response, write_request, Request, REQUEST_FILE,
    REQUEST_LOG_FILE, RESPONSE_FILE,
};
use bioprintdriver::util::unix_time_ms;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Rig settings file (defaults to bioprint_driver.yaml next to Cargo.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Give up waiting after this many seconds (default: wait forever)
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// G-code and its parameters, e.g. `G1 E1.5`
    #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
    gcode: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();

    let argv: Vec<String> = std::env::args().collect();
    let args = Args::parse();
    let hostname = gethostname().to_string_lossy().to_string();
    let config_path = args.config.unwrap_or_else(default_config_path);
    let settings = load_rig_settings(&config_path, &hostname)?;
    let folder = settings.save_folder;

    append_request_log(
        &folder.join(REQUEST_LOG_FILE),
        &format!("Invoked with argv: {:?}", argv),
    )?;

    let commands = translate(&args.gcode, settings.bridge.extrude_scale)?;
    let timestamp = unix_time_ms();
    write_request(&folder.join(REQUEST_FILE), &Request { timestamp, commands })?;

    wait_for_response(
        &folder.join(RESPONSE_FILE),
        timestamp,
        Duration::from_millis(100),
        args.timeout_secs.map(Duration::from_secs),
    )?;
    Ok(())
}
