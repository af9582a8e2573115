/// File-based request bridge between the printer firmware and the rig.
///
/// The firmware side (`bioprint_request`) writes `request.json` and waits
/// for `response.json`. The service side polls for requests newer than its
/// watermark, enqueues their commands as one batch, and answers once the
/// last command of the batch (the caboose) has settled. The watermark and
/// the in-flight batch are persisted so a restart neither replays a handled
/// request nor forgets one still in flight.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::command::{CommandQueue, CommandSpecifics, Ordinal, Submitter};
use crate::service::ServiceHandle;
use crate::state::write_atomically;
use crate::util::UnixMillis;

pub const REQUEST_FILE: &str = "request.json";
pub const RESPONSE_FILE: &str = "response.json";
pub const REQUEST_LOG_FILE: &str = "request.log";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub timestamp: UnixMillis,
    pub commands: Vec<CommandSpecifics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub completed_request_timestamp: UnixMillis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub timestamp: UnixMillis,
    pub caboose_ordinal: Ordinal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeLedger {
    pub watermark: UnixMillis,
    pub pending: Option<PendingRequest>,
}

impl BridgeLedger {
    pub fn accepts(&self, timestamp: UnixMillis) -> bool {
        timestamp > self.watermark && self.pending.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Enqueued; `caboose` is None for an empty batch, which is complete
    /// as soon as it is accepted.
    Accepted { caboose: Option<Ordinal> },
    Ignored,
}

/// Enqueue `request` as one batch if it is newer than anything handled so
/// far and nothing is in flight.
pub fn accept_request(
    ledger: &mut BridgeLedger,
    commands: &mut CommandQueue,
    request: Request,
    now: UnixMillis,
) -> Acceptance {
    if !ledger.accepts(request.timestamp) {
        return Acceptance::Ignored;
    }
    let mut caboose = None;
    for specifics in request.commands {
        caboose = Some(commands.enqueue(Submitter::Klipper, specifics, now));
    }
    ledger.watermark = request.timestamp;
    ledger.pending = caboose.map(|caboose_ordinal| PendingRequest {
        timestamp: request.timestamp,
        caboose_ordinal,
    });
    Acceptance::Accepted { caboose }
}

/// Clear the in-flight batch once its response has been written.
pub fn complete_request(ledger: &mut BridgeLedger, timestamp: UnixMillis) -> bool {
    match ledger.pending {
        Some(pending) if pending.timestamp == timestamp => {
            ledger.pending = None;
            true
        }
        _ => false,
    }
}

/// Read the request file. Missing or malformed files mean "no request yet".
pub fn read_request(path: &Path) -> Option<Request> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            log::debug!(target: "request_handling", "No request at {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(request) => Some(request),
        Err(e) => {
            log::debug!(target: "request_handling", "Unreadable request at {}: {}", path.display(), e);
            None
        }
    }
}

pub fn read_response(path: &Path) -> Option<Response> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    write_atomically(path, text.as_bytes())
}

pub fn write_request(path: &Path, request: &Request) -> Result<()> {
    write_json(path, request)
}

pub fn write_response(path: &Path, response: &Response) -> Result<()> {
    write_json(path, response)
}

/// Append one diagnostic line to the request log.
pub fn append_request_log(path: &Path, line: &str) -> Result<()> {
    if let Some(folder) = path.parent() {
        fs::create_dir_all(folder)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Firmware-side wait: poll until the response names `timestamp`.
/// `timeout` of None waits forever.
pub fn wait_for_response(
    path: &Path,
    timestamp: UnixMillis,
    poll_interval: Duration,
    timeout: Option<Duration>,
) -> Result<Response> {
    let started = Instant::now();
    loop {
        if let Some(response) = read_response(path) {
            if response.completed_request_timestamp == timestamp {
                return Ok(response);
            }
        }
        if let Some(timeout) = timeout {
            if started.elapsed() >= timeout {
                return Err(anyhow!(
                    "Timed out after {:?} waiting for request {} to complete",
                    timeout,
                    timestamp
                ));
            }
        }
        thread::sleep(poll_interval);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Idle,
    Accepted(UnixMillis),
    Responded(UnixMillis),
}

/// Service-side poller.
pub struct RequestBridge {
    handle: ServiceHandle,
    request_path: PathBuf,
    response_path: PathBuf,
    poll_interval: Duration,
}

impl RequestBridge {
    pub fn new(handle: ServiceHandle, save_folder: &Path, poll_interval_ms: u64) -> Self {
        Self {
            handle,
            request_path: save_folder.join(REQUEST_FILE),
            response_path: save_folder.join(RESPONSE_FILE),
            poll_interval: Duration::from_millis(poll_interval_ms),
        }
    }

    fn respond(&self, timestamp: UnixMillis) -> Result<()> {
        write_response(
            &self.response_path,
            &Response {
                completed_request_timestamp: timestamp,
            },
        )?;
        log::info!(target: "request_handling", "Completed request {}", timestamp);
        Ok(())
    }

    /// One poll: answer a settled batch, or pick up a new request.
    pub fn poll_once(&mut self) -> Result<PollOutcome> {
        let Some(snapshot) = self.handle.snapshot() else {
            return Ok(PollOutcome::Idle);
        };
        let ledger = &snapshot.state.request_handling;

        if let Some(pending) = ledger.pending {
            if snapshot.state.commands.is_settled(pending.caboose_ordinal) {
                self.respond(pending.timestamp)?;
                self.handle.complete_request(pending.timestamp)?;
                return Ok(PollOutcome::Responded(pending.timestamp));
            }
            return Ok(PollOutcome::Idle);
        }

        let Some(request) = read_request(&self.request_path) else {
            return Ok(PollOutcome::Idle);
        };
        if !ledger.accepts(request.timestamp) {
            return Ok(PollOutcome::Idle);
        }
        let timestamp = request.timestamp;
        let count = request.commands.len();
        match self.handle.accept_request(request)? {
            Acceptance::Accepted { caboose: None } => {
                self.respond(timestamp)?;
                Ok(PollOutcome::Responded(timestamp))
            }
            Acceptance::Accepted { caboose: Some(caboose) } => {
                log::info!(
                    target: "request_handling",
                    "Accepted request {} with {} commands, caboose #{}",
                    timestamp,
                    count,
                    caboose
                );
                Ok(PollOutcome::Accepted(timestamp))
            }
            // Snapshot was behind the service
            Acceptance::Ignored => Ok(PollOutcome::Idle),
        }
    }

    /// Poll until the service shuts down.
    pub fn run(mut self) -> Result<()> {
        log::info!(
            target: "request_handling",
            "Watching {} every {:?}",
            self.request_path.display(),
            self.poll_interval
        );
        while !self.handle.is_shutdown() {
            if let Err(e) = self.poll_once() {
                if self.handle.is_shutdown() {
                    break;
                }
                log::error!(target: "request_handling", "Bridge poll failed: {}", e);
            }
            thread::sleep(self.poll_interval);
        }
        log::info!(target: "request_handling", "Bridge stopped");
        Ok(())
    }
}
