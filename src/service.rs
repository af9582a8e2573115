/// The control loop.
///
/// `Service` owns the persistent state, the calibration jobs and the GPIO
/// board, and is the only thing that mutates them. Other threads hold a
/// `ServiceHandle`: they send `ServiceRequest`s through a mailbox that is
/// drained at the top of every tick, and read the `StateSnapshot` the loop
/// publishes after structural changes and at a fixed interval.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::calibration::{
    calibration_is_complete, drive_actuator, processing_is_allowed_to_start,
    record_plunger_position, set_current_syringe, CalibrationError, Calibrator,
};
use crate::command::{
    CommandSpecifics, EnqueuedCommand, Ordinal, Outcome, QueueError, Submitter, SyringeNumber,
};
use crate::config_loader::RigSettings;
use crate::gpio::{GpioBoard, PinError, PinName};
use crate::processing::{advance_command, MotionContext, ProcessingError, StepOutcome};
use crate::request_handling::{accept_request, complete_request, Acceptance, Request};
use crate::state::{
    save_state_to_disk, AlertKind, PersistentState, RuntimeContext, SnapshotSlot, StateSnapshot,
};
use crate::util::{unix_time_ms, UnixMillis};

/// How long a caller waits for the loop to answer.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

pub enum ServiceRequest {
    Enqueue {
        by: Submitter,
        specifics: CommandSpecifics,
        reply: Sender<Result<Ordinal, QueueError>>,
    },
    CancelLast {
        reply: Sender<Result<EnqueuedCommand, QueueError>>,
    },
    SetProcessing {
        enabled: bool,
        reply: Sender<bool>,
    },
    HomeActuator {
        reply: Sender<Result<bool, PinError>>,
    },
    Handcrank {
        relative_mm: f64,
        reply: Sender<Result<bool, CalibrationError>>,
    },
    RecordPlungerPosition {
        syringe: SyringeNumber,
        reply: Sender<Result<f64, CalibrationError>>,
    },
    SetCurrentSyringe {
        syringe: SyringeNumber,
    },
    SetCalibrationModal {
        open: bool,
    },
    ConfigurePin {
        name: PinName,
        number: u8,
        direction: String,
        reply: Sender<Result<(), PinError>>,
    },
    ClearHistory,
    SetUiScale {
        scale: f64,
    },
    AcceptRequest {
        request: Request,
        reply: Sender<Acceptance>,
    },
    CompleteRequest {
        timestamp: UnixMillis,
    },
}

/// Read a snapshot from the slot without consuming it.
/// Returns None if nothing was published yet or the lock is poisoned.
pub fn read_snapshot_from_slot(slot: &SnapshotSlot) -> Option<StateSnapshot> {
    if let Ok(slot_guard) = slot.lock() {
        slot_guard.as_ref().cloned()
    } else {
        None
    }
}

/// Cheap, cloneable access to a running service.
#[derive(Clone)]
pub struct ServiceHandle {
    sender: Sender<ServiceRequest>,
    snapshot_slot: SnapshotSlot,
    shutdown: Arc<AtomicBool>,
}

impl ServiceHandle {
    fn send(&self, request: ServiceRequest) -> Result<()> {
        self.sender
            .send(request)
            .map_err(|_| anyhow!("Control loop is not running"))
    }

    fn call<T>(&self, build: impl FnOnce(Sender<T>) -> ServiceRequest) -> Result<T> {
        let (reply, answer) = bounded(1);
        self.send(build(reply))?;
        answer
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| anyhow!("Control loop did not answer within {:?}", REPLY_TIMEOUT))
    }

    pub fn snapshot(&self) -> Option<StateSnapshot> {
        read_snapshot_from_slot(&self.snapshot_slot)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn enqueue(&self, by: Submitter, specifics: CommandSpecifics) -> Result<Ordinal> {
        Ok(self.call(|reply| ServiceRequest::Enqueue {
            by,
            specifics,
            reply,
        })??)
    }

    pub fn cancel_last(&self) -> Result<EnqueuedCommand> {
        Ok(self.call(|reply| ServiceRequest::CancelLast { reply })??)
    }

    /// Returns whether processing is enabled afterwards.
    pub fn set_processing(&self, enabled: bool) -> Result<bool> {
        self.call(|reply| ServiceRequest::SetProcessing { enabled, reply })
    }

    /// Returns false if another calibration operation was already running.
    pub fn home_actuator(&self) -> Result<bool> {
        Ok(self.call(|reply| ServiceRequest::HomeActuator { reply })??)
    }

    pub fn handcrank(&self, relative_mm: f64) -> Result<bool> {
        Ok(self.call(|reply| ServiceRequest::Handcrank { relative_mm, reply })??)
    }

    pub fn record_plunger_position(&self, syringe: SyringeNumber) -> Result<f64> {
        Ok(self.call(|reply| ServiceRequest::RecordPlungerPosition { syringe, reply })??)
    }

    pub fn set_current_syringe(&self, syringe: SyringeNumber) -> Result<()> {
        self.send(ServiceRequest::SetCurrentSyringe { syringe })
    }

    pub fn set_calibration_modal(&self, open: bool) -> Result<()> {
        self.send(ServiceRequest::SetCalibrationModal { open })
    }

    pub fn configure_pin(&self, name: PinName, number: u8, direction: &str) -> Result<()> {
        let direction = direction.to_string();
        Ok(self.call(|reply| ServiceRequest::ConfigurePin {
            name,
            number,
            direction,
            reply,
        })??)
    }

    pub fn clear_history(&self) -> Result<()> {
        self.send(ServiceRequest::ClearHistory)
    }

    pub fn set_ui_scale(&self, scale: f64) -> Result<()> {
        self.send(ServiceRequest::SetUiScale { scale })
    }

    pub fn accept_request(&self, request: Request) -> Result<Acceptance> {
        self.call(|reply| ServiceRequest::AcceptRequest { request, reply })
    }

    pub fn complete_request(&self, timestamp: UnixMillis) -> Result<()> {
        self.send(ServiceRequest::CompleteRequest { timestamp })
    }
}

pub struct Service {
    settings: RigSettings,
    save_file: PathBuf,
    state: PersistentState,
    runtime: RuntimeContext,
    calibrator: Calibrator,
    board: GpioBoard,
    receiver: Receiver<ServiceRequest>,
    snapshot_slot: SnapshotSlot,
    shutdown: Arc<AtomicBool>,
    dirty: bool,
    structural_change: bool,
    last_save: Instant,
    last_publish: Instant,
}

impl Service {
    pub fn new(
        settings: RigSettings,
        state: PersistentState,
        board: GpioBoard,
        shutdown: Arc<AtomicBool>,
    ) -> (Self, ServiceHandle) {
        let (sender, receiver) = unbounded();
        let snapshot_slot: SnapshotSlot = Arc::new(Mutex::new(None));
        let handle = ServiceHandle {
            sender,
            snapshot_slot: Arc::clone(&snapshot_slot),
            shutdown: Arc::clone(&shutdown),
        };
        let service = Self {
            save_file: settings.save_file(),
            calibrator: Calibrator::new(settings.actuator),
            settings,
            state,
            runtime: RuntimeContext::default(),
            board,
            receiver,
            snapshot_slot,
            shutdown,
            dirty: false,
            structural_change: true,
            last_save: Instant::now(),
            last_publish: Instant::now(),
        };
        (service, handle)
    }

    pub fn state(&self) -> &PersistentState {
        &self.state
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    /// Bring the hardware to a known state and recover from the previous
    /// run. Commands left mid-motion are not resumed: their physical
    /// position is unknown, so they go to history as interrupted.
    pub fn startup(&mut self) -> Result<()> {
        self.board.setup_pins(&mut self.state.pins)?;
        let now = unix_time_ms();
        let discarded = self
            .state
            .commands
            .discard_interrupted(now, self.settings.service.history_limit);
        for ordinal in &discarded {
            log::warn!(
                target: "service",
                "Command #{} was interrupted by the last shutdown and will not be resumed",
                ordinal
            );
        }
        self.persist();
        self.publish_snapshot(true);
        log::info!(
            target: "service",
            "Ready: {} queued, {} in history, hardware {}",
            self.state.commands.queue.len(),
            self.state.commands.history.len(),
            if self.board.exist { "enabled" } else { "simulated" }
        );
        Ok(())
    }

    /// One control loop iteration, excluding persistence and publishing.
    pub fn tick(&mut self, delta_ms: f64) -> Result<()> {
        let now = unix_time_ms();
        self.drain_mailbox(now)?;
        self.check_preconditions(now)?;

        if self.calibrator.is_busy() {
            let finished = self.calibrator.advance(
                delta_ms,
                &mut self.state.calibration,
                &mut self.board,
                &mut self.state.pins,
            )?;
            self.dirty = true;
            if finished {
                self.structural_change = true;
                self.persist();
            }
        } else if self.runtime.processing_enabled {
            self.process_head(delta_ms, now)?;
        }
        Ok(())
    }

    /// Tick at the configured interval until shutdown. Outputs are always
    /// zeroed and state persisted on the way out, even after an error.
    pub fn run(mut self) -> Result<()> {
        let interval_ms = self.settings.service.loop_interval_ms;
        let interval = Duration::from_millis(interval_ms);
        log::info!(target: "service", "Control loop running every {} ms", interval_ms);

        let mut last_tick = Instant::now();
        let result = loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break Ok(());
            }
            let tick_start = Instant::now();
            let delta_ms = tick_start.duration_since(last_tick).as_secs_f64() * 1000.0;
            last_tick = tick_start;
            self.runtime.stats.record(delta_ms, interval_ms as f64);

            if let Err(e) = self.tick(delta_ms) {
                log::error!(target: "service", "Control loop stopped: {}", e);
                break Err(e);
            }
            self.maybe_persist();
            self.publish_snapshot(false);

            let used = tick_start.elapsed();
            if used < interval {
                thread::sleep(interval - used);
            }
        };

        self.runtime.processing_enabled = false;
        if let Err(e) = self.board.zero_out_pins(&mut self.state.pins) {
            log::error!(target: "service", "Failed to zero outputs on shutdown: {}", e);
        }
        self.persist();
        self.publish_snapshot(true);
        // Let the bridge and console go too
        self.shutdown.store(true, Ordering::SeqCst);

        let stats = &self.runtime.stats;
        log::info!(
            target: "service",
            "Control loop exited after {} ticks, max delta {:.1} ms, {} overruns",
            stats.ticks,
            stats.max_delta_ms,
            stats.overruns
        );
        result
    }

    fn drain_mailbox(&mut self, now: UnixMillis) -> Result<()> {
        while let Ok(request) = self.receiver.try_recv() {
            self.handle_request(request, now)?;
        }
        Ok(())
    }

    fn handle_request(&mut self, request: ServiceRequest, now: UnixMillis) -> Result<()> {
        match request {
            ServiceRequest::Enqueue {
                by,
                specifics,
                reply,
            } => {
                let result = specifics.validate().map(|()| {
                    log::info!(target: "service", "{:?} enqueued {}", by, specifics);
                    self.state.commands.enqueue(by, specifics, now)
                });
                match &result {
                    Ok(_) => self.mark_structural(),
                    Err(e) => log::warn!(target: "service", "Refused {:?} command: {}", by, e),
                }
                reply.send(result).ok();
            }
            ServiceRequest::CancelLast { reply } => {
                let result = if self.runtime.processing_enabled {
                    Err(QueueError::ProcessingActive)
                } else {
                    self.state.commands.cancel_last()
                };
                if let Ok(cancelled) = &result {
                    log::info!(target: "service", "Cancelled #{}: {}", cancelled.ordinal, cancelled.specifics);
                    self.mark_structural();
                }
                reply.send(result).ok();
            }
            ServiceRequest::SetProcessing { enabled, reply } => {
                if enabled {
                    self.try_enable_processing(now);
                } else {
                    self.disable_processing()?;
                }
                reply.send(self.runtime.processing_enabled).ok();
            }
            ServiceRequest::HomeActuator { reply } => {
                let result = self.calibrator.home_actuator(
                    &mut self.state.calibration,
                    &mut self.board,
                    &mut self.state.pins,
                );
                if let Ok(true) = result {
                    self.mark_structural();
                }
                reply.send(result).ok();
            }
            ServiceRequest::Handcrank { relative_mm, reply } => {
                let result = self.calibrator.handcrank(
                    relative_mm,
                    &self.state.calibration,
                    &mut self.board,
                    &mut self.state.pins,
                );
                if let Ok(true) = result {
                    self.mark_structural();
                }
                reply.send(result).ok();
            }
            ServiceRequest::RecordPlungerPosition { syringe, reply } => {
                let result = record_plunger_position(
                    &mut self.state.calibration,
                    &self.calibrator.lock,
                    syringe,
                );
                if let Ok(position) = result {
                    log::info!(target: "service", "Plunger {} recorded at {:.3} mm", syringe, position);
                    self.mark_structural();
                }
                reply.send(result).ok();
            }
            ServiceRequest::SetCurrentSyringe { syringe } => {
                set_current_syringe(&mut self.state.calibration, syringe);
                self.mark_structural();
            }
            ServiceRequest::SetCalibrationModal { open } => {
                self.runtime.modal_open = open;
                self.mark_structural();
            }
            ServiceRequest::ConfigurePin {
                name,
                number,
                direction,
                reply,
            } => {
                let result = self
                    .board
                    .configure(&mut self.state.pins, name, number, &direction);
                if let Err(e) = &result {
                    self.runtime.alert(AlertKind::Configuration, e.to_string(), now);
                }
                self.mark_structural();
                reply.send(result).ok();
            }
            ServiceRequest::ClearHistory => {
                self.state.commands.clear_history();
                self.mark_structural();
            }
            ServiceRequest::SetUiScale { scale } => {
                if scale.is_finite() && scale > 0.0 {
                    self.state.ui_scale = scale;
                    self.mark_structural();
                } else {
                    log::warn!(target: "service", "Ignoring UI scale {}", scale);
                }
            }
            ServiceRequest::AcceptRequest { request, reply } => {
                let acceptance = accept_request(
                    &mut self.state.request_handling,
                    &mut self.state.commands,
                    request,
                    now,
                );
                if let Acceptance::Accepted { .. } = acceptance {
                    self.mark_structural();
                    self.persist();
                }
                reply.send(acceptance).ok();
            }
            ServiceRequest::CompleteRequest { timestamp } => {
                if complete_request(&mut self.state.request_handling, timestamp) {
                    self.mark_structural();
                    self.persist();
                }
            }
        }
        Ok(())
    }

    fn try_enable_processing(&mut self, now: UnixMillis) {
        if self.runtime.processing_enabled {
            return;
        }
        if processing_is_allowed_to_start(
            &self.state.calibration,
            &self.calibrator.lock,
            self.runtime.modal_open,
        ) {
            self.runtime.processing_enabled = true;
            log::info!(target: "service", "Processing started");
        } else {
            let reason = self.blocking_reason();
            self.runtime
                .alert(AlertKind::Precondition, format!("Cannot start processing: {}", reason), now);
        }
        self.mark_structural();
    }

    fn blocking_reason(&self) -> String {
        if self.calibrator.lock.is_held() {
            "a calibration operation is in progress".to_string()
        } else if self.runtime.modal_open {
            "the calibration window is open".to_string()
        } else {
            format!(
                "calibration is incomplete (missing {})",
                self.state.calibration.missing().join(", ")
            )
        }
    }

    fn disable_processing(&mut self) -> Result<()> {
        if !self.runtime.processing_enabled {
            return Ok(());
        }
        self.runtime.processing_enabled = false;
        self.halt_motion()?;
        log::info!(target: "service", "Processing stopped");
        self.mark_structural();
        Ok(())
    }

    /// Release the actuator if the head command was driving it. The rotator
    /// only moves on step toggles and needs nothing.
    fn halt_motion(&mut self) -> Result<()> {
        let driving = matches!(
            self.state.commands.head(),
            Some(command) if command.is_started()
                && matches!(command.specifics, CommandSpecifics::Actuate { .. })
        );
        if driving && !self.calibrator.is_busy() {
            drive_actuator(&mut self.board, &mut self.state.pins, 0.0)?;
        }
        Ok(())
    }

    fn check_preconditions(&mut self, now: UnixMillis) -> Result<()> {
        if self.runtime.processing_enabled
            && !calibration_is_complete(&self.state.calibration, &self.calibrator.lock)
        {
            let reason = self.blocking_reason();
            self.disable_processing()?;
            self.runtime
                .alert(AlertKind::Precondition, format!("Processing stopped: {}", reason), now);
        }
        Ok(())
    }

    fn process_head(&mut self, delta_ms: f64, now: UnixMillis) -> Result<()> {
        let Some(command) = self.state.commands.head_mut() else {
            return Ok(());
        };
        let was_started = command.is_started();
        let mut ctx = MotionContext {
            board: &mut self.board,
            pins: &mut self.state.pins,
            calibration: &mut self.state.calibration,
            rotator: &self.settings.rotator,
            actuator: &self.settings.actuator,
        };
        let result = advance_command(command, delta_ms, now, &mut ctx);
        let ordinal = command.ordinal;
        if !was_started && command.is_started() {
            self.structural_change = true;
        }

        match result {
            Ok(StepOutcome::Idle) => {}
            Ok(StepOutcome::InProgress) => self.dirty = true,
            Ok(StepOutcome::Finished) => {
                let limit = self.settings.service.history_limit;
                if let Some(finished) = self.state.commands.finish_head(now, Outcome::Completed, limit) {
                    log::info!(
                        target: "service",
                        "Finished #{}: {} after {} ms",
                        ordinal,
                        finished.specifics,
                        finished.finished_at - finished.started_at
                    );
                }
                self.mark_structural();
                self.persist();
            }
            Err(ProcessingError::Pin(e)) => return Err(e.into()),
            Err(e) => {
                let kind = match e {
                    ProcessingError::SafetyLimit { .. } => AlertKind::Safety,
                    _ => AlertKind::Precondition,
                };
                self.runtime.processing_enabled = false;
                self.board.zero_out_pins(&mut self.state.pins)?;
                self.runtime
                    .alert(kind, format!("Command #{} halted: {}", ordinal, e), now);
                self.mark_structural();
            }
        }
        Ok(())
    }

    fn mark_structural(&mut self) {
        self.dirty = true;
        self.structural_change = true;
    }

    fn persist(&mut self) {
        match save_state_to_disk(&self.save_file, &self.state) {
            Ok(()) => {
                self.dirty = false;
                self.last_save = Instant::now();
            }
            Err(e) => log::error!(
                target: "service",
                "Failed to save state to {}: {}",
                self.save_file.display(),
                e
            ),
        }
    }

    fn maybe_persist(&mut self) {
        let interval = Duration::from_millis(self.settings.service.save_interval_ms);
        if self.dirty && self.last_save.elapsed() >= interval {
            self.persist();
        }
    }

    fn publish_snapshot(&mut self, force: bool) {
        let interval = Duration::from_millis(self.settings.service.snapshot_interval_ms);
        if !force && !self.structural_change && self.last_publish.elapsed() < interval {
            return;
        }
        let snapshot = StateSnapshot {
            taken_at: unix_time_ms(),
            state: self.state.clone(),
            processing_enabled: self.runtime.processing_enabled,
            modal_open: self.runtime.modal_open,
            calibration_lock_held: self.calibrator.lock.is_held(),
            calibration_job: self.calibrator.job.clone(),
            calibration_complete: calibration_is_complete(
                &self.state.calibration,
                &self.calibrator.lock,
            ),
            alerts: self.runtime.alerts.iter().cloned().collect(),
            stats: self.runtime.stats.clone(),
        };
        if let Ok(mut slot) = self.snapshot_slot.lock() {
            *slot = Some(snapshot);
        }
        self.structural_change = false;
        self.last_publish = Instant::now();
    }
}
