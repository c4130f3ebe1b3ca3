//! The DSSC control device.
//!
//! One actor owns the remote session and all mutable device state.
//! Callers talk to it through [`ControlHandle`]: commands travel over an
//! mpsc channel with a oneshot reply each, observable values (fused state,
//! status line, measurement number) are watch channels, and completed
//! measurement points fan out over a broadcast channel.
//!
//! Background work (state fusion, lock watchdog, a running sweep) lives in
//! spawned tasks that report back over an internal event channel, so the
//! actor only blocks on hardware during explicit remote calls.

pub mod orchestrator;
pub mod session;

use crate::aggregator::{call_many, connect_session, Session};
use crate::config::ControlSettings;
use crate::error::{AppResult, ControlError};
use crate::fusion::{lock_watchdog, state_fusion_loop, Fusion, WatchdogEvent};
use crate::middleware::{DeviceState, HubHandle, RemoteDevice, Value};
use orchestrator::{run_sweep, SweepContext};
pub use orchestrator::SweepRequest;
use serde::{Deserialize, Serialize};
use session::MeasurementRecord;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 64;
const RECORD_BUFFER: usize = 256;
const ALL_OFF_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Operator-tunable acquisition parameters, applied at sweep start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// Trains acquired per measurement point.
    pub num_burst_trains: u64,
    pub num_frames_to_send_out: u64,
    pub num_preburst_vetos: u64,
    /// One DAQ run for the whole sweep instead of one per point.
    pub single_run: bool,
    /// Bracket acquisition in DAQ runs at all.
    pub save_data: bool,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            num_burst_trains: 20,
            num_frames_to_send_out: 400,
            num_preburst_vetos: 10,
            single_run: false,
            save_data: true,
        }
    }
}

/// The power-procedure steps the control device exposes as slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSlot {
    AsicsOn,
    HvOn,
    PlcOn,
    SourceOn,
    SourceOff,
    PlcOff,
    HvOff,
    AsicsOff,
}

impl PowerSlot {
    pub fn slot_name(&self) -> &'static str {
        match self {
            PowerSlot::AsicsOn => "switchAsicsOn",
            PowerSlot::HvOn => "switchHvOn",
            PowerSlot::PlcOn => "switchPlcOn",
            PowerSlot::SourceOn => "switchSourceOn",
            PowerSlot::SourceOff => "switchSourceOff",
            PowerSlot::PlcOff => "switchPlcOff",
            PowerSlot::HvOff => "switchHvOff",
            PowerSlot::AsicsOff => "switchAsicsOff",
        }
    }
}

/// Which power steps are valid from a given power-procedure state. The
/// procedure is a ladder; from each rung one can climb or descend.
fn allowed_power_slots(state: DeviceState) -> &'static [PowerSlot] {
    match state {
        DeviceState::Passive => &[PowerSlot::AsicsOn],
        DeviceState::Active => &[PowerSlot::HvOn, PowerSlot::AsicsOff],
        DeviceState::Started => &[PowerSlot::PlcOn, PowerSlot::HvOff],
        DeviceState::Engaged => &[PowerSlot::SourceOn, PowerSlot::PlcOff],
        DeviceState::On => &[PowerSlot::SourceOff],
        _ => &[],
    }
}

type Reply<T> = oneshot::Sender<T>;

enum ControlCommand {
    ConnectDevices(Reply<AppResult<()>>),
    InitPpts(Reply<AppResult<()>>),
    StartDataSending(Reply<AppResult<()>>),
    StopDataSending(Reply<AppResult<()>>),
    StartDummyData(Reply<AppResult<()>>),
    RunSweep(SweepRequest, Reply<AppResult<()>>),
    Abort(Reply<AppResult<()>>),
    Reset(Reply<AppResult<()>>),
    AllOff(Reply<AppResult<()>>),
    Power(PowerSlot, Reply<AppResult<()>>),
    SetSweepSettings(SweepSettings, Reply<AppResult<()>>),
    GetSweepSettings(Reply<SweepSettings>),
    Shutdown(Reply<()>),
}

enum DeviceEvent {
    Fused(Fusion),
    Watchdog(WatchdogEvent),
    SweepFinished(AppResult<PathBuf>),
}

/// Client handle to a running control device.
#[derive(Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<ControlCommand>,
    state: watch::Receiver<DeviceState>,
    status: watch::Receiver<String>,
    connected_quadrants: watch::Receiver<String>,
    last_lock_overwrite: watch::Receiver<String>,
    current_measurement_number: watch::Receiver<u64>,
    records: broadcast::Sender<MeasurementRecord>,
}

impl ControlHandle {
    pub fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<DeviceState> {
        self.state.clone()
    }

    pub fn status(&self) -> String {
        self.status.borrow().clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<String> {
        self.status.clone()
    }

    /// Summary of the connected quadrants, e.g. `Q1, Q3`.
    pub fn connected_quadrants(&self) -> String {
        self.connected_quadrants.borrow().clone()
    }

    /// Record of the last foreign lock the watchdog replaced.
    pub fn last_lock_overwrite(&self) -> String {
        self.last_lock_overwrite.borrow().clone()
    }

    pub fn current_measurement_number(&self) -> u64 {
        *self.current_measurement_number.borrow()
    }

    pub fn measurement_number_watch(&self) -> watch::Receiver<u64> {
        self.current_measurement_number.clone()
    }

    /// Subscribe to completed measurement points.
    pub fn records(&self) -> broadcast::Receiver<MeasurementRecord> {
        self.records.subscribe()
    }

    async fn request(
        &self,
        make: impl FnOnce(Reply<AppResult<()>>) -> ControlCommand,
    ) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ControlError::ActorGone)?;
        rx.await.map_err(|_| ControlError::ActorGone)?
    }

    pub async fn connect_devices(&self) -> AppResult<()> {
        self.request(ControlCommand::ConnectDevices).await
    }

    /// Run the PPT initialization sequence on every quadrant.
    pub async fn init_ppt_devices(&self) -> AppResult<()> {
        self.request(ControlCommand::InitPpts).await
    }

    pub async fn start_data_sending(&self) -> AppResult<()> {
        self.request(ControlCommand::StartDataSending).await
    }

    pub async fn stop_data_sending(&self) -> AppResult<()> {
        self.request(ControlCommand::StopDataSending).await
    }

    pub async fn start_dummy_data(&self) -> AppResult<()> {
        self.request(ControlCommand::StartDummyData).await
    }

    /// Start a sweep; the reply only covers starting it. Completion shows
    /// up in the state and status watches.
    pub async fn run_sweep(&self, request: SweepRequest) -> AppResult<()> {
        self.request(|reply| ControlCommand::RunSweep(request, reply))
            .await
    }

    pub async fn acquire_bursts(&self) -> AppResult<()> {
        self.run_sweep(SweepRequest::AcquireBursts).await
    }

    /// Request the running sweep to stop after the current point.
    pub async fn abort(&self) -> AppResult<()> {
        self.request(ControlCommand::Abort).await
    }

    pub async fn reset(&self) -> AppResult<()> {
        self.request(ControlCommand::Reset).await
    }

    /// Stop acquisition and power the detector all the way down.
    pub async fn all_off(&self) -> AppResult<()> {
        self.request(ControlCommand::AllOff).await
    }

    pub async fn power(&self, slot: PowerSlot) -> AppResult<()> {
        self.request(|reply| ControlCommand::Power(slot, reply))
            .await
    }

    pub async fn set_sweep_settings(&self, settings: SweepSettings) -> AppResult<()> {
        self.request(|reply| ControlCommand::SetSweepSettings(settings, reply))
            .await
    }

    pub async fn sweep_settings(&self) -> AppResult<SweepSettings> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ControlCommand::GetSweepSettings(tx))
            .await
            .map_err(|_| ControlError::ActorGone)?;
        rx.await.map_err(|_| ControlError::ActorGone)
    }

    /// Stop the actor, releasing all remote locks.
    pub async fn shutdown(&self) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ControlCommand::Shutdown(tx))
            .await
            .map_err(|_| ControlError::ActorGone)?;
        rx.await.map_err(|_| ControlError::ActorGone)
    }
}

/// Spawn the control device actor.
pub fn spawn_control(hub: HubHandle, settings: ControlSettings) -> ControlHandle {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let (records_tx, _) = broadcast::channel(RECORD_BUFFER);

    let state_tx = Arc::new(watch::channel(DeviceState::Unknown).0);
    let status_tx = Arc::new(watch::channel(String::new()).0);
    let connected_tx = watch::channel(String::new()).0;
    let lock_overwrite_tx = watch::channel(String::new()).0;
    let measurement_number_tx = Arc::new(watch::channel(0u64).0);

    let handle = ControlHandle {
        commands: command_tx,
        state: state_tx.subscribe(),
        status: status_tx.subscribe(),
        connected_quadrants: connected_tx.subscribe(),
        last_lock_overwrite: lock_overwrite_tx.subscribe(),
        current_measurement_number: measurement_number_tx.subscribe(),
        records: records_tx.clone(),
    };

    let sweep_settings = settings.sweep.clone();
    let actor = ControlActor {
        hub,
        settings,
        sweep_settings,
        session: None,
        last_fusion: None,
        state_tx,
        status_tx,
        connected_tx,
        lock_overwrite_tx,
        measurement_number_tx,
        records_tx,
        abort: Arc::new(AtomicBool::new(false)),
        sweeping: false,
        background: Vec::new(),
        sweep_task: None,
        event_tx,
    };
    tokio::spawn(actor.run(command_rx, event_rx));
    handle
}

struct ControlActor {
    hub: HubHandle,
    settings: ControlSettings,
    sweep_settings: SweepSettings,
    session: Option<Session>,
    last_fusion: Option<Fusion>,
    state_tx: Arc<watch::Sender<DeviceState>>,
    status_tx: Arc<watch::Sender<String>>,
    connected_tx: watch::Sender<String>,
    lock_overwrite_tx: watch::Sender<String>,
    measurement_number_tx: Arc<watch::Sender<u64>>,
    records_tx: broadcast::Sender<MeasurementRecord>,
    abort: Arc<AtomicBool>,
    sweeping: bool,
    background: Vec<JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
    event_tx: mpsc::Sender<DeviceEvent>,
}

impl ControlActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ControlCommand>,
        mut events: mpsc::Receiver<DeviceEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(ControlCommand::Shutdown(reply)) => {
                            self.shutdown().await;
                            reply.send(()).ok();
                            return;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
    }

    fn state(&self) -> DeviceState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: DeviceState) {
        self.state_tx.send_replace(state);
    }

    fn set_status(&self, line: impl Into<String>) {
        let line = line.into();
        info!("{line}");
        self.status_tx.send_replace(line);
    }

    /// Gate a slot on the fused device state. A refused slot is a no-op
    /// that shows up in the status line.
    fn ensure_allowed(&self, slot: &str, allowed: &[DeviceState]) -> AppResult<()> {
        let state = self.state();
        if allowed.contains(&state) {
            return Ok(());
        }
        let err = ControlError::NotAllowed {
            slot: slot.to_string(),
            state,
        };
        self.status_tx.send_replace(err.to_string());
        Err(err)
    }

    fn session(&self) -> AppResult<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| ControlError::Validation("Not connected to any PPT".into()))
    }

    async fn handle_command(&mut self, command: ControlCommand) {
        use DeviceState::*;
        match command {
            ControlCommand::ConnectDevices(reply) => {
                let result = match self.ensure_allowed("connectDevices", &[Unknown, Init, Off, On, Error]) {
                    Ok(()) => self.connect_devices().await,
                    Err(err) => Err(err),
                };
                reply.send(result).ok();
            }
            ControlCommand::InitPpts(reply) => {
                let result = match self.ensure_allowed("initPptDevices", &[Unknown, Off, On, Error]) {
                    Ok(()) => self.init_ppts().await,
                    Err(err) => Err(err),
                };
                reply.send(result).ok();
            }
            ControlCommand::StartDataSending(reply) => {
                let result = match self.ensure_allowed("startDataSending", &[On]) {
                    Ok(()) => self.fan_out_call("runXFEL").await,
                    Err(err) => Err(err),
                };
                reply.send(result).ok();
            }
            ControlCommand::StopDataSending(reply) => {
                let result = match self.ensure_allowed("stopDataSending", &[On, Acquiring, Started, Error]) {
                    Ok(()) => self.stop_data_sending().await,
                    Err(err) => Err(err),
                };
                reply.send(result).ok();
            }
            ControlCommand::StartDummyData(reply) => {
                let result = match self.ensure_allowed("startDummyData", &[On]) {
                    Ok(()) => self.fan_out_call("startAllChannelsDummyData").await,
                    Err(err) => Err(err),
                };
                reply.send(result).ok();
            }
            ControlCommand::RunSweep(request, reply) => {
                let result = match self.ensure_allowed("runMeasurement", &[On]) {
                    Ok(()) => self.start_sweep(request),
                    Err(err) => Err(err),
                };
                reply.send(result).ok();
            }
            ControlCommand::Abort(reply) => {
                self.abort.store(true, Ordering::SeqCst);
                self.set_status("Abort requested");
                reply.send(Ok(())).ok();
            }
            ControlCommand::Reset(reply) => {
                let result = self.ensure_allowed("reset", &[Error]).map(|()| {
                    let state = self
                        .last_fusion
                        .as_ref()
                        .map(|f| f.state)
                        .unwrap_or(DeviceState::Unknown);
                    self.set_state(state);
                    self.set_status("Reset");
                });
                reply.send(result).ok();
            }
            ControlCommand::AllOff(reply) => {
                let result = match self.ensure_allowed("allOff", &[On, Off, Acquiring, Started, Error]) {
                    Ok(()) => self.all_off().await,
                    Err(err) => Err(err),
                };
                reply.send(result).ok();
            }
            ControlCommand::Power(slot, reply) => {
                let result = self.power(slot).await;
                reply.send(result).ok();
            }
            ControlCommand::SetSweepSettings(settings, reply) => {
                let result = if self.sweeping {
                    let err = ControlError::NotAllowed {
                        slot: "setSweepSettings".into(),
                        state: self.state(),
                    };
                    self.status_tx.send_replace(err.to_string());
                    Err(err)
                } else {
                    self.apply_sweep_settings(settings).await
                };
                reply.send(result).ok();
            }
            ControlCommand::GetSweepSettings(reply) => {
                reply.send(self.sweep_settings.clone()).ok();
            }
            ControlCommand::Shutdown(_) => unreachable!("handled in run"),
        }
    }

    fn handle_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Fused(fusion) => {
                self.last_fusion = Some(fusion.clone());
                // A sweep owns the state while it runs; only a fused ERROR
                // breaks through.
                if self.sweeping && fusion.state != DeviceState::Error {
                    return;
                }
                self.set_state(fusion.state);
                if let Some(message) = fusion.message {
                    self.set_status(message);
                }
            }
            DeviceEvent::Watchdog(WatchdogEvent::LockOverridden(record)) => {
                self.lock_overwrite_tx.send_replace(record);
            }
            DeviceEvent::Watchdog(WatchdogEvent::Exhausted(record)) => {
                self.set_state(DeviceState::Error);
                self.set_status(record);
            }
            DeviceEvent::SweepFinished(result) => {
                self.sweeping = false;
                self.sweep_task = None;
                match result {
                    Ok(descriptor) => {
                        info!(descriptor = %descriptor.display(), "Sweep finished");
                        self.set_state(DeviceState::On);
                    }
                    Err(ControlError::Aborted) => self.set_state(DeviceState::On),
                    Err(err) => {
                        warn!(%err, "Sweep failed");
                        self.set_state(DeviceState::Error);
                    }
                }
            }
        }
    }

    /// Tear down any previous session and build a new one wholesale, then
    /// start fusion and (outside expert mode) the lock watchdog.
    async fn connect_devices(&mut self) -> AppResult<()> {
        self.stop_background();
        self.session = None;
        self.set_state(DeviceState::Changing);
        self.set_status("Connecting");

        let session = match connect_session(&self.hub, &self.settings).await {
            Ok(session) => session,
            Err(err) => {
                self.set_state(DeviceState::Error);
                self.set_status(err.to_string());
                return Err(err);
            }
        };
        self.connected_tx
            .send_replace(session.connected_summary());
        self.set_status(format!("Connected to {}", session.connected_summary()));

        let (fusion_tx, mut fusion_rx) = mpsc::channel(EVENT_BUFFER);
        self.background
            .push(tokio::spawn(state_fusion_loop(session.clone(), fusion_tx)));
        let events = self.event_tx.clone();
        self.background.push(tokio::spawn(async move {
            while let Some(fusion) = fusion_rx.recv().await {
                if events.send(DeviceEvent::Fused(fusion)).await.is_err() {
                    break;
                }
            }
        }));

        if !self.settings.expert_mode {
            let (watchdog_tx, mut watchdog_rx) = mpsc::channel(EVENT_BUFFER);
            self.background.push(tokio::spawn(lock_watchdog(
                session.clone(),
                self.settings.device_id.clone(),
                watchdog_tx,
            )));
            let events = self.event_tx.clone();
            self.background.push(tokio::spawn(async move {
                while let Some(event) = watchdog_rx.recv().await {
                    if events.send(DeviceEvent::Watchdog(event)).await.is_err() {
                        break;
                    }
                }
            }));
        }

        self.session = Some(session);
        Ok(())
    }

    fn start_sweep(&mut self, request: SweepRequest) -> AppResult<()> {
        let session = self.session()?.clone();
        self.abort.store(false, Ordering::SeqCst);
        let ctx = SweepContext {
            session,
            settings: self.settings.clone(),
            sweep: self.sweep_settings.clone(),
            abort: self.abort.clone(),
            status: self.status_tx.clone(),
            measurement_number: self.measurement_number_tx.clone(),
            records: self.records_tx.clone(),
        };
        let events = self.event_tx.clone();
        self.sweeping = true;
        self.set_state(DeviceState::Acquiring);
        self.sweep_task = Some(tokio::spawn(async move {
            let result = run_sweep(&ctx, request).await;
            events.send(DeviceEvent::SweepFinished(result)).await.ok();
        }));
        Ok(())
    }

    /// Initialize the quadrants that are in a state the init sequence may
    /// run from, then restore the cached acquisition settings the
    /// initialization wiped. A quadrant mid-acquisition is left alone.
    async fn init_ppts(&mut self) -> AppResult<()> {
        let targets: Vec<_> = self
            .session()?
            .ppt_handles()
            .into_iter()
            .filter(|handle| {
                matches!(
                    handle.state(),
                    DeviceState::Off | DeviceState::On | DeviceState::Stopped
                )
            })
            .collect();
        if !targets.is_empty() {
            call_many(
                &targets,
                "initSystem",
                Duration::from_secs(self.settings.connect_timeout_secs),
            )
            .await?;
        }
        self.apply_sweep_settings(self.sweep_settings.clone()).await
    }

    /// A quadrant in standalone mode needs a different stop slot than one
    /// acquiring from the timing system.
    async fn stop_data_sending(&self) -> AppResult<()> {
        let session = self.session()?;
        let timeout = Duration::from_secs(self.settings.connect_timeout_secs);
        let (standalone, acquiring): (Vec<_>, Vec<_>) = session
            .ppt_handles()
            .into_iter()
            .partition(|handle| handle.state() == DeviceState::Started);
        if !acquiring.is_empty() {
            call_many(&acquiring, "stopAcquisition", timeout).await?;
        }
        if !standalone.is_empty() {
            call_many(&standalone, "stopStandalone", timeout).await?;
        }
        Ok(())
    }

    async fn fan_out_call(&self, slot: &str) -> AppResult<()> {
        let session = self.session()?;
        call_many(
            &session.ppt_handles(),
            slot,
            Duration::from_secs(self.settings.connect_timeout_secs),
        )
        .await
    }

    async fn power(&self, slot: PowerSlot) -> AppResult<()> {
        let session = self.session()?;
        let procedure = session
            .power_procedure
            .as_ref()
            .ok_or(ControlError::PowerProcedureUnavailable)?;
        let power_state = procedure.state();
        let allowed = allowed_power_slots(power_state);
        if !allowed.contains(&slot) {
            let err = ControlError::NotAllowed {
                slot: slot.slot_name().to_string(),
                state: power_state,
            };
            let available: Vec<&str> = allowed.iter().map(|s| s.slot_name()).collect();
            // Tell the operator which step the ladder does allow from here.
            self.status_tx.send_replace(if available.is_empty() {
                err.to_string()
            } else {
                format!("{err}; available: {}", available.join(", "))
            });
            return Err(err);
        }
        procedure.call(slot.slot_name()).await?;
        Ok(())
    }

    async fn all_off(&mut self) -> AppResult<()> {
        let session = self.session()?.clone();
        self.abort.store(true, Ordering::SeqCst);
        // Best effort stop; powering down must not hang on a stuck PPT.
        if let Err(err) = call_many(
            &session.ppt_handles(),
            "stopAcquisition",
            ALL_OFF_STOP_TIMEOUT,
        )
        .await
        {
            warn!(%err, "Stopping acquisition before power-down failed");
        }
        let procedure = session
            .power_procedure
            .as_ref()
            .ok_or(ControlError::PowerProcedureUnavailable)?;
        procedure.call("switchAllOff").await?;
        self.set_status("Detector switched off");
        Ok(())
    }

    async fn apply_sweep_settings(&mut self, settings: SweepSettings) -> AppResult<()> {
        if settings.num_frames_to_send_out > 800 {
            return Err(ControlError::Validation(
                "numFramesToSendOut is limited to 800".into(),
            ));
        }
        self.sweep_settings = settings;
        if let Ok(session) = self.session() {
            let ppts = session.ppt_handles();
            let timeout = Duration::from_secs(self.settings.connect_timeout_secs);
            crate::aggregator::set_many(
                &ppts,
                "numBurstTrains",
                Value::from(self.sweep_settings.num_burst_trains),
                timeout,
            )
            .await?;
            crate::aggregator::set_many(
                &ppts,
                "numFramesToSendOut",
                Value::from(self.sweep_settings.num_frames_to_send_out),
                timeout,
            )
            .await?;
            crate::aggregator::set_many(
                &ppts,
                "numPreBurstVetos",
                Value::from(self.sweep_settings.num_preburst_vetos),
                timeout,
            )
            .await?;
        }
        Ok(())
    }

    fn stop_background(&mut self) {
        for task in self.background.drain(..) {
            task.abort();
        }
        if let Some(task) = self.sweep_task.take() {
            task.abort();
            self.sweeping = false;
        }
    }

    /// Release every lock we hold before going away.
    async fn shutdown(&mut self) {
        self.abort.store(true, Ordering::SeqCst);
        self.stop_background();
        if let Some(session) = &self.session {
            let mut locked = session.ppt_handles();
            if let Some(pp) = &session.power_procedure {
                locked.push(pp.clone());
            }
            for handle in locked {
                if handle.locked_by() == self.settings.device_id {
                    if let Err(err) = handle.clear_lock().await {
                        // The proxy may already be gone; nothing to hold on to.
                        warn!(device = %handle.device_id(), %err, "Failed to clear lock");
                    }
                }
            }
        }
    }
}
