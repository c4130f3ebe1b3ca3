//! Detector state fusion and the lock watchdog.
//!
//! The control device presents one state for a detector made of several
//! quadrant PPTs plus a power procedure. [`fuse`] is the pure combination
//! rule; [`state_fusion_loop`] evaluates it whenever any observed state
//! changes and forwards deduplicated updates to the device actor.
//!
//! The combination is a ladder evaluated bottom-up, later rules taking
//! priority. In particular a PASSIVE power procedure reports the detector
//! as OFF even while the PPTs disagree among themselves, and a detector
//! with every PPT acquiring is ACQUIRING no matter what the power
//! procedure reports.
//!
//! [`lock_watchdog`] keeps every PPT and the power procedure locked to
//! this device so no other client can reprogram the detector or switch
//! power rails mid-measurement. It is not spawned in expert mode.

use crate::aggregator::Session;
use crate::middleware::{wait_until_any_changed, DeviceState, RemoteDevice, RemoteHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Operator message when the quadrants settle in different states.
pub const DIFFERENT_STATES_MSG: &str = "PPTs have different states";

/// Quadrants may pass through states at slightly different times; a
/// disagreement younger than this is re-checked before being reported.
pub const DISAGREEMENT_GRACE: Duration = Duration::from_secs(1);

const WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// A fused detector state with an optional operator message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fusion {
    pub state: DeviceState,
    pub message: Option<String>,
}

impl Fusion {
    fn plain(state: DeviceState) -> Self {
        Self {
            state,
            message: None,
        }
    }
}

/// Combine the PPT states and the power-procedure state into one detector
/// state. Pure; the grace period for transient disagreement is handled by
/// the caller.
pub fn fuse(ppt_states: &[DeviceState], power: Option<DeviceState>) -> Fusion {
    if ppt_states.is_empty() {
        return Fusion::plain(DeviceState::Unknown);
    }

    let first = ppt_states[0];
    let uniform = ppt_states.iter().all(|s| *s == first);

    let mut fused = if uniform {
        match first {
            DeviceState::Unknown | DeviceState::Off | DeviceState::On => Fusion::plain(first),
            DeviceState::Opening | DeviceState::Closing => Fusion::plain(DeviceState::Changing),
            other => Fusion::plain(other),
        }
    } else {
        Fusion {
            state: DeviceState::Error,
            message: Some(DIFFERENT_STATES_MSG.to_string()),
        }
    };

    if ppt_states.contains(&DeviceState::Changing) {
        fused = Fusion::plain(DeviceState::Changing);
    }
    match power {
        Some(DeviceState::Changing) => fused = Fusion::plain(DeviceState::Changing),
        Some(DeviceState::Passive) => fused = Fusion::plain(DeviceState::Off),
        Some(DeviceState::Error) => {
            fused = Fusion {
                state: DeviceState::Error,
                message: Some("Power procedure in ERROR".to_string()),
            };
        }
        _ => {}
    }
    if ppt_states
        .iter()
        .all(|s| matches!(s, DeviceState::Acquiring | DeviceState::Started))
    {
        fused = Fusion::plain(DeviceState::Acquiring);
    }

    fused
}

fn read_ppt_states(session: &Session) -> Vec<DeviceState> {
    session.ppts.iter().map(|q| q.handle.state()).collect()
}

fn all_equal(states: &[DeviceState]) -> bool {
    states.windows(2).all(|w| w[0] == w[1])
}

/// Re-evaluate the fusion on every observed state change and forward
/// changed results. Runs until the receiving actor goes away.
pub async fn state_fusion_loop(session: Session, updates: mpsc::Sender<Fusion>) {
    let mut watches: Vec<_> = session.ppts.iter().map(|q| q.handle.state_watch()).collect();
    if let Some(pp) = &session.power_procedure {
        watches.push(pp.state_watch());
    }

    let mut last: Option<Fusion> = None;
    loop {
        let mut states = read_ppt_states(&session);
        if !all_equal(&states) {
            // Transient while the quadrants step through a transition.
            tokio::time::sleep(DISAGREEMENT_GRACE).await;
            states = read_ppt_states(&session);
        }
        let power = session.power_procedure.as_ref().map(|pp| pp.state());
        let fusion = fuse(&states, power);

        if last.as_ref() != Some(&fusion) {
            debug!(state = %fusion.state, "Fused detector state");
            if updates.send(fusion.clone()).await.is_err() {
                return;
            }
            last = Some(fusion);
        }

        wait_until_any_changed(&mut watches, WATCH_INTERVAL).await;
    }
}

/// Events from the lock watchdog to the device actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// A foreign or missing lock was replaced; carries the operator record.
    LockOverridden(String),
    /// The failure budget is exhausted; the watchdog has stopped.
    Exhausted(String),
}

/// Consecutive-failure counter for supervision loops. Any success resets
/// it; exhaustion means the loop must give up rather than retry forever.
#[derive(Debug)]
pub struct FailureBudget {
    failures: u32,
    limit: u32,
}

impl FailureBudget {
    pub const DEFAULT_LIMIT: u32 = 10;

    pub fn new(limit: u32) -> Self {
        Self { failures: 0, limit }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Record one failure; returns true once the budget is exhausted.
    pub fn note_failure(&mut self) -> bool {
        self.failures += 1;
        self.failures >= self.limit
    }
}

impl Default for FailureBudget {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LIMIT)
    }
}

/// Keep every PPT and the power procedure locked to `own_id`, re-acquiring
/// whenever an owner changes. Ends when the budget is exhausted or the
/// actor goes away.
pub async fn lock_watchdog(session: Session, own_id: String, events: mpsc::Sender<WatchdogEvent>) {
    let mut guarded: Vec<RemoteHandle> = session.ppt_handles();
    if let Some(pp) = &session.power_procedure {
        guarded.push(pp.clone());
    }
    let mut watches: Vec<_> = guarded.iter().map(|h| h.lock_watch()).collect();
    let mut budget = FailureBudget::default();

    loop {
        for handle in &guarded {
            let owner = handle.locked_by();
            if owner == own_id {
                continue;
            }
            match handle.lock(&own_id).await {
                Ok(()) => {
                    budget.reset();
                    if !owner.is_empty() {
                        let record =
                            format!("Overwrote lock of {} held by {}", handle.device_id(), owner);
                        warn!("{record}");
                        if events.send(WatchdogEvent::LockOverridden(record)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(device = %handle.device_id(), %err, "Failed to re-acquire lock");
                    if budget.note_failure() {
                        let record = format!("Giving up locking {}: {err}", handle.device_id());
                        events.send(WatchdogEvent::Exhausted(record)).await.ok();
                        return;
                    }
                }
            }
        }

        wait_until_any_changed(&mut watches, WATCH_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::connect_session;
    use crate::config::Settings;
    use crate::middleware::mock::{
        simulated_power_procedure, simulated_ppt, simulated_run_controller, MockHub,
    };
    use crate::middleware::HubHandle;
    use std::sync::Arc;

    use DeviceState::*;

    #[test]
    fn uniform_states_pass_through() {
        assert_eq!(fuse(&[On, On], Some(On)).state, On);
        assert_eq!(fuse(&[Off, Off], Some(On)).state, Off);
        assert_eq!(fuse(&[Unknown, Unknown], None).state, Unknown);
    }

    #[test]
    fn passive_power_reports_off() {
        let fused = fuse(&[On, On], Some(Passive));
        assert_eq!(fused.state, Off);
        assert!(fused.message.is_none());
    }

    #[test]
    fn mixed_states_are_an_error() {
        let fused = fuse(&[On, Acquiring], Some(On));
        assert_eq!(fused.state, Error);
        assert_eq!(fused.message.as_deref(), Some(DIFFERENT_STATES_MSG));
    }

    #[test]
    fn acquiring_trumps_power_procedure() {
        assert_eq!(fuse(&[Acquiring, Acquiring], Some(On)).state, Acquiring);
        assert_eq!(fuse(&[Acquiring, Started], Some(Changing)).state, Acquiring);
        assert_eq!(fuse(&[Started, Started], Some(Passive)).state, Acquiring);
    }

    #[test]
    fn transitions_fuse_to_changing() {
        assert_eq!(fuse(&[Opening, Opening], Some(On)).state, Changing);
        assert_eq!(fuse(&[On, Changing], Some(On)).state, Changing);
        assert_eq!(fuse(&[On, On], Some(Changing)).state, Changing);
    }

    #[test]
    fn power_error_is_fatal_unless_acquiring() {
        assert_eq!(fuse(&[On, On], Some(Error)).state, Error);
        assert_eq!(fuse(&[Acquiring, Acquiring], Some(Error)).state, Acquiring);
    }

    #[test]
    fn budget_resets_on_success() {
        let mut budget = FailureBudget::new(3);
        assert!(!budget.note_failure());
        assert!(!budget.note_failure());
        budget.reset();
        assert!(!budget.note_failure());
        assert!(!budget.note_failure());
        assert!(budget.note_failure());
    }

    const CONFIG: &str = r#"
        [control]
        device_id = "SCS_CDIDET_DSSC/MDL/CONTROL"
        run_controller = "SCS_DAQ_SCHED/RCTRL/MAIN"
        power_procedure = "SCS_CDIDET_DSSC/MDL/POWER"

        [[control.ppt_devices]]
        device_id = "SCS_CDIDET_DSSC/FPGA/PPT_Q1"
        quadrant_id = "Q1"

        [[control.ppt_devices]]
        device_id = "SCS_CDIDET_DSSC/FPGA/PPT_Q2"
        quadrant_id = "Q2"
    "#;

    async fn session_with(hub: &Arc<MockHub>) -> Session {
        let settings = Settings::from_toml(CONFIG).unwrap();
        let handle: HubHandle = hub.clone();
        connect_session(&handle, &settings.control).await.unwrap()
    }

    #[tokio::test]
    async fn fusion_loop_tracks_state_changes() {
        let hub = MockHub::new();
        let q1 = simulated_ppt(&hub, "SCS_CDIDET_DSSC/FPGA/PPT_Q1", "q1.conf");
        let q2 = simulated_ppt(&hub, "SCS_CDIDET_DSSC/FPGA/PPT_Q2", "q2.conf");
        simulated_power_procedure(&hub, "SCS_CDIDET_DSSC/MDL/POWER");
        simulated_run_controller(&hub, "SCS_DAQ_SCHED/RCTRL/MAIN");
        let session = session_with(&hub).await;

        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(state_fusion_loop(session, tx));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.state, On);

        q1.set_state(Acquiring);
        q2.set_state(Acquiring);
        let next = loop {
            let update = rx.recv().await.unwrap();
            if update.state != On {
                break update;
            }
        };
        assert_eq!(next.state, Acquiring);
        task.abort();
    }

    #[tokio::test]
    async fn watchdog_reacquires_and_records_override() {
        let hub = MockHub::new();
        let q1 = simulated_ppt(&hub, "SCS_CDIDET_DSSC/FPGA/PPT_Q1", "q1.conf");
        let q2 = simulated_ppt(&hub, "SCS_CDIDET_DSSC/FPGA/PPT_Q2", "q2.conf");
        q1.set_locked_by("SOME/OTHER/CLIENT");
        simulated_power_procedure(&hub, "SCS_CDIDET_DSSC/MDL/POWER");
        simulated_run_controller(&hub, "SCS_DAQ_SCHED/RCTRL/MAIN");
        let session = session_with(&hub).await;

        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(lock_watchdog(
            session,
            "SCS_CDIDET_DSSC/MDL/CONTROL".to_string(),
            tx,
        ));

        let event = rx.recv().await.unwrap();
        match event {
            WatchdogEvent::LockOverridden(record) => {
                assert!(record.contains("SOME/OTHER/CLIENT"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(q1.locked_by(), "SCS_CDIDET_DSSC/MDL/CONTROL");
        assert_eq!(q2.locked_by(), "SCS_CDIDET_DSSC/MDL/CONTROL");
        task.abort();
    }

    #[tokio::test]
    async fn watchdog_guards_the_power_procedure() {
        let hub = MockHub::new();
        simulated_ppt(&hub, "SCS_CDIDET_DSSC/FPGA/PPT_Q1", "q1.conf");
        simulated_ppt(&hub, "SCS_CDIDET_DSSC/FPGA/PPT_Q2", "q2.conf");
        let pp = simulated_power_procedure(&hub, "SCS_CDIDET_DSSC/MDL/POWER");
        pp.set_locked_by("SOME/OTHER/CLIENT");
        simulated_run_controller(&hub, "SCS_DAQ_SCHED/RCTRL/MAIN");
        let session = session_with(&hub).await;

        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(lock_watchdog(
            session,
            "SCS_CDIDET_DSSC/MDL/CONTROL".to_string(),
            tx,
        ));

        let event = rx.recv().await.unwrap();
        match event {
            WatchdogEvent::LockOverridden(record) => {
                assert!(record.contains("SCS_CDIDET_DSSC/MDL/POWER"));
                assert!(record.contains("SOME/OTHER/CLIENT"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(pp.locked_by(), "SCS_CDIDET_DSSC/MDL/CONTROL");
        task.abort();
    }
}
