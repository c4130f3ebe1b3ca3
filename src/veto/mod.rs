//! Veto and data validation device.
//!
//! Receives monitoring frames from the DAQ pipeline and checks, train by
//! train, that the detector head applied the configured veto pattern: the
//! reported memory-cell ids must match the software replay
//! ([`sim::veto_pattern_to_sim_data`]) of the pattern published by the
//! clock and control device, and every ASIC's veto counter must agree
//! with the PPT's ([`asic::validate_asic_vetos`]).
//!
//! The checker is PROCESSING while frames arrive and drops to PASSIVE
//! with an operator warning when the stream goes stale.

pub mod asic;
pub mod sim;

pub use asic::{validate_asic_vetos, AsicVetoReport, AsicVetoState, NUM_ASICS};
pub use sim::{veto_pattern_to_sim_data, SimData, MAX_CELL_ADDR, VETO_LATENCY};

use crate::config::VetoSettings;
use crate::error::AppResult;
use crate::middleware::{DeviceState, HubHandle, RemoteDevice, RemoteHandle, Value};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const FRAME_BUFFER: usize = 64;
const RECORD_BUFFER: usize = 256;

/// Operator warning when frames stop arriving.
pub const STALE_MESSAGE: &str = "Detector not sending data while DAQ monitoring";
/// Operator warning for out-of-range memory cells.
pub const CELLS_OVER_RANGE_MESSAGE: &str = "Cell IDs over 800";

/// One monitoring frame as delivered by the DAQ pipeline.
#[derive(Debug, Clone)]
pub struct DetectorFrame {
    /// Memory-cell id per frame of the train.
    pub cell_id: Vec<u16>,
    /// Raw train trailer with the veto counters.
    pub trailer: Vec<u8>,
    /// True while the PPT sends generated test data.
    pub dummy_data: bool,
}

/// Validation verdict for one train.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VetoRecord {
    pub ok: bool,
    pub message: String,
    pub asic_states: [AsicVetoState; NUM_ASICS],
    /// Raw veto count each ASIC reported in the trailer.
    pub asic_vetoes: [u16; NUM_ASICS],
    /// Veto count the PPT applied.
    pub ppt_veto: u16,
    /// Consecutive not-ok trains up to and including this one.
    pub not_ok_count: u64,
    /// Memory-cell ids as reported by the detector head.
    pub cell_id: Vec<u16>,
    /// Memory-cell ids the replay says the head should have reported.
    pub expected_cell_id: Vec<u16>,
}

/// Client handle to a running veto checker.
#[derive(Clone)]
pub struct VetoHandle {
    frames: mpsc::Sender<DetectorFrame>,
    state: watch::Receiver<DeviceState>,
    status: watch::Receiver<String>,
    asic_states: watch::Receiver<[AsicVetoState; NUM_ASICS]>,
    records: broadcast::Sender<VetoRecord>,
}

impl VetoHandle {
    /// Feed one monitoring frame to the checker.
    pub async fn ingest(&self, frame: DetectorFrame) -> AppResult<()> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| crate::error::ControlError::ActorGone)
    }

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

    /// Latest per-ASIC verdicts; only updated when they change.
    pub fn asic_states(&self) -> [AsicVetoState; NUM_ASICS] {
        *self.asic_states.borrow()
    }

    pub fn records(&self) -> broadcast::Receiver<VetoRecord> {
        self.records.subscribe()
    }
}

/// Connect to the clock and control device and the PPT, then spawn the
/// checker actor.
pub async fn spawn_veto(hub: HubHandle, settings: VetoSettings) -> AppResult<VetoHandle> {
    let ccmon = hub.connect(&settings.ccmon).await?;
    let ppt = hub.connect(&settings.ppt_control).await?;

    let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
    let (records_tx, _) = broadcast::channel(RECORD_BUFFER);
    let state_tx = watch::channel(DeviceState::Monitoring).0;
    let status_tx = watch::channel(String::new()).0;
    let asic_tx = watch::channel([AsicVetoState::Unknown; NUM_ASICS]).0;

    let handle = VetoHandle {
        frames: frames_tx,
        state: state_tx.subscribe(),
        status: status_tx.subscribe(),
        asic_states: asic_tx.subscribe(),
        records: records_tx.clone(),
    };

    let actor = VetoActor {
        pattern_rx: ccmon.property_watch("vetoPattern")?,
        preveto_rx: ppt.property_watch("numPreBurstVetos")?,
        frames_out_rx: ppt.property_watch("numFramesToSendOut")?,
        staleness: Duration::from_secs(settings.staleness_secs),
        check_period: Duration::from_secs(settings.check_period_secs),
        state_tx,
        status_tx,
        asic_tx,
        records_tx,
        expected: None,
        not_ok_count: 0,
        last_ok: None,
        last_frame_at: Instant::now(),
    };
    info!(ccmon = %ccmon.device_id(), ppt = %ppt.device_id(), "Veto checker started");
    tokio::spawn(actor.run(frames_rx));
    Ok(handle)
}

struct VetoActor {
    pattern_rx: watch::Receiver<Value>,
    preveto_rx: watch::Receiver<Value>,
    frames_out_rx: watch::Receiver<Value>,
    staleness: Duration,
    check_period: Duration,
    state_tx: watch::Sender<DeviceState>,
    status_tx: watch::Sender<String>,
    asic_tx: watch::Sender<[AsicVetoState; NUM_ASICS]>,
    records_tx: broadcast::Sender<VetoRecord>,
    /// Cached replay, keyed by the inputs it was computed from.
    expected: Option<((Vec<u16>, usize, usize), SimData)>,
    not_ok_count: u64,
    last_ok: Option<bool>,
    last_frame_at: Instant,
}

impl VetoActor {
    async fn run(mut self, mut frames: mpsc::Receiver<DetectorFrame>) {
        let mut check = tokio::time::interval(self.check_period);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => self.handle_frame(frame),
                    None => return,
                },
                _ = check.tick() => self.check_staleness(),
            }
        }
    }

    fn set_status(&self, line: impl Into<String>) {
        let line = line.into();
        debug!("{line}");
        self.status_tx.send_replace(line);
    }

    fn check_staleness(&mut self) {
        if self.last_frame_at.elapsed() < self.staleness {
            return;
        }
        if *self.state_tx.borrow() != DeviceState::Passive {
            self.state_tx.send_replace(DeviceState::Passive);
            self.last_ok = None;
            self.not_ok_count = 0;
            warn!("{STALE_MESSAGE}");
            self.set_status(STALE_MESSAGE);
        }
    }

    /// Current replay of the configured pattern, recomputed only when the
    /// pattern or the acquisition settings changed.
    fn expected(&mut self) -> Option<&SimData> {
        let pattern: Vec<u16> = self
            .pattern_rx
            .borrow()
            .as_u32_vec()?
            .iter()
            .map(|e| *e as u16)
            .collect();
        let frames = self.frames_out_rx.borrow().as_u64()? as usize;
        let preveto = self.preveto_rx.borrow().as_u64()? as usize;
        let key = (pattern, frames, preveto);
        let stale = match &self.expected {
            Some((cached_key, _)) => *cached_key != key,
            None => true,
        };
        if stale {
            let sim = veto_pattern_to_sim_data(&key.0, key.1, key.2);
            self.expected = Some((key, sim));
        }
        self.expected.as_ref().map(|(_, sim)| sim)
    }

    fn handle_frame(&mut self, frame: DetectorFrame) {
        self.last_frame_at = Instant::now();
        self.state_tx.send_replace(DeviceState::Processing);

        let asic_report = validate_asic_vetos(&frame.trailer, frame.dummy_data);
        if *self.asic_tx.borrow() != asic_report.states {
            self.asic_tx.send_replace(asic_report.states);
        }

        let (ok, message) = self.validate_cells(&frame);
        if ok {
            self.not_ok_count = 0;
        } else {
            self.not_ok_count += 1;
        }
        // Only transitions reach the operator; a steady verdict is quiet.
        if self.last_ok != Some(ok) {
            self.set_status(message.clone());
            self.last_ok = Some(ok);
        }

        let expected_cell_id = self
            .expected
            .as_ref()
            .map(|(_, sim)| sim.cell_id.clone())
            .unwrap_or_default();
        self.records_tx
            .send(VetoRecord {
                ok,
                message,
                asic_states: asic_report.states,
                asic_vetoes: asic_report.counters,
                ppt_veto: asic_report.ppt_veto,
                not_ok_count: self.not_ok_count,
                cell_id: frame.cell_id,
                expected_cell_id,
            })
            .ok();
    }

    fn validate_cells(&mut self, frame: &DetectorFrame) -> (bool, String) {
        if frame
            .cell_id
            .iter()
            .any(|cell| *cell > MAX_CELL_ADDR)
        {
            return (false, CELLS_OVER_RANGE_MESSAGE.to_string());
        }
        if frame.dummy_data {
            // Generated data carries synthetic addressing.
            return (true, "Dummy data, veto check skipped".to_string());
        }
        let Some(expected) = self.expected() else {
            return (true, "No veto pattern published yet".to_string());
        };
        let n = frame.cell_id.len().min(expected.cell_id.len());
        match frame.cell_id[..n]
            .iter()
            .zip(&expected.cell_id[..n])
            .position(|(got, want)| got != want)
        {
            Some(i) => (
                false,
                format!(
                    "Cell id mismatch at frame {i}: expected {}, got {}",
                    expected.cell_id[i], frame.cell_id[i]
                ),
            ),
            None => (true, "Data OK".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::middleware::mock::{simulated_ppt, MockDevice, MockHub};

    const CONFIG: &str = r#"
        [control]
        device_id = "SCS_CDIDET_DSSC/MDL/CONTROL"
        run_controller = "SCS_DAQ_SCHED/RCTRL/MAIN"
        power_procedure = "SCS_CDIDET_DSSC/MDL/POWER"

        [[control.ppt_devices]]
        device_id = "SCS_CDIDET_DSSC/FPGA/PPT_Q1"
        quadrant_id = "Q1"

        [veto]
        device_id = "SCS_CDIDET_DSSC/MDL/VETO"
        ccmon = "SCS_CDIDET_DSSC/MDL/CCMON"
        ppt_control = "SCS_CDIDET_DSSC/FPGA/PPT_Q1"
        staleness_secs = 10
        check_period_secs = 5
    "#;

    const NOT_USED: u32 = 0b101 << 12;

    fn good_trailer() -> Vec<u8> {
        let mut trailer = vec![0u8; 404];
        trailer[0] = 44;
        for i in 0..NUM_ASICS {
            trailer[162 + i * 16] = 44;
        }
        trailer
    }

    async fn checker() -> (VetoHandle, std::sync::Arc<MockDevice>) {
        let hub = MockHub::new();
        let ccmon = MockDevice::new("SCS_CDIDET_DSSC/MDL/CCMON");
        ccmon.put("vetoPattern", vec![NOT_USED; 800]);
        hub.register(ccmon.clone());
        let ppt = simulated_ppt(&hub, "SCS_CDIDET_DSSC/FPGA/PPT_Q1", "q1.conf");
        ppt.put("numPreBurstVetos", 0u64);
        let settings = Settings::from_toml(CONFIG).unwrap().veto.unwrap();
        let handle = spawn_veto(hub, settings).await.unwrap();
        (handle, ccmon)
    }

    #[tokio::test]
    async fn matching_frame_is_ok() {
        let (handle, _ccmon) = checker().await;
        let mut records = handle.records();
        handle
            .ingest(DetectorFrame {
                cell_id: (0..400).collect(),
                trailer: good_trailer(),
                dummy_data: false,
            })
            .await
            .unwrap();
        let record = records.recv().await.unwrap();
        assert!(record.ok, "{}", record.message);
        assert_eq!(record.not_ok_count, 0);
        assert!(record.asic_states.iter().all(|s| *s == AsicVetoState::Ok));
        assert_eq!(record.asic_vetoes, [44; NUM_ASICS]);
        assert_eq!(record.ppt_veto, 44);
        assert_eq!(handle.state(), DeviceState::Processing);
    }

    #[tokio::test]
    async fn cell_ids_over_range_are_flagged() {
        let (handle, _ccmon) = checker().await;
        let mut records = handle.records();
        handle
            .ingest(DetectorFrame {
                cell_id: vec![0, 1, 900],
                trailer: good_trailer(),
                dummy_data: false,
            })
            .await
            .unwrap();
        let record = records.recv().await.unwrap();
        assert!(!record.ok);
        assert_eq!(record.message, CELLS_OVER_RANGE_MESSAGE);
        assert_eq!(record.not_ok_count, 1);
    }

    #[tokio::test]
    async fn mismatch_counts_until_a_good_train() {
        let (handle, _ccmon) = checker().await;
        let mut records = handle.records();
        let bad = DetectorFrame {
            cell_id: vec![5, 4, 3],
            trailer: good_trailer(),
            dummy_data: false,
        };
        handle.ingest(bad.clone()).await.unwrap();
        handle.ingest(bad).await.unwrap();
        assert_eq!(records.recv().await.unwrap().not_ok_count, 1);
        assert_eq!(records.recv().await.unwrap().not_ok_count, 2);

        handle
            .ingest(DetectorFrame {
                cell_id: (0..400).collect(),
                trailer: good_trailer(),
                dummy_data: false,
            })
            .await
            .unwrap();
        let record = records.recv().await.unwrap();
        assert!(record.ok);
        assert_eq!(record.not_ok_count, 0);
    }

    #[tokio::test]
    async fn dummy_data_gives_unknown_asics() {
        let (handle, _ccmon) = checker().await;
        let mut records = handle.records();
        handle
            .ingest(DetectorFrame {
                cell_id: vec![7, 3, 1],
                trailer: good_trailer(),
                dummy_data: true,
            })
            .await
            .unwrap();
        let record = records.recv().await.unwrap();
        assert!(record.ok);
        assert!(record
            .asic_states
            .iter()
            .all(|s| *s == AsicVetoState::Unknown));
        assert_eq!(record.asic_vetoes, [0; NUM_ASICS]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_stream_drops_to_passive() {
        let (handle, _ccmon) = checker().await;
        let mut status = handle.status_watch();
        tokio::time::sleep(Duration::from_secs(16)).await;
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                if *status.borrow_and_update() == STALE_MESSAGE {
                    return;
                }
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.state(), DeviceState::Passive);
    }
}
