//! Measurement bookkeeping and the persisted sweep descriptor.
//!
//! Every sweep writes a JSON descriptor next to the acquired data so
//! offline analysis can reconstruct what was measured: the swept
//! parameters and their settings, the per-point data directories, the
//! detector configuration of each quadrant and the train-id range each
//! point covered. The descriptor is written once up front and rewritten
//! complete at the end, so a crash mid-sweep still leaves the plan on
//! disk.

use crate::aggregator::Session;
use crate::error::AppResult;
use crate::sweep::SweepPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const DESCRIPTOR_FILE_VERSION: u32 = 1;
const DESCRIPTOR_FILE_NAME: &str = "measurement_info.json";

/// Configuration snapshot of one quadrant at sweep start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuadrantSnapshot {
    pub quadrant_id: String,
    pub device_id: String,
    /// The full configuration file the PPT was running.
    pub config_file: String,
}

/// One completed measurement point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeasurementRecord {
    /// Zero-based index over the whole sweep.
    pub index: usize,
    /// Data directory label, e.g. `CompCoarse7_RmpFineTrm0`.
    pub directory: String,
    /// Swept parameter values at this point, inner axis first.
    pub settings: Vec<(String, i64)>,
    /// First train id of the point, per quadrant in session order.
    pub first_trains: Vec<u64>,
    /// Last train id of the point, per quadrant in session order.
    pub last_trains: Vec<u64>,
}

/// The sweep descriptor persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementInfo {
    pub file_version: u32,
    /// `<parameter> Sweep` or `BurstMeasurement`.
    pub measurement_name: String,
    pub timestamp: DateTime<Utc>,
    pub run_directory: PathBuf,
    /// Swept parameter names, inner axis first.
    pub parameter_names: Vec<String>,
    /// Settings per parameter, same order as `parameter_names`.
    pub settings: Vec<Vec<i64>>,
    /// Points on the inner axis.
    pub num_iterations: usize,
    /// Points on the outer axis, 1 for one-dimensional sweeps.
    pub num_measurements: usize,
    pub measurement_directories: Vec<String>,
    pub num_burst_trains: u64,
    pub num_preburst_vetos: u64,
    /// True when a full 16-module ladder is read out.
    pub ladder_mode: bool,
    pub available_asics: Vec<u32>,
    pub column_selection: String,
    /// Only set for injection sweeps.
    pub injection_mode: Option<String>,
    pub quadrants: Vec<QuadrantSnapshot>,
    /// Filled in as points complete.
    pub records: Vec<MeasurementRecord>,
    pub aborted: bool,
}

impl MeasurementInfo {
    /// Snapshot the plan and session into a fresh descriptor.
    pub async fn capture(
        measurement_name: &str,
        plan: Option<&SweepPlan>,
        session: &Session,
        run_directory: PathBuf,
        num_burst_trains: u64,
        num_preburst_vetos: u64,
        column_selection: String,
        injection_mode: Option<String>,
    ) -> AppResult<Self> {
        let mut quadrants = Vec::new();
        for quadrant in &session.ppts {
            let config_file = quadrant
                .handle
                .get("fullConfigFileName")
                .await
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            quadrants.push(QuadrantSnapshot {
                quadrant_id: quadrant.quadrant_id.clone(),
                device_id: quadrant.handle.device_id().to_string(),
                config_file,
            });
        }

        let (parameter_names, settings, num_iterations, num_measurements, directories) = match plan
        {
            Some(plan) => {
                let mut names = vec![plan.inner_axis().name.clone()];
                let mut settings = vec![plan.inner_axis().settings.clone()];
                let mut measurements = 1;
                if let Some(outer) = plan.outer_axis() {
                    names.push(outer.name.clone());
                    settings.push(outer.settings.clone());
                    measurements = outer.len();
                }
                (
                    names,
                    settings,
                    plan.inner_axis().len(),
                    measurements,
                    plan.directory_labels(),
                )
            }
            None => (Vec::new(), Vec::new(), 1, 1, vec!["burst".to_string()]),
        };

        // A full ladder reads out all 16 ASICs per module.
        let available_asics: Vec<u32> = (0..16).collect();
        let ladder_mode = true;

        Ok(Self {
            file_version: DESCRIPTOR_FILE_VERSION,
            measurement_name: measurement_name.to_string(),
            timestamp: Utc::now(),
            run_directory,
            parameter_names,
            settings,
            num_iterations,
            num_measurements,
            measurement_directories: directories,
            num_burst_trains,
            num_preburst_vetos,
            ladder_mode,
            available_asics,
            column_selection,
            injection_mode,
            quadrants,
            records: Vec::new(),
            aborted: false,
        })
    }
}

/// An in-flight measurement: the descriptor plus its on-disk location.
pub struct MeasurementSession {
    info: MeasurementInfo,
    descriptor_path: PathBuf,
}

impl MeasurementSession {
    /// Create the run directory and persist the initial descriptor.
    pub async fn begin(output_dir: &Path, info: MeasurementInfo) -> AppResult<Self> {
        let run_directory = output_dir.join(directory_name(&info));
        tokio::fs::create_dir_all(&run_directory).await?;
        let mut info = info;
        info.run_directory = run_directory.clone();
        let session = Self {
            descriptor_path: run_directory.join(DESCRIPTOR_FILE_NAME),
            info,
        };
        session.persist().await?;
        Ok(session)
    }

    pub fn info(&self) -> &MeasurementInfo {
        &self.info
    }

    pub fn run_directory(&self) -> &Path {
        &self.info.run_directory
    }

    pub fn record(&mut self, record: MeasurementRecord) {
        self.info.records.push(record);
    }

    /// Rewrite the descriptor with all records and the abort flag.
    pub async fn finalize(mut self, aborted: bool) -> AppResult<PathBuf> {
        self.info.aborted = aborted;
        self.persist().await?;
        info!(
            descriptor = %self.descriptor_path.display(),
            points = self.info.records.len(),
            aborted,
            "Measurement descriptor written"
        );
        Ok(self.descriptor_path)
    }

    async fn persist(&self) -> AppResult<()> {
        let json = serde_json::to_vec_pretty(&self.info)?;
        tokio::fs::write(&self.descriptor_path, json).await?;
        Ok(())
    }
}

fn directory_name(info: &MeasurementInfo) -> String {
    let stamp = info.timestamp.format("%Y%m%dT%H%M%S");
    let name: String = info
        .measurement_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{stamp}-{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::SweepAxis;

    fn sample_info(plan: Option<&SweepPlan>) -> MeasurementInfo {
        MeasurementInfo {
            file_version: DESCRIPTOR_FILE_VERSION,
            measurement_name: "RmpFineTrm Sweep".into(),
            timestamp: Utc::now(),
            run_directory: PathBuf::new(),
            parameter_names: plan
                .map(|p| vec![p.inner_axis().name.clone()])
                .unwrap_or_default(),
            settings: plan
                .map(|p| vec![p.inner_axis().settings.clone()])
                .unwrap_or_default(),
            num_iterations: plan.map(|p| p.inner_axis().len()).unwrap_or(1),
            num_measurements: 1,
            measurement_directories: plan.map(|p| p.directory_labels()).unwrap_or_default(),
            num_burst_trains: 20,
            num_preburst_vetos: 10,
            ladder_mode: true,
            available_asics: (0..16).collect(),
            column_selection: "0-7".into(),
            injection_mode: None,
            quadrants: vec![],
            records: vec![],
            aborted: false,
        }
    }

    #[tokio::test]
    async fn descriptor_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let plan =
            SweepPlan::new(SweepAxis::new("RmpFineTrm", vec![0, 1, 2]), None).unwrap();
        let info = sample_info(Some(&plan));

        let mut session = MeasurementSession::begin(dir.path(), info).await.unwrap();
        session.record(MeasurementRecord {
            index: 0,
            directory: "RmpFineTrm0".into(),
            settings: vec![("RmpFineTrm".into(), 0)],
            first_trains: vec![1000, 1000],
            last_trains: vec![1019, 1019],
        });
        let path = session.finalize(false).await.unwrap();

        let bytes = tokio::fs::read(&path).await.unwrap();
        let read: MeasurementInfo = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(read.file_version, DESCRIPTOR_FILE_VERSION);
        assert_eq!(read.measurement_name, "RmpFineTrm Sweep");
        assert_eq!(read.measurement_directories.len(), 3);
        assert_eq!(read.records.len(), 1);
        assert!(!read.aborted);
    }

    #[tokio::test]
    async fn aborted_flag_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let info = sample_info(None);
        let session = MeasurementSession::begin(dir.path(), info).await.unwrap();
        let path = session.finalize(true).await.unwrap();
        let read: MeasurementInfo =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert!(read.aborted);
    }

    #[test]
    fn directory_name_is_filesystem_safe() {
        let info = sample_info(None);
        let name = directory_name(&info);
        assert!(name.ends_with("RmpFineTrm_Sweep"));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }
}
