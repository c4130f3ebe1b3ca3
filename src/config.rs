//! Configuration management.
//!
//! Deployment configuration for the three devices: which remote identities
//! to supervise, timeouts, and the gain-configuration lookup table. Loaded
//! from a TOML file with `DSSC_*` environment overrides. Operator-tunable
//! sweep parameters live in [`crate::control::SweepSettings`] and are only
//! seeded from here.

use crate::control::SweepSettings;
use crate::error::ControlError;
use config::Config;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub control: ControlSettings,
    #[serde(default)]
    pub veto: Option<VetoSettings>,
    #[serde(default)]
    pub configurator: Option<ConfiguratorSettings>,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One row of the "PPT devices to connect" table.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PptRow {
    pub device_id: String,
    /// Quadrant label, `Q1`..`Q4`.
    pub quadrant_id: String,
    #[serde(default = "default_true")]
    pub connect: bool,
}

fn default_true() -> bool {
    true
}

impl PptRow {
    /// Quadrant number parsed from the label, `Q3` -> 3.
    pub fn quadrant_number(&self) -> Option<u8> {
        self.quadrant_id.strip_prefix('Q')?.parse().ok()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlSettings {
    /// Identity under which this device appears (and locks remotes).
    pub device_id: String,
    pub ppt_devices: Vec<PptRow>,
    /// DAQ run controller, used for bracketing runs.
    pub run_controller: String,
    /// Power procedure, used as soft interlock.
    pub power_procedure: String,
    /// Histogram processors notified when a sweep ends. Optional; a
    /// processor that cannot be reached is skipped.
    #[serde(default)]
    pub processors: Vec<String>,
    /// Disables locking and the power-procedure requirement. High risk of
    /// hardware damage; expert use only.
    #[serde(default)]
    pub expert_mode: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_power_timeout")]
    pub power_procedure_timeout_secs: u64,
    /// Poll period while a PPT still reports the train-id sentinel 0.
    #[serde(default = "default_train_poll")]
    pub train_id_poll_ms: u64,
    /// Initial operator sweep parameters.
    #[serde(default)]
    pub sweep: SweepSettings,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("measurements")
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_power_timeout() -> u64 {
    3
}

fn default_train_poll() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct VetoSettings {
    pub device_id: String,
    /// The detector's clock and control, source of the veto pattern.
    pub ccmon: String,
    /// PPT or control device publishing preveto and frame count.
    pub ppt_control: String,
    #[serde(default = "default_staleness")]
    pub staleness_secs: u64,
    #[serde(default = "default_check_period")]
    pub check_period_secs: u64,
}

fn default_staleness() -> u64 {
    10
}

fn default_check_period() -> u64 {
    5
}

/// One known-good gain configuration: description plus the per-quadrant
/// configuration filenames.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct GainConfigurationRow {
    pub description: String,
    pub q1: String,
    pub q2: String,
    pub q3: String,
    pub q4: String,
}

impl GainConfigurationRow {
    pub fn filename_for(&self, quadrant_id: &str) -> Option<&str> {
        match quadrant_id.to_ascii_lowercase().as_str() {
            "q1" => Some(&self.q1),
            "q2" => Some(&self.q2),
            "q3" => Some(&self.q3),
            "q4" => Some(&self.q4),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConfiguratorSettings {
    pub device_id: String,
    pub ppt_devices: Vec<PptRow>,
    pub gain_configurations: Vec<GainConfigurationRow>,
    /// Desired configuration; must name a `description` from the table.
    pub target: String,
    #[serde(default = "default_monitor_timeout")]
    pub monitor_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Settle delay between PPT shutdown and re-instantiation.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_monitor_timeout() -> u64 {
    5
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_settle_ms() -> u64 {
    1500
}

impl Settings {
    /// Load `config/<name>.toml` (default `config/default.toml`), with
    /// `DSSC_*` environment overrides.
    pub fn new(config_name: Option<&str>) -> Result<Self, ControlError> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .add_source(config::Environment::with_prefix("DSSC").separator("__"))
            .build()
            .map_err(ControlError::Config)?;
        s.try_deserialize().map_err(ControlError::Config)
    }

    /// Parse settings from a TOML string.
    pub fn from_toml(toml: &str) -> Result<Self, ControlError> {
        let s = Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .map_err(ControlError::Config)?;
        s.try_deserialize().map_err(ControlError::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
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
        connect = false
    "#;

    #[test]
    fn minimal_settings_with_defaults() {
        let settings = Settings::from_toml(MINIMAL).unwrap();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.control.connect_timeout_secs, 10);
        assert!(!settings.control.expert_mode);
        assert_eq!(settings.control.ppt_devices.len(), 2);
        assert!(settings.control.ppt_devices[0].connect);
        assert!(!settings.control.ppt_devices[1].connect);
        assert!(settings.veto.is_none());
    }

    #[test]
    fn quadrant_number_from_label() {
        let row = PptRow {
            device_id: "SCS_CDIDET_DSSC/FPGA/PPT_Q3".into(),
            quadrant_id: "Q3".into(),
            connect: true,
        };
        assert_eq!(row.quadrant_number(), Some(3));
    }

    #[test]
    fn gain_row_lookup_is_case_insensitive() {
        let row = GainConfigurationRow {
            description: "default".into(),
            q1: "a.conf".into(),
            q2: "b.conf".into(),
            q3: "c.conf".into(),
            q4: "d.conf".into(),
        };
        assert_eq!(row.filename_for("Q2"), Some("b.conf"));
        assert_eq!(row.filename_for("q4"), Some("d.conf"));
        assert_eq!(row.filename_for("Q9"), None);
    }
}
