//! Remote-device session and fan-out helpers.
//!
//! A [`Session`] bundles the remote handles one connect cycle produced: the
//! quadrant PPTs, the DAQ run controller and (outside expert mode) the
//! power procedure. Reconnecting builds a fresh session wholesale instead
//! of patching handles into a live one, so a half-connected state can never
//! be observed.

use crate::config::ControlSettings;
use crate::error::{AppResult, ControlError};
use crate::middleware::{HubHandle, RemoteDevice, RemoteHandle, Value};
use futures::future::join_all;
use std::time::Duration;
use tracing::{error, info, warn};

/// One connected quadrant PPT.
#[derive(Clone)]
pub struct QuadrantDevice {
    /// Quadrant label, `Q1`..`Q4`.
    pub quadrant_id: String,
    pub handle: RemoteHandle,
}

/// The remote devices of one connect cycle.
#[derive(Clone)]
pub struct Session {
    /// Connected PPTs in quadrant order.
    pub ppts: Vec<QuadrantDevice>,
    pub run_controller: RemoteHandle,
    /// Absent only in expert mode, when the procedure is unreachable.
    pub power_procedure: Option<RemoteHandle>,
    /// Histogram processors to notify at sweep end; best effort.
    pub processors: Vec<RemoteHandle>,
}

impl Session {
    pub fn ppt_handles(&self) -> Vec<RemoteHandle> {
        self.ppts.iter().map(|q| q.handle.clone()).collect()
    }

    pub fn quadrant(&self, quadrant_id: &str) -> Option<&QuadrantDevice> {
        self.ppts
            .iter()
            .find(|q| q.quadrant_id.eq_ignore_ascii_case(quadrant_id))
    }

    /// Operator summary of the connected quadrants, e.g. `Q1, Q3, Q4`.
    pub fn connected_summary(&self) -> String {
        let mut labels: Vec<&str> = self.ppts.iter().map(|q| q.quadrant_id.as_str()).collect();
        labels.sort_unstable();
        labels.join(", ")
    }
}

/// Connect to all configured remotes.
///
/// PPT connects run concurrently; any PPT failing to connect within the
/// timeout is fatal and reported by identity. The power procedure is also
/// required, except in expert mode where its absence is logged and
/// tolerated.
pub async fn connect_session(hub: &HubHandle, settings: &ControlSettings) -> AppResult<Session> {
    let connect_timeout = Duration::from_secs(settings.connect_timeout_secs);

    let rows: Vec<_> = settings
        .ppt_devices
        .iter()
        .filter(|row| row.connect)
        .collect();
    if rows.is_empty() {
        return Err(ControlError::Validation(
            "No PPT devices enabled for connection".into(),
        ));
    }

    let connects = rows.iter().map(|row| {
        let hub = hub.clone();
        async move {
            match tokio::time::timeout(connect_timeout, hub.connect(&row.device_id)).await {
                Ok(Ok(handle)) => Ok(QuadrantDevice {
                    quadrant_id: row.quadrant_id.clone(),
                    handle,
                }),
                Ok(Err(err)) => {
                    error!(device = %row.device_id, %err, "PPT connect failed");
                    Err(row.device_id.clone())
                }
                Err(_) => {
                    error!(device = %row.device_id, "PPT connect timed out");
                    Err(row.device_id.clone())
                }
            }
        }
    });

    let mut ppts = Vec::new();
    let mut failed = Vec::new();
    for result in join_all(connects).await {
        match result {
            Ok(quadrant) => ppts.push(quadrant),
            Err(device_id) => failed.push(device_id),
        }
    }
    if !failed.is_empty() {
        return Err(ControlError::Validation(format!(
            "Could not connect to: {}",
            failed.join(", ")
        )));
    }

    let power_timeout = Duration::from_secs(settings.power_procedure_timeout_secs);
    let power_procedure =
        match tokio::time::timeout(power_timeout, hub.connect(&settings.power_procedure)).await {
            Ok(Ok(handle)) => Some(handle),
            Ok(Err(_)) | Err(_) if settings.expert_mode => {
                warn!(
                    device = %settings.power_procedure,
                    "Power procedure unreachable, continuing in expert mode"
                );
                None
            }
            Ok(Err(err)) => {
                error!(device = %settings.power_procedure, %err, "Power procedure connect failed");
                return Err(ControlError::PowerProcedureUnavailable);
            }
            Err(_) => {
                error!(device = %settings.power_procedure, "Power procedure connect timed out");
                return Err(ControlError::PowerProcedureUnavailable);
            }
        };

    let run_controller =
        match tokio::time::timeout(connect_timeout, hub.connect(&settings.run_controller)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(ControlError::Validation(format!(
                    "Could not connect to: {}",
                    settings.run_controller
                )))
            }
        };

    let mut processors = Vec::new();
    for device_id in &settings.processors {
        match tokio::time::timeout(connect_timeout, hub.connect(device_id)).await {
            Ok(Ok(handle)) => processors.push(handle),
            Ok(Err(err)) => warn!(device = %device_id, %err, "Processor not connected"),
            Err(_) => warn!(device = %device_id, "Processor connect timed out"),
        }
    }

    let session = Session {
        ppts,
        run_controller,
        power_procedure,
        processors,
    };
    info!(quadrants = %session.connected_summary(), "Connected");
    Ok(session)
}

/// Write one property on every handle concurrently.
///
/// All writes are attempted; the first failure is returned after the whole
/// fan-out settled, with every failing device logged. A group timeout maps
/// to [`ControlError::Cancelled`] naming the property.
pub async fn set_many(
    handles: &[RemoteHandle],
    property: &str,
    value: Value,
    timeout: Duration,
) -> AppResult<()> {
    let writes = handles.iter().map(|handle| {
        let value = value.clone();
        async move {
            handle
                .set(property, value)
                .await
                .map_err(|err| (handle.device_id().to_string(), err))
        }
    });
    let settled = tokio::time::timeout(timeout, join_all(writes))
        .await
        .map_err(|_| ControlError::Cancelled(format!("setting '{property}'")))?;
    first_failure(settled, "setting", property)
}

/// Call one slot on every handle concurrently, same settling rules as
/// [`set_many`].
pub async fn call_many(handles: &[RemoteHandle], slot: &str, timeout: Duration) -> AppResult<()> {
    let calls = handles.iter().map(|handle| async move {
        handle
            .call(slot)
            .await
            .map_err(|err| (handle.device_id().to_string(), err))
    });
    let settled = tokio::time::timeout(timeout, join_all(calls))
        .await
        .map_err(|_| ControlError::Cancelled(format!("calling '{slot}'")))?;
    first_failure(settled, "calling", slot)
}

fn first_failure(
    settled: Vec<Result<(), (String, crate::middleware::MiddlewareError)>>,
    verb: &str,
    name: &str,
) -> AppResult<()> {
    let mut first = None;
    for result in settled {
        if let Err((device_id, err)) = result {
            error!(device = %device_id, %err, "Failed {verb} '{name}'");
            if first.is_none() {
                first = Some(err);
            }
        }
    }
    match first {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::middleware::mock::{
        simulated_power_procedure, simulated_ppt, simulated_run_controller, MockHub,
    };
    use crate::middleware::DeviceState;

    const CONFIG: &str = r#"
        [control]
        device_id = "SCS_CDIDET_DSSC/MDL/CONTROL"
        run_controller = "SCS_DAQ_SCHED/RCTRL/MAIN"
        power_procedure = "SCS_CDIDET_DSSC/MDL/POWER"

        [[control.ppt_devices]]
        device_id = "SCS_CDIDET_DSSC/FPGA/PPT_Q1"
        quadrant_id = "Q1"

        [[control.ppt_devices]]
        device_id = "SCS_CDIDET_DSSC/FPGA/PPT_Q3"
        quadrant_id = "Q3"
    "#;

    fn hub_with_all() -> std::sync::Arc<MockHub> {
        let hub = MockHub::new();
        simulated_ppt(&hub, "SCS_CDIDET_DSSC/FPGA/PPT_Q1", "q1_default.conf");
        simulated_ppt(&hub, "SCS_CDIDET_DSSC/FPGA/PPT_Q3", "q3_default.conf");
        simulated_power_procedure(&hub, "SCS_CDIDET_DSSC/MDL/POWER");
        simulated_run_controller(&hub, "SCS_DAQ_SCHED/RCTRL/MAIN");
        hub
    }

    #[tokio::test]
    async fn connects_all_quadrants() {
        let settings = Settings::from_toml(CONFIG).unwrap();
        let hub: HubHandle = hub_with_all();
        let session = connect_session(&hub, &settings.control).await.unwrap();
        assert_eq!(session.connected_summary(), "Q1, Q3");
        assert!(session.power_procedure.is_some());
        assert_eq!(session.quadrant("q3").unwrap().quadrant_id, "Q3");
    }

    #[tokio::test]
    async fn missing_ppt_is_fatal_by_identity() {
        let settings = Settings::from_toml(CONFIG).unwrap();
        let hub = MockHub::new();
        simulated_ppt(&hub, "SCS_CDIDET_DSSC/FPGA/PPT_Q1", "q1_default.conf");
        simulated_power_procedure(&hub, "SCS_CDIDET_DSSC/MDL/POWER");
        simulated_run_controller(&hub, "SCS_DAQ_SCHED/RCTRL/MAIN");
        let hub: HubHandle = hub;
        let Err(err) = connect_session(&hub, &settings.control).await else {
            panic!("connect should fail with a PPT missing")
        };
        assert!(err.to_string().contains("SCS_CDIDET_DSSC/FPGA/PPT_Q3"));
    }

    #[tokio::test]
    async fn missing_power_procedure_is_fatal_unless_expert() {
        let mut settings = Settings::from_toml(CONFIG).unwrap();
        let hub = MockHub::new();
        simulated_ppt(&hub, "SCS_CDIDET_DSSC/FPGA/PPT_Q1", "q1_default.conf");
        simulated_ppt(&hub, "SCS_CDIDET_DSSC/FPGA/PPT_Q3", "q3_default.conf");
        simulated_run_controller(&hub, "SCS_DAQ_SCHED/RCTRL/MAIN");
        let hub: HubHandle = hub;

        let Err(err) = connect_session(&hub, &settings.control).await else {
            panic!("connect should fail without the power procedure")
        };
        assert!(matches!(err, ControlError::PowerProcedureUnavailable));

        settings.control.expert_mode = true;
        let session = connect_session(&hub, &settings.control).await.unwrap();
        assert!(session.power_procedure.is_none());
    }

    #[tokio::test]
    async fn set_many_writes_every_device() {
        let settings = Settings::from_toml(CONFIG).unwrap();
        let hub = hub_with_all();
        let q1 = hub.device("SCS_CDIDET_DSSC/FPGA/PPT_Q1").unwrap();
        let q3 = hub.device("SCS_CDIDET_DSSC/FPGA/PPT_Q3").unwrap();
        let hub: HubHandle = hub;
        let session = connect_session(&hub, &settings.control).await.unwrap();

        set_many(
            &session.ppt_handles(),
            "numBurstTrains",
            Value::from(50u64),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(q1.peek("numBurstTrains").unwrap().as_u64(), Some(50));
        assert_eq!(q3.peek("numBurstTrains").unwrap().as_u64(), Some(50));
    }

    #[tokio::test]
    async fn call_many_reports_first_failure_after_settling() {
        let settings = Settings::from_toml(CONFIG).unwrap();
        let hub = hub_with_all();
        let q1 = hub.device("SCS_CDIDET_DSSC/FPGA/PPT_Q1").unwrap();
        let q3 = hub.device("SCS_CDIDET_DSSC/FPGA/PPT_Q3").unwrap();
        q1.fail_slot("initSystem");
        let hub: HubHandle = hub;
        let session = connect_session(&hub, &settings.control).await.unwrap();

        let err = call_many(
            &session.ppt_handles(),
            "initSystem",
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("initSystem"));
        // The healthy quadrant was still called.
        assert_eq!(q3.call_count("initSystem"), 1);
        assert_eq!(q3.state(), DeviceState::On);
    }
}
