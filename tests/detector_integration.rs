//! End-to-end tests against the simulated middleware: the full control
//! device with four quadrants, sweeps driven through the public handle.

use dssc_control::config::Settings;
use dssc_control::control::{spawn_control, ControlHandle, SweepRequest};
use dssc_control::error::ControlError;
use dssc_control::middleware::mock::{
    simulated_power_procedure, simulated_ppt, simulated_run_controller, MockHub,
};
use dssc_control::middleware::{DeviceState, RemoteDevice};
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"
    [control]
    device_id = "SCS_CDIDET_DSSC/MDL/CONTROL"
    run_controller = "SCS_DAQ_SCHED/RCTRL/MAIN"
    power_procedure = "SCS_CDIDET_DSSC/MDL/POWER"
    train_id_poll_ms = 1

    [[control.ppt_devices]]
    device_id = "SCS_CDIDET_DSSC/FPGA/PPT_Q1"
    quadrant_id = "Q1"

    [[control.ppt_devices]]
    device_id = "SCS_CDIDET_DSSC/FPGA/PPT_Q2"
    quadrant_id = "Q2"

    [[control.ppt_devices]]
    device_id = "SCS_CDIDET_DSSC/FPGA/PPT_Q3"
    quadrant_id = "Q3"

    [[control.ppt_devices]]
    device_id = "SCS_CDIDET_DSSC/FPGA/PPT_Q4"
    quadrant_id = "Q4"
"#;

fn detector_hub() -> Arc<MockHub> {
    let hub = MockHub::new();
    for q in 1..=4 {
        simulated_ppt(&hub, &format!("SCS_CDIDET_DSSC/FPGA/PPT_Q{q}"), "conf.conf");
    }
    simulated_power_procedure(&hub, "SCS_CDIDET_DSSC/MDL/POWER");
    simulated_run_controller(&hub, "SCS_DAQ_SCHED/RCTRL/MAIN");
    hub
}

async fn connected_control(
    hub: &Arc<MockHub>,
    output_dir: &std::path::Path,
) -> ControlHandle {
    let mut settings = Settings::from_toml(CONFIG).unwrap();
    settings.control.output_dir = output_dir.to_path_buf();
    let handle = spawn_control(hub.clone(), settings.control);
    handle.connect_devices().await.unwrap();
    wait_for_state(&handle, DeviceState::On).await;
    handle
}

async fn wait_for_state(handle: &ControlHandle, expected: DeviceState) {
    let mut rx = handle.state_watch();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if *rx.borrow_and_update() == expected {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "device never reached {expected}, stuck in {} ({})",
            handle.state(),
            handle.status()
        )
    });
}

#[tokio::test]
async fn pixel_sweep_over_three_settings() {
    let hub = detector_hub();
    let dir = tempfile::tempdir().unwrap();
    let handle = connected_control(&hub, dir.path()).await;
    assert_eq!(handle.connected_quadrants(), "Q1, Q2, Q3, Q4");

    let mut records = handle.records();
    let mut measurement_numbers = handle.measurement_number_watch();
    handle
        .run_sweep(SweepRequest::Pixel {
            register: "RmpFineTrm".into(),
            pixels: "all".into(),
            signal: "0".into(),
            expression: "0-2".into(),
        })
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let record = records.recv().await.unwrap();
        seen.push(record.index);
        assert_eq!(record.first_trains.len(), 4);
    }
    assert_eq!(seen, vec![0, 1, 2]);

    wait_for_state(&handle, DeviceState::On).await;
    assert_eq!(handle.status(), "Measurement Finished");
    assert_eq!(*measurement_numbers.borrow_and_update(), 2);

    // Each setting was programmed on every quadrant before acquisition.
    for q in 1..=4 {
        let ppt = hub
            .device(&format!("SCS_CDIDET_DSSC/FPGA/PPT_Q{q}"))
            .unwrap();
        assert_eq!(ppt.call_count("progSelReg"), 3);
        assert_eq!(ppt.call_count("startBurstAcquisition"), 3);
    }
}

#[tokio::test]
async fn abort_leaves_no_quadrant_acquiring() {
    let hub = detector_hub();
    let dir = tempfile::tempdir().unwrap();
    let handle = connected_control(&hub, dir.path()).await;

    let mut records = handle.records();
    handle
        .run_sweep(SweepRequest::Pixel {
            register: "RmpFineTrm".into(),
            pixels: "all".into(),
            signal: "0".into(),
            expression: "0-2047".into(),
        })
        .await
        .unwrap();

    // Let a couple of points complete, then pull the plug.
    records.recv().await.unwrap();
    records.recv().await.unwrap();
    handle.abort().await.unwrap();

    wait_for_state(&handle, DeviceState::On).await;
    assert_eq!(handle.status(), "Measurement Aborted");
    for q in 1..=4 {
        let ppt = hub
            .device(&format!("SCS_CDIDET_DSSC/FPGA/PPT_Q{q}"))
            .unwrap();
        assert_ne!(ppt.state(), DeviceState::Acquiring);
        assert_ne!(ppt.state(), DeviceState::Started);
    }
}

#[tokio::test]
async fn second_sweep_is_rejected_while_one_runs() {
    let hub = detector_hub();
    let dir = tempfile::tempdir().unwrap();
    let handle = connected_control(&hub, dir.path()).await;

    let mut records = handle.records();
    handle
        .run_sweep(SweepRequest::Pixel {
            register: "RmpFineTrm".into(),
            pixels: "all".into(),
            signal: "0".into(),
            expression: "0-2047".into(),
        })
        .await
        .unwrap();
    records.recv().await.unwrap();

    // The device reports ACQUIRING, so the gate refuses a second sweep.
    let err = handle.acquire_bursts().await.unwrap_err();
    assert!(matches!(err, ControlError::NotAllowed { .. }));

    handle.abort().await.unwrap();
    wait_for_state(&handle, DeviceState::On).await;
}

#[tokio::test]
async fn dummy_data_round_trip() {
    let hub = detector_hub();
    let dir = tempfile::tempdir().unwrap();
    let handle = connected_control(&hub, dir.path()).await;

    handle.start_dummy_data().await.unwrap();
    let q1 = hub.device("SCS_CDIDET_DSSC/FPGA/PPT_Q1").unwrap();
    assert_eq!(q1.call_count("startAllChannelsDummyData"), 1);
    // STARTED on all quadrants fuses to ACQUIRING.
    wait_for_state(&handle, DeviceState::Acquiring).await;

    handle.stop_data_sending().await.unwrap();
    wait_for_state(&handle, DeviceState::On).await;
}
