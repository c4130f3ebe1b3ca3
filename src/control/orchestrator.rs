//! Measurement-sweep orchestration.
//!
//! A sweep walks one or two detector parameters over their settings and
//! takes a burst of data at every point, bracketing each point (or the
//! whole sweep) in a DAQ run. The flow is the same for every parameter
//! kind: validate the request, quiesce the detector, program the common
//! acquisition settings, persist the sweep descriptor, then drive the flat
//! point iterator with an abort check before every point. Teardown always
//! runs, so an aborted or failed sweep still stops the detector, closes
//! the DAQ run and leaves a complete descriptor on disk.

use super::session::{MeasurementInfo, MeasurementRecord, MeasurementSession};
use super::SweepSettings;
use crate::aggregator::{call_many, set_many, Session};
use crate::config::ControlSettings;
use crate::error::{AppResult, ControlError};
use crate::middleware::{wait_until_any_changed, RemoteDevice, RemoteHandle, Value};
use crate::sweep::{SweepAxis, SweepPlan, SweepPoint, INVALID_EXPRESSION};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

const REMOTE_TIMEOUT: Duration = Duration::from_secs(10);
const DAQ_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Operator status lines for sweep completion.
pub const MEASUREMENT_FINISHED: &str = "Measurement Finished";
pub const MEASUREMENT_ABORTED: &str = "Measurement Aborted";

/// One requested measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepRequest {
    /// Sweep a pixel-register value over a pixel selection.
    Pixel {
        register: String,
        pixels: String,
        signal: String,
        expression: String,
    },
    /// Sweep the charge-injection value, section by column section.
    Injection { expression: String },
    /// Sweep a burst parameter, optionally against a second one.
    Burst {
        parameter: String,
        expression: String,
        outer: Option<(String, String)>,
    },
    /// Sweep a sequencer parameter.
    Sequencer { parameter: String, expression: String },
    /// Take one burst of data without sweeping anything.
    AcquireBursts,
}

/// Everything a running sweep needs, handed to the spawned sweep task by
/// the device actor.
pub struct SweepContext {
    pub session: Session,
    pub settings: ControlSettings,
    pub sweep: SweepSettings,
    pub abort: Arc<AtomicBool>,
    pub status: Arc<watch::Sender<String>>,
    pub measurement_number: Arc<watch::Sender<u64>>,
    pub records: broadcast::Sender<MeasurementRecord>,
}

impl SweepContext {
    fn ppts(&self) -> Vec<RemoteHandle> {
        self.session.ppt_handles()
    }

    fn check_abort(&self) -> AppResult<()> {
        if self.abort.load(Ordering::SeqCst) {
            Err(ControlError::Aborted)
        } else {
            Ok(())
        }
    }

    fn set_status(&self, line: impl Into<String>) {
        self.status.send_replace(line.into());
    }
}

fn parse_axis(name: &str, expression: &str) -> AppResult<SweepAxis> {
    SweepAxis::parse(name, expression)
        .map_err(|_| ControlError::Validation(INVALID_EXPRESSION.to_string()))
}

/// Run one sweep to completion. Returns the descriptor path on success;
/// teardown and descriptor finalization happen on every exit path.
pub async fn run_sweep(ctx: &SweepContext, request: SweepRequest) -> AppResult<PathBuf> {
    let ppts = ctx.ppts();
    let mut prevetos = ctx.sweep.num_preburst_vetos;

    // Resolve the request into a plan and a measurement name. Injection
    // sweeps walk the column sections as the outer axis, and in adjustable
    // injection mode the detector needs a long veto head start.
    let (plan, name, injection_mode) = match &request {
        SweepRequest::Pixel { register, expression, .. } => {
            let axis = parse_axis(register, expression)?;
            let name = format!("{register} Sweep");
            (Some(SweepPlan::new(axis, None)?), name, None)
        }
        SweepRequest::Injection { expression } => {
            let mode = ppts
                .first()
                .ok_or_else(|| ControlError::Validation("No PPTs connected".into()))?
                .get("injectionMode")
                .await?
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| ControlError::Validation("injectionMode is not a string".into()))?;
            if mode.contains("ADJ_INJ") && prevetos < 400 {
                warn!(prevetos, "Raising preburst vetos for adjustable injection");
                prevetos = 600;
            }
            let inner = parse_axis(&mode, expression)?;
            let sections = column_sections(&ppts).await?;
            let outer = SweepAxis::new("column_section", (0..sections).collect());
            let name = format!("{mode} Sweep");
            (Some(SweepPlan::new(inner, Some(outer))?), name, Some(mode))
        }
        SweepRequest::Burst {
            parameter,
            expression,
            outer,
        } => {
            let inner = parse_axis(parameter, expression)?;
            let outer = match outer {
                Some((outer_name, outer_expr)) => Some(parse_axis(outer_name, outer_expr)?),
                None => None,
            };
            let name = format!("{parameter} Sweep");
            (Some(SweepPlan::new(inner, outer)?), name, None)
        }
        SweepRequest::Sequencer { parameter, expression } => {
            if parameter == "cycle_length" {
                return Err(ControlError::Validation(
                    "Sweeping cycle_length would desynchronize the detector".into(),
                ));
            }
            let axis = parse_axis(parameter, expression)?;
            let name = format!("{parameter} Sweep");
            (Some(SweepPlan::new(axis, None)?), name, None)
        }
        SweepRequest::AcquireBursts => (None, "BurstMeasurement".to_string(), None),
    };

    // Quiesce, then program the acquisition settings common to all kinds.
    stop_data_sending(ctx).await?;
    set_many(
        &ppts,
        "numBurstTrains",
        Value::from(ctx.sweep.num_burst_trains),
        REMOTE_TIMEOUT,
    )
    .await?;
    set_many(
        &ppts,
        "numFramesToSendOut",
        Value::from(ctx.sweep.num_frames_to_send_out),
        REMOTE_TIMEOUT,
    )
    .await?;
    set_many(&ppts, "numPreBurstVetos", Value::from(prevetos), REMOTE_TIMEOUT).await?;

    let column_selection = ppts
        .first()
        .ok_or_else(|| ControlError::Validation("No PPTs connected".into()))?
        .get("columnSelect")
        .await
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    let info = MeasurementInfo::capture(
        &name,
        plan.as_ref(),
        &ctx.session,
        PathBuf::new(),
        ctx.sweep.num_burst_trains,
        prevetos,
        column_selection,
        injection_mode,
    )
    .await?;
    let mut measurement = MeasurementSession::begin(&ctx.settings.output_dir, info).await?;
    info!(directory = %measurement.run_directory().display(), "Starting {name}");

    start_data_sending(ctx).await?;

    let bracket_whole_sweep = ctx.sweep.save_data && ctx.sweep.single_run;
    if bracket_whole_sweep {
        daq_record(ctx).await?;
    }

    let result = run_points(ctx, &request, plan.as_ref(), &mut measurement).await;

    if bracket_whole_sweep {
        if let Err(err) = daq_tune(ctx).await {
            warn!(%err, "Failed to close the DAQ run");
        }
    }
    if let Err(err) = stop_data_sending(ctx).await {
        warn!(%err, "Failed to stop data sending after the sweep");
    }
    if !ctx.session.processors.is_empty() {
        if let Err(err) =
            call_many(&ctx.session.processors, "finalizeHistograms", REMOTE_TIMEOUT).await
        {
            warn!(%err, "Histogram finalization failed");
        }
    }

    let aborted = matches!(result, Err(ControlError::Aborted));
    let descriptor = measurement.finalize(aborted).await?;
    match result {
        Ok(()) => {
            ctx.set_status(MEASUREMENT_FINISHED);
            Ok(descriptor)
        }
        Err(err) => {
            if aborted {
                ctx.set_status(MEASUREMENT_ABORTED);
            } else {
                ctx.set_status(format!("Measurement failed: {err}"));
            }
            Err(err)
        }
    }
}

async fn run_points(
    ctx: &SweepContext,
    request: &SweepRequest,
    plan: Option<&SweepPlan>,
    measurement: &mut MeasurementSession,
) -> AppResult<()> {
    let bracket_each_point = ctx.sweep.save_data && !ctx.sweep.single_run;
    let points: Vec<SweepPoint> = match plan {
        Some(plan) => plan.points().collect(),
        None => vec![SweepPoint {
            index: 0,
            outer: None,
            outer_changed: true,
            inner: 0,
        }],
    };

    for point in points {
        ctx.check_abort()?;
        ctx.measurement_number.send_replace(point.index as u64);
        if let Some(plan) = plan {
            ctx.set_status(status_line(plan, &point));
            if point.outer_changed {
                apply_outer(ctx, request, plan, &point).await?;
            }
            apply_inner(ctx, request, &point).await?;
        } else {
            ctx.set_status("Measuring: burst");
        }

        if bracket_each_point {
            daq_record(ctx).await?;
        }
        let acquired = acquire_point(ctx).await;
        if bracket_each_point {
            if let Err(err) = daq_tune(ctx).await {
                warn!(%err, "Failed to close the DAQ run");
            }
        }
        let (first_trains, last_trains) = acquired?;

        let record = MeasurementRecord {
            index: point.index,
            directory: plan
                .map(|p| p.directory_label(&point))
                .unwrap_or_else(|| "burst".to_string()),
            settings: point_settings(plan, &point),
            first_trains,
            last_trains,
        };
        ctx.records.send(record.clone()).ok();
        measurement.record(record);
    }
    Ok(())
}

fn point_settings(plan: Option<&SweepPlan>, point: &SweepPoint) -> Vec<(String, i64)> {
    let Some(plan) = plan else {
        return Vec::new();
    };
    let mut settings = vec![(plan.inner_axis().name.clone(), point.inner)];
    if let (Some(outer), Some(value)) = (plan.outer_axis(), point.outer) {
        settings.push((outer.name.clone(), value));
    }
    settings
}

fn status_line(plan: &SweepPlan, point: &SweepPoint) -> String {
    let inner = plan.inner_axis();
    let inner_last = inner.last().unwrap_or(point.inner);
    match (plan.outer_axis(), point.outer) {
        (Some(outer), Some(value)) => format!(
            "Measuring: {} {}/{} {} {}/{}",
            outer.name,
            value,
            outer.last().unwrap_or(value),
            inner.name,
            point.inner,
            inner_last
        ),
        _ => format!("Measuring: {} {}/{}", inner.name, point.inner, inner_last),
    }
}

/// Program the outer-axis setting for the upcoming block of points.
async fn apply_outer(
    ctx: &SweepContext,
    request: &SweepRequest,
    plan: &SweepPlan,
    point: &SweepPoint,
) -> AppResult<()> {
    let ppts = ctx.ppts();
    let Some(value) = point.outer else {
        // First point of a one-axis sweep: program the selection once.
        if let SweepRequest::Pixel {
            register,
            pixels,
            signal,
            ..
        } = request
        {
            prepare_pixel_selection(&ppts, register, pixels, signal).await?;
        }
        return Ok(());
    };
    match request {
        SweepRequest::Injection { .. } => {
            set_many(&ppts, "pixelsColSelect", Value::from(value), REMOTE_TIMEOUT).await?;
            call_many(&ppts, "setCurrentColSkipOn", REMOTE_TIMEOUT).await?;
            Ok(())
        }
        SweepRequest::Burst { outer: Some((name, _)), .. } => {
            program_burst_parameter(&ppts, name, value).await
        }
        _ => {
            // Only injection and two-parameter burst sweeps have an outer
            // axis; anything else here is a plan construction bug.
            Err(ControlError::Validation(format!(
                "Unexpected outer axis '{}'",
                plan.outer_axis().map(|a| a.name.as_str()).unwrap_or("?")
            )))
        }
    }
}

async fn apply_inner(
    ctx: &SweepContext,
    request: &SweepRequest,
    point: &SweepPoint,
) -> AppResult<()> {
    let ppts = ctx.ppts();
    let value = point.inner;
    match request {
        SweepRequest::Pixel { .. } => {
            set_many(&ppts, "selValue", Value::from(value), REMOTE_TIMEOUT).await?;
            call_many(&ppts, "progSelReg", REMOTE_TIMEOUT).await
        }
        SweepRequest::Injection { .. } => {
            set_many(&ppts, "injectionValue", Value::from(value), REMOTE_TIMEOUT).await
        }
        SweepRequest::Burst { parameter, .. } => {
            program_burst_parameter(&ppts, parameter, value).await
        }
        SweepRequest::Sequencer { parameter, .. } => {
            set_many(
                &ppts,
                &format!("sequencer.{parameter}"),
                Value::from(value),
                REMOTE_TIMEOUT,
            )
            .await?;
            call_many(&ppts, "programSequencer", REMOTE_TIMEOUT).await
        }
        SweepRequest::AcquireBursts => Ok(()),
    }
}

async fn prepare_pixel_selection(
    ppts: &[RemoteHandle],
    register: &str,
    pixels: &str,
    signal: &str,
) -> AppResult<()> {
    set_many(ppts, "selRegName", Value::from(register), REMOTE_TIMEOUT).await?;
    set_many(ppts, "selPixels", Value::from(pixels), REMOTE_TIMEOUT).await?;
    set_many(ppts, "selPixelSignal", Value::from(signal), REMOTE_TIMEOUT).await?;
    call_many(ppts, "preProgSelReg", REMOTE_TIMEOUT).await
}

async fn program_burst_parameter(
    ppts: &[RemoteHandle],
    parameter: &str,
    value: i64,
) -> AppResult<()> {
    set_many(
        ppts,
        &format!("burstParams.{parameter}"),
        Value::from(value),
        REMOTE_TIMEOUT,
    )
    .await?;
    // The start wait offset has its own fast update path; everything else,
    // start_wait_time included, requires recomputing the sequence counters.
    let slot = if parameter == "start_wait_offs" {
        "updateStartWaitOffset"
    } else {
        "updateSequenceCounters"
    };
    call_many(ppts, slot, REMOTE_TIMEOUT).await
}

async fn column_sections(ppts: &[RemoteHandle]) -> AppResult<i64> {
    let parallel = ppts
        .first()
        .ok_or_else(|| ControlError::Validation("No PPTs connected".into()))?
        .get("numParallelColumns")
        .await?
        .as_i64()
        .filter(|v| *v > 0 && 64 % *v == 0)
        .ok_or_else(|| {
            ControlError::Validation("numParallelColumns must divide 64".into())
        })?;
    Ok(64 / parallel)
}

/// Start one burst on every PPT and resolve the train-id range it covers.
///
/// A PPT still reports train id 0 right after the start call; the sentinel
/// is polled away rather than treated as data.
async fn acquire_point(ctx: &SweepContext) -> AppResult<(Vec<u64>, Vec<u64>)> {
    let ppts = ctx.ppts();
    call_many(&ppts, "startBurstAcquisition", REMOTE_TIMEOUT).await?;

    let poll = Duration::from_millis(ctx.settings.train_id_poll_ms);
    let mut first_trains = Vec::with_capacity(ppts.len());
    for ppt in &ppts {
        let first = loop {
            ctx.check_abort()?;
            match ppt.get("currentTrainId").await?.as_u64() {
                Some(0) | None => {
                    warn!(device = %ppt.device_id(), "Train id not yet available");
                    tokio::time::sleep(poll).await;
                }
                Some(tid) => break tid,
            }
        };
        first_trains.push(first);
    }
    let mut last_trains = Vec::with_capacity(ppts.len());
    for (ppt, first) in ppts.iter().zip(&first_trains) {
        // The head publishes the closing train id of the burst; until it
        // does, derive it from the configured train count.
        let derived = first + ctx.sweep.num_burst_trains.saturating_sub(1);
        let last = match ppt.get("lastTrainId").await {
            Ok(value) => value.as_u64().filter(|tid| *tid >= *first).unwrap_or(derived),
            Err(_) => derived,
        };
        last_trains.push(last);
    }
    Ok((first_trains, last_trains))
}

async fn start_data_sending(ctx: &SweepContext) -> AppResult<()> {
    call_many(&ctx.ppts(), "runXFEL", REMOTE_TIMEOUT).await
}

async fn stop_data_sending(ctx: &SweepContext) -> AppResult<()> {
    call_many(&ctx.ppts(), "stopAcquisition", REMOTE_TIMEOUT).await
}

async fn daq_record(ctx: &SweepContext) -> AppResult<()> {
    ctx.session.run_controller.call("record").await?;
    wait_for_daq_state(ctx, "ACQUIRING").await
}

async fn daq_tune(ctx: &SweepContext) -> AppResult<()> {
    ctx.session.run_controller.call("tune").await?;
    wait_for_daq_state(ctx, "MONITORING").await
}

async fn wait_for_daq_state(ctx: &SweepContext, expected: &str) -> AppResult<()> {
    let rc = &ctx.session.run_controller;
    let rx = rc.property_watch("daqGlobalState")?;
    let deadline = tokio::time::Instant::now() + DAQ_STATE_TIMEOUT;
    let mut watches = vec![rx];
    loop {
        if watches[0].borrow().as_str() == Some(expected) {
            return Ok(());
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(crate::middleware::MiddlewareError::Timeout(
                rc.device_id().to_string(),
            )
            .into());
        }
        wait_until_any_changed(&mut watches, remaining).await;
    }
}
