use anyhow::Context;
use clap::{Parser, Subcommand};
use dssc_control::config::Settings;
use dssc_control::control::{spawn_control, SweepRequest};
use dssc_control::middleware::mock::{
    simulated_power_procedure, simulated_ppt, simulated_run_controller, MockHub,
};
use dssc_control::middleware::{DeviceState, HubHandle};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dssc_control", about = "DSSC detector control", version)]
struct Cli {
    /// Configuration name under config/, without extension.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the configuration, then exit.
    CheckConfig,
    /// Run a sweep against simulated detector devices.
    Simulate {
        /// Pixel register to sweep.
        #[arg(long, default_value = "RmpFineTrm")]
        register: String,
        /// Sweep expression, e.g. "0-2", "range(0,8,2)" or "[1,4,9]".
        #[arg(long, default_value = "0-2")]
        expression: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref()).context("loading configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::CheckConfig => {
            info!(
                ppts = settings.control.ppt_devices.len(),
                expert_mode = settings.control.expert_mode,
                "Configuration OK"
            );
            Ok(())
        }
        Command::Simulate {
            register,
            expression,
        } => simulate(settings, register, expression).await,
    }
}

/// Bring up a simulated detector matching the configuration and run one
/// pixel-register sweep through the full control stack.
async fn simulate(settings: Settings, register: String, expression: String) -> anyhow::Result<()> {
    let hub = MockHub::new();
    for row in &settings.control.ppt_devices {
        simulated_ppt(
            &hub,
            &row.device_id,
            &format!("gain_{}_default.conf", row.quadrant_id),
        );
    }
    simulated_power_procedure(&hub, &settings.control.power_procedure);
    simulated_run_controller(&hub, &settings.control.run_controller);
    let hub: HubHandle = hub;

    let handle = spawn_control(hub, settings.control);
    handle.connect_devices().await?;
    wait_for_state(&handle, DeviceState::On).await?;
    info!(quadrants = %handle.connected_quadrants(), "Detector simulated and connected");

    let mut records = handle.records();
    handle
        .run_sweep(SweepRequest::Pixel {
            register,
            pixels: "all".into(),
            signal: "0".into(),
            expression,
        })
        .await?;

    let mut status = handle.status_watch();
    loop {
        tokio::select! {
            record = records.recv() => {
                if let Ok(record) = record {
                    info!(
                        point = record.index,
                        directory = %record.directory,
                        first_trains = ?record.first_trains,
                        "Measurement point complete"
                    );
                }
            }
            changed = status.changed() => {
                changed.ok();
                let line = status.borrow_and_update().clone();
                info!(status = %line);
                if handle.state() != DeviceState::Acquiring {
                    break;
                }
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}

async fn wait_for_state(
    handle: &dssc_control::control::ControlHandle,
    expected: DeviceState,
) -> anyhow::Result<()> {
    let mut rx = handle.state_watch();
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            if *rx.borrow_and_update() == expected {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .context("device did not reach the expected state")
}
