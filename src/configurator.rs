//! Detector configuration synchronizer.
//!
//! Watches the active configuration file of every quadrant PPT and
//! resolves it against a table of known-good gain configurations. The
//! quadrants are considered consistent when their base filenames match
//! after the quadrant-specific substring is stripped; a lone quadrant
//! running something else is an error the operator must see by name.
//!
//! `apply` switches the detector to a named configuration by
//! power-cycling the PPT devices: shut them down, wait a settle delay,
//! re-instantiate from the stored default configuration and point them at
//! the target's filenames. Any failure in that sequence is fatal and is
//! never retried automatically.

use crate::config::{ConfiguratorSettings, GainConfigurationRow};
use crate::error::{AppResult, ControlError};
use crate::middleware::{
    wait_until_any_changed, DeviceState, HubHandle, RemoteDevice, RemoteHandle, Value,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

const COMMAND_BUFFER: usize = 16;

enum ConfiguratorCommand {
    Apply(String, oneshot::Sender<AppResult<()>>),
    RequestConfiguration(String, oneshot::Sender<AppResult<String>>),
    Shutdown(oneshot::Sender<()>),
}

/// Client handle to a running configurator.
#[derive(Clone)]
pub struct ConfiguratorHandle {
    commands: mpsc::Sender<ConfiguratorCommand>,
    state: watch::Receiver<DeviceState>,
    status: watch::Receiver<String>,
    configuration: watch::Receiver<String>,
}

impl ConfiguratorHandle {
    pub fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<DeviceState> {
        self.state.clone()
    }

    pub fn status(&self) -> String {
        self.status.borrow().clone()
    }

    /// The resolved gain-configuration description.
    pub fn configuration(&self) -> String {
        self.configuration.borrow().clone()
    }

    pub fn configuration_watch(&self) -> watch::Receiver<String> {
        self.configuration.clone()
    }

    /// Switch the detector to the named gain configuration.
    pub async fn apply(&self, target: &str) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ConfiguratorCommand::Apply(target.to_string(), tx))
            .await
            .map_err(|_| ControlError::ActorGone)?;
        rx.await.map_err(|_| ControlError::ActorGone)?
    }

    /// Filename a quadrant should load for the currently selected target.
    pub async fn request_configuration(&self, quadrant_id: &str) -> AppResult<String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ConfiguratorCommand::RequestConfiguration(
                quadrant_id.to_string(),
                tx,
            ))
            .await
            .map_err(|_| ControlError::ActorGone)?;
        rx.await.map_err(|_| ControlError::ActorGone)?
    }

    pub async fn shutdown(&self) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ConfiguratorCommand::Shutdown(tx))
            .await
            .map_err(|_| ControlError::ActorGone)?;
        rx.await.map_err(|_| ControlError::ActorGone)
    }
}

/// Connect to the configured PPTs and spawn the synchronizer actor.
pub async fn spawn_configurator(
    hub: HubHandle,
    settings: ConfiguratorSettings,
) -> AppResult<ConfiguratorHandle> {
    let mut ppts = Vec::new();
    for row in settings.ppt_devices.iter().filter(|row| row.connect) {
        let handle = hub.connect(&row.device_id).await?;
        ppts.push((row.quadrant_id.clone(), handle));
    }
    if ppts.is_empty() {
        return Err(ControlError::Validation(
            "No PPT devices enabled for configuration monitoring".into(),
        ));
    }

    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let state_tx = watch::channel(DeviceState::Active).0;
    let status_tx = watch::channel(String::new()).0;
    let configuration_tx = watch::channel(String::new()).0;

    let handle = ConfiguratorHandle {
        commands: command_tx,
        state: state_tx.subscribe(),
        status: status_tx.subscribe(),
        configuration: configuration_tx.subscribe(),
    };

    let actor = ConfiguratorActor {
        hub,
        settings,
        ppts,
        state_tx,
        status_tx,
        configuration_tx,
    };
    tokio::spawn(actor.run(command_rx));
    Ok(handle)
}

struct ConfiguratorActor {
    hub: HubHandle,
    settings: ConfiguratorSettings,
    ppts: Vec<(String, RemoteHandle)>,
    state_tx: watch::Sender<DeviceState>,
    status_tx: watch::Sender<String>,
    configuration_tx: watch::Sender<String>,
}

impl ConfiguratorActor {
    async fn run(mut self, mut commands: mpsc::Receiver<ConfiguratorCommand>) {
        let monitor_timeout = Duration::from_secs(self.settings.monitor_timeout_secs);
        loop {
            // Rebuilt every cycle so re-instantiated PPTs are picked up.
            let mut watches: Vec<watch::Receiver<Value>> = match self
                .ppts
                .iter()
                .map(|(_, h)| h.property_watch("fullConfigFileName"))
                .collect()
            {
                Ok(watches) => watches,
                Err(err) => {
                    error!(%err, "Lost a configuration watch");
                    self.state_tx.send_replace(DeviceState::Error);
                    return;
                }
            };
            self.refresh(&watches);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(ConfiguratorCommand::Apply(target, reply)) => {
                        reply.send(self.apply(&target).await).ok();
                    }
                    Some(ConfiguratorCommand::RequestConfiguration(quadrant, reply)) => {
                        reply.send(self.target_filename(&quadrant)).ok();
                    }
                    Some(ConfiguratorCommand::Shutdown(reply)) => {
                        reply.send(()).ok();
                        return;
                    }
                    None => return,
                },
                _ = wait_until_any_changed(&mut watches, monitor_timeout) => {}
            }
        }
    }

    fn set_status(&self, line: impl Into<String>) {
        self.status_tx.send_replace(line.into());
    }

    /// Re-resolve the quadrant configurations into one description.
    fn refresh(&mut self, watches: &[watch::Receiver<Value>]) {
        let configs: Vec<(String, String)> = self
            .ppts
            .iter()
            .zip(watches)
            .map(|((quadrant, _), rx)| {
                let file = rx
                    .borrow()
                    .as_str()
                    .map(basename)
                    .unwrap_or_default();
                (quadrant.clone(), file)
            })
            .collect();

        let stripped: Vec<(String, String)> = configs
            .iter()
            .map(|(quadrant, file)| (quadrant.clone(), strip_quadrant(file, quadrant)))
            .collect();

        let differing = differing_quadrants(&stripped);
        if !differing.is_empty() {
            let message = format!(
                "Quadrants have differing configurations: {}",
                differing.join(", ")
            );
            if *self.state_tx.borrow() != DeviceState::Error {
                warn!("{message}");
            }
            self.state_tx.send_replace(DeviceState::Error);
            self.set_status(message);
            return;
        }

        let description = match self.lookup(&configs) {
            Some(row) => row.description.clone(),
            None => {
                let fallback = stripped
                    .first()
                    .map(|(_, file)| file.clone())
                    .unwrap_or_default();
                warn!(configuration = %fallback, "Configuration not in the lookup table");
                fallback
            }
        };
        if *self.configuration_tx.borrow() != description {
            info!(%description, "Detector gain configuration");
            self.configuration_tx.send_replace(description);
        }
        if *self.state_tx.borrow() == DeviceState::Error {
            self.state_tx.send_replace(DeviceState::Active);
            self.set_status("Configurations consistent");
        }
    }

    fn lookup(&self, configs: &[(String, String)]) -> Option<&GainConfigurationRow> {
        self.settings.gain_configurations.iter().find(|row| {
            configs.iter().all(|(quadrant, file)| {
                row.filename_for(quadrant)
                    .is_some_and(|expected| basename(expected) == *file)
            })
        })
    }

    /// Power-cycle every PPT into the target configuration. Fatal on the
    /// first failure; the operator decides what happens next.
    async fn apply(&mut self, target: &str) -> AppResult<()> {
        let row = self
            .settings
            .gain_configurations
            .iter()
            .find(|row| row.description == target)
            .cloned()
            .ok_or_else(|| {
                ControlError::Validation(format!("Unknown gain configuration '{target}'"))
            })?;
        if self.ppts.iter().any(|(_, h)| h.state() == DeviceState::Init) {
            return Err(ControlError::Validation(
                "A PPT is still initializing".into(),
            ));
        }

        self.state_tx.send_replace(DeviceState::Changing);
        self.set_status(format!("Applying configuration '{target}'"));
        let shutdown_timeout = Duration::from_secs(self.settings.shutdown_timeout_secs);

        for (quadrant, handle) in &self.ppts {
            let device_id = handle.device_id().to_string();
            match tokio::time::timeout(shutdown_timeout, self.hub.shutdown_device(&device_id))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return self.fail(quadrant, err.into()),
                Err(_) => {
                    return self.fail(
                        quadrant,
                        crate::middleware::MiddlewareError::Timeout(device_id).into(),
                    )
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(self.settings.settle_ms)).await;

        for i in 0..self.ppts.len() {
            let (quadrant, handle) = self.ppts[i].clone();
            let device_id = handle.device_id().to_string();
            if let Err(err) = self.hub.instantiate(&device_id, "default").await {
                return self.fail(&quadrant, err.into());
            }
            let fresh = match self.hub.connect(&device_id).await {
                Ok(fresh) => fresh,
                Err(err) => return self.fail(&quadrant, err.into()),
            };
            if let Some(filename) = row.filename_for(&quadrant) {
                if let Err(err) = fresh
                    .set("fullConfigFileName", Value::from(filename))
                    .await
                {
                    return self.fail(&quadrant, err.into());
                }
            }
            self.ppts[i].1 = fresh;
        }

        self.state_tx.send_replace(DeviceState::Active);
        self.configuration_tx.send_replace(target.to_string());
        self.set_status(format!("Configuration '{target}' applied"));
        Ok(())
    }

    fn target_filename(&self, quadrant_id: &str) -> AppResult<String> {
        let target = &self.settings.target;
        self.settings
            .gain_configurations
            .iter()
            .find(|row| row.description == *target)
            .and_then(|row| row.filename_for(quadrant_id))
            .map(str::to_string)
            .ok_or_else(|| {
                ControlError::Validation(format!(
                    "No configuration for {quadrant_id} in target '{target}'"
                ))
            })
    }

    fn fail(&self, quadrant: &str, err: ControlError) -> AppResult<()> {
        error!(quadrant, %err, "Configuration change failed");
        self.state_tx.send_replace(DeviceState::Error);
        self.set_status(format!("Configuration change failed on {quadrant}: {err}"));
        Err(err)
    }
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Remove the quadrant-specific substring, upper- or lowercase.
fn strip_quadrant(filename: &str, quadrant_id: &str) -> String {
    filename
        .replace(quadrant_id, "")
        .replace(&quadrant_id.to_ascii_lowercase(), "")
}

/// Quadrants whose stripped filename deviates from the most common one.
fn differing_quadrants(stripped: &[(String, String)]) -> Vec<String> {
    let reference = match most_common(stripped) {
        Some(reference) => reference,
        None => return Vec::new(),
    };
    stripped
        .iter()
        .filter(|(_, file)| *file != reference)
        .map(|(quadrant, _)| quadrant.clone())
        .collect()
}

fn most_common(stripped: &[(String, String)]) -> Option<String> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for (_, file) in stripped {
        match counts.iter_mut().find(|(f, _)| f == file) {
            Some((_, n)) => *n += 1,
            None => counts.push((file, 1)),
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, n)| *n)
        .map(|(file, _)| file.to_string())
}
