//! Remote-device middleware abstraction.
//!
//! The control devices supervise hardware through a distributed-device
//! middleware. Only the narrow surface used here is modelled: connect to a
//! device by identity, read/write named properties, call slots, observe the
//! remote lifecycle state and lock owner, and wait for the next change on
//! any of a set of observed values.
//!
//! Change notification is modelled with [`tokio::sync::watch`] channels
//! rather than polling: every observed property and the remote state each
//! carry their own channel, and [`wait_until_any_changed`] multiplexes a
//! set of receivers with a timeout. This is the primitive both the state
//! fusion loop and the veto checker's property monitor are built on.

pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Lifecycle state of a device, local or remote.
///
/// The variants mirror the middleware's state vocabulary; any one device
/// only ever uses a subset (published as its allowed states).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    Unknown,
    Init,
    Off,
    On,
    Changing,
    Active,
    Passive,
    Started,
    Engaged,
    Stopped,
    Opening,
    Closing,
    Acquiring,
    Monitoring,
    Processing,
    Error,
}

impl DeviceState {
    /// The uppercase wire name, as shown to operators.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Unknown => "UNKNOWN",
            DeviceState::Init => "INIT",
            DeviceState::Off => "OFF",
            DeviceState::On => "ON",
            DeviceState::Changing => "CHANGING",
            DeviceState::Active => "ACTIVE",
            DeviceState::Passive => "PASSIVE",
            DeviceState::Started => "STARTED",
            DeviceState::Engaged => "ENGAGED",
            DeviceState::Stopped => "STOPPED",
            DeviceState::Opening => "OPENING",
            DeviceState::Closing => "CLOSING",
            DeviceState::Acquiring => "ACQUIRING",
            DeviceState::Monitoring => "MONITORING",
            DeviceState::Processing => "PROCESSING",
            DeviceState::Error => "ERROR",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dynamically typed property value.
///
/// Remote properties are schemaless from the client's point of view; this
/// enum covers the types the DSSC devices exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    UIntVec(Vec<u32>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32_vec(&self) -> Option<&[u32]> {
        match self {
            Value::UIntVec(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(u64::from(v))
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::UInt(u64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u32>> for Value {
    fn from(v: Vec<u32>) -> Self {
        Value::UIntVec(v)
    }
}

/// Errors surfaced by the middleware layer.
#[derive(Error, Debug, Clone)]
pub enum MiddlewareError {
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),

    #[error("Timeout talking to '{0}'")]
    Timeout(String),

    #[error("Device '{device}' has no property '{property}'")]
    NoSuchProperty { device: String, property: String },

    #[error("Slot '{slot}' on '{device}' failed: {message}")]
    SlotFailed {
        device: String,
        slot: String,
        message: String,
    },

    #[error("Device '{0}' went offline")]
    Disconnected(String),
}

/// A borrowed handle to one remote controller.
///
/// Handles are shared (other clients may hold the same remote device) and
/// invalidated only when the remote goes down. State and lock owner are
/// cached locally and observable without a round trip.
#[async_trait]
pub trait RemoteDevice: Send + Sync {
    /// The remote identity string.
    fn device_id(&self) -> &str;

    async fn get(&self, property: &str) -> Result<Value, MiddlewareError>;

    /// Write a property and wait for the acknowledgement.
    async fn set(&self, property: &str, value: Value) -> Result<(), MiddlewareError>;

    /// Call a slot and wait for it to return.
    async fn call(&self, slot: &str) -> Result<(), MiddlewareError>;

    /// The last known lifecycle state.
    fn state(&self) -> DeviceState;

    /// Observe lifecycle state changes.
    fn state_watch(&self) -> watch::Receiver<DeviceState>;

    /// Identity of the current lock owner, empty when unlocked.
    fn locked_by(&self) -> String;

    /// Observe lock-owner changes.
    fn lock_watch(&self) -> watch::Receiver<String>;

    /// Take the lock on behalf of `owner`.
    async fn lock(&self, owner: &str) -> Result<(), MiddlewareError>;

    /// Release the lock regardless of owner.
    async fn clear_lock(&self) -> Result<(), MiddlewareError>;

    /// Observe changes of a named property.
    fn property_watch(&self, property: &str) -> Result<watch::Receiver<Value>, MiddlewareError>;
}

/// Shared, borrowed remote handle.
pub type RemoteHandle = Arc<dyn RemoteDevice>;

/// Connection broker to the middleware.
#[async_trait]
pub trait Hub: Send + Sync {
    /// Connect to a remote device by identity.
    async fn connect(&self, device_id: &str) -> Result<RemoteHandle, MiddlewareError>;

    /// Identities of devices currently online.
    fn online_devices(&self) -> Vec<String>;

    /// Ask a remote device to shut down.
    async fn shutdown_device(&self, device_id: &str) -> Result<(), MiddlewareError>;

    /// Re-instantiate a device from a named stored configuration.
    async fn instantiate(&self, device_id: &str, config_name: &str)
        -> Result<(), MiddlewareError>;
}

/// Shared hub handle.
pub type HubHandle = Arc<dyn Hub>;

/// Wait until any of the given watch receivers reports a change, or the
/// timeout elapses. Returns `true` when a change was observed.
///
/// Receivers whose sender is gone count as "no further changes"; an empty
/// set simply sleeps out the timeout. Cancel-safe: dropping the future
/// loses no notification beyond the one being delivered.
pub async fn wait_until_any_changed<T>(
    receivers: &mut [watch::Receiver<T>],
    timeout: Duration,
) -> bool {
    if receivers.is_empty() {
        tokio::time::sleep(timeout).await;
        return false;
    }
    let any_changed = async {
        let changes = receivers
            .iter_mut()
            .map(|rx| Box::pin(rx.changed()))
            .collect::<Vec<_>>();
        let (first, _, _) = futures::future::select_all(changes).await;
        first.is_ok()
    };
    match tokio::time::timeout(timeout, any_changed).await {
        Ok(changed) => changed,
        Err(_) => false,
    }
}
