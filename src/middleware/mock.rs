//! In-process mock middleware.
//!
//! Stands in for the real middleware during tests and demo runs: a
//! [`MockHub`] registry of [`MockDevice`]s with programmable properties,
//! states, and per-slot behavior. The `simulated_*` builders register
//! collaborators (PPT, power procedure, DAQ run controller) with just
//! enough behavior to drive the control devices through full sweeps
//! without hardware.

use super::{DeviceState, Hub, MiddlewareError, RemoteDevice, RemoteHandle, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

type SlotHandler = Arc<dyn Fn(&MockDevice) + Send + Sync>;

/// A scriptable fake remote device.
pub struct MockDevice {
    device_id: String,
    properties: Mutex<HashMap<String, watch::Sender<Value>>>,
    state_tx: watch::Sender<DeviceState>,
    lock_tx: watch::Sender<String>,
    slot_handlers: Mutex<HashMap<String, SlotHandler>>,
    call_log: Mutex<Vec<String>>,
    fail_slots: Mutex<Vec<String>>,
}

impl MockDevice {
    pub fn new(device_id: &str) -> Arc<Self> {
        let (state_tx, _) = watch::channel(DeviceState::Unknown);
        let (lock_tx, _) = watch::channel(String::new());
        Arc::new(Self {
            device_id: device_id.to_string(),
            properties: Mutex::new(HashMap::new()),
            state_tx,
            lock_tx,
            slot_handlers: Mutex::new(HashMap::new()),
            call_log: Mutex::new(Vec::new()),
            fail_slots: Mutex::new(Vec::new()),
        })
    }

    /// Set a property, notifying watchers.
    pub fn put(&self, property: &str, value: impl Into<Value>) {
        let value = value.into();
        let mut props = self.properties.lock().expect("mock poisoned");
        match props.get(property) {
            Some(tx) => {
                tx.send_replace(value);
            }
            None => {
                let (tx, _) = watch::channel(value);
                props.insert(property.to_string(), tx);
            }
        }
    }

    /// Read a property without going through the trait.
    pub fn peek(&self, property: &str) -> Option<Value> {
        self.properties
            .lock()
            .expect("mock poisoned")
            .get(property)
            .map(|tx| tx.borrow().clone())
    }

    pub fn set_state(&self, state: DeviceState) {
        self.state_tx.send_replace(state);
    }

    pub fn set_locked_by(&self, owner: &str) {
        self.lock_tx.send_replace(owner.to_string());
    }

    /// Register a handler run whenever `slot` is called.
    pub fn on_slot(&self, slot: &str, handler: impl Fn(&MockDevice) + Send + Sync + 'static) {
        self.slot_handlers
            .lock()
            .expect("mock poisoned")
            .insert(slot.to_string(), Arc::new(handler));
    }

    /// Make calls to `slot` return an error.
    pub fn fail_slot(&self, slot: &str) {
        self.fail_slots
            .lock()
            .expect("mock poisoned")
            .push(slot.to_string());
    }

    /// Every slot called so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.call_log.lock().expect("mock poisoned").clone()
    }

    pub fn call_count(&self, slot: &str) -> usize {
        self.call_log
            .lock()
            .expect("mock poisoned")
            .iter()
            .filter(|s| s.as_str() == slot)
            .count()
    }
}

#[async_trait]
impl RemoteDevice for MockDevice {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn get(&self, property: &str) -> Result<Value, MiddlewareError> {
        self.peek(property)
            .ok_or_else(|| MiddlewareError::NoSuchProperty {
                device: self.device_id.clone(),
                property: property.to_string(),
            })
    }

    async fn set(&self, property: &str, value: Value) -> Result<(), MiddlewareError> {
        self.put(property, value);
        Ok(())
    }

    async fn call(&self, slot: &str) -> Result<(), MiddlewareError> {
        self.call_log
            .lock()
            .expect("mock poisoned")
            .push(slot.to_string());
        if self
            .fail_slots
            .lock()
            .expect("mock poisoned")
            .iter()
            .any(|s| s == slot)
        {
            return Err(MiddlewareError::SlotFailed {
                device: self.device_id.clone(),
                slot: slot.to_string(),
                message: "scripted failure".into(),
            });
        }
        let handler = self
            .slot_handlers
            .lock()
            .expect("mock poisoned")
            .get(slot)
            .cloned();
        if let Some(handler) = handler {
            handler(self);
        }
        Ok(())
    }

    fn state(&self) -> DeviceState {
        *self.state_tx.borrow()
    }

    fn state_watch(&self) -> watch::Receiver<DeviceState> {
        self.state_tx.subscribe()
    }

    fn locked_by(&self) -> String {
        self.lock_tx.borrow().clone()
    }

    fn lock_watch(&self) -> watch::Receiver<String> {
        self.lock_tx.subscribe()
    }

    async fn lock(&self, owner: &str) -> Result<(), MiddlewareError> {
        self.lock_tx.send_replace(owner.to_string());
        Ok(())
    }

    async fn clear_lock(&self) -> Result<(), MiddlewareError> {
        self.lock_tx.send_replace(String::new());
        Ok(())
    }

    fn property_watch(&self, property: &str) -> Result<watch::Receiver<Value>, MiddlewareError> {
        let mut props = self.properties.lock().expect("mock poisoned");
        let tx = props.entry(property.to_string()).or_insert_with(|| {
            let (tx, _) = watch::channel(Value::None);
            tx
        });
        Ok(tx.subscribe())
    }
}

struct MockEntry {
    device: Arc<MockDevice>,
    online: Arc<AtomicBool>,
}

type InstantiateHook = Arc<dyn Fn(&MockDevice, &str) + Send + Sync>;

/// Registry of mock devices acting as the connection broker.
#[derive(Default)]
pub struct MockHub {
    devices: Mutex<HashMap<String, MockEntry>>,
    instantiate_hook: Mutex<Option<InstantiateHook>>,
}

impl MockHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a device as online.
    pub fn register(&self, device: Arc<MockDevice>) {
        self.devices.lock().expect("mock poisoned").insert(
            device.device_id.clone(),
            MockEntry {
                device,
                online: Arc::new(AtomicBool::new(true)),
            },
        );
    }

    pub fn device(&self, device_id: &str) -> Option<Arc<MockDevice>> {
        self.devices
            .lock()
            .expect("mock poisoned")
            .get(device_id)
            .map(|e| e.device.clone())
    }

    /// Override what happens when a device is re-instantiated from a
    /// stored configuration. The default marks it online in `ON`.
    pub fn on_instantiate(&self, hook: impl Fn(&MockDevice, &str) + Send + Sync + 'static) {
        *self.instantiate_hook.lock().expect("mock poisoned") = Some(Arc::new(hook));
    }
}

#[async_trait]
impl Hub for MockHub {
    async fn connect(&self, device_id: &str) -> Result<RemoteHandle, MiddlewareError> {
        let devices = self.devices.lock().expect("mock poisoned");
        match devices.get(device_id) {
            Some(entry) if entry.online.load(Ordering::SeqCst) => Ok(entry.device.clone()),
            _ => Err(MiddlewareError::DeviceNotFound(device_id.to_string())),
        }
    }

    fn online_devices(&self) -> Vec<String> {
        self.devices
            .lock()
            .expect("mock poisoned")
            .iter()
            .filter(|(_, e)| e.online.load(Ordering::SeqCst))
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn shutdown_device(&self, device_id: &str) -> Result<(), MiddlewareError> {
        let devices = self.devices.lock().expect("mock poisoned");
        let entry = devices
            .get(device_id)
            .ok_or_else(|| MiddlewareError::DeviceNotFound(device_id.to_string()))?;
        entry.online.store(false, Ordering::SeqCst);
        entry.device.set_state(DeviceState::Unknown);
        Ok(())
    }

    async fn instantiate(
        &self,
        device_id: &str,
        config_name: &str,
    ) -> Result<(), MiddlewareError> {
        let (device, online) = {
            let devices = self.devices.lock().expect("mock poisoned");
            let entry = devices
                .get(device_id)
                .ok_or_else(|| MiddlewareError::DeviceNotFound(device_id.to_string()))?;
            (entry.device.clone(), entry.online.clone())
        };
        online.store(true, Ordering::SeqCst);
        let hook = self.instantiate_hook.lock().expect("mock poisoned").clone();
        match hook {
            Some(hook) => hook(&device, config_name),
            None => device.set_state(DeviceState::On),
        }
        Ok(())
    }
}

static TRAIN_COUNTER: AtomicU64 = AtomicU64::new(1000);

/// Register a PPT controller with plausible slot behavior.
pub fn simulated_ppt(hub: &MockHub, device_id: &str, config_file: &str) -> Arc<MockDevice> {
    let ppt = MockDevice::new(device_id);
    ppt.set_state(DeviceState::On);
    ppt.put("fullConfigFileName", config_file);
    ppt.put("currentTrainId", 0u64);
    ppt.put("numBurstTrains", 20u64);
    ppt.put("numFramesToSendOut", 400u64);
    ppt.put("numPreBurstVetos", 10u64);
    ppt.put("numParallelColumns", 8u64);
    ppt.put("colSelectMode", "SKIP");
    ppt.put("columnSelect", "0-7");
    ppt.put("injectionMode", "CHARGE_BUSINJ");
    ppt.put("sendDummyData", false);

    ppt.on_slot("initSystem", |d| d.set_state(DeviceState::On));
    ppt.on_slot("runXFEL", |d| d.set_state(DeviceState::Acquiring));
    ppt.on_slot("runStandAlone", |d| d.set_state(DeviceState::Started));
    ppt.on_slot("startAllChannelsDummyData", |d| {
        d.set_state(DeviceState::Started)
    });
    ppt.on_slot("stopAcquisition", |d| d.set_state(DeviceState::On));
    ppt.on_slot("stopStandalone", |d| d.set_state(DeviceState::On));
    ppt.on_slot("startBurstAcquisition", |d| {
        // A burst reports a fresh, never-zero train id and the closing id
        // of the acquired range.
        let first = TRAIN_COUNTER.fetch_add(100, Ordering::SeqCst);
        let trains = d.peek("numBurstTrains").and_then(|v| v.as_u64()).unwrap_or(1);
        d.put("currentTrainId", first);
        d.put("lastTrainId", first + trains.saturating_sub(1));
    });

    hub.register(ppt.clone());
    ppt
}

/// Register a power procedure starting in `ON` (detector powered).
pub fn simulated_power_procedure(hub: &MockHub, device_id: &str) -> Arc<MockDevice> {
    let pp = MockDevice::new(device_id);
    pp.set_state(DeviceState::On);
    pp.on_slot("switchAsicsOn", |d| d.set_state(DeviceState::Active));
    pp.on_slot("switchHvOn", |d| d.set_state(DeviceState::Started));
    pp.on_slot("switchPlcOn", |d| d.set_state(DeviceState::Engaged));
    pp.on_slot("switchSourceOn", |d| d.set_state(DeviceState::On));
    pp.on_slot("switchSourceOff", |d| d.set_state(DeviceState::Engaged));
    pp.on_slot("switchPlcOff", |d| d.set_state(DeviceState::Started));
    pp.on_slot("switchHvOff", |d| d.set_state(DeviceState::Active));
    pp.on_slot("switchAsicsOff", |d| d.set_state(DeviceState::Passive));
    pp.on_slot("switchAllOff", |d| d.set_state(DeviceState::Passive));
    hub.register(pp.clone());
    pp
}

/// Register a DAQ run controller in `MONITORING`.
pub fn simulated_run_controller(hub: &MockHub, device_id: &str) -> Arc<MockDevice> {
    let rc = MockDevice::new(device_id);
    rc.set_state(DeviceState::Monitoring);
    rc.put("daqGlobalState", "MONITORING");
    rc.put("runNumber", 1u64);
    rc.on_slot("record", |d| {
        d.set_state(DeviceState::Acquiring);
        d.put("daqGlobalState", "ACQUIRING");
        let run = d.peek("runNumber").and_then(|v| v.as_u64()).unwrap_or(0);
        d.put("runNumber", run + 1);
    });
    rc.on_slot("tune", |d| {
        d.set_state(DeviceState::Monitoring);
        d.put("daqGlobalState", "MONITORING");
    });
    hub.register(rc.clone());
    rc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn properties_notify_watchers() {
        let dev = MockDevice::new("TEST/MOCK/1");
        dev.put("numBurstTrains", 20u64);
        let mut rx = dev.property_watch("numBurstTrains").unwrap();
        dev.put("numBurstTrains", 50u64);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_u64(), Some(50));
    }

    #[tokio::test]
    async fn hub_refuses_offline_devices() {
        let hub = MockHub::new();
        let dev = MockDevice::new("TEST/MOCK/1");
        hub.register(dev);
        assert!(hub.connect("TEST/MOCK/1").await.is_ok());
        hub.shutdown_device("TEST/MOCK/1").await.unwrap();
        assert!(matches!(
            hub.connect("TEST/MOCK/1").await,
            Err(MiddlewareError::DeviceNotFound(_))
        ));
        hub.instantiate("TEST/MOCK/1", "default").await.unwrap();
        assert!(hub.connect("TEST/MOCK/1").await.is_ok());
    }

    #[tokio::test]
    async fn scripted_slot_failure() {
        let dev = MockDevice::new("TEST/MOCK/1");
        dev.fail_slot("initSystem");
        assert!(dev.call("initSystem").await.is_err());
        assert_eq!(dev.call_count("initSystem"), 1);
    }

    #[tokio::test]
    async fn simulated_ppt_acquires() {
        let hub = MockHub::new();
        let ppt = simulated_ppt(&hub, "TEST/FPGA/PPT_Q1", "conf.conf");
        ppt.call("runXFEL").await.unwrap();
        assert_eq!(ppt.state(), DeviceState::Acquiring);
        ppt.call("startBurstAcquisition").await.unwrap();
        let tid = ppt.peek("currentTrainId").unwrap().as_u64().unwrap();
        assert_ne!(tid, 0);
    }
}
