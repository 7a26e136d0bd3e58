// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Thread-safe device directory.
//!
//! One mutex guards the whole map. Reads hand out deep copies taken entirely
//! under the lock, never references, because callers hold the returned
//! value on threads whose lifetime the registry does not control. The mutex
//! is never held across a callback.

use crate::error::{Error, Result};
use crate::types::{ActuatorCommand, Device, DeviceState, SensorSample, SlotRole};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Directory of all known devices, keyed by station name.
pub struct DeviceRegistry {
    inner: Mutex<HashMap<String, Device>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> DeviceRegistry {
        DeviceRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a device. Station names are unique; a duplicate fails.
    pub fn add_device(&self, device: Device) -> Result<()> {
        let mut map = self.inner.lock();
        if map.contains_key(&device.station) {
            return Err(Error::AlreadyExists);
        }
        log::debug!("[registry] add station={} slots={}", device.station, device.slots.len());
        map.insert(device.station.clone(), device);
        Ok(())
    }

    /// Drop a device and everything it owns.
    pub fn remove_device(&self, station: &str) -> Result<()> {
        let mut map = self.inner.lock();
        match map.remove(station) {
            Some(_) => {
                log::debug!("[registry] remove station={}", station);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Deep-copied snapshot of every device, taken under one lock hold.
    #[must_use]
    pub fn list_devices(&self) -> Vec<Device> {
        let map = self.inner.lock();
        let mut out: Vec<Device> = map.values().cloned().collect();
        out.sort_by(|a, b| a.station.cmp(&b.station));
        out
    }

    /// Deep copy of one device. The caller owns the copy; later registry
    /// mutation (including removal) does not affect it.
    pub fn get_device(&self, station: &str) -> Result<Device> {
        let map = self.inner.lock();
        map.get(station).cloned().ok_or(Error::NotFound)
    }

    pub fn contains(&self, station: &str) -> bool {
        self.inner.lock().contains_key(station)
    }

    pub fn set_device_state(&self, station: &str, state: DeviceState) -> Result<()> {
        let mut map = self.inner.lock();
        let dev = map.get_mut(station).ok_or(Error::NotFound)?;
        dev.state = state;
        Ok(())
    }

    /// Replace a device's slot table, resizing the point arrays to match.
    /// Used once per connect when discovery produced the layout.
    pub fn set_device_slots(&self, station: &str, slots: Vec<crate::types::SlotInfo>) -> Result<()> {
        let mut map = self.inner.lock();
        let dev = map.get_mut(station).ok_or(Error::NotFound)?;
        let sensor_count = slots.iter().filter(|s| s.role == SlotRole::Sensor).count();
        let actuator_count = slots.iter().filter(|s| s.role == SlotRole::Actuator).count();
        dev.slots = slots;
        dev.sensors = vec![SensorSample::default(); sensor_count];
        dev.actuators = vec![ActuatorCommand::default(); actuator_count];
        Ok(())
    }

    pub fn touch(&self, station: &str, now_ms: u64) {
        let mut map = self.inner.lock();
        if let Some(dev) = map.get_mut(station) {
            dev.last_seen_ms = now_ms;
        }
    }

    /// Store the latest sample for the sensor at `slot`.
    pub fn update_sensor(&self, station: &str, slot: u16, sample: SensorSample) -> Result<()> {
        let mut map = self.inner.lock();
        let dev = map.get_mut(station).ok_or(Error::NotFound)?;
        let idx = dev.sensor_index(slot).ok_or(Error::NotFound)?;
        dev.sensors[idx] = sample;
        Ok(())
    }

    /// Store the pending command for the actuator at `slot`.
    pub fn update_actuator(&self, station: &str, slot: u16, cmd: ActuatorCommand) -> Result<()> {
        let mut map = self.inner.lock();
        let dev = map.get_mut(station).ok_or(Error::NotFound)?;
        let idx = dev.actuator_index(slot).ok_or(Error::NotFound)?;
        dev.actuators[idx] = cmd;
        Ok(())
    }

    pub fn get_sensor(&self, station: &str, slot: u16) -> Result<SensorSample> {
        let map = self.inner.lock();
        let dev = map.get(station).ok_or(Error::NotFound)?;
        let idx = dev.sensor_index(slot).ok_or(Error::NotFound)?;
        Ok(dev.sensors[idx])
    }

    pub fn get_actuator(&self, station: &str, slot: u16) -> Result<ActuatorCommand> {
        let map = self.inner.lock();
        let dev = map.get(station).ok_or(Error::NotFound)?;
        let idx = dev.actuator_index(slot).ok_or(Error::NotFound)?;
        Ok(dev.actuators[idx])
    }
}
