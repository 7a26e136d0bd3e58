// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared data model: devices, slots, samples, commands.
//!
//! Wire encoding for [`SensorSample`] and [`ActuatorCommand`] is bit-exact
//! (sensor: big-endian f32 + quality byte, 5 bytes; actuator: command +
//! pwm duty + two reserved bytes, 4 bytes).

use crate::error::{Error, Result};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

// ============================================================================
// MAC address
// ============================================================================

/// An Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut out = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 {
                return Err(Error::InvalidParam(format!("MAC has too many octets: {}", s)));
            }
            out[count] = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidParam(format!("bad MAC octet in {}", s)))?;
            count += 1;
        }
        if count != 6 {
            return Err(Error::InvalidParam(format!("MAC has {} octets: {}", count, s)));
        }
        Ok(MacAddr(out))
    }
}

// ============================================================================
// Slots
// ============================================================================

/// Direction/role of a (slot, subslot) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    /// Device produces data, controller consumes (input IOCR).
    Sensor,
    /// Controller produces data, device consumes (output IOCR).
    Actuator,
}

/// Domain-level tag of a field point. Purely informational for the stack;
/// the upper application keys alarm/control behavior off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointTag {
    Ph,
    Turbidity,
    FreeChlorine,
    Flow,
    Pressure,
    Level,
    Temperature,
    Pump,
    Valve,
    DosingPump,
    UvLamp,
    #[default]
    Generic,
}

/// One entry of a device's discovered slot table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot: u16,
    pub subslot: u16,
    pub role: SlotRole,
    pub tag: PointTag,
    pub module_ident: u32,
    pub submodule_ident: u32,
    /// Fixed per-submodule cyclic data length in bytes.
    pub data_length: u16,
}

impl SlotInfo {
    /// Sensor slot with the fixed 5-byte sample layout.
    #[must_use]
    pub fn sensor(slot: u16, tag: PointTag) -> Self {
        SlotInfo {
            slot,
            subslot: 1,
            role: SlotRole::Sensor,
            tag,
            module_ident: crate::ar::profile::SENSOR_MODULE_IDENT,
            submodule_ident: crate::ar::profile::SENSOR_SUBMODULE_IDENT,
            data_length: SensorSample::WIRE_LEN as u16,
        }
    }

    /// Actuator slot with the fixed 4-byte command layout.
    #[must_use]
    pub fn actuator(slot: u16, tag: PointTag) -> Self {
        SlotInfo {
            slot,
            subslot: 1,
            role: SlotRole::Actuator,
            tag,
            module_ident: crate::ar::profile::ACTUATOR_MODULE_IDENT,
            submodule_ident: crate::ar::profile::ACTUATOR_SUBMODULE_IDENT,
            data_length: ActuatorCommand::WIRE_LEN as u16,
        }
    }
}

/// Module layout tuple shared by Record Read 0xF844, the GSDML cache and the
/// HTTP slot-list fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleEntry {
    pub slot: u16,
    pub subslot: u16,
    pub module_ident: u32,
    pub submodule_ident: u32,
}

// ============================================================================
// Samples and commands
// ============================================================================

/// Quality classification carried in the sensor status byte (mask 0xC0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
    NotConnected,
}

impl Quality {
    #[must_use]
    pub fn from_status(quality: u8) -> Quality {
        match quality & 0xC0 {
            0x00 => Quality::Good,
            0x40 => Quality::Uncertain,
            0x80 => Quality::Bad,
            _ => Quality::NotConnected,
        }
    }
}

/// One cyclic sensor reading (5 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorSample {
    pub value: f32,
    pub quality: u8,
    /// Controller-side ingest time, milliseconds since controller start.
    pub timestamp_ms: u64,
}

impl SensorSample {
    pub const WIRE_LEN: usize = 5;

    /// Decode from the fixed wire layout: big-endian f32 followed by the
    /// quality byte. `timestamp_ms` is supplied by the ingest path.
    pub fn decode(data: &[u8], timestamp_ms: u64) -> Result<SensorSample> {
        if data.len() < Self::WIRE_LEN {
            return Err(Error::Protocol(format!(
                "sensor sample needs {} bytes, got {}",
                Self::WIRE_LEN,
                data.len()
            )));
        }
        let value = f32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        Ok(SensorSample {
            value,
            quality: data[4],
            timestamp_ms,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let v = self.value.to_be_bytes();
        [v[0], v[1], v[2], v[3], self.quality]
    }

    #[must_use]
    pub fn quality_class(&self) -> Quality {
        Quality::from_status(self.quality)
    }
}

/// One cyclic actuator command (4 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActuatorCommand {
    pub command: u8,
    pub pwm_duty: u8,
}

impl ActuatorCommand {
    pub const WIRE_LEN: usize = 4;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        [self.command, self.pwm_duty, 0, 0]
    }

    pub fn decode(data: &[u8]) -> Result<ActuatorCommand> {
        if data.len() < Self::WIRE_LEN {
            return Err(Error::Protocol(format!(
                "actuator command needs {} bytes, got {}",
                Self::WIRE_LEN,
                data.len()
            )));
        }
        Ok(ActuatorCommand {
            command: data[0],
            pwm_duty: data[1],
        })
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Connection state of a device, as surfaced to the upper application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Seen via DCP, no AR yet.
    Discovered,
    /// AR establishment in progress.
    Connecting,
    /// AR in RUN, cyclic data flowing.
    Running,
    /// Watchdog expiry or connect failure; retry pending.
    Error,
    /// Explicitly released.
    Offline,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Discovered => "DISCOVERED",
            DeviceState::Connecting => "CONNECTING",
            DeviceState::Running => "RUNNING",
            DeviceState::Error => "ERROR",
            DeviceState::Offline => "OFFLINE",
        };
        f.write_str(s)
    }
}

/// A PROFINET IO device as held by the registry.
///
/// `Clone` is the deep copy the registry hands out: `slots`, `sensors` and
/// `actuators` are owned vectors, so a clone is independent of later registry
/// mutation.
#[derive(Debug, Clone)]
pub struct Device {
    /// PROFINET station name (ASCII, lowercase, <= 240 bytes).
    pub station: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub vendor_id: u16,
    pub device_id: u16,
    pub state: DeviceState,
    pub last_seen_ms: u64,
    pub slots: Vec<SlotInfo>,
    /// One slot per SENSOR entry of `slots`, in slot-table order.
    pub sensors: Vec<SensorSample>,
    /// One slot per ACTUATOR entry of `slots`, in slot-table order.
    pub actuators: Vec<ActuatorCommand>,
}

impl Device {
    /// New device with sensor/actuator arrays sized from the slot table.
    /// The arrays are never resized afterwards.
    #[must_use]
    pub fn new(
        station: String,
        mac: MacAddr,
        ip: Ipv4Addr,
        vendor_id: u16,
        device_id: u16,
        slots: Vec<SlotInfo>,
    ) -> Device {
        let sensor_count = slots.iter().filter(|s| s.role == SlotRole::Sensor).count();
        let actuator_count = slots.iter().filter(|s| s.role == SlotRole::Actuator).count();
        Device {
            station,
            mac,
            ip,
            vendor_id,
            device_id,
            state: DeviceState::Discovered,
            last_seen_ms: 0,
            slots,
            sensors: vec![SensorSample::default(); sensor_count],
            actuators: vec![ActuatorCommand::default(); actuator_count],
        }
    }

    /// Ordinal of `slot` among this device's SENSOR slots, in table order.
    #[must_use]
    pub fn sensor_index(&self, slot: u16) -> Option<usize> {
        self.slots
            .iter()
            .filter(|s| s.role == SlotRole::Sensor)
            .position(|s| s.slot == slot)
    }

    /// Ordinal of `slot` among this device's ACTUATOR slots, in table order.
    #[must_use]
    pub fn actuator_index(&self, slot: u16) -> Option<usize> {
        self.slots
            .iter()
            .filter(|s| s.role == SlotRole::Actuator)
            .position(|s| s.slot == slot)
    }
}

/// Validate a PROFINET station name: ASCII, lowercase, DNS-style labels,
/// at most 240 bytes.
pub fn validate_station_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 240 {
        return Err(Error::InvalidParam(format!(
            "station name length {} out of range 1..=240",
            name.len()
        )));
    }
    let ok = name.bytes().all(|b| {
        b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.'
    });
    if !ok {
        return Err(Error::InvalidParam(format!(
            "station name {:?} is not lowercase DNS-style ASCII",
            name
        )));
    }
    if name.starts_with('-') || name.ends_with('-') || name.starts_with('.') {
        return Err(Error::InvalidParam(format!("station name {:?} has bad edge", name)));
    }
    Ok(())
}
