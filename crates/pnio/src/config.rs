// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Controller configuration.
//!
//! All tunables accepted by [`crate::Controller`] live here with their
//! defaults. Wire constants are in [`crate::protocol::constants`]; never
//! hardcode either elsewhere.

use crate::error::{Error, Result};
use std::path::PathBuf;

/// Smallest representable send clock: one PROFINET base clock tick.
pub const MIN_CYCLE_TIME_US: u32 = 32; // 31.25 us rounded up to whole microseconds

/// Default cyclic period.
pub const DEFAULT_CYCLE_TIME_US: u32 = 1000;

/// Default watchdog budget for a RUN-state AR.
pub const DEFAULT_WATCHDOG_MS: u64 = 3000;

/// Runtime configuration for one controller instance.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Network interface the raw socket binds to (e.g. "eth0").
    pub interface_name: String,
    /// Controller station name. `None` derives `controller-xxxx` from the
    /// interface MAC at startup.
    pub controller_station_name: Option<String>,
    pub controller_vendor_id: u16,
    pub controller_device_id: u16,
    /// Cyclic thread period in microseconds.
    pub cycle_time_us: u32,
    /// IOCR send clock in units of 31.25 us.
    pub send_clock_factor: u16,
    pub reduction_ratio: u16,
    pub watchdog_factor: u16,
    /// Liveness budget for RUN-state ARs.
    pub watchdog_ms: u64,
    /// Local and remote PNIO-CM RPC port.
    pub rpc_port: u16,
    /// HTTP port RTUs expose for the slot-list / GSDML fallback.
    pub rtu_http_port: u16,
    pub gsdml_cache_dir: PathBuf,
    pub gsdml_max_file_bytes: u64,
    /// Automatically connect devices as DCP discovers them.
    pub auto_connect: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            interface_name: "eth0".to_string(),
            controller_station_name: None,
            controller_vendor_id: 0x0493,
            controller_device_id: 0x0001,
            cycle_time_us: DEFAULT_CYCLE_TIME_US,
            send_clock_factor: 32,
            reduction_ratio: 32,
            watchdog_factor: 3,
            watchdog_ms: DEFAULT_WATCHDOG_MS,
            rpc_port: crate::protocol::constants::PNIO_CM_UDP_PORT,
            rtu_http_port: 9081,
            gsdml_cache_dir: PathBuf::from("/var/cache/pnio/gsdml"),
            gsdml_max_file_bytes: 1024 * 1024,
            auto_connect: true,
        }
    }
}

impl ControllerConfig {
    /// Reject configurations the stack cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.interface_name.is_empty() {
            return Err(Error::InvalidParam("interface_name is empty".into()));
        }
        if self.cycle_time_us < MIN_CYCLE_TIME_US {
            return Err(Error::InvalidParam(format!(
                "cycle_time_us {} below base clock minimum {}",
                self.cycle_time_us, MIN_CYCLE_TIME_US
            )));
        }
        if self.send_clock_factor == 0 || self.reduction_ratio == 0 || self.watchdog_factor == 0 {
            return Err(Error::InvalidParam(
                "send_clock_factor, reduction_ratio and watchdog_factor must be non-zero".into(),
            ));
        }
        if let Some(name) = &self.controller_station_name {
            crate::types::validate_station_name(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn sub_base_clock_cycle_rejected() {
        let cfg = ControllerConfig {
            cycle_time_us: 10,
            ..ControllerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_timing_factor_rejected() {
        let cfg = ControllerConfig {
            reduction_ratio: 0,
            ..ControllerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
