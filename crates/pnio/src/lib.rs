// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # PNIO - PROFINET IO Controller
//!
//! A pure Rust PROFINET IO controller core: layer-2 DCP discovery, PNIO-CM
//! connection management over DCE-RPC/UDP, and RT Class 1 cyclic data
//! exchange with per-device liveness supervision. Built to drive field RTUs
//! (the reference deployment is water treatment), but nothing here is
//! domain specific beyond the module profile.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pnio::{Controller, ControllerConfig, NullEvents};
//! use std::sync::Arc;
//!
//! fn main() -> pnio::Result<()> {
//!     let config = ControllerConfig {
//!         interface_name: "eth1".into(),
//!         ..ControllerConfig::default()
//!     };
//!     let controller = Controller::new(config, Arc::new(NullEvents))?;
//!     controller.start()?;
//!     controller.send_identify_all()?;
//!     loop {
//!         controller.process_pending_connects();
//!         std::thread::sleep(std::time::Duration::from_millis(500));
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Upper Application                           |
//! |        ControllerEvents callbacks | read_sensor/write_actuator     |
//! +--------------------------------------------------------------------+
//! |                        Controller Facade                           |
//! |   socket setup | thread lifecycle | auto-connect queue | registry  |
//! +--------------------------------------------------------------------+
//! |      AR Manager           |        Cyclic Engine                   |
//! |  state machine, IOCRs,    |  base clock, output producer,          |
//! |  strategy walk, watchdog  |  timing stats                          |
//! +--------------------------------------------------------------------+
//! |   DCP | PNIO-CM RPC (DCE-RPC CL + NDR + blocks) | frame codec      |
//! +--------------------------------------------------------------------+
//! |        AF_PACKET raw socket        |        UDP 34964              |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Controller`] | Facade: sockets, threads, public API |
//! | [`ControllerConfig`] | Tunables (interface, cycle time, watchdog, ports) |
//! | [`ControllerEvents`] | Callback surface for the upper application |
//! | [`DeviceRegistry`] | Thread-safe device directory with deep-copy reads |
//! | [`Error`] | Closed error enum every operation returns |

/// Application Relationship lifecycle (state machine, IOCRs, profile).
pub mod ar;
/// Monotonic controller clock.
pub mod clock;
/// Runtime configuration.
pub mod config;
/// Controller facade.
pub mod controller;
/// Cyclic real-time engine.
pub mod cyclic;
/// DCP device cache.
pub mod discovery;
/// Error type shared by every fallible operation.
pub mod error;
/// Upper-application callback traits.
pub mod events;
/// GSDML cache lookup and HTTP slot-list fallback.
pub mod gsdml;
/// PROFINET wire protocol (constants, frame codec, DCP, PNIO-CM RPC).
pub mod protocol;
/// Thread-safe device directory.
pub mod registry;
/// Sockets and the receive thread.
pub mod transport;
/// Shared data model (devices, slots, samples, commands).
pub mod types;

pub use ar::{ArState, ArManager};
pub use config::ControllerConfig;
pub use controller::Controller;
pub use cyclic::CyclicStats;
pub use discovery::{DcpCache, DcpEntry};
pub use error::{Error, Result};
pub use events::{ControllerEvents, NullEvents};
pub use registry::DeviceRegistry;
pub use types::{
    ActuatorCommand, Device, DeviceState, MacAddr, ModuleEntry, PointTag, Quality, SensorSample,
    SlotInfo, SlotRole,
};
