// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Controller facade: sockets, threads, public API.
//!
//! ```text
//! raw socket -> receive thread -> frame demux -> { DCP cache, AR input IOCRs }
//! base clock -> cyclic thread  -> AR outputs  -> raw socket
//! caller thread ---------------> connect/release RPC -> UDP socket
//! ```
//!
//! Exactly two long-running threads are spawned (`start`): receive and
//! cyclic. Blocking RPC (connect, release, record write) always runs on the
//! caller's thread, including the auto-connect queue drained by
//! [`Controller::process_pending_connects`].

use crate::ar::{ArManager, ArManagerConfig, ArState};
use crate::clock::MonotonicClock;
use crate::config::ControllerConfig;
use crate::cyclic::{input_payload, is_rt_class1, CyclicEngine, CyclicStats};
use crate::discovery::{DcpCache, DcpEntry};
use crate::error::{Error, Result};
use crate::events::ControllerEvents;
use crate::protocol::constants::*;
use crate::protocol::dcp;
use crate::protocol::rpc::record::RecordAddr;
use crate::registry::DeviceRegistry;
use crate::transport::listener::FrameListener;
use crate::transport::raw::{interface_ipv4, RawSocket};
use crate::transport::rpc::UdpRpcChannel;
use crate::types::{ActuatorCommand, Device, MacAddr, SensorSample, SlotInfo};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// A PROFINET IO controller instance.
///
/// Construction opens both sockets and resolves the interface identity
/// (failures are fatal); [`Controller::start`] brings up the receive and
/// cyclic threads; [`Controller::stop`] joins them.
pub struct Controller {
    cfg: ControllerConfig,
    /// Self-handle for the receive-thread callback (set at construction).
    weak_self: Weak<Controller>,
    clock: MonotonicClock,
    running: Arc<AtomicBool>,
    raw: Arc<RawSocket>,
    registry: Arc<DeviceRegistry>,
    dcp_cache: Arc<DcpCache>,
    ar_manager: Arc<ArManager>,
    events: Arc<dyn ControllerEvents>,
    rng: Arc<Mutex<fastrand::Rng>>,
    controller_mac: MacAddr,
    controller_ip: Ipv4Addr,
    station_name: String,
    last_xid: AtomicU32,
    listener: Mutex<Option<FrameListener>>,
    cyclic: Mutex<Option<CyclicEngine>>,
    pending_tx: crossbeam::channel::Sender<String>,
    pending_rx: crossbeam::channel::Receiver<String>,
}

impl Controller {
    /// Open sockets, resolve the interface identity and assemble the stack.
    ///
    /// The PRNG is seeded from the OS exactly once, here, and lives inside
    /// the controller handle. The controller IP comes from the bound
    /// interface; construction fails when the interface has none.
    pub fn new(cfg: ControllerConfig, events: Arc<dyn ControllerEvents>) -> Result<Arc<Controller>> {
        cfg.validate()?;

        let rng = Arc::new(Mutex::new(fastrand::Rng::new()));
        let raw = Arc::new(RawSocket::open(&cfg.interface_name)?);
        let controller_mac = raw.mac();
        let controller_ip = interface_ipv4(&cfg.interface_name)?;
        let rpc = Arc::new(UdpRpcChannel::bind(cfg.rpc_port, Arc::clone(&rng))?);

        let station_name = match &cfg.controller_station_name {
            Some(name) => name.clone(),
            None => {
                let mac = controller_mac.as_bytes();
                format!("controller-{:02x}{:02x}", mac[4], mac[5])
            }
        };
        crate::types::validate_station_name(&station_name)?;

        let registry = Arc::new(DeviceRegistry::new());
        let ar_manager = Arc::new(ArManager::new(
            ArManagerConfig {
                controller_mac,
                controller_station: station_name.clone(),
                controller_vendor_id: cfg.controller_vendor_id,
                controller_device_id: cfg.controller_device_id,
                send_clock_factor: cfg.send_clock_factor,
                reduction_ratio: cfg.reduction_ratio,
                watchdog_factor: cfg.watchdog_factor,
                watchdog_ms: cfg.watchdog_ms,
                rpc_port: cfg.rpc_port,
                rtu_http_port: cfg.rtu_http_port,
                gsdml_cache_dir: cfg.gsdml_cache_dir.clone(),
                gsdml_max_file_bytes: cfg.gsdml_max_file_bytes,
            },
            rpc,
            Arc::clone(&registry),
            Arc::clone(&events),
            Arc::clone(&rng),
        ));

        let (pending_tx, pending_rx) = crossbeam::channel::unbounded();
        log::info!(
            "[controller] {} on {} mac={} ip={}",
            station_name,
            cfg.interface_name,
            controller_mac,
            controller_ip
        );
        Ok(Arc::new_cyclic(|weak_self| Controller {
            cfg,
            weak_self: weak_self.clone(),
            clock: MonotonicClock::new(),
            running: Arc::new(AtomicBool::new(false)),
            raw,
            registry,
            dcp_cache: Arc::new(DcpCache::new()),
            ar_manager,
            events,
            rng,
            controller_mac,
            controller_ip,
            station_name,
            last_xid: AtomicU32::new(0),
            listener: Mutex::new(None),
            cyclic: Mutex::new(None),
            pending_tx,
            pending_rx,
        }))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the receive and cyclic threads. Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let weak = self.weak_self.clone();
        let callback: crate::transport::listener::FrameCallback = Arc::new(move |frame: &[u8]| {
            if let Some(controller) = weak.upgrade() {
                controller.handle_frame(frame);
            }
        });
        *self.listener.lock() = Some(FrameListener::spawn(
            Arc::clone(&self.raw),
            Arc::clone(&self.running),
            callback,
        ));
        *self.cyclic.lock() = Some(CyclicEngine::spawn(
            Arc::clone(&self.running),
            self.cfg.cycle_time_us,
            Arc::clone(&self.ar_manager),
            Arc::clone(&self.raw),
            self.clock,
            self.controller_mac,
        ));
        log::info!("[controller] started (cycle {} us)", self.cfg.cycle_time_us);
        Ok(())
    }

    /// Stop both threads and join them. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(mut listener) = self.listener.lock().take() {
            listener.stop();
        }
        if let Some(mut cyclic) = self.cyclic.lock().take() {
            cyclic.stop();
        }
        log::info!("[controller] stopped");
    }

    // ========================================================================
    // Frame demux (receive thread)
    // ========================================================================

    fn handle_frame(&self, frame: &[u8]) {
        if frame.len() < ETH_HEADER_LEN + 2 {
            return;
        }
        let frame_id = u16::from_be_bytes([frame[ETH_HEADER_LEN], frame[ETH_HEADER_LEN + 1]]);
        if frame_id == FRAME_ID_DCP_IDENTIFY_RES {
            self.handle_dcp_response(frame);
        } else if is_rt_class1(frame_id) {
            if let Some((frame_id, payload)) = input_payload(frame) {
                let now_us = self.clock.now_us();
                let now_ms = self.clock.now_ms();
                if !self.ar_manager.ingest_input_frame(frame_id, payload, now_us, now_ms) {
                    log::debug!("[cyclic] no input IOCR for frame 0x{:04x}", frame_id);
                }
            }
        } else {
            log::debug!("[transport] unhandled frame id 0x{:04x}", frame_id);
        }
    }

    fn handle_dcp_response(&self, frame: &[u8]) {
        let response = match dcp::parse_identify_response(frame) {
            Ok(Some(r)) => r,
            Ok(None) => return,
            Err(e) => {
                log::debug!("[dcp] dropping malformed identify response: {:?}", e);
                return;
            }
        };
        let expected_xid = self.last_xid.load(Ordering::Relaxed);
        if expected_xid != 0 && response.xid != expected_xid {
            log::debug!(
                "[dcp] response xid 0x{:08x} does not match 0x{:08x}, ignored",
                response.xid,
                expected_xid
            );
            return;
        }
        let now_ms = self.clock.now_ms();
        let Some(entry) = self.dcp_cache.ingest(&response, now_ms) else {
            log::debug!("[dcp] unnamed device at {}, ignored", response.source_mac);
            return;
        };
        log::info!(
            "[dcp] {} at {} ({}), vendor 0x{:04x} device 0x{:04x}",
            entry.station,
            entry.ip,
            entry.mac,
            entry.vendor_id,
            entry.device_id
        );
        self.registry.touch(&entry.station, now_ms);
        if !self.registry.contains(&entry.station) {
            let device = Device::new(
                entry.station.clone(),
                entry.mac,
                entry.ip,
                entry.vendor_id,
                entry.device_id,
                Vec::new(),
            );
            if self.registry.add_device(device).is_ok() {
                if let Ok(device) = self.registry.get_device(&entry.station) {
                    self.events.on_device_added(&device);
                }
                if self.cfg.auto_connect {
                    let _ = self.pending_tx.send(entry.station.clone());
                }
            }
        }
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Multicast one Identify-All request with a fresh XID.
    pub fn send_identify_all(&self) -> Result<()> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(Error::NotInitialized);
        }
        let xid = {
            let mut rng = self.rng.lock();
            rng.u32(1..)
        };
        self.last_xid.store(xid, Ordering::Relaxed);
        let mut frame = [0u8; 64];
        let len = dcp::build_identify_all(&mut frame, self.controller_mac, xid)
            .map_err(Error::from)?;
        self.raw.send_frame(&frame[..len])?;
        log::debug!("[dcp] identify-all sent, xid 0x{:08x}", xid);
        Ok(())
    }

    /// Snapshot of the DCP cache.
    #[must_use]
    pub fn discovered_devices(&self) -> Vec<DcpEntry> {
        self.dcp_cache.entries()
    }

    /// Assign a permanent station name over DCP (commissioning).
    pub fn set_device_name(&self, mac: MacAddr, name: &str) -> Result<()> {
        crate::types::validate_station_name(name)?;
        let xid = self.rng.lock().u32(1..);
        let mut frame = [0u8; 320];
        let len = dcp::build_set_station_name(&mut frame, mac, self.controller_mac, xid, name)
            .map_err(Error::from)?;
        self.raw.send_frame(&frame[..len])
    }

    /// Assign permanent IP parameters over DCP (commissioning).
    pub fn set_device_ip(
        &self,
        mac: MacAddr,
        ip: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        let xid = self.rng.lock().u32(1..);
        let mut frame = [0u8; 96];
        let len = dcp::build_set_ip(&mut frame, mac, self.controller_mac, xid, ip, netmask, gateway)
            .map_err(Error::from)?;
        self.raw.send_frame(&frame[..len])
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Establish the AR for a discovered device. Blocking; runs on the
    /// caller's thread. Pass `slots` to skip the discovery pipeline.
    pub fn connect_device(&self, station: &str, slots: Option<Vec<SlotInfo>>) -> Result<()> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(Error::NotInitialized);
        }
        let entry = self.dcp_cache.get(station).ok_or(Error::NotFound)?;
        if !self.registry.contains(station) {
            let device = Device::new(
                entry.station.clone(),
                entry.mac,
                entry.ip,
                entry.vendor_id,
                entry.device_id,
                slots.clone().unwrap_or_default(),
            );
            let _ = self.registry.add_device(device);
        }
        self.ar_manager.connect_device(&entry, slots, self.clock.now_ms())
    }

    /// Release one device's AR. Idempotent; tolerates an unreachable device.
    pub fn disconnect_device(&self, station: &str) -> Result<()> {
        self.ar_manager.disconnect_device(station, self.clock.now_ms())
    }

    /// Drain the auto-connect queue and due reconnects, performing the
    /// blocking connect pipeline on this thread.
    pub fn process_pending_connects(&self) {
        let mut stations: Vec<String> = Vec::new();
        while let Ok(s) = self.pending_rx.try_recv() {
            stations.push(s);
        }
        stations.extend(self.ar_manager.due_reconnects());
        stations.dedup();
        for station in stations {
            if matches!(
                self.ar_manager.state_of(&station),
                Some(
                    ArState::ConnectReq
                        | ArState::ConnectCnf
                        | ArState::PrmSrv
                        | ArState::Ready
                        | ArState::Run
                )
            ) {
                continue;
            }
            let Some(entry) = self.dcp_cache.get(&station) else {
                continue;
            };
            if let Err(e) = self.ar_manager.connect_device(&entry, None, self.clock.now_ms()) {
                log::warn!("[controller] auto-connect {} failed: {}", station, e);
            }
        }
    }

    // ========================================================================
    // Data access
    // ========================================================================

    /// Latest bytes of one sensor slot, decoded from the input IOCR image.
    pub fn read_sensor(&self, station: &str, slot: u16) -> Result<SensorSample> {
        self.ar_manager.read_input(station, slot)
    }

    /// Queue an actuator command: written into the output IOCR image (sent
    /// on the next cycle) and mirrored into the registry.
    pub fn write_actuator(&self, station: &str, slot: u16, cmd: ActuatorCommand) -> Result<()> {
        self.ar_manager.write_actuator(station, slot, cmd)
    }

    /// Write a vendor-specific record (e.g. credential sync at 0xF840).
    pub fn write_device_record(&self, station: &str, index: u16, data: &[u8]) -> Result<()> {
        self.ar_manager.write_record(
            station,
            RecordAddr {
                api: 0,
                slot: 0,
                subslot: 1,
                index,
            },
            data,
        )
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn station_name(&self) -> &str {
        &self.station_name
    }

    #[must_use]
    pub fn controller_mac(&self) -> MacAddr {
        self.controller_mac
    }

    #[must_use]
    pub fn controller_ip(&self) -> Ipv4Addr {
        self.controller_ip
    }

    #[must_use]
    pub fn cyclic_stats(&self) -> CyclicStats {
        self.cyclic
            .lock()
            .as_ref()
            .map(CyclicEngine::stats)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn ar_state(&self, station: &str) -> Option<ArState> {
        self.ar_manager.state_of(station)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}
