// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Application Relationship manager.
//!
//! Owns the lifecycle of every AR:
//!
//! ```text
//! INIT -> CONNECT_REQ -> CONNECT_CNF -> PRMSRV -> READY -> RUN
//!            |                |           |         |       |
//!            +-- timeout -----+-----------+---------+       +-- release -> CLOSE
//!            v                                      v       v
//!          ABORT <------- no ApplicationReady ------+   watchdog
//!            |
//!            +-- backoff elapsed -> CONNECT_REQ (strategy state reused)
//! ```
//!
//! Locking discipline: one mutex guards the AR table. Nothing ever blocks
//! on RPC while holding it: the connect/release drivers copy what they
//! need into an [`ArSnapshot`] under the lock, run the RPC outside it, and
//! re-acquire to commit. The cyclic path skips any AR whose `connecting`
//! flag is set.

pub mod iocr;
pub mod profile;
#[cfg(test)]
mod tests;

use crate::discovery::DcpEntry;
use crate::error::{Error, Result};
use crate::events::ControllerEvents;
use crate::protocol::constants::*;
use crate::protocol::rpc::connect::{
    build_connect_body, parse_connect_response, ConnectRequest, ConnectResponse, IoDataObject,
    IocrParam,
};
use crate::protocol::rpc::control::{
    build_control_request, build_inbound_control_response, parse_control_response,
    parse_inbound_control_request,
};
use crate::protocol::rpc::error_codes::{recovery_action, RecoveryAction};
use crate::protocol::rpc::record::{
    build_read_request, parse_read_response, parse_real_identification, RecordAddr,
};
use crate::protocol::rpc::strategy::{StrategyState, WireStrategy, STRATEGIES};
use crate::protocol::rpc::{device_object_uuid, PnioStatus};
use crate::protocol::uuid::Uuid;
use crate::registry::DeviceRegistry;
use crate::transport::RpcTransport;
use crate::types::{DeviceState, MacAddr, SensorSample, SlotInfo, SlotRole};
use iocr::{frame_id_for, Iocr, IocrDirection};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Connect establishment budget.
const CONNECT_TIMEOUT_MS: u64 = 10_000;
/// How long READY waits for the device's ApplicationReady.
const APP_READY_TIMEOUT_MS: u64 = 30_000;
/// Reconnect backoff: base, doubled per completed strategy cycle, capped.
const BACKOFF_BASE_MS: u64 = 5_000;
const BACKOFF_CAP_MS: u64 = 60_000;
/// Upper bound on connect attempts within one establishment (two walks of
/// the eight-entry strategy table).
const MAX_CONNECT_ATTEMPTS: usize = 16;
/// Response size requested for Record Read.
const RECORD_READ_MAX: u32 = 4096;

/// Per-AR connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArState {
    Init,
    ConnectReq,
    ConnectCnf,
    PrmSrv,
    Ready,
    Run,
    Abort,
    Close,
}

/// One Application Relationship (mutable record, owned by the manager).
#[derive(Debug)]
pub struct Ar {
    pub station: String,
    pub ar_uuid: Uuid,
    pub session_key: u16,
    pub device_mac: MacAddr,
    pub device_ip: Ipv4Addr,
    pub vendor_id: u16,
    pub device_id: u16,
    pub state: ArState,
    /// Set while a blocking RPC for this AR is in flight; the cyclic path
    /// skips the AR until it clears.
    pub connecting: bool,
    pub slots: Vec<SlotInfo>,
    pub input: Iocr,
    pub output: Iocr,
    pub watchdog_ms: u64,
    pub last_activity_ms: u64,
    pub state_entered_ms: u64,
    pub strategy: StrategyState,
    /// Reconnect not before this instant (ABORT only).
    pub backoff_until_ms: Option<u64>,
    pub last_error: Option<String>,
    /// Session key the device chose in its Connect response.
    pub device_session_key: u16,
    pub device_alarm_ref: Option<u16>,
    /// Slot layout came from the GSDML cache.
    pub from_cache: bool,
    /// Device reported a Module Diff block (tolerated).
    pub module_diff: bool,
    /// Record read/write sequence numbers.
    seq_number: u16,
}

/// Immutable copy of the fields a blocking RPC needs. Taken under the
/// manager lock, used outside it.
#[derive(Debug, Clone)]
pub struct ArSnapshot {
    pub station: String,
    pub ar_uuid: Uuid,
    pub session_key: u16,
    pub device_mac: MacAddr,
    pub device_ip: Ipv4Addr,
    pub vendor_id: u16,
    pub device_id: u16,
}

impl Ar {
    fn snapshot(&self) -> ArSnapshot {
        ArSnapshot {
            station: self.station.clone(),
            ar_uuid: self.ar_uuid,
            session_key: self.session_key,
            device_mac: self.device_mac,
            device_ip: self.device_ip,
            vendor_id: self.vendor_id,
            device_id: self.device_id,
        }
    }

    fn enter(&mut self, state: ArState, now_ms: u64) {
        log::debug!(
            "[ar] {} {:?} -> {:?} (session {})",
            self.station,
            self.state,
            state,
            self.session_key
        );
        self.state = state;
        self.state_entered_ms = now_ms;
    }
}

/// Settings the manager needs from the controller configuration.
#[derive(Debug, Clone)]
pub struct ArManagerConfig {
    pub controller_mac: MacAddr,
    pub controller_station: String,
    pub controller_vendor_id: u16,
    pub controller_device_id: u16,
    pub send_clock_factor: u16,
    pub reduction_ratio: u16,
    pub watchdog_factor: u16,
    pub watchdog_ms: u64,
    pub rpc_port: u16,
    pub rtu_http_port: u16,
    pub gsdml_cache_dir: std::path::PathBuf,
    pub gsdml_max_file_bytes: u64,
}

pub struct ArManager {
    cfg: ArManagerConfig,
    ars: Mutex<Vec<Ar>>,
    next_session_key: Mutex<u16>,
    rpc: Arc<dyn RpcTransport>,
    registry: Arc<DeviceRegistry>,
    events: Arc<dyn ControllerEvents>,
    rng: Arc<Mutex<fastrand::Rng>>,
    reconnect_tx: crossbeam::channel::Sender<String>,
    reconnect_rx: crossbeam::channel::Receiver<String>,
}

impl ArManager {
    pub fn new(
        cfg: ArManagerConfig,
        rpc: Arc<dyn RpcTransport>,
        registry: Arc<DeviceRegistry>,
        events: Arc<dyn ControllerEvents>,
        rng: Arc<Mutex<fastrand::Rng>>,
    ) -> ArManager {
        let (reconnect_tx, reconnect_rx) = crossbeam::channel::unbounded();
        ArManager {
            cfg,
            ars: Mutex::new(Vec::new()),
            next_session_key: Mutex::new(1),
            rpc,
            registry,
            events,
            rng,
            reconnect_tx,
            reconnect_rx,
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn state_of(&self, station: &str) -> Option<ArState> {
        self.ars.lock().iter().find(|a| a.station == station).map(|a| a.state)
    }

    pub fn strategy_of(&self, station: &str) -> Option<StrategyState> {
        self.ars
            .lock()
            .iter()
            .find(|a| a.station == station)
            .map(|a| a.strategy.clone())
    }

    /// Stations whose backoff elapsed and are due for a reconnect attempt.
    pub fn due_reconnects(&self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(station) = self.reconnect_rx.try_recv() {
            out.push(station);
        }
        out
    }

    // ========================================================================
    // Connect
    // ========================================================================

    /// Establish (or re-establish) the AR for a discovered device. Blocking;
    /// runs on the caller's thread. On return the AR is in READY (waiting
    /// for the device's ApplicationReady) or the error tells why not.
    pub fn connect_device(
        &self,
        entry: &DcpEntry,
        explicit_slots: Option<Vec<SlotInfo>>,
        now_ms: u64,
    ) -> Result<()> {
        // Reuse the strategy state of a previous AR for this station.
        let mut strategy = {
            let mut ars = self.ars.lock();
            match ars.iter().position(|a| a.station == entry.station) {
                Some(idx) => {
                    if !matches!(ars[idx].state, ArState::Abort | ArState::Close) {
                        return Err(Error::AlreadyExists);
                    }
                    let old = ars.remove(idx);
                    let mut s = old.strategy;
                    s.rewind();
                    s
                }
                None => StrategyState::new(),
            }
        };

        self.events
            .on_device_state_changed(&entry.station, DeviceState::Connecting);
        let _ = self.registry.set_device_state(&entry.station, DeviceState::Connecting);

        // Resolve the slot layout.
        let (mut slots, from_cache) = match explicit_slots {
            Some(s) => (s, false),
            None => match self.resolve_slots(entry, &mut strategy) {
                Ok(resolved) => resolved,
                Err(e) => {
                    let _ = self.registry.set_device_state(&entry.station, DeviceState::Error);
                    self.events
                        .on_device_state_changed(&entry.station, DeviceState::Error);
                    return Err(e);
                }
            },
        };
        self.events.on_slots_discovered(&entry.station, &slots);
        let _ = self.registry.set_device_slots(&entry.station, slots.clone());

        // Create the AR record.
        let snap = self.create_ar(entry, &slots, strategy, from_cache, now_ms)?;

        // Walk the strategy table until the device accepts the Connect.
        let deadline =
            std::time::Instant::now() + std::time::Duration::from_millis(CONNECT_TIMEOUT_MS);
        let mut attempts = 0usize;
        let response = loop {
            if attempts >= MAX_CONNECT_ATTEMPTS {
                self.fail_ar(&snap.station, "strategy table exhausted", now_ms);
                return Err(Error::ConnectionFailed(format!(
                    "{}: all wire-format strategies rejected",
                    snap.station
                )));
            }
            if std::time::Instant::now() >= deadline {
                self.fail_ar(&snap.station, "connect timeout", now_ms);
                return Err(Error::Timeout);
            }
            let strat = {
                let mut ars = self.ars.lock();
                let ar = find_mut(&mut ars, &snap.station)?;
                ar.strategy.note_attempt();
                *ar.strategy.current()
            };
            attempts += 1;

            match self.connect_once(&snap, &slots, &strat) {
                Ok(res) if res.status.is_ok() && !strat.dap_only => {
                    let mut ars = self.ars.lock();
                    let ar = find_mut(&mut ars, &snap.station)?;
                    ar.strategy.mark_success();
                    log::info!(
                        "[ar] {} connected with strategy {} ({})",
                        snap.station,
                        ar.strategy.index(),
                        strat.label
                    );
                    break res;
                }
                Ok(res) if res.status.is_ok() => {
                    // DAP-only acceptance: read the real layout, release the
                    // probe AR, and continue with the discovered modules.
                    log::info!(
                        "[ar] {} accepted DAP-only strategy {}, reading real layout",
                        snap.station,
                        strat.label
                    );
                    if let Ok(modules) = self.read_real_identification(&snap, &strat) {
                        let discovered = profile::slots_from_modules(&modules);
                        if !discovered.is_empty() {
                            slots = discovered;
                            self.events.on_slots_discovered(&snap.station, &slots);
                            let _ = self
                                .registry
                                .set_device_slots(&snap.station, slots.clone());
                            let mut ars = self.ars.lock();
                            let ar = find_mut(&mut ars, &snap.station)?;
                            ar.slots = slots.clone();
                            ar.input = Iocr::new(
                                IocrDirection::Input,
                                ar.input.frame_id,
                                &slots,
                                self.cfg.send_clock_factor,
                                self.cfg.reduction_ratio,
                                self.cfg.watchdog_factor,
                            );
                            ar.output = Iocr::new(
                                IocrDirection::Output,
                                ar.output.frame_id,
                                &slots,
                                self.cfg.send_clock_factor,
                                self.cfg.reduction_ratio,
                                self.cfg.watchdog_factor,
                            );
                        }
                    }
                    self.release_quietly(&snap, &strat);
                    let mut ars = self.ars.lock();
                    let ar = find_mut(&mut ars, &snap.station)?;
                    ar.strategy.advance();
                }
                Ok(res) => {
                    let action = recovery_action(&res.status);
                    log::warn!(
                        "[ar] {} connect rejected (decode 0x{:02x} code1 0x{:02x} code2 0x{:02x}) -> {:?}, strategy {} exhausted",
                        snap.station,
                        res.status.error_decode,
                        res.status.error_code1,
                        res.status.error_code2,
                        action,
                        strat.label
                    );
                    if action == RecoveryAction::Rediscover {
                        self.fail_ar(&snap.station, "device requires rediscovery", now_ms);
                        return Err(Error::ConnectionFailed(format!(
                            "{}: stale device state, rediscover",
                            snap.station
                        )));
                    }
                    let mut ars = self.ars.lock();
                    let ar = find_mut(&mut ars, &snap.station)?;
                    ar.last_error = Some(format!(
                        "connect rejected code1=0x{:02x} code2=0x{:02x}",
                        res.status.error_code1, res.status.error_code2
                    ));
                    ar.strategy.advance();
                }
                Err(Error::Timeout | Error::ConnectionFailed(_)) => {
                    let mut ars = self.ars.lock();
                    let ar = find_mut(&mut ars, &snap.station)?;
                    ar.last_error = Some("connect timeout".into());
                    ar.strategy.advance();
                }
                Err(e) => {
                    self.fail_ar(&snap.station, "transport failure", now_ms);
                    return Err(e);
                }
            }
        };

        // Commit the Connect confirmation.
        {
            let mut ars = self.ars.lock();
            let ar = find_mut(&mut ars, &snap.station)?;
            ar.enter(ArState::ConnectCnf, now_ms);
            ar.device_session_key = response.device_session_key;
            ar.device_alarm_ref = response.device_alarm_ref;
            ar.module_diff = response.module_diff;
            if !response.device_mac.is_zero() {
                ar.device_mac = response.device_mac;
            }
            for (iocr_type, frame_id) in &response.iocr_frame_ids {
                match *iocr_type {
                    IOCR_TYPE_INPUT => ar.input.frame_id = *frame_id,
                    IOCR_TYPE_OUTPUT => ar.output.frame_id = *frame_id,
                    _ => {}
                }
            }
            if response.module_diff {
                log::warn!("[ar] {} reported a module diff; continuing", snap.station);
            }
            // Housekeeping transition into parameterization.
            ar.enter(ArState::PrmSrv, now_ms);
        }

        // Parameterization end, outside the lock.
        let strat = {
            let ars = self.ars.lock();
            *find(&ars, &snap.station)?.strategy.current()
        };
        match self.send_control(&snap, &strat, CONTROL_COMMAND_PRM_END) {
            Ok(status) if status.is_ok() => {
                let mut ars = self.ars.lock();
                let ar = find_mut(&mut ars, &snap.station)?;
                ar.enter(ArState::Ready, now_ms);
                ar.connecting = false;
                ar.last_activity_ms = now_ms;
                log::info!("[ar] {} parameterized, waiting for ApplicationReady", snap.station);
                Ok(())
            }
            Ok(status) => {
                self.fail_ar(&snap.station, "PrmEnd rejected", now_ms);
                Err(Error::ConnectionFailed(format!(
                    "{}: PrmEnd rejected code1=0x{:02x} code2=0x{:02x}",
                    snap.station, status.error_code1, status.error_code2
                )))
            }
            Err(e) => {
                self.fail_ar(&snap.station, "PrmEnd failed", now_ms);
                Err(e)
            }
        }
    }

    /// Slot-layout resolution pipeline: GSDML cache, DAP-only probe with
    /// Record Read, HTTP fallback. A hardcoded default is never substituted.
    fn resolve_slots(
        &self,
        entry: &DcpEntry,
        strategy: &mut StrategyState,
    ) -> Result<(Vec<SlotInfo>, bool)> {
        if let Some(modules) = crate::gsdml::load_modules(
            &self.cfg.gsdml_cache_dir,
            &entry.station,
            self.cfg.gsdml_max_file_bytes,
        ) {
            let slots = profile::slots_from_modules(&modules);
            if !slots.is_empty() {
                return Ok((slots, true));
            }
        }

        match self.dap_probe(entry, strategy) {
            Ok(modules) => {
                let slots = profile::slots_from_modules(&modules);
                if slots.is_empty() {
                    return Err(Error::ConnectionFailed(format!(
                        "{}: device reports no application modules",
                        entry.station
                    )));
                }
                self.schedule_gsdml_fetch(entry);
                return Ok((slots, false));
            }
            Err(e) => {
                log::warn!(
                    "[ar] {} DAP-only discovery failed ({}), trying HTTP slot list",
                    entry.station,
                    e
                );
            }
        }

        if let Some((_, slots)) = crate::gsdml::fetch_slots_http(entry.ip, self.cfg.rtu_http_port)
        {
            if !slots.is_empty() {
                return Ok((slots, false));
            }
        }

        Err(Error::ConnectionFailed(format!(
            "{}: no slot layout source (PROFINET and HTTP both failed)",
            entry.station
        )))
    }

    /// Connect with the DAP alone and Record-Read the real module layout.
    /// The probe AR never enters the table; it is released before returning.
    fn dap_probe(&self, entry: &DcpEntry, strategy: &mut StrategyState) -> Result<Vec<crate::types::ModuleEntry>> {
        let session_key = self.alloc_session_key();
        let ar_uuid = Uuid::new_v4(&mut self.rng.lock());
        let snap = ArSnapshot {
            station: entry.station.clone(),
            ar_uuid,
            session_key,
            device_mac: entry.mac,
            device_ip: entry.ip,
            vendor_id: entry.vendor_id,
            device_id: entry.device_id,
        };

        let mut attempts = 0usize;
        loop {
            if attempts >= STRATEGIES.len() {
                return Err(Error::ConnectionFailed(format!(
                    "{}: DAP-only connect rejected by every strategy",
                    entry.station
                )));
            }
            let strat = WireStrategy {
                dap_only: true,
                ..*strategy.current()
            };
            strategy.note_attempt();
            attempts += 1;
            match self.connect_once(&snap, &[], &strat) {
                Ok(res) if res.status.is_ok() => {
                    let modules = self.read_real_identification(&snap, &strat);
                    // The probe AR is released whether or not the read worked.
                    self.release_quietly(&snap, &strat);
                    return modules;
                }
                Ok(res) => {
                    log::debug!(
                        "[ar] {} DAP probe rejected (code1 0x{:02x} code2 0x{:02x}) on {}",
                        entry.station,
                        res.status.error_code1,
                        res.status.error_code2,
                        strat.label
                    );
                    strategy.advance();
                }
                Err(Error::Timeout | Error::ConnectionFailed(_)) => strategy.advance(),
                Err(e) => return Err(e),
            }
        }
    }

    /// One Connect RPC with a concrete wire strategy.
    fn connect_once(
        &self,
        snap: &ArSnapshot,
        slots: &[SlotInfo],
        strat: &WireStrategy,
    ) -> Result<ConnectResponse> {
        let (iocrs, expected) = if strat.dap_only {
            (
                self.iocr_params(&[], snap.session_key),
                vec![profile::dap_expected_slot()],
            )
        } else {
            (
                self.iocr_params(slots, snap.session_key),
                profile::expected_slots(slots),
            )
        };
        let req = ConnectRequest {
            ar_uuid: snap.ar_uuid,
            session_key: snap.session_key,
            controller_mac: self.cfg.controller_mac,
            controller_object_uuid: device_object_uuid(
                0x0001,
                self.cfg.controller_device_id,
                self.cfg.controller_vendor_id,
            ),
            station_name: self.cfg.controller_station.clone(),
            rpc_port: self.cfg.rpc_port,
            iocrs,
            expected,
        };
        let mut body = vec![0u8; crate::transport::rpc::MAX_BODY];
        let len = build_connect_body(&mut body, &req).map_err(Error::from)?;
        let response = self.rpc.call(
            snap.device_ip,
            self.cfg.rpc_port,
            device_object_uuid(0x0001, snap.device_id, snap.vendor_id),
            RPC_OPNUM_CONNECT,
            &body[..len],
            strat.swap_uuids,
            strat.include_ndr,
        )?;
        parse_connect_response(&response).map_err(Error::from)
    }

    /// Build both IOCR parameter sets. Frame offsets accumulate across
    /// same-direction submodules; zero-length submodules never appear.
    fn iocr_params(&self, slots: &[SlotInfo], session_key: u16) -> Vec<IocrParam> {
        let mut out = Vec::with_capacity(2);
        for direction in [IocrDirection::Input, IocrDirection::Output] {
            let mut data_objects = Vec::new();
            let mut offset = 0u16;
            let mut status_offset = 0u16;
            let mut iocs = Vec::new();
            for s in slots {
                if s.role == direction.role() {
                    data_objects.push(IoDataObject {
                        slot: s.slot,
                        subslot: s.subslot,
                        frame_offset: offset,
                    });
                    offset += s.data_length;
                } else {
                    // Consumer status for the opposite direction's slots.
                    iocs.push(IoDataObject {
                        slot: s.slot,
                        subslot: s.subslot,
                        frame_offset: status_offset,
                    });
                    status_offset += 1;
                }
            }
            out.push(IocrParam {
                iocr_type: match direction {
                    IocrDirection::Input => IOCR_TYPE_INPUT,
                    IocrDirection::Output => IOCR_TYPE_OUTPUT,
                },
                iocr_reference: direction.direction_bit() + 1,
                frame_id: frame_id_for(session_key, direction),
                data_length: iocr::buffer_len(slots, direction) as u16,
                send_clock_factor: self.cfg.send_clock_factor,
                reduction_ratio: self.cfg.reduction_ratio,
                watchdog_factor: self.cfg.watchdog_factor,
                data_hold_factor: self.cfg.watchdog_factor,
                data_objects,
                iocs,
            });
        }
        out
    }

    fn read_real_identification(
        &self,
        snap: &ArSnapshot,
        strat: &WireStrategy,
    ) -> Result<Vec<crate::types::ModuleEntry>> {
        let mut body = vec![0u8; 512];
        let len = build_read_request(
            &mut body,
            1,
            snap.ar_uuid,
            RecordAddr::real_identification(),
            RECORD_READ_MAX,
        )
        .map_err(Error::from)?;
        let response = self.rpc.call(
            snap.device_ip,
            self.cfg.rpc_port,
            device_object_uuid(0x0001, snap.device_id, snap.vendor_id),
            RPC_OPNUM_READ,
            &body[..len],
            strat.swap_uuids,
            strat.include_ndr,
        )?;
        let read = parse_read_response(&response).map_err(Error::from)?;
        if !read.status.is_ok() {
            return Err(Error::ConnectionFailed(format!(
                "{}: RealIdentificationData read rejected",
                snap.station
            )));
        }
        parse_real_identification(&read.data).map_err(Error::from)
    }

    fn send_control(
        &self,
        snap: &ArSnapshot,
        strat: &WireStrategy,
        command: u16,
    ) -> Result<PnioStatus> {
        let mut body = vec![0u8; 256];
        let len = build_control_request(&mut body, snap.ar_uuid, snap.session_key, command)
            .map_err(Error::from)?;
        let response = self.rpc.call(
            snap.device_ip,
            self.cfg.rpc_port,
            device_object_uuid(0x0001, snap.device_id, snap.vendor_id),
            RPC_OPNUM_CONTROL,
            &body[..len],
            strat.swap_uuids,
            strat.include_ndr,
        )?;
        parse_control_response(&response, command).map_err(Error::from)
    }

    /// Release an AR, tolerating a device that is already gone.
    fn release_quietly(&self, snap: &ArSnapshot, strat: &WireStrategy) {
        match self.send_control(snap, strat, CONTROL_COMMAND_RELEASE) {
            Ok(_) => {}
            Err(Error::Timeout) => {
                log::debug!("[ar] {} release timed out (device gone?)", snap.station);
            }
            Err(e) => {
                log::debug!("[ar] {} release failed: {}", snap.station, e);
            }
        }
    }

    /// Record write passthrough for vendor records (credential sync).
    pub fn write_record(&self, station: &str, addr: RecordAddr, data: &[u8]) -> Result<()> {
        let (snap, strat, seq) = {
            let mut ars = self.ars.lock();
            let ar = find_mut(&mut ars, station)?;
            if ar.state != ArState::Run && ar.state != ArState::Ready {
                return Err(Error::NotConnected);
            }
            ar.seq_number = ar.seq_number.wrapping_add(1);
            (ar.snapshot(), *ar.strategy.current(), ar.seq_number)
        };
        let mut body = vec![0u8; 512 + data.len()];
        let len = crate::protocol::rpc::record::build_write_request(
            &mut body, seq, snap.ar_uuid, addr, data,
        )
        .map_err(Error::from)?;
        let response = self.rpc.call(
            snap.device_ip,
            self.cfg.rpc_port,
            device_object_uuid(0x0001, snap.device_id, snap.vendor_id),
            RPC_OPNUM_WRITE,
            &body[..len],
            strat.swap_uuids,
            strat.include_ndr,
        )?;
        let status =
            crate::protocol::rpc::record::parse_write_response(&response).map_err(Error::from)?;
        if status.is_ok() {
            Ok(())
        } else {
            Err(Error::ConnectionFailed(format!(
                "{}: record write rejected code1=0x{:02x} code2=0x{:02x}",
                station, status.error_code1, status.error_code2
            )))
        }
    }

    // ========================================================================
    // AR table bookkeeping
    // ========================================================================

    fn alloc_session_key(&self) -> u16 {
        let ars = self.ars.lock();
        let mut key_gen = self.next_session_key.lock();
        loop {
            let key = *key_gen;
            // 16-bit key space, wrapping back past 32767.
            *key_gen = if key >= 0x7FFF { 1 } else { key + 1 };
            let input_id = frame_id_for(key, IocrDirection::Input);
            let output_id = frame_id_for(key, IocrDirection::Output);
            let clash = ars.iter().any(|a| {
                a.session_key == key
                    || a.input.frame_id == input_id
                    || a.output.frame_id == output_id
            });
            if !clash {
                return key;
            }
        }
    }

    fn create_ar(
        &self,
        entry: &DcpEntry,
        slots: &[SlotInfo],
        strategy: StrategyState,
        from_cache: bool,
        now_ms: u64,
    ) -> Result<ArSnapshot> {
        let session_key = self.alloc_session_key();
        let ar_uuid = Uuid::new_v4(&mut self.rng.lock());
        let ar = Ar {
            station: entry.station.clone(),
            ar_uuid,
            session_key,
            device_mac: entry.mac,
            device_ip: entry.ip,
            vendor_id: entry.vendor_id,
            device_id: entry.device_id,
            state: ArState::Init,
            connecting: true,
            slots: slots.to_vec(),
            input: Iocr::new(
                IocrDirection::Input,
                frame_id_for(session_key, IocrDirection::Input),
                slots,
                self.cfg.send_clock_factor,
                self.cfg.reduction_ratio,
                self.cfg.watchdog_factor,
            ),
            output: Iocr::new(
                IocrDirection::Output,
                frame_id_for(session_key, IocrDirection::Output),
                slots,
                self.cfg.send_clock_factor,
                self.cfg.reduction_ratio,
                self.cfg.watchdog_factor,
            ),
            watchdog_ms: self.cfg.watchdog_ms,
            last_activity_ms: now_ms,
            state_entered_ms: now_ms,
            strategy,
            backoff_until_ms: None,
            last_error: None,
            device_session_key: 0,
            device_alarm_ref: None,
            from_cache,
            module_diff: false,
            seq_number: 0,
        };
        let snap = ar.snapshot();
        let mut ars = self.ars.lock();
        let mut ar = ar;
        ar.enter(ArState::ConnectReq, now_ms);
        ars.push(ar);
        Ok(snap)
    }

    /// Put an AR into ABORT with backoff and surface the error state.
    fn fail_ar(&self, station: &str, reason: &str, now_ms: u64) {
        let backoff = {
            let mut ars = self.ars.lock();
            let Some(ar) = ars.iter_mut().find(|a| a.station == station) else {
                return;
            };
            ar.enter(ArState::Abort, now_ms);
            ar.connecting = false;
            ar.last_error = Some(reason.to_string());
            let backoff = backoff_ms(ar.strategy.cycles);
            ar.backoff_until_ms = Some(now_ms + backoff);
            backoff
        };
        log::warn!("[ar] {} aborted ({}), retry in {} ms", station, reason, backoff);
        let _ = self.registry.set_device_state(station, DeviceState::Error);
        self.events.on_device_state_changed(station, DeviceState::Error);
    }

    /// Release and destroy an AR. Idempotent; a missing AR is success.
    pub fn disconnect_device(&self, station: &str, now_ms: u64) -> Result<()> {
        let snapshot = {
            let mut ars = self.ars.lock();
            let Some(ar) = ars.iter_mut().find(|a| a.station == station) else {
                return Ok(());
            };
            ar.connecting = true;
            let needs_release = matches!(
                ar.state,
                ArState::ConnectCnf | ArState::PrmSrv | ArState::Ready | ArState::Run
            );
            let strat = *ar.strategy.current();
            needs_release.then(|| (ar.snapshot(), strat))
        };

        if let Some((snap, strat)) = snapshot {
            // Release may time out; the device may already be gone.
            self.release_quietly(&snap, &strat);
        }

        {
            let mut ars = self.ars.lock();
            if let Some(idx) = ars.iter().position(|a| a.station == station) {
                ars[idx].enter(ArState::Close, now_ms);
                ars.remove(idx);
            }
        }
        let _ = self.registry.set_device_state(station, DeviceState::Offline);
        self.events.on_device_state_changed(station, DeviceState::Offline);
        log::info!("[ar] {} released", station);
        Ok(())
    }

    fn schedule_gsdml_fetch(&self, entry: &DcpEntry) {
        let ip = entry.ip;
        let port = self.cfg.rtu_http_port;
        let dir = self.cfg.gsdml_cache_dir.clone();
        let station = entry.station.clone();
        let cap = self.cfg.gsdml_max_file_bytes;
        // Best-effort, short-lived; not one of the controller's long-running
        // threads.
        let _ = std::thread::Builder::new()
            .name("pnio-gsdml".into())
            .spawn(move || crate::gsdml::fetch_gsdml_http(ip, port, &dir, &station, cap));
    }

    // ========================================================================
    // Tick (cyclic housekeeping)
    // ========================================================================

    /// State-machine housekeeping: inbound ApplicationReady, timeouts,
    /// watchdogs, backoff expiry. Non-blocking; runs on the cyclic thread.
    pub fn tick(&self, now_ms: u64) {
        self.poll_application_ready(now_ms);

        let mut watchdog_hits: Vec<String> = Vec::new();
        {
            let mut ars = self.ars.lock();
            for ar in ars.iter_mut() {
                if ar.connecting {
                    continue;
                }
                match ar.state {
                    ArState::ConnectReq | ArState::ConnectCnf | ArState::PrmSrv => {
                        if now_ms > ar.state_entered_ms + CONNECT_TIMEOUT_MS {
                            ar.enter(ArState::Abort, now_ms);
                            ar.last_error = Some("connect phase stalled".into());
                            ar.backoff_until_ms = Some(now_ms + backoff_ms(ar.strategy.cycles));
                            watchdog_hits.push(ar.station.clone());
                        }
                    }
                    ArState::Ready => {
                        if now_ms > ar.state_entered_ms + APP_READY_TIMEOUT_MS {
                            ar.enter(ArState::Abort, now_ms);
                            ar.last_error = Some("no ApplicationReady".into());
                            ar.backoff_until_ms = Some(now_ms + backoff_ms(ar.strategy.cycles));
                            watchdog_hits.push(ar.station.clone());
                        }
                    }
                    ArState::Run => {
                        if now_ms.saturating_sub(ar.last_activity_ms) > ar.watchdog_ms {
                            ar.enter(ArState::Abort, now_ms);
                            ar.last_error = Some("watchdog expired".into());
                            ar.backoff_until_ms = Some(now_ms + backoff_ms(ar.strategy.cycles));
                            watchdog_hits.push(ar.station.clone());
                        }
                    }
                    ArState::Abort => {
                        if let Some(due) = ar.backoff_until_ms {
                            if now_ms >= due {
                                ar.backoff_until_ms = None;
                                let _ = self.reconnect_tx.send(ar.station.clone());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        for station in watchdog_hits {
            log::warn!("[ar] {} supervision expired", station);
            let _ = self.registry.set_device_state(&station, DeviceState::Error);
            self.events.on_device_state_changed(&station, DeviceState::Error);
        }
    }

    /// Poll the RPC socket for device-initiated control requests and answer
    /// them. ApplicationReady advances READY -> RUN.
    fn poll_application_ready(&self, now_ms: u64) {
        while let Some(request) = self.rpc.poll_inbound() {
            if request.opnum != RPC_OPNUM_CONTROL {
                log::debug!(
                    "[rpc] unexpected inbound opnum {} from {}",
                    request.opnum,
                    request.source
                );
                continue;
            }
            let control = match parse_inbound_control_request(&request.body) {
                Ok(c) => c,
                Err(_) => {
                    log::debug!("[rpc] malformed inbound control from {}", request.source);
                    continue;
                }
            };

            let station = {
                let ars = self.ars.lock();
                ars.iter()
                    .find(|a| a.ar_uuid == control.ar_uuid)
                    .map(|a| a.station.clone())
            };
            let Some(station) = station else {
                log::debug!("[rpc] inbound control for unknown AR {}", control.ar_uuid);
                continue;
            };

            let mut body = vec![0u8; 256];
            match build_inbound_control_response(&mut body, &control) {
                Ok(len) => {
                    if let Err(e) = self.rpc.respond(&request, &body[..len]) {
                        log::warn!("[rpc] ApplicationReady response to {} failed: {}", station, e);
                        continue;
                    }
                }
                Err(_) => continue,
            }

            if control.command == CONTROL_COMMAND_APPLICATION_READY {
                let advanced = {
                    let mut ars = self.ars.lock();
                    match ars.iter_mut().find(|a| a.ar_uuid == control.ar_uuid) {
                        Some(ar) if ar.state == ArState::Ready => {
                            ar.enter(ArState::Run, now_ms);
                            ar.last_activity_ms = now_ms;
                            true
                        }
                        _ => false,
                    }
                };
                if advanced {
                    log::info!("[ar] {} entered RUN", station);
                    let _ = self.registry.set_device_state(&station, DeviceState::Running);
                    self.events.on_device_state_changed(&station, DeviceState::Running);
                }
            }
        }
    }

    // ========================================================================
    // Cyclic data path
    // ========================================================================

    /// Run `f` over every RUN-state, non-connecting AR under the table lock.
    /// The cyclic engine uses this to produce output frames.
    pub fn with_run_ars<F: FnMut(&mut Ar)>(&self, mut f: F) {
        let mut ars = self.ars.lock();
        for ar in ars.iter_mut() {
            if ar.state == ArState::Run && !ar.connecting {
                f(ar);
            }
        }
    }

    /// Consume one cyclic input frame. Returns true when a matching input
    /// IOCR existed. Fires `on_data_received` per sensor slot (ordinal
    /// indexing) while the table lock is held; registry updates happen
    /// after it drops.
    pub fn ingest_input_frame(
        &self,
        frame_id: u16,
        payload: &[u8],
        now_us: u64,
        now_ms: u64,
    ) -> bool {
        let mut samples: Vec<(String, u16, SensorSample)> = Vec::new();
        let handled = {
            let mut ars = self.ars.lock();
            let Some(ar) = ars
                .iter_mut()
                .find(|a| a.input.frame_id == frame_id && !a.connecting)
            else {
                return false;
            };
            if ar.state != ArState::Run {
                log::debug!(
                    "[cyclic] input frame 0x{:04x} for {} in {:?}, ignored",
                    frame_id,
                    ar.station,
                    ar.state
                );
                return true;
            }
            let take = payload.len().min(ar.input.buffer.len());
            ar.input.buffer[..take].copy_from_slice(&payload[..take]);
            ar.input.last_frame_time_us = now_us;
            ar.last_activity_ms = now_ms;

            // Slice each sensor slot by accumulated offset and deliver.
            let mut offset = 0usize;
            let mut sensor_index = 0usize;
            for s in ar.slots.iter().filter(|s| s.role == SlotRole::Sensor) {
                let len = usize::from(s.data_length);
                if offset + len > take {
                    break;
                }
                let bytes = &ar.input.buffer[offset..offset + len];
                self.events.on_data_received(&ar.station, sensor_index, bytes);
                if let Ok(sample) = SensorSample::decode(bytes, now_ms) {
                    samples.push((ar.station.clone(), s.slot, sample));
                }
                offset += len;
                sensor_index += 1;
            }
            true
        };

        for (station, slot, sample) in samples {
            let _ = self.registry.update_sensor(&station, slot, sample);
        }
        handled
    }

    /// Copy an actuator command into the output image at its accumulated
    /// offset and mirror it into the registry.
    pub fn write_actuator(
        &self,
        station: &str,
        slot: u16,
        cmd: crate::types::ActuatorCommand,
    ) -> Result<()> {
        {
            let mut ars = self.ars.lock();
            let ar = find_mut(&mut ars, station)?;
            let (offset, len) = iocr::slot_range(&ar.slots, IocrDirection::Output, slot)
                .ok_or(Error::NotFound)?;
            let wire = cmd.encode();
            if len < wire.len() {
                return Err(Error::InvalidParam(format!(
                    "slot {} output window is {} bytes",
                    slot, len
                )));
            }
            ar.output.buffer[offset..offset + wire.len()].copy_from_slice(&wire);
        }
        self.registry.update_actuator(station, slot, cmd)
    }

    /// Read a sensor slot's bytes from the input image at its accumulated
    /// offset.
    pub fn read_input(&self, station: &str, slot: u16) -> Result<SensorSample> {
        let ars = self.ars.lock();
        let ar = find(&ars, station)?;
        let (offset, len) =
            iocr::slot_range(&ar.slots, IocrDirection::Input, slot).ok_or(Error::NotFound)?;
        SensorSample::decode(&ar.input.buffer[offset..offset + len], 0)
    }
}

fn find<'a>(ars: &'a [Ar], station: &str) -> Result<&'a Ar> {
    ars.iter().find(|a| a.station == station).ok_or(Error::NotFound)
}

fn find_mut<'a>(ars: &'a mut [Ar], station: &str) -> Result<&'a mut Ar> {
    ars.iter_mut().find(|a| a.station == station).ok_or(Error::NotFound)
}

/// Backoff schedule: 5 s on cycle 0, doubling per completed strategy cycle,
/// capped at 60 s.
#[must_use]
fn backoff_ms(cycles: u32) -> u64 {
    let shifted = BACKOFF_BASE_MS.saturating_mul(1u64 << cycles.min(6));
    shifted.min(BACKOFF_CAP_MS)
}
