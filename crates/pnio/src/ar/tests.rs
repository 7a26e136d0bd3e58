// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! AR manager tests against a scripted in-memory device.

use super::*;
use crate::discovery::DcpEntry;
use crate::events::ControllerEvents;
use crate::protocol::frame::FrameBuilder;
use crate::protocol::rpc::connect::parse_connect_body;
use crate::protocol::rpc::control::{build_control_request, parse_inbound_control_request};
use crate::protocol::rpc::record::build_real_identification;
use crate::protocol::rpc::{begin_block, build_pnio_status, end_block};
use crate::transport::{InboundRequest, RpcTransport};
use crate::types::{ActuatorCommand, Device, ModuleEntry, PointTag};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

// ============================================================================
// Scripted device
// ============================================================================

#[derive(Default)]
struct MockState {
    /// Reject this many Connect attempts with `reject_status` first.
    reject_connects: usize,
    reject_status: PnioStatus,
    /// Frame ID the device assigns to the input IOCR (0 = echo request).
    assign_input_frame_id: u16,
    real_ident: Vec<ModuleEntry>,
    fail_prm_end: bool,
    /// `(swap_uuids, include_ndr, dap_only)` per observed Connect.
    connect_log: Vec<(bool, bool, bool)>,
    releases_seen: usize,
    last_ar_uuid: Uuid,
    last_session_key: u16,
}

struct MockRpc {
    state: parking_lot::Mutex<MockState>,
    inbound: parking_lot::Mutex<VecDeque<InboundRequest>>,
}

impl MockRpc {
    fn new(real_ident: Vec<ModuleEntry>) -> Arc<MockRpc> {
        Arc::new(MockRpc {
            state: parking_lot::Mutex::new(MockState {
                real_ident,
                ..MockState::default()
            }),
            inbound: parking_lot::Mutex::new(VecDeque::new()),
        })
    }

    fn source() -> SocketAddr {
        "192.168.6.21:34964".parse().unwrap()
    }

    /// Inject the device-initiated ApplicationReady for the last AR.
    fn push_application_ready(&self) {
        let (ar_uuid, session_key) = {
            let s = self.state.lock();
            (s.last_ar_uuid, s.last_session_key)
        };
        let mut body = vec![0u8; 128];
        let len = build_control_request(
            &mut body,
            ar_uuid,
            session_key,
            CONTROL_COMMAND_APPLICATION_READY,
        )
        .unwrap();
        body.truncate(len);
        self.inbound.lock().push_back(InboundRequest {
            activity: Uuid::NIL,
            seq_num: 99,
            opnum: RPC_OPNUM_CONTROL,
            body,
            source: Self::source(),
        });
    }

    fn error_body(status: PnioStatus) -> Vec<u8> {
        vec![
            status.error_code,
            status.error_decode,
            status.error_code1,
            status.error_code2,
        ]
    }

    fn connect_ok_body(req: &crate::protocol::rpc::connect::ConnectRequest, input_frame_id: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        let len = {
            let mut b = FrameBuilder::new(&mut buf);
            build_pnio_status(&mut b, PnioStatus::OK).unwrap();
            let at = begin_block(&mut b, BLOCK_AR_RES).unwrap();
            b.u16_be(AR_TYPE_IOCAR).unwrap();
            b.bytes(req.ar_uuid.as_bytes()).unwrap();
            b.u16_be(0x4000 | req.session_key).unwrap();
            b.bytes(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]).unwrap();
            b.u16_be(PNIO_CM_UDP_PORT).unwrap();
            end_block(&mut b, at).unwrap();
            for iocr in &req.iocrs {
                let frame_id = if iocr.iocr_type == IOCR_TYPE_INPUT && input_frame_id != 0 {
                    input_frame_id
                } else {
                    iocr.frame_id
                };
                let at = begin_block(&mut b, BLOCK_IOCR_RES).unwrap();
                b.u16_be(iocr.iocr_type).unwrap();
                b.u16_be(iocr.iocr_reference).unwrap();
                b.u16_be(frame_id).unwrap();
                end_block(&mut b, at).unwrap();
            }
            let at = begin_block(&mut b, BLOCK_ALARM_CR_RES).unwrap();
            b.u16_be(ALARM_CR_TYPE).unwrap();
            b.u16_be(0x0005).unwrap();
            b.u16_be(ALARM_CR_MAX_DATA_LEN).unwrap();
            end_block(&mut b, at).unwrap();
            b.finish()
        };
        buf.truncate(len);
        buf
    }

    fn read_ok_body(entries: &[ModuleEntry]) -> Vec<u8> {
        let mut record = vec![0u8; 512];
        let record_len = build_real_identification(&mut record, entries).unwrap();
        let mut buf = vec![0u8; 1024];
        let len = {
            let mut b = FrameBuilder::new(&mut buf);
            build_pnio_status(&mut b, PnioStatus::OK).unwrap();
            let at = begin_block(&mut b, BLOCK_IOD_READ_RES).unwrap();
            b.u16_be(1).unwrap();
            b.bytes(Uuid::NIL.as_bytes()).unwrap();
            b.u32_be(0).unwrap();
            b.u16_be(RECORD_SLOT_ALL).unwrap();
            b.u16_be(RECORD_SUBSLOT_ALL).unwrap();
            b.u16_be(0).unwrap();
            b.u16_be(RECORD_INDEX_REAL_IDENTIFICATION).unwrap();
            b.u32_be(record_len as u32).unwrap();
            b.zeros(8).unwrap();
            end_block(&mut b, at).unwrap();
            b.bytes(&record[..record_len]).unwrap();
            b.finish()
        };
        buf.truncate(len);
        buf
    }

    fn control_ok_body(body: &[u8]) -> Vec<u8> {
        let request = parse_inbound_control_request(body).unwrap();
        let mut buf = vec![0u8; 128];
        let len =
            crate::protocol::rpc::control::build_inbound_control_response(&mut buf, &request)
                .unwrap();
        buf.truncate(len);
        buf
    }
}

impl RpcTransport for MockRpc {
    fn call(
        &self,
        _ip: std::net::Ipv4Addr,
        _port: u16,
        _object: Uuid,
        opnum: u16,
        body: &[u8],
        swap_uuids: bool,
        include_ndr: bool,
    ) -> crate::error::Result<Vec<u8>> {
        let mut s = self.state.lock();
        match opnum {
            RPC_OPNUM_CONNECT => {
                let req = parse_connect_body(body).expect("well-formed connect");
                let dap_only = req.expected.len() == 1 && req.expected[0].slot == DAP_SLOT;
                s.connect_log.push((swap_uuids, include_ndr, dap_only));
                if s.reject_connects > 0 {
                    s.reject_connects -= 1;
                    let status = s.reject_status;
                    return Ok(Self::error_body(status));
                }
                s.last_ar_uuid = req.ar_uuid;
                s.last_session_key = req.session_key;
                let frame_id = s.assign_input_frame_id;
                Ok(Self::connect_ok_body(&req, frame_id))
            }
            RPC_OPNUM_READ => Ok(Self::read_ok_body(&self.state_real_ident(&s))),
            RPC_OPNUM_WRITE => Ok(Self::error_body(PnioStatus::OK)),
            RPC_OPNUM_CONTROL => {
                let request = parse_inbound_control_request(body).expect("control block");
                if request.command == CONTROL_COMMAND_RELEASE {
                    s.releases_seen += 1;
                }
                if s.fail_prm_end && request.command == CONTROL_COMMAND_PRM_END {
                    return Ok(Self::error_body(PnioStatus {
                        error_code: 0xDB,
                        error_decode: ERROR_DECODE_PNIOCM,
                        error_code1: 0x02,
                        error_code2: 0x0A,
                    }));
                }
                Ok(Self::control_ok_body(body))
            }
            _ => Err(crate::error::Error::NotFound),
        }
    }

    fn poll_inbound(&self) -> Option<InboundRequest> {
        self.inbound.lock().pop_front()
    }

    fn respond(&self, _request: &InboundRequest, _body: &[u8]) -> crate::error::Result<()> {
        Ok(())
    }
}

impl MockRpc {
    fn state_real_ident(&self, s: &MockState) -> Vec<ModuleEntry> {
        s.real_ident.clone()
    }
}

// ============================================================================
// Recording event sink
// ============================================================================

#[derive(Default)]
struct RecordingEvents {
    states: parking_lot::Mutex<Vec<(String, DeviceState)>>,
    data: parking_lot::Mutex<Vec<(String, usize, Vec<u8>)>>,
    slots_seen: parking_lot::Mutex<Vec<usize>>,
}

impl ControllerEvents for RecordingEvents {
    fn on_device_state_changed(&self, station: &str, state: DeviceState) {
        self.states.lock().push((station.to_string(), state));
    }

    fn on_data_received(&self, station: &str, sensor_index: usize, data: &[u8]) {
        self.data
            .lock()
            .push((station.to_string(), sensor_index, data.to_vec()));
    }

    fn on_slots_discovered(&self, _station: &str, slots: &[SlotInfo]) {
        self.slots_seen.lock().push(slots.len());
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    manager: Arc<ArManager>,
    mock: Arc<MockRpc>,
    events: Arc<RecordingEvents>,
    registry: Arc<DeviceRegistry>,
    _cache_dir: tempfile::TempDir,
}

fn entry(station: &str) -> DcpEntry {
    DcpEntry {
        station: station.to_string(),
        mac: MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]),
        ip: "192.168.6.21".parse().unwrap(),
        netmask: "255.255.255.0".parse().unwrap(),
        gateway: "192.168.6.1".parse().unwrap(),
        vendor_id: 0x0100,
        device_id: 0x0001,
        ip_set: true,
        name_set: true,
        last_seen_ms: 0,
    }
}

fn sensor_actuator_modules() -> Vec<ModuleEntry> {
    vec![
        ModuleEntry { slot: 1, subslot: 1, module_ident: 0x10, submodule_ident: 0x11 },
        ModuleEntry { slot: 2, subslot: 1, module_ident: 0x20, submodule_ident: 0x21 },
    ]
}

fn sparse_slots() -> Vec<SlotInfo> {
    vec![
        SlotInfo::sensor(1, PointTag::Ph),
        SlotInfo::actuator(2, PointTag::Pump),
        SlotInfo::sensor(3, PointTag::Flow),
    ]
}

fn harness(real_ident: Vec<ModuleEntry>) -> Harness {
    let cache_dir = tempfile::tempdir().unwrap();
    let mock = MockRpc::new(real_ident);
    let events = Arc::new(RecordingEvents::default());
    let registry = Arc::new(DeviceRegistry::new());
    let rng = Arc::new(parking_lot::Mutex::new(fastrand::Rng::with_seed(7)));
    let manager = Arc::new(ArManager::new(
        ArManagerConfig {
            controller_mac: MacAddr([0x00, 0x50, 0x56, 0x00, 0x00, 0x01]),
            controller_station: "controller-0001".into(),
            controller_vendor_id: 0x0493,
            controller_device_id: 0x0001,
            send_clock_factor: 32,
            reduction_ratio: 32,
            watchdog_factor: 3,
            watchdog_ms: 3000,
            rpc_port: PNIO_CM_UDP_PORT,
            rtu_http_port: 9081,
            gsdml_cache_dir: cache_dir.path().to_path_buf(),
            gsdml_max_file_bytes: 1024 * 1024,
        },
        mock.clone() as Arc<dyn RpcTransport>,
        Arc::clone(&registry),
        events.clone() as Arc<dyn ControllerEvents>,
        rng,
    ));
    Harness {
        manager,
        mock,
        events,
        registry,
        _cache_dir: cache_dir,
    }
}

fn add_device(h: &Harness, station: &str) {
    let e = entry(station);
    h.registry
        .add_device(Device::new(e.station, e.mac, e.ip, e.vendor_id, e.device_id, Vec::new()))
        .unwrap();
}

fn run_state(h: &Harness, station: &str, now_ms: u64) {
    // Device signals ApplicationReady; the next tick answers and commits RUN.
    h.mock.push_application_ready();
    h.manager.tick(now_ms);
    assert_eq!(h.manager.state_of(station), Some(ArState::Run));
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn discovery_pipeline_connects_and_reaches_run() {
    let h = harness(sensor_actuator_modules());
    add_device(&h, "rtu-1234");

    // No cache file, no explicit slots: DAP probe + Record Read drive it.
    h.manager.connect_device(&entry("rtu-1234"), None, 0).unwrap();
    assert_eq!(h.manager.state_of("rtu-1234"), Some(ArState::Ready));

    // The probe connected DAP-only first, then the real configuration.
    {
        let s = h.mock.state.lock();
        assert!(s.connect_log[0].2, "first connect is the DAP probe");
        assert!(!s.connect_log.last().unwrap().2, "final connect carries full slots");
        assert_eq!(s.releases_seen, 1, "probe AR released");
    }

    run_state(&h, "rtu-1234", 10);
    let states = h.events.states.lock();
    assert!(states.contains(&("rtu-1234".into(), DeviceState::Connecting)));
    assert!(states.contains(&("rtu-1234".into(), DeviceState::Running)));
    assert_eq!(h.registry.get_device("rtu-1234").unwrap().state, DeviceState::Running);
    // Discovered layout: one sensor, one actuator.
    assert_eq!(h.registry.get_device("rtu-1234").unwrap().slots.len(), 2);
}

#[test]
fn explicit_slots_use_session_key_one_and_honor_reassigned_frame_id() {
    let h = harness(vec![]);
    add_device(&h, "rtu-1234");
    h.mock.state.lock().assign_input_frame_id = 0xC001;

    h.manager
        .connect_device(&entry("rtu-1234"), Some(sparse_slots()), 0)
        .unwrap();
    {
        let s = h.mock.state.lock();
        assert_eq!(s.last_session_key, 1);
        assert_eq!(s.connect_log.len(), 1);
    }
    run_state(&h, "rtu-1234", 5);

    // The device moved the input stream to 0xC001; ingestion must follow.
    let payload = [0u8; 10];
    assert!(h.manager.ingest_input_frame(0xC001, &payload, 1000, 5));
    assert!(!h.manager.ingest_input_frame(0xC002, &payload, 1000, 5));
}

#[test]
fn strategy_fallback_remembers_success_index() {
    let h = harness(vec![]);
    add_device(&h, "rtu-1234");
    {
        let mut s = h.mock.state.lock();
        s.reject_connects = 1;
        s.reject_status = PnioStatus {
            error_code: 0xDB,
            error_decode: ERROR_DECODE_PNIOCM,
            error_code1: 0x01,
            error_code2: 0x02,
        };
    }

    h.manager
        .connect_device(&entry("rtu-1234"), Some(sparse_slots()), 0)
        .unwrap();
    let strategy = h.manager.strategy_of("rtu-1234").unwrap();
    assert_eq!(strategy.last_success_index, Some(1));
    {
        let s = h.mock.state.lock();
        assert!(!s.connect_log[0].0, "attempt 0 sends UUIDs as stored");
        assert!(s.connect_log[1].0, "attempt 1 field-swaps UUIDs");
    }

    // Force an ABORT, then reconnect: strategy 1 is tried first.
    run_state(&h, "rtu-1234", 5);
    h.manager.tick(10_000); // watchdog (3000 ms) long expired
    assert_eq!(h.manager.state_of("rtu-1234"), Some(ArState::Abort));

    h.manager
        .connect_device(&entry("rtu-1234"), Some(sparse_slots()), 20_000)
        .unwrap();
    let s = h.mock.state.lock();
    let last = s.connect_log.last().unwrap();
    assert!(last.0, "reconnect leads with the remembered swapped-UUID strategy");
    assert_eq!(s.connect_log.len(), 3, "no extra rejected attempt before success");
}

#[test]
fn sparse_slot_offsets_deliver_correct_sensor_bytes() {
    let h = harness(vec![]);
    add_device(&h, "rtu-1234");
    h.manager
        .connect_device(&entry("rtu-1234"), Some(sparse_slots()), 0)
        .unwrap();
    run_state(&h, "rtu-1234", 5);

    // Two sensor samples: slot 1 = 7.0 / 0x80, slot 3 = 1.0 / 0x80.
    let payload = [
        0x40, 0xE0, 0x00, 0x00, 0x80, // slot 1
        0x3F, 0x80, 0x00, 0x00, 0x80, // slot 3
    ];
    assert!(h.manager.ingest_input_frame(
        iocr::frame_id_for(1, iocr::IocrDirection::Input),
        &payload,
        2000,
        6
    ));

    // Slot 3 reads from accumulated offset 5, not slot-number arithmetic.
    let sample = h.manager.read_input("rtu-1234", 3).unwrap();
    assert_eq!(sample.value, 1.0);
    assert_eq!(sample.quality, 0x80);
    let sample1 = h.manager.read_input("rtu-1234", 1).unwrap();
    assert_eq!(sample1.value, 7.0);

    // Callbacks carry sensor ordinals 0 and 1 (not raw slot numbers).
    let data = h.events.data.lock();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0].1, 0);
    assert_eq!(data[1].1, 1);
    assert_eq!(data[1].2, payload[5..10].to_vec());

    // Registry mirrors the decoded samples by slot.
    assert_eq!(h.registry.get_sensor("rtu-1234", 3).unwrap().value, 1.0);
}

#[test]
fn watchdog_expiry_aborts_and_schedules_backoff() {
    let h = harness(vec![]);
    add_device(&h, "rtu-1234");
    h.manager
        .connect_device(&entry("rtu-1234"), Some(sparse_slots()), 0)
        .unwrap();
    run_state(&h, "rtu-1234", 0);

    // Quiet device: 3100 ms without input against a 3000 ms budget.
    h.manager.tick(3100);
    assert_eq!(h.manager.state_of("rtu-1234"), Some(ArState::Abort));
    assert!(h
        .events
        .states
        .lock()
        .contains(&("rtu-1234".into(), DeviceState::Error)));

    // Backoff starts at 5 s: not due at 3.1+4.9 s, due after.
    h.manager.tick(8000);
    assert!(h.manager.due_reconnects().is_empty());
    h.manager.tick(8200);
    assert_eq!(h.manager.due_reconnects(), vec!["rtu-1234".to_string()]);
}

#[test]
fn frame_ids_unique_across_live_ars() {
    let h = harness(vec![]);
    add_device(&h, "rtu-1");
    add_device(&h, "rtu-2");
    h.manager
        .connect_device(&entry("rtu-1"), Some(sparse_slots()), 0)
        .unwrap();
    let mut e2 = entry("rtu-2");
    e2.mac = MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x66]);
    e2.ip = "192.168.6.22".parse().unwrap();
    h.manager.connect_device(&e2, Some(sparse_slots()), 0).unwrap();

    let ids = {
        let mut out = Vec::new();
        h.manager.with_run_ars(|_| {});
        for station in ["rtu-1", "rtu-2"] {
            let strategy = h.manager.strategy_of(station);
            assert!(strategy.is_some());
        }
        // Frame IDs derive from distinct session keys.
        for key in [1u16, 2] {
            out.push(iocr::frame_id_for(key, iocr::IocrDirection::Input));
            out.push(iocr::frame_id_for(key, iocr::IocrDirection::Output));
        }
        out
    };
    let unique: std::collections::HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
}

#[test]
fn zero_sensor_device_emits_no_data_callbacks() {
    let h = harness(vec![]);
    add_device(&h, "rtu-1234");
    let slots = vec![SlotInfo::actuator(1, PointTag::Valve)];
    h.manager.connect_device(&entry("rtu-1234"), Some(slots), 0).unwrap();
    run_state(&h, "rtu-1234", 5);

    let frame_id = iocr::frame_id_for(1, iocr::IocrDirection::Input);
    assert!(h.manager.ingest_input_frame(frame_id, &[], 100, 6));
    assert!(h.events.data.lock().is_empty());
}

#[test]
fn prm_end_rejection_aborts() {
    let h = harness(vec![]);
    add_device(&h, "rtu-1234");
    h.mock.state.lock().fail_prm_end = true;
    let err = h
        .manager
        .connect_device(&entry("rtu-1234"), Some(sparse_slots()), 0)
        .unwrap_err();
    assert!(matches!(err, crate::error::Error::ConnectionFailed(_)));
    assert_eq!(h.manager.state_of("rtu-1234"), Some(ArState::Abort));
}

#[test]
fn disconnect_is_idempotent_and_releases_once() {
    let h = harness(vec![]);
    add_device(&h, "rtu-1234");
    h.manager
        .connect_device(&entry("rtu-1234"), Some(sparse_slots()), 0)
        .unwrap();
    run_state(&h, "rtu-1234", 5);

    h.manager.disconnect_device("rtu-1234", 10).unwrap();
    assert_eq!(h.manager.state_of("rtu-1234"), None);
    // Second release of a gone AR is still success.
    h.manager.disconnect_device("rtu-1234", 11).unwrap();
    assert_eq!(h.mock.state.lock().releases_seen, 1);
    assert!(h
        .events
        .states
        .lock()
        .contains(&("rtu-1234".into(), DeviceState::Offline)));
}

#[test]
fn actuator_writes_land_in_output_image_and_cyclic_frame() {
    let h = harness(vec![]);
    add_device(&h, "rtu-1234");
    h.manager
        .connect_device(&entry("rtu-1234"), Some(sparse_slots()), 0)
        .unwrap();
    run_state(&h, "rtu-1234", 5);

    h.manager
        .write_actuator("rtu-1234", 2, ActuatorCommand { command: 1, pwm_duty: 200 })
        .unwrap();
    assert_eq!(h.registry.get_actuator("rtu-1234", 2).unwrap().pwm_duty, 200);

    let mut frames = Vec::new();
    h.manager.with_run_ars(|ar| {
        frames.push(crate::cyclic::build_output_frame(
            MacAddr([0x00, 0x50, 0x56, 0x00, 0x00, 0x01]),
            ar,
        ));
    });
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    // Minimum-size Ethernet frame, RT trailer in place.
    assert_eq!(frame.len(), MIN_ETH_FRAME_LEN);
    assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), ETHERTYPE_PROFINET);
    // Payload: frame id, 4-byte command, one IOPS byte, counter+status.
    assert_eq!(&frame[16..20], &[1, 200, 0, 0]);
    assert_eq!(frame[20], IOXS_GOOD);
    let status_at = 20 + 1 + 2;
    assert_eq!(frame[status_at], DATA_STATUS_RUN_FRAME);

    // Cycle counters increase monotonically per IOCR. The counter sits
    // right after the output image and the IOPS byte.
    let cc_at = ETH_HEADER_LEN + 2 + 4 + 1;
    let mut counters = Vec::new();
    for _ in 0..3 {
        h.manager.with_run_ars(|ar| {
            let f = crate::cyclic::build_output_frame(
                MacAddr([0x00, 0x50, 0x56, 0x00, 0x00, 0x01]),
                ar,
            );
            counters.push(u16::from_be_bytes([f[cc_at], f[cc_at + 1]]));
        });
    }
    assert!(counters.windows(2).all(|w| w[1] == w[0] + 1));
}

#[test]
fn input_frames_ignored_before_run() {
    let h = harness(vec![]);
    add_device(&h, "rtu-1234");
    h.manager
        .connect_device(&entry("rtu-1234"), Some(sparse_slots()), 0)
        .unwrap();
    // Still READY (no ApplicationReady yet): the frame is claimed but the
    // data callback never fires.
    let frame_id = iocr::frame_id_for(1, iocr::IocrDirection::Input);
    assert!(h.manager.ingest_input_frame(frame_id, &[0u8; 10], 100, 2));
    assert!(h.events.data.lock().is_empty());
}
