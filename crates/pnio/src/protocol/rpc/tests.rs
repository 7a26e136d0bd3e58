// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

use super::connect::*;
use super::control::*;
use super::record::*;
use super::*;
use crate::protocol::constants::*;
use crate::protocol::frame::{FrameBuilder, FrameParser};
use crate::protocol::uuid::Uuid;
use crate::types::{MacAddr, ModuleEntry};

fn uuid(s: &str) -> Uuid {
    s.parse().unwrap()
}

fn sample_header(swap: bool) -> RpcHeaderParams {
    RpcHeaderParams {
        packet_type: RPC_PACKET_TYPE_REQUEST,
        object: uuid("dea00000-6c97-11d1-8271-000000000001"),
        interface: uuid(PNIO_DEVICE_INTERFACE_UUID),
        activity: uuid("9f0e6d5c-4b3a-4219-8071-614253627180"),
        seq_num: 7,
        opnum: RPC_OPNUM_CONNECT,
        body_len: 0x0123,
        swap_uuids: swap,
    }
}

#[test]
fn rpc_header_is_80_bytes_and_round_trips() {
    let mut buf = [0u8; 128];
    let params = sample_header(true);
    let len = {
        let mut b = FrameBuilder::new(&mut buf);
        build_rpc_header(&mut b, &params).unwrap();
        b.finish()
    };
    assert_eq!(len, RPC_HEADER_LEN);
    assert_eq!(buf[0], RPC_VERSION);
    assert_eq!(buf[2], RPC_FLAG1_LAST_FRAGMENT | RPC_FLAG1_IDEMPOTENT);
    assert_eq!(buf[4], RPC_DREP_LITTLE_ENDIAN);

    let mut p = FrameParser::new(&buf);
    let hdr = parse_rpc_header(&mut p).unwrap();
    // Parser undoes the DREP swap, so UUIDs come back in stored form.
    assert_eq!(hdr.interface, params.interface);
    assert_eq!(hdr.activity, params.activity);
    assert_eq!(hdr.seq_num, 7);
    assert_eq!(hdr.opnum, RPC_OPNUM_CONNECT);
    assert_eq!(hdr.fragment_len, 0x0123);
}

#[test]
fn unswapped_uuid_strategy_writes_stored_bytes() {
    let mut swapped = [0u8; 128];
    let mut stored = [0u8; 128];
    {
        let mut b = FrameBuilder::new(&mut swapped);
        build_rpc_header(&mut b, &sample_header(true)).unwrap();
    }
    {
        let mut b = FrameBuilder::new(&mut stored);
        build_rpc_header(&mut b, &sample_header(false)).unwrap();
    }
    // Interface UUID occupies bytes 24..40; the two strategies must differ
    // exactly in the first three fields.
    assert_ne!(&swapped[24..32], &stored[24..32]);
    assert_eq!(&swapped[32..40], &stored[32..40]);
    let iface = uuid(PNIO_DEVICE_INTERFACE_UUID);
    assert_eq!(&stored[24..40], iface.as_bytes());
    assert_eq!(&swapped[24..40], iface.swap_fields().as_bytes());
}

#[test]
fn ndr_header_round_trip() {
    let mut buf = [0u8; 32];
    let len = {
        let mut b = FrameBuilder::new(&mut buf);
        build_ndr_header(&mut b, 300, 4096).unwrap();
        b.finish()
    };
    assert_eq!(len, NDR_HEADER_LEN);
    let mut p = FrameParser::new(&buf);
    assert_eq!(parse_ndr_header(&mut p).unwrap(), 300);
}

fn sample_connect_request() -> ConnectRequest {
    ConnectRequest {
        ar_uuid: uuid("07070707-4444-4888-8111-222233334444"),
        session_key: 1,
        controller_mac: "00:50:56:00:00:01".parse().unwrap(),
        controller_object_uuid: uuid(PNIO_CONTROLLER_INTERFACE_UUID),
        station_name: "controller-0001".into(),
        rpc_port: PNIO_CM_UDP_PORT,
        iocrs: vec![
            IocrParam {
                iocr_type: IOCR_TYPE_INPUT,
                iocr_reference: 1,
                frame_id: 0xC002,
                data_length: 10,
                send_clock_factor: 32,
                reduction_ratio: 32,
                watchdog_factor: 3,
                data_hold_factor: 3,
                data_objects: vec![
                    IoDataObject { slot: 1, subslot: 1, frame_offset: 0 },
                    IoDataObject { slot: 3, subslot: 1, frame_offset: 5 },
                ],
                iocs: vec![IoDataObject { slot: 2, subslot: 1, frame_offset: 0 }],
            },
            IocrParam {
                iocr_type: IOCR_TYPE_OUTPUT,
                iocr_reference: 2,
                frame_id: 0xC003,
                data_length: 4,
                send_clock_factor: 32,
                reduction_ratio: 32,
                watchdog_factor: 3,
                data_hold_factor: 3,
                data_objects: vec![IoDataObject { slot: 2, subslot: 1, frame_offset: 0 }],
                iocs: vec![
                    IoDataObject { slot: 1, subslot: 1, frame_offset: 0 },
                    IoDataObject { slot: 3, subslot: 1, frame_offset: 1 },
                ],
            },
        ],
        expected: vec![
            ExpectedSlot {
                slot: 0,
                module_ident: DAP_MODULE_IDENT,
                submodules: vec![
                    ExpectedSubmodule {
                        subslot: DAP_SUBSLOT_DEVICE,
                        submodule_ident: DAP_SUBMODULE_DEVICE_IDENT,
                        properties: SUBMODULE_PROPERTIES_INPUT,
                        data_length: 0,
                    },
                    ExpectedSubmodule {
                        subslot: DAP_SUBSLOT_INTERFACE,
                        submodule_ident: DAP_SUBMODULE_INTERFACE_IDENT,
                        properties: SUBMODULE_PROPERTIES_INPUT,
                        data_length: 0,
                    },
                    ExpectedSubmodule {
                        subslot: DAP_SUBSLOT_PORT,
                        submodule_ident: DAP_SUBMODULE_PORT_IDENT,
                        properties: SUBMODULE_PROPERTIES_INPUT,
                        data_length: 0,
                    },
                ],
            },
            ExpectedSlot {
                slot: 1,
                module_ident: 0x0000_0010,
                submodules: vec![ExpectedSubmodule {
                    subslot: 1,
                    submodule_ident: 0x0000_0011,
                    properties: SUBMODULE_PROPERTIES_INPUT,
                    data_length: 5,
                }],
            },
            ExpectedSlot {
                slot: 2,
                module_ident: 0x0000_0020,
                submodules: vec![ExpectedSubmodule {
                    subslot: 1,
                    submodule_ident: 0x0000_0021,
                    properties: SUBMODULE_PROPERTIES_OUTPUT,
                    data_length: 4,
                }],
            },
        ],
    }
}

#[test]
fn connect_request_round_trips() {
    let req = sample_connect_request();
    let mut buf = vec![0u8; 1500];
    let len = build_connect_body(&mut buf, &req).unwrap();
    let parsed = parse_connect_body(&buf[..len]).unwrap();
    assert_eq!(parsed, req);
}

#[test]
fn ar_block_length_is_54_plus_name_len() {
    let req = sample_connect_request();
    let mut buf = vec![0u8; 1500];
    build_connect_body(&mut buf, &req).unwrap();
    assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), BLOCK_AR_REQ);
    let block_len = u16::from_be_bytes([buf[2], buf[3]]);
    assert_eq!(block_len as usize, 54 + req.station_name.len());
}

#[test]
fn connect_response_parse_extracts_frame_ids_and_alarm_ref() {
    // Assemble the body a device would answer with.
    let mut buf = vec![0u8; 512];
    let len = {
        let mut b = FrameBuilder::new(&mut buf);
        build_pnio_status(&mut b, PnioStatus::OK).unwrap();
        let at = begin_block(&mut b, BLOCK_AR_RES).unwrap();
        b.u16_be(AR_TYPE_IOCAR).unwrap();
        b.bytes(uuid("07070707-4444-4888-8111-222233334444").as_bytes()).unwrap();
        b.u16_be(0x0042).unwrap(); // device session key
        b.bytes("00:11:22:33:44:55".parse::<MacAddr>().unwrap().as_bytes()).unwrap();
        b.u16_be(PNIO_CM_UDP_PORT).unwrap();
        end_block(&mut b, at).unwrap();
        let at = begin_block(&mut b, BLOCK_IOCR_RES).unwrap();
        b.u16_be(IOCR_TYPE_INPUT).unwrap();
        b.u16_be(1).unwrap();
        b.u16_be(0xC001).unwrap();
        end_block(&mut b, at).unwrap();
        let at = begin_block(&mut b, BLOCK_ALARM_CR_RES).unwrap();
        b.u16_be(ALARM_CR_TYPE).unwrap();
        b.u16_be(0x0007).unwrap();
        b.u16_be(ALARM_CR_MAX_DATA_LEN).unwrap();
        end_block(&mut b, at).unwrap();
        b.finish()
    };
    let res = parse_connect_response(&buf[..len]).unwrap();
    assert!(res.status.is_ok());
    assert_eq!(res.device_session_key, 0x0042);
    assert_eq!(res.device_mac.to_string(), "00:11:22:33:44:55");
    assert_eq!(res.iocr_frame_ids, vec![(IOCR_TYPE_INPUT, 0xC001)]);
    assert_eq!(res.device_alarm_ref, Some(0x0007));
    assert!(!res.module_diff);
}

#[test]
fn faulted_connect_response_keeps_status() {
    let body = [0xDBu8, ERROR_DECODE_PNIOCM, 0x01, 0x02];
    let res = parse_connect_response(&body).unwrap();
    assert!(!res.status.is_ok());
    assert!(res.status.is_pniocm());
    assert_eq!(res.status.error_code1, 0x01);
    assert_eq!(res.status.error_code2, 0x02);
}

#[test]
fn control_request_response_round_trip() {
    let ar_uuid = uuid("a1a2a3a4-b1b2-4c1c-8d1d-e1e2e3e4e5e6");
    let mut buf = [0u8; 128];
    let len = build_control_request(&mut buf, ar_uuid, 3, CONTROL_COMMAND_PRM_END).unwrap();
    let blk = parse_inbound_control_request(&buf[..len]).unwrap();
    assert_eq!(blk.ar_uuid, ar_uuid);
    assert_eq!(blk.session_key, 3);
    assert_eq!(blk.command, CONTROL_COMMAND_PRM_END);

    let mut res = [0u8; 128];
    let res_len = build_inbound_control_response(&mut res, &blk).unwrap();
    let status = parse_control_response(&res[..res_len], CONTROL_COMMAND_PRM_END).unwrap();
    assert!(status.is_ok());
}

#[test]
fn iox_application_ready_gets_iox_response() {
    let blk = ControlBlock {
        block_type: BLOCK_IOX_CONTROL_REQ,
        ar_uuid: uuid("a1a2a3a4-b1b2-4c1c-8d1d-e1e2e3e4e5e6"),
        session_key: 9,
        command: CONTROL_COMMAND_APPLICATION_READY,
    };
    let mut res = [0u8; 128];
    let len = build_inbound_control_response(&mut res, &blk).unwrap();
    // status(4) then the block header
    assert_eq!(u16::from_be_bytes([res[4], res[5]]), BLOCK_IOX_CONTROL_RES);
    let status = parse_control_response(&res[..len], CONTROL_COMMAND_APPLICATION_READY).unwrap();
    assert!(status.is_ok());
}

#[test]
fn mismatched_control_echo_is_a_protocol_error() {
    let blk = ControlBlock {
        block_type: BLOCK_IOD_CONTROL_REQ,
        ar_uuid: Uuid::NIL,
        session_key: 1,
        command: CONTROL_COMMAND_RELEASE,
    };
    let mut res = [0u8; 128];
    let len = build_inbound_control_response(&mut res, &blk).unwrap();
    assert!(parse_control_response(&res[..len], CONTROL_COMMAND_PRM_END).is_err());
}

#[test]
fn real_identification_round_trips_sparse_slots() {
    // The S6 layout: two application slots behind the DAP.
    let entries = vec![
        ModuleEntry { slot: 1, subslot: 1, module_ident: 0x0000_0010, submodule_ident: 0x0000_0011 },
        ModuleEntry { slot: 2, subslot: 1, module_ident: 0x0000_0020, submodule_ident: 0x0000_0021 },
    ];
    let mut buf = [0u8; 256];
    let len = build_real_identification(&mut buf, &entries).unwrap();
    assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), BLOCK_REAL_IDENTIFICATION);
    let parsed = parse_real_identification(&buf[..len]).unwrap();
    assert_eq!(parsed, entries);
}

#[test]
fn record_read_request_addresses_whole_device() {
    let mut buf = [0u8; 256];
    let len = build_read_request(
        &mut buf,
        1,
        uuid("a1a2a3a4-b1b2-4c1c-8d1d-e1e2e3e4e5e6"),
        RecordAddr::real_identification(),
        4096,
    )
    .unwrap();
    assert!(len > 6);
    assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), BLOCK_IOD_READ_REQ);
    // version(2) + seq(2) + uuid(16) + api(4) after the 6-byte header
    let slot_at = 6 + 2 + 16 + 4;
    assert_eq!(u16::from_be_bytes([buf[slot_at], buf[slot_at + 1]]), RECORD_SLOT_ALL);
    let index_at = slot_at + 2 + 2 + 2;
    assert_eq!(
        u16::from_be_bytes([buf[index_at], buf[index_at + 1]]),
        RECORD_INDEX_REAL_IDENTIFICATION
    );
}

#[test]
fn record_read_response_carries_data() {
    let payload = [0xAAu8, 0xBB, 0xCC];
    let mut buf = vec![0u8; 256];
    let len = {
        let mut b = FrameBuilder::new(&mut buf);
        build_pnio_status(&mut b, PnioStatus::OK).unwrap();
        let at = begin_block(&mut b, BLOCK_IOD_READ_RES).unwrap();
        b.u16_be(1).unwrap(); // seq
        b.bytes(Uuid::NIL.as_bytes()).unwrap();
        b.u32_be(0).unwrap();
        b.u16_be(RECORD_SLOT_ALL).unwrap();
        b.u16_be(RECORD_SUBSLOT_ALL).unwrap();
        b.u16_be(0).unwrap();
        b.u16_be(RECORD_INDEX_REAL_IDENTIFICATION).unwrap();
        b.u32_be(payload.len() as u32).unwrap();
        b.zeros(8).unwrap();
        end_block(&mut b, at).unwrap();
        b.bytes(&payload).unwrap();
        b.finish()
    };
    let res = parse_read_response(&buf[..len]).unwrap();
    assert!(res.status.is_ok());
    assert_eq!(res.data, payload);
}

#[test]
fn record_write_request_appends_data() {
    let mut buf = [0u8; 256];
    let secret = b"rotate:wq-7";
    let len = build_write_request(
        &mut buf,
        2,
        Uuid::NIL,
        RecordAddr {
            api: 0,
            slot: 0,
            subslot: 1,
            index: RECORD_INDEX_CREDENTIAL_SYNC,
        },
        secret,
    )
    .unwrap();
    assert_eq!(&buf[len - secret.len()..len], secret);
    assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), BLOCK_IOD_WRITE_REQ);
}

#[test]
fn truncated_rpc_header_is_rejected() {
    let buf = [RPC_VERSION, RPC_PACKET_TYPE_REQUEST, 0, 0];
    let mut p = FrameParser::new(&buf);
    assert!(parse_rpc_header(&mut p).is_err());
}
