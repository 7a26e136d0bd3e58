// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connect request/response PNIO blocks (opnum 0).
//!
//! A Connect request body carries, in order: AR Block Req, one IOCR Block
//! Req per direction, the Alarm CR Block Req, and the Expected Submodule
//! Block. The AR UUID and all block integers are big-endian; the RPC header
//! above this layer owns the DREP quirks.

use crate::protocol::constants::*;
use crate::protocol::frame::{CodecError, CodecResult, FrameBuilder, FrameParser};
use crate::protocol::rpc::{
    begin_block, end_block, parse_block_header, parse_pnio_status, PnioStatus,
};
use crate::protocol::uuid::Uuid;
use crate::types::MacAddr;

/// One IO data object (or IOCS mirror) of an IOCR's API section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoDataObject {
    pub slot: u16,
    pub subslot: u16,
    pub frame_offset: u16,
}

/// Everything needed to serialize one IOCR Block Req.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IocrParam {
    /// `IOCR_TYPE_INPUT` or `IOCR_TYPE_OUTPUT`.
    pub iocr_type: u16,
    pub iocr_reference: u16,
    pub frame_id: u16,
    pub data_length: u16,
    pub send_clock_factor: u16,
    pub reduction_ratio: u16,
    pub watchdog_factor: u16,
    pub data_hold_factor: u16,
    /// Zero-length submodules (DAP) are omitted here.
    pub data_objects: Vec<IoDataObject>,
    /// Mirrors `data_objects` with 1-byte consumer-status offsets.
    pub iocs: Vec<IoDataObject>,
}

/// Expected submodule entry under one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedSubmodule {
    pub subslot: u16,
    pub submodule_ident: u32,
    /// `SUBMODULE_PROPERTIES_INPUT` or `SUBMODULE_PROPERTIES_OUTPUT`.
    pub properties: u16,
    pub data_length: u16,
}

/// One slot of the Expected Submodule Block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedSlot {
    pub slot: u16,
    pub module_ident: u32,
    pub submodules: Vec<ExpectedSubmodule>,
}

/// Parameters of a Connect request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub ar_uuid: Uuid,
    pub session_key: u16,
    pub controller_mac: MacAddr,
    pub controller_object_uuid: Uuid,
    /// CM initiator station name (the controller's, not the device's).
    pub station_name: String,
    pub rpc_port: u16,
    pub iocrs: Vec<IocrParam>,
    pub expected: Vec<ExpectedSlot>,
}

/// Serialize the Connect request block stream. Returns the body length.
pub fn build_connect_body(buf: &mut [u8], req: &ConnectRequest) -> CodecResult<usize> {
    let mut b = FrameBuilder::new(buf);

    // --- AR Block Req (0x0101), block length 54 + name_len ---
    let len_at = begin_block(&mut b, BLOCK_AR_REQ)?;
    b.u16_be(AR_TYPE_IOCAR)?;
    b.bytes(req.ar_uuid.as_bytes())?;
    b.u16_be(req.session_key)?;
    b.bytes(req.controller_mac.as_bytes())?;
    b.bytes(req.controller_object_uuid.as_bytes())?;
    b.u32_be(AR_PROPERTIES)?;
    b.u16_be(AR_ACTIVITY_TIMEOUT)?;
    b.u16_be(req.rpc_port)?;
    b.u16_be(req.station_name.len() as u16)?;
    b.bytes(req.station_name.as_bytes())?;
    end_block(&mut b, len_at)?;

    // --- IOCR Block Req (0x0102) per direction ---
    for iocr in &req.iocrs {
        let len_at = begin_block(&mut b, BLOCK_IOCR_REQ)?;
        b.u16_be(iocr.iocr_type)?;
        b.u16_be(iocr.iocr_reference)?;
        b.u16_be(ETHERTYPE_PROFINET)?; // LT field
        b.u32_be(IOCR_PROPERTIES_RT_CLASS1)?;
        b.u16_be(iocr.data_length)?;
        b.u16_be(iocr.frame_id)?;
        b.u16_be(iocr.send_clock_factor)?;
        b.u16_be(iocr.reduction_ratio)?;
        b.u16_be(1)?; // phase
        b.u16_be(0)?; // sequence
        b.u32_be(IOCR_FRAME_SEND_OFFSET_UNSPEC)?;
        b.u16_be(iocr.watchdog_factor)?;
        b.u16_be(iocr.data_hold_factor)?;
        b.u16_be(IOCR_TAG_HEADER)?;
        b.zeros(6)?; // multicast MAC unused for unicast RT
        b.u16_be(1)?; // number of APIs
        b.u32_be(0)?; // API 0
        b.u16_be(iocr.data_objects.len() as u16)?;
        for obj in &iocr.data_objects {
            b.u16_be(obj.slot)?;
            b.u16_be(obj.subslot)?;
            b.u16_be(obj.frame_offset)?;
        }
        b.u16_be(iocr.iocs.len() as u16)?;
        for obj in &iocr.iocs {
            b.u16_be(obj.slot)?;
            b.u16_be(obj.subslot)?;
            b.u16_be(obj.frame_offset)?;
        }
        end_block(&mut b, len_at)?;
    }

    // --- Alarm CR Block Req (0x0103) ---
    let len_at = begin_block(&mut b, BLOCK_ALARM_CR_REQ)?;
    b.u16_be(ALARM_CR_TYPE)?;
    b.u16_be(ETHERTYPE_PROFINET)?;
    b.u32_be(0)?; // properties
    b.u16_be(ALARM_CR_RTA_TIMEOUT_FACTOR)?;
    b.u16_be(ALARM_CR_RTA_RETRIES)?;
    b.u16_be(ALARM_CR_LOCAL_REF)?;
    b.u16_be(ALARM_CR_MAX_DATA_LEN)?;
    b.u16_be(ALARM_CR_TAG_HEADER_HIGH)?;
    b.u16_be(ALARM_CR_TAG_HEADER_LOW)?;
    end_block(&mut b, len_at)?;

    // --- Expected Submodule Block (0x0104) ---
    let len_at = begin_block(&mut b, BLOCK_EXPECTED_SUBMODULE)?;
    b.u16_be(req.expected.len() as u16)?; // one API entry per slot
    for slot in &req.expected {
        b.u32_be(0)?; // API 0
        b.u16_be(slot.slot)?;
        b.u32_be(slot.module_ident)?;
        b.u16_be(0)?; // module properties
        b.u16_be(slot.submodules.len() as u16)?;
        for sub in &slot.submodules {
            b.u16_be(sub.subslot)?;
            b.u32_be(sub.submodule_ident)?;
            b.u16_be(sub.properties)?;
            let description = if sub.properties == SUBMODULE_PROPERTIES_OUTPUT {
                DATA_DESCRIPTION_OUTPUT
            } else {
                DATA_DESCRIPTION_INPUT
            };
            b.u16_be(description)?;
            b.u16_be(sub.data_length)?;
            b.u8(1)?; // length IOCS
            b.u8(1)?; // length IOPS
        }
    }
    end_block(&mut b, len_at)?;

    Ok(b.finish())
}

/// Parse a Connect request body back into its parameters.
///
/// Used by the codec tests and by mock-device harnesses; the activity UUID
/// lives in the RPC header and is deliberately not part of this round-trip.
pub fn parse_connect_body(buf: &[u8]) -> CodecResult<ConnectRequest> {
    let mut p = FrameParser::new(buf);
    let mut req: Option<ConnectRequest> = None;
    let mut iocrs = Vec::new();
    let mut expected = Vec::new();

    while p.remaining() >= 6 {
        let hdr = parse_block_header(&mut p)?;
        let block_end = p.position() + hdr.payload_len;
        match hdr.block_type {
            BLOCK_AR_REQ => {
                let _ar_type = p.u16_be()?;
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(p.bytes(16)?);
                let session_key = p.u16_be()?;
                let mut mac = [0u8; 6];
                mac.copy_from_slice(p.bytes(6)?);
                let mut obj = [0u8; 16];
                obj.copy_from_slice(p.bytes(16)?);
                let _properties = p.u32_be()?;
                let _timeout = p.u16_be()?;
                let rpc_port = p.u16_be()?;
                let name_len = p.u16_be()? as usize;
                let name = p.bytes(name_len)?;
                req = Some(ConnectRequest {
                    ar_uuid: Uuid(uuid),
                    session_key,
                    controller_mac: MacAddr(mac),
                    controller_object_uuid: Uuid(obj),
                    station_name: String::from_utf8_lossy(name).into_owned(),
                    rpc_port,
                    iocrs: Vec::new(),
                    expected: Vec::new(),
                });
            }
            BLOCK_IOCR_REQ => {
                let iocr_type = p.u16_be()?;
                let iocr_reference = p.u16_be()?;
                let _lt = p.u16_be()?;
                let _properties = p.u32_be()?;
                let data_length = p.u16_be()?;
                let frame_id = p.u16_be()?;
                let send_clock_factor = p.u16_be()?;
                let reduction_ratio = p.u16_be()?;
                let _phase = p.u16_be()?;
                let _sequence = p.u16_be()?;
                let _send_offset = p.u32_be()?;
                let watchdog_factor = p.u16_be()?;
                let data_hold_factor = p.u16_be()?;
                let _tag_header = p.u16_be()?;
                p.skip(6)?; // multicast MAC
                let api_count = p.u16_be()?;
                if api_count != 1 {
                    return Err(CodecError::TooShort);
                }
                let _api = p.u32_be()?;
                let n_obj = p.u16_be()? as usize;
                let mut data_objects = Vec::with_capacity(n_obj);
                for _ in 0..n_obj {
                    data_objects.push(IoDataObject {
                        slot: p.u16_be()?,
                        subslot: p.u16_be()?,
                        frame_offset: p.u16_be()?,
                    });
                }
                let n_iocs = p.u16_be()? as usize;
                let mut iocs = Vec::with_capacity(n_iocs);
                for _ in 0..n_iocs {
                    iocs.push(IoDataObject {
                        slot: p.u16_be()?,
                        subslot: p.u16_be()?,
                        frame_offset: p.u16_be()?,
                    });
                }
                iocrs.push(IocrParam {
                    iocr_type,
                    iocr_reference,
                    frame_id,
                    data_length,
                    send_clock_factor,
                    reduction_ratio,
                    watchdog_factor,
                    data_hold_factor,
                    data_objects,
                    iocs,
                });
            }
            BLOCK_EXPECTED_SUBMODULE => {
                let n_slots = p.u16_be()? as usize;
                for _ in 0..n_slots {
                    let _api = p.u32_be()?;
                    let slot = p.u16_be()?;
                    let module_ident = p.u32_be()?;
                    let _module_properties = p.u16_be()?;
                    let n_subs = p.u16_be()? as usize;
                    let mut submodules = Vec::with_capacity(n_subs);
                    for _ in 0..n_subs {
                        let subslot = p.u16_be()?;
                        let submodule_ident = p.u32_be()?;
                        let properties = p.u16_be()?;
                        let _description = p.u16_be()?;
                        let data_length = p.u16_be()?;
                        let _iocs_len = p.u8()?;
                        let _iops_len = p.u8()?;
                        submodules.push(ExpectedSubmodule {
                            subslot,
                            submodule_ident,
                            properties,
                            data_length,
                        });
                    }
                    expected.push(ExpectedSlot {
                        slot,
                        module_ident,
                        submodules,
                    });
                }
            }
            _ => {
                // Alarm CR and vendor blocks carry no state the round-trip needs.
                p.seek(block_end)?;
            }
        }
        p.seek(block_end)?;
    }

    let mut req = req.ok_or(CodecError::TooShort)?;
    req.iocrs = iocrs;
    req.expected = expected;
    Ok(req)
}

// ============================================================================
// Connect response
// ============================================================================

/// Parsed Connect response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub status: PnioStatus,
    pub ar_uuid: Uuid,
    /// Session key chosen by the device.
    pub device_session_key: u16,
    pub device_mac: MacAddr,
    pub responder_udp_port: u16,
    /// `(iocr_type, frame_id)` confirmations, possibly reassigned.
    pub iocr_frame_ids: Vec<(u16, u16)>,
    pub device_alarm_ref: Option<u16>,
    /// Device reported a module configuration mismatch (non-fatal).
    pub module_diff: bool,
}

/// Parse a Connect response body (PNIO status + result blocks).
pub fn parse_connect_response(buf: &[u8]) -> CodecResult<ConnectResponse> {
    let mut p = FrameParser::new(buf);
    let status = parse_pnio_status(&mut p)?;
    let mut out = ConnectResponse {
        status,
        ar_uuid: Uuid::NIL,
        device_session_key: 0,
        device_mac: MacAddr::default(),
        responder_udp_port: 0,
        iocr_frame_ids: Vec::new(),
        device_alarm_ref: None,
        module_diff: false,
    };
    if !status.is_ok() {
        return Ok(out);
    }

    while p.remaining() >= 6 {
        let hdr = parse_block_header(&mut p)?;
        let block_end = p.position() + hdr.payload_len;
        match hdr.block_type {
            BLOCK_AR_RES => {
                let _ar_type = p.u16_be()?;
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(p.bytes(16)?);
                out.ar_uuid = Uuid(uuid);
                out.device_session_key = p.u16_be()?;
                let mut mac = [0u8; 6];
                mac.copy_from_slice(p.bytes(6)?);
                out.device_mac = MacAddr(mac);
                out.responder_udp_port = p.u16_be()?;
            }
            BLOCK_IOCR_RES => {
                let iocr_type = p.u16_be()?;
                let _reference = p.u16_be()?;
                let frame_id = p.u16_be()?;
                out.iocr_frame_ids.push((iocr_type, frame_id));
            }
            BLOCK_ALARM_CR_RES => {
                let _alarm_type = p.u16_be()?;
                out.device_alarm_ref = Some(p.u16_be()?);
            }
            BLOCK_MODULE_DIFF => {
                out.module_diff = true;
            }
            _ => {}
        }
        p.seek(block_end)?;
    }
    Ok(out)
}
