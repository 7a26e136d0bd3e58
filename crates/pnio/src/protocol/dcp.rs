// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DCP (Discovery and Configuration Protocol) frame codec.
//!
//! Identify-All goes to the PROFINET multicast address with option ALL/ALL;
//! devices answer unicast with a TLV list carrying station name, IP
//! parameters and device properties. The Set builders cover the
//! commissioning path (assign station name / IP over layer 2).
//!
//! DCP PDU layout after the Ethernet header:
//!
//! ```text
//! frame_id(2) service_id(1) service_type(1) xid(4) delay/reserved(2) data_length(2)
//! blocks: option(1) suboption(1) block_length(2) [block_info(2)] data... pad-to-even
//! ```

use crate::protocol::constants::*;
use crate::protocol::frame::{
    build_eth_header, parse_eth_header, CodecResult, FrameBuilder, FrameParser,
};
use crate::types::MacAddr;
use std::net::Ipv4Addr;

/// Everything a device reveals in one Identify response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcpIdentifyResponse {
    pub source_mac: MacAddr,
    pub xid: u32,
    pub station: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub vendor_id: Option<u16>,
    pub device_id: Option<u16>,
}

fn dcp_header(
    b: &mut FrameBuilder<'_>,
    frame_id: u16,
    service_id: u8,
    xid: u32,
    response_delay: u16,
) -> CodecResult<usize> {
    b.u16_be(frame_id)?;
    b.u8(service_id)?;
    b.u8(DCP_SERVICE_TYPE_REQUEST)?;
    b.u32_be(xid)?;
    b.u16_be(response_delay)?;
    let len_at = b.position();
    b.u16_be(0)?; // dcp_data_length, patched below
    Ok(len_at)
}

/// Build an Identify-All request frame. Returns the frame length.
pub fn build_identify_all(buf: &mut [u8], src: MacAddr, xid: u32) -> CodecResult<usize> {
    let mut b = FrameBuilder::new(buf);
    build_eth_header(&mut b, DCP_MULTICAST_MAC, src)?;
    let len_at = dcp_header(&mut b, FRAME_ID_DCP_IDENTIFY_REQ, DCP_SERVICE_IDENTIFY, xid, 1)?;
    let data_start = b.position();
    // Single ALL/ALL block selects every device.
    b.u8(DCP_OPTION_ALL)?;
    b.u8(DCP_SUBOPTION_ALL)?;
    b.u16_be(0)?;
    let data_len = (b.position() - data_start) as u16;
    b.patch_u16_be(len_at, data_len)?;
    b.pad_to(MIN_ETH_FRAME_LEN)?;
    Ok(b.finish())
}

/// Build a unicast Set request assigning a permanent station name.
pub fn build_set_station_name(
    buf: &mut [u8],
    dst: MacAddr,
    src: MacAddr,
    xid: u32,
    name: &str,
) -> CodecResult<usize> {
    let mut b = FrameBuilder::new(buf);
    build_eth_header(&mut b, dst, src)?;
    let len_at = dcp_header(&mut b, FRAME_ID_DCP_GET_SET, DCP_SERVICE_SET, xid, 0)?;
    let data_start = b.position();
    b.u8(DCP_OPTION_DEVICE_PROPERTIES)?;
    b.u8(DCP_SUBOPTION_STATION_NAME)?;
    b.u16_be(2 + name.len() as u16)?;
    b.u16_be(DCP_QUALIFIER_PERMANENT)?;
    b.bytes(name.as_bytes())?;
    if name.len() % 2 == 1 {
        b.u8(0)?; // blocks start on even offsets
    }
    let data_len = (b.position() - data_start) as u16;
    b.patch_u16_be(len_at, data_len)?;
    b.pad_to(MIN_ETH_FRAME_LEN)?;
    Ok(b.finish())
}

/// Build a unicast Set request assigning permanent IP parameters.
pub fn build_set_ip(
    buf: &mut [u8],
    dst: MacAddr,
    src: MacAddr,
    xid: u32,
    ip: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Ipv4Addr,
) -> CodecResult<usize> {
    let mut b = FrameBuilder::new(buf);
    build_eth_header(&mut b, dst, src)?;
    let len_at = dcp_header(&mut b, FRAME_ID_DCP_GET_SET, DCP_SERVICE_SET, xid, 0)?;
    let data_start = b.position();
    b.u8(DCP_OPTION_IP)?;
    b.u8(DCP_SUBOPTION_IP_PARAMETER)?;
    b.u16_be(2 + 12)?;
    b.u16_be(DCP_QUALIFIER_PERMANENT)?;
    b.u32_be(u32::from(ip))?;
    b.u32_be(u32::from(netmask))?;
    b.u32_be(u32::from(gateway))?;
    let data_len = (b.position() - data_start) as u16;
    b.patch_u16_be(len_at, data_len)?;
    b.pad_to(MIN_ETH_FRAME_LEN)?;
    Ok(b.finish())
}

/// Parse a full Ethernet frame as a DCP Identify response.
///
/// Returns `Ok(None)` when the frame is DCP but not an Identify response
/// (wrong frame ID or service); unknown TLV blocks are skipped.
pub fn parse_identify_response(frame: &[u8]) -> CodecResult<Option<DcpIdentifyResponse>> {
    let mut p = FrameParser::new(frame);
    let eth = parse_eth_header(&mut p)?;
    if eth.ethertype != ETHERTYPE_PROFINET {
        return Ok(None);
    }
    let frame_id = p.u16_be()?;
    if frame_id != FRAME_ID_DCP_IDENTIFY_RES {
        return Ok(None);
    }
    let service_id = p.u8()?;
    let service_type = p.u8()?;
    if service_id != DCP_SERVICE_IDENTIFY || service_type != DCP_SERVICE_TYPE_RESPONSE_SUCCESS {
        return Ok(None);
    }
    let xid = p.u32_be()?;
    p.skip(2)?; // reserved
    let data_length = p.u16_be()? as usize;
    if data_length > p.remaining() {
        return Err(crate::protocol::frame::CodecError::TooShort);
    }
    let end = p.position() + data_length;

    let mut out = DcpIdentifyResponse {
        source_mac: eth.src,
        xid,
        station: None,
        ip: None,
        netmask: None,
        gateway: None,
        vendor_id: None,
        device_id: None,
    };

    while p.position() + 4 <= end {
        let option = p.u8()?;
        let suboption = p.u8()?;
        let block_len = p.u16_be()? as usize;
        let block_end = p.position() + block_len;
        if block_end > end {
            return Err(crate::protocol::frame::CodecError::TooShort);
        }
        match (option, suboption) {
            (DCP_OPTION_DEVICE_PROPERTIES, DCP_SUBOPTION_STATION_NAME) if block_len >= 2 => {
                p.skip(2)?; // block_info
                let name = p.bytes(block_len - 2)?;
                out.station = Some(String::from_utf8_lossy(name).into_owned());
            }
            (DCP_OPTION_IP, DCP_SUBOPTION_IP_PARAMETER) if block_len >= 14 => {
                p.skip(2)?; // block_info
                out.ip = Some(Ipv4Addr::from(p.u32_be()?));
                out.netmask = Some(Ipv4Addr::from(p.u32_be()?));
                out.gateway = Some(Ipv4Addr::from(p.u32_be()?));
                p.seek(block_end)?;
            }
            (DCP_OPTION_DEVICE_PROPERTIES, DCP_SUBOPTION_DEVICE_ID) if block_len >= 6 => {
                p.skip(2)?; // block_info
                out.vendor_id = Some(p.u16_be()?);
                out.device_id = Some(p.u16_be()?);
                p.seek(block_end)?;
            }
            _ => {
                p.seek(block_end)?;
            }
        }
        // blocks are padded to even offsets
        if block_len % 2 == 1 && p.position() < end {
            p.skip(1)?;
        }
    }

    Ok(Some(out))
}
