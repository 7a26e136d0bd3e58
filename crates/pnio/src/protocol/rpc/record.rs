// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Record Read (opnum 2) and Record Write (opnum 3).
//!
//! Read at index 0xF844 returns RealIdentificationData, the device's actual
//! module layout, and the authoritative source for the Expected Submodule
//! Block of a subsequent re-Connect. Write carries vendor records such as
//! the credential-sync blob at 0xF840.

use crate::protocol::constants::*;
use crate::protocol::frame::{CodecResult, FrameBuilder, FrameParser};
use crate::protocol::rpc::{
    begin_block, end_block, parse_block_header, parse_pnio_status, PnioStatus,
};
use crate::protocol::uuid::Uuid;
use crate::types::ModuleEntry;

/// Addressing of one record operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordAddr {
    pub api: u32,
    pub slot: u16,
    pub subslot: u16,
    pub index: u16,
}

impl RecordAddr {
    /// Whole-device RealIdentificationData query.
    #[must_use]
    pub fn real_identification() -> RecordAddr {
        RecordAddr {
            api: 0,
            slot: RECORD_SLOT_ALL,
            subslot: RECORD_SUBSLOT_ALL,
            index: RECORD_INDEX_REAL_IDENTIFICATION,
        }
    }
}

fn build_record_header(
    b: &mut FrameBuilder<'_>,
    block_type: u16,
    seq_number: u16,
    ar_uuid: Uuid,
    addr: RecordAddr,
    record_data_length: u32,
) -> CodecResult<()> {
    let len_at = begin_block(b, block_type)?;
    b.u16_be(seq_number)?;
    b.bytes(ar_uuid.as_bytes())?;
    b.u32_be(addr.api)?;
    b.u16_be(addr.slot)?;
    b.u16_be(addr.subslot)?;
    b.u16_be(0)?; // padding
    b.u16_be(addr.index)?;
    b.u32_be(record_data_length)?;
    b.zeros(8)?; // padding
    end_block(b, len_at)
}

/// Build a Record Read request body. `max_len` bounds the response data.
pub fn build_read_request(
    buf: &mut [u8],
    seq_number: u16,
    ar_uuid: Uuid,
    addr: RecordAddr,
    max_len: u32,
) -> CodecResult<usize> {
    let mut b = FrameBuilder::new(buf);
    build_record_header(&mut b, BLOCK_IOD_READ_REQ, seq_number, ar_uuid, addr, max_len)?;
    Ok(b.finish())
}

/// Build a Record Write request body carrying `data`.
pub fn build_write_request(
    buf: &mut [u8],
    seq_number: u16,
    ar_uuid: Uuid,
    addr: RecordAddr,
    data: &[u8],
) -> CodecResult<usize> {
    let mut b = FrameBuilder::new(buf);
    build_record_header(
        &mut b,
        BLOCK_IOD_WRITE_REQ,
        seq_number,
        ar_uuid,
        addr,
        data.len() as u32,
    )?;
    b.bytes(data)?;
    Ok(b.finish())
}

/// Parsed Record Read response: status plus the raw record data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub status: PnioStatus,
    pub data: Vec<u8>,
}

/// Parse a Record Read response body. The record data follows the response
/// header block and runs for the header's declared record_data_length.
pub fn parse_read_response(buf: &[u8]) -> CodecResult<ReadResponse> {
    let mut p = FrameParser::new(buf);
    let status = parse_pnio_status(&mut p)?;
    if !status.is_ok() {
        return Ok(ReadResponse {
            status,
            data: Vec::new(),
        });
    }
    let hdr = parse_block_header(&mut p)?;
    let block_end = p.position() + hdr.payload_len;
    p.skip(2)?; // seq number
    p.skip(16)?; // AR UUID
    p.skip(4)?; // api
    p.skip(2)?; // slot
    p.skip(2)?; // subslot
    p.skip(2)?; // padding
    p.skip(2)?; // index
    let record_len = p.u32_be()? as usize;
    p.seek(block_end)?;
    let data = p.bytes(record_len.min(p.remaining()))?.to_vec();
    Ok(ReadResponse { status, data })
}

/// Parse a Record Write response body down to its status.
pub fn parse_write_response(buf: &[u8]) -> CodecResult<PnioStatus> {
    let mut p = FrameParser::new(buf);
    parse_pnio_status(&mut p)
}

/// Parse a RealIdentificationData payload (block 0x0240) into module-layout
/// tuples.
pub fn parse_real_identification(data: &[u8]) -> CodecResult<Vec<ModuleEntry>> {
    let mut p = FrameParser::new(data);
    let hdr = parse_block_header(&mut p)?;
    if hdr.block_type != BLOCK_REAL_IDENTIFICATION {
        return Err(crate::protocol::frame::CodecError::TooShort);
    }
    let mut out = Vec::new();
    let n_apis = p.u16_be()?;
    for _ in 0..n_apis {
        let _api = p.u32_be()?;
        let n_modules = p.u16_be()?;
        for _ in 0..n_modules {
            let slot = p.u16_be()?;
            let module_ident = p.u32_be()?;
            let n_subs = p.u16_be()?;
            for _ in 0..n_subs {
                let subslot = p.u16_be()?;
                let submodule_ident = p.u32_be()?;
                out.push(ModuleEntry {
                    slot,
                    subslot,
                    module_ident,
                    submodule_ident,
                });
            }
        }
    }
    Ok(out)
}

/// Serialize a RealIdentificationData payload. The inverse of
/// [`parse_real_identification`] for one flat API; mock devices and the
/// codec tests use it.
pub fn build_real_identification(buf: &mut [u8], entries: &[ModuleEntry]) -> CodecResult<usize> {
    let mut b = FrameBuilder::new(buf);
    let len_at = begin_block(&mut b, BLOCK_REAL_IDENTIFICATION)?;
    b.u16_be(1)?; // one API
    b.u32_be(0)?;
    // group consecutive entries by slot
    let mut slots: Vec<(u16, u32, Vec<&ModuleEntry>)> = Vec::new();
    for e in entries {
        match slots.last_mut() {
            Some((slot, _, subs)) if *slot == e.slot => subs.push(e),
            _ => slots.push((e.slot, e.module_ident, vec![e])),
        }
    }
    b.u16_be(slots.len() as u16)?;
    for (slot, module_ident, subs) in &slots {
        b.u16_be(*slot)?;
        b.u32_be(*module_ident)?;
        b.u16_be(subs.len() as u16)?;
        for e in subs {
            b.u16_be(e.subslot)?;
            b.u32_be(e.submodule_ident)?;
        }
    }
    end_block(&mut b, len_at)?;
    Ok(b.finish())
}
