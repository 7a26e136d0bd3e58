// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PNIO-CM RPC codec: DCE-RPC CL over UDP port 34964.
//!
//! PDU layout:
//!
//! ```text
//! +--------------------------+
//! | RPC header (80 bytes)    |  integers little-endian per DREP
//! +--------------------------+
//! | NDR args header (20 B)   |  little-endian; absent under some strategies
//! +--------------------------+
//! | PNIO status (4 B)        |  responses only
//! | PNIO blocks              |  big-endian, 6-byte block headers
//! +--------------------------+
//! ```
//!
//! UUID fields in the header are field-swapped for a little-endian DREP;
//! the wire-format strategy table can disable the swap for device stacks
//! that send them as stored.

pub mod connect;
pub mod control;
pub mod error_codes;
pub mod record;
pub mod strategy;
#[cfg(test)]
mod tests;

use crate::protocol::constants::*;
use crate::protocol::frame::{CodecError, CodecResult, FrameBuilder, FrameParser};
use crate::protocol::uuid::Uuid;

// ============================================================================
// RPC header
// ============================================================================

/// Parsed 80-byte DCE-RPC CL header. UUIDs are returned in as-stored form
/// (the parser undoes the DREP field-swap).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcHeader {
    pub packet_type: u8,
    pub flags1: u8,
    pub object: Uuid,
    pub interface: Uuid,
    pub activity: Uuid,
    pub server_boot: u32,
    pub interface_version: u32,
    pub seq_num: u32,
    pub opnum: u16,
    pub fragment_len: u16,
}

/// Fields the caller controls when building a request or response header.
#[derive(Debug, Clone)]
pub struct RpcHeaderParams {
    pub packet_type: u8,
    pub object: Uuid,
    pub interface: Uuid,
    pub activity: Uuid,
    pub seq_num: u32,
    pub opnum: u16,
    /// Bytes following the 80-byte header (NDR + PNIO args).
    pub body_len: u16,
    /// Apply the DREP field-swap to UUIDs (strategy-controlled).
    pub swap_uuids: bool,
}

fn put_uuid(b: &mut FrameBuilder<'_>, uuid: Uuid, swap: bool) -> CodecResult<()> {
    let wire = if swap { uuid.swap_fields() } else { uuid };
    b.bytes(wire.as_bytes())
}

/// Serialize the 80-byte RPC header.
pub fn build_rpc_header(b: &mut FrameBuilder<'_>, p: &RpcHeaderParams) -> CodecResult<()> {
    b.u8(RPC_VERSION)?;
    b.u8(p.packet_type)?;
    b.u8(RPC_FLAG1_LAST_FRAGMENT | RPC_FLAG1_IDEMPOTENT)?;
    b.u8(0)?; // flags2
    b.u8(RPC_DREP_LITTLE_ENDIAN)?;
    b.u8(0)?; // drep[1]
    b.u8(0)?; // drep[2]
    b.u8(0)?; // serial high
    put_uuid(b, p.object, p.swap_uuids)?;
    put_uuid(b, p.interface, p.swap_uuids)?;
    put_uuid(b, p.activity, p.swap_uuids)?;
    b.u32_le(0)?; // server boot time (unknown)
    b.u32_le(1)?; // interface version
    b.u32_le(p.seq_num)?;
    b.u16_le(p.opnum)?;
    b.u16_le(0xFFFF)?; // interface hint
    b.u16_le(0xFFFF)?; // activity hint
    b.u16_le(p.body_len)?;
    b.u16_le(0)?; // fragment number
    b.u8(0)?; // auth proto: none
    b.u8(0)?; // serial low
    Ok(())
}

/// Parse the 80-byte RPC header, honoring the sender's DREP for integer
/// endianness and UUID field order.
pub fn parse_rpc_header(p: &mut FrameParser<'_>) -> CodecResult<RpcHeader> {
    let version = p.u8()?;
    if version != RPC_VERSION {
        return Err(CodecError::TooShort);
    }
    let packet_type = p.u8()?;
    let flags1 = p.u8()?;
    let _flags2 = p.u8()?;
    let drep0 = p.u8()?;
    p.skip(3)?; // drep[1..2] + serial high
    let little_endian = drep0 & 0xF0 == RPC_DREP_LITTLE_ENDIAN;

    let read_uuid = |p: &mut FrameParser<'_>| -> CodecResult<Uuid> {
        let raw = p.bytes(16)?;
        let mut b = [0u8; 16];
        b.copy_from_slice(raw);
        let u = Uuid(b);
        Ok(if little_endian { u.swap_fields() } else { u })
    };
    let object = read_uuid(p)?;
    let interface = read_uuid(p)?;
    let activity = read_uuid(p)?;

    let u32f = |p: &mut FrameParser<'_>| -> CodecResult<u32> {
        if little_endian {
            p.u32_le()
        } else {
            p.u32_be()
        }
    };
    let server_boot = u32f(p)?;
    let interface_version = u32f(p)?;
    let seq_num = u32f(p)?;

    let u16f = |p: &mut FrameParser<'_>| -> CodecResult<u16> {
        if little_endian {
            p.u16_le()
        } else {
            p.u16_be()
        }
    };
    let opnum = u16f(p)?;
    let _ihint = u16f(p)?;
    let _ahint = u16f(p)?;
    let fragment_len = u16f(p)?;
    let _frag_num = u16f(p)?;
    p.skip(2)?; // auth proto + serial low

    Ok(RpcHeader {
        packet_type,
        flags1,
        object,
        interface,
        activity,
        server_boot,
        interface_version,
        seq_num,
        opnum,
        fragment_len,
    })
}

/// RPC object UUID addressing one device instance:
/// `DEA00000-6C97-11D1-8271-<instance><device><vendor>`.
#[must_use]
pub fn device_object_uuid(instance: u16, device_id: u16, vendor_id: u16) -> Uuid {
    let mut b = [
        0xDE, 0xA0, 0x00, 0x00, 0x6C, 0x97, 0x11, 0xD1, 0x82, 0x71, 0, 0, 0, 0, 0, 0,
    ];
    b[10..12].copy_from_slice(&instance.to_be_bytes());
    b[12..14].copy_from_slice(&device_id.to_be_bytes());
    b[14..16].copy_from_slice(&vendor_id.to_be_bytes());
    Uuid(b)
}

// ============================================================================
// NDR args header
// ============================================================================

/// Write the 20-byte little-endian NDR args header for `args_len` bytes of
/// PNIO payload.
pub fn build_ndr_header(b: &mut FrameBuilder<'_>, args_len: u32, args_max: u32) -> CodecResult<()> {
    b.u32_le(args_max)?;
    b.u32_le(args_len)?;
    b.u32_le(args_max)?; // max count
    b.u32_le(0)?; // offset
    b.u32_le(args_len) // actual count
}

/// Parse the NDR args header; returns the declared args length.
pub fn parse_ndr_header(p: &mut FrameParser<'_>) -> CodecResult<u32> {
    let _args_max = p.u32_le()?;
    let args_len = p.u32_le()?;
    let _max_count = p.u32_le()?;
    let _offset = p.u32_le()?;
    let _actual_count = p.u32_le()?;
    Ok(args_len)
}

// ============================================================================
// PNIO status
// ============================================================================

/// Four-byte PNIO status leading every CM response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PnioStatus {
    pub error_code: u8,
    pub error_decode: u8,
    pub error_code1: u8,
    pub error_code2: u8,
}

impl PnioStatus {
    pub const OK: PnioStatus = PnioStatus {
        error_code: 0,
        error_decode: 0,
        error_code1: 0,
        error_code2: 0,
    };

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }

    #[must_use]
    pub fn is_pniocm(&self) -> bool {
        self.error_decode == ERROR_DECODE_PNIOCM
    }
}

pub fn build_pnio_status(b: &mut FrameBuilder<'_>, s: PnioStatus) -> CodecResult<()> {
    b.u8(s.error_code)?;
    b.u8(s.error_decode)?;
    b.u8(s.error_code1)?;
    b.u8(s.error_code2)
}

pub fn parse_pnio_status(p: &mut FrameParser<'_>) -> CodecResult<PnioStatus> {
    Ok(PnioStatus {
        error_code: p.u8()?,
        error_decode: p.u8()?,
        error_code1: p.u8()?,
        error_code2: p.u8()?,
    })
}

// ============================================================================
// Block framing
// ============================================================================

/// Begin a block whose length is back-filled by [`end_block`].
pub fn begin_block(b: &mut FrameBuilder<'_>, block_type: u16) -> CodecResult<usize> {
    b.u16_be(block_type)?;
    let len_at = b.position();
    b.u16_be(0)?;
    b.u8(BLOCK_VERSION_HIGH)?;
    b.u8(BLOCK_VERSION_LOW)?;
    Ok(len_at)
}

/// Patch the length of a block opened with [`begin_block`].
pub fn end_block(b: &mut FrameBuilder<'_>, len_at: usize) -> CodecResult<()> {
    // length counts from the version pair to the current cursor
    let block_len = (b.position() - len_at - 2) as u16;
    b.patch_u16_be(len_at, block_len)
}

/// A decoded block header: type plus payload length (version pair consumed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_type: u16,
    /// Bytes remaining in the block after the version pair.
    pub payload_len: usize,
}

pub fn parse_block_header(p: &mut FrameParser<'_>) -> CodecResult<BlockHeader> {
    let block_type = p.u16_be()?;
    let block_len = p.u16_be()? as usize;
    if block_len < 2 {
        return Err(CodecError::TooShort);
    }
    let _version_high = p.u8()?;
    let _version_low = p.u8()?;
    Ok(BlockHeader {
        block_type,
        payload_len: block_len - 2,
    })
}
