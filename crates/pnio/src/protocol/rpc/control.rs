// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! IOD/IOX control blocks (opnum 4): PrmEnd, ApplicationReady, Release.
//!
//! Outbound control requests use block 0x0110. Devices initiate their own
//! control request (ApplicationReady) after parameterization; field stacks
//! send either 0x0110 or the IOX variant 0x0112, and the response must use
//! the matching response type.

use crate::protocol::constants::*;
use crate::protocol::frame::{CodecError, CodecResult, FrameBuilder, FrameParser};
use crate::protocol::rpc::{
    begin_block, end_block, parse_block_header, parse_pnio_status, PnioStatus,
};
use crate::protocol::uuid::Uuid;

/// A control request or response body, both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    pub block_type: u16,
    pub ar_uuid: Uuid,
    pub session_key: u16,
    pub command: u16,
}

fn build_control_block(buf: &mut [u8], blk: &ControlBlock) -> CodecResult<usize> {
    let mut b = FrameBuilder::new(buf);
    let len_at = begin_block(&mut b, blk.block_type)?;
    b.u16_be(0)?; // reserved
    b.bytes(blk.ar_uuid.as_bytes())?;
    b.u16_be(blk.session_key)?;
    b.u16_be(0)?; // reserved
    b.u16_be(blk.command)?;
    b.u16_be(0)?; // control block properties
    end_block(&mut b, len_at)?;
    Ok(b.finish())
}

fn parse_control_block(p: &mut FrameParser<'_>) -> CodecResult<ControlBlock> {
    let hdr = parse_block_header(p)?;
    let block_end = p.position() + hdr.payload_len;
    p.skip(2)?; // reserved
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(p.bytes(16)?);
    let session_key = p.u16_be()?;
    p.skip(2)?; // reserved
    let command = p.u16_be()?;
    p.seek(block_end)?;
    Ok(ControlBlock {
        block_type: hdr.block_type,
        ar_uuid: Uuid(uuid),
        session_key,
        command,
    })
}

/// Build a controller-initiated control request body (PrmEnd / Release).
pub fn build_control_request(
    buf: &mut [u8],
    ar_uuid: Uuid,
    session_key: u16,
    command: u16,
) -> CodecResult<usize> {
    build_control_block(
        buf,
        &ControlBlock {
            block_type: BLOCK_IOD_CONTROL_REQ,
            ar_uuid,
            session_key,
            command,
        },
    )
}

/// Parse a control response body; verifies the echoed command.
pub fn parse_control_response(buf: &[u8], expect_command: u16) -> CodecResult<PnioStatus> {
    let mut p = FrameParser::new(buf);
    let status = parse_pnio_status(&mut p)?;
    if !status.is_ok() {
        return Ok(status);
    }
    let blk = parse_control_block(&mut p)?;
    if blk.block_type != BLOCK_IOD_CONTROL_RES && blk.block_type != BLOCK_IOX_CONTROL_RES {
        return Err(CodecError::TooShort);
    }
    if blk.command != expect_command {
        return Err(CodecError::TooShort);
    }
    Ok(status)
}

/// Parse a device-initiated control request body (inbound ApplicationReady).
pub fn parse_inbound_control_request(buf: &[u8]) -> CodecResult<ControlBlock> {
    let mut p = FrameParser::new(buf);
    let blk = parse_control_block(&mut p)?;
    if blk.block_type != BLOCK_IOD_CONTROL_REQ && blk.block_type != BLOCK_IOX_CONTROL_REQ {
        return Err(CodecError::TooShort);
    }
    Ok(blk)
}

/// Build the response body for a device-initiated control request. The
/// response block type mirrors the request variant and the command is echoed.
pub fn build_inbound_control_response(buf: &mut [u8], request: &ControlBlock) -> CodecResult<usize> {
    let response_type = if request.block_type == BLOCK_IOX_CONTROL_REQ {
        BLOCK_IOX_CONTROL_RES
    } else {
        BLOCK_IOD_CONTROL_RES
    };
    let mut b = FrameBuilder::new(buf);
    crate::protocol::rpc::build_pnio_status(&mut b, PnioStatus::OK)?;
    let used = {
        let pos = b.finish();
        pos + build_control_block(
            &mut buf[pos..],
            &ControlBlock {
                block_type: response_type,
                ar_uuid: request.ar_uuid,
                session_key: request.session_key,
                command: request.command,
            },
        )?
    };
    Ok(used)
}
