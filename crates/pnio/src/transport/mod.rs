// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sockets and the receive thread.
//!
//! Three pieces: the AF_PACKET raw socket carrying all layer-2 PROFINET
//! traffic, the UDP channel carrying PNIO-CM RPC, and the listener thread
//! that demultiplexes inbound frames by frame ID.

pub mod listener;
pub mod raw;
pub mod rpc;

use crate::error::Result;
use crate::protocol::uuid::Uuid;
use std::net::{Ipv4Addr, SocketAddr};

/// A device-initiated RPC request observed on the RPC socket (typically the
/// ApplicationReady control request).
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Activity UUID to echo in the response.
    pub activity: Uuid,
    /// Sequence number to echo in the response.
    pub seq_num: u32,
    pub opnum: u16,
    /// PNIO block stream (RPC and NDR headers stripped).
    pub body: Vec<u8>,
    pub source: SocketAddr,
}

/// Blocking request/response RPC plus non-blocking inbound polling.
///
/// The AR manager talks to devices exclusively through this seam; tests
/// substitute a scripted mock for the UDP implementation.
pub trait RpcTransport: Send + Sync {
    /// Send one request and wait for the matching response body (PNIO
    /// status + blocks, RPC/NDR framing stripped). Blocks the calling
    /// thread for at most the channel's response timeout.
    ///
    /// `swap_uuids` and `include_ndr` apply the wire-format strategy knobs.
    fn call(
        &self,
        ip: Ipv4Addr,
        port: u16,
        object: Uuid,
        opnum: u16,
        body: &[u8],
        swap_uuids: bool,
        include_ndr: bool,
    ) -> Result<Vec<u8>>;

    /// Non-blocking poll for a device-initiated request. Returns `None`
    /// when nothing is pending (including while a blocking call on another
    /// thread owns the socket; stray requests it reads are queued here).
    fn poll_inbound(&self) -> Option<InboundRequest>;

    /// Answer a device-initiated request, echoing its activity UUID and
    /// sequence number.
    fn respond(&self, request: &InboundRequest, body: &[u8]) -> Result<()>;
}
