// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP implementation of [`RpcTransport`].
//!
//! One socket carries outgoing requests, their responses, and
//! device-initiated requests (ApplicationReady). A blocking `call` owns the
//! receive side for its duration; any device-initiated request it reads
//! while waiting is queued for `poll_inbound` instead of being dropped.

use crate::error::{Error, Result};
use crate::protocol::constants::*;
use crate::protocol::frame::{FrameBuilder, FrameParser};
use crate::protocol::rpc::{
    build_ndr_header, build_rpc_header, parse_ndr_header, parse_rpc_header, RpcHeaderParams,
};
use crate::protocol::uuid::Uuid;
use crate::transport::{InboundRequest, RpcTransport};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a blocking call waits for its response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Granularity of the receive loop (running-flag and deadline checks).
const RECV_SLICE: Duration = Duration::from_millis(200);

const MAX_PDU: usize = 4096;

/// Largest body a request may carry alongside the RPC and NDR headers.
pub const MAX_BODY: usize = MAX_PDU - RPC_HEADER_LEN - NDR_HEADER_LEN;

pub struct UdpRpcChannel {
    sock: Socket,
    interface_uuid: Uuid,
    seq: AtomicU32,
    rng: Arc<Mutex<fastrand::Rng>>,
    /// Serializes the receive side of the socket.
    io_lock: Mutex<()>,
    /// Device-initiated requests awaiting `poll_inbound`.
    inbound: Mutex<VecDeque<InboundRequest>>,
}

impl UdpRpcChannel {
    /// Bind the RPC socket. Failure is fatal to the controller.
    pub fn bind(port: u16, rng: Arc<Mutex<fastrand::Rng>>) -> Result<UdpRpcChannel> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_reuse_address(true)?;
        sock.set_read_timeout(Some(RECV_SLICE))?;
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        sock.bind(&SocketAddr::V4(bind_addr).into())?;
        log::info!("[rpc] socket bound 0.0.0.0:{}", port);
        Ok(UdpRpcChannel {
            sock,
            interface_uuid: PNIO_DEVICE_INTERFACE_UUID
                .parse()
                .expect("device interface UUID literal"),
            seq: AtomicU32::new(1),
            rng,
            io_lock: Mutex::new(()),
            inbound: Mutex::new(VecDeque::new()),
        })
    }

    fn next_activity(&self) -> Uuid {
        let mut rng = self.rng.lock();
        Uuid::new_v4(&mut rng)
    }

    fn recv_datagram(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        // SAFETY: recv_from writes at most buf.len() bytes; only the
        // initialized prefix is read afterwards.
        let uninit =
            unsafe { &mut *(std::ptr::from_mut::<[u8]>(buf) as *mut [MaybeUninit<u8>]) };
        match self.sock.recv_from(uninit) {
            Ok((n, addr)) => {
                let addr = addr
                    .as_socket()
                    .ok_or_else(|| Error::Protocol("non-inet RPC peer".into()))?;
                Ok(Some((n, addr)))
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Classify one datagram: queue device-initiated requests, return
    /// response/fault packets to the caller.
    fn sort_datagram(
        &self,
        data: &[u8],
        source: SocketAddr,
    ) -> Option<(u8, Uuid, u32, Vec<u8>)> {
        let mut p = FrameParser::new(data);
        let hdr = match parse_rpc_header(&mut p) {
            Ok(h) => h,
            Err(_) => {
                log::debug!("[rpc] dropping malformed datagram from {}", source);
                return None;
            }
        };
        let args = strip_ndr(&data[p.position()..]);
        match hdr.packet_type {
            RPC_PACKET_TYPE_REQUEST => {
                self.inbound.lock().push_back(InboundRequest {
                    activity: hdr.activity,
                    seq_num: hdr.seq_num,
                    opnum: hdr.opnum,
                    body: args.to_vec(),
                    source,
                });
                None
            }
            t @ (RPC_PACKET_TYPE_RESPONSE | RPC_PACKET_TYPE_FAULT) => {
                Some((t, hdr.activity, hdr.seq_num, args.to_vec()))
            }
            other => {
                log::debug!("[rpc] ignoring packet type {} from {}", other, source);
                None
            }
        }
    }
}

/// Drop a leading NDR args header when one is present. The 20-byte header is
/// recognized by its internally consistent args length; bodies without one
/// start directly with the PNIO status / block stream.
fn strip_ndr(args: &[u8]) -> &[u8] {
    if args.len() >= NDR_HEADER_LEN {
        let mut p = FrameParser::new(args);
        if let Ok(declared) = parse_ndr_header(&mut p) {
            if declared as usize == args.len() - NDR_HEADER_LEN {
                return &args[NDR_HEADER_LEN..];
            }
        }
    }
    args
}

impl RpcTransport for UdpRpcChannel {
    fn call(
        &self,
        ip: Ipv4Addr,
        port: u16,
        object: Uuid,
        opnum: u16,
        body: &[u8],
        swap_uuids: bool,
        include_ndr: bool,
    ) -> Result<Vec<u8>> {
        if body.len() > MAX_BODY {
            return Err(Error::NoMemory);
        }
        let activity = self.next_activity();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let ndr_len = if include_ndr { NDR_HEADER_LEN } else { 0 };

        let mut pdu = vec![0u8; RPC_HEADER_LEN + ndr_len + body.len()];
        {
            let mut b = FrameBuilder::new(&mut pdu);
            build_rpc_header(
                &mut b,
                &RpcHeaderParams {
                    packet_type: RPC_PACKET_TYPE_REQUEST,
                    object,
                    interface: self.interface_uuid,
                    activity,
                    seq_num: seq,
                    opnum,
                    body_len: (ndr_len + body.len()) as u16,
                    swap_uuids,
                },
            )
            .map_err(Error::from)?;
            if include_ndr {
                build_ndr_header(&mut b, body.len() as u32, MAX_PDU as u32)
                    .map_err(Error::from)?;
            }
            b.bytes(body).map_err(Error::from)?;
        }

        let dest = SocketAddr::V4(SocketAddrV4::new(ip, port));
        // Hold the receive side for the whole exchange so a concurrent
        // poll_inbound cannot steal the response.
        let _io = self.io_lock.lock();
        self.sock.send_to(&pdu, &dest.into())?;

        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        let mut buf = vec![0u8; MAX_PDU];
        loop {
            if Instant::now() >= deadline {
                log::debug!("[rpc] opnum {} to {} timed out", opnum, dest);
                return Err(Error::Timeout);
            }
            let Some((n, source)) = self.recv_datagram(&mut buf)? else {
                continue;
            };
            let Some((ptype, res_activity, res_seq, args)) =
                self.sort_datagram(&buf[..n], source)
            else {
                continue;
            };
            if res_activity != activity || res_seq != seq {
                log::debug!("[rpc] stale response from {} (seq {})", source, res_seq);
                continue;
            }
            if ptype == RPC_PACKET_TYPE_FAULT {
                return Err(Error::ConnectionFailed(format!(
                    "RPC fault from {} (opnum {})",
                    source, opnum
                )));
            }
            return Ok(args);
        }
    }

    fn poll_inbound(&self) -> Option<InboundRequest> {
        if let Some(req) = self.inbound.lock().pop_front() {
            return Some(req);
        }
        // Only drain the socket when no blocking call owns it.
        let Some(_io) = self.io_lock.try_lock() else {
            return None;
        };
        let mut buf = vec![0u8; MAX_PDU];
        loop {
            let uninit = unsafe {
                &mut *(std::ptr::from_mut::<[u8]>(buf.as_mut_slice()) as *mut [MaybeUninit<u8>])
            };
            match self
                .sock
                .recv_from_with_flags(uninit, libc::MSG_DONTWAIT)
            {
                Ok((n, addr)) => {
                    if let Some(addr) = addr.as_socket() {
                        // Responses with no waiting call are stale; drop them.
                        let _ = self.sort_datagram(&buf[..n], addr);
                    }
                }
                Err(_) => break,
            }
        }
        self.inbound.lock().pop_front()
    }

    fn respond(&self, request: &InboundRequest, body: &[u8]) -> Result<()> {
        let mut pdu = vec![0u8; RPC_HEADER_LEN + NDR_HEADER_LEN + body.len()];
        {
            let mut b = FrameBuilder::new(&mut pdu);
            build_rpc_header(
                &mut b,
                &RpcHeaderParams {
                    packet_type: RPC_PACKET_TYPE_RESPONSE,
                    object: Uuid::NIL,
                    interface: PNIO_CONTROLLER_INTERFACE_UUID
                        .parse()
                        .expect("controller interface UUID literal"),
                    activity: request.activity,
                    seq_num: request.seq_num,
                    opnum: request.opnum,
                    body_len: (NDR_HEADER_LEN + body.len()) as u16,
                    swap_uuids: true,
                },
            )
            .map_err(Error::from)?;
            build_ndr_header(&mut b, body.len() as u32, MAX_PDU as u32).map_err(Error::from)?;
            b.bytes(body).map_err(Error::from)?;
        }
        self.sock.send_to(&pdu, &request.source.into())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ndr_detects_header_by_consistency() {
        // 20-byte NDR header declaring 4 args bytes, followed by a status.
        let mut with_ndr = vec![0u8; 24];
        {
            let mut b = FrameBuilder::new(&mut with_ndr);
            build_ndr_header(&mut b, 4, 4096).unwrap();
            b.bytes(&[0, 0, 0, 0]).unwrap();
        }
        assert_eq!(strip_ndr(&with_ndr), &[0, 0, 0, 0]);

        // A bare status body survives unharmed.
        let bare = [0xDBu8, 0x81, 0x01, 0x02];
        assert_eq!(strip_ndr(&bare), &bare);
    }
}
