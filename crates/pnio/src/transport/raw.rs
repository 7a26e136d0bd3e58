// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! AF_PACKET raw socket bound to one interface.
//!
//! All layer-2 PROFINET traffic (DCP and cyclic RT) moves through one
//! socket. Sends may come from any thread (the kernel serializes them);
//! receives happen only on the listener thread, bounded by a 100 ms read
//! timeout so the running flag is observed promptly.

use crate::error::{Error, Result};
use crate::protocol::constants::ETHERTYPE_PROFINET;
use crate::types::MacAddr;
use socket2::{Domain, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Bound on the listener's blocking read.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Largest frame the listener accepts.
pub const MAX_FRAME_LEN: usize = 1522;

pub struct RawSocket {
    sock: Socket,
    ifindex: i32,
    mac: MacAddr,
}

impl RawSocket {
    /// Open and bind the raw socket. Failure here is fatal to the
    /// controller (CAP_NET_RAW is required).
    pub fn open(interface: &str) -> Result<RawSocket> {
        let ifindex = ifindex(interface)?;
        let mac = interface_mac(interface)?;

        let proto = i32::from(ETHERTYPE_PROFINET.to_be());
        let sock = Socket::new(Domain::PACKET, Type::RAW, Some(proto.into()))?;
        sock.set_read_timeout(Some(RECV_TIMEOUT))?;

        // socket2 has no sockaddr_ll constructor; bind through libc.
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = ETHERTYPE_PROFINET.to_be();
        addr.sll_ifindex = ifindex;
        let rc = unsafe {
            libc::bind(
                sock.as_raw_fd(),
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        log::info!(
            "[transport] raw socket bound iface={} ifindex={} mac={}",
            interface,
            ifindex,
            mac
        );
        Ok(RawSocket { sock, ifindex, mac })
    }

    #[must_use]
    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    /// Send one complete Ethernet frame.
    pub fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = ETHERTYPE_PROFINET.to_be();
        addr.sll_ifindex = self.ifindex;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&frame[..6.min(frame.len())]);
        let rc = unsafe {
            libc::sendto(
                self.sock.as_raw_fd(),
                frame.as_ptr().cast(),
                frame.len(),
                0,
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Receive one frame into `buf`. `Ok(None)` on timeout.
    pub fn recv_frame(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        // SAFETY: recv writes at most buf.len() bytes; we only read the
        // initialized prefix reported by the return value.
        let uninit =
            unsafe { &mut *(std::ptr::from_mut::<[u8]>(buf) as *mut [MaybeUninit<u8>]) };
        match self.sock.recv(uninit) {
            Ok(n) => Ok(Some(n)),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Resolve an interface name to its index.
fn ifindex(interface: &str) -> Result<i32> {
    let name = std::ffi::CString::new(interface)
        .map_err(|_| Error::InvalidParam(format!("interface name {:?}", interface)))?;
    let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if idx == 0 {
        return Err(Error::InvalidParam(format!("no such interface: {}", interface)));
    }
    Ok(idx as i32)
}

/// Read the interface's hardware address via SIOCGIFHWADDR.
pub fn interface_mac(interface: &str) -> Result<MacAddr> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(interface.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    let rc = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut req) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if rc != 0 {
        return Err(Error::Io(err));
    }
    let hw = unsafe { req.ifr_ifru.ifru_hwaddr };
    let mut mac = [0u8; 6];
    for (dst, src) in mac.iter_mut().zip(hw.sa_data.iter()) {
        *dst = *src as u8;
    }
    Ok(MacAddr(mac))
}

/// Resolve the interface's IPv4 address. The controller requires one at
/// startup; there is no fallback heuristic.
pub fn interface_ipv4(interface: &str) -> Result<Ipv4Addr> {
    let ifas = local_ip_address::list_afinet_netifas()
        .map_err(|e| Error::InvalidParam(format!("interface enumeration failed: {e}")))?;
    for (name, ip) in ifas {
        if name == interface {
            if let std::net::IpAddr::V4(v4) = ip {
                return Ok(v4);
            }
        }
    }
    Err(Error::InvalidParam(format!(
        "interface {} has no IPv4 address",
        interface
    )))
}
