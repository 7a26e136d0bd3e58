// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DCP device cache.
//!
//! Identify responses land here before anything touches the registry: the
//! cache is the bounded, lossy view of "who answered on the segment
//! recently". Keyed by station name, refreshed on every response, capped so
//! a noisy segment cannot grow it without bound.

use crate::protocol::dcp::DcpIdentifyResponse;
use crate::types::MacAddr;
use lru::LruCache;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::num::NonZeroUsize;

/// Cache capacity: enough for a large segment, bounded regardless.
const DCP_CACHE_CAPACITY: usize = 256;

/// One discovered device as seen by DCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcpEntry {
    pub station: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub vendor_id: u16,
    pub device_id: u16,
    /// Device reported a configured IP (option 1/2 present and non-zero).
    pub ip_set: bool,
    /// Device reported a station name.
    pub name_set: bool,
    pub last_seen_ms: u64,
}

/// Bounded station-name -> device cache.
pub struct DcpCache {
    inner: Mutex<LruCache<String, DcpEntry>>,
}

impl Default for DcpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DcpCache {
    #[must_use]
    pub fn new() -> DcpCache {
        let cap = NonZeroUsize::new(DCP_CACHE_CAPACITY).expect("capacity is non-zero");
        DcpCache {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Ingest one Identify response; returns the refreshed entry.
    ///
    /// Responses without a station name cannot be keyed and are dropped;
    /// commissioning assigns a name (DCP Set) before a device is used.
    pub fn ingest(&self, res: &DcpIdentifyResponse, now_ms: u64) -> Option<DcpEntry> {
        let station = res.station.clone()?;
        let entry = DcpEntry {
            station: station.clone(),
            mac: res.source_mac,
            ip: res.ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
            netmask: res.netmask.unwrap_or(Ipv4Addr::UNSPECIFIED),
            gateway: res.gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
            vendor_id: res.vendor_id.unwrap_or(0),
            device_id: res.device_id.unwrap_or(0),
            ip_set: res.ip.is_some_and(|ip| !ip.is_unspecified()),
            name_set: true,
            last_seen_ms: now_ms,
        };
        self.inner.lock().put(station, entry.clone());
        Some(entry)
    }

    #[must_use]
    pub fn get(&self, station: &str) -> Option<DcpEntry> {
        self.inner.lock().peek(station).cloned()
    }

    /// Snapshot of all cached entries, most recently seen first.
    #[must_use]
    pub fn entries(&self) -> Vec<DcpEntry> {
        self.inner.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
