// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! GSDML cache lookup and HTTP fallback.
//!
//! Two read-only module-list sources the AR manager consults when the caller
//! supplies no slot configuration:
//!
//! 1. a cached GSDML file at `${cache_dir}/{station}.xml`, parsed only for
//!    `ModuleIdentNumber` / `SubmoduleIdentNumber` attribute pairs;
//! 2. `GET http://{ip}:{port}/api/v1/slots`, a small JSON schema served by
//!    the RTU firmware.
//!
//! Both return the same `(slot, subslot, module_ident, submodule_ident)`
//! tuples the Connect builder consumes, with the DAP triplet prepended.

use crate::protocol::constants::*;
use crate::types::{ModuleEntry, SlotInfo, SlotRole};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Both helpers give up after this long.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// The mandatory slot-0 triplet every module list starts with.
#[must_use]
pub fn dap_entries() -> Vec<ModuleEntry> {
    vec![
        ModuleEntry {
            slot: DAP_SLOT,
            subslot: DAP_SUBSLOT_DEVICE,
            module_ident: DAP_MODULE_IDENT,
            submodule_ident: DAP_SUBMODULE_DEVICE_IDENT,
        },
        ModuleEntry {
            slot: DAP_SLOT,
            subslot: DAP_SUBSLOT_INTERFACE,
            module_ident: DAP_MODULE_IDENT,
            submodule_ident: DAP_SUBMODULE_INTERFACE_IDENT,
        },
        ModuleEntry {
            slot: DAP_SLOT,
            subslot: DAP_SUBSLOT_PORT,
            module_ident: DAP_MODULE_IDENT,
            submodule_ident: DAP_SUBMODULE_PORT_IDENT,
        },
    ]
}

fn cache_path(dir: &Path, station: &str) -> PathBuf {
    dir.join(format!("{station}.xml"))
}

fn parse_ident_attr(value: &str) -> Option<u32> {
    let trimmed = value.trim();
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        trimmed.parse().ok()
    }
}

/// Load a device's module list from the GSDML cache.
///
/// Returns `None` when no usable cache file exists; individual unparseable
/// module entries are skipped with a warning rather than failing the load.
#[must_use]
pub fn load_modules(dir: &Path, station: &str, max_file_bytes: u64) -> Option<Vec<ModuleEntry>> {
    let path = cache_path(dir, station);
    let meta = std::fs::metadata(&path).ok()?;
    if meta.len() > max_file_bytes {
        log::warn!(
            "[gsdml] cache file {} is {} bytes (cap {}), ignoring",
            path.display(),
            meta.len(),
            max_file_bytes
        );
        return None;
    }
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            log::debug!("[gsdml] cache read {} failed: {}", path.display(), e);
            return None;
        }
    };
    let doc = match roxmltree::Document::parse(&content) {
        Ok(d) => d,
        Err(e) => {
            log::warn!("[gsdml] cache file {} is not valid XML: {}", path.display(), e);
            return None;
        }
    };

    let mut out = dap_entries();
    let mut slot = 1u16;
    for module in doc
        .descendants()
        .filter(|n| n.has_attribute("ModuleIdentNumber"))
    {
        let Some(module_ident) = module
            .attribute("ModuleIdentNumber")
            .and_then(parse_ident_attr)
        else {
            log::warn!("[gsdml] {}: skipping module with bad ModuleIdentNumber", station);
            continue;
        };
        let mut subslot = 1u16;
        let mut emitted = false;
        for submodule in module
            .descendants()
            .filter(|n| n.has_attribute("SubmoduleIdentNumber"))
        {
            let Some(submodule_ident) = submodule
                .attribute("SubmoduleIdentNumber")
                .and_then(parse_ident_attr)
            else {
                log::warn!(
                    "[gsdml] {}: skipping submodule with bad SubmoduleIdentNumber",
                    station
                );
                continue;
            };
            out.push(ModuleEntry {
                slot,
                subslot,
                module_ident,
                submodule_ident,
            });
            subslot += 1;
            emitted = true;
        }
        if emitted {
            slot += 1;
        }
    }

    if out.len() == dap_entries().len() {
        log::debug!("[gsdml] cache file {} held no module entries", path.display());
        return None;
    }
    log::info!(
        "[gsdml] loaded {} module entries for {} from cache",
        out.len(),
        station
    );
    Some(out)
}

// ============================================================================
// HTTP fallback
// ============================================================================

#[derive(Debug, Deserialize)]
struct SlotsDocument {
    slot_count: u16,
    slots: Vec<SlotJson>,
}

#[derive(Debug, Deserialize)]
struct SlotJson {
    slot: u16,
    subslot: u16,
    module_ident: u32,
    submodule_ident: u32,
    direction: String,
    data_size: u16,
}

/// Fetch the slot list from the RTU's HTTP service.
///
/// Returns the module entries plus the slot table they imply (`direction`
/// and `data_size` only exist in this source).
#[must_use]
pub fn fetch_slots_http(ip: Ipv4Addr, port: u16) -> Option<(Vec<ModuleEntry>, Vec<SlotInfo>)> {
    let url = format!("http://{ip}:{port}/api/v1/slots");
    let client = reqwest::blocking::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .ok()?;
    let doc: SlotsDocument = match client.get(&url).send().and_then(reqwest::blocking::Response::error_for_status) {
        Ok(res) => match res.json() {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!("[gsdml] {} returned unparseable slot JSON: {}", url, e);
                return None;
            }
        },
        Err(e) => {
            log::debug!("[gsdml] slot fetch {} failed: {}", url, e);
            return None;
        }
    };
    if doc.slots.len() != usize::from(doc.slot_count) {
        log::warn!(
            "[gsdml] {}: slot_count {} disagrees with {} entries",
            url,
            doc.slot_count,
            doc.slots.len()
        );
    }

    let mut modules = dap_entries();
    let mut slots = Vec::with_capacity(doc.slots.len());
    for s in &doc.slots {
        let role = match s.direction.as_str() {
            "input" => SlotRole::Sensor,
            "output" => SlotRole::Actuator,
            other => {
                log::warn!("[gsdml] {}: skipping slot {} with direction {:?}", url, s.slot, other);
                continue;
            }
        };
        modules.push(ModuleEntry {
            slot: s.slot,
            subslot: s.subslot,
            module_ident: s.module_ident,
            submodule_ident: s.submodule_ident,
        });
        slots.push(SlotInfo {
            slot: s.slot,
            subslot: s.subslot,
            role,
            tag: crate::types::PointTag::Generic,
            module_ident: s.module_ident,
            submodule_ident: s.submodule_ident,
            data_length: s.data_size,
        });
    }
    log::info!("[gsdml] fetched {} slots from {}", slots.len(), url);
    Some((modules, slots))
}

/// Best-effort: fetch the device's GSDML document and drop it into the
/// cache so the next connect skips the DAP-only round trip.
pub fn fetch_gsdml_http(ip: Ipv4Addr, port: u16, dir: &Path, station: &str, max_file_bytes: u64) {
    let url = format!("http://{ip}:{port}/api/v1/gsdml");
    let client = match reqwest::blocking::Client::builder().timeout(FETCH_TIMEOUT).build() {
        Ok(c) => c,
        Err(_) => return,
    };
    let body = match client
        .get(&url)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .and_then(reqwest::blocking::Response::bytes)
    {
        Ok(b) => b,
        Err(e) => {
            log::debug!("[gsdml] GSDML fetch {} failed: {}", url, e);
            return;
        }
    };
    if body.len() as u64 > max_file_bytes {
        log::warn!("[gsdml] GSDML from {} is {} bytes (cap {}), not caching", url, body.len(), max_file_bytes);
        return;
    }
    if let Err(e) = std::fs::create_dir_all(dir) {
        log::debug!("[gsdml] cannot create cache dir {}: {}", dir.display(), e);
        return;
    }
    // Write-then-rename keeps a concurrent loader off a half-written file.
    let final_path = cache_path(dir, station);
    let tmp_path = dir.join(format!(".{station}.xml.tmp"));
    if std::fs::write(&tmp_path, &body).is_ok() {
        match std::fs::rename(&tmp_path, &final_path) {
            Ok(()) => log::info!("[gsdml] cached GSDML for {} ({} bytes)", station, body.len()),
            Err(e) => log::debug!("[gsdml] cache rename failed: {}", e),
        }
    }
}
