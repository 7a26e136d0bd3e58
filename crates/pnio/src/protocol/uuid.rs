// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! 16-byte UUID with the DCE-RPC field-swap.
//!
//! UUIDs are stored in their textual byte order. DCE-RPC with a little-endian
//! DREP sends the first three fields (time_low, time_mid, time_hi) byte
//! swapped; [`Uuid::swap_fields`] converts between the two forms and is its
//! own inverse.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Uuid(pub [u8; 16]);

impl Uuid {
    pub const NIL: Uuid = Uuid([0u8; 16]);

    /// Random version-4 UUID drawn from the controller PRNG.
    #[must_use]
    pub fn new_v4(rng: &mut fastrand::Rng) -> Uuid {
        let mut b = [0u8; 16];
        rng.fill(&mut b);
        b[6] = (b[6] & 0x0F) | 0x40; // version 4
        b[8] = (b[8] & 0x3F) | 0x80; // RFC 4122 variant
        Uuid(b)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Reverse the byte order of time_low (4), time_mid (2) and time_hi (2).
    /// Converts as-stored form to the little-endian DCE wire form and back.
    #[must_use]
    pub fn swap_fields(&self) -> Uuid {
        let b = &self.0;
        Uuid([
            b[3], b[2], b[1], b[0],
            b[5], b[4],
            b[7], b[6],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
        ])
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13],
            b[14], b[15]
        )
    }
}

impl FromStr for Uuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let hex: String = s.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 {
            return Err(Error::InvalidParam(format!("bad UUID literal: {}", s)));
        }
        let mut out = [0u8; 16];
        for (i, chunk) in out.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidParam(format!("bad UUID literal: {}", s)))?;
        }
        Ok(Uuid(out))
    }
}
