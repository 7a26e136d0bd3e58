// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PNIO-CM error analysis.
//!
//! A response with `error_decode = 0x81` carries `(error_code1,
//! error_code2)` where code1 names the faulted block and code2 the field
//! (or a CMRPC condition). The static table below maps those pairs to a
//! recovery action for the reconnect loop. Unknown codes degrade to
//! wait-and-retry.

use crate::protocol::rpc::PnioStatus;

/// What the AR manager should do about a PNIO-CM error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Transient device-side condition; repeat with the same parameters.
    RetrySame,
    /// Back off, then retry.
    WaitAndRetry,
    /// Device state is stale; run DCP discovery again before reconnecting.
    Rediscover,
    /// Expected-submodule configuration rejected; connect with DAP only and
    /// read the real layout.
    TryDapOnly,
    /// IOCR phase field rejected.
    FixPhase,
    /// Send clock / reduction ratio rejected.
    FixTiming,
    /// A block length field disagrees with the device's parser.
    FixBlockLength,
    /// Station-name variant (lowercase, no-dash) may be required. Advisory;
    /// the reconnect loop treats it as wait-and-retry.
    TryNameVariation,
}

/// Faulted-block values carried in error_code1.
const BLOCK_AR: u8 = 0x01;
const BLOCK_IOCR: u8 = 0x02;
const BLOCK_EXPECTED_SUBMODULE: u8 = 0x03;
const BLOCK_ALARM_CR: u8 = 0x04;
/// CMRPC layer conditions.
const CMRPC: u8 = 0x3F;

/// Field indices within the faulted block (error_code2).
const AR_FIELD_UUID: u8 = 0x04;
const AR_FIELD_SESSION_KEY: u8 = 0x05;
const AR_FIELD_STATION_NAME: u8 = 0x11;
const IOCR_FIELD_DATA_LENGTH: u8 = 0x06;
const IOCR_FIELD_SEND_CLOCK: u8 = 0x08;
const IOCR_FIELD_REDUCTION_RATIO: u8 = 0x09;
const IOCR_FIELD_PHASE: u8 = 0x0A;
const CMRPC_OUT_OF_AR_RESOURCES: u8 = 0x02;
const CMRPC_AR_UUID_UNKNOWN: u8 = 0x05;
const CMRPC_STATE_CONFLICT: u8 = 0x06;

/// Map a PNIO-CM status to its recovery action.
///
/// Statuses that are not PNIO-CM decoded (including RPC faults mapped to a
/// synthetic status) also land on wait-and-retry.
#[must_use]
pub fn recovery_action(status: &PnioStatus) -> RecoveryAction {
    if !status.is_pniocm() {
        return RecoveryAction::WaitAndRetry;
    }
    match (status.error_code1, status.error_code2) {
        (BLOCK_AR, AR_FIELD_UUID | AR_FIELD_SESSION_KEY) => RecoveryAction::RetrySame,
        (BLOCK_AR, AR_FIELD_STATION_NAME) => RecoveryAction::TryNameVariation,
        (BLOCK_AR, _) => RecoveryAction::FixBlockLength,
        (BLOCK_IOCR, IOCR_FIELD_PHASE) => RecoveryAction::FixPhase,
        (BLOCK_IOCR, IOCR_FIELD_SEND_CLOCK | IOCR_FIELD_REDUCTION_RATIO) => {
            RecoveryAction::FixTiming
        }
        (BLOCK_IOCR, IOCR_FIELD_DATA_LENGTH) => RecoveryAction::FixBlockLength,
        (BLOCK_IOCR, _) => RecoveryAction::WaitAndRetry,
        (BLOCK_EXPECTED_SUBMODULE, _) => RecoveryAction::TryDapOnly,
        (BLOCK_ALARM_CR, _) => RecoveryAction::RetrySame,
        (CMRPC, CMRPC_OUT_OF_AR_RESOURCES) => RecoveryAction::WaitAndRetry,
        (CMRPC, CMRPC_AR_UUID_UNKNOWN) => RecoveryAction::Rediscover,
        (CMRPC, CMRPC_STATE_CONFLICT) => RecoveryAction::RetrySame,
        _ => RecoveryAction::WaitAndRetry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::ERROR_DECODE_PNIOCM;

    fn status(code1: u8, code2: u8) -> PnioStatus {
        PnioStatus {
            error_code: 0xDB,
            error_decode: ERROR_DECODE_PNIOCM,
            error_code1: code1,
            error_code2: code2,
        }
    }

    #[test]
    fn expected_submodule_rejection_degrades_to_dap_only() {
        assert_eq!(recovery_action(&status(0x03, 0x01)), RecoveryAction::TryDapOnly);
    }

    #[test]
    fn iocr_timing_fields_map_to_fix_timing() {
        assert_eq!(recovery_action(&status(0x02, 0x08)), RecoveryAction::FixTiming);
        assert_eq!(recovery_action(&status(0x02, 0x09)), RecoveryAction::FixTiming);
        assert_eq!(recovery_action(&status(0x02, 0x0A)), RecoveryAction::FixPhase);
    }

    #[test]
    fn unknown_codes_wait_and_retry() {
        assert_eq!(recovery_action(&status(0x77, 0x77)), RecoveryAction::WaitAndRetry);
        let non_cm = PnioStatus {
            error_code: 0xDB,
            error_decode: 0x40,
            error_code1: 1,
            error_code2: 1,
        };
        assert_eq!(recovery_action(&non_cm), RecoveryAction::WaitAndRetry);
    }

    #[test]
    fn stale_ar_uuid_triggers_rediscovery() {
        assert_eq!(recovery_action(&status(0x3F, 0x05)), RecoveryAction::Rediscover);
    }
}
