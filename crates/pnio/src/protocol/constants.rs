// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PROFINET wire constants: single source of truth.
//!
//! Layer-2 framing, DCP, PNIO-CM RPC and cyclic RT constants all live here.
//! **Never hardcode these elsewhere.**

use crate::types::MacAddr;

// =======================================================================
// Layer 2
// =======================================================================

/// EtherType for all PROFINET layer-2 traffic (RT and DCP).
pub const ETHERTYPE_PROFINET: u16 = 0x8892;

/// Ethernet header length (untagged).
pub const ETH_HEADER_LEN: usize = 14;

/// Minimum Ethernet payload; cyclic frames are zero-padded up to this.
pub const MIN_ETH_FRAME_LEN: usize = 60;

/// DCP Identify multicast destination.
pub const DCP_MULTICAST_MAC: MacAddr = MacAddr([0x01, 0x0E, 0xCF, 0x00, 0x00, 0x00]);

// =======================================================================
// Frame IDs
// =======================================================================

/// DCP Identify request (multicast).
pub const FRAME_ID_DCP_IDENTIFY_REQ: u16 = 0xFEFE;
/// DCP Identify response (unicast).
pub const FRAME_ID_DCP_IDENTIFY_RES: u16 = 0xFEFF;
/// DCP Get/Set request.
pub const FRAME_ID_DCP_GET_SET: u16 = 0xFEFD;

/// RT Class 1 cyclic frame ID range (inclusive).
pub const RT_CLASS1_FRAME_ID_BASE: u16 = 0xC000;
pub const RT_CLASS1_FRAME_ID_MAX: u16 = 0xF7FF;

// =======================================================================
// DCP
// =======================================================================

/// DCP service IDs.
pub const DCP_SERVICE_GET: u8 = 0x03;
pub const DCP_SERVICE_SET: u8 = 0x04;
pub const DCP_SERVICE_IDENTIFY: u8 = 0x05;

/// DCP service types.
pub const DCP_SERVICE_TYPE_REQUEST: u8 = 0x00;
pub const DCP_SERVICE_TYPE_RESPONSE_SUCCESS: u8 = 0x01;

/// DCP option/suboption pairs.
pub const DCP_OPTION_IP: u8 = 0x01;
pub const DCP_SUBOPTION_IP_PARAMETER: u8 = 0x02;
pub const DCP_OPTION_DEVICE_PROPERTIES: u8 = 0x02;
pub const DCP_SUBOPTION_STATION_NAME: u8 = 0x02;
pub const DCP_SUBOPTION_DEVICE_ID: u8 = 0x03;
pub const DCP_OPTION_ALL: u8 = 0xFF;
pub const DCP_SUBOPTION_ALL: u8 = 0xFF;

/// Block qualifier for permanent DCP Set operations.
pub const DCP_QUALIFIER_PERMANENT: u16 = 0x0001;

// =======================================================================
// PNIO-CM RPC (DCE-RPC CL over UDP)
// =======================================================================

/// UDP port used by both endpoints for PNIO-CM.
pub const PNIO_CM_UDP_PORT: u16 = 34964;

/// DCE-RPC CL header length.
pub const RPC_HEADER_LEN: usize = 80;
/// NDR args header length (little-endian).
pub const NDR_HEADER_LEN: usize = 20;

pub const RPC_VERSION: u8 = 4;
pub const RPC_PACKET_TYPE_REQUEST: u8 = 0;
pub const RPC_PACKET_TYPE_RESPONSE: u8 = 2;
pub const RPC_PACKET_TYPE_FAULT: u8 = 3;

pub const RPC_FLAG1_LAST_FRAGMENT: u8 = 0x02;
pub const RPC_FLAG1_IDEMPOTENT: u8 = 0x20;
/// First DREP byte: little-endian integer representation.
pub const RPC_DREP_LITTLE_ENDIAN: u8 = 0x10;

/// RPC operation numbers.
pub const RPC_OPNUM_CONNECT: u16 = 0;
pub const RPC_OPNUM_RELEASE: u16 = 1;
pub const RPC_OPNUM_READ: u16 = 2;
pub const RPC_OPNUM_WRITE: u16 = 3;
pub const RPC_OPNUM_CONTROL: u16 = 4;

/// PROFINET IO device interface UUID (as stored; first three fields go
/// little-endian on the wire).
pub const PNIO_DEVICE_INTERFACE_UUID: &str = "dea00001-6c97-11d1-8271-00a02442df7d";
/// PROFINET IO controller interface UUID.
pub const PNIO_CONTROLLER_INTERFACE_UUID: &str = "dea00002-6c97-11d1-8271-00a02442df7d";

// =======================================================================
// PNIO blocks
// =======================================================================

pub const BLOCK_AR_REQ: u16 = 0x0101;
pub const BLOCK_IOCR_REQ: u16 = 0x0102;
pub const BLOCK_ALARM_CR_REQ: u16 = 0x0103;
pub const BLOCK_EXPECTED_SUBMODULE: u16 = 0x0104;
pub const BLOCK_IOD_CONTROL_REQ: u16 = 0x0110;
/// IOX control request (device-initiated ApplicationReady).
pub const BLOCK_IOX_CONTROL_REQ: u16 = 0x0112;
pub const BLOCK_IOD_READ_REQ: u16 = 0x0009;
pub const BLOCK_IOD_WRITE_REQ: u16 = 0x0008;

pub const BLOCK_AR_RES: u16 = 0x8101;
pub const BLOCK_IOCR_RES: u16 = 0x8102;
pub const BLOCK_ALARM_CR_RES: u16 = 0x8103;
pub const BLOCK_MODULE_DIFF: u16 = 0x8104;
pub const BLOCK_IOD_CONTROL_RES: u16 = 0x8110;
pub const BLOCK_IOX_CONTROL_RES: u16 = 0x8112;
pub const BLOCK_IOD_READ_RES: u16 = 0x8009;
pub const BLOCK_IOD_WRITE_RES: u16 = 0x8008;
/// RealIdentificationData payload block.
pub const BLOCK_REAL_IDENTIFICATION: u16 = 0x0240;

/// Block version carried in every block header.
pub const BLOCK_VERSION_HIGH: u8 = 1;
pub const BLOCK_VERSION_LOW: u8 = 0;

/// AR types.
pub const AR_TYPE_IOCAR: u16 = 0x0001;
/// AR properties: State-Active | Parameterization | Startup-Legacy.
pub const AR_PROPERTIES: u32 = 0x0000_0003;
/// CM initiator activity timeout in 100 ms units (10 s).
pub const AR_ACTIVITY_TIMEOUT: u16 = 100;

/// IOCR types.
pub const IOCR_TYPE_INPUT: u16 = 0x0001;
pub const IOCR_TYPE_OUTPUT: u16 = 0x0002;
/// RT Class 1, no extras.
pub const IOCR_PROPERTIES_RT_CLASS1: u32 = 0x0000_0001;
/// Frame send offset "best effort" sentinel.
pub const IOCR_FRAME_SEND_OFFSET_UNSPEC: u32 = 0xFFFF_FFFF;
pub const IOCR_TAG_HEADER: u16 = 0xC000;

/// Alarm CR constants.
pub const ALARM_CR_TYPE: u16 = 0x0001;
pub const ALARM_CR_RTA_TIMEOUT_FACTOR: u16 = 100;
pub const ALARM_CR_RTA_RETRIES: u16 = 3;
pub const ALARM_CR_LOCAL_REF: u16 = 0x0001;
pub const ALARM_CR_MAX_DATA_LEN: u16 = 200;
/// High-priority tag header (VLAN prio 6).
pub const ALARM_CR_TAG_HEADER_HIGH: u16 = 0xC000;
/// Low-priority tag header (VLAN prio 5).
pub const ALARM_CR_TAG_HEADER_LOW: u16 = 0xA000;

/// Expected-submodule data-description / properties.
pub const SUBMODULE_PROPERTIES_INPUT: u16 = 0x0001;
pub const SUBMODULE_PROPERTIES_OUTPUT: u16 = 0x0002;
pub const DATA_DESCRIPTION_INPUT: u16 = 0x0001;
pub const DATA_DESCRIPTION_OUTPUT: u16 = 0x0002;

/// IOD control commands.
pub const CONTROL_COMMAND_PRM_END: u16 = 0x0001;
pub const CONTROL_COMMAND_APPLICATION_READY: u16 = 0x0002;
pub const CONTROL_COMMAND_RELEASE: u16 = 0x0003;

/// Record indexes.
pub const RECORD_INDEX_REAL_IDENTIFICATION: u16 = 0xF844;
/// Vendor record: credential sync.
pub const RECORD_INDEX_CREDENTIAL_SYNC: u16 = 0xF840;

/// Record read/write addressing wildcards.
pub const RECORD_SLOT_ALL: u16 = 0xFFFF;
pub const RECORD_SUBSLOT_ALL: u16 = 0xFFFF;

/// PNIO-CM error decode discriminator.
pub const ERROR_DECODE_PNIOCM: u8 = 0x81;

// =======================================================================
// Cyclic RT
// =======================================================================

/// Provider/consumer status byte: good.
pub const IOXS_GOOD: u8 = 0x80;
/// Provider/consumer status byte: bad.
pub const IOXS_BAD: u8 = 0x00;

/// Data-status bits.
pub const DATA_STATUS_STATE_PRIMARY: u8 = 0x01;
pub const DATA_STATUS_REDUNDANCY: u8 = 0x02;
pub const DATA_STATUS_VALID: u8 = 0x04;
pub const DATA_STATUS_RUN: u8 = 0x10;
pub const DATA_STATUS_STATION_PROBLEM: u8 = 0x20;
pub const DATA_STATUS_IGNORE: u8 = 0x80;

/// Data status of a healthy RUN-state provider frame.
pub const DATA_STATUS_RUN_FRAME: u8 =
    DATA_STATUS_STATE_PRIMARY | DATA_STATUS_VALID | DATA_STATUS_RUN;

/// Cyclic frame trailer: cycle counter (2) + data status (1) + transfer status (1).
pub const RT_TRAILER_LEN: usize = 4;

/// DAP addressing: slot 0, device access subslot plus interface/port subslots.
pub const DAP_SLOT: u16 = 0;
pub const DAP_SUBSLOT_DEVICE: u16 = 0x0001;
pub const DAP_SUBSLOT_INTERFACE: u16 = 0x8000;
pub const DAP_SUBSLOT_PORT: u16 = 0x8001;
pub const DAP_MODULE_IDENT: u32 = 0x0000_0001;
pub const DAP_SUBMODULE_DEVICE_IDENT: u32 = 0x0000_0001;
pub const DAP_SUBMODULE_INTERFACE_IDENT: u32 = 0x0000_8000;
pub const DAP_SUBMODULE_PORT_IDENT: u32 = 0x0000_8001;
