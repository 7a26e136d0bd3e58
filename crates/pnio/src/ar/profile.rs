// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Water-treatment device profile.
//!
//! Maps between the module/submodule identifiers the RTU firmware reports
//! and the slot roles this controller drives. Sensor submodules carry the
//! fixed 5-byte sample, actuator submodules the fixed 4-byte command.

use crate::protocol::constants::*;
use crate::protocol::rpc::connect::{ExpectedSlot, ExpectedSubmodule};
use crate::types::{ActuatorCommand, ModuleEntry, PointTag, SensorSample, SlotInfo, SlotRole};

/// Module/submodule identifiers of the measurement class.
pub const SENSOR_MODULE_IDENT: u32 = 0x0000_0010;
pub const SENSOR_SUBMODULE_IDENT: u32 = 0x0000_0011;
/// Module/submodule identifiers of the actuator class.
pub const ACTUATOR_MODULE_IDENT: u32 = 0x0000_0020;
pub const ACTUATOR_SUBMODULE_IDENT: u32 = 0x0000_0021;

/// Classify a reported module ident. The RTU firmware allocates measurement
/// modules in 0x10..0x20 and actuator modules in 0x20..0x30; anything else
/// (DAP included) carries no cyclic data we know how to address.
#[must_use]
pub fn role_of_module(module_ident: u32) -> Option<SlotRole> {
    match module_ident {
        0x0000_0010..=0x0000_001F => Some(SlotRole::Sensor),
        0x0000_0020..=0x0000_002F => Some(SlotRole::Actuator),
        _ => None,
    }
}

/// Domain tag for a reported submodule ident. Low nibble picks the point
/// kind; unknown codes degrade to Generic.
#[must_use]
pub fn tag_of_submodule(role: SlotRole, submodule_ident: u32) -> PointTag {
    match role {
        SlotRole::Sensor => match submodule_ident & 0x0F {
            0x1 => PointTag::Ph,
            0x2 => PointTag::Turbidity,
            0x3 => PointTag::FreeChlorine,
            0x4 => PointTag::Flow,
            0x5 => PointTag::Pressure,
            0x6 => PointTag::Level,
            0x7 => PointTag::Temperature,
            _ => PointTag::Generic,
        },
        SlotRole::Actuator => match submodule_ident & 0x0F {
            0x1 => PointTag::Pump,
            0x2 => PointTag::Valve,
            0x3 => PointTag::DosingPump,
            0x4 => PointTag::UvLamp,
            _ => PointTag::Generic,
        },
    }
}

/// Turn a discovered module list (Record Read 0xF844, GSDML cache) into the
/// slot table the AR and registry consume. DAP and other non-IO entries are
/// dropped; data lengths come from the fixed sample/command sizes.
#[must_use]
pub fn slots_from_modules(modules: &[ModuleEntry]) -> Vec<SlotInfo> {
    let mut out = Vec::new();
    for m in modules {
        let Some(role) = role_of_module(m.module_ident) else {
            continue;
        };
        let data_length = match role {
            SlotRole::Sensor => SensorSample::WIRE_LEN as u16,
            SlotRole::Actuator => ActuatorCommand::WIRE_LEN as u16,
        };
        out.push(SlotInfo {
            slot: m.slot,
            subslot: m.subslot,
            role,
            tag: tag_of_submodule(role, m.submodule_ident),
            module_ident: m.module_ident,
            submodule_ident: m.submodule_ident,
            data_length,
        });
    }
    out.sort_by_key(|s| (s.slot, s.subslot));
    out
}

/// The DAP expected-slot entry that leads every configuration.
#[must_use]
pub fn dap_expected_slot() -> ExpectedSlot {
    ExpectedSlot {
        slot: DAP_SLOT,
        module_ident: DAP_MODULE_IDENT,
        submodules: vec![
            ExpectedSubmodule {
                subslot: DAP_SUBSLOT_DEVICE,
                submodule_ident: DAP_SUBMODULE_DEVICE_IDENT,
                properties: SUBMODULE_PROPERTIES_INPUT,
                data_length: 0,
            },
            ExpectedSubmodule {
                subslot: DAP_SUBSLOT_INTERFACE,
                submodule_ident: DAP_SUBMODULE_INTERFACE_IDENT,
                properties: SUBMODULE_PROPERTIES_INPUT,
                data_length: 0,
            },
            ExpectedSubmodule {
                subslot: DAP_SUBSLOT_PORT,
                submodule_ident: DAP_SUBMODULE_PORT_IDENT,
                properties: SUBMODULE_PROPERTIES_INPUT,
                data_length: 0,
            },
        ],
    }
}

/// Build the Expected Submodule Block content for a slot table. The DAP is
/// always prepended; application slots follow in table order, one API entry
/// per unique slot.
#[must_use]
pub fn expected_slots(slots: &[SlotInfo]) -> Vec<ExpectedSlot> {
    let mut out = vec![dap_expected_slot()];
    for s in slots {
        let properties = match s.role {
            SlotRole::Sensor => SUBMODULE_PROPERTIES_INPUT,
            SlotRole::Actuator => SUBMODULE_PROPERTIES_OUTPUT,
        };
        let sub = ExpectedSubmodule {
            subslot: s.subslot,
            submodule_ident: s.submodule_ident,
            properties,
            data_length: s.data_length,
        };
        match out.iter_mut().find(|e| e.slot == s.slot) {
            Some(entry) => entry.submodules.push(sub),
            None => out.push(ExpectedSlot {
                slot: s.slot,
                module_ident: s.module_ident,
                submodules: vec![sub],
            }),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_roles_cover_rtu_catalog() {
        assert_eq!(role_of_module(SENSOR_MODULE_IDENT), Some(SlotRole::Sensor));
        assert_eq!(role_of_module(ACTUATOR_MODULE_IDENT), Some(SlotRole::Actuator));
        assert_eq!(role_of_module(DAP_MODULE_IDENT), None);
        assert_eq!(role_of_module(0xDEAD_BEEF), None);
    }

    #[test]
    fn slots_from_modules_drops_dap_and_sorts() {
        let modules = [
            ModuleEntry { slot: 2, subslot: 1, module_ident: 0x20, submodule_ident: 0x21 },
            ModuleEntry { slot: 0, subslot: 1, module_ident: DAP_MODULE_IDENT, submodule_ident: 1 },
            ModuleEntry { slot: 1, subslot: 1, module_ident: 0x10, submodule_ident: 0x11 },
        ];
        let slots = slots_from_modules(&modules);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].slot, 1);
        assert_eq!(slots[0].role, SlotRole::Sensor);
        assert_eq!(slots[0].data_length, 5);
        assert_eq!(slots[1].slot, 2);
        assert_eq!(slots[1].role, SlotRole::Actuator);
        assert_eq!(slots[1].data_length, 4);
    }

    #[test]
    fn expected_slots_always_lead_with_dap() {
        let table = [crate::types::SlotInfo::sensor(1, PointTag::Ph)];
        let expected = expected_slots(&table);
        assert_eq!(expected[0].slot, DAP_SLOT);
        assert_eq!(expected[0].submodules.len(), 3);
        assert_eq!(expected[1].slot, 1);
        assert_eq!(expected[1].submodules[0].data_length, 5);
    }

    #[test]
    fn submodule_tags_decode_point_kinds() {
        assert_eq!(tag_of_submodule(SlotRole::Sensor, 0x11), PointTag::Ph);
        assert_eq!(tag_of_submodule(SlotRole::Sensor, 0x14), PointTag::Flow);
        assert_eq!(tag_of_submodule(SlotRole::Actuator, 0x21), PointTag::Pump);
        assert_eq!(tag_of_submodule(SlotRole::Actuator, 0x2F), PointTag::Generic);
    }
}
