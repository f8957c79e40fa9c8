// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Whole fabric addressing.
//!
//! A system address packs, from most to least significant,
//! `chip_y(6) | chip_x(6) | noc_y(6) | noc_x(6) | offset(36)`.
//! Every field is range checked, an out of range value is rejected rather than truncated.

use luwen_core::EthCoord;

use crate::error::PlatformError;

pub const CHIP_COORD_BITS: u32 = 6;
pub const NOC_COORD_BITS: u32 = 6;
pub const OFFSET_BITS: u32 = 36;

const NOC_X_SHIFT: u32 = OFFSET_BITS;
const NOC_Y_SHIFT: u32 = NOC_X_SHIFT + NOC_COORD_BITS;
const CHIP_X_SHIFT: u32 = NOC_Y_SHIFT + NOC_COORD_BITS;
const CHIP_Y_SHIFT: u32 = CHIP_X_SHIFT + CHIP_COORD_BITS;

#[inline]
const fn mask(bits: u32) -> u64 {
    (1 << bits) - 1
}

fn check_field(field: &'static str, value: u64, bits: u32) -> Result<u64, PlatformError> {
    if value > mask(bits) {
        return Err(PlatformError::AddressFieldOverflow { field, value, bits });
    }
    Ok(value)
}

/// Unpacked form of a system address.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct NocAddr {
    pub chip_x: u8,
    pub chip_y: u8,
    pub noc_x: u8,
    pub noc_y: u8,
    pub offset: u64,
}

impl NocAddr {
    pub fn new(chip: &EthCoord, core: (u8, u8), offset: u64) -> Self {
        NocAddr {
            chip_x: chip.x,
            chip_y: chip.y,
            noc_x: core.0,
            noc_y: core.1,
            offset,
        }
    }

    pub fn encode(&self) -> Result<u64, PlatformError> {
        encode(self.chip_y, self.chip_x, self.noc_y, self.noc_x, self.offset)
    }

    pub fn decode(addr: u64) -> Self {
        let (chip_y, chip_x, noc_y, noc_x, offset) = decode(addr);
        NocAddr {
            chip_x,
            chip_y,
            noc_x,
            noc_y,
            offset,
        }
    }
}

pub fn encode(
    chip_y: u8,
    chip_x: u8,
    noc_y: u8,
    noc_x: u8,
    offset: u64,
) -> Result<u64, PlatformError> {
    let chip_y = check_field("chip_y", chip_y as u64, CHIP_COORD_BITS)?;
    let chip_x = check_field("chip_x", chip_x as u64, CHIP_COORD_BITS)?;
    let noc_y = check_field("noc_y", noc_y as u64, NOC_COORD_BITS)?;
    let noc_x = check_field("noc_x", noc_x as u64, NOC_COORD_BITS)?;
    let offset = check_field("offset", offset, OFFSET_BITS)?;

    Ok((chip_y << CHIP_Y_SHIFT)
        | (chip_x << CHIP_X_SHIFT)
        | (noc_y << NOC_Y_SHIFT)
        | (noc_x << NOC_X_SHIFT)
        | offset)
}

pub fn decode(addr: u64) -> (u8, u8, u8, u8, u64) {
    (
        ((addr >> CHIP_Y_SHIFT) & mask(CHIP_COORD_BITS)) as u8,
        ((addr >> CHIP_X_SHIFT) & mask(CHIP_COORD_BITS)) as u8,
        ((addr >> NOC_Y_SHIFT) & mask(NOC_COORD_BITS)) as u8,
        ((addr >> NOC_X_SHIFT) & mask(NOC_COORD_BITS)) as u8,
        addr & mask(OFFSET_BITS),
    )
}

/// The rack word carried next to a system address.
pub fn sys_rack(rack: u8, shelf: u8) -> u16 {
    ((shelf as u16) << 8) | rack as u16
}

pub fn decode_sys_rack(value: u16) -> (u8, u8) {
    ((value & 0xFF) as u8, (value >> 8) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_at_field_limits() {
        let samples = [
            (0, 0, 0, 0, 0),
            (63, 63, 63, 63, mask(OFFSET_BITS)),
            (1, 2, 0, 9, 0x1104),
            (5, 0, 10, 0, 0x8_8003_0060),
            (0, 63, 6, 1, 0xF_FFFF_FFF0),
        ];

        for (chip_y, chip_x, noc_y, noc_x, offset) in samples {
            let addr = encode(chip_y, chip_x, noc_y, noc_x, offset).unwrap();
            assert_eq!(decode(addr), (chip_y, chip_x, noc_y, noc_x, offset));
        }
    }

    #[test]
    fn matches_shift_and_or_construction() {
        let mut expected = 3u64;
        expected = (expected << 6) | 4;
        expected = (expected << 6) | 0;
        expected = (expected << 6) | 9;
        expected = (expected << 36) | 0x1000;

        assert_eq!(encode(3, 4, 0, 9, 0x1000).unwrap(), expected);

        let addr = NocAddr::new(&EthCoord::new(4, 3, 0, 0), (9, 0), 0x1000);
        assert_eq!(addr.encode().unwrap(), expected);
        assert_eq!(NocAddr::decode(expected), addr);
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        let err = encode(64, 0, 0, 0, 0).unwrap_err();
        assert!(matches!(
            err,
            PlatformError::AddressFieldOverflow {
                field: "chip_y",
                value: 64,
                bits: 6
            }
        ));

        assert!(matches!(
            encode(0, 0, 0, 70, 0),
            Err(PlatformError::AddressFieldOverflow { field: "noc_x", .. })
        ));
        assert!(matches!(
            encode(0, 0, 0, 0, 1 << 36),
            Err(PlatformError::AddressFieldOverflow {
                field: "offset",
                ..
            })
        ));
    }

    #[test]
    fn rack_word() {
        assert_eq!(sys_rack(3, 1), 0x0103);
        assert_eq!(decode_sys_rack(0x0103), (3, 1));
    }
}
