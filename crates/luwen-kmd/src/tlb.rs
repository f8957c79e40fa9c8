// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::{PciDevice, PciError};

pub const TLB_CONFIG_BASE: u32 = 0x1FC00000;
pub const TLB_COUNT_1M: u32 = 156;
pub const TLB_SIZE_1M: u64 = 1 << 20;

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
#[repr(u8)]
pub enum Ordering {
    Relaxed = 0,
    #[default]
    Strict = 1,
    Posted = 2,
}

impl From<u8> for Ordering {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Relaxed,
            2 => Self::Posted,
            _ => Self::Strict,
        }
    }
}

/// A request to point a TLB window at a NOC endpoint.
#[derive(Debug, Clone, Default)]
pub struct Tlb {
    pub local_offset: u64,
    pub x_end: u8,
    pub y_end: u8,
    pub x_start: u8,
    pub y_start: u8,
    pub noc_sel: u8,
    pub mcast: bool,
    pub ordering: Ordering,
    pub linked: bool,
}

#[bitfield_struct::bitfield(u64)]
pub struct Tlb1M {
    local_offset: u16,
    #[bits(6)]
    x_end: u8,
    #[bits(6)]
    y_end: u8,
    #[bits(6)]
    x_start: u8,
    #[bits(6)]
    y_start: u8,
    #[bits(1)]
    noc_sel: u8,
    mcast: bool,
    #[bits(2)]
    ordering: u8,
    linked: bool,
    #[bits(19)]
    padding: u64,
}

impl From<&Tlb> for Tlb1M {
    fn from(value: &Tlb) -> Self {
        Self::new()
            .with_local_offset((value.local_offset / TLB_SIZE_1M) as u16)
            .with_x_end(value.x_end)
            .with_y_end(value.y_end)
            .with_x_start(value.x_start)
            .with_y_start(value.y_start)
            .with_noc_sel(value.noc_sel)
            .with_mcast(value.mcast)
            .with_ordering(value.ordering as u8)
            .with_linked(value.linked)
    }
}

impl From<Tlb1M> for Tlb {
    fn from(value: Tlb1M) -> Self {
        Tlb {
            local_offset: value.local_offset() as u64 * TLB_SIZE_1M,
            x_end: value.x_end(),
            y_end: value.y_end(),
            x_start: value.x_start(),
            y_start: value.y_start(),
            noc_sel: value.noc_sel(),
            mcast: value.mcast(),
            ordering: Ordering::from(value.ordering()),
            linked: value.linked(),
        }
    }
}

/// Program one of the 1M windows and return (bar offset, bytes usable from that offset).
pub fn setup_tlb(
    device: &mut PciDevice,
    tlb_index: u32,
    tlb: &Tlb,
) -> Result<(u64, u64), PciError> {
    if tlb_index >= TLB_COUNT_1M {
        return Err(PciError::TlbOutOfRange { id: tlb_index });
    }

    let tlb_config_addr = TLB_CONFIG_BASE + (tlb_index * 8);
    let tlb_value = Tlb1M::from(tlb).0;
    let addr_offset = tlb.local_offset % TLB_SIZE_1M;

    device.write32(tlb_config_addr, (tlb_value & 0xFFFF_FFFF) as u32)?;
    device.write32(tlb_config_addr + 4, ((tlb_value >> 32) & 0xFFFF_FFFF) as u32)?;

    Ok((
        TLB_SIZE_1M * tlb_index as u64 + addr_offset,
        TLB_SIZE_1M - addr_offset,
    ))
}

pub fn get_tlb(device: &PciDevice, tlb_index: u32) -> Result<Tlb, PciError> {
    if tlb_index >= TLB_COUNT_1M {
        return Err(PciError::TlbOutOfRange { id: tlb_index });
    }

    let tlb_config_addr = TLB_CONFIG_BASE + (tlb_index * 8);
    let tlb = ((device.read32(tlb_config_addr + 4)? as u64) << 32)
        | device.read32(tlb_config_addr)? as u64;

    Ok(Tlb1M::from(tlb).into())
}
