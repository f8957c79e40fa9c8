// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! SPI rom access through the ARC firmware.
//!
//! ARC copies 4 KiB chunks of the rom into its CSM on request, the host then reads or
//! modifies that copy over the NOC and asks ARC to write it back.

use crate::error::PlatformError;

use super::arc::{ArcMsg, ArcMsgOk, ArcMsgOptions, ARC_CORE, ARC_CSM_DATA_BASE};
use super::TTDevice;

pub const SPI_ROM_SIZE: u32 = 1 << 24;
pub const ARC_SPI_CHUNK_SIZE: u32 = 0x1000;

const CSM_ARC_VIEW_BASE: u64 = 0x10000000;

/// (first chunk address, chunk count, offset of `addr` in the first chunk)
pub fn get_aligned_params(addr: u32, size: u32) -> Result<(u32, u32, u32), PlatformError> {
    let end = addr as u64 + size as u64;
    if end > SPI_ROM_SIZE as u64 {
        return Err(format!(
            "Requested range {addr:#x}+{size:#x} exceeds the {SPI_ROM_SIZE:#x} byte SPI ROM."
        )
        .into());
    }

    let start_addr = (addr / ARC_SPI_CHUNK_SIZE) * ARC_SPI_CHUNK_SIZE;
    let end_addr = (end as u32).div_ceil(ARC_SPI_CHUNK_SIZE) * ARC_SPI_CHUNK_SIZE;
    let num_chunks = (end_addr - start_addr) / ARC_SPI_CHUNK_SIZE;
    let start_offset = addr - start_addr;

    Ok((start_addr, num_chunks, start_offset))
}

fn spi_dump_address(device: &TTDevice) -> Result<u64, PlatformError> {
    let result = device.arc_msg(&ArcMsgOptions {
        msg: ArcMsg::GetSpiDumpAddr,
        ..Default::default()
    })?;

    match result {
        ArcMsgOk::Ok { arg, .. } => Ok(ARC_CSM_DATA_BASE - CSM_ARC_VIEW_BASE + arg as u64),
        ArcMsgOk::OkNoWait => Err("ARC did not report a SPI dump address"
            .to_string()
            .into()),
    }
}

fn read_chunk(
    device: &TTDevice,
    dump_addr: u64,
    addr: u32,
) -> Result<Vec<u8>, PlatformError> {
    device.arc_msg(&ArcMsgOptions {
        msg: ArcMsg::SpiRead { addr },
        ..Default::default()
    })?;

    let mut data = vec![0; ARC_SPI_CHUNK_SIZE as usize];
    device.noc_read(ARC_CORE, dump_addr, &mut data)?;

    Ok(data)
}

/// Writes back to the address of the last chunk read.
fn write_chunk(device: &TTDevice, dump_addr: u64, data: &[u8]) -> Result<(), PlatformError> {
    device.noc_write(ARC_CORE, dump_addr, data)?;
    device.arc_msg(&ArcMsgOptions {
        msg: ArcMsg::SpiWrite,
        ..Default::default()
    })?;

    Ok(())
}

/// Byte range of chunk `index` that overlaps the user buffer, as
/// (range in the chunk, range in the buffer).
fn overlap(
    index: u32,
    start_offset: u32,
    len: usize,
) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
    let chunk_start = (index * ARC_SPI_CHUNK_SIZE) as usize;
    let chunk_end = chunk_start + ARC_SPI_CHUNK_SIZE as usize;
    let user_start = start_offset as usize;
    let user_end = user_start + len;

    let start = chunk_start.max(user_start);
    let end = chunk_end.min(user_end);

    (
        (start - chunk_start)..(end - chunk_start),
        (start - user_start)..(end - user_start),
    )
}

pub fn spi_read(device: &TTDevice, addr: u32, data: &mut [u8]) -> Result<(), PlatformError> {
    if !device.arch().is_wormhole() {
        return Err(PlatformError::unsupported("spi_read", device.arch()));
    }

    let (start_addr, num_chunks, start_offset) = get_aligned_params(addr, data.len() as u32)?;
    let dump_addr = spi_dump_address(device)?;

    for index in 0..num_chunks {
        let chunk = read_chunk(device, dump_addr, start_addr + index * ARC_SPI_CHUNK_SIZE)?;
        let (from, to) = overlap(index, start_offset, data.len());
        data[to].copy_from_slice(&chunk[from]);
    }

    Ok(())
}

/// Chunks whose contents would not change are left alone.
pub fn spi_write(device: &TTDevice, addr: u32, data: &[u8]) -> Result<(), PlatformError> {
    if !device.arch().is_wormhole() {
        return Err(PlatformError::unsupported("spi_write", device.arch()));
    }

    let (start_addr, num_chunks, start_offset) = get_aligned_params(addr, data.len() as u32)?;
    let dump_addr = spi_dump_address(device)?;

    for index in 0..num_chunks {
        let mut chunk = read_chunk(device, dump_addr, start_addr + index * ARC_SPI_CHUNK_SIZE)?;
        let (into, from) = overlap(index, start_offset, data.len());
        if chunk[into.clone()] != data[from.clone()] {
            chunk[into].copy_from_slice(&data[from]);
            write_chunk(device, dump_addr, &chunk)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_params() {
        assert_eq!(get_aligned_params(0, 0x1000).unwrap(), (0, 1, 0));
        assert_eq!(get_aligned_params(0x1010, 0x1000).unwrap(), (0x1000, 2, 0x10));
        assert_eq!(get_aligned_params(0x2ffe, 4).unwrap(), (0x2000, 2, 0xffe));
        assert!(get_aligned_params(SPI_ROM_SIZE - 4, 8).is_err());
        assert!(get_aligned_params(u32::MAX, 8).is_err());
    }

    #[test]
    fn chunk_overlap() {
        // 8 bytes starting 4 bytes before the end of the first chunk.
        assert_eq!(overlap(0, 0xffc, 8), (0xffc..0x1000, 0..4));
        assert_eq!(overlap(1, 0xffc, 8), (0..4, 4..8));
        assert_eq!(overlap(0, 0, 16), (0..16, 0..16));
    }
}
