// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use std::os::{fd::AsRawFd, unix::prelude::FileTypeExt};

mod error;
pub mod ioctl;
pub mod tlb;

pub use error::{PciError, PciOpenError};
use ioctl::{query_mappings, GetDeviceInfo, GetDeviceInfoOut, Mapping, MappingId, QueryMappings};
use luwen_core::Arch;
pub use tlb::Tlb;

const ERROR_VALUE: u32 = 0xffffffff;

pub const GS_WH_ARC_SCRATCH6_ADDR: u32 = 0x1ff30078;
pub const BH_NOC_NODE_ID_OFFSET: u32 = 0x1FD04044;

/// The 1M window reserved for NOC access from this crate.
pub const NOC_TLB_INDEX: u32 = 1;

impl TryFrom<&GetDeviceInfoOut> for Arch {
    type Error = u16;

    fn try_from(value: &GetDeviceInfoOut) -> Result<Self, Self::Error> {
        Arch::from_pci_device_id(value.device_id).ok_or(value.device_id)
    }
}

#[derive(Clone, Debug)]
pub struct PhysicalDevice {
    pub vendor_id: u16,
    pub device_id: u16,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,

    pub pci_bus: u16,
    pub slot: u16,
    pub pci_function: u16,
    pub pci_domain: u16,
}

pub struct BarMapping {
    pub bar0_uc: memmap2::MmapMut,
    pub bar0_uc_size: u64,

    pub system_reg_mapping: Option<memmap2::MmapMut>,
    pub system_reg_start_offset: u32, // Registers >= this are system regs, use the mapping.
    pub system_reg_offset_adjust: u32, // This is the offset of the first reg in the system reg mapping.
}

impl BarMapping {
    fn register_address(&self, mut register_addr: u32, len: usize) -> Option<*mut u8> {
        let mapping = match &self.system_reg_mapping {
            Some(mapping) if register_addr >= self.system_reg_start_offset => {
                register_addr -= self.system_reg_offset_adjust;
                mapping
            }
            _ => &self.bar0_uc,
        };

        if register_addr as usize + len > mapping.len() {
            return None;
        }

        // SAFETY: bounds checked against the mapping above.
        Some(unsafe { (mapping.as_ptr() as *mut u8).add(register_addr as usize) })
    }
}

pub struct PciDevice {
    pub id: usize,

    pub physical: PhysicalDevice,
    pub arch: Arch,

    pub read_checking_enabled: bool,
    pub read_checking_addr: u32,

    device_fd: std::fs::File,

    pub pci_bar: Option<BarMapping>,
}

impl PciDevice {
    fn map_bar(&mut self) -> Result<(), PciOpenError> {
        let mut mappings = QueryMappings::<8>::default();

        if let Err(erno) = unsafe { query_mappings(self.device_fd.as_raw_fd(), &mut mappings) } {
            return Err(PciOpenError::IoctlError {
                name: "query_mappings".to_string(),
                id: self.id,
                source: erno,
            });
        }

        let mut bar0_uc_mapping = Mapping::default();
        let mut bar2_uc_mapping = Mapping::default();

        for mapping in mappings
            .output
            .mappings
            .iter()
            .take(mappings.input.output_mapping_count as usize)
        {
            match MappingId::from_u32(mapping.mapping_id) {
                Some(MappingId::Resource0Uc) => bar0_uc_mapping = *mapping,
                Some(MappingId::Resource2Uc) => bar2_uc_mapping = *mapping,
                Some(_) => {}
                None => {
                    tracing::warn!(
                        "Device {} reported unknown mapping id {}",
                        self.id,
                        mapping.mapping_id
                    );
                }
            }
        }

        if bar0_uc_mapping.mapping_id != MappingId::Resource0Uc.as_u32() {
            return Err(PciOpenError::BarMappingError {
                name: "bar0_uc_mapping".to_string(),
                id: self.id,
            });
        }

        let bar0_uc = self.mmap("bar0_uc", &bar0_uc_mapping)?;

        let mut system_reg_mapping = None;
        let mut system_reg_start_offset = 0;
        let mut system_reg_offset_adjust = 0;
        if self.arch.is_wormhole() {
            if bar2_uc_mapping.mapping_id != MappingId::Resource2Uc.as_u32() {
                return Err(PciOpenError::BarMappingError {
                    name: "bar4_uc_mapping".to_string(),
                    id: self.id,
                });
            }

            system_reg_mapping = Some(self.mmap("bar4_uc", &bar2_uc_mapping)?);
            system_reg_start_offset = (512 - 16) * 1024 * 1024;
            system_reg_offset_adjust = (512 - 32) * 1024 * 1024;
        }

        self.pci_bar = Some(BarMapping {
            bar0_uc,
            bar0_uc_size: bar0_uc_mapping.mapping_size,
            system_reg_mapping,
            system_reg_start_offset,
            system_reg_offset_adjust,
        });

        Ok(())
    }

    fn mmap(&self, name: &str, mapping: &Mapping) -> Result<memmap2::MmapMut, PciOpenError> {
        unsafe {
            memmap2::MmapOptions::default()
                .len(mapping.mapping_size as usize)
                .offset(mapping.mapping_base)
                .map_mut(self.device_fd.as_raw_fd())
        }
        .map_err(|source| PciOpenError::MmapFailed {
            name: name.to_string(),
            id: self.id,
            source,
        })
    }

    pub fn open(device_id: usize) -> Result<PciDevice, PciOpenError> {
        let fd = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/dev/tenstorrent/{device_id}"))
            .map_err(|source| PciOpenError::DeviceOpenFailed {
                id: device_id,
                source,
            })?;

        let mut device_info = GetDeviceInfo::default();
        if let Err(errorno) = unsafe { ioctl::get_device_info(fd.as_raw_fd(), &mut device_info) } {
            return Err(PciOpenError::IoctlError {
                name: "get_device_info".to_string(),
                id: device_id,
                source: errorno,
            });
        }

        let arch = Arch::try_from(&device_info.output).map_err(|asic_id| {
            PciOpenError::UnrecognizedDeviceId {
                pci_id: device_id,
                device_id: asic_id,
            }
        })?;

        let pci_bus = device_info.output.bus_dev_fn >> 8;
        let slot = ((device_info.output.bus_dev_fn) >> 3) & 0x1f; // The definition of PCI_SLOT from include/uapi/linux/pci.h
        let pci_function = (device_info.output.bus_dev_fn) & 0x7; // The definition of PCI_FUNC from include/uapi/linux/pci.h

        let mut device = PciDevice {
            id: device_id,
            arch,

            physical: PhysicalDevice {
                vendor_id: device_info.output.vendor_id,
                device_id: device_info.output.device_id,
                subsystem_vendor_id: device_info.output.subsystem_vendor_id,
                subsystem_id: device_info.output.subsystem_id,
                pci_bus,
                slot,
                pci_function,
                pci_domain: device_info.output.pci_domain,
            },

            read_checking_enabled: true,
            read_checking_addr: if arch.is_blackhole() {
                BH_NOC_NODE_ID_OFFSET
            } else {
                GS_WH_ARC_SCRATCH6_ADDR
            },

            device_fd: fd,

            pci_bar: None,
        };

        device.map_bar()?;

        tracing::debug!(
            "Opened /dev/tenstorrent/{device_id} ({arch}) at {:04x}:{:02x}:{:02x}.{}",
            device.physical.pci_domain,
            pci_bus,
            slot,
            pci_function
        );

        Ok(device)
    }

    pub fn scan() -> Vec<usize> {
        let output = std::fs::read_dir("/dev/tenstorrent");
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                tracing::debug!("When reading /dev/tenstorrent for a scan hit error: {err}");
                return Vec::new();
            }
        };

        let mut output = output
            .filter_map(|entry| {
                let entry = entry.ok()?;

                if !entry.file_type().ok()?.is_char_device() {
                    return None;
                }

                let path = entry.path();
                let file_name = path.file_name()?.to_str()?;
                file_name.parse::<usize>().ok()
            })
            .collect::<Vec<_>>();

        output.sort();

        output
    }

    fn register_pointer(&self, addr: u32, len: usize) -> Result<*mut u8, PciError> {
        let bar = self.pci_bar.as_ref().ok_or(PciError::BarUnmapped)?;
        bar.register_address(addr, len)
            .ok_or(PciError::AddressOutOfRange {
                id: self.id,
                addr: addr as u64,
            })
    }

    #[inline]
    pub fn detect_ffffffff_read(&self, data_read: Option<u32>) -> Result<(), PciError> {
        let data_read = data_read.unwrap_or(ERROR_VALUE);

        if self.read_checking_enabled && data_read == ERROR_VALUE {
            let scratch = self.register_pointer(self.read_checking_addr, 4)?;
            let scratch_data = unsafe { (scratch as *const u32).read_volatile() };

            if scratch_data == ERROR_VALUE {
                return Err(PciError::BrokenConnection);
            }
        }

        Ok(())
    }

    #[inline]
    pub fn read32(&self, addr: u32) -> Result<u32, PciError> {
        if addr % 4 != 0 {
            let mut data = [0u8; 4];
            self.read_block(addr, &mut data)?;
            return Ok(u32::from_le_bytes(data));
        }

        let ptr = self.register_pointer(addr, 4)?;
        let data = unsafe { (ptr as *const u32).read_volatile() };
        self.detect_ffffffff_read(Some(data))?;

        Ok(data)
    }

    #[inline]
    pub fn write32(&mut self, addr: u32, data: u32) -> Result<(), PciError> {
        if addr % 4 != 0 {
            return self.write_block(addr, &data.to_le_bytes());
        }

        let ptr = self.register_pointer(addr, 4)?;
        unsafe { (ptr as *mut u32).write_volatile(data) };
        self.detect_ffffffff_read(None)?;

        Ok(())
    }

    pub fn read_block(&self, addr: u32, data: &mut [u8]) -> Result<(), PciError> {
        let ptr = self.register_pointer(addr, data.len())?;
        unsafe { Self::memcpy_from_device(data, ptr) };

        if data.len() >= std::mem::size_of::<u32>() {
            self.detect_ffffffff_read(Some(u32::from_le_bytes([
                data[0], data[1], data[2], data[3],
            ])))?;
        }

        Ok(())
    }

    pub fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<(), PciError> {
        let ptr = self.register_pointer(addr, data.len())?;
        unsafe { Self::memcpy_to_device(ptr, data) };

        Ok(())
    }

    /// Copy to a memory location mapped to the PciDevice from a buffer passed in by the host.
    /// Both dest and src may be unaligned, the device side is only ever accessed with
    /// aligned 32 bit transactions.
    ///
    /// # Safety
    /// dest must point into one of the BAR mappings with at least src.len() bytes available.
    pub unsafe fn memcpy_to_device(dest: *mut u8, src: &[u8]) {
        let align = core::mem::align_of::<u32>();
        let mut offset = 0;

        while offset < src.len() {
            let ptr = dest.add(offset);
            let misalign = ptr as usize % align;
            let aligned = ptr.sub(misalign) as *mut u32;
            let take = (align - misalign).min(src.len() - offset);

            if misalign == 0 && take == align {
                let mut word = [0u8; 4];
                word.copy_from_slice(&src[offset..offset + 4]);
                aligned.write_volatile(u32::from_le_bytes(word));
            } else {
                let mut word = aligned.read_volatile().to_le_bytes();
                word[misalign..misalign + take].copy_from_slice(&src[offset..offset + take]);
                aligned.write_volatile(u32::from_le_bytes(word));
            }

            offset += take;
        }
    }

    /// Copy from a memory location mapped to the PciDevice into a host buffer.
    ///
    /// # Safety
    /// src must point into one of the BAR mappings with at least dest.len() bytes available.
    pub unsafe fn memcpy_from_device(dest: &mut [u8], src: *const u8) {
        let align = core::mem::align_of::<u32>();
        let mut offset = 0;

        while offset < dest.len() {
            let ptr = src.add(offset);
            let misalign = ptr as usize % align;
            let aligned = ptr.sub(misalign) as *const u32;
            let take = (align - misalign).min(dest.len() - offset);

            let word = aligned.read_volatile().to_le_bytes();
            dest[offset..offset + take].copy_from_slice(&word[misalign..misalign + take]);

            offset += take;
        }
    }

    pub fn noc_write(&mut self, mut tlb: Tlb, data: &[u8]) -> Result<(), PciError> {
        let mut written = 0;
        let addr = tlb.local_offset;
        while written < data.len() {
            let (offset, size) = tlb::setup_tlb(self, NOC_TLB_INDEX, &tlb)?;

            let remaining_data = &data[written..];
            let chunk = &remaining_data[..(size as usize).min(remaining_data.len())];

            self.write_block(offset as u32, chunk)?;

            written += chunk.len();
            tlb.local_offset = addr + written as u64;
        }

        Ok(())
    }

    pub fn noc_read(&mut self, mut tlb: Tlb, data: &mut [u8]) -> Result<(), PciError> {
        let mut read = 0;
        let addr = tlb.local_offset;
        while read < data.len() {
            let (offset, size) = tlb::setup_tlb(self, NOC_TLB_INDEX, &tlb)?;

            let remaining_buffer = &mut data[read..];
            let chunk_len = (size as usize).min(remaining_buffer.len());

            self.read_block(offset as u32, &mut remaining_buffer[..chunk_len])?;

            read += chunk_len;
            tlb.local_offset = addr + read as u64;
        }

        Ok(())
    }

    pub fn noc_read32(&mut self, tlb: Tlb) -> Result<u32, PciError> {
        let mut data = [0u8; 4];
        self.noc_read(tlb, &mut data)?;
        Ok(u32::from_le_bytes(data))
    }

    pub fn noc_write32(&mut self, tlb: Tlb, data: u32) -> Result<(), PciError> {
        self.noc_write(tlb, &data.to_le_bytes())
    }
}
