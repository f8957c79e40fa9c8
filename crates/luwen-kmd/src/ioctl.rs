// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

const TENSTORRENT_IOCTL_MAGIC: usize = 0xFA;

use nix::request_code_none;

#[derive(Debug)]
#[repr(C)]
pub struct GetDeviceInfoIn {
    pub output_size_bytes: u32,
}

impl Default for GetDeviceInfoIn {
    fn default() -> Self {
        Self {
            output_size_bytes: std::mem::size_of::<GetDeviceInfoOut>() as u32,
        }
    }
}

#[derive(Default, Debug)]
#[repr(C)]
pub struct GetDeviceInfoOut {
    pub output_size_bytes: u32,
    pub vendor_id: u16,
    pub device_id: u16,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub bus_dev_fn: u16,            // [0:2] function, [3:7] device, [8:15] bus
    pub max_dma_buf_size_log2: u16, // Since 1.0
    pub pci_domain: u16,            // Since 1.23
}

#[derive(Default, Debug)]
#[repr(C)]
pub struct GetDeviceInfo {
    pub input: GetDeviceInfoIn,
    pub output: GetDeviceInfoOut,
}

nix::ioctl_readwrite_bad!(
    get_device_info,
    request_code_none!(TENSTORRENT_IOCTL_MAGIC, 0),
    GetDeviceInfo
);

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct Mapping {
    pub mapping_id: u32,
    _reserved: u32,
    pub mapping_base: u64,
    pub mapping_size: u64,
}

#[derive(Debug, Default)]
#[repr(C)]
pub struct QueryMappingsIn {
    pub output_mapping_count: u32,
    _reserved: u32,
}

#[derive(Debug)]
#[repr(C)]
pub struct QueryMappingsOut<const N: usize> {
    pub mappings: [Mapping; N],
}

impl<const N: usize> Default for QueryMappingsOut<N> {
    fn default() -> Self {
        Self {
            mappings: [Mapping::default(); N],
        }
    }
}

#[derive(Debug)]
#[repr(C)]
pub struct QueryMappings<const N: usize> {
    pub input: QueryMappingsIn,
    pub output: QueryMappingsOut<N>,
}

impl<const N: usize> Default for QueryMappings<N> {
    fn default() -> Self {
        Self {
            input: QueryMappingsIn {
                output_mapping_count: N as u32,
                ..Default::default()
            },
            output: QueryMappingsOut::<N>::default(),
        }
    }
}

/// # Safety
///
/// You must make sure that data is a valid pointer and that the file descriptor is valid
pub unsafe fn query_mappings<const N: usize>(
    fd: nix::libc::c_int,
    data: *mut QueryMappings<N>,
) -> nix::Result<nix::libc::c_int> {
    nix::convert_ioctl_res!(nix::libc::ioctl(
        fd,
        request_code_none!(TENSTORRENT_IOCTL_MAGIC, 2) as nix::sys::ioctl::ioctl_num_type,
        data
    ))
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingId {
    Unused = 0,
    Resource0Uc = 1,
    Resource0Wc = 2,
    Resource1Uc = 3,
    Resource1Wc = 4,
    Resource2Uc = 5,
    Resource2Wc = 6,
}

impl MappingId {
    pub fn from_u32(value: u32) -> Option<MappingId> {
        match value {
            0 => Some(MappingId::Unused),
            1 => Some(MappingId::Resource0Uc),
            2 => Some(MappingId::Resource0Wc),
            3 => Some(MappingId::Resource1Uc),
            4 => Some(MappingId::Resource1Wc),
            5 => Some(MappingId::Resource2Uc),
            6 => Some(MappingId::Resource2Wc),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> u32 {
        *self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_struct_layout() {
        // The driver checks output_size_bytes against its own struct size.
        assert_eq!(std::mem::size_of::<GetDeviceInfoOut>(), 20);
        assert_eq!(std::mem::size_of::<Mapping>(), 24);
        assert_eq!(
            QueryMappings::<8>::default().input.output_mapping_count,
            8
        );
    }

    #[test]
    fn mapping_id_decode() {
        assert_eq!(MappingId::from_u32(5), Some(MappingId::Resource2Uc));
        assert_eq!(MappingId::Resource0Uc.as_u32(), 1);
        assert_eq!(MappingId::from_u32(77), None);
    }
}
