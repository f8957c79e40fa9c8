// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PciOpenError {
    #[error("Failed to open device /dev/tenstorrent/{id}: {source}")]
    DeviceOpenFailed { id: usize, source: std::io::Error },

    #[error("Failed to recognize id for device /dev/tenstorrent/{pci_id}: {device_id:x}")]
    UnrecognizedDeviceId { pci_id: usize, device_id: u16 },

    #[error("ioctl {name} failed for device {id} with: {source}")]
    IoctlError {
        name: String,
        id: usize,
        source: nix::Error,
    },

    #[error("Failed to map {name} from device {id}")]
    BarMappingError { name: String, id: usize },

    #[error("Mapping {name} for device {id} failed with {source}")]
    MmapFailed {
        name: String,
        id: usize,
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum PciError {
    #[error("Read 0xffffffff from ARC scratch[6]: you should reset the board.")]
    BrokenConnection,

    #[error("Tried to access tlb {id} which is out of range")]
    TlbOutOfRange { id: u32 },

    #[error("Register 0x{addr:x} is outside of the mapped BAR for device {id}")]
    AddressOutOfRange { id: usize, addr: u64 },

    #[error("During PciDevice initialization the PCI bar could not be mapped")]
    BarUnmapped,

    #[error("{0}")]
    DeviceOpenError(#[from] PciOpenError),
}
