// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use luwen_api::error::PlatformError;
use luwen_api::{
    DeviceBackend, DiscoveredCluster, DiscoveryEvent, NocId, PciDeviceInfo, PciEnumerator,
    TopologyDiscovery, TopologyDiscoveryOptions,
};
use luwen_kmd::{PciDevice, Tlb};

pub mod error;

pub use error::{open_error, pci_error};

fn device_info(device: &PciDevice) -> PciDeviceInfo {
    let physical = &device.physical;
    PciDeviceInfo {
        interface_id: device.id,
        vendor_id: physical.vendor_id,
        device_id: physical.device_id,
        subsystem_vendor_id: physical.subsystem_vendor_id,
        subsystem_id: physical.subsystem_id,
        bdf: format!(
            "{:04x}:{:02x}:{:02x}.{:x}",
            physical.pci_domain, physical.pci_bus, physical.slot, physical.pci_function
        ),
        arch: device.arch,
    }
}

/// A chip on the host bus driven through `/dev/tenstorrent`.
pub struct KmdBackend {
    device: Mutex<PciDevice>,
    info: PciDeviceInfo,
}

impl KmdBackend {
    pub fn open(interface_id: usize) -> Result<Self, PlatformError> {
        let device = PciDevice::open(interface_id).map_err(open_error)?;
        Ok(KmdBackend {
            info: device_info(&device),
            device: Mutex::new(device),
        })
    }

    fn device(&self) -> MutexGuard<'_, PciDevice> {
        self.device
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tlb(noc: NocId, core: (u8, u8), addr: u64) -> Tlb {
        Tlb {
            local_offset: addr,
            x_end: core.0,
            y_end: core.1,
            noc_sel: noc.as_u8(),
            ..Default::default()
        }
    }
}

impl DeviceBackend for KmdBackend {
    fn info(&self) -> &PciDeviceInfo {
        &self.info
    }

    fn noc_read(
        &self,
        noc: NocId,
        core: (u8, u8),
        addr: u64,
        data: &mut [u8],
    ) -> Result<(), PlatformError> {
        self.device()
            .noc_read(Self::tlb(noc, core, addr), data)
            .map_err(|err| pci_error(self.info.interface_id, err))
    }

    fn noc_write(
        &self,
        noc: NocId,
        core: (u8, u8),
        addr: u64,
        data: &[u8],
    ) -> Result<(), PlatformError> {
        self.device()
            .noc_write(Self::tlb(noc, core, addr), data)
            .map_err(|err| pci_error(self.info.interface_id, err))
    }
}

/// Lists the character devices under `/dev/tenstorrent`.
#[derive(Clone, Copy, Debug, Default)]
pub struct KmdEnumerator;

impl PciEnumerator for KmdEnumerator {
    fn enumerate_devices(&self, targets: &BTreeSet<usize>) -> Result<Vec<usize>, PlatformError> {
        Ok(PciDevice::scan()
            .into_iter()
            .filter(|id| targets.is_empty() || targets.contains(id))
            .collect())
    }

    fn enumerate_devices_info(
        &self,
        targets: &BTreeSet<usize>,
    ) -> Result<BTreeMap<usize, PciDeviceInfo>, PlatformError> {
        let mut output = BTreeMap::new();
        for id in self.enumerate_devices(targets)? {
            match PciDevice::open(id) {
                Ok(device) => {
                    output.insert(id, device_info(&device));
                }
                Err(err) => tracing::warn!("Skipping /dev/tenstorrent/{id}: {err}"),
            }
        }
        Ok(output)
    }

    fn open(&self, interface_id: usize) -> Result<Arc<dyn DeviceBackend>, PlatformError> {
        Ok(Arc::new(KmdBackend::open(interface_id)?))
    }
}

/// Discover the cluster behind the local PCI devices with a progress spinner on stderr.
pub fn discover(options: TopologyDiscoveryOptions) -> Result<DiscoveredCluster, PlatformError> {
    let chip_detect_bar = indicatif::ProgressBar::new_spinner().with_style(
        indicatif::ProgressStyle::default_spinner()
            .template("{spinner:.green} Discovering chips (found {pos}) {msg}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner()),
    );

    let mut callback = |event: DiscoveryEvent| match event {
        DiscoveryEvent::PciChip { interface_id, .. } => {
            chip_detect_bar.inc(1);
            chip_detect_bar.set_message(format!("opened pci device {interface_id}"));
        }
        DiscoveryEvent::RemoteChip { location, via, .. } => {
            chip_detect_bar.inc(1);
            chip_detect_bar.set_message(format!("reached {location} through pci device {via}"));
        }
        DiscoveryEvent::LinkSkipped { channel, .. } => {
            chip_detect_bar.set_message(format!("skipped ethernet channel {channel}"));
        }
        DiscoveryEvent::Done { chips } => {
            chip_detect_bar.finish_with_message(format!("done, {chips} chips"));
        }
    };

    let enumerator = KmdEnumerator;
    TopologyDiscovery::new(&enumerator, options).discover_with(&mut callback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(not(feature = "test_hardware"), ignore = "Requires hardware")]
    fn enumerate_local_devices() {
        let devices = KmdEnumerator
            .enumerate_devices_info(&BTreeSet::new())
            .unwrap();
        assert!(!devices.is_empty());
        for (id, info) in devices {
            assert_eq!(id, info.interface_id);
            assert_eq!(info.vendor_id, 0x1e52);
        }
    }

    #[test]
    #[cfg_attr(not(feature = "test_hardware"), ignore = "Requires hardware")]
    fn discover_local_cluster() {
        let cluster = discover(TopologyDiscoveryOptions::default()).unwrap();
        let desc = &cluster.descriptor;
        assert!(!desc.get_chips_with_mmio().is_empty());
        for chip in desc.get_all_chips() {
            assert!(desc.get_closest_mmio_capable_chip(chip).is_ok());
        }
    }
}
