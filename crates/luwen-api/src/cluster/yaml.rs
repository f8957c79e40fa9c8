// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cluster descriptor files.
//!
//! ```yaml
//! arch: {0: wormhole_b0, 1: wormhole_b0}
//! chips: {0: [0, 0, 0, 0], 1: [1, 0, 0, 0]}
//! chip_unique_ids: {0: 1234, 1: 5678}
//! ethernet_connections:
//!   - [{chip: 0, chan: 8}, {chip: 1, chan: 0}]
//! ethernet_connections_to_remote_devices: []
//! chips_with_mmio: [{0: 0}]
//! io_device_type: PCIe
//! harvesting: {0: {noc_translation: true, harvest_mask: 0}}
//! chip_to_boardtype: {0: n300, 1: n300}
//! boards:
//!   - [{board_id: 1234}, {board_type: n300}, {chips: [0, 1]}]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use luwen_core::{Arch, BoardType, ChipId, EthCoord, EthernetChannel, HarvestingMasks, IoDeviceType};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PlatformError;

use super::{Chip, ClusterDescriptor, EthernetEndpoint};

#[derive(Debug, Serialize, Deserialize)]
struct RemoteEndpoint {
    remote_chip_id: u64,
    chan: EthernetChannel,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum MmioEntry {
    Mapped(BTreeMap<ChipId, usize>),
    Chip(ChipId),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HarvestingEntry {
    #[serde(default)]
    noc_translation: bool,
    #[serde(default)]
    harvest_mask: u32,
    #[serde(default)]
    dram_harvesting_mask: u32,
    #[serde(default)]
    eth_harvesting_mask: u32,
    #[serde(default)]
    pcie_harvesting_mask: u32,
    #[serde(default)]
    l2cpu_harvesting_mask: u32,
}

impl HarvestingEntry {
    fn masks(&self) -> HarvestingMasks {
        HarvestingMasks {
            tensix: self.harvest_mask,
            dram: self.dram_harvesting_mask,
            eth: self.eth_harvesting_mask,
            pcie: self.pcie_harvesting_mask,
            l2cpu: self.l2cpu_harvesting_mask,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum BoardField {
    Id { board_id: u64 },
    Type { board_type: BoardType },
    Chips { chips: Vec<ChipId> },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DescriptorFile {
    arch: BTreeMap<ChipId, Arch>,
    /// [x, y, rack, shelf]
    chips: BTreeMap<ChipId, [u8; 4]>,
    #[serde(default)]
    chip_unique_ids: BTreeMap<ChipId, u64>,
    #[serde(default)]
    ethernet_connections: Vec<[EthernetEndpoint; 2]>,
    #[serde(default)]
    ethernet_connections_to_remote_devices: Vec<(EthernetEndpoint, RemoteEndpoint)>,
    #[serde(default)]
    chips_with_mmio: Vec<MmioEntry>,
    #[serde(default)]
    io_device_type: IoDeviceType,
    #[serde(default)]
    harvesting: BTreeMap<ChipId, HarvestingEntry>,
    #[serde(default)]
    chip_to_boardtype: BTreeMap<ChipId, BoardType>,
    #[serde(default)]
    boards: Vec<Vec<BoardField>>,
}

impl From<&ClusterDescriptor> for DescriptorFile {
    fn from(desc: &ClusterDescriptor) -> Self {
        let mut file = DescriptorFile {
            io_device_type: desc.io_device_type(),
            ..Default::default()
        };

        for chip in desc.chips() {
            let loc = chip.location;
            file.arch.insert(chip.id, chip.arch);
            file.chips.insert(chip.id, [loc.x, loc.y, loc.rack, loc.shelf]);
            file.chip_unique_ids.insert(chip.id, chip.unique_id);
            file.harvesting.insert(
                chip.id,
                HarvestingEntry {
                    noc_translation: chip.noc_translation_enabled,
                    harvest_mask: chip.harvesting.tensix,
                    dram_harvesting_mask: chip.harvesting.dram,
                    eth_harvesting_mask: chip.harvesting.eth,
                    pcie_harvesting_mask: chip.harvesting.pcie,
                    l2cpu_harvesting_mask: chip.harvesting.l2cpu,
                },
            );
            file.chip_to_boardtype.insert(chip.id, chip.board_type);
            if let Some(pci) = chip.pci_interface {
                file.chips_with_mmio
                    .push(MmioEntry::Mapped(BTreeMap::from([(chip.id, pci)])));
            }
        }

        file.ethernet_connections = desc
            .ethernet_links()
            .into_iter()
            .map(|link| [link.a, link.b])
            .collect();
        file.ethernet_connections_to_remote_devices = desc
            .remote_device_links()
            .into_iter()
            .map(|link| {
                (
                    link.local,
                    RemoteEndpoint {
                        remote_chip_id: link.remote_unique_id,
                        chan: link.remote_channel,
                    },
                )
            })
            .collect();
        file.boards = desc
            .boards()
            .into_iter()
            .map(|board| {
                vec![
                    BoardField::Id {
                        board_id: board.board_id,
                    },
                    BoardField::Type {
                        board_type: board.board_type,
                    },
                    BoardField::Chips {
                        chips: board.chips.into_iter().collect(),
                    },
                ]
            })
            .collect();

        file
    }
}

impl TryFrom<DescriptorFile> for ClusterDescriptor {
    type Error = PlatformError;

    fn try_from(file: DescriptorFile) -> Result<Self, Self::Error> {
        let mut mmio = BTreeMap::new();
        for entry in &file.chips_with_mmio {
            match entry {
                MmioEntry::Mapped(map) => mmio.extend(map.iter().map(|(c, p)| (*c, *p))),
                MmioEntry::Chip(chip) => {
                    mmio.insert(*chip, *chip as usize);
                }
            }
        }

        let mut active: BTreeMap<ChipId, BTreeSet<EthernetChannel>> = BTreeMap::new();
        for [a, b] in &file.ethernet_connections {
            active.entry(a.chip).or_default().insert(a.channel);
            active.entry(b.chip).or_default().insert(b.channel);
        }
        for (local, _) in &file.ethernet_connections_to_remote_devices {
            active.entry(local.chip).or_default().insert(local.channel);
        }

        let mut builder = ClusterDescriptor::builder(file.io_device_type);
        for (id, arch) in &file.arch {
            let location = file
                .chips
                .get(id)
                .map(|[x, y, rack, shelf]| EthCoord::new(*x, *y, *rack, *shelf))
                .unwrap_or_default();
            let unique_id = file.chip_unique_ids.get(id).copied().unwrap_or_default();
            let harvesting = file.harvesting.get(id);
            let board_type = match file.chip_to_boardtype.get(id) {
                Some(board_type) => *board_type,
                None => {
                    warn!("No board type for chip {id}, defaulting to unknown");
                    BoardType::Unknown
                }
            };
            let pci_interface = mmio.get(id).copied();

            builder.add_chip(Chip {
                id: *id,
                unique_id,
                arch: *arch,
                board_type,
                board_id: pci_interface.map(|_| unique_id),
                location,
                pci_interface,
                active_eth_channels: active.remove(id).unwrap_or_default(),
                harvesting: harvesting.map(HarvestingEntry::masks).unwrap_or_default(),
                noc_translation_enabled: harvesting.map(|h| h.noc_translation).unwrap_or(false),
            })?;
        }

        if let Some(chip) = mmio.keys().find(|chip| !file.arch.contains_key(chip)) {
            return Err(PlatformError::Descriptor(format!(
                "chips_with_mmio lists chip {chip} which has no arch entry"
            )));
        }

        for [a, b] in file.ethernet_connections {
            builder.connect(a, b)?;
        }
        for (local, remote) in file.ethernet_connections_to_remote_devices {
            builder.connect_remote(local, remote.remote_chip_id, remote.chan)?;
        }

        builder.build()
    }
}

impl ClusterDescriptor {
    pub fn serialize_to_yaml(&self) -> Result<String, PlatformError> {
        Ok(serde_yaml::to_string(&DescriptorFile::from(self))?)
    }

    pub fn serialize_to_file(&self, path: impl AsRef<Path>) -> Result<(), PlatformError> {
        std::fs::write(path, self.serialize_to_yaml()?)?;
        Ok(())
    }
}

pub fn load_from_yaml(content: &str) -> Result<ClusterDescriptor, PlatformError> {
    let file: DescriptorFile = serde_yaml::from_str(content)?;
    ClusterDescriptor::try_from(file)
}

pub fn load_from_file(path: impl AsRef<Path>) -> Result<ClusterDescriptor, PlatformError> {
    load_from_yaml(&std::fs::read_to_string(path)?)
}
