// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! The chip graph produced by topology discovery.

pub mod yaml;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use luwen_core::{Arch, BoardType, ChipId, EthCoord, EthernetChannel, HarvestingMasks, IoDeviceType};
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::eth_addr::WH_ETH_CORES;

pub use yaml::{load_from_file, load_from_yaml};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chip {
    pub id: ChipId,
    pub unique_id: u64,
    pub arch: Arch,
    pub board_type: BoardType,
    /// Only known for chips on the host bus.
    pub board_id: Option<u64>,
    pub location: EthCoord,
    /// Host bus device number, present exactly when the chip is mmio capable.
    pub pci_interface: Option<usize>,
    pub active_eth_channels: BTreeSet<EthernetChannel>,
    pub harvesting: HarvestingMasks,
    pub noc_translation_enabled: bool,
}

impl Chip {
    pub fn is_mmio_capable(&self) -> bool {
        self.pci_interface.is_some()
    }
}

/// Number of ethernet channels a chip of `arch` exposes.
pub fn eth_channel_count(arch: Arch) -> EthernetChannel {
    match arch {
        Arch::Wormhole => WH_ETH_CORES.len() as EthernetChannel,
        Arch::Blackhole => 14,
        Arch::Grayskull => 0,
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EthernetEndpoint {
    pub chip: ChipId,
    #[serde(rename = "chan")]
    pub channel: EthernetChannel,
}

impl EthernetEndpoint {
    pub fn new(chip: ChipId, channel: EthernetChannel) -> Self {
        EthernetEndpoint { chip, channel }
    }
}

/// An undirected link, stored with the lower endpoint first.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct EthernetConnection {
    pub a: EthernetEndpoint,
    pub b: EthernetEndpoint,
}

impl EthernetConnection {
    pub fn new(a: EthernetEndpoint, b: EthernetEndpoint) -> Self {
        if a <= b {
            EthernetConnection { a, b }
        } else {
            EthernetConnection { a: b, b: a }
        }
    }

    /// The far side as seen from `chip`.
    pub fn peer_of(&self, chip: ChipId) -> Option<EthernetEndpoint> {
        if self.a.chip == chip {
            Some(self.b)
        } else if self.b.chip == chip {
            Some(self.a)
        } else {
            None
        }
    }
}

/// A link into a chip that is outside of this cluster, identified by its unique id.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct RemoteDeviceConnection {
    pub local: EthernetEndpoint,
    pub remote_unique_id: u64,
    pub remote_channel: EthernetChannel,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Board {
    pub board_id: u64,
    pub board_type: BoardType,
    pub chips: BTreeSet<ChipId>,
}

/// Board serial shared by all chips of one board.
pub fn board_serial(unique_id: u64) -> u64 {
    unique_id & 0xFFFF_FFFF
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterDescriptor {
    chips: BTreeMap<ChipId, Chip>,
    connections: BTreeMap<ChipId, BTreeMap<EthernetChannel, EthernetEndpoint>>,
    remote_connections: BTreeMap<ChipId, BTreeMap<EthernetChannel, (u64, EthernetChannel)>>,
    io_device_type: IoDeviceType,
    closest_mmio: BTreeMap<ChipId, ChipId>,
}

#[derive(Debug, Default)]
pub struct ClusterDescriptorBuilder {
    desc: ClusterDescriptor,
}

impl ClusterDescriptorBuilder {
    pub fn new(io_device_type: IoDeviceType) -> Self {
        ClusterDescriptorBuilder {
            desc: ClusterDescriptor {
                io_device_type,
                ..Default::default()
            },
        }
    }

    pub fn add_chip(&mut self, chip: Chip) -> Result<&mut Self, PlatformError> {
        if self.desc.chips.contains_key(&chip.id) {
            return Err(PlatformError::Descriptor(format!(
                "chip {} added twice",
                chip.id
            )));
        }
        self.desc.connections.entry(chip.id).or_default();
        self.desc.chips.insert(chip.id, chip);
        Ok(self)
    }

    fn bind_channel(
        &mut self,
        from: EthernetEndpoint,
        to: EthernetEndpoint,
    ) -> Result<(), PlatformError> {
        let channels = self.desc.connections.entry(from.chip).or_default();
        match channels.get(&from.channel) {
            Some(existing) if *existing != to => Err(PlatformError::Descriptor(format!(
                "channel {} of chip {} is connected to both chip {} channel {} and chip {} channel {}",
                from.channel, from.chip, existing.chip, existing.channel, to.chip, to.channel
            ))),
            _ => {
                channels.insert(from.channel, to);
                Ok(())
            }
        }
    }

    /// Recording the same link twice is allowed, reusing a channel for a different link is not.
    pub fn connect(
        &mut self,
        a: EthernetEndpoint,
        b: EthernetEndpoint,
    ) -> Result<&mut Self, PlatformError> {
        for endpoint in [a, b] {
            if !self.desc.chips.contains_key(&endpoint.chip) {
                return Err(PlatformError::Descriptor(format!(
                    "connection references unknown chip {}",
                    endpoint.chip
                )));
            }
        }
        if a == b {
            return Err(PlatformError::Descriptor(format!(
                "channel {} of chip {} is connected to itself",
                a.channel, a.chip
            )));
        }

        self.bind_channel(a, b)?;
        self.bind_channel(b, a)?;
        Ok(self)
    }

    pub fn connect_remote(
        &mut self,
        local: EthernetEndpoint,
        remote_unique_id: u64,
        remote_channel: EthernetChannel,
    ) -> Result<&mut Self, PlatformError> {
        if !self.desc.chips.contains_key(&local.chip) {
            return Err(PlatformError::Descriptor(format!(
                "connection references unknown chip {}",
                local.chip
            )));
        }
        self.desc
            .remote_connections
            .entry(local.chip)
            .or_default()
            .insert(local.channel, (remote_unique_id, remote_channel));
        Ok(self)
    }

    /// Compute closest mmio routing and freeze the graph.
    pub fn build(mut self) -> Result<ClusterDescriptor, PlatformError> {
        for chip in self.desc.chips.values() {
            if let Some(other) = self.desc.chips.values().find(|other| {
                other.id != chip.id
                    && other.pci_interface.is_some()
                    && other.pci_interface == chip.pci_interface
            }) {
                return Err(PlatformError::Descriptor(format!(
                    "chips {} and {} share pci device {:?}",
                    chip.id, other.id, chip.pci_interface
                )));
            }
        }

        self.desc.closest_mmio = self.desc.compute_closest_mmio();
        if let Some(chip) = self
            .desc
            .chips
            .keys()
            .find(|chip| !self.desc.closest_mmio.contains_key(chip))
        {
            return Err(PlatformError::Descriptor(format!(
                "chip {chip} is not connected to any mmio capable chip"
            )));
        }
        Ok(self.desc)
    }
}

impl ClusterDescriptor {
    pub fn builder(io_device_type: IoDeviceType) -> ClusterDescriptorBuilder {
        ClusterDescriptorBuilder::new(io_device_type)
    }

    /// `count` directly attached chips with no links between them.
    pub fn create_mock_cluster(arch: Arch, count: usize) -> Result<Self, PlatformError> {
        let (board_type, harvesting) = match arch {
            Arch::Wormhole => (BoardType::N150, HarvestingMasks::default()),
            Arch::Blackhole => (
                BoardType::Unknown,
                HarvestingMasks {
                    eth: 0x120,
                    ..Default::default()
                },
            ),
            Arch::Grayskull => (BoardType::Unknown, HarvestingMasks::default()),
        };

        let mut builder = ClusterDescriptor::builder(IoDeviceType::Pcie);
        for id in 0..count {
            let chip_id = id as ChipId;
            builder.add_chip(Chip {
                id: chip_id,
                unique_id: id as u64,
                arch,
                board_type,
                board_id: Some(id as u64),
                location: EthCoord::new(id as u8, 0, 0, 0),
                pci_interface: Some(id),
                active_eth_channels: BTreeSet::new(),
                harvesting,
                noc_translation_enabled: false,
            })?;
        }
        builder.build()
    }

    /// Breadth first distances from `source` over the link graph.
    fn distances_from(&self, source: ChipId) -> BTreeMap<ChipId, usize> {
        let mut distances = BTreeMap::from([(source, 0)]);
        let mut queue = VecDeque::from([source]);

        while let Some(chip) = queue.pop_front() {
            let distance = distances[&chip];
            let Some(channels) = self.connections.get(&chip) else {
                continue;
            };
            for peer in channels.values() {
                if !distances.contains_key(&peer.chip) {
                    distances.insert(peer.chip, distance + 1);
                    queue.push_back(peer.chip);
                }
            }
        }

        distances
    }

    fn compute_closest_mmio(&self) -> BTreeMap<ChipId, ChipId> {
        let per_mmio: Vec<(ChipId, BTreeMap<ChipId, usize>)> = self
            .chips
            .values()
            .filter(|chip| chip.is_mmio_capable())
            .map(|chip| (chip.id, self.distances_from(chip.id)))
            .collect();

        let mut closest = BTreeMap::new();
        for chip in self.chips.keys() {
            // Lowest distance first, then lowest chip id.
            let best = per_mmio
                .iter()
                .filter_map(|(mmio, distances)| distances.get(chip).map(|d| (*d, *mmio)))
                .min();
            if let Some((_, mmio)) = best {
                closest.insert(*chip, mmio);
            }
        }
        closest
    }

    pub fn chip(&self, chip: ChipId) -> Option<&Chip> {
        self.chips.get(&chip)
    }

    pub fn chips(&self) -> impl Iterator<Item = &Chip> {
        self.chips.values()
    }

    fn get(&self, chip: ChipId) -> Result<&Chip, PlatformError> {
        self.chips.get(&chip).ok_or(PlatformError::ChipNotFound(chip))
    }

    pub fn io_device_type(&self) -> IoDeviceType {
        self.io_device_type
    }

    /// All chips in ascending id order.
    pub fn get_all_chips(&self) -> Vec<ChipId> {
        self.chips.keys().copied().collect()
    }

    pub fn get_number_of_chips(&self) -> usize {
        self.chips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chips.is_empty()
    }

    pub fn is_chip_mmio_capable(&self, chip: ChipId) -> bool {
        self.chips
            .get(&chip)
            .map(Chip::is_mmio_capable)
            .unwrap_or(false)
    }

    pub fn is_chip_remote(&self, chip: ChipId) -> bool {
        self.chips
            .get(&chip)
            .map(|c| !c.is_mmio_capable())
            .unwrap_or(false)
    }

    /// Nearest directly attached chip by hop count, lower chip id on ties.
    pub fn get_closest_mmio_capable_chip(&self, chip: ChipId) -> Result<ChipId, PlatformError> {
        self.get(chip)?;
        self.closest_mmio.get(&chip).copied().ok_or_else(|| {
            PlatformError::Descriptor(format!(
                "chip {chip} is not connected to any mmio capable chip"
            ))
        })
    }

    /// Mmio capable chips first, relative order otherwise preserved.
    pub fn get_chips_local_first(&self, chips: &[ChipId]) -> Result<Vec<ChipId>, PlatformError> {
        for chip in chips {
            self.get(*chip)?;
        }

        let (mut local, remote): (Vec<ChipId>, Vec<ChipId>) = chips
            .iter()
            .copied()
            .partition(|chip| self.is_chip_mmio_capable(*chip));
        local.extend(remote);
        Ok(local)
    }

    pub fn get_chip_location(&self, chip: ChipId) -> Option<EthCoord> {
        self.chips.get(&chip).map(|c| c.location)
    }

    pub fn get_chip_locations(&self) -> BTreeMap<ChipId, EthCoord> {
        self.chips
            .values()
            .map(|chip| (chip.id, chip.location))
            .collect()
    }

    pub fn get_chip_by_location(&self, location: &EthCoord) -> Option<ChipId> {
        self.chips
            .values()
            .find(|chip| {
                (chip.location.x, chip.location.y, chip.location.rack, chip.location.shelf)
                    == (location.x, location.y, location.rack, location.shelf)
            })
            .map(|chip| chip.id)
    }

    /// Per chip map of channel to the endpoint on the other side. Every link appears once from
    /// each side.
    pub fn get_ethernet_connections(
        &self,
    ) -> &BTreeMap<ChipId, BTreeMap<EthernetChannel, EthernetEndpoint>> {
        &self.connections
    }

    /// Every link exactly once.
    pub fn ethernet_links(&self) -> Vec<EthernetConnection> {
        let links: BTreeSet<EthernetConnection> = self
            .connections
            .iter()
            .flat_map(|(chip, channels)| {
                channels.iter().map(move |(channel, peer)| {
                    EthernetConnection::new(EthernetEndpoint::new(*chip, *channel), *peer)
                })
            })
            .collect();
        links.into_iter().collect()
    }

    pub fn get_ethernet_connections_to_remote_devices(
        &self,
    ) -> &BTreeMap<ChipId, BTreeMap<EthernetChannel, (u64, EthernetChannel)>> {
        &self.remote_connections
    }

    pub fn remote_device_links(&self) -> Vec<RemoteDeviceConnection> {
        self.remote_connections
            .iter()
            .flat_map(|(chip, channels)| {
                channels
                    .iter()
                    .map(move |(channel, (remote_unique_id, remote_channel))| {
                        RemoteDeviceConnection {
                            local: EthernetEndpoint::new(*chip, *channel),
                            remote_unique_id: *remote_unique_id,
                            remote_channel: *remote_channel,
                        }
                    })
            })
            .collect()
    }

    /// Chip id to host bus device number.
    pub fn get_chips_with_mmio(&self) -> BTreeMap<ChipId, usize> {
        self.chips
            .values()
            .filter_map(|chip| chip.pci_interface.map(|pci| (chip.id, pci)))
            .collect()
    }

    pub fn ethernet_core_has_active_ethernet_link(
        &self,
        chip: ChipId,
        channel: EthernetChannel,
    ) -> bool {
        self.connections
            .get(&chip)
            .is_some_and(|channels| channels.contains_key(&channel))
            || self
                .remote_connections
                .get(&chip)
                .is_some_and(|channels| channels.contains_key(&channel))
    }

    pub fn get_chip_and_channel_of_remote_ethernet_core(
        &self,
        chip: ChipId,
        channel: EthernetChannel,
    ) -> Option<(ChipId, EthernetChannel)> {
        let peer = self.connections.get(&chip)?.get(&channel)?;
        self.chips
            .contains_key(&peer.chip)
            .then_some((peer.chip, peer.channel))
    }

    /// (channel on `first`, channel on `second`) for every direct link.
    pub fn get_directly_connected_ethernet_channels_between_chips(
        &self,
        first: ChipId,
        second: ChipId,
    ) -> Vec<(EthernetChannel, EthernetChannel)> {
        if !self.chips.contains_key(&second) {
            return Vec::new();
        }
        self.connections
            .get(&first)
            .map(|channels| {
                channels
                    .iter()
                    .filter(|(_, peer)| peer.chip == second)
                    .map(|(channel, peer)| (*channel, peer.channel))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_active_eth_channels(
        &self,
        chip: ChipId,
    ) -> Result<BTreeSet<EthernetChannel>, PlatformError> {
        Ok(self.get(chip)?.active_eth_channels.clone())
    }

    pub fn get_idle_eth_channels(
        &self,
        chip: ChipId,
    ) -> Result<BTreeSet<EthernetChannel>, PlatformError> {
        let chip = self.get(chip)?;
        Ok((0..eth_channel_count(chip.arch))
            .filter(|channel| !chip.active_eth_channels.contains(channel))
            .collect())
    }

    pub fn get_harvesting_masks(&self, chip: ChipId) -> Result<HarvestingMasks, PlatformError> {
        Ok(self.get(chip)?.harvesting)
    }

    pub fn get_noc_translation_enabled(&self, chip: ChipId) -> Result<bool, PlatformError> {
        Ok(self.get(chip)?.noc_translation_enabled)
    }

    pub fn get_board_type(&self, chip: ChipId) -> Result<BoardType, PlatformError> {
        Ok(self.get(chip)?.board_type)
    }

    pub fn get_arch(&self, chip: ChipId) -> Result<Arch, PlatformError> {
        Ok(self.get(chip)?.arch)
    }

    /// Architecture of the cluster, `None` when there are no chips.
    pub fn arch(&self) -> Option<Arch> {
        self.chips.values().next().map(|chip| chip.arch)
    }

    pub fn get_chip_unique_ids(&self) -> BTreeMap<ChipId, u64> {
        self.chips
            .values()
            .map(|chip| (chip.id, chip.unique_id))
            .collect()
    }

    /// Mmio chip to every chip it is the closest mmio chip of, itself included.
    pub fn get_chips_grouped_by_closest_mmio(&self) -> BTreeMap<ChipId, BTreeSet<ChipId>> {
        let mut groups: BTreeMap<ChipId, BTreeSet<ChipId>> = BTreeMap::new();
        for (chip, mmio) in &self.closest_mmio {
            groups.entry(*mmio).or_default().insert(*chip);
        }
        groups
    }

    /// Chips grouped by the board they sit on.
    pub fn boards(&self) -> Vec<Board> {
        let mut boards: BTreeMap<u64, Board> = BTreeMap::new();
        for chip in self.chips.values() {
            let board_id = board_serial(chip.unique_id);
            boards
                .entry(board_id)
                .or_insert_with(|| Board {
                    board_id,
                    board_type: chip.board_type,
                    chips: BTreeSet::new(),
                })
                .chips
                .insert(chip.id);
        }
        boards.into_values().collect()
    }
}
