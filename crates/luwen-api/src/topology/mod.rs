// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Build a [`ClusterDescriptor`] by walking the ethernet links out of every PCI attached chip.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use luwen_core::{
    Arch, BoardType, ChipId, EthCoord, EthernetChannel, HarvestingMasks, IoDeviceType,
};
use tracing::{debug, info, warn};

use crate::cluster::{Chip, ClusterDescriptor, EthernetEndpoint};
use crate::device::arc::{ArcMsg, ArcMsgOptions};
use crate::device::{LocalDevice, PciEnumerator, RemoteDevice, TTDevice};
use crate::error::PlatformError;
use crate::eth_addr::{
    decode_local_coord, decode_remote_coord, decode_remote_eth_core, eth_channel_of_core,
    EthAddresses, ETH_FW_VERSION_ADDR, ETH_TRAINED, PORT_UNCONNECTED, PORT_UNKNOWN, WH_ETH_CORES,
};
use crate::remote::RemoteTransportConfig;

/// NIU configuration register of the tensix at (0, 0).
pub const NIU_CFG_0: u64 = 0x1_000A_0100;
pub const NOC_TRANSLATION_BIT: u32 = 1 << 14;

#[derive(Clone, Debug)]
pub struct TopologyDiscoveryOptions {
    /// Only report the chips on the host bus.
    pub no_remote_discovery: bool,
    /// Check link training once instead of polling for it.
    pub no_wait_for_eth_training: bool,
    /// Extra polls of the training status before a link is given up on.
    pub retrain_eth_count: u32,
    /// PCI devices to seed the walk from, all of them when empty.
    pub target_devices: BTreeSet<usize>,
    pub device_type: IoDeviceType,
    pub eth_poll_interval: Duration,
    pub transport: RemoteTransportConfig,
}

impl Default for TopologyDiscoveryOptions {
    fn default() -> Self {
        TopologyDiscoveryOptions {
            no_remote_discovery: false,
            no_wait_for_eth_training: false,
            retrain_eth_count: 3,
            target_devices: BTreeSet::new(),
            device_type: IoDeviceType::Pcie,
            eth_poll_interval: Duration::from_millis(10),
            transport: RemoteTransportConfig::default(),
        }
    }
}

impl TopologyDiscoveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_remote_discovery(mut self, value: bool) -> Self {
        self.no_remote_discovery = value;
        self
    }

    pub fn no_wait_for_eth_training(mut self, value: bool) -> Self {
        self.no_wait_for_eth_training = value;
        self
    }

    pub fn retrain_eth_count(mut self, count: u32) -> Self {
        self.retrain_eth_count = count;
        self
    }

    pub fn target_devices(mut self, devices: impl IntoIterator<Item = usize>) -> Self {
        self.target_devices = devices.into_iter().collect();
        self
    }

    pub fn device_type(mut self, device_type: IoDeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn eth_poll_interval(mut self, interval: Duration) -> Self {
        self.eth_poll_interval = interval;
        self
    }

    pub fn transport_timeout(mut self, timeout: Duration) -> Self {
        self.transport.timeout = timeout;
        self
    }

    fn training_attempts(&self) -> u32 {
        if self.no_wait_for_eth_training {
            1
        } else {
            self.retrain_eth_count + 1
        }
    }
}

/// What the far end of a trained link reports about itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Neighbour {
    pub location: EthCoord,
    pub channel: EthernetChannel,
    pub unique_id: u64,
    /// Zero for boards without a PCI attached chip.
    pub board_type: u32,
}

/// Outcome of checking one ethernet channel.
#[derive(Debug)]
pub enum LinkProbe {
    Trained(Neighbour),
    /// Still not trained after every allowed poll.
    Untrained,
    /// The chip could not be asked.
    Unreachable(PlatformError),
}

/// Progress reports handed to the discovery callback.
#[derive(Clone, Copy, Debug)]
pub enum DiscoveryEvent {
    PciChip {
        interface_id: usize,
        unique_id: u64,
    },
    RemoteChip {
        location: EthCoord,
        unique_id: u64,
        /// PCI device whose tunnel reaches the chip.
        via: usize,
    },
    LinkSkipped {
        unique_id: u64,
        channel: EthernetChannel,
    },
    Done {
        chips: usize,
    },
}

/// Result of a discovery run, every chip already initialized.
pub struct DiscoveredCluster {
    pub descriptor: ClusterDescriptor,
    pub devices: BTreeMap<ChipId, TTDevice>,
}

impl DiscoveredCluster {
    pub fn device(&self, chip: ChipId) -> Result<&TTDevice, PlatformError> {
        self.devices
            .get(&chip)
            .ok_or(PlatformError::ChipNotFound(chip))
    }
}

/// Read a neighbour's identity from the erisc words of the local end of the link.
pub fn read_neighbour(
    device: &TTDevice,
    eth: &EthAddresses,
    core: (u8, u8),
) -> Result<Neighbour, PlatformError> {
    let rack_word = device.noc_read32(core, eth.remote_rack())?;
    let shelf_word = device.noc_read32(core, eth.remote_shelf())?;
    let lo_addr = eth.result_word(eth.erisc_remote_board_id_lo_offset);
    let lo = device.noc_read32(core, lo_addr)?;
    let hi = device.noc_read32(core, lo_addr + 4)?;
    let board_type = device.noc_read32(core, eth.result_word(eth.erisc_remote_board_type_offset))?;

    let remote_core = decode_remote_eth_core(shelf_word);
    let channel = eth_channel_of_core(remote_core).ok_or_else(|| {
        PlatformError::from(format!(
            "neighbour of ethernet core ({}, {}) reports ({}, {}) which is not an ethernet core",
            core.0, core.1, remote_core.0, remote_core.1
        ))
    })?;

    Ok(Neighbour {
        location: decode_remote_coord(rack_word, shelf_word),
        channel,
        unique_id: ((hi as u64) << 32) | lo as u64,
        board_type,
    })
}

/// Per chip state collected while walking.
struct Found {
    device: TTDevice,
    location: EthCoord,
    unique_id: u64,
    pci_interface: Option<usize>,
    arch: Arch,
    eth: Option<EthAddresses>,
    active: BTreeSet<EthernetChannel>,
    /// Index of the PCI chip whose tunnel reaches this one.
    gateway: usize,
}

pub struct TopologyDiscovery<'a> {
    enumerator: &'a dyn PciEnumerator,
    options: TopologyDiscoveryOptions,
}

impl<'a> TopologyDiscovery<'a> {
    pub fn new(enumerator: &'a dyn PciEnumerator, options: TopologyDiscoveryOptions) -> Self {
        TopologyDiscovery {
            enumerator,
            options,
        }
    }

    pub fn options(&self) -> &TopologyDiscoveryOptions {
        &self.options
    }

    pub fn discover(&self) -> Result<DiscoveredCluster, PlatformError> {
        self.discover_with(&mut |_| {})
    }

    /// Breadth first walk from the PCI chips. Failures on one link only leave out the chips
    /// behind that link.
    pub fn discover_with(
        &self,
        callback: &mut impl FnMut(DiscoveryEvent),
    ) -> Result<DiscoveredCluster, PlatformError> {
        if self.options.device_type == IoDeviceType::Jtag {
            return Err(PlatformError::unsupported(
                "jtag device access",
                Arch::default(),
            ));
        }

        let interfaces = self
            .enumerator
            .enumerate_devices(&self.options.target_devices)?;
        if interfaces.is_empty() {
            warn!("No PCI devices found, returning an empty cluster");
            callback(DiscoveryEvent::Done { chips: 0 });
            return Ok(DiscoveredCluster {
                descriptor: ClusterDescriptor::builder(self.options.device_type).build()?,
                devices: BTreeMap::new(),
            });
        }

        let mut found: Vec<Found> = Vec::new();
        for interface_id in interfaces {
            match self.open_pci_chip(interface_id, found.len()) {
                Ok(chip) => {
                    if found.iter().any(|other| other.unique_id == chip.unique_id) {
                        warn!(
                            "PCI device {interface_id} reports the same unique id {:#x} as another device, skipping it",
                            chip.unique_id
                        );
                        continue;
                    }
                    callback(DiscoveryEvent::PciChip {
                        interface_id,
                        unique_id: chip.unique_id,
                    });
                    found.push(chip);
                }
                Err(err) => warn!("Skipping PCI device {interface_id}: {err}"),
            }
        }

        let mut links: Vec<(u64, EthernetChannel, u64, EthernetChannel)> = Vec::new();
        let mut remote_links: Vec<(u64, EthernetChannel, u64, EthernetChannel)> = Vec::new();

        let tunnel_cores = if self.options.no_remote_discovery {
            debug!("Remote discovery disabled, only reporting PCI chips");
            HashMap::new()
        } else {
            self.walk(&mut found, &mut links, &mut remote_links, callback)?
        };

        let cluster = self.assemble(found, &links, &remote_links, &tunnel_cores)?;
        info!(
            "Discovered {} chips ({} on the host bus) with {} ethernet links",
            cluster.descriptor.get_number_of_chips(),
            cluster.descriptor.get_chips_with_mmio().len(),
            cluster.descriptor.ethernet_links().len()
        );
        callback(DiscoveryEvent::Done {
            chips: cluster.descriptor.get_number_of_chips(),
        });
        Ok(cluster)
    }

    fn open_pci_chip(&self, interface_id: usize, index: usize) -> Result<Found, PlatformError> {
        let local = Arc::new(LocalDevice::open(self.enumerator, interface_id)?);
        local.init()?;
        let arch = local.arch();
        let device = TTDevice::from(local);

        if !arch.is_wormhole() {
            warn!("PCI device {interface_id} is {arch}, ethernet discovery is only supported on Wormhole");
            return Ok(Found {
                device,
                location: EthCoord::default(),
                unique_id: interface_id as u64,
                pci_interface: Some(interface_id),
                arch,
                eth: None,
                active: BTreeSet::new(),
                gateway: index,
            });
        }

        let eth = self.eth_addresses(&device, interface_id as u64)?;
        let (location, active, unique_id) = match &eth {
            Some(eth) => {
                let location = decode_local_coord(
                    device.noc_read32(WH_ETH_CORES[0], eth.local_coord())?,
                );
                let active = self.active_channels(&device, eth)?;
                let unique_id = match active.first() {
                    Some(channel) => {
                        let core = WH_ETH_CORES[*channel as usize];
                        let lo_addr = eth.result_word(eth.erisc_local_board_id_lo_offset);
                        let lo = device.noc_read32(core, lo_addr)?;
                        let hi = device.noc_read32(core, lo_addr + 4)?;
                        ((hi as u64) << 32) | lo as u64
                    }
                    None => interface_id as u64,
                };
                (location, active, unique_id)
            }
            None => (EthCoord::default(), BTreeSet::new(), interface_id as u64),
        };

        debug!("PCI device {interface_id}: unique id {unique_id:#x} at {location}");
        Ok(Found {
            device,
            location,
            unique_id,
            pci_interface: Some(interface_id),
            arch,
            eth,
            active,
            gateway: index,
        })
    }

    /// `None` when the ethernet firmware is too old to walk through.
    fn eth_addresses(
        &self,
        device: &TTDevice,
        unique_id: u64,
    ) -> Result<Option<EthAddresses>, PlatformError> {
        let version = device.noc_read32(WH_ETH_CORES[0], ETH_FW_VERSION_ADDR)?;
        match EthAddresses::new(version) {
            Ok(eth) => Ok(Some(eth)),
            Err(err) => {
                warn!("Not exploring the links of chip {unique_id:#x}: {err}");
                Ok(None)
            }
        }
    }

    fn active_channels(
        &self,
        device: &TTDevice,
        eth: &EthAddresses,
    ) -> Result<BTreeSet<EthernetChannel>, PlatformError> {
        let mut active = BTreeSet::new();
        for (channel, core) in WH_ETH_CORES.iter().enumerate() {
            let channel = channel as EthernetChannel;
            let status = device.noc_read32(*core, eth.port_status(channel))?;
            if status != PORT_UNKNOWN && status != PORT_UNCONNECTED {
                active.insert(channel);
            }
        }
        Ok(active)
    }

    /// Poll training on `channel` and read who is on the other side.
    pub fn probe_link(
        &self,
        device: &TTDevice,
        eth: &EthAddresses,
        channel: EthernetChannel,
    ) -> LinkProbe {
        let core = WH_ETH_CORES[channel as usize];
        let attempts = self.options.training_attempts();

        for attempt in 0..attempts {
            match device.noc_read32(core, eth.training_status()) {
                Ok(ETH_TRAINED) => {
                    return match read_neighbour(device, eth, core) {
                        Ok(neighbour) => LinkProbe::Trained(neighbour),
                        Err(err) => LinkProbe::Unreachable(err),
                    };
                }
                Ok(_) => {}
                Err(err) => return LinkProbe::Unreachable(err),
            }
            if attempt + 1 < attempts {
                std::thread::sleep(self.options.eth_poll_interval);
            }
        }

        LinkProbe::Untrained
    }

    /// Returns the first trained ethernet core of every PCI chip, keyed by its index in `found`.
    fn walk(
        &self,
        found: &mut Vec<Found>,
        links: &mut Vec<(u64, EthernetChannel, u64, EthernetChannel)>,
        remote_links: &mut Vec<(u64, EthernetChannel, u64, EthernetChannel)>,
        callback: &mut impl FnMut(DiscoveryEvent),
    ) -> Result<HashMap<usize, (u8, u8)>, PlatformError> {
        let local_boards: BTreeSet<u32> = found.iter().map(|chip| chip.unique_id as u32).collect();
        let mut by_uid: HashMap<u64, usize> = found
            .iter()
            .enumerate()
            .map(|(index, chip)| (chip.unique_id, index))
            .collect();
        let mut tunnel_cores: HashMap<usize, (u8, u8)> = HashMap::new();
        let mut queue: VecDeque<usize> = (0..found.len()).collect();

        while let Some(index) = queue.pop_front() {
            let Some(eth) = found[index].eth.clone() else {
                continue;
            };
            let unique_id = found[index].unique_id;
            let gateway = found[index].gateway;
            let channels = found[index].active.clone();

            for channel in channels {
                let neighbour = match self.probe_link(&found[index].device, &eth, channel) {
                    LinkProbe::Trained(neighbour) => neighbour,
                    LinkProbe::Untrained => {
                        warn!(
                            "Chip {unique_id:#x}: {}",
                            PlatformError::LinkNotTrained {
                                chip: index as ChipId,
                                channel
                            }
                        );
                        callback(DiscoveryEvent::LinkSkipped { unique_id, channel });
                        continue;
                    }
                    LinkProbe::Unreachable(err) => {
                        warn!("Skipping channel {channel} of chip {unique_id:#x}: {err}");
                        callback(DiscoveryEvent::LinkSkipped { unique_id, channel });
                        continue;
                    }
                };

                if found[index].pci_interface.is_some() {
                    tunnel_cores
                        .entry(index)
                        .or_insert(WH_ETH_CORES[channel as usize]);
                }

                if !(neighbour.board_type == 0
                    || local_boards.contains(&(neighbour.unique_id as u32)))
                {
                    debug!(
                        "Channel {channel} of chip {unique_id:#x} leads to chip {:#x} on another board",
                        neighbour.unique_id
                    );
                    remote_links.push((unique_id, channel, neighbour.unique_id, neighbour.channel));
                    continue;
                }

                links.push((unique_id, channel, neighbour.unique_id, neighbour.channel));
                if by_uid.contains_key(&neighbour.unique_id) {
                    continue;
                }

                let Some(tunnel_core) = tunnel_cores.get(&gateway).copied() else {
                    warn!("No trained tunnel on the gateway of chip {unique_id:#x}, not following channel {channel}");
                    continue;
                };

                match self.open_remote_chip(found, gateway, tunnel_core, &neighbour) {
                    Ok(chip) => {
                        callback(DiscoveryEvent::RemoteChip {
                            location: chip.location,
                            unique_id: chip.unique_id,
                            via: found[gateway].pci_interface.unwrap_or_default(),
                        });
                        by_uid.insert(chip.unique_id, found.len());
                        queue.push_back(found.len());
                        found.push(chip);
                    }
                    Err(err) => {
                        warn!(
                            "Could not open chip {:#x} at {}: {err}",
                            neighbour.unique_id, neighbour.location
                        );
                        links.pop();
                    }
                }
            }
        }

        Ok(tunnel_cores)
    }

    fn open_remote_chip(
        &self,
        found: &[Found],
        gateway: usize,
        tunnel_core: (u8, u8),
        neighbour: &Neighbour,
    ) -> Result<Found, PlatformError> {
        let local = found[gateway].device.local().clone();
        let remote = RemoteDevice::new(
            local,
            neighbour.location,
            tunnel_core,
            self.options.transport.clone(),
        )?;
        remote.init()?;
        let device = TTDevice::from(remote);

        let eth = self.eth_addresses(&device, neighbour.unique_id)?;
        let active = match &eth {
            Some(eth) => self.active_channels(&device, eth)?,
            None => BTreeSet::new(),
        };

        debug!(
            "Remote chip {:#x} at {} through ethernet core ({}, {})",
            neighbour.unique_id, neighbour.location, tunnel_core.0, tunnel_core.1
        );
        Ok(Found {
            arch: device.arch(),
            device,
            location: neighbour.location,
            unique_id: neighbour.unique_id,
            pci_interface: None,
            eth,
            active,
            gateway,
        })
    }

    fn harvesting(&self, device: &TTDevice, unique_id: u64) -> u32 {
        let options = ArcMsgOptions {
            msg: ArcMsg::GetHarvesting,
            ..Default::default()
        };
        match device.arc_msg(&options).map(|reply| reply.arg()) {
            Ok(Some(mask)) => mask,
            Ok(None) => 0,
            Err(err) => {
                warn!("Could not read the harvesting mask of chip {unique_id:#x}: {err}");
                0
            }
        }
    }

    fn noc_translation(&self, device: &TTDevice, unique_id: u64) -> bool {
        match device.noc_read32((0, 0), NIU_CFG_0) {
            Ok(value) => value & NOC_TRANSLATION_BIT != 0,
            Err(err) => {
                warn!("Could not read the NOC translation setting of chip {unique_id:#x}: {err}");
                false
            }
        }
    }

    /// Number the chips, PCI chips first, and build the descriptor.
    fn assemble(
        &self,
        found: Vec<Found>,
        links: &[(u64, EthernetChannel, u64, EthernetChannel)],
        remote_links: &[(u64, EthernetChannel, u64, EthernetChannel)],
        tunnel_cores: &HashMap<usize, (u8, u8)>,
    ) -> Result<DiscoveredCluster, PlatformError> {
        let mut order: Vec<usize> = (0..found.len()).collect();
        order.sort_by_key(|index| {
            let chip = &found[*index];
            (chip.pci_interface.is_none(), chip.unique_id)
        });

        let ids: HashMap<u64, ChipId> = order
            .iter()
            .enumerate()
            .map(|(id, index)| (found[*index].unique_id, id as ChipId))
            .collect();

        let mut builder = ClusterDescriptor::builder(self.options.device_type);
        let mut slots: Vec<Option<Found>> = found.into_iter().map(Some).collect();
        let mut devices = BTreeMap::new();
        let mut gateways = BTreeMap::new();

        for (id, index) in order.iter().copied().enumerate() {
            let Some(chip) = slots[index].take() else {
                continue;
            };
            let id = id as ChipId;
            let harvesting = if chip.arch.is_wormhole() {
                self.harvesting(&chip.device, chip.unique_id)
            } else {
                0
            };

            builder.add_chip(Chip {
                id,
                unique_id: chip.unique_id,
                arch: chip.arch,
                board_type: BoardType::from_board_id(chip.unique_id),
                board_id: chip.pci_interface.map(|_| chip.unique_id),
                location: chip.location,
                pci_interface: chip.pci_interface,
                active_eth_channels: chip.active,
                harvesting: HarvestingMasks::tensix_only(harvesting),
                noc_translation_enabled: self.noc_translation(&chip.device, chip.unique_id),
            })?;
            if chip.pci_interface.is_none() {
                gateways.insert(id, chip.gateway);
            }
            devices.insert(id, chip.device);
        }

        for (a, channel_a, b, channel_b) in links {
            if let (Some(a), Some(b)) = (ids.get(a), ids.get(b)) {
                builder.connect(
                    EthernetEndpoint::new(*a, *channel_a),
                    EthernetEndpoint::new(*b, *channel_b),
                )?;
            }
        }
        for (a, channel_a, remote, remote_channel) in remote_links {
            if let Some(a) = ids.get(a) {
                builder.connect_remote(
                    EthernetEndpoint::new(*a, *channel_a),
                    *remote,
                    *remote_channel,
                )?;
            }
        }

        let descriptor = builder.build()?;
        for (id, gateway) in gateways {
            let mmio = descriptor.get_closest_mmio_capable_chip(id)?;
            let mmio_index = order[mmio as usize];
            if mmio_index != gateway {
                let tunnel_core = tunnel_cores.get(&mmio_index).copied();
                self.rebind(&descriptor, &mut devices, id, mmio, tunnel_core);
            }
        }

        Ok(DiscoveredCluster {
            descriptor,
            devices,
        })
    }

    /// Move the tunnel of remote chip `id` onto its closest mmio chip. The chip keeps the
    /// device it was discovered through when that fails.
    fn rebind(
        &self,
        descriptor: &ClusterDescriptor,
        devices: &mut BTreeMap<ChipId, TTDevice>,
        id: ChipId,
        mmio: ChipId,
        tunnel_core: Option<(u8, u8)>,
    ) {
        let (Some(chip), Some(gateway), Some(tunnel_core)) =
            (descriptor.chip(id), devices.get(&mmio), tunnel_core)
        else {
            warn!("No tunnel on chip {mmio} to reach chip {id}, keeping its discovery route");
            return;
        };

        let remote = RemoteDevice::new(
            gateway.local().clone(),
            chip.location,
            tunnel_core,
            self.options.transport.clone(),
        )
        .and_then(|remote| remote.init().map(|_| remote));
        match remote {
            Ok(remote) => {
                debug!(
                    "Chip {id} tunnels through chip {mmio} ethernet core ({}, {})",
                    tunnel_core.0, tunnel_core.1
                );
                devices.insert(id, TTDevice::from(remote));
            }
            Err(err) => {
                warn!("Could not move chip {id} onto chip {mmio}, keeping its discovery route: {err}")
            }
        }
    }
}

/// Run discovery with `options` against the devices `enumerator` reports.
pub fn discover(
    enumerator: &dyn PciEnumerator,
    options: TopologyDiscoveryOptions,
) -> Result<DiscoveredCluster, PlatformError> {
    TopologyDiscovery::new(enumerator, options).discover()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{n300_unique_id, MockChip, MockFabric};

    fn fast() -> TopologyDiscoveryOptions {
        TopologyDiscoveryOptions::new()
            .retrain_eth_count(2)
            .eth_poll_interval(Duration::from_millis(1))
            .transport_timeout(Duration::from_millis(200))
    }

    #[test]
    fn n300_pair() {
        let fabric = MockFabric::n300_boards(1).unwrap();
        let cluster = discover(&fabric.enumerator(), fast()).unwrap();
        let desc = &cluster.descriptor;

        assert_eq!(desc.get_all_chips(), vec![0, 1]);
        assert!(desc.is_chip_mmio_capable(0));
        assert!(desc.is_chip_remote(1));
        assert_eq!(desc.get_closest_mmio_capable_chip(1).unwrap(), 0);
        assert_eq!(desc.chip(0).unwrap().unique_id, n300_unique_id(0x1000, 0));
        assert_eq!(desc.get_board_type(1).unwrap(), BoardType::N300);
        assert_eq!(desc.chip(1).unwrap().board_id, None);
        assert_eq!(
            desc.get_directly_connected_ethernet_channels_between_chips(0, 1),
            vec![(8, 0), (9, 1)]
        );
        assert_eq!(
            desc.get_active_eth_channels(1).unwrap(),
            BTreeSet::from([0, 1])
        );
        assert!(cluster.device(1).unwrap().is_remote());
        assert!(desc.get_noc_translation_enabled(1).unwrap());
    }

    #[test]
    fn callback_sees_every_chip() {
        let fabric = MockFabric::chain(3).unwrap();
        let mut events = Vec::new();
        let cluster = TopologyDiscovery::new(&fabric.enumerator(), fast())
            .discover_with(&mut |event| events.push(event))
            .unwrap();

        assert_eq!(cluster.descriptor.get_number_of_chips(), 3);
        assert!(matches!(events[0], DiscoveryEvent::PciChip { interface_id: 0, .. }));
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, DiscoveryEvent::RemoteChip { .. }))
                .count(),
            2
        );
        assert!(matches!(events.last(), Some(DiscoveryEvent::Done { chips: 3 })));
    }

    #[test]
    fn untrained_link_is_a_partial_result() {
        let fabric = MockFabric::chain(3).unwrap();
        fabric.set_link_trained(1, 8, false);

        let cluster = discover(&fabric.enumerator(), fast()).unwrap();
        assert_eq!(cluster.descriptor.get_number_of_chips(), 2);
    }

    #[test]
    fn probe_reports_untrained() {
        let fabric = MockFabric::n300_boards(1).unwrap();
        fabric.set_link_trained(0, 9, false);

        let enumerator = fabric.enumerator();
        let local = Arc::new(LocalDevice::open(&enumerator, 0).unwrap());
        local.init().unwrap();
        let device = TTDevice::from(local);
        let eth = EthAddresses::new(crate::mock::MOCK_ETH_FW_VERSION).unwrap();
        let discovery = TopologyDiscovery::new(&enumerator, fast().no_wait_for_eth_training(true));

        assert!(matches!(
            discovery.probe_link(&device, &eth, 9),
            LinkProbe::Untrained
        ));
        match discovery.probe_link(&device, &eth, 8) {
            LinkProbe::Trained(neighbour) => {
                assert_eq!(neighbour.location, EthCoord::new(1, 0, 0, 0));
                assert_eq!(neighbour.channel, 0);
                assert_eq!(neighbour.unique_id, n300_unique_id(0x1000, 1));
            }
            other => panic!("unexpected probe result {other:?}"),
        }
    }

    #[test]
    fn remote_chip_tunnels_through_its_closest_mmio_chip() {
        let fabric = MockFabric::new();
        let first = fabric.add_chip(
            MockChip::new(EthCoord::new(0, 0, 0, 0), n300_unique_id(0x2000, 0)).with_pci(0),
        );
        let second = fabric.add_chip(
            MockChip::new(EthCoord::new(1, 0, 0, 0), n300_unique_id(0x1000, 0)).with_pci(1),
        );
        let shared = fabric.add_chip(MockChip::new(
            EthCoord::new(2, 0, 0, 0),
            n300_unique_id(0x1000, 1),
        ));
        fabric.connect(first, 8, shared, 0).unwrap();
        fabric.connect(second, 8, shared, 1).unwrap();

        let cluster = discover(&fabric.enumerator(), fast()).unwrap();
        let desc = &cluster.descriptor;

        // Both PCI chips are one hop away, the lower chip id wins.
        assert_eq!(desc.chip(0).unwrap().pci_interface, Some(1));
        assert_eq!(desc.get_closest_mmio_capable_chip(2).unwrap(), 0);

        let device = cluster.device(2).unwrap();
        assert!(device.is_remote());
        assert_eq!(device.local().interface_id(), 1);
        assert_eq!(
            device
                .noc_read32(WH_ETH_CORES[0], ETH_FW_VERSION_ADDR)
                .unwrap(),
            crate::mock::MOCK_ETH_FW_VERSION
        );
    }

    #[test]
    fn old_eth_firmware_stays_local() {
        let fabric = MockFabric::new();
        let a = fabric.add_chip(
            MockChip::new(EthCoord::new(0, 0, 0, 0), n300_unique_id(5, 0))
                .with_pci(0)
                .with_eth_fw_version(0x0005_0000),
        );
        let b = fabric.add_chip(MockChip::new(EthCoord::new(1, 0, 0, 0), n300_unique_id(5, 1)));
        fabric.connect(a, 8, b, 0).unwrap();

        let cluster = discover(&fabric.enumerator(), fast()).unwrap();
        assert_eq!(cluster.descriptor.get_all_chips(), vec![0]);
        assert_eq!(cluster.descriptor.chip(0).unwrap().unique_id, 0);
    }

    #[test]
    fn foreign_board_is_not_walked() {
        let fabric = MockFabric::n300_boards(1).unwrap();
        let stranger = fabric.add_chip(MockChip::new(
            EthCoord::new(2, 0, 0, 0),
            n300_unique_id(0x9999, 1),
        ));
        fabric.connect(1, 15, stranger, 15).unwrap();

        let cluster = discover(&fabric.enumerator(), fast()).unwrap();
        let desc = &cluster.descriptor;
        assert_eq!(desc.get_number_of_chips(), 2);
        assert_eq!(
            desc.get_ethernet_connections_to_remote_devices()
                .get(&1)
                .and_then(|channels| channels.get(&15)),
            Some(&(n300_unique_id(0x9999, 1), 15))
        );
    }

    #[test]
    fn jtag_is_rejected() {
        let fabric = MockFabric::n300_boards(1).unwrap();
        let err = discover(
            &fabric.enumerator(),
            fast().device_type(IoDeviceType::Jtag),
        )
        .err()
        .unwrap();
        assert!(matches!(err, PlatformError::UnsupportedOperation { .. }));
    }

    #[test]
    fn harvesting_comes_from_arc() {
        let fabric = MockFabric::new();
        fabric.add_chip(
            MockChip::new(EthCoord::default(), n300_unique_id(1, 0))
                .with_pci(0)
                .with_harvesting(0x41)
                .with_noc_translation(false),
        );
        let cluster = discover(&fabric.enumerator(), fast()).unwrap();
        assert_eq!(
            cluster.descriptor.get_harvesting_masks(0).unwrap().tensix,
            0x41
        );
        assert!(!cluster.descriptor.get_noc_translation_enabled(0).unwrap());
    }
}
