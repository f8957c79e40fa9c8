// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-process fabric of simulated Wormhole chips.
//!
//! Every chip has sparse word addressed NOC memory. Ethernet cores carry the erisc words that
//! discovery reads and run a synchronous stand-in for the routing firmware: a write to the
//! host request write pointer moves each pending command hop by hop through the queues of
//! the chips on the way, performs the access at the destination and posts the response.
//! ARC answers the mailbox messages this crate sends, including SPI staging.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use luwen_core::{Arch, EthCoord, EthernetChannel};
use tracing::{debug, warn};

use crate::device::arc::{
    scratch_addr, ArcMsg, ARC_CORE, ARC_CSM_DATA_BASE, ARC_MISC_CNTL, ARC_MISC_CNTL_IRQ,
    MSG_ERROR_REPLY, MSG_REG, RETURN_REG,
};
use crate::device::spi::{ARC_SPI_CHUNK_SIZE, SPI_ROM_SIZE};
use crate::device::{DeviceBackend, PciDeviceInfo, PciEnumerator};
use crate::error::PlatformError;
use crate::eth_addr::{
    encode_local_coord, encode_remote_words, eth_channel_of_core, eth_core_of_channel,
    EthAddresses, ETH_FW_VERSION_ADDR, ETH_TRAINED, PORT_UNCONNECTED, PORT_UP, WH_ETH_CORES,
};
use crate::noc_addr;
use crate::noc_port::NocId;
use crate::queue::routing_cmd::FLAGS_OFFSET;
use crate::queue::{
    data_buffer_addr, forward, CmdFlags, CommandQueue, CoreMemory, QueueKind, QueueSnapshot,
    RoutingCommand,
};
use crate::topology::{NIU_CFG_0, NOC_TRANSLATION_BIT};

pub const MOCK_ETH_FW_VERSION: u32 = 0x0006_E000;
pub const MOCK_AICLK: u32 = 1000;
pub const TENSTORRENT_VENDOR_ID: u16 = 0x1e52;

/// Argument ARC returns for `GetSpiDumpAddr`.
const SPI_DUMP_ARG: u32 = 0x1000_2000;

/// Unique id of chip `index` on an N300 board. Both chips share the low (serial) word.
pub fn n300_unique_id(serial: u32, index: u32) -> u64 {
    (((0x14 << 4) | (index & 0xF)) as u64) << 32 | serial as u64
}

/// Unique id of chip `index` on a Galaxy board.
pub fn galaxy_unique_id(serial: u32, index: u32) -> u64 {
    (((0x35 << 4) as u64) << 32) | (serial as u64 + index as u64)
}

#[derive(Clone, Debug)]
pub struct MockChip {
    pub coord: EthCoord,
    pub unique_id: u64,
    /// What neighbours report as this chip's board type, 0 for Galaxy boards.
    pub board_type_word: u32,
    pub pci_interface: Option<usize>,
    pub arch: Arch,
    pub harvesting: u32,
    pub noc_translation: bool,
    pub eth_fw_version: u32,
}

impl MockChip {
    pub fn new(coord: EthCoord, unique_id: u64) -> Self {
        MockChip {
            coord,
            unique_id,
            board_type_word: 1,
            pci_interface: None,
            arch: Arch::Wormhole,
            harvesting: 0,
            noc_translation: true,
            eth_fw_version: MOCK_ETH_FW_VERSION,
        }
    }

    pub fn with_pci(mut self, interface: usize) -> Self {
        self.pci_interface = Some(interface);
        self
    }

    pub fn with_board_type_word(mut self, word: u32) -> Self {
        self.board_type_word = word;
        self
    }

    pub fn with_harvesting(mut self, mask: u32) -> Self {
        self.harvesting = mask;
        self
    }

    pub fn with_noc_translation(mut self, enabled: bool) -> Self {
        self.noc_translation = enabled;
        self
    }

    pub fn with_eth_fw_version(mut self, version: u32) -> Self {
        self.eth_fw_version = version;
        self
    }

    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }
}

#[derive(Clone, Copy, Debug)]
struct Link {
    peer: usize,
    peer_channel: EthernetChannel,
    trained: bool,
}

#[derive(Clone, Copy, Debug)]
struct Hop {
    from: usize,
    out_channel: EthernetChannel,
    to: usize,
    in_channel: EthernetChannel,
}

enum Outcome {
    Written,
    Word(u32),
    Block(Vec<u8>),
    Unreachable,
}

struct ChipState {
    setup: MockChip,
    memory: RefCell<HashMap<(u8, u8), BTreeMap<u64, u32>>>,
    links: BTreeMap<EthernetChannel, Link>,
    firmware_running: bool,
    unreachable: bool,
    faulty: bool,
    echo_tags: bool,
    last_noc: Cell<Option<NocId>>,
    spi: RefCell<HashMap<u32, Vec<u8>>>,
    spi_staged: Cell<u32>,
}

impl ChipState {
    fn new(setup: MockChip) -> Self {
        ChipState {
            setup,
            memory: RefCell::new(HashMap::new()),
            links: BTreeMap::new(),
            firmware_running: true,
            unreachable: false,
            faulty: false,
            echo_tags: true,
            last_noc: Cell::new(None),
            spi: RefCell::new(HashMap::new()),
            spi_staged: Cell::new(0),
        }
    }
}

#[derive(Default)]
struct FabricState {
    chips: Vec<ChipState>,
}

/// One core as seen by the simulated firmware. Writes do not trigger any firmware.
struct CoreView<'a> {
    fabric: &'a FabricState,
    chip: usize,
    core: (u8, u8),
}

impl CoreMemory for CoreView<'_> {
    fn core(&self) -> (u8, u8) {
        self.core
    }

    fn read32(&self, addr: u64) -> Result<u32, PlatformError> {
        Ok(self.fabric.read_word(self.chip, self.core, addr))
    }

    fn write32(&self, addr: u64, value: u32) -> Result<(), PlatformError> {
        self.fabric.write_word(self.chip, self.core, addr, value);
        Ok(())
    }
}

impl FabricState {
    fn view(&self, chip: usize, core: (u8, u8)) -> CoreView<'_> {
        CoreView {
            fabric: self,
            chip,
            core,
        }
    }

    fn read_word(&self, chip: usize, core: (u8, u8), addr: u64) -> u32 {
        self.chips[chip]
            .memory
            .borrow()
            .get(&core)
            .and_then(|words| words.get(&(addr & !3)).copied())
            .unwrap_or(0)
    }

    fn write_word(&self, chip: usize, core: (u8, u8), addr: u64, value: u32) {
        self.chips[chip]
            .memory
            .borrow_mut()
            .entry(core)
            .or_default()
            .insert(addr & !3, value);
    }

    fn read_bytes(&self, chip: usize, core: (u8, u8), addr: u64, data: &mut [u8]) {
        for (i, byte) in data.iter_mut().enumerate() {
            let at = addr + i as u64;
            *byte = self.read_word(chip, core, at).to_le_bytes()[(at & 3) as usize];
        }
    }

    fn write_bytes(&self, chip: usize, core: (u8, u8), addr: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let at = addr + i as u64;
            let mut word = self.read_word(chip, core, at).to_le_bytes();
            word[(at & 3) as usize] = *byte;
            self.write_word(chip, core, at, u32::from_le_bytes(word));
        }
    }

    /// A write as seen by the chip: memory is updated, then any firmware it wakes up runs.
    fn store(
        &self,
        chip: usize,
        core: (u8, u8),
        addr: u64,
        data: &[u8],
    ) -> Result<(), PlatformError> {
        self.write_bytes(chip, core, addr, data);

        let touches = |target: u64| addr <= target && target < addr + data.len() as u64;

        if core == ARC_CORE
            && touches(ARC_MISC_CNTL)
            && self.read_word(chip, core, ARC_MISC_CNTL) & ARC_MISC_CNTL_IRQ != 0
        {
            self.service_arc(chip);
        }

        if eth_channel_of_core(core).is_some()
            && touches(QueueKind::HostRequest.wrptr_addr())
            && self.chips[chip].firmware_running
        {
            self.service_host_requests(chip, core)?;
        }

        Ok(())
    }

    fn refresh_eth_words(&self, chip: usize) {
        let state = &self.chips[chip];
        let setup = &state.setup;

        self.write_word(
            chip,
            (0, 0),
            NIU_CFG_0,
            if setup.noc_translation {
                NOC_TRANSLATION_BIT
            } else {
                0
            },
        );

        for (channel, core) in WH_ETH_CORES.iter().enumerate() {
            let channel = channel as EthernetChannel;
            self.write_word(chip, *core, ETH_FW_VERSION_ADDR, setup.eth_fw_version);

            let Ok(eth) = EthAddresses::new(setup.eth_fw_version) else {
                continue;
            };

            self.write_word(chip, *core, eth.local_coord(), encode_local_coord(&setup.coord));
            let local_lo = eth.erisc_local_board_id_lo_offset;
            self.write_word(chip, *core, eth.result_word(local_lo), setup.unique_id as u32);
            self.write_word(
                chip,
                *core,
                eth.result_word(local_lo + 1),
                (setup.unique_id >> 32) as u32,
            );
            self.write_word(
                chip,
                *core,
                eth.result_word(eth.erisc_local_board_type_offset),
                setup.board_type_word,
            );

            match state.links.get(&channel) {
                Some(link) => {
                    let peer = &self.chips[link.peer].setup;
                    let peer_core = WH_ETH_CORES[link.peer_channel as usize];
                    let (rack_word, shelf_word) = encode_remote_words(&peer.coord, peer_core);
                    let remote_lo = eth.erisc_remote_board_id_lo_offset;

                    self.write_word(chip, *core, eth.port_status(channel), PORT_UP);
                    self.write_word(
                        chip,
                        *core,
                        eth.training_status(),
                        if link.trained { ETH_TRAINED } else { 0 },
                    );
                    self.write_word(chip, *core, eth.remote_rack(), rack_word);
                    self.write_word(chip, *core, eth.remote_shelf(), shelf_word);
                    self.write_word(chip, *core, eth.result_word(remote_lo), peer.unique_id as u32);
                    self.write_word(
                        chip,
                        *core,
                        eth.result_word(remote_lo + 1),
                        (peer.unique_id >> 32) as u32,
                    );
                    self.write_word(
                        chip,
                        *core,
                        eth.result_word(eth.erisc_remote_board_type_offset),
                        peer.board_type_word,
                    );
                }
                None => {
                    self.write_word(chip, *core, eth.port_status(channel), PORT_UNCONNECTED);
                    self.write_word(chip, *core, eth.training_status(), 0);
                }
            }
        }
    }

    /// Shortest path over trained links from `origin` to the nearest chip at `coord`.
    fn route(&self, origin: usize, coord: (u8, u8, u8, u8)) -> Option<(usize, Vec<Hop>)> {
        let matches = |chip: usize| {
            let c = &self.chips[chip].setup.coord;
            (c.x, c.y, c.rack, c.shelf) == coord
        };

        let mut parent: BTreeMap<usize, Hop> = BTreeMap::new();
        let mut queue = VecDeque::from([origin]);
        let mut seen = vec![false; self.chips.len()];
        seen[origin] = true;

        while let Some(chip) = queue.pop_front() {
            if matches(chip) {
                let mut path = Vec::new();
                let mut at = chip;
                while let Some(hop) = parent.get(&at) {
                    path.push(*hop);
                    at = hop.from;
                }
                path.reverse();
                return Some((chip, path));
            }

            for (channel, link) in &self.chips[chip].links {
                if link.trained && !seen[link.peer] {
                    seen[link.peer] = true;
                    parent.insert(
                        link.peer,
                        Hop {
                            from: chip,
                            out_channel: *channel,
                            to: link.peer,
                            in_channel: link.peer_channel,
                        },
                    );
                    queue.push_back(link.peer);
                }
            }
        }

        None
    }

    /// Move `cmd` from the core it entered on through the queues of every chip on `path`.
    fn carry(
        &self,
        entry_core: (u8, u8),
        path: &[Hop],
        cmd: &RoutingCommand,
    ) -> Result<(), PlatformError> {
        let stuck = |hop: &Hop| {
            PlatformError::from(format!(
                "mock fabric: no room to forward from chip {} channel {}",
                hop.from, hop.out_channel
            ))
        };

        let mut core = entry_core;
        for hop in path {
            let out_core = eth_core_of_channel(hop.out_channel).ok_or_else(|| stuck(hop))?;
            let here = self.view(hop.from, out_core);
            let outbound = CommandQueue::new(&here, QueueKind::EthOutRequest);

            if out_core == core {
                outbound.enqueue(cmd, Duration::ZERO)?;
            } else {
                let node = CommandQueue::new(&here, QueueKind::NodeRequest0);
                node.enqueue(cmd, Duration::ZERO)?;
                forward(&node, &outbound)?.ok_or_else(|| stuck(hop))?;
            }

            let in_core = eth_core_of_channel(hop.in_channel).ok_or_else(|| stuck(hop))?;
            let there = self.view(hop.to, in_core);
            let inbound = CommandQueue::new(&there, QueueKind::EthInRequest);
            forward(&outbound, &inbound)?.ok_or_else(|| stuck(hop))?;
            inbound.dequeue()?;

            core = in_core;
        }

        Ok(())
    }

    fn deliver(
        &self,
        origin: usize,
        entry_core: (u8, u8),
        cmd: &RoutingCommand,
        payload: Option<Vec<u8>>,
    ) -> Result<Outcome, PlatformError> {
        let (chip_y, chip_x, noc_y, noc_x, offset) = noc_addr::decode(cmd.sys_addr);
        let (rack, shelf) = noc_addr::decode_sys_rack(cmd.rack);

        let Some((dest, path)) = self.route(origin, (chip_x, chip_y, rack, shelf)) else {
            return Ok(Outcome::Unreachable);
        };
        if self.chips[dest].unreachable {
            return Ok(Outcome::Unreachable);
        }
        self.carry(entry_core, &path, cmd)?;

        let target = (noc_x, noc_y);
        let flags = cmd.cmd_flags();
        if flags.wr_req() {
            match payload {
                Some(data) => self.store(dest, target, offset, &data)?,
                None => self.store(dest, target, offset, &cmd.data.to_le_bytes())?,
            }
            Ok(Outcome::Written)
        } else if flags.data_block() {
            let mut data = vec![0; cmd.data as usize];
            self.read_bytes(dest, target, offset, &mut data);
            Ok(Outcome::Block(data))
        } else {
            let mut word = [0u8; 4];
            self.read_bytes(dest, target, offset, &mut word);
            Ok(Outcome::Word(u32::from_le_bytes(word)))
        }
    }

    fn post_response(
        &self,
        chip: usize,
        core: (u8, u8),
        mut reply: RoutingCommand,
        block: Option<&[u8]>,
    ) -> Result<(), PlatformError> {
        let view = self.view(chip, core);
        let responses = CommandQueue::new(&view, QueueKind::Response);
        if responses.is_full()? {
            warn!("mock fabric: response queue on chip {chip} core {core:?} is full, dropping response");
            return Ok(());
        }

        let wr = responses.wrptr()?;
        view.write32(QueueKind::Response.slot_addr(wr) + FLAGS_OFFSET, 0)?;
        responses.commit(wr)?;

        if let Some(data) = block {
            view.write_block(data_buffer_addr(QueueKind::Response.slot_index(wr)), data)?;
            reply.data = data.len() as u32;
        }
        responses.write_slot(wr, &reply)
    }

    fn respond(
        &self,
        chip: usize,
        core: (u8, u8),
        cmd: &RoutingCommand,
        outcome: Outcome,
    ) -> Result<(), PlatformError> {
        let mut reply = RoutingCommand {
            sys_addr: cmd.sys_addr,
            rack: cmd.rack,
            src_addr_tag: if self.chips[chip].echo_tags {
                cmd.src_addr_tag
            } else {
                0
            },
            ..Default::default()
        };

        match outcome {
            Outcome::Written => Ok(()),
            Outcome::Unreachable => {
                reply.flags = CmdFlags::new().with_dest_unreachable(true).into();
                self.post_response(chip, core, reply, None)
            }
            Outcome::Word(value) => {
                reply.data = value;
                reply.flags = CmdFlags::new().with_rd_data(true).into();
                self.post_response(chip, core, reply, None)
            }
            Outcome::Block(data) => {
                reply.flags = CmdFlags::new()
                    .with_rd_data(true)
                    .with_data_block(true)
                    .into();
                self.post_response(chip, core, reply, Some(&data))
            }
        }
    }

    fn service_host_requests(&self, chip: usize, core: (u8, u8)) -> Result<(), PlatformError> {
        let view = self.view(chip, core);
        let requests = CommandQueue::new(&view, QueueKind::HostRequest);

        loop {
            let (wr, rd) = requests.pointers()?;
            if wr == rd {
                break;
            }

            let cmd = requests.read_slot(rd)?;
            let flags = cmd.cmd_flags();
            let payload = if flags.wr_req() && flags.data_block() {
                let mut data = vec![0; cmd.data as usize];
                view.read_block(
                    data_buffer_addr(QueueKind::HostRequest.slot_index(rd)),
                    &mut data,
                )?;
                Some(data)
            } else {
                None
            };
            requests.record_issued()?;
            requests.release(rd)?;

            let outcome = self.deliver(chip, core, &cmd, payload)?;
            if flags.rd_req() {
                self.respond(chip, core, &cmd, outcome)?;
            } else if let Outcome::Unreachable = outcome {
                debug!("mock fabric: dropping write to unreachable {:#x}", cmd.sys_addr);
            }
            requests.record_completed()?;
        }

        Ok(())
    }

    fn spi_chunk(&self, chip: usize, addr: u32) -> Vec<u8> {
        self.chips[chip]
            .spi
            .borrow()
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| vec![0xFF; ARC_SPI_CHUNK_SIZE as usize])
    }

    fn service_arc(&self, chip: usize) {
        let misc = self.read_word(chip, ARC_CORE, ARC_MISC_CNTL);
        self.write_word(chip, ARC_CORE, ARC_MISC_CNTL, misc & !ARC_MISC_CNTL_IRQ);

        let code = self.read_word(chip, ARC_CORE, scratch_addr(MSG_REG));
        let args = self.read_word(chip, ARC_CORE, scratch_addr(RETURN_REG));
        let dump_addr = ARC_CSM_DATA_BASE - 0x1000_0000 + SPI_DUMP_ARG as u64;
        let state = &self.chips[chip];

        let reply = match ArcMsg::from_values(code, args as u16, (args >> 16) as u16) {
            None => {
                self.write_word(chip, ARC_CORE, scratch_addr(MSG_REG), MSG_ERROR_REPLY);
                return;
            }
            // Stays asleep with the sleep code in the mailbox.
            Some(ArcMsg::ArcGoToSleep) => return,
            Some(ArcMsg::Nop) => 0,
            Some(ArcMsg::Test { arg }) => arg.wrapping_add(1),
            Some(ArcMsg::GetAiclk) => MOCK_AICLK,
            Some(ArcMsg::GetHarvesting) => state.setup.harvesting,
            Some(ArcMsg::GetSpiDumpAddr) => SPI_DUMP_ARG,
            Some(ArcMsg::SpiRead { addr }) => {
                let chunk = self.spi_chunk(chip, addr);
                self.write_bytes(chip, ARC_CORE, dump_addr, &chunk);
                state.spi_staged.set(addr);
                0
            }
            Some(ArcMsg::SpiWrite) => {
                let mut chunk = vec![0; ARC_SPI_CHUNK_SIZE as usize];
                self.read_bytes(chip, ARC_CORE, dump_addr, &mut chunk);
                state.spi.borrow_mut().insert(state.spi_staged.get(), chunk);
                0
            }
        };

        self.write_word(chip, ARC_CORE, scratch_addr(RETURN_REG), reply);
        self.write_word(chip, ARC_CORE, scratch_addr(MSG_REG), code & 0xFF);
    }
}

/// Shared handle to the simulated fabric. Clones refer to the same fabric.
#[derive(Clone, Default)]
pub struct MockFabric {
    state: Arc<Mutex<FabricState>>,
}

fn lock(state: &Mutex<FabricState>) -> MutexGuard<'_, FabricState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FabricState> {
        lock(&self.state)
    }

    /// Returns the index used to refer to the chip in the other calls.
    pub fn add_chip(&self, chip: MockChip) -> usize {
        let mut state = self.lock();
        state.chips.push(ChipState::new(chip));
        let index = state.chips.len() - 1;
        state.refresh_eth_words(index);
        index
    }

    pub fn chip_count(&self) -> usize {
        self.lock().chips.len()
    }

    /// Cable `channel_a` of chip `a` to `channel_b` of chip `b`. The link starts out trained.
    pub fn connect(
        &self,
        a: usize,
        channel_a: EthernetChannel,
        b: usize,
        channel_b: EthernetChannel,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        for (chip, channel) in [(a, channel_a), (b, channel_b)] {
            let Some(chip_state) = state.chips.get(chip) else {
                return Err(format!("mock fabric has no chip {chip}").into());
            };
            if channel as usize >= WH_ETH_CORES.len() || chip_state.links.contains_key(&channel) {
                return Err(format!("channel {channel} of chip {chip} is not free").into());
            }
        }
        if (a, channel_a) == (b, channel_b) {
            return Err(format!("channel {channel_a} of chip {a} cannot loop back").into());
        }

        state.chips[a].links.insert(
            channel_a,
            Link {
                peer: b,
                peer_channel: channel_b,
                trained: true,
            },
        );
        state.chips[b].links.insert(
            channel_b,
            Link {
                peer: a,
                peer_channel: channel_a,
                trained: true,
            },
        );
        state.refresh_eth_words(a);
        state.refresh_eth_words(b);
        Ok(())
    }

    /// Applies to both ends of the link on `channel` of `chip`.
    pub fn set_link_trained(&self, chip: usize, channel: EthernetChannel, trained: bool) {
        let mut state = self.lock();
        let Some(link) = state.chips[chip].links.get_mut(&channel) else {
            return;
        };
        link.trained = trained;
        let (peer, peer_channel) = (link.peer, link.peer_channel);
        if let Some(back) = state.chips[peer].links.get_mut(&peer_channel) {
            back.trained = trained;
        }
        state.refresh_eth_words(chip);
        state.refresh_eth_words(peer);
    }

    /// Stopped firmware leaves host requests in the queue. Restarting drains them.
    pub fn set_firmware_running(&self, chip: usize, running: bool) -> Result<(), PlatformError> {
        let mut state = self.lock();
        state.chips[chip].firmware_running = running;
        if running {
            for core in WH_ETH_CORES {
                state.service_host_requests(chip, core)?;
            }
        }
        Ok(())
    }

    /// Requests routed to `chip` come back with the destination unreachable flag.
    pub fn set_unreachable(&self, chip: usize, unreachable: bool) {
        self.lock().chips[chip].unreachable = unreachable;
    }

    /// Host bus accesses to `chip` fail with a hardware fault.
    pub fn set_faulty(&self, chip: usize, faulty: bool) {
        self.lock().chips[chip].faulty = faulty;
    }

    /// Older firmware leaves the tag field of responses zeroed.
    pub fn set_echo_tags(&self, chip: usize, echo: bool) {
        self.lock().chips[chip].echo_tags = echo;
    }

    /// Post a read response nobody asked for into the response queue of `core`.
    pub fn inject_stale_response(
        &self,
        chip: usize,
        core: (u8, u8),
        tag: u32,
        data: u32,
    ) -> Result<(), PlatformError> {
        let state = self.lock();
        let reply = RoutingCommand {
            data,
            flags: CmdFlags::new().with_rd_data(true).into(),
            src_addr_tag: tag,
            ..Default::default()
        };
        state.post_response(chip, core, reply, None)
    }

    pub fn read32(&self, chip: usize, core: (u8, u8), addr: u64) -> u32 {
        self.lock().read_word(chip, core, addr)
    }

    /// Raw memory write, no firmware runs.
    pub fn write32(&self, chip: usize, core: (u8, u8), addr: u64, value: u32) {
        self.lock().write_word(chip, core, addr, value);
    }

    pub fn read_bytes(&self, chip: usize, core: (u8, u8), addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        self.lock().read_bytes(chip, core, addr, &mut data);
        data
    }

    pub fn queue_snapshot(
        &self,
        chip: usize,
        core: (u8, u8),
        kind: QueueKind,
    ) -> Result<QueueSnapshot, PlatformError> {
        let state = self.lock();
        let view = state.view(chip, core);
        CommandQueue::new(&view, kind).snapshot()
    }

    /// NOC port used by the most recent host bus access to `chip`.
    pub fn last_noc(&self, chip: usize) -> Option<NocId> {
        self.lock().chips[chip].last_noc.get()
    }

    pub fn spi_contents(&self, chip: usize, addr: u32, len: usize) -> Vec<u8> {
        let state = self.lock();
        (0..len as u32)
            .map(|i| {
                let at = addr + i;
                let base = at / ARC_SPI_CHUNK_SIZE * ARC_SPI_CHUNK_SIZE;
                state.spi_chunk(chip, base)[(at - base) as usize]
            })
            .collect()
    }

    pub fn set_spi_contents(&self, chip: usize, addr: u32, data: &[u8]) {
        let state = self.lock();
        for (i, byte) in data.iter().enumerate() {
            let at = addr + i as u32;
            if at >= SPI_ROM_SIZE {
                break;
            }
            let base = at / ARC_SPI_CHUNK_SIZE * ARC_SPI_CHUNK_SIZE;
            let mut chunk = state.spi_chunk(chip, base);
            chunk[(at - base) as usize] = *byte;
            state.chips[chip].spi.borrow_mut().insert(base, chunk);
        }
    }

    pub fn enumerator(&self) -> MockEnumerator {
        MockEnumerator {
            state: self.state.clone(),
        }
    }

    /// A PCIe attached chip followed by `len - 1` remote chips in a line, channel 8 of each
    /// chip cabled to channel 0 of the next. Galaxy style board words.
    pub fn chain(len: usize) -> Result<Self, PlatformError> {
        let fabric = MockFabric::new();
        for index in 0..len {
            let mut chip = MockChip::new(
                EthCoord::new(index as u8, 0, 0, 0),
                galaxy_unique_id(0x2000, index as u32),
            )
            .with_board_type_word(0);
            if index == 0 {
                chip = chip.with_pci(0);
            }
            fabric.add_chip(chip);
        }
        for index in 1..len {
            fabric.connect(index - 1, 8, index, 0)?;
        }
        Ok(fabric)
    }

    /// `boards` N300 cards. The left chip of card `i` is PCIe device `i`, its channels 8 and 9
    /// are cabled to channels 0 and 1 of the right chip.
    pub fn n300_boards(boards: usize) -> Result<Self, PlatformError> {
        let fabric = MockFabric::new();
        for board in 0..boards {
            let serial = 0x1000 + board as u32;
            let left = fabric.add_chip(
                MockChip::new(EthCoord::new(0, 0, 0, 0), n300_unique_id(serial, 0)).with_pci(board),
            );
            let right = fabric.add_chip(MockChip::new(
                EthCoord::new(1, 0, 0, 0),
                n300_unique_id(serial, 1),
            ));
            fabric.connect(left, 8, right, 0)?;
            fabric.connect(left, 9, right, 1)?;
        }
        Ok(fabric)
    }
}

pub struct MockEnumerator {
    state: Arc<Mutex<FabricState>>,
}

fn device_info(interface_id: usize, arch: Arch) -> PciDeviceInfo {
    let device_id = match arch {
        Arch::Grayskull => 0xfaca,
        Arch::Wormhole => 0x401e,
        Arch::Blackhole => 0xb140,
    };
    PciDeviceInfo {
        interface_id,
        vendor_id: TENSTORRENT_VENDOR_ID,
        device_id,
        subsystem_vendor_id: TENSTORRENT_VENDOR_ID,
        subsystem_id: 0x0014,
        bdf: format!("0000:{:02x}:00.0", interface_id + 1),
        arch,
    }
}

impl PciEnumerator for MockEnumerator {
    fn enumerate_devices(
        &self,
        targets: &std::collections::BTreeSet<usize>,
    ) -> Result<Vec<usize>, PlatformError> {
        Ok(self.enumerate_devices_info(targets)?.into_keys().collect())
    }

    fn enumerate_devices_info(
        &self,
        targets: &std::collections::BTreeSet<usize>,
    ) -> Result<BTreeMap<usize, PciDeviceInfo>, PlatformError> {
        let state = lock(&self.state);
        Ok(state
            .chips
            .iter()
            .filter_map(|chip| chip.setup.pci_interface.map(|id| (id, chip.setup.arch)))
            .filter(|(id, _)| targets.is_empty() || targets.contains(id))
            .map(|(id, arch)| (id, device_info(id, arch)))
            .collect())
    }

    fn open(&self, interface_id: usize) -> Result<Arc<dyn DeviceBackend>, PlatformError> {
        let state = lock(&self.state);
        let Some((chip, arch)) = state
            .chips
            .iter()
            .enumerate()
            .find(|(_, chip)| chip.setup.pci_interface == Some(interface_id))
            .map(|(index, chip)| (index, chip.setup.arch))
        else {
            return Err(format!("No mock PCI device {interface_id}").into());
        };

        Ok(Arc::new(MockBackend {
            state: self.state.clone(),
            chip,
            info: device_info(interface_id, arch),
        }))
    }
}

pub struct MockBackend {
    state: Arc<Mutex<FabricState>>,
    chip: usize,
    info: PciDeviceInfo,
}

impl MockBackend {
    fn check(&self, state: &FabricState, noc: NocId) -> Result<(), PlatformError> {
        let chip = &state.chips[self.chip];
        chip.last_noc.set(Some(noc));
        if chip.faulty {
            return Err(PlatformError::hardware_fault(
                self.info.interface_id,
                "read 0xffffffff from ARC scratch",
            ));
        }
        Ok(())
    }
}

impl DeviceBackend for MockBackend {
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
        let state = lock(&self.state);
        self.check(&state, noc)?;
        state.read_bytes(self.chip, core, addr, data);
        Ok(())
    }

    fn noc_write(
        &self,
        noc: NocId,
        core: (u8, u8),
        addr: u64,
        data: &[u8],
    ) -> Result<(), PlatformError> {
        let state = lock(&self.state);
        self.check(&state, noc)?;
        state.store(self.chip, core, addr, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth_addr::{decode_remote_coord, decode_remote_eth_core};

    #[test]
    fn erisc_words_describe_the_link() {
        let fabric = MockFabric::n300_boards(1).unwrap();
        let eth = EthAddresses::new(MOCK_ETH_FW_VERSION).unwrap();
        let core = WH_ETH_CORES[8];

        assert_eq!(fabric.read32(0, core, eth.port_status(8)), PORT_UP);
        assert_eq!(fabric.read32(0, WH_ETH_CORES[3], eth.port_status(3)), PORT_UNCONNECTED);
        assert_eq!(fabric.read32(0, core, eth.training_status()), ETH_TRAINED);

        let rack = fabric.read32(0, core, eth.remote_rack());
        let shelf = fabric.read32(0, core, eth.remote_shelf());
        assert_eq!(decode_remote_coord(rack, shelf), EthCoord::new(1, 0, 0, 0));
        assert_eq!(decode_remote_eth_core(shelf), WH_ETH_CORES[0]);

        fabric.set_link_trained(0, 8, false);
        assert_eq!(fabric.read32(1, WH_ETH_CORES[0], eth.training_status()), 0);
    }

    #[test]
    fn arc_mailbox() {
        let fabric = MockFabric::new();
        let chip = fabric.add_chip(MockChip::new(EthCoord::default(), 1).with_harvesting(0x21));
        let state = fabric.lock();

        let code = ArcMsg::GetHarvesting.msg_code() as u32;
        state.write_word(chip, ARC_CORE, scratch_addr(MSG_REG), code);
        state
            .store(chip, ARC_CORE, ARC_MISC_CNTL, &ARC_MISC_CNTL_IRQ.to_le_bytes())
            .unwrap();
        assert_eq!(state.read_word(chip, ARC_CORE, scratch_addr(MSG_REG)), code & 0xFF);
        assert_eq!(state.read_word(chip, ARC_CORE, scratch_addr(RETURN_REG)), 0x21);
        assert_eq!(state.read_word(chip, ARC_CORE, ARC_MISC_CNTL) & ARC_MISC_CNTL_IRQ, 0);

        state.write_word(chip, ARC_CORE, scratch_addr(MSG_REG), 0xaaee);
        state
            .store(chip, ARC_CORE, ARC_MISC_CNTL, &ARC_MISC_CNTL_IRQ.to_le_bytes())
            .unwrap();
        assert_eq!(
            state.read_word(chip, ARC_CORE, scratch_addr(MSG_REG)),
            MSG_ERROR_REPLY
        );
    }

    #[test]
    fn routes_only_over_trained_links() {
        let fabric = MockFabric::chain(3).unwrap();
        let state = fabric.lock();
        let (dest, path) = state.route(0, (2, 0, 0, 0)).unwrap();
        assert_eq!(dest, 2);
        assert_eq!(path.len(), 2);
        assert_eq!((path[1].from, path[1].out_channel, path[1].in_channel), (1, 8, 0));
        drop(state);

        fabric.set_link_trained(1, 8, false);
        assert!(fabric.lock().route(0, (2, 0, 0, 0)).is_none());
    }

    #[test]
    fn unaligned_byte_access() {
        let fabric = MockFabric::new();
        let chip = fabric.add_chip(MockChip::new(EthCoord::default(), 1));
        let state = fabric.lock();
        state.write_bytes(chip, (1, 1), 0x101, &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(state.read_word(chip, (1, 1), 0x100), 0xCCBB_AA00);
        assert_eq!(state.read_word(chip, (1, 1), 0x104), 0x0000_00DD);
    }

    #[test]
    fn unique_ids_encode_board_type() {
        use luwen_core::BoardType;
        assert_eq!(
            BoardType::from_board_id(n300_unique_id(0x1000, 1)),
            BoardType::N300
        );
        assert_eq!(
            BoardType::from_board_id(galaxy_unique_id(0x2000, 5)),
            BoardType::Galaxy
        );
        assert_eq!(n300_unique_id(7, 0) as u32, n300_unique_id(7, 1) as u32);
    }
}
