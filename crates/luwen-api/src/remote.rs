// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! NOC access to chips without a host mapping, tunnelled through the command queues of one
//! ethernet core on a directly attached chip.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use luwen_core::EthCoord;
use tracing::{trace, warn};

use crate::device::LocalDevice;
use crate::error::PlatformError;
use crate::noc_addr;
use crate::noc_port::{selected_noc, NocId};
use crate::queue::{
    data_buffer_addr, CmdFlags, CommandQueue, CoreMemory, QueueKind, QueueSnapshot,
    RoutingCommand, DATA_BUFFER_ADDR, DATA_BUFFER_SLOT_BYTES,
};

const WORD: usize = 4;
const BLOCK_ALIGN: u64 = 32;

#[derive(Clone, Debug)]
pub struct RemoteTransportConfig {
    /// Bound on every wait for queue space or a response.
    pub timeout: Duration,
    pub max_block_size: usize,
    pub data_buffer_addr: u64,
}

impl Default for RemoteTransportConfig {
    fn default() -> Self {
        RemoteTransportConfig {
            timeout: Duration::from_secs(5),
            max_block_size: DATA_BUFFER_SLOT_BYTES as usize,
            data_buffer_addr: DATA_BUFFER_ADDR,
        }
    }
}

/// Serialises users of one tunnel core. Shared by every remote device bound to that core.
#[derive(Debug)]
pub struct TunnelState {
    request: Mutex<()>,
    response: Mutex<()>,
    next_tag: AtomicU32,
    flush_pending: AtomicBool,
}

impl Default for TunnelState {
    fn default() -> Self {
        TunnelState {
            request: Mutex::new(()),
            response: Mutex::new(()),
            next_tag: AtomicU32::new(1),
            flush_pending: AtomicBool::new(false),
        }
    }
}

impl TunnelState {
    fn next_tag(&self) -> u32 {
        loop {
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            // Zero is what firmware that does not echo tags leaves behind.
            if tag != 0 {
                return tag;
            }
        }
    }
}

fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// L1 of the tunnel core, always reached over NOC0.
pub struct TunnelCore<'a> {
    local: &'a LocalDevice,
    core: (u8, u8),
}

impl CoreMemory for TunnelCore<'_> {
    fn core(&self) -> (u8, u8) {
        self.core
    }

    fn read32(&self, addr: u64) -> Result<u32, PlatformError> {
        self.local.backend().noc_read32(NocId::Noc0, self.core, addr)
    }

    fn write32(&self, addr: u64, value: u32) -> Result<(), PlatformError> {
        self.local
            .backend()
            .noc_write32(NocId::Noc0, self.core, addr, value)
    }

    fn read_block(&self, addr: u64, data: &mut [u8]) -> Result<(), PlatformError> {
        self.local
            .backend()
            .noc_read(NocId::Noc0, self.core, addr, data)
    }

    fn write_block(&self, addr: u64, data: &[u8]) -> Result<(), PlatformError> {
        self.local
            .backend()
            .noc_write(NocId::Noc0, self.core, addr, data)
    }
}

/// How one piece of a transfer is carried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    /// Whole aligned word.
    Word,
    /// Part of the word at `addr & !3`, starting `skip` bytes in.
    PartialWord { skip: usize, len: usize },
    /// Block transfer of `len` bytes (a multiple of 4) of which `used` belong to the caller.
    Block { len: usize, used: usize },
}

impl Step {
    fn plan(addr: u64, remaining: usize, max_block: usize) -> Step {
        let misalign = (addr % WORD as u64) as usize;
        if misalign != 0 || remaining < WORD {
            return Step::PartialWord {
                skip: misalign,
                len: (WORD - misalign).min(remaining),
            };
        }

        if addr % BLOCK_ALIGN != 0 || remaining == WORD {
            return Step::Word;
        }

        let used = remaining.min(max_block);
        if used <= WORD {
            return Step::Word;
        }
        Step::Block {
            len: used.div_ceil(WORD) * WORD,
            used,
        }
    }

    fn consumed(&self) -> usize {
        match self {
            Step::Word => WORD,
            Step::PartialWord { len, .. } => *len,
            Step::Block { used, .. } => *used,
        }
    }
}

pub struct RemoteTransport {
    local: Arc<LocalDevice>,
    eth_core: (u8, u8),
    state: Arc<TunnelState>,
    config: RemoteTransportConfig,
}

impl RemoteTransport {
    pub fn new(local: Arc<LocalDevice>, eth_core: (u8, u8), config: RemoteTransportConfig) -> Self {
        let state = local.tunnel_state(eth_core);
        RemoteTransport {
            local,
            eth_core,
            state,
            config,
        }
    }

    pub fn local(&self) -> &Arc<LocalDevice> {
        &self.local
    }

    pub fn eth_core(&self) -> (u8, u8) {
        self.eth_core
    }

    pub fn config(&self) -> &RemoteTransportConfig {
        &self.config
    }

    fn tunnel(&self) -> TunnelCore<'_> {
        TunnelCore {
            local: &self.local,
            core: self.eth_core,
        }
    }

    fn block_buffer(&self, slot: u32) -> u64 {
        self.config.data_buffer_addr + (data_buffer_addr(slot) - DATA_BUFFER_ADDR)
    }

    /// Drop responses left over from an earlier user of the tunnel.
    pub fn fixup_response_queue(&self) -> Result<(), PlatformError> {
        let _response = lock(&self.state.response);
        let tunnel = self.tunnel();
        let resp_q = CommandQueue::new(&tunnel, QueueKind::Response);

        let (wr, rd) = resp_q.pointers()?;
        if wr != rd {
            warn!(
                "Response queue on ethernet core ({}, {}) out of sync (wrptr {wr}, rdptr {rd}), resetting rdptr",
                self.eth_core.0, self.eth_core.1
            );
            resp_q.resync()?;
        }

        Ok(())
    }

    fn command(
        &self,
        target: &EthCoord,
        core: (u8, u8),
        addr: u64,
    ) -> Result<RoutingCommand, PlatformError> {
        Ok(RoutingCommand {
            sys_addr: noc_addr::encode(target.y, target.x, core.1, core.0, addr)?,
            rack: noc_addr::sys_rack(target.rack, target.shelf),
            ..Default::default()
        })
    }

    /// One read round trip, `out` is either a word or a whole block.
    fn read_request(
        &self,
        target: &EthCoord,
        core: (u8, u8),
        addr: u64,
        out: &mut [u8],
    ) -> Result<(), PlatformError> {
        let block = out.len() > WORD;

        let _response = lock(&self.state.response);
        let tunnel = self.tunnel();
        let req_q = CommandQueue::new(&tunnel, QueueKind::HostRequest);
        let resp_q = CommandQueue::new(&tunnel, QueueKind::Response);

        let tag = self.state.next_tag();
        let mut cmd = self.command(target, core, addr)?;
        cmd.data = if block { out.len() as u32 } else { 0 };
        cmd.flags = CmdFlags::new()
            .with_rd_req(true)
            .with_data_block(block)
            .with_noc_id(selected_noc().as_u8())
            .into();
        cmd.src_addr_tag = tag;

        {
            let _request = lock(&self.state.request);
            req_q.enqueue(&cmd, self.config.timeout)?;
        }

        let expected: u32 = CmdFlags::new()
            .with_rd_data(true)
            .with_data_block(block)
            .into();

        let start = Instant::now();
        loop {
            let remaining = self.config.timeout.saturating_sub(start.elapsed());
            let rd = resp_q.wait_pending(remaining)?;
            let flags = resp_q.wait_flags(rd, remaining)?;
            let response = resp_q.read_slot(rd)?;

            if response.src_addr_tag != 0 && response.src_addr_tag != tag {
                resp_q.release(rd)?;
                warn!(
                    "Discarding stale response (tag {:#x}, waiting for {tag:#x}) on ethernet core ({}, {})",
                    response.src_addr_tag, self.eth_core.0, self.eth_core.1
                );
                continue;
            }

            let decoded = CmdFlags::from(flags);
            if decoded.is_error() || flags != expected {
                resp_q.release(rd)?;
                return Err(if decoded.dest_unreachable() {
                    PlatformError::DestinationUnreachable
                } else if decoded.data_block_unavailable() {
                    PlatformError::DataBlockUnavailable
                } else {
                    PlatformError::UnexpectedResponse { flags, expected }
                });
            }

            if block {
                tunnel.read_block(self.block_buffer(QueueKind::Response.slot_index(rd)), out)?;
            } else {
                out.copy_from_slice(&response.data.to_le_bytes()[..out.len()]);
            }
            resp_q.release(rd)?;

            trace!(
                "read {} bytes from {target} core ({}, {}) {addr:#x}",
                out.len(),
                core.0,
                core.1
            );
            return Ok(());
        }
    }

    /// One posted write, `data` is either a word or a whole block.
    fn write_request(
        &self,
        target: &EthCoord,
        core: (u8, u8),
        addr: u64,
        data: &[u8],
    ) -> Result<(), PlatformError> {
        let block = data.len() > WORD;

        let _request = lock(&self.state.request);
        let tunnel = self.tunnel();
        let req_q = CommandQueue::new(&tunnel, QueueKind::HostRequest);

        let mut cmd = self.command(target, core, addr)?;
        cmd.flags = CmdFlags::new()
            .with_wr_req(true)
            .with_data_block(block)
            .with_noc_id(selected_noc().as_u8())
            .into();

        let wr = req_q.reserve(self.config.timeout)?;
        if block {
            tunnel.write_block(self.block_buffer(QueueKind::HostRequest.slot_index(wr)), data)?;
            cmd.data = data.len() as u32;
        } else {
            let mut word = [0u8; WORD];
            word[..data.len()].copy_from_slice(data);
            cmd.data = u32::from_le_bytes(word);
        }
        req_q.write_slot(wr, &cmd)?;
        req_q.commit(wr)?;
        self.state.flush_pending.store(true, Ordering::Release);

        trace!(
            "posted {} byte write to {target} core ({}, {}) {addr:#x}",
            data.len(),
            core.0,
            core.1
        );

        Ok(())
    }

    pub fn read32(
        &self,
        target: &EthCoord,
        core: (u8, u8),
        addr: u64,
    ) -> Result<u32, PlatformError> {
        let mut data = [0u8; WORD];
        self.read(target, core, addr, &mut data)?;
        Ok(u32::from_le_bytes(data))
    }

    pub fn write32(
        &self,
        target: &EthCoord,
        core: (u8, u8),
        addr: u64,
        value: u32,
    ) -> Result<(), PlatformError> {
        self.write(target, core, addr, &value.to_le_bytes())
    }

    pub fn read(
        &self,
        target: &EthCoord,
        core: (u8, u8),
        addr: u64,
        data: &mut [u8],
    ) -> Result<(), PlatformError> {
        let mut offset = 0;
        while offset < data.len() {
            let at = addr + offset as u64;
            let step = Step::plan(at, data.len() - offset, self.config.max_block_size);
            match step {
                Step::Word => {
                    self.read_request(target, core, at, &mut data[offset..offset + WORD])?;
                }
                Step::PartialWord { skip, len } => {
                    let mut word = [0u8; WORD];
                    self.read_request(target, core, at - skip as u64, &mut word)?;
                    data[offset..offset + len].copy_from_slice(&word[skip..skip + len]);
                }
                Step::Block { len, used } => {
                    if len == used {
                        self.read_request(target, core, at, &mut data[offset..offset + len])?;
                    } else {
                        let mut buffer = vec![0u8; len];
                        self.read_request(target, core, at, &mut buffer)?;
                        data[offset..offset + used].copy_from_slice(&buffer[..used]);
                    }
                }
            }
            offset += step.consumed();
        }

        Ok(())
    }

    /// Writes are posted, see [`RemoteTransport::wait_for_flush`].
    pub fn write(
        &self,
        target: &EthCoord,
        core: (u8, u8),
        addr: u64,
        data: &[u8],
    ) -> Result<(), PlatformError> {
        let mut offset = 0;
        while offset < data.len() {
            let at = addr + offset as u64;
            let step = Step::plan(at, data.len() - offset, self.config.max_block_size);
            match step {
                Step::Word => {
                    self.write_request(target, core, at, &data[offset..offset + WORD])?;
                }
                Step::PartialWord { skip, len } => {
                    let base = at - skip as u64;
                    let mut word = [0u8; WORD];
                    self.read_request(target, core, base, &mut word)?;
                    word[skip..skip + len].copy_from_slice(&data[offset..offset + len]);
                    self.write_request(target, core, base, &word)?;
                }
                Step::Block { len, used } => {
                    if len == used {
                        self.write_request(target, core, at, &data[offset..offset + len])?;
                    } else {
                        // Keep the bytes past the end of the caller's buffer intact.
                        let tail = at + (len - WORD) as u64;
                        let mut buffer = vec![0u8; len];
                        self.read_request(target, core, tail, &mut buffer[len - WORD..])?;
                        buffer[..used].copy_from_slice(&data[offset..offset + used]);
                        self.write_request(target, core, at, &buffer)?;
                    }
                }
            }
            offset += step.consumed();
        }

        Ok(())
    }

    /// Wait until every posted write has been handed off and completed by the firmware.
    pub fn wait_for_flush(&self) -> Result<(), PlatformError> {
        if !self.state.flush_pending.load(Ordering::Acquire) {
            return Ok(());
        }

        let _request = lock(&self.state.request);
        let tunnel = self.tunnel();
        let req_q = CommandQueue::new(&tunnel, QueueKind::HostRequest);

        let start = Instant::now();
        loop {
            let (wr, rd) = req_q.pointers()?;
            if wr == rd {
                break;
            }
            if start.elapsed() > self.config.timeout {
                return Err(PlatformError::ResponseTimeout {
                    core: self.eth_core,
                    waited: start.elapsed(),
                });
            }
            std::hint::spin_loop();
        }

        loop {
            let (issued, completed) = req_q.txn_counters()?;
            if issued == completed {
                break;
            }
            if start.elapsed() > self.config.timeout {
                return Err(PlatformError::ResponseTimeout {
                    core: self.eth_core,
                    waited: start.elapsed(),
                });
            }
            std::hint::spin_loop();
        }

        self.state.flush_pending.store(false, Ordering::Release);
        Ok(())
    }

    /// Pointers, counters and slots of every queue on the tunnel core.
    pub fn queue_state(&self) -> Result<Vec<QueueSnapshot>, PlatformError> {
        let tunnel = self.tunnel();
        QueueKind::ALL
            .iter()
            .map(|kind| CommandQueue::new(&tunnel, *kind).snapshot())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_plan() {
        assert_eq!(Step::plan(0x1000, 4, 1024), Step::Word);
        assert_eq!(Step::plan(0x1004, 64, 1024), Step::Word);
        assert_eq!(
            Step::plan(0x1001, 64, 1024),
            Step::PartialWord { skip: 1, len: 3 }
        );
        assert_eq!(
            Step::plan(0x1000, 2, 1024),
            Step::PartialWord { skip: 0, len: 2 }
        );
        assert_eq!(
            Step::plan(0x1000, 4096, 1024),
            Step::Block {
                len: 1024,
                used: 1024
            }
        );
        assert_eq!(
            Step::plan(0x1000, 10, 1024),
            Step::Block { len: 12, used: 10 }
        );
        assert_eq!(Step::plan(0x1000, 4096, 4), Step::Word);
    }

    #[test]
    fn tags_skip_zero() {
        let state = TunnelState::default();
        state.next_tag.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(state.next_tag(), u32::MAX);
        assert_eq!(state.next_tag(), 1);
    }
}
