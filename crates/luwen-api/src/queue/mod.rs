// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ethernet command queues.
//!
//! Every queue lives in the L1 of an ethernet core and starts with a header:
//! a 32 byte block of transaction counters, a 16 byte write pointer block and a
//! 16 byte read pointer block (only the first word of each pointer block is used).
//! The slots follow, 32 bytes each.
//!
//! The firmware keeps both pointers modulo `2 * slots`, so the slot index is
//! `ptr & (slots - 1)` and "full" and "empty" stay distinguishable.

pub mod routing_cmd;

use std::fmt::Display;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::PlatformError;

pub use routing_cmd::{CmdFlags, RoutingCommand, ROUTING_CMD_BYTES};

pub const COUNTERS_OFFSET: u64 = 0;
pub const WRPTR_OFFSET: u64 = 32;
pub const RDPTR_OFFSET: u64 = 48;
pub const SLOTS_OFFSET: u64 = 64;
pub const SLOT_BYTES: u64 = ROUTING_CMD_BYTES as u64;

/// Start of the block transfer buffers, one per request slot.
pub const DATA_BUFFER_ADDR: u64 = 0x12000;
pub const DATA_BUFFER_SLOT_BYTES: u64 = 1024;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueueKind {
    /// Requests written by the host.
    HostRequest,
    /// Requests that arrived over the link.
    EthInRequest,
    /// Responses for the host.
    Response,
    /// Requests waiting to go out over the link.
    EthOutRequest,
    NodeRequest0,
    NodeRequest1,
    NodeResponse0,
    NodeResponse1,
}

impl QueueKind {
    pub const ALL: [QueueKind; 8] = [
        QueueKind::HostRequest,
        QueueKind::EthInRequest,
        QueueKind::Response,
        QueueKind::EthOutRequest,
        QueueKind::NodeRequest0,
        QueueKind::NodeRequest1,
        QueueKind::NodeResponse0,
        QueueKind::NodeResponse1,
    ];

    pub fn base(&self) -> u64 {
        match self {
            QueueKind::HostRequest => 0x11080,
            QueueKind::EthInRequest => 0x11140,
            QueueKind::Response => 0x11200,
            QueueKind::EthOutRequest => 0x112C0,
            QueueKind::NodeRequest0 => 0x11380,
            QueueKind::NodeRequest1 => 0x114C0,
            QueueKind::NodeResponse0 => 0x11600,
            QueueKind::NodeResponse1 => 0x11740,
        }
    }

    pub fn slots(&self) -> u32 {
        match self {
            QueueKind::HostRequest
            | QueueKind::EthInRequest
            | QueueKind::Response
            | QueueKind::EthOutRequest => 4,
            QueueKind::NodeRequest0
            | QueueKind::NodeRequest1
            | QueueKind::NodeResponse0
            | QueueKind::NodeResponse1 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueKind::HostRequest => "REQ CMD Q",
            QueueKind::EthInRequest => "ETH IN REQ CMD Q",
            QueueKind::Response => "RESP CMD Q",
            QueueKind::EthOutRequest => "ETH OUT REQ CMD Q",
            QueueKind::NodeRequest0 => "NODE REQ CMD Q0",
            QueueKind::NodeRequest1 => "NODE REQ CMD Q1",
            QueueKind::NodeResponse0 => "NODE RESP CMD Q0",
            QueueKind::NodeResponse1 => "NODE RESP CMD Q1",
        }
    }

    pub fn counters_addr(&self) -> u64 {
        self.base() + COUNTERS_OFFSET
    }

    pub fn wrptr_addr(&self) -> u64 {
        self.base() + WRPTR_OFFSET
    }

    pub fn rdptr_addr(&self) -> u64 {
        self.base() + RDPTR_OFFSET
    }

    pub fn slot_index(&self, ptr: u32) -> u32 {
        ptr & (self.slots() - 1)
    }

    pub fn slot_addr(&self, ptr: u32) -> u64 {
        self.base() + SLOTS_OFFSET + self.slot_index(ptr) as u64 * SLOT_BYTES
    }

    pub fn ptr_mask(&self) -> u32 {
        2 * self.slots() - 1
    }

    pub fn next_ptr(&self, ptr: u32) -> u32 {
        ptr.wrapping_add(1) & self.ptr_mask()
    }

    /// Total bytes covered by the header and slots.
    pub fn size(&self) -> u64 {
        SLOTS_OFFSET + self.slots() as u64 * SLOT_BYTES
    }
}

impl Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub fn data_buffer_addr(slot: u32) -> u64 {
    DATA_BUFFER_ADDR + slot as u64 * DATA_BUFFER_SLOT_BYTES
}

/// Number of entries written and not yet released.
///
/// Both pointers are taken modulo `2 * slots`, the range the firmware wraps them in,
/// so a write pointer that wrapped below the read pointer still yields the true
/// distance. Out of range values read back from a wedged core are masked first and
/// never overflow.
pub fn pending(wrptr: u32, rdptr: u32, slots: u32) -> u32 {
    let mask = 2 * slots - 1;
    (wrptr & mask).wrapping_sub(rdptr & mask) & mask
}

/// A queue with `slots` entries has no free slot.
pub fn is_full(wrptr: u32, rdptr: u32, slots: u32) -> bool {
    pending(wrptr, rdptr, slots) == slots
}

/// Word access to the L1 of one core.
pub trait CoreMemory {
    /// NOC location of the core, used for error reporting.
    fn core(&self) -> (u8, u8);

    fn read32(&self, addr: u64) -> Result<u32, PlatformError>;
    fn write32(&self, addr: u64, value: u32) -> Result<(), PlatformError>;

    fn read_block(&self, addr: u64, data: &mut [u8]) -> Result<(), PlatformError> {
        for (i, chunk) in data.chunks_mut(4).enumerate() {
            let word = self.read32(addr + 4 * i as u64)?.to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
        Ok(())
    }

    fn write_block(&self, addr: u64, data: &[u8]) -> Result<(), PlatformError> {
        for (i, chunk) in data.chunks(4).enumerate() {
            let word_addr = addr + 4 * i as u64;
            let value = if chunk.len() == 4 {
                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
            } else {
                let mut word = self.read32(word_addr)?.to_le_bytes();
                word[..chunk.len()].copy_from_slice(chunk);
                u32::from_le_bytes(word)
            };
            self.write32(word_addr, value)?;
        }
        Ok(())
    }
}

impl<T: CoreMemory + ?Sized> CoreMemory for &T {
    fn core(&self) -> (u8, u8) {
        (**self).core()
    }

    fn read32(&self, addr: u64) -> Result<u32, PlatformError> {
        (**self).read32(addr)
    }

    fn write32(&self, addr: u64, value: u32) -> Result<(), PlatformError> {
        (**self).write32(addr, value)
    }

    fn read_block(&self, addr: u64, data: &mut [u8]) -> Result<(), PlatformError> {
        (**self).read_block(addr, data)
    }

    fn write_block(&self, addr: u64, data: &[u8]) -> Result<(), PlatformError> {
        (**self).write_block(addr, data)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub kind: QueueKind,
    pub wrptr: u32,
    pub rdptr: u32,
    pub issued: u32,
    pub completed: u32,
    pub slots: Vec<RoutingCommand>,
}

impl QueueSnapshot {
    pub fn is_full(&self) -> bool {
        is_full(self.wrptr, self.rdptr, self.kind.slots())
    }

    pub fn pending(&self) -> u32 {
        pending(self.wrptr, self.rdptr, self.kind.slots())
    }
}

impl Display for QueueSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{}: wrptr {} rdptr {} pending {}{} counters {}/{}",
            self.kind,
            self.wrptr,
            self.rdptr,
            self.pending(),
            if self.is_full() { " (full)" } else { "" },
            self.issued,
            self.completed
        )?;
        for (index, slot) in self.slots.iter().enumerate() {
            writeln!(
                f,
                "  [{index}] addr {:#018x} data {:#010x} flags {:#010x} rack {:#06x} tag {:#010x}",
                slot.sys_addr, slot.data, slot.flags, slot.rack, slot.src_addr_tag
            )?;
        }
        Ok(())
    }
}

/// One queue on one core.
pub struct CommandQueue<M> {
    mem: M,
    kind: QueueKind,
}

impl<M: CoreMemory> CommandQueue<M> {
    pub fn new(mem: M, kind: QueueKind) -> Self {
        CommandQueue { mem, kind }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn memory(&self) -> &M {
        &self.mem
    }

    pub fn wrptr(&self) -> Result<u32, PlatformError> {
        self.mem.read32(self.kind.wrptr_addr())
    }

    pub fn rdptr(&self) -> Result<u32, PlatformError> {
        self.mem.read32(self.kind.rdptr_addr())
    }

    /// (wrptr, rdptr)
    pub fn pointers(&self) -> Result<(u32, u32), PlatformError> {
        Ok((self.wrptr()?, self.rdptr()?))
    }

    pub fn is_full(&self) -> Result<bool, PlatformError> {
        let (wr, rd) = self.pointers()?;
        Ok(is_full(wr, rd, self.kind.slots()))
    }

    pub fn pending(&self) -> Result<u32, PlatformError> {
        let (wr, rd) = self.pointers()?;
        Ok(pending(wr, rd, self.kind.slots()))
    }

    /// Poll until there is a free slot and return the write pointer that owns it.
    pub fn reserve(&self, timeout: Duration) -> Result<u32, PlatformError> {
        let start = Instant::now();
        loop {
            let (wr, rd) = self.pointers()?;
            if !is_full(wr, rd, self.kind.slots()) {
                return Ok(wr);
            }

            if start.elapsed() > timeout {
                return Err(PlatformError::QueueFull {
                    core: self.mem.core(),
                    queue: self.kind.name(),
                    waited: start.elapsed(),
                });
            }
            std::hint::spin_loop();
        }
    }

    pub fn write_slot(&self, wrptr: u32, cmd: &RoutingCommand) -> Result<(), PlatformError> {
        self.mem
            .write_block(self.kind.slot_addr(wrptr), &cmd.to_bytes())
    }

    pub fn read_slot(&self, ptr: u32) -> Result<RoutingCommand, PlatformError> {
        let mut bytes = [0u8; ROUTING_CMD_BYTES];
        self.mem.read_block(self.kind.slot_addr(ptr), &mut bytes)?;
        Ok(RoutingCommand::from_bytes(&bytes))
    }

    /// Publish the slot owned by `wrptr`. Must only be called once the slot is fully written.
    pub fn commit(&self, wrptr: u32) -> Result<u32, PlatformError> {
        let next = self.kind.next_ptr(wrptr);
        self.mem.write32(self.kind.wrptr_addr(), next)?;
        Ok(next)
    }

    /// Reserve, write and publish one command. Returns the slot index that was used.
    pub fn enqueue(&self, cmd: &RoutingCommand, timeout: Duration) -> Result<u32, PlatformError> {
        let wr = self.reserve(timeout)?;
        self.write_slot(wr, cmd)?;
        self.commit(wr)?;

        trace!(
            "{} on ({}, {}): queued {:#x} flags {:#x} at wrptr {wr}",
            self.kind,
            self.mem.core().0,
            self.mem.core().1,
            cmd.sys_addr,
            cmd.flags
        );

        Ok(self.kind.slot_index(wr))
    }

    /// Poll until something is pending and return the read pointer of the oldest entry.
    pub fn wait_pending(&self, timeout: Duration) -> Result<u32, PlatformError> {
        let start = Instant::now();
        let rd = self.rdptr()?;
        loop {
            if self.wrptr()? != rd {
                return Ok(rd);
            }

            if start.elapsed() > timeout {
                return Err(PlatformError::ResponseTimeout {
                    core: self.mem.core(),
                    waited: start.elapsed(),
                });
            }
            std::hint::spin_loop();
        }
    }

    /// Poll the flags word of the slot owned by `ptr` until the producer has filled it in.
    pub fn wait_flags(&self, ptr: u32, timeout: Duration) -> Result<u32, PlatformError> {
        let addr = self.kind.slot_addr(ptr) + routing_cmd::FLAGS_OFFSET;
        let start = Instant::now();
        loop {
            let flags = self.mem.read32(addr)?;
            if flags != 0 {
                return Ok(flags);
            }

            if start.elapsed() > timeout {
                return Err(PlatformError::ResponseTimeout {
                    core: self.mem.core(),
                    waited: start.elapsed(),
                });
            }
            std::hint::spin_loop();
        }
    }

    /// Hand the slot owned by `rdptr` back to the producer.
    pub fn release(&self, rdptr: u32) -> Result<u32, PlatformError> {
        let next = self.kind.next_ptr(rdptr);
        self.mem.write32(self.kind.rdptr_addr(), next)?;
        Ok(next)
    }

    /// Take the oldest entry if there is one.
    pub fn dequeue(&self) -> Result<Option<RoutingCommand>, PlatformError> {
        let (wr, rd) = self.pointers()?;
        if wr == rd {
            return Ok(None);
        }

        let cmd = self.read_slot(rd)?;
        self.release(rd)?;
        Ok(Some(cmd))
    }

    /// (issued, completed)
    pub fn txn_counters(&self) -> Result<(u32, u32), PlatformError> {
        let base = self.kind.counters_addr();
        Ok((self.mem.read32(base)?, self.mem.read32(base + 4)?))
    }

    pub fn record_issued(&self) -> Result<(), PlatformError> {
        let addr = self.kind.counters_addr();
        let issued = self.mem.read32(addr)?;
        self.mem.write32(addr, issued.wrapping_add(1))
    }

    pub fn record_completed(&self) -> Result<(), PlatformError> {
        let addr = self.kind.counters_addr() + 4;
        let completed = self.mem.read32(addr)?;
        self.mem.write32(addr, completed.wrapping_add(1))
    }

    /// Bring the read pointer up to the write pointer, dropping anything pending.
    /// Returns the number of dropped entries.
    pub fn resync(&self) -> Result<u32, PlatformError> {
        let (wr, rd) = self.pointers()?;
        if wr == rd {
            return Ok(0);
        }
        self.mem.write32(self.kind.rdptr_addr(), wr)?;
        Ok(pending(wr, rd, self.kind.slots()))
    }

    pub fn snapshot(&self) -> Result<QueueSnapshot, PlatformError> {
        let (wrptr, rdptr) = self.pointers()?;
        let (issued, completed) = self.txn_counters()?;
        let slots = (0..self.kind.slots())
            .map(|slot| self.read_slot(slot))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(QueueSnapshot {
            kind: self.kind,
            wrptr,
            rdptr,
            issued,
            completed,
            slots,
        })
    }
}

/// Move the oldest entry of `from` into `to`, leaving it in place if `to` has no room.
pub fn forward<A: CoreMemory, B: CoreMemory>(
    from: &CommandQueue<A>,
    to: &CommandQueue<B>,
) -> Result<Option<RoutingCommand>, PlatformError> {
    let (wr, rd) = from.pointers()?;
    if wr == rd || to.is_full()? {
        return Ok(None);
    }

    let cmd = from.read_slot(rd)?;
    let to_wr = to.wrptr()?;
    to.write_slot(to_wr, &cmd)?;
    to.commit(to_wr)?;
    from.release(rd)?;

    trace!(
        "forwarded {:#x} from {} on ({}, {}) to {} on ({}, {})",
        cmd.sys_addr,
        from.kind(),
        from.memory().core().0,
        from.memory().core().1,
        to.kind(),
        to.memory().core().0,
        to.memory().core().1
    );

    Ok(Some(cmd))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use super::*;

    struct FakeL1 {
        core: (u8, u8),
        words: RefCell<HashMap<u64, u32>>,
    }

    impl FakeL1 {
        fn new(core: (u8, u8)) -> Self {
            FakeL1 {
                core,
                words: RefCell::new(HashMap::new()),
            }
        }
    }

    impl CoreMemory for FakeL1 {
        fn core(&self) -> (u8, u8) {
            self.core
        }

        fn read32(&self, addr: u64) -> Result<u32, PlatformError> {
            Ok(self.words.borrow().get(&addr).copied().unwrap_or(0))
        }

        fn write32(&self, addr: u64, value: u32) -> Result<(), PlatformError> {
            self.words.borrow_mut().insert(addr, value);
            Ok(())
        }
    }

    #[test]
    fn out_of_range_pointers_are_masked() {
        let kind = QueueKind::Response;
        assert_eq!(pending(0, u32::MAX, kind.slots()), 1);
        assert_eq!(pending(u32::MAX, 0, kind.slots()), 7);
        assert!(!is_full(0xdead_beef, 0xdead_beef, kind.slots()));
        assert_eq!(kind.next_ptr(u32::MAX), 0);

        let l1 = FakeL1::new((9, 0));
        l1.write32(kind.wrptr_addr(), 0).unwrap();
        l1.write32(kind.rdptr_addr(), u32::MAX).unwrap();
        let q = CommandQueue::new(&l1, kind);
        assert_eq!(q.pending().unwrap(), 1);
        assert_eq!(q.resync().unwrap(), 1);
        assert_eq!(q.pointers().unwrap(), (0, 0));
        assert_eq!(q.resync().unwrap(), 0);
    }

    #[test]
    fn wrapped_pointers() {
        let kind = QueueKind::HostRequest;
        let mask = kind.ptr_mask();
        for rd in 0..=mask {
            for distance in 0..=kind.slots() {
                let wr = (rd + distance) & mask;
                assert_eq!(pending(wr, rd, kind.slots()), distance);
                assert_eq!(is_full(wr, rd, kind.slots()), distance == kind.slots());
            }
        }
    }

    #[test]
    fn queue_layout() {
        let q = QueueKind::Response;
        assert_eq!(q.wrptr_addr(), 0x11220);
        assert_eq!(q.rdptr_addr(), 0x11230);
        assert_eq!(q.slot_addr(0), 0x11240);
        assert_eq!(q.slot_addr(5), 0x11240 + 32);
        assert_eq!(q.next_ptr(7), 0);
        assert_eq!(QueueKind::NodeRequest0.next_ptr(7), 8);
        assert_eq!(QueueKind::NodeRequest0.next_ptr(15), 0);
        assert_eq!(data_buffer_addr(2), 0x12800);

        // No two queues overlap.
        for a in QueueKind::ALL {
            for b in QueueKind::ALL {
                if a < b {
                    assert!(a.base() + a.size() <= b.base() || b.base() + b.size() <= a.base());
                }
            }
        }
    }

    #[test]
    fn enqueue_until_full_then_drain() {
        let l1 = FakeL1::new((9, 0));
        let q = CommandQueue::new(&l1, QueueKind::HostRequest);

        for i in 0..4 {
            let cmd = RoutingCommand {
                sys_addr: i,
                data: i as u32,
                flags: 1,
                ..Default::default()
            };
            assert_eq!(q.enqueue(&cmd, Duration::ZERO).unwrap(), i as u32);
        }
        assert!(q.is_full().unwrap());

        let err = q
            .enqueue(&RoutingCommand::default(), Duration::from_millis(1))
            .unwrap_err();
        assert!(matches!(
            err,
            PlatformError::QueueFull {
                core: (9, 0),
                queue: "REQ CMD Q",
                ..
            }
        ));
        assert!(err.is_retryable());

        for i in 0..4 {
            let cmd = q.dequeue().unwrap().unwrap();
            assert_eq!(cmd.data, i);
        }
        assert_eq!(q.dequeue().unwrap(), None);
        assert_eq!(q.pointers().unwrap(), (4, 4));
    }

    #[test]
    fn empty_queue_times_out() {
        let l1 = FakeL1::new((1, 0));
        let q = CommandQueue::new(&l1, QueueKind::Response);
        assert!(matches!(
            q.wait_pending(Duration::from_millis(1)),
            Err(PlatformError::ResponseTimeout { core: (1, 0), .. })
        ));
    }

    #[test]
    fn forward_respects_destination_space() {
        let a = FakeL1::new((9, 0));
        let b = FakeL1::new((1, 0));
        let src = CommandQueue::new(&a, QueueKind::EthOutRequest);
        let dst = CommandQueue::new(&b, QueueKind::EthInRequest);

        for i in 0..4 {
            dst.enqueue(
                &RoutingCommand {
                    data: i,
                    ..Default::default()
                },
                Duration::ZERO,
            )
            .unwrap();
        }
        src.enqueue(
            &RoutingCommand {
                data: 99,
                ..Default::default()
            },
            Duration::ZERO,
        )
        .unwrap();

        assert_eq!(forward(&src, &dst).unwrap(), None);
        assert_eq!(src.pending().unwrap(), 1);

        dst.dequeue().unwrap();
        let moved = forward(&src, &dst).unwrap().unwrap();
        assert_eq!(moved.data, 99);
        assert_eq!(src.pending().unwrap(), 0);
        assert_eq!(dst.pending().unwrap(), 4);
    }

    #[test]
    fn resync_and_snapshot() {
        let l1 = FakeL1::new((9, 0));
        let q = CommandQueue::new(&l1, QueueKind::Response);
        q.enqueue(&RoutingCommand::default(), Duration::ZERO).unwrap();
        q.enqueue(&RoutingCommand::default(), Duration::ZERO).unwrap();
        q.record_issued().unwrap();

        assert_eq!(q.resync().unwrap(), 2);
        assert_eq!(q.resync().unwrap(), 0);

        let snap = q.snapshot().unwrap();
        assert_eq!((snap.wrptr, snap.rdptr), (2, 2));
        assert_eq!((snap.issued, snap.completed), (1, 0));
        assert_eq!(snap.slots.len(), 4);
        assert!(snap.to_string().starts_with("RESP CMD Q: wrptr 2 rdptr 2"));
    }
}
