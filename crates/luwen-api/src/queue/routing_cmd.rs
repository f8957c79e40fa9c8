// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! One 32 byte command queue slot, encoded little endian.
//!
//! | offset | size | field                |
//! |--------|------|----------------------|
//! | 0      | 8    | sys_addr             |
//! | 8      | 4    | data                 |
//! | 12     | 4    | flags                |
//! | 16     | 2    | rack                 |
//! | 18     | 2    | src_resp_buf_index   |
//! | 20     | 4    | local_buf_index      |
//! | 24     | 1    | src_resp_q_id        |
//! | 25     | 1    | host_mem_txn_id      |
//! | 26     | 2    | padding              |
//! | 28     | 4    | src_addr_tag         |

pub const ROUTING_CMD_BYTES: usize = 32;

pub const SYS_ADDR_OFFSET: u64 = 0;
pub const DATA_OFFSET: u64 = 8;
pub const FLAGS_OFFSET: u64 = 12;
pub const RACK_OFFSET: u64 = 16;
pub const SRC_ADDR_TAG_OFFSET: u64 = 28;

#[bitfield_struct::bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct CmdFlags {
    pub wr_req: bool,
    pub wr_ack: bool,
    pub rd_req: bool,
    pub rd_data: bool,
    pub data_block_dram: bool,
    #[bits(1)]
    _reserved0: u8,
    pub data_block: bool,
    pub broadcast: bool,
    pub ordered: bool,
    #[bits(1)]
    pub noc_id: u8,
    #[bits(20)]
    _reserved1: u32,
    pub data_block_unavailable: bool,
    pub dest_unreachable: bool,
}

impl CmdFlags {
    pub fn is_error(&self) -> bool {
        self.dest_unreachable() || self.data_block_unavailable()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoutingCommand {
    pub sys_addr: u64,
    pub data: u32,
    pub flags: u32,
    pub rack: u16,
    pub src_resp_buf_index: u16,
    pub local_buf_index: u32,
    pub src_resp_q_id: u8,
    pub host_mem_txn_id: u8,
    pub padding: u16,
    pub src_addr_tag: u32,
}

impl RoutingCommand {
    pub fn cmd_flags(&self) -> CmdFlags {
        CmdFlags::from(self.flags)
    }

    pub fn to_bytes(&self) -> [u8; ROUTING_CMD_BYTES] {
        let mut out = [0u8; ROUTING_CMD_BYTES];
        out[0..8].copy_from_slice(&self.sys_addr.to_le_bytes());
        out[8..12].copy_from_slice(&self.data.to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.to_le_bytes());
        out[16..18].copy_from_slice(&self.rack.to_le_bytes());
        out[18..20].copy_from_slice(&self.src_resp_buf_index.to_le_bytes());
        out[20..24].copy_from_slice(&self.local_buf_index.to_le_bytes());
        out[24] = self.src_resp_q_id;
        out[25] = self.host_mem_txn_id;
        out[26..28].copy_from_slice(&self.padding.to_le_bytes());
        out[28..32].copy_from_slice(&self.src_addr_tag.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; ROUTING_CMD_BYTES]) -> Self {
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };

        RoutingCommand {
            sys_addr: (u32_at(0) as u64) | ((u32_at(4) as u64) << 32),
            data: u32_at(8),
            flags: u32_at(12),
            rack: u16_at(16),
            src_resp_buf_index: u16_at(18),
            local_buf_index: u32_at(20),
            src_resp_q_id: bytes[24],
            host_mem_txn_id: bytes[25],
            padding: u16_at(26),
            src_addr_tag: u32_at(28),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_match_firmware() {
        assert_eq!(u32::from(CmdFlags::new().with_wr_req(true)), 0x1);
        assert_eq!(u32::from(CmdFlags::new().with_wr_ack(true)), 0x2);
        assert_eq!(u32::from(CmdFlags::new().with_rd_req(true)), 0x4);
        assert_eq!(u32::from(CmdFlags::new().with_rd_data(true)), 0x8);
        assert_eq!(u32::from(CmdFlags::new().with_data_block_dram(true)), 1 << 4);
        assert_eq!(u32::from(CmdFlags::new().with_data_block(true)), 1 << 6);
        assert_eq!(u32::from(CmdFlags::new().with_broadcast(true)), 1 << 7);
        assert_eq!(u32::from(CmdFlags::new().with_ordered(true)), 1 << 8);
        assert_eq!(u32::from(CmdFlags::new().with_noc_id(1)), 1 << 9);
        assert_eq!(
            u32::from(CmdFlags::new().with_data_block_unavailable(true)),
            1 << 30
        );
        assert_eq!(u32::from(CmdFlags::new().with_dest_unreachable(true)), 1 << 31);
        assert!(CmdFlags::from(1 << 31).is_error());
        assert!(!CmdFlags::from(0x8).is_error());
    }

    #[test]
    fn slot_layout() {
        let cmd = RoutingCommand {
            sys_addr: 0x0102_0304_0506_0708,
            data: 0xdead_beef,
            flags: 0x44,
            rack: 0x0103,
            src_resp_buf_index: 0x0a0b,
            local_buf_index: 0x1122_3344,
            src_resp_q_id: 0x55,
            host_mem_txn_id: 0x66,
            padding: 0,
            src_addr_tag: 0x7788_99aa,
        };

        let bytes = cmd.to_bytes();
        assert_eq!(&bytes[0..8], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(&bytes[12..16], &[0x44, 0, 0, 0]);
        assert_eq!(&bytes[16..18], &[0x03, 0x01]);
        assert_eq!(bytes[24], 0x55);
        assert_eq!(bytes[25], 0x66);
        assert_eq!(&bytes[28..32], &[0xaa, 0x99, 0x88, 0x77]);

        assert_eq!(RoutingCommand::from_bytes(&bytes), cmd);
        assert!(cmd.cmd_flags().rd_req());
        assert!(cmd.cmd_flags().data_block());
    }
}
