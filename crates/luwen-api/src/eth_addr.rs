// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wormhole ethernet core layout and the erisc firmware's L1 address map.

use luwen_core::{EthCoord, EthernetChannel};

use crate::error::PlatformError;

/// NOC0 location of every ethernet core, indexed by channel.
pub const WH_ETH_CORES: [(u8, u8); 16] = [
    (9, 0),
    (1, 0),
    (8, 0),
    (2, 0),
    (7, 0),
    (3, 0),
    (6, 0),
    (4, 0),
    (9, 6),
    (1, 6),
    (8, 6),
    (2, 6),
    (7, 6),
    (3, 6),
    (6, 6),
    (4, 6),
];

pub const ETH_FW_VERSION_ADDR: u64 = 0x210;
pub const MIN_ETH_FW_VERSION: u32 = 0x060000;

pub const ETH_TRAINED: u32 = 1;

pub const PORT_UNKNOWN: u32 = 0;
pub const PORT_UNCONNECTED: u32 = 1;
pub const PORT_UP: u32 = 2;

const LOCAL_COORD_WORD: u64 = 2;
const TRAINING_STATUS_WORD: u64 = 1;
const REMOTE_SHELF_WORD: u64 = 9;
const REMOTE_RACK_WORD: u64 = 10;

pub fn eth_channel_of_core(core: (u8, u8)) -> Option<EthernetChannel> {
    WH_ETH_CORES
        .iter()
        .position(|&c| c == core)
        .map(|chan| chan as EthernetChannel)
}

pub fn eth_core_of_channel(channel: EthernetChannel) -> Option<(u8, u8)> {
    WH_ETH_CORES.get(channel as usize).copied()
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EthAddresses {
    pub masked_version: u32,

    pub version: u64,
    pub node_info: u64,
    pub eth_conn_info: u64,
    pub results_buf: u64,
    pub heartbeat: u64,
    pub erisc_remote_board_type_offset: u64,
    pub erisc_local_board_type_offset: u64,
    pub erisc_remote_board_id_lo_offset: u64,
    pub erisc_local_board_id_lo_offset: u64,
    pub erisc_remote_eth_id_offset: u64,
}

impl EthAddresses {
    pub fn new(fw_version: u32) -> Result<Self, PlatformError> {
        let masked_version = fw_version & 0x00FFFFFF;

        if masked_version < MIN_ETH_FW_VERSION {
            return Err(PlatformError::UnsupportedFwVersion {
                version: Some(fw_version),
                required: MIN_ETH_FW_VERSION,
            });
        }

        let erisc_remote_board_type_offset;
        let erisc_local_board_type_offset;
        let erisc_remote_board_id_lo_offset;
        let erisc_local_board_id_lo_offset;
        let erisc_remote_eth_id_offset;

        if masked_version >= 0x06C000 {
            erisc_remote_board_type_offset = 77;
            erisc_local_board_type_offset = 69;
            erisc_remote_board_id_lo_offset = 72;
            erisc_local_board_id_lo_offset = 64;
            erisc_remote_eth_id_offset = 76;
        } else {
            erisc_remote_board_type_offset = 72;
            erisc_local_board_type_offset = 64;
            erisc_remote_board_id_lo_offset = 73;
            erisc_local_board_id_lo_offset = 65;
            erisc_remote_eth_id_offset = 77;
        }

        Ok(EthAddresses {
            masked_version,
            version: ETH_FW_VERSION_ADDR,
            node_info: 0x1100,
            eth_conn_info: 0x1200,
            results_buf: 0x1ec0,
            heartbeat: 0x1c,
            erisc_remote_board_type_offset,
            erisc_local_board_type_offset,
            erisc_remote_board_id_lo_offset,
            erisc_local_board_id_lo_offset,
            erisc_remote_eth_id_offset,
        })
    }

    pub fn training_status(&self) -> u64 {
        self.node_info + 4 * TRAINING_STATUS_WORD
    }

    pub fn port_status(&self, channel: EthernetChannel) -> u64 {
        self.eth_conn_info + 4 * channel as u64
    }

    pub fn local_coord(&self) -> u64 {
        self.node_info + 4 * LOCAL_COORD_WORD
    }

    pub fn remote_shelf(&self) -> u64 {
        self.node_info + 4 * REMOTE_SHELF_WORD
    }

    pub fn remote_rack(&self) -> u64 {
        self.node_info + 4 * REMOTE_RACK_WORD
    }

    /// Address of a word in the erisc results buffer.
    pub fn result_word(&self, offset: u64) -> u64 {
        self.results_buf + 4 * offset
    }
}

pub fn decode_local_coord(word: u32) -> EthCoord {
    EthCoord {
        cluster_id: 0,
        rack: (word & 0xFF) as u8,
        shelf: ((word >> 8) & 0xFF) as u8,
        x: ((word >> 16) & 0xFF) as u8,
        y: ((word >> 24) & 0xFF) as u8,
    }
}

pub fn encode_local_coord(coord: &EthCoord) -> u32 {
    (coord.rack as u32)
        | ((coord.shelf as u32) << 8)
        | ((coord.x as u32) << 16)
        | ((coord.y as u32) << 24)
}

/// Neighbour location from the rack and shelf words of `node_info`.
pub fn decode_remote_coord(rack_word: u32, shelf_word: u32) -> EthCoord {
    EthCoord {
        cluster_id: 0,
        rack: (rack_word & 0xFF) as u8,
        shelf: ((rack_word >> 8) & 0xFF) as u8,
        x: ((shelf_word >> 16) & 0x3F) as u8,
        y: ((shelf_word >> 22) & 0x3F) as u8,
    }
}

/// NOC0 location of the ethernet core on the far side of the link.
pub fn decode_remote_eth_core(shelf_word: u32) -> (u8, u8) {
    (
        ((shelf_word >> 4) & 0x3F) as u8,
        ((shelf_word >> 10) & 0x3F) as u8,
    )
}

/// Inverse of [`decode_remote_coord`] and [`decode_remote_eth_core`], returns (rack word, shelf word).
pub fn encode_remote_words(coord: &EthCoord, remote_core: (u8, u8)) -> (u32, u32) {
    let rack_word = (coord.rack as u32) | ((coord.shelf as u32) << 8);
    let shelf_word = (((remote_core.0 & 0x3F) as u32) << 4)
        | (((remote_core.1 & 0x3F) as u32) << 10)
        | (((coord.x & 0x3F) as u32) << 16)
        | (((coord.y & 0x3F) as u32) << 22);
    (rack_word, shelf_word)
}
