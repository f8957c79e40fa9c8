// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Process local identifier for a chip, assigned during discovery.
pub type ChipId = u32;

/// Index into the ethernet core list of a chip.
pub type EthernetChannel = u32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown architecture {0:?}")]
    UnknownArch(String),

    #[error("Unknown board type {0:?}")]
    UnknownBoardType(String),

    #[error("Unknown io device type {0:?}")]
    UnknownIoDeviceType(String),
}

#[derive(Clone, Hash, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "grayskull")]
    Grayskull,
    #[serde(rename = "wormhole_b0", alias = "wormhole", alias = "WORMHOLE_B0")]
    Wormhole,
    #[serde(rename = "blackhole", alias = "BLACKHOLE")]
    Blackhole,
}

impl Default for Arch {
    fn default() -> Self {
        Self::Wormhole
    }
}

impl Arch {
    pub fn is_wormhole(&self) -> bool {
        matches!(self, Arch::Wormhole)
    }

    pub fn is_grayskull(&self) -> bool {
        matches!(self, Arch::Grayskull)
    }

    pub fn is_blackhole(&self) -> bool {
        matches!(self, Arch::Blackhole)
    }

    /// Map a PCI device id onto the architecture it belongs to.
    pub fn from_pci_device_id(device_id: u16) -> Option<Self> {
        match device_id {
            0xfaca => Some(Arch::Grayskull),
            0x401e => Some(Arch::Wormhole),
            0xb140 => Some(Arch::Blackhole),
            _ => None,
        }
    }
}

impl FromStr for Arch {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "grayskull" => Ok(Arch::Grayskull),
            "wormhole" | "wormhole_b0" => Ok(Arch::Wormhole),
            "blackhole" => Ok(Arch::Blackhole),
            _ => Err(ParseError::UnknownArch(s.to_string())),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::Grayskull => write!(f, "Grayskull"),
            Arch::Wormhole => write!(f, "Wormhole"),
            Arch::Blackhole => write!(f, "Blackhole"),
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardType {
    N150,
    N300,
    P100,
    P150,
    P300,
    Galaxy,
    Ubb,
    Unknown,
}

impl BoardType {
    /// Decode the board type from the UPI field of a board id.
    pub fn from_board_id(board_id: u64) -> Self {
        match (board_id >> 36) & 0xFFFFF {
            0x14 => BoardType::N300,
            0x18 => BoardType::N150,
            0x35 => BoardType::Galaxy,
            0x36 => BoardType::P100,
            0x40 | 0x41 => BoardType::P150,
            0x44 => BoardType::P300,
            0x47 => BoardType::Ubb,
            _ => BoardType::Unknown,
        }
    }

    /// Number of chips that share one board id.
    pub fn chips_per_board(&self) -> usize {
        match self {
            BoardType::N300 | BoardType::P300 => 2,
            BoardType::Galaxy | BoardType::Ubb => 32,
            _ => 1,
        }
    }
}

impl FromStr for BoardType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "n150" => Ok(BoardType::N150),
            "n300" => Ok(BoardType::N300),
            "p100" => Ok(BoardType::P100),
            "p150" => Ok(BoardType::P150),
            "p300" => Ok(BoardType::P300),
            "galaxy" | "galaxy-wormhole" => Ok(BoardType::Galaxy),
            "ubb" => Ok(BoardType::Ubb),
            "unknown" => Ok(BoardType::Unknown),
            _ => Err(ParseError::UnknownBoardType(s.to_string())),
        }
    }
}

impl fmt::Display for BoardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BoardType::N150 => "n150",
            BoardType::N300 => "n300",
            BoardType::P100 => "p100",
            BoardType::P150 => "p150",
            BoardType::P300 => "p300",
            BoardType::Galaxy => "galaxy",
            BoardType::Ubb => "ubb",
            BoardType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Physical location of a chip inside an ethernet connected cluster.
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EthCoord {
    pub cluster_id: u32,
    pub x: u8,
    pub y: u8,
    pub rack: u8,
    pub shelf: u8,
}

impl EthCoord {
    pub fn new(x: u8, y: u8, rack: u8, shelf: u8) -> Self {
        EthCoord {
            cluster_id: 0,
            x,
            y,
            rack,
            shelf,
        }
    }
}

impl fmt::Display for EthCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[x: {}, y: {}, rack: {}, shelf: {}]",
            self.x, self.y, self.rack, self.shelf
        )
    }
}

/// How the host reaches the mmio capable chips of a cluster.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoDeviceType {
    #[default]
    #[serde(rename = "PCIe", alias = "pcie")]
    Pcie,
    #[serde(rename = "JTAG", alias = "jtag")]
    Jtag,
}

impl FromStr for IoDeviceType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pcie" => Ok(IoDeviceType::Pcie),
            "jtag" => Ok(IoDeviceType::Jtag),
            _ => Err(ParseError::UnknownIoDeviceType(s.to_string())),
        }
    }
}

impl fmt::Display for IoDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoDeviceType::Pcie => write!(f, "PCIe"),
            IoDeviceType::Jtag => write!(f, "JTAG"),
        }
    }
}

/// Disabled (harvested) units of a chip, one bit per row or core.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestingMasks {
    #[serde(default)]
    pub tensix: u32,
    #[serde(default)]
    pub dram: u32,
    #[serde(default)]
    pub eth: u32,
    #[serde(default)]
    pub pcie: u32,
    #[serde(default)]
    pub l2cpu: u32,
}

impl HarvestingMasks {
    pub fn tensix_only(tensix: u32) -> Self {
        HarvestingMasks {
            tensix,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_parse_and_serde() {
        assert_eq!("wormhole_b0".parse::<Arch>(), Ok(Arch::Wormhole));
        assert_eq!("Wormhole".parse::<Arch>(), Ok(Arch::Wormhole));
        assert!("quasar".parse::<Arch>().is_err());

        let yaml = serde_yaml::to_string(&Arch::Wormhole).unwrap();
        assert_eq!(yaml.trim(), "wormhole_b0");
        let arch: Arch = serde_yaml::from_str("wormhole").unwrap();
        assert_eq!(arch, Arch::Wormhole);
    }

    #[test]
    fn board_type_from_upi() {
        assert_eq!(BoardType::from_board_id(0x14 << 36 | 0x1234), BoardType::N300);
        assert_eq!(BoardType::from_board_id(0x18 << 36), BoardType::N150);
        assert_eq!(BoardType::from_board_id(0x35 << 36), BoardType::Galaxy);
        assert_eq!(BoardType::from_board_id(0), BoardType::Unknown);
        assert_eq!(BoardType::N300.chips_per_board(), 2);
    }

    #[test]
    fn io_device_type_roundtrip() {
        assert_eq!("jtag".parse::<IoDeviceType>(), Ok(IoDeviceType::Jtag));
        assert_eq!(IoDeviceType::default().to_string(), "PCIe");
        let parsed: IoDeviceType = serde_yaml::from_str("PCIe").unwrap();
        assert_eq!(parsed, IoDeviceType::Pcie);
    }
}
