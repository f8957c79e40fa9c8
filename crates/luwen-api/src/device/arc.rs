// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wormhole ARC message mailbox.

use std::time::Duration;

use thiserror::Error;

use crate::error::{BtWrapper, PlatformError};

use super::TTDevice;

pub const ARC_CORE: (u8, u8) = (0, 10);
pub const ARC_RESET_SCRATCH_BASE: u64 = 0x8_8003_0060;
pub const ARC_MISC_CNTL: u64 = 0x8_8003_0100;
pub const ARC_MISC_CNTL_IRQ: u32 = 1 << 16;
pub const ARC_CSM_DATA_BASE: u64 = 0x8_1000_0000;

pub const MSG_REG: u64 = 5;
pub const RETURN_REG: u64 = 3;
pub const MSG_ERROR_REPLY: u32 = 0xffffffff;

pub const DEFAULT_ARC_MSG_TIMEOUT: Duration = Duration::from_secs(1);

pub fn scratch_addr(reg: u64) -> u64 {
    ARC_RESET_SCRATCH_BASE + reg * 4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcMsg {
    Nop,
    Test { arg: u32 },
    ArcGoToSleep,
    GetAiclk,
    GetHarvesting,
    GetSpiDumpAddr,
    SpiRead { addr: u32 },
    SpiWrite,
}

impl ArcMsg {
    pub fn msg_code(&self) -> u16 {
        let code = match self {
            ArcMsg::Nop => 0x11,
            ArcMsg::ArcGoToSleep => 0x55,
            ArcMsg::Test { .. } => 0x90,
            ArcMsg::GetAiclk => 0x34,
            ArcMsg::GetHarvesting => 0x57,
            ArcMsg::GetSpiDumpAddr => 0x29,
            ArcMsg::SpiRead { .. } => 0x2A,
            ArcMsg::SpiWrite => 0x2B,
        };

        0xaa00 | code
    }

    pub fn args(&self) -> (u16, u16) {
        match self {
            ArcMsg::Test { arg } | ArcMsg::SpiRead { addr: arg } => {
                ((arg & 0xFFFF) as u16, ((arg >> 16) & 0xFFFF) as u16)
            }
            ArcMsg::SpiWrite => (0xFFFF, 0xFFFF),
            ArcMsg::Nop
            | ArcMsg::ArcGoToSleep
            | ArcMsg::GetAiclk
            | ArcMsg::GetHarvesting
            | ArcMsg::GetSpiDumpAddr => (0, 0),
        }
    }

    /// Decode a mailbox write, `None` for codes this crate never sends.
    pub fn from_values(msg: u32, arg0: u16, arg1: u16) -> Option<Self> {
        let arg = ((arg1 as u32) << 16) | arg0 as u32;
        let msg = match msg & 0xFF {
            0x11 => ArcMsg::Nop,
            0x55 => ArcMsg::ArcGoToSleep,
            0x90 => ArcMsg::Test { arg },
            0x34 => ArcMsg::GetAiclk,
            0x57 => ArcMsg::GetHarvesting,
            0x29 => ArcMsg::GetSpiDumpAddr,
            0x2A => ArcMsg::SpiRead { addr: arg },
            0x2B => ArcMsg::SpiWrite,
            _ => return None,
        };
        Some(msg)
    }
}

#[derive(Error, Debug)]
pub enum ArcMsgProtocolError {
    #[error("Message {0:#x} not recognized")]
    MsgNotRecognized(u16),
    #[error("Timed out while waiting {0:?} for ARC to respond")]
    Timeout(Duration),
    #[error("ARC is asleep")]
    ArcAsleep,
    #[error("Failed to trigger FW interrupt")]
    FwIntFailed,
}

impl ArcMsgProtocolError {
    #[inline(always)]
    pub fn into_error(self) -> ArcMsgError {
        ArcMsgError::ProtocolError {
            source: self,
            backtrace: BtWrapper::capture(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ArcMsgError {
    #[error("{source}\n{backtrace}")]
    ProtocolError {
        source: ArcMsgProtocolError,
        backtrace: BtWrapper,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcMsgOk {
    Ok { rc: u32, arg: u32 },
    OkNoWait,
}

impl ArcMsgOk {
    pub fn arg(&self) -> Option<u32> {
        match self {
            ArcMsgOk::Ok { arg, .. } => Some(*arg),
            ArcMsgOk::OkNoWait => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ArcMsgOptions {
    pub msg: ArcMsg,
    pub wait_for_done: bool,
    pub timeout: Duration,
}

impl Default for ArcMsgOptions {
    fn default() -> Self {
        ArcMsgOptions {
            msg: ArcMsg::Nop,
            wait_for_done: true,
            timeout: DEFAULT_ARC_MSG_TIMEOUT,
        }
    }
}

/// Returns true if a new interrupt was raised, false if the firmware is still busy with the
/// previous one. The handler only takes a few dozen cycles so false usually means ARC is hung.
fn trigger_fw_int(device: &TTDevice) -> Result<bool, PlatformError> {
    let misc = device.noc_read32(ARC_CORE, ARC_MISC_CNTL)?;

    if misc & ARC_MISC_CNTL_IRQ != 0 {
        return Ok(false);
    }

    device.noc_write32(ARC_CORE, ARC_MISC_CNTL, misc | ARC_MISC_CNTL_IRQ)?;

    Ok(true)
}

pub fn arc_msg(device: &TTDevice, options: &ArcMsgOptions) -> Result<ArcMsgOk, PlatformError> {
    if !device.arch().is_wormhole() {
        return Err(PlatformError::unsupported("arc_msg", device.arch()));
    }

    let msg = &options.msg;
    let (arg0, arg1) = msg.args();
    let code = msg.msg_code();

    let current_code = device.noc_read32(ARC_CORE, scratch_addr(MSG_REG))?;
    if (current_code & 0xFFFF) as u16 == ArcMsg::ArcGoToSleep.msg_code() {
        Err(ArcMsgProtocolError::ArcAsleep.into_error())?;
    }

    device.noc_write32(
        ARC_CORE,
        scratch_addr(RETURN_REG),
        arg0 as u32 | ((arg1 as u32) << 16),
    )?;
    device.noc_write32(ARC_CORE, scratch_addr(MSG_REG), code as u32)?;

    if !trigger_fw_int(device)? {
        Err(ArcMsgProtocolError::FwIntFailed.into_error())?;
    }

    if options.wait_for_done {
        let start = std::time::Instant::now();
        loop {
            let status = device.noc_read32(ARC_CORE, scratch_addr(MSG_REG))?;
            if (status & 0xFFFF) as u16 == code & 0xFF {
                let exit_code = (status >> 16) & 0xFFFF;
                let arg = device.noc_read32(ARC_CORE, scratch_addr(RETURN_REG))?;

                return Ok(ArcMsgOk::Ok { rc: exit_code, arg });
            } else if status == MSG_ERROR_REPLY {
                Err(ArcMsgProtocolError::MsgNotRecognized(code).into_error())?;
            }

            std::thread::sleep(Duration::from_millis(1));
            if start.elapsed() > options.timeout {
                Err(ArcMsgProtocolError::Timeout(options.timeout).into_error())?;
            }
        }
    }

    Ok(ArcMsgOk::OkNoWait)
}
