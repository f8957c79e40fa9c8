// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Display;
use std::time::Duration;

use luwen_core::{Arch, ChipId, EthernetChannel};
use thiserror::Error;

use crate::device::arc::ArcMsgError;

#[derive(Debug)]
pub struct BtWrapper(pub std::backtrace::Backtrace);

impl BtWrapper {
    #[inline(always)]
    pub fn capture() -> Self {
        Self(std::backtrace::Backtrace::capture())
    }
}

impl Display for BtWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let std::backtrace::BacktraceStatus::Captured = self.0.status() {
            self.0.fmt(f)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("No devices found")]
    NoDevicesFound,

    #[error("Ethernet channel {channel} on chip {chip} did not finish training")]
    LinkNotTrained {
        chip: ChipId,
        channel: EthernetChannel,
    },

    #[error("{queue} on core ({}, {}) stayed full for {waited:?}", .core.0, .core.1)]
    QueueFull {
        core: (u8, u8),
        queue: &'static str,
        waited: Duration,
    },

    #[error("Timed out after {waited:?} waiting for a response from core ({}, {})", .core.0, .core.1)]
    ResponseTimeout { core: (u8, u8), waited: Duration },

    #[error("{operation} is not supported on {arch}")]
    UnsupportedOperation { operation: String, arch: Arch },

    #[error("Hardware fault on device {device}: {message}\n{backtrace}")]
    HardwareFault {
        device: usize,
        message: String,
        backtrace: BtWrapper,
    },

    #[error("Value 0x{value:x} does not fit in the {bits} bit {field} field")]
    AddressFieldOverflow {
        field: &'static str,
        value: u64,
        bits: u32,
    },

    #[error("Destination Unreachable.")]
    DestinationUnreachable,

    #[error("Unable to reserve data block on destination route.")]
    DataBlockUnavailable,

    #[error("Unexpected response flags 0x{flags:08x}, expected 0x{expected:08x}")]
    UnexpectedResponse { flags: u32, expected: u32 },

    #[error("Unsupported fw version, got {} but required {required:x}", version.map(|v| format!("{v:x}")).unwrap_or("<unknown version>".to_string()))]
    UnsupportedFwVersion { version: Option<u32>, required: u32 },

    #[error("{device} has already been initialized")]
    AlreadyInitialized { device: String },

    #[error("{device} must be initialized before use")]
    NotInitialized { device: String },

    #[error("Chip {0} is not part of the cluster")]
    ChipNotFound(ChipId),

    #[error(transparent)]
    ArcMsg(#[from] ArcMsgError),

    #[error("Invalid cluster descriptor: {0}")]
    Descriptor(String),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}\n{1}")]
    Generic(String, BtWrapper),
}

impl PlatformError {
    /// Transport backpressure that a caller may simply try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlatformError::QueueFull { .. } | PlatformError::ResponseTimeout { .. }
        )
    }

    pub fn hardware_fault(device: usize, message: impl Into<String>) -> Self {
        PlatformError::HardwareFault {
            device,
            message: message.into(),
            backtrace: BtWrapper::capture(),
        }
    }

    pub fn unsupported(operation: impl Into<String>, arch: Arch) -> Self {
        PlatformError::UnsupportedOperation {
            operation: operation.into(),
            arch,
        }
    }
}

impl From<String> for PlatformError {
    #[inline]
    fn from(e: String) -> Self {
        Self::Generic(e, BtWrapper::capture())
    }
}
