// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use luwen_api::error::PlatformError;
use luwen_kmd::{PciError, PciOpenError};

/// A dead link (all ones from the ARC scratch sentinel) is a hardware fault, the caller can
/// keep using the other chips.
pub fn pci_error(interface_id: usize, err: PciError) -> PlatformError {
    match err {
        PciError::BrokenConnection => PlatformError::hardware_fault(interface_id, err.to_string()),
        PciError::DeviceOpenError(err) => open_error(err),
        err => PlatformError::from(format!("pci device {interface_id}: {err}")),
    }
}

pub fn open_error(err: PciOpenError) -> PlatformError {
    match err {
        PciOpenError::DeviceOpenFailed { id, source } => PlatformError::Io(std::io::Error::new(
            source.kind(),
            format!("/dev/tenstorrent/{id}: {source}"),
        )),
        err => PlatformError::from(err.to_string()),
    }
}
