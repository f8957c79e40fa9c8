// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Uniform access to one chip, whether it sits on the host bus or behind an ethernet tunnel.

pub mod arc;
pub mod spi;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use luwen_core::{Arch, EthCoord};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PlatformError;
use crate::noc_port::{selected_noc, NocId};
use crate::remote::{RemoteTransport, RemoteTransportConfig, TunnelState};

pub use arc::{ArcMsg, ArcMsgOk, ArcMsgOptions};

/// Largest single NOC transfer issued by the default dma implementation.
pub const DMA_CHUNK_SIZE: usize = 1 << 20;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDeviceInfo {
    pub interface_id: usize,
    pub vendor_id: u16,
    pub device_id: u16,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    /// domain:bus:slot.function
    pub bdf: String,
    pub arch: Arch,
}

/// Host bus access to one directly attached chip.
pub trait DeviceBackend: Send + Sync {
    fn info(&self) -> &PciDeviceInfo;

    fn noc_read(
        &self,
        noc: NocId,
        core: (u8, u8),
        addr: u64,
        data: &mut [u8],
    ) -> Result<(), PlatformError>;

    fn noc_write(
        &self,
        noc: NocId,
        core: (u8, u8),
        addr: u64,
        data: &[u8],
    ) -> Result<(), PlatformError>;

    fn noc_read32(&self, noc: NocId, core: (u8, u8), addr: u64) -> Result<u32, PlatformError> {
        let mut value = [0u8; 4];
        self.noc_read(noc, core, addr, &mut value)?;
        Ok(u32::from_le_bytes(value))
    }

    fn noc_write32(
        &self,
        noc: NocId,
        core: (u8, u8),
        addr: u64,
        value: u32,
    ) -> Result<(), PlatformError> {
        self.noc_write(noc, core, addr, &value.to_le_bytes())
    }

    /// Bulk transfer, backends with a dma engine override this.
    fn dma_read(
        &self,
        noc: NocId,
        core: (u8, u8),
        addr: u64,
        data: &mut [u8],
    ) -> Result<(), PlatformError> {
        for (i, chunk) in data.chunks_mut(DMA_CHUNK_SIZE).enumerate() {
            self.noc_read(noc, core, addr + (i * DMA_CHUNK_SIZE) as u64, chunk)?;
        }
        Ok(())
    }

    fn dma_write(
        &self,
        noc: NocId,
        core: (u8, u8),
        addr: u64,
        data: &[u8],
    ) -> Result<(), PlatformError> {
        for (i, chunk) in data.chunks(DMA_CHUNK_SIZE).enumerate() {
            self.noc_write(noc, core, addr + (i * DMA_CHUNK_SIZE) as u64, chunk)?;
        }
        Ok(())
    }
}

/// Lists and opens the chips attached to the host bus.
///
/// An empty `targets` set selects every device.
pub trait PciEnumerator {
    fn enumerate_devices(&self, targets: &BTreeSet<usize>) -> Result<Vec<usize>, PlatformError>;

    fn enumerate_devices_info(
        &self,
        targets: &BTreeSet<usize>,
    ) -> Result<BTreeMap<usize, PciDeviceInfo>, PlatformError>;

    fn open(&self, interface_id: usize) -> Result<Arc<dyn DeviceBackend>, PlatformError>;
}

/// A chip mapped over the host bus.
pub struct LocalDevice {
    backend: Arc<dyn DeviceBackend>,
    initialized: AtomicBool,
    tunnels: Mutex<HashMap<(u8, u8), Arc<TunnelState>>>,
}

impl std::fmt::Debug for LocalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDevice")
            .field("info", self.backend.info())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl LocalDevice {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        LocalDevice {
            backend,
            initialized: AtomicBool::new(false),
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    pub fn open(
        enumerator: &dyn PciEnumerator,
        interface_id: usize,
    ) -> Result<Self, PlatformError> {
        Ok(Self::new(enumerator.open(interface_id)?))
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    pub fn info(&self) -> &PciDeviceInfo {
        self.backend.info()
    }

    pub fn arch(&self) -> Arch {
        self.backend.info().arch
    }

    pub fn interface_id(&self) -> usize {
        self.backend.info().interface_id
    }

    fn name(&self) -> String {
        format!("pci device {}", self.interface_id())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn init(&self) -> Result<(), PlatformError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(PlatformError::AlreadyInitialized {
                device: self.name(),
            });
        }
        debug!("Initialized {} ({})", self.name(), self.info().bdf);
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<(), PlatformError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(PlatformError::NotInitialized {
                device: self.name(),
            })
        }
    }

    /// Locks shared by everything tunnelling through `eth_core`.
    pub(crate) fn tunnel_state(&self, eth_core: (u8, u8)) -> Arc<TunnelState> {
        let mut tunnels = self
            .tunnels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tunnels.entry(eth_core).or_default().clone()
    }

    pub fn noc_read(
        &self,
        core: (u8, u8),
        addr: u64,
        data: &mut [u8],
    ) -> Result<(), PlatformError> {
        self.ensure_initialized()?;
        self.backend.noc_read(selected_noc(), core, addr, data)
    }

    pub fn noc_write(&self, core: (u8, u8), addr: u64, data: &[u8]) -> Result<(), PlatformError> {
        self.ensure_initialized()?;
        self.backend.noc_write(selected_noc(), core, addr, data)
    }

    pub fn noc_read32(&self, core: (u8, u8), addr: u64) -> Result<u32, PlatformError> {
        self.ensure_initialized()?;
        self.backend.noc_read32(selected_noc(), core, addr)
    }

    pub fn noc_write32(&self, core: (u8, u8), addr: u64, value: u32) -> Result<(), PlatformError> {
        self.ensure_initialized()?;
        self.backend.noc_write32(selected_noc(), core, addr, value)
    }

    pub fn dma_read(
        &self,
        core: (u8, u8),
        addr: u64,
        data: &mut [u8],
    ) -> Result<(), PlatformError> {
        self.ensure_initialized()?;
        self.backend.dma_read(selected_noc(), core, addr, data)
    }

    pub fn dma_write(&self, core: (u8, u8), addr: u64, data: &[u8]) -> Result<(), PlatformError> {
        self.ensure_initialized()?;
        self.backend.dma_write(selected_noc(), core, addr, data)
    }
}

/// A chip reached through an ethernet core of a [`LocalDevice`].
pub struct RemoteDevice {
    target: EthCoord,
    transport: RemoteTransport,
    initialized: AtomicBool,
}

impl std::fmt::Debug for RemoteDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDevice")
            .field("target", &self.target)
            .field("via", &self.transport.local().interface_id())
            .field("eth_core", &self.transport.eth_core())
            .finish()
    }
}

impl RemoteDevice {
    /// The entry chip must already be initialized.
    pub fn new(
        local: Arc<LocalDevice>,
        target: EthCoord,
        eth_core: (u8, u8),
        config: RemoteTransportConfig,
    ) -> Result<Self, PlatformError> {
        local.ensure_initialized()?;
        if !local.arch().is_wormhole() {
            return Err(PlatformError::unsupported("ethernet tunnelling", local.arch()));
        }

        Ok(RemoteDevice {
            target,
            transport: RemoteTransport::new(local, eth_core, config),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn target(&self) -> &EthCoord {
        &self.target
    }

    pub fn transport(&self) -> &RemoteTransport {
        &self.transport
    }

    pub fn local(&self) -> &Arc<LocalDevice> {
        self.transport.local()
    }

    pub fn arch(&self) -> Arch {
        self.local().arch()
    }

    fn name(&self) -> String {
        format!(
            "remote chip {} via pci device {}",
            self.target,
            self.local().interface_id()
        )
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Bind the tunnel: drop any responses a previous user left behind.
    pub fn init(&self) -> Result<(), PlatformError> {
        if self.initialized.load(Ordering::Acquire) {
            return Err(PlatformError::AlreadyInitialized {
                device: self.name(),
            });
        }
        self.transport.fixup_response_queue()?;
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(PlatformError::AlreadyInitialized {
                device: self.name(),
            });
        }
        debug!(
            "Bound {} to ethernet core ({}, {})",
            self.name(),
            self.transport.eth_core().0,
            self.transport.eth_core().1
        );
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<(), PlatformError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(PlatformError::NotInitialized {
                device: self.name(),
            })
        }
    }

    pub fn noc_read(
        &self,
        core: (u8, u8),
        addr: u64,
        data: &mut [u8],
    ) -> Result<(), PlatformError> {
        self.ensure_initialized()?;
        self.transport.read(&self.target, core, addr, data)
    }

    pub fn noc_write(&self, core: (u8, u8), addr: u64, data: &[u8]) -> Result<(), PlatformError> {
        self.ensure_initialized()?;
        self.transport.write(&self.target, core, addr, data)
    }

    pub fn noc_read32(&self, core: (u8, u8), addr: u64) -> Result<u32, PlatformError> {
        self.ensure_initialized()?;
        self.transport.read32(&self.target, core, addr)
    }

    pub fn noc_write32(&self, core: (u8, u8), addr: u64, value: u32) -> Result<(), PlatformError> {
        self.ensure_initialized()?;
        self.transport.write32(&self.target, core, addr, value)
    }

    pub fn wait_for_flush(&self) -> Result<(), PlatformError> {
        self.ensure_initialized()?;
        self.transport.wait_for_flush()
    }
}

/// Handle used by everything above the transport.
#[derive(Debug)]
pub enum TTDevice {
    Local(Arc<LocalDevice>),
    Remote(RemoteDevice),
}

impl From<LocalDevice> for TTDevice {
    fn from(value: LocalDevice) -> Self {
        TTDevice::Local(Arc::new(value))
    }
}

impl From<Arc<LocalDevice>> for TTDevice {
    fn from(value: Arc<LocalDevice>) -> Self {
        TTDevice::Local(value)
    }
}

impl From<RemoteDevice> for TTDevice {
    fn from(value: RemoteDevice) -> Self {
        TTDevice::Remote(value)
    }
}

impl TTDevice {
    pub fn init_tt_device(&self) -> Result<(), PlatformError> {
        match self {
            TTDevice::Local(local) => local.init(),
            TTDevice::Remote(remote) => remote.init(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        match self {
            TTDevice::Local(local) => local.is_initialized(),
            TTDevice::Remote(remote) => remote.is_initialized(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, TTDevice::Remote(_))
    }

    pub fn arch(&self) -> Arch {
        match self {
            TTDevice::Local(local) => local.arch(),
            TTDevice::Remote(remote) => remote.arch(),
        }
    }

    /// The directly attached chip that carries this device's traffic.
    pub fn local(&self) -> &Arc<LocalDevice> {
        match self {
            TTDevice::Local(local) => local,
            TTDevice::Remote(remote) => remote.local(),
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteDevice> {
        match self {
            TTDevice::Local(_) => None,
            TTDevice::Remote(remote) => Some(remote),
        }
    }

    pub fn noc_read(
        &self,
        core: (u8, u8),
        addr: u64,
        data: &mut [u8],
    ) -> Result<(), PlatformError> {
        match self {
            TTDevice::Local(local) => local.noc_read(core, addr, data),
            TTDevice::Remote(remote) => remote.noc_read(core, addr, data),
        }
    }

    pub fn noc_write(&self, core: (u8, u8), addr: u64, data: &[u8]) -> Result<(), PlatformError> {
        match self {
            TTDevice::Local(local) => local.noc_write(core, addr, data),
            TTDevice::Remote(remote) => remote.noc_write(core, addr, data),
        }
    }

    pub fn noc_read32(&self, core: (u8, u8), addr: u64) -> Result<u32, PlatformError> {
        match self {
            TTDevice::Local(local) => local.noc_read32(core, addr),
            TTDevice::Remote(remote) => remote.noc_read32(core, addr),
        }
    }

    pub fn noc_write32(&self, core: (u8, u8), addr: u64, value: u32) -> Result<(), PlatformError> {
        match self {
            TTDevice::Local(local) => local.noc_write32(core, addr, value),
            TTDevice::Remote(remote) => remote.noc_write32(core, addr, value),
        }
    }

    pub fn dma_read(
        &self,
        core: (u8, u8),
        addr: u64,
        data: &mut [u8],
    ) -> Result<(), PlatformError> {
        match self {
            TTDevice::Local(local) => local.dma_read(core, addr, data),
            TTDevice::Remote(remote) => remote.noc_read(core, addr, data),
        }
    }

    pub fn dma_write(&self, core: (u8, u8), addr: u64, data: &[u8]) -> Result<(), PlatformError> {
        match self {
            TTDevice::Local(local) => local.dma_write(core, addr, data),
            TTDevice::Remote(remote) => remote.noc_write(core, addr, data),
        }
    }

    pub fn spi_read(&self, addr: u32, data: &mut [u8]) -> Result<(), PlatformError> {
        spi::spi_read(self, addr, data)
    }

    pub fn spi_write(&self, addr: u32, data: &[u8]) -> Result<(), PlatformError> {
        spi::spi_write(self, addr, data)
    }

    pub fn arc_msg(&self, options: &ArcMsgOptions) -> Result<ArcMsgOk, PlatformError> {
        arc::arc_msg(self, options)
    }

    /// Block until posted writes have landed. A no-op for local devices.
    pub fn wait_for_flush(&self) -> Result<(), PlatformError> {
        match self {
            TTDevice::Local(local) => local.ensure_initialized(),
            TTDevice::Remote(remote) => remote.wait_for_flush(),
        }
    }
}
