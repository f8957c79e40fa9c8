// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cluster topology discovery and ethernet tunnelled NOC access for Tenstorrent devices.
//!
//! * [`core`] shared identifiers (architecture, board type, ethernet coordinates)
//! * [`api`] discovery, the cluster descriptor and the local/remote device handles
//! * [`kmd`] raw access to `/dev/tenstorrent`
//! * [`pci`] the kernel driver backend for [`api`]

pub use luwen_api as api;
pub use luwen_core as core;
pub use luwen_kmd as kmd;
pub use luwen_pcie as pci;

pub use luwen_api::error::PlatformError;
pub use luwen_api::{
    ClusterDescriptor, DiscoveredCluster, TTDevice, TopologyDiscovery, TopologyDiscoveryOptions,
};
pub use luwen_pcie::discover;
