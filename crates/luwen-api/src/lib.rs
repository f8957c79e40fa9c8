// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0
#![crate_type = "lib"]

pub use cluster::{ClusterDescriptor, EthernetConnection, EthernetEndpoint};
pub use device::arc::{ArcMsg, ArcMsgError, ArcMsgOk, ArcMsgOptions, ArcMsgProtocolError};
pub use device::{DeviceBackend, LocalDevice, PciDeviceInfo, PciEnumerator, RemoteDevice, TTDevice};
pub use noc_port::{select_noc, selected_noc, with_noc, NocId};
pub use remote::{RemoteTransport, RemoteTransportConfig};
pub use topology::{
    discover, DiscoveredCluster, DiscoveryEvent, TopologyDiscovery, TopologyDiscoveryOptions,
};

/// Luwen-api discovers the chips of a Tenstorrent cluster and gives uniform NOC access to each
/// of them. Chips on the host bus are driven through a [`DeviceBackend`], everything else is
/// reached by tunnelling routing commands through the ethernet cores of a host bus chip.
///

pub mod cluster;
pub mod device;
pub mod error;
pub mod eth_addr;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod noc_addr;
pub mod noc_port;
pub mod queue;
pub mod remote;
pub mod topology;
