// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use luwen_api::TopologyDiscoveryOptions;
use luwen_core::IoDeviceType;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DeviceType {
    Pcie,
    Jtag,
}

impl From<DeviceType> for IoDeviceType {
    fn from(value: DeviceType) -> Self {
        match value {
            DeviceType::Pcie => IoDeviceType::Pcie,
            DeviceType::Jtag => IoDeviceType::Jtag,
        }
    }
}

/// Discover the cluster and write its descriptor as YAML.
#[derive(Parser)]
#[command(version)]
pub struct CmdArgs {
    /// Where to write the cluster descriptor.
    #[arg(short, long, default_value = "cluster_descriptor.yaml")]
    output: String,

    /// Only report the chips on the host bus.
    #[arg(long)]
    no_remote_discovery: bool,

    /// Check ethernet training once instead of waiting for it.
    #[arg(long)]
    no_wait_for_eth_training: bool,

    #[arg(long, default_value_t = 3)]
    retrain_eth_count: u32,

    /// Comma separated PCI device ids to start from.
    #[arg(long, value_delimiter = ',')]
    target_devices: Vec<usize>,

    #[arg(long, value_enum, default_value_t = DeviceType::Pcie)]
    device_type: DeviceType,
}

fn main() -> Result<(), luwen_api::error::PlatformError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = CmdArgs::parse();

    let options = TopologyDiscoveryOptions::new()
        .no_remote_discovery(args.no_remote_discovery)
        .no_wait_for_eth_training(args.no_wait_for_eth_training)
        .retrain_eth_count(args.retrain_eth_count)
        .target_devices(args.target_devices)
        .device_type(args.device_type.into());

    create_ethernet_map::generate_map(options, args.output)?;
    Ok(())
}
