// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use luwen_api::error::PlatformError;
use luwen_api::{
    ClusterDescriptor, DiscoveredCluster, PciEnumerator, TopologyDiscovery,
    TopologyDiscoveryOptions,
};
use tracing::{debug, info, warn};

fn write_map(cluster: &DiscoveredCluster, file: &Path) -> Result<(), PlatformError> {
    if cluster.descriptor.is_empty() {
        warn!("{}, writing an empty map", PlatformError::NoDevicesFound);
    }

    for (chip, device) in &cluster.devices {
        let Some(remote) = device.as_remote() else {
            continue;
        };
        match remote.transport().queue_state() {
            Ok(queues) => {
                for queue in queues {
                    debug!("chip {chip}: {queue}");
                }
            }
            Err(err) => debug!("chip {chip}: could not read queue state: {err}"),
        }
    }

    cluster.descriptor.serialize_to_file(file)?;
    info!(
        "Wrote {} chips to {}",
        cluster.descriptor.get_number_of_chips(),
        file.display()
    );
    Ok(())
}

/// Discover through `enumerator` and write the descriptor YAML to `file`.
pub fn generate_map_with(
    enumerator: &dyn PciEnumerator,
    options: TopologyDiscoveryOptions,
    file: impl AsRef<Path>,
) -> Result<ClusterDescriptor, PlatformError> {
    let cluster = TopologyDiscovery::new(enumerator, options).discover()?;
    write_map(&cluster, file.as_ref())?;
    Ok(cluster.descriptor)
}

/// Discover the chips behind `/dev/tenstorrent` and write the descriptor YAML to `file`.
pub fn generate_map(
    options: TopologyDiscoveryOptions,
    file: impl AsRef<Path>,
) -> Result<ClusterDescriptor, PlatformError> {
    let cluster = luwen_pcie::discover(options)?;
    write_map(&cluster, file.as_ref())?;
    Ok(cluster.descriptor)
}

#[no_mangle]
pub extern "C" fn create_ethernet_map(file: *const std::ffi::c_char) -> std::ffi::c_int {
    if file.is_null() {
        eprintln!("Error file pointer is NULL!");
        return -2;
    }

    let file = unsafe { std::ffi::CStr::from_ptr(file) };
    if let Err(value) = generate_map(
        TopologyDiscoveryOptions::default(),
        file.to_string_lossy().as_ref(),
    ) {
        eprintln!("Error while generating ethernet map!\n{value}");
        -1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use luwen_api::cluster::load_from_file;
    use luwen_api::mock::MockFabric;

    use super::*;

    fn options() -> TopologyDiscoveryOptions {
        TopologyDiscoveryOptions::new()
            .retrain_eth_count(1)
            .eth_poll_interval(Duration::from_millis(1))
            .transport_timeout(Duration::from_millis(200))
    }

    #[test]
    fn written_map_loads_back() {
        let fabric = MockFabric::n300_boards(2).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster_descriptor.yaml");

        let desc = generate_map_with(&fabric.enumerator(), options(), &path).unwrap();
        assert_eq!(desc.get_number_of_chips(), 4);
        assert_eq!(load_from_file(&path).unwrap(), desc);
    }

    #[test]
    fn no_devices_gives_an_empty_map() {
        let fabric = MockFabric::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.yaml");

        let desc = generate_map_with(&fabric.enumerator(), options(), &path).unwrap();
        assert!(desc.is_empty());
        assert!(load_from_file(&path).unwrap().is_empty());
    }
}
