//! Shared setup for the integration tests.

use std::collections::BTreeSet;
use std::time::Duration;

use luwen_fabric::api::mock::MockFabric;
use luwen_fabric::api::PciEnumerator;
use luwen_fabric::{DiscoveredCluster, TopologyDiscovery, TopologyDiscoveryOptions};

/// Discovery options with short waits so failing links and stopped firmware time out quickly.
#[allow(dead_code)]
pub fn fast_options() -> TopologyDiscoveryOptions {
    TopologyDiscoveryOptions::new()
        .retrain_eth_count(2)
        .eth_poll_interval(Duration::from_millis(1))
        .transport_timeout(Duration::from_millis(250))
}

#[allow(dead_code)]
pub fn discover_mock(fabric: &MockFabric) -> DiscoveredCluster {
    TopologyDiscovery::new(&fabric.enumerator(), fast_options())
        .discover()
        .unwrap()
}

/// Checks if any compatible hardware is available for testing
#[allow(dead_code)]
pub fn hardware_available() -> bool {
    match luwen_fabric::pci::KmdEnumerator.enumerate_devices(&BTreeSet::new()) {
        Ok(devices) if devices.is_empty() => {
            println!("Test SKIPPED: No devices found");
            false
        }
        Ok(_) => true,
        Err(e) => {
            println!("Test SKIPPED: Error enumerating devices: {e}");
            false
        }
    }
}
