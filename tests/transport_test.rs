#![cfg(test)]

use serial_test::serial;

use luwen_fabric::api::eth_addr::WH_ETH_CORES;
use luwen_fabric::api::mock::MockFabric;
use luwen_fabric::api::queue::QueueKind;
use luwen_fabric::api::NocId;
use luwen_fabric::{PlatformError, TTDevice};

mod test_utils;

/// Ethernet core on chip 0 that tunnels to the rest of a [`MockFabric::chain`].
const TUNNEL: (u8, u8) = WH_ETH_CORES[8];
const TENSIX: (u8, u8) = (1, 1);

#[serial]
mod tests {
    use super::*;
    use test_utils::discover_mock;

    fn response_rdptr(fabric: &MockFabric) -> u32 {
        fabric
            .queue_snapshot(0, TUNNEL, QueueKind::Response)
            .unwrap()
            .rdptr
    }

    fn remote(cluster: &luwen_fabric::DiscoveredCluster, chip: u32) -> &TTDevice {
        let device = cluster.device(chip).unwrap();
        assert!(device.is_remote());
        device
    }

    #[test]
    fn read_through_two_hops() {
        let fabric = MockFabric::chain(3).unwrap();
        let cluster = discover_mock(&fabric);
        fabric.write32(2, (9, 0), 0x0, 0xCAFE_F00D);

        let before = response_rdptr(&fabric);
        let value = remote(&cluster, 2).noc_read32((9, 0), 0x0).unwrap();
        assert_eq!(value, 0xCAFE_F00D);
        assert_eq!(response_rdptr(&fabric), QueueKind::Response.next_ptr(before));

        let requests = fabric
            .queue_snapshot(0, TUNNEL, QueueKind::HostRequest)
            .unwrap();
        assert_eq!(requests.wrptr, requests.rdptr);
        assert_eq!(requests.issued, requests.completed);
    }

    #[test]
    fn writes_are_posted_then_flushed() {
        let fabric = MockFabric::chain(3).unwrap();
        let cluster = discover_mock(&fabric);
        let chip = remote(&cluster, 2);

        chip.noc_write32(TENSIX, 0x100, 0x1234_5678).unwrap();
        chip.wait_for_flush().unwrap();
        assert_eq!(fabric.read32(2, TENSIX, 0x100), 0x1234_5678);
        assert_eq!(chip.noc_read32(TENSIX, 0x100).unwrap(), 0x1234_5678);
    }

    #[test]
    fn unaligned_access_preserves_neighbouring_bytes() {
        let fabric = MockFabric::chain(2).unwrap();
        let cluster = discover_mock(&fabric);
        let chip = remote(&cluster, 1);
        fabric.write32(1, TENSIX, 0x200, 0x1122_3344);
        fabric.write32(1, TENSIX, 0x204, 0x5566_7788);

        chip.noc_write(TENSIX, 0x203, &[0xAA, 0xBB]).unwrap();
        chip.wait_for_flush().unwrap();
        assert_eq!(fabric.read32(1, TENSIX, 0x200), 0xAA22_3344);
        assert_eq!(fabric.read32(1, TENSIX, 0x204), 0x5566_77BB);

        let mut data = [0u8; 3];
        chip.noc_read(TENSIX, 0x202, &mut data).unwrap();
        assert_eq!(data, [0x22, 0xAA, 0xBB]);
    }

    #[test]
    fn block_transfers() {
        let fabric = MockFabric::chain(3).unwrap();
        let cluster = discover_mock(&fabric);
        let chip = remote(&cluster, 2);

        let data: Vec<u8> = (0..3000u32).map(|i| (i * 7 + 3) as u8).collect();
        chip.noc_write(TENSIX, 0x4000, &data).unwrap();
        chip.wait_for_flush().unwrap();
        assert_eq!(fabric.read_bytes(2, TENSIX, 0x4000, data.len()), data);

        let mut back = vec![0u8; data.len()];
        chip.noc_read(TENSIX, 0x4000, &mut back).unwrap();
        assert_eq!(back, data);

        // Unaligned start and a tail that is not a whole word.
        let mut odd = vec![0u8; 1023];
        chip.noc_read(TENSIX, 0x4005, &mut odd).unwrap();
        assert_eq!(odd, data[5..1028]);

        let mut dma = vec![0u8; 2048];
        chip.dma_read(TENSIX, 0x4000, &mut dma).unwrap();
        assert_eq!(dma, data[..2048]);
    }

    #[test]
    fn stopped_firmware_times_out_then_recovers() {
        let fabric = MockFabric::chain(2).unwrap();
        let cluster = discover_mock(&fabric);
        let chip = remote(&cluster, 1);
        fabric.write32(1, TENSIX, 0x0, 7);
        fabric.set_firmware_running(0, false).unwrap();

        let err = chip.noc_read32(TENSIX, 0x0).unwrap_err();
        assert!(matches!(err, PlatformError::ResponseTimeout { .. }), "{err}");
        assert!(err.is_retryable());

        // One slot is still held by the unanswered read.
        for value in 0..3 {
            chip.noc_write32(TENSIX, 0x10, value).unwrap();
        }
        let err = chip.noc_write32(TENSIX, 0x10, 3).unwrap_err();
        assert!(matches!(err, PlatformError::QueueFull { .. }), "{err}");
        assert!(err.is_retryable());

        // The late answer to the timed out read is skipped.
        fabric.set_firmware_running(0, true).unwrap();
        assert_eq!(chip.noc_read32(TENSIX, 0x0).unwrap(), 7);
        assert_eq!(fabric.read32(1, TENSIX, 0x10), 2);
    }

    #[test]
    fn stale_response_is_discarded() {
        let fabric = MockFabric::chain(2).unwrap();
        let cluster = discover_mock(&fabric);
        let chip = remote(&cluster, 1);
        fabric.write32(1, TENSIX, 0x40, 0x600D);

        fabric.inject_stale_response(0, TUNNEL, 0xDEAD, 0xBAD).unwrap();
        assert_eq!(chip.noc_read32(TENSIX, 0x40).unwrap(), 0x600D);

        let responses = fabric.queue_snapshot(0, TUNNEL, QueueKind::Response).unwrap();
        assert_eq!(responses.wrptr, responses.rdptr);
    }

    #[test]
    fn firmware_without_tag_echo() {
        let fabric = MockFabric::chain(2).unwrap();
        let cluster = discover_mock(&fabric);
        fabric.set_echo_tags(0, false);
        fabric.write32(1, TENSIX, 0x80, 42);

        assert_eq!(remote(&cluster, 1).noc_read32(TENSIX, 0x80).unwrap(), 42);
    }

    #[test]
    fn unreachable_destination() {
        let fabric = MockFabric::chain(3).unwrap();
        let cluster = discover_mock(&fabric);
        fabric.write32(1, TENSIX, 0x0, 1);

        fabric.set_unreachable(2, true);
        let err = remote(&cluster, 2).noc_read32(TENSIX, 0x0).unwrap_err();
        assert!(matches!(err, PlatformError::DestinationUnreachable), "{err}");
        assert!(!err.is_retryable());

        // The failure is confined to that call.
        assert_eq!(remote(&cluster, 1).noc_read32(TENSIX, 0x0).unwrap(), 1);
        fabric.set_unreachable(2, false);
        assert!(remote(&cluster, 2).noc_read32(TENSIX, 0x0).is_ok());
    }

    #[test]
    fn tunnel_always_uses_noc0() {
        let fabric = MockFabric::chain(2).unwrap();
        let cluster = discover_mock(&fabric);
        let chip = remote(&cluster, 1);

        luwen_fabric::api::with_noc(NocId::Noc1, || chip.noc_read32(TENSIX, 0x0)).unwrap();
        assert_eq!(fabric.last_noc(0), Some(NocId::Noc0));

        // The selection travels in the request instead.
        let requests = fabric
            .queue_snapshot(0, TUNNEL, QueueKind::HostRequest)
            .unwrap();
        let last = QueueKind::HostRequest.slot_index(requests.wrptr + 2 * 4 - 1);
        assert_eq!(requests.slots[last as usize].cmd_flags().noc_id(), 1);
    }

    #[test]
    fn threads_share_one_tunnel() {
        let fabric = MockFabric::chain(3).unwrap();
        let cluster = discover_mock(&fabric);
        let chip = remote(&cluster, 2);

        std::thread::scope(|scope| {
            for thread in 0..4u32 {
                scope.spawn(move || {
                    for round in 0..16u32 {
                        let addr = 0x1000 + thread as u64 * 0x100 + round as u64 * 4;
                        let value = (thread << 16) | round;
                        chip.noc_write32(TENSIX, addr, value).unwrap();
                        chip.wait_for_flush().unwrap();
                        assert_eq!(chip.noc_read32(TENSIX, addr).unwrap(), value);
                    }
                });
            }
        });

        for thread in 0..4u32 {
            for round in 0..16u32 {
                let addr = 0x1000 + thread as u64 * 0x100 + round as u64 * 4;
                assert_eq!(fabric.read32(2, TENSIX, addr), (thread << 16) | round);
            }
        }
        let requests = fabric
            .queue_snapshot(0, TUNNEL, QueueKind::HostRequest)
            .unwrap();
        assert_eq!(requests.wrptr, requests.rdptr);
        let responses = fabric
            .queue_snapshot(0, TUNNEL, QueueKind::Response)
            .unwrap();
        assert_eq!(responses.wrptr, responses.rdptr);
    }

    #[test]
    fn remote_queue_state_dump() {
        let fabric = MockFabric::chain(2).unwrap();
        let cluster = discover_mock(&fabric);
        let chip = remote(&cluster, 1);
        let queues = chip.as_remote().unwrap().transport().queue_state().unwrap();
        assert_eq!(queues.len(), QueueKind::ALL.len());
        assert!(queues.iter().all(|queue| !queue.is_full()));
    }
}
