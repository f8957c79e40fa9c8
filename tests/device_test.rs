#![cfg(test)]

use serial_test::serial;

use luwen_fabric::api::mock::{MockFabric, MOCK_AICLK};
use luwen_fabric::api::{with_noc, ArcMsg, ArcMsgOptions, NocId};
use luwen_fabric::PlatformError;

mod test_utils;

const TENSIX: (u8, u8) = (1, 1);

#[serial]
mod tests {
    use super::*;
    use test_utils::{discover_mock, hardware_available};

    #[test]
    fn arc_messages_reach_remote_chips() {
        let fabric = MockFabric::chain(3).unwrap();
        let cluster = discover_mock(&fabric);

        for chip in 0..3 {
            let device = cluster.device(chip).unwrap();
            let result = device
                .arc_msg(&ArcMsgOptions {
                    msg: ArcMsg::Test { arg: 5 },
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(result.arg(), Some(6), "chip {chip}");

            let aiclk = device
                .arc_msg(&ArcMsgOptions {
                    msg: ArcMsg::GetAiclk,
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(aiclk.arg(), Some(MOCK_AICLK));
        }
    }

    #[test]
    fn spi_through_the_tunnel() {
        let fabric = MockFabric::chain(2).unwrap();
        let cluster = discover_mock(&fabric);
        let device = cluster.device(1).unwrap();

        fabric.set_spi_contents(1, 0x2000, b"tenstorrent");
        let mut data = [0u8; 11];
        device.spi_read(0x2000, &mut data).unwrap();
        assert_eq!(&data, b"tenstorrent");

        // Straddles a chunk boundary.
        device.spi_write(0x2ffe, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(fabric.spi_contents(1, 0x2ffc, 8), [0xFF, 0xFF, 1, 2, 3, 4, 5, 0xFF]);
        assert_eq!(fabric.spi_contents(1, 0x2000, 11), b"tenstorrent");

        let mut back = [0u8; 5];
        device.spi_read(0x2ffe, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3, 4, 5]);

        // The local chip's rom is untouched.
        assert_eq!(fabric.spi_contents(0, 0x2ffe, 2), [0xFF, 0xFF]);
    }

    #[test]
    fn spi_range_is_checked() {
        let fabric = MockFabric::chain(1).unwrap();
        let cluster = discover_mock(&fabric);
        let mut data = [0u8; 8];
        assert!(cluster
            .device(0)
            .unwrap()
            .spi_read((1 << 24) - 4, &mut data)
            .is_err());
    }

    #[test]
    fn hardware_fault_stays_on_its_board() {
        let fabric = MockFabric::n300_boards(2).unwrap();
        let cluster = discover_mock(&fabric);
        assert_eq!(cluster.descriptor.get_all_chips().len(), 4);

        // Mock chip 0 is the left chip of the first card.
        fabric.set_faulty(0, true);
        let local = cluster.device(0).unwrap();
        let err = local.noc_read32(TENSIX, 0x0).unwrap_err();
        assert!(matches!(err, PlatformError::HardwareFault { device: 0, .. }), "{err}");
        assert!(!err.is_retryable());

        // Its remote partner is only reachable through the faulty chip.
        let partner = cluster
            .descriptor
            .get_chips_with_mmio()
            .iter()
            .find(|(_, interface)| **interface == 0)
            .map(|(chip, _)| *chip)
            .unwrap();
        assert_eq!(partner, 0);
        let remote = cluster
            .descriptor
            .get_all_chips()
            .into_iter()
            .find(|chip| {
                *chip != partner
                    && cluster.descriptor.get_closest_mmio_capable_chip(*chip).unwrap() == partner
            })
            .unwrap();
        let err = cluster
            .device(remote)
            .unwrap()
            .noc_read32(TENSIX, 0x0)
            .unwrap_err();
        assert!(matches!(err, PlatformError::HardwareFault { .. }), "{err}");

        // The other card keeps working.
        fabric.write32(2, TENSIX, 0x0, 0x5A5A);
        fabric.write32(3, TENSIX, 0x0, 0xA5A5);
        for chip in cluster.descriptor.get_all_chips() {
            if chip == partner || chip == remote {
                continue;
            }
            let value = cluster.device(chip).unwrap().noc_read32(TENSIX, 0x0).unwrap();
            assert!(value == 0x5A5A || value == 0xA5A5);
        }
    }

    #[test]
    fn noc_selection() {
        let fabric = MockFabric::chain(2).unwrap();
        let cluster = discover_mock(&fabric);
        let local = cluster.device(0).unwrap();

        with_noc(NocId::Noc1, || local.noc_read32(TENSIX, 0x0)).unwrap();
        assert_eq!(fabric.last_noc(0), Some(NocId::Noc1));

        local.noc_read32(TENSIX, 0x0).unwrap();
        assert_eq!(fabric.last_noc(0), Some(NocId::Noc0));

        // Remote traffic still reaches the tunnel over NOC0.
        let remote = cluster.device(1).unwrap();
        with_noc(NocId::Noc1, || remote.noc_read32(TENSIX, 0x0)).unwrap();
        assert_eq!(fabric.last_noc(0), Some(NocId::Noc0));
    }

    #[test]
    fn devices_are_initialized_once() {
        let fabric = MockFabric::chain(2).unwrap();
        let cluster = discover_mock(&fabric);

        for chip in [0, 1] {
            let device = cluster.device(chip).unwrap();
            assert!(device.is_initialized());
            let err = device.init_tt_device().unwrap_err();
            assert!(matches!(err, PlatformError::AlreadyInitialized { .. }), "{err}");
        }
        assert!(matches!(
            cluster.device(7).unwrap_err(),
            PlatformError::ChipNotFound(7)
        ));
    }

    #[test]
    fn uninitialized_devices_refuse_access() {
        use luwen_fabric::api::{LocalDevice, PciEnumerator, TTDevice};

        let fabric = MockFabric::chain(1).unwrap();
        let backend = fabric.enumerator().open(0).unwrap();
        let device = TTDevice::from(LocalDevice::new(backend));
        assert!(!device.is_initialized());

        let err = device.noc_read32(TENSIX, 0x0).unwrap_err();
        assert!(matches!(err, PlatformError::NotInitialized { .. }), "{err}");

        device.init_tt_device().unwrap();
        fabric.write32(0, TENSIX, 0x0, 9);
        assert_eq!(device.noc_read32(TENSIX, 0x0).unwrap(), 9);
    }

    #[test]
    #[cfg_attr(not(feature = "test_hardware"), ignore = "Requires hardware")]
    fn arc_test_message_on_hardware() {
        if !hardware_available() {
            return;
        }

        let cluster = luwen_fabric::discover(Default::default()).unwrap();
        for chip in cluster.descriptor.get_all_chips() {
            let device = cluster.device(chip).unwrap();
            let result = device
                .arc_msg(&ArcMsgOptions {
                    msg: ArcMsg::Test { arg: 101 },
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(result.arg(), Some(102), "chip {chip}");
        }
    }
}
