#![cfg(test)]

use serial_test::serial;

use luwen_fabric::api::cluster::{load_from_file, load_from_yaml};
use luwen_fabric::api::mock::MockFabric;
use luwen_fabric::core::{Arch, BoardType, EthCoord};
use luwen_fabric::ClusterDescriptor;

mod test_utils;

#[serial]
mod tests {
    use super::*;
    use test_utils::discover_mock;

    #[test]
    fn discovered_chain_survives_a_file_round_trip() {
        let fabric = MockFabric::chain(4).unwrap();
        let desc = discover_mock(&fabric).descriptor;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster_descriptor.yaml");
        desc.serialize_to_file(&path).unwrap();

        let loaded = load_from_file(&path).unwrap();
        assert_eq!(loaded, desc);
        assert_eq!(loaded.get_number_of_chips(), 4);
        assert_eq!(loaded.ethernet_links().len(), 3);
        for chip in 1..4 {
            assert_eq!(
                loaded.get_chip_location(chip),
                Some(EthCoord::new(chip as u8, 0, 0, 0))
            );
        }
    }

    #[test]
    fn every_chip_routes_to_the_gateway() {
        let fabric = MockFabric::chain(4).unwrap();
        let desc = discover_mock(&fabric).descriptor;

        for chip in desc.get_all_chips() {
            assert_eq!(desc.get_closest_mmio_capable_chip(chip).unwrap(), 0);
        }
        assert_eq!(desc.get_chips_local_first(&[3, 1, 0, 2]).unwrap(), vec![0, 3, 1, 2]);
        assert_eq!(
            desc.get_directly_connected_ethernet_channels_between_chips(1, 2),
            vec![(8, 0)]
        );
    }

    #[test]
    fn n300_boards_group_by_serial() {
        let fabric = MockFabric::n300_boards(2).unwrap();
        let desc = discover_mock(&fabric).descriptor;

        let boards = desc.boards();
        assert_eq!(boards.len(), 2);
        for board in boards {
            assert_eq!(board.chips.len(), 2);
            assert_eq!(board.board_type, BoardType::N300);
        }

        let reloaded = load_from_yaml(&desc.serialize_to_yaml().unwrap()).unwrap();
        assert_eq!(reloaded.boards(), desc.boards());
    }

    #[test]
    fn mock_cluster_descriptor() {
        let desc = ClusterDescriptor::create_mock_cluster(Arch::Wormhole, 3).unwrap();
        assert_eq!(desc.get_chips_with_mmio().len(), 3);
        assert!(desc.ethernet_links().is_empty());
        for chip in desc.get_all_chips() {
            assert_eq!(desc.get_closest_mmio_capable_chip(chip).unwrap(), chip);
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mock.yaml");
        desc.serialize_to_file(&path).unwrap();
        assert_eq!(load_from_file(&path).unwrap(), desc);
    }
}
