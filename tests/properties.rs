use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};

use dataflow_to_dma::descriptor::{base_offset, transfer_length};
use dataflow_to_dma::device::{Buffer, BufferKey, ChannelKey, Device};
use dataflow_to_dma::interface::InterfaceTileAllocator;
use dataflow_to_dma::lock::LockAllocator;
use dataflow_to_dma::{
    compile, Access, BufferDecl, CompileError, Coord, DeviceProgram, Direction, MemoryLevel, MovementGraph,
    MovementOp, Region, TargetModel, TileRole,
};

/// `loads[i]` loads and `stores[i]` stores on cell i of a 2x2 region
fn graph_from(loads: &[u8], stores: &[u8]) -> MovementGraph {
    let mut graph = MovementGraph::new("prop");
    graph
        .add_buffer(BufferDecl::new("ext", MemoryLevel::External, &[8192], 4))
        .add_buffer(BufferDecl::new("loc", MemoryLevel::TileLocal, &[64], 4))
        .add_region(Region::new("herd", 0, 2, 2, 2));
    let mut id = 0;
    for (cell, (l, s)) in loads.iter().zip(stores).enumerate() {
        let index = [cell as u32 % 2, cell as u32 / 2];
        for _ in 0..*l {
            id += 1;
            let op = MovementOp::copy(
                id,
                Access::new("ext", MemoryLevel::External).with_offsets(&[id as u64 * 64]).with_sizes(&[64]),
                Access::new("loc", MemoryLevel::TileLocal),
            );
            graph.push(op.in_region("herd", &index));
        }
        for _ in 0..*s {
            id += 1;
            let op = MovementOp::copy(
                id,
                Access::new("loc", MemoryLevel::TileLocal),
                Access::new("ext", MemoryLevel::External),
            );
            graph.push(op.in_region("herd", &index));
        }
    }
    graph
}

fn external(shape: &[u64]) -> Buffer {
    Buffer {
        symbol: "ext".into(),
        decl: "ext".into(),
        level: MemoryLevel::External,
        shape: shape.to_vec(),
        element_bytes: 4,
        tile: None,
    }
}

fn ops_per_tile(program: &DeviceProgram) -> BTreeMap<Coord, usize> {
    let mut counts = BTreeMap::new();
    for channel in &program.channels {
        *counts.entry(channel.key.tile).or_insert(0) += channel.op_ids.len();
    }
    counts
}

proptest! {
    #[test]
    fn chains_follow_assignment_order(
        loads in prop::collection::vec(0u8..4, 4),
        stores in prop::collection::vec(0u8..3, 4),
    ) {
        let graph = graph_from(&loads, &stores);
        let program = compile(&graph, &TargetModel::gen1(12, 4)).unwrap();
        for channel in &program.channels {
            let tile = program.tiles.iter().find(|t| t.tile == channel.key.tile).unwrap();
            let chain = tile.channel(channel.key.direction, channel.key.id).unwrap();
            let ops: Vec<u32> = chain.blocks.iter().map(|b| b.op_id).collect();
            prop_assert_eq!(&ops, &channel.op_ids);
            for (i, block) in chain.blocks.iter().enumerate() {
                prop_assert_eq!(block.next, (i + 1) % chain.blocks.len());
            }
        }
    }

    #[test]
    fn flows_are_unique_and_cross_tiles(
        loads in prop::collection::vec(0u8..4, 4),
        stores in prop::collection::vec(0u8..4, 4),
    ) {
        let graph = graph_from(&loads, &stores);
        let program = compile(&graph, &TargetModel::gen2(8, 6)).unwrap();
        let mut seen = HashSet::new();
        for flow in &program.flows {
            prop_assert_ne!(flow.source.tile, flow.dest.tile);
            prop_assert!(seen.insert((flow.source, flow.dest)));
        }
    }

    #[test]
    fn descriptor_budgets_hold(
        loads in prop::collection::vec(0u8..6, 4),
        stores in prop::collection::vec(0u8..6, 4),
        budget in 1u32..6,
    ) {
        let mut target = TargetModel::gen1(12, 4);
        target.interface.descriptors = budget;
        target.compute.descriptors = budget + 2;
        let graph = graph_from(&loads, &stores);
        match compile(&graph, &target) {
            Ok(program) => {
                for (tile, count) in ops_per_tile(&program) {
                    let role = target.role_of_row(tile.row);
                    prop_assert!(count as u32 <= target.budget(role).descriptors);
                    if role == TileRole::Interface {
                        prop_assert!(program.channels.iter().all(|c| c.key.id < target.interface.channels));
                    }
                }
            }
            Err(err) => prop_assert!(matches!(err, CompileError::CapacityExhausted { .. }), "unexpected error: {:?}", err),
        }
    }

    #[test]
    fn interface_slots_never_double_booked(directions in prop::collection::vec(any::<bool>(), 0..20)) {
        let target = TargetModel::gen1(8, 4);
        let mut alloc = InterfaceTileAllocator::new(&target);
        let mut taken = HashSet::new();
        for outbound in directions {
            let direction = if outbound { Direction::Outbound } else { Direction::Inbound };
            let before = alloc.remaining(direction);
            match alloc.assign(direction) {
                Ok((tile, channel)) => {
                    prop_assert!(channel < 2);
                    prop_assert!(taken.insert((tile, direction, channel)));
                    prop_assert_eq!(alloc.remaining(direction), before - 1);
                }
                Err(_) => {
                    prop_assert_eq!(before, 0);
                    prop_assert_eq!(alloc.remaining(direction), 0);
                }
            }
        }
    }

    #[test]
    fn lock_pairs_are_memoized(requests in prop::collection::vec((0usize..2, 0u32..2, any::<bool>()), 1..12)) {
        let target = TargetModel::gen2(4, 6);
        let mut device = Device::new(target.clone());
        let mut locks = LockAllocator::new(target.lock_policy);
        let tile = Coord::new(1, 2);
        let mut first = BTreeMap::new();
        for (buffer, channel, inbound) in requests {
            let name = format!("b{}", buffer);
            let decl = BufferDecl::new(name.clone(), MemoryLevel::TileLocal, &[16], 4);
            let id = device.intern_buffer(BufferKey::Local { name, tile }, &decl, Some(tile));
            let direction = if inbound { Direction::Inbound } else { Direction::Outbound };
            let key = ChannelKey::new(tile, direction, channel);
            let pair = locks.locks_for(&mut device, id, key).unwrap();
            let expected = *first.entry((id, key)).or_insert(pair);
            prop_assert_eq!(pair, expected);
        }
        prop_assert_eq!(device.locks().len(), first.len() * 2);
    }

    #[test]
    fn offsets_need_matching_strides(
        shape in prop::collection::vec(1u64..8, 0..4),
        offsets in prop::collection::vec(0u64..8, 1..5),
        strides in prop::collection::vec(1u64..64, 0..5),
    ) {
        let buffer = external(&shape);
        let access = Access::new("ext", MemoryLevel::External).with_offsets(&offsets).with_strides(&strides);
        let op = MovementOp::put(1, "c", access.clone());
        let accepted = if strides.is_empty() {
            offsets.len() <= shape.len()
        } else {
            offsets.len() == strides.len()
        };
        match base_offset(&op, &access, &buffer) {
            Ok(offset) => {
                prop_assert!(accepted);
                if !strides.is_empty() {
                    let expected: u64 = offsets.iter().zip(&strides).map(|(o, s)| o * s).sum();
                    prop_assert_eq!(offset, expected);
                }
            }
            Err(err) => {
                prop_assert!(!accepted);
                prop_assert!(matches!(err, CompileError::InvalidGraph { op: Some(1), .. }), "{:?}", err);
            }
        }
    }

    #[test]
    fn transfer_length_never_wraps(sizes in prop::collection::vec(any::<u64>(), 1..4)) {
        let buffer = external(&[16]);
        let access = Access::new("ext", MemoryLevel::External).with_sizes(&sizes);
        let op = MovementOp::put(1, "c", access.clone());
        let product = sizes.iter().try_fold(1u64, |n, d| n.checked_mul(*d));
        match (transfer_length(&op, &access, &buffer), product) {
            (Ok(length), Some(expected)) => prop_assert_eq!(length, expected),
            (Err(err), None) => prop_assert!(matches!(err, CompileError::InvalidGraph { op: Some(1), .. }), "unexpected error: {:?}", err),
            (result, expected) => prop_assert!(false, "{:?} vs {:?}", result, expected),
        }
    }
}
