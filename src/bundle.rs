//! Flow bundles
//!
//! Groups movement ops into logical flows: every complete copy is its own
//! bundle, every channel's puts and gets form one bundle. Unicast channels
//! used with indices are arrays, one bundle per index. Broadcast channels
//! get one consumer slot per broadcast destination.

use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use crate::device::ChannelKey;
use crate::error::{CompileError, CompileResult};
use crate::graph::{position_from_linear, ChannelDecl, MemoryLevel, MovementGraph, MovementOp, OpKind, OpRef};
use crate::target::TargetModel;

/// One logical flow: producers on one end, one consumer group per
/// broadcast destination on the other
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowBundle {
    pub name: String,
    pub producer_level: Option<MemoryLevel>,
    pub consumer_level: Option<MemoryLevel>,
    pub producers: Vec<OpRef>,
    pub consumers: Vec<Vec<OpRef>>,
    pub producer_alloc: Option<ChannelKey>,
    pub consumer_allocs: Vec<Option<ChannelKey>>,
}

impl FlowBundle {
    fn new(name: impl Into<String>, consumers: usize) -> Self {
        Self {
            name: name.into(),
            producer_level: None,
            consumer_level: None,
            producers: Vec::new(),
            consumers: vec![Vec::new(); consumers],
            producer_alloc: None,
            consumer_allocs: vec![None; consumers],
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.consumers.len() > 1
    }

    /// Consumer-side allocations made so far
    pub fn consumer_keys(&self) -> impl Iterator<Item = ChannelKey> + '_ {
        self.consumer_allocs.iter().flatten().copied()
    }
}

/// Whether a transfer from `src` to `dst` can be realized on `target`
pub fn check_path(src: MemoryLevel, dst: MemoryLevel, target: &TargetModel) -> CompileResult<()> {
    use MemoryLevel::*;
    let legal = match (src, dst) {
        (TileLocal, External) | (External, TileLocal) => true,
        (TileLocal, Shared) | (Shared, TileLocal) | (Shared, External) | (External, Shared) => {
            target.has_shared_tiles()
        }
        _ => false,
    };
    if legal {
        Ok(())
    } else {
        Err(CompileError::unsupported_path(src.to_string(), dst.to_string()))
    }
}

/// Consumer slot a get lands in.
///
/// Dimensions of size 1 in the broadcast shape are ignored, the remaining
/// indices must match one position of the broadcast iteration space.
pub fn resolve_broadcast_slot(decl: &ChannelDecl, op: &MovementOp) -> CompileResult<usize> {
    let shape = match &decl.broadcast_shape {
        Some(shape) => shape,
        None => return Ok(0),
    };
    let unresolved = |message: String| CompileError::UnresolvedBroadcastTarget {
        channel: decl.name.clone(),
        message,
        op: Some(op.id),
        location: op.location.clone(),
    };
    if op.indices.len() != shape.len() {
        return Err(unresolved(format!(
            "get has {} indices, broadcast shape has {} dimensions",
            op.indices.len(),
            shape.len()
        )));
    }
    let wanted: Vec<u32> = op
        .indices
        .iter()
        .zip(shape)
        .map(|(index, size)| if *size == 1 { 0 } else { *index })
        .collect();
    let count = decl
        .consumer_count()
        .ok_or_else(|| unresolved(format!("broadcast shape {:?} has too many destinations", shape)))?;
    (0..count)
        .find(|iter| position_from_linear(shape, *iter) == wanted)
        .map(|iter| iter as usize)
        .ok_or_else(|| unresolved(format!("indices {:?} match no destination", op.indices)))
}

/// Consumer slots of `decl`. Every slot needs an inbound channel on a tile
/// of its own, so there can be no more slots than tiles.
fn destination_count(decl: &ChannelDecl, target: &TargetModel) -> CompileResult<usize> {
    let tiles = u64::from(target.columns) * u64::from(target.rows);
    decl.consumer_count()
        .filter(|count| u64::from(*count) <= tiles)
        .and_then(|count| usize::try_from(count).ok())
        .ok_or_else(|| {
            CompileError::capacity(format!(
                "tiles for the {:?} broadcast of channel '{}' ({} in the grid)",
                decl.broadcast_shape, decl.name, tiles
            ))
        })
}

fn set_level(slot: &mut Option<MemoryLevel>, level: MemoryLevel, op: &MovementOp, channel: &str) -> CompileResult<()> {
    match slot {
        Some(existing) if *existing != level => Err(CompileError::invalid_graph(format!(
            "channel '{}' mixes {} and {} endpoints",
            channel, existing, level
        ))
        .at_op(op.id, op.location.as_deref())),
        _ => {
            *slot = Some(level);
            Ok(())
        }
    }
}

/// Partition the graph's ops into bundles, in order of first appearance
pub fn partition(graph: &MovementGraph, target: &TargetModel) -> CompileResult<Vec<FlowBundle>> {
    graph.validate()?;
    let mut bundles: Vec<FlowBundle> = Vec::new();
    let mut by_channel: HashMap<(&str, Vec<u32>), usize> = HashMap::new();

    for (op_ref, op) in graph.ops.iter().enumerate() {
        match &op.kind {
            OpKind::Copy { src, dst } => {
                check_path(src.level, dst.level, target).map_err(|e| e.at_op(op.id, op.location.as_deref()))?;
                let mut bundle = FlowBundle::new(format!("copy{}#{}", op.id, op_ref), 1);
                bundle.producer_level = Some(src.level);
                bundle.consumer_level = Some(dst.level);
                bundle.producers.push(op_ref);
                bundle.consumers[0].push(op_ref);
                bundles.push(bundle);
            }
            OpKind::Put { channel, src } | OpKind::Get { channel, dst: src } => {
                let decl = graph
                    .channel_decl(channel)
                    .ok_or_else(|| CompileError::invalid_graph(format!("unknown channel '{}'", channel)))?;
                // unicast channels form an array addressed by the op's indices
                let element = if decl.broadcast_shape.is_some() || op.indices.is_empty() {
                    Vec::new()
                } else {
                    op.indices.clone()
                };
                let name = if element.is_empty() {
                    channel.clone()
                } else {
                    format!("{}{:?}", channel, element)
                };
                let slots = destination_count(decl, target).map_err(|e| e.at_op(op.id, op.location.as_deref()))?;
                let index = *by_channel.entry((channel.as_str(), element)).or_insert_with(|| {
                    bundles.push(FlowBundle::new(name, slots));
                    bundles.len() - 1
                });
                let bundle = &mut bundles[index];
                if matches!(op.kind, OpKind::Put { .. }) {
                    set_level(&mut bundle.producer_level, src.level, op, channel)?;
                    bundle.producers.push(op_ref);
                } else {
                    set_level(&mut bundle.consumer_level, src.level, op, channel)?;
                    let slot = resolve_broadcast_slot(decl, op)?;
                    bundle.consumers[slot].push(op_ref);
                }
            }
        }
    }

    for bundle in &bundles {
        let (src, dst) = match (bundle.producer_level, bundle.consumer_level) {
            (Some(src), Some(dst)) => (src, dst),
            (None, _) => {
                return Err(CompileError::invalid_graph(format!(
                    "channel '{}' has no producer",
                    bundle.name
                )))
            }
            (_, None) => {
                return Err(CompileError::invalid_graph(format!(
                    "channel '{}' has no consumer",
                    bundle.name
                )))
            }
        };
        if let Some(empty) = bundle.consumers.iter().position(Vec::is_empty) {
            return Err(CompileError::UnresolvedBroadcastTarget {
                channel: bundle.name.clone(),
                message: format!("destination {} has no consumer", empty),
                op: None,
                location: None,
            });
        }
        let first = graph.op(bundle.producers[0]);
        check_path(src, dst, target).map_err(|e| e.at_op(first.id, first.location.as_deref()))?;
    }

    debug!(bundles = bundles.len(), ops = graph.ops.len(), "partitioned movement ops");
    Ok(bundles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Access, BufferDecl, Region};

    fn graph() -> MovementGraph {
        let mut graph = MovementGraph::new("seg");
        graph
            .add_buffer(BufferDecl::new("ext", MemoryLevel::External, &[256], 4))
            .add_buffer(BufferDecl::new("mid", MemoryLevel::Shared, &[64], 4))
            .add_buffer(BufferDecl::new("loc", MemoryLevel::TileLocal, &[16], 4))
            .add_region(Region::new("herd", 0, 2, 2, 2));
        graph
    }

    #[test]
    fn test_path_legality() {
        let gen1 = TargetModel::gen1(4, 4);
        let gen2 = TargetModel::gen2(4, 6);
        assert!(check_path(MemoryLevel::External, MemoryLevel::TileLocal, &gen1).is_ok());
        assert!(check_path(MemoryLevel::Shared, MemoryLevel::TileLocal, &gen1).is_err());
        assert!(check_path(MemoryLevel::External, MemoryLevel::Shared, &gen2).is_ok());
        assert!(check_path(MemoryLevel::TileLocal, MemoryLevel::TileLocal, &gen2).is_err());
    }

    #[test]
    fn test_channel_bundle() {
        let mut g = graph();
        g.add_channel(ChannelDecl::new("c"));
        g.push(MovementOp::put(1, "c", Access::new("ext", MemoryLevel::External)));
        g.push(MovementOp::copy(
            2,
            Access::new("ext", MemoryLevel::External),
            Access::new("loc", MemoryLevel::TileLocal),
        ));
        g.push(MovementOp::get(3, "c", Access::new("loc", MemoryLevel::TileLocal)).in_region("herd", &[0, 0]));
        let bundles = partition(&g, &TargetModel::gen1(4, 4)).unwrap();
        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[0].name, "c");
        assert_eq!(bundles[0].producers, vec![0]);
        assert_eq!(bundles[0].consumers, vec![vec![2]]);
        assert_eq!(bundles[1].consumer_level, Some(MemoryLevel::TileLocal));
    }

    #[test]
    fn test_broadcast_slots() {
        let mut g = graph();
        g.add_channel(ChannelDecl::broadcast("b", &[2, 1]));
        g.push(MovementOp::put(1, "b", Access::new("ext", MemoryLevel::External)));
        let get = MovementOp::get(2, "b", Access::new("loc", MemoryLevel::TileLocal));
        g.replicate(get, "herd").unwrap();
        let bundles = partition(&g, &TargetModel::gen1(4, 4)).unwrap();
        // cells (0,0),(0,1) share slot 0; (1,0),(1,1) share slot 1
        assert_eq!(bundles[0].consumers, vec![vec![1, 3], vec![2, 4]]);
        assert!(bundles[0].is_broadcast());
    }

    #[test]
    fn test_indexed_channel_array() {
        let mut g = graph();
        g.add_channel(ChannelDecl::new("a"));
        for x in 0..2 {
            g.push(MovementOp::put(1, "a", Access::new("ext", MemoryLevel::External)).with_indices(&[x, 0]));
        }
        let get = MovementOp::get(2, "a", Access::new("loc", MemoryLevel::TileLocal));
        let region = Region::new("row", 0, 2, 2, 1);
        g.add_region(region);
        g.replicate(get, "row").unwrap();
        let bundles = partition(&g, &TargetModel::gen1(4, 4)).unwrap();
        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[1].name, "a[1, 0]");
        assert_eq!(bundles[1].producers, vec![1]);
        assert_eq!(bundles[1].consumers, vec![vec![3]]);
    }

    #[test]
    fn test_unmatched_broadcast_index() {
        let mut g = graph();
        g.add_channel(ChannelDecl::broadcast("b", &[2]));
        g.push(MovementOp::put(1, "b", Access::new("ext", MemoryLevel::External)));
        g.push(MovementOp::get(2, "b", Access::new("loc", MemoryLevel::TileLocal)).with_indices(&[5]));
        let err = partition(&g, &TargetModel::gen1(4, 4)).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedBroadcastTarget { .. }));
        assert_eq!(err.op_id(), Some(2));
    }

    #[test]
    fn test_empty_broadcast_slot() {
        let mut g = graph();
        g.add_channel(ChannelDecl::broadcast("b", &[2]));
        g.push(MovementOp::put(1, "b", Access::new("ext", MemoryLevel::External)));
        g.push(MovementOp::get(2, "b", Access::new("loc", MemoryLevel::TileLocal)).with_indices(&[0]));
        let err = partition(&g, &TargetModel::gen1(4, 4)).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedBroadcastTarget { .. }));
    }

    #[test]
    fn test_broadcast_wider_than_grid() {
        let mut g = graph();
        g.add_channel(ChannelDecl::broadcast("b", &[64, 64]));
        g.push(MovementOp::put(1, "b", Access::new("ext", MemoryLevel::External)));
        let err = partition(&g, &TargetModel::gen1(4, 4)).unwrap_err();
        assert!(matches!(err, CompileError::CapacityExhausted { op: Some(1), .. }));
    }

    #[test]
    fn test_shared_path_rejected_on_gen1() {
        let mut g = graph();
        g.push(MovementOp::copy(
            4,
            Access::new("mid", MemoryLevel::Shared),
            Access::new("loc", MemoryLevel::TileLocal),
        ));
        let err = partition(&g, &TargetModel::gen1(4, 4)).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedMemoryPath { .. }));
        assert_eq!(err.op_id(), Some(4));
    }
}
