//! Per-level DMA channel allocators
//!
//! One allocator per memory level. Each keeps its outbound and inbound
//! allocations in creation order; an allocation is a physical channel plus
//! the ordered list of movement ops that will run on it.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::trace;

use crate::device::{ChannelKey, Coord, Direction};
use crate::error::{CompileError, CompileResult};
use crate::graph::{MemoryLevel, MovementGraph, OpRef};
use crate::interface::InterfaceTileAllocator;
use crate::target::TargetModel;

/// A physical channel and the ops assigned to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelAllocation {
    pub key: ChannelKey,
    pub level: MemoryLevel,
    /// Far end of the flow, recorded for interface channels
    pub partner: Option<Coord>,
    pub op_ids: Vec<u32>,
    #[serde(skip)]
    pub ops: Vec<OpRef>,
}

/// Level-specific behaviour of an allocator
#[derive(Debug, Clone)]
pub enum ChannelLevel {
    /// Compute-tile memory; channel picked round-robin per tile
    TileLocal,
    /// Mid-level memory tiles; tile decided by buffer placement
    Shared,
    /// External memory reached through interface tiles
    Interface(InterfaceTileAllocator),
}

#[derive(Debug, Clone)]
pub struct ChannelAllocator {
    kind: ChannelLevel,
    outbound: Vec<ChannelAllocation>,
    inbound: Vec<ChannelAllocation>,
    descriptors: BTreeMap<Coord, u32>,
}

impl ChannelAllocator {
    fn with_kind(kind: ChannelLevel) -> Self {
        Self {
            kind,
            outbound: Vec::new(),
            inbound: Vec::new(),
            descriptors: BTreeMap::new(),
        }
    }

    pub fn tile_local() -> Self {
        Self::with_kind(ChannelLevel::TileLocal)
    }

    pub fn shared() -> Self {
        Self::with_kind(ChannelLevel::Shared)
    }

    pub fn interface(target: &TargetModel) -> Self {
        Self::with_kind(ChannelLevel::Interface(InterfaceTileAllocator::new(target)))
    }

    pub fn level(&self) -> MemoryLevel {
        match self.kind {
            ChannelLevel::TileLocal => MemoryLevel::TileLocal,
            ChannelLevel::Shared => MemoryLevel::Shared,
            ChannelLevel::Interface(_) => MemoryLevel::External,
        }
    }

    fn list(&self, direction: Direction) -> &Vec<ChannelAllocation> {
        match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        }
    }

    fn list_mut(&mut self, direction: Direction) -> &mut Vec<ChannelAllocation> {
        match direction {
            Direction::Outbound => &mut self.outbound,
            Direction::Inbound => &mut self.inbound,
        }
    }

    /// Allocate a channel on `tile` for `op`.
    ///
    /// An op id already served on this tile gets its existing channel back.
    /// A `preferred` channel already open on this tile is shared. Otherwise
    /// the channel number rotates with the tile's allocation count.
    pub fn allocate(
        &mut self,
        graph: &MovementGraph,
        op: OpRef,
        tile: Coord,
        preferred: Option<u32>,
        target: &TargetModel,
    ) -> CompileResult<ChannelKey> {
        if let ChannelLevel::Interface(_) = self.kind {
            return Err(CompileError::codegen(
                "interface channels are assigned through allocate_interface",
            ));
        }
        let movement = graph.op(op);
        let direction = movement.direction_at(self.level())?;

        let mut on_tile = 0;
        let mut shared = None;
        for alloc in self.list(direction) {
            if alloc.key.tile != tile {
                continue;
            }
            on_tile += 1;
            if alloc.op_ids.contains(&movement.id) {
                return Ok(alloc.key);
            }
            if shared.is_none() && Some(alloc.key.id) == preferred {
                shared = Some(alloc.key);
            }
        }
        if let Some(key) = shared {
            return self.append(graph, op, key, target);
        }

        let capacity = target.channels(target.role_of_row(tile.row));
        if capacity == 0 {
            return Err(CompileError::capacity(format!(
                "{} channels on tile {} (role has none)",
                direction, tile
            )));
        }
        let key = ChannelKey::new(tile, direction, on_tile % capacity);
        self.commit(graph, op, key, None, target)
    }

    /// Open a fresh interface channel for `op`, facing `partner`
    pub fn allocate_interface(
        &mut self,
        graph: &MovementGraph,
        op: OpRef,
        partner: Coord,
        target: &TargetModel,
    ) -> CompileResult<ChannelKey> {
        let direction = graph.op(op).direction_at(self.level())?;
        let (tile, id) = match &self.kind {
            ChannelLevel::Interface(tiles) => tiles.peek(direction)?,
            _ => return Err(CompileError::codegen("not an interface allocator")),
        };
        if !self.has_room(tile, target) {
            return Err(CompileError::capacity(format!("buffer descriptors on tile {}", tile)));
        }
        if let ChannelLevel::Interface(tiles) = &mut self.kind {
            tiles.assign(direction)?;
        }
        self.commit(graph, op, ChannelKey::new(tile, direction, id), Some(partner), target)
    }

    /// Add `op` to an existing allocation
    pub fn append(
        &mut self,
        graph: &MovementGraph,
        op: OpRef,
        key: ChannelKey,
        target: &TargetModel,
    ) -> CompileResult<ChannelKey> {
        if self.get(&key).is_none() {
            return Err(CompileError::codegen(format!("no allocation for channel {}", key)));
        }
        self.commit(graph, op, key, None, target)
    }

    fn commit(
        &mut self,
        graph: &MovementGraph,
        op: OpRef,
        key: ChannelKey,
        partner: Option<Coord>,
        target: &TargetModel,
    ) -> CompileResult<ChannelKey> {
        let existing = self.list(key.direction).iter().position(|a| a.key == key);
        if let Some(pos) = existing {
            if self.list(key.direction)[pos].ops.contains(&op) {
                return Ok(key);
            }
        }

        let budget = target.budget(target.role_of_row(key.tile.row)).descriptors;
        let used = self.descriptors.get(&key.tile).copied().unwrap_or(0);
        if used >= budget {
            return Err(CompileError::capacity(format!(
                "buffer descriptors on tile {} ({} available)",
                key.tile, budget
            )));
        }
        self.descriptors.insert(key.tile, used + 1);

        let level = self.level();
        let id = graph.op(op).id;
        let list = self.list_mut(key.direction);
        match existing {
            Some(pos) => {
                list[pos].op_ids.push(id);
                list[pos].ops.push(op);
            }
            None => list.push(ChannelAllocation {
                key,
                level,
                partner,
                op_ids: vec![id],
                ops: vec![op],
            }),
        }
        trace!(op = id, channel = %key, %level, "assigned channel");
        Ok(key)
    }

    pub fn get(&self, key: &ChannelKey) -> Option<&ChannelAllocation> {
        self.list(key.direction).iter().find(|a| a.key == *key)
    }

    /// Allocation on `tile` already serving op id `id`
    pub fn lookup(&self, tile: Coord, direction: Direction, id: u32) -> Option<&ChannelAllocation> {
        self.list(direction)
            .iter()
            .find(|a| a.key.tile == tile && a.op_ids.contains(&id))
    }

    /// Whether `tile` can take one more descriptor
    pub fn has_room(&self, tile: Coord, target: &TargetModel) -> bool {
        let budget = target.budget(target.role_of_row(tile.row)).descriptors;
        self.descriptors.get(&tile).copied().unwrap_or(0) < budget
    }

    /// Inbound allocations followed by outbound ones, each in creation order
    pub fn allocations(&self) -> impl Iterator<Item = &ChannelAllocation> + Clone {
        self.inbound.iter().chain(self.outbound.iter())
    }

    pub fn len(&self) -> usize {
        self.inbound.len() + self.outbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Access, BufferDecl, MovementOp};

    fn graph_with(ops: Vec<MovementOp>) -> MovementGraph {
        let mut graph = MovementGraph::new("seg");
        graph.add_buffer(BufferDecl::new("ext", MemoryLevel::External, &[64], 4));
        graph.add_buffer(BufferDecl::new("loc", MemoryLevel::TileLocal, &[16], 4));
        for op in ops {
            graph.push(op);
        }
        graph
    }

    fn load(id: u32) -> MovementOp {
        MovementOp::copy(
            id,
            Access::new("ext", MemoryLevel::External),
            Access::new("loc", MemoryLevel::TileLocal),
        )
    }

    #[test]
    fn test_round_robin_per_tile() {
        let target = TargetModel::gen1(4, 4);
        let graph = graph_with(vec![load(1), load(2), load(3)]);
        let mut l1 = ChannelAllocator::tile_local();
        let tile = Coord::new(2, 2);
        let keys: Vec<_> = (0..3)
            .map(|op| l1.allocate(&graph, op, tile, None, &target).unwrap().id)
            .collect();
        assert_eq!(keys, vec![0, 1, 0]);
        let first = l1.get(&ChannelKey::new(tile, Direction::Inbound, 0)).unwrap();
        assert_eq!(first.op_ids, vec![1, 3]);
    }

    #[test]
    fn test_same_op_id_reuses_channel() {
        let target = TargetModel::gen1(4, 4);
        let graph = graph_with(vec![load(5), load(5)]);
        let mut l1 = ChannelAllocator::tile_local();
        let tile = Coord::new(1, 1);
        let a = l1.allocate(&graph, 0, tile, None, &target).unwrap();
        let b = l1.allocate(&graph, 1, tile, None, &target).unwrap();
        assert_eq!(a, b);
        assert_eq!(l1.len(), 1);
    }

    #[test]
    fn test_preferred_channel_shared() {
        let target = TargetModel::gen1(4, 4);
        let graph = graph_with(vec![load(1), load(2), load(3)]);
        let mut l1 = ChannelAllocator::tile_local();
        let tile = Coord::new(1, 1);
        l1.allocate(&graph, 0, tile, None, &target).unwrap();
        l1.allocate(&graph, 1, tile, None, &target).unwrap();
        let key = l1.allocate(&graph, 2, tile, Some(1), &target).unwrap();
        assert_eq!(key.id, 1);
        assert_eq!(l1.get(&key).unwrap().op_ids, vec![2, 3]);
    }

    #[test]
    fn test_interface_partner_recorded() {
        let target = TargetModel::gen1(8, 4);
        let graph = graph_with(vec![load(1), load(2)]);
        let mut l3 = ChannelAllocator::interface(&target);
        let a = l3.allocate_interface(&graph, 0, Coord::new(0, 2), &target).unwrap();
        let b = l3.allocate_interface(&graph, 1, Coord::new(1, 2), &target).unwrap();
        assert_eq!(a, ChannelKey::new(Coord::new(2, 0), Direction::Outbound, 0));
        assert_eq!(b.id, 1);
        assert_eq!(l3.get(&b).unwrap().partner, Some(Coord::new(1, 2)));
        assert!(l3.allocate(&graph, 0, Coord::new(2, 0), None, &target).is_err());
    }

    #[test]
    fn test_descriptor_budget() {
        let mut target = TargetModel::gen1(4, 4);
        target.compute.descriptors = 2;
        let graph = graph_with(vec![load(1), load(2), load(3)]);
        let mut l1 = ChannelAllocator::tile_local();
        let tile = Coord::new(0, 1);
        l1.allocate(&graph, 0, tile, None, &target).unwrap();
        l1.allocate(&graph, 1, tile, None, &target).unwrap();
        assert!(!l1.has_room(tile, &target));
        let err = l1.allocate(&graph, 2, tile, None, &target).unwrap_err();
        assert!(matches!(err, CompileError::CapacityExhausted { .. }));
    }
}
