//! Data-movement mapper
//!
//! Drives allocation for one device scope. Bundles are allocated bottom-up:
//! tile-local channels for every bundle, then shared-memory channels, then
//! interface channels with reuse of interface channels earlier bundles
//! opened. Flows, locks, descriptor programs, runtime metadata and the
//! serialized control program follow.

use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

use crate::bundle::{partition, FlowBundle};
use crate::channel::{ChannelAllocation, ChannelAllocator};
use crate::descriptor::{BufferBindings, DescriptorSynthesizer};
use crate::device::{BufferId, BufferKey, ChannelKey, Coord, Device, Direction};
use crate::error::{CompileError, CompileResult};
use crate::graph::{MemoryLevel, MovementGraph, OpRef};
use crate::lock::LockAllocator;
use crate::metadata::RuntimeMetadata;
use crate::placement::BufferPlacer;
use crate::program::DeviceProgram;
use crate::router::FlowRouter;
use crate::serializer::{ControlFlowSerializer, ControlProgram};
use crate::target::{TargetModel, TileRole};

/// Maps movement-op graphs onto a target
pub struct Mapper {
    target: TargetModel,
}

impl Mapper {
    pub fn new(target: TargetModel) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &TargetModel {
        &self.target
    }

    /// Map one device scope. Any error abandons the whole scope.
    #[instrument(skip_all, fields(scope = %graph.scope, target = %self.target.name))]
    pub fn map(&self, graph: &MovementGraph) -> CompileResult<DeviceProgram> {
        let mut bundles = partition(graph, &self.target)?;
        let mut state = MappingState::new(&self.target, graph);

        state.place_shared_buffers()?;
        state.allocate_level(&mut bundles, MemoryLevel::TileLocal)?;
        state.allocate_level(&mut bundles, MemoryLevel::Shared)?;
        for (i, bundle) in bundles.iter().enumerate() {
            state.router.record(i, bundle);
        }
        state.allocate_interface(&mut bundles)?;
        state.connect(&bundles)?;
        state.assign_locks()?;

        let program = state.finish()?;
        info!(
            channels = program.channels.len(),
            flows = program.flows.len(),
            locks = program.locks.len(),
            descriptors = program.descriptor_count(),
            "mapped device scope"
        );
        Ok(program)
    }
}

impl Default for Mapper {
    fn default() -> Self {
        Self::new(TargetModel::default())
    }
}

struct MappingState<'a> {
    target: &'a TargetModel,
    graph: &'a MovementGraph,
    device: Device,
    tile_local: ChannelAllocator,
    shared: ChannelAllocator,
    interface: ChannelAllocator,
    router: FlowRouter,
    locks: LockAllocator,
    bindings: BufferBindings,
}

/// Record `key` as the single channel of one bundle endpoint
fn bind_endpoint(slot: &mut Option<ChannelKey>, key: ChannelKey, bundle: &str) -> CompileResult<()> {
    match slot {
        Some(prev) if *prev != key => Err(CompileError::invalid_graph(format!(
            "flow '{}' has one endpoint split over channels {} and {}",
            bundle, prev, key
        ))),
        _ => {
            *slot = Some(key);
            Ok(())
        }
    }
}

impl<'a> MappingState<'a> {
    fn new(target: &'a TargetModel, graph: &'a MovementGraph) -> Self {
        Self {
            target,
            graph,
            device: Device::new(target.clone()),
            tile_local: ChannelAllocator::tile_local(),
            shared: ChannelAllocator::shared(),
            interface: ChannelAllocator::interface(target),
            router: FlowRouter::new(),
            locks: LockAllocator::new(target.lock_policy),
            bindings: BufferBindings::new(),
        }
    }

    fn at_op(&self, op: OpRef) -> impl Fn(CompileError) -> CompileError + '_ {
        let movement = self.graph.op(op);
        move |e| e.at_op(movement.id, movement.location.as_deref())
    }

    fn allocator(&self, level: MemoryLevel) -> &ChannelAllocator {
        match level {
            MemoryLevel::TileLocal => &self.tile_local,
            MemoryLevel::Shared => &self.shared,
            MemoryLevel::External => &self.interface,
        }
    }

    fn allocator_mut(&mut self, level: MemoryLevel) -> &mut ChannelAllocator {
        match level {
            MemoryLevel::TileLocal => &mut self.tile_local,
            MemoryLevel::Shared => &mut self.shared,
            MemoryLevel::External => &mut self.interface,
        }
    }

    fn place_shared_buffers(&mut self) -> CompileResult<()> {
        let used: BTreeSet<&str> = self
            .graph
            .ops
            .iter()
            .filter_map(|op| op.access_at(MemoryLevel::Shared))
            .map(|a| a.buffer.as_str())
            .collect();
        if used.is_empty() {
            return Ok(());
        }
        let mut placer = BufferPlacer::new(self.target);
        for decl in &self.graph.buffers {
            if decl.level == MemoryLevel::Shared && used.contains(decl.name.as_str()) {
                let bytes = decl
                    .bytes()
                    .ok_or_else(|| CompileError::invalid_graph(format!("buffer '{}' is too large", decl.name)))?;
                let tile = placer.place(&decl.name, bytes)?;
                self.device.set_shared_home(decl.name.clone(), tile);
            }
        }
        Ok(())
    }

    /// Compute tile a tile-local op instance runs on
    fn compute_tile(&self, op: OpRef) -> CompileResult<Coord> {
        let movement = self.graph.op(op);
        let fail = |msg: String| CompileError::invalid_graph(msg).at_op(movement.id, movement.location.as_deref());
        let region = movement
            .region
            .as_deref()
            .and_then(|name| self.graph.region(name))
            .ok_or_else(|| fail("tile-local access outside any region".into()))?;
        let index = movement.spatial_index.as_deref().unwrap_or(&[]);
        let (col, row) = region
            .tile_at(index)
            .ok_or_else(|| fail(format!("spatial index {:?} outside region '{}'", index, region.name)))?;
        if !self.target.contains(col, row) || self.target.role_of_row(row) != TileRole::Compute {
            return Err(fail(format!("region cell ({}, {}) is not a compute tile", col, row)));
        }
        Ok(Coord::new(col, row))
    }

    /// Shared tile holding the mid-level buffer `op` touches
    fn shared_tile(&self, op: OpRef) -> CompileResult<Coord> {
        let movement = self.graph.op(op);
        movement
            .access_at(MemoryLevel::Shared)
            .and_then(|a| self.device.shared_home(&a.buffer))
            .ok_or_else(|| {
                CompileError::codegen(format!("op {} touches an unplaced shared buffer", movement.id))
            })
    }

    fn endpoint_tile(&self, op: OpRef, level: MemoryLevel) -> CompileResult<Coord> {
        match level {
            MemoryLevel::TileLocal => self.compute_tile(op),
            MemoryLevel::Shared => self.shared_tile(op),
            MemoryLevel::External => Err(CompileError::codegen("external endpoints have no fixed tile")),
        }
    }

    fn allocate_endpoint(
        &mut self,
        op: OpRef,
        level: MemoryLevel,
        current: Option<ChannelKey>,
    ) -> CompileResult<ChannelKey> {
        let tile = self.endpoint_tile(op, level)?;
        let preferred = match level {
            MemoryLevel::TileLocal => current.filter(|k| k.tile == tile).map(|k| k.id),
            _ => None,
        };
        let (graph, target) = (self.graph, self.target);
        self.allocator_mut(level)
            .allocate(graph, op, tile, preferred, target)
            .map_err(self.at_op(op))
    }

    /// Allocate every bundle endpoint living at `level`
    fn allocate_level(&mut self, bundles: &mut [FlowBundle], level: MemoryLevel) -> CompileResult<()> {
        for bundle in bundles.iter_mut() {
            if bundle.producer_level == Some(level) {
                for &op in &bundle.producers {
                    let key = self.allocate_endpoint(op, level, bundle.producer_alloc)?;
                    bind_endpoint(&mut bundle.producer_alloc, key, &bundle.name).map_err(self.at_op(op))?;
                }
            }
            if bundle.consumer_level == Some(level) {
                for (slot, ops) in bundle.consumers.iter().enumerate() {
                    for &op in ops {
                        let key = self.allocate_endpoint(op, level, bundle.consumer_allocs[slot])?;
                        bind_endpoint(&mut bundle.consumer_allocs[slot], key, &bundle.name)
                            .map_err(self.at_op(op))?;
                    }
                }
            }
        }
        debug!(%level, channels = self.allocator(level).len(), "allocated level");
        Ok(())
    }

    fn reusable(&self, key: &ChannelKey) -> bool {
        self.target.role_of_row(key.tile.row) == TileRole::Interface && self.interface.has_room(key.tile, self.target)
    }

    /// Put `ops` on one interface channel, reusing one an earlier bundle
    /// opened toward the same endpoint when possible
    fn interface_channel(
        &mut self,
        bundles: &[FlowBundle],
        ops: &[OpRef],
        anchors: &[ChannelKey],
        need: Direction,
    ) -> CompileResult<ChannelKey> {
        let Some(&first) = ops.first() else {
            return Err(CompileError::codegen("interface endpoint without ops"));
        };
        let reused = self
            .router
            .find_reuse(bundles, anchors, need, |k| self.reusable(k));
        let key = match reused {
            Some(key) => {
                debug!(channel = %key, op = self.graph.op(first).id, "reusing interface channel");
                key
            }
            None => {
                let partner = anchors
                    .first()
                    .map(|k| k.tile)
                    .ok_or_else(|| CompileError::codegen("interface endpoint has no partner channel"))?;
                self.interface
                    .allocate_interface(self.graph, first, partner, self.target)
                    .map_err(self.at_op(first))?
            }
        };
        for &op in ops {
            self.interface
                .append(self.graph, op, key, self.target)
                .map_err(self.at_op(op))?;
        }
        Ok(key)
    }

    fn allocate_interface(&mut self, bundles: &mut [FlowBundle]) -> CompileResult<()> {
        for i in 0..bundles.len() {
            if bundles[i].producer_level == Some(MemoryLevel::External) {
                let anchors: Vec<ChannelKey> = bundles[i].consumer_keys().collect();
                let ops = bundles[i].producers.clone();
                let key = self.interface_channel(bundles, &ops, &anchors, Direction::Outbound)?;
                bundles[i].producer_alloc = Some(key);
            }
            if bundles[i].consumer_level == Some(MemoryLevel::External) {
                if bundles[i].is_broadcast() {
                    let err = CompileError::unsupported_path("broadcast", MemoryLevel::External.to_string());
                    return Err(self.at_op(bundles[i].producers[0])(err));
                }
                let anchors: Vec<ChannelKey> = bundles[i].producer_alloc.into_iter().collect();
                let ops = bundles[i].consumers[0].clone();
                let key = self.interface_channel(bundles, &ops, &anchors, Direction::Inbound)?;
                bundles[i].consumer_allocs[0] = Some(key);
            }
            self.router.record(i, &bundles[i]);
        }
        debug!(channels = self.interface.len(), "allocated interface channels");
        Ok(())
    }

    fn connect(&mut self, bundles: &[FlowBundle]) -> CompileResult<()> {
        for bundle in bundles {
            let missing = || CompileError::codegen(format!("flow '{}' left an endpoint unallocated", bundle.name));
            let source = bundle.producer_alloc.ok_or_else(missing)?;
            for dest in &bundle.consumer_allocs {
                let dest = dest.ok_or_else(missing)?;
                self.router
                    .connect(source, dest)
                    .map_err(self.at_op(bundle.producers[0]))?;
            }
        }
        Ok(())
    }

    fn bind_buffer(&mut self, level: MemoryLevel, op: OpRef, tile: Coord) -> CompileResult<BufferId> {
        let movement = self.graph.op(op);
        let access = movement
            .access_at(level)
            .ok_or_else(|| CompileError::codegen(format!("op {} has no {} side", movement.id, level)))?;
        let decl = self
            .graph
            .buffer(&access.buffer)
            .ok_or_else(|| CompileError::invalid_graph(format!("unknown buffer '{}'", access.buffer)))?;
        let name = decl.name.clone();
        let (key, home) = match level {
            MemoryLevel::TileLocal => (BufferKey::Local { name, tile }, Some(tile)),
            MemoryLevel::Shared => (BufferKey::Shared { name }, Some(tile)),
            MemoryLevel::External => (BufferKey::External { name, op }, None),
        };
        Ok(self.device.intern_buffer(key, decl, home))
    }

    fn assign_locks(&mut self) -> CompileResult<()> {
        let work: Vec<(ChannelKey, MemoryLevel, OpRef)> = self
            .tile_local
            .allocations()
            .chain(self.shared.allocations())
            .chain(self.interface.allocations())
            .flat_map(|a| a.ops.iter().map(move |op| (a.key, a.level, *op)))
            .collect();
        for (key, level, op) in work {
            self.device.tile(key.tile).map_err(self.at_op(op))?;
            let buffer = self.bind_buffer(level, op, key.tile)?;
            self.locks
                .locks_for(&mut self.device, buffer, key)
                .map_err(self.at_op(op))?;
            self.bindings.insert((key, op), buffer);
        }
        debug!(pairs = self.locks.len(), locks = self.device.locks().len(), "assigned locks");
        Ok(())
    }

    fn serialize_control(&self) -> CompileResult<Option<ControlProgram>> {
        if !self.target.single_control_processor {
            return Ok(None);
        }
        let Some(host) = &self.graph.host else {
            return Ok(None);
        };
        let (cols, rows) = self
            .graph
            .regions
            .first()
            .map(|r| (r.cols, r.rows))
            .unwrap_or((1, 1));
        ControlFlowSerializer::new(cols, rows).serialize(host)
    }

    fn finish(self) -> CompileResult<DeviceProgram> {
        let all: Vec<&ChannelAllocation> = self
            .tile_local
            .allocations()
            .chain(self.shared.allocations())
            .chain(self.interface.allocations())
            .collect();

        let synth = DescriptorSynthesizer::new(self.graph, &self.device, &self.locks, &self.bindings);
        let tiles = synth.synthesize(all.iter().copied())?;
        let cores = synth.core_locks(all.iter().copied())?;
        let metadata = RuntimeMetadata::build(
            self.graph,
            self.interface.allocations(),
            self.target.channels(TileRole::Interface),
        );
        let control = self.serialize_control()?;

        let mut program = DeviceProgram::new(self.graph.scope.clone(), self.target.clone());
        program.buffers = self.device.buffers().to_vec();
        program.locks = self.device.locks().to_vec();
        program.channels = all.into_iter().cloned().collect();
        program.flows = self.router.flows().to_vec();
        program.tiles = tiles;
        program.cores = cores;
        program.metadata = metadata;
        program.control = control;
        program.generate_summary();
        Ok(program)
    }
}
