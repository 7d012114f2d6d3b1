//! Descriptor-program synthesis
//!
//! Turns channel allocations into per-tile DMA programs. Every allocated
//! channel gets a circular chain of descriptor blocks, one per assigned op
//! in assignment order, each guarded by its lock pair. A dispatcher per
//! tile starts every channel's chain in (direction, channel) order.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::channel::ChannelAllocation;
use crate::device::{Buffer, BufferId, ChannelKey, Coord, Device, Direction};
use crate::error::{CompileError, CompileResult};
use crate::graph::{Access, Dim, MemoryLevel, MovementGraph, MovementOp, OpRef};
use crate::lock::{LockAction, LockAllocator};
use crate::target::{StartPrimitive, TileRole};

/// Buffer each op touches on each channel
pub type BufferBindings = BTreeMap<(ChannelKey, OpRef), BufferId>;

/// Buffer window one descriptor transfers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Descriptor {
    pub buffer: String,
    /// Element offset of the first transferred element
    pub offset: u64,
    /// Number of elements
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptorBlock {
    pub op_id: u32,
    pub acquire: LockAction,
    pub descriptor: Descriptor,
    pub release: LockAction,
    /// Block run after this one; the chain is circular
    pub next: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelProgram {
    pub direction: Direction,
    pub channel: u32,
    pub blocks: Vec<DescriptorBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchNext {
    Entry(usize),
    End,
}

/// Start of one channel's chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchEntry {
    pub direction: Direction,
    pub channel: u32,
    /// Index into the tile's channel programs
    pub program: usize,
    pub next: DispatchNext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dispatcher {
    pub primitive: StartPrimitive,
    pub entries: Vec<DispatchEntry>,
}

/// DMA program of one tile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileProgram {
    pub tile: Coord,
    pub role: TileRole,
    pub dispatcher: Dispatcher,
    pub channels: Vec<ChannelProgram>,
}

impl TileProgram {
    pub fn channel(&self, direction: Direction, channel: u32) -> Option<&ChannelProgram> {
        self.channels
            .iter()
            .find(|c| c.direction == direction && c.channel == channel)
    }
}

/// Lock actions a compute core wraps around one buffer use
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreLockUse {
    pub op_id: u32,
    pub buffer: String,
    pub channel: ChannelKey,
    pub acquire: LockAction,
    pub release: LockAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreProgram {
    pub tile: Coord,
    pub uses: Vec<CoreLockUse>,
}

/// Row-major element strides of `shape`, `None` when a stride overflows
pub fn row_major_strides(shape: &[u64]) -> Option<Vec<u64>> {
    let mut strides = vec![1u64; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1].checked_mul(shape[i + 1])?;
    }
    Some(strides)
}

fn out_of_range(op: &MovementOp, what: String) -> CompileError {
    CompileError::invalid_graph(format!("{} does not fit in 64 bits", what)).at_op(op.id, op.location.as_deref())
}

/// Elements moved by one descriptor for `access` into `buffer`
pub fn transfer_length(op: &MovementOp, access: &Access, buffer: &Buffer) -> CompileResult<u64> {
    if access.sizes.is_empty() {
        return buffer
            .volume()
            .ok_or_else(|| out_of_range(op, format!("volume of '{}'", buffer.symbol)));
    }
    access.sizes.iter().try_fold(1u64, |len, dim| match dim {
        Dim::Static(size) => len
            .checked_mul(*size)
            .ok_or_else(|| out_of_range(op, format!("transfer length into '{}'", access.buffer))),
        Dim::Dynamic(name) => Err(CompileError::NonStaticShape {
            message: format!("size %{} of '{}' is not a compile-time constant", name, access.buffer),
            op: op.id,
            location: op.location.clone(),
        }),
    })
}

/// Element offset of the first element moved for `access`.
///
/// Missing strides default to the buffer's row-major strides, aligned to
/// the innermost dimensions. Explicit strides must pair up with the
/// offsets one to one. Run-time offsets are tolerated on external buffers
/// only, where the host patches the address.
pub fn base_offset(op: &MovementOp, access: &Access, buffer: &Buffer) -> CompileResult<u64> {
    if access.offsets.is_empty() {
        return Ok(0);
    }
    let rank_error = |what: &str, rank: usize| {
        CompileError::invalid_graph(format!(
            "{} offsets into '{}' with {} {}",
            access.offsets.len(),
            access.buffer,
            rank,
            what
        ))
        .at_op(op.id, op.location.as_deref())
    };
    let strides: Vec<Dim> = if access.strides.is_empty() {
        let natural = row_major_strides(&buffer.shape)
            .ok_or_else(|| out_of_range(op, format!("strides of '{}'", buffer.symbol)))?;
        if access.offsets.len() > natural.len() {
            return Err(rank_error("dimensions", natural.len()));
        }
        natural[natural.len() - access.offsets.len()..]
            .iter()
            .map(|s| Dim::Static(*s))
            .collect()
    } else if access.strides.len() != access.offsets.len() {
        return Err(rank_error("strides", access.strides.len()));
    } else {
        access.strides.clone()
    };

    let mut offset: u64 = 0;
    for (index, stride) in access.offsets.iter().zip(&strides) {
        match (index.as_static(), stride.as_static()) {
            (Some(index), Some(stride)) => {
                offset = index
                    .checked_mul(stride)
                    .and_then(|step| offset.checked_add(step))
                    .ok_or_else(|| out_of_range(op, format!("offset into '{}'", access.buffer)))?;
            }
            // the host loader patches the whole base address, static parts included
            _ if access.level == MemoryLevel::External => return Ok(0),
            _ => {
                return Err(CompileError::NonStaticShape {
                    message: format!("offset {} * {} into '{}' is not static", index, stride, access.buffer),
                    op: op.id,
                    location: op.location.clone(),
                })
            }
        }
    }
    Ok(offset)
}

pub struct DescriptorSynthesizer<'a> {
    graph: &'a MovementGraph,
    device: &'a Device,
    locks: &'a LockAllocator,
    bindings: &'a BufferBindings,
}

impl<'a> DescriptorSynthesizer<'a> {
    pub fn new(
        graph: &'a MovementGraph,
        device: &'a Device,
        locks: &'a LockAllocator,
        bindings: &'a BufferBindings,
    ) -> Self {
        Self {
            graph,
            device,
            locks,
            bindings,
        }
    }

    /// Build the DMA program of every tile that has allocations
    pub fn synthesize<'b>(
        &self,
        allocations: impl IntoIterator<Item = &'b ChannelAllocation>,
    ) -> CompileResult<Vec<TileProgram>> {
        let mut by_tile: BTreeMap<Coord, BTreeMap<(Direction, u32), &ChannelAllocation>> = BTreeMap::new();
        for alloc in allocations {
            by_tile
                .entry(alloc.key.tile)
                .or_default()
                .insert((alloc.key.direction, alloc.key.id), alloc);
        }

        let target = self.device.target();
        let mut programs = Vec::new();
        for (tile, channels) in by_tile {
            let mut program = TileProgram {
                tile,
                role: target.role_of_row(tile.row),
                dispatcher: Dispatcher {
                    primitive: target.start_primitive,
                    entries: Vec::new(),
                },
                channels: Vec::new(),
            };
            for alloc in channels.values().filter(|a| !a.ops.is_empty()) {
                program.channels.push(self.channel_program(alloc)?);
            }
            let count = program.channels.len();
            program.dispatcher.entries = program
                .channels
                .iter()
                .enumerate()
                .map(|(i, c)| DispatchEntry {
                    direction: c.direction,
                    channel: c.channel,
                    program: i,
                    next: if i + 1 < count { DispatchNext::Entry(i + 1) } else { DispatchNext::End },
                })
                .collect();
            debug!(tile = %tile, channels = count, "synthesized tile program");
            programs.push(program);
        }
        Ok(programs)
    }

    fn binding(&self, alloc: &ChannelAllocation, op: OpRef) -> CompileResult<BufferId> {
        self.bindings.get(&(alloc.key, op)).copied().ok_or_else(|| {
            CompileError::codegen(format!("op {} on channel {} has no buffer", self.graph.op(op).id, alloc.key))
        })
    }

    fn channel_program(&self, alloc: &ChannelAllocation) -> CompileResult<ChannelProgram> {
        let count = alloc.ops.len();
        let mut blocks = Vec::with_capacity(count);
        for (i, op_ref) in alloc.ops.iter().enumerate() {
            let op = self.graph.op(*op_ref);
            let access = op
                .access_at(alloc.level)
                .ok_or_else(|| CompileError::codegen(format!("op {} has no {} side", op.id, alloc.level)))?;
            let buffer_id = self.binding(alloc, *op_ref)?;
            let buffer = self.device.buffer(buffer_id);
            let pair = self.locks.lookup(buffer_id, alloc.key).ok_or_else(|| {
                CompileError::codegen(format!("no locks for '{}' on {}", buffer.symbol, alloc.key))
            })?;
            let (acquire, release) = self.locks.policy().dma_guard(pair, alloc.key.direction);
            let descriptor = Descriptor {
                buffer: buffer.symbol.clone(),
                offset: base_offset(op, access, buffer)?,
                length: transfer_length(op, access, buffer)?,
            };
            trace!(op = op.id, channel = %alloc.key, offset = descriptor.offset, length = descriptor.length, "descriptor");
            blocks.push(DescriptorBlock {
                op_id: op.id,
                acquire,
                descriptor,
                release,
                next: (i + 1) % count,
            });
        }
        Ok(ChannelProgram {
            direction: alloc.key.direction,
            channel: alloc.key.id,
            blocks,
        })
    }

    /// Lock actions for compute-core uses of tile-local buffers
    pub fn core_locks<'b>(
        &self,
        allocations: impl IntoIterator<Item = &'b ChannelAllocation>,
    ) -> CompileResult<Vec<CoreProgram>> {
        let mut by_tile: BTreeMap<Coord, Vec<CoreLockUse>> = BTreeMap::new();
        for alloc in allocations {
            if alloc.level != MemoryLevel::TileLocal {
                continue;
            }
            for op_ref in &alloc.ops {
                let buffer_id = self.binding(alloc, *op_ref)?;
                let Some(pair) = self.locks.lookup(buffer_id, alloc.key) else {
                    continue;
                };
                let (acquire, release) = self.locks.policy().core_guard(pair, alloc.key.direction);
                by_tile.entry(alloc.key.tile).or_default().push(CoreLockUse {
                    op_id: self.graph.op(*op_ref).id,
                    buffer: self.device.buffer(buffer_id).symbol.clone(),
                    channel: alloc.key,
                    acquire,
                    release,
                });
            }
        }
        Ok(by_tile
            .into_iter()
            .map(|(tile, uses)| CoreProgram { tile, uses })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BufferKey;
    use crate::graph::BufferDecl;
    use crate::lock::LockOp;
    use crate::target::{LockPolicy, TargetModel};

    fn buffer(shape: &[u64], level: MemoryLevel) -> Buffer {
        Buffer {
            symbol: "b".into(),
            decl: "b".into(),
            level,
            shape: shape.to_vec(),
            element_bytes: 4,
            tile: None,
        }
    }

    fn op_with(access: Access) -> MovementOp {
        MovementOp::put(1, "c", access)
    }

    #[test]
    fn test_row_major_strides() {
        assert_eq!(row_major_strides(&[4, 8, 2]), Some(vec![16, 2, 1]));
        assert_eq!(row_major_strides(&[]), Some(Vec::new()));
        assert_eq!(row_major_strides(&[2, u64::MAX, 4]), None);
    }

    #[test]
    fn test_length_defaults_to_volume() {
        let access = Access::new("b", MemoryLevel::TileLocal);
        let buf = buffer(&[8, 4], MemoryLevel::TileLocal);
        assert_eq!(transfer_length(&op_with(access.clone()), &access, &buf).unwrap(), 32);
        let window = access.with_sizes(&[2, 4]);
        assert_eq!(transfer_length(&op_with(window.clone()), &window, &buf).unwrap(), 8);
    }

    #[test]
    fn test_dynamic_size_rejected() {
        let access = Access::new("b", MemoryLevel::External).with_sizes(&[4, 4]).with_dynamic_size(1, "n");
        let buf = buffer(&[16, 16], MemoryLevel::External);
        let err = transfer_length(&op_with(access.clone()), &access, &buf).unwrap_err();
        assert!(matches!(err, CompileError::NonStaticShape { op: 1, .. }));
    }

    #[test]
    fn test_offset_with_default_strides() {
        let access = Access::new("b", MemoryLevel::Shared).with_offsets(&[2, 3]);
        let buf = buffer(&[8, 16], MemoryLevel::Shared);
        assert_eq!(base_offset(&op_with(access.clone()), &access, &buf).unwrap(), 35);
        let strided = access.with_strides(&[100, 1]);
        assert_eq!(base_offset(&op_with(strided.clone()), &strided, &buf).unwrap(), 203);
    }

    #[test]
    fn test_dynamic_offset_only_external() {
        let mut access = Access::new("b", MemoryLevel::External);
        access.offsets = vec![Dim::Dynamic("i".into()), Dim::Static(0)];
        let ext = buffer(&[8, 8], MemoryLevel::External);
        assert_eq!(base_offset(&op_with(access.clone()), &access, &ext).unwrap(), 0);

        access.level = MemoryLevel::TileLocal;
        let local = buffer(&[8, 8], MemoryLevel::TileLocal);
        assert!(base_offset(&op_with(access.clone()), &access, &local).is_err());
    }

    #[test]
    fn test_dynamic_offset_drops_static_parts() {
        let mut access = Access::new("b", MemoryLevel::External);
        access.offsets = vec![Dim::Static(3), Dim::Dynamic("j".into())];
        let ext = buffer(&[8, 8], MemoryLevel::External);
        assert_eq!(base_offset(&op_with(access.clone()), &access, &ext).unwrap(), 0);
    }

    #[test]
    fn test_oversized_length_is_an_error() {
        let access = Access::new("b", MemoryLevel::External).with_sizes(&[u64::MAX, 4]);
        let buf = buffer(&[16], MemoryLevel::External);
        let err = transfer_length(&op_with(access.clone()), &access, &buf).unwrap_err();
        assert!(matches!(err, CompileError::InvalidGraph { op: Some(1), .. }));

        let whole = Access::new("b", MemoryLevel::External);
        let huge = buffer(&[u64::MAX, 2], MemoryLevel::External);
        assert!(transfer_length(&op_with(whole.clone()), &whole, &huge).is_err());
    }

    #[test]
    fn test_oversized_offset_is_an_error() {
        let access = Access::new("b", MemoryLevel::TileLocal)
            .with_offsets(&[u64::MAX, 1])
            .with_strides(&[2, 1]);
        let buf = buffer(&[8, 8], MemoryLevel::TileLocal);
        let err = base_offset(&op_with(access.clone()), &access, &buf).unwrap_err();
        assert!(matches!(err, CompileError::InvalidGraph { .. }));

        let sum = Access::new("b", MemoryLevel::TileLocal)
            .with_offsets(&[u64::MAX, 1])
            .with_strides(&[1, 1]);
        assert!(base_offset(&op_with(sum.clone()), &sum, &buf).is_err());

        // natural strides of this buffer overflow
        let natural = Access::new("b", MemoryLevel::TileLocal).with_offsets(&[1, 0, 0]);
        let wide = buffer(&[2, u64::MAX, 4], MemoryLevel::TileLocal);
        assert!(base_offset(&op_with(natural.clone()), &natural, &wide).is_err());
    }

    #[test]
    fn test_offset_stride_rank_mismatch() {
        let buf = buffer(&[4, 4, 4], MemoryLevel::Shared);
        let short = Access::new("b", MemoryLevel::Shared)
            .with_offsets(&[1, 2, 3])
            .with_strides(&[64]);
        let err = base_offset(&op_with(short.clone()), &short, &buf).unwrap_err();
        assert!(matches!(err, CompileError::InvalidGraph { op: Some(1), .. }));

        let long = Access::new("b", MemoryLevel::Shared)
            .with_offsets(&[1])
            .with_strides(&[16, 4, 1]);
        assert!(base_offset(&op_with(long.clone()), &long, &buf).is_err());

        let over_rank = Access::new("b", MemoryLevel::Shared).with_offsets(&[0, 1, 2, 3]);
        assert!(base_offset(&op_with(over_rank.clone()), &over_rank, &buf).is_err());

        let matched = Access::new("b", MemoryLevel::Shared)
            .with_offsets(&[1, 2, 3])
            .with_strides(&[16, 4, 1]);
        assert_eq!(base_offset(&op_with(matched.clone()), &matched, &buf).unwrap(), 27);
    }

    #[test]
    fn test_circular_chain_and_dispatcher() {
        let target = TargetModel::gen2(4, 6);
        let mut graph = MovementGraph::new("seg");
        graph.add_buffer(BufferDecl::new("l1", MemoryLevel::TileLocal, &[16], 4));
        let tile = Coord::new(1, 2);
        for id in 0..3 {
            graph.push(MovementOp::get(id, "c", Access::new("l1", MemoryLevel::TileLocal)));
        }
        graph.push(MovementOp::put(9, "d", Access::new("l1", MemoryLevel::TileLocal)));

        let mut device = Device::new(target.clone());
        let decl = graph.buffers[0].clone();
        let buf = device.intern_buffer(BufferKey::Local { name: "l1".into(), tile }, &decl, Some(tile));
        let inbound = ChannelAllocation {
            key: ChannelKey::new(tile, Direction::Inbound, 0),
            level: MemoryLevel::TileLocal,
            partner: None,
            op_ids: vec![0, 1, 2],
            ops: vec![0, 1, 2],
        };
        let outbound = ChannelAllocation {
            key: ChannelKey::new(tile, Direction::Outbound, 1),
            level: MemoryLevel::TileLocal,
            partner: None,
            op_ids: vec![9],
            ops: vec![3],
        };
        let mut locks = LockAllocator::new(LockPolicy::Counting);
        let mut bindings = BufferBindings::new();
        for alloc in [&inbound, &outbound] {
            locks.locks_for(&mut device, buf, alloc.key).unwrap();
            for op in &alloc.ops {
                bindings.insert((alloc.key, *op), buf);
            }
        }

        let synth = DescriptorSynthesizer::new(&graph, &device, &locks, &bindings);
        let programs = synth.synthesize([&outbound, &inbound]).unwrap();
        assert_eq!(programs.len(), 1);
        let program = &programs[0];
        assert_eq!(program.role, TileRole::Compute);
        assert_eq!(program.dispatcher.primitive, StartPrimitive::StartTask);
        assert_eq!(program.dispatcher.entries[0].direction, Direction::Inbound);
        assert_eq!(program.dispatcher.entries[0].next, DispatchNext::Entry(1));
        assert_eq!(program.dispatcher.entries[1].next, DispatchNext::End);

        let chain = program.channel(Direction::Inbound, 0).unwrap();
        let nexts: Vec<_> = chain.blocks.iter().map(|b| b.next).collect();
        assert_eq!(nexts, vec![1, 2, 0]);
        assert_eq!(chain.blocks[0].acquire.op, LockOp::AcquireGreaterEqual);
        assert_eq!(chain.blocks[0].descriptor.length, 16);

        let single = program.channel(Direction::Outbound, 1).unwrap();
        assert_eq!(single.blocks[0].next, 0);

        let cores = synth.core_locks([&inbound, &outbound]).unwrap();
        assert_eq!(cores[0].uses.len(), 4);
    }
}
