//! Movement-op graph handed over by the upstream graph constructor
//!
//! One `MovementGraph` describes one device scope: the buffers it touches,
//! the logical channels that pair producers with consumers, the replicated
//! spatial regions ops are instantiated into, and the movement ops
//! themselves in program order.

use serde::{Deserialize, Serialize};

use crate::device::Direction;
use crate::error::{CompileError, CompileResult};
use crate::serializer::HostFunction;

/// Index of a movement-op instance inside `MovementGraph::ops`
pub type OpRef = usize;

/// Memory hierarchy level. Ordered from closest to compute outwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLevel {
    TileLocal,
    Shared,
    External,
}

impl MemoryLevel {
    pub fn index(self) -> u8 {
        match self {
            MemoryLevel::TileLocal => 0,
            MemoryLevel::Shared => 1,
            MemoryLevel::External => 2,
        }
    }
}

impl std::fmt::Display for MemoryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryLevel::TileLocal => write!(f, "tile-local"),
            MemoryLevel::Shared => write!(f, "shared"),
            MemoryLevel::External => write!(f, "external"),
        }
    }
}

/// One extent/offset/stride entry: a compile-time constant or a named
/// run-time value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dim {
    Static(u64),
    Dynamic(String),
}

impl Dim {
    pub fn as_static(&self) -> Option<u64> {
        match self {
            Dim::Static(v) => Some(*v),
            Dim::Dynamic(_) => None,
        }
    }
}

impl std::fmt::Display for Dim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dim::Static(v) => write!(f, "{}", v),
            Dim::Dynamic(name) => write!(f, "%{}", name),
        }
    }
}

fn statics(values: &[u64]) -> Vec<Dim> {
    values.iter().map(|v| Dim::Static(*v)).collect()
}

/// One side of a movement op: which buffer, at which level, and the
/// strided window over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub buffer: String,
    pub level: MemoryLevel,
    #[serde(default)]
    pub offsets: Vec<Dim>,
    #[serde(default)]
    pub sizes: Vec<Dim>,
    #[serde(default)]
    pub strides: Vec<Dim>,
}

impl Access {
    pub fn new(buffer: impl Into<String>, level: MemoryLevel) -> Self {
        Self {
            buffer: buffer.into(),
            level,
            offsets: Vec::new(),
            sizes: Vec::new(),
            strides: Vec::new(),
        }
    }

    pub fn with_sizes(mut self, sizes: &[u64]) -> Self {
        self.sizes = statics(sizes);
        self
    }

    pub fn with_offsets(mut self, offsets: &[u64]) -> Self {
        self.offsets = statics(offsets);
        self
    }

    pub fn with_strides(mut self, strides: &[u64]) -> Self {
        self.strides = statics(strides);
        self
    }

    /// Replace one size entry with a run-time value
    pub fn with_dynamic_size(mut self, dim: usize, name: impl Into<String>) -> Self {
        if self.sizes.len() <= dim {
            self.sizes.resize(dim + 1, Dim::Static(1));
        }
        self.sizes[dim] = Dim::Dynamic(name.into());
        self
    }
}

/// What a movement op does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpKind {
    /// Complete copy with both sides known
    Copy { src: Access, dst: Access },
    /// Producer half of a logical channel
    Put { channel: String, src: Access },
    /// Consumer half of a logical channel
    Get { channel: String, dst: Access },
}

/// An abstract asynchronous copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementOp {
    pub id: u32,
    #[serde(flatten)]
    pub kind: OpKind,
    /// Replicated region this instance belongs to
    #[serde(default)]
    pub region: Option<String>,
    /// Position of this instance inside its region
    #[serde(default)]
    pub spatial_index: Option<Vec<u32>>,
    /// Channel indices, matched against a broadcast shape
    #[serde(default)]
    pub indices: Vec<u32>,
    /// Async tokens this op waits on
    #[serde(default)]
    pub depends_on: Vec<u32>,
    #[serde(default)]
    pub location: Option<String>,
}

impl MovementOp {
    fn with_kind(id: u32, kind: OpKind) -> Self {
        Self {
            id,
            kind,
            region: None,
            spatial_index: None,
            indices: Vec::new(),
            depends_on: Vec::new(),
            location: None,
        }
    }

    pub fn copy(id: u32, src: Access, dst: Access) -> Self {
        Self::with_kind(id, OpKind::Copy { src, dst })
    }

    pub fn put(id: u32, channel: impl Into<String>, src: Access) -> Self {
        Self::with_kind(id, OpKind::Put { channel: channel.into(), src })
    }

    pub fn get(id: u32, channel: impl Into<String>, dst: Access) -> Self {
        Self::with_kind(id, OpKind::Get { channel: channel.into(), dst })
    }

    pub fn in_region(mut self, region: impl Into<String>, index: &[u32]) -> Self {
        self.region = Some(region.into());
        self.spatial_index = Some(index.to_vec());
        self
    }

    pub fn with_indices(mut self, indices: &[u32]) -> Self {
        self.indices = indices.to_vec();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn src(&self) -> Option<&Access> {
        match &self.kind {
            OpKind::Copy { src, .. } | OpKind::Put { src, .. } => Some(src),
            OpKind::Get { .. } => None,
        }
    }

    pub fn dst(&self) -> Option<&Access> {
        match &self.kind {
            OpKind::Copy { dst, .. } | OpKind::Get { dst, .. } => Some(dst),
            OpKind::Put { .. } => None,
        }
    }

    pub fn channel(&self) -> Option<&str> {
        match &self.kind {
            OpKind::Put { channel, .. } | OpKind::Get { channel, .. } => Some(channel),
            OpKind::Copy { .. } => None,
        }
    }

    /// Direction of the DMA channel that serves this op at `level`.
    ///
    /// The side living at `level` decides: reading from it is outbound,
    /// writing into it is inbound.
    pub fn direction_at(&self, level: MemoryLevel) -> CompileResult<Direction> {
        if self.src().map(|a| a.level) == Some(level) {
            Ok(Direction::Outbound)
        } else if self.dst().map(|a| a.level) == Some(level) {
            Ok(Direction::Inbound)
        } else {
            Err(self.path_error())
        }
    }

    /// The side of this op that lives at `level`
    pub fn access_at(&self, level: MemoryLevel) -> Option<&Access> {
        self.src()
            .filter(|a| a.level == level)
            .or_else(|| self.dst().filter(|a| a.level == level))
    }

    fn path_error(&self) -> CompileError {
        let show = |a: Option<&Access>| a.map(|a| a.level.to_string()).unwrap_or_else(|| "stream".into());
        CompileError::unsupported_path(show(self.src()), show(self.dst()))
            .at_op(self.id, self.location.as_deref())
    }
}

/// A typed memory region declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDecl {
    pub name: String,
    pub level: MemoryLevel,
    pub shape: Vec<u64>,
    #[serde(default = "default_element_bytes")]
    pub element_bytes: u64,
}

fn default_element_bytes() -> u64 {
    4
}

impl BufferDecl {
    pub fn new(name: impl Into<String>, level: MemoryLevel, shape: &[u64], element_bytes: u64) -> Self {
        Self {
            name: name.into(),
            level,
            shape: shape.to_vec(),
            element_bytes,
        }
    }

    /// Number of elements, `None` when it does not fit in a `u64`
    pub fn volume(&self) -> Option<u64> {
        checked_volume(&self.shape)
    }

    pub fn bytes(&self) -> Option<u64> {
        self.volume()?.checked_mul(self.element_bytes)
    }
}

/// A logical channel pairing puts with gets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDecl {
    pub name: String,
    #[serde(default)]
    pub broadcast_shape: Option<Vec<u32>>,
}

impl ChannelDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            broadcast_shape: None,
        }
    }

    pub fn broadcast(name: impl Into<String>, shape: &[u32]) -> Self {
        Self {
            name: name.into(),
            broadcast_shape: Some(shape.to_vec()),
        }
    }

    /// Number of distinct consumer endpoints, `None` on overflow
    pub fn consumer_count(&self) -> Option<u32> {
        match &self.broadcast_shape {
            Some(shape) => shape.iter().try_fold(1u32, |n, d| n.checked_mul(*d)),
            None => Some(1),
        }
    }
}

/// A replicated spatial region of compute tiles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub col: u32,
    pub row: u32,
    pub cols: u32,
    pub rows: u32,
}

impl Region {
    pub fn new(name: impl Into<String>, col: u32, row: u32, cols: u32, rows: u32) -> Self {
        Self {
            name: name.into(),
            col,
            row,
            cols,
            rows,
        }
    }

    pub fn size(&self) -> Vec<u32> {
        vec![self.cols, self.rows]
    }

    /// Physical (col, row) of the cell at `index`
    pub fn tile_at(&self, index: &[u32]) -> Option<(u32, u32)> {
        let x = index.first().copied().unwrap_or(0);
        let y = index.get(1).copied().unwrap_or(0);
        if index.len() > 2 || x >= self.cols || y >= self.rows {
            return None;
        }
        Some((self.col + x, self.row + y))
    }
}

/// Product of `dims`, `None` when it does not fit in a `u64`
pub fn checked_volume(dims: &[u64]) -> Option<u64> {
    dims.iter().try_fold(1u64, |n, d| n.checked_mul(*d))
}

/// Multi-dimensional position of linear iteration `iter` over `sizes`,
/// dimension 0 varying fastest.
pub fn position_from_linear(sizes: &[u32], mut iter: u32) -> Vec<u32> {
    let mut position = Vec::with_capacity(sizes.len());
    for size in sizes {
        let size = (*size).max(1);
        position.push(iter % size);
        iter /= size;
    }
    position
}

/// Movement-op graph of one device scope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovementGraph {
    pub scope: String,
    #[serde(default)]
    pub buffers: Vec<BufferDecl>,
    #[serde(default)]
    pub channels: Vec<ChannelDecl>,
    #[serde(default)]
    pub regions: Vec<Region>,
    #[serde(default)]
    pub ops: Vec<MovementOp>,
    #[serde(default)]
    pub host: Option<HostFunction>,
}

impl MovementGraph {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Self::default()
        }
    }

    pub fn from_json(source: &str) -> CompileResult<Self> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn add_buffer(&mut self, decl: BufferDecl) -> &mut Self {
        self.buffers.push(decl);
        self
    }

    pub fn add_channel(&mut self, decl: ChannelDecl) -> &mut Self {
        self.channels.push(decl);
        self
    }

    pub fn add_region(&mut self, region: Region) -> &mut Self {
        self.regions.push(region);
        self
    }

    /// Append an op instance, returning its reference
    pub fn push(&mut self, op: MovementOp) -> OpRef {
        self.ops.push(op);
        self.ops.len() - 1
    }

    /// Instantiate `op` once per cell of `region`. Channel indices of each
    /// instance are its position.
    pub fn replicate(&mut self, op: MovementOp, region: &str) -> CompileResult<Vec<OpRef>> {
        let size = self
            .region(region)
            .map(Region::size)
            .ok_or_else(|| CompileError::invalid_graph(format!("unknown region '{}'", region)))?;
        let count = size
            .iter()
            .try_fold(1u32, |n, d| n.checked_mul(*d))
            .ok_or_else(|| CompileError::invalid_graph(format!("region '{}' has too many cells", region)))?;
        let mut refs = Vec::new();
        for iter in 0..count {
            let position = position_from_linear(&size, iter);
            let mut instance = op.clone();
            instance.region = Some(region.to_string());
            instance.spatial_index = Some(position.clone());
            if instance.channel().is_some() {
                instance.indices = position;
            }
            refs.push(self.push(instance));
        }
        Ok(refs)
    }

    pub fn buffer(&self, name: &str) -> Option<&BufferDecl> {
        self.buffers.iter().find(|b| b.name == name)
    }

    pub fn channel_decl(&self, name: &str) -> Option<&ChannelDecl> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn region(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.name == name)
    }

    pub fn op(&self, op: OpRef) -> &MovementOp {
        &self.ops[op]
    }

    /// Check that every reference in the graph resolves
    pub fn validate(&self) -> CompileResult<()> {
        for decl in &self.buffers {
            if decl.bytes().is_none() {
                return Err(CompileError::invalid_graph(format!(
                    "buffer '{}' of shape {:?} overflows a 64-bit byte count",
                    decl.name, decl.shape
                )));
            }
        }
        for decl in &self.channels {
            if decl.consumer_count().is_none() {
                return Err(CompileError::invalid_graph(format!(
                    "broadcast shape {:?} of channel '{}' has too many destinations",
                    decl.broadcast_shape, decl.name
                )));
            }
        }
        for op in &self.ops {
            let fail = |msg: String| CompileError::invalid_graph(msg).at_op(op.id, op.location.as_deref());
            for access in op.src().into_iter().chain(op.dst()) {
                let decl = self
                    .buffer(&access.buffer)
                    .ok_or_else(|| fail(format!("unknown buffer '{}'", access.buffer)))?;
                if decl.level != access.level {
                    return Err(fail(format!(
                        "buffer '{}' is declared {} but accessed as {}",
                        decl.name, decl.level, access.level
                    )));
                }
            }
            if let Some(channel) = op.channel() {
                if self.channel_decl(channel).is_none() {
                    return Err(fail(format!("unknown channel '{}'", channel)));
                }
            }
            if let Some(region) = &op.region {
                if self.region(region).is_none() {
                    return Err(fail(format!("unknown region '{}'", region)));
                }
            }
        }
        Ok(())
    }
}
