//! Physical device arena
//!
//! Tiles, locks and placed buffers live in flat vectors and are referred to
//! by index. Tiles are created on first use and indexed by coordinate.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{CompileError, CompileResult};
use crate::graph::{checked_volume, BufferDecl, MemoryLevel, OpRef};
use crate::target::{TargetModel, TileRole};

/// Grid coordinate of a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub col: u32,
    pub row: u32,
}

impl Coord {
    pub fn new(col: u32, row: u32) -> Self {
        Self { col, row }
    }
}

impl std::fmt::Display for Coord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.col, self.row)
    }
}

/// Direction of a DMA channel relative to its tile's memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Stream to memory
    Inbound,
    /// Memory to stream
    Outbound,
}

impl Direction {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Direction::Inbound => "S2MM",
            Direction::Outbound => "MM2S",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// A physical DMA channel: tile, direction and channel number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub tile: Coord,
    pub direction: Direction,
    pub id: u32,
}

impl ChannelKey {
    pub fn new(tile: Coord, direction: Direction, id: u32) -> Self {
        Self { tile, direction, id }
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}{}", self.tile, self.direction.mnemonic(), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub coord: Coord,
    pub role: TileRole,
    pub locks: Vec<LockId>,
}

/// A hardware lock instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub tile: Coord,
    pub id: u32,
    pub init: i32,
}

/// How a placed buffer is identified. Tile-local buffers are private per
/// tile; external buffers are materialized per op instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BufferKey {
    Local { name: String, tile: Coord },
    Shared { name: String },
    External { name: String, op: OpRef },
}

/// A buffer bound to a concrete home
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffer {
    /// Unique symbol in the emitted program
    pub symbol: String,
    /// Name of the graph-level declaration
    pub decl: String,
    pub level: MemoryLevel,
    pub shape: Vec<u64>,
    pub element_bytes: u64,
    /// Owning tile; `None` for external memory
    pub tile: Option<Coord>,
}

impl Buffer {
    pub fn volume(&self) -> Option<u64> {
        checked_volume(&self.shape)
    }
}

/// Arena of everything allocated on the device
#[derive(Debug, Clone)]
pub struct Device {
    target: TargetModel,
    tiles: Vec<Tile>,
    tile_index: BTreeMap<Coord, TileId>,
    locks: Vec<Lock>,
    buffers: Vec<Buffer>,
    buffer_index: HashMap<BufferKey, BufferId>,
    shared_homes: BTreeMap<String, Coord>,
}

impl Device {
    pub fn new(target: TargetModel) -> Self {
        Self {
            target,
            tiles: Vec::new(),
            tile_index: BTreeMap::new(),
            locks: Vec::new(),
            buffers: Vec::new(),
            buffer_index: HashMap::new(),
            shared_homes: BTreeMap::new(),
        }
    }

    pub fn target(&self) -> &TargetModel {
        &self.target
    }

    /// Get or create the tile at `coord`
    pub fn tile(&mut self, coord: Coord) -> CompileResult<TileId> {
        if let Some(id) = self.tile_index.get(&coord) {
            return Ok(*id);
        }
        if !self.target.contains(coord.col, coord.row) {
            return Err(CompileError::invalid_graph(format!(
                "tile {} is outside the {}x{} grid",
                coord, self.target.columns, self.target.rows
            )));
        }
        let id = TileId(self.tiles.len());
        self.tiles.push(Tile {
            coord,
            role: self.target.role_of_row(coord.row),
            locks: Vec::new(),
        });
        self.tile_index.insert(coord, id);
        Ok(id)
    }

    pub fn find_tile(&self, coord: Coord) -> Option<TileId> {
        self.tile_index.get(&coord).copied()
    }

    pub fn tile_ref(&self, id: TileId) -> &Tile {
        &self.tiles[id.0]
    }

    /// Tiles in coordinate order
    pub fn tiles(&self) -> impl Iterator<Item = &Tile> {
        self.tile_index.values().map(move |id| &self.tiles[id.0])
    }

    /// Allocate a lock on `coord`.
    ///
    /// With `id` set, an existing lock with that id is returned as is.
    /// Otherwise the lowest unused id is taken.
    pub fn allocate_lock(&mut self, coord: Coord, init: i32, id: Option<u32>) -> CompileResult<LockId> {
        let tile = self.tile(coord)?;
        let used: Vec<u32> = self.tiles[tile.0].locks.iter().map(|l| self.locks[l.0].id).collect();
        if let Some(wanted) = id {
            if let Some(pos) = used.iter().position(|u| *u == wanted) {
                return Ok(self.tiles[tile.0].locks[pos]);
            }
        }
        let budget = self.target.budget(self.tiles[tile.0].role).locks;
        let lock_id = match id {
            Some(wanted) => wanted,
            None => (0..budget).find(|candidate| !used.contains(candidate)).unwrap_or(budget),
        };
        if lock_id >= budget {
            return Err(CompileError::capacity(format!(
                "locks on {} tile {} ({} available)",
                self.tiles[tile.0].role, coord, budget
            )));
        }
        let lock = LockId(self.locks.len());
        self.locks.push(Lock {
            tile: coord,
            id: lock_id,
            init,
        });
        self.tiles[tile.0].locks.push(lock);
        Ok(lock)
    }

    pub fn lock(&self, id: LockId) -> &Lock {
        &self.locks[id.0]
    }

    pub fn locks(&self) -> &[Lock] {
        &self.locks
    }

    /// Intern the buffer identified by `key`, placing it on `tile`
    pub fn intern_buffer(&mut self, key: BufferKey, decl: &BufferDecl, tile: Option<Coord>) -> BufferId {
        if let Some(id) = self.buffer_index.get(&key) {
            return *id;
        }
        let symbol = match &key {
            BufferKey::Local { name, tile } => format!("{}_{}_{}", name, tile.col, tile.row),
            BufferKey::Shared { name } => name.clone(),
            BufferKey::External { name, op } => format!("{}_ext{}", name, op),
        };
        let id = BufferId(self.buffers.len());
        self.buffers.push(Buffer {
            symbol,
            decl: decl.name.clone(),
            level: decl.level,
            shape: decl.shape.clone(),
            element_bytes: decl.element_bytes,
            tile,
        });
        self.buffer_index.insert(key, id);
        id
    }

    pub fn buffer(&self, id: BufferId) -> &Buffer {
        &self.buffers[id.0]
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn set_shared_home(&mut self, name: impl Into<String>, tile: Coord) {
        self.shared_homes.insert(name.into(), tile);
    }

    /// Tile a shared buffer was placed on
    pub fn shared_home(&self, name: &str) -> Option<Coord> {
        self.shared_homes.get(name).copied()
    }
}
