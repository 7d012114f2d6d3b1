//! Target capability descriptor
//!
//! Describes the tile array the mapper allocates onto: grid extent, which
//! columns can face external memory, per-role channel/lock/descriptor budgets,
//! and the device-generation dependent lock and start semantics.

use serde::{Deserialize, Serialize};

/// Role of a tile in the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileRole {
    /// Row 0: reaches external memory (when its column is an interface column)
    Interface,
    /// Mid-level memory tile
    Shared,
    /// Compute tile with private local memory
    Compute,
}

impl std::fmt::Display for TileRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TileRole::Interface => write!(f, "interface"),
            TileRole::Shared => write!(f, "shared"),
            TileRole::Compute => write!(f, "compute"),
        }
    }
}

/// Lock semantics flavour of a device generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// One lock per buffer/channel, exact-match acquire on 0/1
    Binary,
    /// Producer and consumer semaphores, acquire-greater-or-equal
    Counting,
}

/// How a tile's dispatcher kicks off each channel's descriptor chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPrimitive {
    /// Branching start block per channel
    Start,
    /// Start queued as a restartable task
    StartTask,
}

/// Per-role resource budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBudget {
    /// DMA channels per direction
    pub channels: u32,
    /// Hardware locks on the tile
    pub locks: u32,
    /// Buffer-descriptor slots shared by all channels on the tile
    pub descriptors: u32,
}

impl RoleBudget {
    pub fn new(channels: u32, locks: u32, descriptors: u32) -> Self {
        Self {
            channels,
            locks,
            descriptors,
        }
    }
}

/// Capability description of the target device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetModel {
    /// Human-readable device name
    pub name: String,
    pub columns: u32,
    pub rows: u32,
    /// Columns whose row-0 tile has a path to external memory, in allocation order
    pub interface_columns: Vec<u32>,
    /// Number of mid-level memory rows directly above row 0
    pub shared_rows: u32,
    /// Byte capacity of each mid-level memory tile
    pub shared_tile_bytes: u64,
    pub interface: RoleBudget,
    pub shared: RoleBudget,
    pub compute: RoleBudget,
    pub lock_policy: LockPolicy,
    pub start_primitive: StartPrimitive,
    /// All regions share one control processor
    pub single_control_processor: bool,
}

impl TargetModel {
    /// First-generation array: binary locks, no mid-level memory, one
    /// shared control processor.
    pub fn gen1(columns: u32, rows: u32) -> Self {
        Self {
            name: format!("gen1-{}x{}", columns, rows),
            columns,
            rows,
            interface_columns: (0..columns).filter(|c| c % 4 == 2 || c % 4 == 3).collect(),
            shared_rows: 0,
            shared_tile_bytes: 0,
            interface: RoleBudget::new(2, 16, 16),
            shared: RoleBudget::new(0, 0, 0),
            compute: RoleBudget::new(2, 16, 16),
            lock_policy: LockPolicy::Binary,
            start_primitive: StartPrimitive::Start,
            single_control_processor: true,
        }
    }

    /// Second-generation array: counting locks and one row of 512 KiB
    /// mid-level memory tiles.
    pub fn gen2(columns: u32, rows: u32) -> Self {
        Self {
            name: format!("gen2-{}x{}", columns, rows),
            columns,
            rows,
            interface_columns: (0..columns).collect(),
            shared_rows: 1,
            shared_tile_bytes: 512 * 1024,
            interface: RoleBudget::new(2, 16, 16),
            shared: RoleBudget::new(6, 64, 48),
            compute: RoleBudget::new(2, 16, 16),
            lock_policy: LockPolicy::Counting,
            start_primitive: StartPrimitive::StartTask,
            single_control_processor: false,
        }
    }

    /// Load a target description from JSON
    pub fn from_json(source: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(source)
    }

    /// Export to JSON format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn contains(&self, col: u32, row: u32) -> bool {
        col < self.columns && row < self.rows
    }

    /// Role of the tile at `row`
    pub fn role_of_row(&self, row: u32) -> TileRole {
        if row == 0 {
            TileRole::Interface
        } else if row <= self.shared_rows {
            TileRole::Shared
        } else {
            TileRole::Compute
        }
    }

    pub fn has_shared_tiles(&self) -> bool {
        self.shared_rows > 0 && self.shared.channels > 0
    }

    pub fn budget(&self, role: TileRole) -> RoleBudget {
        match role {
            TileRole::Interface => self.interface,
            TileRole::Shared => self.shared,
            TileRole::Compute => self.compute,
        }
    }

    /// Physical DMA channel count per direction on a tile of `role`
    pub fn channels(&self, role: TileRole) -> u32 {
        self.budget(role).channels
    }

    /// Coordinates of every mid-level memory tile, row-major from row 1
    pub fn shared_tiles(&self) -> Vec<(u32, u32)> {
        let mut tiles = Vec::new();
        for row in 1..=self.shared_rows.min(self.rows.saturating_sub(1)) {
            for col in 0..self.columns {
                tiles.push((col, row));
            }
        }
        tiles
    }
}

impl Default for TargetModel {
    fn default() -> Self {
        Self::gen2(4, 6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen1_interface_columns() {
        let target = TargetModel::gen1(12, 9);
        assert_eq!(target.interface_columns, vec![2, 3, 6, 7, 10, 11]);
        assert!(!target.has_shared_tiles());
        assert_eq!(target.role_of_row(0), TileRole::Interface);
        assert_eq!(target.role_of_row(1), TileRole::Compute);
    }

    #[test]
    fn test_gen2_roles() {
        let target = TargetModel::gen2(4, 6);
        assert_eq!(target.role_of_row(1), TileRole::Shared);
        assert_eq!(target.role_of_row(2), TileRole::Compute);
        assert_eq!(target.shared_tiles(), vec![(0, 1), (1, 1), (2, 1), (3, 1)]);
        assert_eq!(target.channels(TileRole::Shared), 6);
    }

    #[test]
    fn test_json_roundtrip() {
        let target = TargetModel::gen1(8, 4);
        let json = target.to_json().unwrap();
        assert_eq!(TargetModel::from_json(&json).unwrap(), target);
    }
}
