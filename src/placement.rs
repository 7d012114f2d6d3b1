//! Shared-buffer placement
//!
//! Mid-level buffers are spread round-robin over the shared memory tiles.
//! A tile without room for the next buffer is skipped; the cursor moves on
//! after every placement.

use tracing::debug;

use crate::device::Coord;
use crate::error::{CompileError, CompileResult};
use crate::target::TargetModel;

#[derive(Debug, Clone)]
pub struct BufferPlacer {
    bins: Vec<(Coord, u64)>,
    cursor: usize,
}

impl BufferPlacer {
    pub fn new(target: &TargetModel) -> Self {
        let bins = target
            .shared_tiles()
            .into_iter()
            .map(|(col, row)| (Coord::new(col, row), target.shared_tile_bytes))
            .collect();
        Self { bins, cursor: 0 }
    }

    /// Place `bytes` bytes for buffer `name`, returning the chosen tile
    pub fn place(&mut self, name: &str, bytes: u64) -> CompileResult<Coord> {
        if self.bins.is_empty() {
            return Err(CompileError::capacity(format!(
                "shared memory tiles for buffer '{}' (target has none)",
                name
            )));
        }
        let count = self.bins.len();
        let mut skipped = 0;
        while self.bins[self.cursor].1 < bytes {
            self.cursor = (self.cursor + 1) % count;
            skipped += 1;
            if skipped >= count {
                return Err(CompileError::capacity(format!(
                    "shared memory for buffer '{}' ({} bytes)",
                    name, bytes
                )));
            }
        }
        let (tile, remaining) = &mut self.bins[self.cursor];
        *remaining -= bytes;
        let tile = *tile;
        debug!(buffer = name, bytes, tile = %tile, "placed shared buffer");
        self.cursor = (self.cursor + 1) % count;
        Ok(tile)
    }

    /// Bytes still free on `tile`
    pub fn free_bytes(&self, tile: Coord) -> Option<u64> {
        self.bins.iter().find(|(c, _)| *c == tile).map(|(_, free)| *free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_target() -> TargetModel {
        let mut target = TargetModel::gen2(3, 4);
        target.shared_tile_bytes = 1000;
        target
    }

    #[test]
    fn test_round_robin() {
        let mut placer = BufferPlacer::new(&small_target());
        let tiles: Vec<_> = (0..4).map(|i| placer.place(&format!("b{}", i), 100).unwrap()).collect();
        assert_eq!(
            tiles,
            vec![Coord::new(0, 1), Coord::new(1, 1), Coord::new(2, 1), Coord::new(0, 1)]
        );
        assert_eq!(placer.free_bytes(Coord::new(0, 1)), Some(800));
    }

    #[test]
    fn test_skips_full_tiles() {
        let mut placer = BufferPlacer::new(&small_target());
        assert_eq!(placer.place("big", 900).unwrap(), Coord::new(0, 1));
        assert_eq!(placer.place("a", 900).unwrap(), Coord::new(1, 1));
        assert_eq!(placer.place("b", 900).unwrap(), Coord::new(2, 1));
        // wraps around past three nearly full tiles
        assert!(placer.place("c", 200).is_err());
        assert_eq!(placer.place("d", 100).unwrap(), Coord::new(0, 1));
    }

    #[test]
    fn test_no_shared_tiles() {
        let mut placer = BufferPlacer::new(&TargetModel::gen1(4, 4));
        assert!(matches!(
            placer.place("x", 4),
            Err(CompileError::CapacityExhausted { .. })
        ));
    }
}
