//! Interface-tile allocator
//!
//! Hands out (interface tile, channel) slots per direction. Each direction
//! fills one interface column before opening the next, walking the target's
//! interface columns in order.

use crate::device::{Coord, Direction};
use crate::error::{CompileError, CompileResult};
use crate::target::{TargetModel, TileRole};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    tile: Coord,
    available: u32,
}

#[derive(Debug, Clone)]
pub struct InterfaceTileAllocator {
    columns: Vec<u32>,
    capacity: u32,
    outbound: Vec<Slot>,
    inbound: Vec<Slot>,
}

impl InterfaceTileAllocator {
    pub fn new(target: &TargetModel) -> Self {
        Self {
            columns: target.interface_columns.clone(),
            capacity: target.channels(TileRole::Interface),
            outbound: Vec::new(),
            inbound: Vec::new(),
        }
    }

    fn slots(&self, direction: Direction) -> &Vec<Slot> {
        match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        }
    }

    fn slots_mut(&mut self, direction: Direction) -> &mut Vec<Slot> {
        match direction {
            Direction::Outbound => &mut self.outbound,
            Direction::Inbound => &mut self.inbound,
        }
    }

    /// The channel `assign` would hand out next, without taking it
    pub fn peek(&self, direction: Direction) -> CompileResult<(Coord, u32)> {
        if let Some(slot) = self.slots(direction).iter().find(|s| s.available > 0) {
            return Ok((slot.tile, self.capacity - slot.available));
        }
        let opened = self.slots(direction).len();
        match self.columns.get(opened) {
            Some(col) if self.capacity > 0 => Ok((Coord::new(*col, 0), 0)),
            _ => Err(CompileError::capacity(format!(
                "{} interface channels ({} columns x {} channels)",
                direction,
                self.columns.len(),
                self.capacity
            ))),
        }
    }

    /// Take the next free channel in `direction`. Nothing changes on failure.
    pub fn assign(&mut self, direction: Direction) -> CompileResult<(Coord, u32)> {
        let (tile, channel) = self.peek(direction)?;
        let capacity = self.capacity;
        let slots = self.slots_mut(direction);
        match slots.iter_mut().find(|s| s.tile == tile) {
            Some(slot) => slot.available -= 1,
            None => slots.push(Slot {
                tile,
                available: capacity - 1,
            }),
        }
        Ok((tile, channel))
    }

    /// Interface tiles opened so far in `direction`
    pub fn tiles_in_use(&self, direction: Direction) -> Vec<Coord> {
        self.slots(direction).iter().map(|s| s.tile).collect()
    }

    /// Channels still obtainable in `direction`
    pub fn remaining(&self, direction: Direction) -> u32 {
        let open: u32 = self.slots(direction).iter().map(|s| s.available).sum();
        let unopened = self.columns.len().saturating_sub(self.slots(direction).len()) as u32;
        open + unopened * self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fills_column_before_next() {
        let target = TargetModel::gen1(8, 4);
        let mut alloc = InterfaceTileAllocator::new(&target);
        let got: Vec<_> = (0..4).map(|_| alloc.assign(Direction::Outbound).unwrap()).collect();
        assert_eq!(
            got,
            vec![
                (Coord::new(2, 0), 0),
                (Coord::new(2, 0), 1),
                (Coord::new(3, 0), 0),
                (Coord::new(3, 0), 1),
            ]
        );
        // directions are independent
        assert_eq!(alloc.assign(Direction::Inbound).unwrap(), (Coord::new(2, 0), 0));
    }

    #[test]
    fn test_exhaustion_leaves_state() {
        let mut target = TargetModel::gen1(4, 4);
        target.interface_columns = vec![2];
        let mut alloc = InterfaceTileAllocator::new(&target);
        alloc.assign(Direction::Inbound).unwrap();
        alloc.assign(Direction::Inbound).unwrap();
        assert_eq!(alloc.remaining(Direction::Inbound), 0);
        let err = alloc.assign(Direction::Inbound).unwrap_err();
        assert!(matches!(err, CompileError::CapacityExhausted { .. }));
        assert_eq!(alloc.tiles_in_use(Direction::Inbound), vec![Coord::new(2, 0)]);
        assert_eq!(alloc.remaining(Direction::Outbound), 2);
    }
}
