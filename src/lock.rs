//! Lock allocation and lock-action values
//!
//! Every (buffer, channel) pair gets one lock pair, memoized so all ops on
//! the same channel touching the same buffer share it. The lock policy of
//! the target decides how many hardware locks back a pair and which values
//! the DMA and core sides acquire and release.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::device::{BufferId, ChannelKey, Device, Direction};
use crate::error::{CompileError, CompileResult};
use crate::target::LockPolicy;

/// A lock as seen from emitted actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LockRef {
    pub col: u32,
    pub row: u32,
    pub id: u32,
}

/// Read/write lock pair guarding one buffer on one channel.
///
/// `read` counts filled slots, `write` counts free slots. Under the binary
/// policy both refer to the same lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockPair {
    pub read: LockRef,
    pub write: LockRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockOp {
    /// Block until the lock holds exactly `value`
    AcquireEqual,
    /// Block until the lock holds at least `value`, then decrement
    AcquireGreaterEqual,
    /// Set (binary) or increment by (counting) `value`
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockAction {
    pub lock: LockRef,
    pub op: LockOp,
    pub value: i32,
}

impl std::fmt::Display for LockAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self.op {
            LockOp::AcquireEqual => "acquire==",
            LockOp::AcquireGreaterEqual => "acquire>=",
            LockOp::Release => "release",
        };
        write!(f, "{} lock({},{})#{} {}", op, self.lock.col, self.lock.row, self.lock.id, self.value)
    }
}

impl LockPolicy {
    /// Initial values of the (read, write) locks
    pub fn initial_values(self) -> (i32, i32) {
        match self {
            LockPolicy::Binary => (0, 0),
            LockPolicy::Counting => (0, 1),
        }
    }

    fn acquire(self, lock: LockRef, value: i32) -> LockAction {
        let op = match self {
            LockPolicy::Binary => LockOp::AcquireEqual,
            LockPolicy::Counting => LockOp::AcquireGreaterEqual,
        };
        LockAction { lock, op, value }
    }

    fn release(self, lock: LockRef, value: i32) -> LockAction {
        LockAction {
            lock,
            op: LockOp::Release,
            value,
        }
    }

    /// Value meaning "slot empty": 0 for binary, 1 for counting
    fn empty_value(self) -> i32 {
        match self {
            LockPolicy::Binary => 0,
            LockPolicy::Counting => 1,
        }
    }

    /// Acquire/release pair wrapping one DMA descriptor
    pub fn dma_guard(self, pair: LockPair, direction: Direction) -> (LockAction, LockAction) {
        match direction {
            Direction::Inbound => (
                self.acquire(pair.write, self.empty_value()),
                self.release(pair.read, 1),
            ),
            Direction::Outbound => (
                self.acquire(pair.read, 1),
                self.release(pair.write, self.empty_value()),
            ),
        }
    }

    /// Acquire/release pair the compute core wraps around its use of a
    /// buffer served by a channel in `direction`
    pub fn core_guard(self, pair: LockPair, direction: Direction) -> (LockAction, LockAction) {
        match direction {
            Direction::Inbound => (
                self.acquire(pair.read, 1),
                self.release(pair.write, self.empty_value()),
            ),
            Direction::Outbound => (
                self.acquire(pair.write, self.empty_value()),
                self.release(pair.read, 1),
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockAllocator {
    policy: LockPolicy,
    pairs: BTreeMap<(BufferId, ChannelKey), LockPair>,
}

impl LockAllocator {
    pub fn new(policy: LockPolicy) -> Self {
        Self {
            policy,
            pairs: BTreeMap::new(),
        }
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Lock pair for `buffer` on `channel`, allocating on the channel's tile
    /// the first time the pair is requested
    pub fn locks_for(&mut self, device: &mut Device, buffer: BufferId, channel: ChannelKey) -> CompileResult<LockPair> {
        self.locks_at(device, buffer, channel, None)
    }

    /// Like `locks_for`, but a fresh pair takes lock `id` (and `id + 1` for
    /// the write lock of a counting pair) instead of the lowest unused ids.
    /// A lock that already carries a requested id on the tile is shared.
    pub fn locks_at(
        &mut self,
        device: &mut Device,
        buffer: BufferId,
        channel: ChannelKey,
        id: Option<u32>,
    ) -> CompileResult<LockPair> {
        if let Some(pair) = self.pairs.get(&(buffer, channel)) {
            return Ok(*pair);
        }
        let (read_init, write_init) = self.policy.initial_values();
        let read = device.allocate_lock(channel.tile, read_init, id)?;
        let write = match self.policy {
            LockPolicy::Binary => read,
            LockPolicy::Counting => {
                let write_id = match id {
                    Some(id) => Some(id.checked_add(1).ok_or_else(|| {
                        CompileError::capacity(format!("lock ids above {} on tile {}", id, channel.tile))
                    })?),
                    None => None,
                };
                device.allocate_lock(channel.tile, write_init, write_id)?
            }
        };
        let to_ref = |id| {
            let lock = device.lock(id);
            LockRef {
                col: lock.tile.col,
                row: lock.tile.row,
                id: lock.id,
            }
        };
        let pair = LockPair {
            read: to_ref(read),
            write: to_ref(write),
        };
        debug!(
            channel = %channel,
            buffer = %device.buffer(buffer).symbol,
            read = pair.read.id,
            write = pair.write.id,
            "allocated lock pair"
        );
        self.pairs.insert((buffer, channel), pair);
        Ok(pair)
    }

    pub fn lookup(&self, buffer: BufferId, channel: ChannelKey) -> Option<LockPair> {
        self.pairs.get(&(buffer, channel)).copied()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BufferKey, Coord};
    use crate::graph::{BufferDecl, MemoryLevel};
    use crate::target::TargetModel;

    fn setup(target: TargetModel) -> (Device, BufferId, ChannelKey) {
        let mut device = Device::new(target);
        let tile = Coord::new(1, 3);
        let decl = BufferDecl::new("a", MemoryLevel::TileLocal, &[32], 4);
        let buffer = device.intern_buffer(BufferKey::Local { name: "a".into(), tile }, &decl, Some(tile));
        (device, buffer, ChannelKey::new(tile, Direction::Inbound, 0))
    }

    #[test]
    fn test_memoized_per_buffer_and_channel() {
        let (mut device, buffer, channel) = setup(TargetModel::gen2(4, 6));
        let mut locks = LockAllocator::new(LockPolicy::Counting);
        let a = locks.locks_for(&mut device, buffer, channel).unwrap();
        let b = locks.locks_for(&mut device, buffer, channel).unwrap();
        assert_eq!(a, b);
        assert_eq!(device.locks().len(), 2);
        assert_eq!(device.locks()[0].init, 0);
        assert_eq!(device.locks()[1].init, 1);

        let other = ChannelKey::new(channel.tile, Direction::Outbound, 0);
        let c = locks.locks_for(&mut device, buffer, other).unwrap();
        assert_ne!(a, c);
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_binary_single_lock() {
        let (mut device, buffer, channel) = setup(TargetModel::gen1(4, 6));
        let mut locks = LockAllocator::new(LockPolicy::Binary);
        let pair = locks.locks_for(&mut device, buffer, channel).unwrap();
        assert_eq!(pair.read, pair.write);
        assert_eq!(device.locks().len(), 1);
    }

    #[test]
    fn test_caller_chosen_lock_ids() {
        let (mut device, buffer, channel) = setup(TargetModel::gen2(4, 6));
        let mut locks = LockAllocator::new(LockPolicy::Counting);
        let pair = locks.locks_at(&mut device, buffer, channel, Some(4)).unwrap();
        assert_eq!((pair.read.id, pair.write.id), (4, 5));
        // memoized: a later request ignores the id
        assert_eq!(locks.locks_at(&mut device, buffer, channel, Some(9)).unwrap(), pair);

        let other = ChannelKey::new(channel.tile, Direction::Outbound, 0);
        let next = locks.locks_for(&mut device, buffer, other).unwrap();
        assert_eq!((next.read.id, next.write.id), (0, 1));

        let over = ChannelKey::new(channel.tile, Direction::Outbound, 1);
        let err = locks.locks_at(&mut device, buffer, over, Some(16)).unwrap_err();
        assert!(matches!(err, CompileError::CapacityExhausted { .. }));
    }

    #[test]
    fn test_binary_guard_values() {
        let lock = LockRef { col: 0, row: 1, id: 0 };
        let pair = LockPair { read: lock, write: lock };
        let (acq, rel) = LockPolicy::Binary.dma_guard(pair, Direction::Inbound);
        assert_eq!((acq.op, acq.value, rel.value), (LockOp::AcquireEqual, 0, 1));
        let (acq, rel) = LockPolicy::Binary.dma_guard(pair, Direction::Outbound);
        assert_eq!((acq.value, rel.value), (1, 0));
        let (acq, rel) = LockPolicy::Binary.core_guard(pair, Direction::Inbound);
        assert_eq!((acq.value, rel.value), (1, 0));
    }

    #[test]
    fn test_counting_guard_values() {
        let read = LockRef { col: 0, row: 1, id: 0 };
        let write = LockRef { col: 0, row: 1, id: 1 };
        let pair = LockPair { read, write };
        let (acq, rel) = LockPolicy::Counting.dma_guard(pair, Direction::Inbound);
        assert_eq!(acq.lock, write);
        assert_eq!(rel.lock, read);
        assert_eq!((acq.op, acq.value, rel.value), (LockOp::AcquireGreaterEqual, 1, 1));
        let (acq, rel) = LockPolicy::Counting.dma_guard(pair, Direction::Outbound);
        assert_eq!((acq.lock, rel.lock), (read, write));
        let (acq, rel) = LockPolicy::Counting.core_guard(pair, Direction::Outbound);
        assert_eq!((acq.lock, rel.lock), (write, read));
    }
}
