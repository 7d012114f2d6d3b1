//! Runtime metadata
//!
//! The host runtime needs to know, for every movement op that reaches
//! external memory, which interface column and channel serve it and which
//! region cell sits on the far end.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::channel::ChannelAllocation;
use crate::device::Direction;
use crate::graph::MovementGraph;

/// One op-to-interface-channel binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmaAllocationRecord {
    pub id: u32,
    /// Partner column relative to the region origin
    pub col: i64,
    /// Partner row relative to the region origin
    pub row: i64,
    /// Runtime channel number; outbound channels follow the inbound ones
    pub channel: u32,
    /// Interface column
    pub location: u32,
    pub direction: Direction,
}

/// Records of the ops launched by one region, or by the scope itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMetadata {
    pub name: String,
    pub allocations: Vec<DmaAllocationRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeMetadata {
    pub scope: String,
    pub regions: Vec<RegionMetadata>,
}

impl RuntimeMetadata {
    /// Collect records from the interface-level allocations.
    /// `channels_per_direction` offsets outbound channel numbers.
    pub fn build<'a>(
        graph: &MovementGraph,
        allocations: impl IntoIterator<Item = &'a ChannelAllocation> + Clone,
        channels_per_direction: u32,
    ) -> Self {
        let mut groups: Vec<(String, (u32, u32), BTreeSet<u32>)> = graph
            .regions
            .iter()
            .map(|r| {
                let ids = graph
                    .ops
                    .iter()
                    .filter(|op| op.region.as_deref() == Some(r.name.as_str()))
                    .map(|op| op.id)
                    .collect();
                (r.name.clone(), (r.col, r.row), ids)
            })
            .collect();
        let unplaced: BTreeSet<u32> = graph
            .ops
            .iter()
            .filter(|op| op.region.is_none())
            .map(|op| op.id)
            .collect();
        groups.push((graph.scope.clone(), (0, 0), unplaced));

        let mut regions = Vec::new();
        for (name, (origin_col, origin_row), ids) in groups {
            let mut records = Vec::new();
            for alloc in allocations.clone() {
                let Some(partner) = alloc.partner else {
                    continue;
                };
                let channel = match alloc.key.direction {
                    Direction::Inbound => alloc.key.id,
                    Direction::Outbound => alloc.key.id + channels_per_direction,
                };
                let mut seen = BTreeSet::new();
                for id in alloc.op_ids.iter().filter(|id| ids.contains(id)) {
                    if !seen.insert(*id) {
                        continue;
                    }
                    records.push(DmaAllocationRecord {
                        id: *id,
                        col: partner.col as i64 - origin_col as i64,
                        row: partner.row as i64 - origin_row as i64,
                        channel,
                        location: alloc.key.tile.col,
                        direction: alloc.key.direction,
                    });
                }
            }
            if !records.is_empty() {
                regions.push(RegionMetadata { name, allocations: records });
            }
        }
        Self {
            scope: graph.scope.clone(),
            regions,
        }
    }

    /// All records for op `id`
    pub fn lookup(&self, id: u32) -> Vec<&DmaAllocationRecord> {
        self.regions
            .iter()
            .flat_map(|r| r.allocations.iter())
            .filter(|rec| rec.id == id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.regions.iter().map(|r| r.allocations.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(source: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(source)
    }
}
