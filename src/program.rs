//! Device program representation
//!
//! Everything the mapper decided for one device scope: placed buffers,
//! locks, channel allocations, flows, per-tile DMA programs, core lock
//! actions, runtime metadata and the serialized control program.

use serde::Serialize;

use crate::channel::ChannelAllocation;
use crate::descriptor::{CoreProgram, DispatchNext, TileProgram};
use crate::device::{Buffer, Lock};
use crate::metadata::RuntimeMetadata;
use crate::router::Flow;
use crate::serializer::ControlProgram;
use crate::target::TargetModel;

#[derive(Debug, Clone, Serialize)]
pub struct DeviceProgram {
    pub scope: String,
    pub target: TargetModel,
    pub buffers: Vec<Buffer>,
    pub locks: Vec<Lock>,
    pub channels: Vec<ChannelAllocation>,
    pub flows: Vec<Flow>,
    pub tiles: Vec<TileProgram>,
    pub cores: Vec<CoreProgram>,
    pub metadata: RuntimeMetadata,
    pub control: Option<ControlProgram>,
    #[serde(skip)]
    pub summary: String,
}

impl DeviceProgram {
    pub fn new(scope: impl Into<String>, target: TargetModel) -> Self {
        Self {
            scope: scope.into(),
            target,
            buffers: Vec::new(),
            locks: Vec::new(),
            channels: Vec::new(),
            flows: Vec::new(),
            tiles: Vec::new(),
            cores: Vec::new(),
            metadata: RuntimeMetadata::default(),
            control: None,
            summary: String::new(),
        }
    }

    /// Number of descriptor blocks across all tiles
    pub fn descriptor_count(&self) -> usize {
        self.tiles
            .iter()
            .flat_map(|t| t.channels.iter())
            .map(|c| c.blocks.len())
            .sum()
    }

    /// Generate a summary of the program
    pub fn generate_summary(&mut self) {
        self.summary = format!(
            "Device Program Summary:\n\
             =======================\n\
             Scope: {}\n\
             Target: {} ({}x{})\n\
             Buffers: {}\n\
             Locks: {}\n\
             Channels: {}\n\
             Flows: {}\n\
             Tiles programmed: {}\n\
             Descriptors: {}\n\
             Runtime records: {}\n\
             Control serialized: {}\n",
            self.scope,
            self.target.name,
            self.target.columns,
            self.target.rows,
            self.buffers.len(),
            self.locks.len(),
            self.channels.len(),
            self.flows.len(),
            self.tiles.len(),
            self.descriptor_count(),
            self.metadata.len(),
            if self.control.is_some() { "yes" } else { "no" },
        );
    }

    /// Export to JSON format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl std::fmt::Display for DeviceProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Device Program")?;
        writeln!(f, "==============")?;
        writeln!(f, "Scope: {}", self.scope)?;
        writeln!(f, "Target: {}", self.target.name)?;
        writeln!(f)?;

        for flow in &self.flows {
            writeln!(f, "flow {} -> {}", flow.source, flow.dest)?;
        }
        if !self.flows.is_empty() {
            writeln!(f)?;
        }

        for tile in &self.tiles {
            writeln!(f, "Tile {} [{}]:", tile.tile, tile.role)?;
            for entry in &tile.dispatcher.entries {
                let next = match entry.next {
                    DispatchNext::Entry(i) => format!("entry {}", i),
                    DispatchNext::End => "end".to_string(),
                };
                writeln!(
                    f,
                    "  {:?} {}{} -> {}",
                    tile.dispatcher.primitive,
                    entry.direction.mnemonic(),
                    entry.channel,
                    next
                )?;
            }
            for channel in &tile.channels {
                writeln!(f, "  {}{}:", channel.direction.mnemonic(), channel.channel)?;
                for (i, block) in channel.blocks.iter().enumerate() {
                    writeln!(
                        f,
                        "    bd{} op {}: {}; {}[{}..+{}]; {} -> bd{}",
                        i,
                        block.op_id,
                        block.acquire,
                        block.descriptor.buffer,
                        block.descriptor.offset,
                        block.descriptor.length,
                        block.release,
                        block.next
                    )?;
                }
            }
        }

        if !self.cores.is_empty() {
            writeln!(f)?;
            for core in &self.cores {
                writeln!(f, "Core {}:", core.tile)?;
                for use_ in &core.uses {
                    writeln!(f, "  op {} {}: {}; {}", use_.op_id, use_.buffer, use_.acquire, use_.release)?;
                }
            }
        }

        Ok(())
    }
}
