//! Dataflow to DMA Compiler
//!
//! This library maps a graph of abstract asynchronous data movements onto a
//! tiled dataflow accelerator: it allocates DMA channels, locks and stream
//! flows at every level of the memory hierarchy and synthesizes the
//! per-tile descriptor programs that replay the movements.
//!
//! # Example
//!
//! ```rust
//! use dataflow_to_dma::{compile, Access, BufferDecl, MemoryLevel, MovementGraph, MovementOp, Region, TargetModel};
//!
//! let mut graph = MovementGraph::new("segment0");
//! graph
//!     .add_buffer(BufferDecl::new("input", MemoryLevel::External, &[1024], 4))
//!     .add_buffer(BufferDecl::new("tile_in", MemoryLevel::TileLocal, &[256], 4))
//!     .add_region(Region::new("herd", 0, 2, 1, 1));
//! let copy = MovementOp::copy(
//!     1,
//!     Access::new("input", MemoryLevel::External).with_sizes(&[256]),
//!     Access::new("tile_in", MemoryLevel::TileLocal),
//! );
//! graph.push(copy.in_region("herd", &[0, 0]));
//!
//! let program = compile(&graph, &TargetModel::gen1(8, 6)).unwrap();
//! println!("{}", program);
//! ```

pub mod bundle;
pub mod channel;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod graph;
pub mod interface;
pub mod lock;
pub mod mapper;
pub mod metadata;
pub mod placement;
pub mod program;
pub mod router;
pub mod serializer;
pub mod target;

pub use bundle::FlowBundle;
pub use channel::{ChannelAllocation, ChannelAllocator};
pub use descriptor::{DescriptorBlock, DispatchNext, TileProgram};
pub use device::{ChannelKey, Coord, Direction};
pub use error::{CompileError, CompileResult};
pub use graph::*;
pub use lock::{LockAction, LockOp};
pub use mapper::Mapper;
pub use metadata::{DmaAllocationRecord, RuntimeMetadata};
pub use program::DeviceProgram;
pub use serializer::{ControlProgram, HostFunction, HostLaunch, HostLoop, HostStmt, IndexExpr, LoopKind};
pub use target::{LockPolicy, RoleBudget, StartPrimitive, TargetModel, TileRole};

/// Main compilation function that maps a movement graph onto a target
pub fn compile(graph: &MovementGraph, target: &TargetModel) -> CompileResult<DeviceProgram> {
    Mapper::new(target.clone()).map(graph)
}

/// Compile a movement graph given as JSON
pub fn compile_json(source: &str, target: &TargetModel) -> CompileResult<DeviceProgram> {
    let graph = MovementGraph::from_json(source)?;
    compile(&graph, target)
}
