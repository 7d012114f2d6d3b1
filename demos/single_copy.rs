//! Example: Single Copy
//!
//! Maps one external-to-tile copy onto a first-generation array and prints
//! the channels, flow and descriptor chains it produces.
//!
//! Run with: cargo run --example single_copy

use dataflow_to_dma::{compile, Access, BufferDecl, MemoryLevel, MovementGraph, MovementOp, Region, TargetModel};

fn main() {
    println!("=== Single Copy Example ===\n");

    let target = TargetModel::gen1(8, 6);

    let mut graph = MovementGraph::new("segment0");
    graph
        .add_buffer(BufferDecl::new("input", MemoryLevel::External, &[64, 64], 4))
        .add_buffer(BufferDecl::new("tile_in", MemoryLevel::TileLocal, &[32, 32], 4))
        .add_region(Region::new("herd", 0, 2, 1, 1));

    // Top-left 32x32 window of the input
    let copy = MovementOp::copy(
        1,
        Access::new("input", MemoryLevel::External)
            .with_offsets(&[0, 0])
            .with_sizes(&[32, 32])
            .with_strides(&[64, 1]),
        Access::new("tile_in", MemoryLevel::TileLocal),
    );
    graph.push(copy.in_region("herd", &[0, 0]));

    let program = compile(&graph, &target).unwrap();

    println!("{}", program.summary);
    println!("{}", program);

    println!("Runtime metadata:");
    println!("{}", program.metadata.to_json().unwrap());
}
