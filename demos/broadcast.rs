//! Example: Broadcast
//!
//! One weight buffer in external memory is broadcast to every tile of a
//! 4x1 region, staged through a shared memory tile on a second-generation
//! array. Each tile also writes its result back.
//!
//! Run with: cargo run --example broadcast

use dataflow_to_dma::{
    compile, Access, BufferDecl, ChannelDecl, MemoryLevel, MovementGraph, MovementOp, Region, TargetModel,
};

fn main() {
    println!("=== Broadcast Example ===\n");

    let target = TargetModel::gen2(4, 6);

    let mut graph = MovementGraph::new("segment0");
    graph
        .add_buffer(BufferDecl::new("weights", MemoryLevel::External, &[1024], 2))
        .add_buffer(BufferDecl::new("results", MemoryLevel::External, &[4, 256], 4))
        .add_buffer(BufferDecl::new("staged", MemoryLevel::Shared, &[1024], 2))
        .add_buffer(BufferDecl::new("w_local", MemoryLevel::TileLocal, &[1024], 2))
        .add_buffer(BufferDecl::new("r_local", MemoryLevel::TileLocal, &[256], 4))
        .add_channel(ChannelDecl::broadcast("weights_bcast", &[4, 1]))
        .add_region(Region::new("herd", 0, 2, 4, 1));

    graph.push(MovementOp::copy(
        1,
        Access::new("weights", MemoryLevel::External),
        Access::new("staged", MemoryLevel::Shared),
    ));
    graph.push(MovementOp::put(2, "weights_bcast", Access::new("staged", MemoryLevel::Shared)));
    graph
        .replicate(
            MovementOp::get(3, "weights_bcast", Access::new("w_local", MemoryLevel::TileLocal)),
            "herd",
        )
        .unwrap();

    for x in 0..4u32 {
        let store = MovementOp::copy(
            4,
            Access::new("r_local", MemoryLevel::TileLocal),
            Access::new("results", MemoryLevel::External).with_offsets(&[x as u64, 0]).with_sizes(&[1, 256]),
        );
        graph.push(store.in_region("herd", &[x, 0]));
    }

    let program = compile(&graph, &target).unwrap();

    println!("{}", program.summary);
    println!("Flows:");
    for flow in &program.flows {
        println!("  {} -> {}", flow.source, flow.dest);
    }
    println!();
    println!("Lock count: {}", program.locks.len());
    println!("Write-back records:");
    for rec in program.metadata.lookup(4) {
        println!("  column {} channel {} from cell ({}, {})", rec.location, rec.channel, rec.col, rec.row);
    }
}
