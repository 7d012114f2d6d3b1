//! Example: Serialized Control
//!
//! A first-generation array has a single control processor, so the host's
//! per-cell parallel loop is folded into one sequential control nest.
//!
//! Run with: cargo run --example serialized_control

use dataflow_to_dma::{
    compile, Access, BufferDecl, HostFunction, HostLaunch, HostLoop, HostStmt, IndexExpr, MemoryLevel,
    MovementGraph, MovementOp, Region, TargetModel,
};

fn main() {
    println!("=== Serialized Control Example ===\n");

    let target = TargetModel::gen1(8, 6);

    let mut graph = MovementGraph::new("segment0");
    graph
        .add_buffer(BufferDecl::new("a", MemoryLevel::External, &[8, 512], 4))
        .add_buffer(BufferDecl::new("a_tile", MemoryLevel::TileLocal, &[64], 4))
        .add_region(Region::new("herd", 0, 2, 2, 2));

    let load = MovementOp::copy(
        1,
        Access::new("a", MemoryLevel::External).with_sizes(&[64]),
        Access::new("a_tile", MemoryLevel::TileLocal),
    );
    graph.replicate(load, "herd").unwrap();

    let launch = HostStmt::Launch(HostLaunch::new(1, vec![IndexExpr::var("x"), IndexExpr::var("k")]));
    graph.host = Some(HostFunction {
        name: "forward".into(),
        body: vec![HostStmt::Loop(HostLoop::parallel(
            &["x", "y"],
            &[2, 2],
            vec![HostStmt::Loop(HostLoop::sequential("k", 0, 8, 1, vec![launch]))],
        ))],
    });

    let program = compile(&graph, &target).unwrap();
    let control = program.control.as_ref().unwrap();

    println!(
        "Control nest: for {} in 0..{} / for {} in 0..{}",
        control.outer_iv, control.outer_extent, control.inner_iv, control.inner_extent
    );
    println!("{}", serde_json::to_string_pretty(&control.body).unwrap());
}
