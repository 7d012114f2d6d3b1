//! Dataflow to DMA Compiler CLI
//!
//! Usage:
//!   dataflow2dma graph.json --target gen1 --columns 8 --rows 6
//!   dataflow2dma graph.json --target-file board.json --json
//!   cat graph.json | dataflow2dma --metadata-out runtime.json -v

use clap::{Parser as ClapParser, ValueEnum};
use colored::Colorize;
use std::fs;
use std::io::{self, Read};
use tracing_subscriber::EnvFilter;

use dataflow_to_dma::{compile, DeviceProgram, MovementGraph, TargetModel};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    /// Binary locks, no shared memory tiles
    Gen1,
    /// Counting locks, one row of shared memory tiles
    Gen2,
}

#[derive(ClapParser, Debug)]
#[command(name = "dataflow2dma")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Maps movement-op graphs onto DMA channels, locks and descriptor programs")]
struct Args {
    /// Movement graph in JSON (stdin when omitted)
    #[arg(value_name = "GRAPH")]
    input_file: Option<String>,

    /// Device generation preset
    #[arg(short = 't', long = "target", value_enum, default_value = "gen2")]
    preset: Preset,

    /// Grid columns
    #[arg(short = 'c', long = "columns", default_value = "4")]
    columns: u32,

    /// Grid rows
    #[arg(short = 'r', long = "rows", default_value = "6")]
    rows: u32,

    /// Target description in JSON, overrides the preset
    #[arg(long = "target-file")]
    target_file: Option<String>,

    /// Output as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Write runtime metadata to this file
    #[arg(long = "metadata-out")]
    metadata_out: Option<String>,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn fail(what: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("{}: {}", what.red(), err);
    std::process::exit(1);
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let source = if let Some(file) = &args.input_file {
        fs::read_to_string(file).unwrap_or_else(|e| fail("Error", format!("Failed to read file '{}': {}", file, e)))
    } else {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .unwrap_or_else(|e| fail("Error", format!("Failed to read stdin: {}", e)));
        buffer
    };

    let target = match &args.target_file {
        Some(file) => {
            let text = fs::read_to_string(file)
                .unwrap_or_else(|e| fail("Error", format!("Failed to read target '{}': {}", file, e)));
            TargetModel::from_json(&text).unwrap_or_else(|e| fail("Target error", e))
        }
        None => match args.preset {
            Preset::Gen1 => TargetModel::gen1(args.columns, args.rows),
            Preset::Gen2 => TargetModel::gen2(args.columns, args.rows),
        },
    };

    let graph = MovementGraph::from_json(&source).unwrap_or_else(|e| fail("Parse error", e));

    if args.verbose {
        println!("{}", "Dataflow to DMA Compiler".bold().blue());
        println!("{}", "=".repeat(35));
        println!();
        println!("{}: {}", "Scope".green(), graph.scope);
        println!("{}: {} ops, {} buffers", "Input".green(), graph.ops.len(), graph.buffers.len());
        println!(
            "{}: {} ({}x{}, {:?} locks)",
            "Target".green(),
            target.name,
            target.columns,
            target.rows,
            target.lock_policy
        );
        println!();
    }

    let program = compile(&graph, &target).unwrap_or_else(|e| fail("Compilation error", e));

    if let Some(path) = &args.metadata_out {
        let json = program
            .metadata
            .to_json()
            .unwrap_or_else(|e| fail("Error", format!("Failed to serialize metadata: {}", e)));
        fs::write(path, json).unwrap_or_else(|e| fail("Error", format!("Failed to write '{}': {}", path, e)));
    }

    if args.json_output {
        match program.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => fail("Error", format!("Failed to serialize to JSON: {}", e)),
        }
    } else {
        print_program(&program, args.verbose);
    }
}

fn print_program(program: &DeviceProgram, verbose: bool) {
    println!("{}", "Compilation Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();
    print!("{}", program.summary);
    println!();

    println!("{}", "Flows".bold().yellow());
    println!("{}", "-".repeat(50));
    for flow in &program.flows {
        println!("  {} {} {}", flow.source.to_string().cyan(), "->".dimmed(), flow.dest.to_string().cyan());
    }
    println!();

    if verbose || program.tiles.len() <= 8 {
        println!("{}", "Tile Programs".bold().yellow());
        println!("{}", "-".repeat(50));
        for tile in &program.tiles {
            println!();
            println!("{} {} [{}]", "Tile".bold(), tile.tile.to_string().bold(), tile.role);
            for channel in &tile.channels {
                println!(
                    "  {}{}: {} descriptor(s)",
                    channel.direction.mnemonic().cyan(),
                    channel.channel.to_string().cyan(),
                    channel.blocks.len()
                );
                if verbose {
                    for block in &channel.blocks {
                        println!(
                            "    op {}: {} | {}[{}..+{}] | {}",
                            block.op_id,
                            block.acquire,
                            block.descriptor.buffer,
                            block.descriptor.offset,
                            block.descriptor.length,
                            block.release
                        );
                    }
                }
            }
        }
        println!();
    } else {
        println!("({} tiles programmed, use -v for details)", program.tiles.len());
    }

    if !program.metadata.is_empty() {
        println!("{}", "Runtime Metadata".bold().yellow());
        println!("{}", "-".repeat(50));
        for region in &program.metadata.regions {
            println!("  {}:", region.name.cyan());
            for rec in &region.allocations {
                println!(
                    "    op {} -> column {} channel {} ({}) partner ({}, {})",
                    rec.id, rec.location, rec.channel, rec.direction, rec.col, rec.row
                );
            }
        }
    }

    if let Some(control) = &program.control {
        println!();
        println!(
            "{}: {} x {} control nest, {} statement(s)",
            "Control".cyan(),
            control.outer_extent,
            control.inner_extent,
            control.body.len()
        );
    }
}
