//! Avion bytecode runner CLI.
//!
//! Loads a bytecode container from disk and executes it to completion.
//!
//! # Usage
//! ```text
//! avionvm <image.avbc> [OPTIONS]
//! ```
//!
//! # Arguments
//! - `image.avbc`: Bytecode container file to execute
//!
//! # Options
//! - `-t, --trace`: Print trace snapshots, stack dumps, and purge batches
//!
//! Exits 0 on clean halt, nonzero on a decode failure or fatal fault.

use avion::engine::error_cache::ErrorEntry;
use avion::engine::image::BytecodeImage;
use avion::engine::machine::{Machine, NullObserver, Observer, Snapshot};
use avion::{error, info};
use std::env;
use std::fs;
use std::process;

/// Observer that logs every engine event.
struct TraceObserver;

impl Observer for TraceObserver {
    fn snapshot(&mut self, snapshot: &Snapshot) {
        info!(
            "trace: epoch {} depth {} pending {} regs {:?}",
            snapshot.epoch,
            snapshot.stack_depth,
            snapshot.pending_error_count,
            snapshot.registers
        );
    }

    fn stack_dump(&mut self, bytes: &[u8]) {
        info!("stack ({} bytes): {:02X?}", bytes.len(), bytes);
    }

    fn node(&mut self, index: u8, value: u16) {
        info!("node r{index} = {value}");
    }

    fn purged(&mut self, entries: &[ErrorEntry]) {
        for entry in entries {
            info!(
                "purged {} ({}) raised at epoch {}",
                entry.key, entry.glyph, entry.epoch_raised
            );
        }
    }
}

fn print_usage(program: &str) {
    eprintln!("Usage: {program} <image.avbc> [--trace]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -t, --trace    Print trace snapshots and purge batches");
    eprintln!("  -h, --help     Show this help");
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let input_path = &args[1];
    let mut trace = false;
    for arg in &args[2..] {
        match arg.as_str() {
            "--trace" | "-t" => trace = true,
            other => {
                error!("unknown option: {other}");
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let bytes = fs::read(input_path).unwrap_or_else(|err| {
        error!("cannot read {input_path}: {err}");
        process::exit(1);
    });

    let image = BytecodeImage::load(&bytes).unwrap_or_else(|err| {
        error!("cannot decode {input_path}: {err}");
        process::exit(1);
    });
    info!(
        "loaded {input_path}: {} instructions, {} data segments",
        image.instruction_count(),
        image.segment_count()
    );

    let mut machine = Machine::new(&image);
    let result = if trace {
        machine.run(&mut TraceObserver)
    } else {
        machine.run(&mut NullObserver)
    };

    match result {
        Ok(()) => {
            let snapshot = machine.snapshot();
            info!(
                "halted at epoch {} with stack depth {} and {} pending errors",
                snapshot.epoch, snapshot.stack_depth, snapshot.pending_error_count
            );
        }
        Err(err) => {
            error!("faulted: {err}");
            process::exit(1);
        }
    }
}
