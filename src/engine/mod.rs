//! Register-based bytecode virtual machine with entropy-ranked reclamation.
//!
//! The engine executes Avion bytecode images produced by an external
//! toolchain and is driven either programmatically or through the `avionvm`
//! runner binary.
//!
//! # Architecture
//!
//! - **Registers**: 16 fixed `u16` cells, `R0`..`R15`
//! - **Operand stack**: growable byte buffer, tracked as tagged regions
//!   (priority, access count, purity inputs) for the reclaimer
//! - **Instruction format**: `opcode:1B, argCount:2B big-endian, args`
//! - **Reclamation**: entropy-ranked batch frees on epoch boundaries, never
//!   during ordinary pushes or pops
//! - **Faults**: deferred faults accumulate in a keyed cache until an epoch
//!   purge; fatal faults halt the machine immediately
//!
//! # Modules
//!
//! - [`errors`]: decode and execution error types, deferred/fatal split
//! - [`isa`]: instruction set definition and opcode mappings
//! - [`image`]: bytecode container format and decoder
//! - [`store`]: register bank and operand stack with region signals
//! - [`reclaimer`]: entropy scoring and batch reclamation
//! - [`error_cache`]: deferred error cache
//! - [`epoch`]: epoch counter and purge-boundary scheduling
//! - [`machine`]: instruction dispatcher, command queue, observer seam

pub mod epoch;
pub mod error_cache;
pub mod errors;
pub mod image;
pub mod isa;
pub mod machine;
pub mod reclaimer;
pub mod store;
