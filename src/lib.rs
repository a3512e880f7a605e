//! Avion engine library.
//!
//! Provides the Avion bytecode container decoder, the register/stack virtual
//! machine, and its epoch-driven maintenance machinery.

pub mod engine;
pub mod utils;
