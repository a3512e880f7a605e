//! Instruction Set Architecture (ISA) definitions.
//!
//! Defines the engine's closed opcode set. The
//! [`for_each_opcode!`](crate::for_each_opcode) macro holds the canonical
//! opcode definitions and invokes a callback macro for code generation, so
//! other modules can generate opcode-related code without duplicating the
//! table.
//!
//! This module generates:
//! - The [`Opcode`] enum with byte mappings
//! - `TryFrom<u8>` for decoding opcode bytes
//! - Mnemonic lookup and the store-mutation flag consumed by the
//!   dispatcher's idle tracking

use crate::engine::errors::VmError;

/// Invokes a callback macro with the complete opcode definition list.
///
/// Each entry carries the variant name, byte value, mnemonic, and whether
/// the opcode mutates the register/stack store (the dispatcher resets its
/// idle counter on mutating opcodes only).
#[macro_export]
macro_rules! for_each_opcode {
    ($callback:ident) => {
        $callback! {
            /// PULSE reg ; signal liveness to a register node
            Pulse = 0x01, "PULSE", false,
            /// STACK_INIT ; reset the operand stack to empty
            StackInit = 0x02, "STACK_INIT", true,
            /// BIND_WRAP reg ; push the register value as a protected region
            BindWrap = 0x03, "BIND_WRAP", true,
            /// DEFER_ERR key NUL glyph ; record an entry in the deferred cache
            DeferErr = 0x04, "DEFER_ERR", false,
            /// PURGE_EPOCH ; immediate reclaim and error-cache purge
            PurgeEpoch = 0x05, "PURGE_EPOCH", false,
            /// LOAD_MODULE seg, reg ; load a data segment into a register
            LoadModule = 0x06, "LOAD_MODULE", true,
            /// TRACE_EMIT ; emit a read-only snapshot to the observer
            TraceEmit = 0x07, "TRACE_EMIT", false,
            /// SET_REG reg, hi, lo ; write a big-endian u16 immediate
            SetReg = 0x10, "SET_REG", true,
            /// PUSH bytes ; push the argument bytes as one region
            Push = 0x11, "PUSH", true,
            /// POP n ; pop n bytes from the stack tail
            Pop = 0x12, "POP", true,
            /// PRINT_STACK ; emit the stack contents to the observer
            PrintStack = 0x13, "PRINT_STACK", false,
            /// RETURN ; terminate execution
            Return = 0xFF, "RETURN", false,
        }
    };
}

#[macro_export]
macro_rules! define_opcodes {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $byte:literal, $mnemonic:literal, $mutating:expr
        ),* $(,)?
    ) => {
        /// One-byte instruction tag selecting a handler.
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum Opcode {
            $(
                $(#[$doc])*
                $name = $byte,
            )*
        }

        impl TryFrom<u8> for Opcode {
            type Error = VmError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $byte => Ok(Opcode::$name), )*
                    _ => Err(VmError::UnknownOpcode {
                        opcode: value,
                        index: 0,
                    }),
                }
            }
        }

        impl Opcode {
            /// Returns the assembly mnemonic for this opcode.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            /// Whether executing this opcode mutates the register/stack store.
            pub const fn mutates_store(&self) -> bool {
                match self {
                    $( Opcode::$name => $mutating, )*
                }
            }
        }
    };
}

for_each_opcode!(define_opcodes);

/// Opcode byte that terminates execution; doubles as the instruction/data
/// boundary marker inside a container.
pub const RETURN_BYTE: u8 = Opcode::Return as u8;
