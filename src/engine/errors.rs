use crate::engine::error_cache::ErrorEntry;
use thiserror::Error;

/// Structural faults raised while decoding a bytecode container.
///
/// Decode faults always surface before any instruction executes; they are
/// never deferred because no valid program exists to continue running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// First four bytes differ from the `A1 56 01 00` magic header.
    #[error("bad header: expected Avion magic A1 56 01 00")]
    BadHeader,
    /// Buffer ended mid-record in the instruction or data region.
    #[error("truncated instruction record at offset {offset}")]
    TruncatedInstruction { offset: usize },
    /// Two data segments declared the same id.
    #[error("duplicate data segment id {id:#04x}")]
    DuplicateSegment { id: u8 },
    /// Final byte is not the `0xFF` EOF sentinel.
    #[error("missing trailer: final byte must be the 0xFF sentinel")]
    MissingTrailer,
}

/// Unrecoverable execution faults.
///
/// Raising one of these transitions the machine to `Faulted`; no further
/// instructions execute. Recoverable faults go through the deferred error
/// cache instead and never appear here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// Register index outside `R0`..`R15` on an instruction that cannot
    /// skip it (module loads).
    #[error("register index {index} out of range (valid 0..=15)")]
    RegisterOutOfRange { index: u8 },
    /// Explicit pop of more bytes than the stack holds.
    #[error("stack underflow: popped {requested} bytes with depth {depth}")]
    StackUnderflow { requested: usize, depth: usize },
    /// `LOAD_MODULE` referenced a data segment absent from the image.
    #[error("data segment {id:#04x} not found in image")]
    SegmentNotFound { id: u8 },
    /// Opcode byte outside the instruction set.
    #[error("unknown opcode {opcode:#04x} at instruction {index}")]
    UnknownOpcode { opcode: u8, index: usize },
    /// Structural fault propagated from the decoder.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Two-tier fault result returned by instruction handlers.
///
/// The dispatcher routes `Deferred` entries into the error cache and keeps
/// running; `Fatal` transitions the machine to `Faulted`.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    Deferred(ErrorEntry),
    Fatal(VmError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_display() {
        assert_eq!(
            DecodeError::DuplicateSegment { id: 0x09 }.to_string(),
            "duplicate data segment id 0x09"
        );
        assert_eq!(
            DecodeError::TruncatedInstruction { offset: 7 }.to_string(),
            "truncated instruction record at offset 7"
        );
    }

    #[test]
    fn vm_error_display() {
        assert_eq!(
            VmError::RegisterOutOfRange { index: 20 }.to_string(),
            "register index 20 out of range (valid 0..=15)"
        );
        assert_eq!(
            VmError::StackUnderflow {
                requested: 4,
                depth: 1
            }
            .to_string(),
            "stack underflow: popped 4 bytes with depth 1"
        );
    }

    #[test]
    fn decode_error_promotes_to_vm_error() {
        let err: VmError = DecodeError::MissingTrailer.into();
        assert!(matches!(err, VmError::Decode(DecodeError::MissingTrailer)));
    }
}
