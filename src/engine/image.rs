//! Bytecode container format and decoder.
//!
//! An Avion container is framed as:
//!
//! ```text
//! HEADER   : 4 bytes = A1 56 01 00          ("Avion Bytecode v1.0")
//! OPCODES  : { opcode:1B, argCount:2B big-endian, args:argCount bytes }*
//! DATA     : { segmentId:1B, length:1B, body:length bytes }*
//! TRAILER  : 1 byte = FF
//! ```
//!
//! The instruction region ends at the first `RETURN` instruction; any bytes
//! between it and the trailer form the data-segment region. A container
//! without `RETURN` carries no data segments. Decoding is a pure parse: it
//! produces an immutable [`BytecodeImage`] or a [`DecodeError`] and touches
//! no machine state.

use crate::engine::errors::DecodeError;
use crate::engine::isa::RETURN_BYTE;
use std::collections::BTreeMap;

/// Magic header identifying an Avion v1.0 container.
pub const MAGIC: [u8; 4] = [0xA1, 0x56, 0x01, 0x00];

/// Sentinel byte closing every container.
pub const EOF_SENTINEL: u8 = 0xFF;

/// One decoded instruction: opcode byte plus its raw argument bytes.
///
/// `args.len()` always equals the arg count declared in the container;
/// a mismatch is rejected at decode time, never at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: u8,
    pub args: Vec<u8>,
}

/// Immutable decoded bytecode container.
///
/// Owned by the loader; the machine receives it as a read-only view and
/// never mutates instruction or segment data.
#[derive(Debug, Clone)]
pub struct BytecodeImage {
    instructions: Vec<Instruction>,
    segments: BTreeMap<u8, Vec<u8>>,
}

/// Byte cursor over the container body.
///
/// Reads advance the position; a short read reports the offset where the
/// record started so diagnostics point at the record, not its tail.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, count: usize, record_start: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(count)
            .ok_or(DecodeError::TruncatedInstruction {
                offset: record_start,
            })?;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or(DecodeError::TruncatedInstruction {
                offset: record_start,
            })?;
        self.pos = end;
        Ok(slice)
    }

    fn take_byte(&mut self, record_start: usize) -> Result<u8, DecodeError> {
        Ok(self.take(1, record_start)?[0])
    }
}

impl BytecodeImage {
    /// Decodes a container from raw bytes.
    ///
    /// Validates the magic header, instruction framing, segment uniqueness,
    /// and the EOF trailer, in that order of discovery.
    pub fn load(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < MAGIC.len() || bytes[..MAGIC.len()] != MAGIC {
            return Err(DecodeError::BadHeader);
        }
        if bytes.len() == MAGIC.len() || bytes[bytes.len() - 1] != EOF_SENTINEL {
            return Err(DecodeError::MissingTrailer);
        }

        let body = &bytes[MAGIC.len()..bytes.len() - 1];
        let mut reader = Reader::new(body);

        let mut instructions = Vec::new();
        while reader.remaining() > 0 {
            let record_start = reader.pos;
            let opcode = reader.take_byte(record_start)?;
            let count_bytes = reader.take(2, record_start)?;
            let arg_count = u16::from_be_bytes([count_bytes[0], count_bytes[1]]) as usize;
            let args = reader.take(arg_count, record_start)?.to_vec();
            let done = opcode == RETURN_BYTE;
            instructions.push(Instruction { opcode, args });
            if done {
                break;
            }
        }

        let mut segments = BTreeMap::new();
        while reader.remaining() > 0 {
            let record_start = reader.pos;
            let id = reader.take_byte(record_start)?;
            let len = reader.take_byte(record_start)? as usize;
            let segment_body = reader.take(len, record_start)?.to_vec();
            if segments.insert(id, segment_body).is_some() {
                return Err(DecodeError::DuplicateSegment { id });
            }
        }

        Ok(Self {
            instructions,
            segments,
        })
    }

    /// Decoded instructions in fetch order.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Number of decoded instructions.
    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// Looks up a data segment body by id.
    pub fn segment(&self, id: u8) -> Option<&[u8]> {
        self.segments.get(&id).map(Vec::as_slice)
    }

    /// Number of data segments carried by the image.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}
