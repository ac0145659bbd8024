//! Method header and exception table encoding.
//!
//! Every function or method in the code pool starts with a fixed header,
//! followed by its bytecode. The optional exception table sits after the
//! code, at an offset recorded in the header.

use crate::decoder::DecodeError;

/// Set in the `argc` byte when the method takes a variable argument list.
pub const VARARGS_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodHeader {
    /// Required argument count.
    pub argc: u8,
    pub varargs: bool,
    /// Additional optional arguments.
    pub opt_argc: u8,
    pub locals: u16,
    pub max_stack: u16,
    /// Offset of the exception table from the method start, 0 if none.
    pub exc_table: u16,
    /// Offset of debug records; not interpreted.
    pub debug: u16,
}

impl MethodHeader {
    pub const SIZE: usize = 10;

    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let b: &[u8; Self::SIZE] = bytes
            .get(..Self::SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or(DecodeError::Truncated { offset: 0 })?;
        let u16_at = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        Ok(Self {
            argc: b[0] & !VARARGS_FLAG,
            varargs: b[0] & VARARGS_FLAG != 0,
            opt_argc: b[1],
            locals: u16_at(2),
            max_stack: u16_at(4),
            exc_table: u16_at(6),
            debug: u16_at(8),
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.argc | if self.varargs { VARARGS_FLAG } else { 0 };
        out[1] = self.opt_argc;
        out[2..4].copy_from_slice(&self.locals.to_le_bytes());
        out[4..6].copy_from_slice(&self.max_stack.to_le_bytes());
        out[6..8].copy_from_slice(&self.exc_table.to_le_bytes());
        out[8..10].copy_from_slice(&self.debug.to_le_bytes());
        out
    }

    /// Whether a call with `argc` arguments satisfies this header.
    pub fn accepts(&self, argc: usize) -> bool {
        let min = self.argc as usize;
        if self.varargs {
            argc >= min
        } else {
            (min..=min + self.opt_argc as usize).contains(&argc)
        }
    }
}

/// One protected range of a method. Offsets are relative to the method
/// start; the range is `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start: u16,
    pub end: u16,
    /// Exception class caught, 0 for any.
    pub class: u32,
    pub handler: u16,
}

impl ExceptionEntry {
    pub const SIZE: usize = 10;

    pub fn covers(&self, ofs: u16) -> bool {
        (self.start..self.end).contains(&ofs)
    }

    pub fn catches_everything(&self) -> bool {
        self.class == 0
    }
}

/// Parse an exception table. `entry_size` is the per-entry size declared
/// by the image; extra trailing bytes in each entry are skipped.
pub fn parse_exception_table(
    bytes: &[u8],
    entry_size: usize,
) -> Result<Vec<ExceptionEntry>, DecodeError> {
    let entry_size = entry_size.max(ExceptionEntry::SIZE);
    let count = bytes
        .get(..2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
        .ok_or(DecodeError::Truncated { offset: 0 })?;
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let at = 2 + i * entry_size;
        let e = bytes
            .get(at..at + ExceptionEntry::SIZE)
            .ok_or(DecodeError::Truncated { offset: at })?;
        entries.push(ExceptionEntry {
            start: u16::from_le_bytes([e[0], e[1]]),
            end: u16::from_le_bytes([e[2], e[3]]),
            class: u32::from_le_bytes([e[4], e[5], e[6], e[7]]),
            handler: u16::from_le_bytes([e[8], e[9]]),
        });
    }
    Ok(entries)
}

pub fn encode_exception_table(entries: &[ExceptionEntry], out: &mut Vec<u8>) {
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for e in entries {
        out.extend_from_slice(&e.start.to_le_bytes());
        out.extend_from_slice(&e.end.to_le_bytes());
        out.extend_from_slice(&e.class.to_le_bytes());
        out.extend_from_slice(&e.handler.to_le_bytes());
    }
}
