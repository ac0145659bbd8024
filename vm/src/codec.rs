//! Little-endian helpers shared by the image loader, the image writer and
//! saved states.

use std::io::{self, Write};

use object::{PORTABLE_SIZE, Value};

use crate::error::{VmError, VmResult};

pub(crate) fn write_u8(w: &mut dyn Write, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub(crate) fn write_u16(w: &mut dyn Write, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn write_u32(w: &mut dyn Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn write_u64(w: &mut dyn Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Append a short name: `u8` length + bytes. Longer names are cut at 255
/// bytes.
pub(crate) fn put_name(out: &mut Vec<u8>, name: &str) {
    let bytes = &name.as_bytes()[..name.len().min(u8::MAX as usize)];
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}

/// Append a value in the 5-byte portable encoding. Values without one
/// (floats, dynamic objects) are written as nil.
pub(crate) fn put_portable(out: &mut Vec<u8>, value: Value) {
    let bytes = value
        .to_portable()
        .or_else(|| Value::Nil.to_portable())
        .unwrap_or([0; PORTABLE_SIZE]);
    out.extend_from_slice(&bytes);
}

/// Bounds-checked cursor over a byte slice. Every short read yields the
/// error given at construction.
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    short: VmError,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8], short: VmError) -> Self {
        Self {
            bytes,
            pos: 0,
            short,
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn bytes(&mut self, n: usize) -> VmResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| self.short.clone())?;
        let out = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| self.short.clone())?;
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> VmResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> VmResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> VmResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> VmResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> VmResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn skip(&mut self, n: usize) -> VmResult<()> {
        self.bytes(n).map(|_| ())
    }

    /// UTF-8 text of `len` bytes.
    pub(crate) fn str(&mut self, len: usize) -> VmResult<String> {
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.short.clone())
    }

    /// A `u8`-length-prefixed name.
    pub(crate) fn name(&mut self) -> VmResult<String> {
        let len = self.u8()? as usize;
        self.str(len)
    }

    /// A 5-byte portable value. Unknown tags are reported like a short read.
    pub(crate) fn portable(&mut self) -> VmResult<Value> {
        let bytes = self.bytes(PORTABLE_SIZE)?;
        Value::from_portable(bytes).ok_or_else(|| self.short.clone())
    }
}
