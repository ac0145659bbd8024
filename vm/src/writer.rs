//! Building images in memory, block by block.
//!
//! The writer produces exactly the format [`crate::image`] reads. Tests
//! and embedding hosts use it to assemble small programs together with
//! [`bytecode::BytecodeBuilder`].

use std::io::{self, Write};

use object::Value;

use crate::codec::{put_name, put_portable, put_u16, put_u32};
use crate::image::{BLOCK_MANDATORY, IMAGE_SIGNATURE, IMAGE_VERSION, OBJS_LARGE};
use crate::metaclass::{list, lookup_table, string, tads_object};
use crate::pool::{CODE_POOL, CONST_POOL};

pub struct ImageWriter {
    version: u16,
    page_size: u32,
    xor_mask: u8,
    metaclasses: Vec<(String, Vec<u16>)>,
    function_sets: Vec<String>,
    code: Vec<u8>,
    constants: Vec<u8>,
    /// Objects in definition order: (id, metaclass index, data).
    objects: Vec<(u32, u16, Vec<u8>)>,
    symbols: Vec<(String, Value)>,
    entry: Option<u32>,
    extra: Vec<([u8; 4], bool, Vec<u8>)>,
}

impl Default for ImageWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageWriter {
    pub fn new() -> Self {
        Self {
            version: IMAGE_VERSION,
            page_size: 4096,
            xor_mask: 0,
            metaclasses: Vec::new(),
            function_sets: Vec::new(),
            code: Vec::new(),
            constants: Vec::new(),
            objects: Vec::new(),
            symbols: Vec::new(),
            entry: None,
            extra: Vec::new(),
        }
    }

    /// Page size of both pools. Set before adding code or constants.
    pub fn page_size(&mut self, size: u32) -> &mut Self {
        self.page_size = size.max(1);
        self
    }

    /// XOR mask applied to every pool page.
    pub fn xor_mask(&mut self, mask: u8) -> &mut Self {
        self.xor_mask = mask;
        self
    }

    pub fn format_version(&mut self, version: u16) -> &mut Self {
        self.version = version;
        self
    }

    /// Add a metaclass dependency (`name/version`) with the property ids of
    /// its native methods. Returns its metaclass index.
    pub fn metaclass(&mut self, dep: &str, props: &[u16]) -> u16 {
        self.metaclasses.push((dep.to_string(), props.to_vec()));
        (self.metaclasses.len() - 1) as u16
    }

    /// Add a function set dependency. Returns its set index.
    pub fn function_set(&mut self, dep: &str) -> u8 {
        self.function_sets.push(dep.to_string());
        (self.function_sets.len() - 1) as u8
    }

    /// Append `bytes` to a pool so that they do not straddle a page.
    fn place(pool: &mut Vec<u8>, page_size: u32, bytes: &[u8]) -> u32 {
        let page_size = page_size as usize;
        let used = pool.len() % page_size;
        if used != 0 && bytes.len() <= page_size && used + bytes.len() > page_size {
            pool.resize(pool.len() + page_size - used, 0);
        }
        let ofs = pool.len() as u32;
        pool.extend_from_slice(bytes);
        ofs
    }

    /// Append a method (header + bytecode). Returns its code offset.
    pub fn code(&mut self, bytes: &[u8]) -> u32 {
        Self::place(&mut self.code, self.page_size, bytes)
    }

    /// Append a constant string. Returns its constant pool offset.
    pub fn string(&mut self, text: &str) -> u32 {
        let mut bytes = Vec::with_capacity(text.len() + 2);
        put_u16(&mut bytes, text.len() as u16);
        bytes.extend_from_slice(text.as_bytes());
        Self::place(&mut self.constants, self.page_size, &bytes)
    }

    /// Append a constant list. Returns its constant pool offset.
    pub fn list(&mut self, items: &[Value]) -> u32 {
        Self::place(&mut self.constants, self.page_size, &list::encode(items))
    }

    /// Define an object from raw metaclass data.
    pub fn object(&mut self, id: u32, meta: u16, data: Vec<u8>) {
        self.objects.push((id, meta, data));
    }

    pub fn tads_object(&mut self, id: u32, meta: u16, superclasses: &[u32], props: &[(u16, Value)]) {
        self.object(id, meta, tads_object::encode(superclasses, props));
    }

    /// A list or vector object.
    pub fn list_object(&mut self, id: u32, meta: u16, items: &[Value]) {
        self.object(id, meta, list::encode(items));
    }

    pub fn string_object(&mut self, id: u32, meta: u16, text: &str) {
        self.object(id, meta, string::encode(text));
    }

    pub fn lookup_table_object(&mut self, id: u32, meta: u16, entries: &[(Value, Value)]) {
        self.object(id, meta, lookup_table::encode(entries));
    }

    /// Export `value` under `name`.
    pub fn symbol(&mut self, name: &str, value: Value) {
        self.symbols.push((name.to_string(), value));
    }

    pub fn entrypoint(&mut self, code_ofs: u32) {
        self.entry = Some(code_ofs);
    }

    /// An extra block written just before `ENTP`.
    pub fn raw_block(&mut self, tag: [u8; 4], mandatory: bool, payload: Vec<u8>) {
        self.extra.push((tag, mandatory, payload));
    }

    // ── Output ─────────────────────────────────────────────────────

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.emit(&mut out);
        out
    }

    pub fn write(&self, w: &mut dyn Write) -> io::Result<()> {
        w.write_all(&self.to_bytes())
    }

    fn emit(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(IMAGE_SIGNATURE);
        put_u16(out, self.version);

        let mut mcld = Vec::new();
        put_u16(&mut mcld, self.metaclasses.len() as u16);
        for (name, props) in &self.metaclasses {
            let mut entry = Vec::new();
            put_name(&mut entry, name);
            put_u16(&mut entry, props.len() as u16);
            put_u16(&mut entry, 2);
            for &p in props {
                put_u16(&mut entry, p);
            }
            put_u16(&mut mcld, entry.len() as u16);
            mcld.extend_from_slice(&entry);
        }
        block(out, b"MCLD", true, &mcld);

        let mut fnsd = Vec::new();
        put_u16(&mut fnsd, self.function_sets.len() as u16);
        for name in &self.function_sets {
            put_name(&mut fnsd, name);
        }
        block(out, b"FNSD", true, &fnsd);

        self.pool(out, CODE_POOL, &self.code);
        if !self.constants.is_empty() {
            self.pool(out, CONST_POOL, &self.constants);
        }

        // Consecutive objects of one metaclass share a block.
        let mut start = 0;
        while start < self.objects.len() {
            let meta = self.objects[start].1;
            let end = self.objects[start..]
                .iter()
                .position(|o| o.1 != meta)
                .map_or(self.objects.len(), |n| start + n);
            let group = &self.objects[start..end];
            let large = group.iter().any(|o| o.2.len() > u16::MAX as usize);
            let mut objs = Vec::new();
            put_u16(&mut objs, group.len() as u16);
            put_u16(&mut objs, meta);
            put_u16(&mut objs, if large { OBJS_LARGE } else { 0 });
            for (id, _, data) in group {
                put_u32(&mut objs, *id);
                if large {
                    put_u32(&mut objs, data.len() as u32);
                } else {
                    put_u16(&mut objs, data.len() as u16);
                }
                objs.extend_from_slice(data);
            }
            block(out, b"OBJS", true, &objs);
            start = end;
        }

        if !self.symbols.is_empty() {
            let mut symd = Vec::new();
            put_u16(&mut symd, self.symbols.len() as u16);
            for (name, value) in &self.symbols {
                put_portable(&mut symd, *value);
                put_name(&mut symd, name);
            }
            block(out, b"SYMD", false, &symd);
        }

        for (tag, mandatory, payload) in &self.extra {
            block(out, tag, *mandatory, payload);
        }

        if let Some(entry) = self.entry {
            let mut entp = Vec::new();
            put_u32(&mut entp, entry);
            put_u16(&mut entp, bytecode::MethodHeader::SIZE as u16);
            put_u16(&mut entp, bytecode::ExceptionEntry::SIZE as u16);
            for _ in 0..4 {
                put_u16(&mut entp, 0);
            }
            block(out, b"ENTP", true, &entp);
        }

        block(out, b"EOF ", true, &[]);
    }

    fn pool(&self, out: &mut Vec<u8>, pool: u16, bytes: &[u8]) {
        let pages: Vec<&[u8]> = bytes.chunks(self.page_size as usize).collect();
        let mut cpdf = Vec::new();
        put_u16(&mut cpdf, pool);
        put_u32(&mut cpdf, pages.len() as u32);
        put_u32(&mut cpdf, self.page_size);
        block(out, b"CPDF", true, &cpdf);

        for (index, page) in pages.into_iter().enumerate() {
            let mut cppg = Vec::with_capacity(page.len() + 7);
            put_u16(&mut cppg, pool);
            put_u32(&mut cppg, index as u32);
            cppg.push(self.xor_mask);
            cppg.extend(page.iter().map(|b| b ^ self.xor_mask));
            block(out, b"CPPG", true, &cppg);
        }
    }
}

fn block(out: &mut Vec<u8>, tag: &[u8; 4], mandatory: bool, payload: &[u8]) {
    out.extend_from_slice(tag);
    put_u32(out, payload.len() as u32);
    put_u16(out, if mandatory { BLOCK_MANDATORY } else { 0 });
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_data_never_straddles_a_page() {
        let mut w = ImageWriter::new();
        w.page_size(16);
        assert_eq!(w.code(&[1; 10]), 0);
        assert_eq!(w.code(&[2; 10]), 16);
        assert_eq!(w.code(&[3; 6]), 26);
        assert_eq!(w.string("abc"), 0);
        assert_eq!(w.list(&[Value::Int(1), Value::Int(2)]), 16);
    }

    #[test]
    fn objects_are_grouped_by_metaclass() {
        let mut w = ImageWriter::new();
        w.metaclass("tads-object/030005", &[]);
        w.metaclass("string/030008", &[]);
        w.function_set("tads-gen/030008");
        w.code(&[0; 11]);
        w.tads_object(1, 0, &[], &[]);
        w.tads_object(2, 0, &[1], &[]);
        w.string_object(3, 1, "x");
        let bytes = w.to_bytes();
        let count = bytes.windows(4).filter(|t| t == b"OBJS").count();
        assert_eq!(count, 2);
    }
}
