//! Image loading.
//!
//! An image is a signature, a format version and a sequence of blocks,
//! each with a 10-byte header (`type:[u8;4]`, `size:u32`, `flags:u16`).
//! Loading streams the blocks once, filling the pools, the dependency
//! tables and the object table, and validates the result before any code
//! runs.

use std::io::{self, Read, SeekFrom};

use ahash::AHashMap;
use bytecode::MethodHeader;
use heap::{Heap, HeapSettings};
use object::{Body, Object, PropId, SpecialObjects, Value};
use sha2::{Digest, Sha256};

use crate::codec::ByteReader;
use crate::error::{ErrorCode, VmError, VmResult};
use crate::intrinsics::FunctionSetTable;
use crate::metaclass::MetaclassTable;
use crate::pool::{CODE_POOL, CONST_POOL, PageData, PageSource, Pools};

pub const IMAGE_SIGNATURE: &[u8; 11] = b"T3-image\r\n\x1a";
pub const IMAGE_VERSION: u16 = 1;
pub const BLOCK_HEADER_SIZE: usize = 10;
pub const BLOCK_MANDATORY: u16 = 1 << 0;
/// `OBJS` flag: object sizes are `u32` instead of `u16`.
pub const OBJS_LARGE: u16 = 1 << 0;

/// `ENTP` contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    /// Code offset of the entry function's method header.
    pub code_ofs: u32,
    pub method_header_size: u16,
    pub exc_entry_size: u16,
    pub debug_line_size: u16,
    pub debug_header_size: u16,
    pub debug_local_size: u16,
    pub debug_version: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub tag: String,
    /// Stream offset of the payload.
    pub offset: u64,
    pub size: u32,
    pub mandatory: bool,
}

/// What the loader saw, for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub version: u16,
    /// SHA-256 of the whole image stream.
    pub identity: [u8; 32],
    pub blocks: Vec<BlockInfo>,
    pub object_count: usize,
}

/// Everything an image contributes to a VM.
pub(crate) struct LoadedImage {
    pub heap: Heap,
    pub metaclasses: MetaclassTable,
    pub function_sets: FunctionSetTable,
    pub entry: EntryPoint,
    pub exports: AHashMap<String, Value>,
    pub special: SpecialObjects,
    /// Persistent objects as loaded, for restart.
    pub initial_objects: Vec<(u32, Object)>,
    pub info: ImageInfo,
}

fn tag_name(tag: &[u8; 4]) -> String {
    String::from_utf8_lossy(tag).into_owned()
}

fn io_error(e: io::Error) -> VmError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        VmError::new(ErrorCode::ImageTruncated)
    } else {
        VmError::new(ErrorCode::PageIo).arg(e)
    }
}

fn bad_block(tag: &str, why: impl std::fmt::Display) -> VmError {
    VmError::new(ErrorCode::BadBlockData).arg(tag).arg(why)
}

fn block_reader<'a>(payload: &'a [u8], tag: &str) -> ByteReader<'a> {
    ByteReader::new(payload, bad_block(tag, "truncated"))
}

/// SHA-256 of the stream from its start. Leaves the stream at offset 0.
fn hash_stream(src: &mut dyn PageSource) -> VmResult<[u8; 32]> {
    src.seek(SeekFrom::Start(0)).map_err(io_error)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(io_error(e)),
        }
    }
    src.seek(SeekFrom::Start(0)).map_err(io_error)?;
    Ok(hasher.finalize().into())
}

struct Loader<'a> {
    src: &'a mut dyn PageSource,
    pools: &'a mut Pools,
    heap: Heap,
    metaclasses: MetaclassTable,
    function_sets: FunctionSetTable,
    seen_mcld: bool,
    seen_fnsd: bool,
    entry: Option<EntryPoint>,
    exports: AHashMap<String, Value>,
    initial_objects: Vec<(u32, Object)>,
    blocks: Vec<BlockInfo>,
}

/// Load an image from `src` into `pools` and a fresh object table.
pub(crate) fn load(
    src: &mut dyn PageSource,
    pools: &mut Pools,
    heap_settings: HeapSettings,
) -> VmResult<LoadedImage> {
    let identity = hash_stream(src)?;

    let mut signature = [0u8; IMAGE_SIGNATURE.len()];
    src.read_exact(&mut signature)
        .map_err(|_| VmError::new(ErrorCode::BadSignature))?;
    if &signature != IMAGE_SIGNATURE {
        return Err(VmError::new(ErrorCode::BadSignature));
    }
    let mut version = [0u8; 2];
    src.read_exact(&mut version).map_err(io_error)?;
    let version = u16::from_le_bytes(version);
    if version != IMAGE_VERSION {
        return Err(VmError::new(ErrorCode::UnsupportedVersion).arg(version));
    }

    let mut loader = Loader {
        src,
        pools,
        heap: Heap::new(heap_settings),
        metaclasses: MetaclassTable::new(),
        function_sets: FunctionSetTable::new(),
        seen_mcld: false,
        seen_fnsd: false,
        entry: None,
        exports: AHashMap::new(),
        initial_objects: Vec::new(),
        blocks: Vec::new(),
    };
    loader.read_blocks()?;
    let entry = loader.finish()?;

    let Loader {
        mut heap,
        mut metaclasses,
        function_sets,
        exports,
        initial_objects,
        blocks,
        ..
    } = loader;
    metaclasses.ensure_required();
    heap.seal();

    let special = SpecialObjects {
        runtime_error: exports
            .get(SpecialObjects::RUNTIME_ERROR)
            .and_then(|v| v.as_obj()),
        exception_message: exports
            .get(SpecialObjects::EXCEPTION_MESSAGE)
            .and_then(|v| v.as_prop()),
        errno: exports.get(SpecialObjects::ERRNO).and_then(|v| v.as_prop()),
    };
    let info = ImageInfo {
        version,
        identity,
        blocks,
        object_count: initial_objects.len(),
    };
    log::info!(
        "image loaded: {} objects, {} metaclasses, {} function sets",
        info.object_count,
        metaclasses.len(),
        function_sets.len()
    );
    Ok(LoadedImage {
        heap,
        metaclasses,
        function_sets,
        entry,
        exports,
        special,
        initial_objects,
        info,
    })
}

impl Loader<'_> {
    fn read_payload(&mut self, size: u32) -> VmResult<Vec<u8>> {
        let mut payload = Vec::new();
        Read::take(&mut *self.src, size as u64)
            .read_to_end(&mut payload)
            .map_err(io_error)?;
        if payload.len() != size as usize {
            return Err(VmError::new(ErrorCode::ImageTruncated));
        }
        Ok(payload)
    }

    fn skip(&mut self, size: u32) -> VmResult<()> {
        self.src
            .seek(SeekFrom::Current(size as i64))
            .map_err(io_error)?;
        Ok(())
    }

    fn read_blocks(&mut self) -> VmResult<()> {
        loop {
            let mut header = [0u8; BLOCK_HEADER_SIZE];
            self.src.read_exact(&mut header).map_err(io_error)?;
            let tag: [u8; 4] = [header[0], header[1], header[2], header[3]];
            let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            let flags = u16::from_le_bytes([header[8], header[9]]);
            let offset = self.src.stream_position().map_err(io_error)?;
            let name = tag_name(&tag);
            log::debug!("block {name} at {offset}, {size} bytes");
            self.blocks.push(BlockInfo {
                tag: name.clone(),
                offset,
                size,
                mandatory: flags & BLOCK_MANDATORY != 0,
            });

            match &tag {
                b"EOF " => {
                    self.skip(size)?;
                    let mut probe = [0u8; 1];
                    return match self.src.read(&mut probe).map_err(io_error)? {
                        0 => Ok(()),
                        _ => Err(VmError::new(ErrorCode::DataAfterEof)),
                    };
                }
                b"MCLD" => {
                    let payload = self.read_payload(size)?;
                    self.metaclass_table(&payload)?;
                }
                b"FNSD" => {
                    let payload = self.read_payload(size)?;
                    self.function_set_table(&payload)?;
                }
                b"CPDF" => {
                    let payload = self.read_payload(size)?;
                    self.pool_definition(&payload)?;
                }
                b"CPPG" => self.pool_page(offset, size)?,
                b"OBJS" => {
                    let payload = self.read_payload(size)?;
                    self.objects(&payload)?;
                }
                b"SYMD" => {
                    let payload = self.read_payload(size)?;
                    self.symbols(&payload)?;
                }
                b"ENTP" => {
                    let payload = self.read_payload(size)?;
                    self.entrypoint(&payload)?;
                }
                _ if flags & BLOCK_MANDATORY != 0 => {
                    return Err(VmError::new(ErrorCode::UnknownMandatoryBlock).arg(name));
                }
                _ => {
                    log::warn!("skipping unknown optional block {name}");
                    self.skip(size)?;
                }
            }
        }
    }

    // ── Blocks ─────────────────────────────────────────────────────

    fn metaclass_table(&mut self, payload: &[u8]) -> VmResult<()> {
        if self.seen_mcld {
            return Err(VmError::new(ErrorCode::DuplicateBlock).arg("MCLD"));
        }
        self.seen_mcld = true;
        let mut r = block_reader(payload, "MCLD");
        let count = r.u16()?;
        for _ in 0..count {
            let entry_size = r.u16()? as usize;
            let mut e = block_reader(r.bytes(entry_size)?, "MCLD");
            let name = e.name()?;
            let prop_count = e.u16()? as usize;
            let prop_size = e.u16()? as usize;
            if prop_size < 2 {
                return Err(bad_block("MCLD", "property entries shorter than 2 bytes"));
            }
            let mut props = Vec::with_capacity(prop_count);
            for _ in 0..prop_count {
                let mut p = block_reader(e.bytes(prop_size)?, "MCLD");
                props.push(PropId(p.u16()?));
            }
            let id = self.metaclasses.add_dependency(&name, props)?;
            log::debug!("metaclass {} = {name}", id.0);
        }
        Ok(())
    }

    fn function_set_table(&mut self, payload: &[u8]) -> VmResult<()> {
        if self.seen_fnsd {
            return Err(VmError::new(ErrorCode::DuplicateBlock).arg("FNSD"));
        }
        self.seen_fnsd = true;
        let mut r = block_reader(payload, "FNSD");
        let count = r.u16()?;
        for _ in 0..count {
            let name = r.name()?;
            let index = self.function_sets.add_dependency(&name)?;
            log::debug!("function set {index} = {name}");
        }
        Ok(())
    }

    fn pool_definition(&mut self, payload: &[u8]) -> VmResult<()> {
        let mut r = block_reader(payload, "CPDF");
        let pool = r.u16()?;
        let page_count = r.u32()?;
        let page_size = r.u32()?;
        self.pools.define(pool, page_count, page_size)
    }

    fn pool_page(&mut self, offset: u64, size: u32) -> VmResult<()> {
        const PREFIX: u32 = 7;
        if size < PREFIX {
            return Err(bad_block("CPPG", "truncated"));
        }
        let prefix = self.read_payload(PREFIX)?;
        let mut r = block_reader(&prefix, "CPPG");
        let pool = r.u16()?;
        let index = r.u32()?;
        let xor_mask = r.u8()?;
        let len = size - PREFIX;
        let data = if self.pools.get(pool)?.is_paged() {
            self.skip(len)?;
            PageData::Deferred {
                offset: offset + PREFIX as u64,
                len,
            }
        } else {
            PageData::Bytes(self.read_payload(len)?)
        };
        self.pools.get(pool)?.add_page(index, xor_mask, data)
    }

    fn objects(&mut self, payload: &[u8]) -> VmResult<()> {
        if !self.seen_mcld {
            return Err(VmError::new(ErrorCode::BlockOrder)
                .arg("OBJS")
                .arg("the metaclass table must come first"));
        }
        let mut r = block_reader(payload, "OBJS");
        let count = r.u16()?;
        let meta_index = r.u16()?;
        let flags = r.u16()?;
        let meta = object::MetaclassId(meta_index);
        let Some(loaded) = self.metaclasses.get(meta) else {
            return Err(VmError::new(ErrorCode::BadMetaclassIndex).arg(meta_index));
        };
        let desc = loaded.desc;
        for _ in 0..count {
            let id = r.u32()?;
            let size = if flags & OBJS_LARGE != 0 {
                r.u32()? as usize
            } else {
                r.u16()? as usize
            };
            let data = r.bytes(size)?;
            let body = (desc.load)(data).map_err(|e| VmError {
                code: ErrorCode::BadObjectData,
                args: std::iter::once(id.to_string()).chain(e.args).collect(),
            })?;
            let object = Object::new(meta, body);
            self.heap.define_persistent(id, object.clone())?;
            self.initial_objects.push((id, object));
        }
        if !r.is_empty() {
            return Err(bad_block("OBJS", "trailing bytes after objects"));
        }
        Ok(())
    }

    fn symbols(&mut self, payload: &[u8]) -> VmResult<()> {
        let mut r = block_reader(payload, "SYMD");
        let count = r.u16()?;
        for _ in 0..count {
            let value = r.portable()?;
            let name = r.name()?;
            self.exports.insert(name, value);
        }
        Ok(())
    }

    fn entrypoint(&mut self, payload: &[u8]) -> VmResult<()> {
        if self.entry.is_some() {
            return Err(VmError::new(ErrorCode::DuplicateBlock).arg("ENTP"));
        }
        let mut r = block_reader(payload, "ENTP");
        let entry = EntryPoint {
            code_ofs: r.u32()?,
            method_header_size: r.u16()?,
            exc_entry_size: r.u16()?,
            debug_line_size: r.u16()?,
            debug_header_size: r.u16()?,
            debug_local_size: r.u16()?,
            debug_version: r.u16()?,
        };
        if (entry.method_header_size as usize) < MethodHeader::SIZE {
            return Err(bad_block("ENTP", "method header size below 10"));
        }
        if (entry.exc_entry_size as usize) < bytecode::ExceptionEntry::SIZE {
            return Err(bad_block("ENTP", "exception entry size below 10"));
        }
        self.entry = Some(entry);
        Ok(())
    }

    // ── Validation ─────────────────────────────────────────────────

    /// Checks that need the whole image.
    fn finish(&mut self) -> VmResult<EntryPoint> {
        if !self.seen_mcld {
            return Err(VmError::new(ErrorCode::NoMetaclassTable));
        }
        if !self.seen_fnsd {
            return Err(VmError::new(ErrorCode::NoFunctionSetTable));
        }
        if !self.pools.is_defined(CODE_POOL) {
            return Err(VmError::new(ErrorCode::NoCodePool));
        }
        for pool in [CODE_POOL, CONST_POOL] {
            let empty = self
                .pools
                .get_ref(pool)
                .is_some_and(|p| self.pools.is_defined(pool) && p.loaded_pages() == 0);
            if empty {
                return Err(VmError::new(ErrorCode::NoPoolPages).arg(pool));
            }
        }
        if self.initial_objects.is_empty() {
            return Err(VmError::new(ErrorCode::NoObjects));
        }
        let Some(entry) = self.entry else {
            return Err(VmError::new(ErrorCode::NoEntrypoint));
        };

        for (id, object) in &self.initial_objects {
            if let Body::Tads(t) = &object.body {
                if let Some(missing) = t.superclasses.iter().find(|sc| !self.heap.contains(**sc)) {
                    return Err(VmError::new(ErrorCode::BadSuperclass)
                        .arg(id)
                        .arg(missing.index));
                }
            }
        }

        Ok(entry)
    }
}

/// Read and parse the entrypoint's method header. In paged mode this
/// reads from the image stream, so it runs once loading has let go of it.
pub(crate) fn check_entry(pools: &mut Pools, entry: &EntryPoint) -> VmResult<MethodHeader> {
    let bytes = pools.read_code(entry.code_ofs, MethodHeader::SIZE)?;
    let header = MethodHeader::parse(&bytes)?;
    log::debug!(
        "entrypoint at {:#x}: {} args, {} locals",
        entry.code_ofs,
        header.argc,
        header.locals
    );
    Ok(header)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::pool::PoolMode;
    use crate::writer::ImageWriter;

    fn minimal() -> ImageWriter {
        let mut w = ImageWriter::new();
        let tads = w.metaclass("tads-object/030005", &[]);
        w.function_set("tads-gen/030008");
        let entry = w.code(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, bytecode::Op::RetNil as u8]);
        w.tads_object(1, tads, &[], &[]);
        w.entrypoint(entry);
        w
    }

    fn load_bytes(bytes: Vec<u8>) -> VmResult<LoadedImage> {
        let mut src = Cursor::new(bytes);
        let mut pools = Pools::new(PoolMode::InMemory, None);
        load(&mut src, &mut pools, HeapSettings::default())
    }

    fn code_of(result: VmResult<LoadedImage>) -> ErrorCode {
        match result {
            Ok(_) => panic!("image unexpectedly loaded"),
            Err(e) => e.code,
        }
    }

    #[test]
    fn minimal_image_loads() {
        let bytes = minimal().to_bytes();
        let image = load_bytes(bytes.clone()).unwrap();
        assert_eq!(image.info.object_count, 1);
        assert_eq!(image.info.identity, <[u8; 32]>::from(Sha256::digest(&bytes)));
        assert!(image.heap.is_persistent(object::ObjectId::persistent(1)));
        assert!(image.metaclasses.len() >= 4, "required metaclasses appended");
        let tags: Vec<&str> = image.info.blocks.iter().map(|b| b.tag.as_str()).collect();
        assert_eq!(tags.first(), Some(&"MCLD"));
        assert_eq!(tags.last(), Some(&"EOF "));
    }

    #[test]
    fn signature_version_and_trailing_data() {
        let mut bytes = minimal().to_bytes();
        bytes[0] = b'X';
        assert_eq!(code_of(load_bytes(bytes)), ErrorCode::BadSignature);

        let mut bytes = minimal().to_bytes();
        bytes[IMAGE_SIGNATURE.len()] = 9;
        assert_eq!(code_of(load_bytes(bytes)), ErrorCode::UnsupportedVersion);

        let mut bytes = minimal().to_bytes();
        bytes.push(0);
        assert_eq!(code_of(load_bytes(bytes)), ErrorCode::DataAfterEof);

        let bytes = minimal().to_bytes();
        let cut = bytes[..bytes.len() - 4].to_vec();
        assert_eq!(code_of(load_bytes(cut)), ErrorCode::ImageTruncated);
    }

    #[test]
    fn unknown_blocks_by_flag() {
        let mut w = minimal();
        w.raw_block(*b"XTRA", false, vec![1, 2, 3]);
        assert!(load_bytes(w.to_bytes()).is_ok());

        let mut w = minimal();
        w.raw_block(*b"XTRA", true, vec![1, 2, 3]);
        assert_eq!(code_of(load_bytes(w.to_bytes())), ErrorCode::UnknownMandatoryBlock);
    }

    #[test]
    fn missing_required_blocks() {
        let mut w = ImageWriter::new();
        let tads = w.metaclass("tads-object/030005", &[]);
        w.function_set("t3vm/010006");
        w.code(&[0; 11]);
        w.tads_object(1, tads, &[], &[]);
        assert_eq!(code_of(load_bytes(w.to_bytes())), ErrorCode::NoEntrypoint);

        let mut w = ImageWriter::new();
        w.metaclass("tads-object/030005", &[]);
        w.function_set("t3vm/010006");
        let entry = w.code(&[0; 11]);
        w.entrypoint(entry);
        assert_eq!(code_of(load_bytes(w.to_bytes())), ErrorCode::NoObjects);
    }

    #[test]
    fn bad_metaclass_index_creates_nothing() {
        let mut w = minimal();
        w.object(5, 9, vec![0, 0]);
        assert_eq!(code_of(load_bytes(w.to_bytes())), ErrorCode::BadMetaclassIndex);
    }

    #[test]
    fn undefined_superclass_is_rejected() {
        let mut w = minimal();
        w.tads_object(2, 0, &[40], &[]);
        assert_eq!(code_of(load_bytes(w.to_bytes())), ErrorCode::BadSuperclass);
    }

    #[test]
    fn object_data_errors_name_the_object() {
        let mut w = minimal();
        w.object(3, 0, vec![1]);
        let err = load_bytes(w.to_bytes()).err().unwrap();
        assert_eq!(err.code, ErrorCode::BadObjectData);
        assert_eq!(err.args.first().map(String::as_str), Some("3"));
    }

    #[test]
    fn exports_fill_special_objects() {
        let mut w = minimal();
        w.symbol("RuntimeError", Value::Obj(object::ObjectId::persistent(1)));
        w.symbol("exceptionMessage", Value::Prop(PropId(7)));
        let image = load_bytes(w.to_bytes()).unwrap();
        assert_eq!(image.special.runtime_error, Some(object::ObjectId::persistent(1)));
        assert_eq!(image.special.exception_message, Some(PropId(7)));
        assert_eq!(image.special.errno, None);
    }

    #[test]
    fn paged_entry_is_checked_after_the_stream_is_released() {
        use std::cell::RefCell;
        use std::rc::Rc;

        use crate::pool::SharedSource;

        let source: SharedSource = Rc::new(RefCell::new(Cursor::new(minimal().to_bytes())));
        let mut pools = Pools::new(
            PoolMode::Paged {
                max_resident_pages: 1,
            },
            Some(Rc::clone(&source)),
        );
        let image = {
            let mut src = source.borrow_mut();
            load(&mut *src, &mut pools, HeapSettings::default()).unwrap()
        };
        assert_eq!(pools.code().resident_pages(), 0);
        let header = check_entry(&mut pools, &image.entry).unwrap();
        assert_eq!(header.argc, 0);
        assert_eq!(pools.code().resident_pages(), 1);
    }
}
