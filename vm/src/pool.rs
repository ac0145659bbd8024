//! Code and constant pools.
//!
//! A pool is a sequence of equally sized pages addressed by a flat offset.
//! Pages are either loaded eagerly ([`InMemoryPool`]) or fetched from the
//! image stream on demand and evicted least-recently-used ([`PagedPool`]).

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use object::{PORTABLE_SIZE, Value};

use crate::error::{ErrorCode, VmError, VmResult};

pub const CODE_POOL: u16 = 1;
pub const CONST_POOL: u16 = 2;

/// Any seekable byte stream an image can be read from.
pub trait PageSource: Read + Seek {}

impl<T: Read + Seek> PageSource for T {}

/// Image stream shared by the paged pools of one VM.
pub type SharedSource = Rc<RefCell<dyn PageSource>>;

/// How pool pages are kept in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolMode {
    #[default]
    InMemory,
    Paged { max_resident_pages: usize },
}

impl PoolMode {
    pub fn validate(&self) -> Result<(), &'static str> {
        match self {
            PoolMode::Paged {
                max_resident_pages: 0,
            } => Err("max_resident_pages must be > 0"),
            _ => Ok(()),
        }
    }
}

/// Page contents as handed over by the image loader.
#[derive(Debug)]
pub enum PageData {
    Bytes(Vec<u8>),
    /// Page bytes left in the image stream at `offset`.
    Deferred { offset: u64, len: u32 },
}

pub trait PoolBackend {
    /// Set the page geometry. Called once, before any page is added.
    fn define(&mut self, page_count: u32, page_size: u32) -> VmResult<()>;
    fn add_page(&mut self, index: u32, xor_mask: u8, data: PageData) -> VmResult<()>;
    /// Bytes from `ofs` to the end of its page.
    fn page_slice(&mut self, ofs: u32) -> VmResult<&[u8]>;
    fn pin(&mut self, ofs: u32);
    fn unpin(&mut self, ofs: u32);
    fn resident_pages(&self) -> usize;
    fn is_paged(&self) -> bool;
    fn page_size(&self) -> u32;
    fn page_count(&self) -> u32;
    /// Number of pages the image supplied.
    fn loaded_pages(&self) -> usize;
}

fn out_of_range(pool: u16, ofs: u32) -> VmError {
    VmError::new(ErrorCode::PoolOutOfRange).arg(pool).arg(ofs)
}

fn bad_page(pool: u16, index: u32, why: &str) -> VmError {
    VmError::new(ErrorCode::BadPoolPage)
        .arg(pool)
        .arg(index)
        .arg(why)
}

/// Page geometry and the checks shared by both backends.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    pool: u16,
    page_count: u32,
    page_size: u32,
}

impl Geometry {
    fn new(pool: u16) -> Self {
        Self {
            pool,
            page_count: 0,
            page_size: 0,
        }
    }

    fn define(&mut self, page_count: u32, page_size: u32) -> VmResult<()> {
        if page_size == 0 {
            return Err(VmError::new(ErrorCode::BadBlockData)
                .arg("CPDF")
                .arg("page size is zero"));
        }
        self.page_count = page_count;
        self.page_size = page_size;
        Ok(())
    }

    fn split(&self, ofs: u32) -> VmResult<(usize, usize)> {
        if self.page_size == 0 {
            return Err(out_of_range(self.pool, ofs));
        }
        let page = ofs / self.page_size;
        if page >= self.page_count {
            return Err(out_of_range(self.pool, ofs));
        }
        Ok((page as usize, (ofs % self.page_size) as usize))
    }

    fn check_new_page(&self, index: u32, len: usize, present: bool) -> VmResult<()> {
        if self.page_size == 0 {
            return Err(VmError::new(ErrorCode::BlockOrder)
                .arg("CPPG")
                .arg(format!("pool {} is not defined", self.pool)));
        }
        if index >= self.page_count {
            return Err(bad_page(self.pool, index, "index beyond page count"));
        }
        if len > self.page_size as usize {
            return Err(bad_page(self.pool, index, "page larger than page size"));
        }
        if present {
            return Err(bad_page(self.pool, index, "page defined twice"));
        }
        Ok(())
    }
}

// ── In-memory pool ────────────────────────────────────────────────────

/// Every page resident, unmasked at load time.
pub struct InMemoryPool {
    geometry: Geometry,
    pages: Vec<Option<Vec<u8>>>,
}

impl InMemoryPool {
    pub fn new(pool: u16) -> Self {
        Self {
            geometry: Geometry::new(pool),
            pages: Vec::new(),
        }
    }
}

impl PoolBackend for InMemoryPool {
    fn define(&mut self, page_count: u32, page_size: u32) -> VmResult<()> {
        self.geometry.define(page_count, page_size)?;
        self.pages = vec![None; page_count as usize];
        Ok(())
    }

    fn add_page(&mut self, index: u32, xor_mask: u8, data: PageData) -> VmResult<()> {
        let PageData::Bytes(mut bytes) = data else {
            return Err(VmError::internal("in-memory pool given a deferred page"));
        };
        let present = self
            .pages
            .get(index as usize)
            .is_some_and(|p| p.is_some());
        self.geometry.check_new_page(index, bytes.len(), present)?;
        if xor_mask != 0 {
            for b in bytes.iter_mut() {
                *b ^= xor_mask;
            }
        }
        self.pages[index as usize] = Some(bytes);
        Ok(())
    }

    fn page_slice(&mut self, ofs: u32) -> VmResult<&[u8]> {
        let (page, at) = self.geometry.split(ofs)?;
        self.pages[page]
            .as_deref()
            .and_then(|bytes| bytes.get(at..))
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| out_of_range(self.geometry.pool, ofs))
    }

    fn pin(&mut self, _ofs: u32) {}

    fn unpin(&mut self, _ofs: u32) {}

    fn resident_pages(&self) -> usize {
        self.loaded_pages()
    }

    fn is_paged(&self) -> bool {
        false
    }

    fn page_size(&self) -> u32 {
        self.geometry.page_size
    }

    fn page_count(&self) -> u32 {
        self.geometry.page_count
    }

    fn loaded_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }
}

// ── Paged pool ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PageSlot {
    location: Option<(u64, u32)>,
    data: Option<Vec<u8>>,
    pins: u32,
    last_use: u64,
}

/// Pages stay in the image stream until first touched. At most
/// `max_resident` pages are kept; the least recently used unpinned page
/// makes room.
pub struct PagedPool {
    geometry: Geometry,
    source: SharedSource,
    pages: Vec<PageSlot>,
    max_resident: usize,
    resident: usize,
    clock: u64,
}

impl PagedPool {
    pub fn new(pool: u16, source: SharedSource, max_resident: usize) -> Self {
        Self {
            geometry: Geometry::new(pool),
            source,
            pages: Vec::new(),
            max_resident: max_resident.max(1),
            resident: 0,
            clock: 0,
        }
    }

    fn evict_for(&mut self, wanted: usize) {
        while self.resident >= self.max_resident {
            let victim = self
                .pages
                .iter()
                .enumerate()
                .filter(|(i, p)| *i != wanted && p.data.is_some() && p.pins == 0)
                .min_by_key(|(_, p)| p.last_use)
                .map(|(i, _)| i);
            match victim {
                Some(i) => {
                    log::trace!("pool {}: evicting page {i}", self.geometry.pool);
                    self.pages[i].data = None;
                    self.resident -= 1;
                }
                None => {
                    log::warn!(
                        "pool {}: all {} resident pages are pinned, exceeding the limit",
                        self.geometry.pool,
                        self.resident
                    );
                    return;
                }
            }
        }
    }

    fn load(&mut self, page: usize) -> VmResult<()> {
        let pool = self.geometry.pool;
        let Some((offset, len)) = self.pages[page].location else {
            return Err(out_of_range(pool, page as u32 * self.geometry.page_size));
        };
        self.evict_for(page);
        let mut bytes = vec![0u8; len as usize];
        {
            let mut source = self.source.borrow_mut();
            source
                .seek(SeekFrom::Start(offset))
                .and_then(|_| source.read_exact(&mut bytes))
                .map_err(|e| VmError::new(ErrorCode::PageIo).arg(e))?;
        }
        log::trace!("pool {pool}: loaded page {page}");
        self.pages[page].data = Some(bytes);
        self.resident += 1;
        Ok(())
    }
}

impl PoolBackend for PagedPool {
    fn define(&mut self, page_count: u32, page_size: u32) -> VmResult<()> {
        self.geometry.define(page_count, page_size)?;
        self.pages = (0..page_count).map(|_| PageSlot::default()).collect();
        Ok(())
    }

    fn add_page(&mut self, index: u32, xor_mask: u8, data: PageData) -> VmResult<()> {
        if xor_mask != 0 {
            return Err(VmError::new(ErrorCode::MaskedImageNotSupported));
        }
        let PageData::Deferred { offset, len } = data else {
            return Err(VmError::internal("paged pool given resident page bytes"));
        };
        let present = self
            .pages
            .get(index as usize)
            .is_some_and(|p| p.location.is_some());
        self.geometry.check_new_page(index, len as usize, present)?;
        self.pages[index as usize].location = Some((offset, len));
        Ok(())
    }

    fn page_slice(&mut self, ofs: u32) -> VmResult<&[u8]> {
        let (page, at) = self.geometry.split(ofs)?;
        if self.pages[page].data.is_none() {
            self.load(page)?;
        }
        self.clock += 1;
        let pool = self.geometry.pool;
        let slot = &mut self.pages[page];
        slot.last_use = self.clock;
        slot.data
            .as_deref()
            .and_then(|bytes| bytes.get(at..))
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| out_of_range(pool, ofs))
    }

    fn pin(&mut self, ofs: u32) {
        if let Ok((page, _)) = self.geometry.split(ofs) {
            self.pages[page].pins += 1;
        }
    }

    fn unpin(&mut self, ofs: u32) {
        if let Ok((page, _)) = self.geometry.split(ofs) {
            let slot = &mut self.pages[page];
            slot.pins = slot.pins.saturating_sub(1);
        }
    }

    fn resident_pages(&self) -> usize {
        self.resident
    }

    fn is_paged(&self) -> bool {
        true
    }

    fn page_size(&self) -> u32 {
        self.geometry.page_size
    }

    fn page_count(&self) -> u32 {
        self.geometry.page_count
    }

    fn loaded_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.location.is_some()).count()
    }
}

// ── Pool set ──────────────────────────────────────────────────────────

/// The code and constant pools of one VM.
pub struct Pools {
    code: Box<dyn PoolBackend>,
    constant: Box<dyn PoolBackend>,
    defined: [bool; 2],
}

impl Pools {
    pub fn new(mode: PoolMode, source: Option<SharedSource>) -> Self {
        let make = |pool: u16| -> Box<dyn PoolBackend> {
            match (mode, &source) {
                (PoolMode::Paged { max_resident_pages }, Some(source)) => {
                    Box::new(PagedPool::new(pool, source.clone(), max_resident_pages))
                }
                _ => Box::new(InMemoryPool::new(pool)),
            }
        };
        Self {
            code: make(CODE_POOL),
            constant: make(CONST_POOL),
            defined: [false; 2],
        }
    }

    pub fn get(&mut self, pool: u16) -> VmResult<&mut dyn PoolBackend> {
        match pool {
            CODE_POOL => Ok(self.code.as_mut()),
            CONST_POOL => Ok(self.constant.as_mut()),
            _ => Err(VmError::new(ErrorCode::BadBlockData)
                .arg("CPDF")
                .arg(format!("unknown pool id {pool}"))),
        }
    }

    pub fn get_ref(&self, pool: u16) -> Option<&dyn PoolBackend> {
        match pool {
            CODE_POOL => Some(self.code.as_ref()),
            CONST_POOL => Some(self.constant.as_ref()),
            _ => None,
        }
    }

    /// Apply a pool definition block. Each pool may be defined once.
    pub fn define(&mut self, pool: u16, page_count: u32, page_size: u32) -> VmResult<()> {
        if self.is_defined(pool) {
            return Err(VmError::new(ErrorCode::DuplicateBlock).arg(format!("CPDF {pool}")));
        }
        self.get(pool)?.define(page_count, page_size)?;
        self.defined[(pool - CODE_POOL) as usize] = true;
        Ok(())
    }

    pub fn is_defined(&self, pool: u16) -> bool {
        matches!(pool, CODE_POOL | CONST_POOL) && self.defined[(pool - CODE_POOL) as usize]
    }

    pub fn code(&mut self) -> &mut dyn PoolBackend {
        self.code.as_mut()
    }

    /// Copy `len` bytes at `ofs` out of the code pool.
    pub fn read_code(&mut self, ofs: u32, len: usize) -> VmResult<Vec<u8>> {
        let bytes = self.code.page_slice(ofs)?;
        bytes
            .get(..len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| out_of_range(CODE_POOL, ofs))
    }

    /// A constant string: `u16` length + UTF-8 bytes.
    pub fn read_string(&mut self, ofs: u32) -> VmResult<String> {
        let bytes = self.constant.page_slice(ofs)?;
        let len = bytes
            .get(..2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
            .ok_or_else(|| out_of_range(CONST_POOL, ofs))?;
        let text = bytes
            .get(2..2 + len)
            .ok_or_else(|| out_of_range(CONST_POOL, ofs))?;
        String::from_utf8(text.to_vec())
            .map_err(|_| VmError::new(ErrorCode::BadBlockData).arg("CPPG").arg("invalid UTF-8 string"))
    }

    /// A constant list: `u16` count + portable values.
    pub fn read_list(&mut self, ofs: u32) -> VmResult<Vec<Value>> {
        let bytes = self.constant.page_slice(ofs)?;
        let count = bytes
            .get(..2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
            .ok_or_else(|| out_of_range(CONST_POOL, ofs))?;
        let data = bytes
            .get(2..2 + count * PORTABLE_SIZE)
            .ok_or_else(|| out_of_range(CONST_POOL, ofs))?;
        data.chunks_exact(PORTABLE_SIZE)
            .map(|chunk| {
                Value::from_portable(chunk).ok_or_else(|| {
                    VmError::new(ErrorCode::BadBlockData)
                        .arg("CPPG")
                        .arg("invalid list element")
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn shared(bytes: Vec<u8>) -> SharedSource {
        Rc::new(RefCell::new(Cursor::new(bytes)))
    }

    #[test]
    fn in_memory_pages_are_unmasked() {
        let mut pool = InMemoryPool::new(CODE_POOL);
        pool.define(2, 4).unwrap();
        pool.add_page(1, 0xff, PageData::Bytes(vec![!1, !2, !3])).unwrap();
        assert_eq!(pool.page_slice(5).unwrap(), &[2, 3]);
        assert!(pool.page_slice(7).is_err(), "past the short last page");
        assert!(pool.page_slice(0).is_err(), "page 0 never supplied");
        assert!(pool.page_slice(8).is_err(), "beyond page count");
    }

    #[test]
    fn page_checks() {
        let mut pool = InMemoryPool::new(CONST_POOL);
        assert!(pool.add_page(0, 0, PageData::Bytes(vec![1])).is_err());
        pool.define(1, 2).unwrap();
        let err = pool.add_page(0, 0, PageData::Bytes(vec![1, 2, 3])).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadPoolPage);
        pool.add_page(0, 0, PageData::Bytes(vec![1, 2])).unwrap();
        let err = pool.add_page(0, 0, PageData::Bytes(vec![1])).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadPoolPage);
        let err = pool.add_page(1, 0, PageData::Bytes(vec![1])).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadPoolPage);
    }

    #[test]
    fn paged_pool_loads_lazily_and_evicts_lru() {
        let image: Vec<u8> = (0..12).collect();
        let mut pool = PagedPool::new(CODE_POOL, shared(image), 2);
        pool.define(3, 4).unwrap();
        for i in 0..3 {
            pool.add_page(i, 0, PageData::Deferred { offset: i as u64 * 4, len: 4 })
                .unwrap();
        }
        assert_eq!(pool.resident_pages(), 0);

        assert_eq!(pool.page_slice(1).unwrap(), &[1, 2, 3]);
        assert_eq!(pool.page_slice(4).unwrap()[0], 4);
        assert_eq!(pool.resident_pages(), 2);

        // page 0 is least recently used and goes
        assert_eq!(pool.page_slice(8).unwrap()[0], 8);
        assert_eq!(pool.resident_pages(), 2);
        assert!(pool.pages[0].data.is_none());
        assert!(pool.pages[1].data.is_some());
    }

    #[test]
    fn pinned_pages_survive_eviction() {
        let image: Vec<u8> = (0..12).collect();
        let mut pool = PagedPool::new(CODE_POOL, shared(image), 1);
        pool.define(3, 4).unwrap();
        for i in 0..3 {
            pool.add_page(i, 0, PageData::Deferred { offset: i as u64 * 4, len: 4 })
                .unwrap();
        }
        pool.page_slice(0).unwrap();
        pool.pin(0);
        pool.page_slice(4).unwrap();
        assert!(pool.pages[0].data.is_some(), "pinned page kept");
        assert_eq!(pool.resident_pages(), 2, "limit exceeded while pinned");

        pool.unpin(0);
        pool.page_slice(8).unwrap();
        assert!(pool.pages[0].data.is_none());
    }

    #[test]
    fn paged_pool_rejects_masked_pages() {
        let mut pool = PagedPool::new(CODE_POOL, shared(vec![0; 4]), 4);
        pool.define(1, 4).unwrap();
        let err = pool
            .add_page(0, 0x5a, PageData::Deferred { offset: 0, len: 4 })
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MaskedImageNotSupported);
    }

    #[test]
    fn constant_strings_and_lists() {
        let mut pools = Pools::new(PoolMode::InMemory, None);
        pools.define(CONST_POOL, 1, 64).unwrap();
        let mut page = vec![2, 0, b'h', b'i'];
        page.extend_from_slice(&[2, 0]);
        page.extend_from_slice(&Value::Int(7).to_portable().unwrap());
        page.extend_from_slice(&Value::True.to_portable().unwrap());
        pools
            .get(CONST_POOL)
            .unwrap()
            .add_page(0, 0, PageData::Bytes(page))
            .unwrap();

        assert_eq!(pools.read_string(0).unwrap(), "hi");
        assert_eq!(pools.read_list(4).unwrap(), vec![Value::Int(7), Value::True]);
        assert!(pools.read_string(5).is_err());
        assert!(pools.define(CONST_POOL, 1, 64).is_err(), "defined twice");
    }
}
