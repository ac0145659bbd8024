//! Saved states.
//!
//! A saved state is every live object plus the globals, tied to the image
//! it came from by the image's SHA-256 identity. Stack contents and undo
//! history are not saved.
//!
//! ```text
//! signature   "T3-state\r\n\x1a"
//! version     u16
//! identity    [u8; 32]
//! objects     u32 count, then per object:
//!               index u32, generation u32, persistent u8,
//!               metaclass name (u8 length + bytes), body
//! globals     u16 count, then values
//! checksum    SHA-256 of everything above
//! ```
//!
//! A value is a `u8` type tag and an 8-byte payload.

use std::io::{self, Read, Write};

use ahash::AHashSet;
use object::{
    Body, DataType, Object, ObjectId, PropId, PropTable, TadsObject, Value, Visitable,
};
use sha2::{Digest, Sha256};

use crate::VM;
use crate::codec::{ByteReader, write_u8, write_u16, write_u32, write_u64};
use crate::error::{ErrorCode, VmError, VmResult};
use crate::metaclass::MetaKind;

pub const STATE_SIGNATURE: &[u8; 11] = b"T3-state\r\n\x1a";
pub const STATE_VERSION: u16 = 1;

const DIGEST_SIZE: usize = 32;

/// Passes everything through to `inner` while hashing it.
struct HashingWriter<'a> {
    inner: &'a mut dyn Write,
    hasher: Sha256,
}

impl Write for HashingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn save_io(e: io::Error) -> VmError {
    VmError::new(ErrorCode::SaveFileIo).arg(e)
}

fn corrupt(why: impl std::fmt::Display) -> VmError {
    VmError::new(ErrorCode::CorruptSavedState).arg(why)
}

// ── Save ──────────────────────────────────────────────────────────────

/// Collect garbage, then write the state. The stack and undo history are
/// left out.
pub(crate) fn save(vm: &mut VM, w: &mut dyn Write) -> VmResult<()> {
    // Unreachable cycles would otherwise be written out and restored.
    vm.collect_garbage();
    let mut out = HashingWriter {
        inner: w,
        hasher: Sha256::new(),
    };
    write_state(vm, &mut out).map_err(save_io)?;
    let digest = out.hasher.finalize();
    out.inner.write_all(&digest).map_err(save_io)?;
    out.inner.flush().map_err(save_io)?;
    log::info!("saved state: {} objects", vm.heap.live_count());
    Ok(())
}

fn write_state(vm: &VM, w: &mut dyn Write) -> io::Result<()> {
    w.write_all(STATE_SIGNATURE)?;
    write_u16(w, STATE_VERSION)?;
    w.write_all(&vm.identity)?;

    let ids: Vec<ObjectId> = vm.heap.ids().collect();
    write_u32(w, ids.len() as u32)?;
    for id in ids {
        let Some(object) = vm.heap.get(id) else {
            continue;
        };
        let name = vm
            .metaclasses
            .get(object.metaclass())
            .map_or("", |m| m.name());
        write_u32(w, id.index)?;
        write_u32(w, id.generation)?;
        write_u8(w, vm.heap.is_persistent(id) as u8)?;
        write_u8(w, name.len() as u8)?;
        w.write_all(name.as_bytes())?;
        write_body(w, &object.body)?;
    }

    write_u16(w, vm.globals.len() as u16)?;
    for &v in &vm.globals {
        write_value(w, v)?;
    }
    Ok(())
}

fn write_body(w: &mut dyn Write, body: &Body) -> io::Result<()> {
    match body {
        Body::Tads(tads) => {
            write_u16(w, tads.superclasses.len() as u16)?;
            for sc in &tads.superclasses {
                write_u32(w, sc.index)?;
                write_u32(w, sc.generation)?;
            }
            write_u16(w, tads.props.len() as u16)?;
            for (prop, value) in tads.props.iter() {
                write_u16(w, prop.0)?;
                write_value(w, value)?;
            }
        }
        Body::List(items) | Body::Vector(items) => {
            write_u32(w, items.len() as u32)?;
            for &v in items {
                write_value(w, v)?;
            }
        }
        Body::Str(text) => {
            write_u32(w, text.len() as u32)?;
            w.write_all(text.as_bytes())?;
        }
        Body::LookupTable(entries) => {
            write_u32(w, entries.len() as u32)?;
            for &(k, v) in entries {
                write_value(w, k)?;
                write_value(w, v)?;
            }
        }
    }
    Ok(())
}

fn write_value(w: &mut dyn Write, value: Value) -> io::Result<()> {
    let payload = match value {
        Value::Empty | Value::Nil | Value::True => 0,
        Value::Int(n) => n as u32 as u64,
        Value::Float(x) => x.to_bits(),
        Value::Obj(id) => id.index as u64 | (id.generation as u64) << 32,
        Value::Prop(p) => p.0 as u64,
        Value::FuncPtr(o) | Value::CodeOfs(o) | Value::SString(o) | Value::List(o) => o as u64,
    };
    write_u8(w, value.data_type() as u8)?;
    write_u64(w, payload)
}

// ── Restore ───────────────────────────────────────────────────────────

struct SavedObject {
    id: ObjectId,
    persistent: bool,
    object: Object,
}

pub(crate) fn restore(vm: &mut VM, r: &mut dyn Read) -> VmResult<()> {
    let mut bytes = Vec::new();
    r.read_to_end(&mut bytes).map_err(save_io)?;
    let (objects, globals) = parse(vm, &bytes)?;
    apply(vm, objects, globals)
}

/// Decode and check a saved state without touching the VM.
fn parse(vm: &VM, bytes: &[u8]) -> VmResult<(Vec<SavedObject>, Vec<Value>)> {
    if !bytes.starts_with(STATE_SIGNATURE) {
        return Err(VmError::new(ErrorCode::NotSavedState));
    }
    let mut r = ByteReader::new(&bytes[STATE_SIGNATURE.len()..], corrupt("truncated"));
    let version = r.u16()?;
    if version != STATE_VERSION {
        return Err(VmError::new(ErrorCode::IncompatibleSavedState)
            .arg(format!("format version {version}")));
    }
    if bytes.len() < STATE_SIGNATURE.len() + 2 + 2 * DIGEST_SIZE {
        return Err(corrupt("truncated"));
    }
    let (content, digest) = bytes.split_at(bytes.len() - DIGEST_SIZE);
    if Sha256::digest(content).as_slice() != digest {
        return Err(corrupt("checksum mismatch"));
    }
    let mut r = ByteReader::new(&content[STATE_SIGNATURE.len() + 2..], corrupt("truncated"));
    if r.bytes(DIGEST_SIZE)? != vm.identity {
        return Err(VmError::new(ErrorCode::WrongSavedState));
    }

    let count = r.u32()? as usize;
    let mut objects = Vec::with_capacity(count.min(r.remaining()));
    let mut indexes = AHashSet::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        let id = ObjectId::new(r.u32()?, r.u32()?);
        vm.heap
            .check_restorable(id)
            .map_err(|e| corrupt(VmError::from(e).message()))?;
        if !indexes.insert(id.index) {
            return Err(corrupt(format!("object id {} appears more than once", id.index)));
        }
        let persistent = r.u8()? != 0;
        let name = r.name()?;
        let meta = vm.metaclasses.id_by_name(&name).ok_or_else(|| {
            VmError::new(ErrorCode::IncompatibleSavedState)
                .arg(format!("metaclass {name:?} is not loaded"))
        })?;
        let kind = vm.metaclasses.get(meta).map(|m| m.desc.kind);
        let body = read_body(&mut r, kind)?;
        objects.push(SavedObject {
            id,
            persistent,
            object: Object::new(meta, body),
        });
    }
    let global_count = r.u16()? as usize;
    let globals = (0..global_count)
        .map(|_| read_value(&mut r))
        .collect::<VmResult<Vec<_>>>()?;
    if !r.is_empty() {
        return Err(corrupt("trailing data"));
    }

    let known: AHashSet<ObjectId> = objects.iter().map(|o| o.id).collect();
    let dangling = |v: Value| v.as_obj().is_some_and(|id| !known.contains(&id));
    for saved in &objects {
        let mut bad = false;
        saved.object.visit_edges(&mut |v: Value| bad |= dangling(v));
        if bad {
            return Err(corrupt(format!("object {:?} refers to a missing object", saved.id)));
        }
    }
    if globals.iter().any(|&v| dangling(v)) {
        return Err(corrupt("a global refers to a missing object"));
    }
    Ok((objects, globals))
}

fn read_body(r: &mut ByteReader<'_>, kind: Option<MetaKind>) -> VmResult<Body> {
    Ok(match kind {
        Some(MetaKind::TadsObject) => {
            let count = r.u16()? as usize;
            let mut superclasses = Vec::with_capacity(count);
            for _ in 0..count {
                superclasses.push(ObjectId::new(r.u32()?, r.u32()?));
            }
            let count = r.u16()? as usize;
            let mut props = PropTable::with_capacity(count);
            for _ in 0..count {
                let prop = PropId(r.u16()?);
                props.set(prop, read_value(r)?);
            }
            Body::Tads(TadsObject {
                superclasses,
                props,
            })
        }
        Some(MetaKind::List) => Body::List(read_values(r)?),
        Some(MetaKind::Vector) => Body::Vector(read_values(r)?),
        Some(MetaKind::Str) => {
            let len = r.u32()? as usize;
            Body::Str(r.str(len)?)
        }
        Some(MetaKind::LookupTable) => {
            let count = r.u32()? as usize;
            let mut entries = Vec::with_capacity(count.min(r.remaining()));
            for _ in 0..count {
                entries.push((read_value(r)?, read_value(r)?));
            }
            Body::LookupTable(entries)
        }
        None => return Err(corrupt("bad metaclass")),
    })
}

fn read_values(r: &mut ByteReader<'_>) -> VmResult<Vec<Value>> {
    let count = r.u32()? as usize;
    let mut items = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        items.push(read_value(r)?);
    }
    Ok(items)
}

fn read_value(r: &mut ByteReader<'_>) -> VmResult<Value> {
    let tag = r.u8()?;
    let payload = r.u64()?;
    let low = payload as u32;
    let data_type = DataType::from_u8(tag).ok_or_else(|| corrupt(format!("value tag {tag}")))?;
    Ok(match data_type {
        DataType::Empty => Value::Empty,
        DataType::Nil => Value::Nil,
        DataType::True => Value::True,
        DataType::Int => Value::Int(low as i32),
        DataType::Float => Value::Float(f64::from_bits(payload)),
        DataType::Obj => Value::Obj(ObjectId::new(low, (payload >> 32) as u32)),
        DataType::Prop => Value::Prop(PropId(low as u16)),
        DataType::FuncPtr => Value::FuncPtr(low),
        DataType::CodeOfs => Value::CodeOfs(low),
        DataType::SString => Value::SString(low),
        DataType::List => Value::List(low),
    })
}

/// Replace the object graph and globals. Stack values and frame
/// references to objects that no longer exist are scrubbed. `parse` has
/// already checked every id, so no insert can fail once the heap is cleared.
fn apply(vm: &mut VM, objects: Vec<SavedObject>, globals: Vec<Value>) -> VmResult<()> {
    let count = objects.len();
    vm.heap.clear();
    for saved in objects {
        vm.heap
            .insert_restored(saved.id, saved.object, saved.persistent)
            .map_err(|e| corrupt(VmError::from(e).message()))?;
    }
    vm.heap.seal();

    vm.globals.fill(Value::Nil);
    for (slot, v) in vm.globals.iter_mut().zip(globals) {
        *slot = v;
    }

    let heap = &vm.heap;
    let live = |v: Value| match v {
        Value::Obj(id) if !heap.contains(id) => Value::Nil,
        v => v,
    };
    for v in vm.stack.values_mut() {
        *v = live(*v);
    }
    for frame in vm.stack.frames_mut() {
        frame.self_val = live(frame.self_val);
        frame.defining = frame.defining.filter(|&d| heap.contains(d));
    }
    vm.result = live(vm.result);
    vm.raised.clear();

    vm.rebuild_counts();
    log::info!("restored state: {count} objects");
    Ok(())
}

impl VM {
    /// Save to the host file `name`.
    pub(crate) fn save_to_host(&mut self, name: &str) -> VmResult<()> {
        let mut w = self.host.open_write(name).map_err(save_io)?;
        save(self, &mut *w)
    }

    /// Restore from the host file `name`.
    pub(crate) fn restore_from_host(&mut self, name: &str) -> VmResult<()> {
        let mut r = self.host.open_read(name).map_err(save_io)?;
        restore(self, &mut *r)
    }
}
