//! A virtual machine for T3 image files.
//!
//! [`VM::load_image`] reads an image, resolving its metaclass and function
//! set dependencies and defining its persistent objects. [`VM::run`] then
//! executes the entrypoint until it returns, the program quits, or a fatal
//! error ends the run.

pub(crate) mod codec;
pub mod dependency;
pub mod error;
pub mod host;
pub mod image;
pub(crate) mod interpreter;
pub mod intrinsics;
pub mod metaclass;
pub mod pool;
pub mod stack;
pub mod state;
mod values;
pub mod writer;

use std::cell::RefCell;
use std::io::{Read, Seek, Write};
use std::rc::Rc;

use ahash::AHashMap;
use heap::{GcStats, Heap, HeapSettings, RootProvider};
use object::{Object, ObjectId, SpecialObjects, Value};

pub use error::{ErrorCode, ErrorMessages, VmError, VmResult};
pub use host::{BufferHost, Host, InterruptHandle, Signal, StdHost};
pub use image::{EntryPoint, ImageInfo};
pub use pool::PoolMode;
pub use stack::StackSettings;
pub use writer::ImageWriter;

use interpreter::Halt;
use intrinsics::FunctionSetTable;
use metaclass::MetaclassTable;
use pool::{Pools, SharedSource};
use stack::Stack;

/// Everything needed to create a VM besides the image and the host.
#[derive(Debug, Clone)]
pub struct VMCreateInfo {
    pub heap: HeapSettings,
    pub stack: StackSettings,
    pub pool_mode: PoolMode,
    /// Number of global variable slots.
    pub globals: usize,
    /// Arguments handed to the entrypoint.
    pub args: Vec<String>,
    pub messages: ErrorMessages,
}

impl Default for VMCreateInfo {
    fn default() -> Self {
        Self {
            heap: HeapSettings::default(),
            stack: StackSettings::default(),
            pool_mode: PoolMode::InMemory,
            globals: 256,
            args: Vec::new(),
            messages: ErrorMessages::new(),
        }
    }
}

impl VMCreateInfo {
    pub fn validate(&self) -> Result<(), &'static str> {
        self.heap.validate()?;
        self.stack.validate()?;
        self.pool_mode.validate()?;
        if self.globals > u16::MAX as usize {
            return Err("globals must fit in a u16 index");
        }
        Ok(())
    }
}

/// How a run ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitStatus {
    /// The entrypoint returned this value. It stays valid until the next
    /// run or call.
    Completed(Value),
    Quit,
    Aborted,
}

pub struct VM {
    pub(crate) heap: Heap,
    pub(crate) pools: Pools,
    pub(crate) metaclasses: MetaclassTable,
    pub(crate) function_sets: FunctionSetTable,
    pub(crate) stack: Stack,
    pub(crate) globals: Vec<Value>,
    pub(crate) special: SpecialObjects,
    pub(crate) exports: AHashMap<String, Value>,
    pub(crate) identity: [u8; 32],
    pub(crate) entry: EntryPoint,
    /// Persistent objects as loaded, for restart.
    pub(crate) initial_objects: Vec<(u32, Object)>,
    pub(crate) image_info: ImageInfo,
    pub(crate) host: Box<dyn Host>,
    pub(crate) interrupt: InterruptHandle,
    pub(crate) messages: ErrorMessages,
    pub(crate) args: Vec<String>,
    /// Owned result of the last run or call.
    pub(crate) result: Value,
    /// Exceptions the VM created, with the errors they stand for.
    pub(crate) raised: AHashMap<ObjectId, VmError>,
}

/// Roots the interpreter holds outside the object table.
struct VmRoots<'a> {
    stack: &'a Stack,
    globals: &'a [Value],
    exports: &'a AHashMap<String, Value>,
    result: Value,
}

impl RootProvider for VmRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Value)) {
        self.stack.visit_values(visitor);
        for &v in self.globals {
            visitor(v);
        }
        for &v in self.exports.values() {
            visitor(v);
        }
        visitor(self.result);
    }
}

impl VM {
    /// Load an image and build a VM around it. In paged mode the reader
    /// stays attached to fetch pool pages on demand.
    pub fn load_image<R: Read + Seek + 'static>(
        reader: R,
        info: VMCreateInfo,
        host: Box<dyn Host>,
    ) -> VmResult<VM> {
        info.validate()
            .map_err(|why| VmError::new(ErrorCode::BadArgument).arg(why))?;
        let source: SharedSource = Rc::new(RefCell::new(reader));
        let mut pools = Pools::new(info.pool_mode, Some(Rc::clone(&source)));
        let image = {
            let mut src = source.borrow_mut();
            image::load(&mut *src, &mut pools, info.heap.clone())?
        };
        image::check_entry(&mut pools, &image.entry)?;
        Ok(VM {
            heap: image.heap,
            pools,
            metaclasses: image.metaclasses,
            function_sets: image.function_sets,
            stack: Stack::new(info.stack),
            globals: vec![Value::Nil; info.globals],
            special: image.special,
            exports: image.exports,
            identity: image.info.identity,
            entry: image.entry,
            initial_objects: image.initial_objects,
            image_info: image.info,
            host,
            interrupt: InterruptHandle::new(),
            messages: info.messages,
            args: info.args,
            result: Value::Nil,
            raised: AHashMap::new(),
        })
    }

    // ── Execution ──────────────────────────────────────────────────

    /// Run the entrypoint. A restart request reloads the initial objects
    /// and runs it again.
    pub fn run(&mut self) -> VmResult<ExitStatus> {
        loop {
            let outcome = self.start();
            interpreter::discard_frames(self, 0);
            self.raised.clear();
            match outcome {
                Ok(value) => {
                    log::info!("entrypoint returned {value:?}");
                    self.set_result(value);
                    return Ok(ExitStatus::Completed(value));
                }
                Err(Halt::Signal(Signal::Restart)) => {
                    log::info!("restarting");
                    self.restart()?;
                }
                Err(Halt::Signal(Signal::Quit)) => return Ok(ExitStatus::Quit),
                Err(Halt::Signal(Signal::Abort)) => return Ok(ExitStatus::Aborted),
                Err(Halt::Error(e)) => {
                    let message = self.messages.format(&e);
                    log::error!("run failed: {message}");
                    self.host.report_error(&message);
                    return Err(e);
                }
            }
        }
    }

    fn start(&mut self) -> Result<Value, Halt> {
        interpreter::discard_frames(self, 0);
        let spent = self.stack.truncate(0);
        self.heap.release_values(spent);

        let entry = self.entry.code_ofs;
        let header = interpreter::read_header(self, entry)?;
        let argc = if header.accepts(1) {
            let mut items = Vec::with_capacity(self.args.len());
            for arg in self.args.clone() {
                items.push(self.new_string(arg)?);
            }
            let list = self.new_list(&items);
            self.heap.release_values(items);
            self.stack
                .push(list?)
                .map_err(|(_, v)| {
                    self.heap.release_value(v);
                    VmError::new(ErrorCode::StackOverflow)
                })?;
            1
        } else {
            0
        };
        interpreter::enter(self, entry, argc, Value::Nil, None, None).map_err(fault_to_halt)?;
        interpreter::execute(self, 0)
    }

    /// Put the object graph back the way the image defined it.
    fn restart(&mut self) -> VmResult<()> {
        self.heap.clear();
        for (id, object) in self.initial_objects.clone() {
            self.heap.define_persistent(id, object)?;
        }
        self.heap.seal();
        self.globals.fill(Value::Nil);
        self.result = Value::Nil;
        Ok(())
    }

    /// Call an exported function with `args`. The result stays valid until
    /// the next run or call.
    pub fn call_function(&mut self, name: &str, args: &[Value]) -> VmResult<Value> {
        let func = match self.exports.get(name) {
            Some(&Value::FuncPtr(ofs)) => ofs,
            _ => return Err(VmError::new(ErrorCode::NoSuchFunction).arg(name)),
        };
        let floor = self.stack.depth();
        let base = self.stack.len();
        for &v in args {
            let v = self.owned(v);
            if let Err((_, v)) = self.stack.push(v) {
                self.heap.release_value(v);
                let spent = self.stack.truncate(base);
                self.heap.release_values(spent);
                return Err(VmError::new(ErrorCode::StackOverflow));
            }
        }
        if let Err(fault) = interpreter::enter(self, func, args.len(), Value::Nil, None, None) {
            let spent = self.stack.truncate(base);
            self.heap.release_values(spent);
            return Err(fault_to_error(fault));
        }
        match interpreter::execute(self, floor) {
            Ok(value) => {
                self.set_result(value);
                Ok(value)
            }
            Err(halt) => {
                interpreter::discard_frames(self, floor);
                Err(match halt {
                    Halt::Error(e) => e,
                    Halt::Signal(s) => VmError::new(ErrorCode::Interrupted).arg(s.name()),
                })
            }
        }
    }

    fn set_result(&mut self, value: Value) {
        let old = std::mem::replace(&mut self.result, value);
        self.heap.release_value(old);
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    // ── Saved states ───────────────────────────────────────────────

    /// Write every live object and the globals, after a collection. The
    /// operand stack, call frames and undo history are not saved, so a
    /// restore starts with no savepoints.
    pub fn save_state(&mut self, w: &mut dyn Write) -> VmResult<()> {
        state::save(self, w)
    }

    /// Replace all objects and globals with a saved state made from the
    /// same image. Nothing changes if the state is rejected.
    pub fn restore_state(&mut self, r: &mut dyn Read) -> VmResult<()> {
        state::restore(self, r)
    }

    // ── Memory ─────────────────────────────────────────────────────

    pub fn collect_garbage(&mut self) -> GcStats {
        let mut roots = VmRoots {
            stack: &self.stack,
            globals: &self.globals,
            exports: &self.exports,
            result: self.result,
        };
        let stats = self.heap.collect(&mut roots);
        let heap = &self.heap;
        self.raised.retain(|&id, _| heap.contains(id));
        log::debug!(
            "gc: marked {}, freed {}, live {}",
            stats.marked,
            stats.freed,
            stats.live
        );
        stats
    }

    pub(crate) fn rebuild_counts(&mut self) {
        let mut roots = VmRoots {
            stack: &self.stack,
            globals: &self.globals,
            exports: &self.exports,
            result: self.result,
        };
        self.heap.rebuild_counts(&mut roots);
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn image_info(&self) -> &ImageInfo {
        &self.image_info
    }

    pub fn metaclasses(&self) -> &MetaclassTable {
        &self.metaclasses
    }

    pub fn function_sets(&self) -> &FunctionSetTable {
        &self.function_sets
    }

    pub fn special(&self) -> &SpecialObjects {
        &self.special
    }

    pub fn export(&self, name: &str) -> Option<Value> {
        self.exports.get(name).copied()
    }

    pub fn global(&self, index: usize) -> Option<Value> {
        self.globals.get(index).copied()
    }

    pub fn format_error(&self, e: &VmError) -> String {
        self.messages.format(e)
    }
}

fn fault_to_error(fault: error::Fault) -> VmError {
    match fault {
        error::Fault::Error(e) => e,
        error::Fault::Thrown(v) => VmError::internal(format!("exception {v:?} outside a frame")),
    }
}

fn fault_to_halt(fault: error::Fault) -> Halt {
    Halt::Error(fault_to_error(fault))
}
