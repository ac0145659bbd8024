//! What the VM needs from its embedding: output, a clock, error reporting,
//! files for saved states, and a way to be interrupted.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

pub trait Host {
    fn write_output(&mut self, text: &str);

    /// Milliseconds since some fixed point in the past.
    fn get_time_ms(&self) -> u64;

    /// Called once for an error that ends a run.
    fn report_error(&mut self, message: &str);

    fn open_read(&mut self, name: &str) -> io::Result<Box<dyn Read>>;
    fn open_write(&mut self, name: &str) -> io::Result<Box<dyn Write>>;
}

/// Process stdout and the local filesystem.
pub struct StdHost {
    started: Instant,
}

impl StdHost {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for StdHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for StdHost {
    fn write_output(&mut self, text: &str) {
        let mut out = io::stdout().lock();
        if let Err(e) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
            log::warn!("output failed: {e}");
        }
    }

    fn get_time_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn report_error(&mut self, message: &str) {
        eprintln!("{message}");
    }

    fn open_read(&mut self, name: &str) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(BufReader::new(File::open(name)?)))
    }

    fn open_write(&mut self, name: &str) -> io::Result<Box<dyn Write>> {
        Ok(Box::new(BufWriter::new(File::create(name)?)))
    }
}

type Files = Arc<Mutex<ahash::AHashMap<String, Vec<u8>>>>;

/// Collects output in memory. Saved states go to named in-memory buffers.
/// Clones share everything, so a host can keep a view after handing the
/// original to a VM.
#[derive(Default, Clone)]
pub struct BufferHost {
    output: Arc<Mutex<String>>,
    errors: Arc<Mutex<Vec<String>>>,
    files: Files,
}

impl BufferHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> String {
        self.output.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).cloned()
    }
}

/// Writer that stores its bytes under a name when dropped.
struct NamedBuffer {
    name: String,
    data: Vec<u8>,
    files: Files,
}

impl Write for NamedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.files
            .lock()
            .insert(self.name.clone(), self.data.clone());
        Ok(())
    }
}

impl Drop for NamedBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.files.lock().insert(std::mem::take(&mut self.name), data);
    }
}

impl Host for BufferHost {
    fn write_output(&mut self, text: &str) {
        self.output.lock().push_str(text);
    }

    fn get_time_ms(&self) -> u64 {
        0
    }

    fn report_error(&mut self, message: &str) {
        self.errors.lock().push(message.to_string());
    }

    fn open_read(&mut self, name: &str) -> io::Result<Box<dyn Read>> {
        match self.files.lock().get(name) {
            Some(data) => Ok(Box::new(io::Cursor::new(data.clone()))),
            None => Err(io::Error::new(io::ErrorKind::NotFound, name.to_string())),
        }
    }

    fn open_write(&mut self, name: &str) -> io::Result<Box<dyn Write>> {
        Ok(Box::new(NamedBuffer {
            name: name.to_string(),
            data: Vec::new(),
            files: Arc::clone(&self.files),
        }))
    }
}

// ── Signals ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Quit,
    Abort,
    Restart,
}

impl Signal {
    pub fn name(self) -> &'static str {
        match self {
            Signal::Quit => "quit",
            Signal::Abort => "abort",
            Signal::Restart => "restart",
        }
    }
}

/// Cloneable handle a host (or another thread) uses to stop a running VM.
/// Checked by the interpreter at every instruction boundary.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    pending: Arc<Mutex<Option<Signal>>>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `signal`. `Abort` takes precedence over anything pending.
    pub fn signal(&self, signal: Signal) {
        let mut pending = self.pending.lock();
        if *pending != Some(Signal::Abort) {
            *pending = Some(signal);
        }
    }

    pub fn take(&self) -> Option<Signal> {
        self.pending.lock().take()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn abort_wins_over_later_signals() {
        let handle = InterruptHandle::new();
        let remote = handle.clone();
        remote.signal(Signal::Abort);
        handle.signal(Signal::Quit);
        assert!(handle.is_pending());
        assert_eq!(handle.take(), Some(Signal::Abort));
        assert_eq!(handle.take(), None);
    }

    #[test]
    fn buffer_host_files_round_trip() {
        let mut host = BufferHost::new();
        let view = host.clone();
        {
            let mut w = host.open_write("slot1").unwrap();
            w.write_all(b"state").unwrap();
        }
        let mut data = Vec::new();
        host.open_read("slot1").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"state");
        assert_eq!(view.file("slot1").as_deref(), Some(&b"state"[..]));
        host.write_output("hi");
        assert_eq!(view.output(), "hi");
        assert!(host.open_read("slot2").is_err());
    }
}
