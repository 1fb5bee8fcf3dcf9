//! Named output streams with speculative buffering.
//!
//! Objects write text or bytes to named streams (a trace file, a results
//! table). Under optimistic execution a write may come from an event that
//! is later rolled back, so the registry holds writes back until GVT has
//! passed their timestamp and discards the ones a rollback undoes. Committed
//! writes reach the sink in event order, which makes the output identical to
//! a sequential run of the same model.
//!
//! The sequential dispatcher uses an *immediate* registry: there is nothing
//! to roll back, so writes go straight to the sink.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{KernelError, KernelResult};
use crate::event::EventKey;
use crate::object::ObjectId;
use crate::time::VirtualTime;

/// Opens the sink behind a stream the first time the name is used.
pub type SinkFactory = Box<dyn Fn(&str) -> io::Result<Box<dyn Write + Send>> + Send + Sync>;

#[derive(Debug)]
struct PendingWrite {
    object: ObjectId,
    source: Option<EventKey>,
    time: VirtualTime,
    bytes: Vec<u8>,
}

struct StreamInner {
    sink: Box<dyn Write + Send>,
    pending: Vec<PendingWrite>,
}

/// One named output stream. Shared by every object that writes to it.
pub struct OutputStream {
    name: String,
    speculative: bool,
    inner: Mutex<StreamInner>,
}

impl OutputStream {
    /// The stream's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of writes waiting for commit.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub(crate) fn write(
        &self,
        object: ObjectId,
        source: Option<EventKey>,
        time: VirtualTime,
        bytes: &[u8],
    ) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        if self.speculative {
            inner.pending.push(PendingWrite {
                object,
                source,
                time,
                bytes: bytes.to_vec(),
            });
            Ok(())
        } else {
            inner.sink.write_all(bytes).map_err(|e| self.io_error(e))
        }
    }

    /// Drop `object`'s writes made by events at or after `from`.
    fn rollback(&self, object: ObjectId, from: &EventKey) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.pending.len();
        inner
            .pending
            .retain(|w| w.object != object || w.source.map_or(true, |k| k < *from));
        before - inner.pending.len()
    }

    /// Write out everything strictly before `gvt`, in event order.
    fn commit(&self, gvt: VirtualTime) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        let (mut ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.pending)
            .into_iter()
            .partition(|w| w.time < gvt);
        inner.pending = waiting;
        if ready.is_empty() {
            return Ok(0);
        }
        // Stable: writes from one handler keep their order.
        ready.sort_by_key(|w| w.source);
        for w in &ready {
            inner.sink.write_all(&w.bytes).map_err(|e| self.io_error(e))?;
        }
        inner.sink.flush().map_err(|e| self.io_error(e))?;
        Ok(ready.len())
    }

    fn io_error(&self, source: io::Error) -> KernelError {
        KernelError::Stream {
            name: self.name.clone(),
            source,
        }
    }
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStream")
            .field("name", &self.name)
            .field("speculative", &self.speculative)
            .field("pending", &self.pending_len())
            .finish()
    }
}

// ── Registry ──────────────────────────────────────────────────────────

/// Process-wide set of output streams, one per distinct name.
pub struct StreamRegistry {
    factory: SinkFactory,
    speculative: bool,
    streams: RwLock<HashMap<String, Arc<OutputStream>>>,
}

impl StreamRegistry {
    /// Registry for optimistic execution: writes wait for GVT.
    pub fn speculative(factory: SinkFactory) -> Self {
        Self::with_mode(factory, true)
    }

    /// Registry that writes through immediately.
    pub fn immediate(factory: SinkFactory) -> Self {
        Self::with_mode(factory, false)
    }

    fn with_mode(factory: SinkFactory, speculative: bool) -> Self {
        StreamRegistry {
            factory,
            speculative,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Registry that discards everything.
    pub fn discard() -> Self {
        Self::immediate(discard_sinks())
    }

    /// Whether writes are held back until commit.
    pub fn is_speculative(&self) -> bool {
        self.speculative
    }

    /// The stream called `name`, opening it on first use.
    pub fn stream(&self, name: &str) -> KernelResult<Arc<OutputStream>> {
        if let Some(stream) = self.streams.read().get(name) {
            return Ok(Arc::clone(stream));
        }
        let mut streams = self.streams.write();
        if let Some(stream) = streams.get(name) {
            return Ok(Arc::clone(stream));
        }
        let sink = (self.factory)(name).map_err(|source| KernelError::Stream {
            name: name.to_string(),
            source,
        })?;
        debug!(stream = name, "opened output stream");
        let stream = Arc::new(OutputStream {
            name: name.to_string(),
            speculative: self.speculative,
            inner: Mutex::new(StreamInner {
                sink,
                pending: Vec::new(),
            }),
        });
        streams.insert(name.to_string(), Arc::clone(&stream));
        Ok(stream)
    }

    /// Names of all opened streams, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Discard `object`'s uncommitted writes at or after `from`.
    pub fn rollback(&self, object: ObjectId, from: &EventKey) -> usize {
        self.snapshot()
            .iter()
            .map(|s| s.rollback(object, from))
            .sum()
    }

    /// Flush every write older than `gvt` to its sink.
    pub fn commit(&self, gvt: VirtualTime) -> KernelResult<usize> {
        let mut written = 0;
        for stream in self.snapshot() {
            written += stream.commit(gvt)?;
        }
        Ok(written)
    }

    /// Flush everything still pending.
    pub fn commit_all(&self) -> KernelResult<usize> {
        self.commit(VirtualTime::INFINITY)
    }

    fn snapshot(&self) -> Vec<Arc<OutputStream>> {
        self.streams.read().values().cloned().collect()
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("speculative", &self.speculative)
            .field("streams", &self.names())
            .finish()
    }
}

// ── Sinks ─────────────────────────────────────────────────────────────

/// Sink factory that creates `<dir>/<name>` files.
pub fn file_sinks(dir: impl Into<PathBuf>) -> SinkFactory {
    let dir = dir.into();
    Box::new(move |name: &str| {
        let file = std::fs::File::create(dir.join(name))?;
        Ok(Box::new(io::BufWriter::new(file)) as Box<dyn Write + Send>)
    })
}

/// Sink factory whose sinks drop every byte.
pub fn discard_sinks() -> SinkFactory {
    Box::new(|_: &str| Ok(Box::new(io::sink()) as Box<dyn Write + Send>))
}

/// In-memory sinks, readable after the run.
#[derive(Debug, Clone, Default)]
pub struct MemorySinks {
    buffers: Arc<Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>>,
}

struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MemorySinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose sinks write into this collection.
    pub fn factory(&self) -> SinkFactory {
        let buffers = Arc::clone(&self.buffers);
        Box::new(move |name: &str| {
            let buffer = Arc::clone(buffers.lock().entry(name.to_string()).or_default());
            Ok(Box::new(MemorySink(buffer)) as Box<dyn Write + Send>)
        })
    }

    /// Bytes written to `name` so far.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.buffers.lock().get(name).map(|b| b.lock().clone())
    }

    /// Contents of `name` as UTF-8 text.
    pub fn text(&self, name: &str) -> Option<String> {
        self.contents(name)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    /// Number of sinks opened.
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Polarity;

    fn key(t: u64, sender: u32, seq: u64) -> EventKey {
        EventKey {
            receive_time: VirtualTime::new(t),
            polarity: Polarity::Positive,
            sender: ObjectId::new(sender),
            sequence: seq,
        }
    }

    fn write(reg: &StreamRegistry, name: &str, obj: u32, t: u64, text: &str) {
        reg.stream(name)
            .unwrap()
            .write(ObjectId::new(obj), Some(key(t, 9, t)), VirtualTime::new(t), text.as_bytes())
            .unwrap();
    }

    #[test]
    fn test_one_stream_per_name() {
        let sinks = MemorySinks::new();
        let reg = StreamRegistry::speculative(sinks.factory());
        let a = reg.stream("trace").unwrap();
        let b = reg.stream("trace").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        reg.stream("other").unwrap();
        assert_eq!(sinks.len(), 2);
        assert_eq!(reg.names(), vec!["other".to_string(), "trace".to_string()]);
    }

    #[test]
    fn test_commit_only_before_gvt_in_event_order() {
        let sinks = MemorySinks::new();
        let reg = StreamRegistry::speculative(sinks.factory());
        write(&reg, "out", 1, 7, "b");
        write(&reg, "out", 0, 3, "a");
        write(&reg, "out", 0, 12, "c");
        assert_eq!(reg.commit(VirtualTime::new(10)).unwrap(), 2);
        assert_eq!(sinks.text("out").unwrap(), "ab");
        assert_eq!(reg.stream("out").unwrap().pending_len(), 1);
        reg.commit_all().unwrap();
        assert_eq!(sinks.text("out").unwrap(), "abc");
    }

    #[test]
    fn test_rollback_discards_only_later_writes_of_object() {
        let sinks = MemorySinks::new();
        let reg = StreamRegistry::speculative(sinks.factory());
        write(&reg, "out", 0, 5, "keep ");
        write(&reg, "out", 0, 9, "drop ");
        write(&reg, "out", 1, 9, "other ");
        assert_eq!(reg.rollback(ObjectId::new(0), &key(6, 0, 0)), 1);
        reg.commit_all().unwrap();
        assert_eq!(sinks.text("out").unwrap(), "keep other ");
    }

    #[test]
    fn test_initial_writes_survive_rollback() {
        let sinks = MemorySinks::new();
        let reg = StreamRegistry::speculative(sinks.factory());
        reg.stream("out")
            .unwrap()
            .write(ObjectId::new(0), None, VirtualTime::ZERO, b"init")
            .unwrap();
        assert_eq!(reg.rollback(ObjectId::new(0), &key(0, 0, 0)), 0);
        reg.commit(VirtualTime::new(1)).unwrap();
        assert_eq!(sinks.text("out").unwrap(), "init");
    }

    #[test]
    fn test_immediate_writes_through() {
        let sinks = MemorySinks::new();
        let reg = StreamRegistry::immediate(sinks.factory());
        write(&reg, "log", 0, 50, "now");
        assert_eq!(sinks.text("log").unwrap(), "now");
        assert_eq!(reg.stream("log").unwrap().pending_len(), 0);
    }

    #[test]
    fn test_factory_error_surfaces() {
        let reg = StreamRegistry::immediate(Box::new(|_: &str| {
            Err::<Box<dyn Write + Send>, _>(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "nope",
            ))
        }));
        let err = reg.stream("x").unwrap_err();
        assert!(matches!(err, KernelError::Stream { .. }));
    }
}
