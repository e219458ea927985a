//! Binary trace output for the rtk kernel.
//!
//! The kernel reports scheduling and IPC activity as small binary *records*
//! through a [`TraceHook`]. A [`Tracer`] numbers each record, optionally
//! stamps it with the time since the tracer was created, and wraps it in a
//! byte-stuffed frame terminated by [`FLAG`] so a host can resynchronise on a
//! lossy link. Frames go to a pluggable [`TraceBackend`].

use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

mod record;

pub use record::{RecordBuilder, FMT_MEM, FMT_STR, FMT_U16, FMT_U32, FMT_U64, FMT_U8};

/// Frame delimiter.
pub const FLAG: u8 = 0x7E;
/// Escape marker for payload bytes that collide with [`FLAG`] or itself.
pub const ESC: u8 = 0x7D;
/// Value XOR-ed into an escaped byte.
pub const ESC_XOR: u8 = 0x20;
/// Set in the type byte of a frame that carries a timestamp. Record types
/// use the low seven bits.
pub const TIMESTAMP_FLAG: u8 = 0x80;

/// Maximum payload length for a single record (excluding header/checksum).
const DEFAULT_MAX_RECORD_LEN: usize = 64;

/// Configuration for the tracer.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub max_record_len: usize,
    pub include_timestamp: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            include_timestamp: true,
        }
    }
}

/// A single trace record as it was framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub seq: u8,
    pub record_type: u8,
    pub timestamp: Option<u32>,
    pub payload: Vec<u8>,
}

/// Errors that can occur while emitting or decoding trace data.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("record type {0:#04x} collides with the timestamp flag")]
    RecordType(u8),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("checksum mismatch: expected {expected:#04x}, found {found:#04x}")]
    Checksum { expected: u8, found: u8 },
    #[error("backend error: {0}")]
    Backend(#[from] io::Error),
}

/// Closure through which the kernel hands records to a tracer.
pub type TraceHook = Arc<dyn Fn(u8, &[u8], bool) -> Result<(), TraceError> + Send + Sync>;

/// Backend trait that consumes complete frames.
pub trait TraceBackend: Send + Sync {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Backend that writes frames to any `Write` implementation.
pub struct WriterBackend<W: Write + Send + 'static> {
    writer: Mutex<W>,
}

impl<W: Write + Send + 'static> WriterBackend<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send + 'static> TraceBackend for WriterBackend<W> {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError> {
        let mut guard = lock(&self.writer);
        guard.write_all(frame).map_err(TraceError::from)
    }
}

/// In-memory backend; clones share the same frame list.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the frames written so far.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        lock(&self.frames).clone()
    }

    /// Decodes every captured frame, skipping any that fail to decode.
    pub fn records(&self) -> Vec<TraceRecord> {
        lock(&self.frames)
            .iter()
            .filter_map(|frame| decode_frame(frame).ok())
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.frames).clear();
    }
}

impl TraceBackend for MemoryBackend {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError> {
        lock(&self.frames).push(frame.to_vec());
        Ok(())
    }
}

/// Convenience backend that writes frames to stdout.
pub fn stdout_backend() -> WriterBackend<io::Stdout> {
    WriterBackend::new(io::stdout())
}

/// Frame encoder.
#[derive(Debug)]
pub struct Tracer<B: TraceBackend> {
    backend: B,
    cfg: TraceConfig,
    seq: u8,
    epoch: Instant,
}

#[derive(Clone)]
pub struct TracerHandle<B: TraceBackend> {
    inner: Arc<Mutex<Tracer<B>>>,
}

impl<B: TraceBackend> Tracer<B> {
    pub fn new(cfg: TraceConfig, backend: B) -> Self {
        Self {
            backend,
            cfg,
            seq: 0,
            epoch: Instant::now(),
        }
    }

    pub fn into_handle(self) -> TracerHandle<B> {
        TracerHandle {
            inner: Arc::new(Mutex::new(self)),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn record(
        &mut self,
        record_type: u8,
        payload: &[u8],
        with_timestamp: bool,
    ) -> Result<TraceRecord, TraceError> {
        if payload.len() > self.cfg.max_record_len {
            return Err(TraceError::PayloadTooLarge(payload.len()));
        }
        if record_type & TIMESTAMP_FLAG != 0 {
            return Err(TraceError::RecordType(record_type));
        }

        let timestamp = if self.cfg.include_timestamp && with_timestamp {
            Some(micros(self.epoch.elapsed()))
        } else {
            None
        };

        self.seq = self.seq.wrapping_add(1);
        let record = TraceRecord {
            seq: self.seq,
            record_type,
            timestamp,
            payload: payload.to_vec(),
        };

        self.backend.write_frame(&encode_frame(&record))?;
        Ok(record)
    }
}

fn micros(elapsed: Duration) -> u32 {
    // Truncation wraps roughly every 71 minutes; hosts unwrap by sequence.
    elapsed.as_micros() as u32
}

impl<B: TraceBackend + 'static> TracerHandle<B> {
    pub fn emit(&self, record_type: u8, payload: &[u8]) -> Result<TraceRecord, TraceError> {
        lock(&self.inner).record(record_type, payload, false)
    }

    pub fn emit_with_timestamp(
        &self,
        record_type: u8,
        payload: &[u8],
    ) -> Result<TraceRecord, TraceError> {
        lock(&self.inner).record(record_type, payload, true)
    }

    pub fn hook(&self) -> TraceHook {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |record_type, payload, with_timestamp| {
            lock(&inner)
                .record(record_type, payload, with_timestamp)
                .map(|_| ())
        })
    }
}

fn push_stuffed(dest: &mut Vec<u8>, byte: u8) {
    if byte == FLAG || byte == ESC {
        dest.push(ESC);
        dest.push(byte ^ ESC_XOR);
    } else {
        dest.push(byte);
    }
}

/// Encodes a record as `seq, type, [timestamp LE], payload, !sum, FLAG`,
/// byte-stuffing everything before the closing flag. The type byte carries
/// [`TIMESTAMP_FLAG`] when a timestamp follows.
pub fn encode_frame(record: &TraceRecord) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(record.payload.len() + 8);
    let mut checksum: u8 = 0;
    let mut push = |dest: &mut Vec<u8>, byte: u8| {
        checksum = checksum.wrapping_add(byte);
        push_stuffed(dest, byte);
    };

    push(&mut bytes, record.seq);
    let flag = if record.timestamp.is_some() {
        TIMESTAMP_FLAG
    } else {
        0
    };
    push(&mut bytes, record.record_type | flag);
    if let Some(ts) = record.timestamp {
        for byte in ts.to_le_bytes() {
            push(&mut bytes, byte);
        }
    }
    for &byte in &record.payload {
        push(&mut bytes, byte);
    }

    push_stuffed(&mut bytes, !checksum);
    bytes.push(FLAG);
    bytes
}

/// Decodes one frame produced by [`encode_frame`].
pub fn decode_frame(frame: &[u8]) -> Result<TraceRecord, TraceError> {
    let body = match frame.split_last() {
        Some((&FLAG, body)) => body,
        _ => return Err(TraceError::Malformed("missing closing flag")),
    };

    let mut raw = Vec::with_capacity(body.len());
    let mut bytes = body.iter();
    while let Some(&byte) = bytes.next() {
        match byte {
            ESC => match bytes.next() {
                Some(&next) => raw.push(next ^ ESC_XOR),
                None => return Err(TraceError::Malformed("dangling escape")),
            },
            FLAG => return Err(TraceError::Malformed("flag inside frame")),
            other => raw.push(other),
        }
    }

    let Some((&found, content)) = raw.split_last() else {
        return Err(TraceError::Malformed("empty frame"));
    };
    let with_timestamp = content.get(1).is_some_and(|t| t & TIMESTAMP_FLAG != 0);
    let header = if with_timestamp { 6 } else { 2 };
    if content.len() < header {
        return Err(TraceError::Malformed("truncated header"));
    }

    let expected = !content.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
    if expected != found {
        return Err(TraceError::Checksum { expected, found });
    }

    let timestamp = with_timestamp
        .then(|| u32::from_le_bytes([content[2], content[3], content[4], content[5]]));
    Ok(TraceRecord {
        seq: content[0],
        record_type: content[1] & !TIMESTAMP_FLAG,
        timestamp,
        payload: content[header..].to_vec(),
    })
}
