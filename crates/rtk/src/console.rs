//! Console output for demonstration code.
//!
//! The kernel never writes to a console itself; tasks reach the installed
//! sink through [`TaskContext::console`](crate::context::TaskContext::console).

use alloc::string::String;
use alloc::vec::Vec;

use crate::sync::{Arc, Mutex};

pub trait ConsoleSink {
    fn write_bytes(&mut self, bytes: &[u8]);

    fn write_str(&mut self, text: &str) {
        self.write_bytes(text.as_bytes());
    }
}

/// Writes to the process's standard output.
#[cfg(feature = "std")]
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

#[cfg(feature = "std")]
impl ConsoleSink for StdoutSink {
    fn write_bytes(&mut self, bytes: &[u8]) {
        use std::io::Write;

        let mut out = std::io::stdout().lock();
        // Console output is best effort.
        let _ = out.write_all(bytes).and_then(|_| out.flush());
    }
}

/// Collects output in memory; clones share the buffer.
#[derive(Clone, Default)]
pub struct BufferSink {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }
}

impl ConsoleSink for BufferSink {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.bytes.lock().extend_from_slice(bytes);
    }
}
