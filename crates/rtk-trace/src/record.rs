//! Helpers for building record payloads.
//!
//! Each field is tagged with a one-byte format descriptor followed by the
//! value in little-endian order, so a host decoder can walk a payload
//! without knowing the record layout in advance.

pub const FMT_U8: u8 = 0x1;
pub const FMT_U16: u8 = 0x3;
pub const FMT_U32: u8 = 0x5;
pub const FMT_STR: u8 = 0x8;
pub const FMT_MEM: u8 = 0x9;
pub const FMT_U64: u8 = 0xE;

/// Incremental builder for tagged payloads.
#[derive(Debug, Default)]
pub struct RecordBuilder {
    bytes: Vec<u8>,
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn push_u8(&mut self, value: u8) -> &mut Self {
        self.bytes.push(FMT_U8);
        self.bytes.push(value);
        self
    }

    pub fn push_u16(&mut self, value: u16) -> &mut Self {
        self.bytes.push(FMT_U16);
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn push_u32(&mut self, value: u32) -> &mut Self {
        self.bytes.push(FMT_U32);
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn push_u64(&mut self, value: u64) -> &mut Self {
        self.bytes.push(FMT_U64);
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Adds a raw memory blob; anything past 255 bytes is dropped.
    pub fn push_mem(&mut self, data: &[u8]) -> &mut Self {
        let len = data.len().min(u8::MAX as usize);
        self.bytes.push(FMT_MEM);
        self.bytes.push(len as u8);
        self.bytes.extend_from_slice(&data[..len]);
        self
    }

    /// Adds a null-terminated string field.
    pub fn push_str(&mut self, value: &str) -> &mut Self {
        self.bytes.push(FMT_STR);
        self.bytes.extend_from_slice(value.as_bytes());
        self.bytes.push(0);
        self
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}
