//! Trace hook plumbing and record identifiers.
//!
//! With the `trace` feature the hook type comes from `rtk-trace`, so a
//! `TracerHandle::hook()` plugs straight into
//! [`KernelBuilder::with_trace_hook`](crate::kernel::KernelBuilder::with_trace_hook).

#[cfg(feature = "trace")]
pub use rtk_trace::{TraceError, TraceHook};

#[cfg(not(feature = "trace"))]
use alloc::sync::Arc;

#[cfg(not(feature = "trace"))]
pub type TraceError = core::convert::Infallible;

#[cfg(not(feature = "trace"))]
pub type TraceHook = Arc<dyn Fn(u8, &[u8], bool) -> Result<(), TraceError> + Send + Sync>;

/// Record identifiers, grouped by subsystem.
///
/// Scheduler payloads start with the task id (`u16`, little endian); object
/// payloads start with the object id (`u32`, little endian).
pub mod records {
    pub mod sched {
        /// Payload adds the priority.
        pub const TASK_CREATE: u8 = 1;
        pub const TASK_DELETE: u8 = 2;
        /// Payload is the outgoing then the incoming task id.
        pub const SWITCH: u8 = 3;
        pub const READY: u8 = 4;
        pub const BLOCK: u8 = 5;
        /// Blocked task resumed because its deadline passed.
        pub const TIMEOUT: u8 = 6;
        pub const SUSPEND: u8 = 7;
        pub const RESUME: u8 = 8;
        /// Effective priority changed; payload adds old and new priority.
        pub const PRIORITY: u8 = 9;
        pub const IDLE: u8 = 10;
        /// Payload is the new tick count (`u64`).
        pub const TICK: u8 = 11;
        pub const STACK_OVERFLOW: u8 = 12;
    }

    pub mod queue {
        pub const SEND: u8 = 32;
        pub const SEND_FAILED: u8 = 33;
        pub const RECEIVE: u8 = 34;
        pub const RECEIVE_FAILED: u8 = 35;
        pub const PEEK: u8 = 36;
    }

    pub mod mutex {
        pub const LOCK: u8 = 40;
        pub const UNLOCK: u8 = 41;
        pub const CONTENDED: u8 = 42;
    }

    /// Payload adds the resulting bit value (`u32`).
    pub mod event_group {
        pub const SET: u8 = 48;
        pub const CLEAR: u8 = 49;
        pub const WAIT_DONE: u8 = 50;
        pub const SYNC: u8 = 51;
    }

    /// Payload is the target task id then the value (`u32`).
    pub mod notify {
        pub const SEND: u8 = 56;
        pub const RECEIVE: u8 = 57;
    }

    pub mod timer {
        pub const COMMAND: u8 = 64;
        pub const EXPIRED: u8 = 65;
        pub const PENDED_CALL: u8 = 66;
    }
}

pub(crate) fn object_payload(id: u32, value: u32) -> [u8; 8] {
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&id.to_le_bytes());
    payload[4..].copy_from_slice(&value.to_le_bytes());
    payload
}
