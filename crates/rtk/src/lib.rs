//! # rtk
//!
//! A priority-preemptive real-time kernel: a task scheduler with blocking
//! inter-task communication primitives and interrupt-safe deferred execution.
//!
//! ## Module Overview
//! - [`kernel`]      – Owned kernel instance, dispatch loop, time base, interrupt entry.
//! - [`task`]        – Task identity, priorities, configuration and the [`Wait`] outcome.
//! - [`context`]     – [`TaskContext`] and [`IsrContext`] handed to task bodies and handlers.
//! - [`queue`]       – Bounded FIFO message queue.
//! - [`semaphore`]   – Binary and counting semaphores built on the queue.
//! - [`mutex`]       – Priority-inheritance mutex, plain and recursive.
//! - [`event_group`] – Bit broadcast with an atomic rendezvous (`sync`).
//! - [`notify`]      – Direct per-task notification slot.
//! - [`daemon`]      – Timer service task: software timers and pended calls.
//! - [`interrupt`]   – Interrupt sources and the switch-request value.
//!
//! Task bodies are resumable step functions. Each invocation runs the task to
//! its next suspension point; blocking calls return [`Wait::Blocked`] and the
//! body is invoked again once the task is woken.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

#[cfg(not(any(feature = "std", feature = "lock-free")))]
compile_error!("enable the `std` feature or, on no_std targets, `lock-free`");

mod critical;
mod registry;
mod scheduler;

pub mod config;
pub mod console;
pub mod context;
pub mod daemon;
pub mod error;
pub mod event_group;
pub mod interrupt;
pub mod kernel;
pub mod mutex;
pub mod notify;
pub mod queue;
pub mod semaphore;
pub mod sync;
pub mod task;
pub mod time;
pub mod trace;

pub use config::{KernelConfig, KernelConfigBuilder};
#[cfg(feature = "std")]
pub use console::StdoutSink;
pub use console::{BufferSink, ConsoleSink};
pub use context::{IsrContext, TaskContext};
pub use daemon::{Deferred, Timer, TimerService, TimerStatus};
pub use error::{KernelError, KernelResult};
pub use event_group::{EventBits, EventGroup, WaitMode, EVENT_BITS_MASK};
pub use interrupt::{Irq, SwitchRequest};
pub use kernel::{Kernel, KernelBuilder, TickHook};
pub use mutex::Mutex;
pub use notify::{NotifyAction, NotifyError, NotifyState};
pub use queue::{Full, Queue};
pub use semaphore::Semaphore;
pub use task::{Priority, TaskAction, TaskConfig, TaskId, TaskState, TaskStatus, Wait};
pub use time::{Tick, Timeout};
