//! Kernel sizing and behaviour.

use crate::error::KernelError;
use crate::task::{Priority, TaskId};
use crate::time::{ms_to_ticks, Tick};

/// Largest supported number of priority levels (one ready-set bit each).
pub const MAX_PRIORITY_LEVELS: u8 = 64;

/// Called with the offending task when a stack guard is found corrupted.
pub type StackOverflowHook = fn(TaskId, &str);

/// Configuration for the kernel.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub name: &'static str,
    /// Number of priority levels; valid task priorities are `0..max_priorities`.
    pub max_priorities: u8,
    pub max_tasks: usize,
    pub tick_rate_hz: u32,
    /// Smallest stack a task may request; also the default stack size.
    pub minimal_stack_size: usize,
    /// Bytes available for task stacks and control blocks.
    pub heap_size: usize,
    /// Creates the timer daemon task when the kernel is built.
    pub use_timers: bool,
    pub timer_task_priority: u8,
    pub timer_queue_length: usize,
    pub timer_task_stack_size: usize,
    /// Host driver budget: steps dispatched between two ticks.
    pub max_steps_per_tick: usize,
    pub idle_callback: Option<fn()>,
    pub stack_overflow_hook: Option<StackOverflowHook>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "RTK",
            max_priorities: 32,
            max_tasks: 16,
            tick_rate_hz: 1000,
            minimal_stack_size: 256,
            heap_size: 64 * 1024,
            use_timers: true,
            timer_task_priority: 31,
            timer_queue_length: 10,
            timer_task_stack_size: 512,
            max_steps_per_tick: 64,
            idle_callback: None,
            stack_overflow_hook: None,
        }
    }
}

impl KernelConfig {
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }

    pub fn ms_to_ticks(&self, ms: u64) -> Tick {
        ms_to_ticks(ms, self.tick_rate_hz)
    }

    pub fn timer_priority(&self) -> Priority {
        Priority(self.timer_task_priority)
    }

    /// Checks the configuration for values the kernel cannot run with.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.max_priorities == 0 || self.max_priorities > MAX_PRIORITY_LEVELS {
            return Err(KernelError::InvalidParameter(
                "max_priorities must be within 1..=64",
            ));
        }
        if self.max_tasks == 0 {
            return Err(KernelError::InvalidParameter("max_tasks must be non-zero"));
        }
        if self.tick_rate_hz == 0 {
            return Err(KernelError::InvalidParameter(
                "tick_rate_hz must be non-zero",
            ));
        }
        if self.max_steps_per_tick == 0 {
            return Err(KernelError::InvalidParameter(
                "max_steps_per_tick must be non-zero",
            ));
        }
        if self.use_timers {
            if self.timer_task_priority >= self.max_priorities {
                return Err(KernelError::InvalidParameter(
                    "timer_task_priority must be below max_priorities",
                ));
            }
            if self.timer_queue_length == 0 {
                return Err(KernelError::InvalidParameter(
                    "timer_queue_length must be non-zero",
                ));
            }
        }
        Ok(())
    }
}

/// Builder for ergonomic kernel configuration construction.
#[derive(Debug, Clone, Default)]
pub struct KernelConfigBuilder {
    config: KernelConfig,
    timer_priority_set: bool,
}

impl KernelConfigBuilder {
    pub fn name(mut self, name: &'static str) -> Self {
        self.config.name = name;
        self
    }

    /// Sets the number of priority levels.
    ///
    /// Unless set explicitly, the timer daemon follows at the highest level.
    pub fn max_priorities(mut self, levels: u8) -> Self {
        self.config.max_priorities = levels;
        self
    }

    pub fn max_tasks(mut self, max: usize) -> Self {
        self.config.max_tasks = max;
        self
    }

    pub fn tick_rate_hz(mut self, hz: u32) -> Self {
        self.config.tick_rate_hz = hz;
        self
    }

    pub fn minimal_stack_size(mut self, bytes: usize) -> Self {
        self.config.minimal_stack_size = bytes;
        self
    }

    pub fn heap_size(mut self, bytes: usize) -> Self {
        self.config.heap_size = bytes;
        self
    }

    pub fn use_timers(mut self, enabled: bool) -> Self {
        self.config.use_timers = enabled;
        self
    }

    pub fn timer_task_priority(mut self, priority: u8) -> Self {
        self.config.timer_task_priority = priority;
        self.timer_priority_set = true;
        self
    }

    pub fn timer_queue_length(mut self, len: usize) -> Self {
        self.config.timer_queue_length = len;
        self
    }

    pub fn timer_task_stack_size(mut self, bytes: usize) -> Self {
        self.config.timer_task_stack_size = bytes;
        self
    }

    pub fn max_steps_per_tick(mut self, steps: usize) -> Self {
        self.config.max_steps_per_tick = steps;
        self
    }

    pub fn idle_callback(mut self, callback: fn()) -> Self {
        self.config.idle_callback = Some(callback);
        self
    }

    pub fn stack_overflow_hook(mut self, hook: StackOverflowHook) -> Self {
        self.config.stack_overflow_hook = Some(hook);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(mut self) -> Result<KernelConfig, KernelError> {
        if !self.timer_priority_set {
            self.config.timer_task_priority = self.config.max_priorities.saturating_sub(1);
        }
        self.config.validate()?;
        Ok(self.config)
    }
}
