//! The kernel instance: task dispatch, the time base and interrupt entry.
//!
//! A [`Kernel`] owns all scheduler state, so several kernels can run side by
//! side (one per test, say). On the host it is driven explicitly:
//! [`Kernel::dispatch_once`] runs one task step, [`Kernel::tick`] is the
//! periodic time-base interrupt and [`Kernel::run_ticks`] alternates the two.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::config::KernelConfig;
use crate::console::ConsoleSink;
use crate::context::{IsrContext, TaskContext};
use crate::daemon::TimerService;
use crate::error::KernelError;
use crate::interrupt::{InterruptTable, Irq, IsrHandler, SwitchRequest};
use crate::scheduler::Scheduler;
use crate::task::{Priority, TaskConfig, TaskId, TaskState, TaskStatus};
use crate::time::Tick;
use crate::trace::{records, TraceHook};

/// Runs in interrupt context on every tick, after delayed tasks are readied.
pub type TickHook = Box<dyn FnMut(&mut IsrContext<'_>) -> SwitchRequest + Send>;

/// Builder for constructing a kernel.
pub struct KernelBuilder {
    config: KernelConfig,
    tasks: Vec<TaskConfig>,
    interrupts: Vec<(Irq, IsrHandler)>,
    trace: Option<TraceHook>,
    console: Option<Box<dyn ConsoleSink + Send>>,
    tick_hook: Option<TickHook>,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
            tasks: Vec::new(),
            interrupts: Vec::new(),
            trace: None,
            console: None,
            tick_hook: None,
        }
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a task created when the kernel is built.
    pub fn task(mut self, config: TaskConfig) -> Self {
        self.tasks.push(config);
        self
    }

    pub fn with_trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    pub fn console<S>(mut self, sink: S) -> Self
    where
        S: ConsoleSink + Send + 'static,
    {
        self.console = Some(Box::new(sink));
        self
    }

    pub fn tick_hook<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut IsrContext<'_>) -> SwitchRequest + Send + 'static,
    {
        self.tick_hook = Some(Box::new(hook));
        self
    }

    pub fn interrupt<F>(mut self, irq: Irq, handler: F) -> Self
    where
        F: FnMut(&mut IsrContext<'_>) -> SwitchRequest + Send + 'static,
    {
        self.interrupts.push((irq, Box::new(handler)));
        self
    }

    pub fn build(self) -> Result<Kernel, KernelError> {
        self.config.validate()?;
        let use_timers = self.config.use_timers;
        let mut sched = Scheduler::new(self.config, self.trace);
        sched.console = self.console;

        if use_timers {
            let (service, daemon) = TimerService::spawn(&mut sched)?;
            log::debug!("timer daemon {daemon} created");
            sched.timers = Some(service);
        }
        for task in self.tasks {
            sched.create_task(task)?;
        }
        let mut interrupts = InterruptTable::default();
        for (irq, handler) in self.interrupts {
            interrupts.register(irq, handler)?;
        }

        Ok(Kernel {
            sched,
            interrupts,
            tick_hook: self.tick_hook,
            halted: None,
        })
    }
}

pub struct Kernel {
    sched: Scheduler,
    interrupts: InterruptTable,
    tick_hook: Option<TickHook>,
    /// Task whose stack overflowed; the kernel runs nothing after that.
    halted: Option<TaskId>,
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    pub fn new(config: KernelConfig) -> Result<Self, KernelError> {
        KernelBuilder::new().with_config(config).build()
    }

    pub fn config(&self) -> &KernelConfig {
        self.sched.config()
    }

    /// Marks the scheduler running. Tasks created afterwards preempt their
    /// creator when they outrank it. Dispatching starts the kernel implicitly.
    pub fn start(&mut self) {
        if !self.sched.started() {
            self.sched.mark_started();
            log::info!(
                "kernel '{}' started with {} tasks",
                self.sched.config().name,
                self.task_count()
            );
        }
    }

    pub fn spawn(&mut self, config: TaskConfig) -> Result<TaskId, KernelError> {
        self.sched.create_task(config)
    }

    /// Runs one step of the highest-priority ready task, or the idle hook
    /// when nothing is ready. Returns whether a task ran.
    pub fn dispatch_once(&mut self) -> Result<bool, KernelError> {
        if let Some(task) = self.halted {
            return Err(KernelError::StackOverflow { task });
        }
        self.start();
        self.sched.take_switch_request();

        let Some(next) = self.sched.select_next() else {
            self.sched.enter_idle();
            if let Some(idle) = self.sched.config().idle_callback {
                idle();
            }
            return Ok(false);
        };
        self.sched.switch_to(next);

        let Some(mut body) = self.sched.take_body(next) else {
            debug_assert!(false, "ready task {next} has no body");
            return Ok(false);
        };
        let action = {
            let mut ctx = TaskContext::new(&mut self.sched, next);
            body(&mut ctx)
        };

        if !self.sched.stack_intact(next) {
            return Err(self.halt(next));
        }
        self.sched.finish_step(next, body, action);
        Ok(true)
    }

    /// Dispatches until nothing is ready or `max_steps` steps ran. Returns
    /// the number of steps.
    pub fn run_until_idle(&mut self, max_steps: usize) -> Result<usize, KernelError> {
        let mut steps = 0;
        while steps < max_steps {
            if !self.dispatch_once()? {
                break;
            }
            steps += 1;
        }
        Ok(steps)
    }

    /// The time-base interrupt. Returns whether it readied a task that
    /// outranks the running one.
    pub fn tick(&mut self) -> bool {
        self.sched.enter_isr();
        let mut request = SwitchRequest::from(self.sched.advance_tick());
        if let Some(hook) = self.tick_hook.as_mut() {
            let mut isr = IsrContext::new(&mut self.sched, None);
            request |= hook(&mut isr);
        }
        self.sched.leave_isr();
        self.epilogue(request)
    }

    /// Host driver: for each of `ticks` periods, runs tasks until idle (at
    /// most `max_steps_per_tick` steps) and then ticks. Tasks readied by the
    /// last tick run before returning.
    pub fn run_ticks(&mut self, ticks: Tick) -> Result<(), KernelError> {
        let budget = self.sched.config().max_steps_per_tick;
        for _ in 0..ticks {
            self.run_until_idle(budget)?;
            self.tick();
        }
        self.run_until_idle(budget)?;
        Ok(())
    }

    pub fn run_for_ms(&mut self, ms: u64) -> Result<(), KernelError> {
        let ticks = self.sched.config().ms_to_ticks(ms);
        self.run_ticks(ticks)
    }

    /// Runs `body` as an interrupt handler outside the vector table.
    /// Returns whether it asked for a context switch.
    pub fn interrupt<F>(&mut self, body: F) -> bool
    where
        F: FnOnce(&mut IsrContext<'_>) -> SwitchRequest,
    {
        self.run_isr(None, body)
    }

    pub fn register_interrupt<F>(&mut self, irq: Irq, handler: F) -> Result<(), KernelError>
    where
        F: FnMut(&mut IsrContext<'_>) -> SwitchRequest + Send + 'static,
    {
        self.interrupts.register(irq, Box::new(handler))
    }

    /// Simulates the hardware raising `irq`.
    pub fn raise_interrupt(&mut self, irq: Irq) -> Result<bool, KernelError> {
        let mut handler = self
            .interrupts
            .take(irq)
            .ok_or(KernelError::InvalidParameter(
                "no handler for interrupt source",
            ))?;
        let switch = self.run_isr(Some(irq), |isr| handler(isr));
        self.interrupts.restore(irq, handler);
        Ok(switch)
    }

    fn run_isr<F>(&mut self, irq: Option<Irq>, body: F) -> bool
    where
        F: FnOnce(&mut IsrContext<'_>) -> SwitchRequest,
    {
        self.sched.enter_isr();
        let request = {
            let mut isr = IsrContext::new(&mut self.sched, irq);
            body(&mut isr)
        };
        self.sched.leave_isr();
        self.epilogue(request)
    }

    /// Consults the handler's switch request, once per interrupt.
    fn epilogue(&mut self, request: SwitchRequest) -> bool {
        if request.is_required() {
            log::trace!("context switch requested on interrupt exit");
            self.sched.request_switch();
        }
        request.is_required()
    }

    fn halt(&mut self, task: TaskId) -> KernelError {
        self.halted = Some(task);
        let name = self.task_name(task).unwrap_or("");
        log::error!("stack overflow in task {task} '{name}'; kernel halted");
        self.sched
            .emit(records::sched::STACK_OVERFLOW, &task.0.to_le_bytes());
        if let Some(hook) = self.sched.config().stack_overflow_hook {
            hook(task, name);
        }
        KernelError::StackOverflow { task }
    }

    // Task management from outside any task

    pub fn suspend(&mut self, task: TaskId) -> Result<(), KernelError> {
        self.sched.suspend(task)
    }

    pub fn resume(&mut self, task: TaskId) -> Result<(), KernelError> {
        if self.sched.resume(task)? {
            self.sched.request_switch();
        }
        Ok(())
    }

    pub fn delete(&mut self, task: TaskId) -> Result<(), KernelError> {
        self.sched.delete(task)
    }

    pub fn set_priority(&mut self, task: TaskId, priority: Priority) -> Result<(), KernelError> {
        self.sched.set_base_priority(task, priority)
    }

    // Queries

    pub fn now(&self) -> Tick {
        self.sched.now()
    }

    /// Task of the most recent step; `None` while idle.
    pub fn current(&self) -> Option<TaskId> {
        self.sched.current()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn switch_pending(&self) -> bool {
        self.sched.switch_pending()
    }

    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.sched.tcb(task).map(|tcb| tcb.state)
    }

    /// Effective priority.
    pub fn priority(&self, task: TaskId) -> Option<Priority> {
        self.sched.tcb(task).map(|tcb| tcb.priority)
    }

    pub fn base_priority(&self, task: TaskId) -> Option<Priority> {
        self.sched.tcb(task).map(|tcb| tcb.base_priority)
    }

    pub fn task_name(&self, task: TaskId) -> Option<&str> {
        self.sched.tcb(task).map(|tcb| tcb.name.as_str())
    }

    pub fn notify_value(&self, task: TaskId) -> Option<u32> {
        self.sched.tcb(task).map(|tcb| tcb.notify_value)
    }

    /// Stack bytes of `task` never written since creation.
    pub fn stack_high_water_mark(&self, task: TaskId) -> Option<usize> {
        self.sched
            .tcb(task)
            .filter(|tcb| tcb.state != TaskState::Deleted)
            .map(|tcb| tcb.stack.high_water_mark())
    }

    /// Snapshot of every task ever created, deleted ones included.
    pub fn task_list(&self) -> Vec<TaskStatus> {
        self.sched.tasks().map(|tcb| tcb.status()).collect()
    }

    /// Live tasks, the timer daemon included.
    pub fn task_count(&self) -> usize {
        self.sched
            .tasks()
            .filter(|tcb| tcb.state != TaskState::Deleted)
            .count()
    }

    pub fn heap_used(&self) -> usize {
        self.sched.heap_used()
    }

    pub fn heap_free(&self) -> usize {
        self.sched.config().heap_size - self.sched.heap_used()
    }

    pub fn timer_service(&self) -> Option<TimerService> {
        self.sched.timers.clone()
    }

    pub fn console(&mut self) -> Option<&mut (dyn ConsoleSink + Send + 'static)> {
        self.sched.console.as_deref_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::Mutex;
    use crate::queue::Queue;
    use crate::task::{TaskAction, Wait};
    use crate::time::Timeout;

    fn bare_kernel() -> Kernel {
        let config = KernelConfig::builder().use_timers(false).build().unwrap();
        Kernel::new(config).unwrap()
    }

    #[test]
    fn registries_stay_consistent_through_blocking() {
        let mut kernel = bare_kernel();
        let queue = Queue::<u32>::new(1).unwrap();
        let mutex = Mutex::new();

        let tx = queue.clone();
        kernel
            .spawn(TaskConfig::new("producer", Priority(2), move |ctx| {
                match tx.send(ctx, &1, Timeout::Ticks(3)) {
                    Wait::Blocked => TaskAction::Blocked,
                    _ => TaskAction::Continue,
                }
            }))
            .unwrap();
        let m = mutex.clone();
        let mut locked = false;
        kernel
            .spawn(TaskConfig::new("locker", Priority(1), move |ctx| {
                if !locked {
                    match m.lock(ctx, Timeout::Forever) {
                        Wait::Done(()) => locked = true,
                        Wait::Blocked => return TaskAction::Blocked,
                        Wait::TimedOut => return TaskAction::Continue,
                    }
                }
                match ctx.delay(2) {
                    Wait::Blocked => TaskAction::Blocked,
                    _ => TaskAction::Continue,
                }
            }))
            .unwrap();

        for _ in 0..6 {
            kernel.run_until_idle(8).unwrap();
            assert!(kernel.sched.registry_consistent());
            kernel.tick();
            assert!(kernel.sched.registry_consistent());
        }
        assert_eq!(queue.len(), 1);
        assert!(mutex.is_locked());
    }

    #[test]
    fn blocking_timer_callback_leaves_the_daemon_in_one_registry() {
        let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
        let service = kernel.timer_service().unwrap();
        let semaphore = crate::semaphore::Semaphore::binary().unwrap();
        let timer = service
            .create_timer("blocker", 1, false, 0, move |ctx, _| {
                let _ = semaphore.take(ctx, Timeout::Ticks(5));
            })
            .unwrap();
        kernel
            .spawn(TaskConfig::new("starter", Priority(1), move |ctx| {
                assert!(timer.start(ctx, Timeout::NoWait).is_done());
                TaskAction::Exit
            }))
            .unwrap();

        for _ in 0..8 {
            kernel.run_until_idle(8).unwrap();
            assert!(kernel.sched.registry_consistent());
            kernel.tick();
            assert!(kernel.sched.registry_consistent());
        }
    }

    #[test]
    fn idle_runs_when_nothing_is_ready() {
        let mut kernel = bare_kernel();
        assert!(!kernel.dispatch_once().unwrap());
        assert_eq!(kernel.current(), None);
    }

    #[test]
    fn halted_kernel_refuses_to_dispatch() {
        let mut kernel = bare_kernel();
        let task = kernel
            .spawn(TaskConfig::new("smash", Priority(1), |ctx| {
                ctx.stack_mut().fill(0);
                TaskAction::Continue
            }))
            .unwrap();
        assert_eq!(
            kernel.dispatch_once(),
            Err(KernelError::StackOverflow { task })
        );
        assert!(kernel.is_halted());
        assert_eq!(kernel.run_ticks(1), Err(KernelError::StackOverflow { task }));
    }

    #[test]
    fn timer_daemon_is_created_with_the_kernel() {
        let kernel = Kernel::builder().build().unwrap();
        assert!(kernel.timer_service().is_some());
        let daemon = TaskId(0);
        assert_eq!(kernel.task_name(daemon), Some("Tmr Svc"));
        assert_eq!(kernel.priority(daemon), Some(Priority(31)));
    }
}
