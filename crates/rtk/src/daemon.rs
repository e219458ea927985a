//! The deferred-execution daemon: software timers and pended calls.
//!
//! A single task at `timer_task_priority` owns a command queue. Timer
//! commands and pended calls from tasks or interrupts are executed in arrival
//! order inside that task, and timer callbacks run there too, so a slow
//! callback delays every later timer and command.

use core::fmt;

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::context::{IsrContext, TaskContext};
use crate::critical::CriticalCell;
use crate::error::KernelError;
use crate::interrupt::SwitchRequest;
use crate::queue::{End, Full, Queue};
use crate::registry::Channel;
use crate::scheduler::Scheduler;
use crate::sync::{self, Arc};
use crate::task::{bounded_name, Name, TaskAction, TaskConfig, TaskId, Wait};
use crate::time::{Tick, Timeout};
use crate::trace::{object_payload, records};

/// Name of the daemon task.
pub const DAEMON_TASK_NAME: &str = "Tmr Svc";

/// Timer callback, run in the daemon task.
pub type TimerCallback = Box<dyn FnMut(&mut TaskContext<'_>, &Timer) + Send>;

/// Work handed to the daemon for execution outside interrupt context.
pub enum Deferred {
    /// A plain function with two word-sized arguments.
    Function {
        func: fn(&mut TaskContext<'_>, usize, u32),
        arg1: usize,
        arg2: u32,
    },
    /// A closure carrying its own state.
    Closure(Box<dyn FnOnce(&mut TaskContext<'_>) + Send>),
}

impl Deferred {
    pub fn closure<F>(f: F) -> Self
    where
        F: FnOnce(&mut TaskContext<'_>) + Send + 'static,
    {
        Deferred::Closure(Box::new(f))
    }

    fn run(self, ctx: &mut TaskContext<'_>) {
        match self {
            Deferred::Function { func, arg1, arg2 } => func(ctx, arg1, arg2),
            Deferred::Closure(f) => f(ctx),
        }
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deferred::Function { arg1, arg2, .. } => f
                .debug_struct("Function")
                .field("arg1", arg1)
                .field("arg2", arg2)
                .finish_non_exhaustive(),
            Deferred::Closure(_) => f.write_str("Closure(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    Dormant,
    Running,
    Deleted,
}

enum Command {
    Start { timer: Timer, issued: Tick },
    Stop(Timer),
    ChangePeriod {
        timer: Timer,
        period: Tick,
        issued: Tick,
    },
    Delete(Timer),
    Pend(Deferred),
}

impl Command {
    fn code(&self) -> u32 {
        match self {
            Command::Start { .. } => 0,
            Command::Stop(_) => 1,
            Command::ChangePeriod { .. } => 2,
            Command::Delete(_) => 3,
            Command::Pend(_) => 4,
        }
    }
}

/// Handle to the daemon, used to create timers and pend calls.
#[derive(Clone)]
pub struct TimerService {
    commands: Queue<Command>,
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("pending_commands", &self.commands.len())
            .finish()
    }
}

impl TimerService {
    /// Creates the command queue and the daemon task.
    pub(crate) fn spawn(sched: &mut Scheduler) -> Result<(Self, TaskId), KernelError> {
        let config = sched.config();
        let commands = Queue::new(config.timer_queue_length)?;
        let task = TaskConfig::new(DAEMON_TASK_NAME, config.timer_priority(), {
            let mut daemon = Daemon {
                commands: commands.clone(),
                active: Vec::new(),
            };
            move |ctx: &mut TaskContext<'_>| daemon.step(ctx)
        })
        .with_stack_size(config.timer_task_stack_size);
        let id = sched.create_task(task)?;
        Ok((Self { commands }, id))
    }

    /// Creates a dormant timer. `period` must be at least one tick.
    pub fn create_timer<F>(
        &self,
        name: &str,
        period: Tick,
        auto_reload: bool,
        id: usize,
        callback: F,
    ) -> Result<Timer, KernelError>
    where
        F: FnMut(&mut TaskContext<'_>, &Timer) + Send + 'static,
    {
        if period == 0 {
            return Err(KernelError::InvalidParameter(
                "timer period must be non-zero",
            ));
        }
        Ok(Timer {
            shared: Arc::new(TimerShared {
                name: bounded_name(name),
                service: self.clone(),
                state: CriticalCell::new(TimerState {
                    period,
                    auto_reload,
                    status: TimerStatus::Dormant,
                    expiry: 0,
                    id,
                }),
                callback: sync::Mutex::new(Box::new(callback)),
            }),
        })
    }

    /// Queues `call` for execution in the daemon task.
    pub fn pend_call(
        &self,
        ctx: &mut TaskContext<'_>,
        call: Deferred,
        timeout: Timeout,
    ) -> Wait<()> {
        self.commands
            .post(ctx, Command::Pend(call), End::Back, timeout)
    }

    pub fn pend_call_from_isr(
        &self,
        isr: &mut IsrContext<'_>,
        call: Deferred,
    ) -> Result<SwitchRequest, Full> {
        self.commands
            .post_from_isr(isr, Command::Pend(call), End::Back)
    }

    /// Commands waiting for the daemon.
    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    fn send(&self, ctx: &mut TaskContext<'_>, command: Command, timeout: Timeout) -> Wait<()> {
        ctx.sched
            .emit(records::timer::COMMAND, &command.code().to_le_bytes());
        self.commands.post(ctx, command, End::Back, timeout)
    }

    fn send_from_isr(
        &self,
        isr: &mut IsrContext<'_>,
        command: Command,
    ) -> Result<SwitchRequest, Full> {
        isr.sched
            .emit(records::timer::COMMAND, &command.code().to_le_bytes());
        self.commands.post_from_isr(isr, command, End::Back)
    }
}

struct TimerState {
    period: Tick,
    auto_reload: bool,
    status: TimerStatus,
    expiry: Tick,
    id: usize,
}

struct TimerShared {
    name: Name,
    service: TimerService,
    state: CriticalCell<TimerState>,
    callback: sync::Mutex<TimerCallback>,
}

/// Handle to a software timer; clones refer to the same timer.
///
/// Commands are queued to the daemon; the timer's state changes when the
/// daemon executes them.
#[derive(Clone)]
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.name())
            .field("period", &self.period())
            .field("status", &self.status())
            .finish()
    }
}

impl Timer {
    pub fn name(&self) -> &str {
        self.shared.name.as_str()
    }

    pub fn period(&self) -> Tick {
        self.shared.state.with(|s| s.period)
    }

    pub fn is_auto_reload(&self) -> bool {
        self.shared.state.with(|s| s.auto_reload)
    }

    pub fn status(&self) -> TimerStatus {
        self.shared.state.with(|s| s.status)
    }

    pub fn is_active(&self) -> bool {
        self.status() == TimerStatus::Running
    }

    /// Tick of the next expiry while running.
    pub fn expiry(&self) -> Option<Tick> {
        self.shared
            .state
            .with(|s| (s.status == TimerStatus::Running).then_some(s.expiry))
    }

    /// User identifier slot.
    pub fn id(&self) -> usize {
        self.shared.state.with(|s| s.id)
    }

    pub fn set_id(&self, id: usize) {
        self.shared.state.with(|s| s.id = id);
    }

    fn same(&self, other: &Timer) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Starts the timer; it expires one period after this call. Restarts a
    /// running timer.
    pub fn start(&self, ctx: &mut TaskContext<'_>, timeout: Timeout) -> Wait<()> {
        let issued = ctx.now();
        self.shared.service.send(
            ctx,
            Command::Start {
                timer: self.clone(),
                issued,
            },
            timeout,
        )
    }

    /// Same as [`start`](Self::start): the period restarts from now.
    pub fn reset(&self, ctx: &mut TaskContext<'_>, timeout: Timeout) -> Wait<()> {
        self.start(ctx, timeout)
    }

    pub fn stop(&self, ctx: &mut TaskContext<'_>, timeout: Timeout) -> Wait<()> {
        self.shared
            .service
            .send(ctx, Command::Stop(self.clone()), timeout)
    }

    /// Sets a new period and (re)starts the timer from now.
    pub fn change_period(
        &self,
        ctx: &mut TaskContext<'_>,
        period: Tick,
        timeout: Timeout,
    ) -> Result<Wait<()>, KernelError> {
        if period == 0 {
            return Err(KernelError::InvalidParameter(
                "timer period must be non-zero",
            ));
        }
        let issued = ctx.now();
        Ok(self.shared.service.send(
            ctx,
            Command::ChangePeriod {
                timer: self.clone(),
                period,
                issued,
            },
            timeout,
        ))
    }

    pub fn delete(&self, ctx: &mut TaskContext<'_>, timeout: Timeout) -> Wait<()> {
        self.shared
            .service
            .send(ctx, Command::Delete(self.clone()), timeout)
    }

    pub fn start_from_isr(&self, isr: &mut IsrContext<'_>) -> Result<SwitchRequest, Full> {
        let issued = isr.now();
        self.shared.service.send_from_isr(
            isr,
            Command::Start {
                timer: self.clone(),
                issued,
            },
        )
    }

    pub fn reset_from_isr(&self, isr: &mut IsrContext<'_>) -> Result<SwitchRequest, Full> {
        self.start_from_isr(isr)
    }

    pub fn stop_from_isr(&self, isr: &mut IsrContext<'_>) -> Result<SwitchRequest, Full> {
        self.shared
            .service
            .send_from_isr(isr, Command::Stop(self.clone()))
    }

    pub fn change_period_from_isr(
        &self,
        isr: &mut IsrContext<'_>,
        period: Tick,
    ) -> Result<SwitchRequest, KernelError> {
        if period == 0 {
            return Err(KernelError::InvalidParameter(
                "timer period must be non-zero",
            ));
        }
        let issued = isr.now();
        self.shared
            .service
            .send_from_isr(
                isr,
                Command::ChangePeriod {
                    timer: self.clone(),
                    period,
                    issued,
                },
            )
            .map_err(|Full| KernelError::ResourceExhausted("timer command queue full"))
    }

    fn fire(&self, ctx: &mut TaskContext<'_>) {
        let mut callback = self.shared.callback.lock();
        (&mut **callback)(ctx, self);
    }
}

/// A callback that makes a blocking call suspends the whole daemon until
/// that call's wait ends; the call itself is not re-issued.
fn callback_blocked(ctx: &TaskContext<'_>) -> bool {
    let blocked = ctx.blocked();
    if blocked {
        log::warn!("callback blocked the timer daemon");
    }
    blocked
}

/// State of the daemon task: its end of the command queue and the running
/// timers, sorted by expiry.
struct Daemon {
    commands: Queue<Command>,
    active: Vec<Timer>,
}

impl Daemon {
    fn step(&mut self, ctx: &mut TaskContext<'_>) -> TaskAction {
        let now = ctx.now();
        // Only the command receive is ever re-issued.
        ctx.abandon_wait(Channel::Receive(self.commands.id()));
        if self.process_expired(ctx, now) {
            return TaskAction::Blocked;
        }

        let timeout = match self.next_expiry() {
            Some(at) if at > now => Timeout::Ticks(at - now),
            Some(_) => Timeout::NoWait,
            None => Timeout::Forever,
        };
        match self.commands.receive(ctx, timeout) {
            Wait::Done(command) => {
                self.execute(ctx, command);
                if callback_blocked(ctx) {
                    TaskAction::Blocked
                } else {
                    TaskAction::Continue
                }
            }
            Wait::Blocked => TaskAction::Blocked,
            Wait::TimedOut => TaskAction::Continue,
        }
    }

    fn next_expiry(&self) -> Option<Tick> {
        self.active.first().and_then(Timer::expiry)
    }

    /// Fires every timer due at `now`. Returns `true` if a callback blocked
    /// the daemon; the remaining timers fire on its next step.
    fn process_expired(&mut self, ctx: &mut TaskContext<'_>, now: Tick) -> bool {
        while self.next_expiry().is_some_and(|at| at <= now) {
            let timer = self.active.remove(0);
            let expired_at = timer.shared.state.with(|s| {
                let at = s.expiry;
                if s.auto_reload {
                    // Re-arm from the previous expiry so no period is lost.
                    s.expiry = at + s.period;
                } else {
                    s.status = TimerStatus::Dormant;
                }
                at
            });
            if timer.is_active() {
                self.insert(timer.clone());
            }
            ctx.sched.emit(
                records::timer::EXPIRED,
                &object_payload(timer.id() as u32, expired_at as u32),
            );
            timer.fire(ctx);
            if callback_blocked(ctx) {
                return true;
            }
        }
        false
    }

    fn insert(&mut self, timer: Timer) {
        let at = timer.expiry().unwrap_or(Tick::MAX);
        let slot = self
            .active
            .iter()
            .position(|t| t.expiry().is_some_and(|e| e > at))
            .unwrap_or(self.active.len());
        self.active.insert(slot, timer);
    }

    fn remove(&mut self, timer: &Timer) {
        self.active.retain(|t| !t.same(timer));
    }

    fn execute(&mut self, ctx: &mut TaskContext<'_>, command: Command) {
        match command {
            Command::Start { timer, issued } => {
                if timer.status() == TimerStatus::Deleted {
                    return;
                }
                self.remove(&timer);
                timer.shared.state.with(|s| {
                    s.expiry = issued + s.period;
                    s.status = TimerStatus::Running;
                });
                log::debug!(
                    "timer '{}' started, expires at {:?}",
                    timer.name(),
                    timer.expiry()
                );
                self.insert(timer);
            }
            Command::Stop(timer) => {
                self.remove(&timer);
                timer.shared.state.with(|s| {
                    if s.status == TimerStatus::Running {
                        s.status = TimerStatus::Dormant;
                    }
                });
                log::debug!("timer '{}' stopped", timer.name());
            }
            Command::ChangePeriod {
                timer,
                period,
                issued,
            } => {
                if timer.status() == TimerStatus::Deleted {
                    return;
                }
                self.remove(&timer);
                timer.shared.state.with(|s| {
                    s.period = period;
                    s.expiry = issued + period;
                    s.status = TimerStatus::Running;
                });
                log::debug!("timer '{}' period now {period}", timer.name());
                self.insert(timer);
            }
            Command::Delete(timer) => {
                self.remove(&timer);
                timer.shared.state.with(|s| {
                    s.status = TimerStatus::Deleted;
                });
                log::debug!("timer '{}' deleted", timer.name());
            }
            Command::Pend(call) => {
                ctx.sched.emit(records::timer::PENDED_CALL, &[]);
                call.run(ctx);
            }
        }
    }
}
