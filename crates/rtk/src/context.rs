//! Execution contexts handed to task bodies and interrupt handlers.
//!
//! Blocking calls take a [`TaskContext`]; interrupt-safe calls take an
//! [`IsrContext`]. Neither can be obtained in the other situation, so a
//! blocking call from an interrupt handler does not compile.

use crate::console::ConsoleSink;
use crate::daemon::TimerService;
use crate::error::KernelError;
use crate::interrupt::{Irq, SwitchRequest};
use crate::notify::{self, NotifyAction, NotifyError, NotifyState};
use crate::registry::{Channel, WaitCondition, WaitOutcome, WaitRecord};
use crate::scheduler::Scheduler;
use crate::task::{Priority, TaskConfig, TaskId, TaskState, Wait};
use crate::time::{Tick, Timeout};
use crate::trace::records;

/// Access to the kernel from inside a task step.
pub struct TaskContext<'k> {
    pub(crate) sched: &'k mut Scheduler,
    task: TaskId,
}

impl<'k> TaskContext<'k> {
    pub(crate) fn new(sched: &'k mut Scheduler, task: TaskId) -> Self {
        debug_assert!(!sched.in_isr(), "task step inside interrupt context");
        Self { sched, task }
    }

    /// The running task.
    pub fn id(&self) -> TaskId {
        self.task
    }

    pub fn name(&self) -> &str {
        self.sched
            .tcb(self.task)
            .map_or("", |tcb| tcb.name.as_str())
    }

    pub fn now(&self) -> Tick {
        self.sched.now()
    }

    /// Effective priority, including any inherited boost.
    pub fn priority(&self) -> Priority {
        self.priority_of(self.task).unwrap_or(Priority::IDLE)
    }

    pub fn base_priority(&self) -> Priority {
        self.sched
            .tcb(self.task)
            .map_or(Priority::IDLE, |tcb| tcb.base_priority)
    }

    pub fn priority_of(&self, task: TaskId) -> Option<Priority> {
        self.sched.tcb(task).map(|tcb| tcb.priority)
    }

    pub fn state_of(&self, task: TaskId) -> Option<TaskState> {
        self.sched.tcb(task).map(|tcb| tcb.state)
    }

    /// Whether a higher-priority task became ready during this step.
    pub fn switch_pending(&self) -> bool {
        self.sched.switch_pending()
    }

    /// Asks for other ready tasks of the same priority to run next.
    pub fn yield_now(&mut self) {
        self.sched.request_switch();
    }

    /// The task's own stack region; the lowest bytes are the overflow guard.
    pub fn stack_mut(&mut self) -> &mut [u8] {
        self.sched.stack_mut(self.task)
    }

    pub fn console(&mut self) -> Option<&mut (dyn ConsoleSink + Send + 'static)> {
        self.sched.console.as_deref_mut()
    }

    pub fn timers(&self) -> Option<TimerService> {
        self.sched.timers.clone()
    }

    // Task management

    pub fn spawn(&mut self, config: TaskConfig) -> Result<TaskId, KernelError> {
        self.sched.create_task(config)
    }

    /// Deletes `task`; deleting the caller ends it after this step.
    pub fn delete(&mut self, task: TaskId) -> Result<(), KernelError> {
        self.sched.delete(task)
    }

    pub fn suspend(&mut self, task: TaskId) -> Result<(), KernelError> {
        self.sched.suspend(task)
    }

    pub fn resume(&mut self, task: TaskId) -> Result<(), KernelError> {
        if self.sched.resume(task)? {
            self.sched.request_switch();
        }
        Ok(())
    }

    pub fn set_priority(&mut self, task: TaskId, priority: Priority) -> Result<(), KernelError> {
        self.sched.set_base_priority(task, priority)
    }

    /// Blocks for `ticks` tick periods. Zero ticks yields instead.
    pub fn delay(&mut self, ticks: Tick) -> Wait<()> {
        if let Some(record) = self.resume_wait(Channel::Delay) {
            if record.outcome == WaitOutcome::TimedOut {
                return Wait::Done(());
            }
        }
        if ticks == 0 {
            self.yield_now();
            return Wait::Done(());
        }
        let wake_at = self.now().saturating_add(ticks);
        self.sched
            .block_current(Channel::Delay, Some(wake_at), WaitCondition::Always);
        Wait::Blocked
    }

    /// Blocks until `*last_wake + period`, then advances `last_wake` by one
    /// period. A deadline already in the past returns at once.
    pub fn delay_until(&mut self, last_wake: &mut Tick, period: Tick) -> Wait<()> {
        if let Some(record) = self.resume_wait(Channel::Delay) {
            if record.outcome == WaitOutcome::TimedOut {
                return Wait::Done(());
            }
        }
        let wake_at = last_wake.saturating_add(period);
        *last_wake = wake_at;
        if wake_at <= self.now() {
            return Wait::Done(());
        }
        self.sched
            .block_current(Channel::Delay, Some(wake_at), WaitCondition::Always);
        Wait::Blocked
    }

    // Direct notification

    /// Sends a notification to `target`.
    pub fn notify(&mut self, target: TaskId, action: NotifyAction) -> Result<(), NotifyError> {
        if notify::deliver(self.sched, target, action)? {
            self.sched.request_switch();
        }
        Ok(())
    }

    /// Increments the target's notification value, the counting-semaphore use.
    pub fn notify_give(&mut self, target: TaskId) -> Result<(), NotifyError> {
        self.notify(target, NotifyAction::Increment)
    }

    /// Waits for a notification.
    ///
    /// `clear_on_entry` bits are cleared when the call starts with nothing
    /// pending; `clear_on_exit` bits are cleared from the value after it has
    /// been read.
    pub fn notify_wait(
        &mut self,
        clear_on_entry: u32,
        clear_on_exit: u32,
        timeout: Timeout,
    ) -> Wait<u32> {
        let channel = Channel::Notify(self.task);
        let prior = self.resume_wait(channel);
        let first_entry = prior.is_none();
        let received = self.sched.live_tcb_mut(self.task).and_then(|tcb| {
            if first_entry && tcb.notify_state == NotifyState::NotPending {
                tcb.notify_value &= !clear_on_entry;
            }
            if tcb.notify_state != NotifyState::Pending {
                return None;
            }
            let value = tcb.notify_value;
            tcb.notify_value &= !clear_on_exit;
            tcb.notify_state = NotifyState::NotPending;
            Some(value)
        });
        match received {
            Some(value) => {
                self.emit_notify_received(value);
                Wait::Done(value)
            }
            None => self.block_on(channel, prior, timeout, WaitCondition::Always),
        }
    }

    /// Waits for a non-zero notification value, then zeroes it
    /// (`clear_on_exit`) or decrements it. Returns the value before that.
    pub fn notify_take(&mut self, clear_on_exit: bool, timeout: Timeout) -> Wait<u32> {
        let channel = Channel::Notify(self.task);
        let prior = self.resume_wait(channel);
        let taken = self.sched.live_tcb_mut(self.task).and_then(|tcb| {
            if tcb.notify_value == 0 {
                return None;
            }
            let value = tcb.notify_value;
            tcb.notify_value = if clear_on_exit { 0 } else { value - 1 };
            tcb.notify_state = NotifyState::NotPending;
            Some(value)
        });
        match taken {
            Some(value) => {
                self.emit_notify_received(value);
                Wait::Done(value)
            }
            None => self.block_on(channel, prior, timeout, WaitCondition::Always),
        }
    }

    /// Drops a pending notification of `task`. Returns whether one was pending.
    pub fn notify_state_clear(&mut self, task: TaskId) -> bool {
        self.sched.live_tcb_mut(task).is_some_and(|tcb| {
            let was_pending = tcb.notify_state == NotifyState::Pending;
            tcb.notify_state = NotifyState::NotPending;
            was_pending
        })
    }

    /// Clears `bits` in the notification value of `task`, returning the
    /// value before clearing.
    pub fn notify_value_clear(&mut self, task: TaskId, bits: u32) -> Option<u32> {
        self.sched.live_tcb_mut(task).map(|tcb| {
            let before = tcb.notify_value;
            tcb.notify_value &= !bits;
            before
        })
    }

    fn emit_notify_received(&self, value: u32) {
        let mut payload = [0u8; 6];
        payload[..2].copy_from_slice(&self.task.0.to_le_bytes());
        payload[2..].copy_from_slice(&value.to_le_bytes());
        self.sched.emit(records::notify::RECEIVE, &payload);
    }

    // Blocking plumbing shared by the primitives

    /// Whether a call made during this step left the task blocked.
    pub(crate) fn blocked(&self) -> bool {
        self.sched
            .tcb(self.task)
            .is_some_and(|tcb| tcb.state == TaskState::Blocked)
    }

    /// Drops a record left by a wait that will not be re-issued.
    pub(crate) fn abandon_wait(&mut self, keep: Channel) {
        self.sched.abandon_wait(self.task, keep);
    }

    /// Takes the record left by a previous wait on `channel`, if this call
    /// re-issues it.
    pub(crate) fn resume_wait(&mut self, channel: Channel) -> Option<WaitRecord> {
        self.sched.take_wait(self.task, channel)
    }

    /// Blocks the caller on `channel` after its operation could not complete.
    ///
    /// A re-issued call keeps its first deadline and reports `TimedOut` once
    /// that deadline has passed.
    pub(crate) fn block_on<T>(
        &mut self,
        channel: Channel,
        prior: Option<WaitRecord>,
        timeout: Timeout,
        condition: WaitCondition,
    ) -> Wait<T> {
        let now = self.now();
        let deadline = match prior {
            Some(record) => {
                let expired = record.outcome == WaitOutcome::TimedOut
                    || record.deadline.is_some_and(|d| d <= now);
                if expired {
                    return Wait::TimedOut;
                }
                record.deadline
            }
            None => {
                if timeout.is_no_wait() {
                    return Wait::TimedOut;
                }
                timeout.deadline(now)
            }
        };
        self.sched.block_current(channel, deadline, condition);
        Wait::Blocked
    }

    /// Wakes the first waiter on `channel` and requests a switch if it
    /// outranks the caller.
    pub(crate) fn wake_one(&mut self, channel: Channel, value: u32) -> Option<TaskId> {
        let woken = self.sched.wake_one(channel, value)?;
        if woken.preempts {
            self.sched.request_switch();
        }
        Some(woken.task)
    }
}

/// Access to the kernel from inside an interrupt handler or the tick hook.
///
/// Every operation that can ready a task returns a [`SwitchRequest`]; the
/// handler combines them and returns the result to the interrupt epilogue.
pub struct IsrContext<'k> {
    pub(crate) sched: &'k mut Scheduler,
    irq: Option<Irq>,
}

impl<'k> IsrContext<'k> {
    pub(crate) fn new(sched: &'k mut Scheduler, irq: Option<Irq>) -> Self {
        debug_assert!(sched.in_isr(), "interrupt context outside an interrupt");
        Self { sched, irq }
    }

    /// Source being serviced; `None` inside the tick hook or an ad-hoc body.
    pub fn irq(&self) -> Option<Irq> {
        self.irq
    }

    pub fn now(&self) -> Tick {
        self.sched.now()
    }

    /// Task that was running when the interrupt arrived.
    pub fn interrupted_task(&self) -> Option<TaskId> {
        self.sched.current()
    }

    pub fn timers(&self) -> Option<TimerService> {
        self.sched.timers.clone()
    }

    pub fn notify_from_isr(
        &mut self,
        target: TaskId,
        action: NotifyAction,
    ) -> Result<SwitchRequest, NotifyError> {
        notify::deliver(self.sched, target, action).map(SwitchRequest::from)
    }

    pub fn notify_give_from_isr(&mut self, target: TaskId) -> Result<SwitchRequest, NotifyError> {
        self.notify_from_isr(target, NotifyAction::Increment)
    }

    pub fn resume_from_isr(&mut self, task: TaskId) -> Result<SwitchRequest, KernelError> {
        self.sched.resume(task).map(SwitchRequest::from)
    }

    pub(crate) fn wake_one(&mut self, channel: Channel, value: u32) -> SwitchRequest {
        self.sched
            .wake_one(channel, value)
            .map_or(SwitchRequest::NONE, |woken| {
                SwitchRequest::from(woken.preempts)
            })
    }
}
