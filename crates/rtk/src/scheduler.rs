//! Scheduler core: task table, registries, blocking and waking, the time
//! base and priority inheritance.
//!
//! The scheduler is owned by a [`Kernel`](crate::kernel::Kernel) and reached
//! by primitives through a [`TaskContext`](crate::context::TaskContext) or an
//! [`IsrContext`](crate::context::IsrContext).

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::config::KernelConfig;
use crate::console::ConsoleSink;
use crate::critical;
use crate::daemon::TimerService;
use crate::error::KernelError;
use crate::registry::{
    Channel, DelayedList, ObjectId, ReadyLists, WaitCondition, WaitList, WaitOutcome, WaitRecord,
    Waiter,
};
use crate::task::{Priority, Stack, TaskAction, TaskBody, TaskConfig, TaskId, TaskState, Tcb};
use crate::time::Tick;
use crate::trace::{records, TraceHook};

/// A task made ready by an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Woken {
    pub(crate) task: TaskId,
    /// Outranks the running task.
    pub(crate) preempts: bool,
}

pub(crate) struct Scheduler {
    config: KernelConfig,
    tasks: Vec<Tcb>,
    ready: ReadyLists,
    delayed: DelayedList,
    waits: BTreeMap<Channel, WaitList>,
    owners: BTreeMap<ObjectId, TaskId>,
    current: Option<TaskId>,
    tick: Tick,
    seq: u64,
    switch_pending: bool,
    in_isr: bool,
    started: bool,
    live_tasks: usize,
    heap_used: usize,
    trace: Option<TraceHook>,
    pub(crate) console: Option<Box<dyn ConsoleSink + Send>>,
    pub(crate) timers: Option<TimerService>,
}

fn id_payload(task: TaskId) -> [u8; 2] {
    task.0.to_le_bytes()
}

impl Scheduler {
    pub(crate) fn new(config: KernelConfig, trace: Option<TraceHook>) -> Self {
        Self {
            ready: ReadyLists::new(config.max_priorities),
            config,
            tasks: Vec::new(),
            delayed: DelayedList::default(),
            waits: BTreeMap::new(),
            owners: BTreeMap::new(),
            current: None,
            tick: 0,
            seq: 0,
            switch_pending: false,
            in_isr: false,
            started: false,
            live_tasks: 0,
            heap_used: 0,
            trace,
            console: None,
            timers: None,
        }
    }

    pub(crate) fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> Tick {
        self.tick
    }

    pub(crate) fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub(crate) fn started(&self) -> bool {
        self.started
    }

    pub(crate) fn mark_started(&mut self) {
        self.started = true;
    }

    pub(crate) fn heap_used(&self) -> usize {
        self.heap_used
    }

    pub(crate) fn tcb(&self, task: TaskId) -> Option<&Tcb> {
        self.tasks.get(task.index())
    }

    pub(crate) fn tcb_mut(&mut self, task: TaskId) -> Option<&mut Tcb> {
        self.tasks.get_mut(task.index())
    }

    /// Like [`tcb`](Self::tcb) but skips deleted tasks.
    pub(crate) fn live_tcb_mut(&mut self, task: TaskId) -> Option<&mut Tcb> {
        self.tcb_mut(task)
            .filter(|tcb| tcb.state != TaskState::Deleted)
    }

    pub(crate) fn tasks(&self) -> impl Iterator<Item = &Tcb> {
        self.tasks.iter()
    }

    fn task(&self, task: TaskId) -> &Tcb {
        &self.tasks[task.index()]
    }

    fn task_mut(&mut self, task: TaskId) -> &mut Tcb {
        &mut self.tasks[task.index()]
    }

    pub(crate) fn emit(&self, record: u8, payload: &[u8]) {
        if let Some(hook) = &self.trace {
            if let Err(err) = hook(record, payload, true) {
                log::warn!("trace record {record} dropped: {err:?}");
            }
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    // ---------------------------------------------------------------------
    // Task lifecycle

    pub(crate) fn create_task(&mut self, config: TaskConfig) -> Result<TaskId, KernelError> {
        if config.priority.0 >= self.config.max_priorities {
            return Err(KernelError::InvalidParameter("priority out of range"));
        }
        let stack_size = config.stack_size.unwrap_or(self.config.minimal_stack_size);
        if stack_size < self.config.minimal_stack_size {
            return Err(KernelError::InvalidParameter(
                "stack smaller than minimal_stack_size",
            ));
        }
        if self.live_tasks >= self.config.max_tasks {
            return Err(KernelError::ResourceExhausted("task table full"));
        }
        let id = u16::try_from(self.tasks.len())
            .map(TaskId)
            .map_err(|_| KernelError::ResourceExhausted("task identifiers"))?;
        let footprint = stack_size
            .checked_add(core::mem::size_of::<Tcb>())
            .ok_or(KernelError::ResourceExhausted("kernel heap"))?;
        if self.heap_used.saturating_add(footprint) > self.config.heap_size {
            return Err(KernelError::ResourceExhausted("kernel heap"));
        }
        let stack = Stack::allocate(stack_size)?;

        let priority = config.priority;
        let tcb = Tcb::new(id, config, stack, footprint);
        log::debug!(
            "task {} '{}' created at priority {}",
            id,
            tcb.name.as_str(),
            priority
        );
        self.tasks.push(tcb);
        self.heap_used += footprint;
        self.live_tasks += 1;

        self.emit(
            records::sched::TASK_CREATE,
            &[id.0 as u8, (id.0 >> 8) as u8, priority.0],
        );
        if self.make_ready(id) && self.started {
            self.switch_pending = true;
        }
        Ok(id)
    }

    pub(crate) fn delete(&mut self, task: TaskId) -> Result<(), KernelError> {
        let Some(tcb) = self.tcb(task) else {
            return Err(KernelError::InvalidParameter("unknown task"));
        };
        if tcb.state == TaskState::Deleted {
            return Err(KernelError::InvalidState("task already deleted"));
        }
        self.detach(task);
        let tcb = self.task_mut(task);
        tcb.state = TaskState::Deleted;
        tcb.body = None;
        tcb.wait = None;
        tcb.stack = Stack::empty();
        let footprint = tcb.footprint;
        log::debug!("task {} '{}' deleted", task, tcb.name.as_str());
        self.heap_used -= footprint;
        self.live_tasks -= 1;
        if self.current == Some(task) {
            self.switch_pending = true;
        }
        self.emit(records::sched::TASK_DELETE, &id_payload(task));
        Ok(())
    }

    pub(crate) fn suspend(&mut self, task: TaskId) -> Result<(), KernelError> {
        let state = self
            .tcb(task)
            .map(|tcb| tcb.state)
            .ok_or(KernelError::InvalidParameter("unknown task"))?;
        match state {
            TaskState::Deleted => return Err(KernelError::InvalidState("task deleted")),
            TaskState::Suspended => return Ok(()),
            TaskState::Blocked => {
                self.detach(task);
                if let Some(wait) = self.task_mut(task).wait.as_mut() {
                    wait.outcome = WaitOutcome::TimedOut;
                }
            }
            TaskState::Ready | TaskState::Running => {
                let priority = self.task(task).priority;
                self.ready.remove(priority, task);
            }
        }
        self.task_mut(task).state = TaskState::Suspended;
        if self.current == Some(task) {
            self.switch_pending = true;
        }
        log::debug!("task {task} suspended");
        self.emit(records::sched::SUSPEND, &id_payload(task));
        Ok(())
    }

    /// Returns whether the resumed task outranks the running one.
    pub(crate) fn resume(&mut self, task: TaskId) -> Result<bool, KernelError> {
        let state = self
            .tcb(task)
            .map(|tcb| tcb.state)
            .ok_or(KernelError::InvalidParameter("unknown task"))?;
        if state != TaskState::Suspended {
            return Ok(false);
        }
        self.emit(records::sched::RESUME, &id_payload(task));
        Ok(self.make_ready(task))
    }

    pub(crate) fn set_base_priority(
        &mut self,
        task: TaskId,
        priority: Priority,
    ) -> Result<(), KernelError> {
        if priority.0 >= self.config.max_priorities {
            return Err(KernelError::InvalidParameter("priority out of range"));
        }
        let tcb = self
            .live_tcb_mut(task)
            .ok_or(KernelError::InvalidParameter("unknown task"))?;
        tcb.base_priority = priority;
        self.refresh_priority(task);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Dispatch

    /// Picks the next task to run, rotating its level.
    pub(crate) fn select_next(&mut self) -> Option<TaskId> {
        self.ready.select()
    }

    /// Makes `next` the running task.
    pub(crate) fn switch_to(&mut self, next: TaskId) {
        let previous = self.current;
        critical::enter(|| {
            if let Some(prev) = previous.filter(|prev| *prev != next) {
                let tcb = self.task_mut(prev);
                if tcb.state == TaskState::Running {
                    tcb.state = TaskState::Ready;
                }
            }
            let now = self.tick;
            let tcb = self.task_mut(next);
            tcb.state = TaskState::Running;
            tcb.context.last_run = now;
            if previous != Some(next) {
                tcb.context.switches_in += 1;
            }
            self.current = Some(next);
        });
        if previous != Some(next) {
            let from = previous.map_or(u16::MAX, |t| t.0).to_le_bytes();
            let to = next.0.to_le_bytes();
            log::trace!("switch {:?} -> {}", previous, next);
            self.emit(records::sched::SWITCH, &[from[0], from[1], to[0], to[1]]);
        }
    }

    /// Nothing is ready: no task is running until the next selection.
    pub(crate) fn enter_idle(&mut self) {
        if self.current.take().is_some() {
            log::trace!("idle");
        }
        self.emit(records::sched::IDLE, &[]);
    }

    pub(crate) fn take_body(&mut self, task: TaskId) -> Option<TaskBody> {
        self.tcb_mut(task).and_then(|tcb| tcb.body.take())
    }

    /// Stack guard of `task`; deleted tasks have nothing to check.
    pub(crate) fn stack_intact(&self, task: TaskId) -> bool {
        let tcb = self.task(task);
        tcb.state == TaskState::Deleted || tcb.stack.guard_intact()
    }

    pub(crate) fn stack_mut(&mut self, task: TaskId) -> &mut [u8] {
        self.task_mut(task).stack.as_mut_slice()
    }

    /// Puts the body back and applies what the step asked for.
    pub(crate) fn finish_step(&mut self, task: TaskId, body: TaskBody, action: TaskAction) {
        self.task_mut(task).context.steps += 1;
        match action {
            TaskAction::Exit => {
                if self.task(task).state != TaskState::Deleted {
                    // Deleting a live task cannot fail.
                    let _ = self.delete(task);
                }
                return;
            }
            TaskAction::Yield => self.switch_pending = true,
            TaskAction::Continue | TaskAction::Blocked => {}
        }
        let tcb = self.task_mut(task);
        if tcb.state != TaskState::Blocked {
            // Any re-issued call has consumed its record during this step.
            tcb.wait = None;
        }
        if tcb.state != TaskState::Deleted {
            tcb.body = Some(body);
        }
    }

    pub(crate) fn request_switch(&mut self) {
        self.switch_pending = true;
    }

    pub(crate) fn switch_pending(&self) -> bool {
        self.switch_pending
    }

    pub(crate) fn take_switch_request(&mut self) -> bool {
        core::mem::take(&mut self.switch_pending)
    }

    pub(crate) fn enter_isr(&mut self) {
        self.in_isr = true;
    }

    pub(crate) fn leave_isr(&mut self) {
        self.in_isr = false;
    }

    pub(crate) fn in_isr(&self) -> bool {
        self.in_isr
    }

    // ---------------------------------------------------------------------
    // Readiness

    /// Priority of the running task, if one is still running.
    fn running_priority(&self) -> Option<Priority> {
        self.current
            .map(|task| self.task(task))
            .filter(|tcb| tcb.state == TaskState::Running)
            .map(|tcb| tcb.priority)
    }

    fn preempts(&self, priority: Priority) -> bool {
        self.running_priority()
            .is_none_or(|running| priority > running)
    }

    /// Moves `task` into its ready level. Returns whether it outranks the
    /// running task; callers decide how to request the switch.
    pub(crate) fn make_ready(&mut self, task: TaskId) -> bool {
        let tcb = self.task_mut(task);
        tcb.state = TaskState::Ready;
        tcb.wake_at = None;
        let priority = tcb.priority;
        self.ready.push_back(priority, task);
        self.emit(records::sched::READY, &id_payload(task));
        self.preempts(priority)
    }

    /// Blocks the running task on `channel` until woken or `deadline`.
    pub(crate) fn block_current(
        &mut self,
        channel: Channel,
        deadline: Option<Tick>,
        condition: WaitCondition,
    ) {
        let Some(task) = self.current else {
            debug_assert!(false, "block_current without a running task");
            return;
        };
        debug_assert!(!self.in_isr, "blocking call from interrupt context");
        if self.task(task).state == TaskState::Blocked {
            debug_assert!(false, "task {task} blocked twice in one step");
            return;
        }

        let priority = self.task(task).priority;
        self.ready.remove(priority, task);
        let seq = self.next_seq();
        let tcb = self.task_mut(task);
        tcb.state = TaskState::Blocked;
        tcb.wait = Some(WaitRecord {
            channel,
            deadline,
            outcome: WaitOutcome::Pending,
        });

        match channel {
            Channel::Delay => {
                if let Some(at) = deadline {
                    tcb.wake_at = Some(at);
                    self.delayed.insert(at, task);
                }
            }
            _ => {
                self.waits.entry(channel).or_default().insert(Waiter {
                    task,
                    priority,
                    seq,
                    deadline,
                    condition,
                });
            }
        }
        self.switch_pending = true;
        log::trace!("task {task} blocked on {channel:?} until {deadline:?}");
        self.emit(records::sched::BLOCK, &id_payload(task));

        if let Channel::Mutex(mutex) = channel {
            self.donate_to_holder(mutex);
        }
    }

    /// Takes `task` out of the delayed registry or its wait list.
    fn detach(&mut self, task: TaskId) {
        let tcb = self.task_mut(task);
        let (state, priority) = (tcb.state, tcb.priority);
        let wake_at = tcb.wake_at.take();
        let channel = tcb.wait.map(|w| w.channel);
        match state {
            TaskState::Ready | TaskState::Running => {
                self.ready.remove(priority, task);
            }
            TaskState::Blocked => {
                if let Some(at) = wake_at {
                    self.delayed.remove(at, task);
                }
                if let Some(channel) = channel.filter(|c| *c != Channel::Delay) {
                    self.remove_waiter(channel, task);
                }
            }
            TaskState::Suspended | TaskState::Deleted => {}
        }
    }

    fn remove_waiter(&mut self, channel: Channel, task: TaskId) {
        if let Some(list) = self.waits.get_mut(&channel) {
            list.remove(task);
            if list.is_empty() {
                self.waits.remove(&channel);
            }
        }
        if let Channel::Mutex(mutex) = channel {
            self.donate_to_holder(mutex);
        }
    }

    fn resolve(&mut self, task: TaskId, outcome: WaitOutcome) -> bool {
        if let Some(wait) = self.task_mut(task).wait.as_mut() {
            wait.outcome = outcome;
        }
        self.make_ready(task)
    }

    /// Wakes the first waiter on `channel`, handing it `value`.
    pub(crate) fn wake_one(&mut self, channel: Channel, value: u32) -> Option<Woken> {
        let list = self.waits.get_mut(&channel)?;
        let waiter = list.pop_front()?;
        if list.is_empty() {
            self.waits.remove(&channel);
        }
        if let Channel::Mutex(mutex) = channel {
            self.donate_to_holder(mutex);
        }
        log::trace!("task {} woken by {channel:?}", waiter.task);
        let preempts = self.resolve(waiter.task, WaitOutcome::Signaled(value));
        Some(Woken {
            task: waiter.task,
            preempts,
        })
    }

    /// Wakes every waiter on `channel` for which `matches` yields a value,
    /// in wait-list order. Returns whether any of them outranks the running task.
    pub(crate) fn wake_matching(
        &mut self,
        channel: Channel,
        mut matches: impl FnMut(&WaitCondition) -> Option<u32>,
    ) -> bool {
        let Some(list) = self.waits.get(&channel) else {
            return false;
        };
        let chosen: Vec<(TaskId, u32)> = list
            .iter()
            .filter_map(|w| matches(&w.condition).map(|value| (w.task, value)))
            .collect();

        let mut preempts = false;
        for (task, value) in chosen {
            self.remove_waiter(channel, task);
            preempts |= self.resolve(task, WaitOutcome::Signaled(value));
        }
        preempts
    }

    pub(crate) fn waiter_count(&self, channel: Channel) -> usize {
        self.waits.get(&channel).map_or(0, WaitList::len)
    }

    /// Takes the wait record of `task` if it belongs to `channel`. A record
    /// for another channel stays in place until the step ends.
    pub(crate) fn take_wait(&mut self, task: TaskId, channel: Channel) -> Option<WaitRecord> {
        let tcb = self.tcb_mut(task)?;
        match tcb.wait {
            Some(record) if record.channel == channel => tcb.wait.take(),
            _ => None,
        }
    }

    /// Drops the wait record of `task` unless it belongs to `keep`.
    pub(crate) fn abandon_wait(&mut self, task: TaskId, keep: Channel) {
        if let Some(tcb) = self.tcb_mut(task) {
            if tcb.wait.is_some_and(|w| w.channel != keep) {
                tcb.wait = None;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Time base

    /// Advances the tick and readies every task whose deadline passed.
    /// Returns whether one of them outranks the running task.
    pub(crate) fn advance_tick(&mut self) -> bool {
        self.tick += 1;
        let now = self.tick;
        self.emit(records::sched::TICK, &now.to_le_bytes());

        let mut preempts = false;
        for task in self.delayed.expire(now) {
            self.task_mut(task).wake_at = None;
            preempts |= self.resolve(task, WaitOutcome::TimedOut);
        }

        let expired: Vec<(Channel, TaskId)> = self
            .waits
            .iter()
            .flat_map(|(channel, list)| {
                list.expired(now)
                    .into_iter()
                    .map(move |task| (*channel, task))
            })
            .collect();
        for (channel, task) in expired {
            self.remove_waiter(channel, task);
            log::trace!("task {task} timed out on {channel:?}");
            self.emit(records::sched::TIMEOUT, &id_payload(task));
            preempts |= self.resolve(task, WaitOutcome::TimedOut);
        }
        preempts
    }

    // ---------------------------------------------------------------------
    // Priority inheritance

    pub(crate) fn mutex_owner(&self, mutex: ObjectId) -> Option<TaskId> {
        self.owners.get(&mutex).copied()
    }

    pub(crate) fn mutex_acquired(&mut self, mutex: ObjectId, task: TaskId) {
        self.owners.insert(mutex, task);
        self.task_mut(task).held.push(mutex);
        self.refresh_priority(task);
    }

    pub(crate) fn mutex_released(&mut self, mutex: ObjectId, task: TaskId) {
        self.owners.remove(&mutex);
        self.task_mut(task).held.retain(|m| *m != mutex);
        self.refresh_priority(task);
    }

    fn donate_to_holder(&mut self, mutex: ObjectId) {
        if let Some(holder) = self.mutex_owner(mutex) {
            self.refresh_priority(holder);
        }
    }

    /// Base priority raised to the best waiter of every mutex the task holds.
    fn derived_priority(&self, task: TaskId) -> Priority {
        let tcb = self.task(task);
        tcb.held
            .iter()
            .filter_map(|m| self.waits.get(&Channel::Mutex(*m)))
            .filter_map(WaitList::highest_priority)
            .fold(tcb.base_priority, Priority::max)
    }

    /// Recomputes the effective priority of `task` and follows the chain of
    /// holders it is itself waiting on.
    pub(crate) fn refresh_priority(&mut self, task: TaskId) {
        let mut task = task;
        for _ in 0..=self.tasks.len() {
            let new = self.derived_priority(task);
            let old = self.task(task).priority;
            if new == old {
                return;
            }
            self.apply_priority(task, old, new);

            let tcb = self.task(task);
            let waiting_on = tcb
                .wait
                .filter(|_| tcb.state == TaskState::Blocked)
                .map(|w| w.channel);
            match waiting_on {
                Some(Channel::Mutex(mutex)) => match self.mutex_owner(mutex) {
                    Some(holder) => task = holder,
                    None => return,
                },
                _ => return,
            }
        }
    }

    fn apply_priority(&mut self, task: TaskId, old: Priority, new: Priority) {
        let tcb = self.task_mut(task);
        tcb.priority = new;
        let state = tcb.state;
        let channel = tcb.wait.map(|w| w.channel);
        match state {
            TaskState::Ready | TaskState::Running => {
                if self.ready.remove(old, task) {
                    self.ready.push_back(new, task);
                }
                let outranked = self.ready.highest().is_some_and(|top| top > new);
                if (state == TaskState::Ready && self.preempts(new))
                    || (state == TaskState::Running && outranked)
                {
                    self.switch_pending = true;
                }
            }
            TaskState::Blocked => {
                if let Some(channel) = channel.filter(|c| *c != Channel::Delay) {
                    if let Some(list) = self.waits.get_mut(&channel) {
                        list.reprioritize(task, new);
                    }
                }
            }
            TaskState::Suspended | TaskState::Deleted => {}
        }
        log::debug!("task {task} effective priority {old} -> {new}");
        let id = id_payload(task);
        self.emit(records::sched::PRIORITY, &[id[0], id[1], old.0, new.0]);
    }

    // ---------------------------------------------------------------------
    // Diagnostics

    /// Checks that every live task sits in exactly the registry its state
    /// names. Used by tests.
    #[cfg(test)]
    pub(crate) fn registry_consistent(&self) -> bool {
        self.tasks.iter().all(|tcb| {
            let task = tcb.id;
            let in_ready = self.ready.contains(tcb.priority, task);
            let in_delayed = self.delayed.contains(task);
            let in_waits = self
                .waits
                .values()
                .filter(|list| list.iter().any(|w| w.task == task))
                .count();
            let places = usize::from(in_ready) + usize::from(in_delayed) + in_waits;
            match tcb.state {
                TaskState::Ready | TaskState::Running => in_ready && places == 1,
                TaskState::Blocked => !in_ready && places <= 1,
                TaskState::Suspended | TaskState::Deleted => places == 0,
            }
        })
    }
}
