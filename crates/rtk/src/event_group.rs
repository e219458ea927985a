//! Event groups: a shared 24-bit mask with broadcast wake-up and an atomic
//! set-and-wait rendezvous.

use core::fmt;

use crate::context::{IsrContext, TaskContext};
use crate::critical::CriticalCell;
use crate::daemon::Deferred;
use crate::error::KernelError;
use crate::interrupt::SwitchRequest;
use crate::registry::{Channel, ObjectId, WaitCondition, WaitOutcome};
use crate::scheduler::Scheduler;
use crate::sync::Arc;
use crate::task::Wait;
use crate::time::Timeout;
use crate::trace::{object_payload, records};

pub type EventBits = u32;

/// Bits usable in a group; the top byte is reserved.
pub const EVENT_BITS_MASK: EventBits = 0x00FF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Any of the requested bits.
    Any,
    /// Every requested bit.
    All,
}

fn satisfied(bits: EventBits, mask: EventBits, all: bool) -> bool {
    if all {
        bits & mask == mask
    } else {
        bits & mask != 0
    }
}

struct GroupShared {
    id: ObjectId,
    bits: CriticalCell<EventBits>,
}

/// Handle to an event group; clones refer to the same group.
#[derive(Clone)]
pub struct EventGroup {
    shared: Arc<GroupShared>,
}

impl fmt::Debug for EventGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventGroup")
            .field("id", &self.shared.id)
            .field("bits", &format_args!("{:#08x}", self.get_bits()))
            .finish()
    }
}

impl Default for EventGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl EventGroup {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(GroupShared {
                id: ObjectId::next(),
                bits: CriticalCell::new(0),
            }),
        }
    }

    fn channel(&self) -> Channel {
        Channel::Bits(self.shared.id)
    }

    fn emit(&self, sched: &Scheduler, record: u8, value: EventBits) {
        sched.emit(record, &object_payload(self.shared.id.raw(), value));
    }

    pub fn get_bits(&self) -> EventBits {
        self.shared.bits.with(|bits| *bits)
    }

    /// Sets `mask` and wakes every waiter whose condition now holds. Bits
    /// those waiters asked to clear on exit are cleared before returning.
    /// Returns the group value at that point.
    pub fn set_bits(&self, ctx: &mut TaskContext<'_>, mask: EventBits) -> EventBits {
        let (preempts, value) = self.apply_set(ctx.sched, mask);
        if preempts {
            ctx.sched.request_switch();
        }
        value
    }

    fn apply_set(&self, sched: &mut Scheduler, mask: EventBits) -> (bool, EventBits) {
        let bits = self.shared.bits.with(|bits| {
            *bits |= mask & EVENT_BITS_MASK;
            *bits
        });

        let mut to_clear = 0;
        let preempts = sched.wake_matching(self.channel(), |condition| match *condition {
            WaitCondition::Bits {
                mask,
                all,
                clear_on_exit,
            } if satisfied(bits, mask, all) => {
                if clear_on_exit {
                    to_clear |= mask;
                }
                Some(bits)
            }
            _ => None,
        });

        let value = self.shared.bits.with(|bits| {
            *bits &= !to_clear;
            *bits
        });
        self.emit(sched, records::event_group::SET, value);
        (preempts, value)
    }

    /// Clears `mask`, returning the value before clearing.
    pub fn clear_bits(&self, ctx: &TaskContext<'_>, mask: EventBits) -> EventBits {
        let before = self.shared.bits.with(|bits| {
            let before = *bits;
            *bits &= !(mask & EVENT_BITS_MASK);
            before
        });
        self.emit(ctx.sched, records::event_group::CLEAR, before & !mask);
        before
    }

    /// Sets bits from an interrupt by pending the set to the timer daemon,
    /// so the interrupt never walks the wait list.
    pub fn set_bits_from_isr(
        &self,
        isr: &mut IsrContext<'_>,
        mask: EventBits,
    ) -> Result<SwitchRequest, KernelError> {
        let service = isr
            .timers()
            .ok_or(KernelError::InvalidState("timer service not enabled"))?;
        let group = self.clone();
        service
            .pend_call_from_isr(
                isr,
                Deferred::closure(move |ctx| {
                    group.set_bits(ctx, mask);
                }),
            )
            .map_err(|_| KernelError::ResourceExhausted("timer command queue full"))
    }

    /// Waits until any or all of `mask` are set. Returns the group value at
    /// the moment the condition held, before `clear_on_exit` took effect.
    pub fn wait_bits(
        &self,
        ctx: &mut TaskContext<'_>,
        mask: EventBits,
        mode: WaitMode,
        clear_on_exit: bool,
        timeout: Timeout,
    ) -> Wait<EventBits> {
        let mask = mask & EVENT_BITS_MASK;
        debug_assert!(mask != 0, "waiting for no event bits");
        let all = mode == WaitMode::All;
        let prior = ctx.resume_wait(self.channel());
        if let Some(WaitOutcome::Signaled(value)) = prior.map(|record| record.outcome) {
            self.emit(ctx.sched, records::event_group::WAIT_DONE, value);
            return Wait::Done(value);
        }

        let ready = self.shared.bits.with(|bits| {
            satisfied(*bits, mask, all).then(|| {
                let value = *bits;
                if clear_on_exit {
                    *bits &= !mask;
                }
                value
            })
        });
        match ready {
            Some(value) => {
                self.emit(ctx.sched, records::event_group::WAIT_DONE, value);
                Wait::Done(value)
            }
            None => ctx.block_on(
                self.channel(),
                prior,
                timeout,
                WaitCondition::Bits {
                    mask,
                    all,
                    clear_on_exit,
                },
            ),
        }
    }

    /// Sets `set` and waits for every bit of `wait` as one step: the
    /// rendezvous of several tasks that each own one bit.
    ///
    /// The caller that completes `wait` returns at once and releases all the
    /// others; the `wait` bits are cleared for everyone on the way out.
    pub fn sync(
        &self,
        ctx: &mut TaskContext<'_>,
        set: EventBits,
        wait: EventBits,
        timeout: Timeout,
    ) -> Wait<EventBits> {
        let set = set & EVENT_BITS_MASK;
        let wait = wait & EVENT_BITS_MASK;
        let channel = self.channel();
        match ctx.resume_wait(channel).map(|record| record.outcome) {
            Some(WaitOutcome::Signaled(value)) => return Wait::Done(value),
            Some(_) => {
                // Timed out: the rendezvous may still have completed meanwhile.
                let late = self.shared.bits.with(|bits| {
                    (*bits & wait == wait).then(|| {
                        let value = *bits;
                        *bits &= !wait;
                        value
                    })
                });
                return late.map_or(Wait::TimedOut, Wait::Done);
            }
            None => {}
        }

        let original = self.get_bits();
        let (preempts, _) = self.apply_set(ctx.sched, set);
        if preempts {
            ctx.sched.request_switch();
        }
        if (original | set) & wait == wait {
            self.shared.bits.with(|bits| *bits &= !wait);
            self.emit(ctx.sched, records::event_group::SYNC, original | set);
            return Wait::Done(original | set);
        }
        ctx.block_on(
            channel,
            None,
            timeout,
            WaitCondition::Bits {
                mask: wait,
                all: true,
                clear_on_exit: true,
            },
        )
    }
}
