//! Direct task notification.
//!
//! Every task has one 32-bit value and a pending flag. Notifications are
//! coalesced into that slot according to their [`NotifyAction`], never
//! queued. Receiving is done through
//! [`TaskContext::notify_wait`](crate::context::TaskContext::notify_wait) and
//! [`TaskContext::notify_take`](crate::context::TaskContext::notify_take).

use core::fmt;

use crate::registry::Channel;
use crate::scheduler::Scheduler;
use crate::task::TaskId;
use crate::trace::records;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyState {
    NotPending,
    Pending,
}

/// How a notification combines with the target's current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    /// Mark pending without touching the value.
    NoAction,
    SetBits(u32),
    Increment,
    /// Write the value only if nothing is pending.
    OverwriteIfNonePending(u32),
    Overwrite(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyError {
    /// A conditional overwrite found an unread notification.
    AlreadyPending,
    NoSuchTask(TaskId),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::AlreadyPending => write!(f, "a notification is already pending"),
            NotifyError::NoSuchTask(task) => write!(f, "no live task {task}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for NotifyError {}

/// Applies `action` to the target's slot and wakes it if it waits for a
/// notification. Returns whether the target outranks the running task.
pub(crate) fn deliver(
    sched: &mut Scheduler,
    target: TaskId,
    action: NotifyAction,
) -> Result<bool, NotifyError> {
    let tcb = sched
        .live_tcb_mut(target)
        .ok_or(NotifyError::NoSuchTask(target))?;
    let pending = tcb.notify_state == NotifyState::Pending;
    match action {
        NotifyAction::NoAction => {}
        NotifyAction::SetBits(bits) => tcb.notify_value |= bits,
        NotifyAction::Increment => tcb.notify_value = tcb.notify_value.wrapping_add(1),
        NotifyAction::OverwriteIfNonePending(value) => {
            if pending {
                return Err(NotifyError::AlreadyPending);
            }
            tcb.notify_value = value;
        }
        NotifyAction::Overwrite(value) => tcb.notify_value = value,
    }
    tcb.notify_state = NotifyState::Pending;
    let value = tcb.notify_value;

    let mut payload = [0u8; 6];
    payload[..2].copy_from_slice(&target.0.to_le_bytes());
    payload[2..].copy_from_slice(&value.to_le_bytes());
    sched.emit(records::notify::SEND, &payload);

    Ok(sched
        .wake_one(Channel::Notify(target), value)
        .is_some_and(|woken| woken.preempts))
}
