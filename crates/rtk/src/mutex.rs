//! Priority-inheritance mutex, plain and recursive.
//!
//! While a task holds the mutex and higher-priority tasks wait for it, the
//! holder runs at the priority of its best waiter. The boost is derived by the
//! scheduler from everything the holder currently holds, so releasing one of
//! several mutexes only drops the donations that mutex carried.
//!
//! Circular waits across mutexes are not detected.

use core::fmt;

use crate::context::TaskContext;
use crate::critical::CriticalCell;
use crate::error::KernelError;
use crate::registry::{Channel, ObjectId, WaitCondition};
use crate::sync::Arc;
use crate::task::{TaskId, Wait};
use crate::time::Timeout;
use crate::trace::{object_payload, records};

#[derive(Debug, Default)]
struct Ownership {
    holder: Option<TaskId>,
    count: u32,
}

enum Attempt {
    Acquired,
    Reentered,
    Held(TaskId),
}

struct MutexShared {
    id: ObjectId,
    recursive: bool,
    state: CriticalCell<Ownership>,
}

/// Handle to a mutex; clones refer to the same mutex.
#[derive(Clone)]
pub struct Mutex {
    shared: Arc<MutexShared>,
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("id", &self.shared.id)
            .field("recursive", &self.shared.recursive)
            .field("holder", &self.holder())
            .finish()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Self::with_mode(false)
    }

    /// A mutex its holder may lock again; it is released after as many
    /// unlocks as locks.
    pub fn recursive() -> Self {
        Self::with_mode(true)
    }

    fn with_mode(recursive: bool) -> Self {
        Self {
            shared: Arc::new(MutexShared {
                id: ObjectId::next(),
                recursive,
                state: CriticalCell::new(Ownership::default()),
            }),
        }
    }

    fn id(&self) -> ObjectId {
        self.shared.id
    }

    pub fn is_recursive(&self) -> bool {
        self.shared.recursive
    }

    pub fn holder(&self) -> Option<TaskId> {
        self.shared.state.with(|s| s.holder)
    }

    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }

    /// Current hold count; above one only for a recursive mutex.
    pub fn lock_count(&self) -> u32 {
        self.shared.state.with(|s| s.count)
    }

    /// Takes the mutex, blocking while another task holds it. A blocked
    /// caller lends its priority to the holder.
    pub fn lock(&self, ctx: &mut TaskContext<'_>, timeout: Timeout) -> Wait<()> {
        let channel = Channel::Mutex(self.id());
        let prior = ctx.resume_wait(channel);
        let me = ctx.id();
        let recursive = self.shared.recursive;
        let attempt = self.shared.state.with(|s| match s.holder {
            None => {
                s.holder = Some(me);
                s.count = 1;
                Attempt::Acquired
            }
            Some(holder) if holder == me && recursive => {
                s.count += 1;
                Attempt::Reentered
            }
            Some(holder) => Attempt::Held(holder),
        });

        match attempt {
            Attempt::Acquired => {
                ctx.sched.mutex_acquired(self.id(), me);
                ctx.sched.emit(
                    records::mutex::LOCK,
                    &object_payload(self.id().raw(), u32::from(me.0)),
                );
                Wait::Done(())
            }
            Attempt::Reentered => Wait::Done(()),
            Attempt::Held(holder) => {
                debug_assert_ne!(holder, me, "non-recursive mutex locked again by its holder");
                ctx.sched.emit(
                    records::mutex::CONTENDED,
                    &object_payload(self.id().raw(), u32::from(holder.0)),
                );
                ctx.block_on(channel, prior, timeout, WaitCondition::Always)
            }
        }
    }

    /// Releases one hold. On the last one the holder's priority is
    /// re-derived and the best waiter is woken to retry.
    pub fn unlock(&self, ctx: &mut TaskContext<'_>) -> Result<(), KernelError> {
        let me = ctx.id();
        let released = self.shared.state.with(|s| {
            if s.holder != Some(me) {
                return None;
            }
            s.count -= 1;
            if s.count == 0 {
                s.holder = None;
            }
            Some(s.count == 0)
        });

        match released {
            None => {
                debug_assert!(false, "mutex unlocked by task {me}, which does not hold it");
                Err(KernelError::InvalidState("mutex not held by caller"))
            }
            Some(false) => Ok(()),
            Some(true) => {
                ctx.sched.mutex_released(self.id(), me);
                ctx.sched.emit(
                    records::mutex::UNLOCK,
                    &object_payload(self.id().raw(), u32::from(me.0)),
                );
                if let Some(next) = ctx.wake_one(Channel::Mutex(self.id()), 0) {
                    log::trace!("mutex {} released by {me}, waking {next}", self.id().raw());
                }
                Ok(())
            }
        }
    }
}
