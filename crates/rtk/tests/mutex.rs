//! Priority-inheritance mutex.

use std::sync::{Arc, Mutex as StdMutex};

use rtk::{
    Kernel, KernelConfig, KernelError, Mutex, Priority, TaskAction, TaskConfig, TaskContext,
    TaskState, Tick, Timeout, Wait,
};

type Log = Arc<StdMutex<Vec<String>>>;

/// One step of a scripted task.
enum Op {
    Lock(Mutex, Timeout),
    Unlock(Mutex),
    Delay(Tick),
    Say(&'static str),
    /// Logs `label:effective-priority`.
    Priority(&'static str),
}

fn lock(mutex: &Mutex) -> Op {
    Op::Lock(mutex.clone(), Timeout::Forever)
}

fn unlock(mutex: &Mutex) -> Op {
    Op::Unlock(mutex.clone())
}

fn script(
    ops: Vec<Op>,
    log: &Log,
) -> impl FnMut(&mut TaskContext<'_>) -> TaskAction + Send + 'static {
    let log = Arc::clone(log);
    let mut pc = 0;
    move |ctx| loop {
        let Some(op) = ops.get(pc) else {
            return TaskAction::Exit;
        };
        match op {
            Op::Lock(mutex, timeout) => match mutex.lock(ctx, *timeout) {
                Wait::Done(()) => {}
                Wait::Blocked => return TaskAction::Blocked,
                Wait::TimedOut => log.lock().unwrap().push("timeout".to_owned()),
            },
            Op::Unlock(mutex) => mutex.unlock(ctx).unwrap(),
            Op::Delay(ticks) => {
                if ctx.delay(*ticks).is_blocked() {
                    return TaskAction::Blocked;
                }
            }
            Op::Say(text) => log.lock().unwrap().push((*text).to_owned()),
            Op::Priority(label) => log
                .lock()
                .unwrap()
                .push(format!("{label}:{}", ctx.priority())),
        }
        pc += 1;
    }
}

fn kernel() -> Kernel {
    let config = KernelConfig::builder().use_timers(false).build().unwrap();
    Kernel::new(config).unwrap()
}

fn logged(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[test]
fn holder_inherits_waiter_priority_until_release() {
    let log: Log = Arc::default();
    let m = Mutex::new();
    let mut kernel = kernel();

    let low = kernel
        .spawn(TaskConfig::new(
            "low",
            Priority(1),
            script(
                vec![
                    lock(&m),
                    Op::Delay(2),
                    Op::Priority("low"),
                    unlock(&m),
                    Op::Priority("low"),
                ],
                &log,
            ),
        ))
        .unwrap();
    let high = kernel
        .spawn(TaskConfig::new(
            "high",
            Priority(3),
            script(vec![Op::Delay(1), lock(&m), unlock(&m)], &log),
        ))
        .unwrap();

    kernel.run_ticks(1).unwrap();
    assert_eq!(m.holder(), Some(low));
    assert_eq!(kernel.task_state(high), Some(TaskState::Blocked));
    assert_eq!(kernel.priority(low), Some(Priority(3)));
    assert_eq!(kernel.base_priority(low), Some(Priority(1)));

    kernel.run_ticks(1).unwrap();
    assert_eq!(logged(&log), vec!["low:3", "low:1"]);
    assert!(!m.is_locked());
    assert_eq!(kernel.task_state(high), Some(TaskState::Deleted));
}

#[test]
fn inheritance_keeps_a_medium_task_from_starving_the_holder() {
    let log: Log = Arc::default();
    let m = Mutex::new();
    let mut kernel = kernel();

    kernel
        .spawn(TaskConfig::new(
            "low",
            Priority(1),
            script(
                vec![lock(&m), Op::Delay(1), Op::Say("low unlocks"), unlock(&m)],
                &log,
            ),
        ))
        .unwrap();
    kernel
        .spawn(TaskConfig::new(
            "medium",
            Priority(2),
            script(vec![Op::Delay(1), Op::Say("medium")], &log),
        ))
        .unwrap();
    kernel
        .spawn(TaskConfig::new(
            "high",
            Priority(3),
            script(
                vec![Op::Delay(1), lock(&m), Op::Say("high"), unlock(&m)],
                &log,
            ),
        ))
        .unwrap();

    kernel.run_ticks(1).unwrap();

    assert_eq!(logged(&log), vec!["low unlocks", "high", "medium"]);
}

#[test]
fn timed_out_waiter_withdraws_its_donation() {
    let log: Log = Arc::default();
    let m = Mutex::new();
    let mut kernel = kernel();

    let low = kernel
        .spawn(TaskConfig::new(
            "low",
            Priority(1),
            script(vec![lock(&m), Op::Delay(10), unlock(&m)], &log),
        ))
        .unwrap();
    kernel
        .spawn(TaskConfig::new(
            "high",
            Priority(3),
            script(
                vec![Op::Delay(1), Op::Lock(m.clone(), Timeout::Ticks(2))],
                &log,
            ),
        ))
        .unwrap();

    kernel.run_ticks(1).unwrap();
    assert_eq!(kernel.priority(low), Some(Priority(3)));

    kernel.run_ticks(2).unwrap();
    assert_eq!(logged(&log), vec!["timeout"]);
    assert_eq!(kernel.priority(low), Some(Priority(1)));
    assert_eq!(m.holder(), Some(low));
}

#[test]
fn releasing_one_of_two_mutexes_keeps_the_other_donation() {
    let log: Log = Arc::default();
    let a = Mutex::new();
    let b = Mutex::new();
    let mut kernel = kernel();

    kernel
        .spawn(TaskConfig::new(
            "holder",
            Priority(1),
            script(
                vec![
                    lock(&a),
                    lock(&b),
                    Op::Delay(3),
                    unlock(&a),
                    Op::Priority("holder"),
                    unlock(&b),
                    Op::Priority("holder"),
                ],
                &log,
            ),
        ))
        .unwrap();
    kernel
        .spawn(TaskConfig::new(
            "wants-a",
            Priority(3),
            script(vec![Op::Delay(1), lock(&a), unlock(&a)], &log),
        ))
        .unwrap();
    kernel
        .spawn(TaskConfig::new(
            "wants-b",
            Priority(2),
            script(vec![Op::Delay(1), lock(&b), unlock(&b)], &log),
        ))
        .unwrap();

    kernel.run_ticks(3).unwrap();

    assert_eq!(logged(&log), vec!["holder:2", "holder:1"]);
    assert!(!a.is_locked());
    assert!(!b.is_locked());
}

#[test]
fn donation_follows_a_chain_of_holders() {
    let log: Log = Arc::default();
    let m1 = Mutex::new();
    let m2 = Mutex::new();
    let mut kernel = kernel();

    let low = kernel
        .spawn(TaskConfig::new(
            "low",
            Priority(1),
            script(vec![lock(&m1), Op::Delay(5), unlock(&m1)], &log),
        ))
        .unwrap();
    let mid = kernel
        .spawn(TaskConfig::new(
            "mid",
            Priority(2),
            script(
                vec![lock(&m2), Op::Delay(1), lock(&m1), unlock(&m1), unlock(&m2)],
                &log,
            ),
        ))
        .unwrap();
    let high = kernel
        .spawn(TaskConfig::new(
            "high",
            Priority(3),
            script(vec![Op::Delay(2), lock(&m2), unlock(&m2)], &log),
        ))
        .unwrap();

    kernel.run_ticks(1).unwrap();
    assert_eq!(kernel.priority(low), Some(Priority(2)));

    kernel.run_ticks(1).unwrap();
    assert_eq!(kernel.priority(mid), Some(Priority(3)));
    assert_eq!(kernel.priority(low), Some(Priority(3)));

    kernel.run_ticks(3).unwrap();
    for task in [low, mid, high] {
        assert_eq!(kernel.task_state(task), Some(TaskState::Deleted));
    }
    assert!(!m1.is_locked());
    assert!(!m2.is_locked());
}

#[test]
fn recursive_mutex_is_released_after_the_last_unlock() {
    let log: Log = Arc::default();
    let r = Mutex::recursive();
    let mut kernel = kernel();

    let owner = kernel
        .spawn(TaskConfig::new(
            "owner",
            Priority(1),
            script(
                vec![
                    lock(&r),
                    lock(&r),
                    lock(&r),
                    Op::Delay(1),
                    unlock(&r),
                    unlock(&r),
                    Op::Say("owner unlocked twice"),
                    Op::Delay(1),
                    unlock(&r),
                ],
                &log,
            ),
        ))
        .unwrap();
    kernel
        .spawn(TaskConfig::new(
            "waiter",
            Priority(2),
            script(
                vec![Op::Delay(1), lock(&r), Op::Say("waiter"), unlock(&r)],
                &log,
            ),
        ))
        .unwrap();

    kernel.run_ticks(1).unwrap();
    assert_eq!(r.holder(), Some(owner));
    assert_eq!(r.lock_count(), 1);
    assert_eq!(logged(&log), vec!["owner unlocked twice"]);

    kernel.run_ticks(1).unwrap();
    assert_eq!(logged(&log), vec!["owner unlocked twice", "waiter"]);
    assert!(!r.is_locked());
}

#[test]
#[cfg_attr(debug_assertions, should_panic(expected = "does not hold"))]
fn unlock_by_a_non_holder_is_rejected() {
    let m = Mutex::new();
    let result = Arc::new(StdMutex::new(None));
    let mut kernel = kernel();

    let seen = Arc::clone(&result);
    kernel
        .spawn(TaskConfig::new("intruder", Priority(1), move |ctx| {
            *seen.lock().unwrap() = Some(m.unlock(ctx));
            TaskAction::Exit
        }))
        .unwrap();
    kernel.run_until_idle(1).unwrap();

    assert!(matches!(
        *result.lock().unwrap(),
        Some(Err(KernelError::InvalidState(_)))
    ));
}
