//! Interrupt entry, the tick hook and the console sink.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use rtk::{
    BufferSink, Irq, Kernel, KernelConfig, KernelError, Priority, Queue, Semaphore,
    SwitchRequest, TaskAction, TaskConfig, TaskContext, Tick, Timeout, Wait,
};

fn config() -> KernelConfig {
    KernelConfig::builder().use_timers(false).build().unwrap()
}

/// Logs the tick of every successful take.
fn taker(
    semaphore: &Semaphore,
    log: &Arc<Mutex<Vec<Tick>>>,
) -> impl FnMut(&mut TaskContext<'_>) -> TaskAction + Send + 'static {
    let semaphore = semaphore.clone();
    let log = Arc::clone(log);
    move |ctx| match semaphore.take(ctx, Timeout::Forever) {
        Wait::Done(()) => {
            log.lock().unwrap().push(ctx.now());
            TaskAction::Continue
        }
        Wait::Blocked => TaskAction::Blocked,
        Wait::TimedOut => TaskAction::Exit,
    }
}

#[test]
fn registered_handler_defers_work_to_a_task() {
    let semaphore = Semaphore::binary().unwrap();
    let taken = Arc::new(Mutex::new(Vec::new()));
    let sources = Arc::new(Mutex::new(Vec::new()));

    let give = semaphore.clone();
    let seen = Arc::clone(&sources);
    let mut kernel = Kernel::builder()
        .with_config(config())
        .task(TaskConfig::new(
            "handler",
            Priority(3),
            taker(&semaphore, &taken),
        ))
        .interrupt(Irq(5), move |isr| {
            seen.lock().unwrap().push(isr.irq());
            give.give_from_isr(isr).unwrap_or(SwitchRequest::NONE)
        })
        .build()
        .unwrap();
    kernel.run_until_idle(10).unwrap();

    assert!(kernel.raise_interrupt(Irq(5)).unwrap());
    assert!(kernel.switch_pending());
    kernel.run_until_idle(10).unwrap();

    assert_eq!(*taken.lock().unwrap(), vec![0]);
    assert_eq!(*sources.lock().unwrap(), vec![Some(Irq(5))]);
}

#[test]
fn waking_a_lower_priority_task_requests_no_switch() {
    let semaphore = Semaphore::binary().unwrap();
    let taken = Arc::new(Mutex::new(Vec::new()));
    let mut kernel = Kernel::new(config()).unwrap();

    kernel
        .spawn(TaskConfig::new(
            "waiter",
            Priority(1),
            taker(&semaphore, &taken),
        ))
        .unwrap();
    kernel.run_until_idle(10).unwrap();
    kernel
        .spawn(TaskConfig::new("busy", Priority(2), |_| {
            TaskAction::Continue
        }))
        .unwrap();
    kernel.run_until_idle(1).unwrap();

    let give = semaphore.clone();
    assert!(!kernel.interrupt(|isr| give.give_from_isr(isr).unwrap()));
    assert!(taken.lock().unwrap().is_empty());
}

#[test]
fn interrupt_sources_are_checked() {
    let mut kernel = Kernel::new(config()).unwrap();
    kernel
        .register_interrupt(Irq(1), |_| SwitchRequest::NONE)
        .unwrap();

    assert!(matches!(
        kernel.register_interrupt(Irq(1), |_| SwitchRequest::NONE),
        Err(KernelError::InvalidState(_))
    ));
    assert!(matches!(
        kernel.raise_interrupt(Irq(2)),
        Err(KernelError::InvalidParameter(_))
    ));
    assert_eq!(kernel.raise_interrupt(Irq(1)), Ok(false));
    // The handler survives being run.
    assert_eq!(kernel.raise_interrupt(Irq(1)), Ok(false));
}

#[test]
fn handler_switch_requests_are_combined() {
    let first = Semaphore::binary().unwrap();
    let second = Semaphore::binary().unwrap();
    let taken = Arc::new(Mutex::new(Vec::new()));
    let mut kernel = Kernel::new(config()).unwrap();
    kernel
        .spawn(TaskConfig::new(
            "second",
            Priority(2),
            taker(&second, &taken),
        ))
        .unwrap();
    kernel.run_until_idle(10).unwrap();

    let (a, b) = (first.clone(), second.clone());
    let switch = kernel.interrupt(move |isr| {
        // Nobody waits on the first semaphore.
        let mut request = a.give_from_isr(isr).unwrap();
        assert_eq!(request, SwitchRequest::NONE);
        request |= b.give_from_isr(isr).unwrap();
        request
    });
    assert!(switch);
    assert_eq!(first.count(), 1);
}

#[test]
fn tick_hook_runs_in_interrupt_context_every_tick() {
    let queue = Queue::<Tick>::new(4).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let hooks = Arc::new(AtomicU32::new(0));

    let tx = queue.clone();
    let count = Arc::clone(&hooks);
    let rx = queue.clone();
    let out = Arc::clone(&received);
    let mut kernel = Kernel::builder()
        .with_config(config())
        .tick_hook(move |isr| {
            count.fetch_add(1, Ordering::SeqCst);
            assert_eq!(isr.irq(), None);
            if isr.now() % 2 == 0 {
                let now = isr.now();
                tx.send_from_isr(isr, &now).unwrap_or(SwitchRequest::NONE)
            } else {
                SwitchRequest::NONE
            }
        })
        .task(TaskConfig::new("rx", Priority(1), move |ctx| {
            match rx.receive(ctx, Timeout::Forever) {
                Wait::Done(at) => {
                    out.lock().unwrap().push((at, ctx.now()));
                    TaskAction::Continue
                }
                Wait::Blocked => TaskAction::Blocked,
                Wait::TimedOut => TaskAction::Exit,
            }
        }))
        .build()
        .unwrap();

    kernel.run_ticks(6).unwrap();

    assert_eq!(hooks.load(Ordering::SeqCst), 6);
    assert_eq!(*received.lock().unwrap(), vec![(2, 2), (4, 4), (6, 6)]);
}

#[test]
fn run_for_ms_converts_with_the_tick_rate() {
    let config = KernelConfig::builder()
        .use_timers(false)
        .tick_rate_hz(100)
        .build()
        .unwrap();
    let mut kernel = Kernel::new(config).unwrap();
    kernel.run_for_ms(250).unwrap();
    assert_eq!(kernel.now(), 25);
}

#[test]
fn tasks_write_to_the_installed_console() {
    let sink = BufferSink::new();
    let mut kernel = Kernel::builder()
        .with_config(config())
        .console(sink.clone())
        .task(TaskConfig::new("printer", Priority(1), |ctx| {
            let line = format!("{} at {}\n", ctx.name(), ctx.now());
            if let Some(console) = ctx.console() {
                console.write_str(&line);
            }
            TaskAction::Exit
        }))
        .build()
        .unwrap();
    kernel.run_until_idle(5).unwrap();

    if let Some(console) = kernel.console() {
        console.write_bytes(b"done\n");
    }
    assert_eq!(sink.text(), "printer at 0\ndone\n");
    assert_eq!(sink.contents().len(), sink.text().len());
}

#[test]
fn console_is_absent_unless_installed() {
    let mut kernel = Kernel::new(config()).unwrap();
    assert!(kernel.console().is_none());
}

#[test]
fn handlers_see_the_interrupted_task_and_can_resume_tasks() {
    let semaphore = Semaphore::counting(2, 2).unwrap();
    let mut kernel = Kernel::new(config()).unwrap();
    let sleeper = kernel
        .spawn(TaskConfig::new("sleeper", Priority(3), |_| {
            TaskAction::Continue
        }))
        .unwrap();
    let busy = kernel
        .spawn(TaskConfig::new("busy", Priority(1), |_| {
            TaskAction::Continue
        }))
        .unwrap();
    kernel.suspend(sleeper).unwrap();
    kernel.run_until_idle(1).unwrap();

    let sem = semaphore.clone();
    let switch = kernel.interrupt(|isr| {
        assert_eq!(isr.interrupted_task(), Some(busy));
        assert_eq!(sem.take_from_isr(isr), Some(SwitchRequest::NONE));
        assert_eq!(sem.take_from_isr(isr), Some(SwitchRequest::NONE));
        assert_eq!(sem.take_from_isr(isr), None);
        isr.resume_from_isr(sleeper).unwrap()
    });
    assert!(switch);
    assert_eq!(semaphore.count(), 0);
    assert_eq!(semaphore.max_count(), 2);

    kernel.dispatch_once().unwrap();
    assert_eq!(kernel.current(), Some(sleeper));
}
