//! Deferred interrupt processing.
//!
//! A periodic "interrupt" is serviced four ways: a binary semaphore, a
//! counting semaphore that latches bursts, a direct task notification, and a
//! function pended to the timer daemon. In each case the handler does the
//! minimum and a task finishes the work outside interrupt context.

use rtk::{
    Deferred, Irq, Kernel, NotifyAction, Priority, Semaphore, SwitchRequest, TaskAction,
    TaskConfig, TaskContext, Timeout, Wait,
};

const BINARY_IRQ: Irq = Irq(1);
const COUNTING_IRQ: Irq = Irq(2);
const NOTIFY_IRQ: Irq = Irq(3);
const DAEMON_IRQ: Irq = Irq(4);

fn handler_task(
    semaphore: Semaphore,
    label: &'static str,
) -> impl FnMut(&mut TaskContext<'_>) -> TaskAction + Send + 'static {
    move |ctx| match semaphore.take(ctx, Timeout::Forever) {
        Wait::Done(()) => {
            println!("[{:>5}] {label}: processing event", ctx.now());
            TaskAction::Continue
        }
        Wait::Blocked => TaskAction::Blocked,
        Wait::TimedOut => TaskAction::Continue,
    }
}

fn deferred_print(ctx: &mut TaskContext<'_>, irq: usize, count: u32) {
    println!(
        "[{:>5}] {}: handling IRQ{irq}, event {count}",
        ctx.now(),
        ctx.name()
    );
}

fn main() {
    println!("=== Deferred Interrupt Processing Example ===\n");

    let binary = Semaphore::binary().expect("create binary semaphore");
    let counting = Semaphore::counting(10, 0).expect("create counting semaphore");

    let mut kernel = Kernel::builder()
        .task(TaskConfig::new(
            "Binary",
            Priority(3),
            handler_task(binary.clone(), "binary"),
        ))
        .task(TaskConfig::new(
            "Counting",
            Priority(3),
            handler_task(counting.clone(), "counting"),
        ))
        .build()
        .expect("build kernel");

    let notified = kernel
        .spawn(TaskConfig::new("Notified", Priority(3), |ctx| {
            // Wait up to 2 s; each wake processes every latched event.
            match ctx.notify_take(true, Timeout::Ticks(2_000)) {
                Wait::Done(events) => {
                    for _ in 0..events {
                        println!("[{:>5}] notified: processing event", ctx.now());
                    }
                    TaskAction::Continue
                }
                Wait::Blocked => TaskAction::Blocked,
                Wait::TimedOut => {
                    println!("[{:>5}] notified: no events within 2 s", ctx.now());
                    TaskAction::Continue
                }
            }
        }))
        .expect("spawn notified task");

    kernel
        .register_interrupt(BINARY_IRQ, move |isr| {
            binary.give_from_isr(isr).unwrap_or(SwitchRequest::NONE)
        })
        .expect("register binary interrupt");
    kernel
        .register_interrupt(COUNTING_IRQ, move |isr| {
            // Simulate a burst of three events.
            let mut request = SwitchRequest::NONE;
            for _ in 0..3 {
                request |= counting.give_from_isr(isr).unwrap_or(SwitchRequest::NONE);
            }
            request
        })
        .expect("register counting interrupt");
    kernel
        .register_interrupt(NOTIFY_IRQ, move |isr| {
            let mut request = SwitchRequest::NONE;
            for _ in 0..3 {
                request |= isr
                    .notify_from_isr(notified, NotifyAction::Increment)
                    .unwrap_or(SwitchRequest::NONE);
            }
            request
        })
        .expect("register notification interrupt");

    let service = kernel.timer_service().expect("timer daemon enabled");
    let mut count = 0;
    kernel
        .register_interrupt(DAEMON_IRQ, move |isr| {
            count += 1;
            let call = Deferred::Function {
                func: deferred_print,
                arg1: usize::from(DAEMON_IRQ.0),
                arg2: count,
            };
            service
                .pend_call_from_isr(isr, call)
                .unwrap_or(SwitchRequest::NONE)
        })
        .expect("register daemon interrupt");

    kernel.start();
    for round in 0..3 {
        kernel.run_for_ms(500).expect("kernel running");
        println!(
            "[{:>5}] periodic: raising interrupts (round {})",
            kernel.now(),
            round + 1
        );
        for irq in [BINARY_IRQ, COUNTING_IRQ, NOTIFY_IRQ, DAEMON_IRQ] {
            let switch = kernel.raise_interrupt(irq).expect("handler registered");
            println!(
                "[{:>5}] periodic: {irq} handled, switch requested: {switch}",
                kernel.now()
            );
        }
    }
    kernel.run_for_ms(2_500).expect("kernel running");

    println!("\nDeferred interrupt example completed");
}
