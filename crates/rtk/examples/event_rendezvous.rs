//! Event group example: a three-task rendezvous and bits set from an
//! interrupt.
//!
//! Each syncing task sleeps for a pseudo-random time, then calls `sync` with
//! its own bit. None leaves the sync point until all three have arrived. A
//! separate reader waits for bits that an interrupt handler sets through the
//! timer daemon.

use rtk::{
    EventBits, EventGroup, Irq, Kernel, Priority, SwitchRequest, TaskAction, TaskConfig,
    TaskContext, Tick, Timeout, Wait, WaitMode,
};

const FIRST_TASK_BIT: EventBits = 1 << 0;
const SECOND_TASK_BIT: EventBits = 1 << 1;
const THIRD_TASK_BIT: EventBits = 1 << 2;
const ALL_SYNC_BITS: EventBits = FIRST_TASK_BIT | SECOND_TASK_BIT | THIRD_TASK_BIT;

const ISR_BIT: EventBits = 1 << 8;

fn syncing_task(
    group: EventGroup,
    bit: EventBits,
    seed: u32,
) -> impl FnMut(&mut TaskContext<'_>) -> TaskAction + Send + 'static {
    let mut rng = seed;
    // `Some` while sleeping before the sync point.
    let mut pause: Option<Tick> = None;
    let mut syncing = false;
    move |ctx| {
        if !syncing {
            let delay = *pause.get_or_insert_with(|| {
                rng ^= rng << 13;
                rng ^= rng >> 17;
                rng ^= rng << 5;
                Tick::from(rng % 4_000 + 200)
            });
            if ctx.delay(delay).is_blocked() {
                return TaskAction::Blocked;
            }
            pause = None;
            syncing = true;
            println!("[{:>5}] {} reached sync point", ctx.now(), ctx.name());
        }
        match group.sync(ctx, bit, ALL_SYNC_BITS, Timeout::Forever) {
            Wait::Done(_) => {
                syncing = false;
                println!("[{:>5}] {} exited sync point", ctx.now(), ctx.name());
                TaskAction::Continue
            }
            Wait::Blocked => TaskAction::Blocked,
            Wait::TimedOut => {
                syncing = false;
                TaskAction::Continue
            }
        }
    }
}

fn main() {
    println!("=== Event Group Rendezvous Example ===\n");

    let group = EventGroup::new();
    let reader_group = group.clone();

    let mut kernel = Kernel::builder()
        .task(TaskConfig::new(
            "Task 1",
            Priority(1),
            syncing_task(group.clone(), FIRST_TASK_BIT, 0x2545_F491),
        ))
        .task(TaskConfig::new(
            "Task 2",
            Priority(1),
            syncing_task(group.clone(), SECOND_TASK_BIT, 0x9E37_79B9),
        ))
        .task(TaskConfig::new(
            "Task 3",
            Priority(1),
            syncing_task(group.clone(), THIRD_TASK_BIT, 0x7F4A_7C15),
        ))
        .task(TaskConfig::new("Reader", Priority(2), move |ctx| {
            match reader_group.wait_bits(ctx, ISR_BIT, WaitMode::Any, true, Timeout::Forever) {
                Wait::Done(bits) => {
                    println!(
                        "[{:>5}] reader: bits {bits:#08x} set by the interrupt",
                        ctx.now()
                    );
                    TaskAction::Continue
                }
                Wait::Blocked => TaskAction::Blocked,
                Wait::TimedOut => TaskAction::Continue,
            }
        }))
        .interrupt(Irq(7), move |isr| {
            group
                .set_bits_from_isr(isr, ISR_BIT)
                .unwrap_or(SwitchRequest::NONE)
        })
        .build()
        .expect("build kernel");

    kernel.start();
    for _ in 0..4 {
        kernel.run_for_ms(3_000).expect("kernel running");
        kernel.raise_interrupt(Irq(7)).expect("handler registered");
    }
    kernel.run_for_ms(1_000).expect("kernel running");

    println!("\nEvent group example completed");
}
