//! Gatekeeper example: one task owns the console.
//!
//! Two printer tasks queue messages to a low-priority gatekeeper, which is
//! the only task that writes to the console. The tick hook queues its own
//! message every 200 ticks, jumping the queue with a front insertion.

use rtk::{
    Kernel, KernelConfig, Priority, Queue, StdoutSink, SwitchRequest, TaskAction, TaskConfig,
    TaskContext, Tick, Timeout, Wait,
};

const MESSAGES: [&str; 2] = [
    "Task 1 ***************************************\n",
    "Task 2 ---------------------------------------\n",
];

/// Small xorshift generator for pseudo-random pauses.
struct Rng(u32);

impl Rng {
    fn next_below(&mut self, bound: u32) -> u32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        self.0 % bound
    }
}

fn printer(
    queue: Queue<&'static str>,
    message: &'static str,
    seed: u32,
) -> impl FnMut(&mut TaskContext<'_>) -> TaskAction + Send + 'static {
    let mut rng = Rng(seed);
    let mut pause: Option<Tick> = None;
    move |ctx| {
        if pause.is_none() {
            match queue.send(ctx, &message, Timeout::Forever) {
                Wait::Done(()) => pause = Some(Tick::from(rng.next_below(500))),
                Wait::Blocked => return TaskAction::Blocked,
                Wait::TimedOut => return TaskAction::Exit,
            }
        }
        match ctx.delay(pause.unwrap_or(0)) {
            Wait::Blocked => TaskAction::Blocked,
            _ => {
                pause = None;
                TaskAction::Continue
            }
        }
    }
}

fn main() {
    println!("=== Gatekeeper Example ===\n");

    let config = KernelConfig::builder()
        .use_timers(false)
        .build()
        .expect("valid configuration");
    let queue: Queue<&'static str> = Queue::new(5).expect("create print queue");

    let hook_queue = queue.clone();
    let mut hook_count: u32 = 0;
    let gatekeeper_queue = queue.clone();

    let mut kernel = Kernel::builder()
        .with_config(config)
        .console(StdoutSink)
        .tick_hook(move |isr| {
            hook_count += 1;
            if hook_count < 200 {
                return SwitchRequest::NONE;
            }
            hook_count = 0;
            // Dropped when the queue is full; the next period tries again.
            hook_queue
                .send_to_front_from_isr(isr, &"Message printed from the tick hook ###\n")
                .unwrap_or(SwitchRequest::NONE)
        })
        .task(TaskConfig::new("Gatekeeper", Priority::IDLE, move |ctx| {
            match gatekeeper_queue.receive(ctx, Timeout::Forever) {
                Wait::Done(message) => {
                    if let Some(console) = ctx.console() {
                        console.write_str(message);
                    }
                    TaskAction::Continue
                }
                Wait::Blocked => TaskAction::Blocked,
                Wait::TimedOut => TaskAction::Continue,
            }
        }))
        .task(TaskConfig::new(
            "Print1",
            Priority(1),
            printer(queue.clone(), MESSAGES[0], 0x1234_5678),
        ))
        .task(TaskConfig::new(
            "Print2",
            Priority(2),
            printer(queue, MESSAGES[1], 0x8765_4321),
        ))
        .build()
        .expect("build kernel");

    kernel.start();
    kernel.run_for_ms(2_000).expect("kernel halted");

    println!("\nGatekeeper example completed at tick {}", kernel.now());
}
