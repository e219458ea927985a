//! Software timer example.
//!
//! A one-shot and an auto-reload timer share one callback, which tells them
//! apart by name and counts executions in the timer id. The auto-reload
//! timer stops itself after its fifth execution; callbacks run in the daemon
//! task, so the stop command is sent without blocking.

use rtk::{Kernel, Priority, TaskAction, TaskConfig, TaskContext, Timeout, Timer};

fn timer_callback(ctx: &mut TaskContext<'_>, timer: &Timer) {
    let count = timer.id() + 1;
    timer.set_id(count);

    if timer.is_auto_reload() {
        println!("[{:>5}] auto-reload timer callback executing", ctx.now());
        if count == 5 && timer.stop(ctx, Timeout::NoWait).is_timed_out() {
            println!("timer command queue full, could not stop {}", timer.name());
        }
    } else {
        println!("[{:>5}] one-shot timer callback executing", ctx.now());
    }
}

fn main() {
    println!("=== Software Timer Example ===\n");

    let mut kernel = Kernel::builder().build().expect("build kernel");
    let config = kernel.config().clone();
    let service = kernel.timer_service().expect("timer daemon enabled");

    let one_shot = service
        .create_timer("OneShot", config.ms_to_ticks(3_333), false, 0, timer_callback)
        .expect("create one-shot timer");
    let auto_reload = service
        .create_timer("AutoReload", config.ms_to_ticks(500), true, 0, timer_callback)
        .expect("create auto-reload timer");

    let timers = [one_shot.clone(), auto_reload.clone()];
    let mut next = 0;
    kernel
        .spawn(TaskConfig::new("Starter", Priority(1), move |ctx| {
            while let Some(timer) = timers.get(next) {
                if timer.start(ctx, Timeout::Forever).is_blocked() {
                    return TaskAction::Blocked;
                }
                next += 1;
            }
            TaskAction::Exit
        }))
        .expect("spawn starter task");

    kernel.run_for_ms(5_000).expect("kernel running");

    println!(
        "\none-shot ran {} time(s), auto-reload ran {} time(s) and is {}",
        one_shot.id(),
        auto_reload.id(),
        if auto_reload.is_active() { "running" } else { "stopped" }
    );
}
