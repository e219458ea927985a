//! Message queue and semaphore behaviour.

use std::sync::{Arc, Mutex};

use rtk::{
    Full, Kernel, KernelConfig, Priority, Queue, Semaphore, SwitchRequest, TaskAction, TaskConfig,
    TaskContext, Timeout, Wait,
};

fn kernel() -> Kernel {
    let config = KernelConfig::builder().use_timers(false).build().unwrap();
    Kernel::new(config).unwrap()
}

/// Sends `values` in order, blocking as needed, then exits.
fn producer<T>(
    queue: Queue<T>,
    values: Vec<T>,
) -> impl FnMut(&mut TaskContext<'_>) -> TaskAction + Send + 'static
where
    T: Clone + Send + 'static,
{
    let mut next = 0;
    move |ctx| loop {
        let Some(value) = values.get(next) else {
            return TaskAction::Exit;
        };
        match queue.send(ctx, value, Timeout::Forever) {
            Wait::Done(()) => next += 1,
            Wait::Blocked => return TaskAction::Blocked,
            Wait::TimedOut => return TaskAction::Continue,
        }
    }
}

#[test]
fn items_arrive_in_order_and_count_stays_bounded() {
    const CAPACITY: usize = 3;
    let queue = Queue::new(CAPACITY).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let mut kernel = kernel();

    kernel
        .spawn(TaskConfig::new(
            "producer",
            Priority(2),
            producer(queue.clone(), (0..20).collect::<Vec<u32>>()),
        ))
        .unwrap();

    let rx = queue.clone();
    let sink = Arc::clone(&received);
    kernel
        .spawn(TaskConfig::new("consumer", Priority(1), move |ctx| {
            assert!(rx.len() <= CAPACITY);
            match rx.receive(ctx, Timeout::Forever) {
                Wait::Done(value) => {
                    let mut sink = sink.lock().unwrap();
                    sink.push(value);
                    if sink.len() == 20 {
                        TaskAction::Exit
                    } else {
                        TaskAction::Continue
                    }
                }
                Wait::Blocked => TaskAction::Blocked,
                Wait::TimedOut => TaskAction::Continue,
            }
        }))
        .unwrap();

    kernel.run_until_idle(200).unwrap();

    assert_eq!(*received.lock().unwrap(), (0..20).collect::<Vec<u32>>());
    assert!(queue.is_empty());
}

#[test]
fn blocked_sender_completes_after_higher_priority_receive() {
    let queue = Queue::new(1).unwrap();
    let got = Arc::new(Mutex::new(None));
    let mut kernel = kernel();

    kernel
        .spawn(TaskConfig::new(
            "A",
            Priority(1),
            producer(queue.clone(), vec![7u32, 8]),
        ))
        .unwrap();

    let rx = queue.clone();
    let seen = Arc::clone(&got);
    kernel
        .spawn(TaskConfig::new("B", Priority(2), move |ctx| {
            match rx.receive(ctx, Timeout::Forever) {
                Wait::Done(value) => {
                    *seen.lock().unwrap() = Some(value);
                    TaskAction::Exit
                }
                Wait::Blocked => TaskAction::Blocked,
                Wait::TimedOut => TaskAction::Continue,
            }
        }))
        .unwrap();

    kernel.run_until_idle(20).unwrap();

    assert_eq!(*got.lock().unwrap(), Some(7));
    assert_eq!(queue.len(), 1);
    let remaining = {
        let queue = queue.clone();
        let mut item = None;
        kernel.interrupt(|isr| {
            let (value, switch) = queue.receive_from_isr(isr).unwrap();
            item = Some(value);
            switch
        });
        item
    };
    assert_eq!(remaining, Some(8));
}

#[test]
fn equal_priority_senders_are_served_in_arrival_order() {
    let queue = Queue::new(1).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut kernel = kernel();

    kernel
        .spawn(TaskConfig::new(
            "p1",
            Priority(1),
            producer(queue.clone(), vec!["p1-a", "p1-b"]),
        ))
        .unwrap();
    kernel
        .spawn(TaskConfig::new(
            "p2",
            Priority(1),
            producer(queue.clone(), vec!["p2"]),
        ))
        .unwrap();

    let rx = queue.clone();
    let sink = Arc::clone(&log);
    let mut started = false;
    kernel
        .spawn(TaskConfig::new("consumer", Priority(3), move |ctx| {
            if !started {
                match ctx.delay(1) {
                    Wait::Blocked => return TaskAction::Blocked,
                    _ => started = true,
                }
            }
            match rx.receive(ctx, Timeout::Forever) {
                Wait::Done(value) => {
                    sink.lock().unwrap().push(value);
                    TaskAction::Continue
                }
                Wait::Blocked => TaskAction::Blocked,
                Wait::TimedOut => TaskAction::Continue,
            }
        }))
        .unwrap();

    kernel.run_ticks(2).unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["p1-a", "p1-b", "p2"]);
}

#[test]
fn receive_times_out_on_an_empty_queue() {
    let queue = Queue::<u8>::new(2).unwrap();
    let outcome = Arc::new(Mutex::new(None));
    let mut kernel = kernel();

    let seen = Arc::clone(&outcome);
    kernel
        .spawn(TaskConfig::new("waiter", Priority(1), move |ctx| {
            match queue.receive(ctx, Timeout::Ticks(3)) {
                Wait::Blocked => TaskAction::Blocked,
                Wait::TimedOut => {
                    *seen.lock().unwrap() = Some(ctx.now());
                    TaskAction::Exit
                }
                Wait::Done(_) => panic!("nothing was sent"),
            }
        }))
        .unwrap();

    kernel.run_ticks(2).unwrap();
    assert_eq!(*outcome.lock().unwrap(), None);
    kernel.run_ticks(1).unwrap();
    assert_eq!(*outcome.lock().unwrap(), Some(3));
}

#[test]
fn front_insertion_peek_overwrite_and_reset() {
    let queue = Queue::new(3).unwrap();
    let mailbox = Queue::new(1).unwrap();
    let checked = Arc::new(Mutex::new(false));
    let mut kernel = kernel();

    let done = Arc::clone(&checked);
    kernel
        .spawn(TaskConfig::new("checker", Priority(1), move |ctx| {
            assert!(queue.send(ctx, &1u32, Timeout::NoWait).is_done());
            assert!(queue.send(ctx, &2, Timeout::NoWait).is_done());
            assert!(queue.send_to_front(ctx, &0, Timeout::NoWait).is_done());
            assert!(queue.send(ctx, &3, Timeout::NoWait).is_timed_out());
            assert_eq!(queue.spaces(), 0);

            assert_eq!(queue.peek(ctx, Timeout::NoWait), Wait::Done(0));
            assert_eq!(queue.len(), 3);
            for expected in 0..3 {
                assert_eq!(queue.receive(ctx, Timeout::NoWait), Wait::Done(expected));
            }

            mailbox.overwrite(ctx, &5u32);
            mailbox.overwrite(ctx, &6);
            assert_eq!(mailbox.len(), 1);
            assert_eq!(mailbox.peek(ctx, Timeout::NoWait), Wait::Done(6));

            assert!(queue.send(ctx, &9, Timeout::NoWait).is_done());
            queue.reset(ctx);
            assert!(queue.is_empty());

            *done.lock().unwrap() = true;
            TaskAction::Exit
        }))
        .unwrap();

    kernel.run_until_idle(4).unwrap();
    assert!(*checked.lock().unwrap());
}

#[test]
fn interrupt_send_requests_a_switch_for_a_higher_priority_receiver() {
    let queue = Queue::new(1).unwrap();
    let mut kernel = kernel();

    let rx = queue.clone();
    kernel
        .spawn(TaskConfig::new("receiver", Priority(2), move |ctx| {
            match rx.receive(ctx, Timeout::Forever) {
                Wait::Blocked => TaskAction::Blocked,
                _ => TaskAction::Continue,
            }
        }))
        .unwrap();
    kernel
        .spawn(TaskConfig::new("busy", Priority(1), |_| {
            TaskAction::Continue
        }))
        .unwrap();
    assert_eq!(kernel.run_until_idle(3).unwrap(), 3);

    let tx = queue.clone();
    assert!(kernel.interrupt(|isr| tx.send_from_isr(isr, &1u8).unwrap()));
    assert!(kernel.switch_pending());

    let tx = queue.clone();
    let mut rejected = None;
    let switched = kernel.interrupt(|isr| {
        rejected = Some(tx.send_from_isr(isr, &2));
        SwitchRequest::NONE
    });
    assert!(!switched);
    assert_eq!(rejected, Some(Err(Full)));

    let empty = Queue::<u8>::new(1).unwrap();
    let mut nothing = false;
    kernel.interrupt(|isr| {
        nothing = empty.receive_from_isr(isr).is_none();
        SwitchRequest::NONE
    });
    assert!(nothing);
    assert_eq!(queue.len(), 1);
}

#[test]
fn counting_semaphore_counts_gives_and_takes() {
    let sem = Semaphore::counting(3, 1).unwrap();
    let taken = Arc::new(Mutex::new(0));
    let mut kernel = kernel();

    let giver = sem.clone();
    kernel.interrupt(|isr| {
        let mut request = SwitchRequest::NONE;
        request |= giver.give_from_isr(isr).unwrap();
        request |= giver.give_from_isr(isr).unwrap();
        assert_eq!(giver.give_from_isr(isr), Err(Full));
        request
    });
    assert_eq!(sem.count(), 3);

    let taker = sem.clone();
    let seen = Arc::clone(&taken);
    kernel
        .spawn(TaskConfig::new("taker", Priority(1), move |ctx| {
            match taker.take(ctx, Timeout::Ticks(2)) {
                Wait::Done(()) => {
                    *seen.lock().unwrap() += 1;
                    TaskAction::Continue
                }
                Wait::Blocked => TaskAction::Blocked,
                Wait::TimedOut => TaskAction::Exit,
            }
        }))
        .unwrap();

    kernel.run_ticks(3).unwrap();
    assert_eq!(*taken.lock().unwrap(), 3);
    assert_eq!(sem.count(), 0);
}

#[test]
fn binary_semaphore_gives_do_not_accumulate() {
    let sem = Semaphore::binary().unwrap();
    let results = Arc::new(Mutex::new(Vec::new()));
    let mut kernel = kernel();

    let s = sem.clone();
    let out = Arc::clone(&results);
    kernel
        .spawn(TaskConfig::new("giver", Priority(1), move |ctx| {
            let mut out = out.lock().unwrap();
            out.push(s.give(ctx));
            out.push(s.give(ctx));
            TaskAction::Exit
        }))
        .unwrap();

    kernel.run_until_idle(2).unwrap();
    assert_eq!(*results.lock().unwrap(), vec![Ok(()), Err(Full)]);
    assert_eq!(sem.count(), 1);
}

#[test]
fn interrupt_overwrite_wakes_a_receiver_with_the_latest_value() {
    let mailbox = Queue::<u8>::new(1).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let counts = Arc::new(Mutex::new(None));
    let mut kernel = kernel();

    for name in ["r1", "r2"] {
        let rx = mailbox.clone();
        let out = Arc::clone(&received);
        kernel
            .spawn(TaskConfig::new(name, Priority(2), move |ctx| {
                match rx.receive(ctx, Timeout::Forever) {
                    Wait::Done(value) => {
                        out.lock().unwrap().push(format!("{name}:{value}"));
                        TaskAction::Exit
                    }
                    Wait::Blocked => TaskAction::Blocked,
                    Wait::TimedOut => TaskAction::Exit,
                }
            }))
            .unwrap();
    }
    let observed = mailbox.clone();
    let out = Arc::clone(&counts);
    kernel
        .spawn(TaskConfig::new("observer", Priority(1), move |ctx| {
            *out.lock().unwrap() = Some((
                observed.blocked_receivers(ctx),
                observed.blocked_senders(ctx),
            ));
            TaskAction::Exit
        }))
        .unwrap();
    kernel.run_until_idle(10).unwrap();
    assert_eq!(*counts.lock().unwrap(), Some((2, 0)));

    let tx = mailbox.clone();
    let switch = kernel.interrupt(|isr| {
        let request = tx.overwrite_from_isr(isr, &9);
        request | tx.overwrite_from_isr(isr, &10)
    });
    assert!(switch);
    kernel.run_until_idle(10).unwrap();

    // Both receivers were woken, but the slot held one value; the second
    // finds it empty and waits again.
    assert_eq!(*received.lock().unwrap(), vec!["r1:10"]);
    assert!(mailbox.is_empty());
    assert_eq!(
        kernel.task_state(rtk::TaskId(1)),
        Some(rtk::TaskState::Blocked)
    );
}

#[test]
fn polling_another_queue_keeps_the_receive_deadline() {
    let urgent = Queue::<u8>::new(1).unwrap();
    let normal = Queue::<u8>::new(1).unwrap();
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let mut kernel = kernel();

    let seen = Arc::clone(&outcomes);
    kernel
        .spawn(TaskConfig::new("poller", Priority(1), move |ctx| {
            if let Wait::Done(value) = urgent.receive(ctx, Timeout::NoWait) {
                panic!("urgent queue stays empty, got {value}");
            }
            match normal.receive(ctx, Timeout::Ticks(3)) {
                Wait::Blocked => TaskAction::Blocked,
                Wait::TimedOut => {
                    seen.lock().unwrap().push(ctx.now());
                    TaskAction::Exit
                }
                Wait::Done(_) => panic!("nothing was sent"),
            }
        }))
        .unwrap();

    kernel.run_ticks(20).unwrap();

    assert_eq!(*outcomes.lock().unwrap(), vec![3]);
}
