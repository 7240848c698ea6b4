//! End-to-end scheduling and synchronization scenarios.
//!
//! Each test drives the kernel the way a port would: `dispatch_once` is the
//! context switch, `tick` is the periodic timer interrupt, and calls made
//! directly from the test body play the role of interrupt handlers.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use rex_kernel::{
    Event, EventMode, Kernel, Mailbox, MessageQueue, OsError, Priority, Semaphore, ThreadAction,
    ThreadConfig, ThreadState, Timeout, WaitOrder,
};

type Log = Arc<StdMutex<Vec<&'static str>>>;

fn log() -> Log {
    Arc::new(StdMutex::new(Vec::new()))
}

fn push(log: &Log, entry: &'static str) {
    log.lock().unwrap().push(entry);
}

#[test]
fn round_robin_runs_in_slice_blocks() {
    let k = Kernel::new();
    let trail = log();

    for name in ["a", "b"] {
        let trail = Arc::clone(&trail);
        k.spawn(
            ThreadConfig::new(
                name,
                Priority(10),
                Box::new(move |_| {
                    push(&trail, name);
                    ThreadAction::Continue
                }),
            )
            .with_tick(5),
        )
        .unwrap();
    }

    for _ in 0..20 {
        assert!(k.dispatch_once());
        k.tick();
    }

    let got = trail.lock().unwrap().clone();
    let want: Vec<&str> = ["a"; 5]
        .into_iter()
        .chain(["b"; 5])
        .chain(["a"; 5])
        .chain(["b"; 5])
        .collect();
    assert_eq!(got, want);
    k.assert_consistent();
}

#[test]
fn yield_moves_the_caller_behind_its_peer() {
    let k = Kernel::new();
    let trail = log();

    for name in ["a", "b"] {
        let trail = Arc::clone(&trail);
        k.spawn(ThreadConfig::new(
            name,
            Priority(10),
            Box::new(move |_| {
                push(&trail, name);
                ThreadAction::Yield
            }),
        ))
        .unwrap();
    }

    for _ in 0..6 {
        assert!(k.dispatch_once());
    }
    assert_eq!(*trail.lock().unwrap(), ["a", "b", "a", "b", "a", "b"]);
}

#[test]
fn yield_without_a_peer_is_a_no_op() {
    let k = Kernel::new();
    let runs = Arc::new(AtomicU32::new(0));
    let probe = Arc::clone(&runs);
    k.spawn(ThreadConfig::new(
        "solo",
        Priority(10),
        Box::new(move |ctx| {
            probe.fetch_add(1, Ordering::SeqCst);
            if ctx.iteration() < 3 {
                ThreadAction::Yield
            } else {
                ThreadAction::Exit
            }
        }),
    ))
    .unwrap();

    k.run_until_idle();
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[test]
fn priority_inheritance_boosts_and_reverts_the_owner() {
    let k = Kernel::new();
    let trail = log();
    let mx = rex_kernel::Mutex::create(&k, "shared", WaitOrder::Priority).unwrap();

    // Low-priority owner: takes the lock on its first step, releases on the
    // second.
    let low = {
        let trail = Arc::clone(&trail);
        k.spawn(ThreadConfig::new(
            "low",
            Priority(20),
            Box::new(move |ctx| {
                let k = ctx.kernel();
                if ctx.iteration() == 1 {
                    mx.take(k, Timeout::Poll).unwrap();
                    ThreadAction::Continue
                } else {
                    mx.release(k).unwrap();
                    push(&trail, "low released");
                    ThreadAction::Exit
                }
            }),
        ))
        .unwrap()
    };

    // Let the owner grab the lock before the contenders exist.
    assert!(k.dispatch_once());
    assert_eq!(k.thread_priority(low), Some(Priority(20)));

    let high = {
        let trail = Arc::clone(&trail);
        k.spawn(ThreadConfig::new(
            "high",
            Priority(5),
            Box::new(move |ctx| match mx.take(ctx.kernel(), Timeout::Forever) {
                Err(OsError::WouldBlock) => ThreadAction::Block,
                Ok(()) => {
                    push(&trail, "high acquired");
                    ThreadAction::Exit
                }
                Err(e) => panic!("unexpected {e}"),
            }),
        ))
        .unwrap()
    };
    {
        let trail = Arc::clone(&trail);
        k.spawn(ThreadConfig::new(
            "medium",
            Priority(10),
            Box::new(move |_| {
                push(&trail, "medium ran");
                ThreadAction::Exit
            }),
        ))
        .unwrap();
    }

    // The contender blocks and donates its urgency to the owner.
    assert!(k.dispatch_once());
    assert_eq!(k.thread_state(high), Some(ThreadState::Suspended));
    assert_eq!(k.thread_priority(low), Some(Priority(5)));
    assert_eq!(mx.owner(&k), Ok(Some(low)));
    k.assert_consistent();

    // Boosted, the owner outruns the medium thread and releases; the boost
    // reverts and the lock moves to the head waiter.
    assert!(k.dispatch_once());
    assert_eq!(k.thread_priority(low), Some(Priority(20)));
    assert_eq!(mx.owner(&k), Ok(Some(high)));

    k.run_until_idle();
    assert_eq!(
        *trail.lock().unwrap(),
        ["low released", "high acquired", "medium ran"]
    );
    k.assert_consistent();
}

#[test]
fn equal_priorities_do_not_boost() {
    let k = Kernel::new();
    let mx = rex_kernel::Mutex::create(&k, "m", WaitOrder::Fifo).unwrap();

    let owner = k
        .spawn(ThreadConfig::new(
            "owner",
            Priority(8),
            Box::new(move |ctx| {
                if ctx.iteration() == 1 {
                    mx.take(ctx.kernel(), Timeout::Poll).unwrap();
                    ThreadAction::Continue
                } else {
                    ThreadAction::Yield
                }
            }),
        ))
        .unwrap();
    assert!(k.dispatch_once());

    k.spawn(ThreadConfig::new(
        "peer",
        Priority(8),
        Box::new(move |ctx| match mx.take(ctx.kernel(), Timeout::Forever) {
            Err(OsError::WouldBlock) => ThreadAction::Block,
            _ => ThreadAction::Exit,
        }),
    ))
    .unwrap();

    // Run until the peer has blocked on the lock.
    while mx.waiting(&k).unwrap() == 0 {
        assert!(k.dispatch_once());
    }
    assert_eq!(k.thread_priority(owner), Some(Priority(8)));
    k.assert_consistent();
}

#[test]
fn semaphore_take_times_out_and_settles_the_count() {
    let k = Kernel::new();
    let sem = Semaphore::create(&k, "empty", 0, WaitOrder::Fifo).unwrap();
    let outcome = Arc::new(StdMutex::new(None));

    let taker = {
        let outcome = Arc::clone(&outcome);
        k.spawn(ThreadConfig::new(
            "taker",
            Priority(6),
            Box::new(move |ctx| match sem.take(ctx.kernel(), Timeout::Ticks(100)) {
                Err(OsError::WouldBlock) => ThreadAction::Block,
                result => {
                    *outcome.lock().unwrap() = Some(result);
                    ThreadAction::Exit
                }
            }),
        ))
        .unwrap()
    };

    assert!(k.dispatch_once());
    assert_eq!(sem.waiting(&k), Ok(1));
    assert_eq!(sem.value(&k), Ok(-1));

    for _ in 0..99 {
        k.tick();
    }
    assert!(!k.dispatch_once());
    k.tick();

    // The expiry stamped the wake reason before the thread runs again.
    assert_eq!(k.thread_error(taker), Some(OsError::Timeout));
    assert!(k.dispatch_once());
    assert_eq!(*outcome.lock().unwrap(), Some(Err(OsError::Timeout)));
    assert_eq!(sem.waiting(&k), Ok(0));
    // The pre-charged take is not refunded; the next release rebalances.
    assert_eq!(sem.value(&k), Ok(-1));
    sem.release(&k).unwrap();
    assert_eq!(sem.value(&k), Ok(0));
    k.assert_consistent();
}

#[test]
fn semaphore_priority_queue_wakes_most_urgent_first() {
    let k = Kernel::new();
    let sem = Semaphore::create(&k, "ordered", 0, WaitOrder::Priority).unwrap();
    let trail = log();

    // Arrival order: lazy first. Wake order must follow urgency.
    for (name, prio) in [("lazy", 12u8), ("eager", 6)] {
        let trail = Arc::clone(&trail);
        k.spawn(ThreadConfig::new(
            name,
            Priority(prio),
            Box::new(move |ctx| match sem.take(ctx.kernel(), Timeout::Forever) {
                Err(OsError::WouldBlock) => ThreadAction::Block,
                Ok(()) => {
                    push(&trail, name);
                    ThreadAction::Exit
                }
                Err(e) => panic!("unexpected {e}"),
            }),
        ))
        .unwrap();
        // Let this taker block before the next spawns.
        assert!(k.dispatch_once());
    }
    assert_eq!(sem.waiting(&k), Ok(2));

    sem.release(&k).unwrap();
    sem.release(&k).unwrap();
    k.run_until_idle();
    assert_eq!(*trail.lock().unwrap(), ["eager", "lazy"]);
}

#[test]
fn mailbox_blocking_receive_gets_the_mail() {
    let k = Kernel::new();
    let mb = Mailbox::create(&k, "inbox", 2, WaitOrder::Fifo).unwrap();
    let received = Arc::new(StdMutex::new(None));

    {
        let received = Arc::clone(&received);
        k.spawn(ThreadConfig::new(
            "reader",
            Priority(4),
            Box::new(move |ctx| match mb.recv(ctx.kernel(), Timeout::Forever) {
                Err(OsError::WouldBlock) => ThreadAction::Block,
                result => {
                    *received.lock().unwrap() = Some(result);
                    ThreadAction::Exit
                }
            }),
        ))
        .unwrap();
    }

    assert!(k.dispatch_once());
    assert!(!k.dispatch_once());

    // Posted from interrupt context; never blocks. Waking the reader asks
    // for a switch.
    mb.send(&k, 0xBEEF).unwrap();
    assert!(k.reschedule_requested());
    assert!(k.dispatch_once());
    assert_eq!(*received.lock().unwrap(), Some(Ok(0xBEEF)));
    assert_eq!(mb.len(&k), Ok(0));
    k.assert_consistent();
}

#[test]
fn event_all_with_clear_wakes_on_the_final_bit() {
    let k = Kernel::new();
    let ev = Event::create(&k, "flags", WaitOrder::Fifo).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let waiter = {
        let done = Arc::clone(&done);
        k.spawn(ThreadConfig::new(
            "waiter",
            Priority(6),
            Box::new(
                move |ctx| match ev.recv(ctx.kernel(), 0b0011, EventMode::All, true, Timeout::Forever) {
                    Err(OsError::WouldBlock) => ThreadAction::Block,
                    Ok(_) => {
                        done.store(true, Ordering::SeqCst);
                        ThreadAction::Exit
                    }
                    Err(e) => panic!("unexpected {e}"),
                },
            ),
        ))
        .unwrap()
    };

    assert!(k.dispatch_once());
    assert_eq!(ev.waiting(&k), Ok(1));

    ev.send(&k, 0b0001).unwrap();
    assert_eq!(k.thread_state(waiter), Some(ThreadState::Suspended));
    assert_eq!(ev.set(&k), Ok(0b0001));

    ev.send(&k, 0b0010).unwrap();
    assert_eq!(k.thread_state(waiter), Some(ThreadState::Ready));
    // Clear-on-satisfy consumed the whole interest set.
    assert_eq!(ev.set(&k), Ok(0));

    assert!(k.dispatch_once());
    assert!(done.load(Ordering::SeqCst));
    k.assert_consistent();
}

#[test]
fn deleting_an_object_wakes_waiters_with_error() {
    let k = Kernel::new();
    let sem = Semaphore::create(&k, "doomed", 0, WaitOrder::Fifo).unwrap();
    let outcome = Arc::new(StdMutex::new(None));

    {
        let outcome = Arc::clone(&outcome);
        k.spawn(ThreadConfig::new(
            "waiter",
            Priority(7),
            Box::new(move |ctx| match sem.take(ctx.kernel(), Timeout::Forever) {
                Err(OsError::WouldBlock) => ThreadAction::Block,
                result => {
                    *outcome.lock().unwrap() = Some(result);
                    ThreadAction::Exit
                }
            }),
        ))
        .unwrap();
    }

    assert!(k.dispatch_once());
    sem.delete(&k).unwrap();

    assert!(k.dispatch_once());
    // Torn down, not timed out.
    assert_eq!(*outcome.lock().unwrap(), Some(Err(OsError::Error)));
    k.assert_consistent();
}

#[test]
fn message_queue_blocking_receive_and_urgent_bypass() {
    let k = Kernel::new();
    let mq = MessageQueue::create(&k, "cmds", 8, 4, WaitOrder::Fifo).unwrap();
    let received = Arc::new(StdMutex::new(Vec::new()));

    {
        let received = Arc::clone(&received);
        k.spawn(ThreadConfig::new(
            "worker",
            Priority(5),
            Box::new(move |ctx| {
                let mut buf = [0u8; 8];
                match mq.recv(ctx.kernel(), &mut buf, Timeout::Forever) {
                    Err(OsError::WouldBlock) => ThreadAction::Block,
                    Ok(n) => {
                        received.lock().unwrap().push(buf[..n].to_vec());
                        if received.lock().unwrap().len() < 3 {
                            ThreadAction::Continue
                        } else {
                            ThreadAction::Exit
                        }
                    }
                    Err(e) => panic!("unexpected {e}"),
                }
            }),
        ))
        .unwrap();
    }

    // Receiver parks on the empty queue; the first send hands off directly.
    assert!(k.dispatch_once());
    mq.send(&k, b"normal").unwrap();
    assert!(k.dispatch_once());

    // Now queue two and cut the line.
    mq.send(&k, b"later").unwrap();
    mq.urgent(&k, b"now").unwrap();
    k.run_until_idle();

    let got = received.lock().unwrap().clone();
    assert_eq!(got, vec![b"normal".to_vec(), b"now".to_vec(), b"later".to_vec()]);
    k.assert_consistent();
}

#[test]
fn sleeping_threads_wake_in_tick_order() {
    let k = Kernel::new();
    let trail = log();

    for (name, ticks) in [("slow", 5u32), ("quick", 2)] {
        let trail = Arc::clone(&trail);
        k.spawn(ThreadConfig::new(
            name,
            Priority(9),
            Box::new(move |ctx| match ctx.sleep(ticks) {
                Err(OsError::WouldBlock) => ThreadAction::Block,
                Ok(()) => {
                    push(&trail, name);
                    ThreadAction::Exit
                }
                Err(e) => panic!("unexpected {e}"),
            }),
        ))
        .unwrap();
    }

    // Both park on their timers.
    assert!(k.dispatch_once());
    assert!(k.dispatch_once());
    assert!(!k.dispatch_once());

    for _ in 0..5 {
        k.tick();
        k.run_until_idle();
    }
    assert_eq!(*trail.lock().unwrap(), ["quick", "slow"]);
}

#[test]
fn trace_hook_sees_object_traffic() {
    let k = Kernel::new();
    let records = Arc::new(StdMutex::new(Vec::new()));
    {
        use rex_kernel::TraceEvent;
        let records = Arc::clone(&records);
        k.set_trace_hook(Some(Arc::new(move |event: TraceEvent<'_>| {
            let tag = match event {
                TraceEvent::TryTake { .. } => "trytake",
                TraceEvent::Take { .. } => "take",
                TraceEvent::Put { .. } => "put",
                TraceEvent::Timeout { .. } => "timeout",
            };
            records.lock().unwrap().push(tag);
        })));
    }

    let sem = Semaphore::create(&k, "traced", 1, WaitOrder::Fifo).unwrap();
    sem.take(&k, Timeout::Poll).unwrap();
    sem.release(&k).unwrap();

    assert_eq!(*records.lock().unwrap(), ["trytake", "take", "put"]);
}
