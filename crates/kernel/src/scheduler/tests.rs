use alloc::sync::Arc;

use super::*;
use crate::memory::test_support::init_test_memory;
use crate::task::Task;
use crate::thread::Thread;

fn kernel_entry(_: usize) -> ! {
    unreachable!()
}

fn test_thread(task: &Arc<Task>, name: &str) -> Arc<Thread> {
    Thread::spawn_kernel(task, kernel_entry, 0, name.try_into().unwrap()).unwrap()
}

fn test_task(name: &str) -> Arc<Task> {
    init_test_memory();
    Task::create_kernel(name.try_into().unwrap()).unwrap()
}

#[test]
fn most_urgent_band_wins() {
    let task = test_task("sched-bands");
    let urgent = test_thread(&task, "urgent");
    let lazy = test_thread(&task, "lazy");
    urgent.set_band(1);
    lazy.set_band(5);

    let mut queues = RunQueues::new();
    queues.push(lazy.clone(), lazy.band());
    queues.push(urgent.clone(), urgent.band());

    let first = queues.pop_highest().unwrap();
    assert_eq!(first.tid(), urgent.tid());
    let second = queues.pop_highest().unwrap();
    assert_eq!(second.tid(), lazy.tid());
    assert!(queues.pop_highest().is_none());
}

#[test]
fn same_band_is_fifo() {
    let task = test_task("sched-fifo");
    let a = test_thread(&task, "a");
    let b = test_thread(&task, "b");

    let mut queues = RunQueues::new();
    queues.push(a.clone(), 4);
    queues.push(b.clone(), 4);

    assert_eq!(queues.pop_highest().unwrap().tid(), a.tid());
    assert_eq!(queues.pop_highest().unwrap().tid(), b.tid());
}

#[test]
fn load_tracks_queue_contents() {
    let task = test_task("sched-load");
    let mut queues = RunQueues::new();
    assert!(queues.is_empty());

    queues.push(test_thread(&task, "one"), 3);
    queues.push(test_thread(&task, "two"), 9);
    assert_eq!(queues.load, 2);

    queues.pop_highest();
    assert_eq!(queues.load, 1);
}

#[test]
fn steal_takes_the_least_urgent_tail() {
    let task = test_task("sched-steal");
    let urgent = test_thread(&task, "urgent");
    let lazy_head = test_thread(&task, "lazy-head");
    let lazy_tail = test_thread(&task, "lazy-tail");

    let mut queues = RunQueues::new();
    queues.push(urgent.clone(), 2);
    queues.push(lazy_head.clone(), 12);
    queues.push(lazy_tail.clone(), 12);

    let (stolen, band) = queues.steal_tail().unwrap();
    assert_eq!(stolen.tid(), lazy_tail.tid());
    assert_eq!(band, 12);
    assert_eq!(queues.load, 2);
}

#[test]
fn steal_skips_wired_threads() {
    let task = test_task("sched-wired");
    let wired = test_thread(&task, "wired");
    wired.wire_to_cpu(0);

    let mut queues = RunQueues::new();
    queues.push(wired.clone(), 8);
    assert!(queues.steal_tail().is_none());
    assert_eq!(queues.load, 1);
}

#[test]
fn quantum_grows_with_urgency() {
    assert!(quantum_slices(0) > quantum_slices(DEFAULT_BAND));
    assert!(quantum_slices(DEFAULT_BAND) > quantum_slices((N_PRIO - 1) as u8));
    assert_eq!(quantum_slices((N_PRIO - 1) as u8), 1);
}

#[test]
fn quantum_expiry_demotes_on_requeue() {
    let task = test_task("sched-demote");
    let thread = test_thread(&task, "spinner");
    assert_eq!(thread.band(), DEFAULT_BAND);

    thread.set_quantum_expired();
    let mut band = thread.band();
    if thread.take_quantum_expired() {
        band = (band + 1).min((N_PRIO - 1) as u8);
        thread.set_band(band);
    }
    assert_eq!(thread.band(), DEFAULT_BAND + 1);

    // demotion is bounded at the least urgent band
    thread.set_band((N_PRIO - 1) as u8);
    thread.set_quantum_expired();
    let mut band = thread.band();
    if thread.take_quantum_expired() {
        band = (band + 1).min((N_PRIO - 1) as u8);
        thread.set_band(band);
    }
    assert_eq!(thread.band(), (N_PRIO - 1) as u8);
}

#[test]
fn migration_respects_the_cap_and_balance() {
    init_test_memory();
    let task = test_task("sched-migrate");
    let src = &cpu::all()[0];
    let dst = &cpu::all()[1];

    // drain any state left over from sibling tests
    while src.runqueues.lock().pop_highest().is_some() {}
    while dst.runqueues.lock().pop_highest().is_some() {}

    for _ in 0..6 {
        let thread = test_thread(&task, "migrant");
        src.runqueues.lock().push(thread, 10);
    }

    let moved = migrate(src, dst, MIGRATION_CAP);
    assert!(moved <= MIGRATION_CAP);
    // migration stops once the imbalance is gone
    let src_load = src.runqueues.lock().load;
    let dst_load = dst.runqueues.lock().load;
    assert!(src_load + BALANCE_THRESHOLD > dst_load);

    while src.runqueues.lock().pop_highest().is_some() {}
    while dst.runqueues.lock().pop_highest().is_some() {}
}

#[test]
fn migrating_to_self_is_refused() {
    init_test_memory();
    let cpu0 = &cpu::all()[0];
    assert_eq!(migrate(cpu0, cpu0, MIGRATION_CAP), 0);
}
