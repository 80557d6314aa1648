use alloc::sync::{Arc, Weak};

use super::*;
use crate::memory::address_space::AddressSpace;
use crate::memory::test_support::init_test_memory;
use crate::thread::{Thread, ThreadState};
use crate::utils::elf::test_image;

fn kernel_entry(_: usize) -> ! {
    unreachable!()
}

#[test]
fn ids_are_monotonic_and_indexed() {
    init_test_memory();
    let a = Task::create(
        AddressSpace::new().unwrap(),
        "task-a".try_into().unwrap(),
    );
    let b = Task::create(
        AddressSpace::new().unwrap(),
        "task-b".try_into().unwrap(),
    );

    assert!(b.id() > a.id());
    assert!(Arc::ptr_eq(&find(a.id()).unwrap(), &a));
    assert!(Arc::ptr_eq(&find(b.id()).unwrap(), &b));
    assert!(find(u64::MAX).is_none());
}

#[test]
fn kernel_tasks_carry_all_capabilities() {
    init_test_memory();
    let task = Task::create_kernel("caps".try_into().unwrap()).unwrap();
    assert!(task.has_cap(TaskCaps::KILL));
    assert!(task.has_cap(TaskCaps::DEBUG_CONSOLE));
}

#[test]
fn first_thread_becomes_main() {
    init_test_memory();
    let task = Task::create_kernel("main-thr".try_into().unwrap()).unwrap();
    let first = Thread::spawn_kernel(&task, kernel_entry, 0, "first".try_into().unwrap()).unwrap();
    let _second =
        Thread::spawn_kernel(&task, kernel_entry, 0, "second".try_into().unwrap()).unwrap();

    assert!(Arc::ptr_eq(&task.main_thread().unwrap(), &first));
    assert_eq!(task.thread_count(), 2);
}

#[test]
fn kill_unknown_id_is_an_error() {
    init_test_memory();
    assert_eq!(kill(u64::MAX), Err(TaskError::InvalidId));
}

#[test]
fn kill_tears_the_task_down() {
    init_test_memory();
    let task = Task::create_kernel("victim".try_into().unwrap()).unwrap();
    let id = task.id();
    let as_weak: Weak<AddressSpace> = Arc::downgrade(task.address_space());

    let main = Thread::spawn_kernel(&task, kernel_entry, 0, "main".try_into().unwrap()).unwrap();
    let worker_a =
        Thread::spawn_kernel(&task, kernel_entry, 0, "worker-a".try_into().unwrap()).unwrap();
    let worker_b =
        Thread::spawn_kernel(&task, kernel_entry, 0, "worker-b".try_into().unwrap()).unwrap();

    // the workers have already run to completion when the kill lands
    worker_a.finish_exit(0);
    worker_b.finish_exit(0);
    main.finish_exit(7);

    kill(id).unwrap();

    // no new threads, termination requested everywhere, task unpublished
    assert!(!task.accepts_new_threads());
    assert!(worker_a.terminate_requested());
    assert!(worker_b.terminate_requested());
    assert!(find(id).is_none());
    assert!(
        Thread::spawn_kernel(&task, kernel_entry, 0, "late".try_into().unwrap()).is_err()
    );

    // the cleanup joined and released everything but the main thread
    assert_eq!(task.thread_count(), 1);
    assert_eq!(worker_a.state(), ThreadState::Exiting);

    // the killer's half of the teardown
    assert_eq!(main.join().unwrap(), 7);
    task.release_thread(&main);
    assert_eq!(task.thread_count(), 0);

    // once every reference is gone the address space dies with the task
    drop(main);
    drop(worker_a);
    drop(worker_b);
    drop(task);
    assert!(as_weak.upgrade().is_none());
}

#[test]
fn killing_twice_is_idempotent() {
    init_test_memory();
    let task = Task::create_kernel("double".try_into().unwrap()).unwrap();
    let id = task.id();

    kill(id).unwrap();
    // the second kill sees the task gone or the flag set; both are fine
    let _ = kill(id);
    assert!(find(id).is_none());
}

#[test]
fn run_program_builds_the_expected_task() {
    init_test_memory();
    let image_bytes = test_image::build();

    let task = run::run_program(
        &image_bytes,
        "init".try_into().unwrap(),
        &["init", "--first"],
        &[],
    )
    .unwrap();

    // text + data areas, the stack and the control block page
    assert_eq!(task.address_space().area_count(), 4);
    // the main thread plus its killer companion
    assert_eq!(task.thread_count(), 2);
    assert!(task.main_thread().is_some());

    // the control block page is resident and carries argc
    let pcb = task
        .address_space()
        .mapping_find(run::PCB_BASE)
        .and_then(|entry| entry.frame())
        .expect("control block page not resident");
    let bytes = unsafe { crate::memory::frame_bytes(pcb.start_address()) };
    let argc = usize::from_ne_bytes(bytes[..core::mem::size_of::<usize>()].try_into().unwrap());
    assert_eq!(argc, 2);

    // argv[0] points back into the page and reads "init"
    let ptr_size = core::mem::size_of::<usize>();
    let argv_array = usize::from_ne_bytes(
        bytes[ptr_size..2 * ptr_size].try_into().unwrap(),
    );
    let argv0 = {
        let at = argv_array - run::PCB_BASE.into_raw();
        usize::from_ne_bytes(bytes[at..at + ptr_size].try_into().unwrap())
    };
    let argv0_off = argv0 - run::PCB_BASE.into_raw();
    assert_eq!(&bytes[argv0_off..argv0_off + 5], b"init\0");

    // the stack area exists but stays unfaulted until first use
    let stack_base = run::USER_STACK_TOP - run::USER_STACK_SIZE;
    assert!(task
        .address_space()
        .with_area(stack_base, |area| area.size())
        .is_some());
    assert_eq!(
        task.address_space()
            .with_area(stack_base, |area| area.resident_pages())
            .unwrap(),
        0
    );
}
