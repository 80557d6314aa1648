//! Loading a program image into a fresh task.

use alloc::sync::Arc;
use alloc::vec::Vec;
use thiserror::Error;

use opal_abi::process::{RawControlBlock, RawInboxEntry};

use crate::memory::address_space::{AddressSpace, AreaError, AreaFlags};
use crate::memory::backend::AreaBackend;
use crate::memory::paging::PAGE_SIZE;
use crate::memory::{frame_bytes, VirtAddr};
use crate::thread::{Thread, ThreadError};
use crate::utils::align_up;
use crate::utils::elf::{ElfError, ElfImage};
use crate::utils::types::Name;
use crate::{debug, scheduler};

use super::Task;

/// Top of the initial user stack.
pub const USER_STACK_TOP: VirtAddr = VirtAddr::from(0x0000_7FFD_0000_0000);
pub const USER_STACK_SIZE: usize = 8 * PAGE_SIZE;
/// Where the process control block page lives.
pub const PCB_BASE: VirtAddr = VirtAddr::from(0x0000_7FFE_0000_0000);
pub const PCB_SIZE: usize = PAGE_SIZE;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SpawnError {
    #[error("bad image: {0}")]
    Elf(#[from] ElfError),
    #[error("address space setup failed: {0}")]
    Area(#[from] AreaError),
    #[error("thread setup failed: {0}")]
    Thread(#[from] ThreadError),
    #[error("control block does not fit its page")]
    ControlBlockTooLarge,
}

/// Copies `bytes` into the address space at `va`, faulting pages in as
/// needed. The range must lie inside a writable area.
pub(crate) fn write_user(
    address_space: &AddressSpace,
    va: VirtAddr,
    bytes: &[u8],
) -> Result<(), AreaError> {
    let mut written = 0;
    while written < bytes.len() {
        let addr = va + written;
        let frame = address_space
            .require_frame(addr, AreaFlags::READ | AreaFlags::WRITE)
            .ok_or(AreaError::NoSuchArea)?;

        let page_offset = addr.into_raw() % PAGE_SIZE;
        let chunk = (PAGE_SIZE - page_offset).min(bytes.len() - written);
        let dst = unsafe { frame_bytes(frame.start_address()) };
        dst[page_offset..page_offset + chunk]
            .copy_from_slice(&bytes[written..written + chunk]);
        written += chunk;
    }
    Ok(())
}

/// Serializes the control block page: argv strings, the cwd, the inbox
/// array and the [`RawControlBlock`] header pointing at them.
fn build_control_block(
    argv: &[&str],
    cwd: &str,
    inbox: &[RawInboxEntry],
) -> Result<(Vec<u8>, usize), SpawnError> {
    let header_size = core::mem::size_of::<RawControlBlock>();
    let ptr_size = core::mem::size_of::<usize>();

    let mut blob = alloc::vec![0u8; header_size];

    // argv pointer array placeholder, patched as the strings are placed
    let argv_array_at = blob.len();
    blob.resize(blob.len() + argv.len() * ptr_size, 0);

    let mut string_addrs = Vec::with_capacity(argv.len());
    for arg in argv {
        string_addrs.push(PCB_BASE.into_raw() + blob.len());
        blob.extend_from_slice(arg.as_bytes());
        blob.push(0);
    }
    for (i, addr) in string_addrs.iter().enumerate() {
        let at = argv_array_at + i * ptr_size;
        blob[at..at + ptr_size].copy_from_slice(&addr.to_ne_bytes());
    }

    let cwd_at = PCB_BASE.into_raw() + blob.len();
    blob.extend_from_slice(cwd.as_bytes());
    blob.push(0);

    while blob.len() % core::mem::align_of::<RawInboxEntry>() != 0 {
        blob.push(0);
    }
    let inbox_at = PCB_BASE.into_raw() + blob.len();
    for entry in inbox {
        let bytes: [u8; core::mem::size_of::<RawInboxEntry>()] =
            unsafe { core::mem::transmute(*entry) };
        blob.extend_from_slice(&bytes);
    }

    let header = RawControlBlock {
        argc: argv.len(),
        argv: PCB_BASE.into_raw() + argv_array_at,
        cwd: cwd_at,
        inbox_len: inbox.len(),
        inbox: inbox_at,
    };
    let header_bytes: [u8; core::mem::size_of::<RawControlBlock>()] =
        unsafe { core::mem::transmute(header) };
    blob[..header_size].copy_from_slice(&header_bytes);

    if blob.len() > PCB_SIZE {
        return Err(SpawnError::ControlBlockTooLarge);
    }
    Ok((blob, header_size))
}

/// Watches the main thread of a freshly spawned task; when it exits, the
/// whole task dies with it.
fn killer_main(arg: usize) -> ! {
    let (task, main): (Arc<Task>, Arc<Thread>) =
        *unsafe { alloc::boxed::Box::from_raw(arg as *mut (Arc<Task>, Arc<Thread>)) };

    let _ = main.join();
    task.release_thread(&main);
    let _ = super::kill(task.id());
    crate::thread::current::exit(0)
}

/// Creates a task running `image_bytes`: image-backed areas for each LOAD
/// segment, an anonymous stack, the control block page, the first thread
/// at the image entry point, and the companion killer thread that takes
/// the task down when the main thread exits.
pub fn run_program(
    image_bytes: &[u8],
    name: Name,
    argv: &[&str],
    inbox: &[RawInboxEntry],
) -> Result<Arc<Task>, SpawnError> {
    let image = ElfImage::load(image_bytes)?;
    let address_space = AddressSpace::new().map_err(|_| AreaError::NoMemory)?;

    for (index, segment) in image.segments().iter().enumerate() {
        address_space.area_create(
            segment.flags,
            align_up(segment.mem_size, PAGE_SIZE),
            segment.vaddr,
            AreaBackend::Image {
                image: image.clone(),
                segment: index,
            },
        )?;
    }

    address_space.area_create(
        AreaFlags::READ | AreaFlags::WRITE | AreaFlags::CACHEABLE,
        USER_STACK_SIZE,
        USER_STACK_TOP - USER_STACK_SIZE,
        AreaBackend::Anonymous,
    )?;

    address_space.area_create(
        AreaFlags::READ | AreaFlags::WRITE | AreaFlags::CACHEABLE,
        PCB_SIZE,
        PCB_BASE,
        AreaBackend::Anonymous,
    )?;
    let (blob, _) = build_control_block(argv, "/", inbox)?;
    write_user(&address_space, PCB_BASE, &blob)?;

    let task = Task::create(address_space, name.clone());

    let main = Thread::spawn_user(
        &task,
        image.entry_point(),
        USER_STACK_TOP,
        PCB_BASE.into_raw(),
        name,
    )?;

    let killer_arg = alloc::boxed::Box::into_raw(alloc::boxed::Box::new((
        task.clone(),
        main.clone(),
    ))) as usize;
    let killer = Thread::spawn_kernel(
        &task,
        killer_main,
        killer_arg,
        "killer".try_into().expect("name fits"),
    )?;

    scheduler::thread_ready(killer);
    scheduler::thread_ready(main);

    debug!(
        Task,
        "task {} running program at {:#x}",
        task.id(),
        image.entry_point()
    );
    Ok(task)
}
