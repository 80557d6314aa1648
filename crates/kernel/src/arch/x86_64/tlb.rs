use core::arch::asm;

use crate::memory::address_space::Asid;
use crate::memory::paging::PAGE_SIZE;
use crate::memory::VirtAddr;

/// Flushes the whole TLB by reloading cr3.
pub fn invalidate_all() {
    unsafe {
        asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack),
        );
    }
}

/// x86_64 without PCID cannot flush a single context; the ASID tag only
/// narrows software bookkeeping and the hardware flush is global.
pub fn invalidate_asid(_asid: Asid) {
    invalidate_all();
}

pub fn invalidate_pages(_asid: Asid, page: VirtAddr, count: usize) {
    for i in 0..count {
        let addr = page.into_raw() + i * PAGE_SIZE;
        unsafe {
            asm!("invlpg [{}]", in(reg) addr, options(nostack));
        }
    }
}
