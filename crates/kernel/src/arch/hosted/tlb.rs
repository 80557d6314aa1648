use crate::memory::address_space::Asid;
use crate::memory::VirtAddr;

pub fn invalidate_all() {}

pub fn invalidate_asid(_asid: Asid) {}

pub fn invalidate_pages(_asid: Asid, _page: VirtAddr, _count: usize) {}
