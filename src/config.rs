//! Constants shared by every subsystem: page geometry, the user/kernel
//! address split, and the PID directory's branching factor.

/// Bytes per page. The coremap, page table and swap store all assume this.
pub const PAGE_SIZE: usize = 4096;

/// Log2 of PAGE_SIZE, used to shift addresses into frame/page indices.
pub const PAGE_SHIFT: u32 = 12;

/// Top of user address space. Faults at or above this are out of bounds.
pub const USERSTACK: u32 = 0x8000_0000;

/// Number of TLB entries a fake or real MMU exposes.
pub const NUM_TLB: usize = 64;

/// Number of pages pre-mapped at the top of a fresh stack.
pub const STACK_PAGES: u32 = 3;

/// Entries per page-table level (10 address bits per level).
pub const PAGE_TABLE_LEVEL_BITS: u32 = 10;
pub const PAGE_TABLE_LEVEL_SIZE: usize = 1 << PAGE_TABLE_LEVEL_BITS;

/// Branching factor of the PID directory tree.
pub const PID_DIR_SIZE: usize = 8;

/// PID 0 is reserved for the kernel process.
pub const KERNEL_PID: i32 = 0;

/// Smallest and largest PID the directory will hand out to user processes.
pub const PID_MIN: i32 = 1;
pub const PID_MAX: i32 = 32_767;

/// Sentinel parent PID meaning "no living parent" (the process is an orphan).
pub const ORPHAN: i32 = -1;

/// Bounds used by execv's argument marshalling.
pub const PATH_MAX: usize = 1024;
pub const ARG_MAX: usize = 64 * 1024;

/// Maximum open files per process, including the console triple 0/1/2.
pub const MAX_OPEN_FILES: usize = 64;

/// Maximum simultaneously live processes (bounds the PID directory's use).
pub const MAX_PROCS: usize = 512;

#[inline]
pub const fn page_round_down(addr: u32) -> u32 {
    addr & !((PAGE_SIZE as u32) - 1)
}

#[inline]
pub const fn page_round_up(addr: u32) -> u32 {
    page_round_down(addr.wrapping_add(PAGE_SIZE as u32 - 1))
}

#[inline]
pub const fn page_offset(addr: u32) -> u32 {
    addr & (PAGE_SIZE as u32 - 1)
}
