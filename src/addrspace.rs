//! Per-process address space lifecycle and the `vm_fault` entry point,
//! grounded on `original_source/kern/vm/addrspace.c` and `kern/vm/vm.c`.
//! The original `vm_fault` is an unfinished stub (`//TODO attempting to
//! write a readonly page?`); the fault handling below completes it:
//! read/instruction faults grow the stack or fault in a heap page on
//! demand, write faults to a read-only page outside loading are fatal.

use crate::coremap::{Coremap, EvictionHandler};
use crate::config::{page_round_down, page_round_up, PAGE_SIZE, USERSTACK};
use crate::error::{Errno, KResult};
use crate::pagetable::{PageTable, Residency};
use crate::pid::PidDirectory;
use crate::sync::{CondVar, SleepLock, Spinlock};
use crate::swap::SwapStore;
use crate::tlb::{install_line, Tlb, TlbFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    InstructionFetch,
    Write,
}

struct Extents {
    heap_start: u32,
    heap_end: u32,
    stack_base: u32,
}

struct Destruction {
    destroying: bool,
    pending: usize,
}

/// `loading` is a plain bool behind its own short lock: `prepare_load`/
/// `complete_load` bracket ELF segment population, during which writes to
/// read-only pages are allowed.
pub struct AddressSpace {
    pid: i32,
    pub page_table: PageTable,
    extents: Spinlock<Extents>,
    loading: Spinlock<bool>,
    destruction: SleepLock<Destruction>,
    destroy_cv: CondVar,
}

impl AddressSpace {
    pub fn create(pid: i32) -> Self {
        AddressSpace {
            pid,
            page_table: PageTable::new(),
            extents: Spinlock::new(Extents { heap_start: 0, heap_end: 0, stack_base: USERSTACK }),
            loading: Spinlock::new(false),
            destruction: SleepLock::new(Destruction { destroying: false, pending: 0 }),
            destroy_cv: CondVar::new(),
        }
    }

    /// The process this address space belongs to, used by callers that
    /// populate the page table on its behalf (the ELF loader) and must tag
    /// new entries with the real owner rather than the kernel's pid.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Deep-copies `old` into a fresh address space for `new_pid`. Caller is
    /// responsible for installing the result into the destination process
    /// before other threads can observe it, so the evictor can find it
    /// during the copy.
    pub fn copy(old: &AddressSpace, new_pid: i32, coremap: &Coremap, swap: &SwapStore) -> KResult<AddressSpace> {
        let new_as = AddressSpace::create(new_pid);
        {
            let src = old.extents.lock();
            let mut dst = new_as.extents.lock();
            dst.heap_start = src.heap_start;
            dst.heap_end = src.heap_end;
            dst.stack_base = src.stack_base;
        }
        match old.page_table.copy(&new_as.page_table, coremap, swap, new_pid) {
            Ok(()) => Ok(new_as),
            Err(e) => {
                new_as.destroy(coremap, swap);
                Err(e)
            }
        }
    }

    /// Ensures a page-table entry exists and carries the given permissions
    /// for every page in `[floor(vaddr), vaddr+size)`. Updates the heap
    /// extents to sit immediately above the highest region defined so far.
    pub fn define_region(&self, vaddr: u32, size: u32, readable: bool, writeable: bool, executable: bool) {
        let start = page_round_down(vaddr);
        let end = vaddr + size;
        let mut v = start;
        while v < end {
            self.page_table.add(v, readable, writeable, executable);
            v += PAGE_SIZE as u32;
        }
        let mut extents = self.extents.lock();
        if v > extents.heap_start {
            extents.heap_start = v;
            extents.heap_end = v;
        }
    }

    pub fn prepare_load(&self) {
        *self.loading.lock() = true;
    }

    /// Flushes the TLB to re-enforce read-only semantics once segment
    /// population is done.
    pub fn complete_load(&self, tlb: &Spinlock<alloc::boxed::Box<dyn Tlb>>) {
        *self.loading.lock() = false;
        tlb.lock().flush_all();
    }

    /// Sets `stack_base` three pages below `USERSTACK`, defines those pages
    /// RW, and returns the initial stack pointer just below `USERSTACK`.
    /// Heap extents are untouched.
    pub fn define_stack(&self) -> u32 {
        let saved_heap = {
            let e = self.extents.lock();
            (e.heap_start, e.heap_end)
        };
        let stack_base = USERSTACK - crate::config::STACK_PAGES * PAGE_SIZE as u32;
        self.define_region(stack_base, crate::config::STACK_PAGES * PAGE_SIZE as u32, true, true, false);
        let mut e = self.extents.lock();
        e.stack_base = stack_base;
        e.heap_start = saved_heap.0;
        e.heap_end = saved_heap.1;
        USERSTACK
    }

    /// `sbrk(increment)`. Returns the previous break. Newly exposed heap
    /// pages are left unmapped and demand-paged by `vm_fault` on first
    /// touch; shrinking releases any pages that fall entirely above the
    /// new break immediately rather than waiting for eviction.
    pub fn sbrk(&self, increment: i32, coremap: &Coremap, swap: &SwapStore) -> KResult<u32> {
        let mut e = self.extents.lock();
        let old_break = e.heap_end;
        let new_break = if increment >= 0 {
            old_break.checked_add(increment as u32).ok_or(Errno::ENOMEM)?
        } else {
            old_break.checked_sub(increment.unsigned_abs()).ok_or(Errno::EINVAL)?
        };
        if new_break < e.heap_start {
            return Err(Errno::EINVAL);
        }
        if new_break > e.stack_base {
            return Err(Errno::ENOMEM);
        }
        if new_break < old_break {
            let mut page = page_round_up(new_break);
            let top = page_round_up(old_break);
            while page < top {
                self.page_table.remove(coremap, swap, page);
                page += PAGE_SIZE as u32;
            }
        }
        e.heap_end = new_break;
        Ok(old_break)
    }

    /// Flushes the TLB. Skipping the flush when the hardware ASID already
    /// matches `self.pid` is a valid optimization; this implementation
    /// always flushes since the fake TLB has no ASID concept to compare.
    pub fn activate(&self, tlb: &Spinlock<alloc::boxed::Box<dyn Tlb>>) {
        tlb.lock().flush_all();
    }

    pub fn destroy(&self, coremap: &Coremap, swap: &SwapStore) {
        let pending = self.page_table.free_all(coremap, swap);
        let mut d = self.destruction.lock();
        d.destroying = true;
        d.pending = pending;
        drop(d);
        self.destroy_cv.wait_while(|| self.destruction.lock().pending > 0);
    }

    /// Called by the coremap's eviction handler once it has written back
    /// and unmapped a frame that belonged to this address space.
    fn note_eviction_complete(&self) {
        let mut d = self.destruction.lock();
        if d.pending > 0 {
            d.pending -= 1;
            if d.pending == 0 {
                self.destroy_cv.broadcast();
            }
        }
    }

    /// Entry point from trap.
    pub fn vm_fault(
        &self,
        kind: FaultKind,
        faultaddr: u32,
        coremap: &Coremap,
        swap: &SwapStore,
        tlb: &Spinlock<alloc::boxed::Box<dyn Tlb>>,
    ) -> KResult<()> {
        if faultaddr >= USERSTACK {
            return Err(Errno::EFAULT);
        }
        let page = page_round_down(faultaddr);

        match kind {
            FaultKind::Read | FaultKind::InstructionFetch => {
                let (heap_start, heap_end, stack_base, loading) = {
                    let e = self.extents.lock();
                    (e.heap_start, e.heap_end, e.stack_base, *self.loading.lock())
                };

                let mut snap = self.page_table.lookup(page);
                if snap.is_none() {
                    if !loading && page < heap_start {
                        return Err(Errno::EFAULT);
                    }
                    if heap_end < page && page < stack_base {
                        self.extents.lock().stack_base = page;
                    } else if page >= stack_base {
                        return Err(Errno::EFAULT);
                    }
                    self.page_table.pull(coremap, swap, self.pid, page, true, false, false)?;
                    snap = self.page_table.lookup(page);
                }

                // A concurrent evictor can observe this entry between the
                // lookup above and the swap_in below; looping re-checks
                // residency each pass rather than trusting the first
                // snapshot.
                loop {
                    let Some(s) = self.page_table.lookup(page) else { return Err(Errno::EFAULT) };
                    match s.residency {
                        Residency::Resident { paddr, .. } => {
                            install_line(tlb, page, paddr >> crate::config::PAGE_SHIFT, TlbFlags::VALID);
                            return Ok(());
                        }
                        Residency::Swapped { .. } => {
                            self.page_table.swap_in(coremap, swap, self.pid, page)?;
                        }
                        Residency::NotPresent => return Err(Errno::EFAULT),
                    }
                }
            }
            FaultKind::Write => {
                let (heap_end, stack_base, loading) = {
                    let e = self.extents.lock();
                    (e.heap_end, e.stack_base, *self.loading.lock())
                };
                if !loading && !(stack_base <= page && page <= heap_end) {
                    return Err(Errno::EFAULT);
                }

                let Some(s) = self.page_table.lookup(page) else { return Err(Errno::EFAULT) };
                let paddr = match s.residency {
                    Residency::Resident { paddr, .. } => paddr,
                    _ => return Err(Errno::EFAULT),
                };
                if !coremap.lock_acquire(paddr) {
                    // Transient evict race: let the trap re-fire.
                    return Ok(());
                }
                if !s.writeable && !loading {
                    coremap.lock_release(paddr);
                    return Err(Errno::EFAULT);
                }
                self.page_table.mark_dirty(page);
                coremap.mark_dirty(paddr);
                coremap.lock_release(paddr);
                install_line(tlb, page, paddr >> crate::config::PAGE_SHIFT, TlbFlags::VALID | TlbFlags::DIRTY);
                Ok(())
            }
        }
    }
}

/// Resolves a coremap eviction callback to the owning process's address
/// space through the PID directory, sidestepping the cyclic ownership a
/// direct coremap-to-address-space reference would require, then
/// delegates to the page table's entry-level eviction logic.
/// The PID directory lock (tier 2) is acquired and released before any
/// page-table, coremap, or TLB lock is touched, so eviction never holds a
/// higher tier across a lower one.
pub struct ProcessEvictionHandler {
    pids: &'static PidDirectory,
    coremap: &'static Coremap,
    swap: &'static SwapStore,
    tlb: &'static Spinlock<alloc::boxed::Box<dyn Tlb>>,
}

impl ProcessEvictionHandler {
    pub const fn new(
        pids: &'static PidDirectory,
        coremap: &'static Coremap,
        swap: &'static SwapStore,
        tlb: &'static Spinlock<alloc::boxed::Box<dyn Tlb>>,
    ) -> Self {
        ProcessEvictionHandler { pids, coremap, swap, tlb }
    }
}

impl EvictionHandler for ProcessEvictionHandler {
    fn evict_resident(&self, pid: i32, vaddr: u32, frame: u32) {
        let Some(pcb) = self.pids.get(pid) else { return };
        let Some(as_) = pcb.address_space() else { return };
        as_.page_table.handle_eviction(self.coremap, self.swap, self.tlb, vaddr, frame);
        as_.note_eviction_complete();
    }
}
