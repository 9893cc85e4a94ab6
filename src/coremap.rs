//! Physical frame manager: allocation, eviction and
//! per-frame locking of RAM page frames.
//!
//! The original kernel's coremap bootstraps in two phases because its own
//! backing array and bitmaps must themselves live in the RAM they
//! describe — a chicken-and-egg problem solved with a bump allocator before
//! the bitmaps exist (`original_source/kern/arch/mips/vm/mipsvm.c`,
//! `coremap_bootstrap`/`coremap_allocate_early`). This rewrite's coremap
//! entries and bitmaps live in the kernel heap (the global allocator is
//! assumed available, like the boot sequence itself), so the same
//! two-phase shape is kept for fidelity to that bring-up order, but the
//! `Bootstrapping` phase only needs a bump cursor, not a full memory
//! carve-out.
//!
//! A single "swappable" bitmap could be made to serve two purposes at
//! once: mark resident user frames as eviction candidates, *and* act as a
//! per-frame lock taken by `coremap_lock_acquire`/`release` to keep the
//! page table and the evictor from racing. Overloading one bit for both
//! meanings invites exactly the kind of flag conflation that deserves
//! clarifying, so this rewrite keeps them as two bitmaps: `swappable` is
//! the steady-state "this frame may, in principle, be evicted" marker,
//! and `locked` is the separate transient lock bitmap that
//! `coremap_lock_acquire`/`release` actually operate on. The eviction scan
//! only considers frames that are swappable *and* unlocked.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::bitmap::Bitmap;
use crate::config::PAGE_SIZE;
use crate::error::Alloc;
use crate::sync::{CondVar, SleepLock, Spinlock};

extern crate alloc;
use alloc::vec::Vec;

/// Minimal xorshift32 generator standing in for libc's `random()`
/// (`original_source/kern/vm/coremap.c`'s `locate_random`); good enough for
/// spreading eviction victims across frames, not for anything
/// security-sensitive.
struct Xorshift32(AtomicU32);

impl Xorshift32 {
    const fn new(seed: u32) -> Self {
        Xorshift32(AtomicU32::new(seed | 1))
    }

    fn next(&self) -> u32 {
        let mut x = self.0.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0.store(x, Ordering::Relaxed);
        x
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CoremapFlags: u8 {
        const IN_USE = 1 << 0;
        const MULTI  = 1 << 1;
        const DIRTY  = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CoremapEntry {
    pub flags: CoremapFlags,
    pub pid: i32,
    pub vaddr: u32,
}

impl CoremapEntry {
    const fn empty() -> Self {
        CoremapEntry { flags: CoremapFlags::empty(), pid: 0, vaddr: 0 }
    }
}

/// Registered by the process/address-space layer so the coremap can hand
/// off eviction of a resident user frame without depending on the page
/// table or address space types directly: the coremap resolves owners by
/// PID through this callback, not a pointer back into the owning
/// structure, which would otherwise create a cyclic dependency.
pub trait EvictionHandler: Sync {
    /// Write back (if dirty) and unmap the frame at `(pid, vaddr)`,
    /// currently resident at physical frame `frame`. Must not evict the
    /// same frame twice and must be safe to call with no locks held.
    fn evict_resident(&self, pid: i32, vaddr: u32, frame: u32);
}

struct NullEvictionHandler;
impl EvictionHandler for NullEvictionHandler {
    fn evict_resident(&self, _pid: i32, _vaddr: u32, _frame: u32) {}
}

struct Bitmaps {
    entries: Vec<CoremapEntry>,
    /// Bit set => frame is allocated (an inverted "free" naming).
    free: Bitmap,
    /// Bit set => frame is owned by a user address space.
    swappable: Bitmap,
    /// Bit set => a transient per-frame lock is held.
    locked: Bitmap,
}

enum State {
    Bootstrapping { next_frame: usize },
    Online(Bitmaps),
}

/// Physical RAM content, addressed by frame index. The coremap is the sole
/// owner of this array: a paddr is meaningless outside it, the same way a
/// real kernel's physical address only means something relative to RAM's
/// base. Kept as a separate short spinlock from `state` so a `read_frame`
/// during eviction's writeback doesn't contend with bitmap bookkeeping.
pub struct Coremap {
    base: u32,
    npages: usize,
    state: SleepLock<State>,
    mem: Spinlock<Vec<[u8; PAGE_SIZE]>>,
    cv: CondVar,
    handler: spin::Once<&'static (dyn EvictionHandler + Sync)>,
    rng: Xorshift32,
}

impl Coremap {
    pub fn new(base: u32, npages: usize) -> Self {
        Coremap {
            base,
            npages,
            state: SleepLock::new(State::Bootstrapping { next_frame: 0 }),
            mem: Spinlock::new(alloc::vec![[0u8; PAGE_SIZE]; npages]),
            cv: CondVar::new(),
            handler: spin::Once::new(),
            rng: Xorshift32::new(0x9E3779B9 ^ base),
        }
    }

    pub fn set_eviction_handler(&self, handler: &'static (dyn EvictionHandler + Sync)) {
        self.handler.call_once(|| handler);
    }

    fn handler(&self) -> &'static (dyn EvictionHandler + Sync) {
        *self.handler.call_once(|| &NullEvictionHandler)
    }

    #[inline]
    fn frame_of(&self, paddr: u32) -> usize {
        ((paddr - self.base) / PAGE_SIZE as u32) as usize
    }

    #[inline]
    fn paddr_of(&self, frame: usize) -> u32 {
        self.base + (frame as u32) * PAGE_SIZE as u32
    }

    /// Used only before the VM system is fully running: a bump allocator
    /// that never evicts.
    pub fn allocate_early(&self, npages: usize) -> Alloc<u32> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Bootstrapping { next_frame } => {
                if *next_frame + npages > self.npages {
                    return Alloc::NoSpace;
                }
                let frame = *next_frame;
                *next_frame += npages;
                Alloc::Ok(self.paddr_of(frame))
            }
            State::Online(_) => Alloc::NoSpace,
        }
    }

    /// Switches the coremap from the early bump allocator to the full
    /// bitmap-backed allocator, reserving whatever frames the early
    /// allocator already handed out.
    pub fn bring_online(&self) {
        let mut state = self.state.lock();
        let next_frame = match &*state {
            State::Bootstrapping { next_frame } => *next_frame,
            State::Online(_) => return,
        };
        let mut entries = alloc::vec![CoremapEntry::empty(); self.npages];
        let mut free = Bitmap::new(self.npages);
        let swappable = Bitmap::new(self.npages);
        let locked = Bitmap::new(self.npages);
        for frame in entries.iter_mut().take(next_frame) {
            frame.flags |= CoremapFlags::IN_USE;
        }
        free.set_run(0, next_frame);
        *state = State::Online(Bitmaps { entries, free, swappable, locked });
    }

    fn with_online<R>(&self, f: impl FnOnce(&mut Bitmaps) -> R) -> R {
        let mut state = self.state.lock();
        match &mut *state {
            State::Online(bm) => f(bm),
            State::Bootstrapping { .. } => panic!("coremap used before bring_online()"),
        }
    }

    /// Allocates `npages` contiguous frames, evicting swappable victims if
    /// free memory is exhausted, retrying once frames are freed.
    pub fn allocate(&self, is_kernel: bool, pid: i32, npages: usize, vaddr: u32) -> Alloc<u32> {
        loop {
            // Selection and claiming happen under the same short-spinlock
            // critical section so two concurrent allocations can never
            // settle on the same victim run before either has marked it
            // allocated in the free bitmap (no separate sleep lock needed
            // to serialize allocate() against itself).
            let outcome = self.with_online(|bm| {
                if let Some(start) = bm.free.find_clear_run(npages) {
                    bm.free.set_run(start, npages);
                    return Some(Ok(start));
                }
                // find_clear_run looks for *clear* bits; eviction needs a
                // run of *set* (swappable) bits that are also unlocked, so
                // find_victim_run probes for those instead.
                match Self::find_victim_run(bm, &self.rng, npages) {
                    Some(Err(victims)) => {
                        bm.free.set_run(victims[0], npages);
                        Some(Err(victims))
                    }
                    _ => None,
                }
            });

            match outcome {
                Some(Ok(start)) => {
                    return Alloc::Ok(self.finish_allocation(is_kernel, pid, npages, vaddr, start));
                }
                Some(Err(victims)) => {
                    for frame in victims.iter().copied() {
                        let (owner_pid, owner_vaddr) = self.with_online(|bm| {
                            let e = &bm.entries[frame];
                            (e.pid, e.vaddr)
                        });
                        self.handler().evict_resident(owner_pid, owner_vaddr, self.paddr_of(frame));
                    }
                    return Alloc::Ok(self.finish_allocation(is_kernel, pid, npages, vaddr, victims[0]));
                }
                None => {
                    self.cv.wait_while(|| {
                        self.with_online(|bm| bm.free.find_clear_run(npages).is_none() && Self::find_victim_run(bm, &self.rng, npages).is_none())
                    });
                }
            }
        }
    }

    fn zero_frames(&self, paddr: u32, npages: usize) {
        let start = self.frame_of(paddr);
        let mut mem = self.mem.lock();
        for frame in mem.iter_mut().skip(start).take(npages) {
            *frame = [0u8; PAGE_SIZE];
        }
    }

    /// Reads the full content of the frame at `paddr`.
    pub fn read_frame(&self, paddr: u32, out: &mut [u8; PAGE_SIZE]) {
        let frame = self.frame_of(paddr);
        out.copy_from_slice(&self.mem.lock()[frame]);
    }

    /// Overwrites the full content of the frame at `paddr`.
    pub fn write_frame(&self, paddr: u32, data: &[u8; PAGE_SIZE]) {
        let frame = self.frame_of(paddr);
        self.mem.lock()[frame].copy_from_slice(data);
    }

    fn finish_allocation(&self, is_kernel: bool, pid: i32, npages: usize, vaddr: u32, start: usize) -> u32 {
        let paddr = self.paddr_of(start);
        self.zero_frames(paddr, npages);
        self.with_online(|bm| {
            for i in 0..npages {
                let e = &mut bm.entries[start + i];
                e.flags = CoremapFlags::IN_USE;
                if i > 0 {
                    e.flags |= CoremapFlags::MULTI;
                }
                e.pid = pid;
                e.vaddr = vaddr;
                if !is_kernel {
                    bm.swappable.set(start + i);
                } else {
                    bm.swappable.clear(start + i);
                }
            }
        });
        paddr
    }

    /// Finds a contiguous run of frames that are swappable and currently
    /// unlocked. Returns the run as an `Err` to distinguish "found victims,
    /// must evict" from the free-bitmap's "already free" case at the call
    /// site.
    ///
    /// The single-frame case (by far the common one — eviction almost
    /// always needs exactly one frame) probes sixteen pseudo-random
    /// candidates before giving up and falling back to a linear next-fit
    /// scan. Multi-frame runs go straight to the linear scan: random
    /// probing for a single bit doesn't generalize to finding a contiguous
    /// span of them.
    fn find_victim_run(bm: &Bitmaps, rng: &Xorshift32, npages: usize) -> Option<Result<usize, Vec<usize>>> {
        let is_candidate = |frame: usize| bm.swappable.is_set(frame) && !bm.locked.is_set(frame);
        let n = bm.swappable.len();
        if npages == 1 {
            if let Some(frame) = crate::bitmap::find_random(n, || rng.next() as usize, 16, is_candidate) {
                return Some(Err(alloc::vec![frame]));
            }
            return None;
        }
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for frame in 0..n {
            if is_candidate(frame) {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += 1;
                if run_len == npages {
                    return Some(Err((run_start..run_start + npages).collect()));
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    /// Chooses a victim frame (free if one exists, else a pseudo-random
    /// swappable+unlocked one), evicts it, reads `slot` into it, and
    /// returns the new physical address with the frame's lock held — the
    /// caller must call `coremap_lock_release` after publishing the
    /// mapping.
    pub fn swap_page_into(&self, swap: &crate::swap::SwapStore, slot: crate::swap::SwapSlot, vaddr: u32, pid: i32) -> Alloc<u32> {
        loop {
            let chosen = self.with_online(|bm| {
                if let Some(f) = bm.free.find_clear_run(1) {
                    bm.free.set(f);
                    Some(f)
                } else {
                    match Self::find_victim_run(bm, &self.rng, 1) {
                        Some(Err(v)) => {
                            bm.free.set(v[0]);
                            Some(v[0])
                        }
                        _ => None,
                    }
                }
            });
            let Some(frame) = chosen else {
                self.cv.wait_while(|| self.with_online(|bm| bm.free.find_clear_run(1).is_none() && Self::find_victim_run(bm, &self.rng, 1).is_none()));
                continue;
            };

            let (owner_pid, owner_vaddr, was_resident) = self.with_online(|bm| {
                let e = &bm.entries[frame];
                (e.pid, e.vaddr, e.flags.contains(CoremapFlags::IN_USE))
            });
            if was_resident {
                self.handler().evict_resident(owner_pid, owner_vaddr, self.paddr_of(frame));
            }

            let paddr = self.paddr_of(frame);
            let mut page = [0u8; PAGE_SIZE];
            if swap.read_in(slot, &mut page).is_err() {
                return Alloc::NoSpace;
            }
            self.write_frame(paddr, &page);
            self.with_online(|bm| {
                bm.entries[frame] = CoremapEntry { flags: CoremapFlags::IN_USE, pid, vaddr };
                bm.swappable.set(frame);
                bm.locked.set(frame);
            });
            return Alloc::Ok(paddr);
        }
    }

    /// Clears the run of `multi` frames starting at `paddr`. Callable from
    /// interrupt context: only the short (bitmap) state is touched.
    pub fn free(&self, paddr: u32) {
        let start = self.frame_of(paddr);
        self.with_online(|bm| {
            let mut n = 1;
            while start + n < bm.entries.len() && bm.entries[start + n].flags.contains(CoremapFlags::MULTI) {
                n += 1;
            }
            for frame in start..start + n {
                bm.entries[frame] = CoremapEntry::empty();
                bm.free.clear(frame);
                bm.swappable.clear(frame);
                bm.locked.clear(frame);
            }
        });
        self.cv.broadcast();
    }

    pub fn mark_dirty(&self, paddr: u32) {
        let frame = self.frame_of(paddr);
        self.with_online(|bm| bm.entries[frame].flags |= CoremapFlags::DIRTY);
    }

    pub fn mark_clean(&self, paddr: u32) {
        let frame = self.frame_of(paddr);
        self.with_online(|bm| bm.entries[frame].flags.remove(CoremapFlags::DIRTY));
    }

    pub fn is_dirty(&self, paddr: u32) -> bool {
        let frame = self.frame_of(paddr);
        self.with_online(|bm| bm.entries[frame].flags.contains(CoremapFlags::DIRTY))
    }

    pub fn is_in_use(&self, paddr: u32) -> bool {
        let frame = self.frame_of(paddr);
        self.with_online(|bm| bm.entries[frame].flags.contains(CoremapFlags::IN_USE))
    }

    pub fn is_swappable(&self, paddr: u32) -> bool {
        let frame = self.frame_of(paddr);
        self.with_online(|bm| bm.swappable.is_set(frame))
    }

    pub fn is_multi(&self, paddr: u32) -> bool {
        let frame = self.frame_of(paddr);
        self.with_online(|bm| bm.entries[frame].flags.contains(CoremapFlags::MULTI))
    }

    pub fn owner(&self, paddr: u32) -> (i32, u32) {
        let frame = self.frame_of(paddr);
        self.with_online(|bm| (bm.entries[frame].pid, bm.entries[frame].vaddr))
    }

    /// Must never be used on kernel frames.
    pub fn lock_acquire(&self, paddr: u32) -> bool {
        let frame = self.frame_of(paddr);
        self.with_online(|bm| {
            if bm.locked.is_set(frame) {
                false
            } else {
                bm.locked.set(frame);
                true
            }
        })
    }

    pub fn lock_release(&self, paddr: u32) {
        let frame = self.frame_of(paddr);
        self.with_online(|bm| bm.locked.clear(frame));
    }

    pub fn count_free(&self) -> usize {
        self.with_online(|bm| bm.free.count_clear())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(npages: usize) -> Coremap {
        let cm = Coremap::new(0x1000, npages);
        cm.bring_online();
        cm
    }

    #[test]
    fn allocate_four_contiguous_marks_multi_correctly() {
        let cm = fresh(16);
        let base = match cm.allocate(false, 7, 4, 0x4000) {
            Alloc::Ok(p) => p,
            Alloc::NoSpace => panic!("expected space"),
        };
        assert!(cm.is_in_use(base));
        assert!(!cm.is_multi(base));
        for i in 1..4 {
            let p = base + (i as u32) * PAGE_SIZE as u32;
            assert!(cm.is_in_use(p));
            assert!(cm.is_multi(p));
            assert!(cm.is_swappable(p));
        }
    }

    #[test]
    fn fresh_frames_are_zeroed() {
        let cm = fresh(4);
        let base = match cm.allocate(false, 7, 1, 0x4000) {
            Alloc::Ok(p) => p,
            Alloc::NoSpace => panic!("expected space"),
        };
        let mut page = [0xFFu8; PAGE_SIZE];
        cm.read_frame(base, &mut page);
        assert!(page.iter().all(|&b| b == 0));
    }

    #[test]
    fn free_clears_all_bits_of_multi_run() {
        let cm = fresh(16);
        let base = match cm.allocate(false, 7, 4, 0x4000) {
            Alloc::Ok(p) => p,
            Alloc::NoSpace => panic!("expected space"),
        };
        cm.free(base);
        for i in 0..4 {
            let p = base + (i as u32) * PAGE_SIZE as u32;
            assert!(!cm.is_in_use(p));
            assert!(!cm.is_swappable(p));
        }
        assert_eq!(cm.count_free(), 16);
    }

    #[test]
    fn lock_acquire_is_exclusive() {
        let cm = fresh(4);
        let base = match cm.allocate(false, 1, 1, 0x1000) {
            Alloc::Ok(p) => p,
            Alloc::NoSpace => panic!("expected space"),
        };
        assert!(cm.lock_acquire(base));
        assert!(!cm.lock_acquire(base));
        cm.lock_release(base);
        assert!(cm.lock_acquire(base));
    }

    #[test]
    fn kernel_frames_are_not_swappable() {
        let cm = fresh(4);
        let base = match cm.allocate(true, 0, 1, 0) {
            Alloc::Ok(p) => p,
            Alloc::NoSpace => panic!("expected space"),
        };
        assert!(!cm.is_swappable(base));
    }
}
