//! TLB entry format and the external MMU seam.
//!
//! Real TLB probing/writing is architecture-specific assembly, assumed
//! available exactly like `kprintf` and the trap-entry code. This module
//! fixes the entry format and the `Tlb` trait every vm_fault path writes
//! through, mutated only under the dedicated TLB spinlock (tier 6 of the
//! crate's lock-ordering scheme).

use crate::config::PAGE_SIZE;
use crate::sync::Spinlock;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TlbFlags: u32 {
        const VALID = 1 << 0;
        const DIRTY = 1 << 1;
    }
}

/// High word: top 20 bits of the virtual page. Low word: top 20 bits of the
/// physical frame plus VALID/DIRTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub vpage: u32,
    pub pframe: u32,
    pub flags: TlbFlags,
}

pub const TLBHI_VPAGE_MASK: u32 = !((PAGE_SIZE as u32) - 1);

/// The external MMU/TLB. Production builds back this with real
/// `tlb_probe`/`tlb_write`/`tlb_random` instructions; tests back it with an
/// in-memory fixed-size array mirroring `NUM_TLB` real slots.
pub trait Tlb: Send {
    /// Returns the slot index currently mapping `vpage`, if any.
    fn probe(&self, vpage: u32) -> Option<usize>;
    /// Writes `entry` into a specific slot.
    fn write(&mut self, slot: usize, entry: TlbEntry);
    /// Writes `entry` into a pseudo-randomly chosen slot.
    fn write_random(&mut self, entry: TlbEntry);
    /// Invalidates the single entry at `vpage`, if resident. Used both for
    /// a single page's best-effort shootdown and for `activate`'s full
    /// flush (called once per slot).
    fn invalidate(&mut self, vpage: u32);
    fn flush_all(&mut self);
}

pub struct FakeTlb {
    slots: [Option<TlbEntry>; crate::config::NUM_TLB],
    next_victim: usize,
}

impl FakeTlb {
    pub fn new() -> Self {
        FakeTlb { slots: [None; crate::config::NUM_TLB], next_victim: 0 }
    }
}

impl Default for FakeTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb for FakeTlb {
    fn probe(&self, vpage: u32) -> Option<usize> {
        self.slots.iter().position(|e| matches!(e, Some(e) if e.vpage == vpage))
    }

    fn write(&mut self, slot: usize, entry: TlbEntry) {
        self.slots[slot] = Some(entry);
    }

    fn write_random(&mut self, entry: TlbEntry) {
        let slot = self.next_victim;
        self.next_victim = (self.next_victim + 1) % self.slots.len();
        self.slots[slot] = Some(entry);
    }

    fn invalidate(&mut self, vpage: u32) {
        if let Some(slot) = self.probe(vpage) {
            self.slots[slot] = None;
        }
    }

    fn flush_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}

/// Installs or refreshes a TLB line: probe first, write in place on a hit,
/// random-replace on a miss. Used by both the read/instruction-fetch and
/// write paths of `vm_fault`.
pub fn install_line(tlb: &Spinlock<alloc::boxed::Box<dyn Tlb>>, vpage: u32, pframe: u32, flags: TlbFlags) {
    let entry = TlbEntry { vpage: vpage & TLBHI_VPAGE_MASK, pframe, flags };
    let mut tlb = tlb.lock();
    match tlb.probe(entry.vpage) {
        Some(slot) => tlb.write(slot, entry),
        None => tlb.write_random(entry),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_miss_then_random_write_then_probe_hit() {
        let mut tlb = FakeTlb::new();
        assert_eq!(tlb.probe(0x1000), None);
        tlb.write_random(TlbEntry { vpage: 0x1000, pframe: 5, flags: TlbFlags::VALID });
        assert!(tlb.probe(0x1000).is_some());
    }

    #[test]
    fn invalidate_clears_entry() {
        let mut tlb = FakeTlb::new();
        tlb.write_random(TlbEntry { vpage: 0x2000, pframe: 1, flags: TlbFlags::VALID });
        tlb.invalidate(0x2000);
        assert_eq!(tlb.probe(0x2000), None);
    }

    #[test]
    fn flush_all_clears_every_slot() {
        let mut tlb = FakeTlb::new();
        for i in 0..5 {
            tlb.write_random(TlbEntry { vpage: i * 0x1000, pframe: i, flags: TlbFlags::VALID });
        }
        tlb.flush_all();
        for i in 0..5 {
            assert_eq!(tlb.probe(i * 0x1000), None);
        }
    }
}
