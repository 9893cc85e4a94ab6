//! Swap store: a disk-backed array of page-sized blocks,
//! addressed by a dense slot index, with a free bitmap and synchronous
//! read/write. The real backing device ("`lhd0:`" in the source kernel) is
//! an external collaborator reached through the VFS; here it is the
//! `BlockDevice` trait, wrapped in a `spin::Mutex`-held manager the way
//! other singleton subsystems in this crate are structured.

use crate::bitmap::Bitmap;
use crate::config::PAGE_SIZE;
use crate::error::{Alloc, Errno, KResult};
use crate::sync::Spinlock;

pub type SwapSlot = usize;

/// The external block device the swap store reads/writes whole pages
/// through. Production code backs this with the VFS; tests back it with an
/// in-memory `Vec`.
pub trait BlockDevice: Send {
    /// Total capacity of the device in bytes, used to size the free bitmap.
    fn size_bytes(&self) -> usize;
    fn read_page(&mut self, slot: SwapSlot, out: &mut [u8; PAGE_SIZE]) -> KResult<()>;
    fn write_page(&mut self, slot: SwapSlot, data: &[u8; PAGE_SIZE]) -> KResult<()>;
}

/// An in-memory stand-in for the real "lhd0:" swap device, used by tests
/// and by hosts with no backing disk.
pub struct MemoryBlockDevice {
    blocks: alloc::vec::Vec<[u8; PAGE_SIZE]>,
}

impl MemoryBlockDevice {
    pub fn with_capacity_pages(npages: usize) -> Self {
        MemoryBlockDevice { blocks: alloc::vec![[0u8; PAGE_SIZE]; npages] }
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn size_bytes(&self) -> usize {
        self.blocks.len() * PAGE_SIZE
    }

    fn read_page(&mut self, slot: SwapSlot, out: &mut [u8; PAGE_SIZE]) -> KResult<()> {
        let block = self.blocks.get(slot).ok_or(Errno::EIO)?;
        out.copy_from_slice(block);
        Ok(())
    }

    fn write_page(&mut self, slot: SwapSlot, data: &[u8; PAGE_SIZE]) -> KResult<()> {
        let block = self.blocks.get_mut(slot).ok_or(Errno::EIO)?;
        block.copy_from_slice(data);
        Ok(())
    }
}

pub struct SwapStore {
    // Bitmap bookkeeping and device I/O are locked separately (tier 8, the
    // store's short spinlock, for the bitmap only) so read_in/write_out
    // never hold the bitmap lock across a synchronous device call; a
    // concurrent allocate()/free() on another slot is never blocked behind
    // someone else's page transfer.
    free: Spinlock<Bitmap>,
    device: Spinlock<alloc::boxed::Box<dyn BlockDevice>>,
}

impl SwapStore {
    pub fn new(device: alloc::boxed::Box<dyn BlockDevice>) -> Self {
        let nslots = device.size_bytes() / PAGE_SIZE;
        SwapStore { free: Spinlock::new(Bitmap::new(nslots)), device: Spinlock::new(device) }
    }

    pub fn capacity_slots(&self) -> usize {
        self.free.lock().len()
    }

    /// Finds a clear bit, sets it, returns its index. Does not zero the
    /// backing block.
    pub fn allocate(&self) -> Alloc<SwapSlot> {
        let mut free = self.free.lock();
        match free.find_clear_run(1) {
            Some(slot) => {
                free.set(slot);
                Alloc::Ok(slot)
            }
            None => Alloc::NoSpace,
        }
    }

    /// Clears the bit. No I/O.
    pub fn free(&self, slot: SwapSlot) {
        self.free.lock().clear(slot);
    }

    /// Synchronously reads one page from `slot` into `out`. Takes only the
    /// device lock — the bitmap lock is never held across I/O.
    pub fn read_in(&self, slot: SwapSlot, out: &mut [u8; PAGE_SIZE]) -> KResult<()> {
        self.device.lock().read_page(slot, out)
    }

    /// Synchronously writes one page to `slot`. Takes only the device lock.
    pub fn write_out(&self, slot: SwapSlot, data: &[u8; PAGE_SIZE]) -> KResult<()> {
        self.device.lock().write_page(slot, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_store(pages: usize) -> SwapStore {
        SwapStore::new(alloc::boxed::Box::new(MemoryBlockDevice::with_capacity_pages(pages)))
    }

    #[test]
    fn allocate_then_free_recycles_slot() {
        let store = fresh_store(4);
        let slot = match store.allocate() {
            Alloc::Ok(s) => s,
            Alloc::NoSpace => panic!("expected space"),
        };
        store.free(slot);
        let slot2 = match store.allocate() {
            Alloc::Ok(s) => s,
            Alloc::NoSpace => panic!("expected space"),
        };
        assert_eq!(slot, slot2);
    }

    #[test]
    fn allocate_exhausts_then_refuses() {
        let store = fresh_store(2);
        assert!(matches!(store.allocate(), Alloc::Ok(_)));
        assert!(matches!(store.allocate(), Alloc::Ok(_)));
        assert!(matches!(store.allocate(), Alloc::NoSpace));
    }

    #[test]
    fn round_trip_preserves_page_contents() {
        let store = fresh_store(1);
        let slot = match store.allocate() {
            Alloc::Ok(s) => s,
            Alloc::NoSpace => panic!("expected space"),
        };
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 0xAB;
        page[PAGE_SIZE - 1] = 0xCD;
        store.write_out(slot, &page).unwrap();

        let mut readback = [0u8; PAGE_SIZE];
        store.read_in(slot, &mut readback).unwrap();
        assert_eq!(page, readback);
    }
}
