//! The ELF loader's external seam. Parsing and validating an actual ELF
//! header is assumed available exactly like the VFS and boot sequence;
//! this module fixes the shape `execv` loads through and performs the
//! part that is this crate's own concern: copying segment bytes into a
//! freshly defined address space page by page.

use alloc::boxed::Box;

use crate::addrspace::AddressSpace;
use crate::coremap::Coremap;
use crate::config::{page_round_down, PAGE_SIZE};
use crate::error::KResult;
use crate::swap::SwapStore;

#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub vaddr: u32,
    pub memsz: u32,
    pub filesz: u32,
    pub readable: bool,
    pub writeable: bool,
    pub executable: bool,
}

/// An opened, already-validated program image. Production code backs this
/// with a real ELF header parse over a VFS vnode; tests back it with an
/// in-memory byte buffer and a hand-built segment table.
pub trait ElfImage: Send {
    fn entry_point(&self) -> u32;
    fn segments(&self) -> &[Segment];
    /// Reads `out.len()` bytes starting at `offset` into `segment`'s file
    /// image.
    fn read_segment(&self, segment: &Segment, offset: u32, out: &mut [u8]) -> KResult<()>;
}

pub struct InMemoryImage {
    entry: u32,
    segments: alloc::vec::Vec<Segment>,
    data: alloc::vec::Vec<alloc::vec::Vec<u8>>,
}

impl InMemoryImage {
    pub fn new(entry: u32, segments: alloc::vec::Vec<(Segment, alloc::vec::Vec<u8>)>) -> Self {
        let (segs, data) = segments.into_iter().unzip();
        InMemoryImage { entry, segments: segs, data }
    }
}

impl ElfImage for InMemoryImage {
    fn entry_point(&self) -> u32 {
        self.entry
    }

    fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn read_segment(&self, segment: &Segment, offset: u32, out: &mut [u8]) -> KResult<()> {
        let idx = self.segments.iter().position(|s| s.vaddr == segment.vaddr).ok_or(crate::error::Errno::EIO)?;
        let start = offset as usize;
        out.copy_from_slice(&self.data[idx][start..start + out.len()]);
        Ok(())
    }
}

/// Defines each segment's region, loads its file content page by page, and
/// returns the entry point. Must run between `prepare_load` and
/// `complete_load` so writes to read-only segments during population are
/// permitted.
pub fn load(as_: &AddressSpace, image: &dyn ElfImage, coremap: &Coremap, swap: &SwapStore) -> KResult<u32> {
    for segment in image.segments() {
        as_.define_region(segment.vaddr, segment.memsz, segment.readable, segment.writeable, segment.executable);

        let mut remaining = segment.filesz;
        let mut file_off = 0u32;
        let mut vaddr = page_round_down(segment.vaddr);
        let mut skip = segment.vaddr - vaddr;

        while remaining > 0 || skip > 0 {
            // Adjacent segments can share a page (e.g. text/data crossing a
            // boundary); reuse the already-resident frame instead of
            // allocating a second one and orphaning the first.
            let existing = as_.page_table.lookup(vaddr).and_then(|s| match s.residency {
                crate::pagetable::Residency::Resident { paddr, .. } => Some(paddr),
                _ => None,
            });
            let paddr = match existing {
                Some(p) => p,
                None => as_.page_table.pull(coremap, swap, as_.pid(), vaddr, true, true, true)?,
            };
            let take = core::cmp::min(PAGE_SIZE as u32 - skip, remaining);
            if take > 0 {
                let mut buf = alloc::vec![0u8; take as usize];
                image.read_segment(segment, file_off, &mut buf)?;
                let mut page = [0u8; PAGE_SIZE];
                coremap.read_frame(paddr, &mut page);
                page[skip as usize..skip as usize + take as usize].copy_from_slice(&buf);
                coremap.write_frame(paddr, &page);
                remaining -= take;
                file_off += take;
            }
            vaddr += PAGE_SIZE as u32;
            skip = 0;
        }
    }
    Ok(image.entry_point())
}

pub type BoxedImage = Box<dyn ElfImage>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::MemoryBlockDevice;

    fn test_swap() -> SwapStore {
        SwapStore::new(alloc::boxed::Box::new(MemoryBlockDevice::with_capacity_pages(16)))
    }

    #[test]
    fn load_places_segment_bytes_at_resident_frame() {
        let coremap = Coremap::new(0x1000, 16);
        coremap.bring_online();
        let swap = test_swap();
        let as_ = AddressSpace::create(1);
        as_.prepare_load();

        let seg = Segment { vaddr: 0x2000, memsz: PAGE_SIZE as u32, filesz: 4, readable: true, writeable: false, executable: true };
        let image = InMemoryImage::new(0x2000, alloc::vec![(seg, alloc::vec![0xDE, 0xAD, 0xBE, 0xEF])]);

        let entry = load(&as_, &image, &coremap, &swap).unwrap();
        assert_eq!(entry, 0x2000);

        let snap = as_.page_table.lookup(0x2000).unwrap();
        let paddr = match snap.residency {
            crate::pagetable::Residency::Resident { paddr, .. } => paddr,
            _ => panic!("expected resident"),
        };
        let mut page = [0u8; PAGE_SIZE];
        coremap.read_frame(paddr, &mut page);
        assert_eq!(&page[0..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn load_across_two_pages_splits_correctly() {
        let coremap = Coremap::new(0x1000, 16);
        coremap.bring_online();
        let swap = test_swap();
        let as_ = AddressSpace::create(1);
        as_.prepare_load();

        let filesz = PAGE_SIZE as u32 + 8;
        let mut data = alloc::vec![0u8; filesz as usize];
        data[PAGE_SIZE] = 0x7A;
        let seg = Segment { vaddr: 0x3000, memsz: filesz, filesz, readable: true, writeable: true, executable: false };
        let image = InMemoryImage::new(0x3000, alloc::vec![(seg, data)]);

        load(&as_, &image, &coremap, &swap).unwrap();

        let snap = as_.page_table.lookup(0x3000 + PAGE_SIZE as u32).unwrap();
        let paddr = match snap.residency {
            crate::pagetable::Residency::Resident { paddr, .. } => paddr,
            _ => panic!("expected resident"),
        };
        let mut page = [0u8; PAGE_SIZE];
        coremap.read_frame(paddr, &mut page);
        assert_eq!(page[0], 0x7A);
    }

    #[test]
    fn load_passes_the_address_spaces_own_pid_to_pull() {
        let coremap = Coremap::new(0x1000, 16);
        coremap.bring_online();
        let swap = test_swap();
        let as_ = AddressSpace::create(7);
        assert_eq!(as_.pid(), 7);
        as_.prepare_load();

        let seg = Segment { vaddr: 0x4000, memsz: PAGE_SIZE as u32, filesz: 0, readable: true, writeable: false, executable: true };
        let image = InMemoryImage::new(0x4000, alloc::vec![(seg, alloc::vec::Vec::new())]);
        load(&as_, &image, &coremap, &swap).unwrap();

        let snap = as_.page_table.lookup(0x4000).unwrap();
        assert!(matches!(snap.residency, crate::pagetable::Residency::Resident { .. }));
    }
}
