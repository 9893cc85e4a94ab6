#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::panic::PanicInfo;
use linked_list_allocator::LockedHeap;

use teachos_core::console::{self, MmioUart};
use teachos_core::coremap::Coremap;
use teachos_core::config::{MAX_PROCS, PAGE_SIZE};
use teachos_core::error::{Errno, KResult};
use teachos_core::process::{AccessMode, FileHandle, FileSystem, Kernel, Pcb, Scheduler};
use teachos_core::swap::{BlockDevice, SwapSlot, SwapStore};
use teachos_core::syscall::TrapFrame;
use teachos_core::tlb::{Tlb, TlbEntry};
use teachos_core::{print, println};

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

const HEAP_SIZE: usize = 1024 * 1024;
static mut HEAP: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

/// The real block device, VFS and thread scheduler are external
/// collaborators this crate does not implement; these
/// stand in for them at boot so the VM and process core can come up before
/// those pieces are wired in by the surrounding system.
struct NoFileSystem;
impl FileSystem for NoFileSystem {
    fn open(&self, _path: &str, _mode: AccessMode) -> KResult<Arc<dyn FileHandle>> {
        Err(Errno::ENOENT)
    }
}

struct NoScheduler;
impl Scheduler for NoScheduler {
    fn spawn_child(&self, _child: Arc<Pcb>, _trap_frame: TrapFrame) {}
}

struct NoTlb {
    slots: [Option<TlbEntry>; teachos_core::config::NUM_TLB],
}
impl NoTlb {
    fn new() -> Self {
        NoTlb { slots: [None; teachos_core::config::NUM_TLB] }
    }
}
impl Tlb for NoTlb {
    fn probe(&self, vpage: u32) -> Option<usize> {
        self.slots.iter().position(|e| matches!(e, Some(e) if e.vpage == vpage))
    }
    fn write(&mut self, slot: usize, entry: TlbEntry) {
        self.slots[slot] = Some(entry);
    }
    fn write_random(&mut self, entry: TlbEntry) {
        self.slots[0] = Some(entry);
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

struct NoSwapDevice;
impl BlockDevice for NoSwapDevice {
    fn size_bytes(&self) -> usize {
        0
    }
    fn read_page(&mut self, _slot: SwapSlot, _out: &mut [u8; PAGE_SIZE]) -> KResult<()> {
        Err(Errno::EIO)
    }
    fn write_page(&mut self, _slot: SwapSlot, _data: &[u8; PAGE_SIZE]) -> KResult<()> {
        Err(Errno::EIO)
    }
}

#[no_mangle]
pub extern "C" fn kernel_main() -> ! {
    unsafe {
        ALLOCATOR.lock().init(HEAP.as_mut_ptr(), HEAP_SIZE);
        console::install(Box::new(MmioUart::new(0x0900_0000)));
    }
    println!("teaching kernel starting");

    let coremap = Coremap::new(0x8000_0000, 8192);
    coremap.bring_online();
    println!("coremap online");

    let swap = SwapStore::new(Box::new(NoSwapDevice));
    let (_kernel, _kernel_pcb) = Kernel::new(coremap, swap, Box::new(NoTlb::new()), Box::new(NoFileSystem), Box::new(NoScheduler));
    println!("process registry online, max {} processes, {}-byte pages", MAX_PROCS, PAGE_SIZE);

    loop {}
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    print!("kernel panic: {}", info);
    teachos_core::panic::handle(info)
}
