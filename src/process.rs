//! Process registry: process control blocks, fork,
//! waitpid, exit, execv, and the per-process file-descriptor table.
//! Grounded on `original_source/kern/proc/proc.c` and the syscall bodies in
//! `kern/syscall/{process_syscalls,file_syscalls,execv}.c`. Scheduling and
//! the VFS are external collaborators; this module fixes the PCB shape
//! and the handful of traits those collaborators implement.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::addrspace::AddressSpace;
use crate::config::{KERNEL_PID, MAX_OPEN_FILES, ORPHAN};
use crate::coremap::Coremap;
use crate::elf::ElfImage;
use crate::error::{Errno, KResult};
use crate::pid::PidDirectory;
use crate::sync::{CondVar, SleepLock, Spinlock};
use crate::swap::SwapStore;
use crate::syscall::TrapFrame;
use crate::tlb::Tlb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    fn readable(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    fn writeable(self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }
}

/// A single opened file's VFS-side operations. Production code backs this
/// with a real vnode; tests back it with an in-memory buffer.
pub trait FileHandle: Send + Sync {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> KResult<usize>;
    fn write_at(&self, offset: usize, buf: &[u8]) -> KResult<usize>;
}

/// `open`'s path-resolution seam; the VFS itself is borrowed, external
/// infrastructure this crate doesn't implement.
pub trait FileSystem: Sync {
    fn open(&self, path: &str, mode: AccessMode) -> KResult<Arc<dyn FileHandle>>;
}

/// Scheduling is an external collaborator; this is the one
/// call the process registry makes into it. The implementation is expected
/// to set the child's trap-frame return registers to zero-success, install
/// `child`'s address space, and enter user mode — none of which this crate
/// can do without a real thread/context-switch primitive.
pub trait Scheduler: Sync {
    fn spawn_child(&self, child: Arc<Pcb>, trap_frame: TrapFrame);
}

/// Bound to FDs 0/1/2 the first time a process touches them without having
/// opened anything there.
/// Reads are unsupported; there is no console input device in this crate's
/// scope.
pub struct ConsoleFile;

impl FileHandle for ConsoleFile {
    fn read_at(&self, _offset: usize, _buf: &mut [u8]) -> KResult<usize> {
        Err(Errno::EIO)
    }

    fn write_at(&self, _offset: usize, buf: &[u8]) -> KResult<usize> {
        let s = core::str::from_utf8(buf).unwrap_or("");
        crate::print!("{}", s);
        Ok(buf.len())
    }
}

struct FdEntry {
    node: Arc<dyn FileHandle>,
    offset: usize,
    mode: AccessMode,
}

struct FdTable {
    entries: Vec<Option<FdEntry>>,
    next_fd: usize,
}

impl FdTable {
    fn new() -> Self {
        let mut entries = Vec::with_capacity(MAX_OPEN_FILES);
        entries.resize_with(MAX_OPEN_FILES, || None);
        FdTable { entries, next_fd: 3 }
    }

    fn deep_copy_from(parent: &FdTable) -> Self {
        let mut table = FdTable::new();
        for i in 3..parent.next_fd {
            if let Some(e) = &parent.entries[i] {
                table.entries[i] = Some(FdEntry { node: e.node.clone(), offset: e.offset, mode: e.mode });
            }
        }
        table.next_fd = parent.next_fd;
        table
    }

    fn ensure_console(&mut self, fd: usize) {
        if self.entries[fd].is_none() {
            self.entries[fd] = Some(FdEntry { node: Arc::new(ConsoleFile), offset: 0, mode: AccessMode::ReadWrite });
        }
    }
}

/// A VFS directory vnode, reference-counted the way the source kernel's
/// `VOP_INCREF`/`VOP_DECREF` manage `p_cwd` — here that's just `Arc::clone`.
/// The VFS itself is an external collaborator; the process registry only
/// needs to hold and hand off a reference, never resolve paths against it.
pub trait Vnode: Send + Sync {}

pub struct Pcb {
    pid: AtomicI32,
    name: Spinlock<String>,
    parent: Spinlock<i32>,
    address_space: Spinlock<Option<Arc<AddressSpace>>>,
    cwd: Spinlock<Option<Arc<dyn Vnode>>>,
    numthreads: AtomicUsize,
    children: Spinlock<Vec<i32>>,
    files: SleepLock<FdTable>,
    wait_cv: CondVar,
    exited: Spinlock<bool>,
    exit_val: Spinlock<i32>,
    waitpid_target: Spinlock<i32>,
}

impl Pcb {
    fn new(pid: i32, name: &str) -> Self {
        Pcb {
            pid: AtomicI32::new(pid),
            name: Spinlock::new(String::from(name)),
            parent: Spinlock::new(ORPHAN),
            address_space: Spinlock::new(None),
            cwd: Spinlock::new(None),
            numthreads: AtomicUsize::new(1),
            children: Spinlock::new(Vec::new()),
            files: SleepLock::new(FdTable::new()),
            wait_cv: CondVar::new(),
            exited: Spinlock::new(false),
            exit_val: Spinlock::new(0),
            waitpid_target: Spinlock::new(ORPHAN),
        }
    }

    #[cfg(test)]
    pub fn for_test(pid: i32) -> Self {
        Pcb::new(pid, "[test]")
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Relaxed)
    }

    fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::Relaxed);
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = String::from(name);
    }

    pub fn address_space(&self) -> Option<Arc<AddressSpace>> {
        self.address_space.lock().clone()
    }

    pub fn set_address_space(&self, as_: Option<Arc<AddressSpace>>) {
        *self.address_space.lock() = as_;
    }

    pub fn cwd(&self) -> Option<Arc<dyn Vnode>> {
        self.cwd.lock().clone()
    }

    pub fn set_cwd(&self, cwd: Option<Arc<dyn Vnode>>) {
        *self.cwd.lock() = cwd;
    }

    pub fn numthreads(&self) -> usize {
        self.numthreads.load(Ordering::Relaxed)
    }

    pub fn inc_numthreads(&self) {
        self.numthreads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_numthreads(&self) {
        self.numthreads.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Aggregates every collaborator the process registry's operations need,
/// the way the source kernel reaches its globals (`pids`, `coremap_lock`,
/// `execv_lock`) through file-scope statics.
pub struct Kernel {
    pub pids: PidDirectory,
    pub coremap: Coremap,
    pub swap: SwapStore,
    pub tlb: Spinlock<Box<dyn Tlb>>,
    pub filesystem: Box<dyn FileSystem>,
    pub scheduler: Box<dyn Scheduler>,
    execv_lock: SleepLock<()>,
}

impl Kernel {
    pub fn new(
        coremap: Coremap,
        swap: SwapStore,
        tlb: Box<dyn Tlb>,
        filesystem: Box<dyn FileSystem>,
        scheduler: Box<dyn Scheduler>,
    ) -> (Self, Arc<Pcb>) {
        let kernel_pcb = Arc::new(Pcb::new(KERNEL_PID, "[kernel]"));
        let pids = PidDirectory::new(kernel_pcb.clone());
        let kernel = Kernel {
            pids,
            coremap,
            swap,
            tlb: Spinlock::new(tlb),
            filesystem,
            scheduler,
            execv_lock: SleepLock::new(()),
        };
        (kernel, kernel_pcb)
    }

    /// Creates a fresh PCB with no address space, used by `execv` on a
    /// process that currently has none (`original_source`'s
    /// `proc_create_runprogram`).
    pub fn create_process(&self) -> Result<Arc<Pcb>, Errno> {
        let pcb = Arc::new(Pcb::new(0, "[proc]"));
        let pid = self.pids.allocate(pcb.clone())?;
        pcb.set_pid(pid);
        Ok(pcb)
    }

    /// `fork(parent_tf, &err) → child_pid`.
    pub fn fork(&self, parent: &Arc<Pcb>, parent_tf: TrapFrame) -> KResult<i32> {
        let child = Arc::new(Pcb::new(0, &parent.name()));
        {
            let parent_files = parent.files.lock();
            *child.files.lock() = FdTable::deep_copy_from(&parent_files);
        }
        // VOP_INCREF(parent->p_cwd) in the source kernel: bump the vnode's
        // refcount instead of deep-copying it, since parent and child share
        // the same working directory until either calls chdir.
        child.set_cwd(parent.cwd());

        let pid = self.pids.allocate(child.clone()).map_err(|_| Errno::ENPROC)?;
        child.set_pid(pid);
        *child.parent.lock() = parent.pid();
        parent.children.lock().push(pid);

        if let Some(parent_as) = parent.address_space() {
            match AddressSpace::copy(&parent_as, pid, &self.coremap, &self.swap) {
                Ok(as_) => child.set_address_space(Some(Arc::new(as_))),
                Err(e) => {
                    self.pids.remove(pid);
                    parent.children.lock().retain(|&c| c != pid);
                    return Err(e);
                }
            }
        }

        self.scheduler.spawn_child(child, parent_tf);
        Ok(pid)
    }

    /// `waitpid(pid, status, options)`. Returns the
    /// child's exit code; the caller is responsible for copying it out to
    /// whatever status pointer the syscall ABI passed.
    pub fn waitpid(&self, cur: &Arc<Pcb>, pid: i32, options: i32) -> KResult<i32> {
        if options != 0 {
            return Err(Errno::EINVAL);
        }
        if !cur.children.lock().contains(&pid) {
            return Err(Errno::ECHILD);
        }
        let child = self.pids.get(pid).ok_or(Errno::ESRCH)?;

        *cur.waitpid_target.lock() = pid;
        child.wait_cv.wait_while(|| !*child.exited.lock());

        let exit_val = *child.exit_val.lock();
        self.pids.remove(pid);
        cur.children.lock().retain(|&c| c != pid);
        Ok(exit_val)
    }

    /// `exit(code)`.
    pub fn exit(&self, cur: &Arc<Pcb>, code: i32) {
        if let Some(as_) = cur.address_space() {
            as_.destroy(&self.coremap, &self.swap);
        }
        cur.set_address_space(None);

        let children: Vec<i32> = cur.children.lock().drain(..).collect();
        for child_pid in children {
            if let Some(child) = self.pids.get(child_pid) {
                if *child.exited.lock() {
                    self.pids.remove(child_pid);
                } else {
                    *child.parent.lock() = ORPHAN;
                }
            }
        }

        {
            let mut files = cur.files.lock();
            for entry in files.entries.iter_mut().skip(3) {
                *entry = None;
            }
        }

        let parent_pid = *cur.parent.lock();
        if parent_pid == ORPHAN {
            self.pids.remove(cur.pid());
            return;
        }
        let Some(parent) = self.pids.get(parent_pid) else {
            self.pids.remove(cur.pid());
            return;
        };

        *cur.exited.lock() = true;
        *cur.exit_val.lock() = code;
        if *parent.waitpid_target.lock() == cur.pid() {
            cur.wait_cv.broadcast();
        }
    }

    /// `execv(path, argv)`. `argv` is already marshalled
    /// into kernel storage by the syscall dispatcher (bounded by `PATH_MAX`/
    /// `ARG_MAX`); this crate's concern starts at opening the program and
    /// building the replacement address space.
    pub fn execv(&self, cur: &Arc<Pcb>, path: &str, image: &dyn ElfImage) -> KResult<(u32, u32)> {
        let _guard = self.execv_lock.lock();
        let _file = self.filesystem.open(path, AccessMode::ReadOnly)?;
        cur.set_name(path);

        let new_as = Arc::new(AddressSpace::create(cur.pid()));
        cur.set_address_space(Some(new_as.clone()));
        new_as.activate(&self.tlb);

        new_as.prepare_load();
        let entry = crate::elf::load(&new_as, image, &self.coremap, &self.swap)?;
        new_as.complete_load(&self.tlb);

        let stackptr = new_as.define_stack();
        Ok((entry, stackptr))
    }

    pub fn open(&self, cur: &Arc<Pcb>, path: &str, mode: AccessMode) -> KResult<i32> {
        let node = self.filesystem.open(path, mode)?;
        let mut files = cur.files.lock();
        let fd = (3..MAX_OPEN_FILES).find(|&i| files.entries[i].is_none()).ok_or(Errno::EMFILE)?;
        files.entries[fd] = Some(FdEntry { node, offset: 0, mode });
        if fd >= files.next_fd {
            files.next_fd = fd + 1;
        }
        Ok(fd as i32)
    }

    pub fn read(&self, cur: &Arc<Pcb>, fd: i32, buf: &mut [u8]) -> KResult<usize> {
        if !(0..MAX_OPEN_FILES as i32).contains(&fd) {
            return Err(Errno::EBADF);
        }
        let idx = fd as usize;
        if idx < 3 {
            cur.files.lock().ensure_console(idx);
        }
        let mut files = cur.files.lock();
        let entry = files.entries[idx].as_mut().ok_or(Errno::EBADF)?;
        if !entry.mode.readable() {
            return Err(Errno::EBADF);
        }
        let n = entry.node.read_at(entry.offset, buf)?;
        entry.offset += n;
        Ok(n)
    }

    pub fn write(&self, cur: &Arc<Pcb>, fd: i32, buf: &[u8]) -> KResult<usize> {
        if !(0..MAX_OPEN_FILES as i32).contains(&fd) {
            return Err(Errno::EBADF);
        }
        let idx = fd as usize;
        if idx < 3 {
            cur.files.lock().ensure_console(idx);
        }
        let mut files = cur.files.lock();
        let entry = files.entries[idx].as_mut().ok_or(Errno::EBADF)?;
        if !entry.mode.writeable() {
            return Err(Errno::EBADF);
        }
        let n = entry.node.write_at(entry.offset, buf)?;
        entry.offset += n;
        Ok(n)
    }

    pub fn close(&self, cur: &Arc<Pcb>, fd: i32) -> KResult<()> {
        if !(0..MAX_OPEN_FILES as i32).contains(&fd) {
            return Err(Errno::EBADF);
        }
        let mut files = cur.files.lock();
        let idx = fd as usize;
        if files.entries[idx].take().is_none() {
            return Err(Errno::EBADF);
        }
        Ok(())
    }

    /// `sbrk(increment)`. Returns the previous break.
    pub fn sbrk(&self, cur: &Arc<Pcb>, increment: i32) -> KResult<u32> {
        let as_ = cur.address_space().ok_or(Errno::EFAULT)?;
        as_.sbrk(increment, &self.coremap, &self.swap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::swap::MemoryBlockDevice;
    use crate::tlb::FakeTlb;

    struct NoFiles;
    impl FileSystem for NoFiles {
        fn open(&self, _path: &str, _mode: AccessMode) -> KResult<Arc<dyn FileHandle>> {
            Err(Errno::ENOENT)
        }
    }

    struct InlineScheduler {
        spawned: Spinlock<Vec<(i32, TrapFrame)>>,
    }
    impl InlineScheduler {
        fn new() -> Self {
            InlineScheduler { spawned: Spinlock::new(Vec::new()) }
        }
    }
    impl Scheduler for InlineScheduler {
        fn spawn_child(&self, child: Arc<Pcb>, trap_frame: TrapFrame) {
            self.spawned.lock().push((child.pid(), trap_frame));
        }
    }

    fn harness() -> (Kernel, Arc<Pcb>) {
        let coremap = Coremap::new(0x1000, 64);
        coremap.bring_online();
        let swap = SwapStore::new(Box::new(MemoryBlockDevice::with_capacity_pages(32)));
        Kernel::new(coremap, swap, Box::new(FakeTlb::new()), Box::new(NoFiles), Box::new(InlineScheduler::new()))
    }

    #[test]
    fn fork_assigns_distinct_pid_and_links_child() {
        let (kernel, kproc) = harness();
        let parent = kernel.create_process().unwrap();
        *parent.parent.lock() = kproc.pid();

        let child_pid = kernel.fork(&parent, TrapFrame::default()).unwrap();
        assert_ne!(child_pid, parent.pid());
        assert!(parent.children.lock().contains(&child_pid));
        assert_eq!(kernel.pids.get(child_pid).unwrap().pid(), child_pid);
    }

    #[test]
    fn fork_deep_copies_open_file_entries() {
        let (kernel, _kproc) = harness();
        let parent = kernel.create_process().unwrap();
        {
            let mut files = parent.files.lock();
            files.ensure_console(1);
        }
        let child_pid = kernel.fork(&parent, TrapFrame::default()).unwrap();
        let child = kernel.pids.get(child_pid).unwrap();
        assert!(child.files.lock().entries[1].is_some());
    }

    struct DummyVnode;
    impl Vnode for DummyVnode {}

    #[test]
    fn fork_bumps_refcount_on_shared_cwd_instead_of_copying_it() {
        let (kernel, _kproc) = harness();
        let parent = kernel.create_process().unwrap();
        let cwd: Arc<dyn Vnode> = Arc::new(DummyVnode);
        parent.set_cwd(Some(cwd.clone()));
        assert_eq!(Arc::strong_count(&cwd), 2);

        let child_pid = kernel.fork(&parent, TrapFrame::default()).unwrap();
        let child = kernel.pids.get(child_pid).unwrap();
        assert_eq!(Arc::strong_count(&cwd), 3);
        assert!(Arc::ptr_eq(&child.cwd().unwrap(), &cwd));
    }

    #[test]
    fn fork_inherits_parents_name() {
        let (kernel, _kproc) = harness();
        let parent = kernel.create_process().unwrap();
        parent.set_name("myprogram");
        let child_pid = kernel.fork(&parent, TrapFrame::default()).unwrap();
        let child = kernel.pids.get(child_pid).unwrap();
        assert_eq!(child.name(), "myprogram");
    }

    #[test]
    fn exit_then_waitpid_returns_exit_code() {
        let (kernel, kproc) = harness();
        let parent = kernel.create_process().unwrap();
        *parent.parent.lock() = kproc.pid();
        let child_pid = kernel.fork(&parent, TrapFrame::default()).unwrap();
        let child = kernel.pids.get(child_pid).unwrap();

        kernel.exit(&child, 42);
        let code = kernel.waitpid(&parent, child_pid, 0).unwrap();
        assert_eq!(code, 42);
        assert!(kernel.pids.get(child_pid).is_none());
    }

    #[test]
    fn waitpid_on_non_child_is_echild() {
        let (kernel, kproc) = harness();
        let a = kernel.create_process().unwrap();
        *a.parent.lock() = kproc.pid();
        let b = kernel.create_process().unwrap();
        *b.parent.lock() = kproc.pid();
        assert_eq!(kernel.waitpid(&a, b.pid(), 0), Err(Errno::ECHILD));
    }

    #[test]
    fn exit_destroys_the_address_space_and_releases_its_frames() {
        let (kernel, kproc) = harness();
        let parent = kernel.create_process().unwrap();
        *parent.parent.lock() = kproc.pid();

        let as_ = Arc::new(AddressSpace::create(parent.pid()));
        parent.set_address_space(Some(as_.clone()));
        let paddr = as_.page_table.pull(&kernel.coremap, &kernel.swap, parent.pid(), 0x5000, true, true, false).unwrap();
        assert!(kernel.coremap.is_in_use(paddr));

        kernel.exit(&parent, 0);

        assert!(!kernel.coremap.is_in_use(paddr));
        assert!(parent.address_space().is_none());
    }

    #[test]
    fn sbrk_grows_and_shrinks_the_heap_break() {
        let (kernel, _kproc) = harness();
        let proc = kernel.create_process().unwrap();
        let as_ = Arc::new(AddressSpace::create(proc.pid()));
        as_.define_region(0x1000, PAGE_SIZE as u32, true, true, false);
        proc.set_address_space(Some(as_));

        let old_break = kernel.sbrk(&proc, 0).unwrap();
        let grown = kernel.sbrk(&proc, 4096).unwrap();
        assert_eq!(grown, old_break);
        let new_break = kernel.sbrk(&proc, 0).unwrap();
        assert_eq!(new_break, old_break + 4096);

        let shrunk = kernel.sbrk(&proc, -4096).unwrap();
        assert_eq!(shrunk, new_break);
    }

    #[test]
    fn sbrk_without_an_address_space_is_efault() {
        let (kernel, _kproc) = harness();
        let proc = kernel.create_process().unwrap();
        assert_eq!(kernel.sbrk(&proc, 4096), Err(Errno::EFAULT));
    }

    #[test]
    fn exit_orphans_non_exited_children() {
        let (kernel, kproc) = harness();
        let parent = kernel.create_process().unwrap();
        *parent.parent.lock() = kproc.pid();
        let child_pid = kernel.fork(&parent, TrapFrame::default()).unwrap();
        let child = kernel.pids.get(child_pid).unwrap();

        kernel.exit(&parent, 0);
        assert_eq!(*child.parent.lock(), ORPHAN);
    }

    #[test]
    fn read_write_on_console_fd_materializes_lazily() {
        let (kernel, _kproc) = harness();
        let proc = kernel.create_process().unwrap();
        let n = kernel.write(&proc, 1, b"hi").unwrap();
        assert_eq!(n, 2);
        assert!(proc.files.lock().entries[1].is_some());
    }

    #[test]
    fn read_on_bad_fd_is_ebadf() {
        let (kernel, _kproc) = harness();
        let proc = kernel.create_process().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(kernel.read(&proc, 7, &mut buf), Err(Errno::EBADF));
    }

    #[test]
    fn open_nonexistent_path_propagates_filesystem_error() {
        let (kernel, _kproc) = harness();
        let proc = kernel.create_process().unwrap();
        assert_eq!(kernel.open(&proc, "/nope", AccessMode::ReadOnly), Err(Errno::ENOENT));
    }

    #[test]
    fn close_unopened_fd_is_ebadf() {
        let (kernel, _kproc) = harness();
        let proc = kernel.create_process().unwrap();
        assert_eq!(kernel.close(&proc, 5), Err(Errno::EBADF));
    }
}
