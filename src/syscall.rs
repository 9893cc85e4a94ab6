//! Trap frame and syscall dispatch, grounded on
//! `original_source/kern/arch/mips/locore/trap.c`'s `mips_syscall` and the
//! syscall bodies in `kern/syscall/{process_syscalls,file_syscalls,execv}.c`.
//! User/kernel pointer marshalling is the one piece of that boundary this
//! crate cannot do itself (no real MMU-backed copyin/copyout), so it is
//! exposed as the `UserSpace` collaborator trait and every dispatch entry
//! point takes already-marshalled Rust values.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use crate::elf::ElfImage;
use crate::error::{Errno, KResult};
use crate::process::{AccessMode, Kernel, Pcb};

pub const SYS_REBOOT: u32 = 1;
pub const SYS___TIME: u32 = 2;
pub const SYS_GETPID: u32 = 3;
pub const SYS__EXIT: u32 = 4;
pub const SYS_FORK: u32 = 5;
pub const SYS_WAITPID: u32 = 6;
pub const SYS_EXECV: u32 = 7;
pub const SYS_OPEN: u32 = 8;
pub const SYS_READ: u32 = 9;
pub const SYS_WRITE: u32 = 10;
pub const SYS_CLOSE: u32 = 11;
pub const SYS_SBRK: u32 = 12;

/// The MIPS-style trap frame a syscall exception saves and a syscall return
/// writes back into: arguments in `a0..a3`, return value in `v0`, and a
/// second register (`a3`) reused on return as a 0/1 success flag rather than
/// a negative `errno` the way a flatter ABI would do it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub a0: u32,
    pub a1: u32,
    pub a2: u32,
    pub a3: u32,
    pub v0: u32,
    pub v1: u32,
    pub sp: u32,
    pub epc: u32,
}

impl TrapFrame {
    /// Advances `epc` past the syscall instruction and writes a successful
    /// return: `v0`/`v1` hold the result, `a3` is cleared.
    pub fn return_ok(&mut self, v0: u32, v1: u32) {
        self.v0 = v0;
        self.v1 = v1;
        self.a3 = 0;
        self.epc += 4;
    }

    /// Advances `epc` and writes a failed return: `v0` holds the error
    /// number, `a3` is set.
    pub fn return_err(&mut self, err: Errno) {
        self.v0 = err as u32;
        self.a3 = 1;
        self.epc += 4;
    }

    /// `execv` never returns to the instruction that issued it; instead it
    /// jumps straight into the freshly loaded program with `argc`/`argv`
    /// in `a0`/`a1`, the stack pointer `sp` below the copied-out argument
    /// vector, and `epc` at the image's entry point.
    pub fn enter_user(&mut self, entry: u32, sp: u32, argc: u32, argv: u32) {
        self.epc = entry;
        self.sp = sp;
        self.a0 = argc;
        self.a1 = argv;
        self.v0 = 0;
        self.a3 = 0;
    }
}

/// User-pointer marshalling, external since this crate has no real MMU.
/// Production code backs this with `copyin`/`copyout`/
/// `copyinstr` over the faulting address space; tests back it with a plain
/// byte vector standing in for user memory.
pub trait UserSpace: Sync {
    fn copy_in(&self, uaddr: u32, buf: &mut [u8]) -> KResult<()>;
    fn copy_out(&self, uaddr: u32, buf: &[u8]) -> KResult<()>;

    /// Reads a NUL-terminated string no longer than `max` bytes.
    fn copy_in_cstr(&self, uaddr: u32, max: usize) -> KResult<String> {
        let mut buf = vec![0u8; max];
        self.copy_in(uaddr, &mut buf)?;
        let len = buf.iter().position(|&b| b == 0).ok_or(Errno::EFAULT)?;
        buf.truncate(len);
        String::from_utf8(buf).map_err(|_| Errno::EFAULT)
    }
}

/// Dispatches one syscall trap. `tf.v0` holds the syscall number on entry;
/// on return `tf` holds the MIPS success/error convention. Matches
/// `mips_syscall`'s structure: decode, call, encode, advance
/// `epc`. An unrecognized number returns `ENOSYS` rather than panicking,
/// since a user process choosing a bad number is not a kernel bug.
pub fn dispatch(
    kernel: &Kernel,
    cur: &Arc<Pcb>,
    user: &dyn UserSpace,
    image_for_execv: Option<&dyn ElfImage>,
    tf: &mut TrapFrame,
) {
    let num = tf.v0;
    if num == SYS_EXECV {
        match do_execv(kernel, cur, user, image_for_execv, tf.a0, tf.a1) {
            Ok((entry, sp, argc, argv)) => tf.enter_user(entry, sp, argc, argv),
            Err(e) => tf.return_err(e),
        }
        return;
    }
    let result = handle(kernel, cur, user, num, tf.a0, tf.a1, tf.a2);
    match result {
        Ok((v0, v1)) => tf.return_ok(v0, v1),
        Err(e) => tf.return_err(e),
    }
}

/// Maximum number of argv pointers read from the user's argument vector
/// before giving up with `E2BIG`; the string bytes themselves are bounded
/// separately by `ARG_MAX`.
const MAX_ARGV_ENTRIES: usize = 256;

/// Marshals `path` and `argv` from user space, runs the program through
/// `Kernel::execv`, then copies the argument strings and a NUL-terminated
/// pointer array onto the new stack, 4-byte aligned, matching the calling
/// convention `execv` hands control to user mode under.
fn do_execv(
    kernel: &Kernel,
    cur: &Arc<Pcb>,
    user: &dyn UserSpace,
    image_for_execv: Option<&dyn ElfImage>,
    a0: u32,
    a1: u32,
) -> KResult<(u32, u32, u32, u32)> {
    let path = user.copy_in_cstr(a0, crate::config::PATH_MAX)?;

    // a1 points at an array of u32 user pointers, terminated by NULL.
    let mut argv_user_ptrs = vec![];
    let mut idx = 0usize;
    loop {
        if idx >= MAX_ARGV_ENTRIES {
            return Err(Errno::E2BIG);
        }
        let mut raw = [0u8; 4];
        user.copy_in(a1 + (idx as u32) * 4, &mut raw)?;
        let entry = u32::from_le_bytes(raw);
        if entry == 0 {
            break;
        }
        argv_user_ptrs.push(entry);
        idx += 1;
    }

    let mut args = vec![];
    let mut bytes_used = 0usize;
    for &uptr in &argv_user_ptrs {
        let remaining = crate::config::ARG_MAX.saturating_sub(bytes_used);
        let arg = user.copy_in_cstr(uptr, remaining)?;
        bytes_used += arg.len() + 1;
        if bytes_used > crate::config::ARG_MAX {
            return Err(Errno::E2BIG);
        }
        args.push(arg);
    }

    let image = image_for_execv.ok_or(Errno::ENOENT)?;
    let (entry, stack_top) = kernel.execv(cur, &path, image)?;

    let mut sp = stack_top;
    let mut arg_ptrs = vec![0u32; args.len()];
    for (i, arg) in args.iter().enumerate().rev() {
        let len = arg.len() + 1;
        sp -= len as u32;
        sp &= !3;
        let mut bytes = alloc::vec::Vec::with_capacity(len);
        bytes.extend_from_slice(arg.as_bytes());
        bytes.push(0);
        user.copy_out(sp, &bytes)?;
        arg_ptrs[i] = sp;
    }

    let argc = arg_ptrs.len() as u32;
    sp &= !3;
    sp -= (argc + 1) * 4;
    sp &= !3;
    let argv_base = sp;
    for (i, p) in arg_ptrs.iter().enumerate() {
        user.copy_out(argv_base + (i as u32) * 4, &p.to_le_bytes())?;
    }
    user.copy_out(argv_base + argc * 4, &0u32.to_le_bytes())?;

    Ok((entry, sp, argc, argv_base))
}

fn handle(
    kernel: &Kernel,
    cur: &Arc<Pcb>,
    user: &dyn UserSpace,
    num: u32,
    a0: u32,
    a1: u32,
    a2: u32,
) -> KResult<(u32, u32)> {
    match num {
        SYS_REBOOT => Err(Errno::ENOSYS),
        SYS___TIME => Ok((0, 0)),
        SYS_GETPID => Ok((cur.pid() as u32, 0)),
        SYS__EXIT => {
            kernel.exit(cur, a0 as i32);
            Ok((0, 0))
        }
        SYS_FORK => {
            let child_tf = TrapFrame::default();
            let pid = kernel.fork(cur, child_tf)?;
            Ok((pid as u32, 0))
        }
        SYS_WAITPID => {
            let pid = a0 as i32;
            let options = a2 as i32;
            let code = kernel.waitpid(cur, pid, options)?;
            if a1 != 0 {
                user.copy_out(a1, &code.to_le_bytes())?;
            }
            Ok((pid as u32, 0))
        }
        SYS_EXECV => unreachable!("execv is special-cased in dispatch()"),
        SYS_OPEN => {
            let path = user.copy_in_cstr(a0, crate::config::PATH_MAX)?;
            let mode = decode_access_mode(a1)?;
            let fd = kernel.open(cur, &path, mode)?;
            Ok((fd as u32, 0))
        }
        SYS_READ => {
            let fd = a0 as i32;
            let len = a2 as usize;
            let mut buf = vec![0u8; len];
            let n = kernel.read(cur, fd, &mut buf)?;
            user.copy_out(a1, &buf[..n])?;
            Ok((n as u32, 0))
        }
        SYS_WRITE => {
            let fd = a0 as i32;
            let len = a2 as usize;
            let mut buf = vec![0u8; len];
            user.copy_in(a1, &mut buf)?;
            let n = kernel.write(cur, fd, &buf)?;
            Ok((n as u32, 0))
        }
        SYS_CLOSE => {
            kernel.close(cur, a0 as i32)?;
            Ok((0, 0))
        }
        SYS_SBRK => {
            let old_break = kernel.sbrk(cur, a0 as i32)?;
            Ok((old_break, 0))
        }
        _ => Err(Errno::ENOSYS),
    }
}

fn decode_access_mode(raw: u32) -> KResult<AccessMode> {
    match raw {
        0 => Ok(AccessMode::ReadOnly),
        1 => Ok(AccessMode::WriteOnly),
        2 => Ok(AccessMode::ReadWrite),
        _ => Err(Errno::EINVAL),
    }
}
