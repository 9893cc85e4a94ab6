//! `kprintf`'s replacement seam. The boot sequence and real UART/serial
//! driver are external collaborators — this module only fixes the
//! interface the rest of the core writes log lines through, generalizing
//! a single hardwired UART address into a trait with a swappable
//! backend, so tests can capture output instead of needing real
//! hardware.

use alloc::boxed::Box;
use core::fmt;
use spin::Mutex;

pub trait Console: Send {
    fn write_str(&mut self, s: &str);
}

/// Production backend: a memory-mapped UART, written a byte at a time
/// through a volatile pointer.
pub struct MmioUart {
    base_address: usize,
}

impl MmioUart {
    /// # Safety
    /// `base_address` must be the address of a UART's data register, valid
    /// for the lifetime of the kernel.
    pub const unsafe fn new(base_address: usize) -> Self {
        MmioUart { base_address }
    }
}

impl Console for MmioUart {
    fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            unsafe {
                let ptr = self.base_address as *mut u8;
                ptr.write_volatile(byte);
            }
        }
    }
}

/// Test/host backend: collects output in a buffer instead of poking memory.
#[cfg(test)]
pub struct BufferConsole {
    pub buf: alloc::string::String,
}

#[cfg(test)]
impl BufferConsole {
    pub fn new() -> Self {
        BufferConsole { buf: alloc::string::String::new() }
    }
}

#[cfg(test)]
impl Console for BufferConsole {
    fn write_str(&mut self, s: &str) {
        self.buf.push_str(s);
    }
}

static CONSOLE: Mutex<Option<Box<dyn Console>>> = Mutex::new(None);

/// Install the console backend the kernel logs through. Called once during
/// boot, before any `println!` is reachable from user-triggered code paths.
pub fn install(console: Box<dyn Console>) {
    *CONSOLE.lock() = Some(console);
}

pub fn _print(args: fmt::Arguments) {
    struct Adapter<'a>(&'a mut dyn Console);
    impl fmt::Write for Adapter<'_> {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            self.0.write_str(s);
            Ok(())
        }
    }

    use core::fmt::Write;
    let mut guard = CONSOLE.lock();
    if let Some(console) = guard.as_deref_mut() {
        let _ = Adapter(console).write_fmt(args);
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_console_collects_writes() {
        let mut console = BufferConsole::new();
        console.write_str("hello ");
        console.write_str("world");
        assert_eq!(console.buf, "hello world");
    }

    #[test]
    fn install_and_print_does_not_panic() {
        install(Box::new(BufferConsole::new()));
        _print(format_args!("hello {}", 1));
    }
}
