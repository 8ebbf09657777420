//! Console input and output, to the UART.
//!
//! Implements erase/kill line editing for input and routes the console
//! device's read/write entry points used by the file layer.

use crate::proc::{self, Channel};
use crate::spinlock::SpinLock;
use crate::syscall::SysError;
use crate::uart;
use crate::vm::VA;

/// Translate character to control-key equivalent.
const fn ctrl(c: u8) -> u8 {
    c.wrapping_sub(b'@')
}

const INPUT_BUF_SIZE: usize = 128;

pub static CONSOLE: SpinLock<Console> = SpinLock::new(Console::new(), "console");

pub struct Console {
    buf: [u8; INPUT_BUF_SIZE],
    /// read index
    r: usize,
    /// write index (completed input)
    w: usize,
    /// edit index (current editing position)
    e: usize,
}

impl Console {
    const fn new() -> Self {
        Self {
            buf: [0; INPUT_BUF_SIZE],
            r: 0,
            w: 0,
            e: 0,
        }
    }

    /// Outputs a character to the console.
    pub fn putc(c: u8) {
        uart::putc_sync(c);
    }

    /// Handles backspace by erasing the character before the cursor.
    fn put_backspace() {
        Self::putc(b'\x08');
        Self::putc(b' ');
        Self::putc(b'\x08');
    }

    /// User `write()`s to the console land here. The source range has
    /// already been validated against the caller's address space.
    pub fn write(src: VA, len: usize) -> Result<usize, SysError> {
        let src = unsafe { core::slice::from_raw_parts(src.as_usize() as *const u8, len) };

        for &c in src {
            uart::putc(c);
        }

        Ok(len)
    }

    /// User `read()`s from the console land here. Copies a whole input
    /// line (or up to `len` bytes of one) into the validated
    /// destination range.
    pub fn read(dst: VA, len: usize) -> Result<usize, SysError> {
        let dst = unsafe { core::slice::from_raw_parts_mut(dst.as_usize() as *mut u8, len) };

        let mut console = CONSOLE.lock();
        let mut copied = 0;

        while copied < len {
            // wait until the interrupt handler has put some input into the buffer
            while console.r == console.w {
                if proc::current_proc().is_killed() {
                    err!(SysError::Interrupted);
                }

                console = proc::sleep(Channel::Console, console);
            }

            let c = console.buf[console.r % INPUT_BUF_SIZE];
            console.r += 1;

            if c == ctrl(b'D') {
                // end-of-file; save it for next time if we already have bytes
                if copied > 0 {
                    console.r -= 1;
                }
                break;
            }

            dst[copied] = c;
            copied += 1;

            if c == b'\n' {
                break;
            }
        }

        Ok(copied)
    }
}

/// Console input interrupt handler; `uart::handle_interrupt` calls this
/// for each arriving character.
pub fn handle_interrupt(c: u8) {
    let mut console = CONSOLE.lock();

    match c {
        // Print process list.
        c if c == ctrl(b'P') => {
            drop(console);
            unsafe { proc::PROC_TABLE.dump() };
            return;
        }

        // Kill line.
        c if c == ctrl(b'U') => {
            while console.e != console.w
                && console.buf[(console.e - 1) % INPUT_BUF_SIZE] != b'\n'
            {
                console.e -= 1;
                Console::put_backspace();
            }
        }

        // Backspace or delete.
        c if c == ctrl(b'H') || c == b'\x7f' => {
            if console.e != console.w {
                console.e -= 1;
                Console::put_backspace();
            }
        }

        _ => {
            if console.e - console.r < INPUT_BUF_SIZE {
                let c = if c == b'\r' { b'\n' } else { c };

                // echo back to the user
                Console::putc(c);

                let index = console.e % INPUT_BUF_SIZE;
                console.buf[index] = c;
                console.e += 1;

                if c == b'\n' || c == ctrl(b'D') || console.e - console.r == INPUT_BUF_SIZE {
                    // a whole line has arrived; wake up any read()s
                    console.w = console.e;
                    proc::wakeup(Channel::Console);
                }
            }
        }
    }
}

/// Outputs a character, used by `print!`.
pub fn putc(c: u8) {
    Console::putc(c);
}

pub fn init() {
    uart::init();
}
