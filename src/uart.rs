//! PL011 UART driver.

use core::ptr;

use crate::console;
use crate::memlayout::UART0;
use crate::printf::PRINTF;
use crate::proc::{self, Channel};
use crate::spinlock::SpinLock;

const fn reg(base_address: usize, offset: usize) -> *mut u32 {
    (base_address + offset) as *mut u32
}

const DR: usize = 0x00;
const FR: usize = 0x18;
const FR_RXFE: u32 = 1 << 4;
const FR_TXFF: u32 = 1 << 5;
const IBRD: usize = 0x24;
const FBRD: usize = 0x28;
const LCRH: usize = 0x2c;
const LCRH_WLEN8: u32 = 3 << 5;
const CR: usize = 0x30;
const CR_UARTEN: u32 = 1 << 0;
const CR_TXE: u32 = 1 << 8;
const CR_RXE: u32 = 1 << 9;
const IMSC: usize = 0x38;
const IMSC_RXIM: u32 = 1 << 4;
const IMSC_TXIM: u32 = 1 << 5;
const ICR: usize = 0x44;

pub static UART: SpinLock<Uart> = SpinLock::new(Uart::new(UART0), "uart");

const UART_TX_BUF_SIZE: usize = 32;

pub struct Uart {
    base_address: usize,
    tx_buf: [u8; UART_TX_BUF_SIZE],
    tx_w: usize,
    tx_r: usize,
}

impl Uart {
    pub const fn new(base_address: usize) -> Self {
        Self {
            base_address,
            tx_buf: [0; UART_TX_BUF_SIZE],
            tx_w: 0,
            tx_r: 0,
        }
    }

    fn read(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile(reg(self.base_address, offset)) }
    }

    fn write(&mut self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile(reg(self.base_address, offset), value) }
    }

    pub fn init(&mut self) {
        // disable while configuring
        self.write(CR, 0);
        self.write(ICR, 0x7ff);

        // 115200 baud from the 24 MHz virt board clock
        self.write(IBRD, 13);
        self.write(FBRD, 1);

        // 8 bits, FIFOs off so we interrupt per character
        self.write(LCRH, LCRH_WLEN8);

        self.write(IMSC, IMSC_RXIM | IMSC_TXIM);
        self.write(CR, CR_UARTEN | CR_TXE | CR_RXE);
    }

    /// Pushes buffered output to the device while there is room.
    /// Caller must hold the UART lock.
    fn push_tx(&mut self) {
        loop {
            if self.tx_w == self.tx_r {
                // buffer is empty
                return;
            }

            if self.read(FR) & FR_TXFF != 0 {
                // the device is busy; it will interrupt when ready
                return;
            }

            let c = self.tx_buf[self.tx_r % UART_TX_BUF_SIZE];
            self.tx_r += 1;

            // a putc may be waiting for room
            proc::wakeup(Channel::Uart);

            self.write(DR, c as u32);
        }
    }
}

/// Buffered output for the console write path. May sleep until the
/// transmit ring has room, so only valid from process context.
pub fn putc(c: u8) {
    let mut uart = UART.lock();

    if PRINTF.is_panicked() {
        loop {}
    }

    while uart.tx_w == uart.tx_r + UART_TX_BUF_SIZE {
        uart = proc::sleep(Channel::Uart, uart);
    }

    let index = uart.tx_w % UART_TX_BUF_SIZE;
    uart.tx_buf[index] = c;
    uart.tx_w += 1;
    uart.push_tx();
}

/// Polled output for `println!` and panics; does not use interrupts.
#[cfg(not(test))]
pub fn putc_sync(c: u8) {
    let _intr_lock = proc::lock_current_cpu();

    if PRINTF.is_panicked() {
        loop {}
    }

    // Safety: FR/DR polling races only delay output
    let uart = unsafe { UART.get_mut_unchecked() };
    while uart.read(FR) & FR_TXFF != 0 {
        core::hint::spin_loop();
    }
    uart.write(DR, c as u32);
}

#[cfg(test)]
pub fn putc_sync(c: u8) {
    std::print!("{}", c as char);
}

/// Handles a UART interrupt: drains received characters into the
/// console and restarts buffered transmission.
pub fn handle_interrupt() {
    loop {
        let c = {
            // Safety: DR read is racy only against other rx drains
            let uart = unsafe { UART.get_mut_unchecked() };
            if uart.read(FR) & FR_RXFE != 0 {
                break;
            }
            (uart.read(DR) & 0xff) as u8
        };

        console::handle_interrupt(c);
    }

    let mut uart = UART.lock();
    uart.write(ICR, 0x7ff);
    uart.push_tx();
}

pub fn init() {
    UART.lock().init();
}
