//! Physical memory layout of the QEMU virt board.
//!
//! 0x0800_0000 -- GICv2 distributor, CPU interface just after
//! 0x0900_0000 -- PL011 UART registers
//! 0x4000_0000 -- start of RAM, kernel loads at 0x4008_0000
//!
//! The kernel is identity mapped. User virtual addresses start at 0 and
//! are capped below the device window so a user image can never overlap
//! the MMIO or kernel mappings shared into every page directory.

/// GICv2 distributor base
pub const GICD: usize = 0x0800_0000;
/// GICv2 CPU interface base
pub const GICC: usize = 0x0801_0000;

/// PL011 UART base
pub const UART0: usize = 0x0900_0000;
/// UART interrupt (SPI 1)
pub const UART0_IRQ: u32 = 33;

/// EL1 virtual timer interrupt (PPI 11)
pub const TIMER_IRQ: u32 = 27;

/// First address of RAM
pub const RAMBASE: usize = 0x4000_0000;
/// One past the last usable address of RAM (128 MiB board)
pub const PHYSTOP: usize = RAMBASE + 128 * 1024 * 1024;

/// Highest user virtual address + 1. Everything at and above this is
/// kernel or device territory within the shared low mappings.
pub const USERTOP: usize = 0x0800_0000;

/// Device window covered by block mappings in every page directory.
pub const DEVBASE: usize = 0x0800_0000;
pub const DEVTOP: usize = 0x0a00_0000;
