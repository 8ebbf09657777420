#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicBool, Ordering};

extern crate alloc;

#[macro_use]
pub mod printf;
#[macro_use]
pub mod error;
pub mod arm64;
pub mod console;
pub mod entry;
pub mod exec;
pub mod file;
pub mod fs;
pub mod gic;
pub mod kalloc;
pub mod log;
pub mod memlayout;
pub mod param;
pub mod proc;
pub mod sleeplock;
pub mod spinlock;
pub mod start;
pub mod swtch;
pub mod sync;
pub mod syscall;
pub mod sysfile;
pub mod sysproc;
pub mod trap;
pub mod uart;
pub mod vectors;
pub mod vm;

static STARTED: AtomicBool = AtomicBool::new(false);

pub fn main() -> ! {
    let cpu_id = arm64::cpu_id();

    if cpu_id == 0 {
        unsafe {
            console::init();

            println!("");
            println!("kestrel kernel is booting");
            println!("");

            kalloc::init();
            vm::init();
            vm::init_hart();
            proc::init();
            trap::init_hart();
            gic::init();
            gic::init_hart();
            proc::user_init();
        }

        println!("cpu {} is starting", cpu_id);

        STARTED.store(true, Ordering::SeqCst);

        start::start_secondary_cpus();
    } else {
        while !STARTED.load(Ordering::SeqCst) {
            core::hint::spin_loop()
        }

        println!("cpu {} is starting", cpu_id);

        unsafe {
            vm::init_hart();
            trap::init_hart();
            gic::init_hart();
        }
    }

    unsafe { proc::scheduler() }
}

pub fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    printf::panic(info)
}
