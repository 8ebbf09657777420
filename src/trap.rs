use crate::arm64::{
    self, EC_DABORT_EL0, EC_IABORT_EL0, EC_SVC64, esr_ec, interrupts, timer_arm, timer_freq,
};
use crate::gic;
use crate::memlayout::{TIMER_IRQ, UART0_IRQ};
use crate::proc::{self, current_proc, current_proc_opt};
use crate::spinlock::SpinLock;
use crate::syscall::syscall1;
use crate::uart;

pub static TICKS: SpinLock<usize> = SpinLock::new(0, "time");

/// User-mode register snapshot, pushed by the vector assembly at the
/// top of the process's kernel stack. Field offsets are baked into
/// `save_frame`/`restore_frame` in vectors.rs.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct TrapFrame {
    /*   0 */ pub x0: u64,
    /*   8 */ pub x1: u64,
    /*  16 */ pub x2: u64,
    /*  24 */ pub x3: u64,
    /*  32 */ pub x4: u64,
    /*  40 */ pub x5: u64,
    /*  48 */ pub x6: u64,
    /*  56 */ pub x7: u64,
    /*  64 */ pub x8: u64,
    /*  72 */ pub x9: u64,
    /*  80 */ pub x10: u64,
    /*  88 */ pub x11: u64,
    /*  96 */ pub x12: u64,
    /* 104 */ pub x13: u64,
    /* 112 */ pub x14: u64,
    /* 120 */ pub x15: u64,
    /* 128 */ pub x16: u64,
    /* 136 */ pub x17: u64,
    /* 144 */ pub x18: u64,
    /* 152 */ pub x19: u64,
    /* 160 */ pub x20: u64,
    /* 168 */ pub x21: u64,
    /* 176 */ pub x22: u64,
    /* 184 */ pub x23: u64,
    /* 192 */ pub x24: u64,
    /* 200 */ pub x25: u64,
    /* 208 */ pub x26: u64,
    /* 216 */ pub x27: u64,
    /* 224 */ pub x28: u64,
    /* 232 */ pub x29: u64,
    /* 240 */ pub x30: u64,
    /* 248 */ pub sp_el0: u64,
    /* 256 */ pub elr_el1: u64,
    /* 264 */ pub spsr_el1: u64,
    /* 272 */ _reserved: [u64; 2],
}

impl TrapFrame {
    /// Bytes the vector assembly reserves per frame.
    pub const SIZE: usize = 288;

    pub fn zero(&mut self) {
        *self = unsafe { core::mem::zeroed() };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptKind {
    Timer,
    Device,
}

/// Synchronous exception from user mode: a system call or a fault.
///
/// # Safety
/// Called from the vector assembly with the saved trap frame.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn user_sync(tf: &mut TrapFrame) -> ! {
    assert_eq!(tf.spsr_el1 & 0xf, 0, "user_sync: not from user mode");

    let esr = arm64::esr_el1();
    let proc = current_proc();

    match esr_ec(esr) {
        EC_SVC64 => {
            if proc.is_killed() {
                proc::exit(-1);
            }

            // elr already points past the svc instruction; the saved
            // state is all in the frame, safe to take interrupts again.
            interrupts::enable();

            syscall1(tf);
        }

        ec @ (EC_IABORT_EL0 | EC_DABORT_EL0) => {
            let mut inner = proc.inner.lock();
            println!(
                "user_sync: fault ec=0x{:X} pid={:?} elr=0x{:X} far=0x{:X}",
                ec,
                inner.pid,
                tf.elr_el1,
                arm64::far_el1(),
            );
            inner.killed = true;
        }

        ec => {
            let mut inner = proc.inner.lock();
            println!(
                "user_sync: unexpected esr=0x{:X} (ec=0x{:X}) pid={:?} elr=0x{:X}",
                esr, ec, inner.pid, tf.elr_el1,
            );
            inner.killed = true;
        }
    }

    if proc.is_killed() {
        proc::exit(-1);
    }

    unsafe { usertrapret(tf) }
}

/// Interrupt taken from user mode.
///
/// # Safety
/// Called from the vector assembly with the saved trap frame.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn user_irq(tf: &mut TrapFrame) -> ! {
    let which = dev_intr();

    let proc = current_proc();
    if proc.is_killed() {
        proc::exit(-1);
    }

    if which == Some(InterruptKind::Timer) {
        proc::r#yield();
    }

    unsafe { usertrapret(tf) }
}

/// Synchronous exception while in kernel mode. Always fatal.
///
/// # Safety
/// Called from the vector assembly.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kernel_sync(tf: &mut TrapFrame) -> ! {
    let esr = arm64::esr_el1();
    println!(
        "esr=0x{:X} elr=0x{:X} far=0x{:X}",
        esr,
        tf.elr_el1,
        arm64::far_el1(),
    );
    panic!("kernel_sync");
}

/// Interrupt taken while in kernel mode. Returns to the interrupted
/// code via the vector assembly's restore path.
///
/// # Safety
/// Called from the vector assembly.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kernel_irq(_tf: &mut TrapFrame) {
    assert!(!interrupts::get(), "kernel_irq: interrupts enabled");

    let which = dev_intr();

    // give up the CPU if a process was running through this kernel path
    if which == Some(InterruptKind::Timer) && current_proc_opt().is_some() {
        proc::r#yield();
    }
}

/// Returns to user mode through the trap frame. Does not return.
///
/// # Safety
/// The caller's process page directory must be the active translation.
pub unsafe fn usertrapret(tf: *mut TrapFrame) -> ! {
    // from here until eret the vector base would mishandle a trap
    interrupts::disable();

    #[cfg(target_arch = "aarch64")]
    unsafe {
        unsafe extern "C" {
            fn userret(tf: *mut TrapFrame) -> !;
        }
        userret(tf)
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = tf;
        unimplemented!("only meaningful on the target")
    }
}

/// Handle clock interrupts.
fn clock_intr() {
    if arm64::cpu_id() == 0 {
        let mut ticks = TICKS.lock();
        *ticks += 1;
        proc::wakeup(proc::Channel::Ticks);
    }

    // Ask for the next timer interrupt, about a tenth of a second out.
    timer_arm(timer_freq() / 10);
}

/// Claims and serves one pending interrupt from the GIC.
fn dev_intr() -> Option<InterruptKind> {
    let irq = gic::claim();

    let kind = match irq {
        TIMER_IRQ => {
            clock_intr();
            Some(InterruptKind::Timer)
        }
        UART0_IRQ => {
            uart::handle_interrupt();
            Some(InterruptKind::Device)
        }
        gic::SPURIOUS => None,
        _ => {
            println!("unexpected interrupt irq={}", irq);
            None
        }
    };

    if kind.is_some() {
        gic::complete(irq);
    }

    kind
}

/// Sets up this CPU to take exceptions and starts its timer.
///
/// # Safety
/// Must be called once per CPU during initialization.
#[cfg(target_arch = "aarch64")]
pub unsafe fn init_hart() {
    use aarch64_cpu::registers::VBAR_EL1;
    use tock_registers::interfaces::Writeable;

    unsafe extern "C" {
        fn vectors();
    }

    VBAR_EL1.set(vectors as usize as u64);
    timer_arm(timer_freq() / 10);
}

#[cfg(not(target_arch = "aarch64"))]
pub unsafe fn init_hart() {
    unimplemented!("only meaningful on the target")
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    /// The vector assembly stores pairs at these exact offsets.
    #[test]
    fn trapframe_layout_matches_vectors() {
        assert_eq!(size_of::<TrapFrame>(), TrapFrame::SIZE);
        assert_eq!(offset_of!(TrapFrame, x0), 0);
        assert_eq!(offset_of!(TrapFrame, x8), 64);
        assert_eq!(offset_of!(TrapFrame, x30), 240);
        assert_eq!(offset_of!(TrapFrame, sp_el0), 248);
        assert_eq!(offset_of!(TrapFrame, elr_el1), 256);
        assert_eq!(offset_of!(TrapFrame, spsr_el1), 264);
    }

    /// Frames are pushed on a 16-byte aligned stack.
    #[test]
    fn trapframe_size_is_stack_aligned() {
        assert_eq!(size_of::<TrapFrame>() % 16, 0);
    }
}
