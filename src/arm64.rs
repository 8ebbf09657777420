//! AArch64 architecture glue: page constants, translation descriptor
//! bits, interrupt masking, and the handful of system registers the rest
//! of the kernel needs. System-register access goes through the
//! `aarch64-cpu` crate; the few operations it does not model (TLB
//! maintenance, wfi) are inline assembly.

pub const PGSIZE: usize = 4096;
pub const PGSHIFT: usize = 12;

pub const fn pg_round_up(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

/// Index of `va` into the level-`level` translation table.
/// Level 0 is the root; level 3 holds page descriptors.
pub const fn px(level: usize, va: usize) -> usize {
    (va >> (PGSHIFT + 9 * (3 - level))) & 0x1ff
}

/// Max user virtual address representable by a 4-level walk (48 bits).
pub const MAXVA: usize = 1 << 48;

// Translation descriptor bits (VMSAv8-64, 4 KiB granule).
pub const PTE_VALID: u64 = 1 << 0;
/// Table descriptor at levels 0-2; page descriptor at level 3.
pub const PTE_TABLE: u64 = 1 << 1;
/// Access flag; a fault is taken if clear.
pub const PTE_AF: u64 = 1 << 10;
/// Inner shareable.
pub const PTE_ISH: u64 = 3 << 8;
/// EL0 access allowed (AP[1]).
pub const PTE_USER: u64 = 1 << 6;
/// Read-only at all levels (AP[2]).
pub const PTE_RO: u64 = 1 << 7;
/// Unprivileged execute never.
pub const PTE_UXN: u64 = 1 << 54;
/// Privileged execute never.
pub const PTE_PXN: u64 = 1 << 53;

// MAIR_EL1 attribute indices, see `MAIR_VALUE`.
pub const ATTR_NORMAL: u64 = 0 << 2;
pub const ATTR_DEVICE: u64 = 1 << 2;

/// Attr0 = normal memory, write-back; Attr1 = device nGnRE.
pub const MAIR_VALUE: u64 = 0x04ff;

/// 48-bit TTBR0 walk, 4 KiB granule, inner-shareable write-back, TTBR1
/// walks disabled (the kernel lives in the low half of every pgdir).
pub const TCR_VALUE: u64 =
    16 | (1 << 8) | (1 << 10) | (3 << 12) | (1 << 23) | (0b101 << 32);

pub const SCTLR_MMU: u64 = (1 << 0) | (1 << 2) | (1 << 12); // M, C, I

pub const fn pa_to_pte(pa: usize) -> u64 {
    (pa as u64) & 0x0000_ffff_ffff_f000
}

pub const fn pte_to_pa(pte: u64) -> usize {
    (pte & 0x0000_ffff_ffff_f000) as usize
}

#[cfg(not(test))]
pub mod interrupts {
    use aarch64_cpu::registers::DAIF;
    use tock_registers::interfaces::{ReadWriteable, Readable};

    /// Returns true if IRQs are currently unmasked.
    pub fn get() -> bool {
        !DAIF.is_set(DAIF::I)
    }

    pub fn enable() {
        DAIF.modify(DAIF::I::CLEAR);
    }

    pub fn disable() {
        DAIF.modify(DAIF::I::SET);
    }
}

/// Host stand-in so lock discipline code unit-tests off target.
#[cfg(test)]
pub mod interrupts {
    pub fn get() -> bool {
        false
    }

    pub fn enable() {}

    pub fn disable() {}
}

/// Core number of the executing CPU.
#[cfg(not(test))]
pub fn cpu_id() -> usize {
    use aarch64_cpu::registers::MPIDR_EL1;
    use tock_registers::interfaces::Readable;

    (MPIDR_EL1.get() & 0xff) as usize
}

#[cfg(test)]
pub fn cpu_id() -> usize {
    0
}

pub fn current_el() -> u64 {
    use aarch64_cpu::registers::CurrentEL;
    use tock_registers::interfaces::Readable;

    (CurrentEL.get() >> 2) & 0x3
}

pub fn esr_el1() -> u64 {
    use aarch64_cpu::registers::ESR_EL1;
    use tock_registers::interfaces::Readable;

    ESR_EL1.get()
}

pub fn far_el1() -> u64 {
    use aarch64_cpu::registers::FAR_EL1;
    use tock_registers::interfaces::Readable;

    FAR_EL1.get()
}

/// Exception class field of ESR_EL1.
pub const fn esr_ec(esr: u64) -> u64 {
    (esr >> 26) & 0x3f
}

/// EC values the trap handler cares about.
pub const EC_SVC64: u64 = 0x15;
pub const EC_IABORT_EL0: u64 = 0x20;
pub const EC_DABORT_EL0: u64 = 0x24;

/// Installs a new user translation root and invalidates stale walks.
#[cfg(target_arch = "aarch64")]
pub fn set_ttbr0(pa: usize) {
    use aarch64_cpu::registers::TTBR0_EL1;
    use tock_registers::interfaces::Writeable;

    unsafe {
        core::arch::asm!("dsb ishst");
        TTBR0_EL1.set(pa as u64);
        core::arch::asm!("tlbi vmalle1is", "dsb ish", "isb");
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub fn set_ttbr0(_pa: usize) {
    unimplemented!("only meaningful on the target")
}

/// Generic timer frequency in Hz.
pub fn timer_freq() -> u64 {
    use aarch64_cpu::registers::CNTFRQ_EL0;
    use tock_registers::interfaces::Readable;

    CNTFRQ_EL0.get()
}

/// Arms the EL1 virtual timer to fire after `ticks` counter cycles.
pub fn timer_arm(ticks: u64) {
    use aarch64_cpu::registers::{CNTV_CTL_EL0, CNTV_TVAL_EL0};
    use tock_registers::interfaces::Writeable;

    CNTV_TVAL_EL0.set(ticks);
    CNTV_CTL_EL0.write(CNTV_CTL_EL0::ENABLE::SET + CNTV_CTL_EL0::IMASK::CLEAR);
}

#[cfg(target_arch = "aarch64")]
pub fn wait_for_interrupt() {
    unsafe { core::arch::asm!("wfi", options(nomem, nostack)) };
}

#[cfg(not(target_arch = "aarch64"))]
pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(pg_round_down(0), 0);
        assert_eq!(pg_round_down(PGSIZE - 1), 0);
        assert_eq!(pg_round_down(PGSIZE), PGSIZE);
        assert_eq!(pg_round_up(0), 0);
        assert_eq!(pg_round_up(1), PGSIZE);
        assert_eq!(pg_round_up(PGSIZE), PGSIZE);
        assert_eq!(pg_round_up(PGSIZE + 1), 2 * PGSIZE);
    }

    #[test]
    fn table_indices() {
        // One entry per level covers 512 entries of the level below.
        let va = (3 << 39) | (7 << 30) | (13 << 21) | (42 << 12) | 0x123;
        assert_eq!(px(0, va), 3);
        assert_eq!(px(1, va), 7);
        assert_eq!(px(2, va), 13);
        assert_eq!(px(3, va), 42);
    }

    #[test]
    fn pte_address_round_trip() {
        let pa = 0x4321_f000;
        let pte = pa_to_pte(pa) | PTE_VALID | PTE_AF | PTE_USER;
        assert_eq!(pte_to_pa(pte), pa);
        // High attribute bits must not leak into the address.
        assert_eq!(pte_to_pa(pa_to_pte(pa) | PTE_UXN | PTE_PXN), pa);
    }

    #[test]
    fn esr_class_decode() {
        assert_eq!(esr_ec(0x15 << 26), EC_SVC64);
        assert_eq!(esr_ec((0x24 << 26) | 0x3f), EC_DABORT_EL0);
    }
}
