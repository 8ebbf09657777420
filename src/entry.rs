//! Boot entry. Every CPU lands here (the boot CPU from the loader,
//! secondaries from PSCI), picks its slice of the boot stack by core
//! number, and jumps into `start`.

#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    r#"
.section .text.entry
.global _entry
_entry:
    mrs x0, mpidr_el1
    and x0, x0, #0xff

    // sp = STACK0 + (cpu_id + 1) * NBOOTSTACK_PAGES * PGSIZE
    add x1, x0, #1
    mov x2, #16384
    mul x1, x1, x2
    adrp x3, STACK0
    add x3, x3, :lo12:STACK0
    add x3, x3, x1
    mov sp, x3

    bl start
1:
    wfe
    b 1b
.text
"#
);
