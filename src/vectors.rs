//! EL1 exception vector table and trap frame assembly.
//!
//! Traps from EL0 land with `sp` at the top of the process's kernel
//! stack (where the previous `userret` left it), so pushing a full trap
//! frame places it exactly where `ProcTable::alloc` carved it. Traps
//! taken while in the kernel push their frame onto whatever kernel stack
//! is current and return with `eret` after the handler runs.

#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    r#"
.macro save_frame
    sub sp, sp, #288
    stp x0, x1, [sp, #0]
    stp x2, x3, [sp, #16]
    stp x4, x5, [sp, #32]
    stp x6, x7, [sp, #48]
    stp x8, x9, [sp, #64]
    stp x10, x11, [sp, #80]
    stp x12, x13, [sp, #96]
    stp x14, x15, [sp, #112]
    stp x16, x17, [sp, #128]
    stp x18, x19, [sp, #144]
    stp x20, x21, [sp, #160]
    stp x22, x23, [sp, #176]
    stp x24, x25, [sp, #192]
    stp x26, x27, [sp, #208]
    stp x28, x29, [sp, #224]
    mrs x9, sp_el0
    stp x30, x9, [sp, #240]
    mrs x9, elr_el1
    mrs x10, spsr_el1
    stp x9, x10, [sp, #256]
.endm

.macro restore_frame
    ldp x9, x10, [sp, #256]
    msr elr_el1, x9
    msr spsr_el1, x10
    ldr x9, [sp, #248]
    msr sp_el0, x9
    ldp x2, x3, [sp, #16]
    ldp x4, x5, [sp, #32]
    ldp x6, x7, [sp, #48]
    ldp x8, x9, [sp, #64]
    ldp x10, x11, [sp, #80]
    ldp x12, x13, [sp, #96]
    ldp x14, x15, [sp, #112]
    ldp x16, x17, [sp, #128]
    ldp x18, x19, [sp, #144]
    ldp x20, x21, [sp, #160]
    ldp x22, x23, [sp, #176]
    ldp x24, x25, [sp, #192]
    ldp x26, x27, [sp, #208]
    ldp x28, x29, [sp, #224]
    ldr x30, [sp, #240]
    ldp x0, x1, [sp, #0]
    add sp, sp, #288
.endm

.balign 2048
.global vectors
vectors:
    // current EL, SP_EL0: never used
    b vector_hang
.balign 128
    b vector_hang
.balign 128
    b vector_hang
.balign 128
    b vector_hang

    // current EL, SP_ELx: traps from kernel mode
.balign 128
    b el1_sync_entry
.balign 128
    b el1_irq_entry
.balign 128
    b vector_hang
.balign 128
    b vector_hang

    // lower EL, AArch64: traps from user mode
.balign 128
    b el0_sync_entry
.balign 128
    b el0_irq_entry
.balign 128
    b vector_hang
.balign 128
    b vector_hang

    // lower EL, AArch32: unsupported
.balign 128
    b vector_hang
.balign 128
    b vector_hang
.balign 128
    b vector_hang
.balign 128
    b vector_hang

el0_sync_entry:
    save_frame
    mov x0, sp
    bl user_sync
    b vector_hang

el0_irq_entry:
    save_frame
    mov x0, sp
    bl user_irq
    b vector_hang

el1_sync_entry:
    save_frame
    mov x0, sp
    bl kernel_sync
    b vector_hang

el1_irq_entry:
    save_frame
    mov x0, sp
    bl kernel_irq
    restore_frame
    eret

// Restores a trap frame and returns to user mode. The frame sits at the
// top of the kernel stack, so after the restore `sp` is back at the
// stack top, ready for the next trap.
.global userret
userret:
    mov sp, x0
    restore_frame
    eret

vector_hang:
    wfe
    b vector_hang
"#
);
