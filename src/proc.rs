use core::cell::UnsafeCell;
use core::mem::{MaybeUninit, size_of, transmute};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::boxed::Box;
use alloc::string::String;

use crate::arm64::{self, PGSIZE, interrupts};
use crate::error::KernelError;
use crate::file::File;
use crate::fs::{self, Inode, Path};
use crate::kalloc;
use crate::log::{self, Operation};
use crate::param::{KSTACKSIZE, NCPU, NOFILE, NPROC, ROOTDEV};
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::swtch::{Context, swtch};
use crate::trap::{TrapFrame, usertrapret};
use crate::vm::{self, PgDir};
use crate::sync::OnceLock;

pub static CPU_TABLE: CpuTable = CpuTable::new();
pub static PROC_TABLE: ProcTable = ProcTable::new();
pub static INIT_PROC: OnceLock<&'static Proc> = OnceLock::new();

/// Per-CPU state
pub struct Cpu {
    pub proc: Option<&'static Proc>,
    /// Saved scheduler context; the other end of every switch on this CPU.
    pub scheduler: *mut Context,
    pub num_off: isize,
    pub interrupts_enabled: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: None,
            scheduler: ptr::null_mut(),
            num_off: 0,
            interrupts_enabled: false,
        }
    }

    /// Locks this CPU by disabling interrupts.
    fn lock(&mut self, old_state: bool) -> InterruptLock {
        if self.num_off == 0 {
            self.interrupts_enabled = old_state;
        }
        self.num_off += 1;
        InterruptLock
    }

    /// Unlocks this CPU by enabling interrupts if appropriate.
    pub fn unlock(&mut self) {
        assert!(!interrupts::get(), "cpu unlock - interruptible");
        assert!(self.num_off >= 1, "cpu unlock");

        self.num_off -= 1;
        if self.num_off == 0 && self.interrupts_enabled {
            interrupts::enable();
        }
    }
}

/// Table of CPUs
pub struct CpuTable([UnsafeCell<Cpu>; NCPU]);

impl CpuTable {
    const fn new() -> Self {
        let mut array: [MaybeUninit<UnsafeCell<Cpu>>; NCPU] =
            unsafe { MaybeUninit::uninit().assume_init() };
        let mut i = 0;
        while i < NCPU {
            array[i] = MaybeUninit::new(UnsafeCell::new(Cpu::new()));
            i += 1;
        }
        Self(unsafe {
            transmute::<[MaybeUninit<UnsafeCell<Cpu>>; NCPU], [UnsafeCell<Cpu>; NCPU]>(array)
        })
    }
}

unsafe impl Sync for CpuTable {}

/// A lock that releases the CPU lock when dropped.
#[derive(Debug)]
pub struct InterruptLock;

impl Drop for InterruptLock {
    fn drop(&mut self) {
        // # Safety: we are still holding the CPU lock
        unsafe { current_cpu().unlock() }
    }
}

/// Returns a mutable reference to the current CPU's [`Cpu`] struct.
///
/// # Safety
/// Must be called with interrupts disabled to prevent a race with the
/// process being moved to a different CPU.
pub unsafe fn current_cpu() -> &'static mut Cpu {
    assert!(!interrupts::get(), "current_cpu: interrupts enabled");
    let id = arm64::cpu_id();
    unsafe { &mut *CPU_TABLE.0[id].get() }
}

/// Locks this CPU by disabling interrupts.
/// Returns an [`InterruptLock`] as the ownership and lifetime of the lock.
pub fn lock_current_cpu() -> InterruptLock {
    let old_state = interrupts::get();
    interrupts::disable();

    unsafe { current_cpu().lock(old_state) }
}

/// Returns a reference to this CPU's [`Proc`], if one is running.
pub fn current_proc_opt() -> Option<&'static Proc> {
    let _lock = lock_current_cpu();

    let cpu = unsafe { current_cpu() };
    cpu.proc
}

/// Returns a reference to this CPU's [`Proc`].
/// Panics if there is no current process.
pub fn current_proc() -> &'static Proc {
    current_proc_opt().expect("no current process")
}

/// Returns a shared reference to this CPU's [`Proc`] and an exclusive
/// reference to its [`ProcData`].
pub fn current_proc_and_data_mut() -> (&'static Proc, &'static mut ProcData) {
    let proc = current_proc();
    // # Safety: we are the current proc
    let data = unsafe { proc.data_mut() };
    (proc, data)
}

/// Wrapper around usize to represent process IDs.
/// Must be created with `Pid::alloc()` to ensure uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Pid(usize);

static NEXT_PID: SpinLock<usize> = SpinLock::new(1, "nextpid");

impl Pid {
    /// Mints a fresh PID. PIDs are strictly increasing over one boot and
    /// never reused.
    pub fn alloc() -> Self {
        let mut next = NEXT_PID.lock();
        let pid = *next;
        *next += 1;
        Pid(pid)
    }
}

impl core::ops::Deref for Pid {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Rendezvous channel for `sleep`/`wakeup`. Compared for equality,
/// never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// `proc.id`; used by `wait` and `exit`.
    Proc(usize),
    /// System ticks.
    Ticks,
    /// A sleep lock, identified by its address.
    Lock(usize),
    /// FS transaction slots.
    Log,
    /// Console input.
    Console,
    /// UART transmit ring.
    Uart,
}

/// The state of a process slot.
#[derive(Debug, PartialEq, Eq, Default)]
pub enum ProcState {
    #[default]
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// Public fields of a process.
///
/// The slot's lock must be held when accessing these.
#[derive(Debug, Default)]
pub struct ProcInner {
    /// Slot state
    pub state: ProcState,
    /// If Some, sleeping on this channel
    pub channel: Option<Channel>,
    /// Another process asked us to die
    pub killed: bool,
    /// Exit status reported to the parent's wait
    pub xstate: isize,
    /// Process ID
    pub pid: Pid,
}

impl ProcInner {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            channel: None,
            killed: false,
            xstate: 0,
            pid: Pid(0),
        }
    }
}

/// Kernel-mode stack. The trap frame and the initial context are carved
/// out of the top of this page by `ProcTable::alloc`.
#[repr(C, align(4096))]
pub struct KStack([u8; KSTACKSIZE]);

/// Private fields of a process; only the process itself (or its
/// creator, before the slot turns runnable) touches these.
#[derive(Debug)]
pub struct ProcData {
    /// Kernel stack
    pub kstack: Option<Box<KStack>>,
    /// Bytes of user memory; the user image occupies [0, size)
    pub size: usize,
    /// User page tables
    pub pgdir: Option<PgDir>,
    /// User register snapshot, at the top of kstack
    pub trapframe: *mut TrapFrame,
    /// Saved kernel context while suspended, inside kstack
    pub context: *mut Context,
    /// Open files
    pub open_files: [Option<File>; NOFILE],
    /// Current directory
    pub cwd: Option<Inode>,
    /// Debug name
    pub name: String,
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: None,
            size: 0,
            pgdir: None,
            trapframe: ptr::null_mut(),
            context: ptr::null_mut(),
            open_files: [const { None }; NOFILE],
            cwd: None,
            name: String::new(),
        }
    }

    /// Returns a reference to the trap frame.
    pub fn tf(&self) -> &TrapFrame {
        unsafe { &*self.trapframe }
    }

    /// Returns a mutable reference to the trap frame.
    pub fn tf_mut(&mut self) -> &mut TrapFrame {
        unsafe { &mut *self.trapframe }
    }

    /// Returns a reference to the user page tables.
    pub fn pgdir(&self) -> &PgDir {
        self.pgdir.as_ref().unwrap()
    }

    /// Returns a mutable reference to the user page tables.
    pub fn pgdir_mut(&mut self) -> &mut PgDir {
        self.pgdir.as_mut().unwrap()
    }
}

impl core::fmt::Debug for KStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "KStack({:p})", self.0.as_ptr())
    }
}

unsafe impl Sync for ProcData {}
unsafe impl Send for ProcData {}

/// Process slot
#[derive(Debug)]
pub struct Proc {
    /// Index into `PROC_TABLE`; NOT the pid. Parent links are stored by
    /// this id.
    pub id: usize,
    pub inner: SpinLock<ProcInner>,
    data: UnsafeCell<ProcData>,
}

impl Proc {
    const fn new(id: usize) -> Self {
        Self {
            id,
            inner: SpinLock::new(ProcInner::new(), "proc"),
            data: UnsafeCell::new(ProcData::new()),
        }
    }

    pub fn data(&self) -> &ProcData {
        unsafe { &*self.data.get() }
    }

    /// Returns a mutable reference to the process's data.
    ///
    /// # Safety
    /// The caller must have exclusive access to the `Proc`. This is true
    /// if either
    ///     1. it is the current proc (most cases) or
    ///     2. the slot has not been made runnable yet (fork, alloc).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    /// Returns true if this is the init process.
    pub fn is_init_proc(&self) -> bool {
        INIT_PROC.get().is_some_and(|init| ptr::eq(self, *init))
    }

    /// Returns true if this process has been killed.
    ///
    /// Acquires and releases the slot lock.
    pub fn is_killed(&self) -> bool {
        self.inner.lock().killed
    }

    /// Frees the slot and everything hanging off it, including user
    /// pages, and returns it to `Unused`. Called with the slot's lock
    /// held.
    pub fn free(&self, mut inner: SpinLockGuard<'_, ProcInner>) {
        // # Safety: the slot is ours; it is Unused, Embryo, or a reaped
        // Zombie
        let data = unsafe { self.data_mut() };

        if let Some(pgdir) = data.pgdir.take() {
            pgdir.free(data.size);
        }
        data.kstack.take();
        data.trapframe = ptr::null_mut();
        data.context = ptr::null_mut();
        data.size = 0;
        data.open_files = [const { None }; NOFILE];
        data.cwd = None;
        data.name.clear();

        inner.pid = Pid(0);
        inner.channel = None;
        inner.killed = false;
        inner.xstate = 0;
        inner.state = ProcState::Unused;
    }
}

unsafe impl Sync for Proc {}

/// Table of processes
pub struct ProcTable {
    table: [UnsafeCell<Proc>; NPROC],
    /// `parents[child.id] == Some(parent.id)`. One table-wide lock
    /// serializes every parent/child observation (fork's link, wait's
    /// reap, reparenting at exit); this is the wait lock. It is always
    /// taken before any slot lock, never after.
    pub parents: SpinLock<[Option<usize>; NPROC]>,
}

impl ProcTable {
    pub const fn new() -> Self {
        let mut table: [MaybeUninit<UnsafeCell<Proc>>; NPROC] =
            unsafe { MaybeUninit::uninit().assume_init() };

        let mut i = 0;
        while i < NPROC {
            table[i] = MaybeUninit::new(UnsafeCell::new(Proc::new(i)));
            i += 1;
        }

        Self {
            table: unsafe {
                transmute::<[MaybeUninit<UnsafeCell<Proc>>; NPROC], [UnsafeCell<Proc>; NPROC]>(
                    table,
                )
            },
            parents: SpinLock::new([None; NPROC], "wait"),
        }
    }

    /// Returns a reference to the slot at the given index.
    pub fn get(&self, index: usize) -> &Proc {
        unsafe { &*self.table[index].get() }
    }

    /// Returns an iterator over all slots.
    pub fn iter(&self) -> impl Iterator<Item = &Proc> {
        (0..NPROC).map(|i| self.get(i))
    }

    /// Scans for an `Unused` slot. On success the slot has a fresh pid,
    /// a kernel stack with the trap frame and an initial context carved
    /// at its top, state `Embryo` -- and its lock is STILL HELD. The
    /// caller populates the remaining fields (pgdir, trap frame
    /// contents, name, parent) before releasing it.
    pub fn alloc(&self) -> Result<(&Proc, SpinLockGuard<'_, ProcInner>), KernelError> {
        for proc in self.iter() {
            let mut inner = proc.inner.lock();
            if inner.state != ProcState::Unused {
                continue;
            }

            inner.pid = Pid::alloc();

            // # Safety: the slot is not runnable yet, nobody else can
            // reach its data
            let data = unsafe { proc.data_mut() };

            // Safety: a stack of zero bytes is valid
            let kstack = match log!(unsafe { kalloc::try_zeroed::<KStack>() }) {
                Ok(kstack) => kstack,
                Err(err) => {
                    proc.free(inner);
                    return Err(err);
                }
            };

            let top = kstack.0.as_ptr() as usize + KSTACKSIZE;
            let trapframe = (top - TrapFrame::SIZE) as *mut TrapFrame;
            let context = (trapframe as usize - size_of::<Context>()) as *mut Context;

            data.kstack = Some(kstack);
            data.trapframe = trapframe;
            data.context = context;

            // First switch into this slot "returns" into fork_ret.
            unsafe {
                *context = Context::new();
                (*context).x30 = fork_ret as *const () as usize;
            }

            inner.state = ProcState::Embryo;

            return Ok((proc, inner));
        }

        Err(KernelError::OutOfProc)
    }

    /// Prints a process listing to the console.
    /// For debugging only; takes no locks to avoid wedging a stuck
    /// machine further.
    pub unsafe fn dump(&self) {
        println!("");

        for proc in self.iter() {
            let inner = unsafe { proc.inner.get_mut_unchecked() };
            if inner.state == ProcState::Unused {
                continue;
            }

            println!("{} {:?} {}", *inner.pid, inner.state, proc.data().name);
        }
    }
}

unsafe impl Sync for ProcTable {}

// The user bootstrap: execve("/init") or spin on exit. Assembled into
// the kernel image and copied to user address 0 by user_init.
#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    r#"
.section .rodata
.balign 8
.global initcode_start
initcode_start:
    adr x1, 2f
    sub sp, sp, #16
    str x1, [sp]
    str xzr, [sp, #8]
    mov x2, sp
    mov x8, #221        // execve
    svc #0
1:
    mov x8, #93         // exit
    svc #0
    b 1b
2:
    .asciz "/init"
.balign 8
.global initcode_end
initcode_end:
.text
"#
);

#[cfg(target_arch = "aarch64")]
fn initcode() -> &'static [u8] {
    unsafe extern "C" {
        static initcode_start: [u8; 0];
        static initcode_end: [u8; 0];
    }

    unsafe {
        let len = initcode_end.as_ptr() as usize - initcode_start.as_ptr() as usize;
        core::slice::from_raw_parts(initcode_start.as_ptr(), len)
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn initcode() -> &'static [u8] {
    &[]
}

/// Sets up the first user process (only used once).
pub fn user_init() {
    let (proc, mut inner) = PROC_TABLE.alloc().expect("user_init: no slot");
    INIT_PROC.initialize(|| Ok::<_, ()>(proc));

    // # Safety: during initialization, nobody else can reach this slot
    let data = unsafe { proc.data_mut() };

    let mut pgdir = PgDir::try_new().expect("user_init: pgdir");
    pgdir.load_init(initcode());
    data.pgdir = Some(pgdir);
    data.size = PGSIZE;

    // First return to user mode enters the bootstrap at address 0 with
    // the stack one page up.
    let tf = data.tf_mut();
    tf.zero();
    tf.elr_el1 = 0;
    tf.sp_el0 = PGSIZE as u64;
    tf.spsr_el1 = 0;

    data.name.push_str("initproc");
    data.cwd = Some(Path::new("/").resolve().expect("user_init: no root"));

    inner.state = ProcState::Runnable;

    // inner lock is dropped
}

/// Grows or shrinks user memory by `n` bytes. On failure the size is
/// unchanged.
pub fn grow(n: isize) -> Result<(), KernelError> {
    let (_proc, data) = current_proc_and_data_mut();

    let size = data.size;

    let size = if n > 0 {
        match log!(data.pgdir_mut().alloc(size, size + n as usize, arm64::PTE_UXN)) {
            Ok(size) => size,
            Err(_) => err!(KernelError::Alloc),
        }
    } else if n < 0 {
        let shrink = n.unsigned_abs();
        if shrink > size {
            err!(KernelError::InvalidArgument);
        }
        data.pgdir_mut().dealloc(size, size - shrink)
    } else {
        size
    };

    data.size = size;
    data.pgdir().switch_to();
    Ok(())
}

/// Creates a new process copying the caller. Sets up the child's kernel
/// stack to return as if from a system call, with 0 in its return
/// register.
pub fn fork() -> Result<Pid, KernelError> {
    let (proc, data) = current_proc_and_data_mut();

    let (new_proc, new_inner) = try_log!(PROC_TABLE.alloc());
    // # Safety: the child is not runnable yet
    let new_data = unsafe { new_proc.data_mut() };

    // copy user memory from parent to child
    let mut new_pgdir = match log!(PgDir::try_new()) {
        Ok(pgdir) => pgdir,
        Err(err) => {
            new_proc.free(new_inner);
            return Err(err.into());
        }
    };
    let size = data.size;
    if let Err(err) = log!(data.pgdir_mut().copy(&mut new_pgdir, size)) {
        new_pgdir.free(0);
        new_proc.free(new_inner);
        return Err(err.into());
    }
    new_data.pgdir = Some(new_pgdir);
    new_data.size = data.size;

    // copy saved user registers; the child observes fork() == 0
    let new_tf = new_data.tf_mut();
    new_tf.clone_from(data.tf());
    new_tf.x0 = 0;

    // bump reference counts on open file descriptors and the cwd
    for (i, file) in data.open_files.iter_mut().enumerate() {
        if let Some(file) = file.as_mut() {
            new_data.open_files[i] = Some(file.dup());
        }
    }
    new_data.cwd = data.cwd.as_ref().map(|cwd| cwd.dup());

    new_data.name = data.name.clone();

    let pid = new_inner.pid;

    // the child's lock cannot be held across the wait lock
    drop(new_inner);

    {
        let mut parents = PROC_TABLE.parents.lock();
        parents[new_proc.id] = Some(proc.id);
    }

    let mut new_inner = new_proc.inner.lock();
    new_inner.state = ProcState::Runnable;

    Ok(pid)
}

/// Passes `original`'s abandoned children to init.
/// Caller must hold the wait lock.
pub fn reparent(original: &Proc, parents: &mut SpinLockGuard<'_, [Option<usize>; NPROC]>) {
    let init = INIT_PROC.get().expect("reparent: no init");

    for parent in parents.iter_mut() {
        if *parent == Some(original.id) {
            *parent = Some(init.id);
            wakeup(Channel::Proc(init.id));
        }
    }
}

/// Exits the current process with `status` and does not return. The
/// slot stays a zombie until the parent reaps it with `wait`.
pub fn exit(status: isize) -> ! {
    let (proc, data) = current_proc_and_data_mut();
    assert!(!proc.is_init_proc(), "init exiting");

    // close all open files
    for file in &mut data.open_files {
        if let Some(mut file) = file.take() {
            file.close();
        }
    }

    {
        let _op = Operation::begin();
        if let Some(cwd) = data.cwd.take() {
            cwd.put();
        }
    }

    let mut parents = PROC_TABLE.parents.lock();

    // give any children to init
    reparent(proc, &mut parents);

    // the parent might be sleeping in wait
    let parent_id = parents[proc.id].expect("exit: no parent");
    wakeup(Channel::Proc(parent_id));

    let mut inner = proc.inner.lock();
    inner.xstate = status;
    inner.state = ProcState::Zombie;

    drop(parents);

    sched(inner, unsafe { &mut proc.data_mut().context });

    unreachable!("zombie exit");
}

/// Waits for a child to exit; returns its pid, or `None` if this
/// process has no children (or was killed).
pub fn wait() -> Option<Pid> {
    let proc = current_proc();
    let current_id = proc.id;

    let mut parents = PROC_TABLE.parents.lock();

    loop {
        let mut have_kids = false;

        // scan the whole table for exited children
        for child in PROC_TABLE.iter() {
            if parents[child.id] != Some(current_id) {
                continue;
            }

            // make sure the child is not still in exit() or swtch()
            let inner = child.inner.lock();
            have_kids = true;

            if inner.state == ProcState::Zombie {
                let pid = inner.pid;
                parents[child.id] = None;
                child.free(inner);
                return Some(pid);
            }
        }

        // no point waiting if we don't have any children
        if !have_kids || proc.is_killed() {
            return None;
        }

        // wait for a child to exit
        parents = sleep(Channel::Proc(current_id), parents);
    }
}

/// Per-CPU process scheduler; every CPU ends up here after setup and
/// never leaves. Strict round-robin by slot index: pick a runnable
/// slot, switch into it, and take over again when it switches back.
///
/// # Safety
/// Must be called with interrupts disabled.
pub unsafe fn scheduler() -> ! {
    // the cpu reference is stable; this loop never migrates
    let cpu = unsafe { current_cpu() };

    cpu.proc.take();

    loop {
        // The most recent process may have had interrupts turned off;
        // enable them briefly to avoid a deadlock if everyone is
        // waiting for one.
        interrupts::enable();
        interrupts::disable();

        let mut found = false;

        for proc in PROC_TABLE.iter() {
            let mut inner = proc.inner.lock();

            if inner.state == ProcState::Runnable {
                // Switch to the chosen slot. It is the slot's job to
                // release its lock and reacquire it before switching
                // back.
                let data = proc.data();
                data.pgdir().switch_to();
                inner.state = ProcState::Running;
                cpu.proc.replace(proc);

                unsafe { swtch(&mut cpu.scheduler, data.context) };

                // The process is done for now; it changed its state
                // before coming back. Detach from its translation
                // before anyone can free it.
                vm::kernel_switch();
                cpu.proc.take();
                found = true;
            }
        }

        if !found {
            // nothing runnable; idle until an interrupt
            arm64::wait_for_interrupt();
        }
    }
}

/// Switches to this CPU's scheduler. The only way back to the
/// scheduler loop.
///
/// The caller must hold exactly the slot's lock (passed as the guard)
/// and must already have moved the slot out of `Running`.
///
/// Saves and restores `interrupts_enabled` because it is a property of
/// this kernel thread, not of the CPU.
pub fn sched<'a>(
    proc_inner: SpinLockGuard<'a, ProcInner>,
    context: &mut *mut Context,
) -> SpinLockGuard<'a, ProcInner> {
    let cpu = unsafe { current_cpu() };

    // exactly one lock held, no nesting
    assert_eq!(cpu.num_off, 1, "sched locks");
    assert_ne!(proc_inner.state, ProcState::Running, "sched running");
    assert!(!interrupts::get(), "sched interruptible");

    let interrupts_enabled = cpu.interrupts_enabled;
    unsafe { swtch(context, cpu.scheduler) };

    // reload the cpu; we may have been rescheduled on another one
    let cpu = unsafe { current_cpu() };
    cpu.interrupts_enabled = interrupts_enabled;

    proc_inner
}

/// Gives up the CPU for one scheduling round.
pub fn r#yield() {
    let (proc, data) = current_proc_and_data_mut();

    // the slot lock is held across sched and released on return
    let mut inner = proc.inner.lock();
    inner.state = ProcState::Runnable;

    sched(inner, &mut data.context);
}

/// First instruction of every newly scheduled process; the initial
/// context's saved link register points here.
///
/// # Safety
/// Never called directly; entered from `swtch`.
pub unsafe extern "C" fn fork_ret() -> ! {
    // atomic: multiple CPUs could schedule their first process at once
    static FIRST: AtomicBool = AtomicBool::new(true);

    // still holding the slot's lock from the scheduler
    unsafe { current_proc().inner.force_unlock() };

    if FIRST
        .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    {
        // Filesystem initialization must run in the context of a
        // regular process (it may sleep), so it cannot run from main().
        fs::init(ROOTDEV);
        log::init(ROOTDEV);
    }

    unsafe { usertrapret(current_proc().data().trapframe) }
}

/// Atomically releases the condition's lock and sleeps on `channel`.
/// Reacquires the condition's lock when awakened.
pub fn sleep<T>(channel: Channel, condition_lock: SpinLockGuard<'_, T>) -> SpinLockGuard<'_, T> {
    // Acquire the slot's lock before releasing the condition's lock: a
    // wakeup must take the slot lock to inspect us, so once we hold it
    // no wakeup between the release and the sleep can be missed.
    let condition_mutex;
    {
        let proc = current_proc();
        let mut inner = proc.inner.lock();

        condition_mutex = SpinLock::unlock(condition_lock);

        // go to sleep
        inner.channel = Some(channel);
        inner.state = ProcState::Sleeping;

        // switch to the scheduler; returns once we are runnable again
        let context = unsafe { &mut proc.data_mut().context };
        inner = sched(inner, context);

        inner.channel = None;
    } // slot lock dropped

    // reacquire the original lock
    condition_mutex.lock()
}

/// Wakes up all processes sleeping on `channel`.
/// Must be called without any slot lock held.
pub fn wakeup(channel: Channel) {
    // there is no current proc when called from the scheduler's context
    let current = current_proc_opt();

    for proc in PROC_TABLE.iter() {
        if current.is_some_and(|p| ptr::eq(p, proc)) {
            continue;
        }

        let mut inner = proc.inner.lock();
        if inner.state == ProcState::Sleeping && inner.channel == Some(channel) {
            inner.state = ProcState::Runnable;
        }
    }
}

/// Announces the process table. Locks and slots are statically
/// initialized; this exists for the boot transcript.
pub fn init() {
    println!("proc init");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_strictly_increase() {
        let mut last = Pid::alloc();
        for _ in 0..100 {
            let next = Pid::alloc();
            assert!(*next > *last);
            last = next;
        }
    }

    #[test]
    fn fresh_slot_is_unused() {
        let inner = ProcInner::new();
        assert_eq!(inner.state, ProcState::Unused);
        assert_eq!(*inner.pid, 0);
        assert!(inner.channel.is_none());
        assert!(!inner.killed);
    }

    #[test]
    fn channels_compare_by_identity() {
        assert_eq!(Channel::Proc(3), Channel::Proc(3));
        assert_ne!(Channel::Proc(3), Channel::Proc(4));
        assert_ne!(Channel::Ticks, Channel::Log);
        assert_ne!(Channel::Lock(0x1000), Channel::Lock(0x2000));
    }
}
