//! User address spaces.
//!
//! A `PgDir` is a 4-level VMSAv8-64 translation tree rooted in TTBR0.
//! Every root carries the same kernel mappings (an identity block for
//! RAM and device blocks for the MMIO window), so while a process's
//! pgdir is installed both its user range `[0, size)` and all kernel
//! memory translate through the one tree. That is what lets the syscall
//! layer dereference a bounds-checked user pointer directly.

use core::fmt::Display;

use alloc::boxed::Box;

use crate::arm64::{
    ATTR_DEVICE, ATTR_NORMAL, MAXVA, PGSIZE, PTE_AF, PTE_ISH, PTE_PXN, PTE_RO, PTE_TABLE,
    PTE_USER, PTE_UXN, PTE_VALID, pa_to_pte, pg_round_down, pg_round_up, pte_to_pa, px,
    set_ttbr0,
};
use crate::kalloc;
use crate::memlayout::{DEVBASE, DEVTOP, RAMBASE, USERTOP};
use crate::sync::OnceLock;

/// Attribute bits every user page mapping carries. Kernel execution of
/// user pages is always forbidden; callers add `PTE_UXN`/`PTE_RO` per
/// mapping.
const PTE_USER_DEFAULT: u64 = PTE_AF | PTE_ISH | PTE_USER | ATTR_NORMAL | PTE_PXN;

const KERNEL_BLOCK: u64 = PTE_VALID | PTE_AF | PTE_ISH | ATTR_NORMAL;
const DEVICE_BLOCK: u64 = PTE_VALID | PTE_AF | ATTR_DEVICE | PTE_PXN | PTE_UXN;

/// Size of a level-2 block mapping.
const BLOCK2M: usize = 1 << 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    Alloc,
    NoMapping,
    OutOfRange,
}

impl Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::Alloc => write!(f, "allocation failed"),
            VmError::NoMapping => write!(f, "address not mapped"),
            VmError::OutOfRange => write!(f, "address out of range"),
        }
    }
}

/// A user or physical address. Kept distinct so the syscall layer can't
/// hand a raw user integer to kernel code without going through the
/// range checks.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct VA(usize);

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PA(usize);

impl VA {
    pub const fn as_usize(&self) -> usize {
        self.0
    }
}

impl From<usize> for VA {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<u64> for VA {
    fn from(addr: u64) -> Self {
        Self(addr as usize)
    }
}

impl PA {
    pub const fn as_usize(&self) -> usize {
        self.0
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
struct Pte(u64);

impl Pte {
    fn is_valid(&self) -> bool {
        self.0 & PTE_VALID != 0
    }

    /// Table descriptor at levels 0-2 (bit 1 set). At level 3 the same
    /// bit marks a page descriptor.
    fn is_table(&self) -> bool {
        self.0 & PTE_TABLE != 0
    }

    fn as_pa(&self) -> PA {
        PA(pte_to_pa(self.0))
    }

    /// Attribute bits without the output address or descriptor type.
    fn flags(&self) -> u64 {
        self.0 & !(pa_to_pte(usize::MAX) | PTE_VALID | PTE_TABLE)
    }
}

#[repr(C, align(4096))]
struct RawPageTable([Pte; 512]);

impl RawPageTable {
    fn try_new() -> Result<*mut Self, VmError> {
        // Safety: a zeroed table is a table of invalid descriptors
        let table = unsafe { kalloc::try_zeroed::<RawPageTable>() };
        Ok(Box::into_raw(table.map_err(|_| VmError::Alloc)?))
    }
}

/// One page of user memory.
#[repr(C, align(4096))]
struct Page([u8; PGSIZE]);

static KPGDIR: OnceLock<PgDir> = OnceLock::new();

/// An owned user translation tree.
#[derive(Debug)]
pub struct PgDir {
    root: *mut RawPageTable,
}

unsafe impl Send for PgDir {}
unsafe impl Sync for PgDir {}

impl PgDir {
    /// Creates a page directory containing only the shared kernel
    /// mappings: no user memory yet.
    pub fn try_new() -> Result<Self, VmError> {
        let root = RawPageTable::try_new()?;
        let l1 = match RawPageTable::try_new() {
            Ok(table) => table,
            Err(err) => {
                // Safety: freshly allocated above
                drop(unsafe { Box::from_raw(root) });
                return Err(err);
            }
        };
        let l2 = match RawPageTable::try_new() {
            Ok(table) => table,
            Err(err) => {
                unsafe {
                    drop(Box::from_raw(root));
                    drop(Box::from_raw(l1));
                }
                return Err(err);
            }
        };

        unsafe {
            (*root).0[0] = Pte(pa_to_pte(l1 as usize) | PTE_VALID | PTE_TABLE);
            (*l1).0[0] = Pte(pa_to_pte(l2 as usize) | PTE_VALID | PTE_TABLE);

            // RAM: one identity 1 GiB block
            (*l1).0[px(1, RAMBASE)] = Pte(pa_to_pte(RAMBASE) | KERNEL_BLOCK);

            // MMIO window: identity 2 MiB device blocks
            let mut pa = DEVBASE;
            while pa < DEVTOP {
                (*l2).0[px(2, pa)] = Pte(pa_to_pte(pa) | DEVICE_BLOCK);
                pa += BLOCK2M;
            }
        }

        Ok(Self { root })
    }

    /// Finds the level-3 descriptor for `va`, growing the tree when
    /// `alloc` is set. Returns `None` if a table is missing (or cannot
    /// be allocated).
    fn walk(&mut self, va: VA, alloc: bool) -> Option<&mut Pte> {
        assert!(va.0 < MAXVA, "walk");

        let mut table = self.root;

        unsafe {
            for level in 0..3 {
                let pte = &mut (*table).0[px(level, va.0)];

                if pte.is_valid() {
                    assert!(pte.is_table(), "walk into block mapping");
                    table = pte.as_pa().as_usize() as *mut RawPageTable;
                } else {
                    if !alloc {
                        return None;
                    }

                    table = RawPageTable::try_new().ok()?;
                    pte.0 = pa_to_pte(table as usize) | PTE_VALID | PTE_TABLE;
                }
            }

            Some(&mut (*table).0[px(3, va.0)])
        }
    }

    /// Physical address of the page mapped at `va`, if any.
    fn walk_addr(&mut self, va: VA) -> Option<PA> {
        let pte = self.walk(va, false)?;
        if pte.is_valid() { Some(pte.as_pa()) } else { None }
    }

    /// Installs page descriptors for `[va, va + size)` pointing at
    /// `[pa, pa + size)` with the given attribute bits.
    fn map_pages(&mut self, va: VA, pa: PA, size: usize, perm: u64) -> Result<(), VmError> {
        assert_ne!(size, 0, "map_pages: size");

        let last = pg_round_down(va.0 + size - 1);
        let mut va = pg_round_down(va.0);
        let mut pa = pa.0;

        loop {
            let Some(pte) = self.walk(VA(va), true) else {
                return Err(VmError::Alloc);
            };

            assert!(!pte.is_valid(), "map_pages: remap");
            pte.0 = pa_to_pte(pa) | perm | PTE_VALID | PTE_TABLE;

            if va == last {
                break;
            }

            va += PGSIZE;
            pa += PGSIZE;
        }

        Ok(())
    }

    /// Removes `npages` page mappings starting at `va`, freeing the
    /// backing pages when `free` is set.
    fn unmap(&mut self, va: VA, npages: usize, free: bool) {
        assert_eq!(va.0 % PGSIZE, 0, "unmap: not aligned");

        for page in 0..npages {
            let va = VA(va.0 + page * PGSIZE);
            let pte = self.walk(va, false).expect("unmap: walk");
            assert!(pte.is_valid(), "unmap: not mapped");
            assert!(pte.is_table(), "unmap: not a leaf");

            if free {
                // Safety: user pages are allocated as Box<Page>
                drop(unsafe { Box::from_raw(pte.as_pa().as_usize() as *mut Page) });
            }

            pte.0 = 0;
        }
    }

    /// Copies the embedded bootstrap image into a fresh first page.
    /// Only used for the very first process.
    pub fn load_init(&mut self, src: &[u8]) {
        assert!(src.len() < PGSIZE, "load_init: more than a page");

        // Safety: zeroed pages are valid
        let page = unsafe { kalloc::try_zeroed::<Page>() }.expect("load_init: page");
        let page = Box::into_raw(page);

        unsafe {
            (&mut (*page).0)[..src.len()].copy_from_slice(src);
        }

        self.map_pages(VA(0), PA(page as usize), PGSIZE, PTE_USER_DEFAULT)
            .expect("load_init: map");
    }

    /// Grows user memory from `oldsz` to `newsz`, zeroed. `perm` adds
    /// attribute bits (`PTE_UXN`, `PTE_RO`) on top of the user default.
    /// Returns the new size, or leaves the range `[0, oldsz)` intact on
    /// failure.
    pub fn alloc(&mut self, oldsz: usize, newsz: usize, perm: u64) -> Result<usize, VmError> {
        if newsz <= oldsz {
            return Ok(oldsz);
        }

        if newsz > USERTOP {
            return Err(VmError::OutOfRange);
        }

        let mut size = pg_round_up(oldsz);
        while size < newsz {
            // Safety: zeroed pages are valid
            let page = match unsafe { kalloc::try_zeroed::<Page>() } {
                Ok(page) => Box::into_raw(page),
                Err(_) => {
                    self.dealloc(size, oldsz);
                    return Err(VmError::Alloc);
                }
            };

            if let Err(err) =
                self.map_pages(VA(size), PA(page as usize), PGSIZE, PTE_USER_DEFAULT | perm)
            {
                // Safety: just allocated, never mapped
                drop(unsafe { Box::from_raw(page) });
                self.dealloc(size, oldsz);
                return Err(err);
            }

            size += PGSIZE;
        }

        Ok(newsz)
    }

    /// Shrinks user memory from `oldsz` to `newsz`, freeing the pages.
    /// Returns the new size.
    pub fn dealloc(&mut self, oldsz: usize, newsz: usize) -> usize {
        if newsz >= oldsz {
            return oldsz;
        }

        if pg_round_up(newsz) < pg_round_up(oldsz) {
            let npages = (pg_round_up(oldsz) - pg_round_up(newsz)) / PGSIZE;
            self.unmap(VA(pg_round_up(newsz)), npages, true);
        }

        newsz
    }

    /// Deep-copies this address space's `[0, size)` into `dst`.
    /// On failure `dst` is left without user mappings.
    pub fn copy(&mut self, dst: &mut PgDir, size: usize) -> Result<(), VmError> {
        let mut va = 0;

        while va < size {
            let pte = self.walk(VA(va), false).expect("copy: source unmapped");
            assert!(pte.is_valid(), "copy: source invalid");
            let src_pa = pte.as_pa();
            let flags = pte.flags();

            // Safety: zeroed pages are valid
            let page = match unsafe { kalloc::try_zeroed::<Page>() } {
                Ok(page) => Box::into_raw(page),
                Err(_) => {
                    dst.dealloc(va, 0);
                    return Err(VmError::Alloc);
                }
            };

            unsafe {
                (*page)
                    .0
                    .copy_from_slice(&(*(src_pa.as_usize() as *const Page)).0);
            }

            if let Err(err) = dst.map_pages(VA(va), PA(page as usize), PGSIZE, flags) {
                // Safety: just allocated, never mapped
                drop(unsafe { Box::from_raw(page) });
                dst.dealloc(va, 0);
                return Err(err);
            }

            va += PGSIZE;
        }

        Ok(())
    }

    /// Copies `src` into this address space at `va`. Works on inactive
    /// page directories; `exec` uses it to build the new image.
    pub fn copy_to(&mut self, src: &[u8], va: VA) -> Result<(), VmError> {
        let mut copied = 0;

        while copied < src.len() {
            let page_va = pg_round_down(va.0 + copied);
            let Some(pa) = self.walk_addr(VA(page_va)) else {
                return Err(VmError::NoMapping);
            };

            let offset = va.0 + copied - page_va;
            let n = (PGSIZE - offset).min(src.len() - copied);

            unsafe {
                let dst = (pa.as_usize() + offset) as *mut u8;
                core::ptr::copy_nonoverlapping(src.as_ptr().add(copied), dst, n);
            }

            copied += n;
        }

        Ok(())
    }

    /// Revokes EL0 access to the page at `va`; used for stack guards.
    pub fn clear_user(&mut self, va: VA) -> Result<(), VmError> {
        let Some(pte) = self.walk(va, false) else {
            return Err(VmError::NoMapping);
        };

        pte.0 &= !PTE_USER;
        Ok(())
    }

    /// Frees user pages and then the whole translation tree.
    pub fn free(mut self, size: usize) {
        if size > 0 {
            self.dealloc(size, 0);
        }

        // Safety: all user leaves are gone, only tables and the shared
        // kernel blocks remain
        unsafe { free_walk(self.root, 0) };
    }

    /// Makes this the active user translation.
    pub fn switch_to(&self) {
        set_ttbr0(self.root as usize);
    }
}

/// Recursively frees table pages. Leaf page descriptors must already be
/// unmapped; block descriptors (the shared kernel mappings) are skipped.
unsafe fn free_walk(table: *mut RawPageTable, level: usize) {
    unsafe {
        for pte in (*table).0.iter() {
            if !pte.is_valid() {
                continue;
            }

            if level < 3 && pte.is_table() {
                free_walk(pte.as_pa().as_usize() as *mut RawPageTable, level + 1);
            } else if level == 3 {
                panic!("free_walk: leaf");
            }
            // block mapping: shared with the kernel, leave it alone
        }

        drop(Box::from_raw(table));
    }
}

/// Builds the kernel-only page directory.
///
/// # Safety
/// Must be called only once during kernel initialization.
pub unsafe fn init() {
    KPGDIR.initialize(PgDir::try_new);
    println!("vm init");
}

/// Installs the kernel page directory and turns translation on.
///
/// # Safety
/// Must be called once on every CPU during initialization.
#[cfg(target_arch = "aarch64")]
pub unsafe fn init_hart() {
    use aarch64_cpu::registers::{MAIR_EL1, SCTLR_EL1, TCR_EL1};
    use tock_registers::interfaces::{Readable, Writeable};

    use crate::arm64::{MAIR_VALUE, SCTLR_MMU, TCR_VALUE};

    unsafe {
        MAIR_EL1.set(MAIR_VALUE);
        TCR_EL1.set(TCR_VALUE);
        core::arch::asm!("isb");

        kernel_switch();

        SCTLR_EL1.set(SCTLR_EL1.get() | SCTLR_MMU);
        core::arch::asm!("isb");
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub unsafe fn init_hart() {
    unimplemented!("only meaningful on the target")
}

/// Switches back to the kernel-only translation, detaching the CPU from
/// any process pgdir that might be freed behind its back.
pub fn kernel_switch() {
    KPGDIR.get().expect("kernel pgdir").switch_to();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_default_is_unprivileged() {
        assert_ne!(PTE_USER_DEFAULT & PTE_USER, 0);
        assert_ne!(PTE_USER_DEFAULT & PTE_PXN, 0);
        assert_eq!(PTE_USER_DEFAULT & PTE_VALID, 0);
    }

    #[test]
    fn device_blocks_are_not_executable() {
        assert_ne!(DEVICE_BLOCK & PTE_UXN, 0);
        assert_ne!(DEVICE_BLOCK & PTE_PXN, 0);
    }

    #[test]
    fn block_span_covers_mmio_window() {
        assert_eq!((DEVTOP - DEVBASE) % BLOCK2M, 0);
        // the window must stay clear of user space
        assert!(USERTOP <= DEVBASE);
    }

    #[test]
    fn ro_flag_preserved_by_flags() {
        let pte = Pte(pa_to_pte(0x4567_8000) | PTE_VALID | PTE_TABLE | PTE_RO | PTE_USER);
        assert_eq!(pte.flags(), PTE_RO | PTE_USER);
        assert_eq!(pte.as_pa().as_usize(), 0x4567_8000);
    }
}
