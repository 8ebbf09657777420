use core::alloc::Layout;

use alloc::boxed::Box;

use buddy_alloc::{BuddyAllocParam, buddy_alloc::BuddyAlloc};

use crate::error::KernelError;
use crate::memlayout::PHYSTOP;
use crate::spinlock::SpinLock;

#[cfg(target_arch = "aarch64")]
unsafe extern "C" {
    /// First address after the kernel image, defined by kernel.ld.
    static end: [u8; 0];
}

/// Kernel memory allocator
#[cfg_attr(not(test), global_allocator)]
static KMEM: Kmem = Kmem(SpinLock::new(None, "kmem"));

struct Kmem(SpinLock<Option<BuddyAlloc>>);

/// # Safety
/// `BuddyAlloc` is not thread safe on its own but `Kmem` only reaches it
/// through a `SpinLock`.
unsafe impl Sync for Kmem {}

unsafe impl core::alloc::GlobalAlloc for Kmem {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0
            .lock()
            .as_mut()
            .expect("kmem to be init")
            .malloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.0.lock().as_mut().expect("kmem to be init").free(ptr)
    }
}

/// Fallible zeroed allocation for page-sized kernel objects (kernel
/// stacks, translation tables).
///
/// # Safety
/// `T` must be valid when every byte is zero.
pub unsafe fn try_zeroed<T>() -> Result<Box<T>, KernelError> {
    let layout = Layout::new::<T>();

    unsafe {
        let ptr = alloc::alloc::alloc_zeroed(layout);
        if ptr.is_null() {
            return Err(KernelError::Alloc);
        }
        Ok(Box::from_raw(ptr.cast::<T>()))
    }
}

/// Initialize kernel memory allocator with all RAM above the image.
///
/// # Safety
/// Must be called only once during kernel initialization.
#[cfg(target_arch = "aarch64")]
pub unsafe fn init() {
    unsafe {
        let mut guard = KMEM.0.lock();

        let size = (PHYSTOP as *const u8).offset_from(end.as_ptr()) as usize;
        let alloc_param = BuddyAllocParam::new(end.as_ptr(), size, 0x1000);
        let alloc = BuddyAlloc::new(alloc_param);

        println!("top  {:#X}", PHYSTOP);
        println!("base {:#X}", end.as_ptr() as usize);
        println!("size {:#X}", alloc.available_bytes());

        *guard = Some(alloc);

        println!("kmem init");
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub unsafe fn init() {
    let _ = PHYSTOP;
    unimplemented!("only meaningful on the target")
}
