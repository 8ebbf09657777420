//! File descriptors.
//!
//! Open files live in a fixed arena: reference counts under a
//! table-wide spinlock, the per-file cursor and type under a per-file
//! sleep lock so different files can be used concurrently. A `File` is
//! an index handle; `dup`/`close` move the count.

use core::mem::{self, MaybeUninit};

use crate::console::Console;
use crate::fs::{Inode, Stat};
use crate::log::Operation;
use crate::param::{NDEV, NFILE};
use crate::sleeplock::SleepLock;
use crate::spinlock::SpinLock;
use crate::syscall::SysError;
use crate::vm::VA;

#[derive(Debug, PartialEq, Eq)]
pub enum FileType {
    None,
    Inode { inode: Inode },
    Device { inode: Inode, major: u16 },
}

/// File metadata protected by the table-wide spinlock.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub ref_count: usize,
}

/// Per-file mutable state protected by the per-file sleeplock.
#[derive(Debug)]
pub struct FileInner {
    pub readable: bool,
    pub writeable: bool,
    pub r#type: FileType,
    pub offset: usize,
}

pub static FILE_TABLE: FileTable = FileTable::new();

/// Global file table
#[derive(Debug)]
pub struct FileTable {
    /// Protects allocation and reference counts
    pub meta: SpinLock<[FileMeta; NFILE]>,
    /// Per-file locks for concurrent access to different files
    pub inner: [SleepLock<FileInner>; NFILE],
}

impl FileTable {
    const fn new() -> Self {
        let meta = {
            let mut array: [MaybeUninit<FileMeta>; NFILE] =
                unsafe { MaybeUninit::uninit().assume_init() };

            let mut i = 0;
            while i < NFILE {
                array[i] = MaybeUninit::new(FileMeta { ref_count: 0 });
                i += 1;
            }

            SpinLock::new(
                unsafe {
                    mem::transmute::<[MaybeUninit<FileMeta>; NFILE], [FileMeta; NFILE]>(array)
                },
                "ftable",
            )
        };

        let inner = {
            let mut array: [MaybeUninit<SleepLock<FileInner>>; NFILE] =
                unsafe { MaybeUninit::uninit().assume_init() };

            let mut i = 0;
            while i < NFILE {
                array[i] = MaybeUninit::new(SleepLock::new(
                    FileInner {
                        readable: false,
                        writeable: false,
                        r#type: FileType::None,
                        offset: 0,
                    },
                    "file",
                ));
                i += 1;
            }

            unsafe {
                mem::transmute::<
                    [MaybeUninit<SleepLock<FileInner>>; NFILE],
                    [SleepLock<FileInner>; NFILE],
                >(array)
            }
        };

        Self { meta, inner }
    }
}

/// File handle, an index into the `FILE_TABLE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub id: usize,
}

impl File {
    // Open flags
    pub const O_RDONLY: usize = 0x000;
    pub const O_WRONLY: usize = 0x001;
    pub const O_RDWR: usize = 0x002;
    pub const O_CREATE: usize = 0x200;
    pub const O_TRUNC: usize = 0x400;

    /// Locks and returns this file's mutable state.
    pub fn inner(&self) -> crate::sleeplock::SleepLockGuard<'static, FileInner> {
        FILE_TABLE.inner[self.id].lock()
    }

    /// Allocates a file structure.
    pub fn alloc() -> Result<Self, SysError> {
        let mut meta = FILE_TABLE.meta.lock();

        for (i, meta) in meta.iter_mut().enumerate() {
            if meta.ref_count == 0 {
                meta.ref_count = 1;

                return Ok(Self { id: i });
            }
        }

        err!(SysError::FileTableFull);
    }

    /// Increments the reference count for the file.
    pub fn dup(&mut self) -> Self {
        let meta = &mut FILE_TABLE.meta.lock()[self.id];

        assert!(meta.ref_count >= 1, "file dup");

        meta.ref_count += 1;

        self.clone()
    }

    /// Decrements the reference count and closes the file when it
    /// reaches 0.
    pub fn close(&mut self) {
        let mut meta_guard = FILE_TABLE.meta.lock();
        let meta = &mut meta_guard[self.id];

        assert!(meta.ref_count >= 1, "file close");

        meta.ref_count -= 1;
        if meta.ref_count > 0 {
            return;
        }

        drop(meta_guard);

        let r#type = {
            let mut inner = FILE_TABLE.inner[self.id].lock();
            inner.readable = false;
            inner.writeable = false;
            inner.offset = 0;
            mem::replace(&mut inner.r#type, FileType::None)
        };

        match r#type {
            FileType::None => {}
            FileType::Inode { inode } | FileType::Device { inode, .. } => {
                let _op = Operation::begin();
                inode.put();
            }
        }
    }

    /// Copies this file's metadata to the (validated) user address.
    pub fn stat(&self, addr: VA) -> Result<(), SysError> {
        let inner = FILE_TABLE.inner[self.id].lock();

        match &inner.r#type {
            FileType::Inode { inode } | FileType::Device { inode, .. } => {
                let stat = {
                    let content = inode.lock();
                    inode.stat(&content)
                };

                copy_stat_out(&stat, addr);
                Ok(())
            }
            FileType::None => err!(SysError::BadDescriptor),
        }
    }

    /// Reads up to `n` bytes into user memory at `addr`, which the
    /// caller has range-checked.
    pub fn read(&self, addr: VA, n: usize) -> Result<usize, SysError> {
        let mut inner = FILE_TABLE.inner[self.id].lock();

        if !inner.readable {
            err!(SysError::BadDescriptor);
        }

        match &inner.r#type {
            FileType::None => panic!("file read"),
            FileType::Inode { inode } => {
                let inode = inode.dup();
                let read = {
                    let content = inode.lock();
                    let dst =
                        unsafe { core::slice::from_raw_parts_mut(addr.as_usize() as *mut u8, n) };
                    inode.read(&content, inner.offset, dst)
                };
                inode.put();

                inner.offset += read;
                Ok(read)
            }
            FileType::Device { major, .. } => match &DEVICES[*major as usize] {
                Some(dev) => (dev.read)(addr, n),
                None => err!(SysError::BadDescriptor),
            },
        }
    }

    /// Writes `n` bytes from user memory at `addr`, which the caller
    /// has range-checked.
    pub fn write(&mut self, addr: VA, n: usize) -> Result<usize, SysError> {
        let mut inner = FILE_TABLE.inner[self.id].lock();

        if !inner.writeable {
            err!(SysError::BadDescriptor);
        }

        match &inner.r#type {
            FileType::None => panic!("file write"),
            FileType::Inode { inode } => {
                let inode = inode.dup();

                let written = {
                    let _op = Operation::begin();
                    let mut content = inode.lock();
                    let src =
                        unsafe { core::slice::from_raw_parts(addr.as_usize() as *const u8, n) };
                    inode.write(&mut content, inner.offset, src)
                };
                inode.put();

                match written {
                    Ok(written) => {
                        inner.offset += written;
                        Ok(written)
                    }
                    Err(_) => err!(SysError::IoError),
                }
            }
            FileType::Device { major, .. } => match &DEVICES[*major as usize] {
                Some(dev) => (dev.write)(addr, n),
                None => err!(SysError::BadDescriptor),
            },
        }
    }
}

fn copy_stat_out(stat: &Stat, addr: VA) {
    unsafe {
        core::ptr::copy_nonoverlapping(
            stat as *const Stat as *const u8,
            addr.as_usize() as *mut u8,
            mem::size_of::<Stat>(),
        );
    }
}

/// Device interface
#[derive(Debug, Clone, Copy)]
pub struct Device {
    pub read: fn(addr: VA, n: usize) -> Result<usize, SysError>,
    pub write: fn(addr: VA, n: usize) -> Result<usize, SysError>,
}

/// Console device major number
pub const CONSOLE: u16 = 1;

/// Device switch table
pub static DEVICES: [Option<Device>; NDEV] = {
    let mut devices = [None; NDEV];
    devices[CONSOLE as usize] = Some(Device {
        read: Console::read,
        write: Console::write,
    });
    devices
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_dup_close_refcounting() {
        let mut file = File::alloc().unwrap();
        let id = file.id;
        assert_eq!(FILE_TABLE.meta.lock()[id].ref_count, 1);

        let mut copy = file.dup();
        assert_eq!(copy.id, id);
        assert_eq!(FILE_TABLE.meta.lock()[id].ref_count, 2);

        copy.close();
        assert_eq!(FILE_TABLE.meta.lock()[id].ref_count, 1);

        file.close();
        assert_eq!(FILE_TABLE.meta.lock()[id].ref_count, 0);

        // the slot is reusable again
        let mut again = File::alloc().unwrap();
        assert_eq!(again.id, id);
        again.close();
    }

    #[test]
    fn console_is_wired_into_the_device_switch() {
        assert!(DEVICES[CONSOLE as usize].is_some());
    }
}
