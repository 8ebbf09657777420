//! RAM filesystem.
//!
//! Inodes live in a fixed arena: reference counts under one table-wide
//! spinlock, contents (type, link count, data or directory entries)
//! under a per-inode sleep lock. An `Inode` value is a counted handle
//! into the arena; `dup`/`put` move the count. The root directory is
//! statically present so the first process can take its working
//! directory before the filesystem announces itself.

use core::fmt::Display;
use core::mem::{MaybeUninit, transmute};

use alloc::string::String;
use alloc::vec::Vec;

use crate::file::CONSOLE;
use crate::param::{MAXPATH, NINODE};
use crate::proc::current_proc_opt;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

pub const ROOTINO: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    OutOfInode,
    NotFound,
    NotDirectory,
    IsDirectory,
    AlreadyExists,
    NameTooLong,
    OutOfRange,
}

impl Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FsError::OutOfInode => write!(f, "out of inodes"),
            FsError::NotFound => write!(f, "not found"),
            FsError::NotDirectory => write!(f, "not a directory"),
            FsError::IsDirectory => write!(f, "is a directory"),
            FsError::AlreadyExists => write!(f, "already exists"),
            FsError::NameTooLong => write!(f, "name too long"),
            FsError::OutOfRange => write!(f, "out of range"),
        }
    }
}

/// File kinds as reported by stat.
pub const T_DIR: u16 = 1;
pub const T_FILE: u16 = 2;
pub const T_DEVICE: u16 = 3;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub dev: u32,
    pub ino: u32,
    pub kind: u16,
    pub nlink: u16,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Free,
    Dir,
    File,
    Device { major: u16 },
}

#[derive(Debug)]
pub struct DirEntry {
    pub name: String,
    pub inum: usize,
}

/// Contents of one inode; hold the inode's sleep lock to touch these.
#[derive(Debug)]
pub struct InodeContent {
    pub kind: InodeKind,
    pub nlink: usize,
    /// containing directory, for ".."
    parent: usize,
    /// file bytes
    pub data: Vec<u8>,
    /// directory entries
    entries: Vec<DirEntry>,
}

/// Allocation state of one inode; hold the table lock to touch these.
#[derive(Debug)]
struct InodeMeta {
    ref_count: usize,
    allocated: bool,
}

struct InodeTable {
    meta: SpinLock<[InodeMeta; NINODE]>,
    content: [SleepLock<InodeContent>; NINODE],
}

static INODE_TABLE: InodeTable = InodeTable::new();

impl InodeTable {
    const fn new() -> Self {
        let meta = {
            let mut array: [MaybeUninit<InodeMeta>; NINODE] =
                unsafe { MaybeUninit::uninit().assume_init() };

            let mut i = 0;
            while i < NINODE {
                // the root is born allocated with one standing reference
                array[i] = MaybeUninit::new(InodeMeta {
                    ref_count: if i == ROOTINO { 1 } else { 0 },
                    allocated: i == ROOTINO,
                });
                i += 1;
            }

            SpinLock::new(
                unsafe {
                    transmute::<[MaybeUninit<InodeMeta>; NINODE], [InodeMeta; NINODE]>(array)
                },
                "itable",
            )
        };

        let content = {
            let mut array: [MaybeUninit<SleepLock<InodeContent>>; NINODE] =
                unsafe { MaybeUninit::uninit().assume_init() };

            let mut i = 0;
            while i < NINODE {
                let kind = if i == ROOTINO {
                    InodeKind::Dir
                } else {
                    InodeKind::Free
                };
                array[i] = MaybeUninit::new(SleepLock::new(
                    InodeContent {
                        kind,
                        nlink: if i == ROOTINO { 1 } else { 0 },
                        parent: ROOTINO,
                        data: Vec::new(),
                        entries: Vec::new(),
                    },
                    "inode",
                ));
                i += 1;
            }

            unsafe {
                transmute::<
                    [MaybeUninit<SleepLock<InodeContent>>; NINODE],
                    [SleepLock<InodeContent>; NINODE],
                >(array)
            }
        };

        Self { meta, content }
    }
}

/// Counted handle to an arena inode.
#[derive(Debug, PartialEq, Eq)]
pub struct Inode {
    pub inum: usize,
}

impl Inode {
    /// A new reference to the root directory.
    pub fn root() -> Self {
        Self::handle(ROOTINO)
    }

    /// Takes a fresh reference to `inum`.
    fn handle(inum: usize) -> Self {
        INODE_TABLE.meta.lock()[inum].ref_count += 1;
        Self { inum }
    }

    /// Increments the reference count.
    pub fn dup(&self) -> Self {
        Self::handle(self.inum)
    }

    /// Drops a reference. The last reference to an unlinked inode frees
    /// its contents.
    pub fn put(self) {
        let inum = self.inum;
        let last = {
            let meta = INODE_TABLE.meta.lock();
            meta[inum].ref_count == 1
        };

        if last {
            // Possibly the last holder of an unlinked inode; the
            // content lock cannot nest inside the table lock, so take
            // it first and recheck.
            let mut content = INODE_TABLE.content[inum].lock();
            let mut meta = INODE_TABLE.meta.lock();

            if meta[inum].ref_count == 1 && content.nlink == 0 {
                content.kind = InodeKind::Free;
                content.data = Vec::new();
                content.entries = Vec::new();
                meta[inum].allocated = false;
            }

            meta[inum].ref_count -= 1;
        } else {
            INODE_TABLE.meta.lock()[inum].ref_count -= 1;
        }
    }

    /// Locks the inode's contents. Sleeps, so process context only.
    pub fn lock(&self) -> SleepLockGuard<'static, InodeContent> {
        INODE_TABLE.content[self.inum].lock()
    }

    /// Allocates a fresh inode of the given kind, with one link.
    pub fn alloc(kind: InodeKind, parent: usize) -> Result<Self, FsError> {
        assert_ne!(kind, InodeKind::Free, "inode alloc");

        let inum = {
            let mut meta = INODE_TABLE.meta.lock();

            let Some(inum) = meta.iter().position(|m| !m.allocated) else {
                return Err(FsError::OutOfInode);
            };

            meta[inum].allocated = true;
            meta[inum].ref_count = 1;
            inum
        };

        let mut content = INODE_TABLE.content[inum].lock();
        content.kind = kind;
        content.nlink = 1;
        content.parent = parent;
        content.data = Vec::new();
        content.entries = Vec::new();

        Ok(Self { inum })
    }

    /// Reads up to `dst.len()` bytes at `offset`; returns how many.
    pub fn read(&self, content: &InodeContent, offset: usize, dst: &mut [u8]) -> usize {
        if offset >= content.data.len() {
            return 0;
        }

        let n = dst.len().min(content.data.len() - offset);
        dst[..n].copy_from_slice(&content.data[offset..offset + n]);
        n
    }

    /// Writes `src` at `offset`, extending the file as needed.
    pub fn write(
        &self,
        content: &mut InodeContent,
        offset: usize,
        src: &[u8],
    ) -> Result<usize, FsError> {
        let Some(end) = offset.checked_add(src.len()) else {
            return Err(FsError::OutOfRange);
        };

        if end > content.data.len() {
            content.data.resize(end, 0);
        }
        content.data[offset..end].copy_from_slice(src);

        Ok(src.len())
    }

    pub fn stat(&self, content: &InodeContent) -> Stat {
        let kind = match content.kind {
            InodeKind::Dir => T_DIR,
            InodeKind::File => T_FILE,
            InodeKind::Device { .. } => T_DEVICE,
            InodeKind::Free => 0,
        };

        Stat {
            dev: crate::param::ROOTDEV,
            ino: self.inum as u32,
            kind,
            nlink: content.nlink as u16,
            size: content.data.len() as u64,
        }
    }
}

/// Looks `name` up in a locked directory; returns a fresh reference.
fn dir_lookup(
    dir: &Inode,
    content: &InodeContent,
    name: &str,
) -> Result<Inode, FsError> {
    if content.kind != InodeKind::Dir {
        return Err(FsError::NotDirectory);
    }

    match name {
        "." => Ok(dir.dup()),
        ".." => Ok(Inode::handle(content.parent)),
        _ => content
            .entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| Inode::handle(entry.inum))
            .ok_or(FsError::NotFound),
    }
}

/// Splits a path into its directory part and final component.
/// `None` when there is no final component (the path names the root).
fn split_last(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }

    match trimmed.rfind('/') {
        Some(i) => Some((&trimmed[..i + 1], &trimmed[i + 1..])),
        None => Some(("", trimmed)),
    }
}

/// A borrowed path string.
#[derive(Debug, Clone, Copy)]
pub struct Path<'a> {
    inner: &'a str,
}

impl<'a> Path<'a> {
    pub fn new(path: &'a str) -> Self {
        Self { inner: path }
    }

    pub fn as_str(&self) -> &'a str {
        self.inner
    }

    fn components(&self) -> impl Iterator<Item = &'a str> {
        self.inner.split('/').filter(|c| !c.is_empty())
    }

    /// The inode the walk starts from: root for absolute paths, the
    /// current directory otherwise.
    fn start(&self) -> Inode {
        if self.inner.starts_with('/') {
            return Inode::root();
        }

        match current_proc_opt().and_then(|proc| proc.data().cwd.as_ref()) {
            Some(cwd) => cwd.dup(),
            None => Inode::root(),
        }
    }

    /// Walks the path to its inode (namei).
    pub fn resolve(&self) -> Result<Inode, FsError> {
        if self.inner.len() > MAXPATH {
            return Err(FsError::NameTooLong);
        }

        let mut node = self.start();

        for name in self.components() {
            let next = {
                let content = node.lock();
                dir_lookup(&node, &content, name)
            };

            node.put();
            node = next?;
        }

        Ok(node)
    }

    /// Walks to the containing directory and returns it with the final
    /// name still to be looked up.
    pub fn resolve_parent(&self) -> Result<(Inode, &'a str), FsError> {
        if self.inner.len() > MAXPATH {
            return Err(FsError::NameTooLong);
        }

        let Some((dir, name)) = split_last(self.inner) else {
            return Err(FsError::AlreadyExists);
        };

        let dir = if dir.is_empty() {
            self.start()
        } else {
            Path::new(dir).resolve()?
        };

        Ok((dir, name))
    }
}

/// Creates a new inode of `kind` at `path`. Fails if the name is taken.
pub fn create(path: &Path, kind: InodeKind) -> Result<Inode, FsError> {
    let (dir, name) = path.resolve_parent()?;

    let result = {
        let mut content = dir.lock();

        if content.kind != InodeKind::Dir {
            Err(FsError::NotDirectory)
        } else if let Ok(existing) = dir_lookup(&dir, &content, name) {
            existing.put();
            Err(FsError::AlreadyExists)
        } else {
            match Inode::alloc(kind, dir.inum) {
                Ok(inode) => {
                    content.entries.push(DirEntry {
                        name: String::from(name),
                        inum: inode.inum,
                    });
                    Ok(inode)
                }
                Err(err) => Err(err),
            }
        }
    };

    dir.put();
    result
}

/// Brings the filesystem up: the root is already present, so this just
/// installs the console device node. Runs in process context from the
/// first `fork_ret` because inode locks sleep.
pub fn init(dev: u32) {
    let _ = dev;

    create(&Path::new("/console"), InodeKind::Device { major: CONSOLE })
        .expect("fs: console node")
        .put();

    println!("fs init");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_last_forms() {
        assert_eq!(split_last("/init"), Some(("/", "init")));
        assert_eq!(split_last("a/b/c"), Some(("a/b/", "c")));
        assert_eq!(split_last("console"), Some(("", "console")));
        assert_eq!(split_last("/a/b/"), Some(("/a/", "b")));
        assert_eq!(split_last("/"), None);
        assert_eq!(split_last(""), None);
    }

    #[test]
    fn components_skip_empty_segments() {
        let path = Path::new("//a///b/c//");
        let parts: alloc::vec::Vec<_> = path.components().collect();
        assert_eq!(parts, ["a", "b", "c"]);

        assert_eq!(Path::new("/").components().count(), 0);
    }

    #[test]
    fn read_write_offsets() {
        let mut content = InodeContent {
            kind: InodeKind::File,
            nlink: 1,
            parent: ROOTINO,
            data: Vec::new(),
            entries: Vec::new(),
        };
        let inode = Inode { inum: 1 };

        // write past the end zero-fills the gap
        assert_eq!(inode.write(&mut content, 4, b"abcd"), Ok(4));
        assert_eq!(content.data.len(), 8);
        assert_eq!(&content.data[..4], &[0, 0, 0, 0]);

        let mut buf = [0u8; 8];
        assert_eq!(inode.read(&content, 4, &mut buf), 4);
        assert_eq!(&buf[..4], b"abcd");

        // reads past the end return nothing
        assert_eq!(inode.read(&content, 8, &mut buf), 0);
        assert_eq!(inode.read(&content, 100, &mut buf), 0);
    }
}
