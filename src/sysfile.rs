//! File-descriptor system calls; thin wrappers routing the *at flavors
//! onto the file table and the RAM filesystem. Directory file
//! descriptors are not supported: every dirfd must be AT_FDCWD.

use core::mem::size_of;

use crate::file::{File, FileType};
use crate::fs::{self, InodeKind, Path, Stat};
use crate::log::Operation;
use crate::proc::current_proc_and_data_mut;
use crate::syscall::{SysError, SyscallArgs, valid_user_range};
use crate::vm::VA;

const AT_FDCWD: isize = -100;

/// Installs a file into the caller's first free descriptor slot.
fn fd_alloc(file: File) -> Result<usize, SysError> {
    let (_proc, data) = current_proc_and_data_mut();

    for (fd, slot) in data.open_files.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(file);
            return Ok(fd);
        }
    }

    let mut file = file;
    file.close();
    err!(SysError::TooManyFiles);
}

fn check_dirfd(dirfd: isize, path: &str) -> Result<(), SysError> {
    // absolute paths never consult the dirfd
    if dirfd != AT_FDCWD && !path.starts_with('/') {
        err!(SysError::NotImplemented);
    }
    Ok(())
}

pub fn sys_dup(args: &SyscallArgs) -> Result<usize, SysError> {
    let (_fd, mut file) = try_log!(args.get_file(0));

    fd_alloc(file.dup())
}

pub fn sys_read(args: &SyscallArgs) -> Result<usize, SysError> {
    let (_fd, file) = try_log!(args.get_file(0));

    let n = match usize::try_from(args.get_int(2)) {
        Ok(n) => n,
        Err(_) => err!(SysError::InvalidArgument),
    };
    let addr = try_log!(args.get_ptr(1, n));

    file.read(addr, n)
}

pub fn sys_close(args: &SyscallArgs) -> Result<usize, SysError> {
    let (fd, _file) = try_log!(args.get_file(0));

    let (_proc, data) = current_proc_and_data_mut();
    let mut file = data.open_files[fd].take().expect("close: checked fd");
    file.close();

    Ok(0)
}

pub fn sys_fstat(args: &SyscallArgs) -> Result<usize, SysError> {
    let (_fd, file) = try_log!(args.get_file(0));
    let addr = try_log!(args.get_ptr(1, size_of::<Stat>()));

    try_log!(file.stat(addr));
    Ok(0)
}

pub fn sys_fstatat(args: &SyscallArgs) -> Result<usize, SysError> {
    let dirfd = args.get_int(0);
    let path = try_log!(args.get_str(1));
    let addr = try_log!(args.get_ptr(2, size_of::<Stat>()));

    try_log!(check_dirfd(dirfd, path));

    let _op = Operation::begin();

    let inode = match log!(Path::new(path).resolve()) {
        Ok(inode) => inode,
        Err(err) => return Err(err.into()),
    };

    let stat = {
        let content = inode.lock();
        inode.stat(&content)
    };
    inode.put();

    unsafe {
        core::ptr::copy_nonoverlapping(
            &stat as *const Stat as *const u8,
            addr.as_usize() as *mut u8,
            size_of::<Stat>(),
        );
    }

    Ok(0)
}

pub fn sys_chdir(args: &SyscallArgs) -> Result<usize, SysError> {
    let path = try_log!(args.get_str(0));

    let _op = Operation::begin();

    let inode = match log!(Path::new(path).resolve()) {
        Ok(inode) => inode,
        Err(err) => return Err(err.into()),
    };

    let is_dir = {
        let content = inode.lock();
        content.kind == InodeKind::Dir
    };

    if !is_dir {
        inode.put();
        err!(SysError::NotDirectory);
    }

    let (_proc, data) = current_proc_and_data_mut();
    if let Some(old) = data.cwd.replace(inode) {
        old.put();
    }

    Ok(0)
}

pub fn sys_mkdirat(args: &SyscallArgs) -> Result<usize, SysError> {
    let dirfd = args.get_int(0);
    let path = try_log!(args.get_str(1));

    try_log!(check_dirfd(dirfd, path));

    let _op = Operation::begin();

    match log!(fs::create(&Path::new(path), InodeKind::Dir)) {
        Ok(inode) => {
            inode.put();
            Ok(0)
        }
        Err(err) => Err(err.into()),
    }
}

pub fn sys_mknodat(args: &SyscallArgs) -> Result<usize, SysError> {
    let dirfd = args.get_int(0);
    let path = try_log!(args.get_str(1));
    let _mode = args.get_raw(2);
    let dev = args.get_raw(3);

    try_log!(check_dirfd(dirfd, path));

    let major = ((dev >> 8) & 0xff) as u16;

    let _op = Operation::begin();

    match log!(fs::create(&Path::new(path), InodeKind::Device { major })) {
        Ok(inode) => {
            inode.put();
            Ok(0)
        }
        Err(err) => Err(err.into()),
    }
}

pub fn sys_openat(args: &SyscallArgs) -> Result<usize, SysError> {
    let dirfd = args.get_int(0);
    let path = try_log!(args.get_str(1));
    let flags = args.get_int(2) as usize;

    try_log!(check_dirfd(dirfd, path));

    let _op = Operation::begin();

    let path = Path::new(path);

    let inode = if flags & File::O_CREATE != 0 {
        match fs::create(&path, InodeKind::File) {
            Ok(inode) => inode,
            // open of an existing name is fine with O_CREATE
            Err(fs::FsError::AlreadyExists) => try_log!(path.resolve()),
            Err(err) => return log!(Err(err.into())),
        }
    } else {
        match log!(path.resolve()) {
            Ok(inode) => inode,
            Err(err) => return Err(err.into()),
        }
    };

    let writeable = flags & (File::O_WRONLY | File::O_RDWR) != 0;
    let readable = flags & File::O_WRONLY == 0;

    let (kind, major) = {
        let content = inode.lock();
        let major = match content.kind {
            InodeKind::Device { major } => major,
            _ => 0,
        };
        (content.kind, major)
    };

    // directories open read-only
    if kind == InodeKind::Dir && writeable {
        inode.put();
        err!(SysError::IsDirectory);
    }

    let file = match File::alloc() {
        Ok(file) => file,
        Err(err) => {
            inode.put();
            return log!(Err(err));
        }
    };

    {
        let mut inner = file.inner();
        inner.readable = readable;
        inner.writeable = writeable;
        inner.offset = 0;
        inner.r#type = match kind {
            InodeKind::Device { major: _ } => FileType::Device { inode, major },
            _ => FileType::Inode { inode },
        };
    }

    if flags & File::O_TRUNC != 0 && kind == InodeKind::File {
        let inner = file.inner();
        if let FileType::Inode { inode } = &inner.r#type {
            let mut content = inode.lock();
            content.data.clear();
        }
    }

    fd_alloc(file)
}

/// Gathered write. The iovec array and every buffer it points at must
/// lie inside the user image.
pub fn sys_writev(args: &SyscallArgs) -> Result<usize, SysError> {
    let (_fd, mut file) = try_log!(args.get_file(0));
    let iov = args.get_raw(1);
    let iovcnt = args.get_int(2);

    if !(0..=MAXIOV as isize).contains(&iovcnt) {
        err!(SysError::InvalidArgument);
    }

    let size = args.proc().data().size;
    let mut written = 0;

    for i in 0..iovcnt as u64 {
        let entry = iov.wrapping_add(16 * i);
        let base = try_log!(args.fetch_int(VA::from(entry)));
        let len = try_log!(args.fetch_int(VA::from(entry.wrapping_add(8)))) as usize;

        if len == 0 {
            continue;
        }

        if !valid_user_range(size, base as usize, len) {
            err!(SysError::BadAddress);
        }

        written += try_log!(file.write(VA::from(base), len));
    }

    Ok(written)
}

const MAXIOV: usize = 16;
