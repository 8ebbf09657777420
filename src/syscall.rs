use core::fmt::Display;

use crate::file::File;
use crate::fs::FsError;
use crate::param::NOFILE;
use crate::proc::{Proc, current_proc};
use crate::sysfile::*;
use crate::sysproc::*;
use crate::trap::TrapFrame;
use crate::vm::{VA, VmError};

/// Syscall error codes using POSIX-standard numeric values.
///
/// User space only ever sees `-1` in `x0` on failure; the typed error
/// exists for classification and the debug transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SysError {
    NotPermitted = 1,
    NoEntry = 2,
    Interrupted = 4,
    IoError = 5,
    InvalidExecutable = 8,
    BadDescriptor = 9,
    NoChildren = 10,
    OutOfMemory = 12,
    BadAddress = 14,
    AlreadyExists = 17,
    NotDirectory = 20,
    IsDirectory = 21,
    InvalidArgument = 22,
    FileTableFull = 23,
    TooManyFiles = 24,
    NoSpace = 28,
    NameTooLong = 36,
    NotImplemented = 38,
}

impl SysError {
    pub fn as_code(self) -> u16 {
        self as u16
    }
}

impl Display for SysError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SysError::NotPermitted => write!(f, "operation not permitted"),
            SysError::NoEntry => write!(f, "no such file or directory"),
            SysError::Interrupted => write!(f, "interrupted"),
            SysError::IoError => write!(f, "input/output error"),
            SysError::InvalidExecutable => write!(f, "exec format error"),
            SysError::BadDescriptor => write!(f, "bad file descriptor"),
            SysError::NoChildren => write!(f, "no child processes"),
            SysError::OutOfMemory => write!(f, "cannot allocate memory"),
            SysError::BadAddress => write!(f, "bad address"),
            SysError::AlreadyExists => write!(f, "file exists"),
            SysError::NotDirectory => write!(f, "not a directory"),
            SysError::IsDirectory => write!(f, "is a directory"),
            SysError::InvalidArgument => write!(f, "invalid argument"),
            SysError::FileTableFull => write!(f, "too many open files in system"),
            SysError::TooManyFiles => write!(f, "too many open files"),
            SysError::NoSpace => write!(f, "no space left on device"),
            SysError::NameTooLong => write!(f, "file name too long"),
            SysError::NotImplemented => write!(f, "function not implemented"),
        }
    }
}

impl From<FsError> for SysError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::OutOfInode => SysError::NoSpace,
            FsError::OutOfRange => SysError::InvalidArgument,
            FsError::NotFound => SysError::NoEntry,
            FsError::NotDirectory => SysError::NotDirectory,
            FsError::IsDirectory => SysError::IsDirectory,
            FsError::AlreadyExists => SysError::AlreadyExists,
            FsError::NameTooLong => SysError::NameTooLong,
        }
    }
}

impl From<VmError> for SysError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::Alloc => SysError::OutOfMemory,
            VmError::NoMapping | VmError::OutOfRange => SysError::BadAddress,
        }
    }
}

/// True when `[addr, addr + len)` lies inside the user image `[0, size)`.
/// The only barrier between a user-supplied pointer and a direct load.
pub const fn valid_user_range(size: usize, addr: usize, len: usize) -> bool {
    match addr.checked_add(len) {
        Some(end) => addr < size && end <= size,
        None => false,
    }
}

/// Syscall argument registers: the number travels in `x8`, arguments in
/// `x1` through `x4`. At most four arguments; asking for more is a bug
/// in the kernel, not the caller.
fn arg_register(trapframe: &TrapFrame, index: usize) -> u64 {
    match index {
        0 => trapframe.x1,
        1 => trapframe.x2,
        2 => trapframe.x3,
        3 => trapframe.x4,
        _ => panic!("syscall argument index {} out of range", index),
    }
}

/// Wrapper for extracting typed syscall arguments from the trap frame.
pub struct SyscallArgs<'a> {
    trapframe: &'a TrapFrame,
    proc: &'static Proc,
}

impl<'a> SyscallArgs<'a> {
    fn new(trapframe: &'a TrapFrame, proc: &'static Proc) -> Self {
        Self { trapframe, proc }
    }

    pub fn proc(&self) -> &Proc {
        self.proc
    }

    /// Returns the argument at the given index as a raw register value.
    pub fn get_raw(&self, index: usize) -> u64 {
        arg_register(self.trapframe, index)
    }

    /// Returns the argument at the given index as an isize.
    pub fn get_int(&self, index: usize) -> isize {
        self.get_raw(index) as isize
    }

    /// Returns the argument at the given index as a virtual address.
    /// Not validated; fetch and range helpers do that.
    pub fn get_addr(&self, index: usize) -> VA {
        VA::from(self.get_raw(index))
    }

    /// Returns the argument at the given index as a pointer to `len`
    /// bytes of user memory, range-checked against the user image.
    pub fn get_ptr(&self, index: usize, len: usize) -> Result<VA, SysError> {
        let addr = self.get_raw(index) as usize;

        if !valid_user_range(self.proc.data().size, addr, len) {
            err!(SysError::BadAddress);
        }

        Ok(VA::from(addr))
    }

    /// Returns the argument at the given index as a NUL-terminated user
    /// string.
    pub fn get_str(&self, index: usize) -> Result<&'a str, SysError> {
        self.fetch_str(self.get_addr(index))
    }

    /// Reads 8 bytes of user memory at `addr`.
    pub fn fetch_int(&self, addr: VA) -> Result<u64, SysError> {
        let addr = addr.as_usize();

        if !valid_user_range(self.proc.data().size, addr, 8) {
            err!(SysError::BadAddress);
        }

        // Safety: the range lies inside [0, size) of the process whose
        // translation is installed
        Ok(unsafe { core::ptr::read(addr as *const u64) })
    }

    /// Returns the NUL-terminated string at `addr` without copying it
    /// out of user memory. Fails if no NUL appears before the end of
    /// the user image.
    pub fn fetch_str(&self, addr: VA) -> Result<&'a str, SysError> {
        let size = self.proc.data().size;
        let addr = addr.as_usize();

        if addr >= size {
            err!(SysError::BadAddress);
        }

        // Safety: [addr, size) lies inside the user image
        let window = unsafe { core::slice::from_raw_parts(addr as *const u8, size - addr) };

        let Some(len) = window.iter().position(|&c| c == 0) else {
            err!(SysError::BadAddress);
        };

        match core::str::from_utf8(&window[..len]) {
            Ok(s) => Ok(s),
            Err(_) => err!(SysError::InvalidArgument),
        }
    }

    /// Fetches the argument at the given index as a file descriptor and
    /// returns both the descriptor and the corresponding `File`.
    pub fn get_file(&self, index: usize) -> Result<(usize, File), SysError> {
        let fd: usize = match self.get_int(index).try_into() {
            Ok(fd) => fd,
            Err(_) => err!(SysError::BadDescriptor),
        };

        if fd >= NOFILE {
            err!(SysError::BadDescriptor);
        }

        if let Some(file) = &current_proc().data().open_files[fd] {
            return Ok((fd, file.clone()));
        }

        err!(SysError::BadDescriptor);
    }
}

/// System call numbers, following the Linux AArch64 table.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Dup = 23,
    Ioctl = 29,
    Mknodat = 33,
    Mkdirat = 34,
    Chdir = 49,
    Openat = 56,
    Close = 57,
    Read = 63,
    Writev = 66,
    Newfstatat = 79,
    Fstat = 80,
    Exit = 93,
    ExitGroup = 94,
    SetTidAddress = 96,
    SchedYield = 124,
    RtSigprocmask = 135,
    Gettid = 178,
    Brk = 214,
    Clone = 220,
    Execve = 221,
    Wait4 = 260,
}

impl TryFrom<usize> for Syscall {
    type Error = SysError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            23 => Ok(Syscall::Dup),
            29 => Ok(Syscall::Ioctl),
            33 => Ok(Syscall::Mknodat),
            34 => Ok(Syscall::Mkdirat),
            49 => Ok(Syscall::Chdir),
            56 => Ok(Syscall::Openat),
            57 => Ok(Syscall::Close),
            63 => Ok(Syscall::Read),
            66 => Ok(Syscall::Writev),
            79 => Ok(Syscall::Newfstatat),
            80 => Ok(Syscall::Fstat),
            93 => Ok(Syscall::Exit),
            94 => Ok(Syscall::ExitGroup),
            96 => Ok(Syscall::SetTidAddress),
            124 => Ok(Syscall::SchedYield),
            135 => Ok(Syscall::RtSigprocmask),
            178 => Ok(Syscall::Gettid),
            214 => Ok(Syscall::Brk),
            220 => Ok(Syscall::Clone),
            221 => Ok(Syscall::Execve),
            260 => Ok(Syscall::Wait4),
            _ => Err(SysError::NotImplemented),
        }
    }
}

/// Dispatches the system call in the trap frame and stores its result
/// in `x0`. Every failure lands there as -1.
pub fn syscall1(tf: &mut TrapFrame) {
    let proc = current_proc();

    // the frame the user registers were saved into belongs to this slot
    let tf_ptr: *mut TrapFrame = tf;
    unsafe { proc.data_mut().trapframe = tf_ptr };

    let number = tf.x8 as usize;

    let result = {
        let args = SyscallArgs::new(tf, proc);

        match Syscall::try_from(number) {
            Ok(syscall) => match syscall {
                Syscall::Dup => sys_dup(&args),
                Syscall::Ioctl => sys_ioctl(&args),
                Syscall::Mknodat => sys_mknodat(&args),
                Syscall::Mkdirat => sys_mkdirat(&args),
                Syscall::Chdir => sys_chdir(&args),
                Syscall::Openat => sys_openat(&args),
                Syscall::Close => sys_close(&args),
                Syscall::Read => sys_read(&args),
                Syscall::Writev => sys_writev(&args),
                Syscall::Newfstatat => sys_fstatat(&args),
                Syscall::Fstat => sys_fstat(&args),
                Syscall::Exit | Syscall::ExitGroup => sys_exit(&args),
                Syscall::SetTidAddress | Syscall::Gettid => sys_gettid(&args),
                Syscall::SchedYield => sys_yield(&args),
                Syscall::RtSigprocmask => sys_rt_sigprocmask(&args),
                Syscall::Brk => sys_brk(&args),
                Syscall::Clone => sys_clone(&args),
                Syscall::Execve => sys_exec(&args),
                Syscall::Wait4 => sys_wait4(&args),
            },
            Err(err) => {
                println!(
                    "syscall: unknown syscall {} from proc {}",
                    number,
                    *proc.inner.lock().pid,
                );
                Err(err)
            }
        }
    };

    tf.x0 = match log!(result) {
        Ok(value) => value as u64,
        Err(error) => {
            #[cfg(debug_assertions)]
            println!(
                "! syscall error ({}) from proc {} ({})",
                error,
                *proc.inner.lock().pid,
                proc.data().name,
            );
            let _ = error;
            u64::MAX
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_numbers_round_trip() {
        for (number, expect) in [
            (23, Syscall::Dup),
            (29, Syscall::Ioctl),
            (33, Syscall::Mknodat),
            (34, Syscall::Mkdirat),
            (49, Syscall::Chdir),
            (56, Syscall::Openat),
            (57, Syscall::Close),
            (63, Syscall::Read),
            (66, Syscall::Writev),
            (79, Syscall::Newfstatat),
            (80, Syscall::Fstat),
            (93, Syscall::Exit),
            (94, Syscall::ExitGroup),
            (96, Syscall::SetTidAddress),
            (124, Syscall::SchedYield),
            (135, Syscall::RtSigprocmask),
            (178, Syscall::Gettid),
            (214, Syscall::Brk),
            (220, Syscall::Clone),
            (221, Syscall::Execve),
            (260, Syscall::Wait4),
        ] {
            assert_eq!(Syscall::try_from(number), Ok(expect));
            assert_eq!(expect as usize, number);
        }
    }

    #[test]
    fn unknown_number_is_rejected() {
        assert_eq!(Syscall::try_from(0), Err(SysError::NotImplemented));
        assert_eq!(Syscall::try_from(1000), Err(SysError::NotImplemented));
    }

    #[test]
    fn arguments_come_from_x1_through_x4() {
        let mut tf: TrapFrame = unsafe { core::mem::zeroed() };
        tf.x0 = 0xdead; // return slot, never an argument
        tf.x1 = 10;
        tf.x2 = 20;
        tf.x3 = 30;
        tf.x4 = 40;
        tf.x5 = 0xbeef;

        assert_eq!(arg_register(&tf, 0), 10);
        assert_eq!(arg_register(&tf, 1), 20);
        assert_eq!(arg_register(&tf, 2), 30);
        assert_eq!(arg_register(&tf, 3), 40);
    }

    #[test]
    #[should_panic(expected = "argument index 4")]
    fn fifth_argument_is_fatal() {
        let tf: TrapFrame = unsafe { core::mem::zeroed() };
        arg_register(&tf, 4);
    }

    #[test]
    fn user_range_boundaries() {
        // [0, 4096) image
        assert!(valid_user_range(4096, 0, 8));
        assert!(valid_user_range(4096, 4088, 8));
        assert!(!valid_user_range(4096, 4089, 8));
        assert!(!valid_user_range(4096, 4096, 8));
        // second check catches the end, even when addr is inside
        assert!(!valid_user_range(4096, 4095, 2));
        // overflow must not wrap around
        assert!(!valid_user_range(4096, usize::MAX, 8));
    }
}
