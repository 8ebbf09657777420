use alloc::string::String;
use alloc::vec::Vec;

use crate::exec::exec;
use crate::fs::Path;
use crate::param::MAXARG;
use crate::proc;
use crate::syscall::{SysError, SyscallArgs};
use crate::vm::VA;

pub fn sys_exit(args: &SyscallArgs) -> ! {
    let status = args.get_int(0);
    proc::exit(status);
}

pub fn sys_yield(_args: &SyscallArgs) -> Result<usize, SysError> {
    proc::r#yield();
    Ok(0)
}

/// Grows (or shrinks) the user image by the requested delta and returns
/// the previous size.
pub fn sys_brk(args: &SyscallArgs) -> Result<usize, SysError> {
    let delta = args.get_int(0);
    let previous = args.proc().data().size;

    match log!(proc::grow(delta)) {
        Ok(()) => Ok(previous),
        Err(_) => Err(SysError::OutOfMemory),
    }
}

/// Only the fork-like form is supported: flags must be exactly SIGCHLD
/// and the child stack is ignored.
pub fn sys_clone(args: &SyscallArgs) -> Result<usize, SysError> {
    const SIGCHLD: u64 = 17;

    let flags = args.get_raw(0);
    let _childstk = args.get_raw(1);

    if flags != SIGCHLD {
        println!("sys_clone: flags other than SIGCHLD are not supported");
        err!(SysError::InvalidArgument);
    }

    match log!(proc::fork()) {
        Ok(pid) => Ok(*pid),
        Err(_) => Err(SysError::OutOfMemory),
    }
}

/// Only the "wait for any child" form is supported: every argument must
/// be its don't-care value.
pub fn sys_wait4(args: &SyscallArgs) -> Result<usize, SysError> {
    let pid = args.get_int(0);
    let wstatus = args.get_raw(1);
    let options = args.get_raw(2);
    let rusage = args.get_raw(3);

    if pid != -1 || wstatus != 0 || options != 0 || rusage != 0 {
        println!(
            "sys_wait4: unsupported form pid={} wstatus={:#x} options={:#x} rusage={:#x}",
            pid, wstatus, options, rusage,
        );
        err!(SysError::InvalidArgument);
    }

    match proc::wait() {
        Some(pid) => Ok(*pid),
        None => err!(SysError::NoChildren),
    }
}

pub fn sys_exec(args: &SyscallArgs) -> Result<usize, SysError> {
    let path = String::from(try_log!(args.get_str(0)));
    let uargv = args.get_raw(1);

    // gather the NULL-terminated argv array out of user memory before
    // exec tears the old image down
    let mut argv: Vec<String> = Vec::new();
    loop {
        if argv.len() >= MAXARG {
            err!(SysError::InvalidArgument);
        }

        let uarg = try_log!(args.fetch_int(VA::from(uargv.wrapping_add(8 * argv.len() as u64))));
        if uarg == 0 {
            break;
        }

        argv.push(String::from(try_log!(args.fetch_str(VA::from(uarg)))));
    }

    match log!(exec(&Path::new(&path), &argv)) {
        Ok(argc) => Ok(argc),
        Err(_) => Err(SysError::InvalidExecutable),
    }
}

/// Threads are not implemented; the process id doubles as the thread
/// id. Also bound to set_tid_address for the libc startup path.
pub fn sys_gettid(args: &SyscallArgs) -> Result<usize, SysError> {
    Ok(*args.proc().inner.lock().pid)
}

pub fn sys_ioctl(_args: &SyscallArgs) -> Result<usize, SysError> {
    Ok(0)
}

pub fn sys_rt_sigprocmask(_args: &SyscallArgs) -> Result<usize, SysError> {
    Ok(0)
}
