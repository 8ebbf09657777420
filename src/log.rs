//! FS transaction accounting.
//!
//! Keeps the teacher's begin/end transaction shape: a system call wraps
//! its filesystem mutations in an `Operation` guard, and the number of
//! concurrent operations is bounded, with latecomers sleeping until a
//! slot frees up. There is no disk behind the RAM filesystem, so the
//! guard carries no commit work.

use crate::param::MAXOPS;
use crate::proc::{self, Channel};
use crate::spinlock::SpinLock;

#[derive(Debug)]
struct LogState {
    outstanding: usize,
}

static LOG: SpinLock<LogState> = SpinLock::new(LogState { outstanding: 0 }, "log");

/// An in-flight FS transaction; dropping it ends the operation.
#[derive(Debug)]
pub struct Operation;

impl Operation {
    pub fn begin() -> Self {
        let mut log = LOG.lock();

        while log.outstanding >= MAXOPS {
            log = proc::sleep(Channel::Log, log);
        }

        log.outstanding += 1;
        Operation
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        {
            let mut log = LOG.lock();
            log.outstanding -= 1;
        }

        proc::wakeup(Channel::Log);
    }
}

pub fn init(dev: u32) {
    let _ = dev;
    println!("log init");
}
