/// maximum number of CPUs
pub const NCPU: usize = 4;
/// maximum number of processes
pub const NPROC: usize = 64;
/// open files per process
pub const NOFILE: usize = 16;
/// open files per system
pub const NFILE: usize = 100;
/// maximum number of in-memory inodes
pub const NINODE: usize = 50;
/// maximum major device number
pub const NDEV: usize = 10;
/// device number of the root filesystem
pub const ROOTDEV: u32 = 1;
/// max exec arguments
pub const MAXARG: usize = 32;
/// max concurrent FS transactions
pub const MAXOPS: usize = 10;
/// maximum file path name
pub const MAXPATH: usize = 128;
/// kernel stack size per process
pub const KSTACKSIZE: usize = 4096;
/// boot stack pages per CPU
pub const NBOOTSTACK_PAGES: usize = 4;
/// user stack pages
pub const USERSTACK: usize = 1;
