use core::fmt::Display;

use alloc::string::String;

use bytemuck::{Pod, Zeroable};

use crate::arm64::{PGSIZE, PTE_RO, PTE_UXN, pg_round_up};
use crate::fs::{InodeKind, Path};
use crate::log::Operation;
use crate::param::{MAXARG, USERSTACK};
use crate::proc::current_proc;
use crate::vm::{PgDir, VA};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    NotFound,
    BadFormat,
    BadSegment,
    Alloc,
    Memory,
}

impl Display for ExecError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExecError::NotFound => write!(f, "executable not found"),
            ExecError::BadFormat => write!(f, "invalid elf file"),
            ExecError::BadSegment => write!(f, "invalid program header"),
            ExecError::Alloc => write!(f, "allocation error"),
            ExecError::Memory => write!(f, "memory error"),
        }
    }
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const EM_AARCH64: u16 = 183;

/// ELF64 file header
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ElfHeader {
    ident: [u8; 16],
    r#type: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

impl ElfHeader {
    const SIZE: usize = size_of::<Self>();
}

/// ELF64 program header
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ProgramHeader {
    r#type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

impl ProgramHeader {
    const SIZE: usize = size_of::<Self>();

    const PT_LOAD: u32 = 1;
    const PF_X: u32 = 0x1;
    const PF_W: u32 = 0x2;

    /// Attribute bits for this segment's pages: executability and
    /// writability are opt-in, everything else is the user default.
    fn perms(&self) -> u64 {
        let mut perm = 0;
        if self.flags & Self::PF_X == 0 {
            perm |= PTE_UXN;
        }
        if self.flags & Self::PF_W == 0 {
            perm |= PTE_RO;
        }
        perm
    }
}

/// Replaces the current user image with the program at `path`, leaving
/// argc in the return register and argv's address in `x1`. The old
/// image survives any failure.
pub fn exec(path: &Path, argv: &[String]) -> Result<usize, ExecError> {
    let proc = current_proc();
    let mut size = 0;

    let _op = Operation::begin();

    let Ok(inode) = log!(path.resolve()) else {
        err!(ExecError::NotFound);
    };

    let content = inode.lock();

    if content.kind != InodeKind::File || content.data.len() < ElfHeader::SIZE {
        drop(content);
        inode.put();
        err!(ExecError::BadFormat);
    }

    let elf: ElfHeader = bytemuck::pod_read_unaligned(&content.data[..ElfHeader::SIZE]);

    if elf.ident[..4] != ELF_MAGIC || elf.machine != EM_AARCH64 {
        drop(content);
        inode.put();
        err!(ExecError::BadFormat);
    }

    let Ok(mut pgdir) = log!(PgDir::try_new()) else {
        drop(content);
        inode.put();
        err!(ExecError::Alloc);
    };

    // load every PT_LOAD segment into the new image
    for i in 0..elf.phnum as usize {
        let offset = (elf.phoff as usize).saturating_add(i * ProgramHeader::SIZE);

        let Some(bytes) = content
            .data
            .get(offset..offset.saturating_add(ProgramHeader::SIZE))
        else {
            pgdir.free(size);
            drop(content);
            inode.put();
            err!(ExecError::BadSegment);
        };
        let ph: ProgramHeader = bytemuck::pod_read_unaligned(bytes);

        if ph.r#type != ProgramHeader::PT_LOAD {
            continue;
        }

        let file_range = (ph.offset as usize, ph.filesz as usize);

        if ph.memsz < ph.filesz
            || ph.vaddr.checked_add(ph.memsz).is_none()
            || ph.vaddr as usize % PGSIZE != 0
            || content.data.len() < file_range.0.saturating_add(file_range.1)
        {
            pgdir.free(size);
            drop(content);
            inode.put();
            err!(ExecError::BadSegment);
        }

        size = match log!(pgdir.alloc(size, (ph.vaddr + ph.memsz) as usize, ph.perms())) {
            Ok(new_size) => new_size,
            Err(_) => {
                pgdir.free(size);
                drop(content);
                inode.put();
                err!(ExecError::Alloc);
            }
        };

        let segment = &content.data[file_range.0..file_range.0 + file_range.1];
        if log!(pgdir.copy_to(segment, VA::from(ph.vaddr as usize))).is_err() {
            pgdir.free(size);
            drop(content);
            inode.put();
            err!(ExecError::Memory);
        }
    }

    drop(content);
    inode.put();
    drop(_op);

    let old_size = proc.data().size;

    // Allocate the user stack at the next page boundary, with an
    // inaccessible guard page below it.
    size = pg_round_up(size);

    size = match log!(pgdir.alloc(size, size + (USERSTACK + 1) * PGSIZE, PTE_UXN)) {
        Ok(new_size) => new_size,
        Err(_) => {
            pgdir.free(size);
            err!(ExecError::Alloc);
        }
    };

    if log!(pgdir.clear_user(VA::from(size - (USERSTACK + 1) * PGSIZE))).is_err() {
        pgdir.free(size);
        err!(ExecError::Memory);
    }

    let mut sp = size;
    let stackbase = sp - USERSTACK * PGSIZE;

    // copy argument strings onto the stack, remembering their addresses
    let mut ustack = [0u64; MAXARG + 1];
    let mut argc = 0;

    for arg in argv.iter() {
        if argc >= MAXARG {
            pgdir.free(size);
            err!(ExecError::Memory);
        }

        sp -= arg.len() + 1; // NUL included
        sp -= sp % 16; // keep sp 16-byte aligned

        if sp < stackbase {
            pgdir.free(size);
            err!(ExecError::Memory);
        }

        if log!(pgdir.copy_to(arg.as_bytes(), VA::from(sp))).is_err()
            || log!(pgdir.copy_to(&[0u8], VA::from(sp + arg.len()))).is_err()
        {
            pgdir.free(size);
            err!(ExecError::Memory);
        }

        ustack[argc] = sp as u64;
        argc += 1;
    }
    ustack[argc] = 0;

    // then the argv array itself
    sp -= (argc + 1) * size_of::<u64>();
    sp -= sp % 16;

    let ustack_bytes = bytemuck::cast_slice::<u64, u8>(&ustack[..argc + 1]);

    if sp < stackbase || log!(pgdir.copy_to(ustack_bytes, VA::from(sp))).is_err() {
        pgdir.free(size);
        err!(ExecError::Memory);
    }

    // # Safety: we are the current proc
    let data = unsafe { proc.data_mut() };

    // keep the last path component as the debug name
    data.name.clear();
    data.name.push_str(
        path.as_str()
            .rsplit_once('/')
            .map_or(path.as_str(), |(_, name)| name),
    );

    // commit to the new image
    let old_pgdir = data.pgdir.replace(pgdir).unwrap();
    data.size = size;

    let tf = data.tf_mut();
    tf.x1 = sp as u64; // argv for user main(argc, argv)
    tf.elr_el1 = elf.entry; // first instruction of the new image
    tf.sp_el0 = sp as u64;

    // the old tree must not be freed while it is the live translation
    data.pgdir().switch_to();
    old_pgdir.free(old_size);

    Ok(argc) // becomes x0: argc for user main
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_header() -> ElfHeader {
        let mut elf = ElfHeader::zeroed();
        elf.ident[..4].copy_from_slice(&ELF_MAGIC);
        elf.machine = EM_AARCH64;
        elf.entry = 0x1000;
        elf
    }

    #[test]
    fn header_layout() {
        // ELF64 headers are exactly this big; the loader offsets
        // depend on it.
        assert_eq!(ElfHeader::SIZE, 64);
        assert_eq!(ProgramHeader::SIZE, 56);
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let elf = valid_header();
        let bytes = bytemuck::bytes_of(&elf);
        let back: ElfHeader = bytemuck::pod_read_unaligned(bytes);
        assert_eq!(back.ident[..4], ELF_MAGIC);
        assert_eq!(back.machine, EM_AARCH64);
        assert_eq!(back.entry, 0x1000);
    }

    #[test]
    fn segment_permissions() {
        let mut ph = ProgramHeader::zeroed();

        // neither writable nor executable
        assert_eq!(ph.perms(), PTE_UXN | PTE_RO);

        ph.flags = ProgramHeader::PF_X;
        assert_eq!(ph.perms(), PTE_RO);

        ph.flags = ProgramHeader::PF_W;
        assert_eq!(ph.perms(), PTE_UXN);

        ph.flags = ProgramHeader::PF_X | ProgramHeader::PF_W;
        assert_eq!(ph.perms(), 0);
    }
}
