use crate::disasm::{get_instructions_from_memory, Instruction};
use crate::error::{Error, Result};
use crate::symbols::find_function;
use libc::c_void;
use nix::sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags};
use nix::unistd::{getpid, sysconf, SysconfVar};
use static_assertions::const_assert_eq;
use std::io;
use std::mem;
use std::ptr;
use std::slice;

/// `jmpq *0x0(%rip)`: jump through the 64-bit pointer stored
/// immediately after the instruction.
const JMP_ABS: [u8; 6] = [0xff, 0x25, 0x00, 0x00, 0x00, 0x00];

/// A full absolute-jump patch: the indirect jump plus its inline
/// pointer. This is how many prologue bytes an interposition consumes.
pub const JMP_PATCH_LEN: usize = JMP_ABS.len() + mem::size_of::<u64>();

const_assert_eq!(JMP_PATCH_LEN, 14);

fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) => sz as usize,
        _ => 4096,
    }
}

fn mmap_failed(e: nix::Error) -> Error {
    Error::RemoteIo(crate::error::nix_to_io(e))
}

/// Validate that a disassembled prologue can be relocated verbatim and
/// concatenate its bytes.
///
/// Anything PC-relative or control-flow-dependent is rejected: such
/// bytes mean something different once they move. The instructions are
/// taken in order, and at least `JMP_PATCH_LEN` bytes must accumulate so
/// the patch jump fits over them.
fn relocatable_prefix(insns: &[Instruction]) -> Result<Vec<u8>> {
    let mut prefix = Vec::new();
    for insn in insns {
        if insn.operands.contains("%rip")
            || insn.mnemonic.starts_with('j')
            || insn.mnemonic.starts_with("call")
            || insn.mnemonic.starts_with("loop")
        {
            return Err(Error::UnrelocatablePrologue {
                address: insn.address,
                mnemonic: insn.mnemonic.clone(),
                operands: insn.operands.clone(),
            });
        }
        prefix.extend_from_slice(&insn.bytes);
    }

    if prefix.len() < JMP_PATCH_LEN {
        return Err(Error::PrologueTooShort {
            copied: prefix.len(),
        });
    }
    Ok(prefix)
}

/// Write an absolute-jump patch at `at`: the indirect jump opcode, then
/// the 64-bit destination in the pointer slot that follows it. The two
/// stores are to disjoint fields.
unsafe fn write_jmp_patch(at: *mut u8, destination: u64) {
    ptr::copy_nonoverlapping(JMP_ABS.as_ptr(), at, JMP_ABS.len());
    ptr::copy_nonoverlapping(
        destination.to_ne_bytes().as_ptr(),
        at.add(JMP_ABS.len()),
        mem::size_of::<u64>(),
    );
}

/// Interpose an AMD64 ABI function in the current process.
///
/// The first `JMP_PATCH_LEN` bytes of `target` are relocated into a
/// fresh executable page followed by an absolute jump back to the
/// continuation, and the prologue itself is overwritten with an
/// equivalent jump to `replacement`. The returned trampoline address is
/// callable as the original function and doubles as the handle for
/// `uninterpose`.
///
/// # Safety
///
/// `target` must be the entry of a function at least `JMP_PATCH_LEN`
/// bytes long, and no other thread may be executing its prologue while
/// it is rewritten.
pub unsafe fn interpose_by_address(
    replacement: *const c_void,
    target: *mut c_void,
) -> Result<*mut c_void> {
    let page = page_size();

    let trampoline = mmap(
        ptr::null_mut(),
        page,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
        MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE,
        -1,
        0,
    )
    .map_err(mmap_failed)? as *mut u8;

    let release = |e: Error| {
        unsafe {
            let _ = munmap(trampoline as *mut c_void, page);
        }
        e
    };

    let mut prologue = [0u8; JMP_PATCH_LEN];
    ptr::copy_nonoverlapping(target as *const u8, prologue.as_mut_ptr(), JMP_PATCH_LEN);

    let insns = get_instructions_from_memory(&prologue).map_err(&release)?;
    let prefix = relocatable_prefix(&insns).map_err(&release)?;

    ptr::copy_nonoverlapping(prefix.as_ptr(), trampoline, prefix.len());
    write_jmp_patch(
        trampoline.add(prefix.len()),
        target as u64 + prefix.len() as u64,
    );

    // Unprotect two pages in case the prologue straddles a boundary.
    let target_page = (target as usize & !(page - 1)) as *mut c_void;
    mprotect(
        target_page,
        page * 2,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
    )
    .map_err(|e| release(mmap_failed(e)))?;

    write_jmp_patch(target as *mut u8, replacement as u64);

    mprotect(
        target_page,
        page * 2,
        ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
    )
    .map_err(mmap_failed)?;

    Ok(trampoline as *mut c_void)
}

/// Interpose a function of the current process found by name through the
/// symbol tables of one of its images (empty name: the main image).
///
/// # Safety
///
/// As for `interpose_by_address`.
pub unsafe fn interpose_by_name(
    replacement: *const c_void,
    image_name: &str,
    func: &str,
) -> Result<*mut c_void> {
    let (addr, _path) = find_function(getpid().as_raw(), image_name, func)?;
    interpose_by_address(replacement, addr as *mut c_void)
}

/// Undo an interposition, given the trampoline it returned.
///
/// The relocated prefix length is recovered by scanning the trampoline
/// for its own tail jump; the pointer stored after that jump names the
/// continuation, and the continuation minus the prefix length is the
/// hooked function. The original bytes are copied back and the
/// trampoline page is unmapped.
///
/// # Safety
///
/// `trampoline` must come from a successful `interpose_by_address` in
/// this process, and no thread may be executing through it.
pub unsafe fn uninterpose(trampoline: *mut c_void) -> Result<()> {
    let page = page_size();
    let base = trampoline as *const u8;

    let mut after = JMP_PATCH_LEN + JMP_ABS.len();
    while slice::from_raw_parts(base.add(after - JMP_ABS.len()), JMP_ABS.len()) != JMP_ABS {
        after += 1;
        if after > page {
            return Err(Error::RemoteIo(io::Error::new(
                io::ErrorKind::NotFound,
                "trampoline tail jump not found",
            )));
        }
    }

    let copied = after - JMP_ABS.len();
    let mut continuation = [0u8; 8];
    ptr::copy_nonoverlapping(base.add(after), continuation.as_mut_ptr(), 8);
    let target = (u64::from_ne_bytes(continuation) - copied as u64) as *mut u8;

    let target_page = (target as usize & !(page - 1)) as *mut c_void;
    mprotect(
        target_page,
        page * 2,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
    )
    .map_err(mmap_failed)?;

    ptr::copy_nonoverlapping(base, target, copied);

    mprotect(
        target_page,
        page * 2,
        ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
    )
    .map_err(mmap_failed)?;

    munmap(trampoline, page).map_err(mmap_failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insn(mnemonic: &str, operands: &str, bytes: &[u8]) -> Instruction {
        Instruction {
            address: 0,
            bytes: bytes.to_vec(),
            mnemonic: mnemonic.to_owned(),
            operands: operands.to_owned(),
        }
    }

    #[test]
    fn straight_line_prefix_concatenates() {
        let insns = vec![
            insn("mov", "%rdi,%rax", &[0x48, 0x89, 0xf8]),
            insn("add", "$0x1,%rax", &[0x48, 0x83, 0xc0, 0x01]),
            insn("xchg", "%rbx,%rbx", &[0x48, 0x87, 0xdb]),
            insn("nopl", "0x0(%rax)", &[0x0f, 0x1f, 0x40, 0x00]),
        ];
        let prefix = relocatable_prefix(&insns).unwrap();
        assert_eq!(prefix.len(), 14);
        assert_eq!(&prefix[..3], &[0x48, 0x89, 0xf8]);
    }

    #[test]
    fn branches_are_rejected() {
        for &(m, o) in &[
            ("jmp", "0x0"),
            ("je", "0x4"),
            ("callq", "0x10"),
            ("loop", "0x2"),
        ] {
            let insns = vec![
                insn("push", "%rbp", &[0x55]),
                insn(m, o, &[0xeb, 0xfe]),
            ];
            match relocatable_prefix(&insns) {
                Err(Error::UnrelocatablePrologue { mnemonic, .. }) => {
                    assert_eq!(mnemonic, m)
                }
                other => panic!("{} not rejected: {:?}", m, other.map(|_| ())),
            }
        }
    }

    #[test]
    fn rip_relative_operands_are_rejected() {
        let insns = vec![insn("lea", "0x2ef2(%rip),%rsi", &[0x48, 0x8d, 0x35, 0xf2, 0x2e, 0, 0])];
        assert!(matches!(
            relocatable_prefix(&insns),
            Err(Error::UnrelocatablePrologue { .. })
        ));
    }

    #[test]
    fn short_prologues_are_rejected() {
        let insns = vec![
            insn("push", "%rbp", &[0x55]),
            insn("mov", "%rsp,%rbp", &[0x48, 0x89, 0xe5]),
        ];
        match relocatable_prefix(&insns) {
            Err(Error::PrologueTooShort { copied }) => assert_eq!(copied, 4),
            other => panic!("not rejected: {:?}", other.map(|_| ())),
        }
    }
}
