//! Live hook round-trips on hand-assembled code pages. The pages hold
//! known straight-line instructions so the tests control exactly what
//! the disassembler sees. Skipped when objdump is not installed.

use lcitk::disasm::OBJDUMP;
use lcitk::error::Error;
use lcitk::interpose::{interpose_by_address, interpose_by_name, uninterpose, JMP_PATCH_LEN};
use libc::c_void;
use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use std::mem;
use std::path::Path;
use std::ptr;
use std::slice;

/// `f(x) = x + 1` with a 14-byte straight-line prologue:
///   mov %rdi,%rax ; add $0x1,%rax ; xchg %rbx,%rbx ; nopl 0x0(%rax) ; ret
const ADD_ONE: [u8; 15] = [
    0x48, 0x89, 0xf8, //
    0x48, 0x83, 0xc0, 0x01, //
    0x48, 0x87, 0xdb, //
    0x0f, 0x1f, 0x40, 0x00, //
    0xc3,
];

/// A function whose second instruction is a short backward jump:
///   nop ; jmp .-0 ; then padding.
const JUMPY: [u8; 16] = [
    0x90, //
    0xeb, 0xfe, //
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, //
    0xc3,
];

fn exec_page(code: &[u8]) -> *mut u8 {
    unsafe {
        let page = mmap(
            ptr::null_mut(),
            4096,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE,
            -1,
            0,
        )
        .expect("mmap") as *mut u8;
        ptr::copy_nonoverlapping(code.as_ptr(), page, code.len());
        page
    }
}

extern "C" fn forty_one(_x: u64) -> u64 {
    41
}

#[test]
fn hook_roundtrip_restores_bytes_exactly() {
    if !Path::new(OBJDUMP).exists() {
        return;
    }
    unsafe {
        let page = exec_page(&ADD_ONE);
        let f: extern "C" fn(u64) -> u64 = mem::transmute(page);
        assert_eq!(f(100), 101);

        let before = slice::from_raw_parts(page, ADD_ONE.len()).to_vec();

        let tramp =
            interpose_by_address(forty_one as *const c_void, page as *mut c_void).unwrap();
        assert_eq!(f(100), 41, "hooked calls divert to the replacement");

        let original: extern "C" fn(u64) -> u64 = mem::transmute(tramp);
        assert_eq!(original(100), 101, "the trampoline behaves as the unhooked target");

        uninterpose(tramp).unwrap();
        let after = slice::from_raw_parts(page, ADD_ONE.len()).to_vec();
        assert_eq!(before, after, "uninterpose restores the prologue byte-for-byte");
        assert_eq!(f(100), 101);
    }
}

#[test]
fn branching_prologue_is_rejected_and_untouched() {
    if !Path::new(OBJDUMP).exists() {
        return;
    }
    unsafe {
        let page = exec_page(&JUMPY);
        let before = slice::from_raw_parts(page, JUMPY.len()).to_vec();

        match interpose_by_address(forty_one as *const c_void, page as *mut c_void) {
            Err(Error::UnrelocatablePrologue { mnemonic, .. }) => {
                assert!(mnemonic.starts_with('j'), "rejected on {}", mnemonic);
            }
            Err(other) => panic!("wrong error: {}", other),
            Ok(_) => panic!("branching prologue was accepted"),
        }

        let after = slice::from_raw_parts(page, JUMPY.len()).to_vec();
        assert_eq!(before, after, "a failed interpose leaves the target unmodified");
    }
}

#[test]
fn interposing_a_missing_symbol_fails_cleanly() {
    unsafe {
        match interpose_by_name(
            forty_one as *const c_void,
            "",
            "no_such_symbol_anywhere_in_this_binary",
        ) {
            Err(Error::NotFound(_)) => {}
            Err(other) => panic!("wrong error: {}", other),
            Ok(_) => panic!("missing symbol was interposed"),
        }
    }
}

#[test]
fn patch_length_is_the_wire_format() {
    // FF 25 00 00 00 00 plus a 64-bit pointer.
    assert_eq!(JMP_PATCH_LEN, 14);
}
