use crate::error::{nix_to_io, Error, Result};
use crate::remote_mem::{process_read, process_write};
use libc::{pid_t, user_regs_struct};
use log::{debug, error};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::io;

/// The single-byte x86 breakpoint instruction. Linux signals us with
/// SIGTRAP when the target executes it. Note that the trap length is
/// independent of any prologue length saved elsewhere.
const TRAP: [u8; 1] = [0xcc];

/// Registers used for the first six INTEGER-class arguments, in order.
const ARG_REGS: usize = 6;

/// The AMD64 ABI reserves this many bytes below the stack pointer for
/// the current frame's scratch use; an injected call must not touch it.
const RED_ZONE: u64 = 128;

/// Detach when dropped, whatever happened in between.
struct Detacher(Pid);

impl Drop for Detacher {
    fn drop(&mut self) {
        let _ = ptrace::detach(self.0, None);
    }
}

/// Build the register file for an injected call, plus the stack words
/// that must be written before resuming: stack-passed arguments followed
/// by the pushed return address. Word addresses decrease in push order,
/// so argument `6 + n` ends up at increasing addresses for increasing
/// `n`, as the ABI lays them out.
fn build_call_regs(
    regs: &user_regs_struct,
    function: u64,
    args: &[u64],
) -> (user_regs_struct, Vec<(u64, u64)>) {
    let mut call = *regs;
    let mut writes = Vec::new();

    // The state we forge must look like the moment just after a `call`
    // instruction issued from a properly aligned frame.
    call.rsp = (call.rsp + 7) & !7u64;
    call.rsp -= RED_ZONE;

    let stack_args = args.len().saturating_sub(ARG_REGS) as u64;
    if (call.rsp + stack_args * 8) & 15 != 0 {
        call.rsp -= 8;
    }

    for (i, &arg) in args.iter().enumerate().rev() {
        match i {
            0 => call.rdi = arg,
            1 => call.rsi = arg,
            2 => call.rdx = arg,
            3 => call.rcx = arg,
            4 => call.r8 = arg,
            5 => call.r9 = arg,
            _ => {
                call.rsp -= 8;
                writes.push((call.rsp, arg));
            }
        }
    }

    // AL holds the vector-register argument count for variadic callees.
    call.rax = 0;

    // Return address: the target's original instruction pointer, where
    // the breakpoint now sits.
    call.rsp -= 8;
    writes.push((call.rsp, regs.rip));

    call.rip = function;

    // A non-negative orig_rax means we interrupted the target inside a
    // syscall; force it to -1 so the kernel does not rewind and restart
    // the syscall instruction under our forged registers.
    if (regs.orig_rax as i64) >= 0 {
        call.orig_rax = -1i64 as u64;
    }

    (call, writes)
}

fn run_call(pid: pid_t, p: Pid, call: user_regs_struct, writes: &[(u64, u64)]) -> Result<u64> {
    for &(addr, value) in writes {
        process_write(pid, &value.to_ne_bytes(), addr)?;
    }

    ptrace::setregs(p, call).map_err(|e| Error::RemoteIo(nix_to_io(e)))?;
    ptrace::cont(p, None).map_err(|e| Error::RemoteIo(nix_to_io(e)))?;

    loop {
        match waitpid(p, None).map_err(|e| Error::RemoteIo(nix_to_io(e)))? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => break,
            WaitStatus::Stopped(_, sig)
                if sig == Signal::SIGSEGV || sig == Signal::SIGILL || sig == Signal::SIGFPE =>
            {
                error!("signal {} in attempted injection function call", sig);
                return Err(Error::TargetCorrupted {
                    signal: sig as i32,
                });
            }
            WaitStatus::Stopped(_, sig) => {
                debug!("target stopped with {} during call, continuing", sig);
                ptrace::cont(p, None).map_err(|e| Error::RemoteIo(nix_to_io(e)))?;
            }
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                return Err(Error::RemoteIo(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "target exited during injected call",
                )));
            }
            _ => {
                ptrace::cont(p, None).map_err(|e| Error::RemoteIo(nix_to_io(e)))?;
            }
        }
    }

    let end = ptrace::getregs(p).map_err(|e| Error::RemoteIo(nix_to_io(e)))?;
    Ok(end.rax)
}

/// Synchronously call an AMD64 ABI function inside a stopped target,
/// with all-INTEGER-class arguments, and return its `rax`.
///
/// The target must not already be traced. The sequence is: attach, wait
/// for the stop, snapshot registers and the byte under the instruction
/// pointer, plant a breakpoint there, forge a call frame whose return
/// address is that very instruction pointer, continue, and wait for the
/// breakpoint to report the return. The snapshotted byte and registers
/// are restored before detaching on every path except `TargetCorrupted`,
/// where the target's state is beyond saving.
pub fn call_function_in_target(pid: pid_t, function: u64, args: &[u64]) -> Result<u64> {
    let p = Pid::from_raw(pid);

    ptrace::attach(p).map_err(Error::TraceAttach)?;
    let _guard = Detacher(p);
    waitpid(p, None).map_err(|e| Error::RemoteIo(nix_to_io(e)))?;

    let regs = ptrace::getregs(p).map_err(|e| Error::RemoteIo(nix_to_io(e)))?;

    let mut backup = [0u8; TRAP.len()];
    process_read(pid, &mut backup, regs.rip)?;
    process_write(pid, &TRAP, regs.rip)?;

    let (call, writes) = build_call_regs(&regs, function, args);
    let outcome = run_call(pid, p, call, &writes);

    match outcome {
        Err(Error::TargetCorrupted { .. }) => {}
        _ => {
            let _ = process_write(pid, &backup, regs.rip);
            let _ = ptrace::setregs(p, regs);
        }
    }

    outcome
}
