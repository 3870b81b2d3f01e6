use crate::error::{nix_to_io, Error, Result};
use libc::{c_void, pid_t};
use nix::sys::ptrace;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::convert::TryInto;
use std::fs::File;
use std::io;
use std::mem;
use std::os::unix::fs::FileExt;

const WORD: usize = mem::size_of::<usize>();

/// Attach-on-demand guard. Memory operations first try without tracing;
/// when that fails the guard attaches, waits for the target to stop, and
/// detaches again when dropped.
struct Attachment {
    pid: Pid,
    attached: bool,
}

impl Attachment {
    fn new(pid: Pid) -> Attachment {
        Attachment {
            pid,
            attached: false,
        }
    }

    fn ensure(&mut self) -> Result<()> {
        if self.attached {
            return Ok(());
        }
        ptrace::attach(self.pid).map_err(Error::TraceAttach)?;
        waitpid(self.pid, None).map_err(|e| Error::RemoteIo(nix_to_io(e)))?;
        self.attached = true;
        Ok(())
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if self.attached {
            let _ = ptrace::detach(self.pid, None);
        }
    }
}

fn read_mem_file(pid: pid_t, buf: &mut [u8], addr: u64) -> io::Result<()> {
    let f = File::open(format!("/proc/{}/mem", pid))?;
    let mut done = 0;
    while done < buf.len() {
        let n = f.read_at(&mut buf[done..], addr + done as u64)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read from process memory",
            ));
        }
        done += n;
    }
    Ok(())
}

fn peek(pid: Pid, addr: u64) -> nix::Result<usize> {
    ptrace::read(pid, addr as ptrace::AddressType).map(|w| w as usize)
}

fn poke(pid: Pid, addr: u64, word: usize) -> nix::Result<()> {
    unsafe { ptrace::write(pid, addr as ptrace::AddressType, word as *mut c_void) }
}

/// Read `buf.len()` bytes from `addr` in the address space of `pid`.
///
/// Bulk reads go through the kernel's process-memory file; when that is
/// refused (typically because the caller is not yet the target's tracer)
/// the target is attached, the read retried, and the target detached.
pub fn process_read(pid: pid_t, buf: &mut [u8], addr: u64) -> Result<()> {
    if read_mem_file(pid, buf, addr).is_ok() {
        return Ok(());
    }

    let mut att = Attachment::new(Pid::from_raw(pid));
    att.ensure()?;
    read_mem_file(pid, buf, addr).map_err(Error::RemoteIo)
}

/// Write `buf` to `addr` in the address space of `pid`, without regard
/// to page protection.
///
/// Writes go word-at-a-time through `PTRACE_POKEDATA`. A length that is
/// not a word multiple reads the trailing word first, merges the tail
/// bytes in, and writes the merged word back. Like reads, the operation
/// auto-attaches on the first refusal and detaches when done.
pub fn process_write(pid: pid_t, buf: &[u8], addr: u64) -> Result<()> {
    let p = Pid::from_raw(pid);
    let mut att = Attachment::new(p);

    let mut offset = 0usize;
    while buf.len() - offset >= WORD {
        let word = usize::from_ne_bytes(buf[offset..offset + WORD].try_into().unwrap());
        let at = addr + offset as u64;
        if poke(p, at, word).is_err() {
            att.ensure()?;
            poke(p, at, word).map_err(|e| Error::RemoteIo(nix_to_io(e)))?;
        }
        offset += WORD;
    }

    let rest = buf.len() - offset;
    if rest > 0 {
        let at = addr + offset as u64;
        let current = match peek(p, at) {
            Ok(w) => w,
            Err(_) => {
                att.ensure()?;
                peek(p, at).map_err(|e| Error::RemoteIo(nix_to_io(e)))?
            }
        };
        let mut word = current.to_ne_bytes();
        word[..rest].copy_from_slice(&buf[offset..]);
        let merged = usize::from_ne_bytes(word);
        if poke(p, at, merged).is_err() {
            att.ensure()?;
            poke(p, at, merged).map_err(|e| Error::RemoteIo(nix_to_io(e)))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_own_memory() {
        let me = std::process::id() as pid_t;
        let local: [u8; 16] = *b"0123456789abcdef";
        let mut copy = [0u8; 16];
        process_read(me, &mut copy, local.as_ptr() as u64).unwrap();
        assert_eq!(copy, local);
    }

    #[test]
    fn read_unmapped_address_fails() {
        let me = std::process::id() as pid_t;
        let mut buf = [0u8; 8];
        // Non-canonical/never-mapped address; the mem-file read fails and
        // the fallback cannot attach to ourselves.
        assert!(process_read(me, &mut buf, 0x10).is_err());
    }
}
