use crate::address_space::find_image_address;
use crate::error::{Error, Result};
use crate::remote_call::call_function_in_target;
use crate::remote_mem::process_write;
use crate::symbols::find_libc_function;
use libc::{pid_t, MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE, RTLD_NOW};
use log::debug;
use std::fs;
use std::io;
use std::path::Path;

/// glibc's private "this is a real dlopen" bit; the loader's internal
/// entry points refuse a mode without it.
const RTLD_DLOPEN: u64 = 0x8000_0000;

fn canonical_path_bytes(filename: &Path) -> Result<Vec<u8>> {
    let resolved = fs::canonicalize(filename)
        .map_err(|e| Error::NotFound(format!("{}: {}", filename.display(), e)))?;
    let mut bytes = resolved.to_string_lossy().into_owned().into_bytes();
    bytes.push(0);
    Ok(bytes)
}

/// Load a shared object into a running process and return the handle the
/// loader produced (zero when the load failed inside the target).
///
/// The path string is staged in the target through an injected `mmap`,
/// `__libc_dlopen_mode` is invoked on it, and the staging buffer is
/// released again with `munmap`.
pub fn inject_so(pid: pid_t, filename: &Path) -> Result<u64> {
    let path = canonical_path_bytes(filename)?;
    let len = path.len() as u64;

    let remote_mmap = find_libc_function(pid, "mmap")?;
    let remote_dlopen = find_libc_function(pid, "__libc_dlopen_mode")?;
    let remote_munmap = find_libc_function(pid, "munmap")?;

    let name_addr = call_function_in_target(
        pid,
        remote_mmap,
        &[
            0,
            len,
            (PROT_READ | PROT_WRITE) as u64,
            (MAP_PRIVATE | MAP_ANONYMOUS) as u64,
            0,
            0,
        ],
    )?;
    if name_addr == 0 || name_addr == u64::max_value() {
        return Err(Error::RemoteIo(io::Error::new(
            io::ErrorKind::Other,
            "remote mmap failed",
        )));
    }

    process_write(pid, &path, name_addr)?;

    let handle = call_function_in_target(
        pid,
        remote_dlopen,
        &[name_addr, RTLD_NOW as u64 | RTLD_DLOPEN],
    )?;
    debug!("dlopen of {:?} in {} returned {:#x}", filename, pid, handle);

    call_function_in_target(pid, remote_munmap, &[name_addr, len])?;

    Ok(handle)
}

/// Unload a shared object previously loaded with `inject_so`. Returns
/// the remote `dlclose` result: zero on success.
pub fn uninject_so(pid: pid_t, handle: u64) -> Result<u64> {
    let remote_dlclose = find_libc_function(pid, "__libc_dlclose")?;
    call_function_in_target(pid, remote_dlclose, &[handle])
}

/// Unload a shared object by its file path.
///
/// The image must already be present in the target. Loading it once more
/// yields a handle for it, at the cost of a second loader reference;
/// closing that handle twice drops both the scratch reference and the
/// original one.
pub fn uninject_so_by_path(pid: pid_t, filename: &Path) -> Result<u64> {
    let resolved = fs::canonicalize(filename)
        .map_err(|e| Error::NotFound(format!("{}: {}", filename.display(), e)))?;
    find_image_address(pid, &resolved.to_string_lossy())?;

    let handle = inject_so(pid, filename)?;
    uninject_so(pid, handle)?;
    uninject_so(pid, handle)
}
