use crate::error::{Error, Result};
use crate::remote_mem;
use bitflags::bitflags;
use goblin::elf::program_header::{PF_R, PF_X, PT_LOAD};
use goblin::elf::Elf;
use goblin::elf::header::{EI_CLASS, ELFCLASS64};
use goblin::elf64::header::{Header, SIZEOF_EHDR};
use goblin::elf64::program_header::ProgramHeader as ProgramHeader64;
use libc::pid_t;
use log::debug;
use std::fs;

bitflags! {
    /// Permission bits of one `/proc/<pid>/maps` entry.
    pub struct MapPerms: u8 {
        const READ    = 0b0001;
        const WRITE   = 0b0010;
        const EXEC    = 0b0100;
        const PRIVATE = 0b1000;
    }
}

/// One line of the kernel's per-process map file.
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub perms: MapPerms,
    pub offset: u64,
    /// Path of the backing file, if any. May contain spaces.
    pub path: Option<String>,
    /// The kernel tagged the backing file as `(deleted)`.
    pub deleted: bool,
}

/// A mapping resolved back to its image and the image's load base.
#[derive(Debug, Clone)]
pub struct ImageMapping {
    pub path: String,
    /// Virtual address at which file offset 0 of the image would lie.
    pub base: u64,
    pub range_start: u64,
    pub range_end: u64,
}

/// Parse one maps line. The first five fields are whitespace-tokenized;
/// everything after the inode column is the path, which may itself
/// contain spaces, so it is taken as-is and only trimmed.
fn parse_maps_line(line: &str) -> Option<MapEntry> {
    let mut fields = line.splitn(6, ' ');
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let rest = fields.next().unwrap_or("");

    let dash = range.find('-')?;
    let start = u64::from_str_radix(&range[..dash], 16).ok()?;
    let end = u64::from_str_radix(&range[dash + 1..], 16).ok()?;
    let offset = u64::from_str_radix(offset, 16).ok()?;

    let perms_bytes = perms.as_bytes();
    if perms_bytes.len() < 4 {
        return None;
    }
    let mut p = MapPerms::empty();
    if perms_bytes[0] == b'r' {
        p |= MapPerms::READ;
    }
    if perms_bytes[1] == b'w' {
        p |= MapPerms::WRITE;
    }
    if perms_bytes[2] == b'x' {
        p |= MapPerms::EXEC;
    }
    if perms_bytes[3] == b'p' {
        p |= MapPerms::PRIVATE;
    }

    let mut path = rest.trim();
    let deleted = path.ends_with("(deleted)");
    if deleted {
        path = path[..path.len() - "(deleted)".len()].trim_end();
    }

    Some(MapEntry {
        start,
        end,
        perms: p,
        offset,
        path: if path.is_empty() {
            None
        } else {
            Some(path.to_owned())
        },
        deleted,
    })
}

/// Read and parse the map file of `pid`.
pub fn read_maps(pid: pid_t) -> Result<Vec<MapEntry>> {
    let raw = fs::read_to_string(format!("/proc/{}/maps", pid)).map_err(Error::RemoteIo)?;
    Ok(raw.lines().filter_map(parse_maps_line).collect())
}

/// Amount the first readable-executable LOAD segment of `image` is
/// shifted up from its own file offset, i.e. `vaddr - offset`.
fn load_bias_from_file(image: &str) -> u64 {
    let bytes = match fs::read(image) {
        Ok(b) => b,
        Err(e) => {
            debug!("cannot read {} for load bias: {}", image, e);
            return 0;
        }
    };
    let elf = match Elf::parse(&bytes) {
        Ok(e) => e,
        Err(e) => {
            debug!("cannot parse {}: {}", image, e);
            return 0;
        }
    };
    for ph in &elf.program_headers {
        if ph.p_type == PT_LOAD && ph.p_flags & PF_R != 0 && ph.p_flags & PF_X != 0 {
            return ph.p_vaddr.wrapping_sub(ph.p_offset);
        }
    }
    0
}

/// Base address of the image behind a mapping: back out the part of the
/// file the mapping starts at, then the segment's own vaddr/offset
/// shift. For old-style images whose executable segment covers file
/// offset 0 this degenerates to `start - (vaddr - offset)`; the extra
/// term keeps the result right for split-segment layouts where the
/// executable mapping begins deeper into the file.
fn image_base_of(entry: &MapEntry, path: &str) -> u64 {
    entry
        .start
        .wrapping_sub(entry.offset)
        .wrapping_sub(load_bias_from_file(path))
}

/// Find the first readable-executable, non-deleted mapping whose backing
/// path contains `image_name`, and return `(path, image_base)`. The base
/// is the mapping start corrected by the image's own load bias.
pub fn find_image_address(pid: pid_t, image_name: &str) -> Result<(String, u64)> {
    for entry in read_maps(pid)? {
        if !entry.perms.contains(MapPerms::READ | MapPerms::EXEC) || entry.deleted {
            continue;
        }
        let path = match &entry.path {
            Some(p) if p.contains(image_name) => p.clone(),
            _ => continue,
        };
        let base = image_base_of(&entry, &path);
        return Ok((path, base));
    }
    Err(Error::NotFound(format!(
        "image containing \"{}\" in process {}",
        image_name, pid
    )))
}

/// Find the mapping of `pid` whose `[start, end)` range contains
/// `address`, and resolve it back to its image and image base.
pub fn find_image_for_address(pid: pid_t, address: u64) -> Result<ImageMapping> {
    for entry in read_maps(pid)? {
        if !(entry.start <= address && address < entry.end) || entry.deleted {
            continue;
        }
        let path = match entry.path.clone() {
            Some(p) => p,
            None => continue,
        };
        let base = image_base_of(&entry, &path);
        return Ok(ImageMapping {
            path,
            base,
            range_start: entry.start,
            range_end: entry.end,
        });
    }
    Err(Error::NotFound(format!(
        "mapping containing {:#x} in process {}",
        address, pid
    )))
}

/// Interpret the ELF header mapped at `elf_header_addr` inside `pid` and
/// return the image base derived from its program headers: the LOAD
/// segment covering file offset 0, or the first LOAD segment when none
/// covers offset 0 exactly.
pub fn find_image_load_information(pid: pid_t, elf_header_addr: u64) -> Result<u64> {
    let mut hdr_bytes = [0u8; SIZEOF_EHDR];
    remote_mem::process_read(pid, &mut hdr_bytes, elf_header_addr)?;
    let header = Header::from_bytes(&hdr_bytes);

    if header.e_ident[EI_CLASS] != ELFCLASS64 {
        return Err(Error::NotFound(format!(
            "64-bit ELF image at {:#x} in process {} (class {})",
            elf_header_addr, pid, header.e_ident[EI_CLASS]
        )));
    }

    let phnum = header.e_phnum as usize;
    let mut ph_bytes = vec![0u8; phnum * header.e_phentsize as usize];
    remote_mem::process_read(pid, &mut ph_bytes, elf_header_addr + header.e_phoff)?;
    let phdrs = ProgramHeader64::from_bytes(&ph_bytes, phnum);

    let mut first_load = None;
    for ph in &phdrs {
        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.p_offset == 0 {
            return Ok(elf_header_addr - ph.p_vaddr);
        }
        if first_load.is_none() {
            first_load = Some(elf_header_addr - (ph.p_vaddr - ph.p_offset));
        }
    }

    first_load.ok_or_else(|| {
        Error::NotFound(format!(
            "LOAD segment of image at {:#x} in process {}",
            elf_header_addr, pid
        ))
    })
}

/// Entry point of the main executable of `pid`, read from the process's
/// own memory: `e_entry` plus the image base.
pub fn find_process_entry_point(pid: pid_t) -> Result<u64> {
    let exe = fs::canonicalize(format!("/proc/{}/exe", pid)).map_err(Error::RemoteIo)?;
    let exe = exe.to_string_lossy().into_owned();

    // The ELF header lives wherever file offset 0 of the executable is
    // mapped.
    let header_addr = read_maps(pid)?
        .into_iter()
        .find(|m| m.offset == 0 && m.path.as_deref() == Some(exe.as_str()))
        .map(|m| m.start)
        .ok_or_else(|| Error::NotFound(format!("header mapping of {} in process {}", exe, pid)))?;

    let mut hdr_bytes = [0u8; SIZEOF_EHDR];
    remote_mem::process_read(pid, &mut hdr_bytes, header_addr)?;
    let e_entry = Header::from_bytes(&hdr_bytes).e_entry;

    let base = find_image_load_information(pid, header_addr)?;
    Ok(base + e_entry)
}
