use crate::address_space::find_image_address;
use crate::error::{Error, Result};
use goblin::elf::Elf;
use libc::pid_t;
use std::fs;

/// A named symbol at an offset from its image's base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name: String,
    pub offset: u64,
}

/// Enumerate the union of the static and dynamic symbol tables of an
/// image file, static table first. Callers that resolve duplicates by
/// taking the last occurrence therefore prefer the dynamic table, which
/// is what code injected into a live process expects.
pub fn enumerate_symbols(image: &str) -> Result<Vec<SymbolEntry>> {
    let bytes =
        fs::read(image).map_err(|e| Error::NotFound(format!("image {}: {}", image, e)))?;
    let elf =
        Elf::parse(&bytes).map_err(|e| Error::NotFound(format!("image {}: {}", image, e)))?;

    let mut out = Vec::new();
    for sym in elf.syms.iter() {
        if let Some(Ok(name)) = elf.strtab.get(sym.st_name) {
            if !name.is_empty() {
                out.push(SymbolEntry {
                    name: name.to_owned(),
                    offset: sym.st_value,
                });
            }
        }
    }
    for sym in elf.dynsyms.iter() {
        if let Some(Ok(name)) = elf.dynstrtab.get(sym.st_name) {
            if !name.is_empty() {
                out.push(SymbolEntry {
                    name: name.to_owned(),
                    offset: sym.st_value,
                });
            }
        }
    }
    Ok(out)
}

/// Enumerate the dynamic relocations of an image file as
/// `(symbol name, slot offset)` pairs.
pub fn enumerate_relocations(image: &str) -> Result<Vec<SymbolEntry>> {
    let bytes =
        fs::read(image).map_err(|e| Error::NotFound(format!("image {}: {}", image, e)))?;
    let elf =
        Elf::parse(&bytes).map_err(|e| Error::NotFound(format!("image {}: {}", image, e)))?;

    let mut out = Vec::new();
    {
        let mut push = |r_sym: usize, r_offset: u64| {
            if let Some(sym) = elf.dynsyms.get(r_sym) {
                if let Some(Ok(name)) = elf.dynstrtab.get(sym.st_name) {
                    if !name.is_empty() {
                        out.push(SymbolEntry {
                            name: name.to_owned(),
                            offset: r_offset,
                        });
                    }
                }
            }
        };
        for r in elf.dynrelas.iter() {
            push(r.r_sym, r.r_offset);
        }
        for r in elf.dynrels.iter() {
            push(r.r_sym, r.r_offset);
        }
        for r in elf.pltrelocs.iter() {
            push(r.r_sym, r.r_offset);
        }
    }
    Ok(out)
}

/// Last-wins exact-name search over an enumeration; an offset of zero is
/// treated as absent, matching what injected code observes.
fn last_match(entries: &[SymbolEntry], name: &str) -> Option<u64> {
    let mut found = 0u64;
    for e in entries {
        if e.name == name {
            found = e.offset;
        }
    }
    if found == 0 {
        None
    } else {
        Some(found)
    }
}

/// Find a named function inside an image of a process. The image is the
/// first readable-executable mapping whose path contains `image_name`;
/// the returned address is the image base plus the symbol's offset,
/// alongside the image's full path.
pub fn find_function(pid: pid_t, image_name: &str, func: &str) -> Result<(u64, String)> {
    let (path, base) = find_image_address(pid, image_name)?;
    let syms = enumerate_symbols(&path)?;
    match last_match(&syms, func) {
        Some(off) => Ok((base + off, path)),
        None => Err(Error::NotFound(format!("symbol {} in {}", func, path))),
    }
}

/// Find the dynamic-relocation slot for a named symbol inside an image
/// of a process. The returned address is of the pointer-sized slot the
/// dynamic linker fills in, not of the symbol itself.
pub fn find_relocation(pid: pid_t, image_name: &str, func: &str) -> Result<u64> {
    let (path, base) = find_image_address(pid, image_name)?;
    let relocs = enumerate_relocations(&path)?;
    match last_match(&relocs, func) {
        Some(off) => Ok(base + off),
        None => Err(Error::NotFound(format!("relocation {} in {}", func, path))),
    }
}

/// `find_function` scoped to the C library of the process.
pub fn find_libc_function(pid: pid_t, func: &str) -> Result<u64> {
    find_function(pid, "/libc", func).map(|(addr, _)| addr)
}
