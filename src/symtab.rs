//! Address-to-symbol resolution with caching.
//!
//! Translating an address in a remote process to `(symbol, address)`
//! costs a maps walk plus a full symbol-table enumeration. This cache
//! makes repeat queries cheap: one ordered index maps each pid to the
//! mappings seen in it, another maps each image path to that image's
//! symbols keyed by offset. Nearest-predecessor queries over the ordered
//! indexes do the actual resolution. Once an image's symbols are cached
//! they are treated as stable for the life of the cache.

use crate::address_space::find_image_for_address;
use crate::error::{Error, Result};
use crate::symbols::enumerate_symbols;
use libc::pid_t;
use std::collections::BTreeMap;

/// A mapping of one process, as cached: its range and the image behind
/// it.
#[derive(Debug, Clone)]
struct CachedMapping {
    start: u64,
    end: u64,
    image_base: u64,
    image_path: String,
}

/// Per-image symbol table: offset from the image base, keyed for
/// nearest-predecessor search. Duplicate offsets keep the last symbol
/// enumerated, matching the resolver's tie-break.
type SymbolIndex = BTreeMap<u64, String>;

/// Per-process mapping table keyed by range start.
type MappingIndex = BTreeMap<u64, CachedMapping>;

#[derive(Default)]
pub struct SymtabCache {
    mappings: BTreeMap<pid_t, MappingIndex>,
    symbols: BTreeMap<String, SymbolIndex>,
}

impl SymtabCache {
    pub fn new() -> SymtabCache {
        SymtabCache::default()
    }

    /// The cached mapping of `pid` containing `address`, querying the
    /// kernel and caching the result on a miss.
    fn mapping_for_address(&mut self, pid: pid_t, address: u64) -> Result<CachedMapping> {
        let table = self.mappings.entry(pid).or_insert_with(MappingIndex::new);

        if let Some((_, m)) = table.range(..=address).next_back() {
            if m.start <= address && address <= m.end {
                return Ok(m.clone());
            }
        }

        let img = find_image_for_address(pid, address)?;
        let mapping = CachedMapping {
            start: img.range_start,
            end: img.range_end,
            image_base: img.base,
            image_path: img.path,
        };
        table.insert(mapping.start, mapping.clone());
        Ok(mapping)
    }

    /// The symbol index of `image`, populated from its file on first
    /// use.
    fn symbols_for_image(&mut self, image: &str) -> Result<&SymbolIndex> {
        if !self.symbols.contains_key(image) {
            let mut index = SymbolIndex::new();
            for sym in enumerate_symbols(image)? {
                index.insert(sym.offset, sym.name);
            }
            self.symbols.insert(image.to_owned(), index);
        }
        Ok(&self.symbols[image])
    }

    /// Resolve `address` in `pid` to the name of the nearest symbol at
    /// or below it and that symbol's exact address.
    pub fn find_symbol_for_address(&mut self, pid: pid_t, address: u64) -> Result<(String, u64)> {
        let mapping = self.mapping_for_address(pid, address)?;
        let base = mapping.image_base;
        let symbols = self.symbols_for_image(&mapping.image_path)?;

        let offset = address - base;
        match symbols.range(..=offset).next_back() {
            Some((&sym_offset, name)) => Ok((name.clone(), base + sym_offset)),
            None => Err(Error::NotFound(format!(
                "symbol below {:#x} in {}",
                address, mapping.image_path
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // An unmangled probe with a known name at a known address in the
    // test binary itself.
    #[no_mangle]
    extern "C" fn symtab_cache_probe() -> u32 {
        0x5ca1ab1e
    }

    #[test]
    fn own_symbol_resolves_exactly() {
        let me = std::process::id() as pid_t;
        let addr = symtab_cache_probe as usize as u64;

        let mut cache = SymtabCache::new();
        let (name, sym_addr) = cache.find_symbol_for_address(me, addr).unwrap();
        assert_eq!(name, "symtab_cache_probe");
        assert_eq!(sym_addr, addr);
    }

    #[test]
    fn interior_address_reports_the_same_symbol() {
        let me = std::process::id() as pid_t;
        let addr = symtab_cache_probe as usize as u64;

        let mut cache = SymtabCache::new();
        let (name, sym_addr) = cache.find_symbol_for_address(me, addr + 3).unwrap();
        assert_eq!(name, "symtab_cache_probe");
        assert_eq!(addr + 3 - sym_addr, 3);
    }

    #[test]
    fn cached_queries_are_stable() {
        let me = std::process::id() as pid_t;
        let addr = symtab_cache_probe as usize as u64;

        let mut warm = SymtabCache::new();
        let first = warm.find_symbol_for_address(me, addr).unwrap();
        let second = warm.find_symbol_for_address(me, addr).unwrap();
        assert_eq!(first, second);

        let mut fresh = SymtabCache::new();
        assert_eq!(fresh.find_symbol_for_address(me, addr).unwrap(), first);
    }

    #[test]
    fn unmapped_address_is_not_found() {
        let me = std::process::id() as pid_t;
        let mut cache = SymtabCache::new();
        assert!(cache.find_symbol_for_address(me, 0x10).is_err());
    }
}
