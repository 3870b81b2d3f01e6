//! Runtime code injection and function interposition for x86-64 Linux.
//!
//! The toolkit attaches to an unrelated running process, loads shared
//! objects into it, calls arbitrary functions inside it with
//! caller-supplied arguments, and rewrites function prologues so that
//! calls divert to a replacement while the original stays reachable
//! through a generated trampoline.
//!
//! The pieces, leaves first:
//!
//! - [`util`]: external-tool capture and `pid`/`user/name` resolution.
//! - [`address_space`]: `/proc/<pid>/maps` and ELF load information.
//! - [`symbols`]: symbol and dynamic-relocation lookup in image files.
//! - [`disasm`]: the objdump bridge producing instruction records.
//! - [`remote_mem`]: reads and writes into another address space.
//! - [`remote_call`]: breakpoint-based synchronous remote calls under
//!   the System V AMD64 ABI.
//! - [`injection`]: `dlopen`/`dlclose` of shared objects in a target.
//! - [`interpose`]: trampoline-based inline hooks in the own process.
//! - [`symtab`]: a cache resolving remote addresses to symbols.
//!
//! Remote operations assume exclusive ownership of the target: the
//! target is stopped for the duration of every call, and no two remote
//! calls may overlap on the same pid.

pub mod address_space;
pub mod disasm;
pub mod error;
pub mod injection;
pub mod interpose;
pub mod remote_call;
pub mod remote_mem;
pub mod symbols;
pub mod symtab;
pub mod util;

pub use crate::error::{Error, Result};
