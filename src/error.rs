use std::fmt;
use std::io;

/// The failure kinds surfaced by the toolkit core.
///
/// Most operations fail softly: the caller gets the error, the target is
/// detached and keeps running. The one exception is `TargetCorrupted`,
/// which means an injected call faulted inside the target; the remote
/// state is unrecoverable and controllers are expected to exit nonzero.
#[derive(Debug)]
pub enum Error {
    /// An image, symbol, relocation slot or process could not be located.
    NotFound(String),
    /// Reading or writing the target's address space failed, even after
    /// the transparent attach retry.
    RemoteIo(io::Error),
    /// The target could not be attached to.
    TraceAttach(nix::Error),
    /// The prologue of an interpose target contains a PC-relative,
    /// branching or looping instruction that cannot be relocated.
    UnrelocatablePrologue {
        address: u64,
        mnemonic: String,
        operands: String,
    },
    /// Fewer than the required bytes of straight-line instructions were
    /// found at an interpose target.
    PrologueTooShort { copied: usize },
    /// The target raised a memory, illegal-instruction or arithmetic
    /// fault while executing an injected call.
    TargetCorrupted { signal: i32 },
    /// The external disassembler failed or produced no parseable output.
    ToolFailure(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotFound(what) => write!(f, "not found: {}", what),
            Error::RemoteIo(e) => write!(f, "remote memory access failed: {}", e),
            Error::TraceAttach(e) => write!(f, "cannot attach to target: {}", e),
            Error::UnrelocatablePrologue {
                address,
                mnemonic,
                operands,
            } => write!(
                f,
                "PC dependent instruction at {:#x}: {} {}",
                address, mnemonic, operands
            ),
            Error::PrologueTooShort { copied } => write!(
                f,
                "not enough room to add jump, only room for {} bytes",
                copied
            ),
            Error::TargetCorrupted { signal } => write!(
                f,
                "signal {} in attempted injection function call",
                signal
            ),
            Error::ToolFailure(what) => write!(f, "external tool failure: {}", what),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::RemoteIo(e) => Some(e),
            Error::TraceAttach(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::RemoteIo(e)
    }
}

/// Lower a `nix` error to the `io::Error` carried by `RemoteIo`.
pub(crate) fn nix_to_io(e: nix::Error) -> io::Error {
    match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e),
    }
}
