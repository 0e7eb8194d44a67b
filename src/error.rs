/*  file:       error.rs
    desc:       Error type for the whole pipeline. Domain failures are
                explicit kinds; only internal invariant violations panic.
 */

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no readable+writable segment in the target binary")]
    WritableRegionNotFound,

    #[error("unable to load requested registers: {0}")]
    UnsatisfiableRegisterSet(String),

    #[error("kernel clobber dependencies form a cycle, cannot order chain")]
    CyclicKernelDependency,

    #[error("assembled chain does not set the requested registers")]
    ChainVerificationFailed,

    #[error("unsupported architecture for chain building")]
    UnsupportedArch,

    #[error("object parse error: {0}")]
    Parse(#[from] object::Error),

    #[error("disassembly error: {0}")]
    Disasm(#[from] capstone::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
