//! Error types for cache parsing, instruction encoding and patching.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all patcher operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Range Errors ====================
    #[error("read of {len} bytes at offset {offset:#x} is out of bounds (size: {size:#x})")]
    ReadOutOfBounds { offset: u64, len: usize, size: u64 },

    #[error("seek to offset {offset:#x} is out of bounds (size: {size:#x})")]
    SeekOutOfBounds { offset: i64, size: u64 },

    #[error("address {addr:#x} not found in any cache mapping")]
    AddressNotFound { addr: u64 },

    #[error("image `{name}` not found")]
    ImageNotFound { name: String },

    #[error("cannot find `{name}` segment")]
    SegmentNotFound { name: String },

    #[error("cannot find `{segment},{section}` section")]
    SectionNotFound { segment: String, section: String },

    #[error("symbol `{name}` not found")]
    SymbolNotFound { name: String },

    #[error("Objective-C class `{name}` not found")]
    ObjcClassNotFound { name: String },

    #[error(
        "no {what} instruction found start_addr={start_addr:#x} rev={rev} inst_limit={inst_limit:#x}"
    )]
    ScanExhausted {
        what: &'static str,
        start_addr: u64,
        rev: bool,
        inst_limit: u32,
    },

    // ==================== Format Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("main cache expected, but got a subcache")]
    MainCacheExpected,

    #[error("stumbled upon {kind} pointer ({value:#x})")]
    UnsupportedFixup { kind: &'static str, value: u64 },

    #[error("malformed revert file '{path}': {reason}")]
    MalformedSidecar { path: PathBuf, reason: String },

    // ==================== Encoding Errors ====================
    #[error("cannot have a shift for wide movz")]
    WideMovzShift,

    #[error("invalid imm for adrp")]
    AdrpImmOutOfRange,

    #[error("invalid imm for add")]
    AddImmOutOfRange,

    #[error("target too far away")]
    AdrpTargetTooFar,
}

/// A specialized Result type for patcher operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error indicates a version-dependent lookup miss.
    ///
    /// Symbol and class lookups and instruction scans fail on OS versions
    /// that renamed or restructured the patched code; the driver downgrades
    /// these to warnings instead of aborting. All other errors are fatal.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::SymbolNotFound { .. }
                | Error::ObjcClassNotFound { .. }
                | Error::ScanExhausted { .. }
        )
    }
}
