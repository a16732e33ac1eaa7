//! Mach-O image handling.
//!
//! This module parses the 64-bit Mach-O headers embedded in the shared
//! cache: segments, sections and the symbol table command. Only the load
//! commands the patcher needs are materialized; everything else is skipped
//! losslessly via the command size.

mod context;
mod structs;

pub use context::*;
pub use structs::*;
