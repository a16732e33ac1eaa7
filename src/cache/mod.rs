//! Dyld shared cache handling.
//!
//! This module parses the cache container format and navigates it: header
//! flavours for the main, sub and symbols files, VM address translation,
//! and the analyser that resolves images, symbols and Objective-C classes
//! across the whole file set.
//!
//! # Cache Structure
//!
//! A dyld shared cache consists of:
//! - A header with mappings, the image table and (on split caches) the
//!   sub-cache table
//! - Sub-caches: `dyld_shared_cache_arm64e.1`, `.2`, ... or
//!   `.01.dylddata`-style suffixes, depending on the header revision
//! - An optional `.symbols` file carrying the unstripped local symbols

mod context;
mod structs;

pub use context::*;
pub use structs::*;
