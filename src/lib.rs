//! infernopatch - patches the dyld shared cache for devices without a
//! working GPU.
//!
//! The patcher rewrites selected ARM64 instructions inside system library
//! images so that software rendering is used instead of the missing
//! hardware, shader preloading is neutralised, and baseband expectations
//! are silenced. It operates offline on extracted cache files; every
//! modification is journalled so it can be fully reverted.
//!
//! # Architecture
//!
//! - [`cache`] parses the dyld cache container (main, sub and symbols
//!   files) and resolves images, symbols and Objective-C classes to VM
//!   addresses
//! - [`arm64`] encodes the small instruction set the patches need and
//!   scans code for patch anchors
//! - [`patcher`] batches writes per file and commits them with an
//!   original-bytes sidecar enabling revert
//! - [`patches`] composes the three into the built-in patch set
//!
//! # Example
//!
//! ```no_run
//! use infernopatch::{CacheAnalyser, ImageMatcher, Patcher, Result};
//!
//! fn main() -> Result<()> {
//!     let analyser = CacheAnalyser::open("/path/to/dyld_shared_cache_arm64")?;
//!
//!     let image = analyser.find_image(&ImageMatcher::Framework("CoreImage"), false)?;
//!     let addr = image.resolve_sym(&["_CIGLIsUsable"])?;
//!     println!("{addr:#x}");
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arm64;
pub mod bits;
pub mod cache;
pub mod error;
pub mod macho;
pub mod patcher;
pub mod patches;
pub mod reader;

// Re-export main types
pub use cache::{CacheAnalyser, CacheEntry, CacheHeader, Image, ImageMatcher};
pub use error::{Error, Result};
pub use patcher::Patcher;
