//! Mach-O binary structures and constants.
//!
//! Fixed-layout records are designed for zero-copy parsing with the
//! `zerocopy` crate.

use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::bits::extract32;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian). The cache only ever contains these.
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

// =============================================================================
// Load Commands
// =============================================================================

/// Link-edit symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// 64-bit segment of this file
pub const LC_SEGMENT_64: u32 = 0x19;

// =============================================================================
// Symbol Table
// =============================================================================

/// The LC_SYMTAB command payload.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SymtabCommand {
    /// File offset to the nlist array (LINKEDIT-relative in the cache)
    pub sym_off: u32,
    /// Number of nlist entries
    pub sym_count: u32,
    /// File offset to the string table
    pub str_off: u32,
    /// Size of the string table
    pub str_size: u32,
}

/// A Mach-O symbol table entry.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct NList {
    /// Index into the string table
    pub strx: u32,
    /// Packed type flags (ext/type/pext/stab)
    pub type_flags: u8,
    /// Section number
    pub sect: u8,
    /// Description field
    pub desc: u16,
    /// Symbol value (VM address for section symbols)
    pub value: u64,
}

/// The `type` field value for a symbol defined in a section.
pub const N_TYPE_SECTION: u32 = 0x7;

impl NList {
    /// Size of an nlist_64 record on disk.
    pub const SIZE: usize = 16;

    /// Returns the 3-bit symbol type (bits 1..3 of the type flags).
    #[inline]
    pub fn sym_type(&self) -> u32 {
        extract32(self.type_flags as u32, 1, 3)
    }

    /// Returns true if this is an external symbol (bit 0).
    #[inline]
    pub fn is_ext(&self) -> bool {
        extract32(self.type_flags as u32, 0, 1) != 0
    }

    /// Returns true if this is a private external symbol (bit 4).
    #[inline]
    pub fn is_pext(&self) -> bool {
        extract32(self.type_flags as u32, 4, 1) != 0
    }

    /// Returns the 3-bit debug (stab) field (bits 5..7).
    #[inline]
    pub fn stab(&self) -> u32 {
        extract32(self.type_flags as u32, 5, 3)
    }
}
