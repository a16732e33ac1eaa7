//! Parsed view of a Mach-O image header inside the cache.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::reader::Reader;

use super::structs::*;

/// A section within a segment.
///
/// Offsets are relative to the containing cache file, as laid down by the
/// shared cache builder.
#[derive(Debug, Clone)]
pub struct Section {
    /// Virtual memory address
    pub vm_addr: u64,
    /// Size in bytes
    pub vm_size: u64,
    /// File offset
    pub file_off: u32,
    /// Alignment as a power of two
    pub align: u32,
    /// Relocation table offset
    pub reloc_off: u32,
    /// Number of relocation entries
    pub reloc_count: u32,
    /// Section flags
    pub flags: u32,
}

/// A 64-bit segment and its sections, keyed by 16-byte truncated name.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Virtual memory address
    pub vm_addr: u64,
    /// Virtual memory size
    pub vm_size: u64,
    /// File offset
    pub file_off: u64,
    /// File size
    pub file_size: u64,
    /// Maximum memory protection
    pub max_prot: u32,
    /// Initial memory protection
    pub init_prot: u32,
    /// Segment flags
    pub flags: u32,
    /// Sections keyed by name
    pub sections: HashMap<String, Section>,
}

impl Segment {
    fn parse(reader: &mut Reader) -> Result<Self> {
        let vm_addr = reader.read_u64_le()?;
        let vm_size = reader.read_u64_le()?;
        let file_off = reader.read_u64_le()?;
        let file_size = reader.read_u64_le()?;
        let max_prot = reader.read_u32_le()?;
        let init_prot = reader.read_u32_le()?;
        let sect_count = reader.read_u32_le()?;
        let flags = reader.read_u32_le()?;

        let mut sections = HashMap::with_capacity(sect_count as usize);
        for _ in 0..sect_count {
            let sect_name = reader.read_cstr_n(16)?;
            // Skip the redundant segment name.
            reader.seek_by(16)?;
            let section = Section {
                vm_addr: reader.read_u64_le()?,
                vm_size: reader.read_u64_le()?,
                file_off: reader.read_u32_le()?,
                align: reader.read_u32_le()?,
                reloc_off: reader.read_u32_le()?,
                reloc_count: reader.read_u32_le()?,
                flags: reader.read_u32_le()?,
            };
            // reserved1..3
            reader.seek_by(12)?;
            sections.insert(sect_name, section);
        }

        Ok(Self {
            vm_addr,
            vm_size,
            file_off,
            file_size,
            max_prot,
            init_prot,
            flags,
            sections,
        })
    }

}

/// The parsed header of one image: segments and the symtab command.
#[derive(Debug, Clone)]
pub struct MachHeader {
    /// Magic value (always MH_MAGIC_64)
    pub magic: u32,
    /// CPU type
    pub cpu_type: u32,
    /// Segments keyed by name
    pub segments: HashMap<String, Segment>,
    /// LC_SYMTAB command, if the image carries one
    pub symtab: Option<SymtabCommand>,
}

impl MachHeader {
    /// Parses an image header from a reader positioned at its first byte.
    ///
    /// Rejects anything other than 64-bit little-endian Mach-O. Unknown load
    /// commands are skipped by reseeking to `command_start + cmdsize`.
    pub fn parse(reader: &mut Reader) -> Result<Self> {
        let magic = reader.read_u32_le()?;
        if magic != MH_MAGIC_64 {
            return Err(Error::InvalidMachoMagic(magic));
        }
        let cpu_type = reader.read_u32_le()?;

        // cpusubtype + filetype
        reader.seek_by(8)?;
        let ncmds = reader.read_u32_le()?;
        // sizeofcmds + flags + reserved
        reader.seek_by(12)?;

        let mut segments = HashMap::new();
        let mut symtab = None;

        for _ in 0..ncmds {
            let cmd = reader.read_u32_le()?;
            let cmdsize = reader.read_u32_le()?;
            let cmd_end = reader.position() + cmdsize.saturating_sub(8) as u64;

            match cmd {
                LC_SYMTAB => {
                    symtab = Some(SymtabCommand {
                        sym_off: reader.read_u32_le()?,
                        sym_count: reader.read_u32_le()?,
                        str_off: reader.read_u32_le()?,
                        str_size: reader.read_u32_le()?,
                    });
                }
                LC_SEGMENT_64 => {
                    let seg_name = reader.read_cstr_n(16)?;
                    segments.insert(seg_name, Segment::parse(reader)?);
                }
                _ => {}
            }

            reader.seek(cmd_end)?;
        }

        Ok(Self {
            magic,
            cpu_type,
            segments,
            symtab,
        })
    }

    /// Looks up a segment by name.
    pub fn find_segment(&self, name: &str) -> Result<&Segment> {
        self.segments
            .get(name)
            .ok_or_else(|| Error::SegmentNotFound {
                name: name.to_string(),
            })
    }

    /// Looks up a section by segment and section name.
    pub fn find_section(&self, seg_name: &str, sect_name: &str) -> Result<&Section> {
        self.find_segment(seg_name)?
            .sections
            .get(sect_name)
            .ok_or_else(|| Error::SectionNotFound {
                segment: seg_name.to_string(),
                section: sect_name.to_string(),
            })
    }
}
