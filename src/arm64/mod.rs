//! ARM64 instruction encoding, decoding and scanning.
//!
//! The patcher only ever emits a handful of instructions (MOVZ, NOP, RET,
//! ADRP+ADD, BLR) and scans for a few more (BL, CBZ, BLRAA/BLRAB), so this
//! is a micro-assembler rather than a general codec. All instructions are
//! 32-bit words stored little-endian.

use std::path::Path;

use crate::bits::{extract32, sign_extend32, test32};
use crate::cache::CacheHeader;
use crate::error::{Error, Result};
use crate::patcher::Patcher;
use crate::reader::Reader;

/// Size of one instruction word.
pub const INST_SIZE: u64 = 4;

/// Default number of instructions a scan walks before giving up.
pub const DEFAULT_INST_LIMIT: u32 = 0x400;

const NOP_INST: u32 = 0xD503201F;
const RET_INST: u32 = 0xD65F03C0;
const MOVZ_INST: u32 = 0x52800000;
const BL_INST: u32 = 0x94000000;
const BL_INST_MASK: u32 = 0xFC000000;
const CBZ_INST: u32 = 0x34000000;
const CBZ_INST_MASK: u32 = 0x7F000000;
const BLRA_INST: u32 = 0xD63F0800;
const BLRA_INST_MASK: u32 = 0xFEFFF800;
const ADRP_INST: u32 = 0x90000000;
const ADD_INST: u32 = 0x11000000;
const BLR_INST: u32 = 0xD63F0000;

/// Largest ADRP page displacement, in pages.
const ADRP_IMM_MAX: i32 = (1 << 20) - 1;

/// A general-purpose register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

/// MOVZ immediate shift amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum MovzShift {
    Shift0,
    Shift16,
    Shift32,
    Shift48,
}

/// ADD immediate shift amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum AddShift {
    Shift0,
    Shift12,
}

// =============================================================================
// Encoders
// =============================================================================

/// Encodes MOVZ. `wide` selects the X-register form, which cannot carry a
/// shift here.
pub fn movz(reg: Reg, wide: bool, imm: u16, shift: MovzShift) -> Result<u32> {
    if wide && shift != MovzShift::Shift0 {
        return Err(Error::WideMovzShift);
    }
    Ok(((wide as u32) << 31)
        | MOVZ_INST
        | ((shift as u32) << 21)
        | ((imm as u32) << 5)
        | reg as u32)
}

/// Encodes NOP.
pub fn nop() -> u32 {
    NOP_INST
}

/// Encodes RET.
pub fn ret() -> u32 {
    RET_INST
}

/// Encodes BLR through the given register.
pub fn blr(reg: Reg) -> u32 {
    BLR_INST | ((reg as u32) << 5)
}

/// Encodes ADRP with a signed page displacement.
pub fn adrp(page_off: i32, reg: Reg) -> Result<u32> {
    if page_off > ADRP_IMM_MAX || page_off < -ADRP_IMM_MAX {
        return Err(Error::AdrpImmOutOfRange);
    }
    let imm = page_off as u32;
    Ok(ADRP_INST | (extract32(imm, 0, 2) << 29) | (extract32(imm, 2, 19) << 5) | reg as u32)
}

/// Encodes ADD (immediate). The immediate must fit in 12 bits.
pub fn add_imm(imm: u16, wide: bool, src: Reg, dst: Reg, shift: AddShift) -> Result<u32> {
    if extract32(imm as u32, 12, 4) != 0 {
        return Err(Error::AddImmOutOfRange);
    }
    Ok(ADD_INST
        | ((wide as u32) << 31)
        | ((shift as u32) << 22)
        | ((imm as u32) << 10)
        | ((src as u32) << 5)
        | dst as u32)
}

/// Decodes the target address of a BL instruction at `inst_addr`.
pub fn disassemble_bl(inst_addr: u64, inst: u32) -> u64 {
    let imm = sign_extend32(extract32(inst, 0, 26), 25) as i32;
    inst_addr.wrapping_add((imm as i64 * INST_SIZE as i64) as u64)
}

// =============================================================================
// Scanners
// =============================================================================

/// Walks instructions from `start_addr`, invoking `matches` on each word.
///
/// In reverse mode the cursor rewinds two words after each read, producing
/// a walk in decreasing address order. Walking off the mapped data counts
/// as exhaustion, like running out of `inst_limit`.
fn scan(
    data: &[u8],
    header: &CacheHeader,
    start_addr: u64,
    rev: bool,
    inst_limit: u32,
    what: &'static str,
    mut matches: impl FnMut(u64, u32) -> bool,
) -> Result<u64> {
    let base = header.vm_addr_to_file_off(start_addr)?;
    let mut reader = Reader::new_at(data, base)?;
    for i in 0..inst_limit {
        let inst_addr = if rev {
            start_addr - u64::from(i) * INST_SIZE
        } else {
            start_addr + u64::from(i) * INST_SIZE
        };
        let Ok(inst) = reader.read_u32_le() else {
            break;
        };
        if rev && reader.seek_by(-(INST_SIZE as i64 * 2)).is_err() {
            break;
        }
        if matches(inst_addr, inst) {
            return Ok(inst_addr);
        }
    }
    Err(Error::ScanExhausted {
        what,
        start_addr,
        rev,
        inst_limit,
    })
}

/// Finds the first CBZ whose width bit equals `wide`.
pub fn find_cbz(
    data: &[u8],
    header: &CacheHeader,
    start_addr: u64,
    wide: bool,
    rev: bool,
    inst_limit: u32,
) -> Result<u64> {
    scan(data, header, start_addr, rev, inst_limit, "cbz", |_, inst| {
        (inst & CBZ_INST_MASK) == CBZ_INST && test32(inst, 31) == wide
    })
}

/// Finds the first BL, optionally requiring a specific branch target.
pub fn find_bl(
    data: &[u8],
    header: &CacheHeader,
    start_addr: u64,
    target_addr: Option<u64>,
    rev: bool,
    inst_limit: u32,
) -> Result<u64> {
    scan(
        data,
        header,
        start_addr,
        rev,
        inst_limit,
        "bl",
        |inst_addr, inst| {
            (inst & BL_INST_MASK) == BL_INST
                && target_addr.is_none_or(|target| disassemble_bl(inst_addr, inst) == target)
        },
    )
}

/// Like [`find_bl`], but returns the address just past the match.
pub fn find_bl_incr(
    data: &[u8],
    header: &CacheHeader,
    start_addr: u64,
    target_addr: Option<u64>,
    rev: bool,
    inst_limit: u32,
) -> Result<u64> {
    Ok(find_bl(data, header, start_addr, target_addr, rev, inst_limit)? + INST_SIZE)
}

/// Finds the first BLRAA/BLRAB with the given zero-modifier and key bits.
pub fn find_blra(
    data: &[u8],
    header: &CacheHeader,
    start_addr: u64,
    zero: bool,
    key_b: bool,
    rev: bool,
    inst_limit: u32,
) -> Result<u64> {
    scan(data, header, start_addr, rev, inst_limit, "blra", |_, inst| {
        (inst & BLRA_INST_MASK) == BLRA_INST
            && test32(inst, 24) == zero
            && test32(inst, 10) == key_b
    })
}

// =============================================================================
// Patch Writers
// =============================================================================

/// Emits instructions into the patch queue at VM addresses.
///
/// The `_incr` variants advance the caller's address cursor past what was
/// written, so sequences read like straight-line assembly.
pub struct Assembler<'p> {
    patcher: &'p mut Patcher,
}

impl<'p> Assembler<'p> {
    /// Creates an assembler writing into the given patch queue.
    pub fn new(patcher: &'p mut Patcher) -> Self {
        Self { patcher }
    }

    /// Returns the underlying patch queue, for raw (non-instruction) writes.
    pub fn patcher(&mut self) -> &mut Patcher {
        self.patcher
    }

    fn write_inst(
        &mut self,
        path: &Path,
        header: &CacheHeader,
        target: u64,
        inst: u32,
    ) -> Result<()> {
        let file_off = header.vm_addr_to_file_off(target)?;
        self.patcher.write(path, file_off, inst.to_le_bytes().to_vec());
        Ok(())
    }

    fn write_inst_incr(
        &mut self,
        path: &Path,
        header: &CacheHeader,
        target: &mut u64,
        inst: u32,
    ) -> Result<()> {
        self.write_inst(path, header, *target, inst)?;
        *target += INST_SIZE;
        Ok(())
    }

    /// Writes a MOVZ at `target`.
    pub fn write_movz(
        &mut self,
        path: &Path,
        header: &CacheHeader,
        target: u64,
        reg: Reg,
        wide: bool,
        imm: u16,
        shift: MovzShift,
    ) -> Result<()> {
        self.write_inst(path, header, target, movz(reg, wide, imm, shift)?)
    }

    /// Writes a MOVZ and advances the cursor.
    pub fn write_movz_incr(
        &mut self,
        path: &Path,
        header: &CacheHeader,
        target: &mut u64,
        reg: Reg,
        wide: bool,
        imm: u16,
        shift: MovzShift,
    ) -> Result<()> {
        self.write_inst_incr(path, header, target, movz(reg, wide, imm, shift)?)
    }

    /// Writes a NOP at `target`.
    pub fn write_nop(&mut self, path: &Path, header: &CacheHeader, target: u64) -> Result<()> {
        self.write_inst(path, header, target, nop())
    }

    /// Writes a NOP and advances the cursor.
    pub fn write_nop_incr(
        &mut self,
        path: &Path,
        header: &CacheHeader,
        target: &mut u64,
    ) -> Result<()> {
        self.write_inst_incr(path, header, target, nop())
    }

    /// Writes a RET at `target`.
    pub fn write_ret(&mut self, path: &Path, header: &CacheHeader, target: u64) -> Result<()> {
        self.write_inst(path, header, target, ret())
    }

    /// Writes a RET and advances the cursor.
    pub fn write_ret_incr(
        &mut self,
        path: &Path,
        header: &CacheHeader,
        target: &mut u64,
    ) -> Result<()> {
        self.write_inst_incr(path, header, target, ret())
    }

    /// Writes a BLR through `reg` at `address`.
    pub fn write_blr(
        &mut self,
        path: &Path,
        header: &CacheHeader,
        address: u64,
        reg: Reg,
    ) -> Result<()> {
        self.write_inst(path, header, address, blr(reg))
    }

    /// Materializes `target` into `reg` with the ADRP+ADD page idiom,
    /// advancing the cursor past both instructions.
    pub fn write_adrp_add_incr(
        &mut self,
        path: &Path,
        header: &CacheHeader,
        address: &mut u64,
        target: u64,
        reg: Reg,
    ) -> Result<()> {
        let pc_page = *address & !0xFFF;
        let target_page = target & !0xFFF;
        let low12 = (target & 0xFFF) as u16;

        // Page addresses differ by whole pages, so the arithmetic shift of
        // the signed byte delta is exact.
        let page_delta = (target_page.wrapping_sub(pc_page) as i64) >> 12;
        if page_delta.unsigned_abs() > ADRP_IMM_MAX as u64 {
            return Err(Error::AdrpTargetTooFar);
        }

        self.write_inst_incr(path, header, address, adrp(page_delta as i32, reg)?)?;
        self.write_inst_incr(
            path,
            header,
            address,
            add_imm(low12, true, reg, reg, AddShift::Shift0)?,
        )
    }
}
