//! Dyld shared cache header parsing.
//!
//! The header layout changed several times across OS releases; rather than
//! versioning the whole structure, the parser keys every optional feature
//! off `mapping_offset`, which always points just past the last header
//! field a given cache was built with.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::reader::Reader;

/// Header offset of the mapping table descriptor.
const MAPPING_INFO_OFF: u64 = 0x10;
/// Header offset of the legacy image table descriptor.
const IMAGE_INFO_OFF: u64 = 0x18;
/// Header offset of the local symbols blob offset.
const LOCAL_SYMBOLS_OFF: u64 = 0x48;
/// Header offset of the shared region base address.
const CACHE_BASE_OFF: u64 = 0xE0;
/// Header offset of the sub-cache table descriptor.
const SUBCACHE_INFO_OFF: u64 = 0x188;
/// offsetof(subCacheArrayCount): headers at least this long are split caches.
const SPLIT_CACHE_MIN_MAPPING_OFF: u32 = 0x18C;
/// offsetof(symbolFileUUID): headers at least this long may have a .symbols file.
const SYMBOL_UUID_OFF: u64 = 0x190;
/// Headers no longer than offsetof(cacheSubType) use v1 sub-cache entries.
const SUBCACHE_V1_MAX_MAPPING_OFF: u32 = 0x1C8;
/// Header offset of the split-cache image table descriptor.
const SPLIT_IMAGE_INFO_OFF: u64 = 0x1C0;

/// A VM range of one cache file.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    /// Virtual memory address
    pub base: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_off: u64,
}

impl Mapping {
    fn parse(reader: &mut Reader) -> Result<Self> {
        let mapping = Self {
            base: reader.read_u64_le()?,
            size: reader.read_u64_le()?,
            file_off: reader.read_u64_le()?,
        };
        // max_prot + init_prot
        reader.seek_by(8)?;
        Ok(mapping)
    }
}

/// A dylib in the cache: its VM base and install name.
#[derive(Debug, Clone)]
pub struct ImageEntry {
    /// Virtual address of the Mach-O header
    pub base: u64,
    /// Install name, e.g. `/usr/lib/libobjc.A.dylib`
    pub path: String,
}

impl ImageEntry {
    fn parse(reader: &mut Reader) -> Result<Self> {
        let base = reader.read_u64_le()?;
        // mod_time + inode
        reader.seek_by(16)?;
        let path_off = reader.read_u32_le()?;
        // pad
        reader.seek_by(4)?;

        let prev_pos = reader.position();
        reader.seek(path_off as u64)?;
        let path = reader.read_cstr()?;
        reader.seek(prev_pos)?;

        Ok(Self { base, path })
    }
}

/// The nlist range of one dylib inside the local symbols blob.
#[derive(Debug, Clone, Copy)]
pub struct LocalSymbolsEntry {
    /// Index of the first nlist record
    pub nlist_start_index: u32,
    /// Number of nlist records
    pub nlist_count: u32,
}

/// The local symbols blob descriptor.
///
/// Offsets are relative to the start of the blob inside its host cache
/// file; entries are keyed by the VM base of the image they belong to.
#[derive(Debug, Clone, Default)]
pub struct LocalSymbolsInfo {
    /// Blob-relative offset of the nlist array
    pub nlist_off: u32,
    /// Blob-relative offset of the string pool
    pub strings_off: u32,
    /// Per-image ranges keyed by image VM base
    pub entries: HashMap<u64, LocalSymbolsEntry>,
}

impl LocalSymbolsInfo {
    fn parse(data: &[u8], local_info_off: u64, is_64: bool, cache_base: u64) -> Result<Self> {
        if local_info_off == 0 {
            return Ok(Self::default());
        }

        let mut reader = Reader::new_at(data, local_info_off)?;
        let nlist_off = reader.read_u32_le()?;
        reader.seek_by(4)?;
        let strings_off = reader.read_u32_le()?;
        reader.seek_by(4)?;
        let entries_off = reader.read_u32_le()?;
        let entries_count = reader.read_u32_le()?;

        let mut entries = HashMap::with_capacity(entries_count as usize);
        reader.seek(local_info_off + entries_off as u64)?;
        for _ in 0..entries_count {
            let dylib_offset = if is_64 {
                reader.read_u64_le()?
            } else {
                reader.read_u32_le()? as u64
            };
            let entry = LocalSymbolsEntry {
                nlist_start_index: reader.read_u32_le()?,
                nlist_count: reader.read_u32_le()?,
            };
            entries.insert(cache_base + dylib_offset, entry);
        }

        Ok(Self {
            nlist_off,
            strings_off,
            entries,
        })
    }
}

/// A sub-cache reference from the main header.
#[derive(Debug, Clone)]
pub struct SubcacheRef {
    /// VM offset from the main cache base
    pub vm_off: u64,
    /// File name suffix, `.1`/`.2` (v1) or a fixed 32-byte string (v2)
    pub suffix: String,
}

impl SubcacheRef {
    fn parse(reader: &mut Reader, index: u32, is_v1: bool) -> Result<Self> {
        // uuid
        reader.seek_by(16)?;
        let vm_off = reader.read_u64_le()?;
        let suffix = if is_v1 {
            format!(".{}", index + 1)
        } else {
            reader.read_cstr_n(32)?
        };
        Ok(Self { vm_off, suffix })
    }
}

/// Which subset of header fields to populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// The main cache: mappings, images, sub-caches, possibly local symbols
    Main,
    /// A sub-cache: mappings and base address only
    Sub,
    /// The `.symbols` file: local symbols and base address only
    Symbols,
}

/// A parsed dyld cache file header.
#[derive(Debug, Clone, Default)]
pub struct CacheHeader {
    /// VM mappings of this file
    pub mappings: Vec<Mapping>,
    /// Image table (main caches only)
    pub images: Vec<ImageEntry>,
    /// Shared region base address
    pub cache_base: u64,
    /// File offset of the local symbols blob (0 if none)
    pub local_symbols_off: u64,
    /// Local symbols descriptor
    pub local_symbols: LocalSymbolsInfo,
    /// Declared sub-caches (main caches only)
    pub subcaches: Vec<SubcacheRef>,
    /// UUID of the `.symbols` companion file; None when absent
    pub symbol_file_uuid: Option<[u8; 16]>,
}

impl CacheHeader {
    /// Parses a cache header of the given flavour.
    ///
    /// `main_cache_base` is the main cache's base address, used to key
    /// local-symbol entries of `.symbols` files; pass 0 when parsing the
    /// main cache itself.
    pub fn parse(data: &[u8], kind: HeaderKind, main_cache_base: u64) -> Result<Self> {
        let mut header = Self::default();
        let mut reader = Reader::new_at(data, MAPPING_INFO_OFF)?;
        let mapping_off = reader.read_u32_le()?;
        let mapping_count = reader.read_u32_le()?;

        if kind != HeaderKind::Symbols && mapping_off != 0 && mapping_count != 0 {
            reader.seek(mapping_off as u64)?;
            header.mappings.reserve(mapping_count as usize);
            for _ in 0..mapping_count {
                header.mappings.push(Mapping::parse(&mut reader)?);
            }
        }

        reader.seek(CACHE_BASE_OFF)?;
        header.cache_base = reader.read_u64_le()?;

        if kind == HeaderKind::Sub {
            return Ok(header);
        }

        let symbol_file_support = if kind == HeaderKind::Symbols {
            true
        } else {
            let supported = mapping_off as u64 >= SYMBOL_UUID_OFF;
            if supported {
                reader.seek(SYMBOL_UUID_OFF)?;
                let uuid: [u8; 16] = reader.read_bytes(16)?.try_into().unwrap();
                if uuid != [0u8; 16] {
                    header.symbol_file_uuid = Some(uuid);
                }
            }
            supported
        };

        if kind == HeaderKind::Symbols || header.symbol_file_uuid.is_none() {
            reader.seek(LOCAL_SYMBOLS_OFF)?;
            header.local_symbols_off = reader.read_u32_le()? as u64;
            let entry_key_base = if main_cache_base == 0 {
                header.cache_base
            } else {
                main_cache_base
            };
            header.local_symbols = LocalSymbolsInfo::parse(
                data,
                header.local_symbols_off,
                symbol_file_support,
                entry_key_base,
            )?;
        }

        if kind != HeaderKind::Main {
            return Ok(header);
        }

        let split = mapping_off >= SPLIT_CACHE_MIN_MAPPING_OFF;

        reader.seek(if split {
            SPLIT_IMAGE_INFO_OFF
        } else {
            IMAGE_INFO_OFF
        })?;
        let image_off = reader.read_u32_le()?;
        let image_count = reader.read_u32_le()?;

        // APPLE BUG: `split && image_count == 0` should mean this is a
        // subcache, but some shipped subcache headers carry the image info
        // copied from the main header, so the inverse check is unreliable.
        if split && image_count == 0 {
            return Err(Error::MainCacheExpected);
        }

        if image_off != 0 && image_count != 0 {
            reader.seek(image_off as u64)?;
            header.images.reserve(image_count as usize);
            for _ in 0..image_count {
                header.images.push(ImageEntry::parse(&mut reader)?);
            }
        }

        if split {
            reader.seek(SUBCACHE_INFO_OFF)?;
            let subcache_off = reader.read_u32_le()?;
            let subcache_count = reader.read_u32_le()?;

            if subcache_off != 0 && subcache_count != 0 {
                let subcache_v1 = mapping_off <= SUBCACHE_V1_MAX_MAPPING_OFF;
                reader.seek(subcache_off as u64)?;
                header.subcaches.reserve(subcache_count as usize);
                for i in 0..subcache_count {
                    header
                        .subcaches
                        .push(SubcacheRef::parse(&mut reader, i, subcache_v1)?);
                }
            }
        }

        Ok(header)
    }

    /// Translates a VM address into a file offset of this cache file.
    pub fn vm_addr_to_file_off(&self, vm_addr: u64) -> Result<u64> {
        for mapping in &self.mappings {
            if vm_addr >= mapping.base && vm_addr < mapping.base + mapping.size {
                return Ok(mapping.file_off + (vm_addr - mapping.base));
            }
        }
        Err(Error::AddressNotFound { addr: vm_addr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u32(data: &mut [u8], off: usize, val: u32) {
        data[off..off + 4].copy_from_slice(&val.to_le_bytes());
    }

    fn put_u64(data: &mut [u8], off: usize, val: u64) {
        data[off..off + 8].copy_from_slice(&val.to_le_bytes());
    }

    /// A pre-split main cache: one mapping, one image at "/a", no subcaches.
    fn build_flat_main() -> Vec<u8> {
        let mut data = vec![0u8; 0x1000];
        put_u32(&mut data, 0x10, 0x100); // mapping_off
        put_u32(&mut data, 0x14, 1); // mapping_count
        put_u32(&mut data, 0x18, 0x140); // image_off
        put_u32(&mut data, 0x1C, 1); // image_count
        put_u64(&mut data, 0xE0, 0x180000000); // cache_base
        put_u64(&mut data, 0x100, 0x180000000); // mapping base
        put_u64(&mut data, 0x108, 0x1000); // mapping size
        put_u64(&mut data, 0x110, 0); // mapping file_off
        put_u64(&mut data, 0x140, 0x180000000); // image base
        put_u32(&mut data, 0x158, 0x160); // image path_off
        data[0x160..0x163].copy_from_slice(b"/a\0");
        data
    }

    /// A split v1 main cache with two subcaches and a symbols UUID.
    fn build_split_main() -> Vec<u8> {
        let mut data = vec![0u8; 0x1000];
        put_u32(&mut data, 0x10, 0x1C8); // mapping_off (>= 0x18C, <= 0x1C8)
        put_u32(&mut data, 0x14, 1); // mapping_count
        put_u64(&mut data, 0xE0, 0x180000000); // cache_base
        put_u32(&mut data, 0x188, 0x300); // subcache_off
        put_u32(&mut data, 0x18C, 2); // subcache_count
        data[0x190..0x1A0].copy_from_slice(&[0x42; 16]); // symbol_file_uuid
        put_u32(&mut data, 0x1C0, 0x400); // image_off
        put_u32(&mut data, 0x1C4, 1); // image_count
        put_u64(&mut data, 0x1C8, 0x180000000); // mapping base
        put_u64(&mut data, 0x1D0, 0x4000); // mapping size
        put_u64(&mut data, 0x1D8, 0); // mapping file_off
        put_u64(&mut data, 0x310, 0x4000); // subcache 0 vm_off
        put_u64(&mut data, 0x328, 0x8000); // subcache 1 vm_off
        put_u64(&mut data, 0x400, 0x180000000); // image base
        put_u32(&mut data, 0x418, 0x430); // image path_off
        data[0x430..0x445].copy_from_slice(b"/usr/lib/libfoo.dylib");
        data
    }

    #[test]
    fn test_parse_flat_main() {
        let data = build_flat_main();
        let header = CacheHeader::parse(&data, HeaderKind::Main, 0).unwrap();

        assert_eq!(header.cache_base, 0x180000000);
        assert_eq!(header.mappings.len(), 1);
        assert_eq!(header.images.len(), 1);
        assert_eq!(header.images[0].path, "/a");
        assert_eq!(header.images[0].base, 0x180000000);
        assert!(header.subcaches.is_empty());
        assert!(header.symbol_file_uuid.is_none());
    }

    #[test]
    fn test_vm_addr_translation() {
        let data = build_flat_main();
        let header = CacheHeader::parse(&data, HeaderKind::Main, 0).unwrap();

        assert_eq!(header.vm_addr_to_file_off(0x180000500).unwrap(), 0x500);
        assert_eq!(header.vm_addr_to_file_off(0x180000000).unwrap(), 0);
        assert!(matches!(
            header.vm_addr_to_file_off(0x180001000),
            Err(Error::AddressNotFound { addr: 0x180001000 })
        ));
    }

    #[test]
    fn test_parse_split_main() {
        let data = build_split_main();
        let header = CacheHeader::parse(&data, HeaderKind::Main, 0).unwrap();

        assert_eq!(header.images.len(), 1);
        assert_eq!(header.images[0].path, "/usr/lib/libfoo.dylib");
        assert_eq!(header.symbol_file_uuid, Some([0x42; 16]));
        assert_eq!(header.subcaches.len(), 2);
        // v1 suffixes are synthesised from the entry index.
        assert_eq!(header.subcaches[0].suffix, ".1");
        assert_eq!(header.subcaches[0].vm_off, 0x4000);
        assert_eq!(header.subcaches[1].suffix, ".2");
        // With the UUID set, local symbols live in the .symbols file.
        assert!(header.local_symbols.entries.is_empty());
    }

    #[test]
    fn test_split_with_zero_images_is_rejected() {
        let mut data = build_split_main();
        put_u32(&mut data, 0x1C4, 0); // image_count
        assert!(matches!(
            CacheHeader::parse(&data, HeaderKind::Main, 0),
            Err(Error::MainCacheExpected)
        ));
    }

    #[test]
    fn test_sub_flavour_reads_mappings_only() {
        let data = build_split_main();
        let header = CacheHeader::parse(&data, HeaderKind::Sub, 0x180000000).unwrap();
        assert_eq!(header.mappings.len(), 1);
        assert_eq!(header.cache_base, 0x180000000);
        assert!(header.images.is_empty());
        assert!(header.subcaches.is_empty());
    }

    #[test]
    fn test_symbols_flavour() {
        let mut data = vec![0u8; 0x1000];
        put_u64(&mut data, 0xE0, 0x180000000); // cache_base (own, unused for keys)
        put_u32(&mut data, 0x48, 0x200); // local_symbols_off
        // Local symbols blob at 0x200.
        put_u32(&mut data, 0x200, 0x40); // nlist_off
        put_u32(&mut data, 0x208, 0x80); // strings_off
        put_u32(&mut data, 0x210, 0x20); // entries_off
        put_u32(&mut data, 0x214, 1); // entries_count
        // One 64-bit entry at 0x220: dylib_offset, start index, count.
        put_u64(&mut data, 0x220, 0x8000);
        put_u32(&mut data, 0x228, 3);
        put_u32(&mut data, 0x22C, 7);

        let header = CacheHeader::parse(&data, HeaderKind::Symbols, 0x190000000).unwrap();
        assert_eq!(header.local_symbols_off, 0x200);
        assert_eq!(header.local_symbols.nlist_off, 0x40);
        assert_eq!(header.local_symbols.strings_off, 0x80);
        // Entries are keyed by the main cache base, not this file's own.
        let entry = header.local_symbols.entries.get(&0x190008000).unwrap();
        assert_eq!(entry.nlist_start_index, 3);
        assert_eq!(entry.nlist_count, 7);
    }

    #[test]
    fn test_v2_subcache_suffixes() {
        let mut data = build_split_main();
        put_u32(&mut data, 0x10, 0x200); // mapping_off > 0x1C8 selects v2
        put_u64(&mut data, 0x200, 0x180000000); // move the mapping
        put_u64(&mut data, 0x208, 0x4000);
        put_u64(&mut data, 0x210, 0);
        // v2 entries are 56 bytes: uuid, vm_off, then a 32-byte suffix.
        put_u32(&mut data, 0x18C, 1); // subcache_count
        put_u64(&mut data, 0x310, 0x4000);
        data[0x318..0x324].copy_from_slice(b".01.dylddata");

        let header = CacheHeader::parse(&data, HeaderKind::Main, 0).unwrap();
        assert_eq!(header.subcaches.len(), 1);
        assert_eq!(header.subcaches[0].suffix, ".01.dylddata");
    }
}
