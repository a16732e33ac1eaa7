//! Cache set analysis: image lookup, symbol maps, Objective-C classes.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use zerocopy::FromBytes;

use crate::bits::{extract64, test64};
use crate::error::{Error, Result};
use crate::macho::{MachHeader, NList, N_TYPE_SECTION};
use crate::reader::Reader;

use super::structs::{CacheHeader, HeaderKind};

/// Byte offset of the class data pointer inside an Objective-C class.
const OBJC_CLASS_DATA_OFF: u64 = 0x20;
/// Byte offset of the name pointer inside the class data.
const OBJC_CLASS_RO_NAME_OFF: u64 = 0x18;

// =============================================================================
// Image Matchers
// =============================================================================

/// Selects an image from the cache's image table by install name.
#[derive(Debug, Clone, Copy)]
pub enum ImageMatcher<'a> {
    /// Exact install-name match, e.g. `/usr/lib/libobjc.A.dylib`
    Exact(&'a str),
    /// A public framework under `/System/Library/Frameworks/`
    Framework(&'a str),
    /// A private framework under `/System/Library/PrivateFrameworks/`
    PrivateFramework(&'a str),
}

impl ImageMatcher<'_> {
    /// Returns true if the given install name satisfies this matcher.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(exact) => path == *exact,
            Self::Framework(name) => {
                Self::matches_framework("/System/Library/Frameworks/", name, path)
            }
            Self::PrivateFramework(name) => {
                Self::matches_framework("/System/Library/PrivateFrameworks/", name, path)
            }
        }
    }

    /// Returns a human-readable name for error messages.
    pub fn name(&self) -> String {
        match self {
            Self::Exact(path) => (*path).to_string(),
            Self::Framework(name) | Self::PrivateFramework(name) => format!("{name}.framework"),
        }
    }

    /// `<base_dir><Name>.framework/` followed by `<Name>` directly or by
    /// `Versions/A/<Name>` (macOS-style bundle layout).
    fn matches_framework(base_dir: &str, name: &str, path: &str) -> bool {
        let Some(rest) = path.strip_prefix(base_dir) else {
            return false;
        };
        let Some(rest) = rest.strip_prefix(name) else {
            return false;
        };
        let Some(rest) = rest.strip_prefix(".framework/") else {
            return false;
        };
        rest.starts_with(name)
            || rest
                .strip_prefix("Versions/A/")
                .is_some_and(|r| r.starts_with(name))
    }
}

// =============================================================================
// Image Handle
// =============================================================================

/// A resolved image: its host cache file plus symbol and class maps.
///
/// Both maps are immutable once built. Symbol keys are raw Mach-O names,
/// already mangled (`_CIGLIsUsable`,
/// `-[NUDevice_iOS _newRendererWithOptions:error:]`).
#[derive(Debug)]
pub struct Image<'a> {
    /// Path of the cache file containing this image's Mach-O bytes
    pub path: &'a Path,
    /// Header of that cache file (for VM translation of patch targets)
    pub header: &'a CacheHeader,
    /// Mapped contents of that cache file (for instruction scans)
    pub data: &'a [u8],
    /// File offset of the Mach-O header
    pub file_off: u64,
    /// VM base of the image
    pub vm_addr: u64,
    /// Symbol name to VM address
    pub symbols: HashMap<String, u64>,
    /// Objective-C class name to class VM address
    pub objc_classes: HashMap<String, u64>,
}

impl Image<'_> {
    /// Resolves the first candidate name present in the symbol map.
    ///
    /// Multiple candidates cope with symbol renames across OS versions.
    pub fn resolve_sym(&self, candidates: &[&str]) -> Result<u64> {
        for candidate in candidates {
            if let Some(&addr) = self.symbols.get(*candidate) {
                return Ok(addr);
            }
        }
        Err(Error::SymbolNotFound {
            name: candidates.first().copied().unwrap_or_default().to_string(),
        })
    }

    /// Resolves an Objective-C class to its VM address.
    pub fn resolve_objc_class(&self, name: &str) -> Result<u64> {
        self.objc_classes
            .get(name)
            .copied()
            .ok_or_else(|| Error::ObjcClassNotFound {
                name: name.to_string(),
            })
    }
}

// =============================================================================
// Cache Entries
// =============================================================================

/// One opened cache file: path, mapped contents and parsed header.
#[derive(Debug)]
pub struct CacheEntry {
    /// Path of this cache file
    pub path: PathBuf,
    /// Parsed header
    pub header: CacheHeader,
    mmap: Mmap,
}

impl CacheEntry {
    fn open(path: PathBuf, kind: HeaderKind, main_cache_base: u64) -> Result<Self> {
        let file = File::open(&path).map_err(|e| Error::FileOpen {
            path: path.clone(),
            source: e,
        })?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.clone(),
            source: e,
        })?;
        let header = CacheHeader::parse(&mmap, kind, main_cache_base)?;
        Ok(Self { path, header, mmap })
    }

    /// Returns the mapped file contents.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.mmap
    }
}

// =============================================================================
// Fixup Decoding
// =============================================================================

/// Decodes a dyld chained fixup pointer into a VM address.
///
/// Brute-force: rather than walking the chained-fixups metadata, classify
/// the pointer by its top bits. Authenticated binds and plain binds cannot
/// be resolved this way and are fatal.
fn decode_fixup(fixup: u64, image_base: u64, cache_base: u64) -> Result<u64> {
    let val = if test64(fixup, 63) {
        // auth_rebase, unless the bind bit is set
        if test64(fixup, 62) {
            return Err(Error::UnsupportedFixup {
                kind: "auth_bind",
                value: fixup,
            });
        }
        // key/diversity fields all zero means this is a plain bind
        if extract64(fixup, 32, 19) == 0 {
            return Err(Error::UnsupportedFixup {
                kind: "bind",
                value: fixup,
            });
        }
        extract64(fixup, 0, 32)
    } else {
        extract64(fixup, 0, 36)
    };
    Ok(if val > image_base {
        val
    } else {
        val + cache_base
    })
}

// =============================================================================
// Cache Analyser
// =============================================================================

/// The opened cache file set: main cache, sub-caches and symbols file.
///
/// Built once at startup and immutable thereafter. Every referenced file
/// is memory-mapped up front; failure to open any of them is fatal.
#[derive(Debug)]
pub struct CacheAnalyser {
    caches: Vec<CacheEntry>,
    symbols_cache: Option<CacheEntry>,
}

impl CacheAnalyser {
    /// Opens the main cache at `base_path` plus every sub-cache and the
    /// `.symbols` file it declares.
    pub fn open<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref();

        let main = CacheEntry::open(base_path.to_path_buf(), HeaderKind::Main, 0)?;
        let main_cache_base = main.header.cache_base;

        let mut caches = Vec::with_capacity(1 + main.header.subcaches.len());
        let subcache_suffixes: Vec<String> = main
            .header
            .subcaches
            .iter()
            .map(|sc| sc.suffix.clone())
            .collect();
        let has_symbols = main.header.symbol_file_uuid.is_some();
        caches.push(main);

        for suffix in &subcache_suffixes {
            let sub_path = append_suffix(base_path, suffix);
            caches.push(CacheEntry::open(sub_path, HeaderKind::Sub, main_cache_base)?);
        }

        let symbols_cache = if has_symbols {
            let symbols_path = append_suffix(base_path, ".symbols");
            Some(CacheEntry::open(
                symbols_path,
                HeaderKind::Symbols,
                main_cache_base,
            )?)
        } else {
            None
        };

        Ok(Self {
            caches,
            symbols_cache,
        })
    }

    /// Returns every patchable cache entry (main first, then sub-caches).
    pub fn caches(&self) -> &[CacheEntry] {
        &self.caches
    }

    /// Returns the main cache entry.
    pub fn main_cache(&self) -> &CacheEntry {
        &self.caches[0]
    }

    /// Finds the cache file covering a VM address, returning the file
    /// offset within it.
    pub fn find_entry_from_vm_addr(&self, vm_addr: u64) -> Result<(u64, &CacheEntry)> {
        for entry in &self.caches {
            if let Ok(offset) = entry.header.vm_addr_to_file_off(vm_addr) {
                return Ok((offset, entry));
            }
        }
        Err(Error::AddressNotFound { addr: vm_addr })
    }

    /// Reads and decodes a fixup pointer at a VM address.
    pub fn read_ptr_at(&self, image_base: u64, vm_addr: u64) -> Result<u64> {
        let (off, entry) = self.find_entry_from_vm_addr(vm_addr)?;
        let fixup = Reader::new_at(entry.data(), off)?.read_u64_le()?;
        decode_fixup(fixup, image_base, self.main_cache().header.cache_base)
    }

    /// Finds an image by matcher and builds its symbol map, optionally
    /// collecting its Objective-C classes as well.
    pub fn find_image(
        &self,
        matcher: &ImageMatcher,
        with_objc_classes: bool,
    ) -> Result<Image<'_>> {
        let image = self
            .main_cache()
            .header
            .images
            .iter()
            .find(|image| matcher.matches(&image.path))
            .ok_or_else(|| Error::ImageNotFound {
                name: matcher.name(),
            })?;

        let (image_off, image_entry) = self.find_entry_from_vm_addr(image.base)?;

        let mut mach_reader = Reader::new_at(image_entry.data(), image_off)?;
        let mach = MachHeader::parse(&mut mach_reader)?;

        let mut symbols = HashMap::new();

        // Pass A: the image's own symbol table, relocated into LINKEDIT.
        if let Some(symtab) = &mach.symtab {
            let linkedit = mach.find_segment("__LINKEDIT")?;
            let linkedit_base = linkedit.vm_addr - linkedit.file_off;

            let (sym_off, sym_entry) =
                self.find_entry_from_vm_addr(linkedit_base + symtab.sym_off as u64)?;
            let (str_off, str_entry) =
                self.find_entry_from_vm_addr(linkedit_base + symtab.str_off as u64)?;

            let mut sym_reader = Reader::new_at(sym_entry.data(), sym_off)?;
            symbols.reserve(symtab.sym_count as usize);
            for _ in 0..symtab.sym_count {
                let nlist = read_nlist(&mut sym_reader)?;
                if nlist.strx == 0 || nlist.sym_type() != N_TYPE_SECTION {
                    continue;
                }

                let mut str_reader =
                    Reader::new_at(str_entry.data(), str_off + nlist.strx as u64)?;
                let name = str_reader.read_cstr()?;
                if name.is_empty() || name == "<redacted>" {
                    continue;
                }

                symbols.entry(name).or_insert(nlist.value);
            }
        }

        // Pass B: unstripped local symbols, from the dedicated symbols
        // cache when present, else from the main cache. First insertion
        // wins on duplicate names.
        let symbols_source = self.symbols_cache.as_ref().unwrap_or(self.main_cache());
        let blob_off = symbols_source.header.local_symbols_off;
        let local_symbols = &symbols_source.header.local_symbols;
        if let Some(range) = local_symbols.entries.get(&image.base) {
            let nlist_start = blob_off
                + local_symbols.nlist_off as u64
                + range.nlist_start_index as u64 * NList::SIZE as u64;
            let strings_base = blob_off + local_symbols.strings_off as u64;

            let mut nlist_reader = Reader::new_at(symbols_source.data(), nlist_start)?;
            symbols.reserve(range.nlist_count as usize);
            for _ in 0..range.nlist_count {
                let nlist = read_nlist(&mut nlist_reader)?;
                if nlist.strx == 0 || nlist.sym_type() != N_TYPE_SECTION {
                    continue;
                }

                let mut str_reader =
                    Reader::new_at(symbols_source.data(), strings_base + nlist.strx as u64)?;
                let name = str_reader.read_cstr()?;
                if name.is_empty() || name == "<redacted>" {
                    continue;
                }

                symbols.entry(name).or_insert(nlist.value);
            }
        }

        let mut objc_classes = HashMap::new();

        if with_objc_classes {
            let class_list = mach.find_section("__DATA_CONST", "__objc_classlist")?;
            let (list_off, list_entry) = self.find_entry_from_vm_addr(class_list.vm_addr)?;
            let cache_base = self.main_cache().header.cache_base;

            let mut slot_reader = Reader::new_at(list_entry.data(), list_off)?;
            for _ in 0..class_list.vm_size / 8 {
                let class_addr =
                    decode_fixup(slot_reader.read_u64_le()?, image.base, cache_base)?;
                let class_data = self.read_ptr_at(image.base, class_addr + OBJC_CLASS_DATA_OFF)?;
                let name_addr =
                    self.read_ptr_at(image.base, class_data + OBJC_CLASS_RO_NAME_OFF)?;

                let (name_off, name_entry) = self.find_entry_from_vm_addr(name_addr)?;
                let name = Reader::new_at(name_entry.data(), name_off)?.read_cstr()?;
                objc_classes.insert(name, class_addr);
            }
        }

        Ok(Image {
            path: &image_entry.path,
            header: &image_entry.header,
            data: image_entry.data(),
            file_off: image_off,
            vm_addr: image.base,
            symbols,
            objc_classes,
        })
    }
}

fn read_nlist(reader: &mut Reader) -> Result<NList> {
    let bytes = reader.read_bytes(NList::SIZE)?;
    // Infallible: the slice length is exactly NList::SIZE.
    Ok(NList::read_from_bytes(bytes).unwrap())
}

fn append_suffix(base_path: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(base_path.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
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

    fn put_str(data: &mut [u8], off: usize, s: &[u8]) {
        data[off..off + s.len()].copy_from_slice(s);
    }

    /// Builds a single-file cache with one image carrying a symtab, local
    /// symbols and one Objective-C class.
    fn build_cache() -> Vec<u8> {
        let mut data = vec![0u8; 0x1000];

        // Cache header (pre-split layout).
        put_u32(&mut data, 0x10, 0x100); // mapping_off
        put_u32(&mut data, 0x14, 1); // mapping_count
        put_u32(&mut data, 0x18, 0x140); // image_off
        put_u32(&mut data, 0x1C, 1); // image_count
        put_u32(&mut data, 0x48, 0x600); // local_symbols_off
        put_u64(&mut data, 0xE0, 0x180000000); // cache_base
        put_u64(&mut data, 0x100, 0x180000000); // mapping base
        put_u64(&mut data, 0x108, 0x1000); // mapping size
        put_u64(&mut data, 0x110, 0); // mapping file_off
        put_u64(&mut data, 0x140, 0x180000800); // image base
        put_u32(&mut data, 0x158, 0x160); // image path_off
        put_str(
            &mut data,
            0x160,
            b"/System/Library/PrivateFrameworks/NeutrinoCore.framework/NeutrinoCore",
        );

        // Local symbols blob at 0x600 (32-bit dylib offsets).
        put_u32(&mut data, 0x600, 0x40); // nlist_off
        put_u32(&mut data, 0x608, 0x80); // strings_off
        put_u32(&mut data, 0x610, 0x20); // entries_off
        put_u32(&mut data, 0x614, 2); // entries_count
        put_u32(&mut data, 0x620, 0x800); // entry 0: dylib_offset
        put_u32(&mut data, 0x624, 0); // nlist_start_index
        put_u32(&mut data, 0x628, 2); // nlist_count
        put_u32(&mut data, 0x62C, 0xF00); // entry 1: some other dylib
        put_u32(&mut data, 0x630, 2);
        put_u32(&mut data, 0x634, 0);
        // Local nlists at 0x640.
        put_u32(&mut data, 0x640, 1); // strx -> "_localOnly"
        data[0x644] = 0x0E; // type = section
        put_u64(&mut data, 0x648, 0x180000908);
        put_u32(&mut data, 0x650, 12); // strx -> "_CIGLIsUsable" (duplicate)
        data[0x654] = 0x0E;
        put_u64(&mut data, 0x658, 0x180000990);
        // Local string pool at 0x680.
        put_str(&mut data, 0x681, b"_localOnly\0");
        put_str(&mut data, 0x68C, b"_CIGLIsUsable\0");

        // Mach-O image at 0x800.
        put_u32(&mut data, 0x800, 0xFEEDFACF); // magic
        put_u32(&mut data, 0x804, 0x0100000C); // cputype arm64
        put_u32(&mut data, 0x810, 3); // ncmds

        // LC_SEGMENT_64 __LINKEDIT (no sections).
        put_u32(&mut data, 0x820, 0x19);
        put_u32(&mut data, 0x824, 72);
        put_str(&mut data, 0x828, b"__LINKEDIT");
        put_u64(&mut data, 0x838, 0x180000A00); // vm_addr
        put_u64(&mut data, 0x840, 0x200); // vm_size
        put_u64(&mut data, 0x848, 0xA00); // file_off
        put_u64(&mut data, 0x850, 0x200); // file_size

        // LC_SEGMENT_64 __DATA_CONST with __objc_classlist.
        put_u32(&mut data, 0x868, 0x19);
        put_u32(&mut data, 0x86C, 152);
        put_str(&mut data, 0x870, b"__DATA_CONST");
        put_u64(&mut data, 0x880, 0x180000B00); // vm_addr
        put_u64(&mut data, 0x888, 0x100); // vm_size
        put_u64(&mut data, 0x890, 0xB00); // file_off
        put_u64(&mut data, 0x898, 0x100); // file_size
        put_u32(&mut data, 0x8A8, 1); // nsects
        put_str(&mut data, 0x8B0, b"__objc_classlist"); // sectname (16 bytes)
        put_str(&mut data, 0x8C0, b"__DATA_CONST"); // segname
        put_u64(&mut data, 0x8D0, 0x180000B00); // section vm_addr
        put_u64(&mut data, 0x8D8, 8); // section vm_size (one slot)
        put_u32(&mut data, 0x8E0, 0xB00); // section file_off

        // LC_SYMTAB.
        put_u32(&mut data, 0x900, 0x2);
        put_u32(&mut data, 0x904, 24);
        put_u32(&mut data, 0x908, 0xA00); // sym_off (LINKEDIT-relative)
        put_u32(&mut data, 0x90C, 4); // sym_count
        put_u32(&mut data, 0x910, 0xA80); // str_off
        put_u32(&mut data, 0x914, 0x80); // str_size

        // Objective-C metadata, reached through plain-rebase fixups.
        put_u64(&mut data, 0xB00, 0x900); // classlist slot -> class
        put_u64(&mut data, 0x920, 0x940); // class + 0x20 -> class data
        put_u64(&mut data, 0x958, 0x970); // data + 0x18 -> name
        put_str(&mut data, 0x970, b"NUSoftwareRenderer\0");

        // Image nlists at 0xA00.
        put_u32(&mut data, 0xA00, 1); // strx -> "_CIGLIsUsable"
        data[0xA04] = 0x0E; // type = section
        put_u64(&mut data, 0xA08, 0x180000900);
        put_u32(&mut data, 0xA10, 0); // strx == 0, skipped
        data[0xA14] = 0x0E;
        put_u32(&mut data, 0xA20, 15); // strx -> "<redacted>", skipped
        data[0xA24] = 0x0F;
        put_u64(&mut data, 0xA28, 0x180000904);
        put_u32(&mut data, 0xA30, 26); // strx -> "_absolute", wrong type
        data[0xA34] = 0x02;
        put_u64(&mut data, 0xA38, 0x180000910);
        // Image string pool at 0xA80.
        put_str(&mut data, 0xA81, b"_CIGLIsUsable\0");
        put_str(&mut data, 0xA8F, b"<redacted>\0");
        put_str(&mut data, 0xA9A, b"_absolute\0");

        data
    }

    fn open_analyser(dir: &tempfile::TempDir) -> CacheAnalyser {
        let path = dir.path().join("cache");
        std::fs::write(&path, build_cache()).unwrap();
        CacheAnalyser::open(&path).unwrap()
    }

    #[test]
    fn test_find_entry_from_vm_addr() {
        let dir = tempfile::tempdir().unwrap();
        let analyser = open_analyser(&dir);

        let (off, entry) = analyser.find_entry_from_vm_addr(0x180000500).unwrap();
        assert_eq!(off, 0x500);
        assert_eq!(entry.path, dir.path().join("cache"));

        assert!(analyser.find_entry_from_vm_addr(0x200000000).is_err());
    }

    #[test]
    fn test_find_image_builds_symbol_map() {
        let dir = tempfile::tempdir().unwrap();
        let analyser = open_analyser(&dir);

        let image = analyser
            .find_image(&ImageMatcher::PrivateFramework("NeutrinoCore"), false)
            .unwrap();

        assert_eq!(image.vm_addr, 0x180000800);
        assert_eq!(image.file_off, 0x800);
        // Pass A symbol, with the local duplicate NOT overriding it.
        assert_eq!(image.symbols["_CIGLIsUsable"], 0x180000900);
        // Pass B local symbol.
        assert_eq!(image.symbols["_localOnly"], 0x180000908);
        // Filtered entries never land in the map.
        assert!(!image.symbols.contains_key("<redacted>"));
        assert!(!image.symbols.contains_key("_absolute"));
        assert_eq!(image.symbols.len(), 2);

        assert_eq!(
            image.resolve_sym(&["_CIGLIsRenamed", "_CIGLIsUsable"]).unwrap(),
            0x180000900
        );
        assert!(matches!(
            image.resolve_sym(&["_missing"]),
            Err(Error::SymbolNotFound { .. })
        ));
    }

    #[test]
    fn test_find_image_without_symtab() {
        // An image whose header carries no load commands at all: no
        // segments, no symtab, no local-symbols entry.
        let mut data = vec![0u8; 0x1000];
        put_u32(&mut data, 0x10, 0x100); // mapping_off
        put_u32(&mut data, 0x14, 1); // mapping_count
        put_u32(&mut data, 0x18, 0x140); // image_off
        put_u32(&mut data, 0x1C, 1); // image_count
        put_u64(&mut data, 0xE0, 0x180000000); // cache_base
        put_u64(&mut data, 0x100, 0x180000000); // mapping base
        put_u64(&mut data, 0x108, 0x1000); // mapping size
        put_u64(&mut data, 0x110, 0); // mapping file_off
        put_u64(&mut data, 0x140, 0x180000800); // image base
        put_u32(&mut data, 0x158, 0x160); // image path_off
        put_str(&mut data, 0x160, b"/a\0");
        put_u32(&mut data, 0x800, 0xFEEDFACF); // magic
        put_u32(&mut data, 0x804, 0x0100000C); // cputype arm64

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        std::fs::write(&path, data).unwrap();
        let analyser = CacheAnalyser::open(&path).unwrap();

        let image = analyser
            .find_image(&ImageMatcher::Exact("/a"), false)
            .unwrap();
        assert_eq!(image.vm_addr, 0x180000800);
        assert!(image.symbols.is_empty());
        assert!(image.objc_classes.is_empty());
    }

    #[test]
    fn test_find_image_objc_classes() {
        let dir = tempfile::tempdir().unwrap();
        let analyser = open_analyser(&dir);

        let image = analyser
            .find_image(&ImageMatcher::PrivateFramework("NeutrinoCore"), true)
            .unwrap();

        assert_eq!(
            image.resolve_objc_class("NUSoftwareRenderer").unwrap(),
            0x180000900
        );
        assert!(image.resolve_objc_class("NUMetalRenderer").is_err());
    }

    #[test]
    fn test_find_image_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let analyser = open_analyser(&dir);

        assert!(matches!(
            analyser.find_image(&ImageMatcher::Framework("CoreImage"), false),
            Err(Error::ImageNotFound { .. })
        ));
    }

    #[test]
    fn test_open_with_subcache_and_symbols_file() {
        // Split v1 main cache declaring one subcache and a symbols file.
        let mut main = vec![0u8; 0x1000];
        put_u32(&mut main, 0x10, 0x1C8); // mapping_off
        put_u32(&mut main, 0x14, 1); // mapping_count
        put_u64(&mut main, 0xE0, 0x180000000); // cache_base
        put_u32(&mut main, 0x188, 0x300); // subcache_off
        put_u32(&mut main, 0x18C, 1); // subcache_count
        main[0x190..0x1A0].copy_from_slice(&[0x42; 16]); // symbol_file_uuid
        put_u32(&mut main, 0x1C0, 0x400); // image_off
        put_u32(&mut main, 0x1C4, 1); // image_count
        put_u64(&mut main, 0x1C8, 0x180000000); // mapping base
        put_u64(&mut main, 0x1D0, 0x1000); // mapping size
        put_u64(&mut main, 0x1D8, 0); // mapping file_off
        put_u64(&mut main, 0x310, 0x4000); // subcache vm_off
        put_u64(&mut main, 0x400, 0x180000800); // image base
        put_u32(&mut main, 0x418, 0x430); // image path_off
        put_str(&mut main, 0x430, b"/x\0");

        // The subcache covers the next VM page range.
        let mut sub = vec![0u8; 0x200];
        put_u32(&mut sub, 0x10, 0x100);
        put_u32(&mut sub, 0x14, 1);
        put_u64(&mut sub, 0xE0, 0x180000000);
        put_u64(&mut sub, 0x100, 0x180004000); // mapping base
        put_u64(&mut sub, 0x108, 0x1000); // mapping size
        put_u64(&mut sub, 0x110, 0x40); // mapping file_off

        // Symbols file carrying one local-symbols entry for the image.
        let mut symbols = vec![0u8; 0x400];
        put_u64(&mut symbols, 0xE0, 0x180000000);
        put_u32(&mut symbols, 0x48, 0x200); // local_symbols_off
        put_u32(&mut symbols, 0x200, 0x40); // nlist_off
        put_u32(&mut symbols, 0x208, 0x80); // strings_off
        put_u32(&mut symbols, 0x210, 0x20); // entries_off
        put_u32(&mut symbols, 0x214, 1); // entries_count
        put_u64(&mut symbols, 0x220, 0x800); // 64-bit dylib_offset
        put_u32(&mut symbols, 0x228, 0); // nlist_start_index
        put_u32(&mut symbols, 0x22C, 0); // nlist_count

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        std::fs::write(&path, main).unwrap();
        std::fs::write(dir.path().join("cache.1"), sub).unwrap();
        std::fs::write(dir.path().join("cache.symbols"), symbols).unwrap();

        let analyser = CacheAnalyser::open(&path).unwrap();
        assert_eq!(analyser.caches().len(), 2);

        let (off, entry) = analyser.find_entry_from_vm_addr(0x180004010).unwrap();
        assert_eq!(off, 0x50);
        assert_eq!(entry.path, dir.path().join("cache.1"));

        // The symbols cache keys its entries by the main cache base.
        assert!(analyser
            .symbols_cache
            .as_ref()
            .unwrap()
            .header
            .local_symbols
            .entries
            .contains_key(&0x180000800));
    }

    #[test]
    fn test_open_fails_on_missing_subcache() {
        let mut main = vec![0u8; 0x1000];
        put_u32(&mut main, 0x10, 0x1C8);
        put_u32(&mut main, 0x14, 1);
        put_u64(&mut main, 0xE0, 0x180000000);
        put_u32(&mut main, 0x188, 0x300);
        put_u32(&mut main, 0x18C, 1);
        put_u32(&mut main, 0x1C0, 0x400);
        put_u32(&mut main, 0x1C4, 1);
        put_u64(&mut main, 0x1C8, 0x180000000);
        put_u64(&mut main, 0x1D0, 0x1000);
        put_u64(&mut main, 0x400, 0x180000800);
        put_u32(&mut main, 0x418, 0x430);
        put_str(&mut main, 0x430, b"/x\0");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        std::fs::write(&path, main).unwrap();

        assert!(matches!(
            CacheAnalyser::open(&path),
            Err(Error::FileOpen { .. })
        ));
    }

    #[test]
    fn test_matchers() {
        let exact = ImageMatcher::Exact("/usr/lib/libobjc.A.dylib");
        assert!(exact.matches("/usr/lib/libobjc.A.dylib"));
        assert!(!exact.matches("/usr/lib/libobjc.A.dylib2"));

        let public = ImageMatcher::Framework("CoreImage");
        assert!(public.matches("/System/Library/Frameworks/CoreImage.framework/CoreImage"));
        assert!(public.matches(
            "/System/Library/Frameworks/CoreImage.framework/Versions/A/CoreImage"
        ));
        assert!(!public.matches(
            "/System/Library/PrivateFrameworks/CoreImage.framework/CoreImage"
        ));
        assert!(!public.matches("/System/Library/Frameworks/CoreImageCore.framework/CoreImage"));

        let private = ImageMatcher::PrivateFramework("CMCapture");
        assert!(private.matches(
            "/System/Library/PrivateFrameworks/CMCapture.framework/CMCapture"
        ));
        assert!(!private.matches("/System/Library/Frameworks/CMCapture.framework/CMCapture"));

        assert_eq!(public.name(), "CoreImage.framework");
    }

    #[test]
    fn test_decode_fixup() {
        // Plain rebase: low 36 bits, below the image base, rebased.
        assert_eq!(decode_fixup(0x900, 0x180000800, 0x180000000).unwrap(), 0x180000900);
        // Plain rebase already above the image base: used as-is.
        assert_eq!(
            decode_fixup(0x1_90000000, 0x180000000, 0x180000000).unwrap(),
            0x1_90000000
        );
        // auth_rebase: bit 63 set, diversity bits nonzero, 32-bit target.
        let auth = (1u64 << 63) | (1 << 50) | 0x1234;
        assert_eq!(
            decode_fixup(auth, 0x180000000, 0x180000000).unwrap(),
            0x180001234
        );
        // auth_bind is unsupported.
        assert!(matches!(
            decode_fixup((1u64 << 63) | (1 << 62), 0, 0),
            Err(Error::UnsupportedFixup { kind: "auth_bind", .. })
        ));
        // Plain bind (bit 63 set, diversity bits all zero) is unsupported.
        assert!(matches!(
            decode_fixup(1u64 << 63, 0, 0),
            Err(Error::UnsupportedFixup { kind: "bind", .. })
        ));
    }
}
