//! Write-batching patch journal with sidecar-based revert.
//!
//! Writes are queued per file and only hit the disk at [`Patcher::commit`],
//! so any failure during patch construction leaves the caches untouched.
//! Commit snapshots the bytes it overwrites into a text sidecar next to
//! each patched file; [`Patcher::revert`] replays that sidecar and removes
//! it. The sidecar's presence is the "this file is patched" indicator.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Extension of the original-bytes sidecar file.
pub const ORIG_BYTES_EXT: &str = ".InfernoOriginalBytes";

fn sidecar_path(path: &Path) -> PathBuf {
    let mut sidecar = path.as_os_str().to_os_string();
    sidecar.push(ORIG_BYTES_EXT);
    PathBuf::from(sidecar)
}

/// The patch write queue.
///
/// Files keep their first-insertion order; writes within a file are kept
/// ascending by offset. Both orders are stable so listings and commits are
/// deterministic.
#[derive(Debug, Default)]
pub struct Patcher {
    files: Vec<(PathBuf, BTreeMap<u64, Vec<u8>>)>,
}

impl Patcher {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `bytes` to be written at `file_off` of `path`.
    ///
    /// A later write at the same offset replaces the earlier bytes.
    pub fn write(&mut self, path: &Path, file_off: u64, bytes: Vec<u8>) {
        let writes = match self.files.iter_mut().find(|(p, _)| p == path) {
            Some((_, writes)) => writes,
            None => {
                self.files.push((path.to_path_buf(), BTreeMap::new()));
                &mut self.files.last_mut().unwrap().1
            }
        };
        writes.insert(file_off, bytes);
    }

    /// Prints the queued writes, one file at a time, offsets ascending.
    pub fn print_pending(&self) {
        for (path, writes) in &self.files {
            println!("  {}:", path.display());
            for (off, bytes) in writes {
                print!("    {off:#x}:");
                for byte in bytes {
                    print!(" {byte:#x}");
                }
                println!();
            }
        }
    }

    /// Applies every queued write, snapshotting the overwritten bytes into
    /// each file's sidecar.
    ///
    /// The sidecar is truncated on open, so an interrupted commit leaves a
    /// partial but self-consistent prefix usable for best-effort revert.
    /// Committing on top of an earlier commit snapshots the already-patched
    /// bytes; the driver reverts every file first to keep sidecars rooted
    /// at pristine content.
    pub fn commit(&self) -> Result<()> {
        for (path, writes) in &self.files {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| Error::FileOpen {
                    path: path.clone(),
                    source: e,
                })?;

            let orig_bytes_path = sidecar_path(path);
            let mut sidecar = File::create(&orig_bytes_path).map_err(|e| Error::FileOpen {
                path: orig_bytes_path.clone(),
                source: e,
            })?;

            for (&off, bytes) in writes {
                file.seek(SeekFrom::Start(off))?;
                let mut orig_bytes = vec![0u8; bytes.len()];
                file.read_exact(&mut orig_bytes)?;

                file.seek(SeekFrom::Start(off))?;
                file.write_all(bytes)?;

                write!(sidecar, "{off:x}: ")?;
                for byte in &orig_bytes {
                    write!(sidecar, "{byte:x} ")?;
                }
                writeln!(sidecar)?;
            }

            file.flush()?;
            sidecar.flush()?;
        }
        Ok(())
    }

    /// Restores a file from its sidecar, then removes the sidecar.
    ///
    /// A missing sidecar means the file is not patched; that is a no-op
    /// success.
    pub fn revert(path: &Path) -> Result<()> {
        let orig_bytes_path = sidecar_path(path);
        if !orig_bytes_path.exists() {
            return Ok(());
        }

        let contents = std::fs::read_to_string(&orig_bytes_path)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::FileOpen {
                path: path.to_path_buf(),
                source: e,
            })?;

        for token in contents.split_whitespace() {
            if let Some(offset_hex) = token.strip_suffix(':') {
                let offset =
                    u64::from_str_radix(offset_hex, 16).map_err(|e| Error::MalformedSidecar {
                        path: orig_bytes_path.clone(),
                        reason: format!("bad offset `{token}`: {e}"),
                    })?;
                file.seek(SeekFrom::Start(offset))?;
                continue;
            }

            let value = u32::from_str_radix(token, 16).map_err(|e| Error::MalformedSidecar {
                path: orig_bytes_path.clone(),
                reason: format!("bad byte `{token}`: {e}"),
            })?;
            if value > 0xFF {
                return Err(Error::MalformedSidecar {
                    path: orig_bytes_path.clone(),
                    reason: format!("byte `{token}` too large"),
                });
            }
            file.write_all(&[value as u8])?;
        }

        file.flush()?;
        drop(file);
        std::fs::remove_file(&orig_bytes_path)?;
        Ok(())
    }
}
