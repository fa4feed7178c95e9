//! Binary archive persistence.
//!
//! ```text
//! [magic "SAUR": 4 B][version: u32 LE][entry_count: u64 LE]
//! [entries: 4 B ip + 2 B score, packed, zero scores never written]
//! ```
//!
//! Integers are fixed little-endian so archives move between producers
//! regardless of host byte order. Save writes a sibling
//! `<target>.tmp.<pid>` file, streams entries through a 4096-entry batch
//! buffer, back-patches the real entry count, syncs, and renames over the
//! target; rename is atomic within one directory, so a crashed save never
//! damages an existing archive. Load validates the header, clears the
//! store, and replays entries as sets; a short or corrupt body leaves the
//! store cleared.

use crate::constants::{
    ARCHIVE_ENTRY_BYTES, ARCHIVE_MAGIC, ARCHIVE_VERSION, BLOCKS_PER_ROW, MAX_ARCHIVE_ENTRIES,
    PREFIX16_COUNT, SAVE_BUFFER_ENTRIES, SCORES_PER_BLOCK,
};
use crate::errors::Error;
use crate::helpers::compose_ip;
use crate::types::ScoreEngine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{info, warn};
use metrics::counter;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

fn tmp_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(format!(".tmp.{}", std::process::id()));
    PathBuf::from(name)
}

impl ScoreEngine {
    /// Walk the store and stream all non-zero entries into `file`,
    /// returning how many were written. The header's count field must
    /// already be in place; it is back-patched afterwards.
    fn write_entries(&self, file: &mut File) -> io::Result<u64> {
        let mut written = 0u64;
        let mut batch = Vec::with_capacity(SAVE_BUFFER_ENTRIES * ARCHIVE_ENTRY_BYTES);

        for p16 in 0..PREFIX16_COUNT {
            let Some(row) = self.row(p16 as u16) else {
                continue;
            };
            for b_idx in 0..BLOCKS_PER_ROW {
                let ptr = row.blocks[b_idx].load(Ordering::Acquire);
                if ptr.is_null() {
                    continue;
                }
                // SAFETY: blocks live until Drop.
                let block = unsafe { &*ptr };
                if block.active_count.load(Ordering::Relaxed) == 0 {
                    continue;
                }
                for host in 0..SCORES_PER_BLOCK {
                    let score = block.scores[host].load(Ordering::Relaxed);
                    if score == 0 {
                        continue;
                    }
                    let ip = compose_ip(p16 as u16, b_idx as u8, host as u8);
                    batch.write_u32::<LittleEndian>(ip)?;
                    batch.write_i16::<LittleEndian>(score)?;
                    written += 1;
                    if batch.len() >= SAVE_BUFFER_ENTRIES * ARCHIVE_ENTRY_BYTES {
                        file.write_all(&batch)?;
                        batch.clear();
                    }
                }
            }
        }
        if !batch.is_empty() {
            file.write_all(&batch)?;
        }
        Ok(written)
    }

    fn save_inner(&self, tmp: &Path, target: &Path) -> io::Result<u64> {
        let mut file = File::create(tmp)?;

        file.write_all(&ARCHIVE_MAGIC)?;
        file.write_u32::<LittleEndian>(ARCHIVE_VERSION)?;
        // Placeholder count; patched once the walk is done.
        file.write_u64::<LittleEndian>(0)?;

        let written = self.write_entries(&mut file)?;

        file.seek(SeekFrom::Start(8))?;
        file.write_u64::<LittleEndian>(written)?;

        file.flush()?;
        file.sync_data()?;
        drop(file);

        fs::rename(tmp, target)?;
        Ok(written)
    }

    /// Atomically persist all non-zero scores to `path`.
    ///
    /// Concurrent writers are not blocked; the archive is a per-key-
    /// consistent snapshot of whatever the walk observed. On failure the
    /// temporary file is unlinked and the previous archive, if any, is
    /// untouched.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let target = path.as_ref();
        let tmp = tmp_path_for(target);

        match self.save_inner(&tmp, target) {
            Ok(written) => {
                counter!("ipscore_archive_entries_saved_total").increment(written);
                info!("saved {} entries to {}", written, target.display());
                Ok(())
            }
            Err(e) => {
                warn!("save to {} failed: {e}", target.display());
                let _ = fs::remove_file(&tmp);
                Err(Error::Io(e))
            }
        }
    }

    /// Replace the store's contents from an archive at `path`.
    ///
    /// The header is validated before anything is touched; once it passes,
    /// the store is cleared and entries replay as sets. Zero scores in the
    /// file are skipped. An I/O failure mid-body leaves the store in the
    /// cleared state with whatever entries had already applied.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let target = path.as_ref();
        let file = File::open(target)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != ARCHIVE_MAGIC {
            return Err(Error::InvalidArgument);
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version == 0 || version > ARCHIVE_VERSION {
            return Err(Error::InvalidArgument);
        }
        let entry_count = reader.read_u64::<LittleEndian>()?;
        if entry_count > MAX_ARCHIVE_ENTRIES {
            return Err(Error::InvalidArgument);
        }

        self.clear();

        let mut loaded = 0u64;
        for _ in 0..entry_count {
            let ip = reader.read_u32::<LittleEndian>()?;
            let score = reader.read_i16::<LittleEndian>()?;
            if score == 0 {
                continue;
            }
            self.set(ip, score);
            loaded += 1;
        }

        counter!("ipscore_archive_entries_loaded_total").increment(loaded);
        info!("loaded {} entries from {}", loaded, target.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmp_name_is_sibling_with_pid() {
        let tmp = tmp_path_for(Path::new("/var/lib/scores.bin"));
        let name = tmp.to_string_lossy();
        assert!(name.starts_with("/var/lib/scores.bin.tmp."));
        assert!(name.ends_with(&std::process::id().to_string()));
    }
}
