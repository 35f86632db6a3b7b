//! Durable file primitives shared by the state store, shards and tables.
//!
//! Every persisted artifact goes through `AtomicFile`: bytes land in a
//! temporary sibling, are synced, and are renamed over the target. A reader
//! of the target path sees either the complete old file or the complete new
//! one.

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::warn;

/// Compression applied to persisted tables and shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    /// File-name suffix for this compression.
    pub fn suffix(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
        }
    }
    
    /// Infers compression from a file name.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => Compression::Gzip,
            _ => Compression::None,
        }
    }
}

/// A file written through a temporary sibling and renamed into place.
///
/// Dropping an uncommitted `AtomicFile` removes the temporary file, so every
/// early return or `?` leaves the target untouched and no debris behind.
pub struct AtomicFile {
    target: PathBuf,
    tmp: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl AtomicFile {
    /// Creates the temporary file next to `target`.
    pub fn create(target: &Path) -> io::Result<Self> {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let name = target
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("tmpfile");
        let tmp = target.with_file_name(format!(
            ".{}.tmp.{}.{}",
            name,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let file = File::create(&tmp)?;
        Ok(Self {
            target: target.to_path_buf(),
            tmp,
            writer: Some(BufWriter::new(file)),
        })
    }
    
    /// Flushes, syncs and renames the file over its target.
    pub fn commit(mut self) -> io::Result<()> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "atomic file already committed"))?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        
        if let Err(e) = fs::rename(&self.tmp, &self.target) {
            let _ = fs::remove_file(&self.tmp);
            return Err(e);
        }
        if let Some(parent) = self.target.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.writer.as_mut() {
            Some(w) => w.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "atomic file already committed")),
        }
    }
    
    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

/// Atomically replaces `path` with `bytes`, compressing when asked.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8], compression: Compression) -> io::Result<()> {
    let mut file = AtomicFile::create(path)?;
    match compression {
        Compression::None => file.write_all(bytes)?,
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(&mut file, flate2::Compression::default());
            encoder.write_all(bytes)?;
            encoder.finish()?;
        }
    }
    file.commit()
}

/// Atomically writes pretty JSON.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> crate::error::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes, Compression::None)?;
    Ok(())
}

/// Opens a file for buffered reading, transparently gunzipping `.gz` files.
pub fn open_reader(path: &Path) -> io::Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    Ok(match Compression::from_path(path) {
        Compression::Gzip => Box::new(BufReader::new(GzDecoder::new(file))),
        Compression::None => Box::new(BufReader::new(file)),
    })
}

/// Reads a whole (possibly gzipped) file.
pub fn read_all(path: &Path) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    open_reader(path)?.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Best-effort free-space check for the filesystem holding `path`.
///
/// Logs a warning when less than `warn_below_mb` MiB are available and
/// returns the available MiB when the mount could be identified. Never
/// fails the caller.
pub fn check_disk_space(path: &Path, warn_below_mb: u64) -> Option<u64> {
    let probe = path
        .ancestors()
        .find(|p| p.exists())
        .and_then(|p| p.canonicalize().ok())?;
    
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .filter(|d| probe.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())?;
    
    let available_mb = disk.available_space() / (1024 * 1024);
    if available_mb < warn_below_mb {
        warn!(
            "Low disk space on {}: {} MiB free (threshold {} MiB) while writing {}",
            disk.mount_point().display(),
            available_mb,
            warn_below_mb,
            path.display()
        );
    }
    Some(available_mb)
}
