//! Atomic file replacement.
//!
//! Every persisted artifact is written through `AtomicFile`:
//! 1. write to a uniquely named temp file in the target's directory
//! 2. flush and fsync the temp file
//! 3. rename it over the target
//! 4. fsync the containing directory so the rename itself is durable
//!
//! A crash before step 3 leaves the old target untouched (plus a stray temp
//! file); a crash after it leaves the complete new file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Marker embedded in temp file names.
pub(crate) const TEMP_MARKER: &str = ".tmp.";

/// In-progress replacement of a single file.
///
/// Dropping without `commit` removes the temp file (best effort).
#[derive(Debug)]
pub struct AtomicFile {
    temp_path: Option<PathBuf>,
    target: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl AtomicFile {
    /// Opens a temp file next to `target`.
    pub fn create(target: &Path) -> IoResult<Self> {
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "target has no file name"))?;
        let temp_path = target.with_file_name(format!("{file_name}{TEMP_MARKER}{}", Uuid::new_v4()));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        Ok(Self {
            temp_path: Some(temp_path),
            target: target.to_path_buf(),
            writer: Some(BufWriter::new(file)),
        })
    }

    /// Path of the temp file, until committed.
    #[must_use]
    pub fn temp_path(&self) -> Option<&Path> {
        self.temp_path.as_deref()
    }

    /// Appends bytes to the temp file.
    pub fn write_all(&mut self, bytes: &[u8]) -> IoResult<()> {
        self.writer
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "writer already consumed"))?
            .write_all(bytes)
    }

    /// Flush, fsync, rename, fsync directory.
    ///
    /// This is the commit point: once it returns, the new contents survive a crash.
    pub fn commit(mut self) -> IoResult<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "writer already consumed"))?;
        let temp_path = self
            .temp_path
            .take()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "temp_path already consumed"))?;

        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        if let Err(e) = fs::rename(&temp_path, &self.target) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        sync_parent_dir(&self.target)
    }

    /// Abandons the write and removes the temp file.
    pub fn abort(mut self) -> IoResult<()> {
        self.writer.take();
        if let Some(temp_path) = self.temp_path.take() {
            if temp_path.exists() {
                fs::remove_file(temp_path)?;
            }
        }
        Ok(())
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        self.writer.take();
        if let Some(ref temp_path) = self.temp_path {
            if temp_path.exists() {
                let _ = fs::remove_file(temp_path);
            }
        }
    }
}

/// Replaces `target` with `bytes` atomically.
pub fn replace(target: &Path, bytes: &[u8]) -> IoResult<()> {
    let mut file = AtomicFile::create(target)?;
    file.write_all(bytes)?;
    file.commit()
}

/// True if `path` looks like a temp file left behind by an interrupted replace.
pub(crate) fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains(TEMP_MARKER))
}

#[cfg(unix)]
fn sync_parent_dir(target: &Path) -> IoResult<()> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()
}

// Directories cannot be opened for fsync here; the rename is as durable as the platform makes it.
#[cfg(not(unix))]
fn sync_parent_dir(_target: &Path) -> IoResult<()> {
    Ok(())
}
