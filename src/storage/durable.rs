//! Durable store for the expression set and its compiled matcher.
//!
//! Two artifacts live in the state directory, each replaced atomically:
//! the framed matcher blob and the newline-delimited expression list.
//! The blob records the digest of the set it was compiled from, so a crash
//! between the two replaces is detected on load.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::{BasaliskResult, PersistenceError};
use crate::expression::ExpressionSet;
use crate::matcher::{default_matcher, CompileOptions, Matcher, MatcherRecord};

use super::atomic::{self, is_temp_file};
use super::codec;

/// Which recovery path produced the starting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    /// Blob and set file were both valid and consistent.
    Persisted,
    /// Blob missing or unusable; matcher recompiled from the set file.
    Recompiled,
    /// Set file present but empty: no matcher.
    Empty,
    /// Nothing usable on disk; built-in default expression.
    Default,
}

/// State returned by `DurableStore::load`.
#[derive(Debug)]
pub struct Recovered {
    pub matcher: Option<Matcher>,
    pub expressions: ExpressionSet,
    pub source: RecoverySource,
}

/// Name of the lock file inside the state directory.
pub const LOCK_FILE: &str = ".lock";

enum SetFile {
    Missing,
    Unusable(String),
    Parsed(ExpressionSet),
}

/// File-backed persistence for the pattern set.
///
/// Holds an exclusive lock on the state directory for its whole lifetime.
#[derive(Debug)]
pub struct DurableStore {
    dir: PathBuf,
    matcher_path: PathBuf,
    expressions_path: PathBuf,
    options: CompileOptions,
    /// Open for the store's lifetime; closing it releases the directory.
    _lock: File,
}

impl DurableStore {
    /// Opens (creating if needed) the state directory named by `config`.
    ///
    /// # Errors
    /// - If the directory cannot be created
    /// - If another process holds the state lock
    pub fn open(config: &ServiceConfig) -> Result<Self, PersistenceError> {
        let dir = config.state_dir.clone();
        fs::create_dir_all(&dir).map_err(|e| PersistenceError::io(&dir, e))?;

        let lock = lock_state_dir(&dir)?;

        let store = Self {
            matcher_path: config.matcher_path(),
            expressions_path: config.expressions_path(),
            options: config.compile_options(),
            dir,
            _lock: lock,
        };
        store.sweep_temp_files();
        Ok(store)
    }

    /// The state directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn matcher_path(&self) -> &Path {
        &self.matcher_path
    }

    #[must_use]
    pub fn expressions_path(&self) -> &Path {
        &self.expressions_path
    }

    #[must_use]
    pub const fn compile_options(&self) -> CompileOptions {
        self.options
    }

    /// Recovers the starting state.
    ///
    /// Priority: consistent blob + set file, then recompile from the set file,
    /// then the built-in default. Corrupt or unreadable artifacts are logged and
    /// skipped, never returned as errors.
    ///
    /// # Errors
    /// Only if the built-in default fails to compile under the configured limits.
    pub fn load(&self) -> BasaliskResult<Recovered> {
        let set_file = self.read_expressions();

        if let SetFile::Parsed(ref expressions) = set_file {
            if let Some(matcher) = self.read_matcher(expressions) {
                info!(patterns = expressions.len(), "recovered persisted matcher");
                return Ok(Recovered {
                    matcher: Some(matcher),
                    expressions: expressions.clone(),
                    source: RecoverySource::Persisted,
                });
            }
        }

        match set_file {
            SetFile::Parsed(expressions) if expressions.is_empty() => {
                info!("persisted expression set is empty; starting without a matcher");
                return Ok(Recovered {
                    matcher: None,
                    expressions,
                    source: RecoverySource::Empty,
                });
            }
            SetFile::Parsed(expressions) => match Matcher::compile(&expressions, self.options) {
                Ok(matcher) => {
                    info!(patterns = expressions.len(), "recompiled matcher from persisted expressions");
                    return Ok(Recovered {
                        matcher: Some(matcher),
                        expressions,
                        source: RecoverySource::Recompiled,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "persisted expressions failed to compile; using default");
                }
            },
            SetFile::Unusable(reason) => {
                warn!(path = %self.expressions_path.display(), %reason, "ignoring unusable expression file");
            }
            SetFile::Missing => {
                debug!(path = %self.expressions_path.display(), "no persisted expressions");
            }
        }

        let (matcher, expressions) = default_matcher(self.options)?;
        info!("starting with built-in default expression");
        Ok(Recovered {
            matcher: Some(matcher),
            expressions,
            source: RecoverySource::Default,
        })
    }

    /// Persists `expressions` and its compiled form.
    ///
    /// A non-empty set writes the matcher blob first, then the set file, each
    /// as an independent atomic replace. `matcher` is reused when it was built
    /// from exactly `expressions`; otherwise the set is compiled here. An empty
    /// set writes only the (empty) set file.
    ///
    /// # Errors
    /// Any failure of either replace; the caller must not assume durability.
    pub fn save(&self, matcher: Option<&Matcher>, expressions: &ExpressionSet) -> Result<(), PersistenceError> {
        if !expressions.is_empty() {
            let record = match matcher {
                Some(m) if m.expressions() == expressions => m.to_record(),
                _ => Matcher::compile(expressions, self.options)
                    .map_err(|e| PersistenceError::Encode {
                        reason: e.to_string(),
                    })?
                    .to_record(),
            };

            let blob = codec::encode_file(&record).map_err(|e| PersistenceError::Encode {
                reason: e.to_string(),
            })?;
            atomic::replace(&self.matcher_path, &blob)
                .map_err(|e| PersistenceError::io(&self.matcher_path, e))?;
        }

        atomic::replace(&self.expressions_path, expressions.to_text().as_bytes())
            .map_err(|e| PersistenceError::io(&self.expressions_path, e))?;

        debug!(patterns = expressions.len(), dir = %self.dir.display(), "persisted pattern set");
        Ok(())
    }

    fn read_expressions(&self) -> SetFile {
        match fs::read(&self.expressions_path) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => match ExpressionSet::parse(&text) {
                    Ok(set) => SetFile::Parsed(set),
                    Err(e) => SetFile::Unusable(e.to_string()),
                },
                Err(e) => SetFile::Unusable(format!("not valid UTF-8: {e}")),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => SetFile::Missing,
            Err(e) => SetFile::Unusable(e.to_string()),
        }
    }

    /// Decodes the blob and checks it against the set file. `None` on any mismatch.
    fn read_matcher(&self, expressions: &ExpressionSet) -> Option<Matcher> {
        let bytes = match fs::read(&self.matcher_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.matcher_path.display(), error = %e, "cannot read matcher blob");
                return None;
            }
        };

        let record: MatcherRecord = match codec::decode_file(&bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %self.matcher_path.display(), error = %e, "discarding corrupt matcher blob");
                return None;
            }
        };

        if record.set_digest != expressions.digest() {
            warn!(
                path = %self.matcher_path.display(),
                "matcher blob does not match expression file; recompiling"
            );
            return None;
        }

        match Matcher::from_record(&record) {
            Ok(matcher) => Some(matcher),
            Err(e) => {
                warn!(error = %e, "discarding unusable matcher blob");
                None
            }
        }
    }

    fn sweep_temp_files(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if is_temp_file(&path) {
                match fs::remove_file(&path) {
                    Ok(()) => debug!(path = %path.display(), "removed stale temp file"),
                    Err(e) => warn!(path = %path.display(), error = %e, "cannot remove stale temp file"),
                }
            }
        }
    }
}

/// Takes the exclusive, non-blocking lock on `dir`.
fn lock_state_dir(dir: &Path) -> Result<File, PersistenceError> {
    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| PersistenceError::io(&path, e))?;

    match try_lock_exclusive(&file) {
        Ok(true) => {
            debug!(path = %path.display(), "state directory locked");
            Ok(file)
        }
        Ok(false) => Err(PersistenceError::Locked {
            path: dir.to_path_buf(),
        }),
        Err(e) => Err(PersistenceError::io(&path, e)),
    }
}

/// `Ok(false)` when another handle already holds the lock.
#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the fd is owned by `file` and stays open for the call.
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(windows)]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    // SAFETY: the handle is owned by `file`; OVERLAPPED is plain data.
    let locked = unsafe {
        let mut overlapped = std::mem::zeroed::<OVERLAPPED>();
        LockFileEx(
            file.as_raw_handle() as HANDLE,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    if locked != 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(any(unix, windows)))]
fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
    Err(io::Error::new(
        ErrorKind::Unsupported,
        "state directory locking is not supported on this platform",
    ))
}
