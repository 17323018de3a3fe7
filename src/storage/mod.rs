//! Crash-safe persistence for the pattern set.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 DurableStore                 │
//! ├──────────────────────────────────────────────┤
//! │  matcher.blob        expressions.txt         │
//! │  (codec frame)       (newline list)          │
//! │        │                   │                 │
//! │        └──── AtomicFile ───┘                 │
//! │   temp → fsync → rename → fsync(dir)         │
//! │                                              │
//! │          .lock (flock / LockFileEx)          │
//! └──────────────────────────────────────────────┘
//! ```

mod atomic;
mod codec;
mod durable;

pub(crate) use atomic::TEMP_MARKER;
pub use atomic::{replace, AtomicFile};
pub use codec::{decode_file, encode_file, MAGIC};
pub use durable::{DurableStore, Recovered, RecoverySource, LOCK_FILE};
