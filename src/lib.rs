//! # Basalisk
//!
//! A long-running scanning service. Byte payloads arrive over a message bus,
//! are tested against a live set of regular-expression rules, and a single
//! notification is published per request that matches.
//!
//! ## Core Concepts
//!
//! - **Expression**: one pattern rule in `regex` syntax
//! - **ExpressionSet**: the active rules; the single source of truth
//! - **Matcher**: immutable compiled form of a set, swapped by reference on update
//! - **DurableStore**: crash-safe persistence of the set and its matcher
//! - **Dispatcher**: the one-frame-at-a-time request loop
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use basalisk::{bus, Dispatcher, DurableStore, PatternSetManager, ServiceConfig, StatusReporter};
//!
//! let config = ServiceConfig::with_state_dir("./state").validate()?;
//! let store = DurableStore::open(&config)?;
//! let patterns = Arc::new(PatternSetManager::initialize(store)?);
//!
//! let (handle, mut subscriber, publisher) = bus::in_process(1024);
//! let mut dispatcher = Dispatcher::new(patterns, StatusReporter::new(&config.service_name), publisher);
//! std::thread::spawn(move || dispatcher.run(&mut subscriber));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod expression;
pub mod matcher;
pub mod pattern_set;
pub mod protocol;
pub mod reporter;
pub mod storage;

pub use config::ServiceConfig;
pub use dispatcher::{DispatchStats, Dispatcher, DropReason, Outcome};
pub use error::{
    BasaliskError, BasaliskResult, CompileError, DecodeError, PersistenceError, TransportError,
};
pub use expression::{Expression, ExpressionSet};
pub use matcher::{CompileOptions, MatchEvent, Matcher, DEFAULT_EXPRESSION};
pub use pattern_set::{PatternSetManager, Snapshot, UpdateOutcome};
pub use protocol::{topics, Notification, Request, RequestToken, ScanPayload, StatusResponse};
pub use reporter::{MatchReporter, OneShotLatch, StatusReporter};
pub use storage::{DurableStore, RecoverySource};
