//! Match and status reporting.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::expression::ExpressionSet;
use crate::protocol::{Notification, RequestToken, StatusDetails, StatusResponse};

/// Guard that lets an action fire at most once.
#[derive(Debug, Default)]
pub struct OneShotLatch {
    fired: AtomicBool,
}

impl OneShotLatch {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    /// Returns true exactly once: for the first caller.
    pub fn try_fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Emits at most one match notification for one scan request.
///
/// Built per scan call; the engine may report many occurrences, only the
/// first one publishes.
#[derive(Debug)]
pub struct MatchReporter {
    token: RequestToken,
    latch: OneShotLatch,
}

impl MatchReporter {
    #[must_use]
    pub const fn new(token: RequestToken) -> Self {
        Self {
            token,
            latch: OneShotLatch::new(),
        }
    }

    /// Handles one match callback. `publish` runs only on the first call.
    pub fn on_match<E>(&self, publish: impl FnOnce(&Notification) -> Result<(), E>) -> Result<(), E> {
        if !self.latch.try_fire() {
            return Ok(());
        }
        publish(&Notification::MatchFound {
            token: self.token.clone(),
        })
    }

    /// True once a notification has been handed to `publish`.
    #[must_use]
    pub fn notified(&self) -> bool {
        self.latch.has_fired()
    }
}

/// Answers status queries.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    service_name: String,
    started_at: DateTime<Utc>,
}

impl StatusReporter {
    /// Records the start time now.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self::started_at(service_name, Utc::now())
    }

    #[must_use]
    pub fn started_at(service_name: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            service_name: service_name.into(),
            started_at,
        }
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Builds the response for `token` against the given expression snapshot.
    #[must_use]
    pub fn report(&self, token: RequestToken, expressions: &ExpressionSet) -> StatusResponse {
        self.report_at(token, expressions, Utc::now())
    }

    fn report_at(&self, token: RequestToken, expressions: &ExpressionSet, now: DateTime<Utc>) -> StatusResponse {
        StatusResponse {
            token,
            service_name: self.service_name.clone(),
            started_at: self.started_at,
            details: StatusDetails {
                patterns: expressions.to_strings(),
                uptime_secs: (now - self.started_at).num_seconds().max(0),
            },
        }
    }
}
