//! Request dispatch loop.
//!
//! Pulls one frame at a time from the bus, routes it by topic and publishes
//! any response before pulling the next. Each frame produces an `Outcome`;
//! failures are contained to the frame that caused them.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::bus::{Publisher, Subscriber};
use crate::error::{CompileError, DecodeError, PersistenceError, TransportError};
use crate::expression::ExpressionSet;
use crate::pattern_set::PatternSetManager;
use crate::protocol::{Notification, Request, RequestToken, ScanPayload};
use crate::reporter::{MatchReporter, StatusReporter};

/// Why a frame was dropped.
#[derive(Debug)]
pub enum DropReason {
    /// Envelope or payload did not decode.
    Decode(DecodeError),
    /// Reconfigure rejected; previous rules still active.
    Compile(CompileError),
    /// A response could not be handed to the bus.
    Publish(TransportError),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode: {e}"),
            Self::Compile(e) => write!(f, "compile: {e}"),
            Self::Publish(e) => write!(f, "publish: {e}"),
        }
    }
}

/// Result of handling one inbound frame.
#[derive(Debug)]
pub enum Outcome {
    /// Scan ran (or was a no-op with no matcher).
    Scanned {
        /// Number of match callbacks the engine produced.
        matches: usize,
        /// Whether a match notification was published.
        notified: bool,
    },
    /// Rule set changed. The new rules are live whatever the flags say.
    Reconfigured {
        patterns: usize,
        /// `Err` if the new state is live but not on disk.
        persisted: Result<(), PersistenceError>,
        /// False if the cache invalidation could not be published.
        invalidated: bool,
    },
    StatusReported,
    /// Topic not handled by this service.
    Ignored {
        topic: String,
    },
    Dropped(DropReason),
}

impl Outcome {
    #[must_use]
    pub const fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped(_))
    }
}

/// Loop counters, for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub handled: u64,
    pub dropped: u64,
    pub ignored: u64,
}

/// Routes inbound frames to scan, reconfigure and status handling.
pub struct Dispatcher<P: Publisher> {
    patterns: Arc<PatternSetManager>,
    status: StatusReporter,
    publisher: P,
    stats: DispatchStats,
}

impl<P: Publisher> Dispatcher<P> {
    #[must_use]
    pub fn new(patterns: Arc<PatternSetManager>, status: StatusReporter, publisher: P) -> Self {
        Self {
            patterns,
            status,
            publisher,
            stats: DispatchStats::default(),
        }
    }

    #[must_use]
    pub const fn stats(&self) -> DispatchStats {
        self.stats
    }

    #[must_use]
    pub fn patterns(&self) -> &Arc<PatternSetManager> {
        &self.patterns
    }

    /// Runs until the subscriber reports the bus closed or broken.
    ///
    /// A bad frame (`FrameTooLarge`) is skipped and the loop keeps pulling.
    /// I/O and disconnect errors end the loop so the caller can reconnect.
    pub fn run<S: Subscriber>(&mut self, subscriber: &mut S) -> DispatchStats {
        info!(service = self.status.service_name(), "dispatch loop started");
        loop {
            let raw = match subscriber.recv() {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e @ (TransportError::Io(_) | TransportError::Disconnected { .. })) => {
                    error!(error = %e, "subscriber failed; leaving dispatch loop");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "receive failed");
                    continue;
                }
            };

            if let Outcome::Dropped(reason) = self.handle_one(&raw) {
                warn!(
                    %reason,
                    message = %String::from_utf8_lossy(&raw),
                    "dropped message"
                );
            }
        }
        info!(
            handled = self.stats.handled,
            dropped = self.stats.dropped,
            ignored = self.stats.ignored,
            "dispatch loop stopped"
        );
        self.stats
    }

    /// Handles one raw frame to completion. Never panics on bad input.
    pub fn handle_one(&mut self, raw: &[u8]) -> Outcome {
        let outcome = match Request::decode(raw) {
            Ok(request) => self.route(request),
            Err(e) => Outcome::Dropped(DropReason::Decode(e)),
        };

        self.stats.handled += 1;
        match outcome {
            Outcome::Dropped(_) => self.stats.dropped += 1,
            Outcome::Ignored { .. } => self.stats.ignored += 1,
            _ => {}
        }
        outcome
    }

    fn route(&mut self, request: Request) -> Outcome {
        match request {
            Request::Scan { token, payload } => self.scan(token, &payload),
            Request::Reconfigure { add, remove } => self.reconfigure(&add, &remove),
            Request::Status { token } => self.report_status(token),
            Request::Unknown { topic } => {
                debug!(%topic, "ignoring unknown topic");
                Outcome::Ignored { topic }
            }
        }
    }

    fn scan(&self, token: RequestToken, payload: &ScanPayload) -> Outcome {
        let snapshot = self.patterns.current();
        let Some(matcher) = snapshot.matcher.as_ref() else {
            debug!("no matcher loaded; scan is a no-op");
            return Outcome::Scanned {
                matches: 0,
                notified: false,
            };
        };

        let bytes = payload.as_bytes();
        debug!(len = bytes.len(), "scanning");

        let reporter = MatchReporter::new(token);
        let scanned = matcher.scan(bytes, |_| reporter.on_match(|note| self.publish(note)));

        match scanned {
            Ok(matches) => Outcome::Scanned {
                matches,
                notified: reporter.notified(),
            },
            Err(e) => Outcome::Dropped(DropReason::Publish(e)),
        }
    }

    fn reconfigure(&self, add: &ExpressionSet, remove: &ExpressionSet) -> Outcome {
        let outcome = match self.patterns.update(add, remove) {
            Ok(outcome) => outcome,
            Err(e) => return Outcome::Dropped(DropReason::Compile(e)),
        };

        let service_name = self.status.service_name().to_string();
        let invalidated = match self.publish(&Notification::CacheInvalidate {
            service_name: service_name.clone(),
        }) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "rules changed but cache invalidation was not published");
                false
            }
        };

        if let Err(ref persist_err) = outcome.persisted {
            let note = Notification::PersistFailed {
                service_name,
                reason: persist_err.to_string(),
            };
            if let Err(e) = self.publish(&note) {
                warn!(error = %e, "could not announce persistence failure");
            }
        }

        Outcome::Reconfigured {
            patterns: self.patterns.current().expressions.len(),
            persisted: outcome.persisted,
            invalidated,
        }
    }

    fn report_status(&self, token: RequestToken) -> Outcome {
        let snapshot = self.patterns.current();
        let response = self.status.report(token, &snapshot.expressions);
        match self.publish(&Notification::Status(response)) {
            Ok(()) => Outcome::StatusReported,
            Err(e) => Outcome::Dropped(DropReason::Publish(e)),
        }
    }

    fn publish(&self, note: &Notification) -> Result<(), TransportError> {
        let frame = note.encode()?;
        self.publisher.publish(&frame)?;
        debug!(topic = note.topic(), "published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::config::ServiceConfig;
    use crate::storage::DurableStore;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct RecordingPublisher {
        frames: Mutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, frame: &[u8]) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Disconnected {
                    path: "test".to_string(),
                });
            }
            self.frames.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
    }

    impl RecordingPublisher {
        fn notifications(&self) -> Vec<Notification> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| Notification::decode(f).unwrap())
                .collect()
        }
    }

    fn dispatcher(publisher: RecordingPublisher) -> (TempDir, Dispatcher<Arc<RecordingPublisher>>, Arc<RecordingPublisher>) {
        let dir = tempdir().unwrap();
        let store = DurableStore::open(&ServiceConfig::with_state_dir(dir.path())).unwrap();
        let patterns = Arc::new(PatternSetManager::initialize(store).unwrap());
        let publisher = Arc::new(publisher);
        let d = Dispatcher::new(patterns, StatusReporter::new("basalisk"), Arc::clone(&publisher));
        (dir, d, publisher)
    }

    fn frame(req: &Request) -> Vec<u8> {
        req.encode().unwrap()
    }

    fn set(values: &[&str]) -> ExpressionSet {
        ExpressionSet::from_strs(values.iter().copied()).unwrap()
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let (_dir, mut d, publisher) = dispatcher(RecordingPublisher::default());
        let outcome = d.handle_one(b"\x92\xaebasalisk.offer");
        assert!(matches!(outcome, Outcome::Dropped(DropReason::Decode(_))));
        assert!(publisher.notifications().is_empty());
        assert_eq!(d.stats().dropped, 1);
    }

    #[test]
    fn test_unknown_topic_is_ignored() {
        let (_dir, mut d, publisher) = dispatcher(RecordingPublisher::default());
        let outcome = d.handle_one(br#"["other.topic", 1]"#);
        assert!(matches!(outcome, Outcome::Ignored { ref topic } if topic == "other.topic"));
        assert!(publisher.notifications().is_empty());
        assert_eq!(d.stats().ignored, 1);
    }

    #[test]
    fn test_multiple_matches_publish_once() {
        let (_dir, mut d, publisher) = dispatcher(RecordingPublisher::default());
        d.handle_one(&frame(&Request::Reconfigure {
            add: set(&["foo", "o", "xx"]),
            remove: ExpressionSet::new(),
        }));
        publisher.frames.lock().unwrap().clear();

        let outcome = d.handle_one(&frame(&Request::Scan {
            token: RequestToken::new("t"),
            payload: ScanPayload::Bytes(b"xxfooxx".to_vec()),
        }));
        match outcome {
            Outcome::Scanned { matches, notified } => {
                assert_eq!(matches, 3);
                assert!(notified);
            }
            other => panic!("expected scan outcome, got {other:?}"),
        }
        assert_eq!(
            publisher.notifications(),
            vec![Notification::MatchFound {
                token: RequestToken::new("t")
            }]
        );
    }

    #[test]
    fn test_compile_error_is_dropped_without_invalidation() {
        let (_dir, mut d, publisher) = dispatcher(RecordingPublisher::default());
        let outcome = d.handle_one(&frame(&Request::Reconfigure {
            add: set(&["(unclosed"]),
            remove: ExpressionSet::new(),
        }));
        assert!(matches!(outcome, Outcome::Dropped(DropReason::Compile(_))));
        assert!(publisher.notifications().is_empty());
    }

    #[test]
    fn test_publish_failure_is_contained() {
        let (_dir, mut d, _publisher) = dispatcher(RecordingPublisher {
            fail: true,
            ..RecordingPublisher::default()
        });
        let outcome = d.handle_one(&frame(&Request::Scan {
            token: RequestToken::new(1),
            payload: ScanPayload::Text("https://discord.gg/abc".to_string()),
        }));
        assert!(matches!(outcome, Outcome::Dropped(DropReason::Publish(_))));

        // Loop state is intact: the next frame is handled normally.
        let outcome = d.handle_one(&frame(&Request::Scan {
            token: RequestToken::new(2),
            payload: ScanPayload::Text("nothing here".to_string()),
        }));
        assert!(matches!(outcome, Outcome::Scanned { notified: false, .. }));
    }

    #[test]
    fn test_status_reports_current_patterns() {
        let (_dir, mut d, publisher) = dispatcher(RecordingPublisher::default());
        let outcome = d.handle_one(&frame(&Request::Status {
            token: RequestToken::new(7),
        }));
        assert!(matches!(outcome, Outcome::StatusReported));

        let notes = publisher.notifications();
        let [Notification::Status(resp)] = notes.as_slice() else {
            panic!("expected one status response, got {notes:?}");
        };
        assert_eq!(resp.token, RequestToken::new(7));
        assert_eq!(resp.service_name, "basalisk");
        assert_eq!(resp.details.patterns, d.patterns().current().expressions.to_strings());
    }

    #[test]
    fn test_save_failure_announces_after_invalidation() {
        let (dir, mut d, publisher) = dispatcher(RecordingPublisher::default());
        // A non-empty directory where the expression list belongs cannot be renamed over.
        std::fs::create_dir_all(dir.path().join("expressions.txt").join("x")).unwrap();

        let outcome = d.handle_one(&frame(&Request::Reconfigure {
            add: set(&["foo"]),
            remove: ExpressionSet::new(),
        }));
        match outcome {
            Outcome::Reconfigured {
                persisted, invalidated, ..
            } => {
                assert!(matches!(persisted, Err(PersistenceError::Io { .. })));
                assert!(invalidated);
            }
            other => panic!("expected reconfigure outcome, got {other:?}"),
        }

        let notes = publisher.notifications();
        assert_eq!(notes.len(), 2);
        assert_eq!(
            notes[0],
            Notification::CacheInvalidate {
                service_name: "basalisk".to_string()
            }
        );
        match &notes[1] {
            Notification::PersistFailed { service_name, reason } => {
                assert_eq!(service_name, "basalisk");
                assert!(reason.contains("expressions.txt"));
            }
            other => panic!("expected persist_failed, got {other:?}"),
        }

        // The new rule serves scans even though it never reached disk.
        let outcome = d.handle_one(&frame(&Request::Scan {
            token: RequestToken::new("after"),
            payload: ScanPayload::Text("xxfooxx".to_string()),
        }));
        assert!(matches!(outcome, Outcome::Scanned { notified: true, .. }));
    }

    #[test]
    fn test_unpublished_invalidation_still_reports_reconfigure() {
        let (_dir, mut d, _publisher) = dispatcher(RecordingPublisher {
            fail: true,
            ..RecordingPublisher::default()
        });
        let outcome = d.handle_one(&frame(&Request::Reconfigure {
            add: set(&["foo"]),
            remove: ExpressionSet::new(),
        }));
        match outcome {
            Outcome::Reconfigured {
                persisted, invalidated, ..
            } => {
                assert!(persisted.is_ok());
                assert!(!invalidated);
            }
            other => panic!("expected reconfigure outcome, got {other:?}"),
        }
        assert_eq!(d.stats().dropped, 0);

        let snapshot = d.patterns().current();
        assert!(snapshot.matcher.as_ref().unwrap().is_match(b"foo"));
    }

    /// Replays a fixed script, then fails forever with the given error.
    struct ScriptedSubscriber {
        script: std::collections::VecDeque<Result<Option<Vec<u8>>, TransportError>>,
        calls: usize,
    }

    impl Subscriber for ScriptedSubscriber {
        fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
            self.calls += 1;
            assert!(self.calls < 100, "dispatch loop kept polling a broken subscriber");
            self.script.pop_front().unwrap_or_else(|| {
                Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "reset",
                )))
            })
        }
    }

    #[test]
    fn test_run_skips_bad_frames_and_stops_on_io_error() {
        let (_dir, mut d, publisher) = dispatcher(RecordingPublisher::default());
        let mut subscriber = ScriptedSubscriber {
            script: [
                Err(TransportError::FrameTooLarge { size: 10, max: 1 }),
                Ok(Some(frame(&Request::Status {
                    token: RequestToken::new(1),
                }))),
            ]
            .into(),
            calls: 0,
        };

        let stats = d.run(&mut subscriber);
        assert_eq!(stats.handled, 1);
        assert_eq!(subscriber.calls, 3);
        assert_eq!(publisher.notifications().len(), 1);
    }
}
