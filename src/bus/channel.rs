use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::error::TransportError;

use super::{Publisher, Subscriber};

/// Test/embedding side of an in-process bus.
///
/// `send` feeds the service's subscriber; `next_outbound` drains what the
/// service published. Dropping the handle closes the inbound side.
#[derive(Debug)]
pub struct BusHandle {
    inbound: Sender<Vec<u8>>,
    outbound: Receiver<Vec<u8>>,
}

impl BusHandle {
    /// Queues one inbound frame, blocking while the queue is full.
    pub fn send(&self, frame: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        self.inbound.send(frame.into()).map_err(|_| TransportError::Disconnected {
            path: "inbound".to_string(),
        })
    }

    /// Waits up to `timeout` for the next published frame.
    pub fn next_outbound(&self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        match self.outbound.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected {
                path: "outbound".to_string(),
            }),
        }
    }

    /// Everything published so far, without waiting.
    #[must_use]
    pub fn drain_outbound(&self) -> Vec<Vec<u8>> {
        self.outbound.try_iter().collect()
    }

    /// Splits into raw channel ends.
    #[must_use]
    pub fn into_parts(self) -> (Sender<Vec<u8>>, Receiver<Vec<u8>>) {
        (self.inbound, self.outbound)
    }
}

/// Service-side inbound end.
#[derive(Debug)]
pub struct ChannelSubscriber {
    rx: Receiver<Vec<u8>>,
}

impl Subscriber for ChannelSubscriber {
    fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.recv().ok())
    }
}

/// Service-side outbound end.
///
/// Never blocks the dispatch loop: a full outbound queue is a publish error.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: Sender<Vec<u8>>,
}

impl Publisher for ChannelPublisher {
    fn publish(&self, frame: &[u8]) -> Result<(), TransportError> {
        match self.tx.try_send(frame.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::Disconnected {
                path: "outbound (queue full)".to_string(),
            }),
            Err(TrySendError::Disconnected(_)) => Err(TransportError::Disconnected {
                path: "outbound".to_string(),
            }),
        }
    }
}

/// Creates an in-process bus with `capacity` frames of buffering per direction.
#[must_use]
pub fn in_process(capacity: usize) -> (BusHandle, ChannelSubscriber, ChannelPublisher) {
    let capacity = capacity.max(1);
    let (inbound_tx, inbound_rx) = bounded(capacity);
    let (outbound_tx, outbound_rx) = bounded(capacity);
    (
        BusHandle {
            inbound: inbound_tx,
            outbound: outbound_rx,
        },
        ChannelSubscriber { rx: inbound_rx },
        ChannelPublisher { tx: outbound_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_flow_both_ways() {
        let (handle, mut sub, publisher) = in_process(4);

        handle.send(b"in".to_vec()).unwrap();
        assert_eq!(sub.recv().unwrap(), Some(b"in".to_vec()));

        publisher.publish(b"out").unwrap();
        assert_eq!(
            handle.next_outbound(Duration::from_millis(100)).unwrap(),
            Some(b"out".to_vec())
        );
    }

    #[test]
    fn test_dropping_handle_closes_subscriber() {
        let (handle, mut sub, _publisher) = in_process(4);
        handle.send(b"last".to_vec()).unwrap();
        drop(handle);

        assert_eq!(sub.recv().unwrap(), Some(b"last".to_vec()));
        assert_eq!(sub.recv().unwrap(), None);
    }

    #[test]
    fn test_full_outbound_queue_is_an_error() {
        let (_handle, _sub, publisher) = in_process(1);
        publisher.publish(b"a").unwrap();
        assert!(publisher.publish(b"b").is_err());
    }

    #[test]
    fn test_next_outbound_times_out() {
        let (handle, _sub, _publisher) = in_process(1);
        assert_eq!(handle.next_outbound(Duration::from_millis(10)).unwrap(), None);
    }
}
