//! Stream-update notifications.
//!
//! Subscribers receive the id of every stream whose append committed, after
//! the commit. Delivery is bounded per subscriber: a subscriber that falls
//! behind the publisher observes [`Error::Lagged`] with the number of dropped
//! updates instead of blocking the committing writer.

use std::sync::RwLock;

use tokio::sync::broadcast;

use crate::{Error, Result, event::StreamId};

/// Updates buffered per subscriber before the oldest are dropped.
const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug)]
pub(crate) struct StreamUpdatePublisher {
    sender: RwLock<Option<broadcast::Sender<StreamId>>>,
}

impl StreamUpdatePublisher {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIPTION_BUFFER);
        Self {
            sender: RwLock::new(Some(sender)),
        }
    }

    /// Registers a subscription filtered on `stream_id` (or all streams).
    pub(crate) fn subscribe(&self, stream_id: StreamId) -> StreamUpdateSubscription {
        let guard = self.sender.read().expect("publisher lock poisoned");
        let receiver = match guard.as_ref() {
            Some(sender) => sender.subscribe(),
            // Publisher already closed: hand out a receiver that reports
            // closed on first recv.
            None => broadcast::channel(1).1,
        };
        StreamUpdateSubscription {
            stream_id,
            receiver,
        }
    }

    /// Fans a committed update out to every subscriber. Holds the read lock
    /// only; a send without receivers is not an error.
    pub(crate) fn publish(&self, stream_id: &StreamId) {
        let guard = self.sender.read().expect("publisher lock poisoned");
        if let Some(sender) = guard.as_ref() {
            let _ = sender.send(stream_id.clone());
        }
    }

    /// Closes every outstanding subscription.
    pub(crate) fn close(&self) {
        self.sender
            .write()
            .expect("publisher lock poisoned")
            .take();
    }
}

/// A subscription to stream-update notifications.
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct StreamUpdateSubscription {
    stream_id: StreamId,
    receiver: broadcast::Receiver<StreamId>,
}

impl StreamUpdateSubscription {
    /// Waits for the next matching update.
    ///
    /// Returns `None` once the publisher shut down, and `Some(Err(Lagged))`
    /// when the subscriber fell behind and updates were dropped.
    pub async fn recv(&mut self) -> Option<Result<StreamId>> {
        loop {
            match self.receiver.recv().await {
                Ok(updated) => {
                    if self.stream_id.is_all() || updated == self.stream_id {
                        return Some(Ok(updated));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(Err(Error::Lagged(n)));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns a matching update if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Result<StreamId>> {
        loop {
            match self.receiver.try_recv() {
                Ok(updated) => {
                    if self.stream_id.is_all() || updated == self.stream_id {
                        return Some(Ok(updated));
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(Error::Lagged(n)));
                }
                Err(_) => return None,
            }
        }
    }
}
