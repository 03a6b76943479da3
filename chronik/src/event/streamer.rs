//! Paged, pull-based readers over a stream.
//!
//! [`EventPages`] drains committed events page by page. [`FollowedEvents`]
//! first catches up, then waits on a stream-update subscription and drains
//! again after every commit, until the cancellation token fires.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    Result,
    event::{EventLog, RawEvent, StreamId},
    index::LimitOffset,
};

/// Default page size of the streamer readers.
pub const DEFAULT_PAGE_SIZE: u64 = 50;

/// A paged reader factory over one stream of an [`EventLog`].
#[derive(Debug, Clone)]
pub struct Streamer {
    log: Arc<EventLog>,
    stream_id: StreamId,
}

impl Streamer {
    /// Creates a streamer over `stream_id` (possibly `"$all"`).
    pub fn new(log: Arc<EventLog>, stream_id: StreamId) -> Self {
        Self { log, stream_id }
    }

    /// Reads committed events from `version` on, page by page, until the log
    /// is drained.
    pub fn load_from(&self, version: u64, cancel: CancellationToken) -> EventPages {
        EventPages {
            log: Arc::clone(&self.log),
            stream_id: self.stream_id.clone(),
            from_version: version,
            page_size: DEFAULT_PAGE_SIZE,
            done: false,
            cancel,
        }
    }

    /// Like [`Streamer::load_from`], but keeps following the stream: after
    /// draining, waits for the next committed update and drains again.
    pub fn follow(&self, version: u64, cancel: CancellationToken) -> FollowedEvents {
        let subscription = self.log.subscribe(self.stream_id.clone());
        FollowedEvents {
            pages: self.load_from(version, cancel.clone()),
            subscription,
            cancel,
        }
    }
}

/// Pull-based pages of committed events.
#[derive(Debug)]
pub struct EventPages {
    log: Arc<EventLog>,
    stream_id: StreamId,
    from_version: u64,
    page_size: u64,
    done: bool,
    cancel: CancellationToken,
}

impl EventPages {
    /// Overrides the page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    /// Returns the next page, or `None` once the stream is drained or the
    /// cancellation token fired.
    pub async fn next_page(&mut self) -> Option<Result<Vec<RawEvent>>> {
        if self.done || self.cancel.is_cancelled() {
            return None;
        }
        match self.fetch().await {
            Ok(None) => {
                self.done = true;
                None
            }
            Ok(Some(events)) => Some(Ok(events)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }

    /// Loads one page and advances the cursor past it. Cursors follow the
    /// persisted indexes, which may carry gaps after a purge.
    async fn fetch(&mut self) -> Result<Option<Vec<RawEvent>>> {
        let events = self
            .log
            .load_slice_from_version(
                &self.stream_id,
                self.from_version,
                LimitOffset::new(self.page_size, 0),
            )
            .await?;
        let Some(last) = events.last() else {
            return Ok(None);
        };
        self.from_version = if self.stream_id.is_all() {
            last.store_index + 1
        } else {
            last.stream_index + 1
        };
        Ok(Some(events))
    }
}

/// Pull-based pages over a live stream: catch-up first, then one drain per
/// committed update.
#[derive(Debug)]
pub struct FollowedEvents {
    pages: EventPages,
    subscription: crate::event::StreamUpdateSubscription,
    cancel: CancellationToken,
}

impl FollowedEvents {
    /// Returns the next page, waiting for further commits once the stream is
    /// drained. Returns `None` when cancelled or when the publisher shut
    /// down; a lagged subscription is not an error here, the follow-up drain
    /// reads whatever was committed.
    pub async fn next_page(&mut self) -> Option<Result<Vec<RawEvent>>> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.pages.fetch().await {
                Ok(Some(events)) => return Some(Ok(events)),
                Err(e) => return Some(Err(e)),
                Ok(None) => {}
            }
            tokio::select! {
                () = self.cancel.cancelled() => return None,
                update = self.subscription.recv() => match update {
                    None => return None,
                    Some(Ok(_) | Err(_)) => {}
                },
            }
        }
    }
}
