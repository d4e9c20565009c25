//! Versioned getter over a watched collection.

use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{anyhow, Result};
use futures::{stream::BoxStream, StreamExt};
use kube::Resource;
use metrics::counter;
use stagehand_core::{FeedEvent, ListWatch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{FeedVersion, Mirror};

/// Derived value together with the mirror generation it was computed at.
struct Derived<O> {
    generation: u64,
    data: Arc<O>,
}

/// Keeps a mirror of a remote collection current and hands out a value
/// derived from it by `convert`.
///
/// `get` only recomputes when the mirror version moved since the last
/// computation, and concurrent readers that race on the same move share one
/// computation.
pub struct DynamicGetter<T, O, L, F> {
    feed: L,
    mirror: Arc<Mirror<T>>,
    convert: F,
    derived: RwLock<Option<Derived<O>>>,
}

impl<T, O, L, F> DynamicGetter<T, O, L, F>
where
    T: Resource + Clone + Send + Sync + 'static,
    L: ListWatch<T>,
    F: Fn(&[T]) -> O,
{
    pub fn new(feed: L, convert: F) -> Self {
        Self { feed, mirror: Arc::new(Mirror::new()), convert, derived: RwLock::new(None) }
    }

    /// Wait for the initial listing, then keep the mirror current in the
    /// background until `cancel` fires. Fails if the first thing the feed
    /// reports is an error.
    pub async fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let mut events = self.feed.watch();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(anyhow!("cancelled before the initial listing")),
                next = events.next() => next,
            };
            match next {
                Some(Ok(FeedEvent::Restarted(items))) => {
                    let count = items.len();
                    self.mirror.apply(FeedEvent::Restarted(items));
                    counter!("getter_resync", 1u64);
                    info!(count, version = %self.mirror.version(), "getter synced");
                    break;
                }
                // Only a listing can come first; anything else is stale.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.context("initial resync")),
                None => return Err(anyhow!("feed ended before the initial listing").context("initial resync")),
            }
        }
        Ok(tokio::spawn(sync_loop(events, Arc::clone(&self.mirror), cancel)))
    }

    /// Version of the mirror as last observed from the feed.
    pub fn observed_version(&self) -> Arc<FeedVersion> {
        self.mirror.version()
    }

    /// Current derived value. Never blocks on the feed; a momentarily stale
    /// mirror yields the best value available.
    pub fn get(&self) -> Arc<O> {
        let latest = self.mirror.version().generation;
        {
            let derived = self.derived.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(d) = derived.as_ref() {
                if d.generation == latest {
                    return Arc::clone(&d.data);
                }
            }
        }
        self.update_and_return()
    }

    fn update_and_return(&self) -> Arc<O> {
        let mut derived = self.derived.write().unwrap_or_else(PoisonError::into_inner);
        // Read again under the lock: another reader may have caught up already,
        // and the version stored must never be older than the snapshot below.
        let latest = self.mirror.version().generation;
        if let Some(d) = derived.as_ref() {
            if d.generation == latest {
                return Arc::clone(&d.data);
            }
        }
        let items = self.mirror.snapshot();
        let data = Arc::new((self.convert)(&items));
        counter!("getter_recompute", 1u64);
        debug!(generation = latest, items = items.len(), "derived value recomputed");
        *derived = Some(Derived { generation: latest, data: Arc::clone(&data) });
        data
    }

    #[cfg(test)]
    pub(crate) fn mirror(&self) -> &Mirror<T> {
        &self.mirror
    }
}

async fn sync_loop<T>(
    mut events: BoxStream<'static, Result<FeedEvent<T>>>,
    mirror: Arc<Mirror<T>>,
    cancel: CancellationToken,
) where
    T: Resource + Clone + Send + Sync,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = events.next() => next,
        };
        match next {
            Some(Ok(FeedEvent::Restarted(items))) => {
                let count = items.len();
                mirror.apply(FeedEvent::Restarted(items));
                counter!("getter_resync", 1u64);
                info!(count, version = %mirror.version(), "collection relisted");
            }
            Some(Ok(ev)) => mirror.apply(ev),
            // The feed retries on its own; the mirror keeps its last state meanwhile.
            Some(Err(e)) => warn!(error = %format!("{:#}", e), "watch failed"),
            None => {
                warn!("feed ended; mirror no longer updated");
                break;
            }
        }
    }
    info!("getter sync loop stopped");
}
