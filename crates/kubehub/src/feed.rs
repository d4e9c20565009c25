//! List/watch feed over a kube `Api`, driven by the kube-runtime watcher.

use std::fmt::Debug;

use futures::{stream::BoxStream, StreamExt};
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Resource,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use stagehand_core::{FeedEvent, ListWatch};
use tracing::debug;

/// Server side watch timeout; the apiserver caps it below 295s.
pub fn watch_timeout_secs() -> u32 {
    std::env::var("STAGEHAND_WATCH_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(290)
        .min(290)
}

/// Lists and watches one collection through `Api<K>`.
///
/// Relisting after an expired watch and retry timing after failures are left
/// to the watcher and its default backoff.
pub struct KubeListWatch<K> {
    api: Api<K>,
    config: watcher::Config,
}

impl<K> KubeListWatch<K> {
    pub fn new(api: Api<K>) -> Self {
        Self { api, config: watcher::Config::default().timeout(watch_timeout_secs()) }
    }

    pub fn labels(mut self, selector: &str) -> Self {
        self.config = self.config.labels(selector);
        self
    }

    pub fn fields(mut self, selector: &str) -> Self {
        self.config = self.config.fields(selector);
        self
    }
}

impl<K> ListWatch<K> for KubeListWatch<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn watch(&self) -> BoxStream<'static, anyhow::Result<FeedEvent<K>>> {
        counter!("feed_watch_opened", 1u64);
        debug!(labels = ?self.config.label_selector, fields = ?self.config.field_selector, "watcher started");
        watcher::watcher(self.api.clone(), self.config.clone())
            .default_backoff()
            .map(|ev| ev.map(feed_event).map_err(|e| anyhow::Error::new(e).context("watch stream failed")))
            .boxed()
    }
}

fn feed_event<K>(ev: Event<K>) -> FeedEvent<K> {
    match ev {
        Event::Applied(o) => FeedEvent::Applied(o),
        Event::Deleted(o) => FeedEvent::Deleted(o),
        Event::Restarted(items) => {
            debug!(count = items.len(), "watch restart");
            FeedEvent::Restarted(items)
        }
    }
}
