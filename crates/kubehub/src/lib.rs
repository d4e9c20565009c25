//! Stagehand kubehub: kube-rs backed client, discovery, writer and list/watch feed

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::Client;
use once_cell::sync::OnceCell;

mod feed;
mod resolve;
mod writer;

pub use feed::{watch_timeout_secs, KubeListWatch};
pub use resolve::{DiscoveredKind, DiscoveryResolver};
pub use writer::{classify, KubeWriter, FIELD_MANAGER};

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Client for the current kube context, created on first use and shared afterwards.
pub async fn get_kube_client() -> Result<Client> {
    if let Some(client) = CLIENT.get() {
        return Ok(client.clone());
    }
    let client = Client::try_default().await.context("creating kube client from current context")?;
    Ok(CLIENT.get_or_init(|| client).clone())
}
