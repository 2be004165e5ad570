//! Remote fetch helpers shared by the adapters. Nothing here retries: a
//! failed call is logged and reported as "no data".

use std::path::PathBuf;

use harvest_core::SourceKind;
use serde_json::Value as JsonValue;
use tracing::{debug, error, warn};

use crate::HarvestContext;

/// Where adapter requests are answered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchMode {
    Live,
    /// Canned responses under `<root>/<kind>/`; pagination collapses to one page.
    Fixtures(PathBuf),
}

impl FetchMode {
    pub fn is_fixtures(&self) -> bool {
        matches!(self, FetchMode::Fixtures(_))
    }
}

pub fn fixture_dir_name(kind: SourceKind) -> String {
    kind.as_str().replace('-', "_")
}

/// Body of a GET, or the named fixture file in fixture mode.
pub async fn fetch_text(
    ctx: &HarvestContext<'_>,
    url: &str,
    headers: &[(&str, &str)],
    fixture: &str,
) -> Option<String> {
    match &ctx.mode {
        FetchMode::Fixtures(root) => {
            let path = root.join(fixture_dir_name(ctx.source.kind)).join(fixture);
            debug!(url, fixture = %path.display(), "serving fixture");
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => Some(text),
                Err(err) => {
                    error!(path = %path.display(), error = %err, "reading fixture failed");
                    None
                }
            }
        }
        FetchMode::Live => match ctx.http.get(url, headers).await {
            Ok(resp) => Some(resp.text()),
            Err(err) => {
                error!(url, error = %err, "fetch failed");
                None
            }
        },
    }
}

pub async fn fetch_json(
    ctx: &HarvestContext<'_>,
    url: &str,
    headers: &[(&str, &str)],
    fixture: &str,
) -> Option<JsonValue> {
    let text = fetch_text(ctx, url, headers, fixture).await?;
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(err) => {
            error!(url, error = %err, "response is not valid JSON");
            None
        }
    }
}

/// Byte size advertised by the resource's server. Skipped in fixture mode.
pub async fn resource_size(ctx: &HarvestContext<'_>, url: &str) -> Option<u64> {
    if ctx.mode.is_fixtures() || url.is_empty() {
        return None;
    }
    match ctx.http.content_length(url).await {
        Ok(size) => size,
        Err(err) => {
            warn!(url, error = %err, "could not determine resource size");
            None
        }
    }
}
