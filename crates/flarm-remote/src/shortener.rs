use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use flarm_core::{LinkShortener, Transport};
use reqwest::Url;
use tracing::{debug, warn};

pub const DEFAULT_SHORTENER_URL: &str = "https://is.gd/create.php";

/// is.gd-compatible shortener. Any failure hands back the long URL.
pub struct IsGdShortener {
    transport: Arc<dyn Transport>,
    endpoint: String,
}

impl IsGdShortener {
    pub fn new(transport: Arc<dyn Transport>, endpoint: impl Into<String>) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
        }
    }

    pub fn request_url(&self, url: &str) -> Result<Url> {
        Url::parse_with_params(&self.endpoint, &[("format", "simple"), ("url", url)])
            .with_context(|| format!("invalid shortener endpoint '{}'", self.endpoint))
    }

    fn try_shorten(&self, url: &str) -> Result<String> {
        let request = self.request_url(url)?;
        let body = self
            .transport
            .fetch_bytes(request.as_str())
            .map_err(|err| anyhow!(err))?;
        let short = String::from_utf8_lossy(&body).trim().to_string();
        if !(short.starts_with("https://") || short.starts_with("http://")) {
            return Err(anyhow!("shortener answered '{short}'"));
        }
        Ok(short)
    }
}

impl LinkShortener for IsGdShortener {
    fn shorten(&self, url: &str) -> String {
        match self.try_shorten(url) {
            Ok(short) => {
                debug!(%url, %short, "shortened link");
                short
            }
            Err(err) => {
                warn!(%url, error = %err, "link shortening failed; using the full link");
                url.to_string()
            }
        }
    }
}
