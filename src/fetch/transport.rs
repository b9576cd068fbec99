// src/fetch/transport.rs

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use std::{future::Future, pin::Pin, time::Duration};
use tracing::debug;

/// Body of a GET as a stream of chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Metadata returned by a successful HEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Probe {
    /// `Content-Length`, when the server sent a positive one.
    pub content_length: Option<u64>,
}

/// An opened GET whose body has not been read yet.
pub struct Download {
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// The network operations the pipeline needs.
///
/// Every method fails on transport errors and on non-2xx statuses; callers
/// decide whether that is fatal.
pub trait Transport: Send + Sync {
    /// HEAD `url`. `Ok` means the resource exists.
    fn probe(&self, url: &str) -> impl Future<Output = Result<Probe>> + Send;

    /// GET `url` and return the whole body as text.
    fn fetch_text(&self, url: &str) -> impl Future<Output = Result<String>> + Send;

    /// GET `url` and hand back the body as a stream.
    fn stream(&self, url: &str) -> impl Future<Output = Result<Download>> + Send;
}

/// `Transport` over a shared `reqwest::Client`.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    probe_timeout: Duration,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration, probe_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            probe_timeout,
        })
    }
}

fn positive(len: Option<u64>) -> Option<u64> {
    len.filter(|&n| n > 0)
}

impl Transport for HttpTransport {
    async fn probe(&self, url: &str) -> Result<Probe> {
        debug!(%url, "HEAD");
        let resp = self
            .client
            .head(url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .with_context(|| format!("HEAD {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Non-success status {}", url))?;
        Ok(Probe {
            content_length: positive(resp.content_length()),
        })
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        debug!(%url, "GET text");
        self.client
            .get(url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Non-success status {}", url))?
            .text()
            .await
            .with_context(|| format!("Reading text from {}", url))
    }

    async fn stream(&self, url: &str) -> Result<Download> {
        debug!(%url, "GET stream");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Non-success status {}", url))?;
        let content_length = positive(resp.content_length());
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.context("reading response chunk"));
        Ok(Download {
            content_length,
            body: Box::pin(body),
        })
    }
}
