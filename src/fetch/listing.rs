// src/fetch/listing.rs

use anyhow::{anyhow, Context, Result};
use scraper::{Html, Selector};
use std::future::Future;
use tracing::trace;
use url::Url;

use super::transport::Transport;

/// Lists the file names published in a remote directory.
pub trait DirectoryLister: Send + Sync {
    /// Names (not URLs) of the entries under `url` ending in `.{extension}`.
    fn list_directory(
        &self,
        url: &str,
        extension: &str,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// Scrapes an Apache/nginx style HTML index through a `Transport`.
#[derive(Clone)]
pub struct HtmlDirectoryLister<T> {
    transport: T,
}

impl<T: Transport> HtmlDirectoryLister<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

impl<T: Transport> DirectoryLister for HtmlDirectoryLister<T> {
    async fn list_directory(&self, url: &str, extension: &str) -> Result<Vec<String>> {
        let base = Url::parse(url).with_context(|| format!("invalid listing URL {}", url))?;
        let html = self.transport.fetch_text(url).await?;
        extract_links(&html, &base, extension)
    }
}

/// Name of `url` when it sits directly in the `base` directory.
fn entry_name(base: &Url, url: &Url) -> Option<String> {
    let rest = url.as_str().strip_prefix(base.as_str())?;
    (!rest.is_empty() && !rest.contains(['/', '?', '#'])).then(|| rest.to_string())
}

/// Pull the file names of every `<a href="….ext">` out of an index page.
///
/// Hrefs are resolved against `base`; links outside that directory are
/// dropped, so absolute and relative links to the same file give the same
/// name.
pub fn extract_links(html: &str, base: &Url, extension: &str) -> Result<Vec<String>> {
    let selector = Selector::parse(&format!(r#"a[href$=".{}"]"#, extension))
        .map_err(|e| anyhow!("invalid selector for .{}: {:?}", extension, e))?;
    let doc = Html::parse_document(html);
    let names = doc
        .select(&selector)
        .filter_map(|e| e.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .filter_map(|u| entry_name(base, &u))
        .filter(|name| name.ends_with(&format!(".{}", extension)))
        .inspect(|name| trace!(name = %name, "listed"))
        .collect();
    Ok(names)
}
