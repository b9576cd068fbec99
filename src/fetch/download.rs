// src/fetch/download.rs

use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::{
    fs,
    io::{AsyncWriteExt, BufWriter},
};
use tracing::{debug, error, info, instrument};

use super::transport::Transport;

const WRITE_BUFFER: usize = 8 * 1024;
const LOG_EVERY_BYTES: u64 = 10 * 1024 * 1024;

/// Receives byte counts while a transfer runs.
pub trait ProgressSink: Send {
    fn update(&mut self, transferred: u64, total: Option<u64>);
}

/// Logs a line every 10 MiB.
#[derive(Debug, Default)]
pub struct LogProgress {
    label: String,
    next_mark: u64,
}

impl LogProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            next_mark: LOG_EVERY_BYTES,
        }
    }
}

impl ProgressSink for LogProgress {
    fn update(&mut self, transferred: u64, total: Option<u64>) {
        if transferred < self.next_mark {
            return;
        }
        self.next_mark = transferred + LOG_EVERY_BYTES;
        match total {
            Some(t) => info!(
                label = %self.label,
                mb = transferred / (1024 * 1024),
                total_mb = t / (1024 * 1024),
                "downloading"
            ),
            None => info!(label = %self.label, mb = transferred / (1024 * 1024), "downloading"),
        }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

async fn stream_to_file<T: Transport>(
    transport: &T,
    url: &str,
    dest: &Path,
    progress: &mut dyn ProgressSink,
) -> Result<u64> {
    // The HEAD is only for sizing; a failure here is not a failure to download.
    let mut total = match transport.probe(url).await {
        Ok(p) => p.content_length,
        Err(e) => {
            debug!(error = %e, "size probe failed");
            None
        }
    };

    let download = transport.stream(url).await?;
    if total.is_none() {
        total = download.content_length;
    }
    progress.update(0, total);

    let tmp = part_path(dest);
    let file = fs::File::create(&tmp)
        .await
        .with_context(|| format!("creating {}", tmp.display()))?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);

    let mut body = download.body;
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        writer
            .write_all(&chunk)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        written += chunk.len() as u64;
        progress.update(written, total);
    }
    writer.flush().await?;
    drop(writer);

    fs::rename(&tmp, dest)
        .await
        .with_context(|| format!("renaming {} to {}", tmp.display(), dest.display()))?;
    Ok(written)
}

/// Download `url` into `dest`.
///
/// Returns `false` on any failure (network, status, disk) after logging it;
/// the caller skips whatever depended on this file. A partial download is
/// removed and never left at `dest`.
#[instrument(level = "info", skip(transport, progress), fields(dest = %dest.display()))]
pub async fn transfer<T: Transport>(
    transport: &T,
    url: &str,
    dest: &Path,
    progress: &mut dyn ProgressSink,
) -> bool {
    match stream_to_file(transport, url, dest, progress).await {
        Ok(bytes) => {
            info!(bytes, "downloaded");
            true
        }
        Err(e) => {
            error!(%url, error = %format!("{:#}", e), "download failed");
            let _ = fs::remove_file(part_path(dest)).await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::transport::fake::FakeTransport;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder(Vec<(u64, Option<u64>)>);

    impl ProgressSink for Recorder {
        fn update(&mut self, transferred: u64, total: Option<u64>) {
            self.0.push((transferred, total));
        }
    }

    #[tokio::test]
    async fn writes_file_and_reports_progress() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("a.zip");
        let t = FakeTransport::default().with("http://h/a.zip", "0123456789");
        let mut rec = Recorder::default();

        assert!(transfer(&t, "http://h/a.zip", &dest, &mut rec).await);
        assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
        assert!(!part_path(&dest).exists());
        assert_eq!(rec.0.first(), Some(&(0, Some(10))));
        assert_eq!(rec.0.last(), Some(&(10, Some(10))));
        // fake transport yields 4-byte chunks
        assert_eq!(rec.0.len(), 4);
    }

    #[tokio::test]
    async fn size_falls_back_to_get_length() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("b.txt");
        let mut t = FakeTransport::default().with("http://h/b.txt", "abc");
        t.no_head_length.push("http://h/b.txt".into());
        let mut rec = Recorder::default();

        assert!(transfer(&t, "http://h/b.txt", &dest, &mut rec).await);
        assert_eq!(rec.0.first(), Some(&(0, Some(3))));
        assert_eq!(rec.0.last(), Some(&(3, Some(3))));
    }

    /// Collects formatted log output.
    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn progress_is_visible_at_info() {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut progress = LogProgress::new("PNADC_2024_visita1.zip");
            progress.update(0, Some(3 * LOG_EVERY_BYTES));
            progress.update(LOG_EVERY_BYTES, Some(3 * LOG_EVERY_BYTES));
            progress.update(LOG_EVERY_BYTES + 1, Some(3 * LOG_EVERY_BYTES));
        });

        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text.matches("downloading").count(), 1);
        assert!(text.contains("PNADC_2024_visita1.zip"));
    }

    #[tokio::test]
    async fn failure_is_false_and_leaves_nothing() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("c.zip");
        let t = FakeTransport::default();
        let mut rec = Recorder::default();

        assert!(!transfer(&t, "http://h/c.zip", &dest, &mut rec).await);
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }
}
