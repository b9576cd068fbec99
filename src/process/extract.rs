// src/process/extract.rs

use anyhow::{Context, Result};
use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};
use tracing::{info, instrument, warn};
use zip::ZipArchive;

fn unzip(zip_path: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(zip_path)
        .with_context(|| format!("Failed to open ZIP file: {:?}", zip_path))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("Failed to read ZIP archive: {:?}", zip_path))?;

    let mut written = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("Failed to access ZIP entry #{} in {:?}", i, zip_path))?;
        if !entry.is_file() {
            continue;
        }
        let Some(rel) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "skipping entry that escapes the destination");
            continue;
        };

        let out = dest_dir.join(rel);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = File::create(&out).with_context(|| format!("creating {}", out.display()))?;
        io::copy(&mut entry, &mut f)
            .with_context(|| format!("extracting {} to {}", entry.name(), out.display()))?;
        written.push(out);
    }
    Ok(written)
}

/// Unpack every file of `zip_path` into `dest_dir`.
///
/// A missing or corrupt archive is logged and yields `None` so the run can
/// go on without the microdata.
#[instrument(level = "info", skip_all, fields(zip = %zip_path.display()))]
pub fn extract(zip_path: &Path, dest_dir: &Path) -> Option<Vec<PathBuf>> {
    match unzip(zip_path, dest_dir) {
        Ok(files) => {
            info!(files = files.len(), "extracted");
            Some(files)
        }
        Err(e) => {
            warn!(error = %format!("{:#}", e), "extraction failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;
    use zip::CompressionMethod;

    fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
            for (name, body) in entries {
                zip.start_file(*name, options).unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn extracts_files() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("m.zip");
        fs::write(&zip_path, build_zip(&[("PNADC_2024_visita1.txt", "01X123\n")])).unwrap();

        let files = extract(&zip_path, dir.path()).unwrap();
        assert_eq!(files, vec![dir.path().join("PNADC_2024_visita1.txt")]);
        assert_eq!(fs::read_to_string(&files[0]).unwrap(), "01X123\n");
    }

    #[test]
    fn skips_traversal_entries() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("m.zip");
        fs::write(&zip_path, build_zip(&[("../evil.txt", "x"), ("ok.txt", "y")])).unwrap();

        let files = extract(&zip_path, dir.path()).unwrap();
        assert_eq!(files, vec![dir.path().join("ok.txt")]);
        assert!(!dir.path().parent().unwrap().join("evil.txt").exists());
    }

    #[test]
    fn corrupt_or_missing_archive_is_soft() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("bad.zip");
        fs::write(&zip_path, b"not a zip").unwrap();
        assert!(extract(&zip_path, dir.path()).is_none());
        assert!(extract(&dir.path().join("missing.zip"), dir.path()).is_none());
    }
}
