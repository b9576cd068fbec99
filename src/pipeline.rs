// src/pipeline.rs

use anyhow::{Context, Result};
use fs2::FileExt;
use glob::glob;
use std::{
    fmt,
    fs::File,
    path::{Path, PathBuf},
};
use tracing::{error, info, instrument, warn};

use crate::config::{PipelineConfig, RunParams, RunPaths};
use crate::error::PnadcError;
use crate::fetch::{
    resolve, transfer, DirectoryLister, LogProgress, RemoteResourceSpec, ResourceKind, Transport,
};
use crate::process::{self, LayoutDictionary};

const LOCK_FILE: &str = ".lock";

/// Exclusive advisory lock on the run directory.
///
/// The lock lives on the open handle, so the OS releases it when the
/// process exits, however it exits. The `.lock` file itself is left behind
/// and is harmless.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(LOCK_FILE);
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(PnadcError::RunLocked(path).into())
            }
            Err(e) => Err(e).with_context(|| format!("locking {}", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}

/// How one stage of a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageOutcome {
    Done,
    /// An input was missing; nothing was attempted.
    #[default]
    Skipped,
    /// The stage ran and failed.
    Failed,
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageOutcome::Done => "done",
            StageOutcome::Skipped => "skipped",
            StageOutcome::Failed => "failed",
        })
    }
}

/// What a run managed to do.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Every resource kind and whether it was downloaded.
    pub resources: Vec<(ResourceKind, bool)>,
    pub extracted: StageOutcome,
    pub decoded: StageOutcome,
    pub merged: StageOutcome,
    pub written: StageOutcome,
    pub cleaned: StageOutcome,
    pub rows: usize,
    pub output: Option<PathBuf>,
}

impl RunReport {
    pub fn downloaded(&self, kind: ResourceKind) -> bool {
        self.resources.iter().any(|&(k, ok)| k == kind && ok)
    }

    fn log_summary(&self) {
        let missing: Vec<String> = self
            .resources
            .iter()
            .filter(|(_, ok)| !ok)
            .map(|(k, _)| k.to_string())
            .collect();
        let output = self
            .output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        info!(
            missing = ?missing,
            extracted = %self.extracted,
            decoded = %self.decoded,
            merged = %self.merged,
            written = %self.written,
            cleaned = %self.cleaned,
            rows = self.rows,
            output = %output,
            "run finished"
        );
    }
}

/// Resolve and download one resource into `dir`.
async fn acquire<T, L>(
    transport: &T,
    lister: &L,
    spec: &RemoteResourceSpec,
    dir: &Path,
) -> Option<PathBuf>
where
    T: Transport,
    L: DirectoryLister,
{
    let Some(found) = resolve(transport, lister, spec).await else {
        warn!(kind = %spec.kind, "not found; continuing without it");
        return None;
    };
    let dest = dir.join(&found.filename);
    let mut progress = LogProgress::new(found.filename.as_str());
    transfer(transport, &found.url, &dest, &mut progress)
        .await
        .then_some(dest)
}

/// Files in `dir` matching `pattern`, in name order.
fn local_matches(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let full = format!("{}/{}", glob::Pattern::escape(&dir.to_string_lossy()), pattern);
    let mut found: Vec<PathBuf> = match glob(&full) {
        Ok(paths) => paths.filter_map(Result::ok).filter(|p| p.is_file()).collect(),
        Err(e) => {
            warn!(pattern = %full, error = %e, "bad glob pattern");
            Vec::new()
        }
    };
    found.sort();
    found
}

/// Layout from the dictionary spreadsheet, falling back to the SAS input
/// script. `None` when neither is present or readable.
fn load_layout(docs_dir: &Path, params: &RunParams) -> Option<LayoutDictionary> {
    let (y, v) = (params.year, params.visit);

    if let Some(dict) = local_matches(docs_dir, &format!("dicionario_PNADC_microdados_{y}_visita{v}*.xls")).pop() {
        match process::load_dictionary(&dict) {
            Ok(layout) if !layout.is_empty() => return Some(layout),
            Ok(_) => warn!(path = %dict.display(), "dictionary has no fields"),
            Err(e) => warn!(error = %format!("{:#}", e), "dictionary unusable"),
        }
    }

    if let Some(input) = local_matches(docs_dir, &format!("input_PNADC_{y}_visita{v}*.txt")).pop() {
        match process::load_sas_input(&input) {
            Ok(layout) => return Some(layout),
            Err(e) => warn!(error = %format!("{:#}", e), "input script unusable"),
        }
    }

    warn!("no layout document available");
    None
}

/// Decode, merge, write and clean up. Blocking.
fn process_raw(
    mut report: RunReport,
    params: RunParams,
    cfg: PipelineConfig,
    paths: RunPaths,
) -> RunReport {
    let Some(layout) = load_layout(&paths.docs_dir, &params) else {
        warn!("skipping decode: no layout");
        return report;
    };
    let Some(raw) = local_matches(&paths.data_dir, "*.txt").into_iter().next() else {
        warn!(dir = %paths.data_dir.display(), "skipping decode: no raw .txt");
        return report;
    };

    let decoded = match process::decode_file(&layout, &raw, cfg.batch_rows, cfg.strictness) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %format!("{:#}", e), "decode failed");
            report.decoded = StageOutcome::Failed;
            return report;
        }
    };
    report.decoded = StageOutcome::Done;
    report.rows = decoded.num_rows();

    let (y, d) = (params.year, params.deflator_year);
    let deflator = local_matches(&paths.docs_dir, &format!("deflator_PNADC_{d}*.xls"))
        .into_iter()
        .next();
    if deflator.is_none() {
        warn!(year = y, deflator_year = d, "no deflator file; correction factors omitted");
    }
    let had_deflator = deflator.is_some();
    let before = decoded.num_columns();
    let table = match process::merge(decoded, deflator.as_deref(), cfg.strictness) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %format!("{:#}", e), "merge failed");
            report.merged = StageOutcome::Failed;
            return report;
        }
    };
    report.merged = match (had_deflator, table.num_columns() > before) {
        (true, true) => StageOutcome::Done,
        (true, false) => StageOutcome::Failed,
        (false, _) => StageOutcome::Skipped,
    };

    let out = paths.output_file(&params, cfg.output_format);
    if let Err(e) = process::write(&table, &out, cfg.output_format) {
        error!(error = %format!("{:#}", e), "write failed");
        report.written = StageOutcome::Failed;
        return report;
    }
    report.written = StageOutcome::Done;

    if cfg.keep_raw {
        info!("keeping raw files");
    } else {
        report.cleaned = match process::cleanup(&paths.data_dir, &out) {
            Ok(_) => StageOutcome::Done,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "cleanup failed");
                StageOutcome::Failed
            }
        };
    }
    report.output = Some(out);
    report
}

/// Run every stage for `params`.
///
/// Missing resources and failed stages are logged and recorded in the
/// report; only setup failures (directories, a held run lock) are errors.
#[instrument(level = "info", skip_all, fields(run = %params.run_dir_name()))]
pub async fn run<T, L>(
    params: &RunParams,
    cfg: &PipelineConfig,
    transport: &T,
    lister: &L,
) -> Result<RunReport>
where
    T: Transport,
    L: DirectoryLister,
{
    let paths = RunPaths::new(&cfg.root_dir, params);
    paths.create()?;
    let _lock = RunLock::acquire(&paths.run_dir)?;
    info!(dir = %paths.run_dir.display(), "run started");

    let mut report = RunReport::default();
    for kind in ResourceKind::ALL {
        let spec = RemoteResourceSpec::for_run(kind, params, cfg);
        let dir = if kind.is_documentation() {
            &paths.docs_dir
        } else {
            &paths.data_dir
        };
        let local = acquire(transport, lister, &spec, dir).await;
        report.resources.push((kind, local.is_some()));

        if let (ResourceKind::Microdata, Some(zip)) = (kind, local) {
            let data_dir = paths.data_dir.clone();
            let files = tokio::task::spawn_blocking(move || process::extract(&zip, &data_dir)).await?;
            report.extracted = match files {
                Some(_) => StageOutcome::Done,
                None => StageOutcome::Failed,
            };
        }
    }

    let report = tokio::task::spawn_blocking({
        let params = *params;
        let cfg = cfg.clone();
        let paths = paths.clone();
        move || process_raw(report, params, cfg, paths)
    })
    .await?;

    report.log_summary();
    Ok(report)
}
