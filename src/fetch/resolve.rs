// src/fetch/resolve.rs

use std::{fmt, path::Path};
use tracing::{debug, info, instrument, warn};

use super::{listing::DirectoryLister, transport::Transport};
use crate::config::{PipelineConfig, RunParams};

/// The four remote files a run tries to obtain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Microdata,
    InputLayout,
    Dictionary,
    Deflator,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Microdata,
        ResourceKind::InputLayout,
        ResourceKind::Dictionary,
        ResourceKind::Deflator,
    ];

    /// Extension used to filter directory listings.
    pub fn extension(self) -> &'static str {
        match self {
            ResourceKind::Microdata => "zip",
            ResourceKind::InputLayout => "txt",
            ResourceKind::Dictionary | ResourceKind::Deflator => "xls",
        }
    }

    /// Microdata lands in the data directory, everything else in the docs.
    pub fn is_documentation(self) -> bool {
        self != ResourceKind::Microdata
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Microdata => "microdata",
            ResourceKind::InputLayout => "input layout",
            ResourceKind::Dictionary => "dictionary",
            ResourceKind::Deflator => "deflator",
        })
    }
}

/// Where to look for one resource and which names to try first.
#[derive(Debug, Clone)]
pub struct RemoteResourceSpec {
    pub kind: ResourceKind,
    /// Tried in order. The first entry also supplies the listing prefix.
    pub candidates: Vec<String>,
    /// Directory URL, always ending in `/`.
    pub base_url: String,
    pub extension: &'static str,
}

impl RemoteResourceSpec {
    pub fn new(kind: ResourceKind, base_url: impl Into<String>, candidates: Vec<String>) -> Self {
        Self {
            kind,
            candidates,
            base_url: base_url.into(),
            extension: kind.extension(),
        }
    }

    /// The published naming convention for `kind` in a given run.
    pub fn for_run(kind: ResourceKind, params: &RunParams, cfg: &PipelineConfig) -> Self {
        let (y, v, d) = (params.year, params.visit, params.deflator_year);
        let (template, candidate) = match kind {
            ResourceKind::Microdata => (&cfg.data_base_url, format!("PNADC_{y}_visita{v}.zip")),
            ResourceKind::InputLayout => {
                (&cfg.docs_base_url, format!("input_PNADC_{y}_visita{v}.txt"))
            }
            ResourceKind::Dictionary => (
                &cfg.docs_base_url,
                format!("dicionario_PNADC_microdados_{y}_visita{v}.xls"),
            ),
            ResourceKind::Deflator => (&cfg.deflator_base_url, format!("deflator_PNADC_{d}.xls")),
        };
        Self::new(kind, params.render(template), vec![candidate])
    }

    /// File stem of the first candidate, e.g. `PNADC_2024_visita1`.
    pub fn prefix(&self) -> Option<&str> {
        let first = self.candidates.first()?;
        Path::new(first).file_stem()?.to_str()
    }

    fn url_for(&self, name: &str) -> String {
        format!("{}{}", self.base_url, name)
    }
}

/// A concrete remote file chosen by [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResource {
    pub url: String,
    pub filename: String,
}

/// Pick the lexicographically greatest entry starting with `prefix`.
///
/// Names usually end in a zero-padded date or revision so byte order tracks
/// recency; `X_v10` sorts before `X_v3`, which is accepted.
pub fn pick_latest<'a>(entries: &'a [String], prefix: &str) -> Option<&'a String> {
    entries.iter().filter(|e| e.starts_with(prefix)).max()
}

/// Find the remote file for `spec`.
///
/// Fixed candidates are probed first and the first one that answers wins.
/// Failing that, the directory listing is searched for the newest file with
/// the first candidate's prefix. `None` means the run continues without it.
#[instrument(level = "info", skip_all, fields(kind = %spec.kind, base = %spec.base_url))]
pub async fn resolve<T, L>(
    transport: &T,
    lister: &L,
    spec: &RemoteResourceSpec,
) -> Option<ResolvedResource>
where
    T: Transport,
    L: DirectoryLister,
{
    for name in &spec.candidates {
        let url = spec.url_for(name);
        match transport.probe(&url).await {
            Ok(_) => {
                info!(name = %name, "fixed name found");
                return Some(ResolvedResource {
                    url,
                    filename: name.clone(),
                });
            }
            Err(e) => debug!(name = %name, error = %e, "candidate not available"),
        }
    }

    let Some(prefix) = spec.prefix() else {
        warn!("no candidates to derive a listing prefix from");
        return None;
    };

    info!(prefix, "fixed names failed, listing directory");
    let entries = match lister.list_directory(&spec.base_url, spec.extension).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "directory listing failed");
            return None;
        }
    };

    match pick_latest(&entries, prefix) {
        Some(name) => {
            info!(name = %name, listed = entries.len(), "found by listing");
            Some(ResolvedResource {
                url: spec.url_for(name),
                filename: name.clone(),
            })
        }
        None => {
            warn!(candidates = ?spec.candidates, "no matching file");
            None
        }
    }
}
