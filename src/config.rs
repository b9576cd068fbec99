// src/config.rs

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::warn;

use crate::error::PnadcError;

const IBGE_VISIT_ROOT: &str = "https://ftp.ibge.gov.br/Trabalho_e_Rendimento/\
Pesquisa_Nacional_por_Amostra_de_Domicilios_continua/Anual/Microdados/Visita/";

/// Years for which IBGE only published the fifth visit.
const VISIT_5_ONLY_YEARS: &[u16] = &[2020, 2021];

const MIN_YEAR: u16 = 2012;
const MAX_YEAR: u16 = 2100;

/// The three values that identify one run: survey edition, visit round and
/// the year of the deflator table used to correct monetary fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunParams {
    pub year: u16,
    pub visit: u8,
    pub deflator_year: u16,
}

impl RunParams {
    /// Validate the raw values. Visit must be 1 or 5; for 2020 and 2021 the
    /// visit is forced to 5 since no other round exists.
    pub fn new(year: u16, visit: u8, deflator_year: u16) -> Result<Self, PnadcError> {
        for (label, y) in [("year", year), ("deflator year", deflator_year)] {
            if !(MIN_YEAR..=MAX_YEAR).contains(&y) {
                return Err(PnadcError::InvalidParams(format!(
                    "{label} {y} outside {MIN_YEAR}..={MAX_YEAR}"
                )));
            }
        }
        if visit != 1 && visit != 5 {
            return Err(PnadcError::InvalidParams(format!(
                "visit must be 1 or 5, got {visit}"
            )));
        }

        let visit = if VISIT_5_ONLY_YEARS.contains(&year) && visit != 5 {
            warn!(year, requested = visit, "only visit 5 is published for this year; using 5");
            5
        } else {
            visit
        };

        Ok(Self {
            year,
            visit,
            deflator_year,
        })
    }

    /// Name of the per-run directory, e.g. `PNADC_2024_visita1_def_2024`.
    pub fn run_dir_name(&self) -> String {
        format!(
            "PNADC_{}_visita{}_def_{}",
            self.year, self.visit, self.deflator_year
        )
    }

    /// Fill `{year}`, `{visit}` and `{deflator_year}` placeholders.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{year}", &self.year.to_string())
            .replace("{visit}", &self.visit.to_string())
            .replace("{deflator_year}", &self.deflator_year.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    /// Log integrity problems and keep going.
    #[default]
    Lenient,
    /// Treat integrity problems as errors and skip the affected stage.
    Strict,
}

impl Strictness {
    pub fn is_strict(self) -> bool {
        self == Strictness::Strict
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Csv,
    Parquet,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Parquet => "parquet",
        }
    }
}

/// Pipeline settings. Every field has a default so a YAML file only needs
/// to name what it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory under which the per-run directory is created.
    pub root_dir: PathBuf,
    pub data_base_url: String,
    pub docs_base_url: String,
    pub deflator_base_url: String,
    /// Records decoded per arrow batch.
    pub batch_rows: usize,
    pub strictness: Strictness,
    pub output_format: OutputFormat,
    /// TCP connect timeout for every request.
    pub connect_timeout_secs: u64,
    /// Total timeout for HEAD probes and directory listings. Body downloads
    /// are not bounded.
    pub probe_timeout_secs: u64,
    /// Leave the extracted `.txt` and downloaded `.zip` in place after writing.
    pub keep_raw: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            data_base_url: format!("{IBGE_VISIT_ROOT}Visita_{{visit}}/Dados/"),
            docs_base_url: format!("{IBGE_VISIT_ROOT}Visita_{{visit}}/Documentacao/"),
            deflator_base_url: format!("{IBGE_VISIT_ROOT}Documentacao_Geral/"),
            batch_rows: 50_000,
            strictness: Strictness::Lenient,
            output_format: OutputFormat::Csv,
            connect_timeout_secs: 30,
            probe_timeout_secs: 10,
            keep_raw: false,
        }
    }
}

impl PipelineConfig {
    /// Read a YAML config file; missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: PipelineConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), PnadcError> {
        if self.batch_rows == 0 {
            return Err(PnadcError::InvalidParams("batch_rows must be > 0".into()));
        }
        for (key, url) in [
            ("data_base_url", &self.data_base_url),
            ("docs_base_url", &self.docs_base_url),
            ("deflator_base_url", &self.deflator_base_url),
        ] {
            if !url.ends_with('/') {
                return Err(PnadcError::InvalidParams(format!(
                    "{key} must end with '/': {url}"
                )));
            }
        }
        Ok(())
    }
}

/// Local layout of one run: `<root>/<run>/Dados` and `<root>/<run>/Documentacao`.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub data_dir: PathBuf,
    pub docs_dir: PathBuf,
}

impl RunPaths {
    pub fn new(root: &Path, params: &RunParams) -> Self {
        let run_dir = root.join(params.run_dir_name());
        Self {
            data_dir: run_dir.join("Dados"),
            docs_dir: run_dir.join("Documentacao"),
            run_dir,
        }
    }

    pub fn create(&self) -> Result<()> {
        for d in [&self.data_dir, &self.docs_dir] {
            fs::create_dir_all(d).with_context(|| format!("creating {}", d.display()))?;
        }
        Ok(())
    }

    /// Final artifact path, e.g. `Dados/PNADC_2024_visita1_final.csv`.
    pub fn output_file(&self, params: &RunParams, format: OutputFormat) -> PathBuf {
        self.data_dir.join(format!(
            "PNADC_{}_visita{}_final.{}",
            params.year,
            params.visit,
            format.extension()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visit_forced_to_five_for_pandemic_years() {
        let p = RunParams::new(2021, 1, 2024).unwrap();
        assert_eq!(p.visit, 5);
        let p = RunParams::new(2024, 1, 2024).unwrap();
        assert_eq!(p.visit, 1);
    }

    #[test]
    fn rejects_bad_visit_and_years() {
        assert!(matches!(
            RunParams::new(2024, 3, 2024),
            Err(PnadcError::InvalidParams(_))
        ));
        assert!(RunParams::new(1999, 1, 2024).is_err());
        assert!(RunParams::new(2024, 1, 24).is_err());
    }

    #[test]
    fn templates_and_paths() {
        let p = RunParams::new(2024, 5, 2023).unwrap();
        let cfg = PipelineConfig::default();
        assert!(p
            .render(&cfg.data_base_url)
            .ends_with("/Visita/Visita_5/Dados/"));

        let paths = RunPaths::new(Path::new("/tmp/x"), &p);
        assert_eq!(paths.run_dir, Path::new("/tmp/x/PNADC_2024_visita5_def_2023"));
        assert_eq!(
            paths.output_file(&p, OutputFormat::Csv),
            Path::new("/tmp/x/PNADC_2024_visita5_def_2023/Dados/PNADC_2024_visita5_final.csv")
        );
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg: PipelineConfig =
            serde_yaml::from_str("batch_rows: 10\nstrictness: strict\n").unwrap();
        assert_eq!(cfg.batch_rows, 10);
        assert!(cfg.strictness.is_strict());
        assert_eq!(cfg.output_format, OutputFormat::Csv);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_batch_rows_is_invalid() {
        let cfg = PipelineConfig {
            batch_rows: 0,
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
