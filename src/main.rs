use anyhow::Result;
use clap::Parser;
use pnadc_fetch::{
    fetch::{HtmlDirectoryLister, HttpTransport},
    OutputFormat, PipelineConfig, RunParams, Strictness,
};
use std::{path::PathBuf, time::Duration};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Download PNAD Contínua visit microdata and write it as one table.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Survey year.
    #[arg(long)]
    year: u16,

    /// Visit round, 1 or 5.
    #[arg(long, default_value_t = 1)]
    visit: u8,

    /// Year of the deflator table.
    #[arg(long)]
    deflator_year: u16,

    /// YAML file with pipeline settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the run directory is created under.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Fail stages on layout or deflator integrity problems.
    #[arg(long)]
    strict: bool,

    #[arg(long, value_parser = ["csv", "parquet"])]
    format: Option<String>,

    /// Keep the extracted text and the zip after writing.
    #[arg(long)]
    keep_raw: bool,
}

fn build_config(args: &Args) -> Result<PipelineConfig> {
    let mut cfg = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(root) = &args.root {
        cfg.root_dir = root.clone();
    }
    if args.strict {
        cfg.strictness = Strictness::Strict;
    }
    match args.format.as_deref() {
        Some("parquet") => cfg.output_format = OutputFormat::Parquet,
        Some("csv") => cfg.output_format = OutputFormat::Csv,
        _ => {}
    }
    cfg.keep_raw |= args.keep_raw;
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    // ─── 2) parameters & config ──────────────────────────────────────
    let args = Args::parse();
    let params = RunParams::new(args.year, args.visit, args.deflator_year)?;
    let cfg = build_config(&args)?;
    info!(run = %params.run_dir_name(), root = %cfg.root_dir.display(), "startup");

    // ─── 3) transport ────────────────────────────────────────────────
    let transport = HttpTransport::new(
        Duration::from_secs(cfg.connect_timeout_secs),
        Duration::from_secs(cfg.probe_timeout_secs),
    )?;
    let lister = HtmlDirectoryLister::new(transport.clone());

    // ─── 4) run ──────────────────────────────────────────────────────
    let report = pnadc_fetch::run(&params, &cfg, &transport, &lister).await?;
    match &report.output {
        Some(path) => info!(path = %path.display(), rows = report.rows, "all done"),
        None => info!("finished without output"),
    }
    Ok(())
}
