//! Bucketload uploader entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::UploaderConfig;

/// Uploads local files and folders into a repository bucket.
#[derive(Debug, Parser)]
#[command(name = "bucketload-uploader", version, about)]
struct Cli {
    /// Configuration file (defaults to the platform config directory).
    #[arg(long, env = "BUCKETLOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Upload service root URL.
    #[arg(long)]
    base_url: Option<String>,

    /// Server-side upload handler.
    #[arg(long)]
    handler: Option<String>,

    /// Repository folder to upload into.
    #[arg(long)]
    target: Option<String>,

    /// Cap on concurrently in-flight transfers.
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    max_pending: Option<u16>,

    /// Extra begin parameter, `KEY=VALUE` (repeatable).
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Print queue events as JSON lines.
    #[arg(long)]
    json: bool,

    /// Files and folders to upload.
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

impl Cli {
    /// Applies command-line overrides on top of the file configuration.
    fn apply(&self, config: &mut UploaderConfig) {
        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        if let Some(handler) = &self.handler {
            config.upload_handler = handler.clone();
        }
        if let Some(target) = &self.target {
            config.target_path = target.clone();
        }
        if let Some(n) = self.max_pending {
            config.max_pending = n.into();
        }
        config.params.extend(self.params.iter().cloned());
    }
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting bucketload uploader"
    );

    let mut config = UploaderConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    tracing::info!(base_url = %config.base_url, handler = %config.upload_handler, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(app::run(config, cli.paths, cli.json))?;

    if !report.succeeded() {
        anyhow::bail!(
            "upload incomplete: {} of {} transfers failed or aborted",
            report.failed,
            report.total
        );
    }
    tracing::info!(location = ?report.location, "upload committed");
    Ok(())
}
