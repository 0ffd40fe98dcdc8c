mod config;
mod error;
mod layers;
mod pipeline;

use crate::config::Config;
use crate::layers::delivery::{Mailer, PreviewMailer, SmtpMailer};
use crate::layers::discovery::ArxivClient;
use crate::layers::profile::InterestProfile;
use crate::layers::scoring::OpenAiScorer;
use crate::pipeline::Pipeline;
use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Mail yourself the day's arXiv papers that match your research interests.
#[derive(Debug, Parser)]
#[command(name = "arxiv-digest", version, about)]
struct Cli {
    /// Path to the TOML config (default: $ARXIV_DIGEST_CONFIG or ./config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the digest to stdout instead of emailing it
    #[arg(long)]
    dry_run: bool,

    /// Debug logging and the first few raw model replies
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info,arxiv_digest=debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Run failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // 0. Load Configuration
    dotenv().ok();

    let config_path = Config::resolve_path(cli.config);
    tracing::info!("Loading configuration from {}", config_path.display());
    let config = Config::load(&config_path)?;
    config.validate(!cli.dry_run)?;

    let profile = InterestProfile::load(
        &config.interests.description,
        config.zotero.library_file.as_deref(),
        config.zotero.detailed_papers,
    )?;

    let source = ArxivClient::new(config.arxiv.max_results, config.arxiv.lookback_days)?
        .with_base_url(&config.arxiv.api_url);
    let scorer = OpenAiScorer::new(&config.openai, cli.verbose)?;
    let mailer: Box<dyn Mailer> = if cli.dry_run {
        Box::new(PreviewMailer)
    } else {
        Box::new(SmtpMailer::new(&config.email))
    };

    let today = chrono::Local::now().date_naive();
    let report = Pipeline::new(&config, &source, &scorer, mailer.as_ref())
        .run(&profile, today)
        .await?;

    tracing::info!(
        "Done: fetched={} candidates={} scored={} failed={} digest={} delivered={}",
        report.fetched,
        report.candidates,
        report.scored,
        report.scoring_failures,
        report.digest_len,
        report.delivered
    );
    Ok(())
}
