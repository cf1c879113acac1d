use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orbit_fetch::{catalog, Config, Downloader, HttpClient, OrderOrchestrator, OrderRequest};
use orbit_fetch::{AssetRef, SinkTarget};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use url::Url;

const REPORT_FILE: &str = "download_report.json";

#[derive(Parser)]
#[command(version, about = "Activate and download satellite imagery assets")]
struct Cli {
    #[arg(long, default_value = "./inputs/config.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download assets of every item a catalog search returns.
    Search {
        #[arg(long)]
        url: Url,
        /// Asset types to fetch; every asset when omitted.
        #[arg(long = "asset-type")]
        asset_types: Vec<String>,
        #[arg(long, default_value = "./outputs")]
        output: PathBuf,
    },
    /// Place an order and download what it produces.
    Order {
        #[arg(long)]
        request: PathBuf,
        #[arg(long, default_value = "./outputs")]
        output: PathBuf,
    },
}

fn file_sink(output: &Path) -> impl Fn(&AssetRef) -> SinkTarget + '_ {
    move |asset| SinkTarget::File(output.join(&asset.item_id).join(&asset.asset_type))
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = Config::read_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let client = HttpClient::from_config(&config.api)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling outstanding downloads");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Command::Search {
            url,
            asset_types,
            output,
        } => {
            let report = Downloader::new(&client, &config)
                .download_listing(
                    catalog::search(&client, url),
                    |item| catalog::asset_refs(item, &asset_types),
                    file_sink(&output),
                    &cancel,
                )
                .await?;
            std::fs::create_dir_all(&output)?;
            report.write(output.join(REPORT_FILE))?;
            tracing::info!(
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                cancelled = report.cancelled.len(),
                "Search download finished"
            );
        }
        Command::Order { request, output } => {
            let request = OrderRequest::read(&request)
                .with_context(|| format!("loading {}", request.display()))?;
            let report = OrderOrchestrator::new(&client, &config)
                .run(&request, file_sink(&output), &cancel)
                .await?;
            std::fs::create_dir_all(&output)?;
            report.write(output.join(REPORT_FILE))?;
            tracing::info!(
                order_id = %report.order.id,
                state = %report.order.state,
                outcome = ?report.outcome,
                succeeded = report.downloads.succeeded.len(),
                failed = report.downloads.failed.len(),
                "Order finished"
            );
        }
    }

    Ok(())
}
