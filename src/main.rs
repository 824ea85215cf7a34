//! BetterBot Client CLI
//!
//! Usage:
//!   betterbot-client watch [--bell]
//!   betterbot-client run <RUN_ID> [--cache-file ./artifacts.json] [--refresh]
//!
//! Configuration comes from `BETTERBOT_*` environment variables (and `.env`),
//! or from a TOML file passed with `--config`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use betterbot_client::api::RestClient;
use betterbot_client::certified::{
    summary_loader, validate_footer_fields, window_pnl_loader, ArtifactCache, ArtifactEndpoint,
    CachePersistence, CertifiedRunFooterData, JsonFilePersistence, MemoryPersistence, MismatchInfo,
    RenderGate, RunSummaryResponse, StaticToken, WindowPnlHistogramResponse,
};
use betterbot_client::ingest::{
    AlertSink, BellAlertSink, LogAlertSink, PollingConfig, PollingIngestionClient,
    StreamBufferConfig, StreamIngestionBuffer, WsStreamClient,
};
use betterbot_client::signals::{RetentionPolicy, SignalStore};
use betterbot_client::{telemetry, ClientConfig};

#[derive(Parser, Debug)]
#[command(name = "betterbot-client")]
#[command(about = "Live signal feed and certified run viewer for the BetterBot backend")]
struct Cli {
    /// TOML config file (environment is used when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream and poll signals into the store and log every update
    Watch {
        /// Ring the terminal bell on high-confidence signals
        #[arg(long)]
        bell: bool,

        /// Seconds between store summaries
        #[arg(long, default_value = "10")]
        report_secs: u64,
    },

    /// Load a certified run and print its render gate
    Run {
        run_id: String,

        /// Persist the artifact cache to this JSON file
        #[arg(long)]
        cache_file: Option<PathBuf>,

        /// Revalidate cached artifacts with the backend
        #[arg(long)]
        refresh: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing();

    let config = match &cli.config {
        Some(path) => ClientConfig::from_toml_file(path)?,
        None => ClientConfig::from_env(),
    };
    info!(api = %config.api_url, ws = %config.ws_url, "betterbot-client starting");

    match cli.command {
        Commands::Watch { bell, report_secs } => watch(config, bell, report_secs).await,
        Commands::Run {
            run_id,
            cache_file,
            refresh,
        } => show_run(config, &run_id, cache_file, refresh).await,
    }
}

async fn watch(config: ClientConfig, bell: bool, report_secs: u64) -> Result<()> {
    let store = Arc::new(SignalStore::new(RetentionPolicy::default()));
    store.subscribe(|snapshot| {
        if let Some(error) = &snapshot.error {
            warn!(revision = snapshot.revision, %error, "store error");
        }
    });

    let alerts: Arc<dyn AlertSink> = if bell {
        Arc::new(BellAlertSink)
    } else {
        Arc::new(LogAlertSink)
    };
    let buffer =
        StreamIngestionBuffer::with_alerts(store.clone(), StreamBufferConfig::from(&config), alerts);
    buffer
        .attach(Arc::new(WsStreamClient::from_config(&config)))
        .await
        .context("Failed to start signal stream")?;

    let rest = Arc::new(RestClient::new(&config)?);
    let poller = Arc::new(PollingIngestionClient::new(
        rest,
        store.clone(),
        PollingConfig::from(&config),
    ));
    let polling = poller.spawn(buffer.status());

    let mut report = interval(Duration::from_secs(report_secs.max(1)));
    loop {
        tokio::select! {
            _ = report.tick() => {
                let snapshot = store.snapshot();
                let status = *buffer.status().borrow();
                let newest = snapshot.signals.first();
                info!(
                    signals = snapshot.signals.len(),
                    revision = snapshot.revision,
                    status = status.as_str(),
                    rtt_ms = ?buffer.latency().last_ms(),
                    total = ?snapshot.stats.as_ref().map(|s| s.total_signals),
                    newest = ?newest.map(|s| (&s.id, &s.market_slug, s.confidence)),
                    "store"
                );
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for ctrl-c");
                }
                break;
            }
        }
    }

    info!("shutting down");
    polling.stop();
    buffer.teardown().await;
    Ok(())
}

async fn show_run(
    config: ClientConfig,
    run_id: &str,
    cache_file: Option<PathBuf>,
    refresh: bool,
) -> Result<()> {
    let persistence: Arc<dyn CachePersistence> = match cache_file {
        Some(path) => Arc::new(JsonFilePersistence::open(path)?),
        None => Arc::new(MemoryPersistence::new()),
    };
    let api = Arc::new(RestClient::new(&config)?);
    let tokens = Arc::new(StaticToken(config.api_token.clone()));

    let on_mismatch = |info: &MismatchInfo| {
        warn!("published artifact changed: {}", info);
    };
    let summaries: Arc<ArtifactCache<RunSummaryResponse>> = Arc::new(
        ArtifactCache::new(api.clone(), ArtifactEndpoint::Summary, persistence.clone())
            .with_mismatch_callback(on_mismatch),
    );
    let histograms: Arc<ArtifactCache<WindowPnlHistogramResponse>> = Arc::new(
        ArtifactCache::new(api, ArtifactEndpoint::WindowPnlHistogram, persistence)
            .with_mismatch_callback(on_mismatch),
    );

    let summary = summary_loader(summaries, tokens.clone());
    let histogram = window_pnl_loader(histograms, tokens);

    summary.load(run_id).await;
    histogram.load(run_id).await;
    if refresh {
        summary.refresh().await;
        histogram.refresh().await;
    }

    let summary_view = summary.view();
    print_gate("summary", &summary_view.gate);
    if let Some(response) = &summary_view.data {
        let run = &response.data;
        println!(
            "  strategy {} {} | pnl {:.2} | fills {} | trust {:?}",
            run.strategy_id.name,
            run.strategy_id.version,
            run.final_pnl,
            run.total_fills,
            response.trust_level.status
        );
        for disclaimer in response.blocking_disclaimers() {
            println!("  ! {}: {}", disclaimer.title, disclaimer.description);
        }
        let footer = validate_footer_fields(&CertifiedRunFooterData::from_summary(response));
        println!("  footer valid: {}", footer.is_valid);
    }
    if let Some(mismatch) = &summary_view.mismatch {
        println!("  mismatch: {}", mismatch);
    }

    let histogram_view = histogram.view();
    print_gate("window pnl", &histogram_view.gate);
    if let Some(hist) = &histogram_view.data {
        for bin in hist.bins.iter().flatten() {
            println!("  [{:>10.2}, {:>10.2}) {}", bin.left, bin.right, bin.count);
        }
        println!(
            "  underflow {} | overflow {} | total {}",
            hist.underflow_count, hist.overflow_count, hist.total_samples
        );
    }

    Ok(())
}

fn print_gate(label: &str, gate: &RenderGate) {
    match gate {
        RenderGate::Ready => println!("{}: ready", label),
        RenderGate::Loading => println!("{}: loading", label),
        RenderGate::Unavailable { reason, retryable } => println!(
            "{}: unavailable ({}){}",
            label,
            reason,
            if *retryable { " [retry]" } else { "" }
        ),
    }
}
