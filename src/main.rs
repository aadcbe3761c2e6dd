//! LibreConnect CLI
//!
//! Observes step count and heart rate and mirrors steps to a collector.

use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use libreconnect::{
    anchor::AnchorLedger,
    config::{Config, SourceConfig},
    forward::SyncForwarder,
    store::{InMemorySampleStore, QuantitySample, SampleType},
    transparency::TransparencyLog,
    HealthState, SyncAgent, VERSION,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "libreconnect")]
#[command(author = "LibreConnect")]
#[command(version = VERSION)]
#[command(about = "Health sample observer with collector sync", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Observe the health store and mirror steps to the collector
    Start {
        /// Sample types to observe (steps, heart_rate, or all)
        #[arg(long)]
        sources: Option<String>,

        /// Forward step samples to the collector
        #[arg(long)]
        forward: bool,

        /// Collector URL (overrides the config file)
        #[arg(long)]
        collector_url: Option<String>,

        /// Seconds between samples written by the demo feed
        #[arg(long, default_value = "5")]
        simulate_interval: u64,

        /// Expose observed state over HTTP on this port (requires server feature)
        #[cfg(feature = "server")]
        #[arg(long)]
        serve_port: Option<u16>,
    },

    /// Show configuration, anchors and cumulative statistics
    Status,

    /// Show configuration
    Config,

    /// Forget stored anchors so the next run starts from the beginning
    ResetAnchors {
        /// Sample types to reset (steps, heart_rate, or all)
        #[arg(long, default_value = "all")]
        sources: String,
    },

    /// Send a single step total to the collector
    SendTotal {
        /// Step total to send
        #[arg(long)]
        steps: f64,

        /// Collector URL (overrides the config file)
        #[arg(long)]
        collector_url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        #[cfg(feature = "server")]
        Commands::Start {
            sources,
            forward,
            collector_url,
            simulate_interval,
            serve_port,
        } => {
            cmd_start(sources, forward, collector_url, simulate_interval, serve_port).await;
        }
        #[cfg(not(feature = "server"))]
        Commands::Start {
            sources,
            forward,
            collector_url,
            simulate_interval,
        } => {
            cmd_start(sources, forward, collector_url, simulate_interval, None).await;
        }
        Commands::Status => {
            cmd_status();
        }
        Commands::Config => {
            cmd_config();
        }
        Commands::ResetAnchors { sources } => {
            cmd_reset_anchors(&sources);
        }
        Commands::SendTotal {
            steps,
            collector_url,
        } => {
            cmd_send_total(steps, collector_url).await;
        }
    }
}

fn load_config() -> Config {
    match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Could not load config ({e}); using defaults");
            Config::default()
        }
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}

async fn cmd_start(
    sources: Option<String>,
    forward: bool,
    collector_url: Option<String>,
    simulate_interval: u64,
    serve_port: Option<u16>,
) {
    println!("LibreConnect v{VERSION}");
    println!();

    let mut config = load_config();
    if let Some(ref sources) = sources {
        config.sources = SourceConfig::from_csv(sources);
    }
    if !config.sources.any_enabled() {
        eprintln!("Error: At least one source must be enabled (steps or heart_rate)");
        std::process::exit(1);
    }
    if forward {
        config.collector.enabled = true;
    }
    if let Some(url) = collector_url {
        config.collector.url = url;
    }
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    println!("Starting observation...");
    println!("  Steps: {}", enabled(config.sources.steps));
    println!("  Heart rate: {}", enabled(config.sources.heart_rate));
    println!("  Heart rate strategy: {:?}", config.heart_rate_strategy);
    if config.collector.enabled {
        println!("  Collector: {}", config.collector.url);
    } else {
        println!("  Collector: disabled");
    }

    // No platform store is linked into the CLI; a demo feed writes samples instead.
    // Its positions start over every run, so anchors from a previous run do not apply.
    config.persist_anchors = false;
    let store = Arc::new(InMemorySampleStore::default());
    let agent = match SyncAgent::new(Arc::clone(&store), &config) {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let report = agent.start().await;
    for (name, e) in &report.denied {
        eprintln!("Warning: {name} monitor not started: {e}");
    }
    if report.granted.is_empty() {
        eprintln!("Error: No monitor could be started");
        std::process::exit(1);
    }

    #[cfg(feature = "server")]
    let server_shutdown = match serve_port {
        Some(port) => {
            let server_config = libreconnect::server::ServerConfig::new(port);
            match libreconnect::server::run(server_config, agent.subscribe(), Arc::clone(agent.log()))
                .await
            {
                Ok((addr, shutdown)) => {
                    println!("  State server: http://{addr}");
                    Some(shutdown)
                }
                Err(e) => {
                    eprintln!("Warning: Could not start state server: {e}");
                    None
                }
            }
        }
        None => None,
    };
    #[cfg(not(feature = "server"))]
    if serve_port.is_some() {
        eprintln!("Warning: --serve-port ignored (server feature not enabled at compile time)");
    }

    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let printer = tokio::spawn(print_state_changes(agent.subscribe()));
    let feed = tokio::spawn(demo_feed(
        Arc::clone(&store),
        config.sources.clone(),
        Duration::from_secs(simulate_interval.max(1)),
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Error waiting for Ctrl+C: {e}");
    }

    println!();
    println!("Stopping...");
    feed.abort();
    printer.abort();
    #[cfg(feature = "server")]
    if let Some(shutdown) = server_shutdown {
        let _ = shutdown.send(());
    }
    agent.shutdown();

    // Final stats
    println!();
    println!("{}", agent.log().summary());
}

/// Print every published state change.
async fn print_state_changes(mut rx: watch::Receiver<HealthState>) {
    while rx.changed().await.is_ok() {
        let state = rx.borrow_and_update().clone();
        let latest_bpm = state
            .heart_rate_samples
            .first()
            .map(|s| format!("{:.0} bpm", s.value()))
            .unwrap_or_else(|| "-".to_string());

        println!(
            "[{}] steps: {:.0} ({} samples) | heart rate: {} ({} recent)",
            Utc::now().format("%H:%M:%S"),
            state.step_count,
            state.step_samples.len(),
            latest_bpm,
            state.heart_rate_samples.len()
        );
    }
}

/// Write one sample per enabled type on every tick.
async fn demo_feed(store: Arc<InMemorySampleStore>, sources: SourceConfig, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    let span = ChronoDuration::from_std(every).unwrap_or_else(|_| ChronoDuration::seconds(5));

    loop {
        ticker.tick().await;
        let end = Utc::now();
        let start = end - span;
        let seed = end.timestamp();

        let mut samples = Vec::new();
        if sources.steps {
            samples.push(QuantitySample::new(
                SampleType::StepCount,
                (seed % 40 + 5) as f64,
                start,
                end,
            ));
        }
        if sources.heart_rate {
            samples.push(QuantitySample::new(
                SampleType::HeartRate,
                (seed % 30 + 60) as f64,
                end,
                end,
            ));
        }
        store.insert(samples);
    }
}

fn cmd_status() {
    let config = load_config();

    println!("LibreConnect Status");
    println!("===================");
    println!();

    println!("Configuration:");
    println!("  Steps: {}", enabled(config.sources.steps));
    println!("  Heart rate: {}", enabled(config.sources.heart_rate));
    println!("  Heart rate strategy: {:?}", config.heart_rate_strategy);
    println!("  Heart rate window: {}", config.heart_rate_window);
    println!("  Background delivery: {:?}", config.background_frequency);
    println!(
        "  Collector: {} ({})",
        enabled(config.collector.enabled),
        config.collector.url
    );
    println!();

    let anchors = AnchorLedger::with_persistence(config.anchors_path()).snapshot();
    if anchors.is_empty() {
        println!("No stored anchors.");
    } else {
        println!("Stored anchors:");
        for (sample_type, anchor) in anchors {
            println!("  {sample_type}: {anchor}");
        }
    }
    println!();

    if config.transparency_path().exists() {
        let stats = TransparencyLog::with_persistence(config.transparency_path()).stats();
        println!("Cumulative Statistics:");
        println!("  Change notifications: {}", stats.notifications_received);
        println!("  Acknowledged: {}", stats.notifications_acknowledged);
        println!("  Step samples read: {}", stats.step_samples_read);
        println!("  Heart rate samples read: {}", stats.heart_rate_samples_read);
        println!("  Collector batches: {}", stats.forwards_attempted);
        println!("  Collector failures: {}", stats.forwards_failed);
    } else {
        println!("No previous session data found.");
    }
}

fn cmd_config() {
    let config = load_config();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );
}

fn cmd_reset_anchors(sources: &str) {
    let config = load_config();
    let ledger = AnchorLedger::with_persistence(config.anchors_path());
    let selected = SourceConfig::from_csv(sources);

    if selected.steps && selected.heart_rate {
        ledger.reset_all();
    } else {
        for sample_type in selected.sample_types() {
            ledger.reset(sample_type);
        }
    }

    if let Err(e) = ledger.save() {
        eprintln!("Error saving anchors: {e}");
        std::process::exit(1);
    }
    println!("Anchors reset. The next run reads every sample again.");
}

async fn cmd_send_total(steps: f64, collector_url: Option<String>) {
    let config = load_config();
    let mut settings = config.collector.clone();
    if let Some(url) = collector_url {
        settings.url = url;
    }

    let collector = match settings.collector_config() {
        Ok(collector) => collector,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let forwarder = match SyncForwarder::new(collector) {
        Ok(forwarder) => forwarder,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    match forwarder.send_total(steps).await {
        Ok(receipt) => {
            println!("Collector answered {}: {}", receipt.status, receipt.body);
        }
        Err(e) => {
            eprintln!("Error sending total: {e}");
            std::process::exit(1);
        }
    }
}
