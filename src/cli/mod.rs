//! Command-line interface for dbwarden.
//!
//! Without a database driver the binary is a harness: it validates
//! configuration, or runs the admission pipeline and the ASH sampler against
//! synthetic input and prints every output record as a JSON line.

use crate::ash::{AshSampler, SyntheticSessionSource};
use crate::core::{attrs, Config, ConfigBuilder, GuardError, Result, TelemetryRecord};
use crate::pipeline::{AdmissionPipeline, OutputRecord};
use clap::Parser;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Admission control for database telemetry
#[derive(Parser, Debug)]
#[command(name = "dbwarden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (default: ~/.config/dbwarden/config.yaml)
    #[arg(short, long, env = "DBWARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, env = "DBWARDEN_DEBUG")]
    pub debug: bool,

    /// Validate configuration, print it and exit
    #[arg(long)]
    pub check_config: bool,

    /// Run the synthetic demo for this many seconds (until Ctrl-C if omitted)
    #[arg(long, env = "DBWARDEN_DURATION")]
    pub duration: Option<u64>,

    /// Override the default sampling rate
    #[arg(long, env = "DBWARDEN_SAMPLING_RATE")]
    pub sampling_rate: Option<f64>,

    /// Sessions reported by the synthetic session source
    #[arg(long, default_value = "120")]
    pub sessions: usize,

    /// Synthetic telemetry records generated per second
    #[arg(long, default_value = "200")]
    pub records_per_sec: u32,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Load configuration with precedence CLI > file > defaults. Returns the
    /// file that was read, if any.
    pub async fn load_config(&self) -> Result<(Config, Option<PathBuf>)> {
        let mut builder = ConfigBuilder::new();

        let path = match &self.config {
            Some(path) => Some(path.clone()),
            None => dirs::config_dir()
                .map(|d| d.join("dbwarden").join("config.yaml"))
                .filter(|p| p.exists()),
        };

        if let Some(path) = &path {
            let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                GuardError::config(format!("failed to read config file {}: {e}", path.display()))
            })?;
            builder = builder.from_yaml(&content)?;
        }

        if let Some(rate) = self.sampling_rate {
            builder = builder.sampling_rate(rate);
        }
        Ok((builder.debug(self.debug).build()?, path))
    }

    /// Initialize logging. `RUST_LOG` wins, then `--debug`, then the config.
    pub fn init_logging(&self, config: &Config) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let level = if self.debug { "debug" } else { config.logging.level.as_str() };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        let fmt_layer = if config.logging.structured {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_writer(std::io::stderr)
                .compact()
        } else {
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact()
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| GuardError::config(format!("failed to initialize logging: {e}")))?;
        Ok(())
    }
}

/// Execute the dbwarden command line.
pub async fn execute(cli: Cli) -> Result<()> {
    let (config, path) = cli.load_config().await?;

    if cli.check_config {
        println!("# configuration is valid");
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    cli.init_logging(&config)?;
    if let Some(path) = path {
        tracing::info!(path = %path.display(), "loaded configuration");
    }
    run_demo(&cli, config).await
}

async fn run_demo(cli: &Cli, config: Config) -> Result<()> {
    let (pipeline, rx) = AdmissionPipeline::new(&config)?;
    let pipeline = Arc::new(pipeline);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let printer = tokio::spawn(print_records(rx));

    let source = Arc::new(SyntheticSessionSource::new(cli.sessions));
    let ash = AshSampler::with_stats(&config.ash, source, pipeline.stats())?.with_output(pipeline.queue());
    let ash_handle = tokio::spawn(ash.run(shutdown_rx.clone()));

    let feeder = tokio::spawn(feed_records(
        Arc::clone(&pipeline),
        cli.records_per_sec.max(1),
        shutdown_rx.clone(),
    ));
    let reporter = tokio::spawn(report_stats(
        Arc::clone(&pipeline),
        config.pipeline.stats_interval,
        shutdown_rx,
    ));

    tracing::info!(sessions = cli.sessions, rate = cli.records_per_sec, "dbwarden demo running");
    match cli.duration {
        Some(secs) => {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(secs)) => {},
                _ = tokio::signal::ctrl_c() => tracing::info!("received shutdown signal, stopping..."),
            }
        },
        None => {
            tokio::signal::ctrl_c().await?;
            tracing::info!("received shutdown signal, stopping...");
        },
    }

    let _ = shutdown_tx.send(true);
    for handle in [ash_handle, feeder, reporter] {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "background task failed");
        }
    }
    pipeline.emit_stats();
    drop(pipeline);
    if let Err(e) = printer.await {
        tracing::error!(error = %e, "printer task failed");
    }
    Ok(())
}

async fn print_records(mut rx: mpsc::Receiver<OutputRecord>) {
    while let Some(record) = rx.recv().await {
        match serde_json::to_string(&record) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(kind = record.kind(), error = %e, "failed to serialize output record"),
        }
    }
}

async fn feed_records(pipeline: Arc<AdmissionPipeline>, per_sec: u32, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let batch = (per_sec / 10).max(1);
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for _ in 0..batch {
                    seq += 1;
                    pipeline.process(synthetic_record(seq));
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!(records = seq, "record feeder stopped");
}

async fn report_stats(pipeline: Arc<AdmissionPipeline>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                pipeline.emit_stats();
                tracing::info!(health = ?pipeline.health(false), "stats emitted");
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// A query-duration record. `flaky` occasionally reports breaker-relevant errors.
fn synthetic_record(seq: u64) -> TelemetryRecord {
    const DATABASES: [&str; 4] = ["orders", "inventory", "analytics", "flaky"];
    let mut rng = rand::thread_rng();
    let db = DATABASES[rng.gen_range(0..DATABASES.len())];
    let duration_ms: i64 = if rng.gen_bool(0.03) {
        rng.gen_range(1_000..20_000)
    } else {
        rng.gen_range(1..250)
    };

    let mut record = TelemetryRecord::new("db.query.duration")
        .with_attr(attrs::RESOURCE_ID, db)
        .with_attr(attrs::QUERY_ID, format!("q-{}", rng.gen_range(0..400)))
        .with_attr(attrs::USER_ID, format!("user-{}", seq % 17))
        .with_attr(attrs::DURATION_MS, duration_ms);
    if db == "flaky" && rng.gen_bool(0.2) {
        record.set_attr(attrs::ERROR, true);
        record.set_attr(attrs::ERROR_MESSAGE, "NrIntegrationError: unique time series limit reached");
    }
    record
}
