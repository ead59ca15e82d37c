//! Premium oracle CLI and server binary
//!
//! `start` runs the polling pipeline and the read API until Ctrl+C or
//! SIGTERM; `quote` fetches once and prints a premium; `validate` and `init`
//! work on configuration files.

use anyhow::{Context, Result};
use cli::{Cli, Commands, OptionKind};
use common::{CircuitState, SystemClock};
use config::{generate_default_config, load_config, save_config, validate_config, OracleConfig};
use market_data::api::{oracle_routes, OracleApiState};
use market_data::{OptionType, PriceOracle, Scheduler};
use observability::{init_logging, init_logging_from_str, init_metrics, LogFormat};
use server::{health_routes, ComponentStatus, HealthState, HttpServer, Server, ServerConfig, ShutdownController};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SERVICE_NAME: &str = "premium-oracle";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Start { config, http, no_http } => start_oracle(config, http, no_http).await,
        Commands::Validate { config } => {
            init_logging(SERVICE_NAME, LogFormat::Pretty)?;
            validate_command(config)
        }
        Commands::Init { output } => {
            init_logging(SERVICE_NAME, LogFormat::Pretty)?;
            init_command(output)
        }
        Commands::Quote {
            config,
            option_type,
            strike,
            days,
        } => quote_command(config, option_type, strike, days).await,
    }
}

/// Load the configuration, install logging from its monitoring section and
/// refuse to continue on validation errors
fn load_validated<P: AsRef<Path>>(config_path: P) -> Result<OracleConfig> {
    let config = load_config(config_path.as_ref())?;
    init_logging_from_str(SERVICE_NAME, &config.monitoring.log_format)?;

    let report = validate_config(&config);
    for warning in &report.warnings {
        warn!(field = %warning.field, message = %warning.message, "Configuration warning");
    }
    if !report.is_valid() {
        error!(error_count = report.errors.len(), "Configuration validation failed");
        for err in &report.errors {
            error!("{}", err);
        }
        anyhow::bail!("Cannot start oracle due to configuration errors");
    }
    Ok(config)
}

async fn start_oracle<P: AsRef<Path>>(config_path: P, http_override: Option<u16>, no_http: bool) -> Result<()> {
    let config = load_validated(config_path)?;

    if let Some(port) = config.monitoring.metrics_port {
        init_metrics(port).context("Failed to start metrics exporter")?;
    }

    let clock = SystemClock::shared();
    let oracle = Arc::new(
        PriceOracle::from_config(&config, clock.clone())
            .await
            .context("Failed to initialize the price pipeline")?,
    );
    info!(
        oracle = %config.oracle.name,
        asset = %config.oracle.asset,
        sources = config.enabled_sources().count(),
        "Oracle initialized"
    );

    let shutdown = ShutdownController::with_signals();

    let scheduler = Scheduler::new(oracle.clone(), &config.scheduler, clock);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown.child_token()));

    let health = Arc::new(HealthState::new(SERVICE_NAME));
    let reporter_handle = tokio::spawn(report_health(
        oracle.clone(),
        health.clone(),
        Duration::from_secs(config.scheduler.spot_interval_secs.max(1)),
        shutdown.child_token(),
    ));

    let served = if no_http {
        info!("HTTP API disabled");
        shutdown.wait_for_shutdown().await;
        Ok(())
    } else {
        let mut server_config = ServerConfig::from(&config.server);
        if let Some(port) = http_override {
            debug!(port, "HTTP port overridden on the command line");
            server_config.http_port = Some(port);
        }
        let router = oracle_routes(Arc::new(OracleApiState::new(oracle.clone()))).merge(health_routes(health));
        let result = HttpServer::new(server_config, router)
            .run(shutdown.child_token())
            .await;
        // A failed listener takes the pipeline down with it
        shutdown.shutdown();
        result
    };

    scheduler_handle.await.context("Scheduler task failed")?;
    reporter_handle.await.context("Health reporter task failed")?;
    served.context("HTTP server failed")?;

    info!("Oracle stopped");
    Ok(())
}

/// Mirror consensus availability and circuit states into the health endpoint
async fn report_health(
    oracle: Arc<PriceOracle>,
    health: Arc<HealthState>,
    every: Duration,
    token: CancellationToken,
) {
    loop {
        let mut statuses = Vec::new();
        statuses.push(match oracle.get_consensus_price().await {
            Ok(_) => ComponentStatus::healthy("consensus"),
            Err(e) => ComponentStatus::unhealthy("consensus", e.to_string()),
        });
        for source in oracle.source_health() {
            let name = format!("source:{}", source.source_id);
            statuses.push(match source.circuit_state {
                CircuitState::Closed => ComponentStatus::healthy(name),
                state => ComponentStatus::unhealthy(name, format!("circuit {}", state)),
            });
        }
        health.replace_components(statuses).await;

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
    }
}

async fn quote_command<P: AsRef<Path>>(config_path: P, kind: OptionKind, strike: f64, days: f64) -> Result<()> {
    anyhow::ensure!(days <= 36_500.0, "expiry too far out: {} days", days);
    let config = load_validated(config_path)?;
    let clock = SystemClock::shared();
    let oracle = PriceOracle::from_config(&config, clock.clone())
        .await
        .context("Failed to initialize the price pipeline")?;

    if let Err(e) = oracle.run_daily_close().await {
        warn!(error = %e, "Daily close update failed, using stored history");
    }
    oracle.run_spot_cycle().await.context("No consensus price available")?;

    let option_type = match kind {
        OptionKind::Call => OptionType::Call,
        OptionKind::Put => OptionType::Put,
    };
    let expiry = clock.now() + chrono::Duration::seconds((days * 86_400.0).round() as i64);
    let quote = oracle
        .get_premium(option_type, strike, expiry)
        .await
        .with_context(|| format!("Cannot price {} {} expiring in {} days", kind.as_str(), strike, days))?;

    if let Err(e) = oracle.snapshot().await {
        warn!(error = %e, "Snapshot after quote failed");
    }

    println!("{}", serde_json::to_string_pretty(&quote)?);
    Ok(())
}

fn validate_command<P: AsRef<Path>>(config_path: P) -> Result<()> {
    info!(path = ?config_path.as_ref(), "Validating configuration");

    let config = match load_config(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(%e, "Failed to load configuration");
            anyhow::bail!(e);
        }
    };

    let report = validate_config(&config);

    println!("\n=== Configuration Validation Report ===\n");

    if !report.defaults_applied.is_empty() {
        println!("Defaults Applied ({}):", report.defaults_applied.len());
        for default in &report.defaults_applied {
            println!("  [info] {} = {}", default.field, default.value);
        }
        println!();
    }

    if !report.warnings.is_empty() {
        println!("Warnings ({}):", report.warnings.len());
        for warning in &report.warnings {
            println!("  [warn] [{}] {}", warning.field, warning.message);
        }
        println!();
    }

    if !report.errors.is_empty() {
        println!("Errors ({}):", report.errors.len());
        for err in &report.errors {
            println!("  [error] {}", err);
        }
        println!();
        anyhow::bail!("Configuration validation failed");
    }

    println!("[ok] Configuration is valid!");
    println!();
    println!("Oracle: {}", config.oracle.name);
    println!("Asset: {}", config.oracle.asset);
    println!(
        "Enabled sources: {}",
        config
            .enabled_sources()
            .map(|s| s.provider_id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("Minimum sources: {}", config.aggregation.min_sources);
    println!("Volatility windows: {:?}", config.volatility.windows);

    Ok(())
}

fn init_command<P: AsRef<Path>>(output_path: P) -> Result<()> {
    let output_path = output_path.as_ref();
    info!(?output_path, "Initializing new configuration file");

    let config = generate_default_config();

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    save_config(&config, output_path)?;

    println!("[ok] Configuration file created successfully!");
    println!();
    println!("Location: {:?}", output_path);
    println!();
    println!("This configuration includes:");
    println!("  - {} price sources", config.sources.len());
    println!("  - Volatility windows {:?}", config.volatility.windows);
    println!("  - Snapshot directory {}", config.storage.data_dir);
    println!();
    println!("Next steps:");
    println!("  1. Edit the configuration file to customize sources and thresholds");
    println!("  2. Run 'premium-oracle validate --config {:?}' to check configuration", output_path);
    println!("  3. Run 'premium-oracle start --config {:?}' to start the oracle", output_path);

    Ok(())
}
