//! Certkeeper - Main entry point
//!
//! Keeps a TLS certificate renewed, hot-reloaded and, when renewal keeps
//! failing, replaced by a self-signed fallback.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};

use certkeeper_common::CertificateInfo;
use certkeeper_config::validate::validate_environment;
use certkeeper_config::Config;
use certkeeper_daemon::adapters::{
    CommandHostListener, CommandIssuer, LogAlerts, PidFileProxy, StaticSettings, WebhookAlerts,
};
use certkeeper_daemon::cert_info::current_certificate_info;
use certkeeper_daemon::reload::ProcessPermissionProbe;
use certkeeper_daemon::tls_store::load_certified_key;
use certkeeper_daemon::{
    AlertChannel, FallbackController, HotReloadNotifier, PortArbiter, ReloadFanout,
    ReloadStrategy, RenewalScheduler, StateStore,
};

/// Default configuration file location
const DEFAULT_CONFIG_PATH: &str = "/etc/certkeeper/certkeeper.kdl";

/// Upper bound on waiting for an in-flight renewal at shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Certkeeper - certificate lifecycle daemon
#[derive(Parser, Debug)]
#[command(name = "certkeeper")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTKEEPER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// Run the renewal scheduler until interrupted (default)
    Run,
    /// Run a single freshness check and renew if due
    Check,
    /// Print persisted renewal state and certificate expiry as JSON
    Status,
    /// Install a self-signed fallback certificate now
    Fallback,
    /// Validate configuration file and exit
    Test,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let command = cli.command.unwrap_or(Commands::Run);

    let runtime = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
    runtime.block_on(async {
        match command {
            Commands::Test => test_config(&config_path),
            Commands::Run => run_daemon(Services::load(&config_path)?).await,
            Commands::Check => check_once(Services::load(&config_path)?).await,
            Commands::Status => print_status(Services::load(&config_path)?).await,
            Commands::Fallback => install_fallback(Services::load(&config_path)?).await,
        }
    })
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::from_file(path)?;
    config
        .validate()
        .context("Configuration validation failed")?;
    Ok(config)
}

/// Test configuration file and exit
fn test_config(path: &Path) -> Result<()> {
    info!("Testing configuration file: {}", path.display());
    let config = load_config(path)?;

    let result = validate_environment(&config);
    for warning in &result.warnings {
        warn!("{}", warning.message);
    }
    for err in &result.errors {
        error!("{}", err);
    }
    if !result.is_valid() {
        bail!(
            "configuration test failed with {} error(s)",
            result.errors.len()
        );
    }

    let cert_path = config.certificate.cert_path();
    let key_path = config.certificate.key_path();
    if config.certificate.enabled && cert_path.exists() {
        load_certified_key(&cert_path, &key_path)
            .context("Certificate pair cannot be served over TLS")?;
        info!("  - certificate pair loads: {}", cert_path.display());
    }

    info!("Configuration test successful:");
    info!("  - renewal enabled: {}", config.certificate.enabled);
    info!("  - identifier: {}", config.certificate.identifier);
    info!("  - {} warning(s)", result.warnings.len());

    println!(
        "certkeeper: configuration file {} test is successful",
        path.display()
    );
    Ok(())
}

/// Everything the subcommands need, wired from the configuration
struct Services {
    scheduler: Arc<RenewalScheduler>,
    fallback: Arc<FallbackController>,
    settings: Arc<StaticSettings>,
    issuer: Arc<CommandIssuer>,
}

impl Services {
    fn load(path: &Path) -> Result<Self> {
        let config = load_config(path)?;
        Self::build(&config)
    }

    fn build(config: &Config) -> Result<Self> {
        let state = Arc::new(
            StateStore::open(&config.state_file.0).context("Failed to open renewal state")?,
        );

        let alerts: Arc<dyn AlertChannel> = match &config.alerts.webhook {
            Some(url) => Arc::new(WebhookAlerts::new(url.clone())?),
            None => Arc::new(LogAlerts),
        };

        let settings = Arc::new(StaticSettings::new(config.certificate.clone()));
        let issuer = Arc::new(CommandIssuer::new(
            config.issuer.command.clone(),
            config.certificate.base_path.clone(),
        ));

        let mut fanout = ReloadFanout::new(alerts.clone());
        if config.proxy.pid_file.is_some() {
            let notifier = HotReloadNotifier::new(
                Arc::new(PidFileProxy::new(&config.proxy)?),
                Arc::new(ProcessPermissionProbe),
            )
            .with_strategy(ReloadStrategy::detect())
            .with_verify_delay(config.proxy.verify_delay)
            .with_alerts(alerts.clone());
            fanout = fanout.with_notifier(Arc::new(notifier));
        } else {
            info!("No proxy pid-file configured, certificates will not be hot-reloaded");
        }
        let fanout = Arc::new(fanout);

        let fallback = Arc::new(
            FallbackController::new(settings.clone(), alerts.clone())
                .with_observer(fanout.clone())
                .with_last_success(state.snapshot().last_renewal_time),
        );

        let arbiter = Arc::new(PortArbiter::new(
            Arc::new(CommandHostListener::new(&config.host_listener)),
            config.host_listener.privileged_port,
        ));

        let scheduler = Arc::new(
            RenewalScheduler::new(
                config.renewal.clone(),
                state,
                settings.clone(),
                issuer.clone(),
                alerts,
                arbiter,
                fallback.clone(),
            )
            .with_observer(fanout),
        );

        Ok(Self {
            scheduler,
            fallback,
            settings,
            issuer,
        })
    }
}

/// Run the scheduler until SIGINT/SIGTERM
async fn run_daemon(services: Services) -> Result<()> {
    let handle = services.scheduler.start();
    info!("Certkeeper started");

    wait_for_shutdown_signal().await?;
    info!("Received shutdown signal, stopping");

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, services.scheduler.stop()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to save final renewal state"),
        Err(_) => warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Renewal still in flight at shutdown, exiting anyway"
        ),
    }

    if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
        warn!("Scheduler loop did not exit in time");
    }

    info!("Certkeeper stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

/// Run one check and report the outcome
async fn check_once(services: Services) -> Result<()> {
    match services.scheduler.check_and_renew().await {
        Ok(()) => {
            let state = services.scheduler.state();
            println!(
                "certkeeper: check complete (consecutive failures: {})",
                state.consecutive_fails
            );
            Ok(())
        }
        Err(e) if e.is_degraded() => {
            println!("certkeeper: {}", e);
            Ok(())
        }
        Err(e) => Err(anyhow!("{} [{}]", e, e.code())),
    }
}

async fn print_status(services: Services) -> Result<()> {
    let state = services.scheduler.state();
    let certificate: Option<CertificateInfo> =
        match current_certificate_info(services.settings.as_ref(), services.issuer.as_ref()).await
        {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(error = %e, "Cannot read current certificate");
                None
            }
        };

    let status = serde_json::json!({
        "state": state,
        "certificate": certificate,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&status).context("Failed to render status")?
    );
    Ok(())
}

async fn install_fallback(services: Services) -> Result<()> {
    let record = services
        .fallback
        .trigger_fallback()
        .await
        .map_err(|e| anyhow!("{} [{}]", e, e.code()))?;

    println!(
        "certkeeper: self-signed certificate for {} installed at {} (expires {})",
        record.identifier,
        record.path.display(),
        record.expiry.to_rfc3339()
    );
    Ok(())
}
