//! license-pubsub command line entry point

use clap::{Parser, Subcommand};
use license_pubsub::api::{HttpLicenseApi, SignaturePolicy};
use license_pubsub::config::AppConfig;
use license_pubsub::error::LicenseResult;
use license_pubsub::identity::{EnvIdentityProvider, IdentityProvider};
use license_pubsub::pubsub::{PubSubClient, SubscriptionRouter};
use license_pubsub::observability::init_default_logging;
use license_pubsub::purchase::{
    LicenseService, PendingOperationCoordinator, PurchaseSettings, TerminalPresenter,
};
use license_pubsub::service::{PubSubService, ServiceError, ServiceStatus};
use license_pubsub::transport::WebSocketConnector;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: &[&str] = &["license-pubsub.toml", "config/license-pubsub.toml"];
const ROUTED_MESSAGE_BUFFER: usize = 32;

/// Push channel client for license payment notifications
#[derive(Parser)]
#[command(name = "license-pubsub")]
#[command(about = "Listen for license payment pushes and run license purchases")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "LICENSE_PUBSUB_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print every push message for this device
    Listen,
    /// Buy a license and wait for the payment confirmation
    Purchase {
        /// License UUID
        license_id: String,
    },
    /// Show the license currently active for a package
    Verify {
        /// Application package name
        package_id: String,
    },
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging(cli.verbose);

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e.user_message());
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Listen => run_listen(config).await,
        Commands::Purchase { license_id } => run_purchase(config, &license_id).await,
        Commands::Verify { package_id } => run_verify(config, &package_id).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(code = e.code(), "Command failed: {}", e.user_message());
        process::exit(1);
    }
}

fn load_configuration(config_path: Option<&Path>) -> LicenseResult<AppConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AppConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AppConfig::load_from_file(path)?);
        }
    }

    info!("No configuration file found; using built-in defaults");
    Ok(AppConfig::default())
}

fn new_service(config: &AppConfig) -> PubSubService {
    PubSubService::new(
        config.pubsub.clone(),
        Arc::new(WebSocketConnector::new()),
        PendingOperationCoordinator::new(),
    )
}

async fn run_listen(config: AppConfig) -> LicenseResult<()> {
    let identity = EnvIdentityProvider::new(config.account.clone())
        .current_identity()
        .await?;
    let service = new_service(&config);
    let mut status = service.watch_status();

    let client = service
        .start(&identity.account_code, &identity.device_id)
        .await?;
    let (tx, mut messages) = mpsc::channel(ROUTED_MESSAGE_BUFFER);
    client.router().set_message_sender(tx);
    info!(subject = ?client.device_subject(), "Listening for push messages");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut lost = None;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(routed) = messages.recv() => print_json(&routed),
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if let ServiceStatus::Error(reason) = current {
                    lost = Some(reason);
                    break;
                }
            }
        }
    }

    drop(client);
    service.stop().await?;
    match lost {
        Some(reason) => Err(ServiceError::ConnectionLost(reason).into()),
        None => Ok(()),
    }
}

fn build_license_service(config: &AppConfig) -> LicenseResult<(LicenseService, Arc<PubSubClient>)> {
    let router = Arc::new(SubscriptionRouter::new(PendingOperationCoordinator::new()));
    let client = Arc::new(PubSubClient::new(
        config.pubsub.clone(),
        Arc::new(WebSocketConnector::new()),
        router,
    )?);

    if config.purchase.require_signature {
        warn!("Signatures are required but no verifier is configured; signed responses will be rejected");
    }

    let licenses = LicenseService::new(
        Arc::clone(&client),
        Arc::new(HttpLicenseApi::new(&config.api)?),
        Arc::new(EnvIdentityProvider::new(config.account.clone())),
        Arc::new(TerminalPresenter),
        SignaturePolicy::new(None, config.purchase.require_signature),
        PurchaseSettings::from_config(config),
    );
    Ok((licenses, client))
}

async fn run_purchase(config: AppConfig, license_id: &str) -> LicenseResult<()> {
    let (licenses, client) = build_license_service(&config)?;

    let outcome = tokio::select! {
        outcome = licenses.purchase_license(license_id) => Some(outcome),
        _ = shutdown_signal() => None,
    };
    match outcome {
        Some(outcome) => print_json(&outcome),
        None => info!("Purchase interrupted"),
    }

    client.disconnect().await;
    Ok(())
}

/// Verification is a single REST call; the push channel stays closed
async fn run_verify(config: AppConfig, package_id: &str) -> LicenseResult<()> {
    let (licenses, _client) = build_license_service(&config)?;
    print_json(&licenses.verify_current_license(package_id).await);
    Ok(())
}

fn handle_config_command(config: &AppConfig, show: bool) -> LicenseResult<()> {
    config.validate()?;
    info!("Configuration is valid");

    if show {
        println!("{}", config.to_toml_string()?);
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "Could not render output"),
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
