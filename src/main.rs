//! tileserver - vector map tiles over HTTPS with automatic certificates
//!
//! `dev` mode serves plain HTTP. `letsencrypt` mode keeps an HTTP redirect
//! listener up for the life of the process and hands the secure port to the
//! certificate lifecycle manager.

use anyhow::{bail, Context, Result};
use axum::Router;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tileserver_api::{app_router, PostgisTileSource};
use tileserver_cert::{
    AcmeChallengeSolver, AcmeConfig, CertificateStore, ChallengeManager, ExternalAccountBinding,
    LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING,
};
use tileserver_lifecycle::{CertificateLifecycleManager, LifecycleConfig, LifecycleController};
use tileserver_server_http::{RedirectConfig, RedirectListener};
use tileserver_server_https::{SecureServer, ServerSupervisor};

const ENV_FILES: [&str; 3] = [".env", ".env.development", ".env.development.local"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServingMode {
    /// Plain HTTP, no certificates
    Dev,
    /// HTTPS with certificates from an ACME CA
    Letsencrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

/// Vector tile server
#[derive(Parser, Debug)]
#[command(name = "tileserver")]
#[command(about = "Serve vector map tiles from PostGIS over HTTPS", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// How to serve the router
    #[arg(long, env = "TILESERVER_SERVING_MODE", value_enum, default_value_t = ServingMode::Dev)]
    serving_mode: ServingMode,

    /// Postgres connection string for the tile database
    #[arg(long, env = "TILESERVER_DB_CONNECTION_STRING")]
    db_url: String,

    #[arg(long, env = "TILESERVER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Listen address in dev mode
    #[arg(long, env = "TILESERVER_DEV_ADDR", default_value = "0.0.0.0:8082")]
    dev_addr: SocketAddr,

    /// Plain HTTP listener (ACME challenges and redirects)
    #[arg(long, env = "TILESERVER_HTTP_ADDR", default_value = "0.0.0.0:8082")]
    http_addr: SocketAddr,

    /// TLS listener
    #[arg(long, env = "TILESERVER_HTTPS_ADDR", default_value = "0.0.0.0:8443")]
    https_addr: SocketAddr,

    /// HTTPS port clients are redirected to, if it differs from the listener's
    #[arg(long, env = "TILESERVER_PUBLIC_HTTPS_PORT")]
    public_https_port: Option<u16>,

    /// Domain to obtain a certificate for (repeatable or comma separated)
    #[arg(long = "domain", env = "TILESERVER_DOMAINS", value_delimiter = ',')]
    domains: Vec<String>,

    /// Contact email for the ACME account
    #[arg(long, env = "TILESERVER_ACME_EMAIL")]
    acme_email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production)
    #[arg(long, env = "TILESERVER_ACME_DIRECTORY")]
    acme_directory: Option<String>,

    /// Use the Let's Encrypt staging directory
    #[arg(long, env = "TILESERVER_ACME_STAGING")]
    acme_staging: bool,

    /// External account binding key id
    #[arg(long, env = "TILESERVER_EAB_KID")]
    eab_kid: Option<String>,

    /// External account binding HMAC key (base64url)
    #[arg(long, env = "TILESERVER_EAB_HMAC_KEY")]
    eab_hmac_key: Option<String>,

    /// Certificate and account cache
    #[arg(long, env = "TILESERVER_CACHE_DIR", default_value = "./letsencrypt")]
    cache_dir: PathBuf,

    /// Renew this many days before expiry
    #[arg(
        long,
        env = "TILESERVER_RENEW_BEFORE_DAYS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..=365)
    )]
    renew_before_days: u64,

    /// Delay before retrying a failed renewal
    #[arg(long, env = "TILESERVER_RETRY_INTERVAL_SECS", default_value_t = 3600)]
    retry_interval_secs: u64,

    /// Upper bound for one ACME order
    #[arg(long, env = "TILESERVER_CHALLENGE_TIMEOUT_SECS", default_value_t = 120)]
    challenge_timeout_secs: u64,

    /// How long a secure generation may drain before it is aborted
    #[arg(long, env = "TILESERVER_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,
}

impl Cli {
    fn directory_url(&self) -> String {
        match (&self.acme_directory, self.acme_staging) {
            (Some(url), staging) => {
                if staging {
                    warn!("Both an ACME directory and staging were requested; using {}", url);
                }
                url.clone()
            }
            (None, true) => LETS_ENCRYPT_STAGING.to_string(),
            (None, false) => LETS_ENCRYPT_PRODUCTION.to_string(),
        }
    }

    fn external_account(&self) -> Result<Option<ExternalAccountBinding>> {
        match (&self.eab_kid, &self.eab_hmac_key) {
            (Some(key_id), Some(hmac_key)) => Ok(Some(ExternalAccountBinding {
                key_id: key_id.clone(),
                hmac_key: hmac_key.clone(),
            })),
            (None, None) => Ok(None),
            _ => bail!("--eab-kid and --eab-hmac-key must be given together"),
        }
    }

    fn acme_config(&self) -> Result<AcmeConfig> {
        if self.domains.is_empty() {
            bail!("letsencrypt mode needs at least one --domain");
        }
        let contact_email = match &self.acme_email {
            Some(email) if !email.trim().is_empty() => email.trim().to_string(),
            _ => bail!("letsencrypt mode needs --acme-email"),
        };

        Ok(AcmeConfig {
            domains: self.domains.clone(),
            contact_email,
            directory_url: self.directory_url(),
            external_account: self.external_account()?,
            root_ca: None,
            challenge_timeout: Duration::from_secs(self.challenge_timeout_secs),
        })
    }

    fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            https_addr: self.https_addr,
            domains: self.domains.clone(),
            lead_time: Duration::from_secs(self.renew_before_days * 24 * 60 * 60),
            retry_interval: Duration::from_secs(self.retry_interval_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_files()?;
    let cli = Cli::parse();
    init_logging(cli.log_format, &cli.log_level)?;

    info!(
        version = env!("GIT_TAG"),
        commit = env!("GIT_HASH"),
        built = env!("BUILD_TIME"),
        "Starting tileserver"
    );

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("A rustls crypto provider was already installed");
    }

    let db = sea_orm::Database::connect(cli.db_url.as_str())
        .await
        .context("Unable to connect to the tile database")?;
    let router = app_router(Arc::new(PostgisTileSource::new(db)));

    match cli.serving_mode {
        ServingMode::Dev => serve_dev(cli.dev_addr, router).await,
        ServingMode::Letsencrypt => serve_letsencrypt(&cli, router).await,
    }
}

/// Missing files are fine; unreadable ones are not
fn load_env_files() -> Result<()> {
    for file in ENV_FILES {
        match dotenvy::from_filename(file) {
            Ok(_) => {}
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e).with_context(|| format!("Unable to load {}", file)),
        }
    }
    Ok(())
}

fn init_logging(format: LogFormat, log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }

    Ok(())
}

async fn serve_dev(addr: SocketAddr, router: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Unable to bind dev server on {}", addr))?;
    info!("Starting dev mode server on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = wait_for_shutdown().await {
                error!("Error listening for shutdown signal: {}", e);
            }
        })
        .await
        .context("Error in HTTP server")?;

    info!("Shutdown gracefully");
    Ok(())
}

async fn serve_letsencrypt(cli: &Cli, router: Router) -> Result<()> {
    let acme = cli.acme_config()?;
    let challenges = ChallengeManager::new();
    let store = Arc::new(
        CertificateStore::open(&cli.cache_dir)
            .with_context(|| format!("Unable to open cache dir {}", cli.cache_dir.display()))?,
    );

    // The insecure port must be ours before any challenge can be answered
    let https_port = cli.public_https_port.unwrap_or(cli.https_addr.port());
    let redirect = RedirectListener::bind(
        RedirectConfig {
            bind_addr: cli.http_addr,
            https_port,
        },
        challenges.clone(),
    )
    .await
    .context("Unable to start the HTTP listener")?;

    let solver = Arc::new(AcmeChallengeSolver::new(acme, store.clone(), challenges)?);
    let server = SecureServer::new(router)
        .with_drain_timeout(Duration::from_secs(cli.shutdown_grace_secs));
    let supervisor = ServerSupervisor::new(Arc::new(server));
    let manager =
        CertificateLifecycleManager::new(cli.lifecycle_config(), store, solver, supervisor)?;
    let controller = manager.controller();

    let redirect_shutdown = CancellationToken::new();
    let redirect_task = {
        let token = redirect_shutdown.clone();
        let controller = controller.clone();
        tokio::spawn(async move {
            let result = redirect.serve(token).await;
            if let Err(e) = &result {
                error!("HTTP listener failed: {}", e);
                controller.shutdown();
            }
            result
        })
    };
    let signal_task = tokio::spawn(forward_signals(controller));

    info!("Will serve at: https://{}", cli.domains[0]);
    let result = manager.run().await;

    redirect_shutdown.cancel();
    signal_task.abort();

    match redirect_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e).context("HTTP listener failed"),
        Err(e) => warn!("HTTP listener task ended abnormally: {}", e),
    }

    let report = result.context("Certificate lifecycle failed")?;
    info!(
        renewals = report.renewals,
        generations = report.generations,
        "Server exited properly"
    );
    Ok(())
}

/// SIGINT/SIGTERM stop the manager; SIGHUP forces a renewal
#[cfg(unix)]
async fn forward_signals(controller: LifecycleController) {
    use tokio::signal::unix::{signal, SignalKind};

    let signals = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::hangup()),
    );
    let (mut sigterm, mut sigint, mut sighup) = match signals {
        (Ok(term), Ok(int), Ok(hup)) => (term, int, hup),
        _ => {
            error!("Unable to register signal handlers, shutting down");
            controller.shutdown();
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, forcing certificate renewal");
                if !controller.force_renewal() {
                    debug!("A forced renewal is already pending");
                }
            }
        }
    }

    controller.shutdown();
}

#[cfg(not(unix))]
async fn forward_signals(controller: LifecycleController) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Error listening for shutdown signal: {}", e);
    }
    controller.shutdown();
}

#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
