//! `vend-bridge` command-line entry point.
//!
//! Loads the configuration, installs logging, opens the Bluetooth adapter and
//! runs one subcommand.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()            -- TOML file, then CLI/env overrides
//!  └─ BleTransport::new()      -- first Bluetooth adapter (not for remote-credit)
//!  └─ subcommand
//!       ├─ scan           -> list nearby machines
//!       ├─ vend           -> VendSession::open() + run(), Ctrl-C cancels
//!       ├─ register       -> ProvisioningWriter::register()
//!       ├─ wifi           -> ProvisioningWriter::configure_wifi()
//!       ├─ enroll         -> EnrollDevice::enroll()
//!       └─ remote-credit  -> CreditRelayClient::send_remote_credit()
//! ```
//!
//! Tokens are taken from `--access-token` / `--refresh-token` or the
//! `VEND_ACCESS_TOKEN` / `VEND_REFRESH_TOKEN` environment variables.  With
//! only a refresh token the first backend call refreshes the credential.
//! Without any token, `--email` / `--login-password` sign in first.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vend_bridge::application::auth::{AuthTokenManager, TokenPair};
use vend_bridge::application::credit_relay::{CreditRelayClient, GeoLocation};
use vend_bridge::application::enroll::{find_unprovisioned, EnrollDevice};
use vend_bridge::application::provisioning::ProvisioningWriter;
use vend_bridge::application::session::{
    SessionConfig, SessionRegistry, SessionUpdate, VendSession,
};
use vend_bridge::application::transport::Transport;
use vend_bridge::infrastructure::backend::HttpBackend;
use vend_bridge::infrastructure::storage::config::{config_file_path, load_config, AppConfig};
use vend_bridge::infrastructure::transport::ble::BleTransport;
use vend_core::domain::device::{first_unprovisioned, nearby_machines};
use vend_core::{SessionOutcome, SiteId, VendProgress};

#[derive(Debug, Parser)]
#[command(name = "vend-bridge", version, about)]
struct Cli {
    /// Configuration file (defaults to the platform config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `backend.base_url`.
    #[arg(long, env = "VEND_BACKEND_URL", global = true)]
    backend_url: Option<String>,

    #[arg(long, env = "VEND_ACCESS_TOKEN", hide_env_values = true, global = true)]
    access_token: Option<String>,

    #[arg(long, env = "VEND_REFRESH_TOKEN", hide_env_values = true, global = true)]
    refresh_token: Option<String>,

    /// Account email; used to sign in when no token is given.
    #[arg(long, env = "VEND_EMAIL", global = true)]
    email: Option<String>,

    #[arg(long, env = "VEND_PASSWORD", hide_env_values = true, global = true)]
    login_password: Option<String>,

    /// Latitude reported with vend requests (needs `--lng`).
    #[arg(long, global = true, allow_negative_numbers = true)]
    lat: Option<f64>,

    /// Longitude reported with vend requests (needs `--lat`).
    #[arg(long, global = true, allow_negative_numbers = true)]
    lng: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List registered machines in range.
    Scan {
        /// Scan duration in milliseconds (defaults to `ble.discovery_timeout_ms`).
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Run one vending session against a machine.
    Vend {
        #[arg(long)]
        site: u32,
    },
    /// Write a site identifier and passkey to an unprovisioned controller.
    Register {
        #[arg(long)]
        site: u32,
        #[arg(long)]
        passkey: String,
        /// Controller address; defaults to the first unprovisioned one found.
        #[arg(long)]
        peer: Option<String>,
    },
    /// Give a registered controller its Wi-Fi credentials.
    Wifi {
        #[arg(long)]
        site: u32,
        #[arg(long)]
        ssid: String,
        #[arg(long)]
        password: String,
    },
    /// Create a backend record for an unprovisioned controller and register it.
    Enroll {
        #[arg(long)]
        peer: Option<String>,
    },
    /// Credit a machine through the backend, without Bluetooth.
    RemoteCredit {
        #[arg(long)]
        site: u32,
        /// Amount in cents.
        #[arg(long)]
        amount: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config_file_path().context("locating config file")?,
    };
    let mut config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(url) = &cli.backend_url {
        config.backend.base_url = url.clone();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.bridge.log_level)),
        )
        .init();

    info!(config = %config_path.display(), "vend-bridge starting");

    run(cli, config).await
}

async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<()> {
    let backend =
        Arc::new(HttpBackend::new(config.backend.clone()).context("building HTTP client")?);
    let ble = &config.ble;

    match &cli.command {
        Command::RemoteCredit { site, amount } => {
            let relay = CreditRelayClient::new(backend.clone(), auth_manager(&cli, backend).await?);
            relay
                .send_remote_credit(SiteId(*site), *amount)
                .await
                .context("remote credit failed")?;
            println!("credited {amount} cents to site {site}");
        }

        Command::Scan { timeout_ms } => {
            let timeout = timeout_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or_else(|| ble.discovery_timeout());
            let transport = open_transport(&config).await?;
            let peers = transport.scan(timeout).await?;
            let waiting = first_unprovisioned(peers.iter().cloned(), &ble.alias_suffix);
            for machine in nearby_machines(peers, &ble.alias_suffix) {
                println!("{:>8}  {}", machine.site_id, machine.device.address);
            }
            if let Some(device) = waiting {
                println!("unprovisioned controller at {}", device.address);
            }
        }

        Command::Vend { site } => {
            let relay = Arc::new(CreditRelayClient::new(
                backend.clone(),
                auth_manager(&cli, backend).await?,
            ));
            let location = match (cli.lat, cli.lng) {
                (Some(lat), Some(lng)) => Some(GeoLocation { lat, lng }),
                (None, None) => None,
                _ => bail!("--lat and --lng must be given together"),
            };
            let site_id = SiteId(*site);
            let transport = open_transport(&config).await?;
            let device = transport
                .discover(&site_id.advertised_name(&ble.alias_suffix), ble.discovery_timeout())
                .await?;

            let registry = SessionRegistry::new();
            let session_config = SessionConfig {
                site_id,
                location,
                write_policy: ble.write_policy(),
            };
            let (session, handle, mut updates) =
                VendSession::open(&transport, &registry, &device, relay, session_config).await?;

            // ── Ctrl-C handler ────────────────────────────────────────────────
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("cancel requested");
                    handle.cancel();
                }
            });

            let running = tokio::spawn(session.run());
            while let Some(update) = updates.recv().await {
                match update {
                    SessionUpdate::State(state) => info!(?state, "session state"),
                    SessionUpdate::Vend(VendProgress::Succeeded(details)) => {
                        println!("vended item {} for {} cents", details.item_number, details.price)
                    }
                    SessionUpdate::Vend(VendProgress::Failed(details)) => {
                        println!("vend of item {} failed", details.item_number)
                    }
                    SessionUpdate::Finished(_) => {}
                }
            }

            match running.await.context("session task panicked")? {
                SessionOutcome::Completed => println!("session complete"),
                SessionOutcome::Cancelled => warn!("session cancelled"),
                SessionOutcome::Failed(reason) => bail!("session failed: {reason}"),
            }
        }

        Command::Register {
            site,
            passkey,
            peer,
        } => {
            let transport = open_transport(&config).await?;
            let device = find_unprovisioned(
                &transport,
                &ble.alias_suffix,
                ble.discovery_timeout(),
                peer.as_deref(),
            )
            .await?;
            let writer = ProvisioningWriter::new(transport.connect(&device).await?, ble.write_policy());
            let result = writer.register(&SiteId(*site).site_alias(), passkey).await;
            if let Err(e) = writer.disconnect().await {
                warn!(error = %e, "disconnect failed");
            }
            result?;
            println!("{} registered as site {site}", device.address);
        }

        Command::Wifi {
            site,
            ssid,
            password,
        } => {
            let name = SiteId(*site).advertised_name(&ble.alias_suffix);
            let transport = open_transport(&config).await?;
            let device = transport.discover(&name, ble.discovery_timeout()).await?;
            let writer = ProvisioningWriter::new(transport.connect(&device).await?, ble.write_policy());
            let result = writer.configure_wifi(ssid, password).await;
            if let Err(e) = writer.disconnect().await {
                warn!(error = %e, "disconnect failed");
            }
            result?;
            println!("wifi credentials written to site {site}");
        }

        Command::Enroll { peer } => {
            let transport = open_transport(&config).await?;
            let device = find_unprovisioned(
                &transport,
                &ble.alias_suffix,
                ble.discovery_timeout(),
                peer.as_deref(),
            )
            .await?;
            let enroll = EnrollDevice::new(
                backend.clone(),
                auth_manager(&cli, backend).await?,
                ble.write_policy(),
                ble.alias_suffix.clone(),
            );
            let site_id = enroll.enroll(&transport, &device).await?;
            println!("{} enrolled as site {site_id}", device.address);
        }
    }

    Ok(())
}

async fn open_transport(config: &AppConfig) -> anyhow::Result<BleTransport> {
    BleTransport::new(config.ble.service_uuid, config.ble.characteristic_uuid)
        .await
        .context("opening Bluetooth adapter")
}

/// Builds the credential owner from the token flags, signing in if needed.
async fn auth_manager(cli: &Cli, backend: Arc<HttpBackend>) -> anyhow::Result<AuthTokenManager> {
    match (&cli.access_token, &cli.refresh_token) {
        (Some(access), Some(refresh)) => Ok(AuthTokenManager::new(
            TokenPair {
                access_token: access.clone(),
                refresh_token: refresh.clone(),
            },
            backend,
        )),
        (None, Some(refresh)) => Ok(AuthTokenManager::from_refresh_token(refresh.clone(), backend)),
        (_, None) => match (&cli.email, &cli.login_password) {
            (Some(email), Some(password)) => {
                AuthTokenManager::sign_in(&*backend, email, password, backend.clone())
                    .await
                    .context("signing in")
            }
            _ => bail!(
                "a refresh token (--refresh-token) or account credentials \
                 (--email and --login-password) are required"
            ),
        },
    }
}
