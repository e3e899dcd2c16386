use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use guard_device::collect::{DeviceInfoProvider, FallbackLocator, FUSED_TIMEOUT, NATIVE_TIMEOUT};
use guard_device::events::{ChannelLogSink, FanoutLogSink, LogSink, TracingLogSink};
use guard_device::net::{normalize_base_url, ReqwestTransport};
use guard_device::simulate::{HostDeviceInfo, SimulatedDeviceState, SimulatedLocationSource};
use guard_device::{ApiClient, Config, CredentialStore, EnrollOutcome, Tracker};

#[derive(Parser, Debug)]
#[command(name = "guard-device", version, about = "Anti-loss tracking client")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Save the server address and/or admin key.
    Configure {
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        admin_key: Option<String>,
        /// Also write the effective settings to the config file.
        #[arg(long)]
        write_config: bool,
    },
    /// Print the device identity and saved settings.
    Status,
    /// Log in, registering the device first if needed.
    Enroll {
        #[arg(long)]
        admin_key: Option<String>,
    },
    /// Register the device with the server.
    Register {
        #[arg(long)]
        admin_key: Option<String>,
    },
    /// Log in and store a fresh token.
    Login,
    /// Start the periodic tracking loop (default).
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    let fmt_layer = if config.log_json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .init();

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let store = Arc::new(CredentialStore::open(&config.db_path())?);
    store.seed_server_base_url(&config.backend_url)?;
    if let Some(key) = config.admin_key.as_deref().filter(|key| !key.trim().is_empty()) {
        if store.admin_key().is_empty() {
            store.set_admin_key(key)?;
        }
    }
    let identity = store.ensure_initialized(&config.resolve_platform_id())?;
    info!(device_id = %identity.device_id, "Device identity ready");

    let transport = ReqwestTransport::new(config.request_timeout())?;
    let api = Arc::new(ApiClient::new(store.clone(), identity, transport));
    let device_info = HostDeviceInfo::new(config.device_model.clone());

    match cli.command.unwrap_or(Command::Run) {
        Command::Configure { server, admin_key, write_config } => {
            let mut config = config.clone();
            if let Some(server) = server {
                let normalized = normalize_base_url(&server)?;
                store.set_server_base_url(&normalized)?;
                println!("Server address saved: {normalized}");
                config.backend_url = normalized;
            }
            if let Some(key) = admin_key {
                store.set_admin_key(key.trim())?;
                println!("Admin key saved");
                config.admin_key = Some(key.trim().to_string());
            }
            if write_config {
                config.save_to_file()?;
                println!("Config file written");
            }
        }
        Command::Status => {
            let identity = api.identity();
            println!("Device id:  {}", identity.device_id);
            println!("Server:     {}", store.server_base_url());
            println!("Admin key:  {}", if store.admin_key().is_empty() { "not set" } else { "set" });
            println!("Token:      {}", if store.token().is_empty() { "none" } else { "present" });
        }
        Command::Enroll { admin_key } => {
            let admin_key = admin_key.unwrap_or_else(|| store.admin_key());
            match api.enroll(&admin_key, &device_info.device_info()).await {
                Ok(EnrollOutcome::LoggedIn) => println!("Logged in"),
                Ok(EnrollOutcome::Registered) => println!("Registered and logged in"),
                Err(e) => bail!("Enrollment failed: {e}"),
            }
        }
        Command::Register { admin_key } => {
            let admin_key = admin_key.unwrap_or_else(|| store.admin_key());
            if let Err(e) = api.register_device(&admin_key, &device_info.device_info()).await {
                bail!("Registration failed: {e}");
            }
            println!("Registered");
        }
        Command::Login => {
            if let Err(e) = api.login().await {
                bail!("Login failed: {e}");
            }
            println!("Logged in");
        }
        Command::Run => run(&config, api).await?,
    }

    Ok(())
}

async fn run(config: &Config, api: Arc<ApiClient>) -> Result<()> {
    let (channel_sink, mut events) = ChannelLogSink::new();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", event.display_line());
        }
    });
    let sink: Arc<dyn LogSink> = Arc::new(
        FanoutLogSink::new()
            .with(Arc::new(TracingLogSink))
            .with(Arc::new(channel_sink)),
    );

    let mut locator = FallbackLocator::new();
    match config.sim_origin() {
        Some(origin) => {
            locator = locator
                .with_source(Box::new(SimulatedLocationSource::new("fused", origin, 8.0, FUSED_TIMEOUT)))
                .with_source(Box::new(SimulatedLocationSource::new("gps", origin, 15.0, NATIVE_TIMEOUT)))
                .with_source(Box::new(SimulatedLocationSource::new("network", origin, 60.0, NATIVE_TIMEOUT)));
        }
        None => warn!("No simulated origin configured; location reports are disabled"),
    }

    let tracker = Tracker::new(
        api,
        Arc::new(SimulatedDeviceState::new(config.network_type.clone())),
        locator,
        sink,
    )
    .with_interval(config.heartbeat_interval())
    .with_cycle_timeout(config.cycle_timeout());

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
            }
            cancel.cancel();
        })
    };

    tracker.run(cancel).await;
    ctrl_c.abort();
    drop(tracker);
    let _ = printer.await;
    Ok(())
}
