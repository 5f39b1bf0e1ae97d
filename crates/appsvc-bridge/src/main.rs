//! appsvc-bridge: entry point.
//!
//! Connects to an app-service host over TCP, answers every inbound call with
//! an echo of its input, and logs every completed return.  Runs until Ctrl+C
//! or until the host closes the channel.
//!
//! # Usage
//!
//! ```text
//! appsvc-bridge [OPTIONS]
//!
//! Options:
//!   --config          <PATH>  TOML config file
//!   --service-addr    <ADDR>  App-service host address [default: 127.0.0.1:24900]
//!   --service-name    <NAME>  App-service name [default: com.example.appsvc]
//!   --package-family  <NAME>  Providing package family name
//!   --connect-timeout <SECS>  Connect timeout in seconds [default: 10]
//!   --log-level       <LEVEL> Log filter used when RUST_LOG is unset [default: info]
//! ```
//!
//! # Precedence
//!
//! Built-in defaults, then the config file, then flags.  Every flag can also
//! be given as an environment variable:
//!
//! | Variable                 | Flag                |
//! |--------------------------|---------------------|
//! | `APPSVC_CONFIG`          | `--config`          |
//! | `APPSVC_SERVICE_ADDR`    | `--service-addr`    |
//! | `APPSVC_SERVICE_NAME`    | `--service-name`    |
//! | `APPSVC_PACKAGE_FAMILY`  | `--package-family`  |
//! | `APPSVC_CONNECT_TIMEOUT` | `--connect-timeout` |
//! | `APPSVC_LOG_LEVEL`       | `--log-level`       |

use std::ffi::{CStr, CString};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use appsvc_bridge::domain::{BridgeConfig, ConfigFile};
use appsvc_bridge::infrastructure::TcpTransport;
use appsvc_bridge::Bridge;
use appsvc_core::{CallEnvelope, ConnectionState};

/// How often the main task checks whether the channel has closed.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(200);

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Bridge between an app-service channel and a native call target.
#[derive(Debug, Parser)]
#[command(name = "appsvc-bridge", version)]
struct Cli {
    /// TOML config file.  Flags override values read from it.
    #[arg(long, env = "APPSVC_CONFIG")]
    config: Option<PathBuf>,

    /// Address of the app-service host.
    #[arg(long, env = "APPSVC_SERVICE_ADDR")]
    service_addr: Option<SocketAddr>,

    /// Name of the app service to open.
    #[arg(long, env = "APPSVC_SERVICE_NAME")]
    service_name: Option<String>,

    /// Package family name that provides the service.
    #[arg(long, env = "APPSVC_PACKAGE_FAMILY")]
    package_family: Option<String>,

    /// Connect timeout in seconds.
    #[arg(long, env = "APPSVC_CONNECT_TIMEOUT")]
    connect_timeout: Option<u64>,

    /// `tracing` filter used when `RUST_LOG` is unset.
    #[arg(long, env = "APPSVC_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Layers the config file and flags over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed, or if
    /// the result fails validation.
    fn into_bridge_config(self) -> anyhow::Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => ConfigFile::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
                .into_bridge_config()
                .with_context(|| format!("invalid config in {}", path.display()))?,
            None => BridgeConfig::default(),
        };

        if let Some(addr) = self.service_addr {
            config.service_addr = addr;
        }
        if let Some(name) = self.service_name {
            config.service_name = name;
        }
        if let Some(family) = self.package_family {
            config.package_family_name = family;
        }
        if let Some(secs) = self.connect_timeout {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

// ── Native handlers ───────────────────────────────────────────────────────────

/// Acknowledges a call with its own input.  Malformed calls get an empty
/// acknowledgment.
fn echo_call(call: &CStr) -> CString {
    let input = call
        .to_str()
        .ok()
        .and_then(|text| CallEnvelope::decode(text).ok())
        .map(|call| call.input);
    match input {
        Some(input) => CString::new(input).unwrap_or_default(),
        None => {
            warn!("echo handler received a malformed call");
            CString::default()
        }
    }
}

fn log_return(request_id: &CStr, result: &CStr, error: &CStr) {
    if error.to_bytes().is_empty() {
        info!(
            "return {}: {}",
            request_id.to_string_lossy(),
            result.to_string_lossy()
        );
    } else {
        warn!(
            "return {} failed: {}",
            request_id.to_string_lossy(),
            error.to_string_lossy()
        );
    }
}

async fn wait_for_close(bridge: &Bridge) {
    while bridge.state() != ConnectionState::Closed {
        tokio::time::sleep(CLOSE_POLL_INTERVAL).await;
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.into_bridge_config()?;

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        "appsvc-bridge starting: service '{}' in '{}' at {}",
        config.service_name, config.package_family_name, config.service_addr
    );

    let transport = Arc::new(TcpTransport::new(config.service_addr));
    let bridge = Bridge::new(config, transport);
    bridge.set_call_callback(echo_call);
    bridge.set_return_callback(log_return);
    bridge
        .initialize()
        .context("failed to initialize the bridge")?;

    let connection = bridge
        .connect()
        .await
        .context("failed to connect to the app service")?;
    info!("bridge ready on connection {connection}");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("received Ctrl+C, shutting down"),
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        },
        () = wait_for_close(&bridge) => info!("app-service channel closed"),
    }

    info!("appsvc-bridge stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
