//! # clinic-gateway
//!
//! Gateway binary: loads settings, initializes logging and metrics, wires
//! the server and serves until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use clinic_core::logging::init_subscriber;
use clinic_server::Gateway;
use clinic_server::metrics::install_recorder;
use clinic_server::shutdown::DEFAULT_SHUTDOWN_TIMEOUT;
use clinic_settings::{GatewaySettings, config_path_from_env, load_settings};

/// Clinic assistant WebSocket gateway.
#[derive(Parser, Debug)]
#[command(name = "clinic-gateway", about = "Clinic assistant WebSocket gateway")]
struct Cli {
    /// JSON settings file (falls back to `CLINIC_CONFIG`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,
}

impl Cli {
    fn settings(&self) -> Result<GatewaySettings> {
        let path = self.config.clone().or_else(config_path_from_env);
        let mut settings = load_settings(path.as_deref()).context("Failed to load settings")?;
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.settings()?;
    init_subscriber(&settings.logging.level, settings.logging.format);

    let prometheus = install_recorder().context("Failed to install metrics recorder")?;
    let gateway = Gateway::new(settings.clone())
        .context("Failed to build agent backend client")?
        .with_prometheus(prometheus);

    let report = gateway.health().check().await;
    if report.backend.reachable == Some(true) {
        tracing::info!(endpoint = %settings.agent.endpoint, "agent service reachable");
    } else {
        tracing::warn!(
            endpoint = %settings.agent.endpoint,
            "agent service not reachable at startup, queries will fail until it is"
        );
    }

    let server = gateway.serve().await.context("Failed to bind server")?;
    tracing::info!(
        addr = %server.local_addr(),
        max_connections = settings.server.max_connections,
        "clinic gateway listening on ws://{}/ws",
        server.local_addr()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .shutdown(DEFAULT_SHUTDOWN_TIMEOUT)
        .await
        .context("HTTP server failed during shutdown")?;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinic_settings::ExposeSecret;

    #[test]
    fn overrides_apply_on_top_of_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clinic.json");
        std::fs::write(
            &path,
            r#"{"auth": {"jwt_secret": "file-secret"}, "server": {"port": 9000}}"#,
        )
        .unwrap();

        let cli = Cli::parse_from([
            "clinic-gateway",
            "--config",
            path.to_str().unwrap(),
            "--host",
            "127.0.0.1",
            "--port",
            "0",
        ]);
        let settings = cli.settings().unwrap();
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.auth.jwt_secret.expose_secret(), "file-secret");
    }

    #[test]
    fn no_flags_keeps_settings() {
        let cli = Cli::parse_from(["clinic-gateway"]);
        assert!(cli.config.is_none());
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
    }
}
