use anyhow::{Context, Result};
use beach_jetty::{
    bootstrap::{Bootstrap, BootstrapOptions},
    cli::{Cli, Command},
    config::{ControlPlaneConfig, EdgeConfig},
    server, telemetry,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Bootstrap output goes to stdout untouched by logging.
    if let Command::Bootstrap(args) = &cli.command {
        let bootstrap = Bootstrap::new(&BootstrapOptions::from(args));
        println!("{}", bootstrap.to_json().context("failed to render bootstrap")?);
        return Ok(());
    }

    let telemetry = telemetry::Telemetry::init()?;
    let metrics = Some(telemetry.metrics_handle());
    let cancel = server::shutdown_token();

    match cli.command {
        Command::ControlPlane {
            shared,
            control_plane,
        } => {
            let config = ControlPlaneConfig::try_from((&shared, &control_plane))
                .context("invalid control plane configuration")?;
            info!(
                listen_addr = %config.listen_addr,
                registry = ?config.registry,
                domain = %config.generator.domain,
                "starting beach-jetty control plane"
            );
            let registry = server::build_registry(&config.registry).await?;
            server::run_control_plane(config, registry, metrics, cancel).await
        }
        Command::Edge { shared, edge } => {
            let config = EdgeConfig::try_from((&shared, &edge))
                .context("invalid edge configuration")?;
            info!(
                listen_addr = %config.listen_addr,
                registry = ?config.registry,
                domain = %config.domain,
                "starting beach-jetty edge"
            );
            let registry = server::build_registry(&config.registry).await?;
            server::run_edge(config, registry, metrics, cancel).await
        }
        Command::All {
            shared,
            control_plane,
            edge,
        } => {
            let control_plane = ControlPlaneConfig::try_from((&shared, &control_plane))
                .context("invalid control plane configuration")?;
            let edge = EdgeConfig::try_from((&shared, &edge))
                .context("invalid edge configuration")?;
            info!(
                control_plane_addr = %control_plane.listen_addr,
                edge_addr = %edge.listen_addr,
                "starting beach-jetty control plane and edge"
            );
            server::run_all(control_plane, edge, metrics, cancel).await
        }
        Command::Bootstrap(_) => Ok(()),
    }
}
