use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::generator::DEFAULT_ROUTE_CONFIG_NAME;

#[derive(Debug, Parser)]
#[command(
    name = "beach-jetty",
    author,
    version,
    about = "Routing control plane and edge service for sandbox public ports"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the aggregated discovery stream to proxies.
    ControlPlane {
        #[command(flatten)]
        shared: SharedArgs,
        #[command(flatten)]
        control_plane: ControlPlaneArgs,
    },
    /// Serve health responses and proxy WebSocket upgrades.
    Edge {
        #[command(flatten)]
        shared: SharedArgs,
        #[command(flatten)]
        edge: EdgeArgs,
    },
    /// Run the control plane and the edge in one process.
    All {
        #[command(flatten)]
        shared: SharedArgs,
        #[command(flatten)]
        control_plane: ControlPlaneArgs,
        #[command(flatten)]
        edge: EdgeArgs,
    },
    /// Print the bootstrap configuration for a proxy node.
    Bootstrap(BootstrapArgs),
}

#[derive(Debug, Clone, Args)]
pub struct SharedArgs {
    /// Redis URL of the sandbox registry.
    #[arg(long, env = "JETTY_REDIS_URL")]
    pub redis_url: Option<String>,

    /// JSON file of sandbox records, for development without Redis.
    #[arg(long = "seed", env = "JETTY_SEED_FILE", conflicts_with = "redis_url")]
    pub seed_file: Option<PathBuf>,

    /// Base domain of public sandbox URLs.
    #[arg(long, env = "JETTY_DOMAIN", default_value = "sbx.beach.sh")]
    pub domain: String,

    /// Interval of the full registry resync.
    #[arg(long, env = "JETTY_RESYNC_SECS", default_value_t = 30)]
    pub resync_secs: u64,

    /// Time allowed for open streams to finish after a shutdown signal.
    #[arg(long, env = "JETTY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Args)]
pub struct ControlPlaneArgs {
    /// Address of the gRPC aggregated discovery listener.
    #[arg(long, env = "JETTY_CONTROL_PLANE_ADDR", default_value = "0.0.0.0:18000")]
    pub control_plane_addr: String,

    /// Address of the health, metrics and debug endpoints and the WebSocket
    /// discovery transport.
    #[arg(long, env = "JETTY_CONTROL_PLANE_HTTP_ADDR", default_value = "0.0.0.0:18001")]
    pub control_plane_http_addr: String,

    #[arg(long, env = "JETTY_ROUTE_CONFIG_NAME", default_value = DEFAULT_ROUTE_CONFIG_NAME)]
    pub route_config_name: String,

    /// Edge service `host:port` as reached from the proxies. Upgrades and
    /// hosts without a direct route are sent there.
    #[arg(long, env = "JETTY_EDGE_UPSTREAM", default_value = "127.0.0.1:8080")]
    pub edge_upstream: String,

    /// Window in which registry changes are merged into one regeneration.
    #[arg(long, env = "JETTY_COALESCE_MS", default_value_t = 250)]
    pub coalesce_ms: u64,

    #[arg(long, env = "JETTY_DISCOVERY_WRITE_TIMEOUT_SECS", default_value_t = 10)]
    pub discovery_write_timeout_secs: u64,

    #[arg(long, env = "JETTY_NACK_BACKOFF_BASE_SECS", default_value_t = 1)]
    pub nack_backoff_base_secs: u64,

    #[arg(long, env = "JETTY_NACK_BACKOFF_MAX_SECS", default_value_t = 60)]
    pub nack_backoff_max_secs: u64,

    /// Consecutive rejections of one resource type before alerting.
    #[arg(long, env = "JETTY_NACK_ALERT_THRESHOLD", default_value_t = 3)]
    pub nack_alert_threshold: u32,
}

#[derive(Debug, Clone, Args)]
pub struct EdgeArgs {
    /// Address receiving sandbox traffic.
    #[arg(long, env = "JETTY_EDGE_ADDR", default_value = "0.0.0.0:8080")]
    pub edge_addr: String,

    /// Address of the health, metrics and debug endpoints.
    #[arg(long, env = "JETTY_ADMIN_ADDR", default_value = "0.0.0.0:9090")]
    pub admin_addr: String,

    /// Orchestrator base URL for wake requests. Wakes are skipped when unset.
    #[arg(long, env = "JETTY_WAKE_URL")]
    pub wake_url: Option<String>,

    #[arg(long, env = "JETTY_WAKE_TIMEOUT_SECS", default_value_t = 3)]
    pub wake_timeout_secs: u64,

    #[arg(long, env = "JETTY_WAKE_DEDUP_SECS", default_value_t = 30)]
    pub wake_dedup_secs: u64,

    #[arg(long, env = "JETTY_HIBERNATING_RETRY_AFTER", default_value_t = 10)]
    pub hibernating_retry_after: u64,

    #[arg(long, env = "JETTY_STARTING_RETRY_AFTER", default_value_t = 3)]
    pub starting_retry_after: u64,

    #[arg(long, env = "JETTY_ERROR_RETRY_AFTER", default_value_t = 30)]
    pub error_retry_after: u64,

    #[arg(long, env = "JETTY_DEFAULT_RETRY_AFTER", default_value_t = 5)]
    pub default_retry_after: u64,

    #[arg(long, env = "JETTY_UPSTREAM_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub upstream_connect_timeout_secs: u64,

    #[arg(long, env = "JETTY_KEEPALIVE_SECS", default_value_t = 30)]
    pub keepalive_secs: u64,

    #[arg(long, env = "JETTY_WS_WRITE_TIMEOUT_SECS", default_value_t = 30)]
    pub ws_write_timeout_secs: u64,

    /// Frames buffered per direction of a proxied WebSocket.
    #[arg(long, env = "JETTY_RELAY_BUFFER", default_value_t = 64)]
    pub relay_buffer: usize,
}

#[derive(Debug, Clone, Args)]
pub struct BootstrapArgs {
    /// Stable id the proxy presents on its discovery stream.
    #[arg(long, env = "JETTY_NODE_ID")]
    pub node_id: String,

    #[arg(long, env = "JETTY_NODE_CLUSTER", default_value = "jetty-edge")]
    pub node_cluster: String,

    #[arg(long, env = "JETTY_CONTROL_PLANE_HOST", default_value = "127.0.0.1")]
    pub control_plane_host: String,

    #[arg(long, env = "JETTY_CONTROL_PLANE_PORT", default_value_t = 18000)]
    pub control_plane_port: u16,

    #[arg(long, env = "JETTY_ROUTE_CONFIG_NAME", default_value = DEFAULT_ROUTE_CONFIG_NAME)]
    pub route_config_name: String,

    #[arg(long, env = "JETTY_PROXY_ADMIN_PORT", default_value_t = 9901)]
    pub admin_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test_timeout::timeout]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test_timeout::timeout]
    fn all_accepts_both_flag_sets() {
        let cli = Cli::try_parse_from([
            "beach-jetty",
            "all",
            "--seed",
            "sandboxes.json",
            "--domain",
            "sbx.example.dev",
            "--control-plane-addr",
            "127.0.0.1:18000",
            "--control-plane-http-addr",
            "127.0.0.1:18001",
            "--edge-addr",
            "127.0.0.1:8080",
            "--relay-buffer",
            "8",
        ])
        .unwrap();
        match cli.command {
            Command::All {
                shared,
                control_plane,
                edge,
            } => {
                assert_eq!(shared.seed_file, Some(PathBuf::from("sandboxes.json")));
                assert_eq!(shared.domain, "sbx.example.dev");
                assert_eq!(control_plane.control_plane_addr, "127.0.0.1:18000");
                assert_eq!(control_plane.control_plane_http_addr, "127.0.0.1:18001");
                assert_eq!(control_plane.route_config_name, DEFAULT_ROUTE_CONFIG_NAME);
                assert_eq!(edge.edge_addr, "127.0.0.1:8080");
                assert_eq!(edge.relay_buffer, 8);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn redis_and_seed_are_exclusive() {
        let result = Cli::try_parse_from([
            "beach-jetty",
            "edge",
            "--redis-url",
            "redis://127.0.0.1:6379",
            "--seed",
            "sandboxes.json",
        ]);
        assert!(result.is_err());
    }

    #[test_timeout::timeout]
    fn bootstrap_defaults_to_local_control_plane() {
        let result = Cli::try_parse_from(["beach-jetty", "bootstrap", "--node-id", "edge-a"]);
        match result.unwrap().command {
            Command::Bootstrap(args) => {
                assert_eq!(args.node_id, "edge-a");
                assert_eq!(args.control_plane_port, 18000);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
