//! Configuration management for the gateway.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GatewayError, Result};
use crate::ratelimit::parse_window_label;

/// Prefix for environment variable overrides, e.g. `SENTRY_GATE__SERVER__LISTEN_ADDR`.
pub const ENV_PREFIX: &str = "SENTRY_GATE";

/// Main configuration for the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend targets
    #[serde(default)]
    pub upstreams: UpstreamsConfig,

    /// JSON-RPC handling
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Per-identity and aggregate rate limiting
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    /// CDN front door
    #[serde(default)]
    pub cdn: CdnConfig,

    /// Limiter snapshot persistence
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// WAF abuse reporting
    #[serde(default)]
    pub waf: WafConfig,

    /// Values synthesized locally instead of being forwarded
    #[serde(default)]
    pub local_answers: LocalAnswersConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the gateway listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Path that accepts WebSocket upgrades on RPC hosts
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// How long in-flight requests may drain after a shutdown signal
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            ws_path: default_ws_path(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_ws_path() -> String {
    "/ws/".to_string()
}

fn default_shutdown_grace() -> u64 {
    5
}

/// Upstream targets and the shared outbound transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamsConfig {
    /// Node that accepts transaction submissions
    #[serde(default = "default_sentry")]
    pub sentry: String,

    /// General-purpose read nodes; one entry means a fixed origin
    #[serde(default = "default_origins")]
    pub origins: Vec<String>,

    /// Static target for non-RPC traffic
    #[serde(default = "default_target")]
    pub default_target: String,

    /// WebSocket target for non-RPC hosts; such upgrades are refused when absent
    #[serde(default)]
    pub default_ws_target: Option<String>,

    /// Failures after which an origin stops being selected
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    /// Outbound request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Idle pooled connections kept per upstream host
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,

    /// How long an idle pooled connection is kept
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for UpstreamsConfig {
    fn default() -> Self {
        Self {
            sentry: default_sentry(),
            origins: default_origins(),
            default_target: default_target(),
            default_ws_target: None,
            max_fails: default_max_fails(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

fn default_sentry() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_origins() -> Vec<String> {
    vec!["http://127.0.0.1:8546".to_string()]
}

fn default_target() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_max_fails() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    60
}

fn default_pool_max_idle() -> usize {
    1024
}

fn default_pool_idle_timeout() -> u64 {
    90
}

/// JSON-RPC handling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Hosts that receive JSON-RPC handling; everything else goes to the default target
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Absolute ceiling on the charged cost of one request
    #[serde(default = "default_max_batch_cost")]
    pub max_batch_cost: u64,

    /// Request body cap in bytes
    #[serde(default = "default_max_request_body")]
    pub max_request_body_bytes: usize,

    /// Response body cap in bytes
    #[serde(default = "default_max_response_body")]
    pub max_response_body_bytes: usize,

    /// Inbound headers starting with any of these (case-insensitive) are never forwarded
    #[serde(default = "default_reserved_prefixes")]
    pub reserved_header_prefixes: Vec<String>,

    /// Value of the attribution header
    #[serde(default = "default_powered_by")]
    pub powered_by: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            max_batch_cost: default_max_batch_cost(),
            max_request_body_bytes: default_max_request_body(),
            max_response_body_bytes: default_max_response_body(),
            reserved_header_prefixes: default_reserved_prefixes(),
            powered_by: default_powered_by(),
        }
    }
}

impl RpcConfig {
    /// Whether the given `Host` header (port ignored) is a recognized RPC host.
    pub fn is_rpc_host(&self, host: &str) -> bool {
        let host = crate::proxy::host_label(host);
        self.hosts.iter().any(|h| {
            let h = h.trim_start_matches('[').trim_end_matches(']');
            h.eq_ignore_ascii_case(host)
        })
    }
}

fn default_max_batch_cost() -> u64 {
    199
}

fn default_max_request_body() -> usize {
    512 * 1024
}

fn default_max_response_body() -> usize {
    100 << 20
}

fn default_reserved_prefixes() -> Vec<String> {
    vec!["x-gate-".to_string()]
}

fn default_powered_by() -> String {
    "sentry-gate".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    /// Ordered per-identity windows; a request must pass every one
    #[serde(default = "default_windows")]
    pub windows: Vec<WindowConfig>,

    /// Optional global admission limiter
    #[serde(default = "default_aggregate")]
    pub aggregate: Option<AggregateConfig>,

    /// How often expired counters are swept; zero disables the sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            windows: default_windows(),
            aggregate: default_aggregate(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// One per-identity window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window width as a label such as `5s`, `1m`, `24h`
    pub label: String,
    /// Capacity within the window
    pub capacity: u64,
}

impl WindowConfig {
    pub fn new(label: &str, capacity: u64) -> Self {
        Self {
            label: label.to_string(),
            capacity,
        }
    }
}

/// Global limiter across all identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateConfig {
    pub capacity: u64,
    #[serde(default = "default_aggregate_window")]
    pub window_ms: u64,
}

fn default_windows() -> Vec<WindowConfig> {
    vec![
        WindowConfig::new("5s", 80),
        WindowConfig::new("1m", 720),
        WindowConfig::new("1h", 28_800),
        WindowConfig::new("24h", 345_600),
    ]
}

fn default_aggregate() -> Option<AggregateConfig> {
    Some(AggregateConfig {
        capacity: 2048,
        window_ms: default_aggregate_window(),
    })
}

fn default_aggregate_window() -> u64 {
    1000
}

fn default_sweep_interval() -> u64 {
    300
}

/// CDN front door configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdnConfig {
    /// Refuse peers that are not CDN edge nodes
    #[serde(default)]
    pub require: bool,

    /// Header carrying the real client address when the peer is a CDN edge
    #[serde(default = "default_client_ip_header")]
    pub client_ip_header: String,

    /// Seed the edge list with the published Cloudflare ranges
    #[serde(default = "default_true")]
    pub cloudflare_ranges: bool,

    /// Additional edge ranges in CIDR notation
    #[serde(default)]
    pub extra_cidrs: Vec<String>,
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            require: false,
            client_ip_header: default_client_ip_header(),
            cloudflare_ranges: true,
            extra_cidrs: Vec::new(),
        }
    }
}

fn default_client_ip_header() -> String {
    "cf-connecting-ip".to_string()
}

fn default_true() -> bool {
    true
}

/// Limiter snapshot persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Redis URL; an in-process store is used when absent
    #[serde(default)]
    pub redis_url: Option<String>,
}

/// WAF reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafConfig {
    /// Ban endpoint; reporting is disabled when absent
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Value of the `Authorization` header sent to the endpoint
    #[serde(default)]
    pub key: String,

    /// Capacity of the pending-report queue
    #[serde(default = "default_waf_queue")]
    pub queue_size: usize,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            key: String::new(),
            queue_size: default_waf_queue(),
        }
    }
}

fn default_waf_queue() -> usize {
    1024
}

/// Locally synthesized answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalAnswersConfig {
    #[serde(default = "default_gas_price")]
    pub gas_price: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    /// `to` field of the `eth_call` liveness probe
    #[serde(default = "default_probe_to")]
    pub probe_to: String,
    /// `value` field of the `eth_call` liveness probe, echoed as its result
    #[serde(default = "default_probe_value")]
    pub probe_value: String,
}

impl Default for LocalAnswersConfig {
    fn default() -> Self {
        Self {
            gas_price: default_gas_price(),
            chain_id: default_chain_id(),
            client_version: default_client_version(),
            probe_to: default_probe_to(),
            probe_value: default_probe_value(),
        }
    }
}

fn default_gas_price() -> String {
    "0x3b9aca00".to_string()
}

fn default_chain_id() -> String {
    "0x38".to_string()
}

fn default_client_version() -> String {
    "Geth/v1.4.11/linux-amd64/go1.22.4".to_string()
}

fn default_probe_to() -> String {
    "0x0000000000000000000000000000000000000048".to_string()
}

fn default_probe_value() -> String {
    "0x30".to_string()
}

impl GatewayConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading gateway configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file layered with
    /// `SENTRY_GATE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading gateway configuration");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: GatewayConfig = builder
            .build()
            .and_then(|c| c.try_deserialize::<GatewayConfig>())
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the limiter and classifier cannot run with.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.rate_limits;
        if limits.windows.is_empty() {
            return Err(GatewayError::Config(
                "at least one rate limit window is required".to_string(),
            ));
        }

        let mut labels = HashSet::new();
        for window in &limits.windows {
            if parse_window_label(&window.label).is_none() {
                return Err(GatewayError::Config(format!(
                    "invalid window label '{}'",
                    window.label
                )));
            }
            if window.capacity == 0 {
                return Err(GatewayError::Config(format!(
                    "window '{}' has zero capacity",
                    window.label
                )));
            }
            if !labels.insert(window.label.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate window label '{}'",
                    window.label
                )));
            }
        }

        if let Some(aggregate) = &limits.aggregate {
            if aggregate.capacity == 0 || aggregate.window_ms == 0 {
                return Err(GatewayError::Config(
                    "aggregate limiter needs a non-zero capacity and window".to_string(),
                ));
            }
        }

        if self.rpc.max_batch_cost == 0 {
            return Err(GatewayError::Config(
                "max_batch_cost must be greater than zero".to_string(),
            ));
        }

        if self.upstreams.origins.is_empty() {
            return Err(GatewayError::Config(
                "at least one origin is required".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_original_windows() {
        let config = GatewayConfig::default();
        let labels: Vec<_> = config
            .rate_limits
            .windows
            .iter()
            .map(|w| (w.label.as_str(), w.capacity))
            .collect();
        assert_eq!(
            labels,
            vec![("5s", 80), ("1m", 720), ("1h", 28_800), ("24h", 345_600)]
        );
        assert_eq!(config.rpc.max_request_body_bytes, 512 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  listen_addr: "127.0.0.1:9000"
upstreams:
  sentry: "http://sentry:8545"
  origins: ["http://a:8545", "http://b:8545"]
rpc:
  hosts: ["rpc.example.org"]
  max_batch_cost: 9
rate_limits:
  windows:
    - label: 5s
      capacity: 10
"#;
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.upstreams.origins.len(), 2);
        assert_eq!(config.rate_limits.windows, vec![WindowConfig::new("5s", 10)]);
        assert_eq!(config.rpc.max_batch_cost, 9);
        // untouched sections keep their defaults
        assert_eq!(config.local_answers.chain_id, "0x38");
    }

    #[test]
    fn test_rpc_host_ignores_port_and_case() {
        let rpc = RpcConfig {
            hosts: vec!["rpc.example.org".to_string()],
            ..RpcConfig::default()
        };
        assert!(rpc.is_rpc_host("rpc.example.org"));
        assert!(rpc.is_rpc_host("RPC.example.org:443"));
        assert!(!rpc.is_rpc_host("static.example.org"));

        let rpc = RpcConfig {
            hosts: vec!["::1".to_string(), "[2001:db8::7]".to_string()],
            ..RpcConfig::default()
        };
        assert!(rpc.is_rpc_host("[::1]:8080"));
        assert!(rpc.is_rpc_host("[::1]"));
        assert!(rpc.is_rpc_host("[2001:db8::7]:443"));
        assert!(!rpc.is_rpc_host("[::2]:8080"));
    }

    #[test]
    fn test_validate_rejects_bad_windows() {
        let mut config = GatewayConfig::default();
        config.rate_limits.windows = vec![WindowConfig::new("5x", 10)];
        assert!(config.validate().is_err());

        config.rate_limits.windows = vec![WindowConfig::new("5s", 0)];
        assert!(config.validate().is_err());

        config.rate_limits.windows =
            vec![WindowConfig::new("5s", 10), WindowConfig::new("5s", 20)];
        assert!(config.validate().is_err());

        config.rate_limits.windows.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch_ceiling() {
        let mut config = GatewayConfig::default();
        config.rpc.max_batch_cost = 0;
        assert!(config.validate().is_err());
    }
}
