use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection settings of one node. Two configs with the same fields are the
/// same node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub region: Option<String>,
}

impl NodeConfig {
    pub fn websocket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}:{}/v4/websocket", self.host, self.port)
    }

    pub fn rest_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}/v4/", self.host, self.port)
    }
}

/// Reconnect and REST retry tuning shared by every node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOptions {
    /// Consecutive failed connects before the node is marked failed.
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Límite del handshake WebSocket. Un intento que lo supera cuenta como
    /// fallido.
    pub connect_timeout: Duration,
    /// How long the node keeps a disconnected session resumable.
    pub resume_window: Duration,
    /// Extra attempts for idempotent REST GETs.
    pub rest_retries: u32,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            max_retries: Some(10),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            resume_window: Duration::from_secs(60),
            rest_retries: 3,
        }
    }
}

/// Weights of the node load score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadWeights {
    pub players: f64,
    pub cpu: f64,
    pub memory: f64,
    pub frames: f64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        Self {
            players: 1.0,
            cpu: 1.0,
            memory: 0.5,
            frames: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Bot user id sent in the `User-Id` handshake header.
    pub user_id: u64,
    pub client_name: String,
    pub nodes: Vec<NodeConfig>,
    pub cache_size: usize,
    pub node_options: NodeOptions,
    pub load_weights: LoadWeights,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: 0,
            client_name: default_client_name(),
            nodes: Vec::new(),
            cache_size: 64,
            node_options: NodeOptions::default(),
            load_weights: LoadWeights::default(),
        }
    }
}

fn default_client_name() -> String {
    format!("open-music-link/{}", env!("CARGO_PKG_VERSION"))
}

fn duration_var(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => humantime::parse_duration(raw.trim())
            .with_context(|| format!("{key} must be a duration like \"5s\", got {raw:?}")),
        _ => Ok(default),
    }
}

fn parsed_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        _ => Ok(default),
    }
}

impl Config {
    /// Reads `.env` and the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup, then validates it.
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = NodeOptions::default();
        let weights = LoadWeights::default();

        let user_id = lookup("USER_ID")
            .context("USER_ID is required")?
            .trim()
            .parse()
            .context("USER_ID must be a numeric Discord id")?;

        let nodes = match lookup("LAVALINK_NODES") {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .context("LAVALINK_NODES must be a JSON array of node objects")?,
            _ => match lookup("LAVALINK_HOST") {
                Some(host) => vec![NodeConfig {
                    name: "main".to_string(),
                    host,
                    port: parsed_var(&lookup, "LAVALINK_PORT", 2333)?,
                    password: lookup("LAVALINK_PASSWORD").unwrap_or_else(|| "youshallnotpass".to_string()),
                    secure: parsed_var(&lookup, "LAVALINK_SECURE", false)?,
                    region: lookup("LAVALINK_REGION").filter(|r| !r.trim().is_empty()),
                }],
                None => Vec::new(),
            },
        };

        let max_retries = match parsed_var(&lookup, "NODE_MAX_RETRIES", 10u32)? {
            0 => None,
            n => Some(n),
        };

        let config = Self {
            user_id,
            client_name: lookup("CLIENT_NAME").unwrap_or_else(default_client_name),
            nodes,
            cache_size: parsed_var(&lookup, "CACHE_SIZE", 64)?,
            node_options: NodeOptions {
                max_retries,
                backoff_base: duration_var(&lookup, "NODE_BACKOFF_BASE", defaults.backoff_base)?,
                backoff_max: duration_var(&lookup, "NODE_BACKOFF_MAX", defaults.backoff_max)?,
                connect_timeout: duration_var(&lookup, "NODE_CONNECT_TIMEOUT", defaults.connect_timeout)?,
                resume_window: duration_var(&lookup, "NODE_RESUME_WINDOW", defaults.resume_window)?,
                rest_retries: parsed_var(&lookup, "REST_RETRIES", defaults.rest_retries)?,
            },
            load_weights: LoadWeights {
                players: parsed_var(&lookup, "LOAD_WEIGHT_PLAYERS", weights.players)?,
                cpu: parsed_var(&lookup, "LOAD_WEIGHT_CPU", weights.cpu)?,
                memory: parsed_var(&lookup, "LOAD_WEIGHT_MEMORY", weights.memory)?,
                frames: parsed_var(&lookup, "LOAD_WEIGHT_FRAMES", weights.frames)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.user_id == 0 {
            bail!("USER_ID must not be 0");
        }

        if self.nodes.is_empty() {
            bail!("No nodes configured: set LAVALINK_NODES or LAVALINK_HOST");
        }

        let mut names = std::collections::HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                bail!("Node names must not be empty");
            }
            if !names.insert(node.name.as_str()) {
                bail!("Duplicate node name: {}", node.name);
            }
            if node.host.trim().is_empty() {
                bail!("Node {} has an empty host", node.name);
            }
        }

        if self.cache_size == 0 {
            bail!("Cache size must be greater than 0");
        }

        let opts = &self.node_options;
        if opts.backoff_base.is_zero() {
            bail!("NODE_BACKOFF_BASE must be greater than 0");
        }
        if opts.connect_timeout.is_zero() {
            bail!("NODE_CONNECT_TIMEOUT must be greater than 0");
        }
        if opts.backoff_max < opts.backoff_base {
            bail!(
                "NODE_BACKOFF_MAX ({:?}) must not be below NODE_BACKOFF_BASE ({:?})",
                opts.backoff_max,
                opts.backoff_base
            );
        }

        let w = &self.load_weights;
        if [w.players, w.cpu, w.memory, w.frames].iter().any(|v| *v < 0.0 || !v.is_finite()) {
            bail!("Load weights must be finite and not negative");
        }

        Ok(())
    }

    /// Secret-free description for logging.
    pub fn summary(&self) -> String {
        let nodes: Vec<String> = self
            .nodes
            .iter()
            .map(|n| {
                format!(
                    "{} ({}:{}{}{})",
                    n.name,
                    n.host,
                    n.port,
                    if n.secure { ", tls" } else { "" },
                    n.region.as_deref().map(|r| format!(", {r}")).unwrap_or_default()
                )
            })
            .collect();

        format!(
            "Config Summary:\n  \
            Client: {} as user {}\n  \
            Nodes: {}\n  \
            Reconnect: {} retries, backoff {} to {}, connect timeout {}, resume window {}\n  \
            Load weights: players {}, cpu {}, memory {}, frames {}\n  \
            REST: {} retries\n  \
            Cache: {} queries",
            self.client_name,
            self.user_id,
            nodes.join(", "),
            self.node_options
                .max_retries
                .map_or("unlimited".to_string(), |n| n.to_string()),
            humantime::format_duration(self.node_options.backoff_base),
            humantime::format_duration(self.node_options.backoff_max),
            humantime::format_duration(self.node_options.connect_timeout),
            humantime::format_duration(self.node_options.resume_window),
            self.load_weights.players,
            self.load_weights.cpu,
            self.load_weights.memory,
            self.load_weights.frames,
            self.node_options.rest_retries,
            self.cache_size,
        )
    }
}
