//! Gateway configuration, loaded from a YAML file.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::ServiceConfig;
use crate::error::ConfigError;
use crate::subscription_bridge::WebSocketProtocol;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_SUBSCRIPTION_BUFFER: usize = 16;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Applied to every subgraph HTTP request when set.
    #[serde(default, with = "humantime_serde")]
    pub subgraph_timeout: Option<Duration>,
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
    /// In declaration order, which is the ownership tie-break.
    pub subgraphs: IndexMap<String, SubgraphConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubgraphConfig {
    pub routing_url: String,
    #[serde(default)]
    pub subscription_url: Option<String>,
    #[serde(default)]
    pub subscription_protocol: WebSocketProtocol,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 4000))
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_subscription_buffer() -> usize {
    DEFAULT_SUBSCRIPTION_BUFFER
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.subgraphs.is_empty() {
            return Err(ConfigError::NoSubgraphs);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidPollInterval);
        }
        for (name, subgraph) in &self.subgraphs {
            check_url(name, "routing_url", &subgraph.routing_url, &["http", "https"])?;
            if let Some(url) = &subgraph.subscription_url {
                check_url(name, "subscription_url", url, &["ws", "wss"])?;
            }
        }
        Ok(())
    }

    /// Subgraphs as registry entries, in configuration order.
    pub fn services(&self) -> Vec<ServiceConfig> {
        self.subgraphs
            .iter()
            .map(|(name, subgraph)| {
                let service = ServiceConfig::new(name.clone(), subgraph.routing_url.clone());
                match &subgraph.subscription_url {
                    Some(url) => service.with_subscriptions(url.clone(), subgraph.subscription_protocol),
                    None => service,
                }
            })
            .collect()
    }

    /// The HTTP client shared by the poller and the executor.
    pub fn http_client(&self) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.subgraph_timeout {
            builder = builder.timeout(timeout);
        }
        builder.build()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen: default_listen(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            subgraph_timeout: None,
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
            subgraphs: IndexMap::new(),
        }
    }
}

fn check_url(
    service: &str,
    field: &'static str,
    url: &str,
    schemes: &[&str],
) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        service: service.to_owned(),
        field,
        reason,
    };
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| invalid(format!("'{url}' has no scheme")))?;
    if !schemes.contains(&scheme) {
        return Err(invalid(format!(
            "scheme '{scheme}' is not one of {}",
            schemes.join(", ")
        )));
    }
    if rest.is_empty() || rest.starts_with('/') {
        return Err(invalid(format!("'{url}' has no host")));
    }
    Ok(())
}
