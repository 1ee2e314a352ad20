use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::StatusCode;
use tracing::{debug, info};

use crate::{
    config::BridgeConfig,
    services::port_store::{parse_port, PortCache},
};

pub const DISCOVERY_PATH: &str = "/bridge-port";

/// Where the bridge is reachable. `url` is always derived from `port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeEndpoint {
    pub port: u16,
    pub url: String,
}

impl BridgeEndpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            port,
            url: format!("ws://{host}:{port}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    Cached,
    Default,
    Fallback,
    Scan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub endpoint: BridgeEndpoint,
    pub source: DiscoverySource,
}

/// Asks a single port which port the bridge is actually serving on.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn probe(&self, port: u16, timeout: Duration) -> Option<u16>;
}

#[derive(Clone)]
pub struct HttpPortProbe {
    client: reqwest::Client,
    host: String,
}

impl HttpPortProbe {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: host.into(),
        }
    }
}

#[async_trait]
impl PortProbe for HttpPortProbe {
    async fn probe(&self, port: u16, timeout: Duration) -> Option<u16> {
        let url = format!("http://{}:{port}{DISCOVERY_PATH}", self.host);
        let response = match self.client.get(&url).timeout(timeout).send().await {
            Ok(response) => response,
            Err(error) => {
                debug!(target = "bridge.discovery", %url, error = %error, "probe failed");
                return None;
            }
        };

        if response.status() != StatusCode::OK {
            debug!(target = "bridge.discovery", %url, status = %response.status(), "probe rejected");
            return None;
        }

        let body = response.text().await.ok()?;
        let advertised = parse_port(&body);
        if advertised.is_none() {
            debug!(target = "bridge.discovery", %url, body = %body.trim(), "probe returned no usable port");
        }
        advertised
    }
}

/// Layered bridge port discovery: cached port, then the default and
/// fallback ports, then a concurrent sweep of the whole range.
pub struct PortResolver {
    config: Arc<BridgeConfig>,
    probe: Arc<dyn PortProbe>,
    cache: PortCache,
}

impl PortResolver {
    pub fn new(config: Arc<BridgeConfig>, probe: Arc<dyn PortProbe>, cache: PortCache) -> Self {
        Self {
            config,
            probe,
            cache,
        }
    }

    pub async fn resolve_port(&self) -> Option<u16> {
        self.resolve().await.map(|resolution| resolution.endpoint.port)
    }

    pub async fn resolve(&self) -> Option<Resolution> {
        let found = self.discover().await;
        match &found {
            Some(resolution) => info!(
                target = "bridge.discovery",
                port = resolution.endpoint.port,
                source = ?resolution.source,
                "bridge port resolved"
            ),
            None => info!(
                target = "bridge.discovery",
                start = self.config.discovery_start,
                end = self.config.discovery_end,
                "no bridge port found"
            ),
        }
        found
    }

    async fn discover(&self) -> Option<Resolution> {
        if let Some(cached) = self.cache.load() {
            if let Some(port) = self.probe.probe(cached, self.config.probe_timeout).await {
                // The entry already points at a live relay; leave it as is.
                return Some(self.resolution(port, DiscoverySource::Cached));
            }
            debug!(target = "bridge.discovery", port = cached, "cached port is stale");
            self.cache.invalidate();
        }

        let default_port = self.config.default_port();
        let fallback_port = self.config.fallback_port();
        let mut quick = vec![(default_port, DiscoverySource::Default)];
        if fallback_port != default_port {
            quick.push((fallback_port, DiscoverySource::Fallback));
        }

        for (candidate, source) in quick {
            if let Some(port) = self.probe.probe(candidate, self.config.probe_timeout).await {
                self.cache.store(port);
                return Some(self.resolution(port, source));
            }
        }

        let scan_timeout = self.config.scan_timeout;
        let probes = self
            .config
            .discovery_ports()
            .map(|candidate| self.probe.probe(candidate, scan_timeout));
        let port = join_all(probes).await.into_iter().flatten().next()?;

        self.cache.store(port);
        Some(self.resolution(port, DiscoverySource::Scan))
    }

    fn resolution(&self, port: u16, source: DiscoverySource) -> Resolution {
        Resolution {
            endpoint: BridgeEndpoint::new(&self.config.host, port),
            source,
        }
    }
}
