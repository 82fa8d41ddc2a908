// Node configuration
//
// One struct for everything a node needs at init, composed from the
// per-component configs. Ports and bind address live in the transport
// config; the accessors here just read them back.

use crate::discovery::LanConfig;
use crate::error::MeshError;
use crate::peer::RegistryConfig;
use crate::post::PostPolicy;
use crate::sync::GossipConfig;
use crate::transport::{TransportConfig, DEFAULT_PORT, DEFAULT_PROXY_PORT};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Host written into discovery tokens and handshakes
    pub advertised_host: Option<String>,
    /// Where identity, posts and the bootstrap cache live; in memory when unset
    pub data_dir: Option<PathBuf>,
    /// Network secret peers must present
    pub shared_secret: Option<String>,
    /// Route through the proxy as soon as the node starts
    pub anonymize_on_start: bool,
    pub transport: TransportConfig,
    pub gossip: GossipConfig,
    pub registry: RegistryConfig,
    pub posts: PostPolicy,
    pub lan: LanConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PORT, DEFAULT_PROXY_PORT)
    }
}

impl NodeConfig {
    pub fn new(port: u16, proxy_port: u16) -> Self {
        Self {
            advertised_host: None,
            data_dir: None,
            shared_secret: None,
            anonymize_on_start: false,
            transport: TransportConfig::new().with_port(port).with_proxy_port(proxy_port),
            gossip: GossipConfig::default(),
            registry: RegistryConfig::default(),
            posts: PostPolicy::default(),
            lan: LanConfig::default(),
        }
    }

    pub fn port(&self) -> u16 {
        self.transport.port
    }

    pub fn proxy_port(&self) -> u16 {
        self.transport.proxy_port
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.transport = self.transport.with_bind_address(address);
        self
    }

    pub fn with_proxy_host(mut self, host: impl Into<String>) -> Self {
        self.transport = self.transport.with_proxy_host(host);
        self
    }

    pub fn with_advertised_host(mut self, host: impl Into<String>) -> Self {
        self.advertised_host = Some(host.into());
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_shared_secret(mut self, secret: impl Into<String>) -> Self {
        self.shared_secret = Some(secret.into());
        self
    }

    pub fn with_anonymize_on_start(mut self, enabled: bool) -> Self {
        self.anonymize_on_start = enabled;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_gossip(mut self, gossip: GossipConfig) -> Self {
        self.gossip = gossip;
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_post_policy(mut self, posts: PostPolicy) -> Self {
        self.posts = posts;
        self
    }

    pub fn with_lan(mut self, lan: LanConfig) -> Self {
        self.lan = lan;
        self
    }

    /// Reject zero intervals and limits
    pub fn validate(&self) -> Result<(), MeshError> {
        self.transport
            .validate()
            .map_err(|e| MeshError::Validation(e.to_string()))?;
        self.gossip.validate().map_err(MeshError::Validation)?;
        self.lan.validate().map_err(MeshError::Validation)?;

        if self.registry.max_peers == 0 {
            return Err(MeshError::Validation("max_peers cannot be 0".to_string()));
        }
        if self.registry.backoff.base.is_zero() || self.registry.backoff.max < self.registry.backoff.base {
            return Err(MeshError::Validation(
                "backoff base must be non-zero and not above its cap".to_string(),
            ));
        }
        if self.posts.max_content_len == 0 {
            return Err(MeshError::Validation("max_content_len cannot be 0".to_string()));
        }
        if self.posts.max_posts == Some(0) {
            return Err(MeshError::Validation("max_posts cannot be 0".to_string()));
        }
        if self.advertised_host.as_deref().is_some_and(|h| h.trim().is_empty()) {
            return Err(MeshError::Validation("advertised host is empty".to_string()));
        }
        if self.shared_secret.as_deref().is_some_and(str::is_empty) {
            return Err(MeshError::Validation("shared secret is empty".to_string()));
        }
        Ok(())
    }
}
