//! Backend registry: named backends, address resolution and dialing
//!
//! Each configured backend becomes a `Backend`: its resolved address list, a
//! round-robin picker over them, and a dialer that knows the backend's
//! transport settings (TLS, connect timeout, keepalive). Name resolution is an
//! external concern: the built-in resolver serves static address lists, while
//! SRV and cluster-service specs are carried in config for deployments that
//! supply their own `Resolver`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use crate::config::{BackendConfig, BackendPoolConfig, BalancerPolicy, ResolverSpec, SecurityConfig};
use crate::error::{RelayError, RelayResult};
use crate::metrics;
use crate::proxy::pool::Dialer;

/// Resolves a backend's spec into dialable `host:port` addresses.
#[tonic::async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(&self, backend: &BackendConfig) -> RelayResult<Vec<String>>;
}

/// Resolver for static address lists.
///
/// SRV and cluster-service lookups are rejected here: they need a resolver
/// wired to the deployment's infrastructure.
pub struct StaticResolver;

#[tonic::async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, backend: &BackendConfig) -> RelayResult<Vec<String>> {
        match &backend.resolver {
            ResolverSpec::Static { addresses } => Ok(addresses.clone()),
            ResolverSpec::Srv { dns_name } => Err(RelayError::InvalidConfig {
                message: format!(
                    "backend '{}': SRV lookup for '{dns_name}' requires an external resolver",
                    backend.name
                ),
            }),
            ResolverSpec::K8s { service_name, .. } => Err(RelayError::InvalidConfig {
                message: format!(
                    "backend '{}': cluster lookup for '{service_name}' requires an external resolver",
                    backend.name
                ),
            }),
        }
    }
}

/// Dialer carrying one backend's transport settings.
pub struct EndpointDialer {
    backend: String,
    tls: Option<ClientTlsConfig>,
    connect_timeout: Duration,
    conntrack: bool,
}

#[tonic::async_trait]
impl Dialer for EndpointDialer {
    async fn dial(&self, addr: &str) -> RelayResult<Channel> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{addr}"))
            .map_err(|e| RelayError::InvalidConfig {
                message: format!("invalid backend address '{addr}': {e}"),
            })?
            .connect_timeout(self.connect_timeout)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10));
        if let Some(tls) = &self.tls {
            endpoint = endpoint
                .tls_config(tls.clone())
                .map_err(|e| RelayError::InvalidConfig {
                    message: format!("backend '{}': bad TLS config: {e}", self.backend),
                })?;
        }

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| RelayError::BackendUnavailable {
                message: e.to_string(),
            })?;
        if self.conntrack {
            metrics::record_backend_dial(&self.backend);
        }
        tracing::debug!(backend = %self.backend, %addr, "dialed backend endpoint");
        Ok(channel)
    }
}

fn build_tls(backend: &str, security: &SecurityConfig) -> ClientTlsConfig {
    if security.insecure_skip_verify {
        // tonic's rustls stack always verifies; the knob is accepted for
        // config compatibility but cannot disable verification.
        tracing::warn!(
            backend,
            "insecure_skip_verify requested; certificate verification stays enabled"
        );
    }
    ClientTlsConfig::new().with_webpki_roots()
}

/// One configured backend with its resolved addresses.
pub struct Backend {
    name: String,
    addresses: Vec<String>,
    next: AtomicUsize,
    dialer: Arc<EndpointDialer>,
    observed: bool,
}

impl Backend {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Per-call metrics enabled for this backend.
    pub fn observed(&self) -> bool {
        self.observed
    }

    /// Pick the address for the next call.
    pub fn pick(&self) -> &str {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.addresses.len();
        &self.addresses[idx]
    }

    pub fn dialer(&self) -> &EndpointDialer {
        &self.dialer
    }
}

/// Immutable map of backend name to `Backend`, built once at startup.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<Backend>>,
}

impl BackendRegistry {
    pub async fn from_config(
        config: &BackendPoolConfig,
        resolver: &dyn Resolver,
    ) -> RelayResult<Self> {
        let mut backends = HashMap::new();
        for cfg in &config.backends {
            let addresses = resolver.resolve(cfg).await?;
            if addresses.is_empty() {
                return Err(RelayError::InvalidConfig {
                    message: format!("backend '{}' resolved to no addresses", cfg.name),
                });
            }
            // ROUND_ROBIN is the only policy; the match keeps additions honest.
            match cfg.balancer {
                BalancerPolicy::RoundRobin => {}
            }
            let dialer = Arc::new(EndpointDialer {
                backend: cfg.name.clone(),
                tls: cfg.security.as_ref().map(|sec| build_tls(&cfg.name, sec)),
                connect_timeout: config.pool.dial_timeout(),
                conntrack: !cfg.disable_conntracking,
            });
            tracing::info!(
                backend = %cfg.name,
                addresses = addresses.len(),
                observed = cfg.observed(),
                "registered backend"
            );
            backends.insert(
                cfg.name.clone(),
                Arc::new(Backend {
                    name: cfg.name.clone(),
                    addresses,
                    next: AtomicUsize::new(0),
                    dialer,
                    observed: cfg.observed(),
                }),
            );
        }
        Ok(Self { backends })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Backend>> {
        self.backends.get(name)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
