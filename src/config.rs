//! Configuration structures and loading logic
//!
//! Two JSON files are read once at startup: the backend pool config (named
//! backends, how to reach them, pool tuning) and the router config (ordered
//! route list). The field names mirror the original protobuf-backed schema,
//! so both snake_case and its camelCase JSON encoding are accepted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Backend pool config
// ============================================================================

/// Tuning for the backend connection pool
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Maximum pooled connections per backend address
    pub size: usize,
    /// Maximum wall-clock lifetime of a connection in seconds; older ones are
    /// retired once idle
    pub ttl_secs: u64,
    /// Concurrent streams per connection before it is hidden from selection
    pub max_streams: u32,
    /// Idle (zero-stream) connections kept per address before eager closure
    pub max_idle: usize,
    /// Bound on dialing a new backend connection, in milliseconds
    pub dial_timeout_ms: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            ttl_secs: default_pool_ttl_secs(),
            max_streams: default_max_streams(),
            max_idle: default_max_idle(),
            dial_timeout_ms: default_dial_timeout_ms(),
        }
    }
}

impl PoolOptions {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

fn default_pool_size() -> usize {
    8
}

fn default_pool_ttl_secs() -> u64 {
    300
}

fn default_max_streams() -> u32 {
    100
}

fn default_max_idle() -> usize {
    2
}

fn default_dial_timeout_ms() -> u64 {
    1000
}

/// How a backend's addresses are found
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverSpec {
    /// Fixed `host:port` addresses
    Static { addresses: Vec<String> },
    /// DNS SRV lookup, handled by an externally supplied resolver
    Srv {
        #[serde(alias = "dnsName")]
        dns_name: String,
    },
    /// Cluster service lookup, handled by an externally supplied resolver
    K8s {
        #[serde(alias = "serviceName")]
        service_name: String,
        #[serde(alias = "portName")]
        port_name: String,
        #[serde(default)]
        namespace: Option<String>,
    },
}

/// Transport security towards a backend. Present means TLS.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecurityConfig {
    #[serde(default, alias = "insecureSkipVerify")]
    pub insecure_skip_verify: bool,
}

/// Per-call interceptor tags applied to a backend
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InterceptorConfig {
    #[serde(default)]
    pub prometheus: bool,
}

/// Load-balancing policy across a backend's resolved addresses
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum BalancerPolicy {
    #[default]
    #[serde(rename = "ROUND_ROBIN")]
    RoundRobin,
}

/// Immutable descriptor of one named backend
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Logical name, unique across the pool config; routes refer to it
    pub name: String,
    pub resolver: ResolverSpec,
    #[serde(default)]
    pub security: Option<SecurityConfig>,
    #[serde(default)]
    pub interceptors: Vec<InterceptorConfig>,
    #[serde(default)]
    pub balancer: BalancerPolicy,
    #[serde(default, alias = "disableConntracking")]
    pub disable_conntracking: bool,
}

impl BackendConfig {
    /// Whether any interceptor tag asks for per-call metrics
    pub fn observed(&self) -> bool {
        self.interceptors.iter().any(|i| i.prometheus)
    }
}

/// The backend pool config file: pool tuning plus the backend list
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BackendPoolConfig {
    #[serde(default)]
    pub pool: PoolOptions,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl BackendPoolConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read backend config file: {path:?}"))?;
        let config: Self =
            serde_json::from_str(&content).context("Failed to parse backend config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() {
                anyhow::bail!("Backend name cannot be empty");
            }
            if !names.insert(backend.name.as_str()) {
                anyhow::bail!("Duplicate backend name '{}'", backend.name);
            }
            if let ResolverSpec::Static { addresses } = &backend.resolver
                && addresses.is_empty()
            {
                anyhow::bail!("Backend '{}' has no static addresses", backend.name);
            }
        }
        if self.pool.size == 0 {
            anyhow::bail!("pool.size must be at least 1");
        }
        if self.pool.max_streams == 0 {
            anyhow::bail!("pool.max_streams must be at least 1");
        }
        Ok(())
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }
}

// ============================================================================
// Router config
// ============================================================================

/// One match rule paired with a backend name
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RouteConfig {
    #[serde(alias = "backendName")]
    pub backend_name: String,
    /// `""` or `"*"` match everything, a trailing `*` matches by prefix,
    /// anything else is literal equality against the full method name
    #[serde(default, alias = "serviceNameMatcher")]
    pub service_name_matcher: String,
    /// Exact `:authority` value; empty matches any
    #[serde(default, alias = "authorityMatcher")]
    pub authority_matcher: String,
    /// Metadata keys (case-insensitive) that must each carry the given value
    #[serde(default, alias = "metadataMatcher")]
    pub metadata_matcher: HashMap<String, String>,
}

/// The router config file: an ordered route list, first match wins
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl RouterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read router config file: {path:?}"))?;
        let config: Self =
            serde_json::from_str(&content).context("Failed to parse router config JSON")?;
        Ok(config)
    }

    /// Check every route against the backends it can be routed to
    pub fn validate(&self, backends: &BackendPoolConfig) -> Result<()> {
        for route in &self.routes {
            if route.backend_name.is_empty() {
                anyhow::bail!("Route without a backend name");
            }
            if backends.backend(&route.backend_name).is_none() {
                anyhow::bail!(
                    "Route references unknown backend '{}'",
                    route.backend_name
                );
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn static_backend(name: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            resolver: ResolverSpec::Static {
                addresses: vec!["127.0.0.1:9000".to_string()],
            },
            security: None,
            interceptors: Vec::new(),
            balancer: BalancerPolicy::RoundRobin,
            disable_conntracking: false,
        }
    }

    #[test]
    fn test_pool_defaults() {
        let opts = PoolOptions::default();
        assert_eq!(opts.size, 8);
        assert_eq!(opts.ttl(), Duration::from_secs(300));
        assert_eq!(opts.max_streams, 100);
        assert_eq!(opts.max_idle, 2);
        assert_eq!(opts.dial_timeout(), Duration::from_millis(1000));
    }

    #[test]
    fn test_parse_backend_config_snake_case() {
        let json = r#"
        {
            "pool": { "size": 2, "ttl_secs": 60 },
            "backends": [
                {
                    "name": "backendA",
                    "resolver": { "static": { "addresses": ["10.0.0.1:9000"] } },
                    "security": { "insecure_skip_verify": true },
                    "interceptors": [ { "prometheus": true } ],
                    "balancer": "ROUND_ROBIN",
                    "disable_conntracking": true
                }
            ]
        }"#;
        let config: BackendPoolConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.pool.size, 2);
        assert_eq!(config.pool.ttl_secs, 60);
        // unspecified knobs fall back to defaults
        assert_eq!(config.pool.max_streams, 100);

        let backend = config.backend("backendA").unwrap();
        assert!(backend.security.as_ref().unwrap().insecure_skip_verify);
        assert!(backend.observed());
        assert!(backend.disable_conntracking);
        assert!(matches!(backend.resolver, ResolverSpec::Static { .. }));
    }

    #[test]
    fn test_parse_backend_config_camel_case() {
        let json = r#"
        {
            "backends": [
                {
                    "name": "srv-backend",
                    "resolver": { "srv": { "dnsName": "_grpc._tcp.example.org" } },
                    "disableConntracking": true
                },
                {
                    "name": "k8s-backend",
                    "resolver": { "k8s": { "serviceName": "svc", "portName": "grpc" } }
                }
            ]
        }"#;
        let config: BackendPoolConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        match &config.backend("srv-backend").unwrap().resolver {
            ResolverSpec::Srv { dns_name } => assert_eq!(dns_name, "_grpc._tcp.example.org"),
            other => panic!("unexpected resolver: {other:?}"),
        }
        match &config.backend("k8s-backend").unwrap().resolver {
            ResolverSpec::K8s {
                service_name,
                port_name,
                namespace,
            } => {
                assert_eq!(service_name, "svc");
                assert_eq!(port_name, "grpc");
                assert!(namespace.is_none());
            }
            other => panic!("unexpected resolver: {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_backend_name_rejected() {
        let config = BackendPoolConfig {
            pool: PoolOptions::default(),
            backends: vec![static_backend("dup"), static_backend("dup")],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate backend name"));
    }

    #[test]
    fn test_empty_static_addresses_rejected() {
        let config = BackendPoolConfig {
            pool: PoolOptions::default(),
            backends: vec![BackendConfig {
                resolver: ResolverSpec::Static {
                    addresses: Vec::new(),
                },
                ..static_backend("empty")
            }],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no static addresses"));
    }

    #[test]
    fn test_parse_router_config_camel_case() {
        // The shape jsonpb produced for the original route table.
        let json = r#"
        { "routes": [
            {
                "backendName": "backendA",
                "serviceNameMatcher": "com.example.a.*"
            },
            {
                "backendName": "backendB_authorityA",
                "serviceNameMatcher": "com.*",
                "authorityMatcher": "authority_a.service.local"
            },
            {
                "backendName": "backendD",
                "serviceNameMatcher": "com.example.",
                "metadataMatcher": {
                    "keyOne": "valueOne",
                    "keyTwo": "valueTwo"
                }
            }
        ]}"#;
        let config: RouterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.routes.len(), 3);
        assert_eq!(config.routes[0].backend_name, "backendA");
        assert_eq!(config.routes[1].authority_matcher, "authority_a.service.local");
        assert_eq!(
            config.routes[2].metadata_matcher.get("keyOne"),
            Some(&"valueOne".to_string())
        );
    }

    #[test]
    fn test_route_to_unknown_backend_rejected() {
        let backends = BackendPoolConfig {
            pool: PoolOptions::default(),
            backends: vec![static_backend("known")],
        };
        let router = RouterConfig {
            routes: vec![RouteConfig {
                backend_name: "missing".to_string(),
                ..RouteConfig::default()
            }],
        };
        let err = router.validate(&backends).unwrap_err();
        assert!(err.to_string().contains("unknown backend 'missing'"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "backends": [ {{ "name": "a", "resolver": {{ "static": {{ "addresses": ["127.0.0.1:1"] }} }} }} ] }}"#
        )
        .unwrap();

        let config = BackendPoolConfig::load(file.path()).unwrap();
        assert_eq!(config.backends.len(), 1);

        let missing = BackendPoolConfig::load("/nonexistent/backends.json");
        assert!(missing.is_err());
    }
}
