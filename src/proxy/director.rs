//! Routing decisions
//!
//! The director turns an inbound call into an outbound one: given the full
//! method name and the call's metadata it either returns the backend
//! connection to use (plus the metadata the outbound stream should carry) or
//! a rejection status that goes back to the client untouched. The stream
//! handler calls `release` exactly once for every successful `connect`, so
//! stateful directors can pool or count without leaking.

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::backend::BackendRegistry;
use crate::error::RelayError;
use crate::proxy::pool::{ConnPool, PooledConn};
use crate::router::Router;

/// Read-only view of an inbound call, handed to the director.
pub struct InboundCall<'a> {
    /// Full method name without its leading slash (`pkg.Service/Method`).
    pub full_method: &'a str,
    /// First `:authority` value of the call, if any.
    pub authority: Option<&'a str>,
    pub metadata: &'a MetadataMap,
    pub peer: Option<SocketAddr>,
}

/// A director's decision for one call.
#[derive(Debug)]
pub struct Outbound {
    /// Name of the chosen backend, for logging and metrics.
    pub backend: String,
    /// Whether per-call metrics are enabled for this backend.
    pub observed: bool,
    /// Metadata for the outbound stream. `None` tells the handler to
    /// synthesize forwarding metadata from the inbound call; the proxy never
    /// leaks inbound metadata without this decision.
    pub metadata: Option<MetadataMap>,
    pub conn: PooledConn,
}

/// Decides which backend handles a call.
#[tonic::async_trait]
pub trait Director: Send + Sync + 'static {
    /// Return the outbound side of the call, or the rejection the client
    /// should observe.
    async fn connect(&self, call: &InboundCall<'_>) -> Result<Outbound, Status>;

    /// Called exactly once per successful `connect`, with the call's outcome.
    fn release(&self, outbound: Outbound, errored: bool) {
        outbound.conn.release(errored);
    }
}

/// Reference director: immutable route table over the backend registry and
/// connection pool.
pub struct StaticDirector {
    router: Router,
    registry: BackendRegistry,
    pool: Arc<ConnPool>,
}

impl StaticDirector {
    pub fn new(router: Router, registry: BackendRegistry, pool: Arc<ConnPool>) -> Self {
        Self {
            router,
            registry,
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<ConnPool> {
        &self.pool
    }
}

#[tonic::async_trait]
impl Director for StaticDirector {
    async fn connect(&self, call: &InboundCall<'_>) -> Result<Outbound, Status> {
        let backend_name = self
            .router
            .route(call.full_method, call.authority, call.metadata)
            .map_err(Status::from)?;
        let backend = self.registry.get(backend_name).ok_or_else(|| {
            Status::from(RelayError::UnknownBackend {
                name: backend_name.to_string(),
            })
        })?;

        let addr = backend.pick().to_owned();
        let conn = self
            .pool
            .get(&addr, backend.dialer())
            .await
            .map_err(|err| {
                let message = match err {
                    RelayError::BackendUnavailable { message } => message,
                    other => other.to_string(),
                };
                Status::from(RelayError::BackendUnavailable { message })
            })?;

        tracing::debug!(
            method = call.full_method,
            backend = backend.name(),
            %addr,
            "directed call"
        );

        Ok(Outbound {
            backend: backend.name().to_owned(),
            observed: backend.observed(),
            metadata: None,
            conn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BackendConfig, BackendPoolConfig, BalancerPolicy, PoolOptions, ResolverSpec, RouteConfig,
        RouterConfig,
    };
    use crate::backend::StaticResolver;
    use tonic::Code;

    async fn director_with(routes: Vec<RouteConfig>, backends: Vec<BackendConfig>) -> StaticDirector {
        let config = BackendPoolConfig {
            pool: PoolOptions {
                dial_timeout_ms: 200,
                ..PoolOptions::default()
            },
            backends,
        };
        let registry = BackendRegistry::from_config(&config, &StaticResolver)
            .await
            .unwrap();
        let pool = ConnPool::new(config.pool.clone());
        StaticDirector::new(Router::new(RouterConfig { routes }), registry, pool)
    }

    fn static_backend(name: &str, addr: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            resolver: ResolverSpec::Static {
                addresses: vec![addr.to_string()],
            },
            security: None,
            interceptors: Vec::new(),
            balancer: BalancerPolicy::RoundRobin,
            disable_conntracking: false,
        }
    }

    fn catch_all(backend: &str) -> RouteConfig {
        RouteConfig {
            backend_name: backend.to_string(),
            service_name_matcher: "*".to_string(),
            ..RouteConfig::default()
        }
    }

    fn call<'a>(method: &'a str, metadata: &'a MetadataMap) -> InboundCall<'a> {
        InboundCall {
            full_method: method,
            authority: None,
            metadata,
            peer: None,
        }
    }

    #[tokio::test]
    async fn test_route_miss_is_unimplemented() {
        let director = director_with(Vec::new(), Vec::new()).await;
        let md = MetadataMap::new();
        let status = director
            .connect(&call("some.Service/Do", &md))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(status.message(), "unknown route to service");
    }

    #[tokio::test]
    async fn test_route_to_unregistered_backend_is_unimplemented() {
        let director = director_with(vec![catch_all("ghost")], Vec::new()).await;
        let md = MetadataMap::new();
        let status = director
            .connect(&call("some.Service/Do", &md))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(status.message(), "unknown backend");
    }

    #[tokio::test]
    async fn test_dial_failure_is_aborted() {
        // Nothing listens on port 1, so the dial fails inside the timeout.
        let director = director_with(
            vec![catch_all("dead")],
            vec![static_backend("dead", "127.0.0.1:1")],
        )
        .await;
        let md = MetadataMap::new();
        let status = director
            .connect(&call("some.Service/Do", &md))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Aborted);
        assert!(status.message().starts_with("cannot dial backend"));
    }
}
