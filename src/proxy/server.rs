//! Proxy registration and serving
//!
//! Two registration modes, usable together:
//!
//! - **Transparent**: the proxy is the fallback for every method the process
//!   does not serve itself, so unknown services are forwarded.
//! - **Explicit**: the proxy is registered for a named service and a list of
//!   methods, letting an embedding process serve some methods natively and
//!   proxy only the listed ones.

use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;

use crate::proxy::director::Director;
use crate::proxy::handler::ProxyService;

struct Registration {
    service: String,
    methods: Vec<String>,
}

/// Builder wiring a [`ProxyService`] into a served router.
pub struct ProxyServer<D> {
    service: ProxyService<D>,
    registrations: Vec<Registration>,
    transparent: bool,
}

impl<D: Director> ProxyServer<D> {
    /// A transparent proxy: every unknown method is forwarded.
    pub fn new(service: ProxyService<D>) -> Self {
        Self {
            service,
            registrations: Vec::new(),
            transparent: true,
        }
    }

    /// Toggle transparent mode. With it off, only explicitly registered
    /// methods are proxied and everything else is answered `unimplemented`.
    pub fn transparent(mut self, enabled: bool) -> Self {
        self.transparent = enabled;
        self
    }

    /// Register the proxy for the listed methods of one service, as if they
    /// were locally implemented handlers.
    pub fn register_service(
        mut self,
        service: impl Into<String>,
        methods: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.registrations.push(Registration {
            service: service.into(),
            methods: methods.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Build the axum router. Exposed so embedders can merge their own
    /// services next to the proxied ones.
    pub fn into_router(self) -> Router {
        let mut router = Router::new();
        for registration in &self.registrations {
            for method in &registration.methods {
                let path = format!("/{}/{}", registration.service, method);
                router = router.route_service(&path, self.service.clone());
            }
        }
        if self.transparent {
            router = router.fallback_service(self.service.clone());
        } else {
            router = router.fallback(unknown_service);
        }
        router
    }

    /// Bind `addr` and serve until `shutdown` resolves.
    pub async fn serve(
        self,
        addr: SocketAddr,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind relay listener on {addr}"))?;
        tracing::info!(%addr, "starting relay server");
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve_on(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let router = self.into_router();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .context("relay server error")?;
        Ok(())
    }
}

/// Trailers-only `unimplemented` reply for non-transparent mode, matching
/// what a gRPC server answers for unregistered methods.
async fn unknown_service() -> axum::response::Response {
    http::Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/grpc")
        .header("grpc-status", (tonic::Code::Unimplemented as i32).to_string())
        .header("grpc-message", "unknown service")
        .body(axum::body::Body::empty())
        .expect("static response must build")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_service_reply_shape() {
        let response = unknown_service().await;
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(
            response.headers().get("grpc-status").unwrap(),
            &(tonic::Code::Unimplemented as i32).to_string()
        );
        assert_eq!(
            response.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "application/grpc"
        );
    }
}
