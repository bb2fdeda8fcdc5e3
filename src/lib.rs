//! grpc-relay - Transparent gRPC proxy
//!
//! A proxy that accepts bidirectional streaming RPCs it does not itself
//! implement, picks a backend per call, and forwards message frames both ways
//! without deserializing them. Headers, trailers, status codes, half-close and
//! back-pressure pass through unchanged, so a caller cannot tell whether it is
//! talking to the relay or to the backend directly.

pub mod backend;
pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod router;

pub use backend::{Backend, BackendRegistry, Resolver, StaticResolver};
pub use config::{BackendConfig, BackendPoolConfig, PoolOptions, RouteConfig, RouterConfig};
pub use error::{RelayError, RelayResult};
pub use proxy::codec::{Frame, Payload, RawCodec};
pub use proxy::director::{Director, InboundCall, Outbound, StaticDirector};
pub use proxy::handler::{HandlerOptions, ProxyService};
pub use proxy::pool::{ConnPool, Dialer, PooledConn};
pub use proxy::server::ProxyServer;
pub use router::Router;
