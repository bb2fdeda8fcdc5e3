//! The forwarding engine
//!
//! `ProxyService` bridges one inbound server-side stream to one outbound
//! client-side stream. It is a plain `tower::Service` over any request path,
//! so it can be installed as a catch-all for unknown services (transparent
//! mode) or under explicit routes. Every call is treated as bidirectional
//! streaming, the superset of all gRPC arities.
//!
//! Two pumps run per call. The inbound pump reads client frames and feeds the
//! outbound request stream; when the client half-closes, dropping the sender
//! half-closes the backend. The bridge drains backend frames into the inbound
//! response stream. Backend headers are forwarded as response metadata before
//! any frame, backend trailers ride the terminal status after the last frame,
//! and the backend's status code and message reach the client verbatim.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{KeyAndValueRef, MetadataMap, MetadataValue};
use tonic::{Code, Request, Response, Status, Streaming};

use crate::error::RelayError;
use crate::metrics;
use crate::proxy::codec::{ProxyCodec, ProxyPayload};
use crate::proxy::director::{Director, InboundCall, Outbound};

/// Tuning for the stream handler.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Frames buffered per pump direction. HTTP/2 flow control is the real
    /// back-pressure; this only bounds proxy-side buffering.
    pub pump_buffer: usize,
    /// Optional cap on a single frame in either direction.
    pub max_frame_size: Option<usize>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            pump_buffer: 16,
            max_frame_size: None,
        }
    }
}

/// The generic proxying service: accepts any `/{service}/{method}` request
/// and forwards it per the director's decision.
pub struct ProxyService<D> {
    director: Arc<D>,
    opts: HandlerOptions,
}

impl<D> Clone for ProxyService<D> {
    fn clone(&self) -> Self {
        Self {
            director: Arc::clone(&self.director),
            opts: self.opts.clone(),
        }
    }
}

impl<D: Director> ProxyService<D> {
    pub fn new(director: Arc<D>) -> Self {
        Self::with_options(director, HandlerOptions::default())
    }

    pub fn with_options(director: Arc<D>, opts: HandlerOptions) -> Self {
        Self { director, opts }
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

impl<D: Director> tower::Service<http::Request<axum::body::Body>> for ProxyService<D> {
    type Response = axum::response::Response;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<axum::body::Body>) -> Self::Future {
        let director = Arc::clone(&self.director);
        let opts = self.opts.clone();
        Box::pin(async move {
            let target = CallTarget::from_request(&req);
            let mut grpc = tonic::server::Grpc::new(ProxyCodec::default())
                .apply_max_message_size_config(opts.max_frame_size, opts.max_frame_size);
            let method = ProxyMethod {
                director,
                target,
                opts,
            };
            let response = grpc.streaming(method, req).await;
            Ok(response.map(axum::body::Body::new))
        })
    }
}

/// What the outer HTTP layer knows about the call before the gRPC machinery
/// takes over: the `:authority` pseudo-header and the peer address are not
/// visible from inside a tonic request.
#[derive(Debug, Clone)]
struct CallTarget {
    path: String,
    authority: Option<String>,
    peer: Option<SocketAddr>,
}

impl CallTarget {
    fn from_request(req: &http::Request<axum::body::Body>) -> Self {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_owned())
            .or_else(|| {
                req.headers()
                    .get(http::header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
            });
        // Served under tonic's transport or axum's connect-info, whichever
        // is present.
        let peer = req
            .extensions()
            .get::<tonic::transport::server::TcpConnectInfo>()
            .and_then(|info| info.remote_addr())
            .or_else(|| {
                req.extensions()
                    .get::<axum::extract::ConnectInfo<SocketAddr>>()
                    .map(|info| info.0)
            });
        Self {
            path: req.uri().path().to_owned(),
            authority,
            peer,
        }
    }
}

struct ProxyMethod<D> {
    director: Arc<D>,
    target: CallTarget,
    opts: HandlerOptions,
}

impl<D: Director> tonic::server::StreamingService<ProxyPayload> for ProxyMethod<D> {
    type Response = ProxyPayload;
    type ResponseStream = ReceiverStream<Result<ProxyPayload, Status>>;
    type Future = BoxFuture<Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<ProxyPayload>>) -> Self::Future {
        let director = Arc::clone(&self.director);
        let target = self.target.clone();
        let opts = self.opts.clone();
        Box::pin(async move { proxy_call(director, target, opts, request).await })
    }
}

async fn proxy_call<D: Director>(
    director: Arc<D>,
    target: CallTarget,
    opts: HandlerOptions,
    request: Request<Streaming<ProxyPayload>>,
) -> Result<Response<ReceiverStream<Result<ProxyPayload, Status>>>, Status> {
    let full_method = parse_full_method(&target.path).ok_or_else(|| {
        Status::from(RelayError::MalformedCall {
            method: target.path.clone(),
        })
    })?;
    let path = PathAndQuery::from_maybe_shared(target.path.clone()).map_err(|_| {
        Status::from(RelayError::MalformedCall {
            method: target.path.clone(),
        })
    })?;

    let inbound_md = request.metadata().clone();
    let inbound = request.into_inner();

    let outbound = director
        .connect(&InboundCall {
            full_method,
            authority: target.authority.as_deref(),
            metadata: &inbound_md,
            peer: target.peer,
        })
        .await?;
    let started = Instant::now();
    if outbound.observed {
        metrics::record_call_started(&outbound.backend);
    }
    tracing::debug!(method = full_method, backend = %outbound.backend, "proxying call");

    let out_md = match outbound.metadata.clone() {
        Some(md) => md,
        None => forwarded_metadata(&inbound_md, target.peer),
    };

    // Inbound pump. It must run before the outbound stream is awaited: the
    // backend may demand request frames before it answers with headers.
    let (req_tx, req_rx) = mpsc::channel::<ProxyPayload>(opts.pump_buffer);
    let s2c = tokio::spawn(pump_inbound(inbound, req_tx));

    let mut grpc = tonic::client::Grpc::new(outbound.conn.channel());
    if let Err(e) = grpc.ready().await {
        s2c.abort();
        finish(&director, outbound, started, Code::Unknown, true);
        return Err(Status::from(RelayError::StreamOpen {
            message: e.to_string(),
        }));
    }

    let mut out_req = Request::new(ReceiverStream::new(req_rx));
    *out_req.metadata_mut() = out_md;

    let backend_resp = match grpc.streaming(out_req, path, ProxyCodec::default()).await {
        Ok(resp) => resp,
        Err(status) => {
            // The backend answered the stream-open with a status of its own
            // (a trailers-only response); forward it untouched.
            s2c.abort();
            finish(&director, outbound, started, status.code(), true);
            return Err(status);
        }
    };

    // Backend headers, available now, become the inbound response metadata
    // and therefore reach the client before any response frame.
    let headers = backend_resp.metadata().clone();
    let backend_stream = backend_resp.into_inner();

    let (resp_tx, resp_rx) = mpsc::channel(opts.pump_buffer);
    tokio::spawn(bridge(
        director,
        outbound,
        started,
        full_method.to_owned(),
        s2c,
        backend_stream,
        resp_tx,
    ));

    let mut response = Response::new(ReceiverStream::new(resp_rx));
    *response.metadata_mut() = headers;
    Ok(response)
}

/// server→client pump: move inbound frames into the outbound request stream.
/// Returning drops the sender, which half-closes the backend's receive side
/// exactly when the inbound side reports end-of-stream.
async fn pump_inbound(
    mut inbound: Streaming<ProxyPayload>,
    tx: mpsc::Sender<ProxyPayload>,
) -> Result<(), Status> {
    while let Some(item) = inbound.next().await {
        let frame = item?;
        if tx.send(frame).await.is_err() {
            // Outbound side is gone; the bridge owns the terminal state.
            break;
        }
    }
    Ok(())
}

/// client→server pump plus call coordinator: drains the backend stream into
/// the inbound response stream, waits for both pumps, and releases the
/// director exactly once with the call's outcome.
async fn bridge<D: Director>(
    director: Arc<D>,
    outbound: Outbound,
    started: Instant,
    method: String,
    mut s2c: JoinHandle<Result<(), Status>>,
    mut backend: Streaming<ProxyPayload>,
    tx: mpsc::Sender<Result<ProxyPayload, Status>>,
) {
    let mut s2c_live = true;
    // Ok(trailers) is a clean backend end-of-stream; Err carries the terminal
    // status and whether it implicates the backend connection itself.
    let terminal: Result<Option<MetadataMap>, (Status, bool)> = loop {
        tokio::select! {
            joined = &mut s2c, if s2c_live => {
                s2c_live = false;
                match joined {
                    // Inbound end-of-stream: half-close already happened via
                    // the dropped sender; keep pumping responses.
                    Ok(Ok(())) => {}
                    Ok(Err(status)) => {
                        break Err((Status::internal(format!("failed proxying s2c: {status}")), true));
                    }
                    Err(join_err) => {
                        break Err((Status::internal(format!("failed proxying s2c: {join_err}")), true));
                    }
                }
            }
            () = tx.closed() => {
                // Inbound side dropped the call; returning tears the backend
                // stream down with it.
                break Err((Status::cancelled("inbound stream closed"), true));
            }
            item = backend.next() => match item {
                Some(Ok(frame)) => {
                    if tx.send(Ok(frame)).await.is_err() {
                        break Err((Status::cancelled("inbound stream closed"), true));
                    }
                }
                Some(Err(status)) => {
                    let suspect = implicates_transport(status.code());
                    break Err((status, suspect));
                }
                None => break backend.trailers().await.map_err(|status| (status, true)),
            }
        }
    };

    if s2c_live {
        s2c.abort();
    }

    match terminal {
        Ok(trailers) => {
            if let Some(md) = trailers {
                // Clean close with trailing metadata: ride a Code::Ok status
                // so the trailers reach the wire after the last frame.
                let _ = tx.send(Err(Status::with_metadata(Code::Ok, "", md))).await;
            }
            tracing::debug!(method = %method, backend = %outbound.backend, "proxied call complete");
            finish(&director, outbound, started, Code::Ok, false);
        }
        Err((status, suspect)) => {
            tracing::debug!(
                method = %method,
                backend = %outbound.backend,
                code = ?status.code(),
                "proxied call terminated with status"
            );
            let code = status.code();
            let _ = tx.send(Err(status)).await;
            finish(&director, outbound, started, code, suspect);
        }
    }
}

fn finish<D: Director>(
    director: &Arc<D>,
    outbound: Outbound,
    started: Instant,
    code: Code,
    errored: bool,
) {
    if outbound.observed {
        metrics::record_call_handled(&outbound.backend, &format!("{code:?}"), started.elapsed());
    }
    director.release(outbound, errored);
}

/// Statuses that suggest the backend connection itself is unhealthy, as
/// opposed to an application-level error on a healthy stream.
fn implicates_transport(code: Code) -> bool {
    matches!(code, Code::Unavailable | Code::Unknown | Code::DataLoss)
}

/// `/pkg.Service/Method` → `pkg.Service/Method`; `None` when the path has no
/// service/method separator.
fn parse_full_method(path: &str) -> Option<&str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    trimmed.contains('/').then_some(trimmed)
}

/// Forwarding metadata synthesized when the director supplies none: a copy of
/// the inbound application metadata plus an `x-forwarded-for` entry with the
/// peer address. Reserved transport headers stay behind.
fn forwarded_metadata(inbound: &MetadataMap, peer: Option<SocketAddr>) -> MetadataMap {
    let mut out = MetadataMap::new();
    for entry in inbound.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => {
                if !is_reserved_key(key.as_str()) {
                    out.append(key.clone(), value.clone());
                }
            }
            KeyAndValueRef::Binary(key, value) => {
                out.append_bin(key.clone(), value.clone());
            }
        }
    }
    let source = peer
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_owned());
    let value = MetadataValue::try_from(source.as_str())
        .unwrap_or_else(|_| MetadataValue::from_static("unknown"));
    out.append("x-forwarded-for", value);
    out
}

fn is_reserved_key(key: &str) -> bool {
    matches!(key, "content-type" | "te" | "user-agent") || key.starts_with("grpc-")
}
