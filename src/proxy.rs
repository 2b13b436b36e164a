//! Round-robin HTTP load balancer
//!
//! Every request is forwarded unmodified to the next backend in the rotation.
//! There is no retry: if the chosen backend cannot be reached or does not
//! answer in time the client gets a 502, and the next request moves on to the
//! next backend anyway.
//!
//! The request timeout bounds the wait for the response head and then every
//! gap between body frames, so long streamed responses keep flowing while a
//! backend that stalls mid-body is cut off.

use crate::balancer::RoundRobin;
use crate::error::{proxy_error_response, BodyError, ProxyBody, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Shared state for every connection the balancer serves
struct Dispatcher {
    rotation: Arc<RoundRobin>,
    pool: ConnectionPool,
    upstream_host: String,
    request_timeout: Duration,
}

/// The load balancer server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    rotation: Arc<RoundRobin>,
    request_timeout: Duration,
    upstream_host: String,
    pool_config: PoolConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        rotation: Arc<RoundRobin>,
        request_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            rotation,
            request_timeout,
            upstream_host: "127.0.0.1".to_string(),
            pool_config: PoolConfig::default(),
            shutdown_rx,
        }
    }

    pub fn with_pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    /// Host the backends listen on
    pub fn with_upstream_host(mut self, host: impl Into<String>) -> Self {
        self.upstream_host = host.into();
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            backends = self.rotation.len(),
            upstream_host = %self.upstream_host,
            "Load balancer listening (HTTP/1.1 and HTTP/2)"
        );

        let dispatcher = Arc::new(Dispatcher {
            rotation: self.rotation,
            pool: ConnectionPool::new(self.pool_config),
            upstream_host: self.upstream_host,
            request_timeout: self.request_timeout,
        });
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&dispatcher);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, dispatcher).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Load balancer shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { handle_request(req, dispatcher, addr).await }
    });

    // A client disconnect drops the service future, which drops the
    // in-flight upstream request with it
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    dispatcher: Arc<Dispatcher>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    // Only used to correlate log lines; never added to the forwarded request
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(selection) = dispatcher.rotation.next() else {
        warn!(request_id, "No backends configured");
        return Ok(proxy_error_response(
            ProxyErrorCode::NoBackends,
            "No backends configured",
        ));
    };
    let id = selection.target.id;
    let port = selection.target.port;

    debug!(
        request_id,
        client = %client_addr,
        method = %req.method(),
        uri = %req.uri(),
        backend = %id,
        port,
        "Dispatching request"
    );

    let timeout = dispatcher.request_timeout;
    let result = tokio::time::timeout(
        timeout,
        dispatcher
            .pool
            .send_request(req, &dispatcher.upstream_host, port),
    )
    .await;

    match result {
        Ok(Ok(response)) => {
            debug!(request_id, backend = %id, status = %response.status(), "Upstream responded");
            Ok(response.map(|body| IdleTimeoutBody::new(body, timeout, id).boxed()))
        }
        Ok(Err(e)) => {
            error!(request_id, backend = %id, port, error = %e, "Failed to forward request");
            Ok(proxy_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Bad Gateway",
            ))
        }
        Err(_) => {
            warn!(
                request_id,
                backend = %id,
                port,
                timeout_secs = timeout.as_secs(),
                "Upstream request timed out"
            );
            Ok(proxy_error_response(
                ProxyErrorCode::UpstreamTimeout,
                "Bad Gateway",
            ))
        }
    }
}

/// Upstream body that fails once no frame has arrived for `idle_timeout`
///
/// The error makes hyper abort the client response, which releases both the
/// client connection and the upstream one.
struct IdleTimeoutBody {
    inner: Incoming,
    idle_timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    backend: String,
    expired: bool,
}

impl IdleTimeoutBody {
    fn new(inner: Incoming, idle_timeout: Duration, backend: String) -> Self {
        Self {
            inner,
            idle_timeout,
            deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            backend,
            expired: false,
        }
    }
}

impl Body for IdleTimeoutBody {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.expired {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(frame) => {
                this.deadline.as_mut().reset(Instant::now() + this.idle_timeout);
                Poll::Ready(frame.map(|result| result.map_err(BodyError::from)))
            }
            Poll::Pending => {
                if this.deadline.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
                this.expired = true;
                warn!(
                    backend = %this.backend,
                    timeout_ms = this.idle_timeout.as_millis() as u64,
                    "Upstream body stalled, aborting response"
                );
                Poll::Ready(Some(Err(BodyError::IdleTimeout(this.idle_timeout))))
            }
        }
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }
}
