//! Connection pool for upstream HTTP connections
//!
//! One pooled client is shared by every dispatched request so keep-alive
//! connections to the backends are reused across clients.

use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to backend servers
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self { client, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Send a request to `host:port`, keeping method, path, query, headers
    /// and body as received
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        host: &str,
        port: u16,
    ) -> Result<Response<Incoming>, PoolError> {
        let uri = upstream_uri(host, port, &req);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        Ok(self.client.request(upstream_req).await?)
    }
}

/// Absolute upstream URI for an incoming request
pub fn upstream_uri<B>(host: &str, port: u16, req: &Request<B>) -> String {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("http://{}:{}{}", host, port, path_and_query)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_creation() {
        let config = PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        };

        let pool = ConnectionPool::new(config);
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.config().idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_upstream_uri_keeps_path_and_query() {
        let req = Request::builder()
            .uri("/v1/chat/completions?stream=true&x=1")
            .body(())
            .unwrap();
        assert_eq!(
            upstream_uri("127.0.0.1", 8317, &req),
            "http://127.0.0.1:8317/v1/chat/completions?stream=true&x=1"
        );
    }
}
