//! Outbound HTTP client for the backend
//!
//! One pooled client forwards proxied requests; a second client with an
//! empty body type serves readiness probes.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("backend request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("invalid backend address '{0}'")]
    InvalidUri(String),
}

impl PoolError {
    /// True when the backend could not be reached at all
    pub fn is_connect(&self) -> bool {
        matches!(self, PoolError::Client(e) if e.is_connect())
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle keep-alive connections kept to the backend
    pub max_idle_per_host: usize,
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

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    probe_client: Client<HttpConnector, Empty<Bytes>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        // Probes run against a process that may be restarted at any moment,
        // so their connections are never kept around.
        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Backend client ready"
        );

        Self {
            client,
            probe_client,
        }
    }

    /// Send a request to `authority`, keeping method, path, headers and body.
    ///
    /// Redirects are returned to the caller, never followed.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        authority: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = backend_uri(authority, &parts.uri)?;
        // The backend connection is always HTTP/1.1, whatever the client spoke
        parts.version = Version::HTTP_11;

        let response = self.client.request(Request::from_parts(parts, body)).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// GET `path` on `authority`; true if the backend answered at all
    pub async fn check_backend(&self, authority: &str, path: &str) -> bool {
        let uri = format!("http://{}{}", authority, path);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match self.probe_client.request(req).await {
            Ok(response) => {
                debug!(authority, status = %response.status(), "Readiness probe answered");
                true
            }
            Err(_) => false,
        }
    }
}

/// `original`'s path and query, addressed to `authority` over plain HTTP
fn backend_uri(authority: &str, original: &Uri) -> Result<Uri, PoolError> {
    let path = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Uri::builder()
        .scheme("http")
        .authority(authority)
        .path_and_query(path)
        .build()
        .map_err(|_| PoolError::InvalidUri(authority.to_string()))
}
