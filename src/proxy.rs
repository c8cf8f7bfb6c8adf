use crate::error::{json_error_response, ProxyErrorCode, SupervisorError};
use crate::git::{self, GitHandler, GIT_ACTION_PATH};
use crate::process::{BackendState, Supervisor};
use crate::startup::{render_html, Outcome, StartupSession, StartupStream};
use futures::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Response header the backend sets to ask for a restart
pub const RELOAD_HEADER: &str = "x-lume-cms";
const RELOAD_VALUE: &str = "reload";

/// Request routing state, derived from the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// No backend; the next request boots one
    Cold,
    /// Backend spawned, not yet answering
    Booting,
    /// Requests are forwarded
    Live,
    /// Boot failures tripped the circuit breaker
    Error,
}

impl From<BackendState> for ProxyState {
    fn from(state: BackendState) -> Self {
        match state {
            BackendState::Stopped => ProxyState::Cold,
            BackendState::Starting => ProxyState::Booting,
            BackendState::Ready => ProxyState::Live,
            BackendState::Failed => ProxyState::Error,
        }
    }
}

#[derive(Clone)]
struct Context {
    supervisor: Arc<Supervisor>,
    git: Option<Arc<dyn GitHandler>>,
}

/// The public-facing proxy in front of the lazily started backend
pub struct ProxyServer {
    bind_addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    git: Option<Arc<dyn GitHandler>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            supervisor,
            git: None,
            shutdown_rx,
        }
    }

    /// Accept `POST <base_path>/_git` and hand it to `handler`
    pub fn with_git_handler(mut self, handler: Arc<dyn GitHandler>) -> Self {
        self.git = Some(handler);
        self
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let context = Context {
            supervisor: Arc::clone(&self.supervisor),
            git: self.git.clone(),
        };

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = context.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
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
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, context: Context) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = context.clone();
        async move { handle_request(req, context, addr).await }
    });

    // HTTP/1.1 connections can still upgrade to WebSocket
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    context: Context,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let supervisor = context.supervisor;

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite rather than append: this proxy is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    if let Some(ref handler) = context.git {
        if is_git_action(&req, &supervisor.config().base_path) {
            return Ok(git::handle_git_action(req, &supervisor, handler.as_ref()).await);
        }
    }

    let websocket = is_websocket_upgrade(&req);

    match ProxyState::from(supervisor.state()) {
        ProxyState::Live => {}
        _ if websocket => {
            return Ok(json_error_response(
                ProxyErrorCode::BackendStarting,
                "Backend is starting, reconnect once it is ready",
            ));
        }
        _ => return Ok(start_backend(&supervisor)),
    }

    let Some(generation) = supervisor.generation() else {
        return Ok(start_backend(&supervisor));
    };
    supervisor.touch();

    if websocket {
        return Ok(handle_websocket(req, &supervisor, &request_id));
    }

    Ok(forward(req, &supervisor, generation, &request_id).await)
}

/// Kick off (or join) a boot and answer with its progress page
fn start_backend(supervisor: &Arc<Supervisor>) -> Response<BoxBody<Bytes, hyper::Error>> {
    match supervisor.start() {
        Ok(activation) => {
            if activation.spawned {
                info!(generation = activation.generation, "Cold request, backend starting");
            }
            progress_response(activation.session.subscribe())
        }
        Err(e @ SupervisorError::CircuitOpen { .. }) => {
            warn!(error = %e, "Refusing to start backend");
            json_error_response(ProxyErrorCode::BackendStartFailed, e.to_string())
        }
        Err(e) => {
            error!(error = %e, "Failed to start backend");
            let session = StartupSession::new();
            session.append_line(&format!("Error: {}", e));
            session.close(Outcome::Failed(e.to_string()));
            progress_response(session.subscribe())
        }
    }
}

/// `200 text/html` streaming the boot log as it grows.
///
/// A relay task drives the page. It ends, releasing the subscription, as
/// soon as the client goes away.
fn progress_response(reader: StartupStream) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(16);

    tokio::spawn(async move {
        let mut page = std::pin::pin!(render_html(reader));
        loop {
            tokio::select! {
                chunk = page.next() => match chunk {
                    Some(chunk) => {
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tx.closed() => {
                    debug!("Progress page abandoned by client");
                    break;
                }
            }
        }
    });

    let frames = futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
        .map(|chunk| Ok::<_, hyper::Error>(Frame::data(chunk)));

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(hyper::header::CACHE_CONTROL, "no-store")
        .body(BodyExt::boxed(StreamBody::new(frames)))
        .expect("valid response builder")
}

/// Register a client socket with the broadcaster and complete the handshake
fn handle_websocket(
    mut req: Request<Incoming>,
    supervisor: &Supervisor,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(key) = req.headers().get(hyper::header::SEC_WEBSOCKET_KEY).cloned() else {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .header(hyper::header::CONTENT_TYPE, "text/plain")
            .body(
                Full::new(Bytes::from("Missing Sec-WebSocket-Key"))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .expect("valid response builder");
    };

    let downstream = match supervisor.broadcaster().attach_downstream() {
        Ok(downstream) => downstream,
        Err(e) => {
            debug!(request_id, error = %e, "No upstream for client socket");
            return json_error_response(
                ProxyErrorCode::BackendStarting,
                "Backend is restarting, reconnect shortly",
            );
        }
    };

    let accept = derive_accept_key(key.as_bytes());
    let on_upgrade = hyper::upgrade::on(&mut req);
    let id = downstream.id();
    let request_id = request_id.to_string();

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                debug!(id, request_id, "Client socket upgraded");
                let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                crate::broadcast::serve_downstream(downstream, ws).await;
            }
            Err(e) => {
                warn!(id, request_id, error = %e, "Client socket upgrade failed");
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::CONNECTION, "Upgrade")
        .header(hyper::header::UPGRADE, "websocket")
        .header(hyper::header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

async fn forward(
    mut req: Request<Incoming>,
    supervisor: &Supervisor,
    generation: u64,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let config = supervisor.config();
    let authority = config.authority();
    let request_timeout = config.request_timeout();

    rewrite_for_backend(req.headers_mut(), &authority);

    let result =
        tokio::time::timeout(request_timeout, supervisor.pool().send_request(req, &authority)).await;

    match result {
        Ok(Ok(response)) if is_reload_signal(response.headers()) => {
            info!(generation, request_id, "Backend requested a reload");
            reload_response(response, supervisor, generation).await
        }
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(authority = %authority, request_id, error = %e, "Failed to forward request");
            if e.is_connect() {
                let err = SupervisorError::UpstreamUnavailable(e.to_string());
                supervisor.invalidate(generation, &err.to_string());
            }
            json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
        }
        Err(_) => {
            warn!(
                authority = %authority,
                request_id,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", request_timeout.as_secs()),
            )
        }
    }
}

/// Deliver the response in full, with the backend already torn down
async fn reload_response(
    response: Response<BoxBody<Bytes, hyper::Error>>,
    supervisor: &Supervisor,
    generation: u64,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (parts, body) = response.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read reload response body");
            Bytes::new()
        }
    };

    supervisor.invalidate(generation, "reload requested");

    Response::from_parts(parts, Full::new(body).map_err(|never| match never {}).boxed())
}

/// Point `host` and `origin` at the backend's own address
fn rewrite_for_backend(headers: &mut HeaderMap, authority: &str) {
    if let Ok(host) = HeaderValue::from_str(authority) {
        headers.insert(hyper::header::HOST, host);
    }
    if let Ok(origin) = HeaderValue::from_str(&format!("http://{}", authority)) {
        headers.insert(hyper::header::ORIGIN, origin);
    }
}

fn is_reload_signal(headers: &HeaderMap) -> bool {
    headers
        .get(RELOAD_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(RELOAD_VALUE))
}

fn is_git_action<B>(req: &Request<B>, base_path: &str) -> bool {
    req.method() == Method::POST
        && req
            .uri()
            .path()
            .strip_prefix(base_path)
            .is_some_and(|rest| rest == GIT_ACTION_PATH)
}

/// Check if a request is a WebSocket upgrade request
fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let is_websocket = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    has_upgrade_connection && is_websocket
}
