//! Loopback HTTP/1.1 forward proxy.
//!
//! Three request classes are handled:
//! - origin-form `GET /_claude_proxy/health`, answered from local state;
//! - `CONNECT host:port`, dialed through the injected [`Dialer`] and spliced;
//! - absolute-form requests, dialed, rewritten to origin-form and forwarded.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::Router;
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tower::ServiceExt;

use crate::error::ProxyError;
use crate::socks::Dialer;

pub const HEALTH_PATH: &str = "/_claude_proxy/health";

/// Extra time granted after the abort signal for tasks to unwind.
const ABORT_SETTLE: Duration = Duration::from_secs(1);

struct ProxyState {
    instance_id: String,
    dialer: Arc<dyn Dialer>,
    tracker: Arc<ConnTracker>,
    shutdown: watch::Receiver<bool>,
    abort: watch::Receiver<bool>,
}

/// Counts live connections and CONNECT splices.
#[derive(Default)]
struct ConnTracker {
    active: AtomicUsize,
    idle: Notify,
}

struct ConnGuard(Arc<ConnTracker>);

impl ConnTracker {
    fn guard(self: &Arc<Self>) -> ConnGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnGuard(Arc::clone(self))
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Resolves once the flag turns true (or its sender is gone).
async fn flagged(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

/// A running proxy. Serving happens on background tasks.
pub struct HttpProxy {
    local_addr: SocketAddr,
    instance_id: String,
    tracker: Arc<ConnTracker>,
    shutdown_tx: watch::Sender<bool>,
    abort_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HttpProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProxy")
            .field("local_addr", &self.local_addr)
            .field("instance_id", &self.instance_id)
            .field("active", &self.tracker.active())
            .finish()
    }
}

impl HttpProxy {
    /// Bind `addr` and start serving.
    pub async fn start(
        addr: SocketAddr,
        dialer: Arc<dyn Dialer>,
        instance_id: impl Into<String>,
    ) -> Result<Self, ProxyError> {
        let bind_err = |source| ProxyError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        let instance_id = instance_id.into();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (abort_tx, abort_rx) = watch::channel(false);
        let tracker = Arc::new(ConnTracker::default());
        let state = Arc::new(ProxyState {
            instance_id: instance_id.clone(),
            dialer,
            tracker: Arc::clone(&tracker),
            shutdown: shutdown_rx,
            abort: abort_rx,
        });

        let accept_task = tokio::spawn(accept_loop(listener, state));
        tracing::info!(
            target = "claude_proxy::proxy",
            addr = %local_addr,
            instance_id = %instance_id,
            "http proxy listening"
        );

        Ok(Self {
            local_addr,
            instance_id,
            tracker,
            shutdown_tx,
            abort_tx,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Connections and tunnels currently open.
    pub fn active_connections(&self) -> usize {
        self.tracker.active()
    }

    /// Stop accepting, let open connections and tunnels drain for up to
    /// `grace`, then abort whatever is left. Idempotent.
    pub async fn close(&self, grace: Duration) {
        self.shutdown_tx.send_replace(true);
        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }

        if tokio::time::timeout(grace, self.tracker.wait_idle())
            .await
            .is_err()
        {
            tracing::debug!(
                target = "claude_proxy::proxy",
                active = self.tracker.active(),
                "grace period elapsed, aborting open tunnels"
            );
            self.abort_tx.send_replace(true);
            let _ = tokio::time::timeout(ABORT_SETTLE, self.tracker.wait_idle()).await;
        }
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ProxyState>) {
    let router = health_router(Arc::clone(&state));
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(target = "claude_proxy::proxy", error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
            _ = flagged(state.shutdown.clone()) => break,
        };
        let _ = stream.set_nodelay(true);
        let guard = state.tracker.guard();
        tokio::spawn(serve_connection(
            stream,
            peer,
            Arc::clone(&state),
            router.clone(),
            guard,
        ));
    }
    tracing::debug!(target = "claude_proxy::proxy", "accept loop stopped");
}

fn health_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route(HEALTH_PATH, axum::routing::get(health))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state)
}

async fn health(State(state): State<Arc<ProxyState>>) -> axum::Json<Value> {
    axum::Json(json!({ "ok": true, "instanceId": state.instance_id }))
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ProxyState>,
    router: Router,
    _guard: ConnGuard,
) {
    let svc_state = Arc::clone(&state);
    let svc = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&svc_state);
        let router = router.clone();
        async move { Ok::<_, Infallible>(dispatch(state, router, req).await) }
    });

    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), svc)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(err) = result {
                tracing::debug!(target = "claude_proxy::proxy", peer = %peer, error = %err, "connection error");
            }
        }
        _ = flagged(state.shutdown.clone()) => {
            conn.as_mut().graceful_shutdown();
            tokio::select! {
                _ = conn.as_mut() => {}
                _ = flagged(state.abort.clone()) => {}
            }
        }
    }
}

async fn dispatch(state: Arc<ProxyState>, router: Router, req: Request<Incoming>) -> Response<Body> {
    if req.method() == Method::CONNECT {
        return tunnel(state, req).await;
    }
    if req.uri().authority().is_some() {
        return forward(state, req).await;
    }
    match router.oneshot(req.map(Body::new)).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

fn status_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response
}

fn dial_failed(addr: &str, source: std::io::Error) -> Response<Body> {
    let err = ProxyError::DialUpstream {
        addr: addr.to_string(),
        source,
    };
    tracing::warn!(target = "claude_proxy::proxy", error = %err, "upstream dial failed");
    status_response(StatusCode::BAD_GATEWAY, &err.to_string())
}

async fn tunnel(state: Arc<ProxyState>, mut req: Request<Incoming>) -> Response<Body> {
    let Some(addr) = req.uri().authority().map(|a| a.to_string()) else {
        return status_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
    };

    let mut upstream = match state.dialer.dial("tcp", &addr).await {
        Ok(stream) => stream,
        Err(err) => return dial_failed(&addr, err),
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    let guard = state.tracker.guard();
    let abort = state.abort.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::debug!(target = "claude_proxy::proxy", addr = %addr, error = %err, "upgrade failed");
                return;
            }
        };
        let mut client = TokioIo::new(upgraded);
        tokio::select! {
            copied = tokio::io::copy_bidirectional(&mut client, &mut upstream) => match copied {
                Ok((up, down)) => tracing::debug!(
                    target = "claude_proxy::proxy",
                    addr = %addr,
                    bytes_up = up,
                    bytes_down = down,
                    "tunnel closed"
                ),
                Err(err) => tracing::debug!(target = "claude_proxy::proxy", addr = %addr, error = %err, "tunnel ended"),
            },
            _ = flagged(abort) => {
                tracing::debug!(target = "claude_proxy::proxy", addr = %addr, "tunnel aborted");
            }
        }
    });

    let mut response = Response::new(Body::empty());
    response
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
    response
}

async fn forward(state: Arc<ProxyState>, mut req: Request<Incoming>) -> Response<Body> {
    let Some(authority) = req.uri().authority().cloned() else {
        return status_response(StatusCode::BAD_REQUEST, "missing request authority");
    };
    match req.uri().scheme_str() {
        None | Some("http") => {}
        Some(scheme) => {
            tracing::debug!(target = "claude_proxy::proxy", %scheme, "refusing non-http forward");
            return status_response(
                StatusCode::BAD_REQUEST,
                &format!("{scheme} requests must use CONNECT"),
            );
        }
    }
    let addr = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));

    let stream = match state.dialer.dial("tcp", &addr).await {
        Ok(stream) => stream,
        Err(err) => return dial_failed(&addr, err),
    };

    let (mut sender, conn) = match hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await
    {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!(target = "claude_proxy::proxy", addr = %addr, error = %err, "upstream handshake failed");
            return status_response(StatusCode::BAD_GATEWAY, "upstream handshake failed");
        }
    };
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!(target = "claude_proxy::proxy", error = %err, "upstream connection error");
        }
    });

    let origin_form = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse::<Uri>()
        .unwrap_or_else(|_| Uri::from_static("/"));
    *req.uri_mut() = origin_form;
    strip_hop_by_hop(req.headers_mut());
    if !req.headers().contains_key(header::HOST) {
        if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
            req.headers_mut().insert(header::HOST, host);
        }
    }

    match sender.send_request(req).await {
        Ok(response) => {
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            Response::from_parts(parts, Body::new(body))
        }
        Err(err) => {
            tracing::warn!(target = "claude_proxy::proxy", addr = %addr, error = %err, "upstream request failed");
            status_response(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
    }
}

/// Remove `Connection` (and every header it names), `Keep-Alive`,
/// `Proxy-*`, `TE`, `Trailer`, `Transfer-Encoding` and `Upgrade`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }

    for name in [
        header::CONNECTION,
        HeaderName::from_static("keep-alive"),
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }

    let proxy_headers: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("proxy-"))
        .cloned()
        .collect();
    for name in proxy_headers {
        headers.remove(name);
    }
}
