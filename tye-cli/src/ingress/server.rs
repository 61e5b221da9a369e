use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tye_core::ingress::{IngressDescription, IngressRoutes};
use tye_core::service::Application;

use super::forward;
use super::resolver::RoundRobinResolver;

/// Host every ingress target is reached on.
const TARGET_HOST: &str = "localhost";

#[derive(Clone)]
struct IngressState {
    name: Arc<str>,
    app: Arc<Application>,
    routes: Arc<IngressRoutes>,
    client: reqwest::Client,
    resolver: RoundRobinResolver,
    token: CancellationToken,
}

impl IngressState {
    /// First published port of `service`.
    fn target_port(&self, service: &str) -> Option<u16> {
        self.app
            .service(service)?
            .description()
            .bindings
            .iter()
            .find_map(|b| b.port)
    }
}

/// One ingress: a listener per binding, all sharing one rule set.
pub struct IngressServer {
    state: IngressState,
    listeners: Vec<TcpListener>,
}

impl IngressServer {
    pub async fn bind(
        app: Arc<Application>,
        description: &IngressDescription,
        token: CancellationToken,
    ) -> anyhow::Result<Self> {
        let routes = IngressRoutes::compile(description)
            .with_context(|| format!("invalid rules for ingress '{}'", description.name))?;

        let resolver = RoundRobinResolver::new();
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .dns_resolver(Arc::new(resolver.clone()))
            .build()
            .context("failed to build ingress client")?;

        let mut listeners = Vec::new();
        for binding in &description.bindings {
            let Some(port) = binding.port else {
                warn!(ingress = %description.name, "ingress binding without a port ignored");
                continue;
            };
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind ingress '{}' on {}", description.name, addr))?;
            listeners.push(listener);
        }

        Ok(Self {
            state: IngressState {
                name: Arc::from(description.name.as_str()),
                app,
                routes: Arc::new(routes),
                client,
                resolver,
                token,
            },
            listeners,
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Serve every listener until the token fires.
    pub fn spawn(self, tasks: &mut JoinSet<()>) {
        let router = Router::new()
            .fallback(handle)
            .with_state(self.state.clone());
        for listener in self.listeners {
            let name = self.state.name.clone();
            let token = self.state.token.clone();
            let router = router.clone();
            tasks.spawn(async move {
                let addr = listener.local_addr().ok();
                info!(ingress = %name, addr = ?addr, "ingress listening");
                let server = axum::serve(
                    listener,
                    router.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(async move { token.cancelled().await });
                if let Err(e) = server.await {
                    warn!(ingress = %name, error = %e, "ingress server failed");
                }
                debug!(ingress = %name, "ingress stopped");
            });
        }
    }
}

async fn handle(
    State(state): State<IngressState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    upgrade: Option<WebSocketUpgrade>,
    request: Request,
) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_owned);
    let path = request.uri().path().to_string();

    let Some(rule) = state.routes.route(host.as_deref(), &path) else {
        debug!(ingress = %state.name, host = ?host, %path, "no matching rule");
        return (StatusCode::NOT_FOUND, "no ingress rule matched").into_response();
    };
    let Some(port) = state.target_port(&rule.service) else {
        warn!(ingress = %state.name, service = %rule.service, "target service has no published port");
        return StatusCode::BAD_GATEWAY.into_response();
    };
    let target = rule.rewrite(&path, request.uri().query());
    debug!(ingress = %state.name, service = %rule.service, %target, "routing");

    match upgrade {
        Some(upgrade) => websocket(state, upgrade, port, target).await,
        None => forward_http(state, peer, port, target, request).await,
    }
}

async fn forward_http(
    state: IngressState,
    peer: SocketAddr,
    port: u16,
    target: String,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let headers = forward::request_headers(&parts.headers, parts.version, peer.ip());
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "failed to read request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let url = format!("http://{}:{}{}", TARGET_HOST, port, target);
    let upstream = match state
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            if e.is_connect() {
                state.resolver.evict(TARGET_HOST);
            }
            warn!(ingress = %state.name, %url, error = %e, "upstream request failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    forward::copy_response_headers(&upstream_headers, response.headers_mut());
    response
}

async fn websocket(state: IngressState, upgrade: WebSocketUpgrade, port: u16, target: String) -> Response {
    let url = format!("ws://{}:{}{}", TARGET_HOST, port, target);
    let upstream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!(ingress = %state.name, %url, error = %e, "upstream websocket failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    upgrade.on_upgrade(move |socket| async move {
        bridge(socket, upstream, state.token.clone()).await;
        debug!(ingress = %state.name, %url, "websocket closed");
    })
}

/// Pump frames both ways until either side closes.
async fn bridge<S>(socket: WebSocket, upstream: S, token: CancellationToken)
where
    S: futures_util::Stream<Item = Result<UpstreamMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<UpstreamMessage>
        + Unpin,
{
    let (mut client_tx, mut client_rx) = socket.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let inbound = async {
        while let Some(Ok(message)) = client_rx.next().await {
            if upstream_tx.send(to_upstream(message)).await.is_err() {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };
    let outbound = async {
        while let Some(Ok(message)) = upstream_rx.next().await {
            let Some(message) = from_upstream(message) else {
                continue;
            };
            if client_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = inbound => {}
        _ = outbound => {}
        _ = token.cancelled() => {}
    }
}

fn to_upstream(message: Message) -> UpstreamMessage {
    match message {
        Message::Text(text) => UpstreamMessage::Text(text),
        Message::Binary(data) => UpstreamMessage::Binary(data),
        Message::Ping(data) => UpstreamMessage::Ping(data),
        Message::Pong(data) => UpstreamMessage::Pong(data),
        Message::Close(frame) => UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
            code: f.code.into(),
            reason: f.reason,
        })),
    }
}

fn from_upstream(message: UpstreamMessage) -> Option<Message> {
    Some(match message {
        UpstreamMessage::Text(text) => Message::Text(text),
        UpstreamMessage::Binary(data) => Message::Binary(data),
        UpstreamMessage::Ping(data) => Message::Ping(data),
        UpstreamMessage::Pong(data) => Message::Pong(data),
        UpstreamMessage::Close(frame) => Message::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason,
        })),
        UpstreamMessage::Frame(_) => return None,
    })
}
