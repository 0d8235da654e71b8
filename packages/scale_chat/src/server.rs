//! Server assembly: listeners, routers, dispatcher and distribution bridge.

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::distribution::{Backbone, BridgeTasks, DistributionBridge, RedisBackbone};
use crate::handlers::{self, InternalState};
use crate::metrics::ServerMetrics;
use crate::relay::Relay;

/// How long shutdown waits for connection handlers to send their close frames.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Custom span maker that attaches a unique request ID to every HTTP request span.
#[derive(Clone, Copy)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

/// Public router: WebSocket upgrades only.
pub fn chat_router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/ws", get(handlers::lobby_websocket_handler))
        .route("/ws/{room}", get(handlers::room_websocket_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(relay)
}

/// Internal router: metrics and health, meant for the operator network only.
pub fn internal_router(state: InternalState) -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .route("/metrics/json", get(handlers::metrics_json_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(state)
}

/// A relay instance ready to start.
pub struct ChatServer {
    config: ChatConfig,
    backbone: Option<Arc<dyn Backbone>>,
    prometheus: Option<PrometheusHandle>,
}

impl ChatServer {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            config,
            backbone: None,
            prometheus: None,
        }
    }

    /// Use this backbone instead of connecting to Redis. Only consulted when
    /// distribution is enabled.
    pub fn with_backbone(mut self, backbone: Arc<dyn Backbone>) -> Self {
        self.backbone = Some(backbone);
        self
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Bind both listeners, connect the bridge (if enabled) and spawn every
    /// long-lived task. Errors here are fatal configuration, bind or backbone
    /// failures.
    pub async fn start(self) -> Result<RunningServer> {
        let ChatServer {
            config,
            backbone,
            prometheus,
        } = self;

        let chat_listener = TcpListener::bind(config.chat_addr)
            .await
            .with_context(|| format!("could not listen on chat address {}", config.chat_addr))?;
        let internal_listener = TcpListener::bind(config.internal_addr)
            .await
            .with_context(|| {
                format!("could not listen on internal address {}", config.internal_addr)
            })?;
        let chat_addr = chat_listener.local_addr()?;
        let internal_addr = internal_listener.local_addr()?;

        let metrics = Arc::new(ServerMetrics::new());
        let (relay, inbound_rx) = Relay::new(&config.relay, metrics.clone());
        let mut dispatcher = relay.dispatcher();

        let bridge = match &config.distribution {
            Some(dist) => {
                let backbone: Arc<dyn Backbone> = match backbone {
                    Some(backbone) => backbone,
                    None => Arc::new(
                        RedisBackbone::new(&dist.server, &dist.password)
                            .context("invalid distribution server address")?,
                    ),
                };
                let bridge =
                    DistributionBridge::from_config(backbone, dist, &config.server_id, metrics)
                        .await?;
                let (outbound_tx, outbound_rx) = mpsc::channel(config.relay.inbound_capacity);
                dispatcher = dispatcher.with_distribution(outbound_tx);
                Some(bridge.start(relay.inbound(), outbound_rx).await?)
            }
            None => {
                info!("distribution disabled, running standalone");
                None
            }
        };

        let shutdown = relay.shutdown_token();
        let internal_state = InternalState {
            relay: relay.clone(),
            server_id: config.server_id.clone(),
            distribution_enabled: bridge.is_some(),
            prometheus,
        };

        let tasks = vec![
            tokio::spawn(dispatcher.run(inbound_rx, shutdown.clone())),
            tokio::spawn(serve(
                "chat",
                chat_listener,
                chat_router(relay.clone()),
                shutdown.clone(),
            )),
            tokio::spawn(serve(
                "internal",
                internal_listener,
                internal_router(internal_state),
                shutdown,
            )),
        ];

        info!(server_id = %config.server_id, "chat server listening on ws://{}/ws", chat_addr);
        info!("metrics and health listening on http://{}", internal_addr);

        Ok(RunningServer {
            chat_addr,
            internal_addr,
            server_id: config.server_id,
            relay,
            bridge,
            tasks,
        })
    }
}

async fn serve(name: &'static str, listener: TcpListener, router: Router, shutdown: CancellationToken) {
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;
    if let Err(e) = result {
        error!(listener = name, error = %e, "listener failed, shutting down");
        shutdown.cancel();
    }
}

/// Handle to a started relay instance.
pub struct RunningServer {
    chat_addr: SocketAddr,
    internal_addr: SocketAddr,
    server_id: String,
    relay: Arc<Relay>,
    bridge: Option<BridgeTasks>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    pub fn chat_addr(&self) -> SocketAddr {
        self.chat_addr
    }

    pub fn internal_addr(&self) -> SocketAddr {
        self.internal_addr
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub async fn connection_count(&self) -> usize {
        self.relay.registry.len().await
    }

    pub async fn history_len(&self) -> usize {
        self.relay.history.len().await
    }

    /// Cancelling this token stops the server; [`wait`](Self::wait) then returns.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.relay.shutdown_token()
    }

    /// Run until shutdown is requested or the distribution bridge fails.
    /// A bridge failure is returned as an error after the server stopped.
    pub async fn wait(mut self) -> Result<()> {
        let shutdown = self.relay.shutdown_token();
        let outcome = match self.bridge.as_mut() {
            Some(bridge) => tokio::select! {
                _ = shutdown.cancelled() => Ok(()),
                stopped = bridge.stopped() => stopped,
            },
            None => {
                shutdown.cancelled().await;
                Ok(())
            }
        };
        if let Err(e) = &outcome {
            error!(error = %e, "distribution bridge failed, shutting down");
        }

        self.finish().await;
        outcome.context("distribution bridge failed")
    }

    pub async fn shutdown(self) -> Result<()> {
        self.relay.shutdown_token().cancel();
        self.wait().await
    }

    async fn finish(self) {
        info!("shutting down");
        self.relay.shutdown_token().cancel();
        if let Some(bridge) = &self.bridge {
            bridge.shutdown();
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "server task panicked");
            }
        }

        let drained = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, async {
            while !self.relay.registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = self.relay.registry.len().await,
                "connections still open after shutdown timeout"
            );
        }
        info!("server stopped");
    }
}
