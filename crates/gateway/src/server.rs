//! The real [`ServerStarter`]: one axum listener per epoch.
//!
//! Each epoch loads the configuration, binds the listener, mounts `/health`
//! and the control API, and starts the configured channel accounts against a
//! fresh [`PluginRouteRegistry`]. Closing the epoch tears all of it down.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    anyhow::Context,
    async_trait::async_trait,
    axum::{
        Json, Router,
        extract::{Request, State},
        http::{StatusCode, header},
        middleware::{self, Next},
        response::{IntoResponse, Response},
        routing::{get, post},
    },
    secrecy::{ExposeSecret, Secret},
    tokio::{net::TcpListener, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use {
    clawport_channels::{ChannelEventSink, ChannelRegistry, WebhookRouter},
    clawport_common::secret::constant_time_eq,
    clawport_config::{ClawportConfig, Severity, validate},
    clawport_telegram::TelegramPlugin,
};

use crate::{
    channel_events::GatewayChannelEventSink,
    http_guard::WebhookLimits,
    lifecycle::{ServerHandle, ServerStarter, TaskAccounting},
    plugin_routes::PluginRouteRegistry,
    run_loop::RunLoopConfig,
    state::{EpochPhase, EpochState, GatewayState},
};

/// Shared state for the axum handlers of one epoch.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GatewayState>,
    pub epoch: Arc<EpochState>,
    pub control_token: Option<Arc<Secret<String>>>,
}

/// Starts gateway epochs.
pub struct GatewayServer {
    state: Arc<GatewayState>,
}

impl GatewayServer {
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }

    #[must_use]
    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Bind the listener and start channels for `epoch`.
    pub async fn start_epoch(&self, epoch: u64) -> anyhow::Result<GatewayHandle> {
        let config = self
            .state
            .load_config()
            .context("failed to load configuration")?;
        self.state
            .authority
            .set_external_allowed(config.gateway.restart.allow_external_signal);

        let routes = PluginRouteRegistry::new(
            WebhookLimits::from(&config.webhooks),
            Arc::clone(&self.state.guard_stats),
        );
        let epoch_state = Arc::new(EpochState::new(epoch, routes.clone()));

        let bind = config.server.bind.as_str();
        let port = config.server.port;
        let listener = TcpListener::bind((bind, port))
            .await
            .with_context(|| format!("failed to bind {bind}:{port}"))?;
        let local_addr = listener.local_addr()?;

        let app = build_router(AppState {
            gateway: Arc::clone(&self.state),
            epoch: Arc::clone(&epoch_state),
            control_token: config.gateway.control_token.clone().map(Arc::new),
        });

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let serve_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!(error = %e, "gateway listener failed");
            }
        });
        info!(epoch, addr = %local_addr, "gateway listening");

        let channels = self.start_channels(&config, &routes).await;

        Ok(GatewayHandle {
            epoch: epoch_state,
            local_addr,
            channels,
            cancel,
            serve_task,
            close_grace: config.gateway.restart.close_grace(),
            timings: RunLoopConfig::from(&config.gateway.restart),
        })
    }

    /// Start every configured account. A failed account is logged and
    /// skipped; the epoch keeps serving the others.
    async fn start_channels(
        &self,
        config: &ClawportConfig,
        routes: &PluginRouteRegistry,
    ) -> ChannelRegistry {
        let mut registry = ChannelRegistry::new();
        if config.channels.telegram.is_empty() {
            return registry;
        }

        let sink: Arc<dyn ChannelEventSink> = Arc::new(GatewayChannelEventSink::new(
            self.state.queue.clone(),
            Arc::clone(&self.state.turns),
        ));
        let router: Arc<dyn WebhookRouter> = Arc::new(routes.clone());
        registry.register(Box::new(
            TelegramPlugin::new(router, config.server.public_url.clone()).with_event_sink(sink),
        ));

        for (account_id, account) in &config.channels.telegram {
            match registry
                .start_account("telegram", account_id, account.clone())
                .await
            {
                Ok(()) => info!(channel = "telegram", %account_id, "channel account started"),
                Err(e) => error!(
                    channel = "telegram",
                    %account_id,
                    error = %e,
                    "failed to start channel account"
                ),
            }
        }
        registry
    }
}

#[async_trait]
impl ServerStarter for GatewayServer {
    async fn start(&self, epoch: u64) -> anyhow::Result<Box<dyn ServerHandle>> {
        Ok(Box::new(self.start_epoch(epoch).await?))
    }
}

/// A running epoch.
pub struct GatewayHandle {
    epoch: Arc<EpochState>,
    local_addr: SocketAddr,
    channels: ChannelRegistry,
    cancel: CancellationToken,
    serve_task: JoinHandle<()>,
    close_grace: Duration,
    timings: RunLoopConfig,
}

impl GatewayHandle {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn epoch(&self) -> &Arc<EpochState> {
        &self.epoch
    }

    /// Stop channels, drop routes, then stop the listener within the close
    /// grace period.
    pub async fn shutdown(
        self,
        reason: &str,
        restart_expected: Option<Duration>,
    ) -> anyhow::Result<()> {
        let Self {
            epoch,
            mut channels,
            cancel,
            mut serve_task,
            close_grace,
            ..
        } = self;

        let restart_expected_ms =
            restart_expected.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        epoch.set_phase(EpochPhase::Closing {
            reason: reason.to_string(),
            restart_expected_ms,
        });
        info!(epoch = epoch.epoch, reason, ?restart_expected_ms, "closing gateway epoch");

        let stopped = channels.stop_all().await;
        epoch.routes.clear();
        cancel.cancel();

        match tokio::time::timeout(close_grace, &mut serve_task).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => anyhow::bail!("gateway listener task failed: {e}"),
            Err(_) => {
                warn!(
                    epoch = epoch.epoch,
                    grace_ms = u64::try_from(close_grace.as_millis()).unwrap_or(u64::MAX),
                    "listener did not stop in time, aborting"
                );
                serve_task.abort();
            },
        }
        debug!(epoch = epoch.epoch, channels_stopped = stopped, "gateway epoch closed");
        Ok(())
    }
}

#[async_trait]
impl ServerHandle for GatewayHandle {
    fn mark_draining(&self) {
        self.epoch.set_phase(EpochPhase::Draining);
        self.epoch.routes.set_draining();
        info!(epoch = self.epoch.epoch, "gateway draining");
    }

    fn restart_timings(&self) -> Option<RunLoopConfig> {
        Some(self.timings)
    }

    async fn close(
        self: Box<Self>,
        reason: &str,
        restart_expected: Option<Duration>,
    ) -> anyhow::Result<()> {
        (*self).shutdown(reason, restart_expected).await
    }
}

/// Routes for one epoch. The control API is only mounted with a token.
pub fn build_router(app: AppState) -> Router {
    let mut router = Router::new().route("/health", get(health));
    if app.control_token.is_some() {
        let control = Router::new()
            .route("/restart", post(restart))
            .route("/status", get(status))
            .route_layer(middleware::from_fn_with_state(
                app.clone(),
                require_control_token,
            ));
        router = router.nest("/api/gateway", control);
    }
    router.fallback(dispatch).with_state(app)
}

async fn health(State(app): State<AppState>) -> Json<serde_json::Value> {
    let mut body = serde_json::json!({
        "epoch": app.epoch.epoch,
        "version": app.gateway.version,
    });
    match app.epoch.phase() {
        EpochPhase::Running => body["status"] = "ok".into(),
        EpochPhase::Draining => body["status"] = "draining".into(),
        EpochPhase::Closing {
            restart_expected_ms,
            ..
        } => {
            body["status"] = "closing".into();
            // Load balancers see how soon the listener is expected back.
            if let Some(ms) = restart_expected_ms {
                body["restart_expected_ms"] = ms.into();
            }
        },
    }
    Json(body)
}

async fn require_control_token(
    State(app): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = app.control_token.as_deref() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if let Some(presented) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        && constant_time_eq(presented.as_bytes(), expected.expose_secret().as_bytes())
    {
        return next.run(request).await;
    }

    warn!(path = %request.uri().path(), "control API request rejected");
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "not authenticated" })),
    )
        .into_response()
}

/// Authorize and raise a restart, after checking that the configuration the
/// next epoch will load is usable.
async fn restart(State(app): State<AppState>) -> Response {
    let config = match app.gateway.load_config() {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "restart refused: configuration cannot be loaded");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("config cannot be loaded, refusing to restart: {e:#}"),
                    "valid": false,
                })),
            )
                .into_response();
        },
    };

    let result = validate(&config);
    if result.has_errors() {
        let errors: Vec<String> = result
            .diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .map(|d| format!("{}: {}", d.path, d.message))
            .collect();
        warn!(errors = ?errors, "restart refused: configuration is invalid");
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "config is invalid, refusing to restart",
                "diagnostics": errors,
                "valid": false,
            })),
        )
            .into_response();
    }

    app.gateway.authority.authorize();
    if !app.gateway.signals.restart() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "gateway is shutting down" })),
        )
            .into_response();
    }
    info!(epoch = app.epoch.epoch, "restart requested via control API");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "restarting": true, "epoch": app.epoch.epoch })),
    )
        .into_response()
}

async fn status(State(app): State<AppState>) -> Json<serde_json::Value> {
    let gateway = &app.gateway;
    Json(serde_json::json!({
        "epoch": app.epoch.epoch,
        "version": gateway.version,
        "uptime_secs": app.epoch.uptime_secs(),
        "state": app.epoch.phase(),
        "routes": app.epoch.routes.routes(),
        "guard": gateway.guard_stats.snapshot(),
        "active_tasks": gateway.queue.active_task_count(),
        "lanes": gateway.queue.lanes(),
        "restarts_handled": gateway.authority.handled_count(),
        "last_restart_ms": gateway.authority.last_handled_ms(),
    }))
}

async fn dispatch(State(app): State<AppState>, request: Request) -> Response {
    app.epoch.routes.dispatch(request).await
}
