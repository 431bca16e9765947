//! Route table that lets channel plugins share the gateway listener.
//!
//! Plugins register exact paths; the gateway's fallback handler dispatches
//! any request that no built-in route matched. Each dispatched request goes
//! through [`crate::http_guard`] before the plugin handler sees it.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use {
    axum::{
        Json, Router,
        extract::{Request, State},
        http::{HeaderValue, Method, StatusCode, header},
        response::{IntoResponse, Response},
    },
    tracing::{debug, info, warn},
};

use clawport_channels::{RouteError, RouteSpec, WebhookHandler, WebhookRegistration, WebhookRouter};

use crate::http_guard::{GuardStats, RequestGuard, WebhookLimits, serve_guarded};

/// Paths the gateway serves itself.
const RESERVED_EXACT: &[&str] = &["/health"];
const RESERVED_PREFIX: &str = "/api/gateway";

/// Seconds clients are told to wait while an epoch drains.
const DRAINING_RETRY_AFTER: &str = "2";

#[derive(Clone)]
struct RouteEntry {
    id: u64,
    spec: RouteSpec,
    handler: Arc<dyn WebhookHandler>,
}

struct RegistryInner {
    routes: RwLock<HashMap<String, RouteEntry>>,
    next_id: AtomicU64,
    draining: AtomicBool,
    limits: WebhookLimits,
    stats: Arc<GuardStats>,
}

/// Public view of one registered route.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RouteInfo {
    pub path: String,
    pub plugin_id: String,
    pub account_id: Option<String>,
    pub methods: Vec<String>,
}

/// Shared plugin route table for one server epoch.
#[derive(Clone)]
pub struct PluginRouteRegistry {
    inner: Arc<RegistryInner>,
}

impl PluginRouteRegistry {
    pub fn new(limits: WebhookLimits, stats: Arc<GuardStats>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                routes: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                draining: AtomicBool::new(false),
                limits,
                stats,
            }),
        }
    }

    /// Claim `spec.path` for `handler`.
    pub fn register(
        &self,
        mut spec: RouteSpec,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<RouteRegistration, RouteError> {
        let path = normalize_path(&spec.path)?;
        if spec.methods.is_empty() {
            return Err(RouteError::NoMethods { path });
        }
        if is_reserved(&path) {
            return Err(RouteError::Reserved { path });
        }
        spec.path = path.clone();

        let mut routes = self.write_routes();
        if let Some(existing) = routes.get(&path) {
            let owner = existing.spec.owner();
            warn!(path, owner, requested_by = %spec.owner(), "webhook path already registered");
            return Err(RouteError::PathInUse { path, owner });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        info!(path, owner = %spec.owner(), "plugin webhook route registered");
        routes.insert(path.clone(), RouteEntry { id, spec, handler });

        Ok(RouteRegistration {
            registry: Arc::downgrade(&self.inner),
            path,
            id,
            removed: AtomicBool::new(false),
        })
    }

    /// Snapshot of the registered routes, sorted by path.
    #[must_use]
    pub fn routes(&self) -> Vec<RouteInfo> {
        let mut routes: Vec<RouteInfo> = self
            .read_routes()
            .values()
            .map(|entry| RouteInfo {
                path: entry.spec.path.clone(),
                plugin_id: entry.spec.plugin_id.clone(),
                account_id: entry.spec.account_id.clone(),
                methods: entry.spec.methods.iter().map(ToString::to_string).collect(),
            })
            .collect();
        routes.sort_by(|a, b| a.path.cmp(&b.path));
        routes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read_routes().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Answer new plugin requests with 503 from now on.
    pub fn set_draining(&self) {
        self.inner.draining.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Drop every route. Outstanding registrations become no-ops.
    pub fn clear(&self) {
        let removed = {
            let mut routes = self.write_routes();
            let n = routes.len();
            routes.clear();
            n
        };
        if removed > 0 {
            info!(removed, "plugin webhook routes cleared");
        }
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<GuardStats> {
        &self.inner.stats
    }

    /// Dispatch a request that no built-in route matched.
    pub async fn dispatch(&self, request: Request) -> Response {
        let path = request.uri().path().to_string();
        let entry = self.read_routes().get(&path).cloned();
        let Some(entry) = entry else {
            debug!(path, "no plugin route");
            return error_response(StatusCode::NOT_FOUND, "not found");
        };

        if !entry.spec.methods.contains(request.method()) {
            let allow = entry
                .spec
                .methods
                .iter()
                .map(Method::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            let mut resp = error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
            if let Ok(value) = HeaderValue::from_str(&allow) {
                resp.headers_mut().insert(header::ALLOW, value);
            }
            return resp;
        }

        if self.is_draining() {
            let mut resp = error_response(StatusCode::SERVICE_UNAVAILABLE, "gateway is restarting");
            resp.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from_static(DRAINING_RETRY_AFTER),
            );
            return resp;
        }

        let guard = RequestGuard::new(Arc::clone(&self.inner.stats), self.inner.limits, &path);
        serve_guarded(guard, request, entry.handler).await
    }

    /// Standalone router that sends every request through [`Self::dispatch`].
    pub fn into_router(self) -> Router {
        Router::new().fallback(dispatch_handler).with_state(self)
    }

    fn read_routes(&self) -> RwLockReadGuard<'_, HashMap<String, RouteEntry>> {
        self.inner.routes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_routes(&self) -> RwLockWriteGuard<'_, HashMap<String, RouteEntry>> {
        self.inner.routes.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl WebhookRouter for PluginRouteRegistry {
    fn register(
        &self,
        spec: RouteSpec,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<Box<dyn WebhookRegistration>, RouteError> {
        PluginRouteRegistry::register(self, spec, handler)
            .map(|reg| Box::new(reg) as Box<dyn WebhookRegistration>)
    }
}

async fn dispatch_handler(State(registry): State<PluginRouteRegistry>, request: Request) -> Response {
    registry.dispatch(request).await
}

/// Capability to remove one route. Idempotent; also runs on drop.
pub struct RouteRegistration {
    registry: Weak<RegistryInner>,
    path: String,
    id: u64,
    removed: AtomicBool,
}

impl RouteRegistration {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn unregister(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut routes = inner.routes.write().unwrap_or_else(|e| e.into_inner());
        // The path may have been cleared and claimed again since.
        if routes.get(&self.path).is_some_and(|entry| entry.id == self.id) {
            routes.remove(&self.path);
            info!(path = %self.path, "plugin webhook route removed");
        }
    }
}

impl Drop for RouteRegistration {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl WebhookRegistration for RouteRegistration {
    fn path(&self) -> &str {
        &self.path
    }

    fn unregister(&self) {
        RouteRegistration::unregister(self);
    }
}

fn normalize_path(raw: &str) -> Result<String, RouteError> {
    let path = raw.trim();
    let invalid = |reason| RouteError::InvalidPath {
        path: raw.to_string(),
        reason,
    };
    if path.is_empty() {
        return Err(invalid("path is empty"));
    }
    if !path.starts_with('/') {
        return Err(invalid("path must start with '/'"));
    }
    if path.chars().any(|c| c.is_whitespace() || c == '?' || c == '#') {
        return Err(invalid("path must not contain whitespace, '?' or '#'"));
    }
    Ok(path.to_string())
}

fn is_reserved(path: &str) -> bool {
    RESERVED_EXACT.contains(&path)
        || path == RESERVED_PREFIX
        || path.starts_with(&format!("{RESERVED_PREFIX}/"))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicUsize,
        time::Duration,
    };

    use {
        async_trait::async_trait,
        axum::body::Body,
        bytes::Bytes,
        clawport_channels::{WebhookReply, WebhookRequest},
        futures::StreamExt,
        tower::ServiceExt,
    };

    use super::*;

    #[derive(Default)]
    struct EchoHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WebhookHandler for EchoHandler {
        async fn handle(&self, request: WebhookRequest) -> WebhookReply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            WebhookReply::json(
                StatusCode::OK,
                serde_json::json!({
                    "path": request.path,
                    "body": String::from_utf8_lossy(&request.body),
                }),
            )
        }
    }

    fn registry() -> PluginRouteRegistry {
        PluginRouteRegistry::new(WebhookLimits::default(), Arc::new(GuardStats::default()))
    }

    fn post(path: &str, body: Body) -> Request {
        Request::builder()
            .method("POST")
            .uri(path)
            .body(body)
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn duplicate_path_is_rejected() {
        let registry = registry();
        let _first = registry
            .register(
                RouteSpec::post("/telegram/main", "telegram").for_account("main"),
                Arc::new(EchoHandler::default()),
            )
            .unwrap();

        let err = registry
            .register(
                RouteSpec::post("/telegram/main", "other"),
                Arc::new(EchoHandler::default()),
            )
            .err()
            .unwrap();
        assert_eq!(err, RouteError::PathInUse {
            path: "/telegram/main".into(),
            owner: "telegram:main".into(),
        });
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn double_unregister_is_a_noop() {
        let registry = registry();
        let reg = registry
            .register(RouteSpec::post("/a", "p"), Arc::new(EchoHandler::default()))
            .unwrap();
        reg.unregister();
        reg.unregister();
        assert!(registry.is_empty());
        drop(reg);
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_registration_does_not_remove_new_owner() {
        let registry = registry();
        let old = registry
            .register(RouteSpec::post("/a", "p"), Arc::new(EchoHandler::default()))
            .unwrap();
        registry.clear();
        let _new = registry
            .register(RouteSpec::post("/a", "q"), Arc::new(EchoHandler::default()))
            .unwrap();

        old.unregister();
        assert_eq!(registry.routes()[0].plugin_id, "q");
    }

    #[test]
    fn registration_outlives_registry() {
        let registry = registry();
        let reg = registry
            .register(RouteSpec::post("/a", "p"), Arc::new(EchoHandler::default()))
            .unwrap();
        drop(registry);
        reg.unregister();
    }

    #[test]
    fn dropping_registration_releases_path() {
        let registry = registry();
        {
            let _reg = registry
                .register(RouteSpec::post("/a", "p"), Arc::new(EchoHandler::default()))
                .unwrap();
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn reserved_and_invalid_paths_are_rejected() {
        let registry = registry();
        let handler: Arc<dyn WebhookHandler> = Arc::new(EchoHandler::default());
        for path in ["/health", "/api/gateway", "/api/gateway/restart"] {
            assert!(matches!(
                registry.register(RouteSpec::post(path, "p"), Arc::clone(&handler)),
                Err(RouteError::Reserved { .. })
            ));
        }
        for path in ["", "hook", "/a b", "/a?x=1", "/a#frag"] {
            assert!(matches!(
                registry.register(RouteSpec::post(path, "p"), Arc::clone(&handler)),
                Err(RouteError::InvalidPath { .. })
            ));
        }
        let mut no_methods = RouteSpec::post("/a", "p");
        no_methods.methods.clear();
        assert!(matches!(
            registry.register(no_methods, handler),
            Err(RouteError::NoMethods { .. })
        ));
        // A prefix lookalike is not reserved.
        assert!(
            registry
                .register(
                    RouteSpec::post("/api/gatewayx", "p"),
                    Arc::new(EchoHandler::default())
                )
                .is_ok()
        );
    }

    #[tokio::test]
    async fn dispatches_by_exact_path() {
        let registry = registry();
        let handler = Arc::new(EchoHandler::default());
        let _reg = registry
            .register(
                RouteSpec::post("/hook", "p"),
                Arc::clone(&handler) as Arc<dyn WebhookHandler>,
            )
            .unwrap();
        let app = registry.clone().into_router();

        let resp = app
            .clone()
            .oneshot(post("/hook?x=1", Body::from("ping")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["body"], "ping");
        assert_eq!(body["path"], "/hook");

        let missing = app
            .clone()
            .oneshot(post("/hook/extra", Body::empty()))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrong_method_gets_405_with_allow() {
        let registry = registry();
        let _reg = registry
            .register(RouteSpec::post("/hook", "p"), Arc::new(EchoHandler::default()))
            .unwrap();
        let resp = registry
            .into_router()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/hook")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers()[header::ALLOW], "POST");
    }

    #[tokio::test]
    async fn draining_registry_answers_503() {
        let registry = registry();
        let handler = Arc::new(EchoHandler::default());
        let _reg = registry
            .register(
                RouteSpec::post("/hook", "p"),
                Arc::clone(&handler) as Arc<dyn WebhookHandler>,
            )
            .unwrap();
        registry.set_draining();
        let resp = registry
            .clone()
            .into_router()
            .oneshot(post("/hook", Body::from("x")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(resp.headers().contains_key(header::RETRY_AFTER));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_body_never_reaches_handler() {
        let registry = PluginRouteRegistry::new(
            WebhookLimits {
                max_body_bytes: 16,
                ..Default::default()
            },
            Arc::new(GuardStats::default()),
        );
        let handler = Arc::new(EchoHandler::default());
        let _reg = registry
            .register(
                RouteSpec::post("/hook", "p"),
                Arc::clone(&handler) as Arc<dyn WebhookHandler>,
            )
            .unwrap();
        let resp = registry
            .clone()
            .into_router()
            .oneshot(post("/hook", Body::from(vec![b'a'; 64])))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.stats().snapshot().released, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_request_does_not_block_other_routes() {
        let registry = registry();
        let _slow = registry
            .register(RouteSpec::post("/slow", "p"), Arc::new(EchoHandler::default()))
            .unwrap();
        let _fast = registry
            .register(RouteSpec::post("/fast", "p"), Arc::new(EchoHandler::default()))
            .unwrap();
        let app = registry.clone().into_router();

        let stalled = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"{"))])
            .chain(futures::stream::pending());
        let started = tokio::time::Instant::now();
        let slow = tokio::spawn(
            app.clone()
                .oneshot(post("/slow", Body::from_stream(stalled))),
        );

        let fast = app
            .oneshot(post("/fast", Body::from("{}")))
            .await
            .unwrap();
        assert_eq!(fast.status(), StatusCode::OK);
        assert!(started.elapsed() < Duration::from_secs(1));

        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(registry.stats().snapshot().released, 2);
    }

    #[test]
    fn routes_snapshot_lists_owner_and_methods() {
        let registry = registry();
        let _reg = registry
            .register(
                RouteSpec::post("/telegram/main", "telegram").for_account("main"),
                Arc::new(EchoHandler::default()),
            )
            .unwrap();
        assert_eq!(registry.routes(), vec![RouteInfo {
            path: "/telegram/main".into(),
            plugin_id: "telegram".into(),
            account_id: Some("main".into()),
            methods: vec!["POST".into()],
        }]);
    }
}
