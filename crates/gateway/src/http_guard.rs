//! Per-request resource ceilings for plugin webhook traffic.
//!
//! Every request dispatched to a plugin route gets a [`RequestGuard`] that
//! bounds body size, body arrival time and handler time independently. A
//! tripped guard answers the caller itself; the handler never sees a partial
//! body.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    axum::{
        Json,
        body::Body,
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response},
    },
    bytes::{Bytes, BytesMut},
    futures::{FutureExt, StreamExt},
    tokio::time::Instant,
    tracing::{debug, warn},
};

use {
    clawport_channels::{WebhookHandler, WebhookReply, WebhookRequest},
    clawport_config::WebhooksConfig,
};

/// Ceilings applied to each plugin request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookLimits {
    pub max_body_bytes: usize,
    pub body_timeout: Duration,
    pub handler_timeout: Duration,
}

impl Default for WebhookLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 1024 * 1024,
            body_timeout: Duration::from_secs(30),
            handler_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&WebhooksConfig> for WebhookLimits {
    fn from(config: &WebhooksConfig) -> Self {
        Self {
            max_body_bytes: config.max_body_bytes,
            body_timeout: Duration::from_secs(config.body_timeout_secs),
            handler_timeout: Duration::from_secs(config.handler_timeout_secs),
        }
    }
}

/// Process-wide guard counters.
#[derive(Debug, Default)]
pub struct GuardStats {
    accepted: AtomicU64,
    too_large: AtomicU64,
    body_timeouts: AtomicU64,
    handler_timeouts: AtomicU64,
    handler_errors: AtomicU64,
    released: AtomicU64,
}

/// Point-in-time copy of [`GuardStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct GuardStatsSnapshot {
    pub accepted: u64,
    pub too_large: u64,
    pub body_timeouts: u64,
    pub handler_timeouts: u64,
    pub handler_errors: u64,
    pub released: u64,
}

impl GuardStats {
    #[must_use]
    pub fn snapshot(&self) -> GuardStatsSnapshot {
        GuardStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            too_large: self.too_large.load(Ordering::Relaxed),
            body_timeouts: self.body_timeouts.load(Ordering::Relaxed),
            handler_timeouts: self.handler_timeouts.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

/// Which ceiling a request hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardViolation {
    TooLarge,
    BodyTimeout,
    BodyRead,
    HandlerTimeout,
}

impl GuardViolation {
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BodyTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::BodyRead => StatusCode::BAD_REQUEST,
            Self::HandlerTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn message(self) -> &'static str {
        match self {
            Self::TooLarge => "request body too large",
            Self::BodyTimeout => "request body not received in time",
            Self::BodyRead => "failed to read request body",
            Self::HandlerTimeout => "webhook handler timed out",
        }
    }
}

impl IntoResponse for GuardViolation {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(serde_json::json!({ "error": self.message() })),
        )
            .into_response()
    }
}

/// Enforces [`WebhookLimits`] for one request.
pub struct RequestGuard {
    stats: Arc<GuardStats>,
    limits: WebhookLimits,
    route: String,
    started: Instant,
    body_deadline: Instant,
    bytes_read: usize,
    tripped: Option<GuardViolation>,
}

impl RequestGuard {
    /// The body deadline starts counting now.
    pub fn new(stats: Arc<GuardStats>, limits: WebhookLimits, route: impl Into<String>) -> Self {
        let started = Instant::now();
        Self {
            stats,
            limits,
            route: route.into(),
            started,
            body_deadline: started + limits.body_timeout,
            bytes_read: 0,
            tripped: None,
        }
    }

    #[must_use]
    pub fn tripped(&self) -> Option<GuardViolation> {
        self.tripped
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Record the first violation. Later trips keep the original cause.
    fn trip(&mut self, violation: GuardViolation) -> GuardViolation {
        if self.tripped.is_some() {
            return violation;
        }
        self.tripped = Some(violation);
        let counter = match violation {
            GuardViolation::TooLarge => Some(&self.stats.too_large),
            GuardViolation::BodyTimeout => Some(&self.stats.body_timeouts),
            GuardViolation::HandlerTimeout => Some(&self.stats.handler_timeouts),
            GuardViolation::BodyRead => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        warn!(
            route = %self.route,
            violation = ?violation,
            bytes_read = self.bytes_read,
            elapsed_ms = self.elapsed_ms(),
            "webhook request rejected"
        );
        violation
    }

    /// Read the whole body within the size and time ceilings.
    pub async fn read_body(
        &mut self,
        headers: &HeaderMap,
        body: Body,
    ) -> Result<Bytes, GuardViolation> {
        let max = self.limits.max_body_bytes;
        let max_declared = u64::try_from(max).unwrap_or(u64::MAX);
        if declared_length(headers).is_some_and(|len| len > max_declared) {
            return Err(self.trip(GuardViolation::TooLarge));
        }

        let mut stream = body.into_data_stream();
        let mut buf = BytesMut::new();
        loop {
            match tokio::time::timeout_at(self.body_deadline, stream.next()).await {
                Err(_) => return Err(self.trip(GuardViolation::BodyTimeout)),
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(route = %self.route, error = %e, "webhook body stream failed");
                    return Err(self.trip(GuardViolation::BodyRead));
                },
                Ok(Some(Ok(chunk))) => {
                    self.bytes_read += chunk.len();
                    if self.bytes_read > max {
                        return Err(self.trip(GuardViolation::TooLarge));
                    }
                    buf.extend_from_slice(&chunk);
                },
            }
        }
        Ok(buf.freeze())
    }

    /// Run the handler under the handler ceiling. On expiry the handler
    /// future is dropped.
    pub async fn run_handler(
        &mut self,
        handler: &dyn WebhookHandler,
        request: WebhookRequest,
    ) -> Result<WebhookReply, GuardViolation> {
        let call = AssertUnwindSafe(handler.handle(request)).catch_unwind();
        match tokio::time::timeout(self.limits.handler_timeout, call).await {
            Ok(Ok(reply)) => {
                if reply.status.is_server_error() {
                    self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(route = %self.route, status = %reply.status, "webhook handler failed");
                }
                Ok(reply)
            },
            Ok(Err(_)) => {
                self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                warn!(route = %self.route, "webhook handler panicked");
                Ok(WebhookReply::error(
                    StatusCode::BAD_GATEWAY,
                    "webhook handler failed",
                ))
            },
            Err(_) => Err(self.trip(GuardViolation::HandlerTimeout)),
        }
    }

    /// Success-path accounting. Skipped once the guard has tripped.
    pub fn complete(&self, reply: &WebhookReply) {
        if self.tripped.is_some() {
            return;
        }
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        debug!(
            route = %self.route,
            status = %reply.status,
            bytes = self.bytes_read,
            elapsed_ms = self.elapsed_ms(),
            "webhook handled"
        );
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.stats.released.fetch_add(1, Ordering::Relaxed);
    }
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Turn a handler reply into an HTTP response.
#[must_use]
pub fn reply_into_response(reply: WebhookReply) -> Response {
    match reply.body {
        Some(body) => (reply.status, Json(body)).into_response(),
        None => reply.status.into_response(),
    }
}

/// Read, bound and dispatch one request to `handler`.
pub async fn serve_guarded(
    mut guard: RequestGuard,
    request: axum::extract::Request,
    handler: Arc<dyn WebhookHandler>,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match guard.read_body(&parts.headers, body).await {
        Ok(body) => body,
        Err(violation) => return violation.into_response(),
    };
    let request = WebhookRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
    };
    match guard.run_handler(handler.as_ref(), request).await {
        Ok(reply) => {
            guard.complete(&reply);
            reply_into_response(reply)
        },
        Err(violation) => violation.into_response(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use {async_trait::async_trait, axum::http::Request};

    use super::*;

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
        delay: Option<Duration>,
        status: Option<StatusCode>,
        panics: bool,
    }

    #[async_trait]
    impl WebhookHandler for CountingHandler {
        async fn handle(&self, request: WebhookRequest) -> WebhookReply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.panics {
                panic!("handler blew up");
            }
            match self.status {
                Some(status) => WebhookReply::error(status, "nope"),
                None => WebhookReply::json(
                    StatusCode::OK,
                    serde_json::json!({ "len": request.body.len() }),
                ),
            }
        }
    }

    fn post(body: Body) -> axum::extract::Request {
        Request::builder()
            .method("POST")
            .uri("/hook")
            .body(body)
            .unwrap()
    }

    fn stalled_body(first: &'static [u8]) -> Body {
        let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(first))])
            .chain(futures::stream::pending());
        Body::from_stream(stream)
    }

    fn guard(stats: &Arc<GuardStats>, limits: WebhookLimits) -> RequestGuard {
        RequestGuard::new(Arc::clone(stats), limits, "/hook")
    }

    #[tokio::test]
    async fn small_body_reaches_handler() {
        let stats = Arc::new(GuardStats::default());
        let handler = Arc::new(CountingHandler::default());
        let resp = serve_guarded(
            guard(&stats, WebhookLimits::default()),
            post(Body::from("hello")),
            Arc::clone(&handler) as Arc<dyn WebhookHandler>,
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 1);
        assert_eq!(snap.released, 1);
    }

    #[tokio::test]
    async fn declared_oversize_is_rejected_before_reading() {
        let stats = Arc::new(GuardStats::default());
        let handler = Arc::new(CountingHandler::default());
        let limits = WebhookLimits {
            max_body_bytes: 8,
            ..Default::default()
        };
        let mut req = post(stalled_body(b"x"));
        req.headers_mut()
            .insert(header::CONTENT_LENGTH, "1000".parse().unwrap());

        let resp = serve_guarded(
            guard(&stats, limits),
            req,
            Arc::clone(&handler) as Arc<dyn WebhookHandler>,
        )
        .await;

        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(stats.snapshot().too_large, 1);
    }

    #[tokio::test]
    async fn streamed_oversize_aborts_without_calling_handler() {
        let stats = Arc::new(GuardStats::default());
        let handler = Arc::new(CountingHandler::default());
        let limits = WebhookLimits {
            max_body_bytes: 4,
            ..Default::default()
        };
        let chunks = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
        ]);

        let resp = serve_guarded(
            guard(&stats, limits),
            post(Body::from_stream(chunks)),
            Arc::clone(&handler) as Arc<dyn WebhookHandler>,
        )
        .await;

        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 0);
        assert_eq!(snap.released, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_body_times_out_with_408() {
        let stats = Arc::new(GuardStats::default());
        let handler = Arc::new(CountingHandler::default());
        let started = Instant::now();

        let resp = serve_guarded(
            guard(&stats, WebhookLimits::default()),
            post(stalled_body(b"{\"partial\":")),
            Arc::clone(&handler) as Arc<dyn WebhookHandler>,
        )
        .await;

        assert_eq!(resp.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(stats.snapshot().body_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_gets_504_at_the_ceiling() {
        let stats = Arc::new(GuardStats::default());
        let handler = Arc::new(CountingHandler {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let started = Instant::now();

        let resp = serve_guarded(
            guard(&stats, WebhookLimits::default()),
            post(Body::from("{}")),
            Arc::clone(&handler) as Arc<dyn WebhookHandler>,
        )
        .await;

        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        let snap = stats.snapshot();
        assert_eq!(snap.handler_timeouts, 1);
        assert_eq!(snap.accepted, 0);
        assert_eq!(snap.released, 1);
    }

    #[tokio::test]
    async fn server_error_reply_is_counted_and_passed_through() {
        let stats = Arc::new(GuardStats::default());
        let handler = Arc::new(CountingHandler {
            status: Some(StatusCode::BAD_GATEWAY),
            ..Default::default()
        });

        let resp = serve_guarded(
            guard(&stats, WebhookLimits::default()),
            post(Body::from("{}")),
            Arc::clone(&handler) as Arc<dyn WebhookHandler>,
        )
        .await;

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(stats.snapshot().handler_errors, 1);
    }

    #[tokio::test]
    async fn panicking_handler_gets_502_and_releases_once() {
        let stats = Arc::new(GuardStats::default());
        let handler = Arc::new(CountingHandler {
            panics: true,
            ..Default::default()
        });

        let resp = serve_guarded(
            guard(&stats, WebhookLimits::default()),
            post(Body::from("{}")),
            Arc::clone(&handler) as Arc<dyn WebhookHandler>,
        )
        .await;

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let snap = stats.snapshot();
        assert_eq!(snap.handler_errors, 1);
        assert_eq!(snap.released, 1);
    }

    #[test]
    fn limits_follow_config() {
        let cfg = WebhooksConfig {
            max_body_bytes: 10,
            body_timeout_secs: 20,
            handler_timeout_secs: 5,
        };
        let limits = WebhookLimits::from(&cfg);
        assert_eq!(limits.max_body_bytes, 10);
        assert_eq!(limits.body_timeout, Duration::from_secs(20));
        assert_eq!(limits.handler_timeout, Duration::from_secs(5));
    }
}
