//! Tower middleware enforcing a [`Limiter`] on HTTP requests.
//!
//! Each request is checked against the limiter. Allowed requests reach the
//! inner service and carry the `X-RateLimit-*` headers on their response;
//! rejected requests are answered with `429 Too Many Requests` and a
//! `Retry-After` header. A failed check surfaces through the service error,
//! without any rate limit headers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{request::Parts, HeaderMap, Request, Response, StatusCode};
use tower::{BoxError, Layer, Service};
use tracing::{debug, warn};

use crate::error::Result;
use crate::ratelimit::{Decision, Identity, Limiter};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Body sent with a rejection.
pub const REJECTION_BODY: &str = "Too Many Requests";

type KeyFn = dyn Fn(&Parts) -> Result<Identity> + Send + Sync;

/// Where the identity of a request comes from.
#[derive(Clone)]
pub enum KeySource {
    /// Every request shares one identity.
    Fixed(Identity),
    /// The identity is derived from the request head.
    FromRequest(Arc<KeyFn>),
}

impl KeySource {
    /// Derive the identity from each request.
    pub fn from_request<F>(f: F) -> Self
    where
        F: Fn(&Parts) -> Result<Identity> + Send + Sync + 'static,
    {
        KeySource::FromRequest(Arc::new(f))
    }

    fn resolve(&self, parts: &Parts) -> Result<Identity> {
        match self {
            KeySource::Fixed(identity) => Ok(identity.clone()),
            KeySource::FromRequest(f) => f(parts),
        }
    }
}

impl From<Identity> for KeySource {
    fn from(identity: Identity) -> Self {
        KeySource::Fixed(identity)
    }
}

/// Headers describing `decision`, with the reset as an absolute Unix time.
pub fn rate_limit_headers(decision: &Decision, now: DateTime<Utc>) -> HeaderMap {
    let reset_at = (now.timestamp_millis() + decision.reset_ms as i64 + 999).div_euclid(1000);

    let mut headers = HeaderMap::with_capacity(3);
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(
        X_RATELIMIT_REMAINING,
        HeaderValue::from(decision.remaining.max(0)),
    );
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at));
    headers
}

/// Seconds a rejected caller should wait, rounded up.
pub fn retry_after_secs(decision: &Decision) -> u64 {
    decision.reset_ms.div_ceil(1000)
}

/// Layer applying [`RateLimitService`] to an inner service.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<Limiter>,
    key: KeySource,
    with_headers: bool,
}

impl RateLimitLayer {
    /// Enforce `limiter` on every request, identified by `key`.
    pub fn new(limiter: Arc<Limiter>, key: impl Into<KeySource>) -> Self {
        Self {
            limiter,
            key: key.into(),
            with_headers: true,
        }
    }

    /// Whether to emit rate limit headers. Enabled by default.
    pub fn with_headers(mut self, enabled: bool) -> Self {
        self.with_headers = enabled;
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
            key: self.key.clone(),
            with_headers: self.with_headers,
        }
    }
}

/// Service checking each request against a [`Limiter`] before forwarding it.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<Limiter>,
    key: KeySource,
    with_headers: bool,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    ReqBody: Send + 'static,
    ResBody: From<&'static str> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Keep the instance that was driven to readiness
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let limiter = Arc::clone(&self.limiter);
        let key = self.key.clone();
        let with_headers = self.with_headers;

        Box::pin(enforce(inner, limiter, key, with_headers, req))
    }
}

async fn enforce<S, ReqBody, ResBody>(
    mut inner: S,
    limiter: Arc<Limiter>,
    key: KeySource,
    with_headers: bool,
    req: Request<ReqBody>,
) -> std::result::Result<Response<ResBody>, BoxError>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Error: Into<BoxError>,
    ResBody: From<&'static str>,
{
    let (parts, body) = req.into_parts();
    let identity = key.resolve(&parts).map_err(|e| {
        warn!(error = %e, path = %parts.uri.path(), "Could not derive rate limit key");
        e
    })?;
    let decision = limiter.check(identity).await?;

    let headers = if with_headers {
        rate_limit_headers(&decision, Utc::now())
    } else {
        HeaderMap::new()
    };

    if decision.is_allowed() {
        let mut response = inner
            .call(Request::from_parts(parts, body))
            .await
            .map_err(Into::into)?;
        response.headers_mut().extend(headers);
        return Ok(response);
    }

    debug!(
        limiter = %limiter.name(),
        path = %parts.uri.path(),
        remaining = decision.remaining,
        "Rejecting request"
    );

    let mut response = Response::new(ResBody::from(REJECTION_BODY));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response.headers_mut().extend(headers);
    if with_headers {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(&decision)));
    }
    Ok(response)
}
