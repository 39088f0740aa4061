use std::{
    future::{Ready, ready},
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use actix_web::{
    Error,
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    web,
};
use dashmap::DashMap;
use futures_util::future::LocalBoxFuture;
use log::{debug, info, warn};

use crate::error::RelayError;
use crate::relay_state::RelayState;

/// Requests seen from one client in the current window.
#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

/// Fixed-window request counter keyed by client identity.
///
/// A `max_requests` of zero disables the limiter. Rejected requests are not
/// counted, so a counter never exceeds `max_requests`.
#[derive(Debug)]
pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        RateLimiter {
            entries: DashMap::new(),
            max_requests,
            window,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_requests > 0
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Counts one request for `client`. Returns the number of requests still
    /// allowed in the current window.
    pub fn check(&self, client: &str) -> Result<u32, RelayError> {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: &str, now: Instant) -> Result<u32, RelayError> {
        if !self.is_enabled() {
            return Ok(u32::MAX);
        }

        let mut entry = self
            .entries
            .entry(client.to_string())
            .or_insert(RateLimitEntry {
                count: 0,
                window_start: now,
            });

        let elapsed = now.saturating_duration_since(entry.window_start);
        if elapsed >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count >= self.max_requests {
            let retry_after = self
                .window
                .saturating_sub(now.saturating_duration_since(entry.window_start));
            return Err(RelayError::RateLimited { retry_after });
        }

        entry.count += 1;
        Ok(self.max_requests - entry.count)
    }

    /// Requests counted for `client` in its current window.
    pub fn count(&self, client: &str) -> u32 {
        self.entries.get(client).map(|e| e.count).unwrap_or(0)
    }

    pub fn tracked_clients(&self) -> usize {
        self.entries.len()
    }

    /// Drops windows that have fully elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.window_start) < self.window);
        before.saturating_sub(self.entries.len())
    }
}

/// Periodically purges expired rate-limit windows so idle clients do not
/// accumulate in memory.
pub async fn periodic_purge(limiter: Arc<RateLimiter>) {
    if !limiter.is_enabled() {
        return;
    }
    info!(
        "Starting rate limit purge task with {}s interval",
        limiter.window().as_secs()
    );
    let mut interval = tokio::time::interval(limiter.window());
    loop {
        interval.tick().await;
        let removed = limiter.purge_expired();
        if removed > 0 {
            debug!("Purged {} expired rate limit windows", removed);
        }
    }
}

/// Resolves the client address the way a reverse-proxy aware server does:
/// the chain `[peer, xff_last, ..., xff_first]` is walked `trusted_hops`
/// entries, stopping at the furthest address available.
pub fn client_identity(
    peer: Option<IpAddr>,
    forwarded_for: Option<&str>,
    trusted_hops: usize,
) -> String {
    let mut chain: Vec<String> = peer.map(|ip| ip.to_string()).into_iter().collect();
    if trusted_hops > 0 {
        if let Some(forwarded_for) = forwarded_for {
            chain.extend(
                forwarded_for
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .rev()
                    .map(str::to_string),
            );
        }
    }
    let index = trusted_hops.min(chain.len().saturating_sub(1));
    chain
        .get(index)
        .cloned()
        .unwrap_or_else(|| "unknown".to_string())
}

/// Admission gate for `/chat-process`. Reads the limiter from the app's
/// [`RelayState`].
pub struct RateLimit;

impl<S, B> Transform<S, ServiceRequest> for RateLimit
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = RateLimitService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitService { service }))
    }
}

pub struct RateLimitService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RateLimitService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let verdict = match req.app_data::<web::Data<RelayState>>() {
            Some(state) => {
                let forwarded_for = req
                    .headers()
                    .get("x-forwarded-for")
                    .and_then(|h| h.to_str().ok());
                let client = client_identity(
                    req.peer_addr().map(|addr| addr.ip()),
                    forwarded_for,
                    state.config.trust_proxy,
                );
                state.limiter.check(&client).map_err(|err| (client, err))
            }
            None => Err((
                String::new(),
                RelayError::Internal("relay state is not configured".to_string()),
            )),
        };

        if let Err((client, err)) = verdict {
            warn!("Rejected {} {} from {}: {}", req.method(), req.path(), client, err);
            let response = req.error_response(err).map_into_right_body();
            return Box::pin(async move { Ok(response) });
        }

        let fut = self.service.call(req);
        Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) })
    }
}
