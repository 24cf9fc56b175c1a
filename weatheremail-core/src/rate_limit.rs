//! Per-minute token bucket gating outbound provider calls.
//!
//! The bucket starts full, so the first `capacity` calls go out immediately.
//! Once empty, waiters poll until a full minute has passed since the last
//! refill, at which point the bucket resets to `capacity` in one step.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, Method, Response, Url};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

use crate::error::ApiError;

/// Length of the rate-limit window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Default delay between refill checks while waiting for a token.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    /// Full reset once the window has elapsed; otherwise untouched.
    fn refill(&mut self, capacity: u32, now: Instant) {
        if now.duration_since(self.last_refill) > WINDOW {
            self.tokens = f64::from(capacity);
            self.last_refill = now;
        }
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    poll_interval: Duration,
    // Tokio's mutex hands out the lock in arrival order, so waiters are
    // admitted first come, first served.
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32) -> Result<Self, ApiError> {
        Self::with_poll_interval(capacity, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(capacity: u32, poll_interval: Duration) -> Result<Self, ApiError> {
        if capacity == 0 {
            return Err(ApiError::Config(
                "rate limit must allow at least one call per minute".to_string(),
            ));
        }

        Ok(Self {
            capacity,
            poll_interval,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens left right now, after the lazy refill check.
    ///
    /// Queues behind any caller blocked in [`acquire`](Self::acquire), which
    /// can be most of a window when the bucket is empty. Use
    /// [`try_available`](Self::try_available) where that wait is unwanted.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.refill(self.capacity, Instant::now());
        state.tokens
    }

    /// Like [`available`](Self::available), but `None` instead of waiting
    /// while another caller holds the bucket.
    pub fn try_available(&self) -> Option<f64> {
        let mut state = self.state.try_lock().ok()?;
        state.refill(self.capacity, Instant::now());
        Some(state.tokens)
    }

    /// Wait until a token is free and take it. Never fails, only delays.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        let started = Instant::now();

        loop {
            state.refill(self.capacity, Instant::now());
            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                debug!(
                    tokens_left = state.tokens,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "token acquired"
                );
                return;
            }

            trace!(poll_ms = self.poll_interval.as_millis() as u64, "bucket empty, waiting");
            // The guard stays held so later arrivals queue behind this waiter.
            sleep(self.poll_interval).await;
        }
    }

    /// Take a token, then run `op`. The token is spent even if `op` fails.
    pub async fn call<F, Fut, T>(&self, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire().await;
        op().await
    }
}

/// HTTP session that owns the bucket shared by every call made through it.
#[derive(Debug)]
pub struct RateLimitedSession {
    http: Client,
    bucket: TokenBucket,
}

impl RateLimitedSession {
    pub fn new(limit: u32) -> Result<Self, ApiError> {
        Ok(Self::with_bucket(Client::new(), TokenBucket::new(limit)?))
    }

    pub fn with_bucket(http: Client, bucket: TokenBucket) -> Self {
        Self { http, bucket }
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// Issue `method url?params` once a token is available.
    ///
    /// Only GET is used by the provider client; other verbs go through the
    /// same path if the provider ever accepts them.
    pub async fn api_call(
        &self,
        method: Method,
        url: Url,
        params: &[(&str, &str)],
    ) -> Result<Response, ApiError> {
        self.bucket
            .call(|| async {
                debug!(%method, %url, "sending provider request");
                self.http
                    .request(method.clone(), url.clone())
                    .query(params)
                    .send()
                    .await
            })
            .await
            .map_err(ApiError::from)
    }
}
