//! Rate-limited outbound request queue.
//!
//! Every connection gets its own worker task fed by a bounded channel. The worker handles
//! one request at a time, retries included, so calls for a connection leave in FIFO order and
//! a throttled account never delays another account's calls. Admission is gated by a
//! [`SlidingWindow`]; 429 and 5xx responses, network failures and per-attempt timeouts are
//! retried with exponential backoff until the attempt budget runs out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use rand::{Rng, thread_rng};
use reqwest::Method;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{RateLimitPolicyConfig, RequestQueueConfig, RetrySettings};
use crate::error::IngestError;
use crate::rate_limit::SlidingWindow;

pub const USER_AGENT: &str = concat!("commerce-connectors/", env!("CARGO_PKG_VERSION"));

/// A provider API call, independent of the HTTP client that will send it.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("authorization", format!("Bearer {token}"))
    }
}

/// Buffered provider response. Header names are lower-cased.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl OutboundResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// First 200 characters of the body, for error messages.
    pub fn body_snippet(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        if text.chars().count() > 200 {
            format!("{}...", text.chars().take(200).collect::<String>())
        } else {
            text.into_owned()
        }
    }

    /// `Retry-After` as delta-seconds (integer or fractional) or an HTTP date.
    pub fn retry_after(&self) -> Option<Duration> {
        let raw = self.header("retry-after")?.trim();
        if let Ok(seconds) = raw.parse::<f64>() {
            return (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds));
        }
        let at = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
        let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
        Some(delta.to_std().unwrap_or(Duration::ZERO))
    }
}

#[derive(Debug, Error)]
#[error("network error: {0}")]
pub struct TransportError(pub String);

/// Sends one request. Implemented over reqwest in production and by fakes in tests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &OutboundRequest) -> Result<OutboundResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<OutboundResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&request.query);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError(e.without_url().to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError(e.without_url().to_string()))?
            .to_vec();

        Ok(OutboundResponse {
            status,
            headers,
            body,
        })
    }
}

/// Returns how long to stop admitting requests after seeing `response`, if at all.
pub type ThrottleHint = fn(&OutboundResponse) -> Option<Duration>;

/// Backoff schedule: `base * multiplier^retry`, capped at `max_delay`, plus up to
/// `jitter_factor` of extra delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            jitter_factor: 0.0,
        }
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        Self {
            base: Duration::from_secs(settings.base_seconds),
            multiplier: settings.multiplier,
            max_delay: Duration::from_secs(settings.max_seconds),
            max_attempts: settings.max_attempts.max(1),
            jitter_factor: settings.jitter_factor,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0 for the first retry), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let seconds = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = seconds.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = thread_rng().gen_range(0.0..(self.jitter_factor * delay.as_secs_f64()));
        delay + Duration::from_secs_f64(extra)
    }
}

/// Terminal outcome of a queued request that did not produce a usable response.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    #[error("rate limit exceeded after {attempts} attempts")]
    RateLimitExceeded {
        attempts: u32,
        retry_after: Option<Duration>,
    },
    #[error("upstream unavailable after {attempts} attempts: {reason}")]
    UpstreamUnavailable {
        attempts: u32,
        status: Option<u16>,
        reason: String,
    },
    #[error("request timed out after {attempts} attempts of {timeout:?}")]
    Timeout { attempts: u32, timeout: Duration },
    #[error("request queue closed")]
    Closed,
}

impl QueueError {
    pub fn into_ingest(self, provider: &str) -> IngestError {
        match self {
            QueueError::RateLimitExceeded { retry_after, .. } => IngestError::RateLimitExceeded {
                retry_after_secs: retry_after.map(|d| d.as_secs().max(1)),
            },
            QueueError::Closed => IngestError::Cancelled,
            other => IngestError::UpstreamUnavailable {
                provider: provider.to_string(),
                message: other.to_string(),
            },
        }
    }
}

enum Failure {
    RateLimited(Option<Duration>),
    Server(u16),
    Network(String),
    TimedOut,
}

impl Failure {
    fn label(&self) -> &'static str {
        match self {
            Failure::RateLimited(_) => "rate_limited",
            Failure::Server(_) => "server_error",
            Failure::Network(_) => "network",
            Failure::TimedOut => "timeout",
        }
    }

    fn into_error(self, attempts: u32, request_timeout: Duration) -> QueueError {
        match self {
            Failure::RateLimited(retry_after) => QueueError::RateLimitExceeded {
                attempts,
                retry_after,
            },
            Failure::Server(status) => QueueError::UpstreamUnavailable {
                attempts,
                status: Some(status),
                reason: format!("HTTP {status}"),
            },
            Failure::Network(reason) => QueueError::UpstreamUnavailable {
                attempts,
                status: None,
                reason,
            },
            Failure::TimedOut => QueueError::Timeout {
                attempts,
                timeout: request_timeout,
            },
        }
    }
}

/// Settings for one connection's queue.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub requests_per_window: usize,
    pub window: Duration,
    pub request_timeout: Duration,
    pub capacity: usize,
    pub retry: RetryPolicy,
}

impl QueueSettings {
    pub fn for_provider(
        provider: &str,
        queue: &RequestQueueConfig,
        policy: &RateLimitPolicyConfig,
    ) -> Self {
        Self {
            requests_per_window: queue.requests_per_second_for(provider) as usize,
            window: queue.window(),
            request_timeout: queue.request_timeout(),
            capacity: queue.capacity,
            retry: policy.for_provider(provider).into(),
        }
    }
}

struct Job {
    request: OutboundRequest,
    reply: oneshot::Sender<Result<OutboundResponse, QueueError>>,
}

/// Cheap, cloneable handle to a connection's queue worker.
#[derive(Clone)]
pub struct RequestQueueHandle {
    connection_id: Uuid,
    sender: mpsc::Sender<Job>,
    cancel: CancellationToken,
}

impl RequestQueueHandle {
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Queue `request` behind everything already queued for this connection and wait for its
    /// final outcome. Non-retryable responses (2xx, 3xx, 4xx other than 429) are returned as-is.
    pub async fn enqueue(&self, request: OutboundRequest) -> Result<OutboundResponse, QueueError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Job { request, reply })
            .await
            .map_err(|_| QueueError::Closed)?;
        response.await.map_err(|_| QueueError::Closed)?
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.sender.is_closed()
    }

    /// Stop the worker. The in-flight request and everything still queued resolve to `Closed`.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct QueueWorker {
    connection_id: Uuid,
    provider: String,
    settings: QueueSettings,
    window: SlidingWindow,
    transport: Arc<dyn HttpTransport>,
    throttle: Option<ThrottleHint>,
}

/// Start a worker for one connection.
pub fn spawn_queue(
    connection_id: Uuid,
    provider: &str,
    settings: QueueSettings,
    transport: Arc<dyn HttpTransport>,
    throttle: Option<ThrottleHint>,
) -> RequestQueueHandle {
    let (sender, receiver) = mpsc::channel(settings.capacity.max(1));
    let cancel = CancellationToken::new();

    let worker = QueueWorker {
        connection_id,
        provider: provider.to_string(),
        window: SlidingWindow::new(settings.requests_per_window, settings.window),
        settings,
        transport,
        throttle,
    };
    tokio::spawn(worker.run(receiver, cancel.clone()));

    RequestQueueHandle {
        connection_id,
        sender,
        cancel,
    }
}

impl QueueWorker {
    async fn run(mut self, mut receiver: mpsc::Receiver<Job>, cancel: CancellationToken) {
        debug!(connection_id = %self.connection_id, provider = %self.provider, "request queue started");

        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = receiver.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(QueueError::Closed),
                result = self.execute(&job.request) => result,
            };
            // Caller may have given up; nothing to do then.
            let _ = job.reply.send(result);
        }

        receiver.close();
        while let Ok(job) = receiver.try_recv() {
            let _ = job.reply.send(Err(QueueError::Closed));
        }
        info!(connection_id = %self.connection_id, provider = %self.provider, "request queue stopped");
    }

    async fn execute(&mut self, request: &OutboundRequest) -> Result<OutboundResponse, QueueError> {
        let policy = self.settings.retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let waited = self.window.acquire().await;
            histogram!("request_queue_wait_seconds").record(waited.as_secs_f64());

            let failure =
                match timeout(self.settings.request_timeout, self.transport.send(request)).await {
                    Ok(Ok(response)) => {
                        if let Some(pause) = self.throttle.and_then(|hint| hint(&response)) {
                            debug!(
                                connection_id = %self.connection_id,
                                pause_ms = pause.as_millis() as u64,
                                "provider bucket nearly full, pausing admissions"
                            );
                            self.window.pause_for(pause);
                        }
                        match response.status {
                            429 => Failure::RateLimited(response.retry_after()),
                            status if status >= 500 => Failure::Server(status),
                            _ => return Ok(response),
                        }
                    }
                    Ok(Err(TransportError(reason))) => Failure::Network(reason),
                    Err(_) => Failure::TimedOut,
                };

            if attempt >= policy.max_attempts {
                warn!(
                    connection_id = %self.connection_id,
                    provider = %self.provider,
                    attempt,
                    reason = failure.label(),
                    "giving up on provider request"
                );
                return Err(failure.into_error(attempt, self.settings.request_timeout));
            }

            let delay = match &failure {
                Failure::RateLimited(Some(hint)) if *hint > policy.max_delay => {
                    // Holding the queue that long would stall every caller behind us.
                    return Err(QueueError::RateLimitExceeded {
                        attempts: attempt,
                        retry_after: Some(*hint),
                    });
                }
                Failure::RateLimited(Some(hint)) => *hint,
                _ => policy.with_jitter(policy.backoff(attempt - 1)),
            };

            counter!(
                "request_queue_retries_total",
                "provider" => self.provider.clone(),
                "reason" => failure.label()
            )
            .increment(1);
            warn!(
                connection_id = %self.connection_id,
                provider = %self.provider,
                attempt,
                reason = failure.label(),
                delay_ms = delay.as_millis() as u64,
                "retrying provider request"
            );

            sleep(delay).await;
        }
    }
}

/// Owns one queue per connection. Queues are created on first use and torn down on
/// disconnect, so idle or removed connections hold no worker.
pub struct QueueRegistry {
    transport: Arc<dyn HttpTransport>,
    queue_config: RequestQueueConfig,
    retry_config: RateLimitPolicyConfig,
    queues: Mutex<HashMap<Uuid, RequestQueueHandle>>,
}

impl QueueRegistry {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        queue_config: RequestQueueConfig,
        retry_config: RateLimitPolicyConfig,
    ) -> Self {
        Self {
            transport,
            queue_config,
            retry_config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RequestQueueHandle>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The live queue for `connection_id`, spawning one if needed.
    pub fn get_or_create(
        &self,
        connection_id: Uuid,
        provider: &str,
        throttle: Option<ThrottleHint>,
    ) -> RequestQueueHandle {
        let mut queues = self.lock();
        if let Some(handle) = queues.get(&connection_id).filter(|h| !h.is_closed()) {
            return handle.clone();
        }

        let settings = QueueSettings::for_provider(provider, &self.queue_config, &self.retry_config);
        let handle = spawn_queue(
            connection_id,
            provider,
            settings,
            self.transport.clone(),
            throttle,
        );
        queues.insert(connection_id, handle.clone());
        handle
    }

    /// Tear down a connection's queue. Returns whether one existed.
    pub fn remove(&self, connection_id: Uuid) -> bool {
        match self.lock().remove(&connection_id) {
            Some(handle) => {
                handle.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown_all(&self) {
        for (_, handle) in self.lock().drain() {
            handle.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Transport that replays scripted statuses and records dispatch instants.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        dispatched: Mutex<Vec<(Instant, String)>>,
        calls: AtomicUsize,
    }

    enum Scripted {
        Status(u16, Vec<(&'static str, &'static str)>),
        NetworkError,
        Hang,
    }

    impl ScriptedTransport {
        fn with(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            })
        }

        fn dispatched(&self) -> Vec<(Instant, String)> {
            self.dispatched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: &OutboundRequest) -> Result<OutboundResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.dispatched
                .lock()
                .unwrap()
                .push((Instant::now(), request.url.clone()));
            let next = self.script.lock().unwrap().pop_front();
            match next {
                None => Ok(ok_response()),
                Some(Scripted::Status(status, headers)) => Ok(OutboundResponse {
                    status,
                    headers: headers
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    body: Vec::new(),
                }),
                Some(Scripted::NetworkError) => Err(TransportError("connection reset".into())),
                Some(Scripted::Hang) => {
                    sleep(Duration::from_secs(3600)).await;
                    Ok(ok_response())
                }
            }
        }
    }

    fn ok_response() -> OutboundResponse {
        OutboundResponse {
            status: 200,
            headers: HashMap::new(),
            body: b"{}".to_vec(),
        }
    }

    fn settings(rate: usize) -> QueueSettings {
        QueueSettings {
            requests_per_window: rate,
            window: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            capacity: 256,
            retry: RetryPolicy::default(),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(10));
        assert_eq!(policy.backoff(40), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_factor() {
        let policy = RetryPolicy {
            jitter_factor: 0.5,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let delay = policy.with_jitter(Duration::from_secs(4));
            assert!(delay >= Duration::from_secs(4));
            assert!(delay < Duration::from_secs(6));
        }
    }

    #[test]
    fn retry_after_parses_seconds_and_fractions() {
        let mut response = ok_response();
        response
            .headers
            .insert("retry-after".to_string(), "2.5".to_string());
        assert_eq!(response.retry_after(), Some(Duration::from_millis(2500)));

        response
            .headers
            .insert("retry-after".to_string(), "soon".to_string());
        assert_eq!(response.retry_after(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn hundred_requests_respect_forty_per_second() {
        let transport = ScriptedTransport::with(vec![]);
        let queue = spawn_queue(Uuid::new_v4(), "stripe", settings(40), transport.clone(), None);

        let started = Instant::now();
        let mut pending = Vec::new();
        for i in 0..100 {
            let queue = queue.clone();
            pending.push(tokio::spawn(async move {
                queue
                    .enqueue(OutboundRequest::get(format!("https://api.test/{i}")))
                    .await
            }));
        }
        for task in pending {
            assert!(task.await.unwrap().is_ok());
        }

        // ceil(100 / 40) - 1 windows of enforced waiting
        assert!(started.elapsed() >= Duration::from_secs(2));

        let dispatched: Vec<Instant> = transport.dispatched().into_iter().map(|(t, _)| t).collect();
        assert_eq!(dispatched.len(), 100);
        for (i, start) in dispatched.iter().enumerate() {
            let in_window = dispatched[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < Duration::from_secs(1))
                .count();
            assert!(in_window <= 40, "{in_window} dispatches within one second");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn requests_leave_in_fifo_order() {
        let transport = ScriptedTransport::with(vec![
            Scripted::Status(503, vec![]),
            Scripted::Status(200, vec![]),
        ]);
        let queue = spawn_queue(Uuid::new_v4(), "shopify", settings(2), transport.clone(), None);

        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(OutboundRequest::get("first")).await })
        };
        tokio::task::yield_now().await;
        let second = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(OutboundRequest::get("second")).await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let urls: Vec<String> = transport.dispatched().into_iter().map(|(_, u)| u).collect();
        // The retry of "first" goes out before "second" is attempted.
        assert_eq!(urls, vec!["first", "first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn honours_retry_after_on_429() {
        let transport = ScriptedTransport::with(vec![Scripted::Status(
            429,
            vec![("retry-after", "7")],
        )]);
        let queue = spawn_queue(Uuid::new_v4(), "shopify", settings(40), transport.clone(), None);

        let started = Instant::now();
        let response = queue.enqueue(OutboundRequest::get("orders")).await.unwrap();
        assert_eq!(response.status, 200);

        let dispatched = transport.dispatched();
        assert_eq!(dispatched.len(), 2);
        assert_eq!(dispatched[1].0 - dispatched[0].0, Duration::from_secs(7));
        assert!(started.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_beyond_cap_surfaces_immediately() {
        let transport = ScriptedTransport::with(vec![Scripted::Status(
            429,
            vec![("retry-after", "3600")],
        )]);
        let queue = spawn_queue(Uuid::new_v4(), "shopify", settings(40), transport.clone(), None);

        let err = queue.enqueue(OutboundRequest::get("orders")).await.unwrap_err();
        assert_eq!(
            err,
            QueueError::RateLimitExceeded {
                attempts: 1,
                retry_after: Some(Duration::from_secs(3600))
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_429_without_hint_exhausts_attempts() {
        let transport = ScriptedTransport::with(
            (0..5).map(|_| Scripted::Status(429, vec![])).collect(),
        );
        let queue = spawn_queue(Uuid::new_v4(), "stripe", settings(40), transport.clone(), None);

        let started = Instant::now();
        let err = queue.enqueue(OutboundRequest::get("charges")).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::RateLimitExceeded {
                attempts: 5,
                retry_after: None
            }
        ));
        // 1 + 2 + 4 + 8 seconds of backoff between five attempts
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
        assert!(err.clone().into_ingest("stripe").to_string().contains("rate limit"));
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_and_network_failures_become_upstream_unavailable() {
        let transport = ScriptedTransport::with(vec![
            Scripted::NetworkError,
            Scripted::Status(502, vec![]),
            Scripted::Status(500, vec![]),
            Scripted::NetworkError,
            Scripted::Status(503, vec![]),
        ]);
        let queue = spawn_queue(Uuid::new_v4(), "stripe", settings(40), transport.clone(), None);

        let err = queue.enqueue(OutboundRequest::get("charges")).await.unwrap_err();
        assert_eq!(
            err,
            QueueError::UpstreamUnavailable {
                attempts: 5,
                status: Some(503),
                reason: "HTTP 503".to_string()
            }
        );
        assert!(matches!(
            err.into_ingest("stripe"),
            IngestError::UpstreamUnavailable { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_returned_without_retry() {
        let transport = ScriptedTransport::with(vec![Scripted::Status(401, vec![])]);
        let queue = spawn_queue(Uuid::new_v4(), "stripe", settings(40), transport.clone(), None);

        let response = queue.enqueue(OutboundRequest::get("balance")).await.unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_provider_surfaces_as_timeout() {
        let transport = ScriptedTransport::with((0..5).map(|_| Scripted::Hang).collect());
        let queue = spawn_queue(Uuid::new_v4(), "shopify", settings(40), transport, None);

        let err = queue.enqueue(OutboundRequest::get("shop")).await.unwrap_err();
        assert!(matches!(err, QueueError::Timeout { attempts: 5, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_hint_pauses_admission() {
        fn always_pause(_: &OutboundResponse) -> Option<Duration> {
            Some(Duration::from_millis(500))
        }
        let transport = ScriptedTransport::with(vec![]);
        let queue = spawn_queue(
            Uuid::new_v4(),
            "shopify",
            settings(40),
            transport.clone(),
            Some(always_pause),
        );

        queue.enqueue(OutboundRequest::get("a")).await.unwrap();
        queue.enqueue(OutboundRequest::get("b")).await.unwrap();
        let dispatched = transport.dispatched();
        assert_eq!(dispatched[1].0 - dispatched[0].0, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_pending_callers() {
        let transport = ScriptedTransport::with(vec![Scripted::Hang]);
        let queue = spawn_queue(Uuid::new_v4(), "shopify", settings(40), transport, None);

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(OutboundRequest::get("slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();

        assert_eq!(waiting.await.unwrap().unwrap_err(), QueueError::Closed);
        assert_eq!(
            queue.enqueue(OutboundRequest::get("late")).await.unwrap_err(),
            QueueError::Closed
        );
    }

    #[tokio::test]
    async fn registry_reuses_and_tears_down_queues() {
        let registry = QueueRegistry::new(
            ScriptedTransport::with(vec![]),
            RequestQueueConfig::default(),
            RateLimitPolicyConfig::default(),
        );
        let id = Uuid::new_v4();

        let a = registry.get_or_create(id, "stripe", None);
        let b = registry.get_or_create(id, "stripe", None);
        assert_eq!(registry.len(), 1);
        assert!(a.enqueue(OutboundRequest::get("x")).await.is_ok());
        assert!(b.enqueue(OutboundRequest::get("y")).await.is_ok());

        assert!(registry.remove(id));
        assert!(registry.is_empty());
        assert!(a.is_closed());
        assert!(!registry.remove(id));

        let fresh = registry.get_or_create(id, "stripe", None);
        assert!(!fresh.is_closed());
        registry.shutdown_all();
        assert!(fresh.is_closed());
    }
}
