//! Fetch orchestration: cache, politeness, retries and challenge escalation.
//!
//! One call moves through:
//!
//! ```text
//! cache check ─hit──────────────────────────────────────────────▶ content
//!      │miss
//!      ▼
//! rate wait ─▶ transport ─▶ classify ─content─▶ cache put ──────▶ content
//!      ▲                        ├─blocked─────────────────────────▶ Blocked
//!      │                        ├─challenge─▶ browser (once) ─────▶ content | ChallengeUnsolved
//!      └──── backoff ◀──────────┴─error / transport failure ──────▶ MaxRetriesExceeded
//! ```
//!
//! The rate slot is released as soon as the transport call returns, before
//! classification, so it is never held across a backoff sleep or a browser
//! render.

use crate::cache::{spawn_sweeper, PageCache};
use crate::challenge::{ChallengeDetector, PageClass};
use crate::config::FetchConfig;
use crate::error::{FailureKind, FetchFailure, FetchResult, RenderError, TransportError};
use crate::fallback::{ChromiumExecutor, DisabledExecutor, FallbackExecutor, RenderedPage};
use crate::fingerprint::FingerprintProfile;
use crate::rate_limiter::RateLimiter;
use crate::transport::{HttpTransport, Transport, TransportResponse};
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, OnceCell};
use tokio::task::JoinHandle;

/// How a single network attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Content,
    Challenge,
    Blocked,
    Error,
    TransportError,
}

impl From<PageClass> for AttemptOutcome {
    fn from(class: PageClass) -> Self {
        match class {
            PageClass::Content => AttemptOutcome::Content,
            PageClass::Challenge => AttemptOutcome::Challenge,
            PageClass::Blocked => AttemptOutcome::Blocked,
            PageClass::Error => AttemptOutcome::Error,
        }
    }
}

/// Record of one try within a fetch call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchAttempt {
    /// Zero-based attempt index.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    /// HTTP status, when a response arrived.
    pub status: Option<u16>,
    /// Sleep taken after this attempt before the next one.
    pub backoff: Option<Duration>,
}

/// A fetch result plus the attempts that produced it.
///
/// Cache hits carry no attempts. Callers that joined an in-flight fetch see
/// the attempts of the shared call.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub result: FetchResult,
    pub attempts: Vec<FetchAttempt>,
    /// Whether the browser fallback was invoked.
    pub escalated: bool,
}

impl FetchOutcome {
    fn new(result: FetchResult, attempts: Vec<FetchAttempt>) -> Self {
        Self {
            result,
            attempts,
            escalated: false,
        }
    }

    fn from_cache(content: String) -> Self {
        Self::new(Ok(content), Vec::new())
    }

    /// Backoff sleeps taken, in order.
    pub fn backoffs(&self) -> Vec<Duration> {
        self.attempts.iter().filter_map(|a| a.backoff).collect()
    }
}

type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;
type WeakFetch = WeakShared<BoxFuture<'static, FetchOutcome>>;

struct Inner {
    config: FetchConfig,
    profile: FingerprintProfile,
    detector: ChallengeDetector,
    cache: Arc<PageCache>,
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn Transport>,
    fallback: Arc<dyn FallbackExecutor>,
    /// Weak so that a fetch every caller abandoned is dropped with its rate slot.
    in_flight: Mutex<HashMap<String, WeakFetch>>,
    warmed_up: OnceCell<()>,
    closed: AtomicBool,
    shutdown: Arc<Notify>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// The single entry point for fetching pages.
///
/// Cheap to clone; clones share the cache, rate limiter, capabilities and
/// in-flight table.
#[derive(Clone)]
pub struct FetchOrchestrator {
    inner: Arc<Inner>,
}

/// Builder for [`FetchOrchestrator`]. Unset capabilities get production defaults.
pub struct FetchOrchestratorBuilder {
    config: FetchConfig,
    transport: Option<Arc<dyn Transport>>,
    fallback: Option<Arc<dyn FallbackExecutor>>,
    cache: Option<Arc<PageCache>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl FetchOrchestratorBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn FallbackExecutor>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn cache(mut self, cache: Arc<PageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Build the orchestrator.
    ///
    /// The cache sweeper (when configured) is only started inside a Tokio runtime.
    pub fn build(self) -> FetchOrchestrator {
        let config = self.config;
        let detector = config.detector();
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(PageCache::new(config.cache_ttl(), config.cache_max_entries))
        });
        let limiter = self.limiter.unwrap_or_else(|| {
            Arc::new(RateLimiter::new(
                config.max_concurrent_requests,
                config.request_delay(),
            ))
        });
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new()) as Arc<dyn Transport>);
        let fallback = self.fallback.unwrap_or_else(|| {
            if config.browser_enabled {
                let mut executor =
                    ChromiumExecutor::new(config.browser_challenge_wait(), detector.clone());
                if let Some(path) = &config.chromium_path {
                    executor = executor.with_chrome_path(PathBuf::from(path));
                }
                Arc::new(executor) as Arc<dyn FallbackExecutor>
            } else {
                Arc::new(DisabledExecutor)
            }
        });

        let shutdown = Arc::new(Notify::new());
        let sweeper = match (
            config.cache_sweep_interval(),
            tokio::runtime::Handle::try_current(),
        ) {
            (Some(every), Ok(_)) => Some(spawn_sweeper(
                Arc::clone(&cache),
                every,
                Arc::clone(&shutdown),
            )),
            (Some(_), Err(_)) => {
                tracing::warn!("cache sweep configured outside a Tokio runtime; not started");
                None
            }
            (None, _) => None,
        };

        FetchOrchestrator {
            inner: Arc::new(Inner {
                profile: config.fingerprint(),
                detector,
                cache,
                limiter,
                transport,
                fallback,
                in_flight: Mutex::new(HashMap::new()),
                warmed_up: OnceCell::new(),
                closed: AtomicBool::new(false),
                shutdown,
                sweeper: Mutex::new(sweeper),
                config,
            }),
        }
    }
}

impl FetchOrchestrator {
    pub fn builder(config: FetchConfig) -> FetchOrchestratorBuilder {
        FetchOrchestratorBuilder {
            config,
            transport: None,
            fallback: None,
            cache: None,
            limiter: None,
        }
    }

    /// Orchestrator with the default `reqwest` transport and Chromium fallback.
    pub fn new(config: FetchConfig) -> Self {
        Self::builder(config).build()
    }

    /// Fetch `url`, returning page content or a typed failure.
    pub async fn fetch(&self, url: &str) -> FetchResult {
        self.fetch_traced(url).await.result
    }

    /// Like [`fetch`](Self::fetch), also returning the attempt trace.
    pub async fn fetch_traced(&self, url: &str) -> FetchOutcome {
        let inner = &self.inner;
        if inner.is_closed() {
            return FetchOutcome::new(Err(FetchFailure::closed()), Vec::new());
        }

        if let Some(content) = inner.cache.get(url) {
            tracing::debug!("cache hit: {url}");
            return FetchOutcome::from_cache(content);
        }
        tracing::debug!("cache miss: {url}");

        if !inner.config.dedupe_in_flight {
            return inner.run(url).await;
        }

        let shared = {
            let mut in_flight = inner.in_flight();
            match in_flight.get(url).and_then(WeakShared::upgrade) {
                Some(existing) => {
                    tracing::debug!("joining in-flight fetch: {url}");
                    existing
                }
                None => {
                    // Entries left behind by abandoned fetches.
                    in_flight.retain(|_, weak| weak.upgrade().is_some());
                    let fut = Self::shared_fetch(Arc::clone(inner), url.to_string());
                    if let Some(weak) = fut.downgrade() {
                        in_flight.insert(url.to_string(), weak);
                    }
                    fut
                }
            }
        };
        shared.await
    }

    fn shared_fetch(inner: Arc<Inner>, url: String) -> SharedFetch {
        async move {
            let outcome = inner.run(&url).await;
            inner.in_flight().remove(&url);
            outcome
        }
        .boxed()
        .shared()
    }

    /// Shut down: reject new and waiting fetches, stop the sweeper, and
    /// release the transport's connections and the browser. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.limiter.close();
        inner.shutdown.notify_one();
        let sweeper = inner
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }
        inner.in_flight().clear();
        inner.transport.close().await;
        inner.fallback.close().await;
        tracing::info!("fetch orchestrator closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.inner.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn config(&self) -> &FetchConfig {
        &self.inner.config
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, WeakFetch>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One transport call bounded by the request timeout.
    async fn send(&self, url: &str) -> Result<TransportResponse, TransportError> {
        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, self.transport.send(url, &self.profile, timeout)).await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Visit the site root once so the cookie jar holds a session before
    /// the first real request. Failures are ignored.
    async fn warm_up(&self) {
        if !self.config.warmup {
            return;
        }
        self.warmed_up
            .get_or_init(|| async {
                let Ok(slot) = self.limiter.acquire().await else {
                    return;
                };
                let base_url = self.config.base_url.as_str();
                match self.send(base_url).await {
                    Ok(resp) => tracing::info!("warm-up {base_url}: status {}", resp.status),
                    Err(e) => tracing::debug!("warm-up {base_url} failed: {e}"),
                }
                drop(slot);
                tokio::time::sleep(self.config.warmup_pause()).await;
            })
            .await;
    }

    /// `unit * 2^attempt`, raised to the server's Retry-After, capped at `max_backoff`.
    fn backoff_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponential = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.config.backoff_unit().checked_mul(factor))
            .unwrap_or(Duration::MAX);
        exponential
            .max(retry_after.unwrap_or_default())
            .min(self.config.max_backoff())
    }

    async fn run(&self, url: &str) -> FetchOutcome {
        let mut attempts = Vec::new();
        self.warm_up().await;

        let mut attempt: u32 = 0;
        loop {
            let Ok(slot) = self.limiter.acquire().await else {
                return FetchOutcome::new(Err(FetchFailure::closed()), attempts);
            };
            // Another caller may have filled the cache while we queued.
            if let Some(content) = self.cache.get(url) {
                drop(slot);
                tracing::debug!("cache filled while waiting: {url}");
                return FetchOutcome::new(Ok(content), attempts);
            }
            let sent = self.send(url).await;
            drop(slot);

            let (outcome, status, detail, retry_after) = match sent {
                Ok(resp) => {
                    let class = self.detector.classify(resp.status, &resp.body);
                    let record = FetchAttempt {
                        attempt,
                        outcome: class.into(),
                        status: Some(resp.status),
                        backoff: None,
                    };
                    match class {
                        PageClass::Content => {
                            attempts.push(record);
                            self.cache.put(url, resp.body.as_str());
                            tracing::debug!("fetched {url}: {} bytes", resp.body.len());
                            return FetchOutcome::new(Ok(resp.body), attempts);
                        }
                        PageClass::Blocked => {
                            attempts.push(record);
                            tracing::warn!("blocked (403) for {url}");
                            return FetchOutcome::new(Err(FetchFailure::blocked(url)), attempts);
                        }
                        PageClass::Challenge => {
                            attempts.push(record);
                            return self.escalate(url, attempts).await;
                        }
                        PageClass::Error => (
                            AttemptOutcome::Error,
                            Some(resp.status),
                            format!("server returned status {} for URL: {url}", resp.status),
                            resp.retry_after(),
                        ),
                    }
                }
                Err(e) if !e.is_retryable() => {
                    attempts.push(FetchAttempt {
                        attempt,
                        outcome: AttemptOutcome::TransportError,
                        status: None,
                        backoff: None,
                    });
                    tracing::warn!("request for {url} failed permanently: {e}");
                    let failure =
                        FetchFailure::new(FailureKind::Transport, format!("{e} (URL: {url})"));
                    return FetchOutcome::new(Err(failure), attempts);
                }
                Err(e) => (
                    AttemptOutcome::TransportError,
                    None,
                    format!("request failed for URL: {url}: {e}"),
                    None,
                ),
            };

            if attempt >= self.config.max_retries {
                attempts.push(FetchAttempt {
                    attempt,
                    outcome,
                    status,
                    backoff: None,
                });
                tracing::warn!("giving up on {url} after {} attempt(s): {detail}", attempt + 1);
                let failure = FetchFailure::new(
                    FailureKind::MaxRetriesExceeded,
                    format!("gave up after {} attempt(s): {detail}", attempt + 1),
                );
                return FetchOutcome::new(Err(failure), attempts);
            }

            let backoff = self.backoff_for(attempt, retry_after);
            attempts.push(FetchAttempt {
                attempt,
                outcome,
                status,
                backoff: Some(backoff),
            });
            tracing::warn!(
                "attempt {} for {url} failed ({detail}); retrying in {}ms",
                attempt + 1,
                backoff.as_millis()
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// Hand a challenged URL to the browser, exactly once.
    async fn escalate(&self, url: &str, attempts: Vec<FetchAttempt>) -> FetchOutcome {
        if !self.config.browser_enabled {
            tracing::warn!("challenge page for {url}, browser fallback disabled");
            let failure = FetchFailure::new(
                FailureKind::ChallengeUnsolved,
                format!("challenge page detected but browser fallback is disabled for URL: {url}"),
            );
            return FetchOutcome::new(Err(failure), attempts);
        }

        tracing::info!("challenge page detected for {url}, falling back to browser");
        let timeout = self.config.browser_timeout();
        let rendered: Result<RenderedPage, RenderError> = match tokio::time::timeout(
            timeout,
            self.fallback
                .render(url, self.config.browser_headless, timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RenderError::Timeout(timeout.as_millis() as u64)),
        };

        let result = match rendered {
            Ok(page) => match self.detector.classify(200, &page.body) {
                PageClass::Content => {
                    self.cache.put(url, page.body.as_str());
                    tracing::info!("browser fallback solved challenge for {url}");
                    Ok(page.body)
                }
                _ => Err(FetchFailure::new(
                    FailureKind::ChallengeUnsolved,
                    format!("challenge page persisted after browser render for URL: {url}"),
                )),
            },
            Err(e) => Err(FetchFailure::new(
                FailureKind::ChallengeUnsolved,
                format!("browser fallback failed for URL: {url}: {e}"),
            )),
        };
        if let Err(failure) = &result {
            tracing::warn!("{failure}");
        }

        FetchOutcome {
            result,
            attempts,
            escalated: true,
        }
    }
}
