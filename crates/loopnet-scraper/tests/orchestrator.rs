//! End-to-end orchestrator behaviour against fake capabilities.
//!
//! Timing-sensitive tests run on a paused Tokio clock, so backoff and
//! spacing are asserted exactly without real sleeping.

use async_trait::async_trait;
use loopnet_scraper::{
    AttemptOutcome, FailureKind, FallbackExecutor, FetchConfig, FetchOrchestrator,
    FingerprintProfile, PageCache, RateLimiter, RenderError, RenderedPage, Transport,
    TransportError, TransportResponse,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const URL: &str = "https://www.loopnet.com/search/commercial-real-estate/dallas-tx/for-sale/";
const CHALLENGE: &str = r#"<html><div id="sec-if-cpt-container"><script src="/akam/13/pixel_1"></script></div></html>"#;

fn listing_page() -> String {
    format!(
        "<html><body><article class=\"placard\">Listing</article>{}</body></html>",
        "x".repeat(20_000)
    )
}

// ── Fakes ──

/// Transport replaying a script (the last step repeats) and recording calls.
struct FakeTransport {
    script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    calls: AtomicUsize,
    /// Simulated network latency.
    latency: Duration,
    /// Admission instants seen by the transport.
    seen_at: Mutex<Vec<Instant>>,
}

impl FakeTransport {
    fn new(script: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
        Self::with_latency(script, Duration::ZERO)
    }

    fn with_latency(
        script: Vec<Result<TransportResponse, TransportError>>,
        latency: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            latency,
            seen_at: Mutex::new(Vec::new()),
        })
    }

    fn ok(status: u16, body: impl Into<String>) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse::new(status, body))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(
        &self,
        _url: &str,
        _profile: &FingerprintProfile,
        _timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_at.lock().unwrap().push(Instant::now());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        }
    }
}

/// Fallback returning a fixed body and counting invocations.
struct FakeFallback {
    result: Result<String, RenderError>,
    calls: AtomicUsize,
}

impl FakeFallback {
    fn returning(body: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(body.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(err: RenderError) -> Arc<Self> {
        Arc::new(Self {
            result: Err(err),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FallbackExecutor for FakeFallback {
    async fn render(
        &self,
        url: &str,
        _headless: bool,
        _timeout: Duration,
    ) -> Result<RenderedPage, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone().map(|body| RenderedPage {
            final_url: url.to_string(),
            body,
        })
    }
}

fn config() -> FetchConfig {
    FetchConfig {
        request_delay_seconds: 0.0,
        warmup: false,
        ..FetchConfig::default()
    }
}

fn orchestrator(
    config: FetchConfig,
    transport: &Arc<FakeTransport>,
    fallback: &Arc<FakeFallback>,
) -> FetchOrchestrator {
    FetchOrchestrator::builder(config)
        .transport(transport.clone())
        .fallback(fallback.clone())
        .build()
}

// ── Scenarios ──

#[tokio::test]
async fn cached_url_is_served_without_network() {
    let transport = FakeTransport::new(vec![FakeTransport::ok(500, "")]);
    let fallback = FakeFallback::returning("");
    let cache = Arc::new(PageCache::new(Duration::from_secs(300), 500));
    cache.put(URL, "<html>cached</html>");

    let orchestrator = FetchOrchestrator::builder(config())
        .transport(transport.clone())
        .fallback(fallback.clone())
        .cache(cache)
        .build();

    let outcome = orchestrator.fetch_traced(URL).await;
    assert_eq!(outcome.result.unwrap(), "<html>cached</html>");
    assert!(outcome.attempts.is_empty());
    assert_eq!(transport.calls(), 0);
    assert_eq!(orchestrator.limiter().active(), 0);
}

#[tokio::test]
async fn forbidden_is_blocked_without_retry_or_fallback() {
    let transport = FakeTransport::new(vec![FakeTransport::ok(403, "Access Denied")]);
    let fallback = FakeFallback::returning(listing_page());
    let orchestrator = orchestrator(config(), &transport, &fallback);

    let outcome = orchestrator.fetch_traced(URL).await;
    let failure = outcome.result.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Blocked);
    assert!(failure.detail.contains(URL));
    assert_eq!(transport.calls(), 1);
    assert_eq!(fallback.calls(), 0);
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(outcome.attempts[0].backoff, None);
    assert_eq!(orchestrator.limiter().active(), 0);
}

#[tokio::test]
async fn ordinary_page_is_returned_and_cached() {
    let body = listing_page();
    let transport = FakeTransport::new(vec![FakeTransport::ok(200, body.clone())]);
    let fallback = FakeFallback::returning("");
    let orchestrator = orchestrator(config(), &transport, &fallback);

    assert_eq!(orchestrator.fetch(URL).await.unwrap(), body);
    assert_eq!(orchestrator.cache().get(URL), Some(body.clone()));

    // A second fetch is a cache hit.
    assert_eq!(orchestrator.fetch(URL).await.unwrap(), body);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_exponentially() {
    let body = listing_page();
    let transport = FakeTransport::new(vec![
        Err(TransportError::Connect("connection refused".into())),
        Err(TransportError::Timeout(30_000)),
        FakeTransport::ok(200, body.clone()),
    ]);
    let fallback = FakeFallback::returning("");
    let orchestrator = orchestrator(config(), &transport, &fallback);

    let started = Instant::now();
    let outcome = orchestrator.fetch_traced(URL).await;
    assert_eq!(outcome.result.as_deref(), Ok(body.as_str()));
    assert_eq!(transport.calls(), 3);
    assert_eq!(
        outcome.backoffs(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));

    let outcomes: Vec<AttemptOutcome> = outcome.attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            AttemptOutcome::TransportError,
            AttemptOutcome::TransportError,
            AttemptOutcome::Content
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_report_last_transport_error() {
    let transport = FakeTransport::new(vec![Err(TransportError::Connect("connection refused".into()))]);
    let fallback = FakeFallback::returning("");
    let orchestrator = orchestrator(
        FetchConfig {
            max_retries: 2,
            ..config()
        },
        &transport,
        &fallback,
    );

    let failure = orchestrator.fetch(URL).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::MaxRetriesExceeded);
    assert!(failure.detail.contains("connection refused"));
    assert_eq!(transport.calls(), 3);
    assert_eq!(orchestrator.limiter().active(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_transport_times_out_and_retries() {
    let transport = FakeTransport::with_latency(
        vec![FakeTransport::ok(200, listing_page())],
        Duration::from_secs(60),
    );
    let fallback = FakeFallback::returning("");
    let orchestrator = orchestrator(
        FetchConfig {
            timeout_seconds: 5.0,
            max_retries: 1,
            ..config()
        },
        &transport,
        &fallback,
    );

    let failure = orchestrator.fetch(URL).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::MaxRetriesExceeded);
    assert!(failure.detail.contains("timed out"));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn challenge_escalates_to_fallback_once() {
    let transport = FakeTransport::new(vec![FakeTransport::ok(200, CHALLENGE)]);
    let fallback = FakeFallback::returning(CHALLENGE);
    let orchestrator = orchestrator(config(), &transport, &fallback);

    let outcome = orchestrator.fetch_traced(URL).await;
    assert_eq!(
        outcome.result.as_ref().unwrap_err().kind,
        FailureKind::ChallengeUnsolved
    );
    assert!(outcome.escalated);
    assert_eq!(fallback.calls(), 1);
    assert_eq!(transport.calls(), 1);
    assert!(outcome.backoffs().is_empty());
    assert!(orchestrator.cache().get(URL).is_none());
}

#[tokio::test]
async fn solved_challenge_is_cached() {
    let body = listing_page();
    let transport = FakeTransport::new(vec![FakeTransport::ok(200, CHALLENGE)]);
    let fallback = FakeFallback::returning(body.clone());
    let orchestrator = orchestrator(config(), &transport, &fallback);

    assert_eq!(orchestrator.fetch(URL).await.unwrap(), body);
    assert_eq!(orchestrator.cache().get(URL), Some(body));
    assert_eq!(fallback.calls(), 1);
}

#[tokio::test]
async fn fallback_failure_is_challenge_unsolved() {
    let transport = FakeTransport::new(vec![FakeTransport::ok(200, CHALLENGE)]);
    let fallback = FakeFallback::failing(RenderError::Unavailable("no chromium".into()));
    let orchestrator = orchestrator(config(), &transport, &fallback);

    let failure = orchestrator.fetch(URL).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::ChallengeUnsolved);
    assert!(failure.detail.contains("no chromium"));
    assert_eq!(fallback.calls(), 1);
}

#[tokio::test]
async fn disabled_fallback_is_never_invoked() {
    let transport = FakeTransport::new(vec![FakeTransport::ok(200, CHALLENGE)]);
    let fallback = FakeFallback::returning(listing_page());
    let orchestrator = orchestrator(
        FetchConfig {
            browser_enabled: false,
            ..config()
        },
        &transport,
        &fallback,
    );

    let failure = orchestrator.fetch(URL).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::ChallengeUnsolved);
    assert_eq!(fallback.calls(), 0);
}

// ── Concurrency ──

#[tokio::test(start_paused = true)]
async fn requests_are_spaced_by_min_delay() {
    let transport = FakeTransport::new(vec![FakeTransport::ok(200, listing_page())]);
    let fallback = FakeFallback::returning("");
    let orchestrator = orchestrator(
        FetchConfig {
            request_delay_seconds: 3.0,
            ..config()
        },
        &transport,
        &fallback,
    );

    orchestrator.fetch(&format!("{URL}?a=1")).await.unwrap();
    orchestrator.fetch(&format!("{URL}?a=2")).await.unwrap();

    let seen = transport.seen_at.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen[1] - seen[0] >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn concurrent_distinct_urls_respect_concurrency_ceiling() {
    let transport = FakeTransport::with_latency(
        vec![FakeTransport::ok(200, listing_page())],
        Duration::from_millis(500),
    );
    let fallback = FakeFallback::returning("");
    let orchestrator = orchestrator(config(), &transport, &fallback);

    let mut handles = Vec::new();
    for i in 0..4 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.fetch(&format!("{URL}?page={i}")).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // With one slot, each request starts only after the previous finished.
    let seen = transport.seen_at.lock().unwrap().clone();
    assert_eq!(seen.len(), 4);
    for pair in seen.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(500));
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_same_url_shares_one_fetch() {
    let body = listing_page();
    let transport = FakeTransport::with_latency(
        vec![FakeTransport::ok(200, body.clone())],
        Duration::from_secs(1),
    );
    let fallback = FakeFallback::returning("");
    let orchestrator = orchestrator(config(), &transport, &fallback);

    let results = futures::future::join_all((0..5).map(|_| orchestrator.fetch(URL))).await;
    for result in results {
        assert_eq!(result.unwrap(), body);
    }
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn same_url_without_dedupe_fetches_independently() {
    let transport = FakeTransport::with_latency(
        vec![FakeTransport::ok(200, listing_page())],
        Duration::from_secs(1),
    );
    let fallback = FakeFallback::returning("");
    let orchestrator = orchestrator(
        FetchConfig {
            dedupe_in_flight: false,
            max_concurrent_requests: 3,
            ..config()
        },
        &transport,
        &fallback,
    );

    let results = futures::future::join_all((0..3).map(|_| orchestrator.fetch(URL))).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn abandoned_shared_fetch_releases_its_slot() {
    let transport = FakeTransport::with_latency(
        vec![FakeTransport::ok(200, listing_page())],
        Duration::from_secs(10),
    );
    let fallback = FakeFallback::returning("");
    let limiter = Arc::new(RateLimiter::new(1, Duration::ZERO));
    let orchestrator = FetchOrchestrator::builder(config())
        .transport(transport.clone())
        .fallback(fallback.clone())
        .limiter(limiter.clone())
        .build();
    assert!(orchestrator.config().dedupe_in_flight);

    let abandoned = tokio::time::timeout(Duration::from_secs(1), orchestrator.fetch(URL)).await;
    assert!(abandoned.is_err());
    assert_eq!(limiter.active(), 0);

    // Other URLs are not stuck behind the abandoned fetch.
    let other = tokio::time::timeout(
        Duration::from_secs(60),
        orchestrator.fetch(&format!("{URL}?page=2")),
    )
    .await;
    assert!(other.unwrap().is_ok());

    // The same URL starts a fresh fetch instead of joining the dropped one.
    assert!(orchestrator.fetch(URL).await.is_ok());
    assert_eq!(transport.calls(), 3);
    assert_eq!(limiter.active(), 0);
}

#[tokio::test(start_paused = true)]
async fn abandoned_fetch_releases_its_slot() {
    let transport = FakeTransport::with_latency(
        vec![FakeTransport::ok(200, listing_page())],
        Duration::from_secs(10),
    );
    let fallback = FakeFallback::returning("");
    let limiter = Arc::new(RateLimiter::new(1, Duration::ZERO));
    let orchestrator = FetchOrchestrator::builder(FetchConfig {
        dedupe_in_flight: false,
        ..config()
    })
    .transport(transport.clone())
    .fallback(fallback.clone())
    .limiter(limiter.clone())
    .build();

    let abandoned = tokio::time::timeout(Duration::from_secs(1), orchestrator.fetch(URL)).await;
    assert!(abandoned.is_err());
    assert_eq!(limiter.active(), 0);

    // The slot is free for the next caller.
    assert!(orchestrator.fetch(URL).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn close_fails_waiting_fetches() {
    let transport = FakeTransport::with_latency(
        vec![FakeTransport::ok(200, listing_page())],
        Duration::from_secs(5),
    );
    let fallback = FakeFallback::returning("");
    let orchestrator = orchestrator(config(), &transport, &fallback);

    let running = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.fetch(&format!("{URL}?a")).await })
    };
    let waiting = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.fetch(&format!("{URL}?b")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    orchestrator.close().await;
    assert!(orchestrator.is_closed());

    // The in-progress request completes; the queued one is turned away.
    assert!(running.await.unwrap().is_ok());
    let failure = waiting.await.unwrap().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Transport);
    assert_eq!(transport.calls(), 1);
}
