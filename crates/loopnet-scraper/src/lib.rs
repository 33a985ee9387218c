// Copyright 2026 Loopnet Scraper Contributors
// SPDX-License-Identifier: Apache-2.0

//! Polite, challenge-aware page fetching for LoopNet listings.
//!
//! [`FetchOrchestrator`] is the single entry point: it checks the
//! [`PageCache`], waits on the shared [`RateLimiter`], sends the request
//! through a [`Transport`] with a browser [`FingerprintProfile`], classifies
//! the response, and hands challenge pages to a [`FallbackExecutor`] once.
//! Every call resolves to page content or a [`FetchFailure`].

pub mod cache;
pub mod challenge;
pub mod config;
pub mod error;
pub mod fallback;
pub mod fingerprint;
pub mod orchestrator;
pub mod rate_limiter;
pub mod transport;
pub mod urls;

pub use cache::PageCache;
pub use challenge::{classify, is_challenge_page, ChallengeDetector, PageClass};
pub use config::FetchConfig;
pub use error::{FailureKind, FetchFailure, FetchResult, RenderError, TransportError};
pub use fallback::{ChromiumExecutor, DisabledExecutor, FallbackExecutor, RenderedPage};
pub use fingerprint::FingerprintProfile;
pub use orchestrator::{AttemptOutcome, FetchAttempt, FetchOrchestrator, FetchOutcome};
pub use rate_limiter::{RateLimiter, RateSlot};
pub use transport::{HttpTransport, Transport, TransportResponse};
pub use urls::{build_detail_url, build_search_url, ListingType, PropertyType};
