//! Fetch configuration and environment overrides.
//!
//! Every field has a default; `FetchConfig::from_env()` overlays `LOOPNET_*`
//! variables on top. Unparseable values keep the default.

use crate::challenge::{ChallengeDetector, DEFAULT_CHALLENGE_MARKERS, DEFAULT_CHALLENGE_MAX_LEN};
use crate::fingerprint::{FingerprintProfile, DEFAULT_PROFILE};
use crate::urls::BASE_URL;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for one [`FetchOrchestrator`](crate::FetchOrchestrator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Minimum spacing between request starts, in seconds.
    pub request_delay_seconds: f64,
    pub max_concurrent_requests: usize,
    pub timeout_seconds: f64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff before retry `n` is `backoff_unit_seconds * 2^n`.
    pub backoff_unit_seconds: f64,
    pub max_backoff_seconds: f64,
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
    /// 0 disables the background sweep.
    pub cache_sweep_seconds: u64,
    pub browser_enabled: bool,
    pub browser_headless: bool,
    pub browser_timeout_seconds: f64,
    pub browser_challenge_wait_seconds: f64,
    /// Browser binary; searched for on `PATH` when unset.
    pub chromium_path: Option<String>,
    /// Fingerprint profile name, e.g. `chrome136`.
    pub impersonate_browser: String,
    pub base_url: String,
    /// Visit `base_url` once before the first real fetch.
    pub warmup: bool,
    pub warmup_pause_seconds: f64,
    /// Share one in-flight fetch between concurrent callers for the same URL.
    pub dedupe_in_flight: bool,
    pub challenge_markers: Vec<String>,
    pub challenge_max_len: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_delay_seconds: 3.0,
            max_concurrent_requests: 1,
            timeout_seconds: 30.0,
            max_retries: 3,
            backoff_unit_seconds: 1.0,
            max_backoff_seconds: 30.0,
            cache_ttl_seconds: 300,
            cache_max_entries: 500,
            cache_sweep_seconds: 0,
            browser_enabled: true,
            browser_headless: true,
            browser_timeout_seconds: 30.0,
            browser_challenge_wait_seconds: 5.0,
            chromium_path: None,
            impersonate_browser: DEFAULT_PROFILE.to_string(),
            base_url: BASE_URL.to_string(),
            warmup: true,
            warmup_pause_seconds: 1.0,
            dedupe_in_flight: true,
            challenge_markers: DEFAULT_CHALLENGE_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            challenge_max_len: DEFAULT_CHALLENGE_MAX_LEN,
        }
    }
}

impl FetchConfig {
    /// Defaults overlaid with `LOOPNET_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Overlay `LOOPNET_*` environment variables onto `self`.
    pub fn with_env(self) -> Self {
        Self {
            request_delay_seconds: read_env_f64(
                "LOOPNET_REQUEST_DELAY_SECONDS",
                self.request_delay_seconds,
            ),
            max_concurrent_requests: read_env_usize(
                "LOOPNET_MAX_CONCURRENT_REQUESTS",
                self.max_concurrent_requests,
            )
            .max(1),
            timeout_seconds: read_env_f64("LOOPNET_TIMEOUT_SECONDS", self.timeout_seconds),
            max_retries: read_env_u32("LOOPNET_MAX_RETRIES", self.max_retries),
            backoff_unit_seconds: read_env_f64(
                "LOOPNET_BACKOFF_UNIT_SECONDS",
                self.backoff_unit_seconds,
            ),
            max_backoff_seconds: read_env_f64(
                "LOOPNET_MAX_BACKOFF_SECONDS",
                self.max_backoff_seconds,
            ),
            cache_ttl_seconds: read_env_u64("LOOPNET_CACHE_TTL_SECONDS", self.cache_ttl_seconds),
            cache_max_entries: read_env_usize(
                "LOOPNET_CACHE_MAX_ENTRIES",
                self.cache_max_entries,
            ),
            cache_sweep_seconds: read_env_u64(
                "LOOPNET_CACHE_SWEEP_SECONDS",
                self.cache_sweep_seconds,
            ),
            browser_enabled: read_env_bool("LOOPNET_BROWSER_ENABLED", self.browser_enabled),
            browser_headless: read_env_bool("LOOPNET_BROWSER_HEADLESS", self.browser_headless),
            browser_timeout_seconds: read_env_f64(
                "LOOPNET_BROWSER_TIMEOUT_SECONDS",
                self.browser_timeout_seconds,
            ),
            browser_challenge_wait_seconds: read_env_f64(
                "LOOPNET_BROWSER_CHALLENGE_WAIT_SECONDS",
                self.browser_challenge_wait_seconds,
            ),
            chromium_path: read_env_string("LOOPNET_CHROMIUM_PATH")
                .filter(|v| !v.is_empty())
                .or(self.chromium_path),
            impersonate_browser: read_env_string("LOOPNET_IMPERSONATE_BROWSER")
                .filter(|v| !v.is_empty())
                .unwrap_or(self.impersonate_browser),
            base_url: read_env_string("LOOPNET_BASE_URL")
                .filter(|v| !v.is_empty())
                .unwrap_or(self.base_url),
            warmup: read_env_bool("LOOPNET_WARMUP", self.warmup),
            warmup_pause_seconds: read_env_f64(
                "LOOPNET_WARMUP_PAUSE_SECONDS",
                self.warmup_pause_seconds,
            ),
            dedupe_in_flight: read_env_bool("LOOPNET_DEDUPE_IN_FLIGHT", self.dedupe_in_flight),
            challenge_markers: self.challenge_markers,
            challenge_max_len: self.challenge_max_len,
        }
    }

    pub fn request_delay(&self) -> Duration {
        seconds(self.request_delay_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        seconds(self.timeout_seconds)
    }

    pub fn backoff_unit(&self) -> Duration {
        seconds(self.backoff_unit_seconds)
    }

    pub fn max_backoff(&self) -> Duration {
        seconds(self.max_backoff_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn cache_sweep_interval(&self) -> Option<Duration> {
        (self.cache_sweep_seconds > 0).then(|| Duration::from_secs(self.cache_sweep_seconds))
    }

    pub fn browser_timeout(&self) -> Duration {
        seconds(self.browser_timeout_seconds)
    }

    pub fn browser_challenge_wait(&self) -> Duration {
        seconds(self.browser_challenge_wait_seconds)
    }

    pub fn warmup_pause(&self) -> Duration {
        seconds(self.warmup_pause_seconds)
    }

    /// The configured profile, or the default one if the name is not recognised.
    pub fn fingerprint(&self) -> FingerprintProfile {
        match self.impersonate_browser.parse() {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!("{e}; falling back to {DEFAULT_PROFILE}");
                FingerprintProfile::default()
            }
        }
    }

    pub fn detector(&self) -> ChallengeDetector {
        ChallengeDetector::new(self.challenge_markers.clone(), self.challenge_max_len)
    }
}

/// Negative, NaN and infinite values collapse to zero.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn read_env_f64(name: &str, default_value: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(default_value)
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_u32(name: &str, default_value: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default_value)
}

fn read_env_usize(name: &str, default_value: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default_value)
}

fn read_env_bool(name: &str, default_value: bool) -> bool {
    match read_env_string(name).map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default_value,
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string())
}
