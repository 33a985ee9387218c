//! Anti-bot challenge detection.
//!
//! Akamai serves a short interstitial page that only a real browser can get
//! past. Real listing pages are far larger, so a page is only treated as a
//! challenge when it is both small and carries one of the known markers.

use serde::{Deserialize, Serialize};

/// Marker strings found on Akamai challenge pages.
pub const DEFAULT_CHALLENGE_MARKERS: &[&str] =
    &["sec-if-cpt-container", "behavioral-content", "/akam/13/pixel_"];

/// Pages longer than this (in bytes) are never treated as challenges.
pub const DEFAULT_CHALLENGE_MAX_LEN: usize = 10_000;

/// Classification of one HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageClass {
    /// Usable page content.
    Content,
    /// Challenge interstitial; needs a real browser.
    Challenge,
    /// Request explicitly rejected (403).
    Blocked,
    /// Any other client or server error.
    Error,
}

/// Configurable challenge classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeDetector {
    markers: Vec<String>,
    max_len: usize,
}

impl Default for ChallengeDetector {
    fn default() -> Self {
        Self {
            markers: DEFAULT_CHALLENGE_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            max_len: DEFAULT_CHALLENGE_MAX_LEN,
        }
    }
}

impl ChallengeDetector {
    pub fn new(markers: Vec<String>, max_len: usize) -> Self {
        Self { markers, max_len }
    }

    /// Whether `body` looks like a challenge interstitial.
    pub fn is_challenge_page(&self, body: &str) -> bool {
        if body.len() > self.max_len {
            return false;
        }
        self.markers
            .iter()
            .any(|marker| !marker.is_empty() && body.contains(marker.as_str()))
    }

    /// Classify a response by status code and body.
    pub fn classify(&self, status: u16, body: &str) -> PageClass {
        match status {
            403 => PageClass::Blocked,
            200..=299 if self.is_challenge_page(body) => PageClass::Challenge,
            s if s >= 400 => PageClass::Error,
            _ => PageClass::Content,
        }
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

/// Classify with the default markers and threshold.
pub fn classify(status: u16, body: &str) -> PageClass {
    ChallengeDetector::default().classify(status, body)
}

/// Challenge check with the default markers and threshold.
pub fn is_challenge_page(body: &str) -> bool {
    ChallengeDetector::default().is_challenge_page(body)
}
