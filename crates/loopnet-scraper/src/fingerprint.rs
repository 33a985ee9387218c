//! Browser fingerprint profiles.
//!
//! A profile names a browser family and version (`chrome136`, `firefox133`,
//! `safari18_0`, `edge131`) and resolves to the request headers that browser
//! sends on a top-level navigation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_PROFILE: &str = "chrome136";

const ACCEPT_HTML: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserFamily {
    Chrome,
    Edge,
    Firefox,
    Safari,
}

impl BrowserFamily {
    fn as_str(self) -> &'static str {
        match self {
            BrowserFamily::Chrome => "chrome",
            BrowserFamily::Edge => "edge",
            BrowserFamily::Firefox => "firefox",
            BrowserFamily::Safari => "safari",
        }
    }
}

/// A named browser profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FingerprintProfile {
    family: BrowserFamily,
    /// Dotted version, e.g. `136` or `18.0`.
    version: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown fingerprint profile: {0:?}")]
pub struct UnknownProfile(pub String);

impl FingerprintProfile {
    pub fn new(family: BrowserFamily, version: impl Into<String>) -> Self {
        Self {
            family,
            version: version.into(),
        }
    }

    pub fn family(&self) -> BrowserFamily {
        self.family
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn major(&self) -> &str {
        self.version.split('.').next().unwrap_or(&self.version)
    }

    /// The `User-Agent` string for this profile.
    pub fn user_agent(&self) -> String {
        let major = self.major();
        match self.family {
            BrowserFamily::Chrome => format!(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/{major}.0.0.0 Safari/537.36"
            ),
            BrowserFamily::Edge => format!(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/{major}.0.0.0 Safari/537.36 Edg/{major}.0.0.0"
            ),
            BrowserFamily::Firefox => format!(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:{major}.0) \
                 Gecko/20100101 Firefox/{major}.0"
            ),
            BrowserFamily::Safari => format!(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
                 (KHTML, like Gecko) Version/{} Safari/605.1.15",
                self.version
            ),
        }
    }

    /// Headers sent with every navigation request, in browser order.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let major = self.major();
        let mut headers = Vec::with_capacity(10);

        match self.family {
            BrowserFamily::Chrome | BrowserFamily::Edge => {
                let brand = if self.family == BrowserFamily::Edge {
                    "Microsoft Edge"
                } else {
                    "Google Chrome"
                };
                headers.push((
                    "sec-ch-ua",
                    format!(
                        "\"Chromium\";v=\"{major}\", \"{brand}\";v=\"{major}\", \"Not.A/Brand\";v=\"99\""
                    ),
                ));
                headers.push(("sec-ch-ua-mobile", "?0".to_string()));
                headers.push(("sec-ch-ua-platform", "\"Windows\"".to_string()));
                headers.push(("upgrade-insecure-requests", "1".to_string()));
                headers.push(("user-agent", self.user_agent()));
                headers.push((
                    "accept",
                    format!("{ACCEPT_HTML},application/signed-exchange;v=b3;q=0.7"),
                ));
                headers.push(("sec-fetch-site", "none".to_string()));
                headers.push(("sec-fetch-mode", "navigate".to_string()));
                headers.push(("sec-fetch-user", "?1".to_string()));
                headers.push(("sec-fetch-dest", "document".to_string()));
                headers.push(("accept-language", "en-US,en;q=0.9".to_string()));
            }
            BrowserFamily::Firefox => {
                headers.push(("user-agent", self.user_agent()));
                headers.push(("accept", ACCEPT_HTML.to_string()));
                headers.push(("accept-language", "en-US,en;q=0.5".to_string()));
                headers.push(("upgrade-insecure-requests", "1".to_string()));
                headers.push(("sec-fetch-dest", "document".to_string()));
                headers.push(("sec-fetch-mode", "navigate".to_string()));
                headers.push(("sec-fetch-site", "none".to_string()));
                headers.push(("sec-fetch-user", "?1".to_string()));
            }
            BrowserFamily::Safari => {
                headers.push(("accept", ACCEPT_HTML.to_string()));
                headers.push(("sec-fetch-site", "none".to_string()));
                headers.push(("sec-fetch-dest", "document".to_string()));
                headers.push(("accept-language", "en-US,en;q=0.9".to_string()));
                headers.push(("sec-fetch-mode", "navigate".to_string()));
                headers.push(("user-agent", self.user_agent()));
            }
        }

        headers
    }
}

impl Default for FingerprintProfile {
    fn default() -> Self {
        Self::new(BrowserFamily::Chrome, "136")
    }
}

impl FromStr for FingerprintProfile {
    type Err = UnknownProfile;

    /// Parses `chrome136`, `edge131`, `firefox133`, `safari18_0` (underscores
    /// separate version components).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_lowercase();
        let split = raw
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| UnknownProfile(s.to_string()))?;
        let (name, version) = raw.split_at(split);

        let family = match name {
            "chrome" => BrowserFamily::Chrome,
            "edge" => BrowserFamily::Edge,
            "firefox" => BrowserFamily::Firefox,
            "safari" => BrowserFamily::Safari,
            _ => return Err(UnknownProfile(s.to_string())),
        };

        let version = version.replace('_', ".");
        if version.is_empty()
            || version.starts_with('.')
            || !version.chars().all(|c| c.is_ascii_digit() || c == '.')
        {
            return Err(UnknownProfile(s.to_string()));
        }

        Ok(Self::new(family, version))
    }
}

impl fmt::Display for FingerprintProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            self.family.as_str(),
            self.version.replace('.', "_")
        )
    }
}
