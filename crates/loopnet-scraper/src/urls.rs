//! LoopNet URL construction for search and listing pages.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub const BASE_URL: &str = "https://www.loopnet.com";

/// Commercial property categories accepted by the search pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyType {
    Office,
    Retail,
    Industrial,
    Multifamily,
    Land,
    Hospitality,
    SpecialPurpose,
    HealthCare,
}

impl PropertyType {
    pub const ALL: [PropertyType; 8] = [
        PropertyType::Office,
        PropertyType::Retail,
        PropertyType::Industrial,
        PropertyType::Multifamily,
        PropertyType::Land,
        PropertyType::Hospitality,
        PropertyType::SpecialPurpose,
        PropertyType::HealthCare,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PropertyType::Office => "office",
            PropertyType::Retail => "retail",
            PropertyType::Industrial => "industrial",
            PropertyType::Multifamily => "multifamily",
            PropertyType::Land => "land",
            PropertyType::Hospitality => "hospitality",
            PropertyType::SpecialPurpose => "special-purpose",
            PropertyType::HealthCare => "health-care",
        }
    }

    /// Path segment LoopNet uses for this category.
    pub fn slug(self) -> &'static str {
        match self {
            PropertyType::Office => "office",
            PropertyType::Retail => "retail",
            PropertyType::Industrial => "industrial",
            PropertyType::Multifamily => "apartment-buildings",
            PropertyType::Land => "land",
            PropertyType::Hospitality => "hospitality",
            PropertyType::SpecialPurpose => "commercial-real-estate",
            PropertyType::HealthCare => "health-care-facilities",
        }
    }
}

impl FromStr for PropertyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        PropertyType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("unknown property type: {s}"))
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListingType {
    #[default]
    ForSale,
    ForLease,
}

impl ListingType {
    pub fn as_str(self) -> &'static str {
        match self {
            ListingType::ForSale => "for-sale",
            ListingType::ForLease => "for-lease",
        }
    }
}

impl FromStr for ListingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "for-sale" | "sale" => Ok(ListingType::ForSale),
            "for-lease" | "lease" => Ok(ListingType::ForLease),
            other => Err(format!("unknown listing type: {other}")),
        }
    }
}

impl fmt::Display for ListingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn listing_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/(\d[\d-]*)/?$").expect("listing id regex is valid"))
}

/// Convert free-form location input to a LoopNet path slug.
///
/// `"Houston, TX"` → `houston-tx`, `"TX"` → `tx`, `"77001"` → `77001`.
pub fn normalize_location(location: &str) -> String {
    let lowered = location.trim().replace(',', "").to_lowercase();
    let mut slug = String::with_capacity(lowered.len());
    for word in lowered.split_whitespace() {
        if !slug.is_empty() {
            slug.push('-');
        }
        slug.extend(
            word.chars()
                .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'),
        );
    }

    // Collapse hyphen runs and trim the ends.
    slug.split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Search results URL. Page numbers start at 1; page 1 has no suffix.
pub fn build_search_url(
    location: &str,
    property_type: Option<PropertyType>,
    listing_type: ListingType,
    page: u32,
) -> String {
    build_search_url_on(BASE_URL, location, property_type, listing_type, page)
}

/// [`build_search_url`] against a different site root.
pub fn build_search_url_on(
    base_url: &str,
    location: &str,
    property_type: Option<PropertyType>,
    listing_type: ListingType,
    page: u32,
) -> String {
    let type_slug = property_type
        .map(PropertyType::slug)
        .unwrap_or("commercial-real-estate");
    let mut url = format!(
        "{}/search/{type_slug}/{}/{}/",
        base_url.trim_end_matches('/'),
        normalize_location(location),
        listing_type.as_str()
    );
    if page > 1 {
        url.push_str(&format!("{page}/"));
    }
    url
}

/// Detail page URL for a listing id.
pub fn build_detail_url(listing_id: &str) -> String {
    build_detail_url_on(BASE_URL, listing_id)
}

/// [`build_detail_url`] against a different site root.
pub fn build_detail_url_on(base_url: &str, listing_id: &str) -> String {
    format!(
        "{}/Listing/{}/",
        base_url.trim_end_matches('/'),
        listing_id.trim()
    )
}

/// Numeric listing id at the end of a listing URL.
///
/// Handles `/Listing/<slug>/31948105/` and `/property/<slug>/48479-210176/`.
pub fn extract_listing_id(url: &str) -> Option<String> {
    let normalized = format!("{}/", url.trim_end_matches('/'));
    listing_id_re()
        .captures(&normalized)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Accept either a full URL or a bare listing id.
pub fn resolve_detail_url(url_or_id: &str) -> String {
    resolve_detail_url_on(BASE_URL, url_or_id)
}

/// [`resolve_detail_url`] with bare ids resolved against `base_url`.
pub fn resolve_detail_url_on(base_url: &str, url_or_id: &str) -> String {
    let trimmed = url_or_id.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        build_detail_url_on(base_url, trimmed)
    }
}
