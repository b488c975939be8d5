use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crawler::page::Page;
use crate::error::CrawlError;

const STREET_SUFFIX: &str = r"(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Drive|Dr|Lane|Ln|Way|Circle|Cir|Court|Ct|Parkway|Pkwy|Highway|Hwy|Trail|Trl|Place|Pl)";

/// Contact details found on a provider's pages
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactInfo {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

impl ContactInfo {
    /// Fill fields still missing from `other`
    pub fn merge(&mut self, other: ContactInfo) {
        if self.email.is_none() {
            self.email = other.email;
        }
        if self.phone.is_none() {
            self.phone = other.phone;
        }
        if self.address.is_none() {
            self.address = other.address;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone.is_none() && self.address.is_none()
    }
}

/// Regex-based email, phone and Florida address extraction
pub struct ContactExtractor {
    email: Regex,
    phone: Regex,
    full_address: Regex,
    street_address: Regex,
}

fn build(pattern: &str) -> Result<Regex, CrawlError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| CrawlError::config(format!("invalid contact pattern: {}", e)))
}

impl ContactExtractor {
    pub fn new() -> Result<Self, CrawlError> {
        Ok(Self {
            email: build(r"\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b")?,
            phone: build(r"(?:\(\d{3}\)|\b\d{3})[-.\s]?\d{3}[-.\s]\d{4}\b")?,
            full_address: build(&format!(
                r"\b\d{{1,5}}\s+[\w\s.]{{1,60}}?\b{}\b\.?[\w\s,.#]{{0,60}}?\bFL\b\.?\s*\d{{5}}",
                STREET_SUFFIX
            ))?,
            street_address: build(&format!(
                r"\b\d{{1,5}}\s+[\w\s.]{{1,60}}?\b{}\b\.?",
                STREET_SUFFIX
            ))?,
        })
    }

    /// Contact details from one page: visible text first, JSON-LD for a missing address
    pub fn extract(&self, page: &Page) -> ContactInfo {
        let text = page.text.as_str();
        let email = self.email.find(text).map(|m| m.as_str().to_lowercase());
        let phone = self.phone.find(text).map(|m| m.as_str().to_string());

        // Longest match is usually the most complete address
        let longest = |regex: &Regex| {
            regex
                .find_iter(text)
                .map(|m| m.as_str().trim().to_string())
                .max_by_key(|m| m.len())
        };
        let address = longest(&self.full_address)
            .or_else(|| page.structured.iter().find_map(postal_address))
            .or_else(|| longest(&self.street_address));

        ContactInfo {
            email,
            phone,
            address,
        }
    }
}

/// First schema.org address in a JSON-LD value, searched depth-first
fn postal_address(value: &Value) -> Option<String> {
    match value {
        Value::Array(items) => items.iter().find_map(postal_address),
        Value::Object(map) => {
            if let Some(address) = map.get("address") {
                if let Some(formatted) = format_address(address) {
                    return Some(formatted);
                }
            }
            if map.get("@type").and_then(Value::as_str) == Some("PostalAddress") {
                if let Some(formatted) = format_address(value) {
                    return Some(formatted);
                }
            }
            map.get("@graph").and_then(postal_address)
        }
        _ => None,
    }
}

fn format_address(address: &Value) -> Option<String> {
    match address {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Object(map) => {
            let field = |key: &str| {
                map.get(key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
            };
            let street = field("streetAddress")?;
            let mut formatted = street.to_string();
            if let Some(city) = field("addressLocality") {
                formatted.push_str(", ");
                formatted.push_str(city);
            }
            match (field("addressRegion"), field("postalCode")) {
                (Some(region), Some(zip)) => formatted.push_str(&format!(", {} {}", region, zip)),
                (Some(region), None) => formatted.push_str(&format!(", {}", region)),
                (None, Some(zip)) => formatted.push_str(&format!(" {}", zip)),
                (None, None) => {}
            }
            Some(formatted)
        }
        Value::Array(items) => items.iter().find_map(format_address),
        _ => None,
    }
}
