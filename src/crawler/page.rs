//! HTML to text, links and structured data.
//!
//! Parsing is synchronous and `Html` never outlives the call, so nothing here is held across an
//! await point.

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::crawler::generator::SearchEngine;
use crate::error::CrawlError;

/// Elements whose text never reaches the reader
const HIDDEN_ELEMENTS: &[&str] = &[
    "script", "style", "noscript", "nav", "footer", "head", "template", "svg", "iframe",
];

/// Hosts that never count as a provider website
const SKIPPED_HOSTS: &[&str] = &[
    "duckduckgo.com", "bing.com", "microsoft.com", "google.com", "facebook.com",
    "instagram.com", "twitter.com", "x.com", "youtube.com", "linkedin.com", "pinterest.com",
    "yelp.com", "yellowpages.com", "wikipedia.org",
];

/// Everything the run loop needs from one fetched page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub url: String,
    pub title: Option<String>,

    /// Visible text, whitespace collapsed
    pub text: String,

    /// Absolute http(s) links, fragment removed, first occurrence kept
    pub links: Vec<String>,

    /// Parsed JSON-LD blocks
    pub structured: Vec<serde_json::Value>,
}

impl Page {
    pub fn parse(html: &str, url: &str) -> Self {
        let document = Html::parse_document(html);
        let base = Url::parse(url).ok();

        Self {
            url: url.to_string(),
            title: title(&document),
            text: visible_text(&document),
            links: match (anchor_selector(), base) {
                (Some(anchors), Some(base)) => collect_links(document.select(&anchors), &base),
                _ => Vec::new(),
            },
            structured: json_ld(&document),
        }
    }
}

fn anchor_selector() -> Option<Selector> {
    Selector::parse("a[href]").ok()
}

fn title(document: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
}

fn visible_text(document: &Html) -> String {
    let mut words: Vec<&str> = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .map_or(false, |el| HIDDEN_ELEMENTS.contains(&el.name()))
        });
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }
    words.join(" ")
}

fn json_ld(document: &Html) -> Vec<serde_json::Value> {
    let Ok(selector) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|el| serde_json::from_str(&el.text().collect::<String>()).ok())
        .collect()
}

/// Resolve a raw href against `base`, keeping only http(s) URLs
pub fn resolve(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let mut url = base.join(href).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

fn collect_links<'a>(elements: impl Iterator<Item = ElementRef<'a>>, base: &Url) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    for element in elements {
        if let Some(link) = element.value().attr("href").and_then(|href| resolve(base, href)) {
            if !links.contains(&link) {
                links.push(link);
            }
        }
    }
    links
}

/// Links matched by a CSS selector, used for directory listings
pub fn select_links(html: &str, base_url: &str, selector: &str) -> Result<Vec<String>, CrawlError> {
    let selector = Selector::parse(selector)
        .map_err(|e| CrawlError::ParseFailure(format!("invalid selector '{}': {:?}", selector, e)))?;
    let base = Url::parse(base_url)
        .map_err(|e| CrawlError::ParseFailure(format!("invalid base URL '{}': {}", base_url, e)))?;

    let document = Html::parse_document(html);
    let anchors = anchor_selector();
    let mut elements = Vec::new();
    for matched in document.select(&selector) {
        // The selector may point at the anchor itself or at a card containing one
        if matched.value().name() == "a" {
            elements.push(matched);
        } else if let Some(anchor) = anchors.as_ref().and_then(|a| matched.select(a).next()) {
            elements.push(anchor);
        }
    }
    Ok(collect_links(elements.into_iter(), &base))
}

fn is_skipped_host(url: &str) -> bool {
    let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(|h| h.to_lowercase())) else {
        return true;
    };
    SKIPPED_HOSTS
        .iter()
        .any(|skipped| host == *skipped || host.ends_with(&format!(".{}", skipped)))
}

/// Unwrap DuckDuckGo's `/l/?uddg=` redirect links
fn decode_duckduckgo(href: &str) -> Option<String> {
    let base = Url::parse("https://duckduckgo.com/").ok()?;
    let url = base.join(href).ok()?;
    if url.host_str().map_or(false, |h| h.ends_with("duckduckgo.com")) {
        url.query_pairs()
            .find(|(key, _)| key == "uddg")
            .map(|(_, value)| value.into_owned())
    } else {
        Some(url.to_string())
    }
}

/// Organic result links from a search results page
pub fn search_results(html: &str, engine: SearchEngine, limit: usize) -> Vec<String> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse(engine.result_selector()) else {
        return Vec::new();
    };

    let mut results: Vec<String> = Vec::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let target = match engine {
            SearchEngine::DuckDuckGo => decode_duckduckgo(href),
            SearchEngine::Bing => Some(href.to_string()),
        };
        let Some(target) = target.and_then(|t| Url::parse(&t).ok()).and_then(|u| {
            matches!(u.scheme(), "http" | "https").then(|| u.to_string())
        }) else {
            continue;
        };
        if is_skipped_host(&target) || results.contains(&target) {
            continue;
        }
        results.push(target);
        if results.len() >= limit {
            break;
        }
    }
    results
}
