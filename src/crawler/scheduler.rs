use std::collections::HashSet;
use regex::Regex;
use url::Url;
use tracing::{debug, warn};

use crate::cli::config::CrawlerSettings;

/// Decides which same-site pages are scanned alongside a site's main page
pub struct Scheduler {
    /// Configuration for the crawler
    config: CrawlerSettings,

    /// Set of already seen URLs to avoid duplicates
    seen_urls: HashSet<String>,

    /// Compiled regex patterns for URL inclusion
    include_patterns: Vec<Regex>,

    /// Compiled regex patterns for URL exclusion
    exclude_patterns: Vec<Regex>,

    /// Hosts of the site being scanned (if empty, any host is allowed)
    allowed_domains: HashSet<String>,
}

fn compile_patterns(patterns: &[String], kind: &str) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Invalid {} pattern '{}': {}", kind, pattern, e);
                None
            }
        })
        .collect()
}

fn bare_host(url: &Url) -> Option<String> {
    url.host_str()
        .map(|host| host.to_lowercase().trim_start_matches("www.").to_string())
}

impl Scheduler {
    /// Create a new scheduler with the given crawler settings
    pub fn new(config: CrawlerSettings) -> Self {
        let include_patterns = compile_patterns(&config.url_patterns.include, "include");
        let exclude_patterns = compile_patterns(&config.url_patterns.exclude, "exclude");

        Self {
            config,
            seen_urls: HashSet::new(),
            include_patterns,
            exclude_patterns,
            allowed_domains: HashSet::new(),
        }
    }

    /// Reset for a new site: only its host (with or without `www.`) is allowed from now on
    pub fn start_site(&mut self, site_url: &str) {
        self.clear_seen();
        self.allowed_domains.clear();
        if let Ok(url) = Url::parse(site_url) {
            if let Some(host) = bare_host(&url) {
                self.allowed_domains.insert(host);
            }
        }
        let normalized = self.normalize_url(site_url);
        self.seen_urls.insert(normalized);
    }

    /// Determine if a URL should be crawled
    pub fn should_crawl(&mut self, url: &str) -> bool {
        // Normalize the URL
        let normalized_url = self.normalize_url(url);

        // Check if we've already seen this URL
        if self.seen_urls.contains(&normalized_url) {
            debug!("Skipping already seen URL: {}", normalized_url);
            return false;
        }

        // Parse the URL
        let parsed_url = match Url::parse(&normalized_url) {
            Ok(url) => url,
            Err(e) => {
                debug!("Skipping invalid URL {}: {}", normalized_url, e);
                return false;
            }
        };

        // Check if the URL is on the site being scanned
        if !self.allowed_domains.is_empty() {
            match bare_host(&parsed_url) {
                Some(host) if self.allowed_domains.iter().any(|domain| {
                    host == *domain || host.ends_with(&format!(".{}", domain))
                }) => {}
                Some(host) => {
                    debug!("Skipping URL from another host: {}", host);
                    return false;
                }
                None => {
                    debug!("Skipping URL without host: {}", normalized_url);
                    return false;
                }
            }
        }

        // Check against exclusion patterns
        if self.exclude_patterns.iter().any(|p| p.is_match(&normalized_url)) {
            debug!("Skipping URL matching exclusion pattern: {}", normalized_url);
            return false;
        }

        // Check against inclusion patterns if any exist
        if !self.include_patterns.is_empty()
            && !self.include_patterns.iter().any(|p| p.is_match(&normalized_url))
        {
            debug!("Skipping URL not matching any inclusion pattern: {}", normalized_url);
            return false;
        }

        // Add the URL to the seen set
        self.seen_urls.insert(normalized_url);

        true
    }

    /// Subpages to scan for `site_url`: probe paths first, then hinted on-page links
    pub fn subpages(&mut self, site_url: &str, links: &[String]) -> Vec<String> {
        let limit = self.config.max_subpages;
        let mut pages = Vec::new();
        if limit == 0 {
            return pages;
        }
        let Ok(base) = Url::parse(site_url) else {
            return pages;
        };

        let probes: Vec<String> = self
            .config
            .probe_paths
            .iter()
            .filter_map(|path| base.join(path).ok().map(|u| u.to_string()))
            .collect();
        let hints: Vec<String> = self.config.link_hints.iter().map(|h| h.to_lowercase()).collect();
        let hinted: Vec<String> = links
            .iter()
            .filter(|link| {
                let lowered = link.to_lowercase();
                hints.iter().any(|hint| lowered.contains(hint.as_str()))
            })
            .cloned()
            .collect();

        for candidate in probes.into_iter().chain(hinted) {
            if pages.len() >= limit {
                break;
            }
            if self.should_crawl(&candidate) {
                pages.push(candidate);
            }
        }
        pages
    }

    /// Normalize a URL to avoid duplicates due to minor differences
    pub fn normalize_url(&self, url: &str) -> String {
        // Parse the URL; the url crate lower-cases the host and drops default ports
        let mut normalized = match Url::parse(url) {
            Ok(url) => url,
            Err(_) => return url.to_string(), // Can't normalize, return as is
        };

        // Sort query parameters if present
        if let Some(query) = normalized.query().map(|q| q.to_string()) {
            if query.is_empty() {
                normalized.set_query(None);
            } else {
                let mut params: Vec<&str> = query.split('&').collect();
                params.sort_by_key(|pair| pair.split('=').next().unwrap_or(""));
                let sorted_query = params.join("&");
                normalized.set_query(Some(&sorted_query));
            }
        }

        // Remove fragments (anchors)
        normalized.set_fragment(None);

        // Remove trailing slash
        let mut result = normalized.to_string();
        if normalized.query().is_none() && result.ends_with('/') {
            result.pop();
        }
        result
    }

    /// Get the current count of seen URLs
    #[cfg(test)]
    pub fn seen_count(&self) -> usize {
        self.seen_urls.len()
    }

    /// Clear the seen URLs cache
    pub fn clear_seen(&mut self) {
        self.seen_urls.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::UrlPatterns;

    fn create_test_config() -> CrawlerSettings {
        CrawlerSettings {
            flush_every: 10,
            max_targets: None,
            max_subpages: 3,
            probe_paths: vec!["/about".to_string(), "/services".to_string()],
            link_hints: vec!["minist".to_string(), "therap".to_string()],
            url_patterns: UrlPatterns {
                include: vec![],
                exclude: vec![r"^.*\.(jpg|jpeg|png|gif|css|js|pdf)$".to_string()],
            },
        }
    }

    #[test]
    fn test_should_crawl() {
        let config = create_test_config();
        let mut scheduler = Scheduler::new(config);
        scheduler.start_site("https://www.example.com/");

        // Should crawl valid URL on the site, with or without www
        assert!(scheduler.should_crawl("https://example.com/page1"));
        assert!(scheduler.should_crawl("https://www.example.com/page3"));

        // Should not crawl the same URL twice
        assert!(!scheduler.should_crawl("https://example.com/page1"));

        // Should not crawl the site's main page again
        assert!(!scheduler.should_crawl("https://www.example.com"));

        // Should not crawl URLs on other hosts
        assert!(!scheduler.should_crawl("https://other-site.com/page"));

        // Should not crawl excluded file types
        assert!(!scheduler.should_crawl("https://example.com/bulletin.pdf"));

        // Should crawl other valid URLs
        assert!(scheduler.should_crawl("https://example.com/page2"));
    }

    #[test]
    fn test_normalize_url() {
        let config = create_test_config();
        let scheduler = Scheduler::new(config);

        // Test case insensitivity in host
        assert_eq!(
            scheduler.normalize_url("https://EXAMPLE.com/path"),
            "https://example.com/path"
        );

        // Test removal of default ports
        assert_eq!(
            scheduler.normalize_url("https://example.com:443/path"),
            "https://example.com/path"
        );

        // Test removal of trailing slash
        assert_eq!(
            scheduler.normalize_url("https://example.com/"),
            "https://example.com"
        );

        // Test query parameter sorting
        assert_eq!(
            scheduler.normalize_url("https://example.com/search?b=2&a=1"),
            "https://example.com/search?a=1&b=2"
        );

        // Test fragment removal
        assert_eq!(
            scheduler.normalize_url("https://example.com/page#section"),
            "https://example.com/page"
        );
    }

    #[test]
    fn test_subpages_prefer_probes_then_hints() {
        let mut scheduler = Scheduler::new(create_test_config());
        let site = "https://church.example/";
        scheduler.start_site(site);
        let links = vec![
            "https://church.example/give".to_string(),
            "https://church.example/ministries/special-needs".to_string(),
            "https://church.example/about".to_string(),
            "https://elsewhere.example/ministries".to_string(),
            "https://church.example/therapy-dogs".to_string(),
        ];

        let pages = scheduler.subpages(site, &links);
        assert_eq!(
            pages,
            vec![
                "https://church.example/about".to_string(),
                "https://church.example/services".to_string(),
                "https://church.example/ministries/special-needs".to_string(),
            ]
        );
    }

    #[test]
    fn test_start_site_resets_seen() {
        let mut scheduler = Scheduler::new(create_test_config());
        scheduler.start_site("https://a.example/");
        assert!(scheduler.should_crawl("https://a.example/about"));
        assert_eq!(scheduler.seen_count(), 2);

        scheduler.start_site("https://b.example/");
        assert_eq!(scheduler.seen_count(), 1);
        assert!(!scheduler.should_crawl("https://a.example/about"));
    }
}
