use std::collections::HashMap;
use rand::{thread_rng, Rng};
use tracing::debug;

use crate::cli::config::BrowserFingerprint;
use crate::error::CrawlError;

const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";

/// Pool of request identities the fetcher presents, one at a time
pub struct FingerprintManager {
    /// Available fingerprints to use
    fingerprints: Vec<BrowserFingerprint>,

    /// Index of the fingerprint in use
    current: usize,
}

impl FingerprintManager {
    /// Create a manager starting at a random fingerprint
    pub fn new(fingerprints: Vec<BrowserFingerprint>) -> Result<Self, CrawlError> {
        if fingerprints.is_empty() {
            return Err(CrawlError::config("No fingerprints available"));
        }
        let current = thread_rng().gen_range(0..fingerprints.len());
        Ok(Self { fingerprints, current })
    }

    /// Create a manager starting at the first fingerprint
    #[cfg(test)]
    pub fn in_order(fingerprints: Vec<BrowserFingerprint>) -> Result<Self, CrawlError> {
        let mut manager = Self::new(fingerprints)?;
        manager.current = 0;
        Ok(manager)
    }

    pub fn current(&self) -> &BrowserFingerprint {
        &self.fingerprints[self.current]
    }

    /// Move to the next fingerprint in the pool
    pub fn rotate(&mut self) -> &BrowserFingerprint {
        self.current = (self.current + 1) % self.fingerprints.len();
        debug!("Rotated identity to {}", self.fingerprints[self.current].name);
        self.current()
    }

    /// Request headers for the current fingerprint
    pub fn headers(&self) -> HashMap<String, String> {
        let fingerprint = self.current();
        let mut headers = HashMap::new();

        // Standard browser headers first so the fingerprint can override them
        headers.insert("Accept".to_string(), ACCEPT.to_string());
        headers.insert("DNT".to_string(), "1".to_string());
        headers.insert("Connection".to_string(), "keep-alive".to_string());
        headers.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());
        headers.insert("Sec-Fetch-Dest".to_string(), "document".to_string());
        headers.insert("Sec-Fetch-Mode".to_string(), "navigate".to_string());
        headers.insert("Sec-Fetch-Site".to_string(), "none".to_string());
        headers.insert("Cache-Control".to_string(), "max-age=0".to_string());

        headers.insert("User-Agent".to_string(), fingerprint.user_agent.clone());
        headers.insert("Accept-Language".to_string(), fingerprint.accept_language.clone());

        for (key, value) in &fingerprint.extra_headers {
            headers.insert(key.clone(), value.clone());
        }

        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(name: &str, user_agent: &str) -> BrowserFingerprint {
        BrowserFingerprint {
            name: name.to_string(),
            user_agent: user_agent.to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            platform: "Win32".to_string(),
            extra_headers: HashMap::from([("DNT".to_string(), "0".to_string())]),
        }
    }

    #[test]
    fn test_rotation_cycles_through_pool() {
        let mut manager = FingerprintManager::in_order(vec![
            fingerprint("a", "AgentA/1.0"),
            fingerprint("b", "AgentB/1.0"),
        ])
        .unwrap();

        assert_eq!(manager.current().name, "a");
        assert_eq!(manager.rotate().name, "b");
        assert_eq!(manager.rotate().name, "a");
    }

    #[test]
    fn test_headers_carry_identity() {
        let manager = FingerprintManager::in_order(vec![fingerprint("a", "AgentA/1.0")]).unwrap();
        let headers = manager.headers();
        assert_eq!(headers.get("User-Agent").map(String::as_str), Some("AgentA/1.0"));
        assert_eq!(headers.get("DNT").map(String::as_str), Some("0"));
        assert!(headers.contains_key("Accept"));
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        assert!(FingerprintManager::new(vec![]).is_err());
    }
}
