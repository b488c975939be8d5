use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::{thread_rng, Rng};
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::browser::FingerprintManager;
use crate::cli::config::FetcherSettings;
use crate::crawler::task::{FetchResult, FetchStatus};

/// A response as it came off the wire
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    pub final_url: String,
}

/// Connection-level failure reported by a page source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No answer within the request timeout
    Timeout(String),

    /// Reset, refused, DNS or redirect-chain failure
    Connection(String),

    /// The request could not be built at all
    Invalid(String),
}

/// The "fetch a URL" capability the rate-limited fetcher wraps
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn get(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<RawResponse, TransportError>;
}

/// `PageSource` backed by a shared `reqwest` client
pub struct HttpPageSource {
    client: reqwest::Client,
}

impl HttpPageSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn get(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<RawResponse, TransportError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(|e| classify_transport(&e))?;

        Ok(RawResponse {
            status,
            body,
            final_url,
        })
    }
}

fn classify_transport(error: &reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(error.to_string())
    } else if error.is_builder() {
        TransportError::Invalid(error.to_string())
    } else {
        TransportError::Connection(error.to_string())
    }
}

/// Counters exposed for logging and tests
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct FetcherStats {
    /// Requests sent, retries included
    pub requests: u64,

    pub rotations: u64,

    /// Extended pauses taken every `rotate_every` requests
    pub long_cooldowns: u64,

    /// Extended pauses taken after a rate-limit signal
    pub rate_limit_cooldowns: u64,

    pub retries: u64,

    pub circuit_breaks: u64,
}

/// How one response should be handled
enum Verdict {
    Done(FetchResult),
    RateLimited(FetchResult),
    Blocked(FetchResult),
    Transient(FetchResult),
}

/// Wraps a `PageSource` with pacing, identity rotation, bounded retries and a circuit breaker.
///
/// `fetch` never fails: every outcome is folded into a `FetchResult`.
pub struct RateLimitedFetcher<S: PageSource> {
    source: S,
    settings: FetcherSettings,
    identities: FingerprintManager,

    /// Drives the periodic cooldown and rotation
    request_count: u64,
    last_request: Option<Instant>,
    consecutive_failures: u32,
    stats: FetcherStats,
}

impl<S: PageSource> RateLimitedFetcher<S> {
    pub fn new(source: S, settings: FetcherSettings, identities: FingerprintManager) -> Self {
        let markers = settings
            .challenge_markers
            .iter()
            .map(|m| m.to_lowercase())
            .collect();
        Self {
            source,
            settings: FetcherSettings {
                challenge_markers: markers,
                ..settings
            },
            identities,
            request_count: 0,
            last_request: None,
            consecutive_failures: 0,
            stats: FetcherStats::default(),
        }
    }

    pub fn stats(&self) -> &FetcherStats {
        &self.stats
    }

    pub fn identity(&self) -> &str {
        &self.identities.current().name
    }

    fn rotate(&mut self) {
        self.identities.rotate();
        self.stats.rotations += 1;
    }

    /// Wait out the inter-request interval; every `rotate_every` requests take the long pause instead
    async fn pace(&mut self) {
        self.request_count += 1;
        self.stats.requests += 1;

        if self.request_count % self.settings.rotate_every == 0 {
            info!(
                "Extended cooldown ({:?}) after {} requests",
                self.settings.long_cooldown(),
                self.request_count
            );
            sleep(self.settings.long_cooldown()).await;
            self.stats.long_cooldowns += 1;
            self.rotate();
        } else if let Some(last) = self.last_request {
            let interval = Duration::from_millis(
                thread_rng().gen_range(self.settings.min_delay_ms..=self.settings.max_delay_ms),
            );
            let wait = interval.saturating_sub(last.elapsed());
            if !wait.is_zero() {
                debug!("Waiting {:?} before next request", wait);
                sleep(wait).await;
            }
        }

        self.last_request = Some(Instant::now());
    }

    fn is_challenge(&self, body: &str) -> bool {
        if self.settings.challenge_markers.is_empty() {
            return false;
        }
        let lowered = body.to_lowercase();
        self.settings
            .challenge_markers
            .iter()
            .any(|marker| lowered.contains(marker.as_str()))
    }

    fn assess(&self, response: RawResponse) -> Verdict {
        let status = response.status;
        match status {
            429 => Verdict::RateLimited(FetchResult::failure(
                FetchStatus::RateLimited,
                Some(status),
                "HTTP 429",
            )),
            403 => Verdict::Blocked(FetchResult::failure(
                FetchStatus::Blocked,
                Some(status),
                "HTTP 403",
            )),
            404 | 410 => Verdict::Done(FetchResult::failure(
                FetchStatus::NotFound,
                Some(status),
                format!("HTTP {}", status),
            )),
            500..=599 => Verdict::Transient(FetchResult::failure(
                FetchStatus::Error,
                Some(status),
                format!("HTTP {}", status),
            )),
            200..=299 if self.is_challenge(&response.body) => Verdict::RateLimited(
                FetchResult::failure(FetchStatus::RateLimited, Some(status), "bot challenge"),
            ),
            200..=299 => Verdict::Done(FetchResult::success(
                response.body,
                response.final_url,
                status,
            )),
            _ => Verdict::Done(FetchResult::failure(
                FetchStatus::Error,
                Some(status),
                format!("HTTP {}", status),
            )),
        }
    }

    /// Fetch `url` within the retry budget
    pub async fn fetch(&mut self, url: &str) -> FetchResult {
        let started = Instant::now();
        let max_attempts = self.settings.max_attempts.max(1);
        let mut cooled_down = false;
        let mut outcome = FetchResult::failure(FetchStatus::Error, None, "no attempt made");
        let mut attempts = 0;

        for attempt in 1..=max_attempts {
            attempts = attempt;
            if attempt > 1 {
                self.stats.retries += 1;
            }
            self.pace().await;

            let headers = self.identities.headers();
            let verdict = match self.source.get(url, &headers).await {
                Ok(response) => self.assess(response),
                Err(TransportError::Timeout(detail)) => {
                    Verdict::Transient(FetchResult::failure(FetchStatus::Timeout, None, detail))
                }
                Err(TransportError::Connection(detail)) => {
                    Verdict::Transient(FetchResult::failure(FetchStatus::Error, None, detail))
                }
                Err(TransportError::Invalid(detail)) => {
                    Verdict::Done(FetchResult::failure(FetchStatus::Error, None, detail))
                }
            };
            let last_attempt = attempt == max_attempts;

            match verdict {
                Verdict::Done(result) => {
                    outcome = result;
                    break;
                }
                Verdict::RateLimited(result) => {
                    // One extended cooldown per fetch, ordinary backoff after that
                    if !cooled_down {
                        cooled_down = true;
                        warn!(
                            "Rate limited on {} ({}). Cooling down for {:?}",
                            url,
                            result.detail.as_deref().unwrap_or("unknown"),
                            self.settings.rate_limit_cooldown()
                        );
                        sleep(self.settings.rate_limit_cooldown()).await;
                        self.stats.rate_limit_cooldowns += 1;
                    } else if !last_attempt {
                        sleep(self.settings.backoff(attempt)).await;
                    }
                    self.rotate();
                    outcome = result;
                }
                Verdict::Blocked(result) => {
                    warn!("Blocked on {}. Rotating identity", url);
                    self.rotate();
                    if !last_attempt {
                        sleep(self.settings.backoff(attempt)).await;
                    }
                    outcome = result;
                }
                Verdict::Transient(result) => {
                    debug!(
                        "Transient failure on {} (attempt {}/{}): {}",
                        url,
                        attempt,
                        max_attempts,
                        result.detail.as_deref().unwrap_or("unknown")
                    );
                    if !last_attempt {
                        sleep(self.settings.backoff(attempt)).await;
                    }
                    outcome = result;
                }
            }
        }

        outcome.attempts = attempts;
        outcome.elapsed_ms = started.elapsed().as_millis() as u64;
        self.settle(&outcome).await;
        outcome
    }

    /// Track consecutive terminal failures and trip the circuit breaker
    async fn settle(&mut self, outcome: &FetchResult) {
        match outcome.status {
            FetchStatus::Success => self.consecutive_failures = 0,
            // A missing page says nothing about how the remote side treats us
            FetchStatus::NotFound => {}
            _ => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.settings.circuit_threshold {
                    warn!(
                        "{} consecutive failures. Pausing for {:?}",
                        self.consecutive_failures,
                        self.settings.circuit_pause()
                    );
                    sleep(self.settings.circuit_pause()).await;
                    self.rotate();
                    self.stats.circuit_breaks += 1;
                    self.consecutive_failures = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::BrowserFingerprint;
    use mockall::mock;
    use std::sync::{Arc, Mutex};

    mock! {
        pub Source {}
        #[async_trait]
        impl PageSource for Source {
            async fn get(
                &self,
                url: &str,
                headers: &HashMap<String, String>,
            ) -> Result<RawResponse, TransportError>;
        }
    }

    fn identities() -> FingerprintManager {
        let fingerprint = |name: &str| BrowserFingerprint {
            name: name.to_string(),
            user_agent: format!("{}/1.0", name),
            accept_language: "en-US".to_string(),
            platform: "Linux".to_string(),
            extra_headers: HashMap::new(),
        };
        FingerprintManager::in_order(vec![fingerprint("first"), fingerprint("second")]).unwrap()
    }

    fn settings() -> FetcherSettings {
        FetcherSettings {
            min_delay_ms: 1_000,
            max_delay_ms: 2_000,
            rotate_every: 50,
            long_cooldown_ms: 60_000,
            rate_limit_cooldown_ms: 30_000,
            max_attempts: 3,
            backoff_base_ms: 500,
            circuit_threshold: 5,
            circuit_pause_ms: 120_000,
            timeout_ms: 5_000,
            challenge_markers: vec!["Unusual Traffic".to_string()],
        }
    }

    fn ok(body: &str) -> Result<RawResponse, TransportError> {
        Ok(RawResponse {
            status: 200,
            body: body.to_string(),
            final_url: "https://site.example/".to_string(),
        })
    }

    fn status(code: u16) -> Result<RawResponse, TransportError> {
        Ok(RawResponse {
            status: code,
            body: String::new(),
            final_url: "https://site.example/".to_string(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_takes_one_cooldown_and_three_attempts() {
        let mut source = MockSource::new();
        source
            .expect_get()
            .times(3)
            .returning(|_, _| ok("<p>Our systems detected unusual traffic from your network</p>"));

        let mut fetcher = RateLimitedFetcher::new(source, settings(), identities());
        let result = fetcher.fetch("https://site.example/").await;

        assert_eq!(result.status, FetchStatus::RateLimited);
        assert_eq!(result.attempts, 3);
        assert_eq!(fetcher.stats().requests, 3);
        assert_eq!(fetcher.stats().rate_limit_cooldowns, 1);
        assert!(result.content.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_then_success() {
        let mut source = MockSource::new();
        let mut calls = 0;
        source.expect_get().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                status(429)
            } else {
                ok("<html>welcome</html>")
            }
        });

        let mut fetcher = RateLimitedFetcher::new(source, settings(), identities());
        let before = fetcher.identity().to_string();
        let result = fetcher.fetch("https://site.example/").await;

        assert!(result.is_success());
        assert_eq!(result.content, "<html>welcome</html>");
        assert_eq!(fetcher.stats().rate_limit_cooldowns, 1);
        assert_ne!(fetcher.identity(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let mut source = MockSource::new();
        source.expect_get().times(1).returning(|_, _| status(404));

        let mut fetcher = RateLimitedFetcher::new(source, settings(), identities());
        let result = fetcher.fetch("https://gone.example/").await;

        assert_eq!(result.status, FetchStatus::NotFound);
        assert_eq!(fetcher.stats().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_back_off_then_give_up() {
        let mut source = MockSource::new();
        source
            .expect_get()
            .times(3)
            .returning(|_, _| Err(TransportError::Timeout("timed out".to_string())));

        let mut fetcher = RateLimitedFetcher::new(source, settings(), identities());
        let started = Instant::now();
        let result = fetcher.fetch("https://slow.example/").await;

        assert_eq!(result.status, FetchStatus::Timeout);
        assert_eq!(fetcher.stats().retries, 2);
        // Backoff and pacing overlap, but each gap is at least the one-second minimum interval
        assert!(started.elapsed() >= Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_retries_and_recovers() {
        let mut source = MockSource::new();
        let mut calls = 0;
        source.expect_get().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                status(503)
            } else {
                ok("back")
            }
        });

        let mut fetcher = RateLimitedFetcher::new(source, settings(), identities());
        assert!(fetcher.fetch("https://flaky.example/").await.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_terminal() {
        let mut source = MockSource::new();
        source.expect_get().times(1).returning(|_, _| status(401));

        let mut fetcher = RateLimitedFetcher::new(source, settings(), identities());
        let result = fetcher.fetch("https://private.example/").await;
        assert_eq!(result.status, FetchStatus::Error);
        assert_eq!(result.http_status, Some(401));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_are_spaced_by_minimum_delay() {
        let mut source = MockSource::new();
        source.expect_get().times(2).returning(|_, _| ok("page"));

        let mut fetcher = RateLimitedFetcher::new(source, settings(), identities());
        fetcher.fetch("https://a.example/").await;
        let between = Instant::now();
        fetcher.fetch("https://b.example/").await;

        assert!(between.elapsed() >= Duration::from_millis(1_000));
        assert!(between.elapsed() <= Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_cooldown_rotates_identity() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let mut source = MockSource::new();
        source.expect_get().times(3).returning(move |_, headers| {
            let agent = headers.get("User-Agent").cloned().unwrap_or_default();
            captured.lock().unwrap().push(agent);
            ok("page")
        });

        let mut fetcher = RateLimitedFetcher::new(
            source,
            FetcherSettings {
                rotate_every: 2,
                ..settings()
            },
            identities(),
        );
        for url in ["https://a.example/", "https://b.example/", "https://c.example/"] {
            fetcher.fetch(url).await;
        }

        assert_eq!(fetcher.stats().long_cooldowns, 1);
        let agents = seen.lock().unwrap().clone();
        assert_eq!(agents, vec!["first/1.0", "second/1.0", "second/1.0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_trips_after_consecutive_failures() {
        let mut source = MockSource::new();
        source.expect_get().returning(|_, _| status(403));

        let mut fetcher = RateLimitedFetcher::new(
            source,
            FetcherSettings {
                circuit_threshold: 2,
                ..settings()
            },
            identities(),
        );
        assert_eq!(fetcher.fetch("https://a.example/").await.status, FetchStatus::Blocked);
        assert_eq!(fetcher.stats().circuit_breaks, 0);
        fetcher.fetch("https://b.example/").await;
        assert_eq!(fetcher.stats().circuit_breaks, 1);
    }

    #[tokio::test]
    async fn test_http_source_sends_identity_headers() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ministries"))
            .and(header("User-Agent", "first/1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<h1>Ministries</h1>"))
            .expect(1)
            .mount(&server)
            .await;

        let source = HttpPageSource::new(Duration::from_secs(5)).unwrap();
        let headers = identities().headers();
        let response = source
            .get(&format!("{}/ministries", server.uri()), &headers)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "<h1>Ministries</h1>");
        assert!(response.final_url.ends_with("/ministries"));
    }

    #[tokio::test]
    async fn test_http_source_returns_throttling_status() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let source = HttpPageSource::new(Duration::from_secs(5)).unwrap();
        let response = source.get(&server.uri(), &HashMap::new()).await.unwrap();
        assert_eq!(response.status, 429);
    }
}
