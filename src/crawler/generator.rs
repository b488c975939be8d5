use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::cli::config::{DirectorySource, SearchSettings};
use crate::crawler::task::Target;
use crate::storage::input::InputTable;

/// Search engines with an HTML results page we can read
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SearchEngine {
    DuckDuckGo,
    Bing,
}

impl SearchEngine {
    pub fn name(&self) -> &'static str {
        match self {
            SearchEngine::DuckDuckGo => "duckduckgo",
            SearchEngine::Bing => "bing",
        }
    }

    fn endpoint(&self) -> &'static str {
        match self {
            SearchEngine::DuckDuckGo => "https://html.duckduckgo.com/html/",
            SearchEngine::Bing => "https://www.bing.com/search",
        }
    }

    /// Results page URL for `query`
    pub fn search_url(&self, query: &str) -> String {
        match Url::parse_with_params(self.endpoint(), &[("q", query)]) {
            Ok(url) => url.to_string(),
            Err(_) => self.endpoint().to_string(),
        }
    }

    /// CSS selector for organic result links
    pub fn result_selector(&self) -> &'static str {
        match self {
            SearchEngine::DuckDuckGo => "a.result__a",
            SearchEngine::Bing => "li.b_algo h2 a",
        }
    }
}

/// Search query strings: every template over the location × entity × accommodation product.
///
/// The order is stable and duplicates keep their first position, so a resumed run lines up with
/// the checkpoint of the interrupted one.
pub fn search_queries(settings: &SearchSettings) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut queries = Vec::new();

    'outer: for location in &settings.locations {
        for entity in &settings.entities {
            for accommodation in &settings.accommodations {
                for template in &settings.templates {
                    let query = template
                        .replace("{location}", location)
                        .replace("{entity}", entity)
                        .replace("{accommodation}", accommodation);
                    let query = query.split_whitespace().collect::<Vec<_>>().join(" ");
                    if query.is_empty() || !seen.insert(query.to_lowercase()) {
                        continue;
                    }
                    queries.push(query);
                    if settings.max_queries.map_or(false, |max| queries.len() >= max) {
                        break 'outer;
                    }
                }
            }
        }
    }

    debug!("Generated {} search queries", queries.len());
    queries
}

/// Query targets with engines assigned round-robin
pub fn search_targets(settings: &SearchSettings) -> Vec<Target> {
    let engines = if settings.engines.is_empty() {
        vec![SearchEngine::DuckDuckGo]
    } else {
        settings.engines.clone()
    };
    let targets: Vec<Target> = search_queries(settings)
        .iter()
        .enumerate()
        .map(|(i, query)| Target::query(query, engines[i % engines.len()]))
        .collect();
    info!("Prepared {} search targets over {} engines", targets.len(), engines.len());
    targets
}

/// Listing page targets for every configured directory
pub fn listing_targets(sources: &[DirectorySource]) -> Vec<Target> {
    let mut targets = Vec::new();
    for source in sources {
        match source.last_page {
            Some(last) if source.url_template.contains("{page}") => {
                for page in source.first_page..=last {
                    let url = source.url_template.replace("{page}", &page.to_string());
                    targets.push(Target::listing(&url, &source.link_selector, &source.name));
                }
            }
            _ => {
                let url = source
                    .url_template
                    .replace("{page}", &source.first_page.to_string());
                targets.push(Target::listing(&url, &source.link_selector, &source.name));
            }
        }
    }
    info!("Prepared {} listing targets from {} directories", targets.len(), sources.len());
    targets
}

/// One site target per input row, first row wins on a shared identifier
pub fn record_targets(table: &InputTable, source: &str) -> Vec<Target> {
    let mut seen = HashSet::new();
    table
        .records
        .iter()
        .map(|record| Target::from_record(record.clone(), source))
        .filter(|target| seen.insert(target.id.clone()))
        .collect()
}
