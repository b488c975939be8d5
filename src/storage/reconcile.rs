use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cli::config::DatastoreSettings;
use crate::error::CrawlError;
use crate::storage::datastore::{id_text, Datastore};
use crate::storage::sink::ResultRow;
use crate::utils::normalize::{name_city_key, normalize_phone};

/// Columns read from the provider table for matching
pub const MATCH_COLUMNS: &str = "id,provider_name,city,phone";

/// Provider ids keyed by normalised phone and by `name|city`
#[derive(Debug, Default)]
pub struct ProviderIndex {
    by_phone: HashMap<String, String>,
    by_name_city: HashMap<String, String>,
}

impl ProviderIndex {
    /// Index selected rows; the first provider holding a key keeps it
    pub fn from_rows(rows: &[Value]) -> Self {
        let mut index = Self::default();
        for row in rows {
            let Some(id) = row.get("id").and_then(id_text) else {
                continue;
            };
            let text = |column: &str| row.get(column).and_then(Value::as_str).unwrap_or("");
            if let Some(phone) = normalize_phone(text("phone")) {
                index.by_phone.entry(phone).or_insert_with(|| id.clone());
            }
            if let Some(key) = name_city_key(text("provider_name"), text("city")) {
                index.by_name_city.entry(key).or_insert(id);
            }
        }
        index
    }

    pub fn is_empty(&self) -> bool {
        self.by_phone.is_empty() && self.by_name_city.is_empty()
    }

    /// Phone match first, then name and city
    pub fn find(&self, row: &ResultRow) -> Option<&str> {
        let by_phone = row
            .phone
            .as_deref()
            .and_then(normalize_phone)
            .and_then(|phone| self.by_phone.get(&phone));
        let by_name = || {
            let name = row.name.as_deref()?;
            let key = name_city_key(name, row.city.as_deref().unwrap_or(""))?;
            self.by_name_city.get(&key)
        };
        by_phone.or_else(by_name).map(String::as_str)
    }
}

/// Outcome of a push
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PushSummary {
    pub rows: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub updated: usize,
    pub inserted: usize,
    /// Inserts rejected as duplicates
    pub skipped: usize,
    pub failed: usize,
    pub batches: usize,
}

/// Parse `column=value` assignments into an update payload. Values are read as JSON when they
/// parse (`true`, `3`, `"x"`) and kept as plain strings otherwise.
pub fn parse_assignments(assignments: &[String]) -> Result<Value, CrawlError> {
    let mut payload = Map::new();
    for assignment in assignments {
        let (column, raw) = assignment
            .split_once('=')
            .ok_or_else(|| CrawlError::config(format!("expected column=value, got '{}'", assignment)))?;
        let column = column.trim();
        if column.is_empty() {
            return Err(CrawlError::config(format!("empty column name in '{}'", assignment)));
        }
        let value = serde_json::from_str(raw.trim())
            .unwrap_or_else(|_| Value::String(raw.trim().to_string()));
        payload.insert(column.to_string(), value);
    }
    Ok(Value::Object(payload))
}

/// JSON object inserted for one result row, with `extra` columns layered on top
pub fn insert_payload(row: &ResultRow, extra: &Value) -> Value {
    let mut object = Map::new();
    let mut put = |column: &str, value: &Option<String>| {
        if let Some(value) = value {
            object.insert(column.to_string(), Value::String(value.clone()));
        }
    };
    put("provider_name", &row.name);
    put("city", &row.city);
    put("state", &row.state);
    put("phone", &row.phone);
    put("email", &row.email);
    put("address", &row.address);
    put("website", &row.final_url.clone().or_else(|| row.url.clone()));

    if let Value::Object(extra) = extra {
        for (column, value) in extra {
            object.insert(column.clone(), value.clone());
        }
    }
    Value::Object(object)
}

/// Applies result rows to the provider table
pub struct Reconciler<'a, D: Datastore> {
    store: &'a D,
    settings: &'a DatastoreSettings,
}

impl<'a, D: Datastore> Reconciler<'a, D> {
    pub fn new(store: &'a D, settings: &'a DatastoreSettings) -> Self {
        Self { store, settings }
    }

    fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.settings.batch_delay_ms)
    }

    /// Run `call` until it succeeds, fails for good, or `max_attempts` is spent.
    /// Only throttling and transient network errors are repeated.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, CrawlError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CrawlError>>,
    {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let wait = self.settings.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, max_attempts, e, wait
                    );
                    sleep(wait).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    /// Match rows to existing providers and set `payload` on every matched id, in batches
    pub async fn update_matches(&self, rows: &[ResultRow], payload: &Value) -> Result<PushSummary> {
        let table = self.settings.table.as_str();
        info!("Fetching providers from {}", table);
        let store = self.store;
        let providers = self
            .with_retry("select providers", move || store.select(table, MATCH_COLUMNS, &[]))
            .await?;
        let index = ProviderIndex::from_rows(&providers);
        if index.is_empty() {
            warn!("No providers returned from {}", table);
        }

        let mut summary = PushSummary {
            rows: rows.len(),
            ..PushSummary::default()
        };
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for row in rows {
            match index.find(row) {
                Some(id) => {
                    summary.matched += 1;
                    if seen.insert(id.to_string()) {
                        ids.push(id.to_string());
                    }
                }
                None => {
                    summary.unmatched += 1;
                    debug!("No provider matches {}", row.target);
                }
            }
        }
        info!("Matched {} of {} rows to {} providers", summary.matched, rows.len(), ids.len());

        let batch_size = self.settings.batch_size.max(1);
        let total = (ids.len() + batch_size - 1) / batch_size;
        for (i, batch) in ids.chunks(batch_size).enumerate() {
            if i > 0 {
                sleep(self.batch_delay()).await;
            }
            summary.batches += 1;
            let what = format!("update batch {}/{}", i + 1, total);
            match self
                .with_retry(&what, move || store.update_by_ids(table, batch, payload))
                .await
            {
                Ok(()) => {
                    summary.updated += batch.len();
                    info!("Updated batch {}/{} ({} providers)", i + 1, total, batch.len());
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    summary.failed += batch.len();
                    warn!("Batch {}/{} failed: {}", i + 1, total, e);
                }
            }
        }
        Ok(summary)
    }

    /// Insert one provider per row, a batch per request. A batch holding a duplicate is retried
    /// row by row so only the duplicates are skipped.
    pub async fn insert_rows(&self, rows: &[ResultRow], extra: &Value) -> Result<PushSummary> {
        let table = self.settings.table.as_str();
        let store = self.store;
        let mut summary = PushSummary {
            rows: rows.len(),
            ..PushSummary::default()
        };

        let batch_size = self.settings.batch_size.max(1);
        let total = (rows.len() + batch_size - 1) / batch_size;
        for (i, batch) in rows.chunks(batch_size).enumerate() {
            if i > 0 {
                sleep(self.batch_delay()).await;
            }
            summary.batches += 1;
            let payloads: Vec<Value> = batch.iter().map(|row| insert_payload(row, extra)).collect();
            let what = format!("insert batch {}/{}", i + 1, total);
            let rows_payload = payloads.as_slice();
            match self
                .with_retry(&what, move || store.insert_many(table, rows_payload))
                .await
            {
                Ok(()) => {
                    summary.inserted += batch.len();
                    info!("Inserted batch {}/{} ({} rows)", i + 1, total, batch.len());
                }
                Err(CrawlError::DatastoreConflict(detail)) => {
                    debug!("Batch {}/{} holds a duplicate ({}), inserting row by row", i + 1, total, detail);
                    for (row, payload) in batch.iter().zip(&payloads) {
                        let what = format!("insert {}", row.target);
                        match self.with_retry(&what, move || store.insert(table, payload)).await {
                            Ok(()) => summary.inserted += 1,
                            Err(CrawlError::DatastoreConflict(detail)) => {
                                summary.skipped += 1;
                                debug!("Skipped duplicate {}: {}", row.target, detail);
                            }
                            Err(e) if e.is_fatal() => return Err(e.into()),
                            Err(e) => {
                                summary.failed += 1;
                                warn!("Insert of {} failed: {}", row.target, e);
                            }
                        }
                    }
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    summary.failed += batch.len();
                    warn!("Batch {}/{} failed: {}", i + 1, total, e);
                }
            }
        }
        info!(
            "Inserted {} rows into {} ({} duplicates skipped, {} failed)",
            summary.inserted, table, summary.skipped, summary.failed
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassificationRecord, Decision};
    use crate::storage::datastore::Filter;
    use async_trait::async_trait;
    use chrono::Utc;
    use mockall::mock;
    use serde_json::json;

    mock! {
        pub Store {}
        #[async_trait]
        impl Datastore for Store {
            async fn insert(&self, table: &str, row: &Value) -> Result<(), CrawlError>;
            async fn insert_many(&self, table: &str, rows: &[Value]) -> Result<(), CrawlError>;
            async fn select(
                &self,
                table: &str,
                columns: &str,
                filters: &[Filter],
            ) -> Result<Vec<Value>, CrawlError>;
            async fn update_by_id(&self, table: &str, id: &str, payload: &Value) -> Result<(), CrawlError>;
            async fn update_by_ids(
                &self,
                table: &str,
                ids: &[String],
                payload: &Value,
            ) -> Result<(), CrawlError>;
        }
    }

    fn result(target: &str, name: &str, city: &str, phone: Option<&str>) -> ResultRow {
        let mut classification = ClassificationRecord::no_source(target, "aba-therapy", "");
        classification.decision = Decision::Keep;
        ResultRow {
            target: target.to_string(),
            record_id: None,
            name: Some(name.to_string()),
            city: Some(city.to_string()),
            state: Some("FL".to_string()),
            url: Some(format!("https://{}.example/", target)),
            final_url: None,
            title: None,
            phone: phone.map(|p| p.to_string()),
            email: None,
            address: None,
            source: None,
            fetch_status: None,
            pages_scanned: 1,
            classification,
            crawled_at: Utc::now(),
        }
    }

    fn providers() -> Vec<Value> {
        vec![
            json!({"id": 1, "provider_name": "Sunrise ABA", "city": "Miami", "phone": "(305) 555-0101"}),
            json!({"id": 2, "provider_name": "Bright Steps", "city": "Tampa", "phone": null}),
            json!({"id": 3, "provider_name": "Coastal Behavior", "city": "Naples", "phone": "239-555-0188"}),
        ]
    }

    fn settings(batch_size: usize) -> DatastoreSettings {
        DatastoreSettings {
            batch_size,
            batch_delay_ms: 1_000,
            ..DatastoreSettings::default()
        }
    }

    #[test]
    fn test_index_prefers_phone_then_name_city() {
        let index = ProviderIndex::from_rows(&providers());
        assert_eq!(index.find(&result("a", "Other Name", "Miami", Some("305.555.0101"))), Some("1"));
        assert_eq!(index.find(&result("b", "  BRIGHT steps ", "tampa", None)), Some("2"));
        assert_eq!(index.find(&result("c", "Bright Steps", "Orlando", Some("407-555-0000"))), None);
    }

    #[test]
    fn test_parse_assignments() {
        let payload = parse_assignments(&["aba=true".to_string(), "note=checked by crawl".to_string()])
            .unwrap();
        assert_eq!(payload, json!({"aba": true, "note": "checked by crawl"}));
        assert!(parse_assignments(&["verified".to_string()]).unwrap_err().is_fatal());
    }

    #[test]
    fn test_insert_payload_layers_extra_columns() {
        let row = result("sunrise", "Sunrise ABA", "Miami", Some("305-555-0101"));
        let payload = insert_payload(&row, &json!({"aba": true}));
        assert_eq!(payload["provider_name"], "Sunrise ABA");
        assert_eq!(payload["website"], "https://sunrise.example/");
        assert_eq!(payload["aba"], true);
        assert!(payload.get("email").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_matches_in_batches() {
        let mut store = MockStore::new();
        store
            .expect_select()
            .withf(|table, columns, _| table.to_string() == "providers" && columns.to_string() == MATCH_COLUMNS)
            .times(1)
            .returning(|_, _, _| Ok(providers()));
        store
            .expect_update_by_ids()
            .withf(|_, ids, payload| ids.len() <= 2 && payload.get("aba") == Some(&Value::Bool(true)))
            .times(2)
            .returning(|_, _, _| Ok(()));

        let settings = settings(2);
        let rows = vec![
            result("a", "Sunrise ABA", "Miami", Some("305-555-0101")),
            result("a2", "Sunrise ABA Miami", "Miami", Some("3055550101")),
            result("b", "Bright Steps", "Tampa", None),
            result("c", "Coastal Behavior", "Naples", Some("239-555-0188")),
            result("d", "Unknown", "Ocala", None),
        ];

        let started = tokio::time::Instant::now();
        let summary = Reconciler::new(&store, &settings)
            .update_matches(&rows, &json!({"aba": true}))
            .await
            .unwrap();

        assert_eq!(summary.matched, 4);
        assert_eq!(summary.unmatched, 1);
        assert_eq!(summary.updated, 3);
        assert_eq!(summary.batches, 2);
        assert!(started.elapsed() >= Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_counts_conflicts_as_skips() {
        let mut store = MockStore::new();
        store
            .expect_insert_many()
            .withf(|_, rows| rows.len() == 3)
            .times(1)
            .returning(|_, _| Err(CrawlError::DatastoreConflict("providers_pkey".to_string())));
        store.expect_insert().times(3).returning(|_, row| {
            if row["provider_name"] == "Grace Church" {
                Err(CrawlError::DatastoreConflict("providers_pkey".to_string()))
            } else {
                Ok(())
            }
        });

        let settings = settings(500);
        let rows = vec![
            result("a", "Hope Church", "Miami", None),
            result("b", "Grace Church", "Tampa", None),
            result("c", "Harbor Church", "Orlando", None),
        ];
        let summary = Reconciler::new(&store, &settings)
            .insert_rows(&rows, &Value::Null)
            .await
            .unwrap();

        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_sends_one_request_per_batch() {
        let mut store = MockStore::new();
        store
            .expect_insert_many()
            .withf(|table, rows| table.to_string() == "providers" && rows.len() <= 2)
            .times(2)
            .returning(|_, _| Ok(()));
        store.expect_insert().never();

        let settings = settings(2);
        let rows = vec![
            result("a", "Hope Church", "Miami", None),
            result("b", "Grace Church", "Tampa", None),
            result("c", "Harbor Church", "Orlando", None),
        ];
        let summary = Reconciler::new(&store, &settings)
            .insert_rows(&rows, &json!({"autism_friendly": true}))
            .await
            .unwrap();

        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.batches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_update_failure_is_retried() {
        let mut store = MockStore::new();
        store
            .expect_select()
            .times(1)
            .returning(|_, _, _| Ok(providers()));
        let mut calls = 0;
        store.expect_update_by_ids().times(2).returning(move |_, _, _| {
            calls += 1;
            if calls == 1 {
                Err(CrawlError::TransientNetwork("update providers returned 503".to_string()))
            } else {
                Ok(())
            }
        });

        let settings = settings(500);
        let rows = vec![
            result("a", "Sunrise ABA", "Miami", Some("305-555-0101")),
            result("b", "Bright Steps", "Tampa", None),
        ];
        let started = tokio::time::Instant::now();
        let summary = Reconciler::new(&store, &settings)
            .update_matches(&rows, &json!({"aba": true}))
            .await
            .unwrap();

        assert_eq!(summary.updated, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.batches, 1);
        assert!(started.elapsed() >= settings.backoff(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_stop_at_max_attempts() {
        let mut store = MockStore::new();
        store
            .expect_select()
            .times(1)
            .returning(|_, _, _| Ok(providers()));
        store
            .expect_update_by_ids()
            .times(3)
            .returning(|_, _, _| Err(CrawlError::RateLimited("429".to_string())));

        let settings = settings(500);
        let rows = vec![result("a", "Sunrise ABA", "Miami", Some("305-555-0101"))];
        let summary = Reconciler::new(&store, &settings)
            .update_matches(&rows, &json!({"aba": true}))
            .await
            .unwrap();

        assert_eq!(summary.updated, 0);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_credential_rejection_aborts_push() {
        let mut store = MockStore::new();
        store
            .expect_select()
            .returning(|_, _, _| Err(CrawlError::config("select from providers returned 401")));

        let settings = settings(500);
        let rows = vec![result("a", "Sunrise ABA", "Miami", None)];
        let err = Reconciler::new(&store, &settings)
            .update_matches(&rows, &json!({"aba": true}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
