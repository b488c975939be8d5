use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, info};

use crate::cli::config::DatastoreSettings;
use crate::error::CrawlError;

/// Row filter in PostgREST terms
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, String),
    In(String, Vec<String>),
}

impl Filter {
    pub fn eq(column: &str, value: impl ToString) -> Self {
        Filter::Eq(column.to_string(), value.to_string())
    }

    pub fn is_in(column: &str, values: &[String]) -> Self {
        Filter::In(column.to_string(), values.to_vec())
    }

    fn query_pair(&self) -> (String, String) {
        match self {
            Filter::Eq(column, value) => (column.clone(), format!("eq.{}", value)),
            Filter::In(column, values) => {
                let list = values.iter().map(|v| quote(v)).collect::<Vec<_>>().join(",");
                (column.clone(), format!("in.({})", list))
            }
        }
    }
}

/// Quote a list value when it holds PostgREST's reserved characters
fn quote(value: &str) -> String {
    if value.contains([',', '(', ')', '"', ' ']) {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// Text form of a row identifier
pub fn id_text(id: &Value) -> Option<String> {
    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Hosted table store reached over request/response calls
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Insert one row. A duplicate key is reported as `DatastoreConflict`.
    async fn insert(&self, table: &str, row: &Value) -> Result<(), CrawlError>;

    /// Insert rows in one request. Any duplicate key rejects the whole request.
    async fn insert_many(&self, table: &str, rows: &[Value]) -> Result<(), CrawlError>;

    /// Rows matching every filter, restricted to a comma-separated column list
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

/// `Datastore` over a PostgREST endpoint such as Supabase's `/rest/v1`
pub struct RestDatastore {
    client: Client,
    base_url: String,
    key: String,
}

impl RestDatastore {
    pub fn new(base_url: &str, key: &str, timeout: Duration) -> Result<Self, CrawlError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CrawlError::config(format!("failed to create datastore client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key: key.to_string(),
        })
    }

    /// Credentials come from the environment (a `.env` file is honoured); both must be set
    pub fn from_env(settings: &DatastoreSettings) -> Result<Self, CrawlError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }

        let read = |name: &str| {
            env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| CrawlError::config(format!("environment variable {} is not set", name)))
        };
        let url = read(&settings.url_env)?;
        let key = read(&settings.key_env)?;

        info!("Using datastore at {}", url);
        Self::new(&url, &key, Duration::from_millis(settings.timeout_ms))
    }

    fn endpoint(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", self.key.as_str())
            .header("Authorization", format!("Bearer {}", self.key))
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, CrawlError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| CrawlError::TransientNetwork(format!("{}: {}", what, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = format!("{} returned {}: {}", what, status, body.trim());
        Err(match status {
            StatusCode::CONFLICT => CrawlError::DatastoreConflict(detail),
            StatusCode::TOO_MANY_REQUESTS => CrawlError::RateLimited(detail),
            s if s.is_server_error() => CrawlError::TransientNetwork(detail),
            _ => CrawlError::Configuration(detail),
        })
    }
}

#[async_trait]
impl Datastore for RestDatastore {
    async fn insert(&self, table: &str, row: &Value) -> Result<(), CrawlError> {
        let request = self
            .client
            .post(self.endpoint(table))
            .header("Prefer", "return=minimal")
            .json(row);
        self.send(request, &format!("insert into {}", table)).await?;
        Ok(())
    }

    async fn insert_many(&self, table: &str, rows: &[Value]) -> Result<(), CrawlError> {
        if rows.is_empty() {
            return Ok(());
        }
        let request = self
            .client
            .post(self.endpoint(table))
            .header("Prefer", "return=minimal")
            .json(rows);
        self.send(request, &format!("insert {} rows into {}", rows.len(), table))
            .await?;
        Ok(())
    }

    async fn select(
        &self,
        table: &str,
        columns: &str,
        filters: &[Filter],
    ) -> Result<Vec<Value>, CrawlError> {
        let mut query = vec![("select".to_string(), columns.to_string())];
        query.extend(filters.iter().map(Filter::query_pair));

        let request = self.client.get(self.endpoint(table)).query(&query);
        let response = self.send(request, &format!("select from {}", table)).await?;
        let rows: Vec<Value> = response
            .json()
            .await
            .map_err(|e| CrawlError::ParseFailure(format!("select from {}: {}", table, e)))?;

        debug!("Selected {} rows from {}", rows.len(), table);
        Ok(rows)
    }

    async fn update_by_id(&self, table: &str, id: &str, payload: &Value) -> Result<(), CrawlError> {
        let (column, value) = Filter::eq("id", id).query_pair();
        let request = self
            .client
            .patch(self.endpoint(table))
            .query(&[(column, value)])
            .header("Prefer", "return=minimal")
            .json(payload);
        self.send(request, &format!("update {} id {}", table, id)).await?;
        Ok(())
    }

    async fn update_by_ids(
        &self,
        table: &str,
        ids: &[String],
        payload: &Value,
    ) -> Result<(), CrawlError> {
        if ids.is_empty() {
            return Ok(());
        }
        let (column, value) = Filter::is_in("id", ids).query_pair();
        let request = self
            .client
            .patch(self.endpoint(table))
            .query(&[(column, value)])
            .header("Prefer", "return=minimal")
            .json(payload);
        self.send(request, &format!("update {} ({} ids)", table, ids.len())).await?;
        Ok(())
    }
}
