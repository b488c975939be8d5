use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::CrawlError;
use crate::utils::normalize::{clean_url, natural_key};

const NAME_COLUMNS: &[&str] = &["provider_name", "name", "church_name", "organization", "company"];
const WEBSITE_COLUMNS: &[&str] = &["website", "url", "site", "web"];
const PHONE_COLUMNS: &[&str] = &["phone", "phone_number", "telephone"];
const CITY_COLUMNS: &[&str] = &["city", "town"];
const STATE_COLUMNS: &[&str] = &["state", "region"];
const ADDRESS_COLUMNS: &[&str] = &["address", "street_address", "full_address"];
const ID_COLUMNS: &[&str] = &["id", "provider_id"];

/// One row of a tabular input file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputRecord {
    /// 1-based data row number
    pub row: usize,

    pub id: Option<String>,

    pub name: String,

    /// Cleaned, fetchable website URL
    pub website: Option<String>,

    pub phone: Option<String>,

    pub city: Option<String>,

    pub state: Option<String>,

    pub address: Option<String>,

    /// Every column as read, keyed by header
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl InputRecord {
    fn from_fields(row: usize, fields: BTreeMap<String, String>) -> Self {
        let pick = |aliases: &[&str]| -> Option<String> {
            aliases.iter().find_map(|alias| {
                fields
                    .iter()
                    .find(|(header, value)| {
                        header.trim().eq_ignore_ascii_case(alias) && !value.trim().is_empty()
                    })
                    .map(|(_, value)| value.trim().to_string())
            })
        };

        Self {
            row,
            id: pick(ID_COLUMNS),
            name: pick(NAME_COLUMNS).unwrap_or_default(),
            website: pick(WEBSITE_COLUMNS).and_then(|raw| clean_url(&raw)),
            phone: pick(PHONE_COLUMNS),
            city: pick(CITY_COLUMNS),
            state: pick(STATE_COLUMNS),
            address: pick(ADDRESS_COLUMNS),
            fields,
        }
    }

    /// URL, then phone, then name and city; the row number when nothing else identifies it
    pub fn natural_key(&self) -> String {
        natural_key(
            self.website.as_deref(),
            self.phone.as_deref(),
            &self.name,
            self.city.as_deref().unwrap_or(""),
        )
        .unwrap_or_else(|| format!("row:{}", self.row))
    }
}

/// A whole input file, read into memory before processing begins
#[derive(Debug, Clone)]
pub struct InputTable {
    pub headers: Vec<String>,
    pub records: Vec<InputRecord>,
}

impl InputTable {
    /// Read a delimited file with a header row
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CrawlError::config(format!("input file not found: {}", path.display())).into());
        }
        let file = File::open(path)
            .context(format!("Failed to open input file: {}", path.display()))?;

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(file);

        let headers: Vec<String> = reader
            .headers()
            .context(format!("Failed to read header row of {}", path.display()))?
            .iter()
            .map(|h| h.to_string())
            .collect();

        let mut records = Vec::new();
        for (index, result) in reader.records().enumerate() {
            let row = index + 1;
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping unreadable row {} of {}: {}", row, path.display(), e);
                    continue;
                }
            };
            let fields = headers
                .iter()
                .zip(record.iter())
                .map(|(header, value)| (header.clone(), value.to_string()))
                .collect();
            records.push(InputRecord::from_fields(row, fields));
        }

        info!("Loaded {} records from {}", records.len(), path.display());
        Ok(Self { headers, records })
    }

    /// Drop rows whose natural key was already seen, keeping the first occurrence
    pub fn dedupe(&self) -> Self {
        let mut seen = std::collections::HashSet::new();
        let records = self
            .records
            .iter()
            .filter(|record| seen.insert(record.natural_key()))
            .cloned()
            .collect();
        Self {
            headers: self.headers.clone(),
            records,
        }
    }

    /// Write the table back out with its original columns
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }
        let mut writer = csv::Writer::from_path(path)
            .context(format!("Failed to create {}", path.display()))?;
        writer.write_record(&self.headers)?;
        for record in &self.records {
            let row: Vec<&str> = self
                .headers
                .iter()
                .map(|h| record.fields.get(h).map(String::as_str).unwrap_or(""))
                .collect();
            writer.write_record(&row)?;
        }
        writer.flush()
            .context(format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}
