// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Upstream pollers for the 511NY traffic APIs.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use crate::errors::SourceError;
use crate::record::Record;

pub mod camera;
pub mod traffic;

pub use camera::CameraSource;
pub use traffic::{TrafficEventSource, TrafficSpeedSource};

/// Produces the records for one collection tick.
///
/// Implementations must not fail a whole poll because of a single malformed entry; such
/// entries are dropped and counted.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn poll(&self) -> Result<Vec<Record>, SourceError>;

    /// Running total of entries dropped because they could not be turned into records.
    fn dropped_count(&self) -> u64 {
        0
    }
}

/// A keyed JSON feed answering with an array of entries, either bare or wrapped in an
/// object under `wrapper`.
pub(crate) struct Feed {
    client: reqwest::Client,
    url: String,
    api_key: String,
    wrapper: &'static str,
    kind: &'static str,
    hostname: String,
    malformed: AtomicU64,
}

impl Feed {
    pub(crate) fn new(
        client: reqwest::Client,
        url: &str,
        api_key: &str,
        wrapper: &'static str,
        kind: &'static str,
    ) -> Self {
        let hostname = get_hostname();
        info!("SOURCE | Polling {kind} from {url} on {hostname}");
        Self {
            client,
            url: url.to_string(),
            api_key: api_key.to_string(),
            wrapper,
            kind,
            hostname,
            malformed: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_hostname(&mut self, hostname: &str) {
        self.hostname = hostname.to_string();
    }

    pub(crate) fn hostname(&self) -> &str {
        &self.hostname
    }

    pub(crate) fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub(crate) async fn fetch(&self) -> Result<Vec<Value>, SourceError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("key", self.api_key.as_str()), ("format", "json")])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        match body {
            Value::Array(entries) => Ok(entries),
            Value::Object(mut object) => match object.remove(self.wrapper) {
                Some(Value::Array(entries)) => Ok(entries),
                _ => Err(SourceError::Decode(format!(
                    "expected an array of {}",
                    self.kind
                ))),
            },
            _ => Err(SourceError::Decode(format!(
                "expected an array of {}",
                self.kind
            ))),
        }
    }

    /// Builds records from entries that are objects carrying a non-empty `id_field`.
    /// Other entries are dropped and counted. `build` returns `None` to skip an entry
    /// without counting it as malformed.
    pub(crate) fn map_entries<F>(
        &self,
        entries: Vec<Value>,
        id_field: &str,
        mut build: F,
    ) -> Vec<Record>
    where
        F: FnMut(&Map<String, Value>, String) -> Option<Record>,
    {
        let mut records = Vec::with_capacity(entries.len());
        let mut dropped = 0;
        for entry in entries {
            let Some(object) = entry.as_object() else {
                dropped += 1;
                continue;
            };
            let Some(id) = object.get(id_field).and_then(scalar_string) else {
                dropped += 1;
                continue;
            };
            if let Some(record) = build(object, id) {
                records.push(record);
            }
        }
        if dropped > 0 {
            self.malformed.fetch_add(dropped, Ordering::Relaxed);
            warn!("SOURCE | Dropped {dropped} malformed {} entries", self.kind);
        }
        records
    }
}

/// `HOSTNAME` when set, otherwise the system hostname.
pub fn get_hostname() -> String {
    if let Ok(hostname) = env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return hostname;
        }
    }

    #[cfg(unix)]
    match nix::unistd::gethostname() {
        Ok(hostname) => {
            if let Some(hostname) = hostname.to_str() {
                if !hostname.is_empty() {
                    return hostname.to_string();
                }
            }
        }
        Err(e) => warn!("Failed to get system hostname: {e}"),
    }

    "unknown".to_string()
}

pub(crate) fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn text(entry: &Map<String, Value>, field: &str) -> String {
    entry.get(field).and_then(scalar_string).unwrap_or_default()
}

// The API sends "True"/"False" strings; real booleans are accepted too.
pub(crate) fn flag(entry: &Map<String, Value>, field: &str) -> bool {
    match entry.get(field) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Numeric field sent either as a number or as a numeric string; `null` otherwise.
pub(crate) fn number(entry: &Map<String, Value>, field: &str) -> Value {
    let parsed = match entry.get(field) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|n| n.is_finite())
        .map_or(Value::Null, Value::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_parsing() {
        let entry = json!({"a": "12.5", "b": "n/a", "c": 3}).as_object().cloned().unwrap();
        assert_eq!(number(&entry, "a"), json!(12.5));
        assert_eq!(number(&entry, "b"), Value::Null);
        assert_eq!(number(&entry, "c"), json!(3.0));
        assert_eq!(number(&entry, "missing"), Value::Null);
    }

    #[test]
    fn test_map_entries_counts_malformed() {
        let feed = Feed::new(reqwest::Client::new(), "http://127.0.0.1:9", "k", "items", "items");
        let entries = vec![json!({"ID": 7}), json!(42), json!({"ID": " "}), json!({"ID": "skip"})];

        let records = feed.map_entries(entries, "ID", |_, id| {
            (id != "skip").then(|| Record::new().with("id", id))
        });
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get_str("id"), Some("7"));
        // Skipped entries are not malformed.
        assert_eq!(feed.malformed_count(), 2);
    }
}
