// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Deserialize;
use tracing::{debug, error, info};

use crate::constants::DISCOVERY_PATH;
use crate::credential::Credential;
use crate::errors::DiscoveryError;

/// Base URL of the ingestion service for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionEndpoint {
    base_url: String,
}

impl IngestionEndpoint {
    /// Accepts a bare host (`https://` is assumed) or a full base URL.
    pub fn new(host: &str) -> Self {
        let host = host.trim().trim_end_matches('/');
        let base_url = if host.contains("://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[derive(Deserialize)]
struct DiscoveryResponse {
    #[serde(alias = "hostname")]
    host: Option<String>,
}

/// Discovers the account-specific ingestion host.
#[derive(Debug, Clone)]
pub struct HostResolver {
    client: reqwest::Client,
    account_url: String,
}

impl HostResolver {
    pub fn new(client: reqwest::Client, account_url: &str) -> Self {
        Self {
            client,
            account_url: account_url.trim_end_matches('/').to_string(),
        }
    }

    /// Issues one authenticated discovery request. Any failure is fatal to the caller.
    pub async fn discover_endpoint(
        &self,
        credential: &Credential,
    ) -> Result<IngestionEndpoint, DiscoveryError> {
        let url = format!("{}{}", self.account_url, DISCOVERY_PATH);
        debug!("DISCOVERY | GET {url}");

        let response = self
            .client
            .get(&url)
            .bearer_auth(credential.token())
            .send()
            .await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            error!("DISCOVERY | Failed to discover ingest host: {status}");
            return Err(DiscoveryError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        let host = parse_discovery_body(&body)?;
        let endpoint = IngestionEndpoint::new(&host);
        info!("DISCOVERY | Ingest host discovered: {}", endpoint.base_url());
        Ok(endpoint)
    }
}

/// The service answers with `{"host": ...}`; older deployments send the bare hostname.
fn parse_discovery_body(body: &str) -> Result<String, DiscoveryError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(DiscoveryError::Malformed("empty body".to_string()));
    }
    let host = if body.starts_with('{') {
        serde_json::from_str::<DiscoveryResponse>(body)
            .map_err(|e| DiscoveryError::Malformed(e.to_string()))?
            .host
            .ok_or_else(|| DiscoveryError::Malformed("missing host".to_string()))?
    } else {
        body.to_string()
    };
    if host.trim().is_empty() || host.chars().any(char::is_whitespace) {
        return Err(DiscoveryError::Malformed(format!("invalid host {host:?}")));
    }
    Ok(host)
}
