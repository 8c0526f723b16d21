// # Zone HTTP API Backend
//
// `DnsZone` implementation for the remote zone service that holds the
// overlay's A records.
//
// ## API Reference
//
// - List records: GET `{url}/zone/records` → `{"<fqdn>": "<ipv4>", ...}`
// - Apply a changeset: PUT `{url}/zone/records` with
//   `{"changes": {"new": {}, "removed": {}, "updated": {}, "unchanged": {}}}`
//
// Both calls authenticate with the `X-API-Key` header.
//
// ## Constraints
//
// - One HTTP request per trait call; no retries, no caching. The
//   reconciler retries on its next cycle.
// - The API key never appears in logs, errors or `Debug` output.
// - Every failure is a `Transport` error so callers can classify it.

use async_trait::async_trait;
use hub_core::config::{DnsConfig, Secret};
use hub_core::inventory::{Changeset, Inventory};
use hub_core::traits::DnsZone;
use hub_core::{Error, Result};
use serde::Serialize;
use std::time::Duration;

/// Transport name used in errors and logs
const TRANSPORT: &str = "zone-api";

/// Header carrying the API key
const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Serialize)]
struct ChangesBody<'a> {
    changes: &'a Changeset,
}

/// Zone HTTP API client
pub struct HttpZone {
    records_url: String,

    /// ⚠️ NEVER log this value
    api_key: Secret,

    client: reqwest::Client,
}

impl std::fmt::Debug for HttpZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpZone")
            .field("records_url", &self.records_url)
            .field("api_key", &"<REDACTED>")
            .finish()
    }
}

impl HttpZone {
    /// Create a client for the API rooted at `url`
    ///
    /// # Parameters
    ///
    /// - `url`: API base URL, with or without a trailing slash
    /// - `api_key`: sent as `X-API-Key` on every request
    /// - `timeout`: bound on each request, connect included
    pub fn new(url: &str, api_key: Secret, timeout: Duration) -> Result<Self> {
        if api_key.expose().is_empty() {
            return Err(Error::config("zone API key cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            records_url: format!("{}/zone/records", url.trim_end_matches('/')),
            api_key,
            client,
        })
    }

    /// Build from [`DnsConfig::Http`]; other variants are rejected
    pub fn from_config(config: &DnsConfig) -> Result<Self> {
        match config {
            DnsConfig::Http {
                url,
                api_key,
                timeout_secs,
            } => Self::new(url, api_key.clone(), Duration::from_secs(*timeout_secs)),
            other => Err(Error::config(format!(
                "zone backend '{}' is not the HTTP API",
                other.type_name()
            ))),
        }
    }

    /// Turn a non-success status into a transport error
    async fn check(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());

        let message = match status.as_u16() {
            401 | 403 => format!("{} rejected: invalid API key. Status: {}", action, status),
            429 => format!("{} rate limited. Status: {}", action, status),
            500..=599 => format!("{} failed, server error (transient): {} - {}", action, status, body),
            _ => format!("{} failed: {} - {}", action, status, body),
        };
        Err(Error::transport(TRANSPORT, message))
    }
}

#[async_trait]
impl DnsZone for HttpZone {
    async fn records(&self) -> Result<Inventory> {
        tracing::debug!("Fetching zone records from {}", self.records_url);

        let response = self
            .client
            .get(&self.records_url)
            .header(API_KEY_HEADER, self.api_key.expose())
            .send()
            .await
            .map_err(|e| Error::transport(TRANSPORT, format!("HTTP request failed: {}", e)))?;
        let response = Self::check(response, "record listing").await?;

        let records: Inventory = response
            .json()
            .await
            .map_err(|e| Error::transport(TRANSPORT, format!("Failed to parse records: {}", e)))?;

        tracing::debug!("Zone holds {} records", records.len());
        Ok(records)
    }

    async fn apply_changeset(&self, changes: &Changeset) -> Result<()> {
        tracing::info!(
            "Pushing zone changeset: {} new, {} removed, {} updated",
            changes.new.len(),
            changes.removed.len(),
            changes.updated.len()
        );

        let response = self
            .client
            .put(&self.records_url)
            .header(API_KEY_HEADER, self.api_key.expose())
            .json(&ChangesBody { changes })
            .send()
            .await
            .map_err(|e| Error::transport(TRANSPORT, format!("HTTP request failed: {}", e)))?;
        Self::check(response, "record update").await?;
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "http"
    }
}
