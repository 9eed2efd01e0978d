//! Account service client
//!
//! Looks up the pricing country configured on an organization's account.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tally_common::{Result, TallyError};
use tracing::{debug, instrument, warn};

/// Source of organization pricing countries
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Pricing country of an organization's account.
    ///
    /// `Ok(None)` means the account has no usable country and the caller
    /// should fall back to its default. Transient failures are returned as
    /// retryable errors.
    async fn pricing_country(&self, organization_id: &str) -> Result<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    #[serde(default)]
    pricing_country: Option<String>,
}

/// Account directory backed by the account service HTTP API
pub struct HttpAccountDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccountDirectory {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TallyError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn account_url(&self, organization_id: &str) -> String {
        format!("{}/v1/orgs/{}/account", self.base_url, organization_id)
    }
}

#[async_trait]
impl AccountDirectory for HttpAccountDirectory {
    #[instrument(skip(self))]
    async fn pricing_country(&self, organization_id: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.account_url(organization_id))
            .send()
            .await
            .map_err(|e| TallyError::Network(format!("Account request failed: {}", e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TallyError::Network(format!(
                "Account service returned {}",
                status
            )));
        }
        if status == StatusCode::NOT_FOUND {
            debug!(organization_id, "Account not found");
            return Ok(None);
        }
        if !status.is_success() {
            warn!(organization_id, %status, "Unexpected account service response");
            return Ok(None);
        }

        let body = response
            .text()
            .await
            .map_err(|e| TallyError::Network(format!("Account response read failed: {}", e)))?;

        match serde_json::from_str::<AccountResponse>(&body) {
            Ok(account) => Ok(account.pricing_country.filter(|c| !c.is_empty())),
            Err(e) => {
                warn!(organization_id, error = %e, "Malformed account response");
                Ok(None)
            }
        }
    }
}

/// Fixed organization to country table
#[derive(Debug, Default)]
pub struct StaticAccountDirectory {
    countries: DashMap<String, String>,
}

impl StaticAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_country(self, organization_id: impl Into<String>, country: impl Into<String>) -> Self {
        self.countries.insert(organization_id.into(), country.into());
        self
    }
}

#[async_trait]
impl AccountDirectory for StaticAccountDirectory {
    async fn pricing_country(&self, organization_id: &str) -> Result<Option<String>> {
        Ok(self.countries.get(organization_id).map(|c| c.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn directory(server: &MockServer) -> HttpAccountDirectory {
        HttpAccountDirectory::new(server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_reads_pricing_country() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/orgs/org1/account"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "account_id": "1234",
                "pricing_country": "EUR"
            })))
            .mount(&server)
            .await;

        let country = directory(&server).pricing_country("org1").await.unwrap();
        assert_eq!(country.as_deref(), Some("EUR"));
    }

    #[tokio::test]
    async fn test_missing_country_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/orgs/org1/account"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "account_id": "1234"
            })))
            .mount(&server)
            .await;

        assert_eq!(directory(&server).pricing_country("org1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_not_found_and_malformed_are_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/orgs/missing/account"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/orgs/garbled/account"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let directory = directory(&server);
        assert_eq!(directory.pricing_country("missing").await.unwrap(), None);
        assert_eq!(directory.pricing_country("garbled").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = directory(&server).pricing_country("org1").await.unwrap_err();
        assert!(matches!(err, TallyError::Network(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_static_directory() {
        let directory = StaticAccountDirectory::new().with_country("org1", "CAN");
        assert_eq!(
            directory.pricing_country("org1").await.unwrap().as_deref(),
            Some("CAN")
        );
        assert_eq!(directory.pricing_country("org2").await.unwrap(), None);
    }
}
