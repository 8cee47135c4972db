//! Remote Catalog Service Client

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::CatalogSource;
use crate::engine::config::CatalogConfig;
use crate::engine::error::{EngineError, Result};
use crate::engine::model::{CatalogListing, HardwareId};

#[derive(Debug, Deserialize)]
struct DriversResponse {
    #[allow(dead_code)]
    hardware_id: String,
    drivers: Vec<CatalogListing>,
}

pub struct RemoteCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteCatalog {
    pub fn new(base_url: &str, timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Config(format!("remote catalog client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Build a client from config; `None` when no remote URL is set.
    pub fn from_config(config: &CatalogConfig, user_agent: &str) -> Result<Option<Self>> {
        config
            .remote_url
            .as_deref()
            .map(|url| Self::new(url, Duration::from_secs(config.remote_timeout_secs), user_agent))
            .transpose()
    }
}

#[async_trait]
impl CatalogSource for RemoteCatalog {
    fn name(&self) -> &str {
        "remote"
    }

    async fn query(&self, hardware_id: &HardwareId) -> Result<Vec<CatalogListing>> {
        let url = format!("{}/drivers", self.base_url);
        let unavailable = |e: reqwest::Error| EngineError::CatalogUnavailable(e.to_string());

        let response = self
            .client
            .get(&url)
            .query(&[("hardware_id", hardware_id.to_string())])
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?;

        let body: DriversResponse = response
            .json()
            .await
            .map_err(|e| EngineError::CatalogUnavailable(format!("malformed response: {}", e)))?;

        debug!(device = %hardware_id, count = body.drivers.len(), "Remote catalog answered");
        Ok(body.drivers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_query_parses_listings() {
        let router = Router::new().route(
            "/drivers",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                let id = params.get("hardware_id").cloned().unwrap_or_default();
                Json(serde_json::json!({
                    "hardware_id": id,
                    "drivers": [{
                        "version": "1.2.0",
                        "hardware_id": id,
                        "provider": "Realtek",
                        "locator": "https://dl.example.com/rt.zip",
                        "sha256": "ab",
                        "kind": "inf"
                    }]
                }))
            }),
        );
        let base = serve(router).await;
        let remote = RemoteCatalog::new(&base, Duration::from_secs(5), "test").unwrap();

        let id = HardwareId::parse("PCI\\VEN_10EC&DEV_8168").unwrap();
        let listings = remote.query(&id).await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].package.hardware_id, id);
    }

    #[tokio::test]
    async fn test_malformed_response_is_unavailable() {
        let router = Router::new().route("/drivers", get(|| async { "not json" }));
        let base = serve(router).await;
        let remote = RemoteCatalog::new(&base, Duration::from_secs(5), "test").unwrap();

        let id = HardwareId::parse("PCI\\VEN_10EC&DEV_8168").unwrap();
        let err = remote.query(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::CatalogUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let remote = RemoteCatalog::new(&format!("http://{}", addr), Duration::from_secs(2), "test").unwrap();

        let id = HardwareId::parse("PCI\\VEN_10EC&DEV_8168").unwrap();
        assert!(matches!(remote.query(&id).await, Err(EngineError::CatalogUnavailable(_))));
    }
}
