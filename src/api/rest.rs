//! BetterBot REST API Client
//!
//! Signal list/stats/context for the polling path, and conditional
//! (ETag-aware) fetches of published run artifacts for the certified cache.
//! Both surfaces sit behind traits so the ingestion and cache layers can be
//! driven by in-memory fakes.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde_json::Value;

use crate::certified::cache::ArtifactFetchError;
use crate::config::ClientConfig;
use crate::models::{Signal, SignalContextRecord, SignalListResponse, SignalStats};

/// Parameters of `GET /api/signals`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalQuery {
    pub limit: usize,
    /// RFC 3339 cursor; only signals strictly older are returned.
    pub before: Option<String>,
    pub before_id: Option<String>,
    pub exclude_updown: bool,
}

impl SignalQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut qp = Vec::with_capacity(4);
        qp.push(("limit", self.limit.to_string()));
        if let Some(before) = &self.before {
            qp.push(("before", before.clone()));
        }
        if let Some(before_id) = &self.before_id {
            qp.push(("before_id", before_id.clone()));
        }
        if self.exclude_updown {
            qp.push(("exclude_updown", "true".to_string()));
        }
        qp
    }
}

#[async_trait]
pub trait SignalApi: Send + Sync {
    async fn fetch_signals(&self, query: &SignalQuery) -> Result<Vec<Signal>>;

    async fn fetch_signal_stats(&self) -> Result<SignalStats>;

    async fn fetch_signal_context(&self, signal_id: &str) -> Result<SignalContextRecord>;
}

/// A conditional GET against a published artifact endpoint.
#[derive(Debug, Clone, Default)]
pub struct ArtifactRequest {
    /// Path relative to the API base, e.g. `/api/public/v2/backtest/runs/run_1`.
    pub path: String,
    /// Previously seen ETag, sent as `If-None-Match`.
    pub if_none_match: Option<String>,
    pub bearer: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionalResponse {
    /// 304: the cached copy is still current.
    NotModified { etag: Option<String> },
    Fresh { body: Value, etag: Option<String> },
}

#[async_trait]
pub trait ArtifactApi: Send + Sync {
    async fn fetch_artifact(
        &self,
        request: &ArtifactRequest,
    ) -> Result<ConditionalResponse, ArtifactFetchError>;
}

#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl RestClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Self::with_base_url(
            config.api_url.clone(),
            config.api_token.clone(),
            config.request_timeout(),
        )
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("Failed to build RestClient")?;

        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        Ok(Self {
            client,
            base_url,
            api_token,
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str, bearer: Option<&str>) -> reqwest::RequestBuilder {
        let request = self.client.get(self.url(path));
        match bearer.or(self.api_token.as_deref()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let resp = self
            .get(path, None)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("GET {} {}: {}", path, status, text));
        }

        resp.json::<T>()
            .await
            .with_context(|| format!("Failed to parse {} response", path))
    }
}

#[async_trait]
impl SignalApi for RestClient {
    async fn fetch_signals(&self, query: &SignalQuery) -> Result<Vec<Signal>> {
        let page: SignalListResponse = self
            .get_json("/api/signals", &query.to_query_pairs())
            .await?;
        Ok(page.into_signals())
    }

    async fn fetch_signal_stats(&self) -> Result<SignalStats> {
        self.get_json("/api/signals/stats", &[]).await
    }

    async fn fetch_signal_context(&self, signal_id: &str) -> Result<SignalContextRecord> {
        self.get_json(
            "/api/signals/context",
            &[("signal_id", signal_id.to_string())],
        )
        .await
    }
}

#[async_trait]
impl ArtifactApi for RestClient {
    async fn fetch_artifact(
        &self,
        request: &ArtifactRequest,
    ) -> Result<ConditionalResponse, ArtifactFetchError> {
        let mut builder = self.get(&request.path, request.bearer.as_deref());
        if let Some(etag) = &request.if_none_match {
            builder = builder.header(header::IF_NONE_MATCH, etag.as_str());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| ArtifactFetchError::Transport(format!("GET {}: {}", request.path, e)))?;

        let etag = resp
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match resp.status() {
            StatusCode::NOT_MODIFIED => Ok(ConditionalResponse::NotModified { etag }),
            status if status.is_success() => {
                let body = resp.json::<Value>().await.map_err(|e| {
                    ArtifactFetchError::Decode(format!("GET {}: {}", request.path, e))
                })?;
                Ok(ConditionalResponse::Fresh { body, etag })
            }
            status => {
                let text = resp.text().await.unwrap_or_default();
                Err(ArtifactFetchError::Status {
                    status: status.as_u16(),
                    message: format!("GET {} {}: {}", request.path, status, text),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_query_pairs() {
        let query = SignalQuery {
            limit: 100,
            before: Some("2025-11-16T12:00:00Z".to_string()),
            before_id: Some("sig_9".to_string()),
            exclude_updown: true,
        };
        assert_eq!(
            query.to_query_pairs(),
            vec![
                ("limit", "100".to_string()),
                ("before", "2025-11-16T12:00:00Z".to_string()),
                ("before_id", "sig_9".to_string()),
                ("exclude_updown", "true".to_string()),
            ]
        );
        assert_eq!(SignalQuery::latest(5).to_query_pairs(), vec![("limit", "5".to_string())]);
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client =
            RestClient::with_base_url("http://localhost:3000//", None, Duration::from_secs(5))
                .unwrap();
        assert_eq!(client.url("/api/signals"), "http://localhost:3000/api/signals");
    }
}
