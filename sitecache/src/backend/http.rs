//! HTTP client for the hosted backend
//!
//! Tables and RPCs go through the REST gateway under `rest/v1`, the weather
//! provider through the `get-weather` function. Every request carries the anon
//! key; a signed-in user's access token replaces it as the bearer.

use super::{FormSubmissionBackend, LimitBackend, SnapshotBackend, WeatherBackend};
use crate::config::REALTIME_PROTOCOL_VERSION;
use crate::error::{AppError, Result};
use crate::models::{
    LimitKind, OfflineFormRecord, OfflineSnapshot, SubscriptionLimitCheck, WeatherCacheRow,
    WeatherError, WeatherRequest, WeatherResponse,
};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: Url,
    anon_key: String,
    access_token: Arc<RwLock<Option<String>>>,
}

impl BackendClient {
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("sitecache/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url,
            anon_key: anon_key.into(),
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().await = token;
    }

    pub async fn access_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// Websocket URL of the realtime service
    pub fn realtime_url(&self) -> Result<Url> {
        let mut url = self.base_url.join("realtime/v1/websocket")?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| AppError::InvalidInput(format!("Cannot use {} for realtime", url)))?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", REALTIME_PROTOCOL_VERSION);
        Ok(url)
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.base_url.join(path)?;
        let bearer = self
            .access_token()
            .await
            .unwrap_or_else(|| self.anon_key.clone());

        Ok(self
            .http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer))
    }

    async fn get_rows<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let response = self
            .request(Method::GET, path)
            .await?
            .query(query)
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }
}

/// Map non-2xx responses to `HttpStatus` with the body for diagnostics
async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::debug!("Backend returned {}: {}", status, body);
    Err(AppError::HttpStatus {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl WeatherBackend for BackendClient {
    async fn cached_weather(&self, project_id: &str) -> Result<Option<WeatherCacheRow>> {
        let filter = format!("eq.{}", project_id);
        let rows: Vec<WeatherCacheRow> = self
            .get_rows(
                "rest/v1/weather_cache",
                &[("project_id", filter.as_str()), ("select", "*"), ("limit", "1")],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn store_weather(&self, row: &WeatherCacheRow) -> Result<()> {
        let response = self
            .request(Method::POST, "rest/v1/weather_cache")
            .await?
            .query(&[("on_conflict", "project_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(row)
            .send()
            .await?;
        ensure_success(response).await?;
        tracing::debug!("Weather cache row stored for project {}", row.project_id);
        Ok(())
    }

    async fn fetch_weather(&self, request: &WeatherRequest) -> Result<WeatherResponse> {
        let response = self
            .request(Method::POST, "functions/v1/get-weather")
            .await?
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            // The function reports bad input as an error object
            let body = response.text().await.unwrap_or_default();
            return match serde_json::from_str::<WeatherError>(&body) {
                Ok(error) => Ok(WeatherResponse::Error(error)),
                Err(_) => Err(AppError::HttpStatus {
                    status: status.as_u16(),
                    body,
                }),
            };
        }

        Ok(ensure_success(response).await?.json().await?)
    }
}

#[async_trait]
impl LimitBackend for BackendClient {
    async fn check_limit(
        &self,
        kind: LimitKind,
        context_id: Option<&str>,
    ) -> Result<SubscriptionLimitCheck> {
        let response = self
            .request(Method::POST, "rest/v1/rpc/check_subscription_limit")
            .await?
            .json(&json!({
                "limit_type": kind,
                "document_id": context_id,
            }))
            .send()
            .await?;

        // Set-returning functions answer with a one-element array
        let value: Value = ensure_success(response).await?.json().await?;
        let value = match value {
            Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
            other => other,
        };
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl FormSubmissionBackend for BackendClient {
    async fn submit_form(&self, record: &OfflineFormRecord) -> Result<()> {
        let response = self
            .request(Method::POST, "rest/v1/form_submissions")
            .await?
            .header("Prefer", "return=minimal")
            .json(&json!({
                "form_template_id": record.form_template_id,
                "form_name": record.form_name,
                "data": record.data,
                "client_draft_id": record.id,
                "submitted_at": record.timestamp,
            }))
            .send()
            .await?;
        ensure_success(response).await?;
        tracing::info!("Submitted offline form {}", record.id);
        Ok(())
    }
}

#[async_trait]
impl SnapshotBackend for BackendClient {
    async fn fetch_snapshot(&self) -> Result<OfflineSnapshot> {
        let select = [("select", "*")];
        let (projects, tasks, team_members) = tokio::try_join!(
            self.get_rows::<Value>("rest/v1/projects", &select),
            self.get_rows::<Value>("rest/v1/tasks", &select),
            self.get_rows::<Value>("rest/v1/team_members", &select),
        )?;
        Ok(OfflineSnapshot::new(projects, tasks, team_members))
    }
}
