//! Hosted backend boundary
//!
//! Services depend on these traits; `BackendClient` implements all of them
//! over the platform's REST, RPC and function endpoints.

pub mod http;

pub use http::BackendClient;

use crate::error::Result;
use crate::models::{
    LimitKind, OfflineFormRecord, OfflineSnapshot, SubscriptionLimitCheck, WeatherCacheRow,
    WeatherRequest, WeatherResponse,
};
use async_trait::async_trait;

/// Server-side weather cache rows and the provider function
#[async_trait]
pub trait WeatherBackend: Send + Sync {
    /// Cache row for a project, if one was ever written
    async fn cached_weather(&self, project_id: &str) -> Result<Option<WeatherCacheRow>>;

    /// Upsert the cache row keyed by project
    async fn store_weather(&self, row: &WeatherCacheRow) -> Result<()>;

    /// Call the provider through the weather function
    async fn fetch_weather(&self, request: &WeatherRequest) -> Result<WeatherResponse>;
}

/// Server-computed usage aggregates
#[async_trait]
pub trait LimitBackend: Send + Sync {
    async fn check_limit(
        &self,
        kind: LimitKind,
        context_id: Option<&str>,
    ) -> Result<SubscriptionLimitCheck>;
}

/// Submission endpoint for offline drafts
#[async_trait]
pub trait FormSubmissionBackend: Send + Sync {
    async fn submit_form(&self, record: &OfflineFormRecord) -> Result<()>;
}

/// Source of the lists copied into the offline snapshot
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<OfflineSnapshot>;
}
