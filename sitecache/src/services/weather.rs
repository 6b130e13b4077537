//! Weather cache client
//!
//! Per-project weather with two cache layers: a short-lived memory copy and the
//! server-side `weather_cache` row. Readings younger than the freshness window
//! are served without touching the provider; older ones are refetched through
//! the weather function with bounded retry.
//!
//! In-flight fetches are not deduplicated. Two concurrent `get_fresh` calls for
//! one project may both reach the provider; the later cache write wins.

use crate::backend::WeatherBackend;
use crate::config::{WEATHER_FRESHNESS, WEATHER_RETENTION};
use crate::models::{
    WeatherCacheRow, WeatherError, WeatherReading, WeatherRequest, WeatherResponse,
};
use crate::services::connectivity::ConnectivityMonitor;
use crate::services::retry::{retry_with_backoff, RetryPolicy};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

struct MemoryEntry {
    row: WeatherCacheRow,
    stored_at: Instant,
}

/// Fetch-with-cache logic for project weather
pub struct WeatherService {
    backend: Arc<dyn WeatherBackend>,
    connectivity: ConnectivityMonitor,
    policy: RetryPolicy,
    freshness: Duration,
    retention: Duration,
    memory: RwLock<HashMap<String, MemoryEntry>>,
    watched: RwLock<HashMap<String, String>>,
}

impl WeatherService {
    pub fn new(backend: Arc<dyn WeatherBackend>, connectivity: ConnectivityMonitor) -> Self {
        Self {
            backend,
            connectivity,
            policy: RetryPolicy::default(),
            freshness: WEATHER_FRESHNESS,
            retention: WEATHER_RETENTION,
            memory: RwLock::new(HashMap::new()),
            watched: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_windows(mut self, freshness: Duration, retention: Duration) -> Self {
        self.freshness = freshness;
        self.retention = retention;
        self
    }

    /// Cached reading for a project, or `None` when no data exists yet.
    ///
    /// Checks the memory copy, then the server cache row. While offline only
    /// the memory copy is consulted.
    pub async fn get_cached(&self, project_id: &str) -> Option<WeatherReading> {
        self.cached_row(project_id).await.map(|row| annotate(&row))
    }

    async fn cached_row(&self, project_id: &str) -> Option<WeatherCacheRow> {
        if let Some(row) = self.memory_row(project_id).await {
            tracing::debug!("Weather memory hit for project {}", project_id);
            return Some(row);
        }

        if !self.connectivity.is_online() {
            return None;
        }

        match self.backend.cached_weather(project_id).await {
            Ok(Some(row)) => {
                tracing::debug!("Weather cache row found for project {}", project_id);
                self.remember(row.clone()).await;
                Some(row)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to read weather cache for {}: {}", project_id, e);
                None
            }
        }
    }

    /// Reading for a project, refetched from the provider when stale or forced
    pub async fn get_fresh(
        &self,
        project_id: &str,
        address: Option<&str>,
        force_refresh: bool,
    ) -> WeatherResponse {
        let mut stale = None;

        if !force_refresh {
            if let Some(row) = self.cached_row(project_id).await {
                let reading = annotate(&row);
                if self.is_fresh(&row) {
                    return WeatherResponse::Reading(reading);
                }
                stale = Some(reading);
            }
        }

        if !self.connectivity.is_online() {
            return match self.fallback(project_id, stale).await {
                Some(reading) => WeatherResponse::Reading(reading),
                None => WeatherResponse::Error(WeatherError::new(
                    WeatherError::OFFLINE,
                    "Weather is unavailable while offline",
                )),
            };
        }

        let address = match address.map(str::trim).filter(|a| !a.is_empty()) {
            Some(address) => address,
            None => {
                return match self.fallback(project_id, stale).await {
                    Some(reading) => WeatherResponse::Reading(reading),
                    None => WeatherResponse::Error(WeatherError::new(
                        WeatherError::ADDRESS_REQUIRED,
                        "Project has no address to look up weather for",
                    )),
                };
            }
        };

        self.fetch_and_store(project_id, address).await
    }

    /// Register a project for the background refresh
    pub async fn watch_project(&self, project_id: &str, address: &str) {
        self.watched
            .write()
            .await
            .insert(project_id.to_string(), address.to_string());
        tracing::debug!("Watching weather for project {}", project_id);
    }

    pub async fn unwatch_project(&self, project_id: &str) {
        self.watched.write().await.remove(project_id);
    }

    pub async fn watched_projects(&self) -> Vec<String> {
        self.watched.read().await.keys().cloned().collect()
    }

    /// Force-refresh every watched project; skipped while offline
    pub async fn refresh_watched(&self) -> usize {
        if !self.connectivity.is_online() {
            tracing::debug!("Skipping weather refresh while offline");
            return 0;
        }

        let watched: Vec<(String, String)> = self
            .watched
            .read()
            .await
            .iter()
            .map(|(id, address)| (id.clone(), address.clone()))
            .collect();

        let mut refreshed = 0;
        for (project_id, address) in watched {
            if !self.get_fresh(&project_id, Some(&address), true).await.is_error() {
                refreshed += 1;
            }
        }

        tracing::info!("Background weather refresh updated {} projects", refreshed);
        refreshed
    }

    /// Drop memory entries past the retention window
    pub async fn evict_expired(&self) -> usize {
        let mut memory = self.memory.write().await;
        let before = memory.len();
        let retention = self.retention;
        memory.retain(|_, entry| entry.stored_at.elapsed() < retention);
        let evicted = before - memory.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} weather entries", evicted);
        }
        evicted
    }

    pub async fn retained_count(&self) -> usize {
        self.memory.read().await.len()
    }

    async fn fetch_and_store(&self, project_id: &str, address: &str) -> WeatherResponse {
        let request = WeatherRequest {
            address: address.to_string(),
            project_id: project_id.to_string(),
        };

        let backend = &self.backend;
        let request_ref = &request;
        let outcome = retry_with_backoff(&self.policy, "weather fetch", move |_| {
            backend.fetch_weather(request_ref)
        })
        .await;

        match outcome {
            Ok(WeatherResponse::Reading(reading)) => {
                let row = WeatherCacheRow {
                    project_id: project_id.to_string(),
                    conditions: reading.conditions,
                    cached_at: Utc::now(),
                };

                if let Err(e) = self.backend.store_weather(&row).await {
                    tracing::warn!("Failed to write weather cache for {}: {}", project_id, e);
                }

                let fresh = WeatherReading::fresh(row.conditions.clone());
                self.remember(row).await;
                tracing::info!("Fetched fresh weather for project {}", project_id);
                WeatherResponse::Reading(fresh)
            }
            Ok(WeatherResponse::Error(err)) => {
                tracing::warn!(
                    "Weather provider error for {}: {} ({})",
                    project_id,
                    err.message,
                    err.error
                );
                WeatherResponse::Error(WeatherError::new(err.error, err.message))
            }
            Err(e) => WeatherResponse::Error(WeatherError::new(
                WeatherError::UNAVAILABLE,
                format!("Weather data unavailable: {}", e),
            )),
        }
    }

    async fn fallback(
        &self,
        project_id: &str,
        stale: Option<WeatherReading>,
    ) -> Option<WeatherReading> {
        match stale {
            Some(reading) => Some(reading),
            None => self.get_cached(project_id).await,
        }
    }

    fn is_fresh(&self, row: &WeatherCacheRow) -> bool {
        let age_ms = (Utc::now() - row.cached_at).num_milliseconds().max(0);
        (age_ms as u128) < self.freshness.as_millis()
    }

    async fn memory_row(&self, project_id: &str) -> Option<WeatherCacheRow> {
        let mut memory = self.memory.write().await;
        match memory.get(project_id) {
            Some(entry) if entry.stored_at.elapsed() < self.retention => Some(entry.row.clone()),
            Some(_) => {
                memory.remove(project_id);
                None
            }
            None => None,
        }
    }

    async fn remember(&self, row: WeatherCacheRow) {
        let mut memory = self.memory.write().await;
        memory.insert(
            row.project_id.clone(),
            MemoryEntry {
                row,
                stored_at: Instant::now(),
            },
        );
    }
}

/// Annotate a cache row with its age in whole minutes
fn annotate(row: &WeatherCacheRow) -> WeatherReading {
    let age_ms = (Utc::now() - row.cached_at).num_milliseconds().max(0);
    WeatherReading::from_cache(row.conditions.clone(), age_ms / 60_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::models::WeatherConditions;
    use crate::services::retry::transient_failure;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    fn conditions(temperature: f64) -> WeatherConditions {
        WeatherConditions {
            temperature_current: temperature,
            temperature_high: temperature + 8.0,
            temperature_low: temperature - 10.0,
            condition: "Clear".to_string(),
            humidity: 40.0,
            wind_speed: 6.0,
            icon: "01d".to_string(),
        }
    }

    fn reading(temperature: f64) -> Result<WeatherResponse> {
        Ok(WeatherResponse::Reading(WeatherReading::fresh(conditions(
            temperature,
        ))))
    }

    #[derive(Default)]
    struct FakeBackend {
        rows: Mutex<HashMap<String, WeatherCacheRow>>,
        script: Mutex<VecDeque<Result<WeatherResponse>>>,
        fetch_calls: AtomicU32,
    }

    impl FakeBackend {
        async fn with_row(project_id: &str, temperature: f64, age_minutes: i64) -> Self {
            let backend = Self::default();
            backend.rows.lock().await.insert(
                project_id.to_string(),
                WeatherCacheRow {
                    project_id: project_id.to_string(),
                    conditions: conditions(temperature),
                    cached_at: Utc::now() - chrono::Duration::minutes(age_minutes),
                },
            );
            backend
        }

        async fn script(&self, outcomes: Vec<Result<WeatherResponse>>) {
            self.script.lock().await.extend(outcomes);
        }

        fn fetch_calls(&self) -> u32 {
            self.fetch_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WeatherBackend for FakeBackend {
        async fn cached_weather(&self, project_id: &str) -> Result<Option<WeatherCacheRow>> {
            Ok(self.rows.lock().await.get(project_id).cloned())
        }

        async fn store_weather(&self, row: &WeatherCacheRow) -> Result<()> {
            self.rows
                .lock()
                .await
                .insert(row.project_id.clone(), row.clone());
            Ok(())
        }

        async fn fetch_weather(&self, _request: &WeatherRequest) -> Result<WeatherResponse> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| reading(70.0))
        }
    }

    fn service(backend: Arc<FakeBackend>, online: bool) -> WeatherService {
        WeatherService::new(backend, ConnectivityMonitor::new(online))
    }

    #[tokio::test]
    async fn test_fresh_fetch_then_cached_read() {
        let backend = Arc::new(FakeBackend::default());
        backend.script(vec![reading(72.0)]).await;
        let weather = service(backend.clone(), true);

        let fresh = weather.get_fresh("p1", Some("123 Main St"), false).await;
        let fresh = fresh.reading().unwrap();
        assert!(!fresh.cached);
        assert_eq!(fresh.conditions.temperature_current, 72.0);

        let cached = weather.get_cached("p1").await.unwrap();
        assert!(cached.cached);
        assert_eq!(cached.age_minutes, Some(0));
        assert_eq!(cached.conditions.temperature_current, 72.0);

        assert!(backend.rows.lock().await.contains_key("p1"));
    }

    #[tokio::test]
    async fn test_cached_reads_have_non_decreasing_age() {
        let backend = Arc::new(FakeBackend::with_row("p1", 65.0, 2).await);
        let weather = service(backend, true);

        let first = weather.get_cached("p1").await.unwrap();
        let second = weather.get_cached("p1").await.unwrap();

        assert!(first.cached && second.cached);
        assert_eq!(first.age_minutes, Some(2));
        assert!(second.age_minutes >= first.age_minutes);
    }

    #[tokio::test]
    async fn test_missing_row_is_none() {
        let weather = service(Arc::new(FakeBackend::default()), true);
        assert!(weather.get_cached("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_fresh_row_skips_provider() {
        let backend = Arc::new(FakeBackend::with_row("p1", 60.0, 1).await);
        let weather = service(backend.clone(), true);

        let response = weather.get_fresh("p1", Some("1 Site Rd"), false).await;

        assert!(response.reading().unwrap().cached);
        assert_eq!(backend.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_row_triggers_fetch() {
        let backend = Arc::new(FakeBackend::with_row("p1", 60.0, 10).await);
        backend.script(vec![reading(75.0)]).await;
        let weather = service(backend.clone(), true);

        let response = weather.get_fresh("p1", Some("1 Site Rd"), false).await;
        let reading = response.reading().unwrap();

        assert!(!reading.cached);
        assert_eq!(reading.conditions.temperature_current, 75.0);
        assert_eq!(backend.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_zero_freshness_always_refetches() {
        let backend = Arc::new(FakeBackend::with_row("p1", 60.0, 0).await);
        let weather = service(backend.clone(), true)
            .with_windows(Duration::ZERO, Duration::from_secs(30 * 60));

        let response = weather.get_fresh("p1", Some("1 Site Rd"), false).await;

        assert!(!response.reading().unwrap().cached);
        assert_eq!(backend.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_sub_minute_freshness_window() {
        let backend = Arc::new(FakeBackend::default());
        backend.rows.lock().await.insert(
            "p1".to_string(),
            WeatherCacheRow {
                project_id: "p1".to_string(),
                conditions: conditions(60.0),
                cached_at: Utc::now() - chrono::Duration::seconds(45),
            },
        );
        let weather = service(backend.clone(), true)
            .with_windows(Duration::from_secs(30), Duration::from_secs(30 * 60));

        let response = weather.get_fresh("p1", Some("1 Site Rd"), false).await;

        assert!(!response.reading().unwrap().cached);
        assert_eq!(backend.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_fresh_row() {
        let backend = Arc::new(FakeBackend::with_row("p1", 60.0, 0).await);
        let weather = service(backend.clone(), true);

        let response = weather.get_fresh("p1", Some("1 Site Rd"), true).await;

        assert!(!response.reading().unwrap().cached);
        assert_eq!(backend.fetch_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_surface_weather_error() {
        let backend = Arc::new(FakeBackend::default());
        backend
            .script(vec![
                Err(transient_failure("1")),
                Err(transient_failure("2")),
                Err(transient_failure("3")),
            ])
            .await;
        let weather = service(backend.clone(), true);

        let response = weather.get_fresh("p1", Some("123 Main St"), false).await;

        let err = response.error().unwrap();
        assert_eq!(err.error, WeatherError::UNAVAILABLE);
        assert!(!err.cached);
        assert_eq!(backend.fetch_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_then_success_and_counter_reset() {
        let backend = Arc::new(FakeBackend::default());
        backend
            .script(vec![
                Err(transient_failure("blip")),
                reading(68.0),
                Err(transient_failure("blip")),
                Err(transient_failure("blip")),
                reading(69.0),
            ])
            .await;
        let weather = service(backend.clone(), true);

        let first = weather.get_fresh("p1", Some("123 Main St"), false).await;
        assert_eq!(first.reading().unwrap().conditions.temperature_current, 68.0);

        // A fresh call gets its own three attempts
        let second = weather.get_fresh("p1", Some("123 Main St"), true).await;
        assert_eq!(second.reading().unwrap().conditions.temperature_current, 69.0);
        assert_eq!(backend.fetch_calls(), 5);
    }

    #[tokio::test]
    async fn test_provider_error_payload_not_retried() {
        let backend = Arc::new(FakeBackend::default());
        backend
            .script(vec![Ok(WeatherResponse::Error(WeatherError::new(
                "invalid_address",
                "Address could not be geocoded",
            )))])
            .await;
        let weather = service(backend.clone(), true);

        let response = weather.get_fresh("p1", Some("???"), false).await;

        assert_eq!(response.error().unwrap().error, "invalid_address");
        assert_eq!(backend.fetch_calls(), 1);
        assert!(weather.get_cached("p1").await.is_none());
    }

    #[tokio::test]
    async fn test_missing_address() {
        let weather = service(Arc::new(FakeBackend::default()), true);

        let response = weather.get_fresh("p1", None, false).await;
        assert_eq!(response.error().unwrap().error, WeatherError::ADDRESS_REQUIRED);

        let blank = weather.get_fresh("p1", Some("  "), false).await;
        assert!(blank.is_error());
    }

    #[tokio::test]
    async fn test_stale_row_served_without_address() {
        let backend = Arc::new(FakeBackend::with_row("p1", 55.0, 20).await);
        let weather = service(backend.clone(), true);

        let response = weather.get_fresh("p1", None, false).await;

        assert_eq!(response.reading().unwrap().age_minutes, Some(20));
        assert_eq!(backend.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn test_offline_serves_memory_or_errors() {
        let backend = Arc::new(FakeBackend::with_row("p1", 58.0, 20).await);
        let monitor = ConnectivityMonitor::new(true);
        let weather = WeatherService::new(backend.clone(), monitor.clone());

        // Populate the memory copy while online
        weather.get_cached("p1").await.unwrap();
        monitor.report(false);

        let served = weather.get_fresh("p1", Some("1 Site Rd"), true).await;
        assert!(served.reading().unwrap().cached);

        let missing = weather.get_fresh("p2", Some("2 Site Rd"), false).await;
        assert_eq!(missing.error().unwrap().error, WeatherError::OFFLINE);
        assert_eq!(backend.fetch_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_entries_evicted_after_retention() {
        let backend = Arc::new(FakeBackend::default());
        let weather = service(backend, true);

        weather.get_fresh("p1", Some("123 Main St"), false).await;
        assert_eq!(weather.retained_count().await, 1);

        tokio::time::advance(Duration::from_secs(29 * 60)).await;
        assert_eq!(weather.evict_expired().await, 0);

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        assert_eq!(weather.evict_expired().await, 1);
        assert_eq!(weather.retained_count().await, 0);
    }

    #[tokio::test]
    async fn test_refresh_watched_projects() {
        let backend = Arc::new(FakeBackend::default());
        let weather = service(backend.clone(), true);

        weather.watch_project("p1", "1 Site Rd").await;
        weather.watch_project("p2", "2 Site Rd").await;
        weather.unwatch_project("p2").await;

        assert_eq!(weather.refresh_watched().await, 1);
        assert_eq!(backend.fetch_calls(), 1);
        assert_eq!(weather.watched_projects().await, vec!["p1".to_string()]);
    }
}
