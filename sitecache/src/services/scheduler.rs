/// Scheduler Service
/// Refreshes weather for watched projects on a cron schedule and evicts
/// readings past their retention window
use crate::error::{AppError, Result};
use crate::services::WeatherService;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Background refresh frequency options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshFrequency {
    Minutes(u32),
    Hours(u32),
    Days(u32),
}

impl RefreshFrequency {
    /// Convert frequency to cron expression
    pub fn to_cron(self) -> String {
        match self {
            RefreshFrequency::Minutes(1) => "0 * * * * *".to_string(),
            RefreshFrequency::Minutes(m) => format!("0 */{} * * * *", m),
            RefreshFrequency::Hours(1) => "0 0 * * * *".to_string(),
            RefreshFrequency::Hours(h) => format!("0 0 */{} * * *", h),
            // Daily at 6 AM
            RefreshFrequency::Days(1) => "0 0 6 * * *".to_string(),
            RefreshFrequency::Days(d) => format!("0 0 6 */{} * *", d),
        }
    }
}

impl FromStr for RefreshFrequency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // Formats: "15m", "2h", "1d" or "hourly" / "daily"
        let s = s.trim().to_lowercase();

        match s.as_str() {
            "hourly" => return Ok(RefreshFrequency::Hours(1)),
            "daily" => return Ok(RefreshFrequency::Days(1)),
            _ => {}
        }

        let Some(unit) = s.chars().last() else {
            return Err("Empty frequency string".to_string());
        };
        let number_part = &s[..s.len() - unit.len_utf8()];

        let value: u32 = number_part
            .parse()
            .map_err(|_| format!("Invalid number in frequency: {}", s))?;

        if value == 0 {
            return Err("Frequency value must be greater than 0".to_string());
        }

        match unit {
            'm' if value < 60 => Ok(RefreshFrequency::Minutes(value)),
            'm' => Err(format!("Minute frequency must be below 60, got {}", value)),
            'h' if value < 24 => Ok(RefreshFrequency::Hours(value)),
            'h' => Err(format!("Hour frequency must be below 24, got {}", value)),
            'd' => Ok(RefreshFrequency::Days(value)),
            _ => Err(format!(
                "Invalid frequency unit '{}'. Use 'm' (minutes), 'h' (hours), or 'd' (days)",
                unit
            )),
        }
    }
}

/// Scheduler service for background weather refresh
pub struct RefreshScheduler {
    scheduler: Arc<RwLock<JobScheduler>>,
    current_job_id: Arc<RwLock<Option<Uuid>>>,
}

impl RefreshScheduler {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to create scheduler: {}", e)))?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            current_job_id: Arc::new(RwLock::new(None)),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let scheduler = self.scheduler.read().await;
        scheduler
            .start()
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to start scheduler: {}", e)))?;
        tracing::info!("Refresh scheduler started");
        Ok(())
    }

    /// Schedule the weather refresh job, replacing any previous one
    pub async fn schedule_weather_refresh(
        &self,
        weather: Arc<WeatherService>,
        frequency: RefreshFrequency,
    ) -> Result<Uuid> {
        self.cancel().await?;

        let cron_expr = frequency.to_cron();

        let job = Job::new_async(cron_expr.clone(), move |_uuid, _l| {
            let weather = Arc::clone(&weather);
            Box::pin(async move {
                let refreshed = weather.refresh_watched().await;
                let evicted = weather.evict_expired().await;
                tracing::info!(
                    "Scheduled weather refresh: {} refreshed, {} evicted",
                    refreshed,
                    evicted
                );
            })
        })
        .map_err(|e| AppError::Scheduler(format!("Failed to create refresh job: {}", e)))?;

        let job_id = job.guid();

        let scheduler = self.scheduler.write().await;
        scheduler
            .add(job)
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to schedule job: {}", e)))?;

        *self.current_job_id.write().await = Some(job_id);

        tracing::info!(
            "Weather refresh scheduled: {:?} ({})",
            frequency,
            cron_expr
        );
        Ok(job_id)
    }

    pub async fn current_job(&self) -> Option<Uuid> {
        *self.current_job_id.read().await
    }

    /// Cancel the scheduled refresh job, if any
    pub async fn cancel(&self) -> Result<()> {
        let mut current_job = self.current_job_id.write().await;

        if let Some(job_id) = current_job.take() {
            let scheduler = self.scheduler.write().await;
            scheduler
                .remove(&job_id)
                .await
                .map_err(|e| AppError::Scheduler(format!("Failed to remove job: {}", e)))?;
            tracing::info!("Weather refresh schedule cancelled");
        }

        Ok(())
    }

    /// Shutdown scheduler gracefully
    pub async fn shutdown(&self) -> Result<()> {
        let mut scheduler = self.scheduler.write().await;
        scheduler
            .shutdown()
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to shutdown scheduler: {}", e)))?;
        tracing::info!("Refresh scheduler shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::WeatherBackend;
    use crate::models::{WeatherCacheRow, WeatherRequest, WeatherResponse};
    use crate::services::ConnectivityMonitor;
    use async_trait::async_trait;

    #[test]
    fn test_frequency_parsing() {
        assert_eq!("15m".parse(), Ok(RefreshFrequency::Minutes(15)));
        assert_eq!(" 2H ".parse(), Ok(RefreshFrequency::Hours(2)));
        assert_eq!("1d".parse(), Ok(RefreshFrequency::Days(1)));
        assert_eq!("hourly".parse(), Ok(RefreshFrequency::Hours(1)));

        assert!("".parse::<RefreshFrequency>().is_err());
        assert!("0m".parse::<RefreshFrequency>().is_err());
        assert!("90m".parse::<RefreshFrequency>().is_err());
        assert!("5w".parse::<RefreshFrequency>().is_err());
        assert!("abc".parse::<RefreshFrequency>().is_err());
    }

    #[test]
    fn test_frequency_to_cron() {
        assert_eq!(RefreshFrequency::Minutes(1).to_cron(), "0 * * * * *");
        assert_eq!(RefreshFrequency::Minutes(15).to_cron(), "0 */15 * * * *");
        assert_eq!(RefreshFrequency::Hours(1).to_cron(), "0 0 * * * *");
        assert_eq!(RefreshFrequency::Hours(6).to_cron(), "0 0 */6 * * *");
        assert_eq!(RefreshFrequency::Days(1).to_cron(), "0 0 6 * * *");
    }

    struct NoWeather;

    #[async_trait]
    impl WeatherBackend for NoWeather {
        async fn cached_weather(&self, _: &str) -> Result<Option<WeatherCacheRow>> {
            Ok(None)
        }

        async fn store_weather(&self, _: &WeatherCacheRow) -> Result<()> {
            Ok(())
        }

        async fn fetch_weather(&self, _: &WeatherRequest) -> Result<WeatherResponse> {
            Err(AppError::Offline)
        }
    }

    #[tokio::test]
    async fn test_schedule_replaces_previous_job() {
        let scheduler = RefreshScheduler::new().await.unwrap();
        let weather = Arc::new(WeatherService::new(
            Arc::new(NoWeather),
            ConnectivityMonitor::new(true),
        ));

        let first = scheduler
            .schedule_weather_refresh(weather.clone(), RefreshFrequency::Minutes(15))
            .await
            .unwrap();
        let second = scheduler
            .schedule_weather_refresh(weather, RefreshFrequency::Hours(1))
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(scheduler.current_job().await, Some(second));

        scheduler.cancel().await.unwrap();
        assert_eq!(scheduler.current_job().await, None);
    }
}
