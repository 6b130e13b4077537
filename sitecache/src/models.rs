//! Domain models
//!
//! Rust structs for offline drafts, snapshots, weather readings and plan limits.
//! All models use serde; JSON field names follow the wire shapes the web client
//! and the hosted backend already use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current time truncated to millisecond precision.
///
/// Persisted timestamps are epoch milliseconds, so records created in memory
/// must carry the same precision to compare equal after a reload.
pub fn timestamp_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

// ===== Offline drafts =====

/// A form submission saved locally before network confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineFormRecord {
    pub id: String,
    pub form_template_id: String,
    pub form_name: String,
    pub data: Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_submitted: bool,
}

/// Input for a new draft; id and timestamp are assigned by the store
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormDraft {
    pub form_template_id: String,
    pub form_name: String,
    pub data: Value,
}

/// Partial update of a draft
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormPatch {
    pub form_name: Option<String>,
    pub data: Option<Value>,
    pub is_submitted: Option<bool>,
}

/// Selection applied by `OfflineStore::list`; the default selects everything
#[derive(Debug, Clone, Default)]
pub struct FormFilter {
    pub form_template_id: Option<String>,
    pub submitted: Option<bool>,
}

impl FormFilter {
    pub fn pending() -> Self {
        Self {
            submitted: Some(false),
            ..Self::default()
        }
    }

    /// Drafts the user submitted while offline, waiting for the server
    pub fn queued() -> Self {
        Self {
            submitted: Some(true),
            ..Self::default()
        }
    }

    pub fn for_template(form_template_id: impl Into<String>) -> Self {
        Self {
            form_template_id: Some(form_template_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &OfflineFormRecord) -> bool {
        if let Some(template) = &self.form_template_id {
            if &record.form_template_id != template {
                return false;
            }
        }
        if let Some(submitted) = self.submitted {
            if record.is_submitted != submitted {
                return false;
            }
        }
        true
    }
}

// ===== Offline snapshot =====

/// Last full copy of the server lists, replaced wholesale on every sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSnapshot {
    #[serde(default)]
    pub projects: Vec<Value>,
    #[serde(default)]
    pub tasks: Vec<Value>,
    #[serde(default)]
    pub team_members: Vec<Value>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_sync: DateTime<Utc>,
}

impl OfflineSnapshot {
    pub fn new(projects: Vec<Value>, tasks: Vec<Value>, team_members: Vec<Value>) -> Self {
        Self {
            projects,
            tasks,
            team_members,
            last_sync: timestamp_now(),
        }
    }
}

// ===== Weather =====

/// Provider measurements for one project location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherConditions {
    pub temperature_current: f64,
    pub temperature_high: f64,
    pub temperature_low: f64,
    pub condition: String,
    pub humidity: f64,
    pub wind_speed: f64,
    pub icon: String,
}

/// Weather reading handed to callers, annotated with cache provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    #[serde(flatten)]
    pub conditions: WeatherConditions,
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_minutes: Option<i64>,
}

impl WeatherReading {
    pub fn fresh(conditions: WeatherConditions) -> Self {
        Self {
            conditions,
            cached: false,
            age_minutes: None,
        }
    }

    pub fn from_cache(conditions: WeatherConditions, age_minutes: i64) -> Self {
        Self {
            conditions,
            cached: true,
            age_minutes: Some(age_minutes),
        }
    }
}

/// "Fetch failed" outcome, distinct from "no data yet"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherError {
    pub error: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub cached: bool,
}

impl WeatherError {
    pub const OFFLINE: &'static str = "offline";
    pub const ADDRESS_REQUIRED: &'static str = "address_required";
    pub const UNAVAILABLE: &'static str = "weather_unavailable";

    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            cached: false,
        }
    }
}

/// Either a reading or an error object; discriminated on the `error` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WeatherResponse {
    Error(WeatherError),
    Reading(WeatherReading),
}

impl WeatherResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, WeatherResponse::Error(_))
    }

    pub fn reading(&self) -> Option<&WeatherReading> {
        match self {
            WeatherResponse::Reading(reading) => Some(reading),
            WeatherResponse::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&WeatherError> {
        match self {
            WeatherResponse::Error(err) => Some(err),
            WeatherResponse::Reading(_) => None,
        }
    }
}

/// Request body of the weather function
#[derive(Debug, Clone, Serialize)]
pub struct WeatherRequest {
    pub address: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
}

/// Server-side cache row, one per project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherCacheRow {
    pub project_id: String,
    #[serde(rename = "weather_data")]
    pub conditions: WeatherConditions,
    pub cached_at: DateTime<Utc>,
}

// ===== Plan limits =====

/// Resource kinds metered by the subscription plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Projects,
    Users,
    Storage,
    Versions,
    Collaborators,
}

impl LimitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitKind::Projects => "projects",
            LimitKind::Users => "users",
            LimitKind::Storage => "storage",
            LimitKind::Versions => "versions",
            LimitKind::Collaborators => "collaborators",
        }
    }

    /// Human label used in notifications
    pub fn label(self) -> &'static str {
        match self {
            LimitKind::Projects => "projects",
            LimitKind::Users => "team members",
            LimitKind::Storage => "storage",
            LimitKind::Versions => "document versions",
            LimitKind::Collaborators => "collaborators",
        }
    }
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-computed usage aggregate for one resource kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionLimitCheck {
    pub allowed: bool,
    pub current: i64,
    pub limit: i64,
}

impl SubscriptionLimitCheck {
    /// Threshold check used when only the raw usage is known
    pub fn from_usage(current: i64, limit: i64) -> Self {
        Self {
            allowed: current < limit,
            current,
            limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_form_record_wire_names() {
        let record = OfflineFormRecord {
            id: "d1".to_string(),
            form_template_id: "tpl-1".to_string(),
            form_name: "Daily log".to_string(),
            data: json!({"crew": 4}),
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            is_submitted: false,
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["formTemplateId"], "tpl-1");
        assert_eq!(value["formName"], "Daily log");
        assert_eq!(value["isSubmitted"], false);
        assert_eq!(value["timestamp"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_filter_matching() {
        let mut record = OfflineFormRecord {
            id: "d1".to_string(),
            form_template_id: "tpl-1".to_string(),
            form_name: "Inspection".to_string(),
            data: json!({}),
            timestamp: timestamp_now(),
            is_submitted: false,
        };

        assert!(FormFilter::default().matches(&record));
        assert!(FormFilter::pending().matches(&record));
        assert!(FormFilter::for_template("tpl-1").matches(&record));
        assert!(!FormFilter::for_template("tpl-2").matches(&record));

        record.is_submitted = true;
        assert!(!FormFilter::pending().matches(&record));
        assert!(FormFilter::queued().matches(&record));
    }

    #[test]
    fn test_weather_response_discriminates_on_error_field() {
        let reading: WeatherResponse = serde_json::from_value(json!({
            "temperature_current": 72,
            "temperature_high": 80,
            "temperature_low": 60,
            "condition": "Clear",
            "humidity": 40,
            "wind_speed": 5.5,
            "icon": "01d",
            "cached": false
        }))
        .unwrap();
        assert!(!reading.is_error());
        assert_eq!(reading.reading().unwrap().conditions.temperature_current, 72.0);

        let error: WeatherResponse = serde_json::from_value(json!({
            "error": "provider_error",
            "message": "Upstream returned 500",
            "cached": false
        }))
        .unwrap();
        assert!(error.is_error());
        assert_eq!(error.error().unwrap().error, "provider_error");
    }

    #[test]
    fn test_weather_error_without_message() {
        let error: WeatherResponse =
            serde_json::from_value(json!({"error": "rate_limited", "cached": false})).unwrap();

        let error = error.error().unwrap();
        assert_eq!(error.error, "rate_limited");
        assert!(error.message.is_empty());
    }

    #[test]
    fn test_limit_from_usage() {
        assert!(!SubscriptionLimitCheck::from_usage(5, 5).allowed);
        assert!(SubscriptionLimitCheck::from_usage(4, 5).allowed);
        assert_eq!(serde_json::to_value(LimitKind::Collaborators).unwrap(), "collaborators");
    }
}
