//! Configuration constants
//!
//! Central location for cache windows, retry limits, storage keys
//! and protocol timings used throughout the crate.

use std::time::Duration;

// ===== Local Persistence =====

/// Storage key holding the JSON array of offline form drafts
pub const OFFLINE_FORMS_KEY: &str = "offline_forms";

/// Storage key holding the JSON offline snapshot (projects, tasks, team)
pub const OFFLINE_DATA_KEY: &str = "offlineData";

/// SQLite file backing local storage, relative to the app data directory
pub const DATABASE_FILE: &str = "offline.db";

/// Settings file name inside the app data directory
pub const SETTINGS_FILE: &str = "settings.json";

// ===== Weather Cache =====

/// Cached readings younger than this are served without contacting the provider
pub const WEATHER_FRESHNESS: Duration = Duration::from_secs(5 * 60);

/// Memory entries older than this are evicted
pub const WEATHER_RETENTION: Duration = Duration::from_secs(30 * 60);

/// Default refresh frequency string understood by the scheduler
pub const DEFAULT_REFRESH_FREQUENCY: &str = "15m";

// ===== Retry Policy =====

/// Attempts before a transient failure becomes final
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Delay after the first failed attempt in milliseconds
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

/// Upper bound for any backoff delay in milliseconds
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

// ===== Realtime =====

/// Schema every postgres_changes subscription targets
pub const REALTIME_SCHEMA: &str = "public";

/// Heartbeat period for the realtime websocket
pub const REALTIME_HEARTBEAT: Duration = Duration::from_secs(25);

/// Protocol version sent on the realtime websocket URL
pub const REALTIME_PROTOCOL_VERSION: &str = "1.0.0";

// ===== Notifications =====

/// Capacity of the broadcast channels (notifications, invalidations, connectivity)
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

// ===== Logging =====

/// Filter used when neither settings nor RUST_LOG provide one
pub const DEFAULT_LOG_FILTER: &str = "sitecache=debug,info";
