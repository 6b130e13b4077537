//! Services module
//!
//! Client-side services that sit between the UI and the hosted backend.

pub mod connectivity;
pub mod limits;
pub mod notifications;
pub mod retry;
pub mod scheduler;
pub mod settings;
pub mod sync;
pub mod weather;

pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, ConnectivityState};
pub use limits::LimitGate;
pub use notifications::{Notification, NotificationCenter, NotificationVariant, Notifier};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use scheduler::{RefreshFrequency, RefreshScheduler};
pub use settings::{ClientSettings, SettingsService};
pub use sync::{SyncReport, SyncService};
pub use weather::WeatherService;
