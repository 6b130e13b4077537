//! Subscription limit gate
//!
//! Cooperative check against server-computed usage. A `false` from
//! `enforce_limit` means the caller must not proceed; the server still
//! enforces the plan on its own.

use crate::backend::LimitBackend;
use crate::error::{AppError, Result};
use crate::models::{LimitKind, SubscriptionLimitCheck};
use crate::services::connectivity::ConnectivityMonitor;
use crate::services::notifications::{Notification, Notifier};
use std::sync::Arc;

#[derive(Clone)]
pub struct LimitGate {
    backend: Arc<dyn LimitBackend>,
    notifier: Arc<dyn Notifier>,
    connectivity: ConnectivityMonitor,
}

impl LimitGate {
    pub fn new(
        backend: Arc<dyn LimitBackend>,
        notifier: Arc<dyn Notifier>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        Self {
            backend,
            notifier,
            connectivity,
        }
    }

    /// Read-through to the usage aggregate; nothing is cached
    pub async fn check_limit(
        &self,
        kind: LimitKind,
        context_id: Option<&str>,
    ) -> Result<SubscriptionLimitCheck> {
        if !self.connectivity.is_online() {
            return Err(AppError::Offline);
        }

        let check = self.backend.check_limit(kind, context_id).await?;
        tracing::debug!(
            "Limit check {}: {}/{} (allowed: {})",
            kind,
            check.current,
            check.limit,
            check.allowed
        );
        Ok(check)
    }

    pub async fn enforce_limit(&self, kind: LimitKind) -> bool {
        self.enforce_limit_for(kind, None).await
    }

    /// Check and notify; `false` blocks the operation
    pub async fn enforce_limit_for(&self, kind: LimitKind, context_id: Option<&str>) -> bool {
        match self.check_limit(kind, context_id).await {
            Ok(check) if check.allowed => true,
            Ok(check) => {
                tracing::info!(
                    "Blocked by plan limit for {}: {}/{}",
                    kind,
                    check.current,
                    check.limit
                );
                self.notifier.notify(Notification::error(
                    "Plan limit reached",
                    format!(
                        "You've used {} of {} {} on your current plan. Upgrade to add more.",
                        check.current,
                        check.limit,
                        kind.label()
                    ),
                ));
                false
            }
            Err(e) => {
                tracing::warn!("Limit check for {} failed: {}", kind, e);
                self.notifier.notify(Notification::error(
                    "Unable to verify plan limits",
                    match e {
                        AppError::Offline => "Reconnect to continue.".to_string(),
                        other => other.to_string(),
                    },
                ));
                false
            }
        }
    }
}
