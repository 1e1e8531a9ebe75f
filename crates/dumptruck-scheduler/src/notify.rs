//! Notification system: tells an operator about retries and failed runs.
//! Lightweight: no queues. Dispatch to every configured target, keep a small
//! in-memory history.

use dumptruck_core::config::NotifyConfig;
use serde::{Deserialize, Serialize};

use crate::dispatch::{self, NotifyTarget};

const HISTORY_LIMIT: usize = 100;

/// A notification to send to the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Title/summary.
    pub title: String,
    /// Body content.
    pub body: String,
    pub priority: NotifyPriority,
    /// Source (which job/run triggered this).
    pub source: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Notification priority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NotifyPriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// Notification router: fans a notification out to every target.
pub struct NotifyRouter {
    targets: Vec<(String, NotifyTarget)>,
    /// Notification history (in-memory ring buffer).
    history: Vec<Notification>,
}

impl NotifyRouter {
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Build from the manifest's `[notify]` section.
    pub fn from_config(config: &NotifyConfig) -> Self {
        let mut router = Self::new();
        for (i, target) in config.targets.iter().enumerate() {
            let target = NotifyTarget::from(target);
            let name = format!("{}-{}", target.kind(), i);
            router.register(&name, target);
        }
        router
    }

    /// Register a notification target.
    pub fn register(&mut self, name: &str, target: NotifyTarget) {
        self.targets.push((name.to_string(), target));
    }

    pub fn targets(&self) -> &[(String, NotifyTarget)] {
        &self.targets
    }

    /// Dispatch to all targets and record in history. Failures are logged
    /// and returned, never raised.
    pub async fn send(&mut self, notification: Notification) -> Vec<(String, bool)> {
        let results = dispatch::dispatch_all(&notification, &self.targets).await;
        let summary = results
            .into_iter()
            .map(|(name, result)| {
                if let Err(e) = &result {
                    tracing::warn!("⚠️ Notification to {name} failed: {e}");
                }
                (name, result.is_ok())
            })
            .collect();
        self.record(notification);
        summary
    }

    /// Record a sent notification in history.
    pub fn record(&mut self, notification: Notification) {
        self.history.push(notification);
        if self.history.len() > HISTORY_LIMIT {
            self.history.remove(0);
        }
    }

    /// Get notification history.
    pub fn history(&self) -> &[Notification] {
        &self.history
    }

    /// Create a notification.
    pub fn create(title: &str, body: &str, source: &str, priority: NotifyPriority) -> Notification {
        Notification {
            title: title.to_string(),
            body: body.to_string(),
            priority,
            source: source.to_string(),
            timestamp: chrono::Utc::now(),
        }
    }
}

impl Default for NotifyRouter {
    fn default() -> Self {
        Self::new()
    }
}
