//! Notification dispatch: actually sends notifications to configured targets.
//! Supports: log (tracing only) and generic HTTP webhook.

use dumptruck_core::config::NotifyTargetConfig;
use dumptruck_core::error::{DumptruckError, Result};

use super::notify::{Notification, NotifyPriority};

/// Notification target configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyTarget {
    /// Written to the log only.
    Log,
    /// Generic HTTP webhook: POST with JSON body.
    Webhook {
        url: String,
        headers: Vec<(String, String)>,
    },
}

impl NotifyTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            NotifyTarget::Log => "log",
            NotifyTarget::Webhook { .. } => "webhook",
        }
    }
}

impl From<&NotifyTargetConfig> for NotifyTarget {
    fn from(config: &NotifyTargetConfig) -> Self {
        match config {
            NotifyTargetConfig::Log => NotifyTarget::Log,
            NotifyTargetConfig::Webhook { url, headers } => NotifyTarget::Webhook {
                url: url.clone(),
                headers: headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            },
        }
    }
}

/// Dispatch a notification to a target.
pub async fn dispatch(notification: &Notification, target: &NotifyTarget) -> Result<()> {
    match target {
        NotifyTarget::Log => {
            let line = format!("[{}] {}: {}", notification.source, notification.title, notification.body);
            match notification.priority {
                NotifyPriority::Urgent | NotifyPriority::High => tracing::error!("🚨 {line}"),
                NotifyPriority::Normal => tracing::warn!("📢 {line}"),
                NotifyPriority::Low => tracing::info!("ℹ️ {line}"),
            }
            Ok(())
        }
        NotifyTarget::Webhook { url, headers } => send_webhook(url, headers, notification).await,
    }
}

/// Send notification via generic HTTP webhook.
async fn send_webhook(
    url: &str,
    headers: &[(String, String)],
    notification: &Notification,
) -> Result<()> {
    let client = reqwest::Client::new();
    let mut req = client
        .post(url)
        .json(&serde_json::json!({
            "title": notification.title,
            "body": notification.body,
            "priority": format!("{:?}", notification.priority),
            "source": notification.source,
            "timestamp": notification.timestamp.to_rfc3339(),
        }))
        .timeout(std::time::Duration::from_secs(10));

    for (key, value) in headers {
        req = req.header(key.as_str(), value.as_str());
    }

    let resp = req
        .send()
        .await
        .map_err(|e| DumptruckError::Notify(format!("Webhook send failed: {e}")))?;

    if resp.status().is_success() {
        tracing::info!("✅ Webhook notification sent to {}: {}", url, notification.title);
        Ok(())
    } else {
        let status = resp.status();
        Err(DumptruckError::Notify(format!("Webhook error {status}")))
    }
}

/// Dispatch to all registered targets.
/// Returns a Vec of (target_name, Result).
pub async fn dispatch_all(
    notification: &Notification,
    targets: &[(String, NotifyTarget)],
) -> Vec<(String, Result<()>)> {
    let mut results = Vec::with_capacity(targets.len());
    for (name, target) in targets {
        let result = dispatch(notification, target).await;
        results.push((name.clone(), result));
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyRouter;
    use std::collections::BTreeMap;

    #[test]
    fn test_from_config_headers() {
        let config = NotifyTargetConfig::Webhook {
            url: "https://hooks.example.com/x".into(),
            headers: BTreeMap::from([("Authorization".to_string(), "Bearer t".to_string())]),
        };
        let target = NotifyTarget::from(&config);
        assert_eq!(
            target,
            NotifyTarget::Webhook {
                url: "https://hooks.example.com/x".into(),
                headers: vec![("Authorization".into(), "Bearer t".into())],
            }
        );
        assert_eq!(target.kind(), "webhook");
    }

    #[tokio::test]
    async fn test_log_target_always_succeeds() {
        let n = NotifyRouter::create("Backup retry", "attempt 1 failed", "pg_s3_backup", NotifyPriority::Normal);
        assert!(dispatch(&n, &NotifyTarget::Log).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_notify_error() {
        let n = NotifyRouter::create("Backup failed", "exit 1", "pg_s3_backup", NotifyPriority::Urgent);
        let target = NotifyTarget::Webhook {
            url: "http://127.0.0.1:9/hook".into(),
            headers: vec![],
        };
        assert!(matches!(dispatch(&n, &target).await, Err(DumptruckError::Notify(_))));
    }
}
