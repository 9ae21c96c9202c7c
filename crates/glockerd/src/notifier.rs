//! Notification dispatch
//!
//! Notifications go through the configured command, e.g.
//! `notify-send --urgency={urgency} {title} {message}`. Every delivery is
//! bounded by `notification_timeout_seconds`.

use crate::system::{Notification, System, Urgency};
use glocker_common::{Config, GlockerError, Result};
use tracing::{debug, warn};

/// Split `template` into arguments, then fill placeholders per argument so
/// a message containing spaces stays one argument
pub fn render_argv(template: &str, note: &Notification) -> Vec<String> {
    template
        .split_whitespace()
        .map(|part| {
            part.replace("{title}", &note.title)
                .replace("{message}", &note.message)
                .replace("{urgency}", note.urgency.as_str())
        })
        .collect()
}

/// Deliver `note`. Failures and timeouts are logged and returned, never fatal.
pub async fn notify(system: &System, config: &Config, note: Notification) -> Result<()> {
    let timeout = config.notification_timeout();
    let result = tokio::time::timeout(
        timeout,
        system.notifier.notify(&config.notification_command, &note),
    )
    .await;

    match result {
        Ok(Ok(())) => {
            debug!(title = %note.title, "Notification sent");
            Ok(())
        }
        Ok(Err(e)) => {
            warn!(title = %note.title, "Failed to send notification: {}", e);
            Err(e)
        }
        Err(_) => {
            warn!(title = %note.title, "Notification timed out after {:?}", timeout);
            Err(GlockerError::TransientExternal(format!(
                "notification timed out after {}s",
                timeout.as_secs()
            )))
        }
    }
}

pub fn alert(title: &str, message: impl Into<String>) -> Notification {
    Notification::new(title, message, Urgency::Critical)
}

pub fn info(title: &str, message: impl Into<String>) -> Notification {
    Notification::new(title, message, Urgency::Normal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fake::FakeSystem;
    use std::time::Duration;

    #[test]
    fn test_render_keeps_message_whole() {
        let note = Notification::new("Glocker Alert", "3 domains unblocked", Urgency::Normal);
        let argv = render_argv("notify-send --urgency={urgency} {title} {message}", &note);
        assert_eq!(
            argv,
            vec![
                "notify-send",
                "--urgency=normal",
                "Glocker Alert",
                "3 domains unblocked"
            ]
        );
        assert!(render_argv("   ", &note).is_empty());
    }

    #[tokio::test]
    async fn test_notify_delivers() {
        let fakes = FakeSystem::new();
        let config = Config::default();
        notify(&fakes.system(), &config, alert("Glocker Security Alert", "tamper"))
            .await
            .unwrap();
        assert_eq!(fakes.notifier.titles(), vec!["Glocker Security Alert"]);
    }

    #[tokio::test]
    async fn test_notify_times_out() {
        let fakes = FakeSystem::new();
        fakes.notifier.set_delay(Duration::from_secs(5));
        let config = Config {
            notification_timeout_seconds: 1,
            ..Config::default()
        };

        let started = std::time::Instant::now();
        let err = notify(&fakes.system(), &config, info("slow", "slow"))
            .await
            .unwrap_err();
        assert!(matches!(err, GlockerError::TransientExternal(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(fakes.notifier.sent().is_empty());
    }
}
