//! User-facing alerts
//!
//! Fired at most once per run, when the policy first reports availability:
//! - `AlertSink` is the capability seam (desktop notification + optional
//!   sound file)
//! - `DesktopAlert` implements it with a desktop notification and rodio
//!   playback; both are blocking mechanisms, so they run on blocking tasks
//! - Sink failures never retract the availability decision

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use notify_rust::Notification;
use rodio::{Decoder, OutputStream, Sink};
use thiserror::Error;
use tracing::debug;

use crate::policy::AvailabilityRule;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("notification failed: {0}")]
    Notify(String),
    #[error("sound playback failed: {0}")]
    Playback(String),
}

/// Capability to surface a title/message pair to the operator.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, title: &str, message: &str) -> Result<(), AlertError>;
    async fn play(&self, sound: &Path) -> Result<(), AlertError>;
}

/// Notification title: the monitored address, so several monitors stay
/// distinguishable on screen.
pub fn alert_title(addr: &str) -> String {
    format!("gpuwatch <{addr}>")
}

/// Notification body, phrased from the rule that fired.
pub fn alert_message(rule: &AvailabilityRule) -> String {
    let s = if rule.min_devices == 1 { "" } else { "s" };
    match rule.min_free_mib {
        None => format!("{} GPU{} are now available!", rule.min_devices, s),
        Some(min_free) => format!(
            "{} GPU{} with {} MB RAM are now available!",
            rule.min_devices, s, min_free
        ),
    }
}

/// Desktop notification plus optional sound file playback.
pub struct DesktopAlert;

#[async_trait]
impl AlertSink for DesktopAlert {
    async fn notify(&self, title: &str, message: &str) -> Result<(), AlertError> {
        let title = title.to_string();
        let message = message.to_string();

        tokio::task::spawn_blocking(move || {
            Notification::new()
                .appname("gpuwatch")
                .summary(&title)
                .body(&message)
                .show()
                .map(|_| ())
                .map_err(|e| AlertError::Notify(e.to_string()))
        })
        .await
        .map_err(|e| AlertError::Notify(e.to_string()))?
    }

    async fn play(&self, sound: &Path) -> Result<(), AlertError> {
        let sound: PathBuf = sound.to_path_buf();
        debug!(sound = %sound.display(), "playing alert sound");

        tokio::task::spawn_blocking(move || {
            let (_stream, handle) = OutputStream::try_default()
                .map_err(|e| AlertError::Playback(e.to_string()))?;
            let sink =
                Sink::try_new(&handle).map_err(|e| AlertError::Playback(e.to_string()))?;
            let file = File::open(&sound)
                .map_err(|e| AlertError::Playback(format!("{}: {e}", sound.display())))?;
            let source = Decoder::new(BufReader::new(file))
                .map_err(|e| AlertError::Playback(e.to_string()))?;

            sink.append(source);
            // Keep the output stream alive until the clip has drained.
            sink.sleep_until_end();
            Ok(())
        })
        .await
        .map_err(|e| AlertError::Playback(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_carries_the_address() {
        assert_eq!(alert_title("alice@gpu01"), "gpuwatch <alice@gpu01>");
    }

    #[test]
    fn singular_idle_message() {
        let rule = AvailabilityRule { min_devices: 1, min_free_mib: None };
        assert_eq!(alert_message(&rule), "1 GPU are now available!");
    }

    #[test]
    fn plural_idle_message() {
        let rule = AvailabilityRule { min_devices: 2, min_free_mib: None };
        assert_eq!(alert_message(&rule), "2 GPUs are now available!");
    }

    #[test]
    fn free_memory_message_names_the_threshold() {
        let rule = AvailabilityRule { min_devices: 3, min_free_mib: Some(6000) };
        assert_eq!(
            alert_message(&rule),
            "3 GPUs with 6000 MB RAM are now available!"
        );
    }
}
