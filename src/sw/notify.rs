//! Push payloads and the notifications they turn into.

use async_trait::async_trait;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const NOTIFICATION_ICON: &str = "/icons/icon-128x128.png";
pub const NOTIFICATION_BADGE: &str = "/icons/badge-48x48.png";
pub const VIBRATE_PATTERN: [u32; 3] = [100, 50, 100];

/// JSON body of a push message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
  pub title: String,
  #[serde(default)]
  pub body: Option<String>,
  #[serde(default)]
  pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: Option<String>,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  /// Page to open when the notification is clicked
  pub url: Option<String>,
}

impl From<PushPayload> for Notification {
  fn from(payload: PushPayload) -> Self {
    Self {
      title: payload.title,
      body: payload.body,
      icon: NOTIFICATION_ICON.to_string(),
      badge: NOTIFICATION_BADGE.to_string(),
      vibrate: VIBRATE_PATTERN.to_vec(),
      url: payload.url,
    }
  }
}

/// The platform surface that displays notifications and opens windows.
#[async_trait]
pub trait NotificationHost: Send + Sync {
  async fn show_notification(&self, notification: &Notification) -> Result<()>;

  async fn close_notification(&self, notification: &Notification) -> Result<()>;

  async fn open_window(&self, url: &str) -> Result<()>;
}

/// Host that only records what would have been shown.
pub struct LogHost;

#[async_trait]
impl NotificationHost for LogHost {
  async fn show_notification(&self, notification: &Notification) -> Result<()> {
    info!("Notification: {}", notification.title);
    Ok(())
  }

  async fn close_notification(&self, notification: &Notification) -> Result<()> {
    info!("Closed notification: {}", notification.title);
    Ok(())
  }

  async fn open_window(&self, url: &str) -> Result<()> {
    info!("Open window: {}", url);
    Ok(())
  }
}
