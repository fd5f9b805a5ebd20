//! The worker's event handlers: install, activate, fetch, sync, push, and
//! notification clicks.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use super::network::Network;
use super::notify::{Notification, NotificationHost, PushPayload};
use super::partitions::{Expiration, ResponseCache};
use super::request::{Request, Response};
use super::router::{FetchOutcome, PartitionNames, Router};
use crate::config::PwaConfig;

/// Background-sync tag for pet data.
pub const SYNC_PETS_TAG: &str = "sync-pets-data";

pub struct ServiceWorker {
  config: PwaConfig,
  origin: Url,
  names: PartitionNames,
  router: Router,
  network: Arc<dyn Network>,
  cache: Arc<ResponseCache>,
  host: Arc<dyn NotificationHost>,
}

impl ServiceWorker {
  pub fn new(
    config: PwaConfig,
    network: Arc<dyn Network>,
    cache: Arc<ResponseCache>,
    host: Arc<dyn NotificationHost>,
  ) -> Result<Self> {
    let origin = config.origin()?;
    let names = PartitionNames::new(&config.cache_prefix);
    let router = Router::new(
      origin.clone(),
      Router::default_routes(&config)?,
      Arc::clone(&network),
      Arc::clone(&cache),
    );

    Ok(Self {
      config,
      origin,
      names,
      router,
      network,
      cache,
      host,
    })
  }

  pub fn router(&self) -> &Router {
    &self.router
  }

  /// Partition names this version of the worker uses.
  pub fn recognized_partitions(&self) -> Vec<String> {
    self.names.all()
  }

  /// Precache the app shell.
  ///
  /// All-or-nothing: if any asset fails or is not a 200, nothing is stored.
  pub async fn install(&self) -> Result<usize> {
    let requests = self
      .config
      .precache
      .iter()
      .map(|path| {
        self
          .origin
          .join(path)
          .map(Request::get)
          .map_err(|e| eyre!("Invalid precache path {}: {}", path, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let responses = try_join_all(requests.iter().map(|request| self.precache_one(request))).await?;

    self.cache.open_partition(&self.names.shell).await?;
    for (request, response) in requests.iter().zip(&responses) {
      self
        .cache
        .put(
          &self.names.shell,
          request.url.as_str(),
          response,
          &Expiration::default(),
        )
        .await?;
    }

    info!("Precached {} shell assets", responses.len());
    Ok(responses.len())
  }

  async fn precache_one(&self, request: &Request) -> Result<Response> {
    let response = self.network.fetch(request).await?;
    if !response.is_cacheable() {
      return Err(eyre!("Precache of {} returned {}", request.url, response.status));
    }
    Ok(response)
  }

  /// Delete partitions left behind by older versions of the worker.
  ///
  /// Only names with our prefix are touched; other apps' caches are left alone.
  pub async fn activate(&self) -> Result<Vec<String>> {
    let recognized = self.recognized_partitions();
    let mut removed = Vec::new();

    for name in self.cache.partition_names().await? {
      if name.starts_with(&self.config.cache_prefix) && !recognized.contains(&name) {
        info!("Removing old cache {}", name);
        self.cache.delete_partition(&name).await?;
        removed.push(name);
      }
    }

    Ok(removed)
  }

  /// Intercept a fetch.
  pub async fn fetch(&self, request: &Request) -> Result<FetchOutcome> {
    self.router.handle(request).await
  }

  /// Background sync.
  ///
  /// Pet data has no offline write queue; the sync tag is acknowledged and
  /// nothing is replayed.
  pub async fn sync(&self, tag: &str) -> Result<()> {
    if tag == SYNC_PETS_TAG {
      info!("Background sync for {}", tag);
    } else {
      debug!("Ignoring sync tag {}", tag);
    }
    Ok(())
  }

  /// Show the notification carried by a push message. Empty messages show
  /// nothing.
  pub async fn push(&self, data: Option<&[u8]>) -> Result<Option<Notification>> {
    let Some(data) = data.filter(|d| !d.is_empty()) else {
      return Ok(None);
    };

    let payload: PushPayload =
      serde_json::from_slice(data).map_err(|e| eyre!("Failed to parse push payload: {}", e))?;
    let notification = Notification::from(payload);
    self.host.show_notification(&notification).await?;
    Ok(Some(notification))
  }

  /// Close the clicked notification and open its page, if it has one.
  pub async fn notification_click(&self, notification: &Notification) -> Result<()> {
    self.host.close_notification(notification).await?;
    if let Some(url) = &notification.url {
      self.host.open_window(url).await?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::SystemClock;
  use crate::sw::testing::FakeNetwork;
  use async_trait::async_trait;
  use std::sync::Mutex;

  #[derive(Default)]
  struct RecordingHost {
    events: Mutex<Vec<String>>,
  }

  #[async_trait]
  impl NotificationHost for RecordingHost {
    async fn show_notification(&self, notification: &Notification) -> Result<()> {
      self
        .events
        .lock()
        .unwrap()
        .push(format!("show {}", notification.title));
      Ok(())
    }

    async fn close_notification(&self, notification: &Notification) -> Result<()> {
      self
        .events
        .lock()
        .unwrap()
        .push(format!("close {}", notification.title));
      Ok(())
    }

    async fn open_window(&self, url: &str) -> Result<()> {
      self.events.lock().unwrap().push(format!("open {}", url));
      Ok(())
    }
  }

  struct Harness {
    network: Arc<FakeNetwork>,
    cache: Arc<ResponseCache>,
    host: Arc<RecordingHost>,
    worker: ServiceWorker,
  }

  fn harness(config: PwaConfig) -> Harness {
    let network = Arc::new(FakeNetwork::default());
    let cache = Arc::new(ResponseCache::in_memory(Arc::new(SystemClock)).unwrap());
    let host = Arc::new(RecordingHost::default());
    let worker = ServiceWorker::new(config, network.clone(), cache.clone(), host.clone()).unwrap();
    Harness {
      network,
      cache,
      host,
      worker,
    }
  }

  fn small_config() -> PwaConfig {
    PwaConfig {
      precache: vec!["/".into(), "/index.html".into(), "/js/app.js".into()],
      ..PwaConfig::default()
    }
  }

  #[tokio::test]
  async fn test_install_precaches_shell() {
    let h = harness(small_config());
    for path in ["/", "/index.html", "/js/app.js"] {
      h.network
        .respond(&format!("http://localhost:9000{}", path), Response::ok(path));
    }

    assert_eq!(h.worker.install().await.unwrap(), 3);
    assert_eq!(h.cache.len("meow-log-cache-shell-v1").await.unwrap(), 3);
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let h = harness(small_config());
    h.network.respond("http://localhost:9000/", Response::ok("/"));
    h.network
      .respond("http://localhost:9000/index.html", Response::ok("<html>"));
    h.network
      .respond("http://localhost:9000/js/app.js", Response::new(500, "boom"));

    assert!(h.worker.install().await.is_err());
    assert_eq!(h.cache.len("meow-log-cache-shell-v1").await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_activate_removes_outdated_partitions() {
    let h = harness(small_config());
    for name in [
      "meow-log-cache-shell-v0",
      "meow-log-cache-data-v1",
      "meow-log-cache-shell-v1",
      "meow-log-cache-images-v1",
      "meow-log-cache-pages-v1",
      "someone-elses-cache",
    ] {
      h.cache.open_partition(name).await.unwrap();
    }

    let removed = h.worker.activate().await.unwrap();

    assert_eq!(removed, vec!["meow-log-cache-data-v1", "meow-log-cache-shell-v0"]);
    assert_eq!(
      h.cache.partition_names().await.unwrap(),
      vec![
        "meow-log-cache-images-v1",
        "meow-log-cache-pages-v1",
        "meow-log-cache-shell-v1",
        "someone-elses-cache"
      ]
    );
  }

  #[tokio::test]
  async fn test_push_shows_notification() {
    let h = harness(small_config());
    let payload = br#"{"title":"Vet visit","body":"Mochi at 3pm","url":"/pets/p1"}"#;

    let notification = h.worker.push(Some(&payload[..])).await.unwrap().unwrap();

    assert_eq!(notification.icon, "/icons/icon-128x128.png");
    assert_eq!(notification.badge, "/icons/badge-48x48.png");
    assert_eq!(notification.vibrate, vec![100, 50, 100]);
    assert_eq!(notification.url.as_deref(), Some("/pets/p1"));
    assert_eq!(*h.host.events.lock().unwrap(), vec!["show Vet visit"]);
  }

  #[tokio::test]
  async fn test_empty_push_shows_nothing() {
    let h = harness(small_config());

    assert_eq!(h.worker.push(None).await.unwrap(), None);
    assert_eq!(h.worker.push(Some(&b""[..])).await.unwrap(), None);
    assert!(h.worker.push(Some(&b"not json"[..])).await.is_err());
    assert!(h.host.events.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_notification_click_opens_url() {
    let h = harness(small_config());
    let with_url = Notification::from(PushPayload {
      title: "a".into(),
      body: None,
      url: Some("/pets".into()),
    });
    let without_url = Notification::from(PushPayload {
      title: "b".into(),
      body: None,
      url: None,
    });

    h.worker.notification_click(&with_url).await.unwrap();
    h.worker.notification_click(&without_url).await.unwrap();

    assert_eq!(
      *h.host.events.lock().unwrap(),
      vec!["close a", "open /pets", "close b"]
    );
  }

  #[tokio::test]
  async fn test_sync_is_a_no_op() {
    let h = harness(small_config());
    h.worker.sync(SYNC_PETS_TAG).await.unwrap();
    h.worker.sync("other").await.unwrap();
  }
}
