use color_eyre::Result;
use std::sync::Arc;

use crate::cache::{CacheLayer, PersistentCache};
use crate::config::Config;
use crate::firestore::FirestoreClient;
use crate::store::{FamilyStore, PetStore};
use crate::sw::{HttpNetwork, LogHost, ResponseCache, ServiceWorker};

/// Everything a command needs, wired from the configuration.
pub struct App {
  pub config: Config,
  pub cache: CacheLayer,
  pub family: FamilyStore,
  pub pets: PetStore,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let cache = CacheLayer::new(PersistentCache::open(config.cache.path.as_deref()));
    let remote = Arc::new(FirestoreClient::new(&config.firebase)?);

    let family = FamilyStore::new(remote.clone(), cache.clone(), config.cache.family_max_age());
    let pets = PetStore::new(
      remote,
      cache.clone(),
      config.cache.pets_max_age(),
      family.subscribe(),
    );

    Ok(Self {
      config,
      cache,
      family,
      pets,
    })
  }

  /// Sign in the configured user and resolve their family.
  pub async fn sign_in(&self) -> Result<()> {
    let uid = self.config.require_uid()?;
    self.family.sign_in(uid);
    self.family.load_user_family(false).await;
    Ok(())
  }

  /// The service worker, backed by the real network and the on-disk
  /// partition store.
  pub fn service_worker(&self) -> Result<ServiceWorker> {
    let cache = ResponseCache::open(&ResponseCache::default_path()?)?;
    ServiceWorker::new(
      self.config.pwa.clone(),
      Arc::new(HttpNetwork::new()?),
      Arc::new(cache),
      Arc::new(LogHost),
    )
  }
}
