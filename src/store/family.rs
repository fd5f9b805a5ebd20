//! Signed-in user and their family.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use super::source::FamilySource;
use crate::cache::{CacheLayer, CacheSource, ReadOptions};
use crate::model::{Family, FamilyMember};

/// Who is signed in and which family they belong to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
  pub user_id: Option<String>,
  pub family: Option<Family>,
  pub loading: bool,
}

impl SessionState {
  pub fn is_logged_in(&self) -> bool {
    self.user_id.is_some()
  }

  pub fn has_family(&self) -> bool {
    self.family.is_some()
  }

  pub fn family_id(&self) -> Option<&str> {
    self.family.as_ref().map(|f| f.id.as_str())
  }
}

fn family_key(user_id: &str) -> String {
  format!("family:{}", user_id)
}

/// Owns the session state and notifies subscribers whenever it changes.
pub struct FamilyStore {
  source: Arc<dyn FamilySource>,
  cache: CacheLayer,
  max_age: Duration,
  state: watch::Sender<SessionState>,
}

impl FamilyStore {
  pub fn new(source: Arc<dyn FamilySource>, cache: CacheLayer, max_age: Duration) -> Self {
    let (state, _) = watch::channel(SessionState::default());
    Self {
      source,
      cache,
      max_age,
      state,
    }
  }

  /// Receive every future session change.
  pub fn subscribe(&self) -> watch::Receiver<SessionState> {
    self.state.subscribe()
  }

  pub fn snapshot(&self) -> SessionState {
    self.state.borrow().clone()
  }

  /// Record the signed-in user. Authentication itself happens elsewhere.
  pub fn sign_in(&self, user_id: &str) {
    self.state.send_modify(|s| {
      s.user_id = Some(user_id.to_string());
      s.family = None;
    });
  }

  pub fn sign_out(&self) {
    self.state.send_replace(SessionState::default());
  }

  /// Look up the user's family through the cache.
  ///
  /// A user without an active membership has no family; failures keep the
  /// family that was already known.
  pub async fn load_user_family(&self, force_refresh: bool) -> Option<Family> {
    let user_id = self.state.borrow().user_id.clone()?;
    let last_known = self.state.borrow().family.clone();
    self.state.send_modify(|s| s.loading = true);

    let source = Arc::clone(&self.source);
    let uid = user_id.clone();
    let result = self
      .cache
      .fetch(
        &family_key(&user_id),
        ReadOptions::max_age(self.max_age).refresh(force_refresh),
        last_known,
        move || async move {
          let Some(member) = source.find_membership(&uid).await? else {
            return Ok(None);
          };
          source.get_family(&member.family_id).await
        },
      )
      .await;

    // A user who just left their family must not keep a stale cached one
    if result.source == CacheSource::Network && result.data.is_none() {
      self.cache.invalidate(&family_key(&user_id)).await;
    }

    info!(
      "Loaded family for {} from {:?}: {:?}",
      user_id,
      result.source,
      result.data.as_ref().map(|f| &f.id)
    );

    let family = result.data;
    self.state.send_modify(|s| {
      s.family = family.clone();
      s.loading = false;
    });
    family
  }

  /// Create a family with the signed-in user as its admin.
  pub async fn create_family(&self, name: &str) -> Result<Family> {
    let user_id = self.require_user()?;
    let family_id = self.source.create_family(name, &user_id).await?;
    self
      .source
      .set_membership(&FamilyMember {
        family_id: family_id.clone(),
        user_id: user_id.clone(),
        role: "admin".into(),
        active: true,
      })
      .await?;
    info!("Created family {} for {}", family_id, user_id);
    self.reload_after_join(&family_id).await
  }

  /// Join an existing family as a plain member.
  pub async fn join_family(&self, family_id: &str) -> Result<Family> {
    let user_id = self.require_user()?;
    if self.source.get_family(family_id).await?.is_none() {
      return Err(eyre!("Family {} does not exist", family_id));
    }
    if self.source.get_membership(&user_id, family_id).await?.is_some() {
      return Err(eyre!("You are already a member of family {}", family_id));
    }
    self
      .source
      .set_membership(&FamilyMember {
        family_id: family_id.to_string(),
        user_id: user_id.clone(),
        role: "member".into(),
        active: true,
      })
      .await?;
    info!("{} joined family {}", user_id, family_id);
    self.reload_after_join(family_id).await
  }

  /// Leave the current family. Returns whether the membership was ended.
  pub async fn leave_family(&self) -> bool {
    let (user_id, family_id) = {
      let state = self.state.borrow();
      match (&state.user_id, state.family_id()) {
        (Some(uid), Some(fid)) => (uid.clone(), fid.to_string()),
        _ => return false,
      }
    };

    if let Err(e) = self.source.leave_family(&user_id, &family_id).await {
      warn!("Failed to leave family {}: {}", family_id, e);
      return false;
    }

    self.cache.invalidate(&family_key(&user_id)).await;
    self.state.send_modify(|s| s.family = None);
    info!("{} left family {}", user_id, family_id);
    true
  }

  fn require_user(&self) -> Result<String> {
    self
      .state
      .borrow()
      .user_id
      .clone()
      .ok_or_else(|| eyre!("No user is signed in"))
  }

  async fn reload_after_join(&self, family_id: &str) -> Result<Family> {
    self
      .load_user_family(true)
      .await
      .ok_or_else(|| eyre!("Failed to load family {} after joining", family_id))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::PersistentCache;
  use crate::model::membership_id;
  use async_trait::async_trait;
  use serde_json::Map;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;

  struct FakeFamilies {
    online: AtomicBool,
    families: Mutex<HashMap<String, Family>>,
    members: Mutex<HashMap<String, FamilyMember>>,
  }

  impl FakeFamilies {
    fn check_online(&self) -> Result<()> {
      if self.online.load(Ordering::SeqCst) {
        Ok(())
      } else {
        Err(eyre!("offline"))
      }
    }
  }

  fn family(id: &str, name: &str) -> Family {
    Family {
      id: id.into(),
      name: name.into(),
      created_by: None,
      extra: Map::new(),
    }
  }

  fn member(user_id: &str, family_id: &str, role: &str) -> FamilyMember {
    FamilyMember {
      family_id: family_id.into(),
      user_id: user_id.into(),
      role: role.into(),
      active: true,
    }
  }

  #[async_trait]
  impl FamilySource for FakeFamilies {
    async fn find_membership(&self, user_id: &str) -> Result<Option<FamilyMember>> {
      self.check_online()?;
      let members = self.members.lock().unwrap();
      Ok(
        members
          .values()
          .find(|m| m.user_id == user_id && m.active)
          .cloned(),
      )
    }

    async fn get_family(&self, family_id: &str) -> Result<Option<Family>> {
      self.check_online()?;
      Ok(self.families.lock().unwrap().get(family_id).cloned())
    }

    async fn create_family(&self, name: &str, created_by: &str) -> Result<String> {
      self.check_online()?;
      let mut families = self.families.lock().unwrap();
      let id = format!("fam{}", families.len() + 1);
      let mut created = family(&id, name);
      created.created_by = Some(created_by.into());
      families.insert(id.clone(), created);
      Ok(id)
    }

    async fn get_membership(&self, user_id: &str, family_id: &str) -> Result<Option<FamilyMember>> {
      self.check_online()?;
      let id = membership_id(user_id, family_id);
      Ok(self.members.lock().unwrap().get(&id).cloned())
    }

    async fn set_membership(&self, member: &FamilyMember) -> Result<()> {
      self.check_online()?;
      let id = membership_id(&member.user_id, &member.family_id);
      self.members.lock().unwrap().insert(id, member.clone());
      Ok(())
    }

    async fn leave_family(&self, user_id: &str, family_id: &str) -> Result<()> {
      self.check_online()?;
      let id = membership_id(user_id, family_id);
      if let Some(m) = self.members.lock().unwrap().get_mut(&id) {
        m.active = false;
      }
      Ok(())
    }
  }

  fn store(online: bool) -> (tempfile::TempDir, Arc<FakeFamilies>, FamilyStore) {
    let dir = tempfile::tempdir().unwrap();
    let cache = PersistentCache::open(Some(&dir.path().join("kv.db")));
    let source = Arc::new(FakeFamilies {
      online: AtomicBool::new(online),
      families: Mutex::new(HashMap::from([("fam1".to_string(), family("fam1", "Whiskers"))])),
      members: Mutex::new(HashMap::from([(
        membership_id("u1", "fam1"),
        member("u1", "fam1", "admin"),
      )])),
    });
    let store = FamilyStore::new(source.clone(), CacheLayer::new(cache), Duration::days(1));
    (dir, source, store)
  }

  #[tokio::test]
  async fn test_signed_out_has_no_family() {
    let (_dir, _source, store) = store(true);
    assert_eq!(store.load_user_family(false).await, None);
  }

  #[tokio::test]
  async fn test_load_notifies_subscribers() {
    let (_dir, _source, store) = store(true);
    let mut rx = store.subscribe();
    store.sign_in("u1");

    let family = store.load_user_family(false).await.unwrap();
    assert_eq!(family.id, "fam1");

    assert!(rx.has_changed().unwrap());
    let state = rx.borrow_and_update().clone();
    assert!(state.has_family());
    assert!(!state.loading);
  }

  #[tokio::test]
  async fn test_user_without_membership() {
    let (_dir, _source, store) = store(true);
    store.sign_in("u2");

    assert_eq!(store.load_user_family(false).await, None);
    assert!(store.snapshot().is_logged_in());
    assert!(!store.snapshot().has_family());
  }

  #[tokio::test]
  async fn test_offline_without_cache_is_none() {
    let (_dir, _source, store) = store(false);
    store.sign_in("u1");

    assert_eq!(store.load_user_family(false).await, None);
  }

  #[tokio::test]
  async fn test_offline_reload_keeps_last_known_family() {
    let (_dir, source, store) = store(true);
    store.sign_in("u1");
    store.load_user_family(false).await.unwrap();

    source.online.store(false, Ordering::SeqCst);
    let family = store.load_user_family(true).await;

    assert_eq!(family.map(|f| f.id), Some("fam1".to_string()));
    assert_eq!(store.snapshot().family_id(), Some("fam1"));
    assert!(!store.snapshot().loading);
  }

  #[tokio::test]
  async fn test_create_family_makes_user_admin() {
    let (_dir, source, store) = store(true);
    store.sign_in("u2");
    let mut rx = store.subscribe();
    rx.borrow_and_update();

    let family = store.create_family("Tabbies").await.unwrap();

    assert_eq!(family.name, "Tabbies");
    assert_eq!(family.created_by.as_deref(), Some("u2"));
    let membership = source.get_membership("u2", &family.id).await.unwrap().unwrap();
    assert_eq!(membership.role, "admin");
    assert!(rx.has_changed().unwrap());
    assert_eq!(store.snapshot().family_id(), Some(family.id.as_str()));
  }

  #[tokio::test]
  async fn test_create_family_needs_a_user() {
    let (_dir, _source, store) = store(true);
    assert!(store.create_family("Tabbies").await.is_err());
  }

  #[tokio::test]
  async fn test_join_family_replaces_cached_no_family() {
    let (_dir, source, store) = store(true);
    store.sign_in("u2");
    assert_eq!(store.load_user_family(false).await, None);

    let family = store.join_family("fam1").await.unwrap();

    assert_eq!(family.id, "fam1");
    let membership = source.get_membership("u2", "fam1").await.unwrap().unwrap();
    assert_eq!(membership.role, "member");
    assert_eq!(
      store.load_user_family(false).await.map(|f| f.id),
      Some("fam1".to_string())
    );
  }

  #[tokio::test]
  async fn test_join_rejects_existing_membership() {
    let (_dir, source, store) = store(true);
    store.sign_in("u1");

    let err = store.join_family("fam1").await.unwrap_err();

    assert!(err.to_string().contains("already a member"));
    assert_eq!(source.members.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_join_unknown_family_fails() {
    let (_dir, source, store) = store(true);
    store.sign_in("u2");

    let err = store.join_family("nope").await.unwrap_err();

    assert!(err.to_string().contains("does not exist"));
    assert!(source.get_membership("u2", "nope").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_leave_family_clears_state_and_cache() {
    let (_dir, source, store) = store(true);
    store.sign_in("u1");
    store.load_user_family(false).await.unwrap();
    let mut rx = store.subscribe();
    rx.borrow_and_update();

    assert!(store.leave_family().await);

    assert!(rx.has_changed().unwrap());
    assert!(!store.snapshot().has_family());
    let membership = source.get_membership("u1", "fam1").await.unwrap().unwrap();
    assert!(!membership.active);
    // A cached family would otherwise come back without a network check
    assert_eq!(store.load_user_family(false).await, None);
  }

  #[tokio::test]
  async fn test_leave_family_offline_keeps_family() {
    let (_dir, source, store) = store(true);
    store.sign_in("u1");
    store.load_user_family(false).await.unwrap();
    source.online.store(false, Ordering::SeqCst);

    assert!(!store.leave_family().await);
    assert_eq!(store.snapshot().family_id(), Some("fam1"));
  }

  #[tokio::test]
  async fn test_leave_without_family_is_false() {
    let (_dir, _source, store) = store(true);
    store.sign_in("u2");
    assert!(!store.leave_family().await);
  }
}
