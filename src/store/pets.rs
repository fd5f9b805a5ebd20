//! The family's pets, read through the persistent cache.

use chrono::{Duration, Local, NaiveDate};
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::family::SessionState;
use super::source::PetSource;
use crate::cache::{CacheLayer, CacheSource, Entity, ReadOptions};
use crate::model::{age_from_str, Pet, PetDraft};

/// Pets currently loaded for the signed-in family.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PetState {
  pub pets: Vec<Pet>,
  pub loading: bool,
  /// Where the last list load was served from
  pub source: Option<CacheSource>,
}

fn pets_key(family_id: &str) -> String {
  format!("pets:{}", family_id)
}

fn today() -> NaiveDate {
  Local::now().date_naive()
}

/// Owns the pet state and notifies subscribers whenever it changes.
pub struct PetStore {
  source: Arc<dyn PetSource>,
  cache: CacheLayer,
  max_age: Duration,
  session: watch::Receiver<SessionState>,
  state: watch::Sender<PetState>,
}

impl PetStore {
  pub fn new(
    source: Arc<dyn PetSource>,
    cache: CacheLayer,
    max_age: Duration,
    session: watch::Receiver<SessionState>,
  ) -> Self {
    let (state, _) = watch::channel(PetState::default());
    Self {
      source,
      cache,
      max_age,
      session,
      state,
    }
  }

  /// Receive every future change of the pet list.
  pub fn subscribe(&self) -> watch::Receiver<PetState> {
    self.state.subscribe()
  }

  pub fn snapshot(&self) -> PetState {
    self.state.borrow().clone()
  }

  fn family_id(&self) -> Option<String> {
    self.session.borrow().family_id().map(String::from)
  }

  fn user_id(&self) -> Option<String> {
    self.session.borrow().user_id.clone()
  }

  /// Load the family's pets.
  ///
  /// Served from cache when fresh (and refreshed in the background), else
  /// from the remote. Never fails: without a family, or when the remote is
  /// down and nothing is known, the list is empty.
  pub async fn fetch_family_pets(&self, force_refresh: bool) -> Vec<Pet> {
    let Some(family_id) = self.family_id() else {
      return Vec::new();
    };

    let last_known = self.state.borrow().pets.clone();
    self.state.send_modify(|s| s.loading = true);

    let source = Arc::clone(&self.source);
    let fid = family_id.clone();
    let result = self
      .cache
      .fetch(
        &pets_key(&family_id),
        ReadOptions::max_age(self.max_age).refresh(force_refresh),
        last_known,
        move || async move {
          let mut pets = source.list_family_pets(&fid).await?;
          backfill_birth_dates(&source, &mut pets, today());
          Ok(pets)
        },
      )
      .await;

    info!(
      "Loaded {} pets for family {} from {:?}",
      result.data.len(),
      family_id,
      result.source
    );

    let pets = result.data;
    self.state.send_modify(|s| {
      s.pets = pets.clone();
      s.loading = false;
      s.source = Some(result.source);
    });
    pets
  }

  /// Look up one pet.
  ///
  /// Tries the loaded list, then the cached list, then the remote document.
  /// A pet from another family is treated as missing.
  pub async fn get_pet_by_id(&self, pet_id: &str, force_refresh: bool) -> Option<Pet> {
    if !force_refresh {
      if let Some(pet) = self.find_loaded(pet_id) {
        return Some(pet);
      }
      let nothing_loaded = self.state.borrow().pets.is_empty();
      if nothing_loaded && self.hydrate_from_cache().await {
        if let Some(pet) = self.find_loaded(pet_id) {
          return Some(pet);
        }
      }
    }

    let (Some(_), Some(family_id)) = (self.user_id(), self.family_id()) else {
      return None;
    };

    let pet = match self.source.get_pet(pet_id).await {
      Ok(Some(pet)) if pet.family_id.as_deref() == Some(family_id.as_str()) => pet,
      Ok(_) => return None,
      Err(e) => {
        warn!("Failed to get pet {}: {}", pet_id, e);
        return None;
      }
    };

    if force_refresh {
      self.state.send_if_modified(|s| {
        match s.pets.iter_mut().find(|p| p.entity_id() == pet_id) {
          Some(existing) => {
            *existing = pet.clone();
            true
          }
          None => false,
        }
      });
    }

    Some(pet)
  }

  fn find_loaded(&self, pet_id: &str) -> Option<Pet> {
    self
      .state
      .borrow()
      .pets
      .iter()
      .find(|p| p.entity_id() == pet_id)
      .cloned()
  }

  /// Fill the in-memory list from the persistent cache. Returns whether
  /// anything was loaded.
  async fn hydrate_from_cache(&self) -> bool {
    let Some(family_id) = self.family_id() else {
      return false;
    };
    match self
      .cache
      .peek::<Vec<Pet>>(&pets_key(&family_id), Some(self.max_age))
      .await
    {
      Some(pets) => {
        debug!("Hydrated {} pets from cache", pets.len());
        self.state.send_modify(|s| s.pets = pets);
        true
      }
      None => false,
    }
  }

  /// Create a pet in the current family.
  pub async fn add_pet(&self, mut draft: PetDraft) -> Result<Pet> {
    let (Some(user_id), Some(family_id)) = (self.user_id(), self.family_id()) else {
      return Err(eyre!("You need to join or create a family first"));
    };

    if draft.age.is_none() {
      draft.age = draft
        .birth_date
        .as_deref()
        .and_then(|b| age_from_str(b, today()));
    }

    let id = self.source.add_pet(&family_id, &user_id, &draft).await?;

    let mut extra = draft.extra;
    extra.insert("createdBy".into(), Value::String(user_id));
    let pet = Pet {
      id,
      name: draft.name,
      family_id: Some(family_id.clone()),
      birth_date: draft.birth_date,
      age: draft.age,
      extra,
    };

    self.state.send_modify(|s| s.pets.push(pet.clone()));
    self.write_through(&family_id).await;
    Ok(pet)
  }

  /// Merge `changes` into a pet. Returns whether the remote accepted it.
  pub async fn update_pet(&self, pet_id: &str, mut changes: Map<String, Value>) -> bool {
    if !changes.contains_key("age") {
      if let Some(age) = changes
        .get("birthDate")
        .and_then(Value::as_str)
        .and_then(|b| age_from_str(b, today()))
      {
        changes.insert("age".into(), Value::from(age));
      }
    }

    if let Err(e) = self.source.update_pet(pet_id, &changes).await {
      warn!("Failed to update pet {}: {}", pet_id, e);
      return false;
    }

    let changed = self.state.send_if_modified(|s| {
      let Some(index) = s.pets.iter().position(|p| p.entity_id() == pet_id) else {
        return false;
      };
      match merge(&s.pets[index], &changes) {
        Ok(updated) => {
          s.pets[index] = updated;
          true
        }
        Err(e) => {
          warn!("Updated pet {} no longer parses locally: {}", pet_id, e);
          false
        }
      }
    });

    if changed {
      if let Some(family_id) = self.family_id() {
        self.write_through(&family_id).await;
      }
    }
    true
  }

  /// Delete a pet. Returns whether the remote accepted it.
  pub async fn delete_pet(&self, pet_id: &str) -> bool {
    if let Err(e) = self.source.delete_pet(pet_id).await {
      warn!("Failed to delete pet {}: {}", pet_id, e);
      return false;
    }

    self.state.send_if_modified(|s| {
      let before = s.pets.len();
      s.pets.retain(|p| p.entity_id() != pet_id);
      s.pets.len() != before
    });

    if let Some(family_id) = self.family_id() {
      self.write_through(&family_id).await;
    }
    true
  }

  /// Drop the cached list so the next load goes to the remote.
  pub async fn invalidate(&self) -> bool {
    match self.family_id() {
      Some(family_id) => self.cache.invalidate(&pets_key(&family_id)).await,
      None => false,
    }
  }

  /// Keep the cached list in step with a local mutation.
  async fn write_through(&self, family_id: &str) {
    let pets = self.state.borrow().pets.clone();
    let key = pets_key(family_id);
    if pets.is_empty() {
      self.cache.invalidate(&key).await;
    } else {
      self.cache.store(&key, &pets).await;
    }
  }
}

/// Shallow-merge `changes` into a pet's JSON form.
fn merge(pet: &Pet, changes: &Map<String, Value>) -> Result<Pet> {
  let mut record = match serde_json::to_value(pet)? {
    Value::Object(map) => map,
    _ => return Err(eyre!("Pet did not serialize to an object")),
  };
  for (k, v) in changes {
    record.insert(k.clone(), v.clone());
  }
  // The id is not a field of the document
  record.insert("id".into(), Value::String(pet.id.clone()));
  Ok(serde_json::from_value(Value::Object(record))?)
}

/// Give age-only documents an estimated birth date and persist it in the
/// background. The write-back is best-effort and never awaited.
fn backfill_birth_dates(source: &Arc<dyn PetSource>, pets: &mut [Pet], today: NaiveDate) {
  for pet in pets.iter_mut() {
    let Some(birth_date) = pet.backfill_birth_date(today) else {
      continue;
    };
    let source = Arc::clone(source);
    let pet_id = pet.id.clone();
    tokio::spawn(async move {
      let mut fields = Map::new();
      fields.insert("birthDate".into(), Value::String(birth_date));
      if let Err(e) = source.update_pet(&pet_id, &fields).await {
        warn!("Failed to backfill birth date for {}: {}", pet_id, e);
      }
    });
  }
}
