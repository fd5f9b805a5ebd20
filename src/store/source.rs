//! Remote data sources the stores read from and write to.

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::{Map, Value};

use crate::model::{Family, FamilyMember, Pet, PetDraft};

/// Authoritative storage for pet documents.
#[async_trait]
pub trait PetSource: Send + Sync {
  /// All pets belonging to a family.
  async fn list_family_pets(&self, family_id: &str) -> Result<Vec<Pet>>;

  /// A single pet, `None` if the document does not exist.
  async fn get_pet(&self, pet_id: &str) -> Result<Option<Pet>>;

  /// Create a pet and return its new id. Sets `createdAt`/`updatedAt`.
  async fn add_pet(&self, family_id: &str, created_by: &str, draft: &PetDraft) -> Result<String>;

  /// Merge `fields` into an existing pet. Sets `updatedAt`.
  async fn update_pet(&self, pet_id: &str, fields: &Map<String, Value>) -> Result<()>;

  async fn delete_pet(&self, pet_id: &str) -> Result<()>;
}

/// Authoritative storage for families and memberships.
#[async_trait]
pub trait FamilySource: Send + Sync {
  /// The first active membership of a user.
  async fn find_membership(&self, user_id: &str) -> Result<Option<FamilyMember>>;

  async fn get_family(&self, family_id: &str) -> Result<Option<Family>>;

  /// Create a family and return its new id.
  async fn create_family(&self, name: &str, created_by: &str) -> Result<String>;

  /// The membership of `user_id` in `family_id`, active or not.
  async fn get_membership(&self, user_id: &str, family_id: &str) -> Result<Option<FamilyMember>>;

  /// Write a membership document, replacing any previous one. Sets `joinedAt`.
  async fn set_membership(&self, member: &FamilyMember) -> Result<()>;

  /// Mark a membership inactive, keeping the document. Sets `leftAt`.
  async fn leave_family(&self, user_id: &str, family_id: &str) -> Result<()>;
}
