use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use super::value::{encode_fields, timestamp_now, Document};
use crate::config::FirebaseConfig;
use crate::model::{membership_id, Family, FamilyMember, Pet, PetDraft};
use crate::store::{FamilySource, PetSource};

const API_BASE: &str = "https://firestore.googleapis.com/v1";

/// One element of a `runQuery` response stream.
#[derive(Debug, Deserialize)]
struct RunQueryItem {
  document: Option<Document>,
}

/// Firestore REST client
#[derive(Clone)]
pub struct FirestoreClient {
  http: reqwest::Client,
  /// `projects/{project}/databases/{database}/documents`
  root: String,
  id_token: Option<String>,
}

impl FirestoreClient {
  pub fn new(config: &FirebaseConfig) -> Result<Self> {
    let http = reqwest::Client::builder()
      .user_agent(concat!("meowlog/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      root: format!(
        "projects/{}/databases/{}/documents",
        config.project_id, config.database
      ),
      id_token: FirebaseConfig::get_id_token(),
    })
  }

  fn url(&self, path: &str) -> String {
    format!("{}/{}{}", API_BASE, self.root, path)
  }

  fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match &self.id_token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  /// Run a structured query against a top-level collection.
  async fn run_query(&self, collection: &str, filter: Value, limit: Option<u32>) -> Result<Vec<Document>> {
    let mut query = json!({
      "from": [{ "collectionId": collection }],
      "where": filter,
    });
    if let Some(limit) = limit {
      query["limit"] = json!(limit);
    }

    let response = self
      .authorize(self.http.post(self.url(":runQuery")))
      .json(&json!({ "structuredQuery": query }))
      .send()
      .await
      .map_err(|e| eyre!("Failed to query {}: {}", collection, e))?;

    let items: Vec<RunQueryItem> = check(response, collection)
      .await?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {} query response: {}", collection, e))?;

    Ok(items.into_iter().filter_map(|item| item.document).collect())
  }

  /// Fetch a document, `None` on 404.
  async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>> {
    let path = format!("/{}/{}", collection, id);
    let response = self
      .authorize(self.http.get(self.url(&path)))
      .send()
      .await
      .map_err(|e| eyre!("Failed to get {}: {}", path, e))?;

    if response.status() == StatusCode::NOT_FOUND {
      return Ok(None);
    }

    let doc = check(response, &path)
      .await?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {}: {}", path, e))?;
    Ok(Some(doc))
  }

  /// Create a document with a generated id and return that id.
  async fn create_document(&self, collection: &str, fields: Map<String, Value>) -> Result<String> {
    let path = format!("/{}", collection);
    let response = self
      .authorize(self.http.post(self.url(&path)))
      .json(&json!({ "fields": fields }))
      .send()
      .await
      .map_err(|e| eyre!("Failed to create {} document: {}", collection, e))?;

    let doc: Document = check(response, collection)
      .await?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse created {} document: {}", collection, e))?;

    Ok(doc.id().to_string())
  }

  /// Write already-encoded fields to `collection/id`.
  async fn patch_document(
    &self,
    collection: &str,
    id: &str,
    fields: Map<String, Value>,
    mode: Patch,
  ) -> Result<()> {
    let path = format!("/{}/{}", collection, id);
    let mut request = self.authorize(self.http.patch(self.url(&path)));
    if mode != Patch::Replace {
      let mask: Vec<(&str, &str)> = fields
        .keys()
        .map(|k| ("updateMask.fieldPaths", k.as_str()))
        .collect();
      request = request.query(&mask);
    }
    if mode == Patch::Merge {
      request = request.query(&[("currentDocument.exists", "true")]);
    }

    let response = request
      .json(&json!({ "fields": fields }))
      .send()
      .await
      .map_err(|e| eyre!("Failed to write {}: {}", path, e))?;

    check(response, &path).await?;
    Ok(())
  }
}

/// How a PATCH treats fields that are not in the request.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Patch {
  /// Update only the given fields of an existing document
  Merge,
  /// Update only the given fields, creating the document if needed
  MergeOrCreate,
  /// Replace the whole document, creating it if needed
  Replace,
}

/// Turn a non-success status into an error carrying the response body.
async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let body = response.text().await.unwrap_or_default();
  Err(eyre!("Firestore request for {} failed ({}): {}", what, status, body))
}

fn field_equals(field: &str, value: Value) -> Value {
  json!({
    "fieldFilter": {
      "field": { "fieldPath": field },
      "op": "EQUAL",
      "value": value,
    }
  })
}

fn decode_doc<T: serde::de::DeserializeOwned>(doc: Document) -> Result<T> {
  let id = doc.id().to_string();
  serde_json::from_value(Value::Object(doc.into_record()))
    .map_err(|e| eyre!("Failed to parse document {}: {}", id, e))
}

/// Decode a query result, skipping documents that do not parse.
fn decode_docs<T: serde::de::DeserializeOwned>(docs: Vec<Document>) -> Vec<T> {
  docs
    .into_iter()
    .filter_map(|doc| {
      decode_doc(doc)
        .map_err(|e| warn!("Skipping document: {}", e))
        .ok()
    })
    .collect()
}

#[async_trait]
impl PetSource for FirestoreClient {
  async fn list_family_pets(&self, family_id: &str) -> Result<Vec<Pet>> {
    let filter = field_equals("familyId", json!({ "stringValue": family_id }));
    Ok(decode_docs(self.run_query("pets", filter, None).await?))
  }

  async fn get_pet(&self, pet_id: &str) -> Result<Option<Pet>> {
    self.get_document("pets", pet_id).await?.map(decode_doc).transpose()
  }

  async fn add_pet(&self, family_id: &str, created_by: &str, draft: &PetDraft) -> Result<String> {
    let record = match serde_json::to_value(draft)
      .map_err(|e| eyre!("Failed to serialize pet: {}", e))?
    {
      Value::Object(map) => map,
      _ => return Err(eyre!("Pet draft did not serialize to an object")),
    };

    let mut fields = encode_fields(&record);
    fields.insert("familyId".into(), json!({ "stringValue": family_id }));
    fields.insert("createdBy".into(), json!({ "stringValue": created_by }));
    fields.insert("createdAt".into(), timestamp_now());
    fields.insert("updatedAt".into(), timestamp_now());

    self.create_document("pets", fields).await
  }

  async fn update_pet(&self, pet_id: &str, fields: &Map<String, Value>) -> Result<()> {
    let mut encoded = encode_fields(fields);
    encoded.insert("updatedAt".into(), timestamp_now());
    self.patch_document("pets", pet_id, encoded, Patch::Merge).await
  }

  async fn delete_pet(&self, pet_id: &str) -> Result<()> {
    let path = format!("/pets/{}", pet_id);
    let response = self
      .authorize(self.http.delete(self.url(&path)))
      .send()
      .await
      .map_err(|e| eyre!("Failed to delete pet {}: {}", pet_id, e))?;

    check(response, &path).await?;
    Ok(())
  }
}

#[async_trait]
impl FamilySource for FirestoreClient {
  async fn find_membership(&self, user_id: &str) -> Result<Option<FamilyMember>> {
    let filter = json!({
      "compositeFilter": {
        "op": "AND",
        "filters": [
          field_equals("userId", json!({ "stringValue": user_id })),
          {
            "fieldFilter": {
              "field": { "fieldPath": "active" },
              "op": "NOT_EQUAL",
              "value": { "booleanValue": false },
            }
          }
        ]
      }
    });

    let docs = self.run_query("familyMembers", filter, Some(1)).await?;
    docs.into_iter().next().map(decode_doc).transpose()
  }

  async fn get_family(&self, family_id: &str) -> Result<Option<Family>> {
    self
      .get_document("families", family_id)
      .await?
      .map(decode_doc)
      .transpose()
  }

  async fn create_family(&self, name: &str, created_by: &str) -> Result<String> {
    let mut fields = Map::new();
    fields.insert("name".into(), json!({ "stringValue": name }));
    fields.insert("createdBy".into(), json!({ "stringValue": created_by }));
    fields.insert("createdAt".into(), timestamp_now());
    self.create_document("families", fields).await
  }

  async fn get_membership(&self, user_id: &str, family_id: &str) -> Result<Option<FamilyMember>> {
    self
      .get_document("familyMembers", &membership_id(user_id, family_id))
      .await?
      .map(decode_doc)
      .transpose()
  }

  async fn set_membership(&self, member: &FamilyMember) -> Result<()> {
    let mut fields = match serde_json::to_value(member)
      .map_err(|e| eyre!("Failed to serialize membership: {}", e))?
    {
      Value::Object(map) => encode_fields(&map),
      _ => return Err(eyre!("Membership did not serialize to an object")),
    };
    fields.insert("joinedAt".into(), timestamp_now());

    let id = membership_id(&member.user_id, &member.family_id);
    self.patch_document("familyMembers", &id, fields, Patch::Replace).await
  }

  async fn leave_family(&self, user_id: &str, family_id: &str) -> Result<()> {
    let mut fields = Map::new();
    fields.insert("familyId".into(), json!({ "stringValue": family_id }));
    fields.insert("userId".into(), json!({ "stringValue": user_id }));
    fields.insert("active".into(), json!({ "booleanValue": false }));
    fields.insert("leftAt".into(), timestamp_now());

    let id = membership_id(user_id, family_id);
    self
      .patch_document("familyMembers", &id, fields, Patch::MergeOrCreate)
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn doc(id: &str, fields: Value) -> Document {
    serde_json::from_value(json!({
      "name": format!("projects/p/databases/(default)/documents/pets/{}", id),
      "fields": fields,
    }))
    .unwrap()
  }

  #[test]
  fn test_unparseable_documents_are_skipped() {
    let docs = vec![
      doc("p1", json!({ "name": { "stringValue": "Mochi" } })),
      doc("p2", json!({ "name": { "arrayValue": { "values": [] } } })),
      doc("p3", json!({ "name": { "stringValue": "Tofu" }, "age": { "doubleValue": 2.5 } })),
    ];

    let pets: Vec<Pet> = decode_docs(docs);

    let names: Vec<&str> = pets.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Mochi", "Tofu"]);
    assert_eq!(pets[1].age, Some(2));
  }
}
