//! Plain records for the pet tracker's documents.

use chrono::{DateTime, Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::cache::Entity;

/// A pet document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pet {
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub family_id: Option<String>,
  /// `YYYY-MM-DD`
  #[serde(
    default,
    skip_serializing_if = "Option::is_none",
    deserialize_with = "lenient_date"
  )]
  pub birth_date: Option<String>,
  #[serde(
    default,
    skip_serializing_if = "Option::is_none",
    deserialize_with = "lenient_age"
  )]
  pub age: Option<i32>,
  /// Every other field of the document (species, weight, timestamps, ...)
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Entity for Pet {
  fn entity_id(&self) -> &str {
    &self.id
  }
}

impl Pet {
  /// Older documents only carry `age`. Estimate a birth date from it so the
  /// age keeps moving. Returns the estimate when one was filled in.
  pub fn backfill_birth_date(&mut self, today: NaiveDate) -> Option<String> {
    if self.birth_date.is_some() {
      return None;
    }
    let estimate = estimate_birth_date(self.age?, today).format("%Y-%m-%d").to_string();
    self.birth_date = Some(estimate.clone());
    Some(estimate)
  }
}

/// Fields for a pet that does not exist yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PetDraft {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub birth_date: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub age: Option<i32>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// A family that shares pets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Family {
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub created_by: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Membership of a user in a family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyMember {
  pub family_id: String,
  pub user_id: String,
  #[serde(default)]
  pub role: String,
  #[serde(default = "default_active")]
  pub active: bool,
}

/// Whole years from an integer, a float, or a numeric string. Anything else
/// reads as unknown.
fn lenient_age<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i32>, D::Error> {
  let years = match Option::<Value>::deserialize(deserializer)? {
    Some(Value::Number(n)) => n.as_f64(),
    Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
    _ => None,
  };
  Ok(
    years
      .filter(|y| y.is_finite())
      .and_then(|y| i32::try_from(y.trunc() as i64).ok()),
  )
}

/// A date string as-is, or epoch millis (a decoded timestamp) as `YYYY-MM-DD`.
fn lenient_date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
  Ok(match Option::<Value>::deserialize(deserializer)? {
    Some(Value::String(s)) => Some(s),
    Some(Value::Number(n)) => n
      .as_i64()
      .and_then(DateTime::from_timestamp_millis)
      .map(|dt| dt.format("%Y-%m-%d").to_string()),
    _ => None,
  })
}

/// Document id of a membership: one per user and family.
pub fn membership_id(user_id: &str, family_id: &str) -> String {
  format!("{}_{}", user_id, family_id)
}

fn default_active() -> bool {
  true
}

/// Whole years between `birth_date` and `today`.
pub fn calculate_age(birth_date: NaiveDate, today: NaiveDate) -> i32 {
  let mut age = today.year() - birth_date.year();
  if (today.month(), today.day()) < (birth_date.month(), birth_date.day()) {
    age -= 1;
  }
  age
}

/// Parse a `YYYY-MM-DD` (or full RFC 3339) date and compute the age.
pub fn age_from_str(birth_date: &str, today: NaiveDate) -> Option<i32> {
  let date = NaiveDate::parse_from_str(birth_date, "%Y-%m-%d")
    .ok()
    .or_else(|| {
      chrono::DateTime::parse_from_rfc3339(birth_date)
        .ok()
        .map(|dt| dt.date_naive())
    })?;
  Some(calculate_age(date, today))
}

/// Same calendar day `age` years ago. Feb 29 in a non-leap year rolls to Mar 1.
pub fn estimate_birth_date(age: i32, today: NaiveDate) -> NaiveDate {
  let year = today.year() - age;
  NaiveDate::from_ymd_opt(year, today.month(), today.day())
    .or_else(|| NaiveDate::from_ymd_opt(year, 3, 1))
    .unwrap_or(today)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
  }

  #[test]
  fn test_membership_id() {
    assert_eq!(membership_id("u1", "fam1"), "u1_fam1");
  }

  #[test]
  fn test_age_before_and_after_birthday() {
    assert_eq!(calculate_age(date(2020, 6, 15), date(2024, 6, 14)), 3);
    assert_eq!(calculate_age(date(2020, 6, 15), date(2024, 6, 15)), 4);
    assert_eq!(calculate_age(date(2020, 6, 15), date(2024, 12, 1)), 4);
  }

  #[test]
  fn test_age_from_str() {
    assert_eq!(age_from_str("2019-01-02", date(2024, 1, 1)), Some(4));
    assert_eq!(age_from_str("2019-01-02T00:00:00Z", date(2024, 1, 2)), Some(5));
    assert_eq!(age_from_str("yesterday", date(2024, 1, 1)), None);
  }

  #[test]
  fn test_estimate_birth_date_leap_day() {
    assert_eq!(estimate_birth_date(1, date(2024, 2, 29)), date(2023, 3, 1));
    assert_eq!(estimate_birth_date(3, date(2024, 5, 10)), date(2021, 5, 10));
  }

  #[test]
  fn test_backfill_only_when_missing() {
    let mut pet: Pet = serde_json::from_value(json!({ "id": "p1", "name": "Mochi", "age": 2 })).unwrap();
    assert_eq!(pet.backfill_birth_date(date(2024, 5, 10)).as_deref(), Some("2022-05-10"));
    assert_eq!(pet.backfill_birth_date(date(2024, 5, 10)), None);
  }

  #[test]
  fn test_unknown_fields_round_trip() {
    let raw = json!({ "id": "p1", "name": "Mochi", "species": "cat", "weights": [4.1, 4.3] });
    let pet: Pet = serde_json::from_value(raw.clone()).unwrap();

    assert_eq!(pet.extra.get("species"), Some(&json!("cat")));
    assert_eq!(serde_json::to_value(&pet).unwrap(), raw);
  }

  #[test]
  fn test_loosely_typed_age_and_birth_date() {
    let pet: Pet = serde_json::from_value(json!({ "id": "p1", "age": 2.5 })).unwrap();
    assert_eq!(pet.age, Some(2));

    let pet: Pet = serde_json::from_value(json!({ "id": "p1", "age": " 3 " })).unwrap();
    assert_eq!(pet.age, Some(3));

    let pet: Pet = serde_json::from_value(json!({ "id": "p1", "age": "old", "birthDate": null })).unwrap();
    assert_eq!(pet.age, None);
    assert_eq!(pet.birth_date, None);

    // 2021-03-04T12:00:00Z
    let pet: Pet = serde_json::from_value(json!({ "id": "p1", "birthDate": 1_614_859_200_000_i64 })).unwrap();
    assert_eq!(pet.birth_date.as_deref(), Some("2021-03-04"));
  }
}
