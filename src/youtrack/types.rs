//! YouTrack entities as returned by the REST API.
//!
//! Every field except `id` is optional because the API only returns the
//! fields named in the `fields` request parameter.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// An entity type the API can return, with the fields requested by default.
pub trait Entity: DeserializeOwned + Send + 'static {
  const DEFAULT_FIELDS: &'static [&'static str];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub login: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub full_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRef {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub short_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub short_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default)]
  pub archived: bool,
}

impl Entity for Project {
  const DEFAULT_FIELDS: &'static [&'static str] =
    &["id", "name", "shortName", "description", "archived"];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default)]
  pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
}

/// A value record referenced by a custom field (a state, a user, a version...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueRecord {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub presentation: Option<String>,
  #[serde(rename = "$type", default, skip_serializing_if = "Option::is_none")]
  pub kind: Option<String>,
}

impl ValueRecord {
  pub fn with_id(id: impl Into<String>) -> Self {
    Self {
      id: Some(id.into()),
      ..Default::default()
    }
  }

  /// Best label for display: name, then presentation, then id.
  pub fn label(&self) -> Option<&str> {
    self
      .name
      .as_deref()
      .or(self.presentation.as_deref())
      .or(self.id.as_deref())
  }
}

/// The content of a custom field slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
  Many(Vec<ValueRecord>),
  One(ValueRecord),
  Scalar(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomField {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(rename = "$type", default, skip_serializing_if = "Option::is_none")]
  pub kind: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value: Option<FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id_readable: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub summary: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub project: Option<ProjectRef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub assignee: Option<User>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reporter: Option<User>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub state: Option<State>,
  #[serde(default)]
  pub tags: Vec<Tag>,
  #[serde(default)]
  pub custom_fields: Vec<CustomField>,
  /// Epoch millis
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub created: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub updated: Option<i64>,
}

impl Entity for Issue {
  const DEFAULT_FIELDS: &'static [&'static str] = &[
    "id",
    "idReadable",
    "summary",
    "description",
    "project(id,name,shortName)",
    "assignee(id,fullName,email)",
    "reporter(id,fullName,email)",
    "state(id,name,resolved)",
    "tags(id,name)",
    "customFields(name,value(presentation,id,name,$type))",
    "created",
    "updated",
  ];
}

impl Issue {
  pub fn custom_field(&self, name: &str) -> Option<&CustomField> {
    self.custom_fields.iter().find(|cf| cf.name == name)
  }

  /// Set a custom field slot, creating it if the issue does not carry it yet.
  pub fn set_custom_field(&mut self, name: &str, value: FieldValue) {
    match self.custom_fields.iter_mut().find(|cf| cf.name == name) {
      Some(slot) => slot.value = Some(value),
      None => self.custom_fields.push(CustomField {
        name: name.to_string(),
        id: None,
        kind: None,
        value: Some(value),
      }),
    }
  }

  /// Name of the workflow state, from the `State` (or `Status`) field.
  pub fn state_name(&self) -> Option<&str> {
    let slot = self
      .custom_field("State")
      .or_else(|| self.custom_field("Status"));
    match slot.and_then(|cf| cf.value.as_ref()) {
      Some(FieldValue::One(record)) => record.label(),
      _ => self.state.as_ref().and_then(|s| s.name.as_deref()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub text: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub author: Option<User>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub created: Option<i64>,
}

impl Entity for Comment {
  const DEFAULT_FIELDS: &'static [&'static str] =
    &["id", "text", "author(id,fullName,email)", "created"];
}

impl Entity for User {
  const DEFAULT_FIELDS: &'static [&'static str] = &["id", "login", "fullName", "email"];
}

/// One entry of an issue's change history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
  pub id: String,
  #[serde(rename = "$type", default, skip_serializing_if = "Option::is_none")]
  pub kind: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub author: Option<User>,
  /// Epoch millis
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timestamp: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target_member: Option<String>,
  /// Shape depends on the category: value records, text, or nothing
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub added: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub removed: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub field: Option<ValueRecord>,
}

impl Entity for Activity {
  const DEFAULT_FIELDS: &'static [&'static str] = &[
    "id",
    "$type",
    "author(id,login,fullName)",
    "timestamp",
    "targetMember",
    "added(id,name,presentation)",
    "removed(id,name,presentation)",
    "field(id,name)",
  ];
}

/// Project-level custom field definition (e.g. the `State` bundle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCustomField {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub field: Option<ValueRecord>,
  #[serde(default)]
  pub can_be_empty: bool,
}

impl Entity for ProjectCustomField {
  const DEFAULT_FIELDS: &'static [&'static str] =
    &["id", "field(id,name,$type)", "canBeEmpty"];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sprint {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub goal: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finish: Option<i64>,
  #[serde(default)]
  pub archived: bool,
}

impl Entity for Sprint {
  const DEFAULT_FIELDS: &'static [&'static str] =
    &["id", "name", "goal", "start", "finish", "archived"];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgileBoard {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default)]
  pub projects: Vec<ProjectRef>,
}

impl Entity for AgileBoard {
  const DEFAULT_FIELDS: &'static [&'static str] = &["id", "name", "projects(id,name,shortName)"];
}

/// A page of results. The API returns bare arrays, so `total` is only known
/// when the server sent `X-Total-Count`, and `top`/`skip` echo the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
  pub data: Vec<T>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub total: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub skip: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub top: Option<u32>,
}

impl<T> PaginatedResponse<T> {
  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_custom_field_shapes() {
    let issue: Issue = serde_json::from_value(json!({
      "id": "2-17",
      "idReadable": "DEMO-17",
      "customFields": [
        {"name": "State", "value": {"id": "s1", "name": "Open", "$type": "StateBundleElement"}},
        {"name": "Subsystems", "value": [{"name": "ui"}, {"name": "sdk"}]},
        {"name": "Estimation", "value": 3},
        {"name": "Assignee", "value": null}
      ]
    }))
    .unwrap();

    assert_eq!(issue.state_name(), Some("Open"));
    assert!(matches!(
      issue.custom_field("Subsystems").unwrap().value,
      Some(FieldValue::Many(ref v)) if v.len() == 2
    ));
    assert_eq!(
      issue.custom_field("Estimation").unwrap().value,
      Some(FieldValue::Scalar(json!(3)))
    );
    assert_eq!(issue.custom_field("Assignee").unwrap().value, None);
  }

  #[test]
  fn test_set_custom_field_creates_missing_slot() {
    let mut issue: Issue = serde_json::from_value(json!({"id": "2-1"})).unwrap();
    issue.set_custom_field("Priority", FieldValue::One(ValueRecord::with_id("p1")));
    assert_eq!(issue.custom_fields.len(), 1);
    assert_eq!(issue.custom_fields[0].name, "Priority");
  }

  #[test]
  fn test_value_record_serializes_sparse() {
    let value = serde_json::to_value(FieldValue::One(ValueRecord::with_id("s2"))).unwrap();
    assert_eq!(value, json!({"id": "s2"}));
  }
}
