//! Request parameter composition and pagination reconstruction.

use reqwest::header::HeaderMap;
use serde_json::Value;

use super::types::{Entity, PaginatedResponse};

pub const TOTAL_COUNT_HEADER: &str = "x-total-count";

/// Which fields to ask the API for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Fields {
  /// The entity type's baseline set
  #[default]
  Default,
  List(Vec<String>),
  /// A pre-joined selection, passed through untouched
  Raw(String),
}

impl Fields {
  pub fn list<I, S>(fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Fields::List(fields.into_iter().map(Into::into).collect())
  }

  fn resolve<E: Entity>(&self) -> String {
    match self {
      Fields::Default => E::DEFAULT_FIELDS.join(","),
      Fields::List(list) => list.join(","),
      Fields::Raw(raw) => raw.clone(),
    }
  }
}

/// Options for list and search endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
  pub fields: Fields,
  pub top: Option<u32>,
  pub skip: Option<u32>,
}

impl SearchOptions {
  pub fn page(top: u32) -> Self {
    Self {
      top: Some(top),
      ..Default::default()
    }
  }
}

/// Ordered query parameters with unique keys. Setting a key twice replaces
/// the earlier value in place; `None` values are left out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryBuilder {
  params: Vec<(String, String)>,
}

impl QueryBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Parameters for a list/search endpoint returning `E`.
  pub fn for_entity<E: Entity>(query: Option<&str>, options: &SearchOptions) -> Self {
    Self::new()
      .query(query)
      .fields::<E>(&options.fields)
      .top(options.top)
      .skip(options.skip)
  }

  pub fn set(mut self, key: &str, value: Option<String>) -> Self {
    let Some(value) = value else {
      return self;
    };
    match self.params.iter_mut().find(|(k, _)| k == key) {
      Some(slot) => slot.1 = value,
      None => self.params.push((key.to_string(), value)),
    }
    self
  }

  pub fn query(self, query: Option<&str>) -> Self {
    self.set("query", query.map(String::from))
  }

  pub fn fields<E: Entity>(self, fields: &Fields) -> Self {
    let resolved = fields.resolve::<E>();
    self.set("fields", Some(resolved).filter(|f| !f.is_empty()))
  }

  pub fn top(self, top: Option<u32>) -> Self {
    self.set("$top", top.map(|t| t.to_string()))
  }

  pub fn skip(self, skip: Option<u32>) -> Self {
    self.set("$skip", skip.map(|s| s.to_string()))
  }

  pub fn build(self) -> Vec<(String, String)> {
    self.params
  }
}

/// Read `X-Total-Count`. Missing or unparseable means unknown, not zero.
pub fn total_count(headers: &HeaderMap) -> Option<u64> {
  headers
    .get(TOTAL_COUNT_HEADER)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse().ok())
}

/// Rebuild a page from a bare array body. A non-array body yields an empty
/// page and records that fail to decode are skipped; `top` and `skip` are
/// echoed from the request.
pub fn paginate<T: Entity>(
  body: Value,
  headers: &HeaderMap,
  options: &SearchOptions,
) -> PaginatedResponse<T> {
  let data = match body {
    Value::Array(items) => items
      .into_iter()
      .enumerate()
      .filter_map(|(index, item)| match serde_json::from_value(item) {
        Ok(record) => Some(record),
        Err(e) => {
          tracing::warn!(index, error = %e, "skipping undecodable record");
          None
        }
      })
      .collect(),
    _ => Vec::new(),
  };

  PaginatedResponse {
    data,
    total: total_count(headers),
    skip: options.skip,
    top: options.top,
  }
}
