//! Documents, identifiers and revision tokens.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const ID_FIELD: &str = "_id";
pub const TYPE_FIELD: &str = "_type";
pub const REVISION_FIELD: &str = "_rev";
pub const CREATED_AT_FIELD: &str = "_createdAt";
pub const UPDATED_AT_FIELD: &str = "_updatedAt";
pub const KEY_FIELD: &str = "_key";

/// Fields owned by the store. Patches may not write them.
pub const RESERVED_FIELDS: [&str; 5] = [
  ID_FIELD,
  TYPE_FIELD,
  REVISION_FIELD,
  CREATED_AT_FIELD,
  UPDATED_AT_FIELD,
];

const MAX_ID_LEN: usize = 128;

/// A stored document: a JSON object with a handful of reserved fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
  /// Start a document of the given type. The id is left for the store to assign.
  pub fn new(doc_type: impl Into<String>) -> Self {
    let mut fields = Map::new();
    fields.insert(TYPE_FIELD.to_string(), Value::String(doc_type.into()));
    Self(fields)
  }

  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.0.insert(ID_FIELD.to_string(), Value::String(id.into()));
    self
  }

  pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.0.insert(name.into(), value.into());
    self
  }

  pub fn id(&self) -> Option<&str> {
    self.0.get(ID_FIELD).and_then(Value::as_str)
  }

  pub fn doc_type(&self) -> Option<&str> {
    self.0.get(TYPE_FIELD).and_then(Value::as_str)
  }

  pub fn revision(&self) -> Option<&str> {
    self.0.get(REVISION_FIELD).and_then(Value::as_str)
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.0.get(field)
  }

  pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
    self.0.insert(field.into(), value.into())
  }

  pub fn remove(&mut self, field: &str) -> Option<Value> {
    self.0.remove(field)
  }

  pub fn fields(&self) -> &Map<String, Value> {
    &self.0
  }

  pub fn fields_mut(&mut self) -> &mut Map<String, Value> {
    &mut self.0
  }

  pub fn into_value(self) -> Value {
    Value::Object(self.0)
  }

  /// Deserialize the document into a caller type.
  pub fn decode<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
    Ok(serde_json::from_value(Value::Object(self.0.clone()))?)
  }
}

impl From<Map<String, Value>> for Document {
  fn from(fields: Map<String, Value>) -> Self {
    Self(fields)
  }
}

impl TryFrom<Value> for Document {
  type Error = crate::Error;

  fn try_from(value: Value) -> Result<Self, Self::Error> {
    match value {
      Value::Object(fields) => Ok(Self(fields)),
      other => Err(crate::Error::Serialization(format!(
        "document must be a JSON object, got {}",
        other
      ))),
    }
  }
}

impl From<Document> for Value {
  fn from(doc: Document) -> Self {
    doc.into_value()
  }
}

fn id_pattern() -> &'static Regex {
  static PATTERN: OnceLock<Regex> = OnceLock::new();
  PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*$").expect("valid id pattern"))
}

/// Check a document id against the accepted id syntax.
pub fn validate_id(id: &str) -> Result<(), String> {
  if id.is_empty() {
    return Err("document id must not be empty".to_string());
  }
  if id.len() > MAX_ID_LEN {
    return Err(format!("document id exceeds {} characters", MAX_ID_LEN));
  }
  if !id_pattern().is_match(id) {
    return Err(format!("document id {:?} contains invalid characters", id));
  }
  Ok(())
}

/// Generate a fresh document id.
pub fn generate_id() -> String {
  Uuid::new_v4().simple().to_string()
}

/// Generate a key for an array element, unique with overwhelming probability.
pub fn generate_key() -> String {
  let mut key = Uuid::new_v4().simple().to_string();
  key.truncate(12);
  key
}

/// Generate an opaque revision token.
pub fn generate_revision() -> String {
  let mut rev = Uuid::new_v4().simple().to_string();
  rev.truncate(22);
  rev
}
