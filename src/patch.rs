//! Fluent patch builder.
//!
//! A [`Patch`] collects field-level operations against one document. It is a
//! plain mutable value meant to be used from one task at a time; it is not
//! synchronised. Operations are only recorded until [`Patch::freeze`] (or
//! [`Patch::commit`], which freezes first) moves it into its final state.
//! After that every mutation method fails with [`Error::InvalidState`].
//!
//! ```no_run
//! # async fn run(client: &pinedb::PineDB) -> pinedb::Result<()> {
//! use serde_json::json;
//!
//! client
//!   .patch("bike-123")
//!   .set(json!({"inStock": false}))?
//!   .inc("numSold", 1)?
//!   .commit()
//!   .await?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::{generate_key, KEY_FIELD};
use crate::error::{Error, MutationError, Result};
use crate::mutation::{MutationOptions, MutationOutcome, MutationSubmitter};
use crate::path::Path;
use crate::transaction::{Mutation, PatchMutation};

/// Where inserted items land relative to the targeted element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertPosition {
  Before,
  After,
  /// Replace the targeted element with the items.
  Replace,
}

/// A single field-level mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum PatchOperation {
  /// Write each path to the given value.
  Set { fields: Map<String, Value> },
  /// Write each path only if nothing is there yet.
  SetIfMissing { fields: Map<String, Value> },
  /// Remove fields or array elements.
  Unset { paths: Vec<String> },
  /// Add `by` to a number. Decrements use a negative delta.
  Inc { path: String, by: f64 },
  /// Insert items into an array around the targeted element.
  Insert {
    position: InsertPosition,
    path: String,
    items: Vec<Value>,
  },
  /// Precondition on the document's revision at apply time.
  IfRevisionId { revision: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatchState {
  Open,
  Frozen,
}

/// Builder for an ordered list of [`PatchOperation`]s against one document.
#[derive(Debug, Clone)]
pub struct Patch {
  id: String,
  operations: Vec<PatchOperation>,
  state: PatchState,
  submitter: Option<MutationSubmitter>,
}

impl Patch {
  /// A detached patch. It can be frozen and embedded in a transaction but
  /// cannot be committed on its own.
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      operations: Vec::new(),
      state: PatchState::Open,
      submitter: None,
    }
  }

  pub(crate) fn bound(id: impl Into<String>, submitter: MutationSubmitter) -> Self {
    Self {
      submitter: Some(submitter),
      ..Self::new(id)
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn operations(&self) -> &[PatchOperation] {
    &self.operations
  }

  pub fn is_frozen(&self) -> bool {
    self.state == PatchState::Frozen
  }

  /// Shallow-merge the given fields. Keys may be paths.
  pub fn set(&mut self, fields: impl Into<Value>) -> Result<&mut Self> {
    let fields = self.path_map("set", fields.into())?;
    self.push(PatchOperation::Set { fields })
  }

  /// Like [`Patch::set`], but leaves paths that already hold a value alone.
  pub fn set_if_missing(&mut self, fields: impl Into<Value>) -> Result<&mut Self> {
    let fields = self.path_map("setIfMissing", fields.into())?;
    self.push(PatchOperation::SetIfMissing { fields })
  }

  /// Remove fields or array elements, e.g. `title` or `reviews[_key=="abc"]`.
  pub fn unset<I, S>(&mut self, paths: I) -> Result<&mut Self>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut checked = Vec::new();
    for path in paths {
      checked.push(self.check_path(path.as_ref())?);
    }
    self.push(PatchOperation::Unset { paths: checked })
  }

  pub fn inc(&mut self, path: &str, delta: impl Into<f64>) -> Result<&mut Self> {
    let path = self.check_path(path)?;
    self.push(PatchOperation::Inc {
      path,
      by: delta.into(),
    })
  }

  pub fn dec(&mut self, path: &str, delta: impl Into<f64>) -> Result<&mut Self> {
    let path = self.check_path(path)?;
    let delta: f64 = delta.into();
    self.push(PatchOperation::Inc { path, by: -delta })
  }

  /// Insert items relative to the array element addressed by `path`
  /// (`reviews[-1]`, `reviews[_key=="abc"]`, ...). Object items without a
  /// `_key` are given a generated one.
  pub fn insert(
    &mut self,
    position: InsertPosition,
    path: &str,
    items: Vec<Value>,
  ) -> Result<&mut Self> {
    let path = self.check_path(path)?;
    self.push(PatchOperation::Insert {
      position,
      path,
      items: with_keys(items),
    })
  }

  pub fn insert_before(&mut self, path: &str, items: Vec<Value>) -> Result<&mut Self> {
    self.insert(InsertPosition::Before, path, items)
  }

  pub fn insert_after(&mut self, path: &str, items: Vec<Value>) -> Result<&mut Self> {
    self.insert(InsertPosition::After, path, items)
  }

  /// Add items after the last element of the array at `path`.
  pub fn append(&mut self, path: &str, items: Vec<Value>) -> Result<&mut Self> {
    let path = self.check_path(path)?;
    self.insert(InsertPosition::After, &format!("{}[-1]", path), items)
  }

  /// Add items before the first element of the array at `path`.
  pub fn prepend(&mut self, path: &str, items: Vec<Value>) -> Result<&mut Self> {
    let path = self.check_path(path)?;
    self.insert(InsertPosition::Before, &format!("{}[0]", path), items)
  }

  /// Only apply the patch if the document is still at `revision`.
  pub fn if_revision_id(&mut self, revision: impl Into<String>) -> Result<&mut Self> {
    self.push(PatchOperation::IfRevisionId {
      revision: revision.into(),
    })
  }

  /// Stop accepting operations and return the frozen list. Idempotent.
  pub fn freeze(&mut self) -> PatchMutation {
    self.state = PatchState::Frozen;
    PatchMutation {
      id: self.id.clone(),
      operations: self.operations.clone(),
    }
  }

  /// The frozen operation list, if the patch has been frozen.
  pub fn frozen(&self) -> Option<PatchMutation> {
    self.is_frozen().then(|| PatchMutation {
      id: self.id.clone(),
      operations: self.operations.clone(),
    })
  }

  /// Freeze and submit the patch, returning the outcome with the updated document.
  pub async fn commit(&mut self) -> Result<MutationOutcome> {
    self
      .commit_with(MutationOptions::default().return_documents(true))
      .await
  }

  pub async fn commit_with(&mut self, options: MutationOptions) -> Result<MutationOutcome> {
    if self.is_frozen() {
      return Err(Error::InvalidState(format!(
        "patch for {} was already committed",
        self.id
      )));
    }
    let submitter = self.submitter.clone().ok_or_else(|| {
      Error::InvalidState("patch is not bound to a client; add it to a transaction".to_string())
    })?;
    let frozen = self.freeze();
    Ok(submitter.submit(vec![Mutation::Patch(frozen)], options).await?)
  }

  fn push(&mut self, operation: PatchOperation) -> Result<&mut Self> {
    self.ensure_open()?;
    self.operations.push(operation);
    Ok(self)
  }

  fn ensure_open(&self) -> Result<()> {
    match self.state {
      PatchState::Open => Ok(()),
      PatchState::Frozen => Err(Error::InvalidState(format!(
        "patch for {} is frozen and cannot be modified",
        self.id
      ))),
    }
  }

  fn check_path(&self, path: &str) -> Result<String> {
    self.ensure_open()?;
    Path::parse(path)?;
    Ok(path.to_string())
  }

  fn path_map(&self, op: &str, fields: Value) -> Result<Map<String, Value>> {
    self.ensure_open()?;
    let Value::Object(fields) = fields else {
      return Err(
        MutationError::ValidationFailure(format!("{} expects an object of path/value pairs", op))
          .into(),
      );
    };
    for path in fields.keys() {
      Path::parse(path)?;
    }
    Ok(fields)
  }
}

fn with_keys(items: Vec<Value>) -> Vec<Value> {
  items
    .into_iter()
    .map(|item| match item {
      Value::Object(mut fields) => {
        if !fields.contains_key(KEY_FIELD) {
          fields.insert(KEY_FIELD.to_string(), Value::String(generate_key()));
        }
        Value::Object(fields)
      }
      other => other,
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_operations_recorded_in_order() {
    let mut patch = Patch::new("bike-123");
    patch
      .set(json!({"inStock": false}))
      .unwrap()
      .inc("numSold", 1)
      .unwrap()
      .dec("inStock", 2)
      .unwrap()
      .unset(["title", "price"])
      .unwrap();

    let ops = patch.operations();
    assert_eq!(ops.len(), 4);
    assert!(matches!(&ops[0], PatchOperation::Set { fields } if fields["inStock"] == json!(false)));
    assert_eq!(
      ops[1],
      PatchOperation::Inc {
        path: "numSold".to_string(),
        by: 1.0
      }
    );
    assert_eq!(
      ops[2],
      PatchOperation::Inc {
        path: "inStock".to_string(),
        by: -2.0
      }
    );
    assert_eq!(
      ops[3],
      PatchOperation::Unset {
        paths: vec!["title".to_string(), "price".to_string()]
      }
    );
  }

  #[test]
  fn test_append_and_prepend_target_array_ends() {
    let mut patch = Patch::new("bike-123");
    patch
      .append("reviews", vec![json!({"title": "Great"})])
      .unwrap()
      .prepend("reviews", vec![json!("plain")])
      .unwrap();

    match &patch.operations()[0] {
      PatchOperation::Insert {
        position,
        path,
        items,
      } => {
        assert_eq!(*position, InsertPosition::After);
        assert_eq!(path, "reviews[-1]");
        assert!(items[0]["_key"].is_string());
      }
      other => panic!("Expected insert, got {:?}", other),
    }
    match &patch.operations()[1] {
      PatchOperation::Insert { position, path, items } => {
        assert_eq!(*position, InsertPosition::Before);
        assert_eq!(path, "reviews[0]");
        assert_eq!(items[0], json!("plain"));
      }
      other => panic!("Expected insert, got {:?}", other),
    }
  }

  #[test]
  fn test_existing_keys_are_kept() {
    let mut patch = Patch::new("bike-123");
    patch
      .insert_after("reviews[-1]", vec![json!({"_key": "abc", "stars": 5})])
      .unwrap();
    match &patch.operations()[0] {
      PatchOperation::Insert { items, .. } => assert_eq!(items[0]["_key"], "abc"),
      other => panic!("Expected insert, got {:?}", other),
    }
  }

  #[test]
  fn test_malformed_paths_rejected() {
    let mut patch = Patch::new("bike-123");
    assert!(matches!(
      patch.unset(["reviews["]),
      Err(Error::InvalidPath { .. })
    ));
    assert!(matches!(
      patch.set(json!({"a..b": 1})),
      Err(Error::InvalidPath { .. })
    ));
    assert!(matches!(
      patch.set(json!([1, 2])),
      Err(Error::Mutation(MutationError::ValidationFailure(_)))
    ));
    assert!(patch.operations().is_empty());
  }

  #[test]
  fn test_mutation_after_freeze_fails() {
    let mut patch = Patch::new("bike-123");
    patch.set(json!({"name": "A Bike To Go"})).unwrap();
    let frozen = patch.freeze();
    assert_eq!(frozen.id, "bike-123");
    assert_eq!(frozen.operations.len(), 1);

    assert!(matches!(
      patch.set(json!({"name": "other"})),
      Err(Error::InvalidState(_))
    ));
    assert!(matches!(patch.inc("n", 1), Err(Error::InvalidState(_))));
    assert!(matches!(
      patch.if_revision_id("abc"),
      Err(Error::InvalidState(_))
    ));
    assert_eq!(patch.operations().len(), 1);
  }

  #[tokio::test]
  async fn test_detached_patch_cannot_commit() {
    let mut patch = Patch::new("bike-123");
    patch.set(json!({"a": 1})).unwrap();
    assert!(matches!(patch.commit().await, Err(Error::InvalidState(_))));
    assert!(!patch.is_frozen());
  }

  #[test]
  fn test_operation_wire_format() {
    let op = PatchOperation::IfRevisionId {
      revision: "r1".to_string(),
    };
    let json = serde_json::to_value(&op).unwrap();
    assert_eq!(json, json!({"op": "ifRevisionId", "revision": "r1"}));

    let op = PatchOperation::Insert {
      position: InsertPosition::Replace,
      path: "tags[0]".to_string(),
      items: vec![json!("x")],
    };
    let json = serde_json::to_value(&op).unwrap();
    assert_eq!(json["position"], "replace");
  }
}
