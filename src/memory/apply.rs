//! Applying patch operations to a stored document.

use serde_json::{Map, Value};

use crate::document::{KEY_FIELD, RESERVED_FIELDS, REVISION_FIELD};
use crate::patch::{InsertPosition, PatchOperation};
use crate::path::{Path, Segment};
use crate::protocol::{ServerError, ServerErrorKind};

use super::filter::number;

fn invalid(message: impl Into<String>) -> ServerError {
  ServerError::new(ServerErrorKind::Validation, message)
}

fn parse(raw: &str) -> Result<Path, ServerError> {
  let path = Path::parse(raw).map_err(|e| invalid(e.to_string()))?;
  if RESERVED_FIELDS.contains(&path.root()) {
    return Err(invalid(format!("{} is managed by the store", path.root())));
  }
  Ok(path)
}

/// Apply `operations` in order to the document body `doc`, whose id is `id`.
/// On error `doc` may be partially modified; callers work on a copy.
pub fn apply_patch(id: &str, doc: &mut Value, operations: &[PatchOperation]) -> Result<(), ServerError> {
  for op in operations {
    match op {
      PatchOperation::IfRevisionId { revision } => {
        let actual = doc.get(REVISION_FIELD).and_then(Value::as_str);
        if actual != Some(revision.as_str()) {
          let mut err = ServerError::new(
            ServerErrorKind::RevisionMismatch,
            format!("document {} is not at revision {}", id, revision),
          )
          .for_document(id);
          err.expected_revision = Some(revision.clone());
          err.actual_revision = actual.map(str::to_string);
          return Err(err);
        }
      }
      PatchOperation::Set { fields } => {
        for (raw, value) in fields {
          set(doc, &parse(raw)?, value.clone(), false)?;
        }
      }
      PatchOperation::SetIfMissing { fields } => {
        for (raw, value) in fields {
          set(doc, &parse(raw)?, value.clone(), true)?;
        }
      }
      PatchOperation::Unset { paths } => {
        for raw in paths {
          unset(doc, &parse(raw)?)?;
        }
      }
      PatchOperation::Inc { path, by } => inc(doc, &parse(path)?, *by)?,
      PatchOperation::Insert {
        position,
        path,
        items,
      } => insert(doc, &parse(path)?, *position, items.clone())?,
    }
  }
  Ok(())
}

fn normalize(index: i64, len: usize) -> Option<usize> {
  let resolved = if index < 0 { len as i64 + index } else { index };
  (0..len as i64).contains(&resolved).then_some(resolved as usize)
}

fn key_position(items: &[Value], key: &str) -> Option<usize> {
  items
    .iter()
    .position(|item| item.get(KEY_FIELD).and_then(Value::as_str) == Some(key))
}

/// Walk the first `depth` segments from `value`. With `create`, missing
/// attributes are created, but only where the step after them is an attribute.
fn resolve_mut<'a>(
  value: &'a mut Value,
  segments: &[Segment],
  depth: usize,
  create: bool,
) -> Option<&'a mut Value> {
  let mut current = value;
  for (i, segment) in segments.iter().take(depth).enumerate() {
    current = match segment {
      Segment::Field(name) => {
        let next_is_field = matches!(segments.get(i + 1), None | Some(Segment::Field(_)));
        if create && current.is_null() {
          *current = Value::Object(Map::new());
        }
        let object = current.as_object_mut()?;
        if create && next_is_field {
          object.entry(name.clone()).or_insert(Value::Null)
        } else {
          object.get_mut(name)?
        }
      }
      Segment::Index(index) => {
        let items = current.as_array_mut()?;
        let at = normalize(*index, items.len())?;
        items.get_mut(at)?
      }
      Segment::Key(key) => {
        let items = current.as_array_mut()?;
        let at = key_position(items, key)?;
        items.get_mut(at)?
      }
    };
  }
  Some(current)
}

/// Whether setting `segments` from `value` lands somewhere. Past the first
/// missing attribute only attribute steps can be created.
fn creatable(value: &Value, segments: &[Segment]) -> bool {
  let mut current = value;
  for (i, segment) in segments.iter().enumerate() {
    let only_fields = || segments[i + 1..].iter().all(|s| matches!(s, Segment::Field(_)));
    if current.is_null() {
      return matches!(segment, Segment::Field(_)) && only_fields();
    }
    let next = match segment {
      Segment::Field(name) => match current.as_object() {
        Some(object) => object.get(name),
        None => return true,
      },
      Segment::Index(index) => current
        .as_array()
        .and_then(|items| normalize(*index, items.len()).map(|at| &items[at])),
      Segment::Key(key) => current
        .as_array()
        .and_then(|items| key_position(items, key).map(|at| &items[at])),
    };
    match next {
      Some(value) => current = value,
      None => return matches!(segment, Segment::Field(_)) && only_fields(),
    }
  }
  true
}

fn split(path: &Path) -> Result<(&[Segment], &Segment), ServerError> {
  let (last, parent) = path
    .segments()
    .split_last()
    .ok_or_else(|| invalid("empty path"))?;
  Ok((parent, last))
}

fn set(doc: &mut Value, path: &Path, value: Value, only_if_missing: bool) -> Result<(), ServerError> {
  let (parent, last) = split(path)?;
  if !creatable(doc, path.segments()) {
    return Ok(());
  }
  let Some(target) = resolve_mut(doc, path.segments(), parent.len(), true) else {
    return Ok(());
  };
  let slot = match last {
    Segment::Field(name) => {
      if target.is_null() {
        *target = Value::Object(Map::new());
      }
      let object = target
        .as_object_mut()
        .ok_or_else(|| invalid(format!("cannot set {}: parent is not an object", path)))?;
      object.entry(name.clone()).or_insert(Value::Null)
    }
    Segment::Index(index) => {
      let Some(items) = target.as_array_mut() else {
        return Ok(());
      };
      let Some(at) = normalize(*index, items.len()) else {
        return Ok(());
      };
      &mut items[at]
    }
    Segment::Key(key) => {
      let Some(items) = target.as_array_mut() else {
        return Ok(());
      };
      let Some(at) = key_position(items, key) else {
        return Ok(());
      };
      &mut items[at]
    }
  };
  if !(only_if_missing && !slot.is_null()) {
    *slot = value;
  }
  Ok(())
}

fn unset(doc: &mut Value, path: &Path) -> Result<(), ServerError> {
  let (parent, last) = split(path)?;
  let Some(target) = resolve_mut(doc, path.segments(), parent.len(), false) else {
    return Ok(());
  };
  match last {
    Segment::Field(name) => {
      if let Some(object) = target.as_object_mut() {
        object.remove(name);
      }
    }
    Segment::Index(index) => {
      if let Some(items) = target.as_array_mut() {
        if let Some(at) = normalize(*index, items.len()) {
          items.remove(at);
        }
      }
    }
    Segment::Key(key) => {
      if let Some(items) = target.as_array_mut() {
        items.retain(|item| item.get(KEY_FIELD).and_then(Value::as_str) != Some(key.as_str()));
      }
    }
  }
  Ok(())
}

fn inc(doc: &mut Value, path: &Path, by: f64) -> Result<(), ServerError> {
  let depth = path.segments().len();
  let current = match resolve_mut(doc, path.segments(), depth, false) {
    Some(value) if !value.is_null() => value
      .as_f64()
      .ok_or_else(|| invalid(format!("cannot increment {}: not a number", path)))?,
    _ => 0.0,
  };
  set(doc, path, number(current + by), false)
}

fn insert(
  doc: &mut Value,
  path: &Path,
  position: InsertPosition,
  items: Vec<Value>,
) -> Result<(), ServerError> {
  let (parent, last) = split(path)?;
  if parent.is_empty() {
    return Err(invalid(format!("{} does not select an array element", path)));
  }
  let array = resolve_mut(doc, path.segments(), parent.len(), false)
    .and_then(Value::as_array_mut)
    .ok_or_else(|| invalid(format!("no array at {}", path)))?;

  let at = match last {
    Segment::Index(index) if array.is_empty() && (*index == 0 || *index == -1) => {
      array.extend(items);
      return Ok(());
    }
    Segment::Index(index) => normalize(*index, array.len())
      .ok_or_else(|| invalid(format!("index out of range in {}", path)))?,
    Segment::Key(key) => key_position(array, key)
      .ok_or_else(|| invalid(format!("no element matches {}", path)))?,
    Segment::Field(_) => {
      return Err(invalid(format!("{} does not select an array element", path)));
    }
  };

  match position {
    InsertPosition::Before => {
      array.splice(at..at, items);
    }
    InsertPosition::After => {
      array.splice(at + 1..at + 1, items);
    }
    InsertPosition::Replace => {
      array.splice(at..at + 1, items);
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn apply(doc: &mut Value, ops: Value) -> Result<(), ServerError> {
    let ops: Vec<PatchOperation> = serde_json::from_value(ops).unwrap();
    apply_patch("bike-1", doc, &ops)
  }

  #[test]
  fn test_set_creates_intermediate_objects() {
    let mut doc = json!({"_id": "bike-1"});
    apply(&mut doc, json!([{"op": "set", "fields": {"specs.frame.material": "steel"}}])).unwrap();
    assert_eq!(doc["specs"]["frame"]["material"], "steel");
  }

  #[test]
  fn test_set_behind_missing_array_leaves_no_trace() {
    let mut doc = json!({"_id": "b1"});
    apply(
      &mut doc,
      json!([{"op": "set", "fields": {"a.b[0]": 1, "specs.parts[_key==\"k\"].name": "x"}}]),
    )
    .unwrap();
    assert_eq!(doc, json!({"_id": "b1"}));

    let mut doc = json!({"_id": "b1", "a": {"b": [0]}});
    apply(&mut doc, json!([{"op": "set", "fields": {"a.b[0]": 1, "a.c.d": 2}}])).unwrap();
    assert_eq!(doc, json!({"_id": "b1", "a": {"b": [1], "c": {"d": 2}}}));
  }

  #[test]
  fn test_set_on_unmatched_selector_is_a_noop() {
    let mut doc = json!({"reviews": [{"_key": "a", "stars": 3}]});
    apply(
      &mut doc,
      json!([{"op": "set", "fields": {"reviews[_key==\"zz\"].stars": 5, "missing[0]": 1}}]),
    )
    .unwrap();
    assert_eq!(doc, json!({"reviews": [{"_key": "a", "stars": 3}]}));

    apply(&mut doc, json!([{"op": "set", "fields": {"reviews[_key==\"a\"].stars": 5}}])).unwrap();
    assert_eq!(doc["reviews"][0]["stars"], 5);
  }

  #[test]
  fn test_set_if_missing_keeps_existing() {
    let mut doc = json!({"name": "Tandem"});
    apply(
      &mut doc,
      json!([{"op": "setIfMissing", "fields": {"name": "x", "seats": 2}}]),
    )
    .unwrap();
    assert_eq!(doc, json!({"name": "Tandem", "seats": 2}));
  }

  #[test]
  fn test_unset_fields_and_elements() {
    let mut doc = json!({"a": 1, "tags": ["x", "y", "z"], "r": [{"_key": "k1"}, {"_key": "k2"}]});
    apply(
      &mut doc,
      json!([{"op": "unset", "paths": ["a", "tags[-1]", "r[_key==\"k1\"]", "nope.deeper"]}]),
    )
    .unwrap();
    assert_eq!(doc, json!({"tags": ["x", "y"], "r": [{"_key": "k2"}]}));
  }

  #[test]
  fn test_inc_initialises_missing_and_rejects_strings() {
    let mut doc = json!({"numSold": 4, "name": "x"});
    apply(
      &mut doc,
      json!([
        {"op": "inc", "path": "numSold", "by": 1.0},
        {"op": "inc", "path": "stock", "by": -2.0},
        {"op": "inc", "path": "price", "by": 0.5}
      ]),
    )
    .unwrap();
    assert_eq!(doc["numSold"], json!(5));
    assert_eq!(doc["stock"], json!(-2));
    assert_eq!(doc["price"], json!(0.5));

    let err = apply(&mut doc, json!([{"op": "inc", "path": "name", "by": 1.0}])).unwrap_err();
    assert_eq!(err.kind, ServerErrorKind::Validation);
  }

  #[test]
  fn test_insert_positions() {
    let mut doc = json!({"tags": ["b", "d"]});
    apply(
      &mut doc,
      json!([
        {"op": "insert", "position": "before", "path": "tags[0]", "items": ["a"]},
        {"op": "insert", "position": "after", "path": "tags[1]", "items": ["c"]},
        {"op": "insert", "position": "after", "path": "tags[-1]", "items": ["e"]},
        {"op": "insert", "position": "replace", "path": "tags[2]", "items": ["C"]}
      ]),
    )
    .unwrap();
    assert_eq!(doc["tags"], json!(["a", "b", "C", "d", "e"]));
  }

  #[test]
  fn test_insert_into_empty_and_missing_arrays() {
    let mut doc = json!({"tags": []});
    apply(
      &mut doc,
      json!([{"op": "insert", "position": "after", "path": "tags[-1]", "items": ["a"]}]),
    )
    .unwrap();
    assert_eq!(doc["tags"], json!(["a"]));

    let err = apply(
      &mut doc,
      json!([{"op": "insert", "position": "after", "path": "reviews[-1]", "items": [{"_key": "k"}]}]),
    )
    .unwrap_err();
    assert_eq!(err.kind, ServerErrorKind::Validation);
  }

  #[test]
  fn test_revision_precondition() {
    let mut doc = json!({"_rev": "r1"});
    apply(&mut doc, json!([{"op": "ifRevisionId", "revision": "r1"}])).unwrap();

    let err = apply(&mut doc, json!([{"op": "ifRevisionId", "revision": "r0"}])).unwrap_err();
    assert_eq!(err.kind, ServerErrorKind::RevisionMismatch);
    assert_eq!(err.expected_revision.as_deref(), Some("r0"));
    assert_eq!(err.actual_revision.as_deref(), Some("r1"));
  }

  #[test]
  fn test_reserved_fields_rejected() {
    let mut doc = json!({"_type": "bike"});
    let err = apply(&mut doc, json!([{"op": "set", "fields": {"_type": "car"}}])).unwrap_err();
    assert_eq!(err.kind, ServerErrorKind::Validation);
  }
}
