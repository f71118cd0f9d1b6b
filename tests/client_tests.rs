//! Client tests for the PineDB Rust SDK, run against the in-memory store.

use pinedb::protocol::Operation;
use pinedb::{
  AssetKind, ClientConfig, ConfigPatch, Document, Error, MemoryStore, MutationError,
  MutationOptions, PineDB, UploadOptions,
};
use serde_json::json;

const DATASET: &str = "production";

fn client() -> (PineDB, MemoryStore) {
  let store = MemoryStore::new();
  let client = PineDB::memory(ClientConfig::new("test-project", DATASET), store.clone()).unwrap();
  (client, store)
}

fn bike(id: &str, seats: i64) -> Document {
  Document::new("bike")
    .with_id(id)
    .with_field("name", format!("Bike {}", id))
    .with_field("seats", seats)
}

#[test]
fn test_config_validation() {
  let store = MemoryStore::new();
  let bad = [
    ClientConfig::new("Bad_Project", DATASET),
    ClientConfig::new("test-project", ""),
    ClientConfig::new("test-project", "-leading-dash"),
    ClientConfig::new("test-project", DATASET).with_api_version("2024-13-01"),
    ClientConfig::new("test-project", DATASET).with_timeout(std::time::Duration::ZERO),
  ];
  for config in bad {
    match PineDB::memory(config.clone(), store.clone()) {
      Err(Error::InvalidConfig(_)) => {}
      other => panic!("Expected InvalidConfig for {:?}, got {:?}", config, other),
    }
  }

  let ok = ClientConfig::new("test-project", DATASET).with_api_version("1");
  assert!(PineDB::memory(ok, store).is_ok());
}

#[test]
fn test_set_config_keeps_previous_on_error() {
  let (client, _) = client();
  let err = client.set_config(ConfigPatch::new().dataset("Not Valid")).unwrap_err();
  assert!(matches!(err, Error::InvalidConfig(_)));
  assert_eq!(client.config().dataset, DATASET);

  let updated = client
    .set_config(ConfigPatch::new().dataset("staging").token("sk-abc"))
    .unwrap();
  assert_eq!(updated.dataset, "staging");
  assert_eq!(client.config().token.as_deref(), Some("sk-abc"));
  assert!(!format!("{:?}", client.config()).contains("sk-abc"));
}

#[tokio::test]
async fn test_create_and_get_document() {
  let (client, _) = client();
  let outcome = client.create(bike("bike-1", 2)).await.unwrap();

  let result = outcome.result("bike-1").unwrap();
  assert_eq!(result.operation, Operation::Create);
  let revision = outcome.revision("bike-1").unwrap().to_string();
  assert!(!revision.is_empty());

  let doc = client.get_document("bike-1").await.unwrap().unwrap();
  assert_eq!(doc.revision(), Some(revision.as_str()));
  assert_eq!(doc.get("seats"), Some(&json!(2)));
  assert!(doc.get("_createdAt").is_some());
  assert!(client.get_document("bike-404").await.unwrap().is_none());
}

#[tokio::test]
async fn test_create_assigns_id_when_missing() {
  let (client, _) = client();
  let outcome = client
    .create(Document::new("bike").with_field("seats", 1))
    .await
    .unwrap();
  let id = outcome.first_id().unwrap();
  assert!(client.get_document(id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_create_existing_fails() {
  let (client, _) = client();
  client.create(bike("bike-1", 2)).await.unwrap();
  match client.create(bike("bike-1", 3)).await {
    Err(Error::Mutation(MutationError::AlreadyExists(id))) => assert_eq!(id, "bike-1"),
    other => panic!("Expected AlreadyExists, got {:?}", other),
  }
}

#[tokio::test]
async fn test_create_if_not_exists_twice() {
  let (client, store) = client();
  let first = client.create_if_not_exists(bike("bike-1", 2)).await.unwrap();
  assert_eq!(first.result("bike-1").unwrap().operation, Operation::Create);

  let second = client.create_if_not_exists(bike("bike-1", 5)).await.unwrap();
  assert_eq!(second.result("bike-1").unwrap().operation, Operation::None);
  assert_eq!(second.revision("bike-1"), first.revision("bike-1"));

  let stored = store.document(DATASET, "bike-1").unwrap();
  assert_eq!(stored.get("seats"), Some(&json!(2)));
}

#[tokio::test]
async fn test_create_or_replace_overwrites() {
  let (client, _) = client();
  client.create(bike("bike-1", 2)).await.unwrap();
  let outcome = client
    .create_or_replace(Document::new("bike").with_id("bike-1").with_field("seats", 4))
    .await
    .unwrap();
  assert_eq!(outcome.result("bike-1").unwrap().operation, Operation::Update);

  let doc = outcome.document("bike-1").unwrap();
  assert_eq!(doc.get("seats"), Some(&json!(4)));
  assert!(doc.get("name").is_none());
}

#[tokio::test]
async fn test_delete_missing_is_noop() {
  let (client, _) = client();
  let outcome = client.delete("ghost").await.unwrap();
  assert_eq!(outcome.result("ghost").unwrap().operation, Operation::None);
  assert_eq!(outcome.changed().count(), 0);
}

#[tokio::test]
async fn test_patch_operations() {
  let (client, _) = client();
  client
    .create(bike("bike-1", 2).with_field("reviews", json!([])))
    .await
    .unwrap();

  let outcome = client
    .patch("bike-1")
    .inc("seats", 1)
    .unwrap()
    .dec("stock", 2)
    .unwrap()
    .set(json!({"color": "red", "specs.gears": 21}))
    .unwrap()
    .set_if_missing(json!({"color": "blue", "inStock": true}))
    .unwrap()
    .unset(["name"])
    .unwrap()
    .commit()
    .await
    .unwrap();

  let doc = outcome.document("bike-1").unwrap();
  assert_eq!(doc.get("seats"), Some(&json!(3)));
  assert_eq!(doc.get("stock"), Some(&json!(-2)));
  assert_eq!(doc.get("color"), Some(&json!("red")));
  assert_eq!(doc.get("inStock"), Some(&json!(true)));
  assert_eq!(doc.get("specs"), Some(&json!({"gears": 21})));
  assert!(doc.get("name").is_none());
}

#[tokio::test]
async fn test_appends_get_distinct_keys() {
  let (client, _) = client();
  client
    .create(bike("bike-1", 2).with_field("reviews", json!([])))
    .await
    .unwrap();

  for text in ["great", "squeaky"] {
    client
      .patch("bike-1")
      .append("reviews", vec![json!({"text": text})])
      .unwrap()
      .commit()
      .await
      .unwrap();
  }

  let doc = client.get_document("bike-1").await.unwrap().unwrap();
  let reviews = doc.get("reviews").unwrap().as_array().unwrap().clone();
  assert_eq!(reviews.len(), 2);
  assert_eq!(reviews[0]["text"], json!("great"));
  assert_eq!(reviews[1]["text"], json!("squeaky"));
  let k0 = reviews[0]["_key"].as_str().unwrap();
  let k1 = reviews[1]["_key"].as_str().unwrap();
  assert_ne!(k0, k1);
}

#[tokio::test]
async fn test_revision_guard() {
  let (client, _) = client();
  let created = client.create(bike("bike-1", 2)).await.unwrap();
  let r1 = created.revision("bike-1").unwrap().to_string();

  let patched = client
    .patch("bike-1")
    .if_revision_id(&r1)
    .unwrap()
    .set(json!({"inStock": false}))
    .unwrap()
    .commit()
    .await
    .unwrap();
  let r2 = patched.revision("bike-1").unwrap().to_string();
  assert_ne!(r1, r2);

  let stale = client
    .patch("bike-1")
    .if_revision_id(&r1)
    .unwrap()
    .set(json!({"inStock": true}))
    .unwrap()
    .commit()
    .await;
  match stale {
    Err(Error::Mutation(MutationError::RevisionMismatch {
      id,
      expected,
      actual,
    })) => {
      assert_eq!(id, "bike-1");
      assert_eq!(expected, r1);
      assert_eq!(actual, Some(r2));
    }
    other => panic!("Expected RevisionMismatch, got {:?}", other),
  }

  let doc = client.get_document("bike-1").await.unwrap().unwrap();
  assert_eq!(doc.get("inStock"), Some(&json!(false)));
}

#[tokio::test]
async fn test_patch_missing_document_not_found() {
  let (client, _) = client();
  let result = client
    .patch("bike-404")
    .set(json!({"seats": 1}))
    .unwrap()
    .commit()
    .await;
  assert!(matches!(
    result,
    Err(Error::Mutation(MutationError::NotFound(_)))
  ));
}

#[tokio::test]
async fn test_frozen_patch_rejects_changes() {
  let (client, _) = client();
  client.create(bike("bike-1", 2)).await.unwrap();

  let mut patch = client.patch("bike-1");
  patch.set(json!({"seats": 3})).unwrap();
  patch.commit().await.unwrap();
  assert!(patch.is_frozen());

  assert!(matches!(patch.set(json!({"seats": 4})), Err(Error::InvalidState(_))));
  assert!(matches!(patch.commit().await, Err(Error::InvalidState(_))));
}

#[tokio::test]
async fn test_unfrozen_patch_cannot_join_transaction() {
  let (client, _) = client();
  let mut patch = client.patch("bike-1");
  patch.set(json!({"seats": 3})).unwrap();

  let mut tx = client.transaction();
  match tx.patch(&patch) {
    Err(Error::UnfinishedPatch(id)) => assert_eq!(id, "bike-1"),
    other => panic!("Expected UnfinishedPatch, got {:?}", other.map(|_| ())),
  }

  patch.freeze();
  assert!(tx.patch(&patch).is_ok());
  assert_eq!(tx.len(), 1);
}

#[tokio::test]
async fn test_reserved_fields_are_rejected() {
  let (client, store) = client();
  client.create(bike("bike-1", 2)).await.unwrap();
  let result = client
    .patch("bike-1")
    .set(json!({"_rev": "forged"}))
    .unwrap()
    .commit()
    .await;
  assert!(matches!(
    result,
    Err(Error::Mutation(MutationError::ValidationFailure(_)))
  ));
  assert_ne!(
    store.document(DATASET, "bike-1").unwrap().revision(),
    Some("forged")
  );
}

#[tokio::test]
async fn test_transaction_applies_in_order() {
  let (client, _) = client();
  let outcome = client
    .transaction()
    .create(bike("bike-1", 2))
    .unwrap()
    .patch_with("bike-1", |p| p.inc("seats", 1))
    .unwrap()
    .create(bike("bike-2", 1))
    .unwrap()
    .commit_with(MutationOptions::default().return_documents(true))
    .await
    .unwrap();

  let ids: Vec<&str> = outcome.ids().collect();
  assert_eq!(ids, vec!["bike-1", "bike-2"]);
  assert_eq!(outcome.result("bike-1").unwrap().operation, Operation::Create);
  assert_eq!(
    outcome.document("bike-1").unwrap().get("seats"),
    Some(&json!(3))
  );
}

#[tokio::test]
async fn test_transaction_is_atomic() {
  let (client, store) = client();
  let result = client
    .transaction()
    .create(bike("bike-1", 2))
    .unwrap()
    .patch_with("bike-404", |p| p.set(json!({"seats": 1})))
    .unwrap()
    .commit()
    .await;

  assert!(matches!(
    result,
    Err(Error::Mutation(MutationError::NotFound(_)))
  ));
  assert!(store.is_empty(DATASET));
}

#[tokio::test]
async fn test_committed_transaction_is_closed() {
  let (client, _) = client();
  let mut tx = client.transaction();
  tx.create(bike("bike-1", 2)).unwrap();
  tx.commit().await.unwrap();
  assert!(matches!(tx.delete("bike-1"), Err(Error::InvalidState(_))));
  assert!(matches!(tx.commit().await, Err(Error::InvalidState(_))));
}

#[tokio::test]
async fn test_transaction_id_replay() {
  let (client, store) = client();
  let mut first = client.transaction().with_transaction_id("tx-42");
  first.create(Document::new("bike").with_field("seats", 1)).unwrap();
  let a = first.commit().await.unwrap();

  let mut again = client.transaction().with_transaction_id("tx-42");
  again.create(Document::new("bike").with_field("seats", 1)).unwrap();
  let b = again.commit().await.unwrap();

  assert_eq!(a.transaction_id, "tx-42");
  assert_eq!(a, b);
  assert_eq!(store.len(DATASET), 1);
}

#[tokio::test]
async fn test_empty_transaction_is_rejected() {
  let (client, _) = client();
  let result = client.transaction().commit().await;
  assert!(matches!(
    result,
    Err(Error::Mutation(MutationError::ValidationFailure(_)))
  ));
}

#[tokio::test]
async fn test_read_only_dataset() {
  let (client, store) = client();
  store.set_read_only(true);
  let result = client.create(bike("bike-1", 2)).await;
  assert!(matches!(
    result,
    Err(Error::Mutation(MutationError::PermissionDenied(_)))
  ));
}

#[tokio::test]
async fn test_get_documents_lines_up_with_ids() {
  let (client, _) = client();
  client.create(bike("bike-1", 1)).await.unwrap();
  client.create(bike("bike-3", 3)).await.unwrap();

  let docs = client
    .get_documents(["bike-3", "bike-2", "bike-1"])
    .await
    .unwrap();
  let ids: Vec<Option<&str>> = docs.iter().map(|d| d.as_ref().and_then(Document::id)).collect();
  assert_eq!(ids, vec![Some("bike-3"), None, Some("bike-1")]);
}

#[tokio::test]
async fn test_asset_upload_is_deduplicated() {
  let (client, store) = client();
  let options = UploadOptions {
    content_type: Some("image/png".to_string()),
    filename: Some("bike.png".to_string()),
    ..Default::default()
  };
  let assets = client.assets();
  let first = assets
    .upload(AssetKind::Image, b"\x89PNG fake".to_vec(), options.clone())
    .await
    .unwrap();
  let second = assets
    .upload(AssetKind::Image, b"\x89PNG fake".to_vec(), options)
    .await
    .unwrap();

  assert_eq!(first.id(), second.id());
  assert_eq!(first.revision(), second.revision());
  assert_eq!(first.doc_type(), Some("pinedb.imageAsset"));
  assert!(first.id().unwrap().starts_with("image-"));
  assert!(first.id().unwrap().ends_with("-png"));
  assert_eq!(store.len(DATASET), 1);
}

#[tokio::test]
async fn test_ping() {
  let (client, _) = client();
  client.ping().await.unwrap();
}

#[test]
fn test_error_display() {
  let err = Error::Connection("failed to connect".to_string());
  assert_eq!(format!("{}", err), "Connection error: failed to connect");

  let err = Error::VersionMismatch { server: 2, client: 1 };
  assert!(format!("{}", err).contains("server=2"));
  assert!(format!("{}", err).contains("client=1"));

  let err = Error::from(MutationError::NotFound("bike-1".to_string()));
  assert_eq!(format!("{}", err), "Document not found: bike-1");
}
