//! Listener tests for the PineDB Rust SDK, run against the in-memory store.

use std::time::Duration;

use pinedb::{
  ChangeKind, ChangeNotification, ChangePayload, ClientConfig, Document, Error, ListenOptions,
  MemoryStore, Mutation, OverflowPolicy, PayloadMode, PineDB, QueryError, QuerySpec,
  ReconnectPolicy, Subscription, SubscriptionError, SubscriptionState,
};
use serde_json::json;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn client() -> (PineDB, MemoryStore) {
  let _ = env_logger::builder().is_test(true).try_init();
  let store = MemoryStore::new();
  let client = PineDB::memory(ClientConfig::new("test-project", "production"), store.clone()).unwrap();
  (client, store)
}

fn quick_reconnect() -> ReconnectPolicy {
  ReconnectPolicy {
    initial_delay: Duration::from_millis(10),
    max_delay: Duration::from_millis(50),
    multiplier: 2.0,
    max_retries: None,
  }
}

fn bikes(min_seats: i64) -> QuerySpec {
  QuerySpec::new(r#"_type == "bike" && seats >= $minSeats"#).param("minSeats", min_seats)
}

fn bike(id: &str, seats: i64) -> Document {
  Document::new("bike").with_id(id).with_field("seats", seats)
}

async fn active(sub: &Subscription) {
  let reached = timeout(WAIT, sub.wait_for(SubscriptionState::Active))
    .await
    .expect("timed out waiting for Active");
  assert!(reached, "subscription closed before becoming active");
}

async fn next_change(sub: &mut Subscription) -> ChangeNotification {
  timeout(WAIT, sub.next())
    .await
    .expect("timed out waiting for a notification")
    .expect("subscription closed")
    .expect("subscription failed")
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
  let result = timeout(WAIT, async {
    while !check() {
      sleep(Duration::from_millis(5)).await;
    }
  })
  .await;
  assert!(result.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_listen_reports_transitions() {
  let (client, _) = client();
  let mut sub = client.listen(&bikes(2)).await.unwrap();
  active(&sub).await;

  client.create(bike("bike-1", 1)).await.unwrap();
  let appeared = client
    .patch("bike-1")
    .set(json!({"seats": 2}))
    .unwrap()
    .commit()
    .await
    .unwrap();

  let change = next_change(&mut sub).await;
  assert_eq!(change.document_id, "bike-1");
  assert_eq!(change.kind, ChangeKind::Created);
  assert_eq!(change.transaction_id, appeared.transaction_id);
  assert_eq!(change.revision.as_deref(), appeared.revision("bike-1"));
  assert_eq!(change.document().unwrap().get("seats"), Some(&json!(2)));

  client.patch("bike-1").inc("seats", 1).unwrap().commit().await.unwrap();
  let change = next_change(&mut sub).await;
  assert_eq!(change.kind, ChangeKind::Updated);
  assert_eq!(change.document().unwrap().get("seats"), Some(&json!(3)));

  client.delete("bike-1").await.unwrap();
  let change = next_change(&mut sub).await;
  assert_eq!(change.kind, ChangeKind::Deleted);
  assert!(change.revision.is_none());
  assert!(change.payload.is_none());
}

#[tokio::test]
async fn test_listen_filter_with_params() {
  let (client, _) = client();
  let spec = QuerySpec::new(r#"_type == "comment" && authorId != $ownerId"#)
    .param("ownerId", "bikeOwnerUserId");
  let mut sub = client.listen(&spec).await.unwrap();
  active(&sub).await;

  client
    .create(Document::new("comment").with_id("c1").with_field("authorId", "bikeOwnerUserId"))
    .await
    .unwrap();
  client
    .create(Document::new("comment").with_id("c2").with_field("authorId", "someoneElse"))
    .await
    .unwrap();

  let change = next_change(&mut sub).await;
  assert_eq!(change.document_id, "c2");
  assert_eq!(sub.pending(), 0);
}

#[tokio::test]
async fn test_diff_payload_carries_mutations() {
  let (client, _) = client();
  let options = ListenOptions::default().payload(PayloadMode::Diff);
  let mut sub = client.listen_with(&bikes(1), options).await.unwrap();
  active(&sub).await;

  client.create(bike("bike-1", 2)).await.unwrap();
  let change = next_change(&mut sub).await;
  match change.payload {
    Some(ChangePayload::Diff(mutations)) => {
      assert_eq!(mutations.len(), 1);
      assert!(matches!(&mutations[0], Mutation::Create(doc) if doc.id() == Some("bike-1")));
    }
    other => panic!("Expected diff payload, got {:?}", other),
  }
}

#[tokio::test]
async fn test_no_payload_mode() {
  let (client, _) = client();
  let options = ListenOptions::default().payload(PayloadMode::None);
  let mut sub = client.listen_with(&bikes(1), options).await.unwrap();
  active(&sub).await;

  client.create(bike("bike-1", 2)).await.unwrap();
  let change = next_change(&mut sub).await;
  assert_eq!(change.kind, ChangeKind::Created);
  assert!(change.payload.is_none());
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
  let (client, store) = client();
  let mut sub = client.listen(&bikes(1)).await.unwrap();
  active(&sub).await;
  assert_eq!(store.listener_count(), 1);

  sub.unsubscribe();
  sub.unsubscribe();
  assert!(sub.is_closed());
  assert!(sub.next().await.is_none());

  client.create(bike("bike-1", 2)).await.unwrap();
  assert!(sub.next().await.is_none());
  eventually("listener to detach", || store.listener_count() == 0).await;
}

#[tokio::test]
async fn test_drop_unsubscribes() {
  let (client, store) = client();
  let sub = client.listen(&bikes(1)).await.unwrap();
  active(&sub).await;
  assert_eq!(store.listener_count(), 1);

  drop(sub);
  eventually("listener to detach", || store.listener_count() == 0).await;
}

#[tokio::test]
async fn test_drop_oldest_keeps_latest() {
  let (client, _) = client();
  let options = ListenOptions::default()
    .capacity(2)
    .overflow(OverflowPolicy::DropOldest);
  let mut sub = client.listen_with(&bikes(1), options).await.unwrap();
  active(&sub).await;

  for i in 1..=5 {
    client.create(bike(&format!("bike-{}", i), 2)).await.unwrap();
  }
  // Give the pump time to drain the channel into the queue.
  sleep(Duration::from_millis(100)).await;
  assert_eq!(sub.pending(), 2);

  assert_eq!(next_change(&mut sub).await.document_id, "bike-4");
  assert_eq!(next_change(&mut sub).await.document_id, "bike-5");
}

#[tokio::test]
async fn test_block_delivers_everything_in_order() {
  let (client, _) = client();
  let options = ListenOptions::default().capacity(1);
  let mut sub = client.listen_with(&bikes(1), options).await.unwrap();
  active(&sub).await;

  for i in 1..=4 {
    client.create(bike(&format!("bike-{}", i), 2)).await.unwrap();
  }
  sleep(Duration::from_millis(50)).await;
  assert_eq!(sub.pending(), 1);

  for i in 1..=4 {
    assert_eq!(next_change(&mut sub).await.document_id, format!("bike-{}", i));
  }
}

#[tokio::test]
async fn test_reconnects_after_connection_loss() {
  let (client, store) = client();
  let options = ListenOptions::default().reconnect(quick_reconnect());
  let mut sub = client.listen_with(&bikes(1), options).await.unwrap();
  active(&sub).await;
  assert_eq!(sub.reconnect_count(), 0);

  store.disconnect_listeners();
  eventually("reconnect", || sub.reconnect_count() == 1).await;
  assert_eq!(sub.state(), SubscriptionState::Active);
  assert_eq!(store.listener_count(), 1);

  client.create(bike("bike-1", 2)).await.unwrap();
  assert_eq!(next_change(&mut sub).await.document_id, "bike-1");
}

#[tokio::test]
async fn test_server_requested_reconnect() {
  let (client, store) = client();
  let options = ListenOptions::default().reconnect(quick_reconnect());
  let sub = client.listen_with(&bikes(1), options).await.unwrap();
  active(&sub).await;
  let mut states = sub.state_changes();

  store.request_reconnect();
  let saw_reconnecting = timeout(WAIT, async {
    loop {
      if *states.borrow_and_update() == SubscriptionState::Reconnecting {
        return true;
      }
      if states.changed().await.is_err() {
        return false;
      }
    }
  })
  .await
  .unwrap_or(false);
  assert!(saw_reconnecting);

  eventually("reconnect", || sub.reconnect_count() == 1).await;
  assert_eq!(sub.state(), SubscriptionState::Active);
}

#[tokio::test]
async fn test_terminal_error_delivered_once() {
  let (client, store) = client();
  let mut sub = client.listen(&bikes(1)).await.unwrap();
  active(&sub).await;

  store.terminate_listeners("listener evicted");
  match timeout(WAIT, sub.next()).await.unwrap() {
    Some(Err(SubscriptionError::Rejected(message))) => {
      assert!(message.contains("listener evicted"))
    }
    other => panic!("Expected terminal error, got {:?}", other),
  }
  assert!(sub.next().await.is_none());
  assert!(sub.next().await.is_none());
  assert!(sub.is_closed());
}

#[tokio::test]
async fn test_retries_exhausted() {
  let (client, store) = client();
  store.set_refuse_listeners(true);
  let policy = ReconnectPolicy {
    max_retries: Some(2),
    ..quick_reconnect()
  };
  let options = ListenOptions::default().reconnect(policy);
  let mut sub = client.listen_with(&bikes(1), options).await.unwrap();

  match timeout(WAIT, sub.next()).await.unwrap() {
    Some(Err(SubscriptionError::RetriesExhausted { attempts, .. })) => assert_eq!(attempts, 2),
    other => panic!("Expected RetriesExhausted, got {:?}", other),
  }
  assert!(sub.next().await.is_none());
  assert_eq!(sub.state(), SubscriptionState::Closed);
  assert!(!sub.wait_for(SubscriptionState::Active).await);
}

#[tokio::test]
async fn test_unbound_parameter_fails_fast() {
  let (client, _) = client();
  let spec = QuerySpec::new(r#"_type == "comment" && authorId != $ownerId"#);
  match client.listen(&spec).await {
    Err(Error::Query(QueryError::UnknownParameter(name))) => assert_eq!(name, "ownerId"),
    other => panic!("Expected UnknownParameter, got {:?}", other.map(|s| s.id().to_string())),
  }
}

#[tokio::test]
async fn test_malformed_filter_is_rejected() {
  let (client, _) = client();
  let mut sub = client.listen(&QuerySpec::new("_type == ")).await.unwrap();
  match timeout(WAIT, sub.next()).await.unwrap() {
    Some(Err(SubscriptionError::Rejected(_))) => {}
    other => panic!("Expected rejection, got {:?}", other),
  }
  assert!(sub.is_closed());
}
