//! Basic example demonstrating PineDB Rust SDK usage.
//!
//! Runs against the in-process store so it needs no server. Swap
//! `PineDB::memory` for `PineDB::new` to talk to a hosted project.

use std::time::Duration;

use pinedb::memory::MemoryStore;
use pinedb::{ClientConfig, Document, PineDB, QuerySpec, SubscriptionState};
use serde_json::json;

#[tokio::main]
async fn main() -> pinedb::Result<()> {
  env_logger::init();

  let client = PineDB::memory(ClientConfig::new("demo", "production"), MemoryStore::new())?;
  client.ping().await?;
  println!("Ping successful!");

  // Listen for bikes with room for a passenger
  let spec = QuerySpec::new(r#"_type == "bike" && seats >= $minSeats"#).param("minSeats", 2);
  let mut sub = client.listen(&spec).await?;
  sub.wait_for(SubscriptionState::Active).await;

  // Create a document
  let outcome = client
    .create(
      Document::new("bike")
        .with_id("bike-1")
        .with_field("name", "Sprinter")
        .with_field("seats", 1)
        .with_field("reviews", json!([])),
    )
    .await?;
  let revision = outcome.revision("bike-1").unwrap_or_default().to_string();
  println!("Created bike-1 at revision {}", revision);

  // Patch it, guarded by the revision we just wrote
  client
    .patch("bike-1")
    .if_revision_id(revision)?
    .inc("seats", 1)?
    .append("reviews", vec![json!({"text": "Fast!"})])?
    .commit()
    .await?;

  // Query
  let bikes = client.fetch(&spec).await?;
  println!("Bikes: {}", serde_json::to_string_pretty(&bikes)?);

  // The patch made bike-1 match the listener
  if let Ok(Some(change)) = tokio::time::timeout(Duration::from_secs(1), sub.next()).await {
    let change = change?;
    println!("Change: {:?} {}", change.kind, change.document_id);
  }

  sub.unsubscribe();
  Ok(())
}
