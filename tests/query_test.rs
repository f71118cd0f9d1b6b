//! Query tests for the PineDB Rust SDK.

use pinedb::query::{field, not, or, QueryBuilder, SortDir};
use pinedb::{ClientConfig, Document, Error, FetchOptions, MemoryStore, PineDB, QueryError, QuerySpec};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize, PartialEq)]
struct Bike {
  name: String,
  seats: i64,
}

async fn seeded() -> PineDB {
  let client = PineDB::memory(
    ClientConfig::new("test-project", "production"),
    MemoryStore::new(),
  )
  .unwrap();
  let mut tx = client.transaction();
  for (id, name, seats) in [
    ("b1", "Tandem", 2),
    ("b2", "Unicycle", 1),
    ("b3", "Trike", 3),
    ("b4", "Racer", 1),
  ] {
    tx.create(
      Document::new("bike")
        .with_id(id)
        .with_field("name", name)
        .with_field("seats", seats),
    )
    .unwrap();
  }
  tx.create(Document::new("comment").with_id("c1").with_field("authorId", "u1"))
    .unwrap();
  tx.commit().await.unwrap();
  client
}

fn names(rows: &[serde_json::Value]) -> Vec<&str> {
  rows.iter().filter_map(|r| r["name"].as_str()).collect()
}

#[tokio::test]
async fn test_fetch_with_params() {
  let client = seeded().await;
  let spec = QuerySpec::new(r#"*[_type == "bike" && seats >= $minSeats]"#).param("minSeats", 2);
  let rows = client.fetch(&spec).await.unwrap();
  assert_eq!(names(&rows), vec!["Tandem", "Trike"]);
}

#[tokio::test]
async fn test_fetch_order_slice_projection() {
  let client = seeded().await;
  let spec = QuerySpec::new(r#"*[_type == "bike"] | order(seats desc, name asc) [0...3] {name, seats}"#);
  let rows = client.fetch(&spec).await.unwrap();
  assert_eq!(
    rows,
    vec![
      json!({"name": "Trike", "seats": 3}),
      json!({"name": "Tandem", "seats": 2}),
      json!({"name": "Racer", "seats": 1}),
    ]
  );
}

#[tokio::test]
async fn test_fetch_as_decodes_rows() {
  let client = seeded().await;
  let spec = QuerySpec::new(r#"*[_type == "bike" && seats == $n] {name, seats}"#).param("n", 3);
  let bikes: Vec<Bike> = client.fetch_as(&spec).await.unwrap();
  assert_eq!(
    bikes,
    vec![Bike {
      name: "Trike".to_string(),
      seats: 3
    }]
  );
}

#[tokio::test]
async fn test_fetch_as_reports_decode_errors() {
  let client = seeded().await;
  let spec = QuerySpec::new(r#"*[_type == "comment"]"#);
  let result = client.fetch_as::<Bike>(&spec).await;
  assert!(matches!(result, Err(Error::Query(QueryError::Decode(_)))));
}

#[tokio::test]
async fn test_cached_reads_see_the_same_data() {
  let client = seeded().await;
  let spec = QuerySpec::new(r#"*[_type == "bike"]"#);
  let rows = client
    .fetch_with(&spec, FetchOptions::default().cached(true))
    .await
    .unwrap();
  assert_eq!(rows.len(), 4);
}

#[tokio::test]
async fn test_unbound_parameter_is_caught_locally() {
  let client = seeded().await;
  let spec = QuerySpec::new("*[seats >= $minSeats]");
  match client.fetch(&spec).await {
    Err(Error::Query(QueryError::UnknownParameter(name))) => assert_eq!(name, "minSeats"),
    other => panic!("Expected UnknownParameter, got {:?}", other),
  }
}

#[tokio::test]
async fn test_syntax_errors_carry_position() {
  let client = seeded().await;

  let unterminated = QuerySpec::new(r#"*[_type == "bike]"#);
  match client.fetch(&unterminated).await {
    Err(Error::Query(QueryError::SyntaxError { position, .. })) => assert_eq!(position, 11),
    other => panic!("Expected SyntaxError, got {:?}", other),
  }

  let unclosed = QuerySpec::new(r#"*[_type == "bike""#);
  match client.fetch(&unclosed).await {
    Err(Error::Query(QueryError::SyntaxError { position, .. })) => assert_eq!(position, 17),
    other => panic!("Expected SyntaxError, got {:?}", other),
  }
}

#[tokio::test]
async fn test_builder_runs_against_store() {
  let client = seeded().await;
  let spec = QueryBuilder::of_type("bike")
    .find(or(vec![field("seats").gte(3), field("name").eq("Racer")]))
    .order("name", SortDir::Asc)
    .build();
  let rows = client.fetch(&spec).await.unwrap();
  assert_eq!(names(&rows), vec!["Racer", "Trike"]);

  let spec = QueryBuilder::of_type("bike")
    .find(not(field("name").is_in(vec![json!("Tandem"), json!("Trike")])))
    .order("seats", SortDir::Desc)
    .order("name", SortDir::Asc)
    .skip(1)
    .limit(1)
    .project(["name"])
    .build();
  let rows = client.fetch(&spec).await.unwrap();
  assert_eq!(rows, vec![json!({"name": "Unicycle"})]);
}

#[tokio::test]
async fn test_hostile_values_are_data() {
  let client = seeded().await;
  let spec = QueryBuilder::all()
    .find(field("name").eq("\"] | order(name) [0"))
    .build();
  assert!(client.fetch(&spec).await.unwrap().is_empty());
}

#[test]
fn test_referenced_params() {
  let names = pinedb::query::referenced_params(r#"*[a == $x && b == "$notParam" && c in $y && d == $x]"#)
    .unwrap();
  assert_eq!(names, vec!["x".to_string(), "y".to_string()]);
}
