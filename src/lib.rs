//! PineDB Rust Client SDK
//!
//! A client for PineDB, a hosted document store with optimistic
//! concurrency and realtime listeners.
//!
//! # Example
//!
//! ```no_run
//! use pinedb::{ClientConfig, Document, PineDB, QuerySpec};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> pinedb::Result<()> {
//!     let client = PineDB::new(
//!         ClientConfig::new("abc123", "production").with_token("sk-token"),
//!     )?;
//!
//!     // Create a document
//!     let outcome = client
//!         .create(Document::new("bike").with_field("name", "Sprinter").with_field("seats", 2))
//!         .await?;
//!     let id = outcome.first_id().unwrap_or_default().to_string();
//!
//!     // Patch it, guarded by the revision we just wrote
//!     let revision = outcome.revision(&id).unwrap_or_default().to_string();
//!     client
//!         .patch(&id)
//!         .if_revision_id(revision)?
//!         .inc("seats", 1)?
//!         .set(json!({"color": "red"}))?
//!         .commit()
//!         .await?;
//!
//!     // Query
//!     let spec = QuerySpec::new("*[_type == \"bike\" && seats >= $minSeats]")
//!         .param("minSeats", 2);
//!     let bikes = client.fetch(&spec).await?;
//!     println!("Found: {:?}", bikes);
//!
//!     // Listen for changes
//!     let mut sub = client.listen(&spec).await?;
//!     while let Some(change) = sub.next().await {
//!         println!("Change: {:?}", change?);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod assets;
mod client;
pub mod config;
pub mod document;
mod error;
pub mod memory;
pub mod mutation;
pub mod patch;
pub mod path;
pub mod protocol;
pub mod query;
pub mod subscription;
pub mod transaction;
pub mod transport;

pub use assets::Assets;
pub use client::PineDB;
pub use config::{ClientConfig, ConfigPatch};
pub use document::Document;
pub use error::{Error, MutationError, QueryError, Result, SubscriptionError, TransportError};
pub use memory::MemoryStore;
pub use mutation::{MutationOptions, MutationOutcome};
pub use patch::{InsertPosition, Patch, PatchOperation};
pub use protocol::{AssetKind, Params, ServerError, ServerErrorKind, UploadOptions};
pub use query::{FetchOptions, QueryBuilder, QuerySpec};
pub use subscription::{
  ChangeKind, ChangeNotification, ChangePayload, ListenOptions, OverflowPolicy, PayloadMode,
  ReconnectPolicy, Subscription, SubscriptionState,
};
pub use transaction::{Mutation, Transaction};
pub use transport::tcp::ConnectOptions;
pub use transport::Transport;
