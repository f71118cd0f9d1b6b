//! Document-level mutations and the transaction builder.

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::{Error, Result};
use crate::mutation::{MutationOptions, MutationOutcome, MutationSubmitter};
use crate::patch::{Patch, PatchOperation};

/// A frozen patch: the target document and its ordered operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchMutation {
  pub id: String,
  pub operations: Vec<PatchOperation>,
}

/// One operation inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mutation {
  Create(Document),
  CreateOrReplace(Document),
  CreateIfNotExists(Document),
  Delete { id: String },
  Patch(PatchMutation),
}

impl Mutation {
  /// The id the mutation targets, if known before the store assigns one.
  pub fn document_id(&self) -> Option<&str> {
    match self {
      Mutation::Create(doc) | Mutation::CreateOrReplace(doc) | Mutation::CreateIfNotExists(doc) => {
        doc.id()
      }
      Mutation::Delete { id } => Some(id),
      Mutation::Patch(patch) => Some(&patch.id),
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Mutation::Create(_) => "create",
      Mutation::CreateOrReplace(_) => "createOrReplace",
      Mutation::CreateIfNotExists(_) => "createIfNotExists",
      Mutation::Delete { .. } => "delete",
      Mutation::Patch(_) => "patch",
    }
  }
}

/// Builder for an atomic, ordered list of [`Mutation`]s.
///
/// ```no_run
/// # async fn run(client: &pinedb::PineDB) -> pinedb::Result<()> {
/// use pinedb::Document;
/// use serde_json::json;
///
/// let mut name_patch = client.patch("bike-310");
/// name_patch.set(json!({"name": "A Bike To Go"}))?;
/// name_patch.freeze();
///
/// client
///   .transaction()
///   .create(Document::new("bike").with_field("seats", 2))?
///   .delete("bike-123")?
///   .patch(&name_patch)?
///   .patch_with("bike-200", |p| p.set(json!({"inStock": false})))?
///   .commit()
///   .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Transaction {
  mutations: Vec<Mutation>,
  transaction_id: Option<String>,
  committed: bool,
  submitter: Option<MutationSubmitter>,
}

impl Transaction {
  /// A detached transaction; use [`Transaction::mutations`] to hand it elsewhere.
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn bound(submitter: MutationSubmitter) -> Self {
    Self {
      submitter: Some(submitter),
      ..Self::default()
    }
  }

  /// Attach a caller-chosen transaction id. Resubmitting the same id is
  /// treated by the store as a replay of the original commit.
  pub fn with_transaction_id(mut self, id: impl Into<String>) -> Self {
    self.transaction_id = Some(id.into());
    self
  }

  pub fn mutations(&self) -> &[Mutation] {
    &self.mutations
  }

  pub fn len(&self) -> usize {
    self.mutations.len()
  }

  pub fn is_empty(&self) -> bool {
    self.mutations.is_empty()
  }

  pub fn create(&mut self, doc: Document) -> Result<&mut Self> {
    self.push(Mutation::Create(doc))
  }

  pub fn create_or_replace(&mut self, doc: Document) -> Result<&mut Self> {
    self.push(Mutation::CreateOrReplace(doc))
  }

  pub fn create_if_not_exists(&mut self, doc: Document) -> Result<&mut Self> {
    self.push(Mutation::CreateIfNotExists(doc))
  }

  pub fn delete(&mut self, id: impl Into<String>) -> Result<&mut Self> {
    self.push(Mutation::Delete { id: id.into() })
  }

  /// Embed a patch. It must have been frozen first.
  pub fn patch(&mut self, patch: &Patch) -> Result<&mut Self> {
    let frozen = patch
      .frozen()
      .ok_or_else(|| Error::UnfinishedPatch(patch.id().to_string()))?;
    self.push(Mutation::Patch(frozen))
  }

  /// Build a patch for `id` in place. The transaction freezes it.
  pub fn patch_with<F>(&mut self, id: impl Into<String>, build: F) -> Result<&mut Self>
  where
    F: FnOnce(&mut Patch) -> Result<&mut Patch>,
  {
    self.ensure_open()?;
    let mut patch = Patch::new(id);
    build(&mut patch)?;
    let frozen = patch.freeze();
    self.push(Mutation::Patch(frozen))
  }

  /// Submit every operation as one atomic unit.
  pub async fn commit(&mut self) -> Result<MutationOutcome> {
    self.commit_with(MutationOptions::default()).await
  }

  pub async fn commit_with(&mut self, mut options: MutationOptions) -> Result<MutationOutcome> {
    self.ensure_open()?;
    let submitter = self.submitter.clone().ok_or_else(|| {
      Error::InvalidState("transaction is not bound to a client".to_string())
    })?;
    if options.transaction_id.is_none() {
      options.transaction_id = self.transaction_id.clone();
    }
    self.committed = true;
    Ok(submitter.submit(self.mutations.clone(), options).await?)
  }

  fn push(&mut self, mutation: Mutation) -> Result<&mut Self> {
    self.ensure_open()?;
    self.mutations.push(mutation);
    Ok(self)
  }

  fn ensure_open(&self) -> Result<()> {
    if self.committed {
      return Err(Error::InvalidState(
        "transaction was already committed".to_string(),
      ));
    }
    Ok(())
  }
}
