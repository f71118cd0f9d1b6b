//! Submitting frozen mutation lists and reconciling the result.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::config::ConfigHandle;
use crate::document::{validate_id, Document, RESERVED_FIELDS};
use crate::error::MutationError;
use crate::patch::PatchOperation;
use crate::path::Path;
use crate::protocol::{DocumentResult, MutateResponse, Operation, Request, RequestFrame, Response};
use crate::transaction::Mutation;
use crate::transport::Transport;

/// Per-call settings for a mutation.
#[derive(Debug, Clone, Default)]
pub struct MutationOptions {
  /// Ask the store to include the resulting documents in the outcome.
  pub return_documents: bool,
  pub transaction_id: Option<String>,
  /// Overrides the configured timeout.
  pub timeout: Option<Duration>,
}

impl MutationOptions {
  pub fn return_documents(mut self, yes: bool) -> Self {
    self.return_documents = yes;
    self
  }

  pub fn transaction_id(mut self, id: impl Into<String>) -> Self {
    self.transaction_id = Some(id.into());
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// Result of a committed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
  pub transaction_id: String,
  /// One entry per affected document, in first-touched order.
  pub results: Vec<DocumentResult>,
}

impl MutationOutcome {
  pub fn result(&self, id: &str) -> Option<&DocumentResult> {
    self.results.iter().find(|r| r.id == id)
  }

  /// The resulting document, when documents were requested.
  pub fn document(&self, id: &str) -> Option<&Document> {
    self.result(id).and_then(|r| r.document.as_ref())
  }

  pub fn revision(&self, id: &str) -> Option<&str> {
    self.result(id).and_then(|r| r.revision.as_deref())
  }

  /// Id of the first affected document; handy for single-document mutations.
  pub fn first_id(&self) -> Option<&str> {
    self.results.first().map(|r| r.id.as_str())
  }

  pub fn ids(&self) -> impl Iterator<Item = &str> {
    self.results.iter().map(|r| r.id.as_str())
  }

  pub fn changed(&self) -> impl Iterator<Item = &DocumentResult> {
    self.results.iter().filter(|r| r.operation != Operation::None)
  }
}

impl From<MutateResponse> for MutationOutcome {
  fn from(response: MutateResponse) -> Self {
    Self {
      transaction_id: response.transaction_id,
      results: response.results,
    }
  }
}

/// Sends mutation lists through a [`Transport`].
///
/// Holds no locks across calls. Conflicting concurrent writers are resolved
/// by the store's revision checks, never on the client.
#[derive(Clone)]
pub struct MutationSubmitter {
  transport: Arc<dyn Transport>,
  config: ConfigHandle,
}

impl MutationSubmitter {
  pub fn new(transport: Arc<dyn Transport>, config: ConfigHandle) -> Self {
    Self { transport, config }
  }

  /// Validate locally, then submit the list as one atomic unit.
  ///
  /// Nothing is retried here. [`MutationError::TransportFailure`] is safe to
  /// retry; a replay with the same transaction id is deduplicated by the store.
  pub async fn submit(
    &self,
    mutations: Vec<Mutation>,
    options: MutationOptions,
  ) -> Result<MutationOutcome, MutationError> {
    validate_mutations(&mutations)?;

    let config = self.config.get();
    let timeout = options.timeout.unwrap_or(config.timeout);
    let count = mutations.len();
    let frame = RequestFrame::new(
      config.dataset,
      Request::Mutate {
        mutations,
        transaction_id: options.transaction_id,
        return_documents: options.return_documents,
      },
    );
    let request_id = frame.id.clone();
    debug!("submitting {} mutation(s) as request {}", count, request_id);

    let response = tokio::time::timeout(timeout, self.transport.send(frame))
      .await
      .map_err(|_| {
        warn!("mutation request {} timed out after {:?}", request_id, timeout);
        MutationError::TransportFailure(format!("timed out after {:?}", timeout))
      })??;

    match response {
      Response::Mutated(result) => {
        debug!(
          "request {} committed as transaction {}",
          request_id, result.transaction_id
        );
        Ok(result.into())
      }
      Response::Error(err) => {
        debug!("request {} rejected: {}", request_id, err);
        Err(err.into())
      }
      other => Err(MutationError::TransportFailure(format!(
        "unexpected response to mutate: {:?}",
        other
      ))),
    }
  }
}

impl fmt::Debug for MutationSubmitter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationSubmitter")
      .field("dataset", &self.config.get().dataset)
      .finish_non_exhaustive()
  }
}

/// Checks that never need the store.
pub fn validate_mutations(mutations: &[Mutation]) -> Result<(), MutationError> {
  if mutations.is_empty() {
    return Err(invalid("no mutations to submit"));
  }
  for mutation in mutations {
    match mutation {
      Mutation::Create(doc) => {
        require_type(doc)?;
        if let Some(id) = doc.id() {
          validate_id(id).map_err(MutationError::ValidationFailure)?;
        }
      }
      Mutation::CreateOrReplace(doc) | Mutation::CreateIfNotExists(doc) => {
        require_type(doc)?;
        let id = doc
          .id()
          .ok_or_else(|| invalid(format!("{} requires an _id", mutation.kind())))?;
        validate_id(id).map_err(MutationError::ValidationFailure)?;
      }
      Mutation::Delete { id } => validate_id(id).map_err(MutationError::ValidationFailure)?,
      Mutation::Patch(patch) => {
        validate_id(&patch.id).map_err(MutationError::ValidationFailure)?;
        if patch.operations.is_empty() {
          return Err(invalid(format!("patch for {} has no operations", patch.id)));
        }
        for op in &patch.operations {
          validate_operation(op)?;
        }
      }
    }
  }
  Ok(())
}

fn require_type(doc: &Document) -> Result<(), MutationError> {
  match doc.doc_type() {
    Some(t) if !t.is_empty() => Ok(()),
    _ => Err(invalid("document is missing _type")),
  }
}

fn validate_operation(op: &PatchOperation) -> Result<(), MutationError> {
  match op {
    PatchOperation::Set { fields } | PatchOperation::SetIfMissing { fields } => {
      fields.keys().try_for_each(|p| writable_path(p))
    }
    PatchOperation::Unset { paths } => paths.iter().try_for_each(|p| writable_path(p)),
    PatchOperation::Inc { path, by } => {
      if !by.is_finite() {
        return Err(invalid(format!("increment of {} must be finite", path)));
      }
      writable_path(path)
    }
    PatchOperation::Insert { path, items, .. } => {
      if items.is_empty() {
        return Err(invalid(format!("insert at {} has no items", path)));
      }
      writable_path(path)
    }
    PatchOperation::IfRevisionId { revision } => {
      if revision.is_empty() {
        return Err(invalid("revision precondition must not be empty"));
      }
      Ok(())
    }
  }
}

fn writable_path(raw: &str) -> Result<(), MutationError> {
  let path = Path::parse(raw).map_err(|e| invalid(e.to_string()))?;
  if RESERVED_FIELDS.contains(&path.root()) {
    return Err(invalid(format!("{} is managed by the store", path.root())));
  }
  Ok(())
}

fn invalid(reason: impl Into<String>) -> MutationError {
  MutationError::ValidationFailure(reason.into())
}
