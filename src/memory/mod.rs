//! An in-process store speaking the same [`Transport`] contract as the remote
//! service. Useful for tests and local development.
//!
//! It applies transactions atomically, assigns revisions, evaluates a small
//! subset of the filter language and fans committed changes out to listeners.
//!
//! ```
//! # async fn run() -> pinedb::Result<()> {
//! use pinedb::{ClientConfig, Document, PineDB};
//! use pinedb::memory::MemoryStore;
//!
//! let client = PineDB::memory(ClientConfig::new("demo", "production"), MemoryStore::new())?;
//! let outcome = client.create(Document::new("bike").with_field("seats", 2)).await?;
//! assert!(outcome.first_id().is_some());
//! # Ok(())
//! # }
//! ```

mod apply;
mod filter;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use futures::future::BoxFuture;
use futures::StreamExt;
use log::{debug, info};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use filter::Query;

use crate::assets;
use crate::document::{
  generate_id, generate_revision, Document, CREATED_AT_FIELD, ID_FIELD, REVISION_FIELD,
  UPDATED_AT_FIELD,
};
use crate::error::TransportError;
use crate::mutation::validate_mutations;
use crate::protocol::{
  AssetKind, DocumentResult, ListenEvent, ListenRequest, MutateResponse, MutationEvent, Operation,
  Params, Request, RequestFrame, Response, ServerError, ServerErrorKind, Transition, UploadOptions,
};
use crate::query::referenced_params;
use crate::transaction::Mutation;
use crate::transport::{ListenStream, Transport};

/// Transactions remembered per dataset for replay detection.
pub const DEFAULT_REPLAY_WINDOW: usize = 1024;

#[derive(Default)]
struct Dataset {
  documents: BTreeMap<String, Document>,
  /// Recently committed transactions by id, for replay detection.
  transactions: HashMap<String, MutateResponse>,
  /// Commit order of `transactions`, oldest first.
  replay_order: VecDeque<String>,
}

impl Dataset {
  fn remember(&mut self, response: MutateResponse, window: usize) {
    let id = response.transaction_id.clone();
    if self.transactions.insert(id.clone(), response).is_none() {
      self.replay_order.push_back(id);
    }
    while self.replay_order.len() > window {
      if let Some(oldest) = self.replay_order.pop_front() {
        self.transactions.remove(&oldest);
      }
    }
  }
}

struct Listener {
  id: String,
  dataset: String,
  query: Query,
  params: Params,
  include_result: bool,
  include_mutations: bool,
  tx: mpsc::UnboundedSender<Result<ListenEvent, TransportError>>,
}

impl Listener {
  fn matches(&self, doc: Option<&Document>) -> bool {
    doc.is_some_and(|doc| {
      self
        .query
        .matches(&Value::Object(doc.fields().clone()), &self.params)
        .unwrap_or(false)
    })
  }

  fn event_for(
    &self,
    id: &str,
    before: Option<&Document>,
    after: Option<&Document>,
    transaction_id: &str,
    mutations: &[Mutation],
  ) -> Option<MutationEvent> {
    let transition = match (self.matches(before), self.matches(after)) {
      (false, true) => Transition::Appear,
      (true, true) => Transition::Update,
      (true, false) => Transition::Disappear,
      (false, false) => return None,
    };
    Some(MutationEvent {
      document_id: id.to_string(),
      transition,
      transaction_id: transaction_id.to_string(),
      revision: after.and_then(Document::revision).map(str::to_string),
      previous_revision: before.and_then(Document::revision).map(str::to_string),
      result: if self.include_result {
        after.cloned()
      } else {
        None
      },
      mutations: self.include_mutations.then(|| mutations.to_vec()),
    })
  }
}

#[derive(Default)]
struct State {
  datasets: HashMap<String, Dataset>,
  listeners: Vec<Listener>,
  read_only: bool,
  refuse_listeners: bool,
  replay_window: Option<usize>,
}

/// Shared handle to an in-memory store. Clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
  state: Arc<Mutex<State>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// A store that remembers the last `window` transaction ids per dataset
  /// instead of [`DEFAULT_REPLAY_WINDOW`].
  pub fn with_replay_window(window: usize) -> Self {
    let store = Self::default();
    store.lock().replay_window = Some(window);
    store
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Answer one request.
  pub fn handle(&self, frame: RequestFrame) -> Response {
    let RequestFrame {
      id,
      dataset,
      request,
    } = frame;
    debug!("memory store handling {} request {}", request.name(), id);
    let result = match request {
      Request::Query { query, params, .. } => self
        .query(&dataset, &query, &params)
        .map(|result| Response::QueryResult { result }),
      Request::GetDocuments { ids } => Ok(Response::Documents {
        documents: self.get_documents(&dataset, &ids),
      }),
      Request::Mutate {
        mutations,
        transaction_id,
        return_documents,
      } => self
        .mutate(&dataset, mutations, transaction_id, return_documents)
        .map(Response::Mutated),
      Request::UploadAsset {
        kind,
        data,
        options,
      } => self
        .upload(&dataset, kind, &data, &options)
        .map(|document| Response::Asset { document }),
      Request::Ping => Ok(Response::Pong),
    };
    result.unwrap_or_else(Response::Error)
  }

  pub fn query(&self, dataset: &str, query: &str, params: &Params) -> Result<Vec<Value>, ServerError> {
    let parsed = Query::parse(query)?;
    for name in referenced_params(query).unwrap_or_default() {
      if !params.contains_key(&name) {
        return Err(ServerError::new(ServerErrorKind::UnknownParameter, name));
      }
    }
    let state = self.lock();
    let docs: Vec<Value> = state
      .datasets
      .get(dataset)
      .map(|ds| ds.documents.values().map(|d| d.clone().into_value()).collect())
      .unwrap_or_default();
    parsed.run(&docs, params)
  }

  pub fn get_documents(&self, dataset: &str, ids: &[String]) -> Vec<Option<Document>> {
    let state = self.lock();
    let ds = state.datasets.get(dataset);
    ids
      .iter()
      .map(|id| ds.and_then(|ds| ds.documents.get(id)).cloned())
      .collect()
  }

  /// Snapshot of one document.
  pub fn document(&self, dataset: &str, id: &str) -> Option<Document> {
    self
      .lock()
      .datasets
      .get(dataset)
      .and_then(|ds| ds.documents.get(id).cloned())
  }

  /// Number of documents in a dataset.
  pub fn len(&self, dataset: &str) -> usize {
    self
      .lock()
      .datasets
      .get(dataset)
      .map_or(0, |ds| ds.documents.len())
  }

  pub fn is_empty(&self, dataset: &str) -> bool {
    self.len(dataset) == 0
  }

  /// Apply `mutations` atomically. Either every mutation is applied or none.
  pub fn mutate(
    &self,
    dataset: &str,
    mutations: Vec<Mutation>,
    transaction_id: Option<String>,
    return_documents: bool,
  ) -> Result<MutateResponse, ServerError> {
    validate_mutations(&mutations)
      .map_err(|e| ServerError::new(ServerErrorKind::Validation, e.to_string()))?;

    let mut guard = self.lock();
    if guard.read_only {
      return Err(ServerError::new(
        ServerErrorKind::PermissionDenied,
        "dataset is read-only",
      ));
    }
    let State {
      datasets,
      listeners,
      replay_window,
      ..
    } = &mut *guard;
    let window = replay_window.unwrap_or(DEFAULT_REPLAY_WINDOW);
    let ds = datasets.entry(dataset.to_string()).or_default();

    if let Some(done) = transaction_id.as_ref().and_then(|id| ds.transactions.get(id)) {
      debug!("transaction {} replayed", done.transaction_id);
      return Ok(done.clone());
    }
    let transaction_id = transaction_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut working = ds.documents.clone();
    let mut touched: Vec<String> = Vec::new();
    let mut changed: HashSet<String> = HashSet::new();
    let mut per_document: HashMap<String, Vec<Mutation>> = HashMap::new();
    for mutation in &mutations {
      let (id, did_change) = apply_mutation(&mut working, mutation)?;
      if !touched.contains(&id) {
        touched.push(id.clone());
      }
      if did_change {
        changed.insert(id.clone());
      }
      per_document.entry(id).or_default().push(mutation.clone());
    }

    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut results = Vec::with_capacity(touched.len());
    for id in &touched {
      let before = ds.documents.get(id);
      let did_change = changed.contains(id);
      if did_change {
        if let Some(doc) = working.get_mut(id) {
          let created = before
            .and_then(|b| b.get(CREATED_AT_FIELD).cloned())
            .unwrap_or_else(|| Value::String(now.clone()));
          doc.insert(CREATED_AT_FIELD, created);
          doc.insert(UPDATED_AT_FIELD, now.clone());
          doc.insert(REVISION_FIELD, generate_revision());
        }
      }
      let after = working.get(id);
      let operation = match (did_change, before.is_some(), after.is_some()) {
        (true, false, true) => Operation::Create,
        (true, true, true) => Operation::Update,
        (true, true, false) => Operation::Delete,
        _ => Operation::None,
      };
      results.push(DocumentResult {
        id: id.clone(),
        operation,
        revision: after.and_then(Document::revision).map(str::to_string),
        document: if return_documents { after.cloned() } else { None },
      });
    }

    listeners.retain(|listener| {
      if listener.dataset != dataset {
        return true;
      }
      for id in touched.iter().filter(|id| changed.contains(*id)) {
        let mutations = per_document.get(id).map(Vec::as_slice).unwrap_or_default();
        let event = listener.event_for(
          id,
          ds.documents.get(id),
          working.get(id),
          &transaction_id,
          mutations,
        );
        if let Some(event) = event {
          if listener.tx.send(Ok(ListenEvent::Mutation(event))).is_err() {
            info!("listener {} went away", listener.id);
            return false;
          }
        }
      }
      true
    });

    let response = MutateResponse {
      transaction_id: transaction_id.clone(),
      results,
    };
    ds.documents = working;
    ds.remember(response.clone(), window);
    debug!(
      "committed transaction {} touching {} document(s)",
      transaction_id,
      touched.len()
    );
    Ok(response)
  }

  fn upload(
    &self,
    dataset: &str,
    kind: AssetKind,
    data: &[u8],
    options: &UploadOptions,
  ) -> Result<Document, ServerError> {
    let doc = assets::describe(kind, data, options);
    let id = doc.id().unwrap_or_default().to_string();
    let response = self.mutate(dataset, vec![Mutation::CreateIfNotExists(doc)], None, true)?;
    response
      .results
      .into_iter()
      .find(|r| r.id == id)
      .and_then(|r| r.document)
      .ok_or_else(|| ServerError::new(ServerErrorKind::Internal, "asset was not stored"))
  }

  /// Register a listener. The returned stream starts with a welcome event.
  pub fn listen(&self, dataset: &str, request: ListenRequest) -> Result<ListenStream, TransportError> {
    let query = Query::parse(&request.query).map_err(TransportError::Rejected)?;
    for name in referenced_params(&request.query).unwrap_or_default() {
      if !request.params.contains_key(&name) {
        return Err(TransportError::Rejected(ServerError::new(
          ServerErrorKind::UnknownParameter,
          name,
        )));
      }
    }

    let mut state = self.lock();
    if state.refuse_listeners {
      return Err(TransportError::Disconnected(
        "store is not accepting listeners".to_string(),
      ));
    }
    let (tx, rx) = mpsc::unbounded_channel();
    let id = Uuid::new_v4().to_string();
    // The receiver is alive, so this cannot fail.
    let _ = tx.send(Ok(ListenEvent::Welcome {
      listener_id: id.clone(),
    }));
    info!("listener {} attached to {}", id, dataset);
    state.listeners.push(Listener {
      id,
      dataset: dataset.to_string(),
      query,
      params: request.params,
      include_result: request.include_result,
      include_mutations: request.include_mutations,
      tx,
    });

    Ok(
      futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
      })
      .boxed(),
    )
  }

  pub fn listener_count(&self) -> usize {
    let mut state = self.lock();
    state.listeners.retain(|l| !l.tx.is_closed());
    state.listeners.len()
  }

  /// Reject writes with `PermissionDenied`.
  pub fn set_read_only(&self, read_only: bool) {
    self.lock().read_only = read_only;
  }

  /// Fail new listen requests with a retryable error.
  pub fn set_refuse_listeners(&self, refuse: bool) {
    self.lock().refuse_listeners = refuse;
  }

  /// Drop every listener as if the connection had been lost.
  pub fn disconnect_listeners(&self) {
    self.detach_all(|| Err(TransportError::Disconnected("connection reset".to_string())));
  }

  /// Ask every listener to reconnect, then drop it.
  pub fn request_reconnect(&self) {
    self.detach_all(|| Ok(ListenEvent::Reconnect));
  }

  /// Fail every listener permanently.
  pub fn terminate_listeners(&self, message: &str) {
    self.detach_all(|| {
      Ok(ListenEvent::Error(ServerError::new(
        ServerErrorKind::Internal,
        message,
      )))
    });
  }

  fn detach_all<F>(&self, last: F)
  where
    F: Fn() -> Result<ListenEvent, TransportError>,
  {
    let listeners = std::mem::take(&mut self.lock().listeners);
    for listener in listeners {
      info!("detaching listener {}", listener.id);
      let _ = listener.tx.send(last());
    }
  }
}

/// Apply one mutation to the working set. Returns the affected id and
/// whether anything changed.
fn apply_mutation(
  working: &mut BTreeMap<String, Document>,
  mutation: &Mutation,
) -> Result<(String, bool), ServerError> {
  match mutation {
    Mutation::Create(doc) => {
      let id = doc.id().map(str::to_string).unwrap_or_else(generate_id);
      if working.contains_key(&id) {
        return Err(
          ServerError::new(
            ServerErrorKind::AlreadyExists,
            format!("document {} already exists", id),
          )
          .for_document(&id),
        );
      }
      working.insert(id.clone(), fresh(doc, &id));
      Ok((id, true))
    }
    Mutation::CreateOrReplace(doc) => {
      let id = required_id(doc)?;
      if let Some(existing) = working.get(&id) {
        if existing.doc_type() != doc.doc_type() {
          return Err(
            ServerError::new(
              ServerErrorKind::Validation,
              format!("cannot change the type of {}", id),
            )
            .for_document(&id),
          );
        }
      }
      working.insert(id.clone(), fresh(doc, &id));
      Ok((id, true))
    }
    Mutation::CreateIfNotExists(doc) => {
      let id = required_id(doc)?;
      if working.contains_key(&id) {
        return Ok((id, false));
      }
      working.insert(id.clone(), fresh(doc, &id));
      Ok((id, true))
    }
    Mutation::Delete { id } => {
      let removed = working.remove(id).is_some();
      Ok((id.clone(), removed))
    }
    Mutation::Patch(patch) => {
      let doc = working.get_mut(&patch.id).ok_or_else(|| {
        ServerError::new(
          ServerErrorKind::NotFound,
          format!("document {} not found", patch.id),
        )
        .for_document(&patch.id)
      })?;
      let mut body = Value::Object(std::mem::take(doc.fields_mut()));
      let result = apply::apply_patch(&patch.id, &mut body, &patch.operations);
      if let Value::Object(fields) = body {
        *doc.fields_mut() = fields;
      }
      result?;
      Ok((patch.id.clone(), true))
    }
  }
}

fn required_id(doc: &Document) -> Result<String, ServerError> {
  doc
    .id()
    .map(str::to_string)
    .ok_or_else(|| ServerError::new(ServerErrorKind::Validation, "document is missing _id"))
}

/// Copy of `doc` with its id set and store-managed fields stripped.
fn fresh(doc: &Document, id: &str) -> Document {
  let mut doc = doc.clone();
  doc.insert(ID_FIELD, id);
  doc.remove(REVISION_FIELD);
  doc.remove(CREATED_AT_FIELD);
  doc.remove(UPDATED_AT_FIELD);
  doc
}

impl Transport for MemoryStore {
  fn send(&self, frame: RequestFrame) -> BoxFuture<'_, Result<Response, TransportError>> {
    Box::pin(async move { Ok(self.handle(frame)) })
  }

  fn open_channel(
    &self,
    dataset: String,
    request: ListenRequest,
  ) -> BoxFuture<'_, Result<ListenStream, TransportError>> {
    Box::pin(async move { self.listen(&dataset, request) })
  }
}

impl fmt::Debug for MemoryStore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.lock();
    f.debug_struct("MemoryStore")
      .field("datasets", &state.datasets.len())
      .field("listeners", &state.listeners.len())
      .finish()
  }
}
