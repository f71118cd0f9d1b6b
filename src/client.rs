//! The `PineDB` client.

use std::fmt;
use std::sync::Arc;

use log::debug;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::assets::Assets;
use crate::config::{ClientConfig, ConfigHandle, ConfigPatch};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::memory::MemoryStore;
use crate::mutation::{MutationOptions, MutationOutcome, MutationSubmitter};
use crate::patch::Patch;
use crate::protocol::{Request, RequestFrame, Response};
use crate::query::{FetchOptions, QueryExecutor, QuerySpec};
use crate::subscription::{ListenOptions, Subscription, SubscriptionManager};
use crate::transaction::{Mutation, Transaction};
use crate::transport::http::HttpTransport;
use crate::transport::tcp::{ConnectOptions, TcpTransport};
use crate::transport::Transport;

/// Client for a PineDB dataset.
///
/// Cheap to clone; clones share configuration and transport.
#[derive(Clone)]
pub struct PineDB {
  config: ConfigHandle,
  transport: Arc<dyn Transport>,
  submitter: MutationSubmitter,
  queries: QueryExecutor,
  subscriptions: SubscriptionManager,
}

impl PineDB {
  /// Client for the hosted HTTP API.
  pub fn new(config: ClientConfig) -> Result<Self> {
    config.validate()?;
    let handle = ConfigHandle::new(config);
    let transport = HttpTransport::new(handle.clone())?;
    Ok(Self::assemble(handle, Arc::new(transport)))
  }

  /// Client speaking the native TCP protocol. Without an explicit
  /// `auth_token` the handshake uses the configured token.
  pub async fn connect(config: ClientConfig, mut options: ConnectOptions) -> Result<Self> {
    config.validate()?;
    if options.auth_token.is_none() {
      options.auth_token = config.token.clone();
    }
    let transport = TcpTransport::connect(options).await?;
    Ok(Self::assemble(ConfigHandle::new(config), Arc::new(transport)))
  }

  /// Client over any [`Transport`].
  pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
    config.validate()?;
    Ok(Self::assemble(ConfigHandle::new(config), transport))
  }

  /// Client backed by an in-process [`MemoryStore`].
  pub fn memory(config: ClientConfig, store: MemoryStore) -> Result<Self> {
    Self::with_transport(config, Arc::new(store))
  }

  fn assemble(config: ConfigHandle, transport: Arc<dyn Transport>) -> Self {
    Self {
      submitter: MutationSubmitter::new(Arc::clone(&transport), config.clone()),
      queries: QueryExecutor::new(Arc::clone(&transport), config.clone()),
      subscriptions: SubscriptionManager::new(Arc::clone(&transport), config.clone()),
      config,
      transport,
    }
  }

  /// The current configuration.
  pub fn config(&self) -> ClientConfig {
    self.config.get()
  }

  /// Validate and merge a partial update. Affects this client and its clones.
  pub fn set_config(&self, patch: ConfigPatch) -> Result<ClientConfig> {
    let next = self.config.update(patch)?;
    debug!("configuration updated: {:?}", next);
    Ok(next)
  }

  /// Run a query and return the raw result rows.
  pub async fn fetch(&self, spec: &QuerySpec) -> Result<Vec<Value>> {
    self.fetch_with(spec, FetchOptions::default()).await
  }

  pub async fn fetch_with(&self, spec: &QuerySpec, options: FetchOptions) -> Result<Vec<Value>> {
    Ok(self.queries.fetch(spec, options).await?)
  }

  /// Run a query and decode each row into `T`.
  pub async fn fetch_as<T: DeserializeOwned>(&self, spec: &QuerySpec) -> Result<Vec<T>> {
    Ok(self.queries.fetch_as(spec, FetchOptions::default()).await?)
  }

  pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
    let mut docs = self.queries.get_documents(&[id.to_string()]).await?;
    Ok(docs.pop().flatten())
  }

  /// Fetch several documents. The result lines up with `ids`.
  pub async fn get_documents<I, S>(&self, ids: I) -> Result<Vec<Option<Document>>>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
    Ok(self.queries.get_documents(&ids).await?)
  }

  /// Create a document. Fails with `AlreadyExists` if its id is taken.
  pub async fn create(&self, doc: Document) -> Result<MutationOutcome> {
    self.single(Mutation::Create(doc)).await
  }

  pub async fn create_or_replace(&self, doc: Document) -> Result<MutationOutcome> {
    self.single(Mutation::CreateOrReplace(doc)).await
  }

  /// Create a document unless one with the same id exists.
  pub async fn create_if_not_exists(&self, doc: Document) -> Result<MutationOutcome> {
    self.single(Mutation::CreateIfNotExists(doc)).await
  }

  pub async fn delete(&self, id: impl Into<String>) -> Result<MutationOutcome> {
    self.single(Mutation::Delete { id: id.into() }).await
  }

  /// Submit a prepared mutation list as one transaction.
  pub async fn mutate(
    &self,
    mutations: Vec<Mutation>,
    options: MutationOptions,
  ) -> Result<MutationOutcome> {
    Ok(self.submitter.submit(mutations, options).await?)
  }

  async fn single(&self, mutation: Mutation) -> Result<MutationOutcome> {
    self
      .mutate(vec![mutation], MutationOptions::default().return_documents(true))
      .await
  }

  /// Start a patch against document `id`.
  pub fn patch(&self, id: impl Into<String>) -> Patch {
    Patch::bound(id, self.submitter.clone())
  }

  /// Start a transaction.
  pub fn transaction(&self) -> Transaction {
    Transaction::bound(self.submitter.clone())
  }

  /// Subscribe to changes of documents matching `spec`.
  pub async fn listen(&self, spec: &QuerySpec) -> Result<Subscription> {
    self.listen_with(spec, ListenOptions::default()).await
  }

  pub async fn listen_with(&self, spec: &QuerySpec, options: ListenOptions) -> Result<Subscription> {
    Ok(self.subscriptions.subscribe(spec, options)?)
  }

  pub fn assets(&self) -> Assets {
    Assets::new(Arc::clone(&self.transport), self.config.clone())
  }

  /// Round-trip a no-op request.
  pub async fn ping(&self) -> Result<()> {
    let config = self.config.get();
    let frame = RequestFrame::new(config.dataset, Request::Ping);
    let response = tokio::time::timeout(config.timeout, self.transport.send(frame))
      .await
      .map_err(|_| Error::Timeout)?
      .map_err(|e| Error::Connection(e.to_string()))?;
    match response {
      Response::Pong => Ok(()),
      other => Err(Error::Connection(format!("unexpected response to ping: {:?}", other))),
    }
  }
}

impl fmt::Debug for PineDB {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PineDB")
      .field("config", &self.config.get())
      .finish_non_exhaustive()
  }
}
