//! Live query subscriptions.
//!
//! Each [`Subscription`] owns one transport channel and a background pump
//! task driving this state machine:
//!
//! ```text
//! Opening ──welcome──▶ Active ──blip──▶ Reconnecting ──welcome──▶ Active
//!    │                   │                  │
//!    └───────────────────┴──fatal / cancel──┴──────▶ Closed
//! ```
//!
//! Delivery is at-most-once. Changes committed while the channel is down are
//! not replayed; a caller that needs a consistent view should re-fetch after
//! observing the return to [`SubscriptionState::Active`] (see
//! [`Subscription::reconnect_count`]). Notifications for one document arrive
//! in commit order; there is no ordering across documents.
//!
//! Notifications are buffered in a bounded queue between the pump and the
//! consumer. When it fills up the [`OverflowPolicy`] decides: `Block` stops
//! reading from the transport until the consumer catches up, `DropOldest`
//! discards the oldest buffered notification.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ConfigHandle;
use crate::document::Document;
use crate::error::{QueryError, SubscriptionError, TransportError};
use crate::protocol::{ListenEvent, ListenRequest, MutationEvent, ServerError, Transition};
use crate::query::QuerySpec;
use crate::transaction::Mutation;
use crate::transport::{ListenStream, Transport};

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
  Opening,
  Active,
  Reconnecting,
  Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Created,
  Updated,
  Deleted,
}

impl From<Transition> for ChangeKind {
  fn from(transition: Transition) -> Self {
    match transition {
      Transition::Appear => ChangeKind::Created,
      Transition::Update => ChangeKind::Updated,
      Transition::Disappear => ChangeKind::Deleted,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangePayload {
  /// The document as it is after the change.
  Snapshot(Document),
  /// The mutations that produced the change.
  Diff(Vec<Mutation>),
}

/// What each notification carries besides the id and kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadMode {
  None,
  #[default]
  Snapshot,
  Diff,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
  pub document_id: String,
  pub kind: ChangeKind,
  pub transaction_id: String,
  /// Revision after the change; `None` for deletions.
  pub revision: Option<String>,
  pub payload: Option<ChangePayload>,
}

impl ChangeNotification {
  fn from_event(event: MutationEvent, mode: PayloadMode) -> Self {
    let kind = ChangeKind::from(event.transition);
    let payload = match mode {
      PayloadMode::None => None,
      PayloadMode::Snapshot if kind != ChangeKind::Deleted => {
        event.result.map(ChangePayload::Snapshot)
      }
      PayloadMode::Snapshot => None,
      PayloadMode::Diff => event.mutations.map(ChangePayload::Diff),
    };
    Self {
      document_id: event.document_id,
      kind,
      transaction_id: event.transaction_id,
      revision: event.revision,
      payload,
    }
  }

  /// The snapshot, when the subscription asked for one.
  pub fn document(&self) -> Option<&Document> {
    match &self.payload {
      Some(ChangePayload::Snapshot(doc)) => Some(doc),
      _ => None,
    }
  }
}

/// What happens when the notification queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
  /// Stop reading from the channel until the consumer makes room.
  #[default]
  Block,
  /// Discard the oldest queued notification.
  DropOldest,
}

/// Exponential backoff settings for re-opening a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
  pub initial_delay: Duration,
  pub max_delay: Duration,
  pub multiplier: f64,
  /// Consecutive failed attempts allowed; `None` retries forever.
  pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
  fn default() -> Self {
    Self {
      initial_delay: Duration::from_millis(250),
      max_delay: Duration::from_secs(30),
      multiplier: 2.0,
      max_retries: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListenOptions {
  pub payload: PayloadMode,
  /// Queue capacity; at least 1.
  pub capacity: usize,
  pub overflow: OverflowPolicy,
  pub reconnect: ReconnectPolicy,
}

impl Default for ListenOptions {
  fn default() -> Self {
    Self {
      payload: PayloadMode::default(),
      capacity: DEFAULT_CAPACITY,
      overflow: OverflowPolicy::default(),
      reconnect: ReconnectPolicy::default(),
    }
  }
}

impl ListenOptions {
  pub fn payload(mut self, payload: PayloadMode) -> Self {
    self.payload = payload;
    self
  }

  pub fn capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity.max(1);
    self
  }

  pub fn overflow(mut self, overflow: OverflowPolicy) -> Self {
    self.overflow = overflow;
    self
  }

  pub fn reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
    self.reconnect = reconnect;
    self
  }
}

struct Backoff {
  policy: ReconnectPolicy,
  attempt: u32,
  current: Duration,
}

impl Backoff {
  fn new(policy: ReconnectPolicy) -> Self {
    let current = policy.initial_delay;
    Self {
      policy,
      attempt: 0,
      current,
    }
  }

  fn reset(&mut self) {
    self.attempt = 0;
    self.current = self.policy.initial_delay;
  }

  /// Delay before the next attempt, or `None` once retries are used up.
  fn next_delay(&mut self) -> Option<Duration> {
    if self
      .policy
      .max_retries
      .is_some_and(|max| self.attempt >= max)
    {
      return None;
    }
    self.attempt += 1;
    let delay = self.current;
    let grown = self.current.as_secs_f64() * self.policy.multiplier.max(1.0);
    self.current = Duration::try_from_secs_f64(grown)
      .unwrap_or(self.policy.max_delay)
      .min(self.policy.max_delay);
    Some(delay)
  }
}

#[derive(Default)]
struct QueueState {
  items: VecDeque<ChangeNotification>,
  failure: Option<SubscriptionError>,
  /// The pump is gone; nothing more will be queued.
  finished: bool,
  /// The caller unsubscribed; nothing more will be delivered.
  cancelled: bool,
}

/// Single-producer, single-consumer bounded queue shared by the pump task
/// and the [`Subscription`] handle.
struct NotificationQueue {
  state: Mutex<QueueState>,
  capacity: usize,
  overflow: OverflowPolicy,
  readable: Notify,
  writable: Notify,
}

impl NotificationQueue {
  fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
    Self {
      state: Mutex::new(QueueState::default()),
      capacity: capacity.max(1),
      overflow,
      readable: Notify::new(),
      writable: Notify::new(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Queue a notification. Returns `false` once the consumer is gone.
  async fn push(&self, notification: ChangeNotification) -> bool {
    let mut pending = Some(notification);
    loop {
      {
        let mut state = self.lock();
        if state.cancelled {
          return false;
        }
        if state.items.len() >= self.capacity && self.overflow == OverflowPolicy::DropOldest {
          if let Some(dropped) = state.items.pop_front() {
            warn!(
              "subscription queue full, dropping notification for {}",
              dropped.document_id
            );
          }
        }
        if state.items.len() < self.capacity {
          if let Some(notification) = pending.take() {
            state.items.push_back(notification);
          }
          drop(state);
          self.readable.notify_one();
          return true;
        }
      }
      self.writable.notified().await;
    }
  }

  fn fail(&self, error: SubscriptionError) {
    {
      let mut state = self.lock();
      if state.cancelled {
        return;
      }
      state.failure = Some(error);
      state.finished = true;
    }
    self.readable.notify_one();
  }

  fn finish(&self) {
    self.lock().finished = true;
    self.readable.notify_one();
  }

  fn cancel(&self) {
    {
      let mut state = self.lock();
      state.cancelled = true;
      state.items.clear();
      state.failure = None;
    }
    self.writable.notify_one();
    self.readable.notify_one();
  }

  async fn pop(&self) -> Option<Result<ChangeNotification, SubscriptionError>> {
    loop {
      {
        let mut state = self.lock();
        if state.cancelled {
          return None;
        }
        if let Some(notification) = state.items.pop_front() {
          drop(state);
          self.writable.notify_one();
          return Some(Ok(notification));
        }
        if let Some(error) = state.failure.take() {
          return Some(Err(error));
        }
        if state.finished {
          return None;
        }
      }
      self.readable.notified().await;
    }
  }

  fn len(&self) -> usize {
    self.lock().items.len()
  }
}

/// Shared, observable subscription state. `Closed` is terminal.
struct StateCell {
  tx: watch::Sender<SubscriptionState>,
  reconnects: AtomicU32,
}

impl StateCell {
  fn set(&self, id: &str, next: SubscriptionState) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == SubscriptionState::Closed || *current == next {
        return false;
      }
      if *current == SubscriptionState::Reconnecting && next == SubscriptionState::Active {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
      }
      *current = next;
      true
    });
    if changed {
      info!("subscription {} is now {:?}", id, next);
    }
  }

  fn get(&self) -> SubscriptionState {
    *self.tx.borrow()
  }
}

/// Opens subscriptions through a [`Transport`].
#[derive(Clone)]
pub struct SubscriptionManager {
  transport: Arc<dyn Transport>,
  config: ConfigHandle,
}

impl SubscriptionManager {
  pub fn new(transport: Arc<dyn Transport>, config: ConfigHandle) -> Self {
    Self { transport, config }
  }

  /// Start listening. Returns as soon as the pump task is running; the
  /// channel itself is opened in the background.
  pub fn subscribe(
    &self,
    spec: &QuerySpec,
    options: ListenOptions,
  ) -> Result<Subscription, QueryError> {
    spec.validate()?;
    let id = Uuid::new_v4().to_string();
    let request = ListenRequest {
      query: spec.query.clone(),
      params: spec.params.clone(),
      include_result: options.payload == PayloadMode::Snapshot,
      include_mutations: options.payload == PayloadMode::Diff,
    };
    let queue = Arc::new(NotificationQueue::new(options.capacity, options.overflow));
    let (tx, rx) = watch::channel(SubscriptionState::Opening);
    let state = Arc::new(StateCell {
      tx,
      reconnects: AtomicU32::new(0),
    });
    let pump = Pump {
      id: id.clone(),
      transport: Arc::clone(&self.transport),
      dataset: self.config.get().dataset,
      request,
      payload: options.payload,
      backoff: Backoff::new(options.reconnect),
      queue: Arc::clone(&queue),
      state: Arc::clone(&state),
    };
    debug!("opening subscription {} for {}", id, spec.query);
    let task = tokio::spawn(pump.run());

    Ok(Subscription {
      id,
      queue,
      state,
      state_rx: rx,
      task: Some(task),
    })
  }
}

impl fmt::Debug for SubscriptionManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SubscriptionManager").finish_non_exhaustive()
  }
}

/// Why one channel session ended.
enum SessionEnd {
  /// The consumer went away.
  Cancelled,
  /// Worth another attempt.
  Interrupted(String),
  /// Give up.
  Fatal(SubscriptionError),
}

struct Pump {
  id: String,
  transport: Arc<dyn Transport>,
  dataset: String,
  request: ListenRequest,
  payload: PayloadMode,
  backoff: Backoff,
  queue: Arc<NotificationQueue>,
  state: Arc<StateCell>,
}

impl Pump {
  async fn run(mut self) {
    loop {
      let end = match self
        .transport
        .open_channel(self.dataset.clone(), self.request.clone())
        .await
      {
        Ok(stream) => self.session(stream).await,
        Err(e) => classify(e),
      };

      let reason = match end {
        SessionEnd::Cancelled => {
          debug!("subscription {} pump stopped", self.id);
          return;
        }
        SessionEnd::Fatal(err) => {
          error!("subscription {} failed: {}", self.id, err);
          self.close(Some(err));
          return;
        }
        SessionEnd::Interrupted(reason) => reason,
      };

      match self.backoff.next_delay() {
        Some(delay) => {
          warn!(
            "subscription {} interrupted ({}), reconnecting in {:?} (attempt {})",
            self.id, reason, delay, self.backoff.attempt
          );
          self.state.set(&self.id, SubscriptionState::Reconnecting);
          tokio::time::sleep(delay).await;
        }
        None => {
          let err = SubscriptionError::RetriesExhausted {
            attempts: self.backoff.attempt,
            last_error: reason,
          };
          error!("subscription {} failed: {}", self.id, err);
          self.close(Some(err));
          return;
        }
      }
    }
  }

  async fn session(&mut self, mut stream: ListenStream) -> SessionEnd {
    while let Some(event) = stream.next().await {
      match event {
        Ok(ListenEvent::Welcome { listener_id }) => {
          debug!("subscription {} attached as listener {}", self.id, listener_id);
          self.backoff.reset();
          self.state.set(&self.id, SubscriptionState::Active);
        }
        Ok(ListenEvent::Mutation(event)) => {
          let notification = ChangeNotification::from_event(event, self.payload);
          if !self.queue.push(notification).await {
            return SessionEnd::Cancelled;
          }
        }
        Ok(ListenEvent::Reconnect) => {
          return SessionEnd::Interrupted("server requested reconnect".to_string())
        }
        Ok(ListenEvent::Error(err)) => return SessionEnd::Fatal(rejected(&err)),
        Err(e) => return classify(e),
      }
    }
    SessionEnd::Interrupted("channel closed".to_string())
  }

  fn close(&self, failure: Option<SubscriptionError>) {
    match failure {
      Some(err) => self.queue.fail(err),
      None => self.queue.finish(),
    }
    self.state.set(&self.id, SubscriptionState::Closed);
  }
}

fn classify(error: TransportError) -> SessionEnd {
  match error {
    e if e.is_retryable() => SessionEnd::Interrupted(e.to_string()),
    TransportError::Rejected(err) => SessionEnd::Fatal(rejected(&err)),
    e => SessionEnd::Fatal(SubscriptionError::Rejected(e.to_string())),
  }
}

fn rejected(err: &ServerError) -> SubscriptionError {
  SubscriptionError::Rejected(err.to_string())
}

/// Handle to a live subscription. Dropping it unsubscribes.
///
/// ```no_run
/// # async fn run(client: &pinedb::PineDB) -> pinedb::Result<()> {
/// use pinedb::QuerySpec;
///
/// let spec = QuerySpec::new(r#"_type == "comment" && authorId != $ownerId"#)
///   .param("ownerId", "bikeOwnerUserId");
/// let mut sub = client.listen(&spec).await?;
/// while let Some(change) = sub.next().await {
///   let change = change?;
///   println!("{:?} {}", change.kind, change.document_id);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Subscription {
  id: String,
  queue: Arc<NotificationQueue>,
  state: Arc<StateCell>,
  state_rx: watch::Receiver<SubscriptionState>,
  task: Option<JoinHandle<()>>,
}

impl Subscription {
  pub fn id(&self) -> &str {
    &self.id
  }

  /// Next notification. A terminal failure is yielded once as `Err`; after
  /// that, and after [`Subscription::unsubscribe`], this returns `None`.
  pub async fn next(&mut self) -> Option<Result<ChangeNotification, SubscriptionError>> {
    self.queue.pop().await
  }

  pub fn state(&self) -> SubscriptionState {
    self.state.get()
  }

  /// Watch state transitions.
  pub fn state_changes(&self) -> watch::Receiver<SubscriptionState> {
    self.state_rx.clone()
  }

  /// How many times the channel came back after an interruption.
  pub fn reconnect_count(&self) -> u32 {
    self.state.reconnects.load(Ordering::SeqCst)
  }

  /// Notifications waiting to be read.
  pub fn pending(&self) -> usize {
    self.queue.len()
  }

  /// Wait until the subscription reaches `target`. Returns `false` if it
  /// closes first.
  pub async fn wait_for(&self, target: SubscriptionState) -> bool {
    let mut rx = self.state_rx.clone();
    loop {
      let current = *rx.borrow_and_update();
      if current == target {
        return true;
      }
      if current == SubscriptionState::Closed || rx.changed().await.is_err() {
        return false;
      }
    }
  }

  /// Stop the subscription. Notifications already buffered or in flight are
  /// discarded. Calling it again does nothing.
  pub fn unsubscribe(&mut self) {
    let Some(task) = self.task.take() else {
      return;
    };
    self.queue.cancel();
    task.abort();
    self.state.set(&self.id, SubscriptionState::Closed);
    debug!("subscription {} cancelled", self.id);
  }

  pub fn is_closed(&self) -> bool {
    self.state() == SubscriptionState::Closed
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.unsubscribe();
  }
}

impl fmt::Debug for Subscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("id", &self.id)
      .field("state", &self.state())
      .field("pending", &self.pending())
      .finish()
  }
}
