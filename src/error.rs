//! Error types for the PineDB client SDK.

use thiserror::Error;

use crate::protocol::{ServerError, ServerErrorKind};

#[derive(Error, Debug)]
pub enum Error {
  #[error("Connection error: {0}")]
  Connection(String),

  #[error("Handshake failed: {0}")]
  Handshake(String),

  #[error("Protocol version mismatch: server={server}, client={client}")]
  VersionMismatch { server: u8, client: u8 },

  #[error("Authentication failed")]
  AuthFailed,

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Serialization error: {0}")]
  Serialization(String),

  #[error("Timeout")]
  Timeout,

  #[error("Channel closed")]
  ChannelClosed,

  #[error("Invalid configuration: {0}")]
  InvalidConfig(String),

  #[error("Invalid path {path:?}: {reason}")]
  InvalidPath { path: String, reason: String },

  #[error("Invalid state: {0}")]
  InvalidState(String),

  #[error("Patch for {0} must be frozen before it can be added to a transaction")]
  UnfinishedPatch(String),

  #[error(transparent)]
  Mutation(#[from] MutationError),

  #[error(transparent)]
  Query(#[from] QueryError),

  #[error(transparent)]
  Subscription(#[from] SubscriptionError),
}

impl From<rmp_serde::encode::Error> for Error {
  fn from(e: rmp_serde::encode::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

impl From<rmp_serde::decode::Error> for Error {
  fn from(e: rmp_serde::decode::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a [`Transport`](crate::transport::Transport).
#[derive(Error, Debug, Clone)]
pub enum TransportError {
  #[error("Connection lost: {0}")]
  Disconnected(String),

  #[error("Transport timeout")]
  Timeout,

  #[error("Protocol error: {0}")]
  Protocol(String),

  #[error("Rejected by server: {0}")]
  Rejected(ServerError),
}

impl TransportError {
  /// Connection loss and timeouts may be retried; everything else is final.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Disconnected(_) | Self::Timeout)
  }
}

impl From<std::io::Error> for TransportError {
  fn from(e: std::io::Error) -> Self {
    Self::Disconnected(e.to_string())
  }
}

impl From<Error> for TransportError {
  fn from(e: Error) -> Self {
    match e {
      Error::Io(e) => Self::Disconnected(e.to_string()),
      Error::Connection(msg) => Self::Disconnected(msg),
      Error::Timeout => Self::Timeout,
      other => Self::Protocol(other.to_string()),
    }
  }
}

/// Why a mutation was not applied.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MutationError {
  #[error("Revision mismatch on {id}: expected {expected}, found {actual:?}")]
  RevisionMismatch {
    id: String,
    expected: String,
    actual: Option<String>,
  },

  #[error("Validation failed: {0}")]
  ValidationFailure(String),

  #[error("Document not found: {0}")]
  NotFound(String),

  #[error("Document already exists: {0}")]
  AlreadyExists(String),

  #[error("Transport failure: {0}")]
  TransportFailure(String),

  #[error("Permission denied: {0}")]
  PermissionDenied(String),
}

impl MutationError {
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::TransportFailure(_))
  }
}

impl From<TransportError> for MutationError {
  fn from(e: TransportError) -> Self {
    match e {
      TransportError::Rejected(server) => server.into(),
      other => Self::TransportFailure(other.to_string()),
    }
  }
}

impl From<ServerError> for MutationError {
  fn from(e: ServerError) -> Self {
    match e.kind {
      ServerErrorKind::RevisionMismatch => Self::RevisionMismatch {
        id: e.document_id.unwrap_or_default(),
        expected: e.expected_revision.unwrap_or_default(),
        actual: e.actual_revision,
      },
      ServerErrorKind::NotFound => Self::NotFound(e.document_id.unwrap_or(e.message)),
      ServerErrorKind::AlreadyExists => Self::AlreadyExists(e.document_id.unwrap_or(e.message)),
      ServerErrorKind::PermissionDenied => Self::PermissionDenied(e.message),
      ServerErrorKind::Validation | ServerErrorKind::Syntax | ServerErrorKind::UnknownParameter => {
        Self::ValidationFailure(e.message)
      }
      ServerErrorKind::Unavailable | ServerErrorKind::Internal => Self::TransportFailure(e.message),
    }
  }
}

/// Why a query could not be answered.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
  #[error("Syntax error at position {position}: {message}")]
  SyntaxError { position: usize, message: String },

  #[error("Unknown parameter: ${0}")]
  UnknownParameter(String),

  #[error("Transport failure: {0}")]
  TransportFailure(String),

  #[error("Permission denied: {0}")]
  PermissionDenied(String),

  #[error("Could not decode query result: {0}")]
  Decode(String),
}

impl From<TransportError> for QueryError {
  fn from(e: TransportError) -> Self {
    match e {
      TransportError::Rejected(server) => server.into(),
      other => Self::TransportFailure(other.to_string()),
    }
  }
}

impl From<ServerError> for QueryError {
  fn from(e: ServerError) -> Self {
    match e.kind {
      ServerErrorKind::Syntax => Self::SyntaxError {
        position: e.position.unwrap_or(0),
        message: e.message,
      },
      ServerErrorKind::UnknownParameter => Self::UnknownParameter(e.message),
      ServerErrorKind::PermissionDenied => Self::PermissionDenied(e.message),
      _ => Self::TransportFailure(e.message),
    }
  }
}

/// Terminal failure of a subscription, delivered once before it closes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubscriptionError {
  #[error("Listener rejected: {0}")]
  Rejected(String),

  #[error("Gave up reconnecting after {attempts} attempts: {last_error}")]
  RetriesExhausted { attempts: u32, last_error: String },

  #[error("Invalid listen query: {0}")]
  Query(#[from] QueryError),
}
