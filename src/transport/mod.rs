//! The seam between the client core and the network.
//!
//! The core never opens sockets itself. It hands [`RequestFrame`]s to a
//! [`Transport`] and receives a [`Response`] or a stream of [`ListenEvent`]s.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::TransportError;
use crate::protocol::{ListenEvent, ListenRequest, RequestFrame, Response};

pub mod http;
pub mod tcp;

/// A live listen channel. It ends when the connection goes away; errors
/// carry [`TransportError::is_retryable`] to tell blips from hard failures.
pub type ListenStream = BoxStream<'static, Result<ListenEvent, TransportError>>;

pub trait Transport: Send + Sync {
  /// Send one request and wait for its response.
  fn send(&self, frame: RequestFrame) -> BoxFuture<'_, Result<Response, TransportError>>;

  /// Open a dedicated channel delivering events for one listen request.
  fn open_channel(
    &self,
    dataset: String,
    request: ListenRequest,
  ) -> BoxFuture<'_, Result<ListenStream, TransportError>>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
  fn send(&self, frame: RequestFrame) -> BoxFuture<'_, Result<Response, TransportError>> {
    (**self).send(frame)
  }

  fn open_channel(
    &self,
    dataset: String,
    request: ListenRequest,
  ) -> BoxFuture<'_, Result<ListenStream, TransportError>> {
    (**self).open_channel(dataset, request)
  }
}
