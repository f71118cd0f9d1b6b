//! Native framed TCP transport.
//!
//! Requests share one lazily (re)established connection and are matched to
//! responses by request id. Every listen channel gets a connection of its own,
//! so dropping the stream is all it takes to detach the listener.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use log::{debug, warn};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result, TransportError};
use crate::protocol::{
  read_frame, read_welcome, write_frame, write_hello, ClientMessage, Encoding, Frame,
  HandshakeStatus, Hello, ListenRequest, MessageType, ProtocolFlags, RequestFrame, Response,
  ResponseFrame, ServerMessage, PROTOCOL_VERSION,
};
use crate::transport::{ListenStream, Transport};

/// Connection options
#[derive(Debug, Clone)]
pub struct ConnectOptions {
  pub host: String,
  pub port: u16,
  pub auth_token: Option<String>,
  pub use_messagepack: bool,
  pub json_fallback: bool,
  pub connect_timeout: Duration,
}

impl ConnectOptions {
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
      auth_token: None,
      use_messagepack: true,
      json_fallback: true,
      connect_timeout: Duration::from_secs(10),
    }
  }

  pub fn with_auth(mut self, token: impl Into<String>) -> Self {
    self.auth_token = Some(token.into());
    self
  }

  /// Offer MessagePack (the default) or JSON only.
  pub fn with_messagepack(mut self, enabled: bool) -> Self {
    self.use_messagepack = enabled;
    self
  }

  pub fn with_json_fallback(mut self, enabled: bool) -> Self {
    self.json_fallback = enabled;
    self
  }

  pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  pub fn addr(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }
}

/// Connect and run the handshake. Returns the stream and the server's chosen encoding.
async fn handshake(options: &ConnectOptions) -> Result<(TcpStream, Encoding, Uuid)> {
  let addr = options.addr();
  let mut stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(&addr))
    .await
    .map_err(|_| Error::Timeout)?
    .map_err(|e| Error::Connection(format!("Failed to connect to {}: {}", addr, e)))?;
  stream.set_nodelay(true)?;

  let hello = Hello {
    version: PROTOCOL_VERSION,
    flags: ProtocolFlags {
      messagepack: options.use_messagepack,
      json_fallback: options.json_fallback,
    },
    token: options.auth_token.clone(),
  };
  write_hello(&mut stream, &hello).await?;
  let welcome = read_welcome(&mut stream).await?;
  match welcome.status {
    HandshakeStatus::Success => {}
    HandshakeStatus::VersionMismatch => {
      return Err(Error::VersionMismatch {
        server: welcome.version,
        client: PROTOCOL_VERSION,
      })
    }
    HandshakeStatus::AuthFailed => return Err(Error::AuthFailed),
  }
  debug!(
    "connected to {} (session {}, {:?})",
    addr, welcome.session_id, welcome.encoding
  );
  Ok((stream, welcome.encoding, welcome.session_id))
}

type PendingMap = Mutex<HashMap<String, oneshot::Sender<Response>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Response>>> {
  pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a pending entry when the caller stops waiting.
struct PendingGuard<'a> {
  pending: &'a PendingMap,
  id: String,
}

impl Drop for PendingGuard<'_> {
  fn drop(&mut self) {
    lock(self.pending).remove(&self.id);
  }
}

/// The shared request connection.
struct Connection {
  writer: tokio::sync::Mutex<OwnedWriteHalf>,
  encoding: Encoding,
  pending: Arc<PendingMap>,
  alive: Arc<AtomicBool>,
  reader: JoinHandle<()>,
}

impl Connection {
  async fn open(options: &ConnectOptions) -> Result<Self> {
    let (stream, encoding, session_id) = handshake(options).await?;
    let (reader, writer) = stream.into_split();
    let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
    let alive = Arc::new(AtomicBool::new(true));
    let reader = tokio::spawn(read_responses(
      reader,
      Arc::clone(&pending),
      Arc::clone(&alive),
      session_id,
    ));
    Ok(Self {
      writer: tokio::sync::Mutex::new(writer),
      encoding,
      pending,
      alive,
      reader,
    })
  }

  fn is_alive(&self) -> bool {
    self.alive.load(Ordering::SeqCst)
  }

  async fn request(&self, frame: RequestFrame) -> std::result::Result<Response, TransportError> {
    let (tx, rx) = oneshot::channel();
    let id = frame.id.clone();
    lock(&self.pending).insert(id.clone(), tx);
    let _guard = PendingGuard {
      pending: &self.pending,
      id,
    };

    let out = Frame::new(
      MessageType::Request,
      self.encoding,
      &ClientMessage::Request(frame),
    )?;
    {
      let mut writer = self.writer.lock().await;
      if let Err(e) = write_frame(&mut *writer, &out).await {
        self.alive.store(false, Ordering::SeqCst);
        return Err(e.into());
      }
    }
    rx.await
      .map_err(|_| TransportError::Disconnected("connection closed before response".to_string()))
  }
}

impl Drop for Connection {
  fn drop(&mut self) {
    self.reader.abort();
  }
}

async fn read_responses(
  mut reader: OwnedReadHalf,
  pending: Arc<PendingMap>,
  alive: Arc<AtomicBool>,
  session_id: Uuid,
) {
  loop {
    let frame = match read_frame(&mut reader).await {
      Ok(frame) => frame,
      Err(e) => {
        debug!("session {} closed: {}", session_id, e);
        break;
      }
    };
    match frame.decode::<ServerMessage>() {
      Ok(ServerMessage::Response(ResponseFrame { id, response })) => {
        match lock(&pending).remove(&id) {
          Some(tx) => {
            let _ = tx.send(response);
          }
          None => debug!("response for abandoned request {}", id),
        }
      }
      Ok(ServerMessage::Event { id, .. }) => {
        warn!("ignoring listen event {} on request connection", id)
      }
      Err(e) => warn!("ignoring undecodable frame: {}", e),
    }
  }
  alive.store(false, Ordering::SeqCst);
  // Dropping the senders wakes every waiter with a disconnect.
  lock(&pending).clear();
}

/// [`Transport`] over the native TCP protocol.
pub struct TcpTransport {
  options: ConnectOptions,
  connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
}

impl TcpTransport {
  /// Create a transport that connects on first use.
  pub fn new(options: ConnectOptions) -> Self {
    Self {
      options,
      connection: tokio::sync::Mutex::new(None),
    }
  }

  /// Connect right away, surfacing handshake failures early.
  pub async fn connect(options: ConnectOptions) -> Result<Self> {
    let transport = Self::new(options);
    let connection = Connection::open(&transport.options).await?;
    *transport.connection.lock().await = Some(Arc::new(connection));
    Ok(transport)
  }

  pub fn options(&self) -> &ConnectOptions {
    &self.options
  }

  /// Drop the shared connection. The next request reconnects.
  pub async fn close(&self) {
    self.connection.lock().await.take();
  }

  async fn connection(&self) -> std::result::Result<Arc<Connection>, TransportError> {
    let mut slot = self.connection.lock().await;
    if let Some(connection) = slot.as_ref().filter(|c| c.is_alive()) {
      return Ok(Arc::clone(connection));
    }
    let connection = Arc::new(Connection::open(&self.options).await?);
    *slot = Some(Arc::clone(&connection));
    Ok(connection)
  }

  async fn listen(
    &self,
    dataset: String,
    request: ListenRequest,
  ) -> std::result::Result<ListenStream, TransportError> {
    let (stream, encoding, session_id) = handshake(&self.options).await?;
    let (reader, mut writer) = stream.into_split();
    let listen = ClientMessage::Listen {
      id: Uuid::new_v4().to_string(),
      dataset,
      request,
    };
    write_frame(&mut writer, &Frame::new(MessageType::Request, encoding, &listen)?).await?;
    debug!("listen channel open on session {}", session_id);

    let events = futures::stream::unfold(Some((reader, writer)), |state| async move {
      let (mut reader, writer) = state?;
      let frame = match read_frame(&mut reader).await {
        Ok(frame) => frame,
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return None,
        Err(e) => return Some((Err(TransportError::from(e)), None)),
      };
      match frame.decode::<ServerMessage>() {
        Ok(ServerMessage::Event { event, .. }) => Some((Ok(event), Some((reader, writer)))),
        Ok(ServerMessage::Response(_)) => Some((
          Err(TransportError::Protocol(
            "unexpected response on listen channel".to_string(),
          )),
          None,
        )),
        Err(e) => Some((Err(TransportError::Protocol(e.to_string())), None)),
      }
    });
    Ok(events.boxed())
  }
}

impl Transport for TcpTransport {
  fn send(&self, frame: RequestFrame) -> BoxFuture<'_, std::result::Result<Response, TransportError>> {
    Box::pin(async move {
      let connection = self.connection().await?;
      debug!("sending {} request {}", frame.request.name(), frame.id);
      connection.request(frame).await
    })
  }

  fn open_channel(
    &self,
    dataset: String,
    request: ListenRequest,
  ) -> BoxFuture<'_, std::result::Result<ListenStream, TransportError>> {
    Box::pin(self.listen(dataset, request))
  }
}

impl fmt::Debug for TcpTransport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TcpTransport")
      .field("addr", &self.options.addr())
      .finish_non_exhaustive()
  }
}
