//! Wire protocol types and serialization for PineDB.
//!
//! Every transport carries the same request, response and listen-event
//! messages. The framed TCP transport additionally uses the handshake and
//! frame codec defined here:
//!
//! ```text
//! client hello:  MAGIC(4) | version(1) | flags(1) | token_len(u16 BE) | token
//! server hello:  status(1) | version(1) | encoding(1) | session id(16)
//! frame:         length(u32 BE) | message type(1) | encoding(1) | payload
//! ```
//!
//! `length` counts the two header bytes plus the payload.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::document::Document;
use crate::error::{Error, Result};
use crate::transaction::Mutation;

/// Protocol magic bytes
pub const MAGIC: &[u8; 4] = b"PINE";

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Handshake status codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HandshakeStatus {
  Success = 0x00,
  VersionMismatch = 0x01,
  AuthFailed = 0x02,
}

impl TryFrom<u8> for HandshakeStatus {
  type Error = ();
  fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
    match v {
      0x00 => Ok(Self::Success),
      0x01 => Ok(Self::VersionMismatch),
      0x02 => Ok(Self::AuthFailed),
      _ => Err(()),
    }
  }
}

/// Message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MessageType {
  Request = 0x01,
  Response = 0x02,
  Notification = 0x03,
}

impl TryFrom<u8> for MessageType {
  type Error = ();
  fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
    match v {
      0x01 => Ok(Self::Request),
      0x02 => Ok(Self::Response),
      0x03 => Ok(Self::Notification),
      _ => Err(()),
    }
  }
}

/// Encoding formats
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Encoding {
  #[default]
  MessagePack = 0x01,
  Json = 0x02,
}

impl TryFrom<u8> for Encoding {
  type Error = ();
  fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
    match v {
      0x01 => Ok(Self::MessagePack),
      0x02 => Ok(Self::Json),
      _ => Err(()),
    }
  }
}

/// Protocol flags in handshake
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolFlags {
  pub messagepack: bool,
  pub json_fallback: bool,
}

impl From<u8> for ProtocolFlags {
  fn from(byte: u8) -> Self {
    Self {
      messagepack: byte & 0x01 != 0,
      json_fallback: byte & 0x02 != 0,
    }
  }
}

impl From<ProtocolFlags> for u8 {
  fn from(flags: ProtocolFlags) -> u8 {
    let mut byte = 0u8;
    if flags.messagepack {
      byte |= 0x01;
    }
    if flags.json_fallback {
      byte |= 0x02;
    }
    byte
  }
}

/// Named query parameters, sent alongside the query text.
pub type Params = BTreeMap<String, serde_json::Value>;

/// Which view of the data a read is answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
  /// Edge cache: lower latency, eventually consistent.
  Cached,
  /// Primary store: authoritative, higher latency.
  #[default]
  Authoritative,
}

/// Asset categories accepted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
  Image,
  File,
}

impl fmt::Display for AssetKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AssetKind::Image => write!(f, "image"),
      AssetKind::File => write!(f, "file"),
    }
  }
}

/// Optional metadata for an upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOptions {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub content_type: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub filename: Option<String>,
  /// Metadata the store should extract, e.g. `palette` or `location`.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub extract: Vec<String>,
}

/// Client-to-server requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
  Query {
    query: String,
    params: Params,
    consistency: Consistency,
  },
  GetDocuments {
    ids: Vec<String>,
  },
  Mutate {
    mutations: Vec<Mutation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_id: Option<String>,
    return_documents: bool,
  },
  UploadAsset {
    kind: AssetKind,
    data: Vec<u8>,
    options: UploadOptions,
  },
  Ping,
}

impl Request {
  pub fn name(&self) -> &'static str {
    match self {
      Request::Query { .. } => "query",
      Request::GetDocuments { .. } => "getDocuments",
      Request::Mutate { .. } => "mutate",
      Request::UploadAsset { .. } => "uploadAsset",
      Request::Ping => "ping",
    }
  }
}

/// A request addressed to a dataset, tagged with a correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
  pub id: String,
  pub dataset: String,
  pub request: Request,
}

impl RequestFrame {
  pub fn new(dataset: impl Into<String>, request: Request) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      dataset: dataset.into(),
      request,
    }
  }
}

/// What happened to one document in a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Create,
  Update,
  Delete,
  /// Nothing changed, e.g. `createIfNotExists` on an existing document.
  None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResult {
  pub id: String,
  pub operation: Operation,
  /// Revision after the transaction; `None` for deleted documents.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub revision: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub document: Option<Document>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutateResponse {
  pub transaction_id: String,
  pub results: Vec<DocumentResult>,
}

/// Server-side error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerErrorKind {
  RevisionMismatch,
  Validation,
  NotFound,
  AlreadyExists,
  PermissionDenied,
  Syntax,
  UnknownParameter,
  Unavailable,
  Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerError {
  pub kind: ServerErrorKind,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub document_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expected_revision: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub actual_revision: Option<String>,
  /// Character offset into the query for syntax errors.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub position: Option<usize>,
}

impl ServerError {
  pub fn new(kind: ServerErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      document_id: None,
      expected_revision: None,
      actual_revision: None,
      position: None,
    }
  }

  pub fn for_document(mut self, id: impl Into<String>) -> Self {
    self.document_id = Some(id.into());
    self
  }

  pub fn at(mut self, position: usize) -> Self {
    self.position = Some(position);
    self
  }
}

impl fmt::Display for ServerError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}: {}", self.kind, self.message)
  }
}

/// Server-to-client responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
  QueryResult { result: Vec<serde_json::Value> },
  Documents { documents: Vec<Option<Document>> },
  Mutated(MutateResponse),
  Asset { document: Document },
  Error(ServerError),
  Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
  pub id: String,
  pub response: Response,
}

/// Parameters of a listen channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenRequest {
  pub query: String,
  pub params: Params,
  /// Attach the resulting document to each event.
  pub include_result: bool,
  /// Attach the mutations that produced each event.
  pub include_mutations: bool,
}

/// How a change relates to the listener's filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
  /// The document did not match before and matches now.
  Appear,
  /// The document matched before and still matches.
  Update,
  /// The document matched before and no longer does (or was deleted).
  Disappear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
  pub document_id: String,
  pub transition: Transition,
  pub transaction_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub revision: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub previous_revision: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub result: Option<Document>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mutations: Option<Vec<Mutation>>,
}

/// Events delivered on a listen channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ListenEvent {
  /// The channel is established; events follow.
  Welcome { listener_id: String },
  Mutation(MutationEvent),
  /// The server asks the client to reconnect.
  Reconnect,
  /// The server gave up on this listener.
  Error(ServerError),
}

/// Client-to-server frames on the TCP transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ClientMessage {
  Request(RequestFrame),
  Listen {
    id: String,
    dataset: String,
    request: ListenRequest,
  },
}

/// Server-to-client frames on the TCP transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServerMessage {
  Response(ResponseFrame),
  Event { id: String, event: ListenEvent },
}

impl ServerMessage {
  pub fn message_type(&self) -> MessageType {
    match self {
      ServerMessage::Response(_) => MessageType::Response,
      ServerMessage::Event { .. } => MessageType::Notification,
    }
  }
}

/// Serialize a message body with the given encoding.
pub fn encode<T: Serialize>(encoding: Encoding, value: &T) -> Result<Vec<u8>> {
  match encoding {
    Encoding::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
    Encoding::Json => Ok(serde_json::to_vec(value)?),
  }
}

pub fn decode<T: DeserializeOwned>(encoding: Encoding, bytes: &[u8]) -> Result<T> {
  match encoding {
    Encoding::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
    Encoding::Json => Ok(serde_json::from_slice(bytes)?),
  }
}

/// A decoded frame header plus its raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
  pub message_type: MessageType,
  pub encoding: Encoding,
  pub payload: Vec<u8>,
}

impl Frame {
  pub fn new<T: Serialize>(message_type: MessageType, encoding: Encoding, value: &T) -> Result<Self> {
    Ok(Self {
      message_type,
      encoding,
      payload: encode(encoding, value)?,
    })
  }

  pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
    decode(self.encoding, &self.payload)
  }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
  let len = u32::try_from(frame.payload.len() + 2)
    .ok()
    .filter(|len| *len <= MAX_MESSAGE_SIZE)
    .ok_or_else(|| Error::Serialization(format!("frame of {} bytes is too large", frame.payload.len())))?;
  let mut buf = Vec::with_capacity(frame.payload.len() + 6);
  buf.extend_from_slice(&len.to_be_bytes());
  buf.push(frame.message_type as u8);
  buf.push(frame.encoding as u8);
  buf.extend_from_slice(&frame.payload);
  writer.write_all(&buf).await?;
  writer.flush().await?;
  Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
  let len = reader.read_u32().await?;
  if !(2..=MAX_MESSAGE_SIZE).contains(&len) {
    return Err(Error::Serialization(format!("invalid frame length {}", len)));
  }
  let message_type = MessageType::try_from(reader.read_u8().await?)
    .map_err(|_| Error::Serialization("unknown message type".to_string()))?;
  let encoding = Encoding::try_from(reader.read_u8().await?)
    .map_err(|_| Error::Serialization("unknown encoding".to_string()))?;
  let mut payload = vec![0u8; len as usize - 2];
  reader.read_exact(&mut payload).await?;
  Ok(Frame {
    message_type,
    encoding,
    payload,
  })
}

/// Client hello.
#[derive(Debug, Clone, PartialEq)]
pub struct Hello {
  pub version: u8,
  pub flags: ProtocolFlags,
  pub token: Option<String>,
}

impl PartialEq for ProtocolFlags {
  fn eq(&self, other: &Self) -> bool {
    u8::from(*self) == u8::from(*other)
  }
}

pub async fn write_hello<W: AsyncWrite + Unpin>(writer: &mut W, hello: &Hello) -> Result<()> {
  let token = hello.token.as_deref().unwrap_or("").as_bytes();
  let token_len = u16::try_from(token.len())
    .map_err(|_| Error::Handshake("auth token too long".to_string()))?;
  let mut buf = Vec::with_capacity(8 + token.len());
  buf.extend_from_slice(MAGIC);
  buf.push(hello.version);
  buf.push(u8::from(hello.flags));
  buf.extend_from_slice(&token_len.to_be_bytes());
  buf.extend_from_slice(token);
  writer.write_all(&buf).await?;
  writer.flush().await?;
  Ok(())
}

pub async fn read_hello<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Hello> {
  let mut magic = [0u8; 4];
  reader.read_exact(&mut magic).await?;
  if &magic != MAGIC {
    return Err(Error::Handshake("invalid magic".to_string()));
  }
  let version = reader.read_u8().await?;
  let flags = ProtocolFlags::from(reader.read_u8().await?);
  let token_len = reader.read_u16().await? as usize;
  let mut token = vec![0u8; token_len];
  reader.read_exact(&mut token).await?;
  let token = String::from_utf8(token)
    .map_err(|_| Error::Handshake("auth token is not UTF-8".to_string()))?;
  Ok(Hello {
    version,
    flags,
    token: (!token.is_empty()).then_some(token),
  })
}

/// Server hello.
#[derive(Debug, Clone, PartialEq)]
pub struct Welcome {
  pub status: HandshakeStatus,
  pub version: u8,
  pub encoding: Encoding,
  pub session_id: Uuid,
}

pub async fn write_welcome<W: AsyncWrite + Unpin>(writer: &mut W, welcome: &Welcome) -> Result<()> {
  let mut buf = Vec::with_capacity(19);
  buf.push(welcome.status as u8);
  buf.push(welcome.version);
  buf.push(welcome.encoding as u8);
  buf.extend_from_slice(welcome.session_id.as_bytes());
  writer.write_all(&buf).await?;
  writer.flush().await?;
  Ok(())
}

pub async fn read_welcome<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Welcome> {
  let status = HandshakeStatus::try_from(reader.read_u8().await?)
    .map_err(|_| Error::Handshake("unknown handshake status".to_string()))?;
  let version = reader.read_u8().await?;
  let encoding = Encoding::try_from(reader.read_u8().await?)
    .map_err(|_| Error::Handshake("unknown encoding".to_string()))?;
  let mut session = [0u8; 16];
  reader.read_exact(&mut session).await?;
  Ok(Welcome {
    status,
    version,
    encoding,
    session_id: Uuid::from_bytes(session),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_frame_round_trip_both_encodings() {
    for encoding in [Encoding::MessagePack, Encoding::Json] {
      let msg = ClientMessage::Request(RequestFrame::new(
        "production",
        Request::Query {
          query: "*[_type == $t]".to_string(),
          params: Params::from([("t".to_string(), json!("bike"))]),
          consistency: Consistency::Cached,
        },
      ));
      let frame = Frame::new(MessageType::Request, encoding, &msg).unwrap();

      let mut buf = Vec::new();
      write_frame(&mut buf, &frame).await.unwrap();
      let read = read_frame(&mut &buf[..]).await.unwrap();
      assert_eq!(read, frame);

      match read.decode::<ClientMessage>().unwrap() {
        ClientMessage::Request(req) => {
          assert_eq!(req.dataset, "production");
          assert!(matches!(req.request, Request::Query { consistency: Consistency::Cached, .. }));
        }
        other => panic!("Expected request, got {:?}", other),
      }
    }
  }

  #[tokio::test]
  async fn test_read_frame_rejects_bad_length() {
    let buf = [0u8, 0, 0, 1, 0x01];
    assert!(read_frame(&mut &buf[..]).await.is_err());
  }

  #[tokio::test]
  async fn test_handshake_round_trip() {
    let hello = Hello {
      version: PROTOCOL_VERSION,
      flags: ProtocolFlags {
        messagepack: true,
        json_fallback: true,
      },
      token: Some("secret".to_string()),
    };
    let mut buf = Vec::new();
    write_hello(&mut buf, &hello).await.unwrap();
    assert_eq!(&buf[..4], MAGIC);
    assert_eq!(read_hello(&mut &buf[..]).await.unwrap(), hello);

    let welcome = Welcome {
      status: HandshakeStatus::Success,
      version: PROTOCOL_VERSION,
      encoding: Encoding::Json,
      session_id: Uuid::new_v4(),
    };
    let mut buf = Vec::new();
    write_welcome(&mut buf, &welcome).await.unwrap();
    assert_eq!(read_welcome(&mut &buf[..]).await.unwrap(), welcome);
  }

  #[tokio::test]
  async fn test_read_hello_rejects_bad_magic() {
    let buf = b"XXXX\x01\x01\x00\x00";
    assert!(matches!(
      read_hello(&mut &buf[..]).await,
      Err(Error::Handshake(_))
    ));
  }

  #[test]
  fn test_listen_event_wire_format() {
    let event = ListenEvent::Welcome {
      listener_id: "l1".to_string(),
    };
    assert_eq!(
      serde_json::to_value(&event).unwrap(),
      json!({"type": "welcome", "listenerId": "l1"})
    );
    let parsed: ListenEvent = serde_json::from_value(json!({"type": "reconnect"})).unwrap();
    assert_eq!(parsed, ListenEvent::Reconnect);
  }
}
