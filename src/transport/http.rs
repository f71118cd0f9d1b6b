//! HTTP transport for the hosted API.
//!
//! Reads go to `GET /data/query/{dataset}` with parameters encoded as
//! `$name=<json>`, writes to `POST /data/mutate/{dataset}`, uploads to
//! `POST /assets/{images|files}/{dataset}` and listeners use a server-sent
//! event stream from `GET /data/listen/{dataset}`.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, warn};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::config::ConfigHandle;
use crate::document::Document;
use crate::error::{Result, TransportError};
use crate::protocol::{
  AssetKind, Consistency, ListenEvent, ListenRequest, MutateResponse, MutationEvent, Params,
  Request, RequestFrame, Response, ServerError, ServerErrorKind, UploadOptions, MAX_MESSAGE_SIZE,
};
use crate::transport::{ListenStream, Transport};

const USER_AGENT: &str = concat!("pinedb-rust/", env!("CARGO_PKG_VERSION"));

/// [`Transport`] over HTTPS. Reads the client configuration on every call, so
/// configuration updates apply to the next request.
#[derive(Clone)]
pub struct HttpTransport {
  http: reqwest::Client,
  config: ConfigHandle,
}

impl HttpTransport {
  pub fn new(config: ConfigHandle) -> Result<Self> {
    let http = reqwest::Client::builder()
      .user_agent(USER_AGENT)
      .build()
      .map_err(|e| crate::Error::Connection(e.to_string()))?;
    Ok(Self { http, config })
  }

  /// Use a preconfigured `reqwest` client, e.g. with a proxy.
  pub fn with_client(http: reqwest::Client, config: ConfigHandle) -> Self {
    Self { http, config }
  }

  fn request(&self, method: reqwest::Method, cached: bool, path: &str) -> RequestBuilder {
    let config = self.config.get();
    // Authenticated requests always bypass the edge cache.
    let cached = cached && config.token.is_none();
    let url = format!("{}/{}", config.base_url(cached), path);
    let builder = self.http.request(method, url).timeout(config.timeout);
    match &config.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  async fn dispatch(&self, frame: RequestFrame) -> std::result::Result<Response, TransportError> {
    let RequestFrame {
      id,
      dataset,
      request,
    } = frame;
    debug!("sending {} request {} over http", request.name(), id);
    let dataset = urlencoding::encode(&dataset).into_owned();

    match request {
      Request::Query {
        query,
        params,
        consistency,
      } => {
        let builder = self
          .request(
            reqwest::Method::GET,
            consistency == Consistency::Cached,
            &format!("data/query/{}", dataset),
          )
          .query(&query_pairs(&query, &params));
        #[derive(Deserialize)]
        struct Body {
          #[serde(default)]
          result: Value,
        }
        Ok(match execute::<Body>(builder).await? {
          Ok(body) => Response::QueryResult {
            result: match body.result {
              Value::Array(rows) => rows,
              Value::Null => Vec::new(),
              other => vec![other],
            },
          },
          Err(err) => Response::Error(err),
        })
      }
      Request::GetDocuments { ids } => {
        let joined: Vec<String> = ids
          .iter()
          .map(|id| urlencoding::encode(id).into_owned())
          .collect();
        let builder = self.request(
          reqwest::Method::GET,
          false,
          &format!("data/doc/{}/{}", dataset, joined.join(",")),
        );
        #[derive(Deserialize)]
        struct Body {
          documents: Vec<Document>,
        }
        Ok(match execute::<Body>(builder).await? {
          Ok(body) => {
            let mut found: HashMap<String, Document> = body
              .documents
              .into_iter()
              .filter_map(|doc| doc.id().map(str::to_string).map(|id| (id, doc)))
              .collect();
            Response::Documents {
              documents: ids.iter().map(|id| found.remove(id)).collect(),
            }
          }
          Err(err) => Response::Error(err),
        })
      }
      Request::Mutate {
        mutations,
        transaction_id,
        return_documents,
      } => {
        let mut pairs = vec![
          ("returnIds", "true".to_string()),
          ("returnDocuments", return_documents.to_string()),
        ];
        if let Some(tx) = transaction_id {
          pairs.push(("transactionId", tx));
        }
        let builder = self
          .request(
            reqwest::Method::POST,
            false,
            &format!("data/mutate/{}", dataset),
          )
          .query(&pairs)
          .json(&serde_json::json!({ "mutations": mutations }));
        Ok(match execute::<MutateResponse>(builder).await? {
          Ok(body) => Response::Mutated(body),
          Err(err) => Response::Error(err),
        })
      }
      Request::UploadAsset {
        kind,
        data,
        options,
      } => {
        let builder = self
          .request(
            reqwest::Method::POST,
            false,
            &format!("assets/{}/{}", asset_endpoint(kind), dataset),
          )
          .query(&upload_pairs(&options))
          .header(
            CONTENT_TYPE,
            options
              .content_type
              .as_deref()
              .unwrap_or("application/octet-stream"),
          )
          .body(data);
        #[derive(Deserialize)]
        struct Body {
          document: Document,
        }
        Ok(match execute::<Body>(builder).await? {
          Ok(body) => Response::Asset {
            document: body.document,
          },
          Err(err) => Response::Error(err),
        })
      }
      Request::Ping => {
        let builder = self.request(reqwest::Method::GET, false, "ping");
        Ok(match execute::<Value>(builder).await? {
          Ok(_) => Response::Pong,
          Err(err) => Response::Error(err),
        })
      }
    }
  }

  async fn listen(
    &self,
    dataset: String,
    request: ListenRequest,
  ) -> std::result::Result<ListenStream, TransportError> {
    let mut pairs = query_pairs(&request.query, &request.params);
    pairs.push(("includeResult".to_string(), request.include_result.to_string()));
    pairs.push((
      "includeMutations".to_string(),
      request.include_mutations.to_string(),
    ));
    let path = format!("data/listen/{}", urlencoding::encode(&dataset));
    let config = self.config.get();
    let url = format!("{}/{}", config.base_url(false), path);
    // No overall timeout: the stream is long-lived.
    let mut builder = self
      .http
      .get(url)
      .query(&pairs)
      .header(ACCEPT, "text/event-stream");
    if let Some(token) = &config.token {
      builder = builder.bearer_auth(token);
    }

    let response = builder.send().await.map_err(transport_error)?;
    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(match status_error(status, &body) {
        Ok(err) => TransportError::Rejected(err),
        Err(transient) => transient,
      });
    }

    let state = SseState {
      bytes: response
        .bytes_stream()
        .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
        .boxed(),
      decoder: SseDecoder::default(),
      ready: VecDeque::new(),
    };
    Ok(futures::stream::unfold(Some(state), next_event).boxed())
  }
}

impl Transport for HttpTransport {
  fn send(&self, frame: RequestFrame) -> BoxFuture<'_, std::result::Result<Response, TransportError>> {
    Box::pin(self.dispatch(frame))
  }

  fn open_channel(
    &self,
    dataset: String,
    request: ListenRequest,
  ) -> BoxFuture<'_, std::result::Result<ListenStream, TransportError>> {
    Box::pin(self.listen(dataset, request))
  }
}

impl fmt::Debug for HttpTransport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HttpTransport")
      .field("config", &self.config.get())
      .finish()
  }
}

fn asset_endpoint(kind: AssetKind) -> &'static str {
  match kind {
    AssetKind::Image => "images",
    AssetKind::File => "files",
  }
}

/// `query=<text>` plus one `$name=<json>` pair per parameter.
fn query_pairs(query: &str, params: &Params) -> Vec<(String, String)> {
  let mut pairs = vec![("query".to_string(), query.to_string())];
  pairs.extend(
    params
      .iter()
      .map(|(name, value)| (format!("${}", name), value.to_string())),
  );
  pairs
}

fn upload_pairs(options: &UploadOptions) -> Vec<(&'static str, String)> {
  let mut pairs = Vec::new();
  if let Some(filename) = &options.filename {
    pairs.push(("filename", filename.clone()));
  }
  for field in &options.extract {
    pairs.push(("meta[]", field.clone()));
  }
  pairs
}

fn transport_error(e: reqwest::Error) -> TransportError {
  if e.is_timeout() {
    TransportError::Timeout
  } else if e.is_decode() || e.is_body() {
    TransportError::Protocol(e.to_string())
  } else {
    TransportError::Disconnected(e.to_string())
  }
}

/// Map a failed status to a store error, or to a retryable transport error
/// for overload and outages.
fn status_error(status: StatusCode, body: &str) -> std::result::Result<ServerError, TransportError> {
  if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
    return Err(TransportError::Disconnected(format!(
      "server returned {}",
      status
    )));
  }

  #[derive(Deserialize)]
  struct Envelope {
    error: ServerError,
  }
  if let Ok(envelope) = serde_json::from_str::<Envelope>(body) {
    return Ok(envelope.error);
  }
  if let Ok(err) = serde_json::from_str::<ServerError>(body) {
    return Ok(err);
  }

  let kind = match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServerErrorKind::PermissionDenied,
    StatusCode::NOT_FOUND => ServerErrorKind::NotFound,
    StatusCode::CONFLICT => ServerErrorKind::RevisionMismatch,
    _ => ServerErrorKind::Validation,
  };
  let message = if body.is_empty() {
    status.to_string()
  } else {
    body.to_string()
  };
  Ok(ServerError::new(kind, message))
}

/// Send and decode. The outer error is the transport's, the inner one the store's.
async fn execute<T: serde::de::DeserializeOwned>(
  builder: RequestBuilder,
) -> std::result::Result<std::result::Result<T, ServerError>, TransportError> {
  let response = builder.send().await.map_err(transport_error)?;
  let status = response.status();
  if status.is_success() {
    return response
      .json::<T>()
      .await
      .map(Ok)
      .map_err(|e| TransportError::Protocol(e.to_string()));
  }
  let body = response.text().await.unwrap_or_default();
  status_error(status, &body).map(Err)
}

/// One server-sent event.
#[derive(Debug, Clone, PartialEq)]
struct SseEvent {
  event: String,
  data: String,
}

/// Incremental `text/event-stream` decoder.
#[derive(Debug)]
struct SseDecoder {
  buffer: Vec<u8>,
  /// Largest unterminated event kept before the stream is failed.
  max_pending: usize,
}

impl Default for SseDecoder {
  fn default() -> Self {
    Self {
      buffer: Vec::new(),
      max_pending: MAX_MESSAGE_SIZE as usize,
    }
  }
}

impl SseDecoder {
  fn push(&mut self, chunk: &[u8]) -> std::result::Result<Vec<SseEvent>, TransportError> {
    self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
    let mut events = Vec::new();
    while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
      let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
      if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
        events.push(event);
      }
    }
    if self.buffer.len() > self.max_pending {
      self.buffer = Vec::new();
      return Err(TransportError::Protocol(format!(
        "event exceeds {} bytes without a terminator",
        self.max_pending
      )));
    }
    Ok(events)
  }
}

fn parse_block(block: &str) -> Option<SseEvent> {
  let mut event = None;
  let mut data: Vec<&str> = Vec::new();
  for line in block.lines() {
    if line.is_empty() || line.starts_with(':') {
      continue;
    }
    let (field, value) = line.split_once(':').unwrap_or((line, ""));
    let value = value.strip_prefix(' ').unwrap_or(value);
    match field {
      "event" => event = Some(value.to_string()),
      "data" => data.push(value),
      _ => {}
    }
  }
  if event.is_none() && data.is_empty() {
    return None;
  }
  Some(SseEvent {
    event: event.unwrap_or_else(|| "message".to_string()),
    data: data.join("\n"),
  })
}

fn listen_event(sse: SseEvent) -> Option<std::result::Result<ListenEvent, TransportError>> {
  let protocol = |e: serde_json::Error| TransportError::Protocol(e.to_string());
  match sse.event.as_str() {
    "welcome" => {
      #[derive(Deserialize)]
      #[serde(rename_all = "camelCase")]
      struct Welcome {
        listener_id: String,
      }
      Some(
        serde_json::from_str::<Welcome>(&sse.data)
          .map(|w| ListenEvent::Welcome {
            listener_id: w.listener_id,
          })
          .map_err(protocol),
      )
    }
    "mutation" => Some(
      serde_json::from_str::<MutationEvent>(&sse.data)
        .map(ListenEvent::Mutation)
        .map_err(protocol),
    ),
    "reconnect" => Some(Ok(ListenEvent::Reconnect)),
    "channelError" | "disconnect" => {
      let err = serde_json::from_str::<ServerError>(&sse.data).unwrap_or_else(|_| {
        ServerError::new(ServerErrorKind::Internal, format!("{}: {}", sse.event, sse.data))
      });
      Some(Ok(ListenEvent::Error(err)))
    }
    other => {
      debug!("skipping {} event", other);
      None
    }
  }
}

struct SseState {
  bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
  decoder: SseDecoder,
  ready: VecDeque<SseEvent>,
}

async fn next_event(
  state: Option<SseState>,
) -> Option<(std::result::Result<ListenEvent, TransportError>, Option<SseState>)> {
  let mut state = state?;
  loop {
    while let Some(sse) = state.ready.pop_front() {
      if let Some(event) = listen_event(sse) {
        return Some((event, Some(state)));
      }
    }
    match state.bytes.next().await {
      Some(Ok(chunk)) => match state.decoder.push(&chunk) {
        Ok(events) => state.ready.extend(events),
        Err(e) => {
          warn!("event stream failed: {}", e);
          return Some((Err(e), None));
        }
      },
      Some(Err(e)) => {
        warn!("event stream failed: {}", e);
        return Some((Err(transport_error(e)), None));
      }
      None => return None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_query_pairs_encode_params_as_json() {
    let params = Params::from([
      ("minSeats".to_string(), json!(2)),
      ("name".to_string(), json!("Tandem")),
    ]);
    let pairs = query_pairs("*[seats >= $minSeats]", &params);
    assert_eq!(
      pairs,
      vec![
        ("query".to_string(), "*[seats >= $minSeats]".to_string()),
        ("$minSeats".to_string(), "2".to_string()),
        ("$name".to_string(), "\"Tandem\"".to_string()),
      ]
    );
  }

  #[test]
  fn test_sse_decoder_handles_split_chunks() {
    let mut decoder = SseDecoder::default();
    assert!(decoder.push(b"event: welcome\r\ndata: {\"listen").unwrap().is_empty());
    let events = decoder
      .push(b"erId\":\"l1\"}\r\n\r\n: keepalive\n\nevent: reconnect\n\n")
      .unwrap();
    assert_eq!(
      events,
      vec![
        SseEvent {
          event: "welcome".to_string(),
          data: "{\"listenerId\":\"l1\"}".to_string()
        },
        SseEvent {
          event: "reconnect".to_string(),
          data: String::new()
        },
      ]
    );
  }

  #[test]
  fn test_sse_decoder_caps_unterminated_events() {
    let mut decoder = SseDecoder {
      max_pending: 16,
      ..SseDecoder::default()
    };
    let events = decoder.push(b"event: reconnect\n\ndata: 0123456789").unwrap();
    assert_eq!(events.len(), 1);

    let err = decoder.push(b"abcdefghij").unwrap_err();
    assert!(matches!(err, TransportError::Protocol(_)));
    assert!(!err.is_retryable());
    assert!(decoder.buffer.is_empty());
  }

  #[test]
  fn test_listen_event_mapping() {
    let welcome = listen_event(SseEvent {
      event: "welcome".to_string(),
      data: r#"{"listenerId":"l1"}"#.to_string(),
    });
    assert!(matches!(welcome, Some(Ok(ListenEvent::Welcome { listener_id })) if listener_id == "l1"));

    let error = listen_event(SseEvent {
      event: "channelError".to_string(),
      data: "boom".to_string(),
    });
    assert!(matches!(error, Some(Ok(ListenEvent::Error(_)))));

    let skipped = listen_event(SseEvent {
      event: "message".to_string(),
      data: String::new(),
    });
    assert!(skipped.is_none());
  }

  #[test]
  fn test_status_mapping() {
    let err = status_error(StatusCode::FORBIDDEN, "").unwrap();
    assert_eq!(err.kind, ServerErrorKind::PermissionDenied);

    let body = r#"{"error":{"kind":"revisionMismatch","message":"stale","documentId":"bike-1"}}"#;
    let err = status_error(StatusCode::CONFLICT, body).unwrap();
    assert_eq!(err.kind, ServerErrorKind::RevisionMismatch);
    assert_eq!(err.document_id.as_deref(), Some("bike-1"));

    let transient = status_error(StatusCode::SERVICE_UNAVAILABLE, "").unwrap_err();
    assert!(transient.is_retryable());
  }
}
