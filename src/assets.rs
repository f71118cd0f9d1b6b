//! Binary asset uploads.
//!
//! Assets are content-addressed: uploading the same bytes twice yields the
//! same asset document.

use std::fmt;
use std::sync::Arc;

use log::debug;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::ConfigHandle;
use crate::document::Document;
use crate::error::{MutationError, Result};
use crate::protocol::{AssetKind, Request, RequestFrame, Response, UploadOptions};
use crate::transport::Transport;

pub const IMAGE_ASSET_TYPE: &str = "pinedb.imageAsset";
pub const FILE_ASSET_TYPE: &str = "pinedb.fileAsset";

/// Length of the hash prefix used in asset ids.
const HASH_PREFIX_LEN: usize = 40;

impl AssetKind {
  pub fn document_type(&self) -> &'static str {
    match self {
      AssetKind::Image => IMAGE_ASSET_TYPE,
      AssetKind::File => FILE_ASSET_TYPE,
    }
  }
}

/// Hex-encoded SHA-256 of `data`.
pub fn content_hash(data: &[u8]) -> String {
  hex::encode(Sha256::digest(data))
}

/// File extension for an upload: from the filename, else the content type,
/// else `bin`.
pub fn extension(options: &UploadOptions) -> String {
  let from_name = options
    .filename
    .as_deref()
    .and_then(|name| name.rsplit_once('.'))
    .map(|(_, ext)| ext);
  let from_type = options
    .content_type
    .as_deref()
    .and_then(|ct| ct.split(';').next())
    .and_then(|ct| ct.split_once('/'))
    .map(|(_, subtype)| subtype.trim_start_matches("x-"))
    .map(|subtype| match subtype {
      "jpeg" => "jpg",
      "svg+xml" => "svg",
      "plain" => "txt",
      other => other,
    });
  from_name
    .or(from_type)
    .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
    .unwrap_or("bin")
    .to_ascii_lowercase()
}

/// Id of the asset document for `data`: `{kind}-{hash prefix}-{extension}`.
pub fn asset_id(kind: AssetKind, data: &[u8], options: &UploadOptions) -> String {
  let hash = content_hash(data);
  format!("{}-{}-{}", kind, &hash[..HASH_PREFIX_LEN], extension(options))
}

/// The asset document a store records for an upload.
pub fn describe(kind: AssetKind, data: &[u8], options: &UploadOptions) -> Document {
  let sha256 = content_hash(data);
  let ext = extension(options);
  let mime_type = options
    .content_type
    .clone()
    .unwrap_or_else(|| "application/octet-stream".to_string());

  let mut doc = Document::new(kind.document_type())
    .with_id(asset_id(kind, data, options))
    .with_field("sha256", sha256)
    .with_field("size", data.len())
    .with_field("mimeType", mime_type)
    .with_field("extension", ext);
  if let Some(name) = &options.filename {
    doc.insert("originalFilename", name.clone());
  }
  if !options.extract.is_empty() {
    doc.insert(
      "extract",
      Value::Array(options.extract.iter().cloned().map(Value::String).collect()),
    );
  }
  doc
}

/// Handle for uploading assets, obtained from [`PineDB::assets`](crate::PineDB::assets).
#[derive(Clone)]
pub struct Assets {
  transport: Arc<dyn Transport>,
  config: ConfigHandle,
}

impl Assets {
  pub fn new(transport: Arc<dyn Transport>, config: ConfigHandle) -> Self {
    Self { transport, config }
  }

  /// Upload `data` and return the resulting asset document.
  pub async fn upload(
    &self,
    kind: AssetKind,
    data: impl Into<Vec<u8>>,
    options: UploadOptions,
  ) -> Result<Document> {
    let config = self.config.get();
    let data = data.into();
    debug!("uploading {} asset of {} bytes", kind, data.len());
    let frame = RequestFrame::new(
      config.dataset,
      Request::UploadAsset {
        kind,
        data,
        options,
      },
    );
    let response = tokio::time::timeout(config.timeout, self.transport.send(frame))
      .await
      .map_err(|_| MutationError::TransportFailure("asset upload timed out".to_string()))?
      .map_err(MutationError::from)?;
    match response {
      Response::Asset { document } => Ok(document),
      Response::Error(err) => Err(MutationError::from(err).into()),
      other => Err(
        MutationError::TransportFailure(format!("unexpected response to upload: {:?}", other))
          .into(),
      ),
    }
  }
}

impl fmt::Debug for Assets {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Assets").finish_non_exhaustive()
  }
}
