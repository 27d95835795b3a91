//! Wire decoder: raw text frames → full trees, op lists, or errors.
//!
//! ```text
//!  text frame ──parse──▸ InboundMessage ─┬─ render_full ──────────▸ FullTree
//!                                        ├─ render_patch ─────────▸ Patch
//!                                        ├─ render_patch_compact ─▸ resolve $def/$ref ─▸ Patch
//!                                        ├─ render_patch_z ─▸ base64 ─▸ inflate ─▸ (compact)
//!                                        ├─ error ────────────────▸ Error
//!                                        └─ runtime_event ────────▸ RuntimeEvent
//! ```
//!
//! Decoding is synchronous except for inflation, which runs on the blocking
//! pool. The decoder is driven through `&mut self`, one frame at a time, so
//! a frame's definitions are always visible to the frames after it.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use canopy_core::{PatchOp, UiNode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::intern::InternTable;
use crate::protocol::{kind, ApplicationError, InboundMessage};

/// Decoder configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Maximum number of interned payloads per connection epoch.
    pub intern_capacity: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            intern_capacity: crate::intern::DEFAULT_CAPACITY,
        }
    }
}

/// A fully decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    FullTree { rev: u64, tree: Arc<UiNode> },
    Patch { rev: u64, ops: Vec<PatchOp> },
    Error(ApplicationError),
    RuntimeEvent(Map<String, Value>),
}

/// Reasons a frame is dropped.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Invalid operation #{index}: {reason}")]
    InvalidOperation { index: usize, reason: String },

    #[error("Unresolved intern reference '{0}'")]
    UnresolvedReference(String),

    #[error("Invalid intern marker: {0}")]
    InvalidDefinition(String),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Compressed patches are not supported by this build")]
    DecompressionUnsupported,

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("Invalid tree: {0}")]
    InvalidTree(String),
}

/// Running counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub frames: u64,
    pub definitions: u64,
    pub references: u64,
    /// Ops skipped because their kind is unknown.
    pub skipped_ops: u64,
}

/// Parse the outer envelope of a frame.
pub fn parse_envelope(raw: &str) -> Result<InboundMessage, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("missing message type".into()))?;
    if !kind::ALL.contains(&tag) {
        return Err(DecodeError::UnknownMessageType(tag.to_owned()));
    }

    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Stateful decoder; owns the intern table of the current connection.
pub struct WireDecoder {
    interns: InternTable,
    stats: DecodeStats,
}

impl Default for WireDecoder {
    fn default() -> Self {
        Self::new(&DecoderConfig::default())
    }
}

impl WireDecoder {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            interns: InternTable::new(config.intern_capacity),
            stats: DecodeStats::default(),
        }
    }

    /// Start a new connection epoch: previously interned tokens are invalid.
    pub fn reset_epoch(&mut self) {
        let dropped = self.interns.len();
        self.interns.reset();
        log::info!(
            "Intern table reset for epoch {} ({dropped} tokens dropped)",
            self.interns.epoch()
        );
    }

    pub fn interns(&self) -> &InternTable {
        &self.interns
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Decode one raw text frame.
    pub async fn decode(&mut self, raw: &str) -> Result<Decoded, DecodeError> {
        let message = parse_envelope(raw)?;
        self.decode_message(message).await
    }

    /// Decode an already parsed envelope.
    pub async fn decode_message(&mut self, message: InboundMessage) -> Result<Decoded, DecodeError> {
        self.stats.frames += 1;

        match message {
            InboundMessage::RenderFull { rev, tree } => {
                let tree =
                    UiNode::from_value(tree).map_err(|e| DecodeError::InvalidTree(e.to_string()))?;
                Ok(Decoded::FullTree {
                    rev,
                    tree: Arc::new(tree),
                })
            }
            InboundMessage::RenderPatch { rev, ops } => {
                let ops = self.decode_ops(ops, false)?;
                Ok(Decoded::Patch { rev, ops })
            }
            InboundMessage::RenderPatchCompact { rev, ops } => {
                let ops = self.decode_ops(ops, true)?;
                Ok(Decoded::Patch { rev, ops })
            }
            InboundMessage::RenderPatchZ { rev, ops } => {
                let inflated = inflate(&ops).await?;
                let ops = inner_ops(&inflated)?;
                // Inner payloads may be plain or compact; resolving plain
                // nodes is the identity.
                let ops = self.decode_ops(ops, true)?;
                Ok(Decoded::Patch { rev, ops })
            }
            InboundMessage::Error(error) => Ok(Decoded::Error(error)),
            InboundMessage::RuntimeEvent(fields) => Ok(Decoded::RuntimeEvent(fields)),
        }
    }

    /// Turn raw ops into typed ops. Unknown kinds are skipped; any other
    /// problem fails the whole batch.
    fn decode_ops(&mut self, raw_ops: Vec<Value>, compact: bool) -> Result<Vec<PatchOp>, DecodeError> {
        let mut ops = Vec::with_capacity(raw_ops.len());

        for (index, mut raw) in raw_ops.into_iter().enumerate() {
            let op_kind = raw.get("op").and_then(Value::as_str).ok_or_else(|| {
                DecodeError::InvalidOperation {
                    index,
                    reason: "missing op kind".into(),
                }
            })?;

            if !PatchOp::KINDS.contains(&op_kind) {
                log::warn!("Skipping unknown patch op '{op_kind}' at #{index}");
                self.stats.skipped_ops += 1;
                continue;
            }

            if compact {
                if let Some(node) = raw.get_mut("node") {
                    self.resolve_node(node)?;
                }
            }

            let op = serde_json::from_value(raw).map_err(|e| DecodeError::InvalidOperation {
                index,
                reason: e.to_string(),
            })?;
            ops.push(op);
        }

        Ok(ops)
    }

    /// Resolve `$def` / `$ref` markers at a node position and, recursively,
    /// in its children. Definitions are stored before the caller sees them.
    fn resolve_node(&mut self, slot: &mut Value) -> Result<(), DecodeError> {
        if let Some(reference) = marker(slot, "$ref") {
            let token = reference
                .as_str()
                .ok_or_else(|| DecodeError::InvalidDefinition("$ref token must be a string".into()))?
                .to_owned();
            let payload = self
                .interns
                .resolve(&token)
                .cloned()
                .ok_or(DecodeError::UnresolvedReference(token))?;
            self.stats.references += 1;
            *slot = payload;
            return Ok(());
        }

        if let Some(definition) = marker(slot, "$def") {
            let (token, mut payload) = match definition {
                Value::Array(items) if items.len() == 2 => {
                    let token = items[0].as_str().ok_or_else(|| {
                        DecodeError::InvalidDefinition("$def token must be a string".into())
                    })?;
                    (token.to_owned(), items[1].clone())
                }
                _ => {
                    return Err(DecodeError::InvalidDefinition(
                        "$def must be [token, node]".into(),
                    ))
                }
            };
            self.resolve_node(&mut payload)?;
            self.interns.define(token, payload.clone());
            self.stats.definitions += 1;
            *slot = payload;
            return Ok(());
        }

        if let Some(Value::Array(children)) = slot.get_mut("children") {
            for child in children {
                self.resolve_node(child)?;
            }
        }
        Ok(())
    }
}

/// The value under `key` if `slot` is a single-key marker object.
fn marker<'a>(slot: &'a Value, key: &str) -> Option<&'a Value> {
    match slot {
        Value::Object(map) if map.len() == 1 => map.get(key),
        _ => None,
    }
}

/// Ops inside an inflated payload: either a full patch object or a bare array.
fn inner_ops(bytes: &[u8]) -> Result<Vec<Value>, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    match value {
        Value::Array(ops) => Ok(ops),
        Value::Object(mut fields) => match fields.remove("ops") {
            Some(Value::Array(ops)) => Ok(ops),
            _ => Err(DecodeError::Malformed("compressed payload has no ops array".into())),
        },
        _ => Err(DecodeError::Malformed("compressed payload is not a patch".into())),
    }
}

/// base64 → zlib inflate, off the async workers.
#[cfg(feature = "deflate")]
async fn inflate(encoded: &str) -> Result<Vec<u8>, DecodeError> {
    let compressed = BASE64_STANDARD.decode(encoded.trim())?;
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut out = Vec::new();
        flate2::read::ZlibDecoder::new(compressed.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| DecodeError::DecompressionFailed(e.to_string()))?;
        Ok(out)
    })
    .await
    .map_err(|e| DecodeError::DecompressionFailed(e.to_string()))?
}

#[cfg(not(feature = "deflate"))]
async fn inflate(encoded: &str) -> Result<Vec<u8>, DecodeError> {
    // Still reject garbage as garbage.
    let _ = BASE64_STANDARD.decode(encoded.trim())?;
    Err(DecodeError::DecompressionUnsupported)
}

/// Encode a patch payload the way `render_patch_z` carries it.
#[cfg(feature = "deflate")]
pub fn deflate_payload(payload: &Value) -> Result<String, DecodeError> {
    use std::io::Write;
    let json = serde_json::to_vec(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(&json)
        .and_then(|_| encoder.finish())
        .map(|bytes| BASE64_STANDARD.encode(bytes))
        .map_err(|e| DecodeError::DecompressionFailed(e.to_string()))
}
