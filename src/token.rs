//! Continuation tokens: per-shard scan positions packed into one opaque string.
//!
//! ## Binary Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ MAGIC          │ 4 bytes  │ "SSCT"                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │ VERSION        │ 1 byte   │ Format version (0x01)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │ SHARD_COUNT    │ 2 bytes  │ Number of records (u16 LE)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │ RECORDS        │ variable │ One record per shard            │
//! ├─────────────────────────────────────────────────────────────┤
//! │ CRC32          │ 4 bytes  │ Checksum of everything above    │
//! └─────────────────────────────────────────────────────────────┘
//!
//! Record:
//! ┌─────────────────────────────────────────────────────────────┐
//! │ SHARD_ID       │ 2 bytes  │ u16 LE                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │ STATE          │ 1 byte   │ 0 = fresh, 1 = resume,          │
//! │                │          │ 2 = exhausted                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ CURSOR_LEN     │ 4 bytes  │ Only for resume (u32 LE)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │ CURSOR         │ N bytes  │ Only for resume, JSON object    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The payload is LZ4-frame compressed and then encoded as URL-safe base64
//! without padding. A token where every shard is exhausted encodes to the
//! empty string.

use crate::entity::Cursor;
use crate::error::{Error, Result};
use crate::shard::{ShardId, ShardSet};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::collections::BTreeMap;
use std::io::{Cursor as IoCursor, Read, Write};

/// Magic bytes identifying a token payload: "SSCT"
pub const MAGIC: &[u8; 4] = b"SSCT";

/// Current token format version
pub const VERSION: u8 = 0x01;

/// Upper bound on the decompressed payload of a token.
pub const MAX_PAYLOAD: u64 = 1024 * 1024;

/// State tag of one shard record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShardState {
  Fresh = 0x00,
  Resume = 0x01,
  Exhausted = 0x02,
}

impl TryFrom<u8> for ShardState {
  type Error = Error;
  fn try_from(v: u8) -> Result<Self> {
    match v {
      0x00 => Ok(ShardState::Fresh),
      0x01 => Ok(ShardState::Resume),
      0x02 => Ok(ShardState::Exhausted),
      _ => Err(Error::MalformedToken(format!("unknown shard state {}", v))),
    }
  }
}

/// Scan state of a single shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardPosition {
  /// Not started yet; the next request starts at the beginning of the shard.
  Fresh,
  /// The next request starts after this last-evaluated key.
  Resume(Cursor),
  /// No further items; the shard is never queried again for this scan.
  Exhausted,
}

impl ShardPosition {
  pub fn is_exhausted(&self) -> bool {
    matches!(self, ShardPosition::Exhausted)
  }

  /// Position after a page that returned `last_evaluated`.
  pub fn after(last_evaluated: Option<Cursor>) -> Self {
    match last_evaluated {
      Some(cursor) if !cursor.is_empty() => ShardPosition::Resume(cursor),
      _ => ShardPosition::Exhausted,
    }
  }

  /// Cursor to start the next request from.
  pub fn start_key(&self) -> Option<&Cursor> {
    match self {
      ShardPosition::Resume(cursor) => Some(cursor),
      _ => None,
    }
  }
}

/// Decoded continuation token: one position per configured shard.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContinuationToken {
  positions: BTreeMap<ShardId, ShardPosition>,
}

impl ContinuationToken {
  /// A token positioned at the start of every shard.
  pub fn fresh(shards: &ShardSet) -> Self {
    Self {
      positions: shards.iter().map(|id| (id, ShardPosition::Fresh)).collect(),
    }
  }

  pub fn from_positions(positions: BTreeMap<ShardId, ShardPosition>) -> Self {
    Self { positions }
  }

  pub fn get(&self, shard: ShardId) -> Option<&ShardPosition> {
    self.positions.get(&shard)
  }

  pub fn set(&mut self, shard: ShardId, position: ShardPosition) {
    self.positions.insert(shard, position);
  }

  pub fn iter(&self) -> impl Iterator<Item = (ShardId, &ShardPosition)> {
    self.positions.iter().map(|(id, p)| (*id, p))
  }

  pub fn len(&self) -> usize {
    self.positions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.positions.is_empty()
  }

  /// True when no shard has anything left to return.
  pub fn is_exhausted(&self) -> bool {
    self.positions.values().all(ShardPosition::is_exhausted)
  }

  /// Shards that still need to be queried.
  pub fn live_shards(&self) -> impl Iterator<Item = ShardId> + '_ {
    self
      .positions
      .iter()
      .filter(|(_, p)| !p.is_exhausted())
      .map(|(id, _)| *id)
  }

  /// True if this token holds exactly one position per shard of `shards`.
  pub fn covers(&self, shards: &ShardSet) -> bool {
    self.positions.len() == shards.len() && shards.iter().all(|id| self.positions.contains_key(&id))
  }
}

/// Encodes and decodes continuation tokens for one [`ShardSet`].
#[derive(Debug, Clone)]
pub struct TokenCodec {
  shards: ShardSet,
}

impl TokenCodec {
  pub fn new(shards: ShardSet) -> Self {
    Self { shards }
  }

  pub fn shards(&self) -> &ShardSet {
    &self.shards
  }

  /// Serializes `token` into an opaque string.
  ///
  /// Returns an empty string if every shard is exhausted.
  ///
  /// # Errors
  ///
  /// Returns `Error::Config` if the token does not cover exactly this codec's shard set.
  pub fn encode(&self, token: &ContinuationToken) -> Result<String> {
    if !token.covers(&self.shards) {
      return Err(Error::Config(format!(
        "continuation token must cover shards {}, got {:?}",
        self.shards,
        token.positions.keys().collect::<Vec<_>>()
      )));
    }
    if token.is_exhausted() {
      return Ok(String::new());
    }

    let payload = serialize_payload(token)?;

    let mut encoder = FrameEncoder::new(Vec::new());
    encoder.write_all(&payload)?;
    let compressed = encoder
      .finish()
      .map_err(|e| Error::Serialization(format!("LZ4 compression failed: {}", e)))?;

    Ok(URL_SAFE_NO_PAD.encode(compressed))
  }

  /// Reverses [`TokenCodec::encode`].
  ///
  /// # Errors
  ///
  /// Returns `Error::MalformedToken` if the string is corrupted or was produced
  /// for a different shard set.
  pub fn decode(&self, token: &str) -> Result<ContinuationToken> {
    let compressed = URL_SAFE_NO_PAD
      .decode(token.trim())
      .map_err(|e| Error::MalformedToken(format!("invalid base64: {}", e)))?;

    // One byte past the limit tells an oversized payload apart from one that fits exactly
    let mut payload = Vec::new();
    FrameDecoder::new(compressed.as_slice())
      .take(MAX_PAYLOAD + 1)
      .read_to_end(&mut payload)
      .map_err(|e| Error::MalformedToken(format!("invalid compressed payload: {}", e)))?;
    if payload.len() as u64 > MAX_PAYLOAD {
      return Err(Error::MalformedToken(format!(
        "payload exceeds {} bytes when decompressed",
        MAX_PAYLOAD
      )));
    }

    let decoded = deserialize_payload(&payload)?;

    if decoded.positions.len() != self.shards.len() {
      return Err(Error::MalformedToken(format!(
        "token covers {} shards, expected {}",
        decoded.positions.len(),
        self.shards.len()
      )));
    }
    if let Some(unknown) = decoded.positions.keys().find(|id| !self.shards.contains(**id)) {
      return Err(Error::MalformedToken(format!("unknown shard id {} in token", unknown)));
    }

    Ok(decoded)
  }
}

fn serialize_payload(token: &ContinuationToken) -> Result<Vec<u8>> {
  if token.positions.len() > u16::MAX as usize {
    return Err(Error::Serialization(format!(
      "too many shards: {} (max: {})",
      token.positions.len(),
      u16::MAX
    )));
  }

  let mut buf = Vec::new();
  buf.write_all(MAGIC)?;
  buf.write_u8(VERSION)?;
  buf.write_u16::<LittleEndian>(token.positions.len() as u16)?;

  for (shard, position) in &token.positions {
    buf.write_u16::<LittleEndian>(*shard)?;
    match position {
      ShardPosition::Fresh => buf.write_u8(ShardState::Fresh as u8)?,
      ShardPosition::Exhausted => buf.write_u8(ShardState::Exhausted as u8)?,
      ShardPosition::Resume(cursor) => {
        let bytes = serde_json::to_vec(cursor)?;
        if bytes.len() > u32::MAX as usize {
          return Err(Error::Serialization(format!(
            "cursor for shard {} is too large: {} bytes",
            shard,
            bytes.len()
          )));
        }
        buf.write_u8(ShardState::Resume as u8)?;
        buf.write_u32::<LittleEndian>(bytes.len() as u32)?;
        buf.write_all(&bytes)?;
      }
    }
  }

  let mut hasher = Hasher::new();
  hasher.update(&buf);
  buf.write_u32::<LittleEndian>(hasher.finalize())?;
  if buf.len() as u64 > MAX_PAYLOAD {
    return Err(Error::Serialization(format!(
      "token payload of {} bytes exceeds {} bytes",
      buf.len(),
      MAX_PAYLOAD
    )));
  }
  Ok(buf)
}

fn deserialize_payload(payload: &[u8]) -> Result<ContinuationToken> {
  let truncated = |_| Error::MalformedToken("truncated payload".into());

  if payload.len() < MAGIC.len() + 1 + 2 + 4 {
    return Err(Error::MalformedToken(format!("payload too short: {} bytes", payload.len())));
  }

  let (body, crc_bytes) = payload.split_at(payload.len() - 4);
  let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
  let mut hasher = Hasher::new();
  hasher.update(body);
  let actual = hasher.finalize();
  if expected != actual {
    return Err(Error::MalformedToken(format!(
      "checksum mismatch: expected {:#x}, got {:#x}",
      expected, actual
    )));
  }

  let mut reader = IoCursor::new(body);

  let mut magic = [0u8; 4];
  reader.read_exact(&mut magic).map_err(truncated)?;
  if &magic != MAGIC {
    return Err(Error::MalformedToken(format!("invalid magic: {:?}", magic)));
  }

  let version = reader.read_u8().map_err(truncated)?;
  if version != VERSION {
    return Err(Error::MalformedToken(format!(
      "unsupported version: expected {}, got {}",
      VERSION, version
    )));
  }

  let count = reader.read_u16::<LittleEndian>().map_err(truncated)?;
  let mut positions = BTreeMap::new();

  for _ in 0..count {
    let shard = reader.read_u16::<LittleEndian>().map_err(truncated)?;
    let position = match ShardState::try_from(reader.read_u8().map_err(truncated)?)? {
      ShardState::Fresh => ShardPosition::Fresh,
      ShardState::Exhausted => ShardPosition::Exhausted,
      ShardState::Resume => {
        let len = reader.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let remaining = body.len() - reader.position() as usize;
        if len > remaining {
          return Err(Error::MalformedToken(format!(
            "cursor length {} exceeds remaining {} bytes",
            len, remaining
          )));
        }
        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes).map_err(truncated)?;
        let cursor: Cursor = serde_json::from_slice(&bytes)
          .map_err(|e| Error::MalformedToken(format!("invalid cursor for shard {}: {}", shard, e)))?;
        ShardPosition::Resume(cursor)
      }
    };
    if positions.insert(shard, position).is_some() {
      return Err(Error::MalformedToken(format!("shard {} appears twice", shard)));
    }
  }

  if reader.position() as usize != body.len() {
    return Err(Error::MalformedToken(format!(
      "{} trailing bytes after last record",
      body.len() - reader.position() as usize
    )));
  }

  Ok(ContinuationToken { positions })
}
