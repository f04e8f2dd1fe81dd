//! Remote payload envelope.
//!
//! Layout: `[magic(4)] [flags(1)] [sha256(32)] [body]`, where the body is the
//! JSON payload, zstd-compressed if flag bit 0 is set, and the checksum is
//! taken over the body as stored. Payloads written before the envelope
//! existed are plain JSON and are still accepted.

use crate::error::{Result, SyncError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strata_core::AppSnapshot;

/// Magic bytes of an enveloped payload
pub const PAYLOAD_MAGIC: &[u8; 4] = b"STRA";

const FLAG_ZSTD: u8 = 0x01;
const HEADER_LEN: usize = 4 + 1 + 32;
const ZSTD_LEVEL: i32 = 3;

/// What a provider stores: the whole dataset plus the time it last changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePayload {
    #[serde(rename = "lastLocalSyncModelChange", default)]
    pub last_change: i64,
    pub data: AppSnapshot,
}

impl RemotePayload {
    pub fn new(last_change: i64, data: AppSnapshot) -> Self {
        Self { last_change, data }
    }

    pub fn encode(&self, compress: bool) -> Result<Bytes> {
        let json = serde_json::to_vec(self).map_err(|e| SyncError::Payload(e.to_string()))?;
        let (flags, body) = if compress {
            let compressed = zstd::encode_all(&json[..], ZSTD_LEVEL)
                .map_err(|e| SyncError::Payload(format!("Failed to compress: {}", e)))?;
            (FLAG_ZSTD, compressed)
        } else {
            (0, json)
        };
        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        buf.extend_from_slice(PAYLOAD_MAGIC);
        buf.push(flags);
        buf.extend_from_slice(&Sha256::digest(&body));
        buf.extend_from_slice(&body);
        Ok(Bytes::from(buf))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if !data.starts_with(PAYLOAD_MAGIC) {
            // Legacy payload
            return serde_json::from_slice(data)
                .map_err(|e| SyncError::Payload(format!("Not an enveloped or JSON payload: {}", e)));
        }
        if data.len() < HEADER_LEN {
            return Err(SyncError::Payload("Payload too short for header".to_string()));
        }
        let flags = data[4];
        let checksum = &data[5..HEADER_LEN];
        let body = &data[HEADER_LEN..];
        if Sha256::digest(body).as_slice() != checksum {
            return Err(SyncError::Payload(format!(
                "Checksum mismatch (expected {})",
                hex::encode(checksum)
            )));
        }
        let json = if flags & FLAG_ZSTD != 0 {
            zstd::decode_all(body).map_err(|e| SyncError::Payload(format!("Failed to decompress: {}", e)))?
        } else {
            body.to_vec()
        };
        serde_json::from_slice(&json).map_err(|e| SyncError::Payload(e.to_string()))
    }
}

/// Hex SHA-256 of a payload; used as revision token where the backend has none
pub fn content_revision(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
