// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire encoding for [`ReplicationMessage`].
//!
//! Messages are JSON. Payloads at or above the compression threshold are
//! zstd-compressed; decoders detect compression by the zstd magic header so
//! both forms can share a stream.
//!
//! # Content Hash Validation
//!
//! Publishers attach the SHA256 of the *uncompressed* payload. Consumers use
//! [`decode_verified`] to detect corruption from network bit flips or
//! compression bugs before applying a message.

use crate::error::{ReplicationError, Result};
use crate::message::ReplicationMessage;
use std::io::Read;

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// zstd level used for compressed payloads.
const COMPRESSION_LEVEL: i32 = 3;

/// An encoded message ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    /// JSON, possibly zstd-compressed.
    pub data: Vec<u8>,
    /// Hex SHA256 of the uncompressed JSON.
    pub content_hash: String,
    pub compressed: bool,
}

/// Serialize a message, compressing when the JSON reaches
/// `compression_threshold` bytes. A threshold of 0 disables compression.
pub fn encode(message: &ReplicationMessage, compression_threshold: usize) -> Result<EncodedMessage> {
    let json = serde_json::to_vec(message)?;
    let content_hash = compute_content_hash(&json);

    if compression_threshold > 0 && json.len() >= compression_threshold {
        let data = zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL)
            .map_err(|e| ReplicationError::Codec(format!("zstd encode: {}", e)))?;
        return Ok(EncodedMessage {
            data,
            content_hash,
            compressed: true,
        });
    }

    Ok(EncodedMessage {
        data: json,
        content_hash,
        compressed: false,
    })
}

/// Decode a message from plain or zstd-compressed JSON.
pub fn decode(data: &[u8]) -> Result<ReplicationMessage> {
    let json = maybe_decompress(data)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Decode a message and check it against the hash recorded by the publisher.
pub fn decode_verified(data: &[u8], expected_hash: &str) -> Result<ReplicationMessage> {
    let json = maybe_decompress(data)?;
    let computed = compute_content_hash(&json);
    if computed != expected_hash {
        return Err(ReplicationError::Codec(format!(
            "content hash mismatch: expected {}, got {}",
            expected_hash, computed
        )));
    }
    Ok(serde_json::from_slice(&json)?)
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| ReplicationError::Decompression(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| ReplicationError::Decompression(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Compute SHA256 content hash as hex string.
pub fn compute_content_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(data);
    hex::encode(hash)
}
