// src/crypto.rs
//
// Narrow capability seam for the cryptographic kernel. The engine only ever
// talks to the `CryptoKernel` trait; `Sha256Kernel` is a local
// implementation so the engine runs without the external library.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::codec;

/// Maximum accepted input for any kernel call (100 MiB).
pub const MAX_KERNEL_INPUT: usize = 100 * 1024 * 1024;

/// Error codes mirroring the kernel's FFI surface.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("empty input")]
    EmptyInput,
    #[error("input size {0} exceeds maximum")]
    InputTooLarge(usize),
    #[error("invalid utf-8")]
    InvalidUtf8,
    #[error("parse error: {0}")]
    Parse(String),
    #[error("result buffer too small")]
    BufferTooSmall,
    #[error("internal kernel error: {0}")]
    Internal(String),
}

/// Capability consumed by the engine: merkle roots, block hashes, bulk
/// validation and batch processing over opaque byte payloads.
pub trait CryptoKernel: Send + Sync {
    /// Merkle root over a JSON array of events; returns a hex digest.
    fn merkle_root(&self, events_json: &[u8]) -> Result<String, CryptoError>;

    /// Hash of a JSON block document; returns a hex digest.
    fn block_hash(&self, block_json: &[u8]) -> Result<String, CryptoError>;

    /// Bulk structural validation of a JSON array of transactions.
    fn validate_transactions(&self, txs_json: &[u8]) -> Result<bool, CryptoError>;

    /// Process a columnar wire batch, returning the kernel's response bytes.
    fn process_batch(&self, batch: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

fn check_input(input: &[u8]) -> Result<(), CryptoError> {
    if input.is_empty() {
        return Err(CryptoError::EmptyInput);
    }
    if input.len() > MAX_KERNEL_INPUT {
        return Err(CryptoError::InputTooLarge(input.len()));
    }
    Ok(())
}

pub fn hash_bytes_sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Local SHA-256 kernel. Leaves are hashes of each event's canonical JSON
/// (object keys sorted); levels pair left-to-right, duplicating an odd tail.
pub struct Sha256Kernel;

impl Sha256Kernel {
    fn canonical_values(input: &[u8]) -> Result<Vec<serde_json::Value>, CryptoError> {
        std::str::from_utf8(input).map_err(|_| CryptoError::InvalidUtf8)?;
        let parsed: serde_json::Value =
            serde_json::from_slice(input).map_err(|e| CryptoError::Parse(e.to_string()))?;
        match parsed {
            serde_json::Value::Array(items) => Ok(items),
            _ => Err(CryptoError::Parse("expected a JSON array".into())),
        }
    }

    fn merkle_from_leaves(mut level: Vec<[u8; 32]>) -> [u8; 32] {
        if level.is_empty() {
            return hash_bytes_sha256(b"");
        }
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                let last = *level.last().expect("non-empty level");
                level.push(last);
            }
            level = level
                .chunks(2)
                .map(|pair| {
                    let mut buf = [0u8; 64];
                    buf[..32].copy_from_slice(&pair[0]);
                    buf[32..].copy_from_slice(&pair[1]);
                    hash_bytes_sha256(&buf)
                })
                .collect();
        }
        level[0]
    }
}

impl CryptoKernel for Sha256Kernel {
    fn merkle_root(&self, events_json: &[u8]) -> Result<String, CryptoError> {
        check_input(events_json)?;
        let events = Self::canonical_values(events_json)?;
        let leaves: Vec<[u8; 32]> = events
            .iter()
            .map(|ev| {
                // serde_json objects iterate sorted by key, so this
                // serialization is canonical.
                let bytes = serde_json::to_vec(ev)
                    .map_err(|e| CryptoError::Internal(e.to_string()))?;
                Ok(hash_bytes_sha256(&bytes))
            })
            .collect::<Result<_, CryptoError>>()?;
        Ok(hex::encode(Self::merkle_from_leaves(leaves)))
    }

    fn block_hash(&self, block_json: &[u8]) -> Result<String, CryptoError> {
        check_input(block_json)?;
        std::str::from_utf8(block_json).map_err(|_| CryptoError::InvalidUtf8)?;
        let parsed: serde_json::Value =
            serde_json::from_slice(block_json).map_err(|e| CryptoError::Parse(e.to_string()))?;
        let canonical =
            serde_json::to_vec(&parsed).map_err(|e| CryptoError::Internal(e.to_string()))?;
        Ok(hex::encode(hash_bytes_sha256(&canonical)))
    }

    fn validate_transactions(&self, txs_json: &[u8]) -> Result<bool, CryptoError> {
        check_input(txs_json)?;
        let txs = Self::canonical_values(txs_json)?;
        if txs.is_empty() {
            return Ok(false);
        }
        let ok = txs.iter().all(|tx| {
            let obj = match tx.as_object() {
                Some(o) => o,
                None => return false,
            };
            let non_empty = |key: &str| {
                obj.get(key)
                    .and_then(|v| v.as_str())
                    .map(|s| !s.is_empty())
                    .unwrap_or(false)
            };
            non_empty("entity_id") && (non_empty("event") || non_empty("event_type"))
        });
        Ok(ok)
    }

    fn process_batch(&self, batch: &[u8]) -> Result<Vec<u8>, CryptoError> {
        check_input(batch)?;
        let decoded = codec::decode_batch(batch).map_err(|e| CryptoError::Parse(e.to_string()))?;
        codec::batch_to_json(&decoded).map_err(|e| CryptoError::Internal(e.to_string()))
    }
}
