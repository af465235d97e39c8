//! On-disk artifact envelope.
//!
//! ```text
//! EEGSEG/1\n
//! {"key":{...},"label":"...","length":N,"digest":"<sha256 hex>","materializedAt":"..."}\n
//! <zstd-compressed payload>
//! ```
//!
//! The header records the key the object was derived for and a digest of the
//! uncompressed payload. A stored object is valid only if every check passes.

use std::io;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::DerivationKey;

const MAGIC: &[u8] = b"EEGSEG/1\n";

/// Metadata stored in front of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Header {
    pub key: DerivationKey,
    pub label: String,
    pub length: u64,
    pub digest: String,
    pub materialized_at: Timestamp,
}

/// A decoded and validated envelope.
#[derive(Debug)]
pub(crate) struct Opened {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Builds the stored bytes for `payload`.
pub(crate) fn seal(
    key: &DerivationKey,
    label: &str,
    payload: &[u8],
    level: i32,
) -> io::Result<(Vec<u8>, Header)> {
    let header = Header {
        key: key.clone(),
        label: label.to_string(),
        length: payload.len() as u64,
        digest: digest(payload),
        materialized_at: Timestamp::now(),
    };
    let header_json = serde_json::to_vec(&header)?;
    let compressed = zstd::encode_all(payload, level)?;

    let mut bytes = Vec::with_capacity(MAGIC.len() + header_json.len() + 1 + compressed.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&header_json);
    bytes.push(b'\n');
    bytes.extend_from_slice(&compressed);
    Ok((bytes, header))
}

/// Decodes stored bytes, checking them against the key they should belong to.
///
/// Returns a human-readable reason on any validation failure.
pub(crate) fn open(bytes: &[u8], expected: &DerivationKey) -> Result<Opened, String> {
    let rest = bytes
        .strip_prefix(MAGIC)
        .ok_or_else(|| "missing envelope magic".to_string())?;
    let newline = rest
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| "truncated header".to_string())?;
    let (header_json, compressed) = (&rest[..newline], &rest[newline + 1..]);

    let header: Header =
        serde_json::from_slice(header_json).map_err(|e| format!("invalid header: {e}"))?;
    if header.key != *expected {
        return Err(format!("stored for {} instead of {expected}", header.key));
    }

    let payload = zstd::decode_all(compressed).map_err(|e| format!("invalid payload: {e}"))?;
    if payload.len() as u64 != header.length {
        return Err(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            header.length
        ));
    }
    if digest(&payload) != header.digest {
        return Err("payload digest mismatch".to_string());
    }

    Ok(Opened { header, payload })
}

fn digest(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}
