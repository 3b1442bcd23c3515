//! Token codec
//!
//! Tokens are 32 bytes from the operating system's CSPRNG, hex encoded to a
//! fixed 64-character lowercase string. The raw token is handed to the email
//! channel and never stored: store keys use its blake3 digest.

use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::error;

use crate::types::token::TokenMetadata;

/// Random bytes per token
pub const TOKEN_BYTES: usize = 32;

/// Encoded token length
pub const TOKEN_LEN: usize = TOKEN_BYTES * 2;

/// Metadata codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode token metadata: {0}")]
    Encode(String),

    #[error("Malformed token metadata: {0}")]
    Malformed(String),
}

/// Generate a new token
///
/// Aborts the process if the OS random source fails.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    if let Err(e) = OsRng.try_fill_bytes(&mut bytes) {
        error!(error = %e, "OS random source unavailable, aborting");
        std::process::abort();
    }
    hex::encode(bytes)
}

/// Canonical form of a caller-supplied token, or `None` if it cannot be one
/// of ours
pub fn normalize_token(token: &str) -> Option<String> {
    let token = token.trim();
    if token.len() != TOKEN_LEN || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(token.to_ascii_lowercase())
}

/// Digest used as the store key for a token
pub fn token_hash(token: &str) -> String {
    blake3::hash(token.as_bytes()).to_hex().to_string()
}

/// Equality that does not short-circuit on the first differing byte
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Serialize token metadata
pub fn encode_metadata(metadata: &TokenMetadata) -> Result<String, CodecError> {
    serde_json::to_string(metadata).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Deserialize token metadata
pub fn decode_metadata(encoded: &str) -> Result<TokenMetadata, CodecError> {
    let metadata: TokenMetadata =
        serde_json::from_str(encoded).map_err(|e| CodecError::Malformed(e.to_string()))?;

    if metadata.user_id.is_empty() || metadata.email.is_empty() {
        return Err(CodecError::Malformed("empty subject".to_string()));
    }
    if metadata.expires_at <= metadata.created_at {
        return Err(CodecError::Malformed("expiry precedes issuance".to_string()));
    }
    Ok(metadata)
}
