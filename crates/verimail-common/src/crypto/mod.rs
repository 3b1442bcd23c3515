//! Cryptographic primitives for Verimail
//!
//! This module provides:
//! - Token generation from the OS CSPRNG
//! - Token hashing for store keys
//! - Metadata codec and constant-time comparison

pub mod token;

// Re-export commonly used items
pub use token::{
    constant_time_eq, decode_metadata, encode_metadata, generate_token, normalize_token,
    token_hash, CodecError,
};
