// SPDX-License-Identifier: MIT

//! Encoding and decoding of the fixed-width base58 tokens used by the invite
//! handshake.
//!
//! Two token shapes share the same layout, a 64-byte concatenation of two
//! 32-byte strings:
//!
//! * the invite token handed to the invitee: `nonce ‖ invite public key`
//! * the authorization bearer sent back on /join: `nonce ‖ HMAC`

use crate::crypto::KEY_SIZE;

/// Errors returned when a token cannot be decoded.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TokenError {
    /// The token string was empty.
    #[error("empty token")]
    Empty,

    /// The token was not valid base58.
    #[error("failed decoding token: {0}")]
    Encoding(#[from] bs58::decode::Error),

    /// The token decoded to the wrong number of bytes.
    #[error("invalid token")]
    InvalidToken,
}

/// Encode two 32-byte strings into a base58 token.
pub fn encode_token(head: &[u8; KEY_SIZE], tail: &[u8; KEY_SIZE]) -> String {
    let mut data = [0u8; KEY_SIZE * 2];
    data[..KEY_SIZE].copy_from_slice(head);
    data[KEY_SIZE..].copy_from_slice(tail);
    bs58::encode(data).into_string()
}

/// Decode a base58 token into its two 32-byte halves.
pub fn decode_token(token: &str) -> Result<([u8; KEY_SIZE], [u8; KEY_SIZE]), TokenError> {
    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    let data = bs58::decode(token).into_vec()?;
    if data.len() != KEY_SIZE * 2 {
        return Err(TokenError::InvalidToken);
    }

    let mut head = [0u8; KEY_SIZE];
    let mut tail = [0u8; KEY_SIZE];
    head.copy_from_slice(&data[..KEY_SIZE]);
    tail.copy_from_slice(&data[KEY_SIZE..]);
    Ok((head, tail))
}
