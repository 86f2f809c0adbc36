//! Minting and verification of the opaque bridge token.
//!
//! The token is the only thing carried between the two legs of a login: it
//! binds a timestamp, the single-use nonce, and the three discovered URLs
//! under an HMAC keyed by the store's auth key. It is a bearer credential;
//! anyone holding a valid token can complete the bridge step.

use ring::hmac;
use thiserror::Error;

use crate::misc::b64;

/// How long a minted token (and therefore one login attempt) stays valid,
/// in seconds.
pub const TOKEN_LIFETIME: u64 = 300;

/// HMAC-SHA1 output length.
const SIG_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("the token contained invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("the token is too short to carry a signature")]
    TooShort,
    #[error("the token signature did not validate")]
    BadSignature,
    #[error("the token payload is not valid UTF-8")]
    InvalidEncoding,
    #[error("the token does not carry exactly five fields")]
    FieldCount,
    #[error("the token timestamp is malformed")]
    BadTimestamp,
    #[error("the token has expired")]
    Expired,
}

/// The bridge state recovered from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    pub nonce: String,
    pub consumer_id: String,
    pub server_id: String,
    pub server_url: String,
}

fn hmac_key(auth_key: &[u8]) -> hmac::Key {
    hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, auth_key)
}

/// Mint a token binding the five bridge fields, authenticated with
/// `auth_key`: `base64(HMAC_SHA1(auth_key, joined) || joined)` where
/// `joined` is the NUL-separated field list starting with `now`.
pub fn mint(
    auth_key: &[u8],
    now: u64,
    nonce: &str,
    consumer_id: &str,
    server_id: &str,
    server_url: &str,
) -> String {
    let timestamp = now.to_string();
    let joined = [timestamp.as_str(), nonce, consumer_id, server_id, server_url].join("\0");
    let sig = hmac::sign(&hmac_key(auth_key), joined.as_bytes());

    let mut raw = Vec::with_capacity(SIG_LEN + joined.len());
    raw.extend_from_slice(sig.as_ref());
    raw.extend_from_slice(joined.as_bytes());
    b64::encode(raw)
}

/// Verify a token minted with the same `auth_key` no more than
/// `TOKEN_LIFETIME` seconds ago, and recover the bridge fields.
pub fn verify(auth_key: &[u8], now: u64, token: &str) -> Result<Bridge, TokenError> {
    let raw = b64::decode(token)?;
    if raw.len() < SIG_LEN {
        return Err(TokenError::TooShort);
    }
    let (sig, joined) = raw.split_at(SIG_LEN);
    hmac::verify(&hmac_key(auth_key), joined, sig).map_err(|_| TokenError::BadSignature)?;

    let joined = std::str::from_utf8(joined).map_err(|_| TokenError::InvalidEncoding)?;
    let fields: Vec<&str> = joined.split('\0').collect();
    let (timestamp, rest) = match fields.as_slice() {
        [timestamp, rest @ ..] if rest.len() == 4 => (*timestamp, rest),
        _ => return Err(TokenError::FieldCount),
    };

    let timestamp: u64 = timestamp.parse().map_err(|_| TokenError::BadTimestamp)?;
    if timestamp == 0 {
        return Err(TokenError::BadTimestamp);
    }
    if timestamp + TOKEN_LIFETIME < now {
        return Err(TokenError::Expired);
    }

    Ok(Bridge {
        nonce: rest[0].to_owned(),
        consumer_id: rest[1].to_owned(),
        server_id: rest[2].to_owned(),
        server_url: rest[3].to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"a private, high-entropy auth key";

    fn sample(now: u64) -> String {
        mint(
            KEY,
            now,
            "E4YclpNW",
            "http://alice.example/",
            "http://alice.id.example/",
            "http://idp.example/op",
        )
    }

    /// A token with an arbitrary joined payload, correctly signed.
    fn forge(joined: &str) -> String {
        let sig = hmac::sign(&hmac_key(KEY), joined.as_bytes());
        let mut raw = sig.as_ref().to_vec();
        raw.extend_from_slice(joined.as_bytes());
        b64::encode(raw)
    }

    #[test]
    fn round_trips_within_lifetime() {
        let bridge = verify(KEY, 1000 + TOKEN_LIFETIME, &sample(1000)).unwrap();
        assert_eq!(bridge.nonce, "E4YclpNW");
        assert_eq!(bridge.consumer_id, "http://alice.example/");
        assert_eq!(bridge.server_id, "http://alice.id.example/");
        assert_eq!(bridge.server_url, "http://idp.example/op");
    }

    #[test]
    fn rejects_strictly_older_than_lifetime() {
        let token = sample(1000);
        assert!(verify(KEY, 1000 + TOKEN_LIFETIME, &token).is_ok());
        assert!(matches!(
            verify(KEY, 1000 + TOKEN_LIFETIME + 1, &token),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn rejects_other_keys() {
        assert!(matches!(
            verify(b"some other key", 1000, &sample(1000)),
            Err(TokenError::BadSignature)
        ));
    }

    #[test]
    fn rejects_any_byte_mutation() {
        let token = sample(1000);
        let raw = b64::decode(&token).unwrap();
        for position in 0..raw.len() {
            let mut mutated = raw.clone();
            mutated[position] ^= 0x01;
            assert!(
                verify(KEY, 1000, &b64::encode(mutated)).is_err(),
                "mutation at byte {} was accepted",
                position
            );
        }
    }

    #[test]
    fn rejects_zero_timestamp() {
        let token = forge("0\0n\0c\0s\0u");
        assert!(matches!(
            verify(KEY, 1000, &token),
            Err(TokenError::BadTimestamp)
        ));
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(matches!(
            verify(KEY, 1000, &forge("1000\0n\0c\0s")),
            Err(TokenError::FieldCount)
        ));
        assert!(matches!(
            verify(KEY, 1000, &forge("1000\0n\0c\0s\0u\0extra")),
            Err(TokenError::FieldCount)
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(matches!(
            verify(KEY, 1000, &b64::encode(b"short")),
            Err(TokenError::TooShort)
        ));
        assert!(verify(KEY, 1000, "!!! not base64 !!!").is_err());
    }
}
