//! Diffie-Hellman key agreement for the associate exchange, plus the
//! big-integer wire codec shared with the provider.

use num_bigint::BigUint;
use ring::digest;
use ring::rand::SecureRandom;

use crate::misc::b64;

/// The well-known OpenID 1.x modulus, in decimal.
const DEFAULT_MODULUS: &[u8] = b"155172898181473697471232257763715539915724801966915404479\
707795314057629378541917580651227423698188993727816152646631438561595825688188889951272\
158842675419950341258706556549803580104870537681476726513255747040765857479291291572334\
510643245094715007229621094194349783925984760375594985848253359305585439638443";

pub fn default_modulus() -> BigUint {
    BigUint::parse_bytes(DEFAULT_MODULUS, 10).expect("default modulus constant is valid decimal")
}

pub fn default_generator() -> BigUint {
    BigUint::from(2u32)
}

/// Encode as unsigned big-endian bytes, with a leading zero byte when the
/// most significant bit would otherwise be set. This matches the `btwoc`
/// encoding the provider side uses.
pub fn btwoc(n: &BigUint) -> Vec<u8> {
    let mut bytes = n.to_bytes_be();
    if bytes.first().map_or(true, |&b| b & 0x80 != 0) {
        bytes.insert(0, 0);
    }
    bytes
}

/// Encode a big integer for the wire: standard base64 over `btwoc` bytes.
pub fn long_to_base64(n: &BigUint) -> String {
    b64::encode(btwoc(n))
}

/// Decode a base64 big integer from the wire. A leading zero byte is
/// harmless here.
pub fn long_from_base64(data: &str) -> Result<BigUint, base64::DecodeError> {
    Ok(BigUint::from_bytes_be(&b64::decode(data)?))
}

/// One ephemeral key-agreement context. A fresh one is built per associate
/// exchange.
pub struct DiffieHellman {
    modulus: BigUint,
    generator: BigUint,
    private: BigUint,
    public: BigUint,
}

impl DiffieHellman {
    /// Build a context over the given group, with a fresh private key drawn
    /// from `rng`.
    pub fn new(modulus: BigUint, generator: BigUint, rng: &dyn SecureRandom) -> Self {
        let mut data = vec![0; (modulus.bits() as usize + 7) / 8];
        rng.fill(&mut data)
            .expect("secure random number generator failed");
        // Reduce into [1, p-1].
        let private = BigUint::from_bytes_be(&data) % (&modulus - 1u32) + 1u32;
        let public = generator.modpow(&private, &modulus);
        DiffieHellman {
            modulus,
            generator,
            private,
            public,
        }
    }

    /// Build a context over the well-known OpenID 1.x group.
    pub fn with_defaults(rng: &dyn SecureRandom) -> Self {
        Self::new(default_modulus(), default_generator(), rng)
    }

    /// Whether the group is the well-known one. The associate request omits
    /// `openid.dh_modulus` and `openid.dh_gen` exactly when this holds.
    pub fn is_default(&self) -> bool {
        self.modulus == default_modulus() && self.generator == default_generator()
    }

    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    pub fn public(&self) -> &BigUint {
        &self.public
    }

    /// The shared secret against the other party's public key.
    pub fn shared_secret(&self, other_public: &BigUint) -> BigUint {
        other_public.modpow(&self.private, &self.modulus)
    }

    /// Unwrap (or wrap: the operation is its own inverse) a MAC key by
    /// XOR-ing it against SHA-1 over the `btwoc` shared secret. Returns
    /// `None` when `data` does not match the digest length.
    pub fn xor_secret(&self, other_public: &BigUint, data: &[u8]) -> Option<Vec<u8>> {
        let shared = self.shared_secret(other_public);
        let digest = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &btwoc(&shared));
        let digest = digest.as_ref();
        if digest.len() != data.len() {
            return None;
        }
        Some(digest.iter().zip(data).map(|(a, b)| a ^ b).collect())
    }
}
