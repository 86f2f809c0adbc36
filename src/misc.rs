use std::{
    future::Future,
    pin::Pin,
    time::{SystemTime, UNIX_EPOCH},
};

use ring::rand::SecureRandom;

pub type DynErr = Box<dyn std::error::Error + Send + Sync>;
pub type DynFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type DynRes<T> = Result<T, DynErr>;
pub type DynFutRes<T> = DynFut<DynRes<T>>;

/// Standard-alphabet base64, as used everywhere on the OpenID 1.x wire.
/// Callers are responsible for any URL-escaping on top of this.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    pub fn encode<T: AsRef<[u8]>>(data: T) -> String {
        STANDARD.encode(data)
    }

    pub fn decode<T: ?Sized + AsRef<[u8]>>(data: &T) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(data)
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("current system time is before Unix epoch")
        .as_secs()
}

const ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// A short random string from the alphanumeric alphabet.
///
/// Panics if the RNG fails, like every other use of `SecureRandom` in this
/// crate.
pub fn random_alnum(rng: &dyn SecureRandom, len: usize) -> String {
    let mut data = vec![0; len];
    rng.fill(&mut data)
        .expect("secure random number generator failed");
    data.iter()
        .map(|b| ALNUM[*b as usize % ALNUM.len()] as char)
        .collect()
}
