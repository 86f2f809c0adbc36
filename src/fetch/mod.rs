use bytes::Bytes;
use url::Url;

use crate::misc::DynFut;

/// The result of one fetch: the final status, the post-redirect URL, and
/// the response body.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub final_url: Url,
    pub body: Bytes,
}

/// Trait describing the outbound HTTP operations the consumer performs:
/// the discovery GET and the associate / `check_authentication` POSTs.
///
/// A `None` result stands for any transport failure, including timeouts;
/// the consumer never retries. Implementations are expected to enforce a
/// deadline of their own choosing.
pub trait Fetcher: Send + Sync + 'static {
    /// HTTP GET, following redirects. `final_url` is the URL that actually
    /// produced the response.
    fn get(&self, url: Url) -> DynFut<Option<FetchResponse>>;

    /// HTTP POST with an `application/x-www-form-urlencoded` body.
    fn post(&self, url: Url, body: String) -> DynFut<Option<FetchResponse>>;
}

#[cfg(feature = "simple-client")]
mod simple;
#[cfg(feature = "simple-client")]
pub use simple::*;
