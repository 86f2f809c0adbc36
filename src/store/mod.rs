use crate::assoc::Association;
use crate::misc::DynFutRes;

/// Trait that describes the persistence a relying party supplies to the
/// consumer. It is the only state shared between the two legs of a login
/// (besides the token the browser carries) and between concurrent logins.
///
/// The store is shared between threads by reference, and is itself
/// responsible for synchronizing access from different threads. Expiring
/// old nonces and associations is also the store's concern; the consumer
/// only asks that issued nonces stay present for at least `TOKEN_LIFETIME`
/// seconds.
pub trait Store: Send + Sync + 'static {
    /// A stable, secret byte string used only to authenticate bridge
    /// tokens. It must not change for the lifetime of the store; rotating
    /// it invalidates every outstanding token.
    fn get_auth_key(&self) -> DynFutRes<Vec<u8>>;

    /// When true, the consumer caches no associations and routes every
    /// callback through the provider's `check_authentication` endpoint.
    fn is_dumb(&self) -> bool;

    /// Persist an association under the provider endpoint it was negotiated
    /// with, replacing any previous one.
    fn store_association(&self, server_url: String, assoc: Association) -> DynFutRes<()>;

    /// The association last stored for `server_url`, if any.
    fn get_association(&self, server_url: String) -> DynFutRes<Option<Association>>;

    /// Drop the association for `server_url` carrying `handle`. Returns
    /// whether one was removed.
    fn remove_association(&self, server_url: String, handle: String) -> DynFutRes<bool>;

    /// Remember that `nonce` was issued.
    fn store_nonce(&self, nonce: String) -> DynFutRes<()>;

    /// Atomically consume `nonce`.
    ///
    /// This must return `Ok(true)` iff the nonce was present and had not
    /// been used before, and must be exclusive: across all concurrent
    /// callers, at most one `use_nonce` for the same nonce may see true.
    fn use_nonce(&self, nonce: String) -> DynFutRes<bool>;
}

#[cfg(feature = "simple-client")]
mod simple;
#[cfg(feature = "simple-client")]
pub use simple::*;
