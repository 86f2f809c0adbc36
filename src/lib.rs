//! An OpenID 1.x consumer (relying party) library.
//!
//! The primary interface of this package is the `Consumer`. Construct one
//! using `Consumer::builder` or `Consumer::new`, then drive a login with
//! its three operations: `begin_auth` discovers the user's provider and
//! returns an [`AuthRequest`], `construct_redirect` builds the URL to send
//! the user agent (browser) to, and `complete_auth` checks the provider's
//! signed callback.
//!
//! Almost nothing can be held in memory between those two HTTP requests,
//! so the bridge state travels in `AuthRequest::token`: an opaque,
//! HMAC-authenticated, time-bounded string the caller must carry across
//! requests (in a session, a cookie, or the `return_to` URL itself).
//!
//! Some data storage is needed to implement the protocol. This is used for
//! the token auth key, caching of provider associations, and single-use
//! login nonces. The `Store` trait facilitates this, and by default, an
//! in-memory store is used. This will work fine for simple single-process
//! applications, but if you intend to run multiple workers, an alternative
//! `Store` must be implemented. Outbound HTTP goes through the `Fetcher`
//! trait, with a hyper-based default.
//!
//! The crate feature `simple-client` is enabled by default, but can be
//! disabled to remove the Tokio and Hyper dependencies. When disabled, the
//! default `MemoryStore` and `HttpFetcher` will also not be available, and
//! custom implementations must be provided.

mod assoc;
mod dh;
mod discovery;
mod fetch;
mod kvform;
mod misc;
mod store;
mod token;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use url::Url;

use crate::dh::DiffieHellman;
use crate::discovery::DiscoveryError;
use crate::misc::{unix_now, DynErr};

pub use crate::assoc::Association;
pub use crate::fetch::*;
pub use crate::store::*;
pub use crate::token::TOKEN_LIFETIME;

/// Length of the single-use login nonce.
const NONCE_LEN: usize = 8;

/// Errors that can result from `Builder::build`.
#[derive(Debug, Error)]
pub enum BuildError {
    #[cfg(not(feature = "simple-client"))]
    #[error("no default store is available")]
    NoDefaultStore,
    #[cfg(not(feature = "simple-client"))]
    #[error("no default fetcher is available")]
    NoDefaultFetcher,
}

/// Errors that can result from `Consumer::begin_auth`.
#[derive(Debug, Error)]
pub enum BeginError {
    /// The identity page could not be fetched. Carries the HTTP status when
    /// one was received; `None` means the transport itself failed.
    #[error("could not fetch the claimed identity URL")]
    HttpFailure(Option<u16>),
    /// The page was fetched but does not advertise an OpenID server.
    #[error("the claimed identity URL does not declare an OpenID server")]
    NoOpenIdServer,
    /// The store could not produce the token auth key.
    #[error("could not read the token auth key from the store")]
    Store(#[source] DynErr),
}

/// Errors that can result from `Consumer::construct_redirect`.
#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("the provider endpoint is not a valid URL")]
    InvalidServerUrl,
    #[error("could not record the login nonce in the store")]
    Store(#[source] DynErr),
}

/// Outcome of `Consumer::complete_auth`.
///
/// The identity carried by `Success` and `Failure` is the claimed
/// (normalized) identity URL recovered from the bridge token, when the
/// token verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The callback verified. `Success(None)` means the user cancelled at
    /// the provider; callers MUST treat a missing identity as "not logged
    /// in".
    Success(Option<String>),
    /// Any negative outcome: tampered or expired token, signature mismatch,
    /// nonce replay, a provider-reported error, or missing required fields.
    Failure(Option<String>),
    /// An immediate-mode request needs user interaction; redirect the user
    /// to the carried setup URL and retry later.
    SetupNeeded(String),
}

/// The bridge state for one login attempt, returned by `begin_auth` and
/// consumed by `construct_redirect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Opaque, tamper-evident token. The caller is responsible for carrying
    /// it to the request that handles the provider's callback.
    pub token: String,
    /// The identity the provider will assert (the delegate when the page
    /// declares one).
    pub server_id: String,
    /// The provider endpoint.
    pub server_url: String,
    /// The single-use login nonce, also bound inside the token.
    pub nonce: String,
}

/// A builder to configure a `Consumer`.
#[derive(Clone)]
pub struct Builder {
    store: Option<Arc<dyn Store>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    immediate: bool,
}

impl Builder {
    fn new() -> Self {
        Builder {
            store: None,
            fetcher: None,
            immediate: false,
        }
    }

    /// Use the given `Store` for auth key, association, and nonce storage.
    ///
    /// If no store is specified, a default `MemoryStore` is created. This
    /// type of store has some limitations. See the documentation for
    /// `MemoryStore` for details.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use the given `Fetcher` for outbound HTTP.
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Ask providers for a non-interactive answer (`checkid_immediate`).
    /// When the provider needs the user, `complete_auth` then reports
    /// `Completion::SetupNeeded` instead of sending them through a login
    /// page mid-flow.
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Verify the configuration and build the consumer.
    pub fn build(self) -> Result<Consumer, BuildError> {
        let store = match self.store {
            Some(store) => store,
            #[cfg(feature = "simple-client")]
            None => Arc::new(MemoryStore::default()),
            #[cfg(not(feature = "simple-client"))]
            None => return Err(BuildError::NoDefaultStore),
        };
        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            #[cfg(feature = "simple-client")]
            None => Arc::new(HttpFetcher::default()),
            #[cfg(not(feature = "simple-client"))]
            None => return Err(BuildError::NoDefaultFetcher),
        };

        // Dummy RNG call to flush out any latency from lazy init.
        let rng = SystemRandom::new();
        let mut dummy = [0; 8];
        rng.fill(&mut dummy)
            .expect("secure random number generator failed");

        Ok(Consumer {
            store,
            fetcher,
            immediate: self.immediate,
            rng,
        })
    }
}

/// An OpenID 1.x consumer.
///
/// Sharing a consumer can be done simply by reference, even across threads;
/// all methods take an immutable reference to `self` only. Concurrent
/// logins share nothing but the store and the fetcher.
#[derive(Clone)]
pub struct Consumer {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn Fetcher>,
    immediate: bool,
    rng: SystemRandom,
}

impl Consumer {
    /// Create a builder-style struct to configure a `Consumer`.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Create a consumer with default settings.
    ///
    /// This uses a `MemoryStore` and an `HttpFetcher`; see their
    /// documentation for limitations.
    #[cfg(feature = "simple-client")]
    pub fn new() -> Self {
        Builder::new().build().unwrap()
    }

    /// Discover the provider behind a user-entered identity URL and mint
    /// the bridge state for one login attempt.
    ///
    /// The returned `AuthRequest` is not yet registered anywhere; nothing
    /// is committed until `construct_redirect`.
    pub async fn begin_auth(&self, user_url: &str) -> Result<AuthRequest, BeginError> {
        let discovered = discovery::discover(self.fetcher.as_ref(), user_url)
            .await
            .map_err(|err| match err {
                DiscoveryError::HttpFailure(status) => BeginError::HttpFailure(status),
                DiscoveryError::NoServerLink => BeginError::NoOpenIdServer,
            })?;

        let nonce = misc::random_alnum(&self.rng, NONCE_LEN);
        let auth_key = self.store.get_auth_key().await.map_err(BeginError::Store)?;
        let token = token::mint(
            &auth_key,
            unix_now(),
            &nonce,
            &discovered.consumer_id,
            &discovered.server_id,
            &discovered.server_url,
        );

        Ok(AuthRequest {
            token,
            server_id: discovered.server_id,
            server_url: discovered.server_url,
            nonce,
        })
    }

    /// Build the URL to redirect the user agent to, and register the login
    /// nonce with the store.
    ///
    /// The query is appended onto the provider endpoint, preserving any
    /// query already present there. `return_to` is where the provider
    /// sends the user back; `trust_root` is the URL pattern the provider
    /// shows the user when asking them to authorize this site.
    pub async fn construct_redirect(
        &self,
        request: &AuthRequest,
        return_to: &str,
        trust_root: &str,
    ) -> Result<Url, RedirectError> {
        let mut redirect =
            Url::parse(&request.server_url).map_err(|_| RedirectError::InvalidServerUrl)?;

        let assoc = self.association_for(&request.server_url, true).await;

        // The marker a successful callback will consume.
        self.store
            .store_nonce(request.nonce.clone())
            .await
            .map_err(RedirectError::Store)?;

        let mode = if self.immediate {
            "checkid_immediate"
        } else {
            "checkid_setup"
        };
        {
            let mut query = redirect.query_pairs_mut();
            query
                .append_pair("openid.identity", &request.server_id)
                .append_pair("openid.return_to", return_to)
                .append_pair("openid.trust_root", trust_root)
                .append_pair("openid.mode", mode);
            if let Some(assoc) = &assoc {
                query.append_pair("openid.assoc_handle", &assoc.handle);
            }
        }
        Ok(redirect)
    }

    /// Check the provider's callback against the bridge token minted in
    /// `begin_auth`.
    ///
    /// `query` is the parsed query (or form) the provider redirected the
    /// user back with. Keys that a form parser rewrote from `openid.` to
    /// `openid_` are accepted. Transport or store trouble during
    /// verification collapses to `Completion::Failure`; this method never
    /// errors.
    pub async fn complete_auth(&self, token: &str, query: &HashMap<String, String>) -> Completion {
        let query = canonicalize_query(query);

        match query.get("openid.mode").map(String::as_str) {
            Some("cancel") => return Completion::Success(None),
            Some("error") => {
                log::warn!(
                    "provider returned an error: {}",
                    query
                        .get("openid.error")
                        .map(String::as_str)
                        .unwrap_or("(no message)")
                );
                return Completion::Failure(None);
            }
            Some("id_res") => {}
            _ => return Completion::Failure(None),
        }

        let auth_key = match self.store.get_auth_key().await {
            Ok(auth_key) => auth_key,
            Err(err) => {
                log::warn!("could not read the token auth key: {}", err);
                return Completion::Failure(None);
            }
        };
        let bridge = match token::verify(&auth_key, unix_now(), token) {
            Ok(bridge) => bridge,
            Err(err) => {
                log::debug!("bridge token rejected: {}", err);
                return Completion::Failure(None);
            }
        };
        let consumer_id = bridge.consumer_id.clone();

        let (identity, assoc_handle) = match (
            query.get("openid.return_to"),
            query.get("openid.identity"),
            query.get("openid.assoc_handle"),
        ) {
            // The caller checks return_to against the URL actually hit;
            // here it only has to be present.
            (Some(_), Some(identity), Some(assoc_handle)) => (identity, assoc_handle),
            _ => return Completion::Failure(Some(consumer_id)),
        };
        if identity != &bridge.server_id {
            return Completion::Failure(Some(consumer_id));
        }

        if let Some(setup_url) = query.get("openid.user_setup_url") {
            return Completion::SetupNeeded(setup_url.clone());
        }

        let assoc = match self.store.get_association(bridge.server_url.clone()).await {
            Ok(assoc) => assoc,
            Err(err) => {
                log::warn!("could not load association for {}: {}", bridge.server_url, err);
                None
            }
        };

        let verified = match assoc {
            Some(assoc) if &assoc.handle == assoc_handle && assoc.is_valid(unix_now()) => {
                self.direct_verify(&assoc, &query)
            }
            _ => self.check_authentication(&bridge, &query).await,
        };
        if !verified {
            return Completion::Failure(Some(consumer_id));
        }

        // The nonce burns only after the signature held up; a nonce that
        // cannot be consumed means a replayed callback.
        match self.store.use_nonce(bridge.nonce.clone()).await {
            Ok(true) => Completion::Success(Some(consumer_id)),
            Ok(false) => Completion::Failure(Some(consumer_id)),
            Err(err) => {
                log::warn!("could not consume the login nonce: {}", err);
                Completion::Failure(Some(consumer_id))
            }
        }
    }

    /// The association to cite for `server_url`, negotiating a fresh one
    /// when the store has none, or when `replace` is set and the stored one
    /// is within `TOKEN_LIFETIME` of expiring. Returns `None` for dumb
    /// stores and on failed negotiation.
    async fn association_for(&self, server_url: &str, replace: bool) -> Option<Association> {
        if self.store.is_dumb() {
            return None;
        }

        let stored = match self.store.get_association(server_url.to_owned()).await {
            Ok(stored) => stored,
            Err(err) => {
                log::warn!("could not load association for {}: {}", server_url, err);
                None
            }
        };
        if let Some(assoc) = stored {
            if !(replace && assoc.expires_in(unix_now()) < TOKEN_LIFETIME) {
                return Some(assoc);
            }
        }

        let dh = DiffieHellman::with_defaults(&self.rng);
        let assoc = assoc::negotiate(self.fetcher.as_ref(), server_url, dh).await?;
        if let Err(err) = self
            .store
            .store_association(server_url.to_owned(), assoc.clone())
            .await
        {
            log::warn!("could not store association for {}: {}", server_url, err);
        }
        Some(assoc)
    }

    /// Smart-mode check: recompute the signature locally with the stored
    /// association. The comparison is constant-time.
    fn direct_verify(&self, assoc: &Association, query: &HashMap<String, String>) -> bool {
        let (sig, signed) = match (query.get("openid.sig"), query.get("openid.signed")) {
            (Some(sig), Some(signed)) => (sig, signed),
            _ => return false,
        };
        let fields: Vec<&str> = signed.split(',').collect();
        let computed = assoc.sign(&fields, query);
        ring::constant_time::verify_slices_are_equal(computed.as_bytes(), sig.as_bytes()).is_ok()
    }

    /// Dumb-mode check: hand the signed fields back to the provider and ask
    /// it to verify them (`check_authentication`).
    async fn check_authentication(
        &self,
        bridge: &token::Bridge,
        query: &HashMap<String, String>,
    ) -> bool {
        let signed = match query.get("openid.signed") {
            Some(signed) => signed,
            None => return false,
        };

        // The signed fields, plus the bookkeeping fields the provider needs
        // whether or not they were signed.
        let mut wanted: HashSet<&str> = signed.split(',').collect();
        wanted.extend(["assoc_handle", "sig", "signed", "invalidate_handle"]);

        let mut form = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in query {
            match key.strip_prefix("openid.") {
                Some("mode") => continue,
                Some(name) if wanted.contains(name) => form.append_pair(key, value),
                _ => continue,
            };
        }
        form.append_pair("openid.mode", "check_authentication");
        let body = form.finish();

        let url = match Url::parse(&bridge.server_url) {
            Ok(url) => url,
            Err(_) => return false,
        };
        let response = match self.fetcher.post(url, body).await {
            Some(response) => response,
            None => {
                log::warn!("check_authentication request to {} failed", bridge.server_url);
                return false;
            }
        };
        let results = kvform::parse(&String::from_utf8_lossy(&response.body));

        if results.get("is_valid").map(String::as_str) != Some("true") {
            if let Some(error) = results.get("error") {
                log::warn!("provider {} reported: {}", bridge.server_url, error);
            }
            return false;
        }

        if let Some(handle) = results.get("invalidate_handle") {
            let removed = self
                .store
                .remove_association(bridge.server_url.clone(), handle.clone())
                .await;
            if let Err(err) = removed {
                log::warn!("could not remove invalidated association: {}", err);
            }
        }
        true
    }
}

#[cfg(feature = "simple-client")]
impl Default for Consumer {
    fn default() -> Self {
        Self::new()
    }
}

/// Undo the `openid.` → `openid_` key rewrite some form parsers apply. The
/// rewrite is limited to that prefix to avoid colliding with unrelated
/// keys.
fn canonicalize_query(query: &HashMap<String, String>) -> HashMap<String, String> {
    query
        .iter()
        .map(|(key, value)| {
            let key = match key.strip_prefix("openid_") {
                Some(rest) => format!("openid.{}", rest),
                None => key.clone(),
            };
            (key, value.clone())
        })
        .collect()
}
