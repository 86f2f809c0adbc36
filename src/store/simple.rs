use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use ring::rand::{SecureRandom, SystemRandom};

use crate::assoc::Association;
use crate::misc::DynFutRes;
use crate::Store;

/// A `Store` implementation that keeps everything in memory.
///
/// This is the default `Store` implementation if a `Consumer` is built
/// without explicitly configuring one. The auth key is drawn fresh at
/// construction, so tokens do not survive the store.
///
/// This store will only function correctly if the application is a single
/// process. When running multiple workers, the different processes will not
/// be able to recognize eachothers' logins, and a shared backend must be
/// implemented instead.
///
/// Nonces and associations are kept until consumed or replaced; eviction of
/// abandoned entries is left to the embedding application.
pub struct MemoryStore {
    auth_key: Vec<u8>,
    dumb: bool,
    associations: Mutex<HashMap<String, Association>>,
    nonces: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A store that keeps no associations, forcing every callback through
    /// the provider's `check_authentication` endpoint ("dumb mode").
    pub fn new_dumb() -> Self {
        Self::build(true)
    }

    fn build(dumb: bool) -> Self {
        // Dummy RNG call to flush out any latency from lazy init.
        let rng = SystemRandom::new();
        let mut auth_key = vec![0; 20];
        rng.fill(&mut auth_key)
            .expect("secure random number generator failed");

        MemoryStore {
            auth_key,
            dumb,
            associations: Default::default(),
            nonces: Default::default(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn get_auth_key(&self) -> DynFutRes<Vec<u8>> {
        let key = self.auth_key.clone();
        Box::pin(async move { Ok(key) })
    }

    fn is_dumb(&self) -> bool {
        self.dumb
    }

    fn store_association(&self, server_url: String, assoc: Association) -> DynFutRes<()> {
        self.associations.lock().unwrap().insert(server_url, assoc);
        Box::pin(async { Ok(()) })
    }

    fn get_association(&self, server_url: String) -> DynFutRes<Option<Association>> {
        let assoc = self.associations.lock().unwrap().get(&server_url).cloned();
        Box::pin(async move { Ok(assoc) })
    }

    fn remove_association(&self, server_url: String, handle: String) -> DynFutRes<bool> {
        let mut associations = self.associations.lock().unwrap();
        let removed = match associations.get(&server_url) {
            Some(assoc) if assoc.handle == handle => {
                associations.remove(&server_url);
                true
            }
            _ => false,
        };
        Box::pin(async move { Ok(removed) })
    }

    fn store_nonce(&self, nonce: String) -> DynFutRes<()> {
        self.nonces.lock().unwrap().insert(nonce);
        Box::pin(async { Ok(()) })
    }

    fn use_nonce(&self, nonce: String) -> DynFutRes<bool> {
        let used = self.nonces.lock().unwrap().remove(&nonce);
        Box::pin(async move { Ok(used) })
    }
}
