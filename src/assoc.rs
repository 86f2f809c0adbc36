//! Associations: MAC secrets negotiated with a provider, and the associate
//! exchange that establishes them.

use std::collections::HashMap;

use ring::hmac;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::dh::{self, DiffieHellman};
use crate::fetch::Fetcher;
use crate::kvform;
use crate::misc::{b64, unix_now};

/// A negotiated MAC secret for one provider endpoint.
///
/// Associations are persisted by the store, keyed by the provider endpoint
/// URL, and replaced opportunistically before they expire. The only
/// `assoc_type` this crate negotiates is `HMAC-SHA1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    /// Opaque handle assigned by the provider, cited back in callbacks.
    pub handle: String,
    /// The raw shared MAC secret.
    pub secret: Vec<u8>,
    pub assoc_type: String,
    /// Absolute issue time, seconds since the Unix epoch.
    pub issued_at: u64,
    /// Validity in seconds, counted from `issued_at`.
    pub lifetime: u64,
}

impl Association {
    /// Seconds of validity left at `now`.
    pub fn expires_in(&self, now: u64) -> u64 {
        (self.issued_at + self.lifetime).saturating_sub(now)
    }

    /// Whether the association may still be used at `now`.
    pub fn is_valid(&self, now: u64) -> bool {
        self.expires_in(now) > 0
    }

    /// Sign the named query fields with this association's secret.
    ///
    /// The base string is KV-form over the fields in the order given, each
    /// value read from `openid.<name>` in `query` (absent fields sign as
    /// empty). Returns the base64 HMAC-SHA1 tag, the value carried in
    /// `openid.sig`.
    pub fn sign(&self, signed: &[&str], query: &HashMap<String, String>) -> String {
        let pairs: Vec<(&str, &str)> = signed
            .iter()
            .map(|name| {
                let value = query
                    .get(&format!("openid.{}", name))
                    .map(String::as_str)
                    .unwrap_or("");
                (*name, value)
            })
            .collect();
        let base = kvform::join(pairs);
        let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &self.secret);
        b64::encode(hmac::sign(&key, base.as_bytes()).as_ref())
    }
}

/// Run one associate exchange against `server_url`.
///
/// Any failure — transport, a provider error response, a malformed or
/// unsupported response — is logged and collapses to `None`; the caller
/// then simply proceeds without an association.
pub(crate) async fn negotiate(
    fetcher: &dyn Fetcher,
    server_url: &str,
    dh: DiffieHellman,
) -> Option<Association> {
    let url = match Url::parse(server_url) {
        Ok(url) => url,
        Err(err) => {
            log::warn!("cannot associate with {:?}: {}", server_url, err);
            return None;
        }
    };

    let mut form = url::form_urlencoded::Serializer::new(String::new());
    form.append_pair("openid.mode", "associate")
        .append_pair("openid.assoc_type", "HMAC-SHA1")
        .append_pair("openid.session_type", "DH-SHA1")
        .append_pair("openid.dh_consumer_public", &dh::long_to_base64(dh.public()));
    if !dh.is_default() {
        form.append_pair("openid.dh_modulus", &dh::long_to_base64(dh.modulus()))
            .append_pair("openid.dh_gen", &dh::long_to_base64(dh.generator()));
    }
    let body = form.finish();

    let response = match fetcher.post(url, body).await {
        Some(response) => response,
        None => {
            log::warn!("associate request to {} failed", server_url);
            return None;
        }
    };
    let results = kvform::parse(&String::from_utf8_lossy(&response.body));

    if response.status == 400 {
        // A structured provider error.
        log::warn!(
            "provider {} rejected association: {}",
            server_url,
            results.get("error").map(String::as_str).unwrap_or("(no error given)")
        );
        return None;
    }
    if response.status != 200 {
        log::warn!(
            "associate request to {} returned status {}",
            server_url,
            response.status
        );
        return None;
    }

    let (assoc_type, handle, server_public, enc_mac_key) = match (
        results.get("assoc_type"),
        results.get("assoc_handle"),
        results.get("dh_server_public"),
        results.get("enc_mac_key"),
    ) {
        (Some(assoc_type), Some(handle), Some(server_public), Some(enc_mac_key)) => {
            (assoc_type, handle, server_public, enc_mac_key)
        }
        _ => {
            log::warn!("associate response from {} is missing required fields", server_url);
            return None;
        }
    };

    if assoc_type != "HMAC-SHA1" {
        log::warn!("unsupported assoc_type {:?} from {}", assoc_type, server_url);
        return None;
    }

    let secret = match results.get("session_type").map(String::as_str) {
        // Without a session type the MAC key travels in the clear.
        None => match results.get("mac_key").map(|key| b64::decode(key)) {
            Some(Ok(secret)) => secret,
            _ => {
                log::warn!("unusable plain mac_key from {}", server_url);
                return None;
            }
        },
        Some("DH-SHA1") => {
            let server_public = match dh::long_from_base64(server_public) {
                Ok(server_public) => server_public,
                Err(err) => {
                    log::warn!("bad dh_server_public from {}: {}", server_url, err);
                    return None;
                }
            };
            let enc_mac_key = match b64::decode(enc_mac_key) {
                Ok(enc_mac_key) => enc_mac_key,
                Err(err) => {
                    log::warn!("bad enc_mac_key from {}: {}", server_url, err);
                    return None;
                }
            };
            match dh.xor_secret(&server_public, &enc_mac_key) {
                Some(secret) => secret,
                None => {
                    log::warn!("enc_mac_key from {} has the wrong length", server_url);
                    return None;
                }
            }
        }
        Some(other) => {
            log::warn!("unsupported session_type {:?} from {}", other, server_url);
            return None;
        }
    };

    let lifetime = results
        .get("expires_in")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);

    Some(Association {
        handle: handle.clone(),
        secret,
        assoc_type: assoc_type.clone(),
        issued_at: unix_now(),
        lifetime,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use ring::rand::SystemRandom;

    use super::*;
    use crate::fetch::FetchResponse;
    use crate::misc::DynFut;

    /// Answers every POST with one canned response and records the bodies.
    struct CannedFetcher {
        status: u16,
        body: &'static str,
        posts: Mutex<Vec<String>>,
    }

    impl CannedFetcher {
        fn new(status: u16, body: &'static str) -> Self {
            CannedFetcher {
                status,
                body,
                posts: Mutex::new(Vec::new()),
            }
        }
    }

    impl Fetcher for CannedFetcher {
        fn get(&self, _url: Url) -> DynFut<Option<FetchResponse>> {
            Box::pin(async { None })
        }

        fn post(&self, url: Url, body: String) -> DynFut<Option<FetchResponse>> {
            self.posts.lock().unwrap().push(body);
            let response = FetchResponse {
                status: self.status,
                final_url: url,
                body: self.body.into(),
            };
            Box::pin(async move { Some(response) })
        }
    }

    fn dh() -> DiffieHellman {
        DiffieHellman::with_defaults(&SystemRandom::new())
    }

    #[tokio::test]
    async fn default_group_omits_modulus_and_generator() {
        let fetcher = CannedFetcher::new(500, "");
        negotiate(&fetcher, "http://idp.example/op", dh()).await;

        let posts = fetcher.posts.lock().unwrap();
        let body = &posts[0];
        assert!(body.contains("openid.mode=associate"));
        assert!(body.contains("openid.assoc_type=HMAC-SHA1"));
        assert!(body.contains("openid.session_type=DH-SHA1"));
        assert!(body.contains("openid.dh_consumer_public="));
        assert!(!body.contains("openid.dh_modulus"));
        assert!(!body.contains("openid.dh_gen"));
    }

    #[tokio::test]
    async fn custom_group_is_transmitted() {
        use num_bigint::BigUint;

        let fetcher = CannedFetcher::new(500, "");
        let custom = DiffieHellman::new(
            BigUint::from(0xffffffffffc5u64),
            BigUint::from(5u32),
            &SystemRandom::new(),
        );
        negotiate(&fetcher, "http://idp.example/op", custom).await;

        let posts = fetcher.posts.lock().unwrap();
        assert!(posts[0].contains("openid.dh_modulus="));
        assert!(posts[0].contains("openid.dh_gen="));
    }

    #[tokio::test]
    async fn provider_error_collapses_to_none() {
        let fetcher = CannedFetcher::new(400, "error:association rejected\n");
        assert!(negotiate(&fetcher, "http://idp.example/op", dh()).await.is_none());
    }

    #[tokio::test]
    async fn missing_required_fields_collapse_to_none() {
        let fetcher = CannedFetcher::new(200, "assoc_type:HMAC-SHA1\nassoc_handle:h\n");
        assert!(negotiate(&fetcher, "http://idp.example/op", dh()).await.is_none());
    }

    #[tokio::test]
    async fn unsupported_types_collapse_to_none() {
        let body = "assoc_type:HMAC-SHA256\nassoc_handle:h\ndh_server_public:AQ==\nenc_mac_key:AQ==\n";
        let fetcher = CannedFetcher::new(200, body);
        assert!(negotiate(&fetcher, "http://idp.example/op", dh()).await.is_none());

        let body =
            "assoc_type:HMAC-SHA1\nassoc_handle:h\ndh_server_public:AQ==\nenc_mac_key:AQ==\nsession_type:DH-SHA256\n";
        let fetcher = CannedFetcher::new(200, body);
        assert!(negotiate(&fetcher, "http://idp.example/op", dh()).await.is_none());
    }

    #[tokio::test]
    async fn plain_session_uses_mac_key_directly() {
        let body = "assoc_type:HMAC-SHA1\nassoc_handle:{hmac}{h1}\ndh_server_public:AQ==\n\
                    enc_mac_key:AQ==\nmac_key:c2VjcmV0\nexpires_in:600\n";
        let fetcher = CannedFetcher::new(200, body);
        let assoc = negotiate(&fetcher, "http://idp.example/op", dh()).await.unwrap();
        assert_eq!(assoc.handle, "{hmac}{h1}");
        assert_eq!(assoc.secret, b"secret");
        assert_eq!(assoc.lifetime, 600);
        assert!(assoc.is_valid(unix_now()));
    }

    #[test]
    fn sign_uses_listed_order_and_empty_for_absent() {
        let assoc = Association {
            handle: "h".to_owned(),
            secret: b"association secret!!".to_vec(),
            assoc_type: "HMAC-SHA1".to_owned(),
            issued_at: 0,
            lifetime: 600,
        };

        let mut query = HashMap::new();
        query.insert("openid.mode".to_owned(), "id_res".to_owned());
        query.insert("openid.identity".to_owned(), "http://a.example/".to_owned());

        let sig = assoc.sign(&["mode", "identity"], &query);
        assert_ne!(sig, assoc.sign(&["identity", "mode"], &query));

        // An absent field signs as empty.
        let mut with_empty = query.clone();
        with_empty.insert("openid.return_to".to_owned(), String::new());
        assert_eq!(
            assoc.sign(&["mode", "identity", "return_to"], &query),
            assoc.sign(&["mode", "identity", "return_to"], &with_empty)
        );

        // Flipping any signed field flips the signature.
        let mut tampered = query.clone();
        tampered.insert("openid.identity".to_owned(), "http://eve.example/".to_owned());
        assert_ne!(sig, assoc.sign(&["mode", "identity"], &tampered));
    }

    #[test]
    fn expiry_is_counted_from_issue_time() {
        let assoc = Association {
            handle: "h".to_owned(),
            secret: vec![0; 20],
            assoc_type: "HMAC-SHA1".to_owned(),
            issued_at: 1000,
            lifetime: 600,
        };
        assert_eq!(assoc.expires_in(1000), 600);
        assert_eq!(assoc.expires_in(1599), 1);
        assert!(assoc.is_valid(1599));
        assert_eq!(assoc.expires_in(1600), 0);
        assert!(!assoc.is_valid(1600));
    }
}
