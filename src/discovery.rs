//! Identity URL normalization and provider discovery.
//!
//! Discovery fetches the claimed identity URL and reads the provider
//! endpoint (and optional delegated identity) out of `<link>` tags in the
//! page head.

use scraper::{Html, Selector};
use thiserror::Error;
use url::Url;

use crate::fetch::Fetcher;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The identity page could not be fetched; carries the HTTP status when
    /// one was received.
    #[error("could not fetch the claimed identity URL")]
    HttpFailure(Option<u16>),
    /// The page fetched fine but does not advertise an OpenID server.
    #[error("the claimed identity URL does not declare an OpenID server")]
    NoServerLink,
}

/// The identity endpoints discovered from a claimed identity URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    /// The claimed identity: the normalized post-redirect URL.
    pub consumer_id: String,
    /// The identity the provider will assert: the delegate when one is
    /// declared, else `consumer_id`.
    pub server_id: String,
    /// The provider endpoint.
    pub server_url: String,
}

/// Normalize a user-entered identity URL: default the scheme to `http`,
/// lowercase the host, elide default ports, coerce an empty path to `/`.
pub fn normalize(input: &str) -> Result<Url, url::ParseError> {
    let input = input.trim();
    if input.contains("://") {
        Url::parse(input)
    } else {
        Url::parse(&format!("http://{}", input))
    }
}

struct LinkRels {
    server: Option<String>,
    delegate: Option<String>,
}

/// Pull the first `openid.server` and `openid.delegate` link targets out of
/// the page head. The HTML parser tolerates unquoted and mixed-case markup;
/// `rel` is treated as a whitespace-separated, case-insensitive list.
fn extract_links(body: &str) -> LinkRels {
    let document = Html::parse_document(body);
    let links = Selector::parse("head link").expect("static selector is valid");

    let mut rels = LinkRels {
        server: None,
        delegate: None,
    };
    for element in document.select(&links) {
        let rel = match element.value().attr("rel") {
            Some(rel) => rel,
            None => continue,
        };
        let href = match element.value().attr("href") {
            Some(href) => href,
            None => continue,
        };
        let mut names = rel.split_ascii_whitespace();
        if rels.server.is_none() && names.clone().any(|n| n.eq_ignore_ascii_case("openid.server")) {
            rels.server = Some(href.to_owned());
        }
        if rels.delegate.is_none() && names.any(|n| n.eq_ignore_ascii_case("openid.delegate")) {
            rels.delegate = Some(href.to_owned());
        }
    }
    rels
}

/// Fetch `user_url` (following redirects) and extract the provider
/// endpoints from it.
pub async fn discover(fetcher: &dyn Fetcher, user_url: &str) -> Result<Discovered, DiscoveryError> {
    let url = normalize(user_url).map_err(|_| DiscoveryError::HttpFailure(None))?;

    let response = fetcher
        .get(url)
        .await
        .ok_or(DiscoveryError::HttpFailure(None))?;
    if response.status != 200 {
        return Err(DiscoveryError::HttpFailure(Some(response.status)));
    }

    let rels = extract_links(&String::from_utf8_lossy(&response.body));
    let server = rels.server.ok_or(DiscoveryError::NoServerLink)?;
    let server_url = normalize(&server).map_err(|_| DiscoveryError::NoServerLink)?;

    // The claimed identity is whatever URL finally answered.
    let consumer_id = response.final_url.to_string();
    let server_id = match rels.delegate {
        Some(delegate) => normalize(&delegate)
            .map_err(|_| DiscoveryError::NoServerLink)?
            .to_string(),
        None => consumer_id.clone(),
    };

    Ok(Discovered {
        consumer_id,
        server_id,
        server_url: server_url.to_string(),
    })
}
