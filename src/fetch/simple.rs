use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use hyper::{body::HttpBody, client::HttpConnector, header, Body, Method, Request};
use hyper_tls::HttpsConnector;
use url::Url;

use crate::fetch::{FetchResponse, Fetcher};
use crate::misc::DynFut;

type Client = hyper::Client<HttpsConnector<HttpConnector>>;

/// A `Fetcher` backed by a hyper client with `native-tls` for secure
/// connections.
///
/// GET requests follow up to ten redirects and report the URL that finally
/// answered. POST requests do not follow redirects. Every request runs
/// under a timeout, 30 seconds by default.
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
    max_redirects: usize,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a fetcher with a custom per-request timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = hyper::Client::builder().build(HttpsConnector::new());
        HttpFetcher {
            client,
            timeout,
            max_redirects: 10,
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for HttpFetcher {
    fn get(&self, url: Url) -> DynFut<Option<FetchResponse>> {
        let client = self.client.clone();
        let timeout = self.timeout;
        let max_redirects = self.max_redirects;
        Box::pin(async move {
            tokio::time::timeout(timeout, follow_get(client, url, max_redirects))
                .await
                .ok()
                .flatten()
        })
    }

    fn post(&self, url: Url, body: String) -> DynFut<Option<FetchResponse>> {
        let client = self.client.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            tokio::time::timeout(timeout, send_post(client, url, body))
                .await
                .ok()
                .flatten()
        })
    }
}

async fn follow_get(client: Client, mut url: Url, max_redirects: usize) -> Option<FetchResponse> {
    for _ in 0..=max_redirects {
        let request = Request::builder()
            .uri(url.as_str())
            .body(Body::empty())
            .ok()?;
        let response = client.request(request).await.ok()?;
        let status = response.status();

        if status.is_redirection() {
            let location = response.headers().get(header::LOCATION)?.to_str().ok()?;
            url = url.join(location).ok()?;
            continue;
        }

        let body = read_body(response).await?;
        return Some(FetchResponse {
            status: status.as_u16(),
            final_url: url,
            body,
        });
    }
    None
}

async fn send_post(client: Client, url: Url, body: String) -> Option<FetchResponse> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(url.as_str())
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .ok()?;
    let response = client.request(request).await.ok()?;
    let status = response.status().as_u16();
    let body = read_body(response).await?;
    Some(FetchResponse {
        status,
        final_url: url,
        body,
    })
}

async fn read_body(mut response: hyper::Response<Body>) -> Option<Bytes> {
    let mut data = BytesMut::new();
    let body = response.body_mut();
    while let Some(chunk) = body.data().await {
        data.put(chunk.ok()?);
    }
    Some(data.freeze())
}
