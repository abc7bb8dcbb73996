pub mod device;
pub mod manager;
pub mod token;
pub mod users;

pub use manager::TokenManager;
pub use token::{GithubExchanger, TokenExchanger};
pub use users::UserRegistry;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

/// Status and fully collected body of a small JSON call.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Client for the small request/response calls around the upstream: token
/// exchange, device flow, usage lookup and the Cloudflare KV API.
pub struct HttpClient {
    client: Client<
        hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
        Full<Bytes>,
    >,
}

impl HttpClient {
    pub fn new() -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self { client }
    }

    /// Send a request and collect the body regardless of status.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: Option<Bytes>,
    ) -> Result<HttpResponse, String> {
        let mut req = Request::builder().method(method).uri(url);

        for (name, value) in headers {
            req = req.header(*name, *value);
        }

        let req = req
            .body(Full::new(body.unwrap_or_default()))
            .map_err(|e| e.to_string())?;

        let response = self.client.request(req).await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| e.to_string())?;

        Ok(HttpResponse {
            status,
            body: body.to_bytes(),
        })
    }

    /// GET that treats any non-2xx status as an error.
    pub async fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<Vec<u8>, String> {
        let response = self.send(Method::GET, url, headers, None).await?;
        if !response.is_success() {
            return Err(format!("HTTP {}: {}", response.status, response.text()));
        }
        Ok(response.body.to_vec())
    }

    /// JSON POST that treats any non-2xx status as an error.
    pub async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<Vec<u8>, String> {
        let mut all_headers = Vec::with_capacity(headers.len() + 2);
        all_headers.push(("Content-Type", "application/json"));
        all_headers.push(("Accept", "application/json"));
        all_headers.extend_from_slice(headers);

        let response = self
            .send(
                Method::POST,
                url,
                &all_headers,
                Some(Bytes::copy_from_slice(body)),
            )
            .await?;
        if !response.is_success() {
            return Err(format!("HTTP {}: {}", response.status, response.text()));
        }
        Ok(response.body.to_vec())
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}
