use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::borrow::Cow;
use std::time::Duration;
use tracing::{debug, warn};

use super::request::build_headers;
use crate::config::UpstreamConfig;
use crate::error::{Error, Result};

type RequestBody = BoxBody<Bytes, std::convert::Infallible>;

/// HTTP client for the Copilot chat, responses, embeddings and models endpoints.
///
/// The timeout bounds the wait for response headers only; streamed bodies run
/// until the upstream closes them or the caller drops the response.
pub struct CopilotClient {
    client: Client<
        hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
        RequestBody,
    >,
    config: UpstreamConfig,
    api_timeout: Duration,
}

impl CopilotClient {
    pub fn new(config: &UpstreamConfig) -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            client,
            config: config.clone(),
            api_timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Base URL for a request, using the per-request account type when given.
    pub fn base_url(&self, account_type: Option<&str>) -> String {
        self.config
            .api_base_for(account_type.unwrap_or(&self.config.account_type))
    }

    pub async fn chat_completions(
        &self,
        base: &str,
        token: &str,
        body: Bytes,
        streaming: bool,
    ) -> Result<Response<Incoming>> {
        self.post_raw(&format!("{}/chat/completions", base), token, body, streaming)
            .await
    }

    pub async fn responses(
        &self,
        base: &str,
        token: &str,
        body: Bytes,
        streaming: bool,
    ) -> Result<Response<Incoming>> {
        self.post_raw(&format!("{}/responses", base), token, body, streaming)
            .await
    }

    pub async fn embeddings(&self, base: &str, token: &str, body: Bytes) -> Result<Bytes> {
        let response = self
            .post_raw(&format!("{}/embeddings", base), token, body, false)
            .await?;
        read_body(response).await
    }

    pub async fn models(&self, base: &str, token: &str) -> Result<Bytes> {
        let url = format!("{}/models", base);
        let headers = build_headers(token, &self.config.vscode_version, false);
        let body = Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed();
        let response = self.send(Method::GET, &url, &headers, body).await?;
        read_body(response).await
    }

    /// POST and return the response once headers arrive; non-2xx becomes
    /// [`Error::Upstream`] with the collected body.
    pub async fn post_raw(
        &self,
        url: &str,
        token: &str,
        body: Bytes,
        streaming: bool,
    ) -> Result<Response<Incoming>> {
        let headers = build_headers(token, &self.config.vscode_version, streaming);
        let body = Full::new(body).map_err(|never| match never {}).boxed();
        self.send(Method::POST, url, &headers, body).await
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &[(Cow<'static, str>, Cow<'static, str>)],
        body: RequestBody,
    ) -> Result<Response<Incoming>> {
        let mut req = Request::builder().method(method).uri(url);

        for (name, value) in headers {
            req = req.header(name.as_ref(), value.as_ref());
        }

        let req = req.body(body).map_err(|e| Error::Http(e.to_string()))?;

        debug!(url = %url, "Sending upstream request");

        let response = tokio::time::timeout(self.api_timeout, self.client.request(req))
            .await
            .map_err(|_| Error::Timeout(self.api_timeout))?
            .map_err(|e| Error::Http(e.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map(|b| b.to_bytes())
            .unwrap_or_default();
        let body = String::from_utf8_lossy(&body).into_owned();
        let preview: String = body.chars().take(500).collect();
        warn!(status, url = %url, body = %preview, "Upstream returned error");

        Err(Error::Upstream { status, body })
    }
}

/// Collect a whole upstream body.
pub async fn read_body(response: Response<Incoming>) -> Result<Bytes> {
    response
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes())
        .map_err(|e| Error::Http(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_per_account_type() {
        let client = CopilotClient::new(&UpstreamConfig::default());
        assert_eq!(client.base_url(None), "https://api.githubcopilot.com");
        assert_eq!(
            client.base_url(Some("business")),
            "https://api.business.githubcopilot.com"
        );

        let pinned = CopilotClient::new(&UpstreamConfig {
            api_base: "http://127.0.0.1:9999/".to_string(),
            ..UpstreamConfig::default()
        });
        assert_eq!(pinned.base_url(Some("enterprise")), "http://127.0.0.1:9999");
    }
}
