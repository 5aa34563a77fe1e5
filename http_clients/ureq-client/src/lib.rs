use anyhow::Result;
use async_trait::async_trait;
use callcore::net::{HttpClient, HttpRequest, HttpResponse};
use std::collections::HashMap;
use std::time::Duration;
use ureq::{Agent, RequestBuilder};

/// HTTP client implementation using `ureq` for synchronous HTTP requests.
/// Since `ureq` is blocking, all requests are wrapped in `tokio::task::spawn_blocking`.
///
/// Non-2xx statuses are returned as responses, not errors, so callers can read
/// the server's error body.
#[derive(Debug, Clone)]
pub struct UreqHttpClient {
    agent: Agent,
}

impl UreqHttpClient {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Caps every request, including connect and body read, at `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Some(timeout))
    }

    fn build(timeout: Option<Duration>) -> Self {
        let config = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(timeout)
            .build();
        Self {
            agent: config.into(),
        }
    }
}

impl Default for UreqHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for UreqHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || execute_blocking(&agent, request)).await?
    }
}

fn execute_blocking(agent: &Agent, request: HttpRequest) -> Result<HttpResponse> {
    let HttpRequest {
        url,
        method,
        headers,
        body,
    } = request;

    let mut response = match (method.as_str(), body) {
        ("GET", _) => with_headers(agent.get(&url), &headers).call()?,
        ("POST", Some(body)) => with_headers(agent.post(&url), &headers).send(&body[..])?,
        ("POST", None) => with_headers(agent.post(&url), &headers).send_empty()?,
        (other, _) => anyhow::bail!("Unsupported HTTP method: {other}"),
    };

    Ok(HttpResponse {
        status_code: response.status().as_u16(),
        body: response.body_mut().read_to_vec()?,
    })
}

fn with_headers<B>(request: RequestBuilder<B>, headers: &HashMap<String, String>) -> RequestBuilder<B> {
    headers
        .iter()
        .fold(request, |request, (key, value)| request.header(key, value))
}
