use crate::config::ProxyConfig;
use crate::error::ChatError;
use axum::http::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// Dial timeout for clients that connect without a proxy.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);
/// Whole-call timeout; long generations must fit inside it.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

#[derive(Debug, Clone)]
pub enum UpstreamAuth {
    Bearer {
        key: String,
        organization: Option<String>,
    },
    ApiKeyHeader(String),
}

/// Builds the HTTP client for one pool entry.
pub fn build_http_client(proxy: Option<&ProxyConfig>) -> Result<reqwest::Client, ChatError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("chatgate/", env!("CARGO_PKG_VERSION")))
        .timeout(CALL_TIMEOUT);

    match proxy.and_then(resolve_proxy_url) {
        Some(url) => {
            let proxy = reqwest::Proxy::all(&url)
                .map_err(|err| ChatError::Config(format!("invalid proxy {url}: {err}")))?;
            builder = builder.proxy(proxy);
        }
        None => {
            builder = builder.connect_timeout(CONNECT_TIMEOUT);
        }
    }

    builder
        .build()
        .map_err(|err| ChatError::Config(format!("http client init failed: {err}")))
}

fn resolve_proxy_url(conf: &ProxyConfig) -> Option<String> {
    if let Some(url) = conf.url.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        return Some(url.to_string());
    }
    conf.socks5
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|addr| {
            if addr.contains("://") {
                addr.to_string()
            } else {
                format!("socks5://{addr}")
            }
        })
}

pub async fn post_json_raw(
    client: &reqwest::Client,
    url: &str,
    auth: &UpstreamAuth,
    body: &Value,
) -> Result<reqwest::Response, UpstreamCallError> {
    let req = apply_auth(client.post(url).json(body), auth);
    let resp = req
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let code = extract_error_code(&text);
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {}: {}", status, text),
        )
        .with_code(code));
    }
    Ok(resp)
}

pub async fn post_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    auth: &UpstreamAuth,
    body: &Value,
) -> Result<T, UpstreamCallError> {
    let resp = post_json_raw(client, url, auth, body).await?;
    let status = resp.status();
    let text = resp.text().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
    })?;
    serde_json::from_str(&text).map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Http, Some(status), err.to_string())
    })
}

fn apply_auth(req: reqwest::RequestBuilder, auth: &UpstreamAuth) -> reqwest::RequestBuilder {
    match auth {
        UpstreamAuth::Bearer { key, organization } => {
            let req = req.bearer_auth(key);
            match organization.as_deref().filter(|o| !o.is_empty()) {
                Some(org) => req.header("OpenAI-Organization", org),
                None => req,
            }
        }
        UpstreamAuth::ApiKeyHeader(key) => req.header("api-key", key),
    }
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
