//! Outbound calls to the backend chat endpoint.
//!
//! The backend only accepts requests that look like they came from its own web
//! playground, so every call carries a fixed set of browser headers plus the
//! credential's cookie.

use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{info, warn};

use crate::credentials::Credential;
use crate::debug_log::{DebugSession, UPSTREAM_REQUEST_FILE};
use crate::error::GatewayError;
use crate::models::upstream::UpstreamRequest;

const STATIC_HEADERS: &[(&str, &str)] = &[
    ("accept", "*/*"),
    ("accept-language", "zh-CN,zh;q=0.9"),
    ("cache-control", "no-cache"),
    ("content-type", "application/json"),
    ("origin", "https://www.morphllm.com"),
    ("pragma", "no-cache"),
    ("priority", "u=1, i"),
    (
        "referer",
        "https://www.morphllm.com/playground/na/warpgrep?repo=tiangolo%2Ffastapi",
    ),
    (
        "sec-ch-ua",
        "\"Not(A:Brand\";v=\"8\", \"Chromium\";v=\"144\", \"Google Chrome\";v=\"144\"",
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"macOS\""),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-origin"),
    (
        "user-agent",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/144.0.0.0 Safari/537.36",
    ),
];

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    url: String,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    /// Static browser headers plus `cookie: <api_key>`.
    pub fn headers_for(&self, cred: &Credential) -> Result<HeaderMap, GatewayError> {
        let mut headers = HeaderMap::new();
        for (name, value) in STATIC_HEADERS {
            headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        let cookie = HeaderValue::from_str(cred.api_key.trim()).map_err(|_| {
            GatewayError::UpstreamUnavailable(format!(
                "credential {} has a cookie that is not a valid header value",
                cred.id
            ))
        })?;
        headers.insert(http::header::COOKIE, cookie);
        Ok(headers)
    }

    /// Send and require a 2xx status.
    pub async fn send(
        &self,
        body: &UpstreamRequest,
        cred: &Credential,
        debug: Option<&DebugSession>,
    ) -> Result<reqwest::Response, GatewayError> {
        let resp = self.send_raw(body, cred, None, debug).await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        warn!(
            "Upstream rejected request with credential {}: {} {}",
            cred.id,
            status.as_u16(),
            text.chars().take(200).collect::<String>()
        );
        Err(GatewayError::UpstreamRejected {
            status: status.as_u16(),
            body: text,
        })
    }

    /// Send without interpreting the status.
    pub async fn send_raw(
        &self,
        body: &UpstreamRequest,
        cred: &Credential,
        timeout: Option<Duration>,
        debug: Option<&DebugSession>,
    ) -> Result<reqwest::Response, GatewayError> {
        let headers = self.headers_for(cred)?;
        let payload = serde_json::to_vec(body)
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("encode request: {}", e)))?;

        if let Some(d) = debug {
            d.write_json(UPSTREAM_REQUEST_FILE, body).await;
            d.write_upstream_request(&self.url, &headers, &payload).await;
        }

        info!(
            "POST {} model={} credential={}",
            self.url, body.model, cred.id
        );
        let mut req = self.http.post(&self.url).headers(headers).body(payload);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        req.send()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::NewCredential;

    fn cred(cookie: &str) -> Credential {
        Credential::from_new(
            3,
            1,
            NewCredential {
                name: "c".into(),
                api_key: cookie.into(),
                session_key: None,
                priority: None,
            },
        )
    }

    #[test]
    fn headers_include_browser_set_and_cookie() {
        let client = UpstreamClient::new(reqwest::Client::new(), "http://localhost/x");
        let headers = client.headers_for(&cred("sid=abc; other=1")).unwrap();
        assert_eq!(headers.get("cookie").unwrap(), "sid=abc; other=1");
        assert_eq!(headers.get("origin").unwrap(), "https://www.morphllm.com");
        assert_eq!(headers.get("sec-fetch-mode").unwrap(), "cors");
        assert_eq!(headers.len(), STATIC_HEADERS.len() + 1);
    }

    #[test]
    fn rejects_cookie_with_control_characters() {
        let client = UpstreamClient::new(reqwest::Client::new(), "http://localhost/x");
        assert!(matches!(
            client.headers_for(&cred("bad\nvalue")),
            Err(GatewayError::UpstreamUnavailable(_))
        ));
    }
}
