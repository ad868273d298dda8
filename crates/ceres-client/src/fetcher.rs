use std::net::IpAddr;
use std::time::Duration;

use ceres_core::error::AppError;
use ceres_core::traits::Fetcher;
use reqwest::{Client, RequestBuilder};
use url::Url;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; Ceres/0.1; +price-monitor)";

/// HTTP fetcher for reference-index and wholesale sources.
///
/// SSRF protection is **enabled** by default: requests to private or
/// reserved IP ranges are refused. [`allow_private_urls`](Self::allow_private_urls)
/// turns it off for sources hosted on the operator's own network.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout_secs: u64,
    ssrf_protection: bool,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::NetworkError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
            ssrf_protection: true,
        })
    }

    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> Result<String, AppError> {
        if self.ssrf_protection {
            validate_url(url).await?;
        }

        let response = request.send().await.map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpError {
                status: status.as_u16(),
                message: format!("{status} for {url}"),
            });
        }

        response.text().await.map_err(|e| {
            AppError::NetworkError(format!("Failed to read response body from {url}: {e}"))
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else if let Some(status) = e.status() {
            AppError::HttpError {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            AppError::NetworkError(e.to_string())
        }
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        tracing::debug!(%url, "GET");
        self.send(url, self.client.get(url)).await
    }

    async fn submit_form(&self, url: &str, form: &[(String, String)]) -> Result<String, AppError> {
        tracing::debug!(%url, fields = form.len(), "POST form");
        self.send(url, self.client.post(url).form(form)).await
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

fn blocked(message: String) -> AppError {
    AppError::HttpError {
        status: 403,
        message,
    }
}

/// Only http(s) URLs whose host resolves to public addresses pass.
async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed =
        Url::parse(url).map_err(|e| AppError::InvalidInput(format!("Invalid URL '{url}': {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::InvalidInput(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::InvalidInput(format!("URL '{url}' has no host")))?;

    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(blocked(format!("SSRF blocked: {host} is a private address")));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    if let Some(addr) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        return Err(blocked(format!(
            "SSRF blocked: {host} resolves to private address {}",
            addr.ip()
        )));
    }

    Ok(())
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                // 100.64.0.0/10 (CGN)
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                // fc00::/7
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}
